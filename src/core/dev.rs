use crate::core::repr::EthernetAddress;

/// A network card as seen by the stack.
///
/// Frames are written in place: the stack asks for the next transmit buffer,
/// writes a frame at its start and hands it back with the frame length.
/// Received frames are pushed by the card's interrupt handler into
/// `NetworkManagementTask`, the trait only covers the transmit side.
pub trait NetworkInterface {
    /// Returns the ethernet address of the card.
    fn mac(&self) -> EthernetAddress;

    /// Returns the next free transmit buffer, or None while all of them are
    /// in flight. The buffer holds at least a maximum size Ethernet frame.
    /// Until finish_write_buffer(...) is called the same buffer is returned.
    fn write_buffer(&mut self) -> Option<&mut [u8]>;

    /// Transmits the first len bytes of the current write buffer. is_ipv4
    /// marks frames carrying an IPv4 packet whose header checksum still has
    /// to be filled in by the card.
    fn finish_write_buffer(&mut self, len: usize, is_ipv4: bool);
}
