#[cfg(test)]
#[macro_use]
extern crate assert_matches;
extern crate byteorder;
#[macro_use]
extern crate log;
extern crate spin;

pub mod config;
pub mod core;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// Indicates an error where an address or port is out of range.
    Address,
    /// Indicates an error where a buffer, pool, table, etc. is full or empty.
    Exhausted,
    /// Indicates an error where a packet, frame or record is malformed.
    Malformed,
    /// Indicates an error where a port is already bound.
    InUse,
    /// Indicates an error where a packet was not meant for any socket.
    Ignored,
    /// Indicates an error where the operation was not performed.
    NoOp,
    /// Indicates an error where a shared buffer is borrowed by its owner.
    Busy,
}

pub type Result<T> = std::result::Result<T, Error>;
