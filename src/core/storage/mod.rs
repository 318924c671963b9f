//! Fixed capacity containers, nothing here grows after construction.

mod handoff;
mod pool;
mod ring;

pub use self::handoff::Handoff;
pub use self::pool::{
    Index,
    Iter,
    List,
    Pool,
};
pub use self::ring::Ring;
