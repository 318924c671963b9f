//! Core, platform independent networking code.

pub mod arp_table;
pub mod check;
pub mod dev;
pub mod loopback;
pub mod reassembly;
pub mod repr;
pub mod service;
pub mod socket;
pub mod stack;
pub mod storage;
pub mod time;
