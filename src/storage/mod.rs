//! Low-level storage primitives shared by the scrub engine.

pub mod checksum;

pub use checksum::hardware_crc32c;
