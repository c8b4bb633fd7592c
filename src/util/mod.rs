pub mod human;
pub mod ring_buffer;
pub mod spool;
