pub mod cache;
pub mod gps;
