pub mod error;
pub mod timestamp;
