mod fixed_bytes;
pub use fixed_bytes::{Error, FixedBytes};
