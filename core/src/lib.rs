pub mod device;
pub mod error;

pub use device::{BlockDevice, FileDevice, MediaStatus, MemDevice};
pub use error::FsError;
