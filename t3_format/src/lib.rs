//! Byte-level pieces of the T3 saved state format: the running CRC, the
//! binary stream the persistence code reads and writes through, and the
//! framing of a saved state file.

pub mod crc;
pub mod error;
pub mod savefile;
pub mod stream;

pub use crc::Crc32;
pub use error::{Result, VmError};
pub use savefile::{
    MIN_DATA_SIZE, SAVE_SIGNATURE, SaveHeader, TIMESTAMP_LEN, Timestamp, read_header,
    restore_get_image, restore_get_image_bounded,
};
pub use stream::DataStream;
