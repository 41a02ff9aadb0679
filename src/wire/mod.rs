//! Wire codec for the QCCTV protocol

pub mod command;
pub mod crc32;
pub mod discovery;
pub mod stream;

pub use command::{CommandPacket, COMMAND_LEN, FLAG_SAVE_PHOTO};
pub use crc32::crc32;
pub use stream::{StreamPacket, StreamParser};
