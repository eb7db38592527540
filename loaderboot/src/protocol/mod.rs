//! Protocol implementations.

pub mod crc;
pub mod frame;
pub mod ymodem;

// Re-export common types
pub use frame::{ACK_FAILURE, ACK_SUCCESS, CommandType, Frame, FrameCodec};
pub use ymodem::{YmodemConfig, YmodemReceiver};
