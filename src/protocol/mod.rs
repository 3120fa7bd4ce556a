//! Protocol module - Defines the OTA wire protocol spoken by the device
//!
//! Every message is either a short command terminated by a newline or a
//! firmware frame:
//! - 1 byte marker `!`
//! - 4 lowercase hex digits: payload length + header size
//! - Variable length payload (at most 4096 bytes)
//!
//! The device answers every message with a single line, `OK\r\n` on success.

mod command;
mod codec;

pub use command::*;
pub use codec::*;

/// Default TCP port the device's OTA listener accepts connections on
pub const DEFAULT_PORT: u16 = 80;

/// Maximum firmware payload carried by one frame
pub const CHUNK_SIZE: usize = 4096;

/// Frame header: marker(1) + hex length(4) = 5 bytes
pub const FRAME_HEADER_SIZE: usize = 5;

/// Marker byte that opens every command and frame
pub const COMMAND_MARKER: u8 = b'!';

/// Terminator of every command and response line
pub const LINE_TERMINATOR: u8 = b'\n';

/// The only response accepted as an acknowledgement
pub const ACK: &[u8] = b"OK\r\n";
