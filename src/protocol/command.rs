//! Protocol command and response definitions
//!
//! Defines the commands the uploader sends and how device responses are
//! classified.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use super::{encode_frame, CodecError, Record, ACK, COMMAND_MARKER, LINE_TERMINATOR};

/// Command identifiers, used for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    Frame,
    End,
    Reboot,
}

impl CommandKind {
    /// The byte following the marker for single-line commands
    pub fn opcode(&self) -> Option<u8> {
        match self {
            CommandKind::Start => Some(b'['),
            CommandKind::End => Some(b']'),
            CommandKind::Reboot => Some(b'*'),
            CommandKind::Frame => None,
        }
    }

    fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            b'[' => Some(CommandKind::Start),
            b']' => Some(CommandKind::End),
            b'*' => Some(CommandKind::Reboot),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Start => "start",
            CommandKind::Frame => "frame",
            CommandKind::End => "end",
            CommandKind::Reboot => "reboot",
        };
        f.write_str(name)
    }
}

/// A message sent from the uploader to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Begin an update session (`![\n`)
    Start,
    /// One chunk of firmware, framed with a length prefix
    Frame(Bytes),
    /// Finish the update and activate the new partition (`!]\n`)
    End,
    /// Restart the device (`!*\n`)
    Reboot,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Start => CommandKind::Start,
            Command::Frame(_) => CommandKind::Frame,
            Command::End => CommandKind::End,
            Command::Reboot => CommandKind::Reboot,
        }
    }

    /// Encode the command into its wire form
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            Command::Frame(payload) => encode_frame(payload, buf),
            other => {
                // Every non-frame kind has an opcode.
                if let Some(opcode) = other.kind().opcode() {
                    buf.put_u8(COMMAND_MARKER);
                    buf.put_u8(opcode);
                    buf.put_u8(LINE_TERMINATOR);
                }
                Ok(())
            }
        }
    }

    /// Interpret a complete record the way the device does
    pub fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Frame(payload) => Some(Command::Frame(payload)),
            Record::Line(line) => {
                if line.len() < 2 || line[0] != COMMAND_MARKER {
                    return None;
                }
                match CommandKind::from_opcode(line[1])? {
                    CommandKind::Start => Some(Command::Start),
                    CommandKind::End => Some(Command::End),
                    CommandKind::Reboot => Some(Command::Reboot),
                    CommandKind::Frame => None,
                }
            }
        }
    }
}

/// Failure codes the device reports as `OTA_ERROR <n>`
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("no OTA partition found")]
    PartitionNotFound,

    #[error("new partition could not be activated")]
    PartitionNotActivated,

    #[error("OTA begin failed")]
    BeginFailed,

    #[error("flash write failed")]
    WriteFailed,

    #[error("OTA end failed")]
    EndFailed,

    #[error("unknown device error {0}")]
    Unknown(i32),
}

impl DeviceError {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => DeviceError::PartitionNotFound,
            2 => DeviceError::PartitionNotActivated,
            3 => DeviceError::BeginFailed,
            4 => DeviceError::WriteFailed,
            5 => DeviceError::EndFailed,
            other => DeviceError::Unknown(other),
        }
    }
}

/// A newline-terminated line received from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response(Bytes);

impl Response {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True only for the exact acknowledgement `OK\r\n`
    pub fn is_ack(&self) -> bool {
        self.0.as_ref() == ACK
    }

    /// Decode an `OTA_ERROR <n>` response
    pub fn device_error(&self) -> Option<DeviceError> {
        let text = std::str::from_utf8(&self.0).ok()?;
        let code = text.trim_end().strip_prefix("OTA_ERROR ")?.trim().parse().ok()?;
        Some(DeviceError::from_code(code))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.escape_ascii())
    }
}

/// The device answered a validated command with something other than `OK\r\n`
#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub command: CommandKind,
    /// 1-based frame number for rejected frames
    pub frame: Option<u64>,
    /// The literal response bytes
    pub response: Response,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame {
            Some(n) => write!(f, "frame {} rejected by device", n)?,
            None => write!(f, "{} command rejected by device", self.command)?,
        }
        write!(f, ": \"{}\"", self.response)?;
        if let Some(reason) = self.response.device_error() {
            write!(f, " ({})", reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProtocolError {}
