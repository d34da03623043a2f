//! Shared protocol constants and message layout for the treesync transport
//!
//! Control message layout (big-endian, fixed width):
//!
//! ```text
//! type:i32 | path:[u8; MAXPATH] | size:i32 | mode:u32 | [fingerprint:[u8; BLOCK_SIZE]]
//! ```
//!
//! Directory messages carry no fingerprint. A data connection sends one
//! DataTransfer header followed by exactly `size` raw bytes.

use crate::error::{Result, SyncError};
use crate::fingerprint::Fingerprint;

/// Fixed width of the path field, including the NUL terminator
pub const MAXPATH: usize = 128;

/// Fingerprint width shared by client and server
pub const BLOCK_SIZE: usize = 8;

/// Well-known TCP port shared by client and server
pub const DEFAULT_PORT: u16 = 58915;

pub const TYPE_LEN: usize = 4;
pub const SIZE_LEN: usize = 4;
pub const MODE_LEN: usize = 4;
pub const STATUS_LEN: usize = 4;

/// Length of a Directory message on the wire
pub const DIR_HEADER_LEN: usize = TYPE_LEN + MAXPATH + SIZE_LEN + MODE_LEN;

/// Length of a RegularFile / DataTransfer header on the wire
pub const FILE_HEADER_LEN: usize = DIR_HEADER_LEN + BLOCK_SIZE;

/// Message type IDs (keep numeric stable between client and server builds)
pub mod message {
    pub const REGFILE: i32 = 1;
    pub const REGDIR: i32 = 2;
    pub const TRANSFILE: i32 = 3;
}

/// Reply status IDs
pub mod status {
    pub const OK: i32 = 0;
    pub const SENDFILE: i32 = 1;
    pub const MISMATCH: i32 = 2;
    pub const ERROR: i32 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Directory,
    RegularFile,
    DataTransfer,
}

impl MessageType {
    pub fn to_wire(self) -> i32 {
        match self {
            Self::RegularFile => message::REGFILE,
            Self::Directory => message::REGDIR,
            Self::DataTransfer => message::TRANSFILE,
        }
    }

    pub fn from_wire(value: i32) -> Result<Self> {
        match value {
            message::REGFILE => Ok(Self::RegularFile),
            message::REGDIR => Ok(Self::Directory),
            message::TRANSFILE => Ok(Self::DataTransfer),
            other => Err(SyncError::Protocol(format!("unknown message type {other}"))),
        }
    }

    pub fn has_fingerprint(self) -> bool {
        !matches!(self, Self::Directory)
    }
}

/// Server reply to a control message or a completed data transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Destination already up to date (or transfer stored)
    Ok,
    /// Client must open a data connection for this file
    SendFile,
    /// Destination kind conflicts with the source kind
    Mismatch,
    Error,
}

impl Status {
    pub fn to_wire(self) -> i32 {
        match self {
            Self::Ok => status::OK,
            Self::SendFile => status::SENDFILE,
            Self::Mismatch => status::MISMATCH,
            Self::Error => status::ERROR,
        }
    }

    pub fn from_wire(value: i32) -> Result<Self> {
        match value {
            status::OK => Ok(Self::Ok),
            status::SENDFILE => Ok(Self::SendFile),
            status::MISMATCH => Ok(Self::Mismatch),
            status::ERROR => Ok(Self::Error),
            other => Err(SyncError::Protocol(format!("unknown status {other}"))),
        }
    }

    pub fn encode(self) -> [u8; STATUS_LEN] {
        self.to_wire().to_be_bytes()
    }

    pub fn decode(bytes: [u8; STATUS_LEN]) -> Result<Self> {
        Self::from_wire(i32::from_be_bytes(bytes))
    }
}

/// One unit of synchronization work sent from client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub kind: MessageType,
    /// Path relative to the server's destination root
    pub path: String,
    pub size: i32,
    pub mode: u32,
    /// Present for RegularFile and DataTransfer only
    pub fingerprint: Option<Fingerprint>,
}

impl SyncRequest {
    pub fn directory(path: impl Into<String>, size: i32, mode: u32) -> Self {
        Self {
            kind: MessageType::Directory,
            path: path.into(),
            size,
            mode,
            fingerprint: None,
        }
    }

    pub fn file(path: impl Into<String>, size: i32, mode: u32, fingerprint: Fingerprint) -> Self {
        Self {
            kind: MessageType::RegularFile,
            path: path.into(),
            size,
            mode,
            fingerprint: Some(fingerprint),
        }
    }

    /// Same header as the RegularFile message, re-typed for a data connection
    pub fn to_transfer(&self) -> Self {
        Self {
            kind: MessageType::DataTransfer,
            ..self.clone()
        }
    }

    pub fn wire_len(&self) -> usize {
        if self.kind.has_fingerprint() {
            FILE_HEADER_LEN
        } else {
            DIR_HEADER_LEN
        }
    }

    /// Serialize into the fixed-width layout. Paths that do not fit the path
    /// field are rejected rather than truncated.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let path = self.path.as_bytes();
        if path.len() >= MAXPATH {
            return Err(SyncError::PathTooLong {
                path: self.path.clone(),
                len: path.len(),
                max: MAXPATH - 1,
            });
        }
        if path.contains(&0) {
            return Err(SyncError::PathRejected(format!(
                "{:?} contains a NUL byte",
                self.path
            )));
        }
        if self.size < 0 {
            return Err(SyncError::Protocol(format!("negative size {}", self.size)));
        }

        let mut buf = Vec::with_capacity(self.wire_len());
        buf.extend_from_slice(&self.kind.to_wire().to_be_bytes());
        let mut path_field = [0u8; MAXPATH];
        path_field[..path.len()].copy_from_slice(path);
        buf.extend_from_slice(&path_field);
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.mode.to_be_bytes());

        if self.kind.has_fingerprint() {
            let fp = self.fingerprint.as_ref().ok_or_else(|| {
                SyncError::Protocol(format!("{:?} message without fingerprint", self.kind))
            })?;
            if fp.len() != BLOCK_SIZE {
                return Err(SyncError::Protocol(format!(
                    "fingerprint is {} bytes, protocol needs {}",
                    fp.len(),
                    BLOCK_SIZE
                )));
            }
            buf.extend_from_slice(fp.as_bytes());
        }
        Ok(buf)
    }
}

/// Decode a NUL-padded path field
pub fn decode_path(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| SyncError::Protocol("path is not valid UTF-8".to_string()))
}
