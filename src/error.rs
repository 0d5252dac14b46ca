use std::io;

use thiserror::Error;

/// Failure while saving or restoring a snapshot.
///
/// `Compat` means the snapshot was written by a differently shaped machine
/// (other architecture, other RAM size, other block layout). The data itself
/// may be fine; the caller should build a matching machine instead of
/// retrying the restore.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is not compatible: {0}")]
    Compat(String),

    #[error("snapshot is missing {0}")]
    Missing(String),

    #[error("snapshot i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SnapshotError {
    pub fn compat(msg: impl Into<String>) -> Self {
        SnapshotError::Compat(msg.into())
    }

    pub fn is_compat(&self) -> bool {
        matches!(self, SnapshotError::Compat(_))
    }
}

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("invalid drive number {0}")]
    InvalidDrive(u8),

    #[error("no disk loaded in drive {0}")]
    NotLoaded(u8),

    #[error("unsupported image size: {0} bytes")]
    UnsupportedSize(usize),

    #[error("image format error: {0}")]
    Format(String),

    #[error("disk i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Protocol-level fault raised by a floppy controller command.
///
/// These never reach the host: the controller turns each one into the
/// status bytes the emulated software reads back in the result phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FdcFault {
    #[error("drive {drive} not ready")]
    NotReady { drive: u8 },

    #[error("invalid sector {0}")]
    InvalidSector(u8),

    #[error("invalid cylinder {0}")]
    InvalidCylinder(u8),

    #[error("invalid head {0}")]
    InvalidHead(u8),

    #[error("unsupported sector size code {0}")]
    UnsupportedSectorSize(u8),

    #[error("disk in drive {drive} is write protected")]
    WriteProtected { drive: u8 },

    #[error("data transfer timed out")]
    Timeout,

    #[error("invalid command {0:#04X}")]
    InvalidCommand(u8),

    #[error("command {0} is not implemented")]
    NotImplemented(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitMaskError {
    #[error("bit mask pattern is empty")]
    Empty,

    #[error("bit mask pattern {0:?} is wider than 16 bits")]
    TooWide(String),

    #[error("invalid character {1:?} in bit mask pattern {0:?}")]
    InvalidChar(String, char),
}

#[derive(Debug, Error)]
pub enum CpuFault {
    #[error("unknown opcode {opcode:#04X} at {address:#06X}")]
    UnknownOpcode { opcode: u8, address: u32 },

    #[error("error executing instruction at {address:#06X}: {source}")]
    Execution {
        address: u32,
        #[source]
        source: anyhow::Error,
    },
}
