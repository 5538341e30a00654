//! Decoding of the fixed-layout records written by the kernel probes.
//!
//! Layout (little-endian, no padding):
//!
//! | offset | size | field      |
//! |--------|------|------------|
//! | 0      | 8    | pid (u64)  |
//! | 8      | 8    | ret (i64)  |
//! | 16     | 256  | file name  |

use std::borrow::Cow;
use std::fmt;

use openwatch_common::{EVENT_SIZE, MAX_FILENAME_LEN};
use serde::{Serialize, Serializer, ser::SerializeStruct};
use thiserror::Error;

const PID_OFFSET: usize = 0;
const RET_OFFSET: usize = 8;
const FILENAME_OFFSET: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// One decoded `do_sys_openat2` invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct Event {
    pid: u64,
    ret: i64,
    filename: [u8; MAX_FILENAME_LEN],
}

impl Event {
    pub fn new(pid: u64, ret: i64, file_name: &[u8]) -> Self {
        let mut filename = [0u8; MAX_FILENAME_LEN];
        let len = file_name.len().min(MAX_FILENAME_LEN);
        filename[..len].copy_from_slice(&file_name[..len]);
        Self { pid, ret, filename }
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn ret(&self) -> i64 {
        self.ret
    }

    /// File name bytes up to the first NUL, or the whole buffer if there is none.
    ///
    /// No encoding is assumed.
    pub fn file_name(&self) -> &[u8] {
        let end = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_FILENAME_LEN);
        &self.filename[..end]
    }

    pub fn file_name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.file_name())
    }

    /// The full file name buffer, including anything after the terminator.
    pub fn raw_file_name(&self) -> &[u8; MAX_FILENAME_LEN] {
        &self.filename
    }

    pub fn encode(&self) -> [u8; EVENT_SIZE] {
        let mut buf = [0u8; EVENT_SIZE];
        buf[PID_OFFSET..RET_OFFSET].copy_from_slice(&self.pid.to_le_bytes());
        buf[RET_OFFSET..FILENAME_OFFSET].copy_from_slice(&self.ret.to_le_bytes());
        buf[FILENAME_OFFSET..].copy_from_slice(&self.filename);
        buf
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("pid", &self.pid)
            .field("ret", &self.ret)
            .field("file_name", &self.file_name_lossy())
            .finish()
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Event", 3)?;
        state.serialize_field("pid", &self.pid)?;
        state.serialize_field("ret", &self.ret)?;
        state.serialize_field("file_name", &self.file_name_lossy())?;
        state.end()
    }
}

/// Decode one raw ring buffer record. Purely structural: only the length is checked.
pub fn decode(raw: &[u8]) -> Result<Event, DecodeError> {
    let bytes: &[u8; EVENT_SIZE] = raw.try_into().map_err(|_| DecodeError::SizeMismatch {
        expected: EVENT_SIZE,
        actual: raw.len(),
    })?;

    let mut pid = [0u8; 8];
    pid.copy_from_slice(&bytes[PID_OFFSET..RET_OFFSET]);
    let mut ret = [0u8; 8];
    ret.copy_from_slice(&bytes[RET_OFFSET..FILENAME_OFFSET]);
    let mut filename = [0u8; MAX_FILENAME_LEN];
    filename.copy_from_slice(&bytes[FILENAME_OFFSET..]);

    Ok(Event {
        pid: u64::from_le_bytes(pid),
        ret: i64::from_le_bytes(ret),
        filename,
    })
}
