//! Flag records: out-of-band per-person state used by triggers (§3).
//!
//! Each record is a fixed 26 bytes; the list is insertion-ordered and
//! terminated by a 2-byte `feature_eof` sentinel.

use crate::errors::{Error, Result};

const EOF_MARKER: u16 = u16::MAX;
pub const FLAG_RECORD_SIZE: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagRecord {
    pub flag_type: u16,
    pub reference: u64,
    pub context: u64,
    pub value: u64,
}

impl FlagRecord {
    pub fn encode(&self) -> [u8; FLAG_RECORD_SIZE] {
        let mut buf = [0u8; FLAG_RECORD_SIZE];
        buf[0..2].copy_from_slice(&self.flag_type.to_le_bytes());
        buf[2..10].copy_from_slice(&self.reference.to_le_bytes());
        buf[10..18].copy_from_slice(&self.context.to_le_bytes());
        buf[18..26].copy_from_slice(&self.value.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<FlagRecord> {
        if buf.len() < FLAG_RECORD_SIZE {
            return Err(Error::BadRecord("truncated flag record".into()));
        }
        Ok(FlagRecord {
            flag_type: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            reference: u64::from_le_bytes(buf[2..10].try_into().unwrap()),
            context: u64::from_le_bytes(buf[10..18].try_into().unwrap()),
            value: u64::from_le_bytes(buf[18..26].try_into().unwrap()),
        })
    }
}

/// Encode a flag list, appending the `feature_eof` sentinel exactly once.
pub fn encode_flags(flags: &[FlagRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(flags.len() * FLAG_RECORD_SIZE + 2);
    for flag in flags {
        out.extend_from_slice(&flag.encode());
    }
    out.extend_from_slice(&EOF_MARKER.to_le_bytes());
    out
}

/// Decode a flag list region, stopping at the `feature_eof` sentinel.
/// Returns the flags plus the number of bytes consumed (including the
/// sentinel), so callers can validate the region's declared size.
pub fn decode_flags(buf: &[u8]) -> Result<(Vec<FlagRecord>, usize)> {
    let mut flags = Vec::new();
    let mut cursor = 0usize;
    loop {
        if cursor + 2 <= buf.len() {
            let marker = u16::from_le_bytes(buf[cursor..cursor + 2].try_into().unwrap());
            if marker == EOF_MARKER {
                cursor += 2;
                break;
            }
        }
        let record = FlagRecord::decode(&buf[cursor..])?;
        flags.push(record);
        cursor += FLAG_RECORD_SIZE;
    }
    Ok((flags, cursor))
}

/// Add a flag, returning a new flag list (rewrite-region semantics per §4.A).
pub fn add_flag(flags: &[FlagRecord], flag: FlagRecord) -> Vec<FlagRecord> {
    let mut out = flags.to_vec();
    out.push(flag);
    out
}

/// Clear all flags matching `flag_type`, preserving relative order of the rest.
pub fn clear_flag(flags: &[FlagRecord], flag_type: u16) -> Vec<FlagRecord> {
    flags.iter().copied().filter(|f| f.flag_type != flag_type).collect()
}
