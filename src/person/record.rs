//! `PersonData_s`: the packed, on-heap per-person buffer (§3).
//!
//! Layout: fixed header, then id string, flag records (terminated by the
//! `feature_eof` sentinel), property blob, compressed event rows. This is
//! the canonical representation returned by `Grid::commit` and consumed by
//! `Grid::mount`.

use crate::errors::{Error, Result};
use crate::person::flags::{decode_flags, encode_flags, FlagRecord};

const HEADER_SIZE: usize = 8 + 4 + 4 + 4 + 4 + 2 + 2;

#[derive(Debug, Clone, PartialEq)]
pub struct PersonData {
    pub external_id: u64,
    pub linear_id: u32,
    pub uncompressed_event_bytes: u32,
    pub id: String,
    pub flags: Vec<FlagRecord>,
    pub props: Vec<u8>,
    pub comp: Vec<u8>,
}

impl PersonData {
    pub fn size(&self) -> usize {
        HEADER_SIZE
            + self.id.len()
            + self.flags.len() * crate::person::flags::FLAG_RECORD_SIZE
            + 2 // feature_eof sentinel
            + self.props.len()
            + self.comp.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let flag_bytes = encode_flags(&self.flags);
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&self.external_id.to_le_bytes());
        out.extend_from_slice(&self.linear_id.to_le_bytes());
        out.extend_from_slice(&self.uncompressed_event_bytes.to_le_bytes());
        out.extend_from_slice(&(self.comp.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.props.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.id.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.flags.len() as u16).to_le_bytes());
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(&flag_bytes);
        out.extend_from_slice(&self.props);
        out.extend_from_slice(&self.comp);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<PersonData> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::BadRecord("truncated person header".into()));
        }
        let external_id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let linear_id = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let uncompressed_event_bytes = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let comp_size = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;
        let prop_size = u32::from_le_bytes(buf[20..24].try_into().unwrap()) as usize;
        let id_len = u16::from_le_bytes(buf[24..26].try_into().unwrap()) as usize;
        let _flag_count = u16::from_le_bytes(buf[26..28].try_into().unwrap());

        let mut cursor = HEADER_SIZE;
        let id = buf
            .get(cursor..cursor + id_len)
            .ok_or_else(|| Error::BadRecord("truncated id string".into()))?;
        let id = String::from_utf8(id.to_vec())
            .map_err(|e| Error::BadRecord(format!("invalid id string: {e}")))?;
        cursor += id_len;

        let (flags, flag_region_len) = decode_flags(
            buf.get(cursor..)
                .ok_or_else(|| Error::BadRecord("truncated flag region".into()))?,
        )?;
        cursor += flag_region_len;

        let props = buf
            .get(cursor..cursor + prop_size)
            .ok_or_else(|| Error::BadRecord("truncated property blob".into()))?
            .to_vec();
        cursor += prop_size;

        let comp = buf
            .get(cursor..cursor + comp_size)
            .ok_or_else(|| Error::BadRecord("truncated compressed event bytes".into()))?
            .to_vec();
        cursor += comp_size;

        if cursor != buf.len() {
            return Err(Error::BadRecord(format!(
                "trailing bytes after person record: expected {cursor}, found {}",
                buf.len()
            )));
        }

        Ok(PersonData {
            external_id,
            linear_id,
            uncompressed_event_bytes,
            id,
            flags,
            props,
            comp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::person::flags::FlagRecord;

    #[test]
    fn round_trip() {
        let person = PersonData {
            external_id: 0xdead_beef,
            linear_id: 42,
            uncompressed_event_bytes: 128,
            id: "user-1".to_string(),
            flags: vec![FlagRecord { flag_type: 1, reference: 2, context: 3, value: 4 }],
            props: b"{}".to_vec(),
            comp: vec![1, 2, 3, 4, 5],
        };
        let bytes = person.encode();
        assert_eq!(bytes.len(), person.size());
        let decoded = PersonData::decode(&bytes).unwrap();
        assert_eq!(decoded, person);
    }

    #[test]
    fn rejects_trailing_garbage() {
        let person = PersonData {
            external_id: 1,
            linear_id: 1,
            uncompressed_event_bytes: 0,
            id: "a".to_string(),
            flags: vec![],
            props: vec![],
            comp: vec![],
        };
        let mut bytes = person.encode();
        bytes.push(0xff);
        assert!(PersonData::decode(&bytes).is_err());
    }
}
