//! Row-level cell encoding: the compressed `Col_s` stream format (§3).
//!
//! Cell type is carried in the high 3 bits of a 16-bit column header, the
//! low 13 bits carry the column id (0..=8191, matching `schema::MAX_COLUMNS`).

use crate::errors::{Error, Result};

const TAG_SHIFT: u16 = 13;
const COLUMN_MASK: u16 = (1 << TAG_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellTag {
    Row,
    Null,
    Copydown,
    Int16,
    Int32,
    Int64,
}

impl CellTag {
    fn from_bits(bits: u16) -> Option<CellTag> {
        match bits {
            0 => Some(CellTag::Row),
            1 => Some(CellTag::Null),
            2 => Some(CellTag::Copydown),
            3 => Some(CellTag::Int16),
            4 => Some(CellTag::Int32),
            5 => Some(CellTag::Int64),
            _ => None,
        }
    }

    fn bits(self) -> u16 {
        match self {
            CellTag::Row => 0,
            CellTag::Null => 1,
            CellTag::Copydown => 2,
            CellTag::Int16 => 3,
            CellTag::Int32 => 4,
            CellTag::Int64 => 5,
        }
    }
}

fn header(tag: CellTag, column: u16) -> u16 {
    (tag.bits() << TAG_SHIFT) | (column & COLUMN_MASK)
}

fn narrowest_tag(value: i64) -> CellTag {
    if value >= i16::MIN as i64 && value <= i16::MAX as i64 {
        CellTag::Int16
    } else if value >= i32::MIN as i64 && value <= i32::MAX as i64 {
        CellTag::Int32
    } else {
        CellTag::Int64
    }
}

/// One decoded or about-to-be-encoded row: `(column_id, i64_payload)` pairs
/// in ascending column order, `None` entries are never materialized -- an
/// absent column simply has no entry for that row.
pub type EncRow = Vec<(u16, i64)>;

/// Encode a sequence of rows (each a sorted set of `(column, value)` pairs)
/// using `copydown` whenever a cell equals the immediately preceding row's
/// cell for that column, otherwise the narrowest integer tag that losslessly
/// represents the value.
pub fn encode_rows(rows: &[EncRow]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev: Vec<(u16, i64)> = Vec::new();
    for row in rows {
        push_u16(&mut out, header(CellTag::Row, 0));
        for &(col, value) in row {
            let prev_value = prev.iter().find(|&&(c, _)| c == col).map(|&(_, v)| v);
            if prev_value == Some(value) {
                push_u16(&mut out, header(CellTag::Copydown, col));
            } else {
                let tag = narrowest_tag(value);
                push_u16(&mut out, header(tag, col));
                match tag {
                    CellTag::Int16 => push_u16(&mut out, value as i16 as u16),
                    CellTag::Int32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
                    CellTag::Int64 => out.extend_from_slice(&value.to_le_bytes()),
                    _ => unreachable!(),
                }
            }
        }
        prev = row.clone();
    }
    out
}

/// Inverse of [`encode_rows`]. `bad_record` if the stream is malformed.
pub fn decode_rows(bytes: &[u8]) -> Result<Vec<EncRow>> {
    let mut rows = Vec::new();
    let mut current: EncRow = Vec::new();
    let mut prev: EncRow = Vec::new();
    let mut cursor = 0usize;
    let mut started = false;
    while cursor < bytes.len() {
        let h = read_u16(bytes, &mut cursor)?;
        let tag = CellTag::from_bits(h >> TAG_SHIFT)
            .ok_or_else(|| Error::BadRecord(format!("invalid cell tag bits {}", h >> TAG_SHIFT)))?;
        let column = h & COLUMN_MASK;
        match tag {
            CellTag::Row => {
                if started {
                    rows.push(std::mem::take(&mut current));
                    prev = rows.last().cloned().unwrap();
                }
                started = true;
            }
            CellTag::Null => {
                current.retain(|&(c, _)| c != column);
            }
            CellTag::Copydown => {
                let value = prev
                    .iter()
                    .find(|&&(c, _)| c == column)
                    .map(|&(_, v)| v)
                    .ok_or_else(|| {
                        Error::BadRecord(format!("copydown with no previous value for column {column}"))
                    })?;
                current.push((column, value));
            }
            CellTag::Int16 => {
                let v = read_u16(bytes, &mut cursor)? as i16 as i64;
                current.push((column, v));
            }
            CellTag::Int32 => {
                let v = read_i32(bytes, &mut cursor)? as i64;
                current.push((column, v));
            }
            CellTag::Int64 => {
                let v = read_i64(bytes, &mut cursor)?;
                current.push((column, v));
            }
        }
    }
    if started {
        rows.push(current);
    }
    Ok(rows)
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn read_u16(bytes: &[u8], cursor: &mut usize) -> Result<u16> {
    let end = *cursor + 2;
    let slice = bytes
        .get(*cursor..end)
        .ok_or_else(|| Error::BadRecord("truncated cell stream".into()))?;
    *cursor = end;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

fn read_i32(bytes: &[u8], cursor: &mut usize) -> Result<i32> {
    let end = *cursor + 4;
    let slice = bytes
        .get(*cursor..end)
        .ok_or_else(|| Error::BadRecord("truncated cell stream".into()))?;
    *cursor = end;
    Ok(i32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_i64(bytes: &[u8], cursor: &mut usize) -> Result<i64> {
    let end = *cursor + 8;
    let slice = bytes
        .get(*cursor..end)
        .ok_or_else(|| Error::BadRecord("truncated cell stream".into()))?;
    *cursor = end;
    Ok(i64::from_le_bytes(slice.try_into().unwrap()))
}

/// Fixed-point encoding used for double columns (`*10000`, per §3).
pub fn encode_double(v: f64) -> i64 {
    (v * 10000.0).round() as i64
}

pub fn decode_double(v: i64) -> f64 {
    v as f64 / 10000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_simple() {
        let rows = vec![vec![(1, 10), (2, 20)], vec![(1, 10), (2, 21)], vec![(1, 10)]];
        let bytes = encode_rows(&rows);
        let decoded = decode_rows(&bytes).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn copydown_used_iff_equal_to_previous_row() {
        let rows = vec![vec![(1, 10)], vec![(1, 10)], vec![(1, 11)]];
        let bytes = encode_rows(&rows);
        // header for row 2's column 1 cell must be Copydown; row 3's must not be.
        // Row separator(2) + cell(2) bytes = 4 bytes per simple row; walk manually.
        let mut cursor = 0usize;
        let _row0 = read_u16(&bytes, &mut cursor).unwrap();
        let _cell0 = read_u16(&bytes, &mut cursor).unwrap();
        let _payload0 = read_u16(&bytes, &mut cursor).unwrap();
        let _row1 = read_u16(&bytes, &mut cursor).unwrap();
        let cell1 = read_u16(&bytes, &mut cursor).unwrap();
        assert_eq!(CellTag::from_bits(cell1 >> TAG_SHIFT), Some(CellTag::Copydown));
        let decoded = decode_rows(&bytes).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn rejects_truncated_stream() {
        let bytes = vec![0u8, 0u8, 3u8 << 5];
        assert!(decode_rows(&bytes).is_err());
    }

    #[test]
    fn narrowest_width_selection() {
        assert_eq!(narrowest_tag(5), CellTag::Int16);
        assert_eq!(narrowest_tag(100_000), CellTag::Int32);
        assert_eq!(narrowest_tag(i64::MAX), CellTag::Int64);
    }
}
