//! Decoders for the compact containers older (and newer) Redis versions
//! use to store small collections as a single string blob.
//!
//! Each decoder takes the whole blob and returns its entries in order;
//! integers stored natively come back as their decimal text.

use bytes::Bytes;

use super::get_slice::{get_buffer_array, get_buffer_slice};
use super::SnapshotError;

const ZIPLIST_HEADER_SIZE: usize = 10;
const ZIPLIST_END: u8 = 0xFF;
const ZIPLIST_BIG_PREVLEN: u8 = 0xFE;

const ZIPMAP_END: u8 = 0xFF;
const ZIPMAP_BIG_LENGTH: u8 = 0xFE;

const LISTPACK_HEADER_SIZE: usize = 6;
const LISTPACK_END: u8 = 0xFF;

fn integer_text(value: i64) -> Bytes {
    Bytes::from(value.to_string())
}

/// Maps a bounds failure inside a blob to an error naming the container.
fn within<T>(container: &'static str, result: Result<T, SnapshotError>) -> Result<T, SnapshotError> {
    result.map_err(|e| match e {
        SnapshotError::UnexpectedEof { cursor, .. } => {
            SnapshotError::compact(container, format!("truncated at byte {}", cursor))
        }
        other => other,
    })
}

/// Decodes a ziplist: `<zlbytes u32><zltail u32><zllen u16><entry>*<0xFF>`.
pub fn decode_ziplist(blob: &[u8]) -> Result<Vec<Bytes>, SnapshotError> {
    within("ziplist", ziplist_entries(blob))
}

fn ziplist_entries(blob: &[u8]) -> Result<Vec<Bytes>, SnapshotError> {
    get_buffer_slice(blob, 0, ZIPLIST_HEADER_SIZE)?;
    let declared = u16::from_le_bytes(get_buffer_array(blob, 8)?) as usize;

    let mut entries = Vec::with_capacity(declared);
    let mut cursor = ZIPLIST_HEADER_SIZE;

    loop {
        let first = get_buffer_slice(blob, cursor, 1)?[0];
        if first == ZIPLIST_END {
            break;
        }

        // Previous entry length: only needed for reverse traversal.
        cursor += if first == ZIPLIST_BIG_PREVLEN { 5 } else { 1 };

        let header = get_buffer_slice(blob, cursor, 1)?[0];
        cursor += 1;

        let entry = match header >> 6 {
            0b00 => {
                let length = (header & 0x3f) as usize;
                let value = get_buffer_slice(blob, cursor, length)?;
                cursor += length;
                Bytes::copy_from_slice(value)
            }
            0b01 => {
                let low = get_buffer_slice(blob, cursor, 1)?[0];
                cursor += 1;
                let length = ((header as usize & 0x3f) << 8) | low as usize;
                let value = get_buffer_slice(blob, cursor, length)?;
                cursor += length;
                Bytes::copy_from_slice(value)
            }
            0b10 => {
                let length = u32::from_be_bytes(get_buffer_array(blob, cursor)?) as usize;
                cursor += 4;
                let value = get_buffer_slice(blob, cursor, length)?;
                cursor += length;
                Bytes::copy_from_slice(value)
            }
            _ => {
                let (value, read) = ziplist_integer(blob, cursor, header)?;
                cursor += read;
                integer_text(value)
            }
        };

        entries.push(entry);
    }

    // 0xFFFF means "too many to count".
    if declared != u16::MAX as usize && declared != entries.len() {
        return Err(SnapshotError::compact(
            "ziplist",
            format!("declares {} entries but holds {}", declared, entries.len()),
        ));
    }

    Ok(entries)
}

fn ziplist_integer(blob: &[u8], cursor: usize, header: u8) -> Result<(i64, usize), SnapshotError> {
    match header {
        0xC0 => Ok((i16::from_le_bytes(get_buffer_array(blob, cursor)?) as i64, 2)),
        0xD0 => Ok((i32::from_le_bytes(get_buffer_array(blob, cursor)?) as i64, 4)),
        0xE0 => Ok((i64::from_le_bytes(get_buffer_array(blob, cursor)?), 8)),
        0xF0 => {
            let [a, b, c] = get_buffer_array::<3>(blob, cursor)?;
            // Sign-extend the 24 bit value through the top byte.
            Ok((i32::from_le_bytes([0, a, b, c]) as i64 >> 8, 3))
        }
        0xFE => Ok((i8::from_le_bytes(get_buffer_array(blob, cursor)?) as i64, 1)),
        0xF1..=0xFD => Ok(((header & 0x0f) as i64 - 1, 0)),
        other => Err(SnapshotError::compact(
            "ziplist",
            format!("unknown entry encoding 0x{:02X}", other),
        )),
    }
}

/// Decodes a zipmap into alternating field, value entries.
pub fn decode_zipmap(blob: &[u8]) -> Result<Vec<Bytes>, SnapshotError> {
    within("zipmap", zipmap_entries(blob))
}

fn zipmap_entries(blob: &[u8]) -> Result<Vec<Bytes>, SnapshotError> {
    let mut entries = Vec::new();
    let mut cursor = 1;

    loop {
        let (field_length, read) = match zipmap_length(blob, cursor)? {
            None => break,
            Some(length) => length,
        };
        cursor += read;
        entries.push(Bytes::copy_from_slice(get_buffer_slice(blob, cursor, field_length)?));
        cursor += field_length;

        let Some((value_length, read)) = zipmap_length(blob, cursor)? else {
            return Err(SnapshotError::compact("zipmap", "field without a value"));
        };
        cursor += read;

        let free = get_buffer_slice(blob, cursor, 1)?[0] as usize;
        cursor += 1;

        entries.push(Bytes::copy_from_slice(get_buffer_slice(blob, cursor, value_length)?));
        cursor += value_length + free;
    }

    Ok(entries)
}

/// `None` at the end marker.
fn zipmap_length(blob: &[u8], cursor: usize) -> Result<Option<(usize, usize)>, SnapshotError> {
    match get_buffer_slice(blob, cursor, 1)?[0] {
        ZIPMAP_END => Ok(None),
        ZIPMAP_BIG_LENGTH => {
            let length = u32::from_le_bytes(get_buffer_array(blob, cursor + 1)?);
            Ok(Some((length as usize, 5)))
        }
        length => Ok(Some((length as usize, 1))),
    }
}

/// Decodes an intset: `<encoding u32><length u32><integers>`, all
/// little-endian, each integer `encoding` bytes wide.
pub fn decode_intset(blob: &[u8]) -> Result<Vec<Bytes>, SnapshotError> {
    within("intset", intset_entries(blob))
}

fn intset_entries(blob: &[u8]) -> Result<Vec<Bytes>, SnapshotError> {
    let width = u32::from_le_bytes(get_buffer_array(blob, 0)?) as usize;
    let length = u32::from_le_bytes(get_buffer_array(blob, 4)?) as usize;

    if !matches!(width, 2 | 4 | 8) {
        return Err(SnapshotError::compact(
            "intset",
            format!("invalid integer width {}", width),
        ));
    }

    let contents = get_buffer_slice(blob, 8, length.saturating_mul(width))?;

    Ok(contents
        .chunks_exact(width)
        .map(|chunk| {
            let value = match chunk {
                [a, b] => i16::from_le_bytes([*a, *b]) as i64,
                [a, b, c, d] => i32::from_le_bytes([*a, *b, *c, *d]) as i64,
                _ => {
                    let mut array = [0u8; 8];
                    array.copy_from_slice(chunk);
                    i64::from_le_bytes(array)
                }
            };
            integer_text(value)
        })
        .collect())
}

/// Decodes a listpack: `<total u32><count u16><entry>*<0xFF>`, where each
/// entry is followed by its own length encoded backwards.
pub fn decode_listpack(blob: &[u8]) -> Result<Vec<Bytes>, SnapshotError> {
    within("listpack", listpack_entries(blob))
}

fn listpack_entries(blob: &[u8]) -> Result<Vec<Bytes>, SnapshotError> {
    get_buffer_slice(blob, 0, LISTPACK_HEADER_SIZE)?;
    let declared = u16::from_le_bytes(get_buffer_array(blob, 4)?) as usize;

    let mut entries = Vec::with_capacity(declared);
    let mut cursor = LISTPACK_HEADER_SIZE;

    loop {
        let header = get_buffer_slice(blob, cursor, 1)?[0];
        if header == LISTPACK_END {
            break;
        }

        let (entry, encoded_length) = listpack_entry(blob, cursor, header)?;
        cursor += encoded_length + backlen_size(encoded_length);
        entries.push(entry);
    }

    if declared != u16::MAX as usize && declared != entries.len() {
        return Err(SnapshotError::compact(
            "listpack",
            format!("declares {} entries but holds {}", declared, entries.len()),
        ));
    }

    Ok(entries)
}

/// One listpack entry starting at `cursor` and the size of its encoding
/// plus data (without the trailing back-length).
fn listpack_entry(blob: &[u8], cursor: usize, header: u8) -> Result<(Bytes, usize), SnapshotError> {
    let string = |offset: usize, length: usize| -> Result<(Bytes, usize), SnapshotError> {
        let value = get_buffer_slice(blob, cursor + offset, length)?;
        Ok((Bytes::copy_from_slice(value), offset + length))
    };

    if header & 0x80 == 0 {
        return Ok((integer_text((header & 0x7f) as i64), 1));
    }
    if header & 0xC0 == 0x80 {
        return string(1, (header & 0x3f) as usize);
    }
    if header & 0xE0 == 0xC0 {
        let low = get_buffer_slice(blob, cursor + 1, 1)?[0];
        let raw = (((header & 0x1f) as i64) << 8) | low as i64;
        // 13 bit two's complement.
        let value = if raw >= 1 << 12 { raw - (1 << 13) } else { raw };
        return Ok((integer_text(value), 2));
    }
    if header & 0xF0 == 0xE0 {
        let low = get_buffer_slice(blob, cursor + 1, 1)?[0];
        return string(2, ((header as usize & 0x0f) << 8) | low as usize);
    }

    let data = cursor + 1;
    match header {
        0xF0 => {
            let length = u32::from_le_bytes(get_buffer_array(blob, data)?) as usize;
            string(5, length)
        }
        0xF1 => Ok((
            integer_text(i16::from_le_bytes(get_buffer_array(blob, data)?) as i64),
            3,
        )),
        0xF2 => {
            let [a, b, c] = get_buffer_array::<3>(blob, data)?;
            Ok((integer_text(i32::from_le_bytes([0, a, b, c]) as i64 >> 8), 4))
        }
        0xF3 => Ok((
            integer_text(i32::from_le_bytes(get_buffer_array(blob, data)?) as i64),
            5,
        )),
        0xF4 => Ok((integer_text(i64::from_le_bytes(get_buffer_array(blob, data)?)), 9)),
        other => Err(SnapshotError::compact(
            "listpack",
            format!("unknown entry encoding 0x{:02X}", other),
        )),
    }
}

fn backlen_size(encoded_length: usize) -> usize {
    match encoded_length {
        0..=127 => 1,
        128..=16_382 => 2,
        16_383..=2_097_150 => 3,
        2_097_151..=268_435_454 => 4,
        _ => 5,
    }
}

/// Splits alternating entries into pairs, rejecting an odd count.
pub fn into_pairs(
    container: &'static str,
    entries: Vec<Bytes>,
) -> Result<Vec<(Bytes, Bytes)>, SnapshotError> {
    if entries.len() % 2 != 0 {
        return Err(SnapshotError::compact(container, "odd number of entries"));
    }

    let mut pairs = Vec::with_capacity(entries.len() / 2);
    let mut iter = entries.into_iter();
    while let (Some(first), Some(second)) = (iter.next(), iter.next()) {
        pairs.push((first, second));
    }
    Ok(pairs)
}
