use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use crate::key_value_store::{format_score, parse_score, SortedSet, Value};
use crate::rdb::{
    compact::{decode_intset, decode_listpack, decode_ziplist, decode_zipmap, into_pairs},
    encoding::{parse_length, parse_string},
    get_slice::{get_buffer_array, get_buffer_slice},
    SnapshotError,
};

pub const MAGIC_STRING: &[u8] = b"REDIS";
pub const WRITTEN_VERSION: &str = "0009";
pub const MAX_SUPPORTED_VERSION: u32 = 12;

pub const AUX_OPCODE: u8 = 0xFA;
pub const RESIZE_DB_OPCODE: u8 = 0xFB;
pub const EXPIRATION_MILLISECONDS_OPCODE: u8 = 0xFC;
pub const EXPIRATION_SECONDS_OPCODE: u8 = 0xFD;
pub const DATABASE_OPCODE: u8 = 0xFE;
pub const END_OF_FILE_OPCODE: u8 = 0xFF;

pub const STRING_VALUE_TYPE: u8 = 0;
pub const LIST_VALUE_TYPE: u8 = 1;
pub const SET_VALUE_TYPE: u8 = 2;
pub const SORTED_SET_VALUE_TYPE: u8 = 3;
pub const HASH_VALUE_TYPE: u8 = 4;
pub const SORTED_SET_BINARY_VALUE_TYPE: u8 = 5;
pub const HASH_ZIPMAP_VALUE_TYPE: u8 = 9;
pub const LIST_ZIPLIST_VALUE_TYPE: u8 = 10;
pub const SET_INTSET_VALUE_TYPE: u8 = 11;
pub const SORTED_SET_ZIPLIST_VALUE_TYPE: u8 = 12;
pub const HASH_ZIPLIST_VALUE_TYPE: u8 = 13;
pub const LIST_QUICKLIST_VALUE_TYPE: u8 = 14;
pub const HASH_LISTPACK_VALUE_TYPE: u8 = 16;
pub const SORTED_SET_LISTPACK_VALUE_TYPE: u8 = 17;
pub const LIST_QUICKLIST_2_VALUE_TYPE: u8 = 18;
pub const SET_LISTPACK_VALUE_TYPE: u8 = 20;

// Single byte score lengths reserved for non-finite values.
const SCORE_NAN: u8 = 253;
const SCORE_POSITIVE_INFINITY: u8 = 254;
const SCORE_NEGATIVE_INFINITY: u8 = 255;

// Quicklist v2 node containers.
const QUICKLIST_NODE_PLAIN: usize = 1;
const QUICKLIST_NODE_PACKED: usize = 2;

#[derive(Debug, PartialEq)]
pub enum OpCodeResponse {
    Aux { key: Bytes, value: Bytes },
    ResizeDb { db_size: usize, expires_size: usize },
    Database { index: usize },
    /// Absolute expiry, in milliseconds, for the next key only.
    Expiration { expires_at: u64 },
    EndOfFile { checksum: [u8; 8] },
    KeyValuePair { key: Bytes, value: Value },
}

#[derive(Debug)]
pub struct MagicStringResponse {
    pub number_of_read_bytes: usize,
    pub version: u32,
}

/// Checks the `REDIS` magic string and the four digit version after it.
pub fn parse_magic_string(bytes: &[u8]) -> Result<MagicStringResponse, SnapshotError> {
    let magic = get_buffer_slice(bytes, 0, MAGIC_STRING.len())
        .map_err(|_| SnapshotError::InvalidMagic)?;
    if magic != MAGIC_STRING {
        return Err(SnapshotError::InvalidMagic);
    }

    let version_bytes = get_buffer_slice(bytes, MAGIC_STRING.len(), 4)?;
    let version_text = String::from_utf8_lossy(version_bytes).into_owned();

    let version = version_text
        .parse::<u32>()
        .map_err(|_| SnapshotError::UnsupportedVersion(version_text.clone()))?;

    if !(1..=MAX_SUPPORTED_VERSION).contains(&version) {
        return Err(SnapshotError::UnsupportedVersion(version_text));
    }

    Ok(MagicStringResponse {
        number_of_read_bytes: MAGIC_STRING.len() + 4,
        version,
    })
}

/// Parses the opcode (or value type) at `cursor` together with its payload.
///
/// # Returns
///
/// * `Ok((response, bytes_read))`
/// * `Err(SnapshotError)` - The input is truncated or malformed
pub fn parse_opcode(bytes: &[u8], cursor: usize) -> Result<(OpCodeResponse, usize), SnapshotError> {
    let mut temp_cursor = cursor;
    let opcode = get_buffer_slice(bytes, temp_cursor, 1)?[0];
    temp_cursor += 1;

    let response = match opcode {
        AUX_OPCODE => {
            let (key, key_cursor) = parse_string(bytes, temp_cursor)?;
            temp_cursor += key_cursor;
            let (value, value_cursor) = parse_string(bytes, temp_cursor)?;
            temp_cursor += value_cursor;

            OpCodeResponse::Aux { key, value }
        }
        RESIZE_DB_OPCODE => {
            let (db_size, db_size_cursor) = parse_length(bytes, temp_cursor)?;
            temp_cursor += db_size_cursor;
            let (expires_size, expires_size_cursor) = parse_length(bytes, temp_cursor)?;
            temp_cursor += expires_size_cursor;

            OpCodeResponse::ResizeDb {
                db_size,
                expires_size,
            }
        }
        DATABASE_OPCODE => {
            let (index, index_cursor) = parse_length(bytes, temp_cursor)?;
            temp_cursor += index_cursor;

            OpCodeResponse::Database { index }
        }
        EXPIRATION_SECONDS_OPCODE => {
            let seconds = u32::from_le_bytes(get_buffer_array(bytes, temp_cursor)?);
            temp_cursor += 4;

            OpCodeResponse::Expiration {
                expires_at: seconds as u64 * 1000,
            }
        }
        EXPIRATION_MILLISECONDS_OPCODE => {
            let millis = u64::from_le_bytes(get_buffer_array(bytes, temp_cursor)?);
            temp_cursor += 8;

            OpCodeResponse::Expiration { expires_at: millis }
        }
        END_OF_FILE_OPCODE => {
            // Versions before 5 have no checksum trailer.
            let checksum = if bytes.len() >= temp_cursor + 8 {
                let checksum = get_buffer_array(bytes, temp_cursor)?;
                temp_cursor += 8;
                checksum
            } else {
                [0; 8]
            };

            OpCodeResponse::EndOfFile { checksum }
        }
        value_type => {
            let (key, key_cursor) = parse_string(bytes, temp_cursor)?;
            temp_cursor += key_cursor;
            let (value, value_cursor) = parse_value(bytes, temp_cursor, value_type)?;
            temp_cursor += value_cursor;

            OpCodeResponse::KeyValuePair { key, value }
        }
    };

    Ok((response, temp_cursor - cursor))
}

/// Decodes one value of the given type.
pub fn parse_value(bytes: &[u8], cursor: usize, value_type: u8) -> Result<(Value, usize), SnapshotError> {
    let mut temp_cursor = cursor;

    let value = match value_type {
        STRING_VALUE_TYPE => {
            let (value, read) = parse_string(bytes, temp_cursor)?;
            temp_cursor += read;
            Value::String(value)
        }
        LIST_VALUE_TYPE | SET_VALUE_TYPE => {
            let (items, read) = parse_string_sequence(bytes, temp_cursor, 1)?;
            temp_cursor += read;
            if value_type == LIST_VALUE_TYPE {
                Value::List(items.into_iter().collect())
            } else {
                Value::Set(items.into_iter().collect())
            }
        }
        HASH_VALUE_TYPE => {
            let (items, read) = parse_string_sequence(bytes, temp_cursor, 2)?;
            temp_cursor += read;
            Value::Hash(into_pairs("hash", items)?.into_iter().collect())
        }
        SORTED_SET_VALUE_TYPE | SORTED_SET_BINARY_VALUE_TYPE => {
            let (count, read) = parse_length(bytes, temp_cursor)?;
            temp_cursor += read;

            let mut zset = SortedSet::new();
            for _ in 0..count {
                let (member, read) = parse_string(bytes, temp_cursor)?;
                temp_cursor += read;

                let (score, read) = if value_type == SORTED_SET_VALUE_TYPE {
                    parse_text_score(bytes, temp_cursor)?
                } else {
                    let score = f64::from_le_bytes(get_buffer_array(bytes, temp_cursor)?);
                    if score.is_nan() {
                        return Err(SnapshotError::InvalidScore);
                    }
                    (score, 8)
                };
                temp_cursor += read;

                zset.insert(member, score);
            }
            Value::SortedSet(zset)
        }
        LIST_QUICKLIST_VALUE_TYPE | LIST_QUICKLIST_2_VALUE_TYPE => {
            let (nodes, read) = parse_length(bytes, temp_cursor)?;
            temp_cursor += read;

            let mut list = VecDeque::new();
            for _ in 0..nodes {
                let container = if value_type == LIST_QUICKLIST_2_VALUE_TYPE {
                    let (container, read) = parse_length(bytes, temp_cursor)?;
                    temp_cursor += read;
                    container
                } else {
                    QUICKLIST_NODE_PACKED
                };

                let (blob, read) = parse_string(bytes, temp_cursor)?;
                temp_cursor += read;

                match (value_type, container) {
                    (_, QUICKLIST_NODE_PLAIN) => list.push_back(blob),
                    (LIST_QUICKLIST_VALUE_TYPE, _) => list.extend(decode_ziplist(&blob)?),
                    (_, QUICKLIST_NODE_PACKED) => list.extend(decode_listpack(&blob)?),
                    (_, other) => {
                        return Err(SnapshotError::compact(
                            "quicklist",
                            format!("unknown node container {}", other),
                        ))
                    }
                }
            }
            Value::List(list)
        }
        HASH_ZIPMAP_VALUE_TYPE
        | LIST_ZIPLIST_VALUE_TYPE
        | SET_INTSET_VALUE_TYPE
        | SORTED_SET_ZIPLIST_VALUE_TYPE
        | HASH_ZIPLIST_VALUE_TYPE
        | HASH_LISTPACK_VALUE_TYPE
        | SORTED_SET_LISTPACK_VALUE_TYPE
        | SET_LISTPACK_VALUE_TYPE => {
            let (blob, read) = parse_string(bytes, temp_cursor)?;
            temp_cursor += read;
            parse_compact_value(&blob, value_type)?
        }
        other => return Err(SnapshotError::UnsupportedType(other)),
    };

    Ok((value, temp_cursor - cursor))
}

fn parse_compact_value(blob: &[u8], value_type: u8) -> Result<Value, SnapshotError> {
    let value = match value_type {
        HASH_ZIPMAP_VALUE_TYPE => {
            Value::Hash(into_pairs("zipmap", decode_zipmap(blob)?)?.into_iter().collect())
        }
        LIST_ZIPLIST_VALUE_TYPE => Value::List(decode_ziplist(blob)?.into_iter().collect()),
        SET_INTSET_VALUE_TYPE => Value::Set(decode_intset(blob)?.into_iter().collect()),
        SET_LISTPACK_VALUE_TYPE => Value::Set(decode_listpack(blob)?.into_iter().collect()),
        HASH_ZIPLIST_VALUE_TYPE => {
            Value::Hash(into_pairs("ziplist", decode_ziplist(blob)?)?.into_iter().collect())
        }
        HASH_LISTPACK_VALUE_TYPE => {
            Value::Hash(into_pairs("listpack", decode_listpack(blob)?)?.into_iter().collect())
        }
        SORTED_SET_ZIPLIST_VALUE_TYPE | SORTED_SET_LISTPACK_VALUE_TYPE => {
            let (container, entries) = if value_type == SORTED_SET_ZIPLIST_VALUE_TYPE {
                ("ziplist", decode_ziplist(blob)?)
            } else {
                ("listpack", decode_listpack(blob)?)
            };

            let mut zset = SortedSet::new();
            for (member, score) in into_pairs(container, entries)? {
                let score = std::str::from_utf8(&score)
                    .ok()
                    .and_then(parse_score)
                    .ok_or(SnapshotError::InvalidScore)?;
                zset.insert(member, score);
            }
            Value::SortedSet(zset)
        }
        other => return Err(SnapshotError::UnsupportedType(other)),
    };

    Ok(value)
}

/// Reads a count followed by `count * group` strings.
fn parse_string_sequence(
    bytes: &[u8],
    cursor: usize,
    group: usize,
) -> Result<(Vec<Bytes>, usize), SnapshotError> {
    let mut temp_cursor = cursor;
    let (count, read) = parse_length(bytes, temp_cursor)?;
    temp_cursor += read;

    let total = count
        .checked_mul(group)
        .ok_or(SnapshotError::InvalidLengthEncoding(bytes[cursor]))?;

    // Each string takes at least one byte, so the count cannot exceed the
    // bytes left; avoids a huge allocation on a corrupt length.
    let mut items = Vec::with_capacity(total.min(bytes.len().saturating_sub(temp_cursor)));
    for _ in 0..total {
        let (item, read) = parse_string(bytes, temp_cursor)?;
        temp_cursor += read;
        items.push(item);
    }

    Ok((items, temp_cursor - cursor))
}

/// Scores in type 3 sorted sets: a one byte length then ASCII text, with
/// three reserved lengths for the non-finite values.
fn parse_text_score(bytes: &[u8], cursor: usize) -> Result<(f64, usize), SnapshotError> {
    match get_buffer_slice(bytes, cursor, 1)?[0] {
        SCORE_NAN => Err(SnapshotError::InvalidScore),
        SCORE_POSITIVE_INFINITY => Ok((f64::INFINITY, 1)),
        SCORE_NEGATIVE_INFINITY => Ok((f64::NEG_INFINITY, 1)),
        length => {
            let text = get_buffer_slice(bytes, cursor + 1, length as usize)?;
            let score = std::str::from_utf8(text)
                .ok()
                .and_then(parse_score)
                .ok_or(SnapshotError::InvalidScore)?;
            Ok((score, 1 + length as usize))
        }
    }
}

pub fn write_text_score(out: &mut BytesMut, score: f64) {
    if score == f64::INFINITY {
        out.put_u8(SCORE_POSITIVE_INFINITY);
    } else if score == f64::NEG_INFINITY {
        out.put_u8(SCORE_NEGATIVE_INFINITY);
    } else {
        let mut text = format_score(score);
        if text.len() >= SCORE_NAN as usize {
            text = format!("{:e}", score);
        }
        out.put_u8(text.len() as u8);
        out.put_slice(text.as_bytes());
    }
}

/// The plain type byte a value is written with.
pub fn value_type_of(value: &Value) -> u8 {
    match value {
        Value::String(_) => STRING_VALUE_TYPE,
        Value::List(_) => LIST_VALUE_TYPE,
        Value::Set(_) => SET_VALUE_TYPE,
        Value::SortedSet(_) => SORTED_SET_VALUE_TYPE,
        Value::Hash(_) => HASH_VALUE_TYPE,
    }
}
