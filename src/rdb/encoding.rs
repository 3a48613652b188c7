//! Length and string encodings.
//!
//! The two most significant bits of the first byte select the form:
//!
//! | Bits | Meaning |
//! |------|---------|
//! | `00` | 6 bit length in the same byte |
//! | `01` | 14 bit length: 6 bits here plus the next byte |
//! | `10` | `0x80`: 32 bit big-endian length follows, `0x81`: 64 bit |
//! | `11` | "encoded value": an inline integer or an LZF string |

use bytes::{BufMut, Bytes, BytesMut};

use super::get_slice::{get_buffer_array, get_buffer_slice};
use super::{lzf, SnapshotError};

const LENGTH_6_BIT: u8 = 0b00;
const LENGTH_14_BIT: u8 = 0b01;
const LENGTH_32_BIT: u8 = 0x80;
const LENGTH_64_BIT: u8 = 0x81;
const ENCODED_VALUE: u8 = 0b11;

const ENCODING_INT8: u8 = 0;
const ENCODING_INT16: u8 = 1;
const ENCODING_INT32: u8 = 2;
const ENCODING_LZF: u8 = 3;

/// Strings at most this long are never worth compressing.
const MIN_COMPRESS_LENGTH: usize = 20;

#[derive(Debug, PartialEq)]
enum ValueEncoding {
    Length(usize),
    Int8,
    Int16,
    Int32,
    LzfCompressedString,
}

fn parse_length_encoding(bytes: &[u8], cursor: usize) -> Result<(ValueEncoding, usize), SnapshotError> {
    let first = get_buffer_slice(bytes, cursor, 1)?[0];

    match first >> 6 {
        LENGTH_6_BIT => Ok((ValueEncoding::Length((first & 0x3f) as usize), 1)),
        LENGTH_14_BIT => {
            let second = get_buffer_slice(bytes, cursor + 1, 1)?[0];
            let length = ((first as usize & 0x3f) << 8) | second as usize;
            Ok((ValueEncoding::Length(length), 2))
        }
        ENCODED_VALUE => {
            let encoding = match first & 0x3f {
                ENCODING_INT8 => ValueEncoding::Int8,
                ENCODING_INT16 => ValueEncoding::Int16,
                ENCODING_INT32 => ValueEncoding::Int32,
                ENCODING_LZF => ValueEncoding::LzfCompressedString,
                other => return Err(SnapshotError::UnknownStringEncoding(other)),
            };
            Ok((encoding, 1))
        }
        _ => match first {
            LENGTH_32_BIT => {
                let length = u32::from_be_bytes(get_buffer_array(bytes, cursor + 1)?);
                Ok((ValueEncoding::Length(length as usize), 5))
            }
            LENGTH_64_BIT => {
                let length = u64::from_be_bytes(get_buffer_array(bytes, cursor + 1)?);
                let length =
                    usize::try_from(length).map_err(|_| SnapshotError::InvalidLengthEncoding(first))?;
                Ok((ValueEncoding::Length(length), 9))
            }
            _ => Err(SnapshotError::InvalidLengthEncoding(first)),
        },
    }
}

/// Reads a plain length.
///
/// # Returns
///
/// * `Ok((length, bytes_read))`
/// * `Err(SnapshotError::InvalidLengthEncoding)` - The bytes hold an encoded
///   value rather than a length
pub fn parse_length(bytes: &[u8], cursor: usize) -> Result<(usize, usize), SnapshotError> {
    match parse_length_encoding(bytes, cursor)? {
        (ValueEncoding::Length(length), read) => Ok((length, read)),
        _ => Err(SnapshotError::InvalidLengthEncoding(bytes[cursor])),
    }
}

/// Reads a string in any of its encodings, returning its bytes and the
/// number of bytes consumed.
///
/// Inline integers are little-endian and signed, and come back as their
/// decimal text.
pub fn parse_string(bytes: &[u8], cursor: usize) -> Result<(Bytes, usize), SnapshotError> {
    let (encoding, header) = parse_length_encoding(bytes, cursor)?;
    let mut temp_cursor = cursor + header;

    let value = match encoding {
        ValueEncoding::Length(length) => {
            let slice = get_buffer_slice(bytes, temp_cursor, length)?;
            temp_cursor += length;
            Bytes::copy_from_slice(slice)
        }
        ValueEncoding::Int8 => {
            let value = i8::from_le_bytes(get_buffer_array(bytes, temp_cursor)?);
            temp_cursor += 1;
            Bytes::from(value.to_string())
        }
        ValueEncoding::Int16 => {
            let value = i16::from_le_bytes(get_buffer_array(bytes, temp_cursor)?);
            temp_cursor += 2;
            Bytes::from(value.to_string())
        }
        ValueEncoding::Int32 => {
            let value = i32::from_le_bytes(get_buffer_array(bytes, temp_cursor)?);
            temp_cursor += 4;
            Bytes::from(value.to_string())
        }
        ValueEncoding::LzfCompressedString => {
            let (compressed_length, read) = parse_length(bytes, temp_cursor)?;
            temp_cursor += read;
            let (length, read) = parse_length(bytes, temp_cursor)?;
            temp_cursor += read;

            let compressed = get_buffer_slice(bytes, temp_cursor, compressed_length)?;
            temp_cursor += compressed_length;
            Bytes::from(lzf::decompress(compressed, length)?)
        }
    };

    Ok((value, temp_cursor - cursor))
}

pub fn write_length(out: &mut BytesMut, length: usize) {
    if length < 1 << 6 {
        out.put_u8(length as u8);
    } else if length < 1 << 14 {
        out.put_u8((LENGTH_14_BIT << 6) | (length >> 8) as u8);
        out.put_u8((length & 0xff) as u8);
    } else if let Ok(length) = u32::try_from(length) {
        out.put_u8(LENGTH_32_BIT);
        out.put_u32(length);
    } else {
        out.put_u8(LENGTH_64_BIT);
        out.put_u64(length as u64);
    }
}

/// Writes a string using the most compact encoding available: an inline
/// integer when the bytes are the canonical decimal form of an `i32`,
/// otherwise LZF when `compress` is set and it saves space, otherwise raw.
pub fn write_string(out: &mut BytesMut, value: &[u8], compress: bool) {
    if let Some(integer) = as_inline_integer(value) {
        if let Ok(small) = i8::try_from(integer) {
            out.put_u8((ENCODED_VALUE << 6) | ENCODING_INT8);
            out.put_i8(small);
        } else if let Ok(medium) = i16::try_from(integer) {
            out.put_u8((ENCODED_VALUE << 6) | ENCODING_INT16);
            out.put_i16_le(medium);
        } else {
            out.put_u8((ENCODED_VALUE << 6) | ENCODING_INT32);
            out.put_i32_le(integer);
        }
        return;
    }

    if compress && value.len() > MIN_COMPRESS_LENGTH {
        let compressed = lzf::compress(value);
        if compressed.len() < value.len() {
            out.put_u8((ENCODED_VALUE << 6) | ENCODING_LZF);
            write_length(out, compressed.len());
            write_length(out, value.len());
            out.put_slice(&compressed);
            return;
        }
    }

    write_length(out, value.len());
    out.put_slice(value);
}

/// The integer `value` spells, if writing it back yields the same bytes.
fn as_inline_integer(value: &[u8]) -> Option<i32> {
    if value.is_empty() || value.len() > 11 {
        return None;
    }

    let integer = std::str::from_utf8(value).ok()?.parse::<i32>().ok()?;
    (integer.to_string().as_bytes() == value).then_some(integer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_length() {
        let test_cases: Vec<(Vec<u8>, (usize, usize))> = vec![
            (vec![0x0A], (10, 1)),
            (vec![0x3F], (63, 1)),
            (vec![0x42, 0xBC], (700, 2)),
            (vec![0x80, 0x00, 0x01, 0x00, 0x00], (65_536, 5)),
            (
                vec![0x81, 0, 0, 0, 0, 0, 0, 0x01, 0x00],
                (256, 9),
            ),
        ];

        for (input, expected) in test_cases {
            assert_eq!(parse_length(&input, 0).unwrap(), expected, "{:02X?}", input);
        }

        assert!(matches!(
            parse_length(&[0x82], 0),
            Err(SnapshotError::InvalidLengthEncoding(0x82))
        ));
        assert!(matches!(
            parse_length(&[0xC0, 0x01], 0),
            Err(SnapshotError::InvalidLengthEncoding(0xC0))
        ));
        assert!(matches!(
            parse_length(&[0x42], 0),
            Err(SnapshotError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_parse_encoded_strings() {
        let test_cases: Vec<(Vec<u8>, &str, usize)> = vec![
            (vec![0x05, b'm', b'a', b'n', b'g', b'o'], "mango", 6),
            (vec![0xC0, 0x7B], "123", 2),
            (vec![0xC0, 0xFF], "-1", 2),
            (vec![0xC1, 0x39, 0x30], "12345", 3),
            (vec![0xC2, 0x87, 0xD6, 0x12, 0x00], "1234567", 5),
            (vec![0xC2, 0xFF, 0xFF, 0xFF, 0xFF], "-1", 5),
            (vec![0xC3, 0x06, 0x06, 0x02, b'a', b'b', b'c', 0x20, 0x02], "abcabc", 9),
        ];

        for (input, expected, consumed) in test_cases {
            let (value, read) = parse_string(&input, 0).unwrap();
            assert_eq!(&value[..], expected.as_bytes(), "{:02X?}", input);
            assert_eq!(read, consumed);
        }

        assert!(matches!(
            parse_string(&[0xC4], 0),
            Err(SnapshotError::UnknownStringEncoding(4))
        ));
    }

    #[test]
    fn test_write_string_picks_compact_encoding() {
        let test_cases: Vec<(&str, Vec<u8>)> = vec![
            ("7", vec![0xC0, 0x07]),
            ("-200", vec![0xC1, 0x38, 0xFF]),
            ("100000", vec![0xC2, 0xA0, 0x86, 0x01, 0x00]),
            ("007", vec![0x03, b'0', b'0', b'7']),
            ("", vec![0x00]),
            ("abc", vec![0x03, b'a', b'b', b'c']),
        ];

        for (input, expected) in test_cases {
            let mut out = BytesMut::new();
            write_string(&mut out, input.as_bytes(), true);
            assert_eq!(&out[..], &expected[..], "{:?}", input);

            let (value, read) = parse_string(&out, 0).unwrap();
            assert_eq!(&value[..], input.as_bytes());
            assert_eq!(read, out.len());
        }
    }

    #[test]
    fn test_long_repetitive_strings_are_compressed() {
        let value = "abcdefgh".repeat(20);
        let mut out = BytesMut::new();
        write_string(&mut out, value.as_bytes(), true);

        assert_eq!(out[0], 0xC3);
        assert!(out.len() < value.len());
        assert_eq!(&parse_string(&out, 0).unwrap().0[..], value.as_bytes());

        let mut uncompressed = BytesMut::new();
        write_string(&mut uncompressed, value.as_bytes(), false);
        assert_eq!(uncompressed.len(), value.len() + 2);
    }

    #[test]
    fn test_write_length_boundaries() {
        for length in [0, 63, 64, 16_383, 16_384, u32::MAX as usize] {
            let mut out = BytesMut::new();
            write_length(&mut out, length);
            assert_eq!(parse_length(&out, 0).unwrap(), (length, out.len()));
        }
    }
}
