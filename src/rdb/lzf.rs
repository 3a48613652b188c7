//! LZF block compression, byte compatible with liblzf as used by Redis.
//!
//! A stream is a sequence of chunks, each introduced by a control byte:
//!
//! * `000LLLLL` - a literal run of `L + 1` bytes follows
//! * `LLLooooo oooooooo` - copy `L + 2` bytes from `o + 1` bytes back
//! * `111ooooo LLLLLLLL oooooooo` - same, with a length of `L + 9`

use super::SnapshotError;

const HASH_LOG: usize = 14;
const MAX_LITERAL: usize = 32;
const MAX_OFFSET: usize = 1 << 13;
const MAX_REFERENCE: usize = (1 << 8) + (1 << 3);
// Longest output one input byte can produce: a 3-byte back-reference.
const MAX_EXPANSION: usize = MAX_REFERENCE / 3;

/// Expands `input` into exactly `expected_len` bytes.
///
/// Every literal run and back-reference is bounds checked; a stream that
/// would read before the start of the output, run past its input, or
/// produce a different length is rejected. So is a declared length the
/// input could never expand to, before anything is allocated.
pub fn decompress(input: &[u8], expected_len: usize) -> Result<Vec<u8>, SnapshotError> {
    if expected_len > input.len().saturating_mul(MAX_EXPANSION) {
        return Err(SnapshotError::InvalidLzf("declared length exceeds what the input can produce"));
    }

    let mut output = Vec::with_capacity(expected_len);
    let mut cursor = 0;

    while cursor < input.len() {
        let control = input[cursor] as usize;
        cursor += 1;

        if control < MAX_LITERAL {
            let length = control + 1;
            let literal = input
                .get(cursor..cursor + length)
                .ok_or(SnapshotError::InvalidLzf("literal run past end of input"))?;

            if output.len() + length > expected_len {
                return Err(SnapshotError::InvalidLzf("output longer than declared"));
            }

            output.extend_from_slice(literal);
            cursor += length;
            continue;
        }

        let mut length = control >> 5;
        if length == 7 {
            length += *input
                .get(cursor)
                .ok_or(SnapshotError::InvalidLzf("truncated back-reference"))?
                as usize;
            cursor += 1;
        }
        length += 2;

        let low = *input
            .get(cursor)
            .ok_or(SnapshotError::InvalidLzf("truncated back-reference"))? as usize;
        cursor += 1;

        let distance = ((control & 0x1f) << 8) + low + 1;
        if distance > output.len() {
            return Err(SnapshotError::InvalidLzf("back-reference before start of output"));
        }
        if output.len() + length > expected_len {
            return Err(SnapshotError::InvalidLzf("output longer than declared"));
        }

        // Byte by byte: source and destination may overlap.
        let start = output.len() - distance;
        for i in 0..length {
            output.push(output[start + i]);
        }
    }

    if output.len() != expected_len {
        return Err(SnapshotError::InvalidLzf("output shorter than declared"));
    }

    Ok(output)
}

/// Compresses `input`. The result may be larger than the input for data
/// without repetition; callers decide whether it is worth storing.
pub fn compress(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() + input.len() / MAX_LITERAL + 1);
    let mut table = vec![usize::MAX; 1 << HASH_LOG];
    let mut literal_start = 0;
    let mut cursor = 0;

    while cursor + 2 < input.len() {
        let slot = hash(&input[cursor..cursor + 3]);
        let candidate = table[slot];
        table[slot] = cursor;

        let is_match = candidate != usize::MAX
            && cursor - candidate <= MAX_OFFSET
            && input[candidate..candidate + 3] == input[cursor..cursor + 3];

        if !is_match {
            cursor += 1;
            continue;
        }

        let max_length = MAX_REFERENCE.min(input.len() - cursor);
        let mut length = 3;
        while length < max_length && input[candidate + length] == input[cursor + length] {
            length += 1;
        }

        push_literals(&mut output, &input[literal_start..cursor]);

        let offset = cursor - candidate - 1;
        let encoded = length - 2;
        if encoded < 7 {
            output.push(((encoded << 5) | (offset >> 8)) as u8);
        } else {
            output.push(((7 << 5) | (offset >> 8)) as u8);
            output.push((encoded - 7) as u8);
        }
        output.push((offset & 0xff) as u8);

        cursor += length;
        literal_start = cursor;
    }

    push_literals(&mut output, &input[literal_start..]);
    output
}

fn push_literals(output: &mut Vec<u8>, literals: &[u8]) {
    for run in literals.chunks(MAX_LITERAL) {
        output.push((run.len() - 1) as u8);
        output.extend_from_slice(run);
    }
}

fn hash(bytes: &[u8]) -> usize {
    let value = (bytes[0] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[2] as u32;
    (value.wrapping_mul(2_654_435_761) >> (32 - HASH_LOG)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decompress_literal_and_back_reference() {
        let compressed = [0x02, b'a', b'b', b'c', 0x20, 0x02];
        assert_eq!(decompress(&compressed, 6).unwrap(), b"abcabc");

        // Overlapping copy: one literal then seven bytes from one back.
        let compressed = [0x00, b'z', 0xA0, 0x00];
        assert_eq!(decompress(&compressed, 8).unwrap(), b"zzzzzzzz");
    }

    #[test]
    fn test_decompress_rejects_corrupt_streams() {
        let test_cases: Vec<(Vec<u8>, usize)> = vec![
            (vec![0x00, b'a', 0x20, 0x05], 4),
            (vec![0x05, b'a', b'b'], 6),
            (vec![0x01, b'a', b'b'], 1),
            (vec![0x01, b'a', b'b'], 5),
            (vec![0x00, b'a', 0xE0], 12),
        ];

        for (input, expected_len) in test_cases {
            assert!(
                matches!(decompress(&input, expected_len), Err(SnapshotError::InvalidLzf(_))),
                "{:?}",
                input
            );
        }
    }

    #[test]
    fn test_decompress_rejects_impossible_declared_length() {
        let test_cases: Vec<(Vec<u8>, usize)> = vec![
            (vec![0x00], usize::MAX),
            (vec![0x00, b'a'], 2 * MAX_EXPANSION + 1),
            (vec![], 1),
        ];

        for (input, expected_len) in test_cases {
            assert!(
                matches!(decompress(&input, expected_len), Err(SnapshotError::InvalidLzf(_))),
                "{:?} {}",
                input,
                expected_len
            );
        }

        // The longest single back-reference is still accepted.
        let compressed = [0x00, b'r', 0xE0, 0xFF, 0x00];
        let expected = vec![b'r'; 1 + MAX_REFERENCE];
        assert!(expected.len() <= compressed.len() * MAX_EXPANSION);
        assert_eq!(decompress(&compressed, expected.len()).unwrap(), expected);
    }

    #[test]
    fn test_compress_output_decompresses() {
        let long_run = vec![b'x'; 1_000];
        let mixed: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();

        let test_cases: Vec<&[u8]> = vec![
            &b""[..],
            &b"ab"[..],
            &b"hello hello hello hello hello"[..],
            long_run.as_slice(),
            mixed.as_slice(),
        ];

        for input in test_cases {
            let compressed = compress(input);
            assert_eq!(decompress(&compressed, input.len()).unwrap(), input);
        }

        assert!(compress(&long_run).len() < 30);
    }
}
