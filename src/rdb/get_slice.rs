use super::SnapshotError;

/// Borrows `len` bytes of `buffer` starting at `cursor`.
pub fn get_buffer_slice(buffer: &[u8], cursor: usize, len: usize) -> Result<&[u8], SnapshotError> {
    match cursor.checked_add(len) {
        Some(end) if end <= buffer.len() => Ok(&buffer[cursor..end]),
        _ => Err(SnapshotError::UnexpectedEof {
            cursor,
            needed: len.saturating_sub(buffer.len().saturating_sub(cursor)),
        }),
    }
}

/// Reads exactly `N` bytes starting at `cursor` as an array.
pub fn get_buffer_array<const N: usize>(
    buffer: &[u8],
    cursor: usize,
) -> Result<[u8; N], SnapshotError> {
    let mut array = [0u8; N];
    array.copy_from_slice(get_buffer_slice(buffer, cursor, N)?);
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_buffer_slice_bounds() {
        let buffer = [1, 2, 3, 4];

        assert_eq!(get_buffer_slice(&buffer, 1, 2).unwrap(), &[2, 3]);
        assert_eq!(get_buffer_slice(&buffer, 4, 0).unwrap(), &[] as &[u8]);
        assert!(matches!(
            get_buffer_slice(&buffer, 3, 2),
            Err(SnapshotError::UnexpectedEof { cursor: 3, needed: 1 })
        ));
        assert!(get_buffer_slice(&buffer, usize::MAX, 2).is_err());
        assert_eq!(get_buffer_array::<2>(&buffer, 2).unwrap(), [3, 4]);
    }
}
