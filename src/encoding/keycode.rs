//! Order-preserving encoding of global-order keys.
//!
//! A key is a sequence of `u64` components (tile coordinates followed by cell
//! coordinates, already permuted into the schema's tile and cell order). Each
//! component is written big-endian, so comparing two encoded keys byte by byte
//! gives the same answer as comparing the component sequences
//! lexicographically. All keys of one array have the same length.

use super::EncodingError;
use crate::error::Result;

const COMPONENT_SIZE: usize = 8;

/// Append one component to a key under construction.
fn push_u64(key: &mut Vec<u8>, value: u64) {
    key.extend_from_slice(&value.to_be_bytes());
}

/// Encode a sequence of components into a key.
pub fn encode_u64s(components: &[u64]) -> Vec<u8> {
    let mut key = Vec::with_capacity(components.len() * COMPONENT_SIZE);
    for &component in components {
        push_u64(&mut key, component);
    }
    key
}

/// Decode a key back into its components.
pub fn decode_u64s(bytes: &[u8]) -> Result<Vec<u64>> {
    if bytes.len() % COMPONENT_SIZE != 0 {
        return Err(EncodingError::InvalidFormat(format!(
            "key of {} bytes is not a whole number of components",
            bytes.len()
        ))
        .into());
    }

    bytes
        .chunks_exact(COMPONENT_SIZE)
        .map(|chunk| {
            let array: [u8; COMPONENT_SIZE] = chunk
                .try_into()
                .map_err(|_| EncodingError::InvalidFormat("bad key component".to_string()))?;
            Ok(u64::from_be_bytes(array))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_order_matches_component_order() {
        let cases = [
            (vec![0, 5], vec![1, 0]),
            (vec![1, 255], vec![1, 256]),
            (vec![7, u64::MAX - 1], vec![7, u64::MAX]),
            (vec![2, 1, 9], vec![2, 2, 0]),
        ];

        for (smaller, larger) in cases {
            assert!(
                encode_u64s(&smaller) < encode_u64s(&larger),
                "{:?} should sort before {:?}",
                smaller,
                larger
            );
        }
    }

    #[test]
    fn test_decode() {
        let key = encode_u64s(&[3, 0, u64::MAX]);
        assert_eq!(key.len(), 24);
        assert_eq!(decode_u64s(&key).unwrap(), vec![3, 0, u64::MAX]);
    }

    #[test]
    fn test_decode_truncated() {
        let mut key = encode_u64s(&[1, 2]);
        key.pop();
        assert!(decode_u64s(&key).is_err());
    }
}
