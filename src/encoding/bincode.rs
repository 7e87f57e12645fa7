use super::EncodingError;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| EncodingError::InvalidFormat(format!("Serialization failed: {}", e)).into())
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| EncodingError::InvalidFormat(format!("Deserialization failed: {}", e)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Domain {
        name: String,
        lo: u64,
        hi: u64,
        extent: Option<u64>,
    }

    #[test]
    fn test_serialize_deserialize() {
        let original = Domain {
            name: "d1".to_string(),
            lo: 1,
            hi: 4,
            extent: Some(2),
        };

        let serialized = serialize(&original).unwrap();
        let deserialized: Domain = deserialize(&serialized).unwrap();

        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_truncated_bytes() {
        let original = Domain {
            name: "d2".to_string(),
            lo: 1,
            hi: 4,
            extent: Some(2),
        };
        let mut buffer = serialize(&original).unwrap();
        buffer.truncate(buffer.len() - 3);

        let result: Result<Domain> = deserialize(&buffer);
        assert!(matches!(result, Err(crate::Error::InvalidData(_))));
    }

    #[test]
    fn test_invalid_data() {
        let invalid_data = vec![0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<String> = deserialize(&invalid_data);
        assert!(result.is_err());
    }
}
