//! Human-readable rendering of encoded keys and cell values for logs and
//! error messages.

use itertools::Itertools as _;

use super::keycode;

/// Formats encoded keys.
pub trait Formatter {
    /// Formats a key.
    fn key(key: &[u8]) -> String;
}

/// Formats raw byte slices without any decoding.
pub struct Raw;

impl Raw {
    /// Formats raw bytes as escaped ASCII strings.
    pub fn bytes(bytes: &[u8]) -> String {
        let escaped = bytes
            .iter()
            .copied()
            .flat_map(std::ascii::escape_default)
            .collect_vec();
        format!("\"{}\"", String::from_utf8_lossy(&escaped))
    }
}

impl Formatter for Raw {
    fn key(key: &[u8]) -> String {
        Self::bytes(key)
    }
}

/// Formats global-order keys as their component list, e.g. `(0,1|1,3)`
/// where the tile components precede the bar. Falls back to [`Raw`] for
/// bytes that are not a key.
pub struct OrderKey {
    dims: usize,
}

impl OrderKey {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    pub fn format(&self, key: &[u8]) -> String {
        let Ok(components) = keycode::decode_u64s(key) else {
            return Raw::key(key);
        };
        if components.len() != self.dims * 2 {
            return format!("({})", components.iter().join(","));
        }
        let (tile, cell) = components.split_at(self.dims);
        format!("({}|{})", tile.iter().join(","), cell.iter().join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_key_format() {
        let key = keycode::encode_u64s(&[0, 1, 1, 3]);
        assert_eq!(OrderKey::new(2).format(&key), "(0,1|1,3)");
    }

    #[test]
    fn test_raw_fallback() {
        assert_eq!(OrderKey::new(2).format(b"ab\x01"), "\"ab\\x01\"");
    }
}
