/// One sparse cell: coordinates, one value per attribute, and the time it was
/// written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub coords: Vec<u64>,
    /// Raw little-endian bytes per attribute, in schema order.
    pub values: Vec<Vec<u8>>,
    /// Write time. Assigned from the fragment when a write is committed.
    pub timestamp: u64,
}

impl Cell {
    pub fn new(coords: Vec<u64>) -> Self {
        Self {
            coords,
            values: Vec::new(),
            timestamp: 0,
        }
    }

    /// Append the next attribute value.
    pub fn with_value<V: FixedValue>(mut self, value: V) -> Self {
        self.values.push(value.to_bytes());
        self
    }

    /// Append the next attribute value as raw bytes (var-sized attributes).
    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.values.push(bytes.into());
        self
    }
}

/// Plain values that map to a fixed number of little-endian bytes.
pub trait FixedValue: Copy {
    const SIZE: usize;

    fn to_bytes(self) -> Vec<u8>;

    fn from_bytes(bytes: &[u8]) -> Self;
}

macro_rules! fixed_value {
    ($($t:ty),*) => {
        $(
            impl FixedValue for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn to_bytes(self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }

                fn from_bytes(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_le_bytes(raw)
                }
            }
        )*
    };
}

fixed_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Decode a buffer of packed fixed-size values.
pub fn decode_values<V: FixedValue>(bytes: &[u8]) -> Vec<V> {
    bytes.chunks_exact(V::SIZE).map(V::from_bytes).collect()
}
