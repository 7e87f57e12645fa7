//! Tile files.
//!
//! Every per-field file of a fragment, including the per-cell timestamp file,
//! uses the same little-endian layout:
//!
//! ```text
//! +----------------+
//! | num_tiles: u64 |
//! +----------------+-----------------------+---------------------+------------+-------------+
//! | filtered_size: u32 | unfiltered_size: u32 | metadata_size: u32 | metadata   | filtered    |
//! +--------------------+----------------------+--------------------+------------+-------------+
//! | ... one header and payload per tile                                                      |
//! +------------------------------------------------------------------------------------------+
//! ```
//!
//! Tiles run through a [`Filter`] on the way to disk. Metadata is always
//! empty. Offsets of each tile header are recorded in the fragment metadata
//! so any tile can be read without scanning.

use crate::error::Result;
use crate::Error;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const FILE_HEADER_SIZE: u64 = 8;
pub const TILE_HEADER_SIZE: u64 = 12;

/// Opaque transform applied to tile payloads (compression, checksums, ...).
pub trait Filter: Send + Sync {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decode(&self, data: Vec<u8>, unfiltered_size: usize) -> Result<Vec<u8>>;
}

/// Stores payloads unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFilter;

impl Filter for NoopFilter {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decode(&self, data: Vec<u8>, unfiltered_size: usize) -> Result<Vec<u8>> {
        if data.len() != unfiltered_size {
            return Err(Error::InvalidData(format!(
                "tile payload is {} bytes, expected {}",
                data.len(),
                unfiltered_size
            )));
        }
        Ok(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileHeader {
    pub filtered_size: u32,
    pub unfiltered_size: u32,
    pub metadata_size: u32,
}

impl TileHeader {
    fn decode_from(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            filtered_size: reader
                .read_u32::<LittleEndian>()
                .map_err(|e| Error::Decode("tile filtered size", e))?,
            unfiltered_size: reader
                .read_u32::<LittleEndian>()
                .map_err(|e| Error::Decode("tile unfiltered size", e))?,
            metadata_size: reader
                .read_u32::<LittleEndian>()
                .map_err(|e| Error::Decode("tile metadata size", e))?,
        })
    }
}

/// Appends tiles to a new tile file.
pub struct TileWriter<F: Filter = NoopFilter> {
    writer: BufWriter<File>,
    path: PathBuf,
    offset: u64,
    num_tiles: u64,
    filter: F,
}

impl TileWriter<NoopFilter> {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_filter(path, NoopFilter)
    }
}

impl<F: Filter> TileWriter<F> {
    pub fn with_filter(path: impl Into<PathBuf>, filter: F) -> Result<Self> {
        let path = path.into();
        let mut writer = BufWriter::new(File::create(&path)?);
        // Patched with the real count in finish().
        writer.write_u64::<LittleEndian>(0)?;

        Ok(Self {
            writer,
            path,
            offset: FILE_HEADER_SIZE,
            num_tiles: 0,
            filter,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one tile and return the offset of its header.
    pub fn write_tile(&mut self, data: &[u8]) -> Result<u64> {
        let filtered = self.filter.encode(data)?;
        let filtered_size = u32::try_from(filtered.len())
            .map_err(|_| Error::InvalidOperation("tile exceeds 4GB".to_string()))?;
        let unfiltered_size = u32::try_from(data.len())
            .map_err(|_| Error::InvalidOperation("tile exceeds 4GB".to_string()))?;

        let offset = self.offset;
        self.writer.write_u32::<LittleEndian>(filtered_size)?;
        self.writer.write_u32::<LittleEndian>(unfiltered_size)?;
        self.writer.write_u32::<LittleEndian>(0)?;
        self.writer.write_all(&filtered)?;

        self.offset += TILE_HEADER_SIZE + filtered.len() as u64;
        self.num_tiles += 1;
        Ok(offset)
    }

    /// Write the tile count, sync, and return the file size.
    pub fn finish(self) -> Result<u64> {
        let mut file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_u64::<LittleEndian>(self.num_tiles)?;
        file.sync_all()?;
        Ok(self.offset)
    }
}

/// Read the tile whose header starts at `offset`.
pub fn read_tile<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    filter: &dyn Filter,
) -> Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(offset))?;
    let header = TileHeader::decode_from(reader)?;
    if header.metadata_size > 0 {
        reader.seek(SeekFrom::Current(header.metadata_size as i64))?;
    }
    let mut filtered = vec![0u8; header.filtered_size as usize];
    reader
        .read_exact(&mut filtered)
        .map_err(|e| Error::Decode("tile payload", e))?;
    filter.decode(filtered, header.unfiltered_size as usize)
}

/// Scan a whole tile file front to back.
pub fn read_all_tiles(path: &Path, filter: &dyn Filter) -> Result<Vec<(TileHeader, Vec<u8>)>> {
    let mut file = std::io::BufReader::new(File::open(path)?);
    let num_tiles = file
        .read_u64::<LittleEndian>()
        .map_err(|e| Error::Decode("tile count", e))?;

    let mut tiles = Vec::with_capacity(num_tiles as usize);
    for _ in 0..num_tiles {
        let header = TileHeader::decode_from(&mut file)?;
        let mut metadata = vec![0u8; header.metadata_size as usize];
        file.read_exact(&mut metadata)
            .map_err(|e| Error::Decode("tile metadata", e))?;
        let mut filtered = vec![0u8; header.filtered_size as usize];
        file.read_exact(&mut filtered)
            .map_err(|e| Error::Decode("tile payload", e))?;
        tiles.push((header, filter.decode(filtered, header.unfiltered_size as usize)?));
    }
    Ok(tiles)
}

pub fn encode_u64s(values: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 8);
    for &v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

pub fn decode_u64s(bytes: &[u8]) -> Result<Vec<u64>> {
    if bytes.len() % 8 != 0 {
        return Err(Error::InvalidData(format!(
            "{} bytes is not a whole number of u64 values",
            bytes.len()
        )));
    }
    let mut cursor = bytes;
    let mut values = Vec::with_capacity(bytes.len() / 8);
    while !cursor.is_empty() {
        values.push(cursor.read_u64::<LittleEndian>()?);
    }
    Ok(values)
}

/// Per-cell timestamps of every tile of a timestamp file.
pub fn read_timestamps(path: &Path) -> Result<Vec<Vec<u64>>> {
    read_all_tiles(path, &NoopFilter)?
        .into_iter()
        .map(|(_, data)| decode_u64s(&data))
        .collect()
}
