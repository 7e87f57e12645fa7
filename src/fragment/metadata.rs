//! Fragment metadata file.
//!
//! ```text
//! +---------------+-------------+-------------------------------+-----------+
//! | magic: 8 bytes| version: u32| body (big-endian, see encode) | crc32: u32|
//! +---------------+-------------+-------------------------------+-----------+
//! ```
//!
//! The checksum covers everything before it. The file is written with a
//! temp-file rename so it is either absent or complete.

use super::{write_atomic, METADATA_FILE};
use crate::error::Result;
use crate::Error;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::io::{Cursor, Read};
use std::path::Path;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const MAGIC: &[u8; 8] = b"FRAGMETA";
const VERSION: u32 = 1;

/// Per-tile bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct TileMeta {
    pub cell_count: u64,
    /// Estimated bytes once decoded; charged against the read budget.
    pub memory_size: u64,
    pub first_key: Vec<u8>,
    pub last_key: Vec<u8>,
    /// Header offset of this tile in each file listed in `FragmentMetadata::files`.
    pub offsets: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FragmentMetadata {
    pub timestamp_range: (u64, u64),
    pub format_version: u32,
    pub has_timestamps: bool,
    pub cell_count: u64,
    /// Total bytes of the fragment's tile files.
    pub size: u64,
    /// Inclusive bounding box of all coordinates, per dimension.
    pub non_empty_domain: Vec<(u64, u64)>,
    pub files: Vec<String>,
    pub tiles: Vec<TileMeta>,
}

impl TileMeta {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u64::<BigEndian>(self.cell_count)?;
        buf.write_u64::<BigEndian>(self.memory_size)?;
        write_bytes(buf, &self.first_key)?;
        write_bytes(buf, &self.last_key)?;
        buf.write_u32::<BigEndian>(self.offsets.len() as u32)?;
        for offset in &self.offsets {
            buf.write_u64::<BigEndian>(*offset)?;
        }
        Ok(())
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let cell_count = cursor.read_u64::<BigEndian>()?;
        let memory_size = cursor.read_u64::<BigEndian>()?;
        let first_key = read_bytes(cursor)?;
        let last_key = read_bytes(cursor)?;
        let offset_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut offsets = Vec::with_capacity(offset_count);
        for _ in 0..offset_count {
            offsets.push(cursor.read_u64::<BigEndian>()?);
        }

        Ok(TileMeta {
            cell_count,
            memory_size,
            first_key,
            last_key,
            offsets,
        })
    }
}

impl FragmentMetadata {
    pub fn file_index(&self, file: &str) -> Option<usize> {
        self.files.iter().position(|f| f == file)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.write_u32::<BigEndian>(VERSION)?;

        buf.write_u64::<BigEndian>(self.timestamp_range.0)?;
        buf.write_u64::<BigEndian>(self.timestamp_range.1)?;
        buf.write_u32::<BigEndian>(self.format_version)?;
        buf.write_u8(self.has_timestamps as u8)?;
        buf.write_u64::<BigEndian>(self.cell_count)?;
        buf.write_u64::<BigEndian>(self.size)?;

        buf.write_u32::<BigEndian>(self.non_empty_domain.len() as u32)?;
        for (lo, hi) in &self.non_empty_domain {
            buf.write_u64::<BigEndian>(*lo)?;
            buf.write_u64::<BigEndian>(*hi)?;
        }

        buf.write_u32::<BigEndian>(self.files.len() as u32)?;
        for file in &self.files {
            write_bytes(&mut buf, file.as_bytes())?;
        }

        buf.write_u32::<BigEndian>(self.tiles.len() as u32)?;
        for tile in &self.tiles {
            tile.encode_into(&mut buf)?;
        }

        let checksum = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(checksum)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MAGIC.len() + 8 {
            return Err(Error::InvalidData("fragment metadata is truncated".to_string()));
        }
        let (body, footer) = bytes.split_at(bytes.len() - 4);
        let stored = (&footer[..]).read_u32::<BigEndian>()?;
        if CRC32.checksum(body) != stored {
            return Err(Error::ChecksumMismatch);
        }

        let mut cursor = Cursor::new(body);
        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::InvalidData(
                "invalid fragment metadata magic".to_string(),
            ));
        }
        let version = cursor.read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::InvalidData(format!(
                "unsupported fragment metadata version {}",
                version
            )));
        }

        let lo = cursor.read_u64::<BigEndian>()?;
        let hi = cursor.read_u64::<BigEndian>()?;
        let format_version = cursor.read_u32::<BigEndian>()?;
        let has_timestamps = cursor.read_u8()? != 0;
        let cell_count = cursor.read_u64::<BigEndian>()?;
        let size = cursor.read_u64::<BigEndian>()?;

        let dim_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut non_empty_domain = Vec::with_capacity(dim_count);
        for _ in 0..dim_count {
            let lo = cursor.read_u64::<BigEndian>()?;
            let hi = cursor.read_u64::<BigEndian>()?;
            non_empty_domain.push((lo, hi));
        }

        let file_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut files = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            let raw = read_bytes(&mut cursor)?;
            files.push(String::from_utf8(raw).map_err(|_| {
                Error::InvalidData("fragment file name is not UTF-8".to_string())
            })?);
        }

        let tile_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut tiles = Vec::with_capacity(tile_count);
        for _ in 0..tile_count {
            let tile = TileMeta::decode_from(&mut cursor)?;
            if tile.offsets.len() != files.len() {
                return Err(Error::InvalidData(format!(
                    "tile has {} offsets for {} files",
                    tile.offsets.len(),
                    files.len()
                )));
            }
            tiles.push(tile);
        }

        Ok(FragmentMetadata {
            timestamp_range: (lo, hi),
            format_version,
            has_timestamps,
            cell_count,
            size,
            non_empty_domain,
            files,
            tiles,
        })
    }

    pub fn store(&self, fragment_dir: &Path) -> Result<()> {
        write_atomic(&fragment_dir.join(METADATA_FILE), &self.encode()?)
    }

    pub fn load(fragment_dir: &Path) -> Result<Self> {
        let bytes = std::fs::read(fragment_dir.join(METADATA_FILE))?;
        Self::decode(&bytes)
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    buf.write_u32::<BigEndian>(bytes.len() as u32)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(Error::InvalidData(format!(
            "length {} runs past the end of fragment metadata",
            len
        )));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}
