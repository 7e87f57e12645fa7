use super::metadata::{FragmentMetadata, TileMeta};
use super::tile::{self, NoopFilter};
use super::{attribute_file, attribute_var_file, dimension_file, TIMESTAMPS_FILE};
use crate::array::{ArraySchema, Cell, CellSize};
use crate::error::Result;
use crate::Error;

use rayon::prelude::*;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug)]
enum AttributeData {
    Fixed { size: usize, data: Vec<u8> },
    Var { offsets: Vec<u64>, data: Vec<u8> },
}

impl AttributeData {
    fn len(&self) -> usize {
        match self {
            AttributeData::Fixed { size, data } => data.len() / size,
            AttributeData::Var { offsets, .. } => offsets.len(),
        }
    }

    fn value(&self, cell: usize) -> &[u8] {
        match self {
            AttributeData::Fixed { size, data } => &data[cell * size..(cell + 1) * size],
            AttributeData::Var { offsets, data } => {
                let start = offsets[cell] as usize;
                let end = offsets
                    .get(cell + 1)
                    .map_or(data.len(), |&next| next as usize);
                &data[start..end]
            }
        }
    }
}

/// One decoded data tile.
#[derive(Debug)]
pub struct Tile {
    cell_count: usize,
    keys: Vec<Vec<u8>>,
    coords: Vec<Vec<u64>>,
    attributes: Vec<AttributeData>,
    timestamps: Option<Vec<u64>>,
    default_timestamp: u64,
}

impl Tile {
    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    pub fn key(&self, cell: usize) -> &[u8] {
        &self.keys[cell]
    }

    pub fn coord(&self, dim: usize, cell: usize) -> u64 {
        self.coords[dim][cell]
    }

    pub fn coords(&self, cell: usize) -> Vec<u64> {
        self.coords.iter().map(|dim| dim[cell]).collect()
    }

    pub fn value(&self, attr: usize, cell: usize) -> &[u8] {
        self.attributes[attr].value(cell)
    }

    /// Per-cell write time, or the fragment's end time when the fragment
    /// carries no timestamp file.
    pub fn timestamp(&self, cell: usize) -> u64 {
        self.timestamps
            .as_ref()
            .map_or(self.default_timestamp, |stamps| stamps[cell])
    }

    pub fn cell(&self, cell: usize) -> Cell {
        Cell {
            coords: self.coords(cell),
            values: (0..self.attributes.len())
                .map(|attr| self.value(attr, cell).to_vec())
                .collect(),
            timestamp: self.timestamp(cell),
        }
    }
}

/// Random access to the tiles of one committed fragment.
#[derive(Debug, Clone)]
pub struct FragmentReader {
    uri: PathBuf,
    schema: Arc<ArraySchema>,
    metadata: Arc<FragmentMetadata>,
}

impl FragmentReader {
    pub fn new(uri: PathBuf, schema: Arc<ArraySchema>, metadata: Arc<FragmentMetadata>) -> Self {
        Self {
            uri,
            schema,
            metadata,
        }
    }

    pub fn uri(&self) -> &Path {
        &self.uri
    }

    pub fn metadata(&self) -> &FragmentMetadata {
        &self.metadata
    }

    pub fn tile_count(&self) -> usize {
        self.metadata.tiles.len()
    }

    pub fn tile_meta(&self, tile: usize) -> &TileMeta {
        &self.metadata.tiles[tile]
    }

    /// Read and decode one tile; the per-field files are read in parallel.
    ///
    /// A tile whose payloads do not decode to `cell_count` cells of in-domain
    /// coordinates fails with [`Error::Merge`] naming the fragment.
    pub fn load_tile(&self, tile: usize) -> Result<Tile> {
        let meta = self.metadata.tiles.get(tile).ok_or_else(|| {
            Error::InvalidOperation(format!(
                "tile {} out of range for fragment {}",
                tile,
                self.uri.display()
            ))
        })?;
        if meta.offsets.len() != self.metadata.files.len() {
            return Err(self.corrupt(
                tile,
                format!(
                    "{} tile offsets for {} files",
                    meta.offsets.len(),
                    self.metadata.files.len()
                ),
            ));
        }
        let cell_count = meta.cell_count as usize;

        let payloads = self
            .metadata
            .files
            .par_iter()
            .zip(meta.offsets.par_iter())
            .map(|(file, &offset)| {
                let mut reader = BufReader::new(File::open(self.uri.join(file))?);
                tile::read_tile(&mut reader, offset, &NoopFilter)
            })
            .collect::<Result<Vec<Vec<u8>>>>()
            .map_err(|e| match e {
                Error::IoError(err) if err.kind() != io::ErrorKind::UnexpectedEof => {
                    Error::IoError(err)
                }
                e => self.corrupt(tile, e),
            })?;

        let coords = (0..self.schema.dim_num())
            .map(|dim| {
                let file = dimension_file(dim);
                let values = self.decode_u64s(tile, &payloads, &file)?;
                self.check_len(tile, values.len(), cell_count, &file)?;
                Ok(values)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut attributes = Vec::with_capacity(self.schema.attribute_num());
        for (i, attr) in self.schema.attributes.iter().enumerate() {
            let file = attribute_file(i);
            let decoded = match attr.cell_size {
                CellSize::Fixed(size) => AttributeData::Fixed {
                    size: size as usize,
                    data: self.payload(tile, &payloads, &file)?.to_vec(),
                },
                CellSize::Var => {
                    let offsets = self.decode_u64s(tile, &payloads, &file)?;
                    let data = self.payload(tile, &payloads, &attribute_var_file(i))?;
                    self.check_offsets(tile, &file, &offsets, data.len())?;
                    AttributeData::Var {
                        offsets,
                        data: data.to_vec(),
                    }
                }
            };
            self.check_len(tile, decoded.len(), cell_count, &file)?;
            attributes.push(decoded);
        }

        let timestamps = if self.metadata.has_timestamps {
            let stamps = self.decode_u64s(tile, &payloads, TIMESTAMPS_FILE)?;
            self.check_len(tile, stamps.len(), cell_count, TIMESTAMPS_FILE)?;
            Some(stamps)
        } else {
            None
        };

        let mut keys = Vec::with_capacity(cell_count);
        for cell in 0..cell_count {
            let point: Vec<u64> = coords.iter().map(|dim| dim[cell]).collect();
            self.schema
                .check_coords(&point)
                .map_err(|e| self.corrupt(tile, format!("cell {}: {}", cell, e)))?;
            keys.push(self.schema.order_key(&point));
        }

        Ok(Tile {
            cell_count,
            keys,
            coords,
            attributes,
            timestamps,
            default_timestamp: self.metadata.timestamp_range.1,
        })
    }

    /// Every cell of the fragment in stored order.
    pub fn read_all(&self) -> Result<Vec<Cell>> {
        let mut cells = Vec::with_capacity(self.metadata.cell_count as usize);
        for i in 0..self.tile_count() {
            let tile = self.load_tile(i)?;
            cells.extend((0..tile.cell_count()).map(|cell| tile.cell(cell)));
        }
        Ok(cells)
    }

    fn payload<'p>(&self, tile: usize, payloads: &'p [Vec<u8>], file: &str) -> Result<&'p [u8]> {
        self.metadata
            .file_index(file)
            .and_then(|i| payloads.get(i))
            .map(|p| p.as_slice())
            .ok_or_else(|| self.corrupt(tile, format!("no file {}", file)))
    }

    fn decode_u64s(&self, tile: usize, payloads: &[Vec<u8>], file: &str) -> Result<Vec<u64>> {
        tile::decode_u64s(self.payload(tile, payloads, file)?)
            .map_err(|e| self.corrupt(tile, format!("{}: {}", file, e)))
    }

    fn check_len(&self, tile: usize, actual: usize, expected: usize, file: &str) -> Result<()> {
        if actual != expected {
            return Err(self.corrupt(
                tile,
                format!("{} holds {} cells, expected {}", file, actual, expected),
            ));
        }
        Ok(())
    }

    /// Var offsets must be non-decreasing starts into a `data_len` byte file.
    fn check_offsets(
        &self,
        tile: usize,
        file: &str,
        offsets: &[u64],
        data_len: usize,
    ) -> Result<()> {
        let mut previous = 0;
        for (cell, &offset) in offsets.iter().enumerate() {
            if offset < previous || offset > data_len as u64 {
                return Err(self.corrupt(
                    tile,
                    format!(
                        "{} offset {} of cell {} is outside [{}, {}]",
                        file, offset, cell, previous, data_len
                    ),
                ));
            }
            previous = offset;
        }
        Ok(())
    }

    fn corrupt(&self, tile: usize, reason: impl std::fmt::Display) -> Error {
        Error::Merge(format!(
            "tile {} of fragment {} is corrupt: {}",
            tile,
            self.uri.display(),
            reason
        ))
    }
}
