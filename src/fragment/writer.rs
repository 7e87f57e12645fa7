//! Writes a fragment from cells arriving in global order, then publishes it.
//!
//! Publication order matters for crash safety:
//!
//! 1. tile files and metadata are written and synced ([`FragmentWriter::finalize`])
//! 2. the vacuum list, if the fragment supersedes others ([`write_vacuum_list`])
//! 3. the commit marker, atomically ([`commit`])
//!
//! A crash before step 3 leaves an uncommitted directory readers ignore.

use super::metadata::{FragmentMetadata, TileMeta};
use super::tile::{self, TileWriter};
use super::{
    attribute_file, attribute_var_file, commit_uri, dimension_file, fragment_uri,
    remove_best_effort, supports_timestamps, sync_dir, vacuum_list_uri, write_atomic,
    FragmentName, COMMITS_DIR, FRAGMENTS_DIR, TIMESTAMPS_FILE,
};
use crate::array::{ArraySchema, Cell, CellSize};
use crate::error::Result;
use crate::Error;

use std::fs;
use std::path::{Path, PathBuf};

pub struct FragmentWriter<'a> {
    schema: &'a ArraySchema,
    dir: PathBuf,
    name: FragmentName,
    has_timestamps: bool,
    allow_equal_keys: bool,
    file_names: Vec<String>,
    files: Vec<TileWriter>,
    pending: Vec<Cell>,
    pending_keys: Vec<Vec<u8>>,
    last_key: Option<Vec<u8>>,
    tiles: Vec<TileMeta>,
    cell_count: u64,
    non_empty_domain: Vec<(u64, u64)>,
}

impl<'a> FragmentWriter<'a> {
    /// Create the fragment directory and its empty tile files.
    pub fn create(
        array: &Path,
        schema: &'a ArraySchema,
        name: FragmentName,
        has_timestamps: bool,
    ) -> Result<Self> {
        if has_timestamps && !supports_timestamps(name.version) {
            return Err(Error::InvalidOperation(format!(
                "format version {} cannot store per-cell timestamps",
                name.version
            )));
        }

        fs::create_dir_all(array.join(FRAGMENTS_DIR))?;
        let dir = fragment_uri(array, &name);
        fs::create_dir(&dir)?;

        let mut file_names: Vec<String> = (0..schema.dim_num()).map(dimension_file).collect();
        for (i, attr) in schema.attributes.iter().enumerate() {
            file_names.push(attribute_file(i));
            if attr.is_var() {
                file_names.push(attribute_var_file(i));
            }
        }
        if has_timestamps {
            file_names.push(TIMESTAMPS_FILE.to_string());
        }

        let files = file_names
            .iter()
            .map(|file| TileWriter::create(dir.join(file)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            schema,
            dir,
            name,
            has_timestamps,
            // Timestamped fragments keep every version of a coordinate.
            allow_equal_keys: schema.allows_dups || has_timestamps,
            file_names,
            files,
            pending: Vec::with_capacity(schema.capacity as usize),
            pending_keys: Vec::with_capacity(schema.capacity as usize),
            last_key: None,
            tiles: Vec::new(),
            cell_count: 0,
            non_empty_domain: Vec::new(),
        })
    }

    pub fn name(&self) -> &FragmentName {
        &self.name
    }

    pub fn uri(&self) -> &Path {
        &self.dir
    }

    pub fn cell_count(&self) -> u64 {
        self.cell_count + self.pending.len() as u64
    }

    /// Append the next cell. Cells must arrive in non-decreasing global
    /// order; equal coordinates only where the fragment may hold them.
    pub fn append(&mut self, cell: Cell) -> Result<()> {
        self.schema.check_coords(&cell.coords)?;
        let key = self.schema.order_key(&cell.coords);
        if let Some(last) = &self.last_key {
            let out_of_order = if self.allow_equal_keys {
                key < *last
            } else {
                key <= *last
            };
            if out_of_order {
                return Err(Error::InvalidOperation(format!(
                    "cell {:?} breaks global order in fragment {}",
                    cell.coords, self.name
                )));
            }
        }

        if self.non_empty_domain.is_empty() {
            self.non_empty_domain = cell.coords.iter().map(|&c| (c, c)).collect();
        } else {
            for (range, &c) in self.non_empty_domain.iter_mut().zip(&cell.coords) {
                range.0 = range.0.min(c);
                range.1 = range.1.max(c);
            }
        }

        self.last_key = Some(key.clone());
        self.pending_keys.push(key);
        self.pending.push(cell);
        if self.pending.len() as u64 >= self.schema.capacity {
            self.flush_tile()?;
        }
        Ok(())
    }

    fn flush_tile(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let cells = std::mem::take(&mut self.pending);
        let keys = std::mem::take(&mut self.pending_keys);
        let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(self.files.len());

        for dim in 0..self.schema.dim_num() {
            let coords: Vec<u64> = cells.iter().map(|c| c.coords[dim]).collect();
            payloads.push(tile::encode_u64s(&coords));
        }

        let mut var_bytes = 0u64;
        for (i, attr) in self.schema.attributes.iter().enumerate() {
            match attr.cell_size {
                CellSize::Fixed(_) => {
                    payloads.push(cells.iter().flat_map(|c| c.values[i].iter().copied()).collect());
                }
                CellSize::Var => {
                    let mut offsets = Vec::with_capacity(cells.len());
                    let mut data = Vec::new();
                    for cell in &cells {
                        offsets.push(data.len() as u64);
                        data.extend_from_slice(&cell.values[i]);
                    }
                    var_bytes += data.len() as u64;
                    payloads.push(tile::encode_u64s(&offsets));
                    payloads.push(data);
                }
            }
        }

        if self.has_timestamps {
            let stamps: Vec<u64> = cells.iter().map(|c| c.timestamp).collect();
            payloads.push(tile::encode_u64s(&stamps));
        }

        let offsets = self
            .files
            .iter_mut()
            .zip(&payloads)
            .map(|(file, payload)| file.write_tile(payload))
            .collect::<Result<Vec<u64>>>()?;

        let cell_count = cells.len() as u64;
        self.tiles.push(TileMeta {
            cell_count,
            memory_size: cell_count * self.schema.fixed_cell_memory(self.has_timestamps)
                + var_bytes,
            first_key: keys.first().cloned().unwrap_or_default(),
            last_key: keys.last().cloned().unwrap_or_default(),
            offsets,
        });
        self.cell_count += cell_count;

        self.pending = Vec::with_capacity(self.schema.capacity as usize);
        self.pending_keys = Vec::with_capacity(self.schema.capacity as usize);
        Ok(())
    }

    /// Flush the last tile, sync every file and store the metadata.
    pub fn finalize(mut self) -> Result<FragmentMetadata> {
        self.flush_tile()?;
        if self.cell_count == 0 {
            return Err(Error::InvalidOperation(format!(
                "fragment {} has no cells",
                self.name
            )));
        }

        let mut size = 0;
        for file in self.files.drain(..) {
            size += file.finish()?;
        }

        let metadata = FragmentMetadata {
            timestamp_range: self.name.timestamp_range(),
            format_version: self.name.version,
            has_timestamps: self.has_timestamps,
            cell_count: self.cell_count,
            size,
            non_empty_domain: std::mem::take(&mut self.non_empty_domain),
            files: std::mem::take(&mut self.file_names),
            tiles: std::mem::take(&mut self.tiles),
        };
        metadata.store(&self.dir)?;
        sync_dir(&self.dir)?;

        tracing::debug!(
            fragment = %self.name,
            cells = metadata.cell_count,
            tiles = metadata.tiles.len(),
            size = metadata.size,
            "Fragment finalized"
        );
        Ok(metadata)
    }

    /// Drop a partially written fragment.
    pub fn abort(self) {
        remove_best_effort(&self.dir);
    }
}

/// Record the fragments `name` supersedes, one per line.
pub fn write_vacuum_list(
    array: &Path,
    name: &FragmentName,
    inputs: &[FragmentName],
) -> Result<PathBuf> {
    fs::create_dir_all(array.join(COMMITS_DIR))?;
    let uri = vacuum_list_uri(array, name);
    let mut body = String::new();
    for input in inputs {
        body.push_str(&input.to_string());
        body.push('\n');
    }
    write_atomic(&uri, body.as_bytes())?;
    Ok(uri)
}

/// Make the fragment visible to readers.
pub fn commit(array: &Path, name: &FragmentName) -> Result<PathBuf> {
    fs::create_dir_all(array.join(COMMITS_DIR))?;
    let uri = commit_uri(array, name);
    write_atomic(&uri, &[])?;
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::schema::tests::test_schema;
    use crate::array::{Attribute, Dimension};
    use crate::fragment::{FragmentReader, CURRENT_FORMAT_VERSION, LEGACY_FORMAT_VERSION};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn cell(d1: u64, d2: u64, a: i32) -> Cell {
        Cell::new(vec![d1, d2]).with_value(a)
    }

    #[test]
    fn test_write_publish_and_read_back() {
        let dir = TempDir::new().unwrap();
        let schema = test_schema().with_capacity(2);
        let name = FragmentName::new(4, 4, CURRENT_FORMAT_VERSION);

        let mut writer = FragmentWriter::create(dir.path(), &schema, name.clone(), false).unwrap();
        for c in [cell(1, 1, 10), cell(1, 2, 11), cell(2, 2, 12), cell(1, 4, 13), cell(3, 3, 14)] {
            writer.append(c).unwrap();
        }
        let metadata = writer.finalize().unwrap();

        assert_eq!(metadata.cell_count, 5);
        assert_eq!(metadata.tiles.len(), 3);
        assert_eq!(metadata.non_empty_domain, vec![(1, 3), (1, 4)]);
        assert_eq!(metadata.tiles[0].memory_size, 2 * 20);
        assert!(!metadata.has_timestamps);

        let uri = commit(dir.path(), &name).unwrap();
        assert!(uri.exists());

        let reader = FragmentReader::new(
            fragment_uri(dir.path(), &name),
            Arc::new(schema),
            Arc::new(metadata),
        );
        let cells = reader.read_all().unwrap();
        let values: Vec<i32> = cells
            .iter()
            .map(|c| i32::from_le_bytes(c.values[0].clone().try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![10, 11, 12, 13, 14]);
        // Without a timestamp file every cell carries the fragment's end time.
        assert!(cells.iter().all(|c| c.timestamp == 4));
    }

    #[test]
    fn test_var_sized_attribute() {
        let dir = TempDir::new().unwrap();
        let schema = ArraySchema::new(
            vec![Dimension::new("rows", (0, 99), Some(10))],
            vec![Attribute::var("name"), Attribute::fixed("age", 1)],
        )
        .with_capacity(2);
        let name = FragmentName::new(1, 1, CURRENT_FORMAT_VERSION);

        let mut writer = FragmentWriter::create(dir.path(), &schema, name.clone(), false).unwrap();
        for (row, text) in [(1u64, "ada"), (2, ""), (5, "grace")] {
            writer
                .append(Cell::new(vec![row]).with_bytes(text).with_value(7u8))
                .unwrap();
        }
        let metadata = writer.finalize().unwrap();
        assert_eq!(metadata.files, vec!["d0.tile", "a0.tile", "a0_var.tile", "a1.tile"]);
        // 8 (coord) + 8 (offset) + 1 (age) per cell plus payload bytes.
        assert_eq!(metadata.tiles[0].memory_size, 2 * 17 + 3);

        let reader = FragmentReader::new(
            fragment_uri(dir.path(), &name),
            Arc::new(schema),
            Arc::new(metadata),
        );
        let names: Vec<Vec<u8>> = reader
            .read_all()
            .unwrap()
            .into_iter()
            .map(|c| c.values[0].clone())
            .collect();
        assert_eq!(names, vec![b"ada".to_vec(), b"".to_vec(), b"grace".to_vec()]);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let dir = TempDir::new().unwrap();
        let schema = test_schema();
        let name = FragmentName::new(1, 1, CURRENT_FORMAT_VERSION);

        let mut writer = FragmentWriter::create(dir.path(), &schema, name, false).unwrap();
        writer.append(cell(1, 4, 1)).unwrap();
        assert!(writer.append(cell(1, 1, 2)).is_err());
        assert!(writer.append(cell(1, 4, 3)).is_err());
        writer.abort();
        assert!(fs::read_dir(dir.path().join(FRAGMENTS_DIR)).unwrap().next().is_none());
    }

    #[test]
    fn test_timestamped_fragment_keeps_equal_keys() {
        let dir = TempDir::new().unwrap();
        let schema = test_schema();
        let name = FragmentName::new(1, 2, CURRENT_FORMAT_VERSION);

        let mut writer = FragmentWriter::create(dir.path(), &schema, name.clone(), true).unwrap();
        let mut newer = cell(2, 3, 9);
        newer.timestamp = 2;
        let mut older = cell(2, 3, 3);
        older.timestamp = 1;
        writer.append(newer).unwrap();
        writer.append(older).unwrap();
        let metadata = writer.finalize().unwrap();

        assert!(metadata.has_timestamps);
        let uri = fragment_uri(dir.path(), &name).join(TIMESTAMPS_FILE);
        let stamps = tile::read_timestamps(&uri).unwrap();
        assert_eq!(stamps, vec![vec![2, 1]]);
    }

    #[test]
    fn test_legacy_format_rejects_timestamps() {
        let dir = TempDir::new().unwrap();
        let schema = test_schema().with_format_version(LEGACY_FORMAT_VERSION);
        let name = FragmentName::new(1, 2, LEGACY_FORMAT_VERSION);
        assert!(FragmentWriter::create(dir.path(), &schema, name, true).is_err());
    }

    #[test]
    fn test_empty_fragment_rejected() {
        let dir = TempDir::new().unwrap();
        let schema = test_schema();
        let name = FragmentName::new(1, 1, CURRENT_FORMAT_VERSION);
        let writer = FragmentWriter::create(dir.path(), &schema, name, false).unwrap();
        assert!(writer.finalize().is_err());
    }

    #[test]
    fn test_vacuum_list() {
        let dir = TempDir::new().unwrap();
        let name = FragmentName::new(1, 3, CURRENT_FORMAT_VERSION);
        let inputs = vec![
            FragmentName::new(1, 1, CURRENT_FORMAT_VERSION),
            FragmentName::new(3, 3, CURRENT_FORMAT_VERSION),
        ];
        let uri = write_vacuum_list(dir.path(), &name, &inputs).unwrap();
        let body = fs::read_to_string(uri).unwrap();
        let listed: Vec<FragmentName> = body.lines().map(|l| l.parse().unwrap()).collect();
        assert_eq!(listed, inputs);
    }
}
