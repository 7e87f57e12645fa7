//! Array handles: creating arrays, writing fragments, and opening a
//! timestamp window for reading.

pub mod cell;
pub mod schema;

pub use cell::{decode_values, Cell, FixedValue};
pub use schema::{ArraySchema, Attribute, CellSize, Dimension, Field, Layout};

use crate::context::Context;
use crate::directory::{ArrayDirectory, DirectoryMode};
use crate::encoding::bincode;
use crate::error::Result;
use crate::fragment::buffer::WriteBuffer;
use crate::fragment::name::timestamped_name;
use crate::fragment::remove_best_effort;
use crate::fragment::writer::commit;
use crate::fragment::{FragmentName, FragmentWriter, SCHEMA_DIR};
use crate::Error;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// An open array. Read handles pin a directory snapshot for their window.
#[derive(Debug)]
pub struct Array {
    ctx: Context,
    location: PathBuf,
    mode: OpenMode,
    schema: Arc<ArraySchema>,
    directory: ArrayDirectory,
}

impl Array {
    /// Create an empty array at `location` with `schema`.
    pub fn create(ctx: &Context, location: impl AsRef<Path>, schema: &ArraySchema) -> Result<()> {
        let location = location.as_ref();
        schema.validate()?;

        let schema_dir = location.join(SCHEMA_DIR);
        if schema_dir.exists() {
            return Err(Error::InvalidOperation(format!(
                "array already exists at {}",
                location.display()
            )));
        }
        fs::create_dir_all(&schema_dir)?;

        let now = now_millis();
        let uri = schema_dir.join(timestamped_name(now, now));
        crate::fragment::write_atomic(&uri, &bincode::serialize(schema)?)?;
        ctx.storage_stats().add_counter("arrays_created", 1);

        tracing::info!(
            array = %location.display(),
            dims = schema.dim_num(),
            attrs = schema.attribute_num(),
            "Array created"
        );
        Ok(())
    }

    /// Open for reading the fragments visible in `[timestamp_start, timestamp_end]`.
    pub fn open_read(
        ctx: &Context,
        location: impl AsRef<Path>,
        timestamp_start: u64,
        timestamp_end: u64,
    ) -> Result<Self> {
        Self::open_with(ctx, location, OpenMode::Read, timestamp_start, timestamp_end)
    }

    /// Open for reading at the latest state.
    pub fn open(ctx: &Context, location: impl AsRef<Path>) -> Result<Self> {
        Self::open_read(ctx, location, 0, u64::MAX)
    }

    pub fn open_write(ctx: &Context, location: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(ctx, location, OpenMode::Write, 0, u64::MAX)
    }

    fn open_with(
        ctx: &Context,
        location: impl AsRef<Path>,
        mode: OpenMode,
        timestamp_start: u64,
        timestamp_end: u64,
    ) -> Result<Self> {
        let location = location.as_ref().to_path_buf();
        let directory_mode = match mode {
            OpenMode::Read => DirectoryMode::Read,
            OpenMode::Write => DirectoryMode::SchemaOnly,
        };
        let directory = ArrayDirectory::load(
            &location,
            timestamp_start,
            timestamp_end,
            directory_mode,
            ctx.storage_stats(),
        )?;
        let schema = Arc::new(directory.load_schema()?);

        Ok(Self {
            ctx: ctx.clone(),
            location,
            mode,
            schema,
            directory,
        })
    }

    /// Reload the directory for a new window.
    pub fn reopen(&mut self, timestamp_start: u64, timestamp_end: u64) -> Result<()> {
        if self.mode != OpenMode::Read {
            return Err(Error::InvalidOperation(
                "only read handles can be reopened".to_string(),
            ));
        }
        *self = Self::open_read(&self.ctx, &self.location, timestamp_start, timestamp_end)?;
        Ok(())
    }

    /// Write `cells` as one new fragment stamped `timestamp`.
    pub fn write(&self, cells: Vec<Cell>, timestamp: u64) -> Result<FragmentName> {
        if self.mode != OpenMode::Write {
            return Err(Error::InvalidOperation(
                "array is not open for writing".to_string(),
            ));
        }
        if cells.is_empty() {
            return Err(Error::InvalidOperation("write has no cells".to_string()));
        }

        let buffer = WriteBuffer::new(self.schema.clone());
        for cell in cells {
            buffer.insert(cell)?;
        }

        let name = FragmentName::new(timestamp, timestamp, self.schema.format_version);
        let mut writer = FragmentWriter::create(&self.location, &self.schema, name.clone(), false)?;
        let uri = writer.uri().to_path_buf();

        let written = (|| {
            for (_, mut cell) in buffer.drain_sorted() {
                cell.timestamp = timestamp;
                writer.append(cell)?;
            }
            writer.finalize()
        })();
        let metadata = match written {
            Ok(metadata) => metadata,
            Err(e) => {
                remove_best_effort(&uri);
                return Err(e);
            }
        };
        commit(&self.location, &name)?;

        let stats = self.ctx.storage_stats();
        stats.add_counter("fragments_written", 1);
        stats.add_counter("cells_written", metadata.cell_count);
        tracing::info!(
            array = %self.location.display(),
            fragment = %name,
            cells = metadata.cell_count,
            "Fragment written"
        );
        Ok(name)
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    pub fn directory(&self) -> &ArrayDirectory {
        &self.directory
    }

    pub fn timestamp_window(&self) -> (u64, u64) {
        self.directory.timestamp_window()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::schema::tests::test_schema;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_open() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::default();
        let location = dir.path().join("array");

        Array::create(&ctx, &location, &test_schema()).unwrap();
        assert!(Array::create(&ctx, &location, &test_schema()).is_err());

        let array = Array::open(&ctx, &location).unwrap();
        assert_eq!(**array.schema(), test_schema());
        assert_eq!(array.mode(), OpenMode::Read);
        assert!(array.directory().fragments().is_empty());
    }

    #[test]
    fn test_open_missing_array() {
        let dir = TempDir::new().unwrap();
        let err = Array::open(&Context::default(), dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::Directory(_, _)));
    }

    #[test]
    fn test_write_requires_write_mode() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::default();
        Array::create(&ctx, dir.path(), &test_schema()).unwrap();

        let reader = Array::open(&ctx, dir.path()).unwrap();
        let cells = vec![Cell::new(vec![1, 1]).with_value(1i32)];
        assert!(reader.write(cells.clone(), 1).is_err());

        let writer = Array::open_write(&ctx, dir.path()).unwrap();
        assert!(writer.write(Vec::new(), 1).is_err());
        let name = writer.write(cells, 1).unwrap();
        assert_eq!(name.timestamp_range(), (1, 1));

        let reader = Array::open(&ctx, dir.path()).unwrap();
        assert_eq!(reader.directory().fragments().len(), 1);
        assert_eq!(ctx.storage_stats().counter("fragments_written"), 1);
    }

    #[test]
    fn test_duplicate_write_leaves_no_fragment() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::default();
        Array::create(&ctx, dir.path(), &test_schema()).unwrap();

        let writer = Array::open_write(&ctx, dir.path()).unwrap();
        let cells = vec![
            Cell::new(vec![1, 1]).with_value(1i32),
            Cell::new(vec![1, 1]).with_value(2i32),
        ];
        assert!(writer.write(cells, 1).is_err());

        let reader = Array::open(&ctx, dir.path()).unwrap();
        assert!(reader.directory().fragments().is_empty());
        assert!(reader.directory().uncommitted_fragment_uris().is_empty());
    }

    #[test]
    fn test_reopen_changes_window() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::default();
        Array::create(&ctx, dir.path(), &test_schema()).unwrap();
        let writer = Array::open_write(&ctx, dir.path()).unwrap();
        writer.write(vec![Cell::new(vec![1, 1]).with_value(1i32)], 1).unwrap();
        writer.write(vec![Cell::new(vec![2, 2]).with_value(2i32)], 5).unwrap();

        let mut array = Array::open_read(&ctx, dir.path(), 0, 2).unwrap();
        assert_eq!(array.directory().fragments().len(), 1);
        array.reopen(0, 10).unwrap();
        assert_eq!(array.directory().fragments().len(), 2);
        assert_eq!(array.timestamp_window(), (0, 10));
    }

    #[test]
    fn test_repeated_opens_keep_stats_bounded() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::default();
        Array::create(&ctx, dir.path(), &test_schema()).unwrap();
        let writer = Array::open_write(&ctx, dir.path()).unwrap();
        writer
            .write(vec![Cell::new(vec![1, 1]).with_value(1i32)], 1)
            .unwrap();

        for _ in 0..1000 {
            let array = Array::open(&ctx, dir.path()).unwrap();
            assert_eq!(array.directory().fragments().len(), 1);
        }
        assert!(ctx.storage_stats().live_children() <= 1);

        let dump = ctx.storage_stats().dump();
        assert_eq!(
            dump["counters"]["Context.StorageManager.ArrayDirectory.fragments_visible"],
            1000
        );
    }
}
