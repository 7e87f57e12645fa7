//! Array directory: which schema, fragments and metadata files make up an
//! array as of a timestamp window.
//!
//! A load is a snapshot. It lists `__schema/`, `__commits/`, `__fragments/`
//! and `__meta/` once, loads fragment metadata in parallel, and applies two
//! rules to decide which fragments a read at `[start, end]` sees:
//!
//! - **Visibility**: a fragment whose cells carry their own write times, or
//!   whose range is a single instant, is visible when its range overlaps the
//!   window. A consolidated fragment without per-cell times cannot be cut to
//!   a window, so it is visible only when the window contains its range.
//! - **Supersession**: a visible consolidated fragment hides every fragment
//!   listed (transitively) in its vacuum list.
//!
//! Survivors are ordered by range start, then URI.

use crate::array::ArraySchema;
use crate::encoding::bincode;
use crate::error::Result;
use crate::fragment::name::parse_timestamped;
use crate::fragment::{
    FragmentMetadata, FragmentName, COMMITS_DIR, COMMIT_EXTENSION, FRAGMENTS_DIR, META_DIR,
    SCHEMA_DIR, VACUUM_EXTENSION,
};
use crate::stats::Stats;
use crate::Error;

use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryMode {
    /// Resolve the fragments visible in the window.
    Read,
    /// List schemas only.
    SchemaOnly,
    /// Find superseded fragments regardless of the window.
    VacuumFragments,
}

#[derive(Debug, Clone)]
pub struct FragmentDescriptor {
    pub uri: PathBuf,
    pub name: FragmentName,
    pub timestamp_range: (u64, u64),
    pub format_version: u32,
    pub is_sparse: bool,
    pub has_timestamps: bool,
    /// Bytes of tile data, used for consolidation planning.
    pub size: u64,
    pub metadata: Arc<FragmentMetadata>,
}

impl FragmentDescriptor {
    pub fn is_visible(&self, start: u64, end: u64) -> bool {
        is_visible(self.timestamp_range, self.has_timestamps, start, end)
    }
}

/// Visibility of a fragment covering `range` to a read at `[start, end]`.
pub fn is_visible(range: (u64, u64), has_timestamps: bool, start: u64, end: u64) -> bool {
    let (lo, hi) = range;
    if has_timestamps || lo == hi {
        lo <= end && hi >= start
    } else {
        lo >= start && hi <= end
    }
}

#[derive(Debug, Clone)]
pub struct ArrayDirectory {
    location: PathBuf,
    timestamp_start: u64,
    timestamp_end: u64,
    mode: DirectoryMode,
    schema_uris: Vec<PathBuf>,
    latest_schema_uri: PathBuf,
    array_meta_uris: Vec<PathBuf>,
    fragments: Vec<FragmentDescriptor>,
    fragment_uris_to_vacuum: Vec<PathBuf>,
    commit_uris_to_vacuum: Vec<PathBuf>,
    vacuum_list_uris: Vec<PathBuf>,
    uncommitted_fragment_uris: Vec<PathBuf>,
}

struct Commits {
    committed: BTreeSet<String>,
    // consolidated fragment -> fragments it supersedes
    vacuum_lists: HashMap<String, Vec<String>>,
    vacuum_list_uris: Vec<PathBuf>,
}

impl ArrayDirectory {
    pub fn load(
        location: impl AsRef<Path>,
        timestamp_start: u64,
        timestamp_end: u64,
        mode: DirectoryMode,
        stats: &Arc<Stats>,
    ) -> Result<Self> {
        let location = location.as_ref().to_path_buf();
        let stats = stats.child("ArrayDirectory");
        let _timer = stats.start_timer("load");

        if timestamp_start > timestamp_end {
            return Err(Error::directory(
                &location,
                format!("empty window [{}, {}]", timestamp_start, timestamp_end),
            ));
        }
        let schema_dir = location.join(SCHEMA_DIR);
        if !schema_dir.is_dir() {
            return Err(Error::directory(&location, "not an array"));
        }

        let schema_uris = list_timestamped(&schema_dir)?;
        let latest_schema_uri = schema_uris
            .iter()
            .rev()
            .find(|(range, _)| range.1 <= timestamp_end)
            .or_else(|| schema_uris.first())
            .map(|(_, uri)| uri.clone())
            .ok_or_else(|| Error::directory(&schema_dir, "no schema found"))?;

        let mut directory = Self {
            location,
            timestamp_start,
            timestamp_end,
            mode,
            schema_uris: schema_uris.into_iter().map(|(_, uri)| uri).collect(),
            latest_schema_uri,
            array_meta_uris: Vec::new(),
            fragments: Vec::new(),
            fragment_uris_to_vacuum: Vec::new(),
            commit_uris_to_vacuum: Vec::new(),
            vacuum_list_uris: Vec::new(),
            uncommitted_fragment_uris: Vec::new(),
        };

        match mode {
            DirectoryMode::SchemaOnly => {}
            DirectoryMode::VacuumFragments => directory.load_vacuum(&stats)?,
            DirectoryMode::Read => directory.load_read(&stats)?,
        }

        tracing::debug!(
            array = %directory.location.display(),
            start = timestamp_start,
            end = timestamp_end,
            ?mode,
            fragments = directory.fragments.len(),
            to_vacuum = directory.fragment_uris_to_vacuum.len(),
            "Array directory loaded"
        );
        Ok(directory)
    }

    fn load_read(&mut self, stats: &Stats) -> Result<()> {
        let commits = self.list_commits()?;
        self.vacuum_list_uris = commits.vacuum_list_uris.clone();

        let mut to_load = Vec::new();
        for (name, uri) in self.list_fragment_dirs()? {
            if commits.committed.contains(&name.to_string()) {
                to_load.push((name, uri));
            } else {
                self.uncommitted_fragment_uris.push(uri);
            }
        }
        stats.add_counter("fragments_listed", to_load.len() as u64);

        let loaded = to_load
            .into_par_iter()
            .map(|(name, uri)| load_descriptor(name, uri))
            .collect::<Result<Vec<_>>>()?;

        let (start, end) = (self.timestamp_start, self.timestamp_end);
        let mut visible: Vec<FragmentDescriptor> = loaded
            .into_iter()
            .filter(|f| f.is_visible(start, end))
            .collect();

        let consolidated: Vec<String> = visible
            .iter()
            .map(|f| f.name.to_string())
            .filter(|name| commits.vacuum_lists.contains_key(name))
            .collect();
        let superseded = superseded_closure(&commits.vacuum_lists, consolidated);

        let before = visible.len();
        visible.retain(|f| !superseded.contains(&f.name.to_string()));
        stats.add_counter("fragments_superseded", (before - visible.len()) as u64);

        visible.sort_by(|a, b| {
            a.timestamp_range
                .0
                .cmp(&b.timestamp_range.0)
                .then_with(|| a.uri.cmp(&b.uri))
        });
        stats.add_counter("fragments_visible", visible.len() as u64);
        self.fragments = visible;

        let meta_dir = self.location.join(META_DIR);
        if meta_dir.is_dir() {
            self.array_meta_uris = list_timestamped(&meta_dir)?
                .into_iter()
                .filter(|(range, _)| range.0 <= end && range.1 >= start)
                .map(|(_, uri)| uri)
                .collect();
        }
        Ok(())
    }

    fn load_vacuum(&mut self, stats: &Stats) -> Result<()> {
        let commits = self.list_commits()?;
        self.vacuum_list_uris = commits.vacuum_list_uris.clone();

        // Only committed consolidations may retire their inputs.
        let consolidated: Vec<String> = commits
            .vacuum_lists
            .keys()
            .filter(|name| commits.committed.contains(*name))
            .cloned()
            .collect();
        let superseded = superseded_closure(&commits.vacuum_lists, consolidated);

        let fragments_dir = self.location.join(FRAGMENTS_DIR);
        let commits_dir = self.location.join(COMMITS_DIR);
        for name in &superseded {
            let uri = fragments_dir.join(name);
            if uri.exists() {
                self.fragment_uris_to_vacuum.push(uri);
            }
            let commit = commits_dir.join(format!("{}.{}", name, COMMIT_EXTENSION));
            if commit.exists() {
                self.commit_uris_to_vacuum.push(commit);
            }
        }
        stats.add_counter("fragments_to_vacuum", self.fragment_uris_to_vacuum.len() as u64);
        Ok(())
    }

    fn list_commits(&self) -> Result<Commits> {
        let mut commits = Commits {
            committed: BTreeSet::new(),
            vacuum_lists: HashMap::new(),
            vacuum_list_uris: Vec::new(),
        };
        let dir = self.location.join(COMMITS_DIR);
        if !dir.is_dir() {
            return Ok(commits);
        }

        for path in sorted_entries(&dir)? {
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            if ext == COMMIT_EXTENSION {
                commits.committed.insert(stem.to_string());
            } else if ext == VACUUM_EXTENSION {
                let body = fs::read_to_string(&path)
                    .map_err(|e| Error::directory(&path, e))?;
                let inputs = body
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect();
                commits.vacuum_lists.insert(stem.to_string(), inputs);
                commits.vacuum_list_uris.push(path);
            }
        }
        Ok(commits)
    }

    fn list_fragment_dirs(&self) -> Result<Vec<(FragmentName, PathBuf)>> {
        let dir = self.location.join(FRAGMENTS_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut fragments = Vec::new();
        for path in sorted_entries(&dir)? {
            let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            match FragmentName::parse(file_name) {
                Ok(name) if path.is_dir() => fragments.push((name, path)),
                _ => tracing::warn!(path = %path.display(), "Skipping unrecognized fragment entry"),
            }
        }
        Ok(fragments)
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn timestamp_window(&self) -> (u64, u64) {
        (self.timestamp_start, self.timestamp_end)
    }

    pub fn mode(&self) -> DirectoryMode {
        self.mode
    }

    pub fn schema_uris(&self) -> &[PathBuf] {
        &self.schema_uris
    }

    pub fn latest_schema_uri(&self) -> &Path {
        &self.latest_schema_uri
    }

    pub fn array_meta_uris(&self) -> &[PathBuf] {
        &self.array_meta_uris
    }

    /// Visible fragments ordered by `(range start, uri)`.
    pub fn fragments(&self) -> &[FragmentDescriptor] {
        &self.fragments
    }

    pub fn fragment_uris_to_vacuum(&self) -> &[PathBuf] {
        &self.fragment_uris_to_vacuum
    }

    pub fn commit_uris_to_vacuum(&self) -> &[PathBuf] {
        &self.commit_uris_to_vacuum
    }

    pub fn vacuum_list_uris(&self) -> &[PathBuf] {
        &self.vacuum_list_uris
    }

    pub fn uncommitted_fragment_uris(&self) -> &[PathBuf] {
        &self.uncommitted_fragment_uris
    }

    pub fn load_schema(&self) -> Result<ArraySchema> {
        let bytes = fs::read(&self.latest_schema_uri)
            .map_err(|e| Error::directory(&self.latest_schema_uri, e))?;
        let schema: ArraySchema = bincode::deserialize(&bytes)
            .map_err(|e| Error::directory(&self.latest_schema_uri, e))?;
        schema.validate()?;
        Ok(schema)
    }
}

/// Fragments visible in `[start, end]`, in directory order.
pub fn list_fragments(
    location: impl AsRef<Path>,
    timestamp_start: u64,
    timestamp_end: u64,
    mode: DirectoryMode,
) -> Result<Vec<FragmentDescriptor>> {
    let stats = Stats::new("ArrayDirectory");
    let directory = ArrayDirectory::load(location, timestamp_start, timestamp_end, mode, &stats)?;
    Ok(directory.fragments)
}

fn load_descriptor(name: FragmentName, uri: PathBuf) -> Result<FragmentDescriptor> {
    let metadata = FragmentMetadata::load(&uri).map_err(|e| Error::directory(&uri, e))?;
    if metadata.timestamp_range != name.timestamp_range() {
        return Err(Error::directory(
            &uri,
            format!(
                "metadata range {:?} does not match name",
                metadata.timestamp_range
            ),
        ));
    }
    Ok(FragmentDescriptor {
        timestamp_range: metadata.timestamp_range,
        format_version: metadata.format_version,
        is_sparse: true,
        has_timestamps: metadata.has_timestamps,
        size: metadata.size,
        metadata: Arc::new(metadata),
        uri,
        name,
    })
}

fn superseded_closure(
    vacuum_lists: &HashMap<String, Vec<String>>,
    roots: Vec<String>,
) -> BTreeSet<String> {
    let mut superseded = BTreeSet::new();
    let mut stack = roots;
    while let Some(name) = stack.pop() {
        if let Some(inputs) = vacuum_lists.get(&name) {
            for input in inputs {
                if superseded.insert(input.clone()) {
                    stack.push(input.clone());
                }
            }
        }
    }
    superseded
}

fn list_timestamped(dir: &Path) -> Result<Vec<((u64, u64), PathBuf)>> {
    let mut uris = Vec::new();
    for path in sorted_entries(dir)? {
        let range = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(parse_timestamped);
        if let Some(range) = range {
            uris.push((range, path));
        }
    }
    uris.sort();
    Ok(uris)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| Error::directory(dir, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::directory(dir, e))?;
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::schema::tests::test_schema;
    use crate::array::{Array, Cell};
    use crate::context::Context;
    use crate::fragment::name::timestamped_name;
    use crate::fragment::{write_atomic, FragmentWriter, CURRENT_FORMAT_VERSION, METADATA_FILE};
    use tempfile::TempDir;

    fn array_with_writes(timestamps: &[u64]) -> (Context, TempDir) {
        let ctx = Context::default();
        let dir = TempDir::new().unwrap();
        Array::create(&ctx, dir.path(), &test_schema()).unwrap();
        let array = Array::open_write(&ctx, dir.path()).unwrap();
        for &ts in timestamps {
            array
                .write(vec![Cell::new(vec![1, ts]).with_value(ts as i32)], ts)
                .unwrap();
        }
        (ctx, dir)
    }

    fn load(
        ctx: &Context,
        location: impl AsRef<Path>,
        window: (u64, u64),
        mode: DirectoryMode,
    ) -> Result<ArrayDirectory> {
        ArrayDirectory::load(location, window.0, window.1, mode, ctx.storage_stats())
    }

    #[test]
    fn test_visibility_matrix() {
        // Single-instant and timestamped fragments: overlap.
        assert!(is_visible((3, 3), false, 0, 3));
        assert!(is_visible((3, 3), false, 3, 9));
        assert!(!is_visible((3, 3), false, 4, 9));
        assert!(is_visible((1, 5), true, 2, 4));
        assert!(is_visible((1, 5), true, 5, 5));
        assert!(!is_visible((1, 5), true, 6, 9));
        assert!(!is_visible((1, 5), true, 0, 0));

        // Collapsed ranges: containment.
        assert!(is_visible((1, 5), false, 1, 5));
        assert!(is_visible((1, 5), false, 0, 9));
        assert!(!is_visible((1, 5), false, 2, 9));
        assert!(!is_visible((1, 5), false, 0, 4));
    }

    #[test]
    fn test_window_and_order() {
        let (ctx, dir) = array_with_writes(&[3, 1, 2]);
        let directory = load(&ctx, dir.path(), (0, u64::MAX), DirectoryMode::Read).unwrap();
        let ranges: Vec<_> = directory.fragments().iter().map(|f| f.timestamp_range).collect();
        assert_eq!(ranges, vec![(1, 1), (2, 2), (3, 3)]);
        assert!(directory.fragments().iter().all(|f| f.is_sparse && !f.has_timestamps));

        let ranges: Vec<_> = list_fragments(dir.path(), 2, 3, DirectoryMode::Read)
            .unwrap()
            .iter()
            .map(|f| f.timestamp_range)
            .collect();
        assert_eq!(ranges, vec![(2, 2), (3, 3)]);

        let dump = ctx.storage_stats().dump();
        assert_eq!(
            dump["counters"]["Context.StorageManager.ArrayDirectory.fragments_visible"],
            3
        );
    }

    #[test]
    fn test_uncommitted_fragment_is_ignored() {
        let (ctx, dir) = array_with_writes(&[1]);
        let schema = test_schema();
        let name = FragmentName::new(2, 2, CURRENT_FORMAT_VERSION);
        let mut writer = FragmentWriter::create(dir.path(), &schema, name, false).unwrap();
        writer.append(Cell::new(vec![2, 2]).with_value(7i32)).unwrap();
        writer.finalize().unwrap();

        let directory = load(&ctx, dir.path(), (0, u64::MAX), DirectoryMode::Read).unwrap();
        assert_eq!(directory.fragments().len(), 1);
        assert_eq!(directory.uncommitted_fragment_uris().len(), 1);
    }

    #[test]
    fn test_corrupt_metadata_names_fragment() {
        let (ctx, dir) = array_with_writes(&[1, 2]);
        let directory = load(&ctx, dir.path(), (0, u64::MAX), DirectoryMode::Read).unwrap();
        let victim = directory.fragments()[1].uri.clone();
        fs::write(victim.join(METADATA_FILE), b"garbage").unwrap();

        let err = load(&ctx, dir.path(), (0, u64::MAX), DirectoryMode::Read).unwrap_err();
        match err {
            Error::Directory(uri, _) => assert_eq!(uri, victim.display().to_string()),
            other => panic!("unexpected error {:?}", other),
        }

        // Schema-only loads do not touch fragment metadata.
        load(&ctx, dir.path(), (0, u64::MAX), DirectoryMode::SchemaOnly).unwrap();
    }

    #[test]
    fn test_schema_selection_and_array_meta() {
        let dir = TempDir::new().unwrap();
        let schema_dir = dir.path().join(SCHEMA_DIR);
        fs::create_dir_all(&schema_dir).unwrap();
        let old = test_schema();
        let new = test_schema().with_capacity(7);
        for (ts, schema) in [(5, &old), (10, &new)] {
            let uri = schema_dir.join(timestamped_name(ts, ts));
            write_atomic(&uri, &bincode::serialize(schema).unwrap()).unwrap();
        }

        let meta_dir = dir.path().join(META_DIR);
        fs::create_dir_all(&meta_dir).unwrap();
        write_atomic(&meta_dir.join(timestamped_name(2, 2)), b"m").unwrap();
        write_atomic(&meta_dir.join(timestamped_name(8, 8)), b"m").unwrap();

        let stats = Stats::new("Test");
        let load =
            |end| ArrayDirectory::load(dir.path(), 0, end, DirectoryMode::Read, &stats).unwrap();

        assert_eq!(load(7).load_schema().unwrap(), old);
        assert_eq!(load(20).load_schema().unwrap(), new);
        assert_eq!(load(1).load_schema().unwrap(), old);
        assert_eq!(load(20).schema_uris().len(), 2);

        assert_eq!(load(5).array_meta_uris().len(), 1);
        assert_eq!(load(20).array_meta_uris().len(), 2);
    }

    #[test]
    fn test_rejects_empty_window_and_missing_array() {
        let (ctx, dir) = array_with_writes(&[]);
        assert!(load(&ctx, dir.path(), (5, 4), DirectoryMode::Read).is_err());
        assert!(matches!(
            load(&ctx, dir.path().join("nope"), (0, 1), DirectoryMode::Read),
            Err(Error::Directory(_, _))
        ));
    }
}
