//! Removal of fragments superseded by committed consolidations.
//!
//! Commit markers go first, so a fragment whose directory cannot be removed
//! is already invisible to readers. A vacuum list is dropped once none of
//! the fragments it names is left on disk.

use crate::context::Context;
use crate::directory::{ArrayDirectory, DirectoryMode};
use crate::error::Result;
use crate::fragment::{remove_best_effort, COMMITS_DIR, COMMIT_EXTENSION, FRAGMENTS_DIR};
use crate::Error;

use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumSummary {
    pub commits_removed: u64,
    pub fragments_removed: u64,
    pub vacuum_lists_removed: u64,
}

pub fn vacuum(ctx: &Context, location: impl AsRef<Path>) -> Result<VacuumSummary> {
    let location = location.as_ref();
    let stats = ctx.storage_stats().child("Vacuum");
    let _timer = stats.start_timer("vacuum");

    let directory = ArrayDirectory::load(
        location,
        0,
        u64::MAX,
        DirectoryMode::VacuumFragments,
        ctx.storage_stats(),
    )?;
    let mut summary = VacuumSummary::default();

    for uri in directory.commit_uris_to_vacuum() {
        if remove_best_effort(uri) {
            summary.commits_removed += 1;
        }
    }
    for uri in directory.fragment_uris_to_vacuum() {
        if remove_best_effort(uri) {
            summary.fragments_removed += 1;
        }
    }

    let fragments_dir = location.join(FRAGMENTS_DIR);
    let commits_dir = location.join(COMMITS_DIR);
    for uri in directory.vacuum_list_uris() {
        let body = fs::read_to_string(uri).map_err(|e| Error::directory(uri, e))?;
        let remaining = body
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .any(|name| {
                fragments_dir.join(name).exists()
                    || commits_dir
                        .join(format!("{}.{}", name, COMMIT_EXTENSION))
                        .exists()
            });
        if !remaining && remove_best_effort(uri) {
            summary.vacuum_lists_removed += 1;
        }
    }

    stats.add_counter("commits_removed", summary.commits_removed);
    stats.add_counter("fragments_removed", summary.fragments_removed);
    stats.add_counter("vacuum_lists_removed", summary.vacuum_lists_removed);
    tracing::info!(
        array = %location.display(),
        fragments = summary.fragments_removed,
        commits = summary.commits_removed,
        vacuum_lists = summary.vacuum_lists_removed,
        "Vacuumed array"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::schema::tests::test_schema;
    use crate::array::{Array, Cell};
    use crate::consolidation::{consolidate, ConsolidationParams};
    use crate::directory::list_fragments;
    use tempfile::TempDir;

    fn write(ctx: &Context, dir: &TempDir, timestamp: u64, value: i32) {
        let array = Array::open_write(ctx, dir.path()).unwrap();
        array
            .write(vec![Cell::new(vec![1, 1]).with_value(value)], timestamp)
            .unwrap();
    }

    fn entries(dir: &Path) -> usize {
        fs::read_dir(dir).map_or(0, |d| d.count())
    }

    #[tokio::test]
    async fn test_vacuum_after_consolidation() {
        let ctx = Context::default();
        let dir = TempDir::new().unwrap();
        Array::create(&ctx, dir.path(), &test_schema()).unwrap();
        write(&ctx, &dir, 1, 1);
        write(&ctx, &dir, 2, 2);
        write(&ctx, &dir, 3, 3);

        // Nothing superseded yet.
        assert_eq!(vacuum(&ctx, dir.path()).unwrap(), VacuumSummary::default());

        consolidate(&ctx, dir.path(), &ConsolidationParams::default())
            .await
            .unwrap();
        assert_eq!(entries(&dir.path().join(FRAGMENTS_DIR)), 4);

        let summary = vacuum(&ctx, dir.path()).unwrap();
        assert_eq!(summary.fragments_removed, 3);
        assert_eq!(summary.commits_removed, 3);
        assert_eq!(summary.vacuum_lists_removed, 1);
        assert_eq!(entries(&dir.path().join(FRAGMENTS_DIR)), 1);
        // Only the consolidated fragment's commit marker is left.
        assert_eq!(entries(&dir.path().join(COMMITS_DIR)), 1);

        let fragments = list_fragments(dir.path(), 0, u64::MAX, DirectoryMode::Read).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].timestamp_range, (1, 3));

        // Idempotent.
        assert_eq!(vacuum(&ctx, dir.path()).unwrap(), VacuumSummary::default());
        let dump = ctx.storage_stats().dump();
        assert_eq!(dump["counters"]["Context.StorageManager.Vacuum.fragments_removed"], 3);
    }

    #[tokio::test]
    async fn test_vacuum_chained_consolidations() {
        let ctx = Context::default();
        let dir = TempDir::new().unwrap();
        Array::create(&ctx, dir.path(), &test_schema()).unwrap();
        write(&ctx, &dir, 1, 1);
        write(&ctx, &dir, 2, 2);
        consolidate(&ctx, dir.path(), &ConsolidationParams::default())
            .await
            .unwrap();
        write(&ctx, &dir, 3, 3);
        consolidate(&ctx, dir.path(), &ConsolidationParams::default())
            .await
            .unwrap();

        let summary = vacuum(&ctx, dir.path()).unwrap();
        assert_eq!(summary.fragments_removed, 4);
        assert_eq!(summary.vacuum_lists_removed, 2);

        let fragments = list_fragments(dir.path(), 0, u64::MAX, DirectoryMode::Read).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].timestamp_range, (1, 3));
    }

    #[test]
    fn test_vacuum_missing_array() {
        let dir = TempDir::new().unwrap();
        let err = vacuum(&Context::default(), dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, Error::Directory(_, _)));
    }
}
