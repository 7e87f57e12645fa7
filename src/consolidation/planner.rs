use crate::directory::FragmentDescriptor;
use crate::fragment::FragmentName;

/// Fragments merged into one output fragment.
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub fragments: Vec<FragmentDescriptor>,
    pub size: u64,
}

impl PlanNode {
    fn new(first: FragmentDescriptor) -> Self {
        Self {
            size: first.size,
            fragments: vec![first],
        }
    }

    pub fn format_version(&self) -> u32 {
        self.fragments
            .first()
            .map_or(0, |f| f.format_version)
    }

    /// Range covered by the output fragment.
    pub fn timestamp_range(&self) -> (u64, u64) {
        let lo = self.fragments.iter().map(|f| f.timestamp_range.0).min();
        let hi = self.fragments.iter().map(|f| f.timestamp_range.1).max();
        (lo.unwrap_or(0), hi.unwrap_or(0))
    }

    pub fn names(&self) -> Vec<FragmentName> {
        self.fragments.iter().map(|f| f.name.clone()).collect()
    }

    /// A node of one fragment has nothing to merge.
    pub fn is_trivial(&self) -> bool {
        self.fragments.len() < 2
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidationPlan {
    pub nodes: Vec<PlanNode>,
}

impl ConsolidationPlan {
    pub fn mergeable(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.iter().filter(|n| !n.is_trivial())
    }
}

/// Group `fragments`, in directory order, into runs of adjacent fragments.
///
/// A run is closed when the next fragment would push it past
/// `target_fragment_size` or has a different format version.
pub fn plan(fragments: &[FragmentDescriptor], target_fragment_size: u64) -> ConsolidationPlan {
    let mut nodes: Vec<PlanNode> = Vec::new();
    let mut current: Option<PlanNode> = None;

    for fragment in fragments {
        current = match current.take() {
            Some(mut node)
                if node.format_version() == fragment.format_version
                    && node.size.saturating_add(fragment.size) <= target_fragment_size =>
            {
                node.size += fragment.size;
                node.fragments.push(fragment.clone());
                Some(node)
            }
            Some(node) => {
                nodes.push(node);
                Some(PlanNode::new(fragment.clone()))
            }
            None => Some(PlanNode::new(fragment.clone())),
        };
    }
    nodes.extend(current);

    ConsolidationPlan { nodes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{FragmentMetadata, CURRENT_FORMAT_VERSION, LEGACY_FORMAT_VERSION};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn descriptor(ts: u64, size: u64, version: u32) -> FragmentDescriptor {
        let name = FragmentName::new(ts, ts, version);
        let metadata = FragmentMetadata {
            timestamp_range: (ts, ts),
            format_version: version,
            has_timestamps: false,
            cell_count: 1,
            size,
            non_empty_domain: vec![(1, 1)],
            files: Vec::new(),
            tiles: Vec::new(),
        };
        FragmentDescriptor {
            uri: PathBuf::from(name.to_string()),
            name,
            timestamp_range: (ts, ts),
            format_version: version,
            is_sparse: true,
            has_timestamps: false,
            size,
            metadata: Arc::new(metadata),
        }
    }

    fn shape(plan: &ConsolidationPlan) -> Vec<Vec<u64>> {
        plan.nodes
            .iter()
            .map(|n| n.fragments.iter().map(|f| f.timestamp_range.0).collect())
            .collect()
    }

    #[test]
    fn test_greedy_size_split() {
        let fragments: Vec<_> = (1..=5)
            .map(|ts| descriptor(ts, 40, CURRENT_FORMAT_VERSION))
            .collect();

        let plan = plan(&fragments, 100);
        assert_eq!(shape(&plan), vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(plan.mergeable().count(), 2);
        assert_eq!(plan.nodes[1].timestamp_range(), (3, 4));
        assert_eq!(plan.nodes[1].size, 80);
    }

    #[test]
    fn test_oversized_fragment_stands_alone() {
        let fragments = vec![
            descriptor(1, 10, CURRENT_FORMAT_VERSION),
            descriptor(2, 500, CURRENT_FORMAT_VERSION),
            descriptor(3, 10, CURRENT_FORMAT_VERSION),
        ];
        assert_eq!(shape(&plan(&fragments, 100)), vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_format_version_boundary() {
        let fragments = vec![
            descriptor(1, 1, LEGACY_FORMAT_VERSION),
            descriptor(2, 1, LEGACY_FORMAT_VERSION),
            descriptor(3, 1, CURRENT_FORMAT_VERSION),
            descriptor(4, 1, CURRENT_FORMAT_VERSION),
        ];
        let plan = plan(&fragments, u64::MAX);
        assert_eq!(shape(&plan), vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(plan.nodes[0].format_version(), LEGACY_FORMAT_VERSION);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let fragments: Vec<_> = (1..=7)
            .map(|ts| descriptor(ts, ts * 10, CURRENT_FORMAT_VERSION))
            .collect();
        assert_eq!(shape(&plan(&fragments, 90)), shape(&plan(&fragments, 90)));
        assert!(plan(&[], 90).nodes.is_empty());
    }
}
