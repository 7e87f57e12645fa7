//! Hierarchical counters and timers.
//!
//! A [`Stats`] node owns a dotted prefix such as `Context.StorageManager` and
//! a set of named counters and timers. Components receive a child node, record
//! into it, and callers dump any subtree as JSON with fully qualified keys:
//!
//! ```text
//! {
//!   "counters": { "Context.StorageManager.Query.Reader.loop_num": 2, ... },
//!   "timers":   { "Context.StorageManager.Query.Reader.merge.sum": 0.004, ... }
//! }
//! ```
//!
//! Counters with the same qualified key from sibling nodes are summed in the dump.
//!
//! A parent keeps only weak references to its children. A child holds its
//! parent alive and, when dropped, folds its totals into the parent, so the
//! values of finished operations stay in the dump while the set of nodes stays
//! bounded by what is still running.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

#[derive(Debug, Default)]
struct Recorded {
    counters: BTreeMap<String, u64>,
    timers: BTreeMap<String, f64>,
}

#[derive(Debug)]
pub struct Stats {
    prefix: String,
    recorded: Mutex<Recorded>,
    // Totals of dropped descendants, keyed by qualified name.
    retired: Mutex<Recorded>,
    children: Mutex<Vec<Weak<Stats>>>,
    parent: Option<Arc<Stats>>,
}

impl Stats {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_parent(name.to_string(), None)
    }

    fn with_parent(prefix: String, parent: Option<Arc<Stats>>) -> Arc<Self> {
        Arc::new(Self {
            prefix,
            recorded: Mutex::new(Recorded::default()),
            retired: Mutex::new(Recorded::default()),
            children: Mutex::new(Vec::new()),
            parent,
        })
    }

    /// Create a new child scope `<prefix>.<name>`. Each call returns a fresh
    /// node so concurrent queries never share counters.
    pub fn child(self: &Arc<Self>, name: &str) -> Arc<Stats> {
        let child = Self::with_parent(format!("{}.{}", self.prefix, name), Some(self.clone()));
        let mut children = lock(&self.children);
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&child));
        child
    }

    #[cfg(test)]
    pub(crate) fn live_children(&self) -> usize {
        lock(&self.children)
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn add_counter(&self, name: &str, n: u64) {
        *lock(&self.recorded)
            .counters
            .entry(name.to_string())
            .or_insert(0) += n;
    }

    pub fn counter(&self, name: &str) -> u64 {
        lock(&self.recorded)
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn add_timer(&self, name: &str, secs: f64) {
        *lock(&self.recorded)
            .timers
            .entry(format!("{}.sum", name))
            .or_insert(0.0) += secs;
    }

    /// Time a scope; the elapsed seconds are added to `<name>.sum` on drop.
    pub fn start_timer<'a>(&'a self, name: &'a str) -> TimerGuard<'a> {
        TimerGuard {
            stats: self,
            name,
            started: Instant::now(),
        }
    }

    /// JSON dump of this node and every descendant.
    pub fn dump(&self) -> Value {
        let mut counters = BTreeMap::new();
        let mut timers = BTreeMap::new();
        self.collect(&mut counters, &mut timers);

        let counters: Map<String, Value> = counters
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect();
        let timers: Map<String, Value> = timers
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect();
        json!({ "counters": counters, "timers": timers })
    }

    pub fn dump_string(&self) -> String {
        serde_json::to_string_pretty(&self.dump()).unwrap_or_default()
    }

    fn collect(&self, counters: &mut BTreeMap<String, u64>, timers: &mut BTreeMap<String, f64>) {
        {
            let recorded = lock(&self.recorded);
            for (name, value) in &recorded.counters {
                *counters
                    .entry(format!("{}.{}", self.prefix, name))
                    .or_insert(0) += value;
            }
            for (name, value) in &recorded.timers {
                *timers
                    .entry(format!("{}.{}", self.prefix, name))
                    .or_insert(0.0) += value;
            }
        }
        {
            let retired = lock(&self.retired);
            for (key, value) in &retired.counters {
                *counters.entry(key.clone()).or_insert(0) += value;
            }
            for (key, value) in &retired.timers {
                *timers.entry(key.clone()).or_insert(0.0) += value;
            }
        }
        let children: Vec<Arc<Stats>> = lock(&self.children)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for child in children {
            child.collect(counters, timers);
        }
    }
}

impl Drop for Stats {
    fn drop(&mut self) {
        let Some(parent) = &self.parent else {
            return;
        };
        // Children hold their parent alive, so every descendant has already
        // been folded into this node.
        let mut counters = BTreeMap::new();
        let mut timers = BTreeMap::new();
        self.collect(&mut counters, &mut timers);

        let mut retired = lock(&parent.retired);
        for (key, value) in counters {
            *retired.counters.entry(key).or_insert(0) += value;
        }
        for (key, value) in timers {
            *retired.timers.entry(key).or_insert(0.0) += value;
        }
    }
}

// Stats are diagnostics; a panic elsewhere must not make them unusable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct TimerGuard<'a> {
    stats: &'a Stats,
    name: &'a str,
    started: Instant,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.stats
            .add_timer(self.name, self.started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_keys_are_qualified() {
        let root = Stats::new("Context");
        let reader = root.child("StorageManager").child("Query").child("Reader");
        reader.add_counter("loop_num", 1);
        reader.add_counter("loop_num", 2);

        let dump = root.dump();
        assert_eq!(
            dump["counters"]["Context.StorageManager.Query.Reader.loop_num"],
            3
        );
        assert_eq!(reader.counter("loop_num"), 3);
        assert_eq!(reader.counter("missing"), 0);
    }

    #[test]
    fn test_sibling_counters_are_summed() {
        let root = Stats::new("Context");
        root.child("Query").add_counter("cells", 4);
        root.child("Query").add_counter("cells", 6);

        assert_eq!(root.dump()["counters"]["Context.Query.cells"], 10);
    }

    #[test]
    fn test_subtree_dump_excludes_parent() {
        let root = Stats::new("Context");
        root.add_counter("opened", 1);
        let query = root.child("Query");
        query.add_counter("cells", 2);

        let dump = query.dump();
        assert!(dump["counters"].get("Context.opened").is_none());
        assert_eq!(dump["counters"]["Context.Query.cells"], 2);
    }

    #[test]
    fn test_dropped_children_are_folded_into_parent() {
        let root = Stats::new("Context");
        for _ in 0..1000 {
            let query = root.child("Query");
            let reader = query.child("Reader");
            reader.add_counter("loop_num", 1);
            query.add_counter("submits", 2);
        }
        assert_eq!(root.live_children(), 0);

        let live = root.child("Query");
        live.add_counter("submits", 1);
        assert_eq!(root.live_children(), 1);

        let dump = root.dump();
        assert_eq!(dump["counters"]["Context.Query.Reader.loop_num"], 1000);
        assert_eq!(dump["counters"]["Context.Query.submits"], 2001);
    }

    #[test]
    fn test_timer_guard_records_sum() {
        let root = Stats::new("Context");
        {
            let _timer = root.start_timer("load");
        }
        let dump = root.dump();
        assert!(dump["timers"]["Context.load.sum"].as_f64().unwrap() >= 0.0);
    }
}
