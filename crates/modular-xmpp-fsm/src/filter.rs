//! Copy-on-write chain of input/output filters.
//!
//! Outgoing data passes the filters head to tail, incoming data tail to
//! head. Readers work on immutable snapshots; mutations replace the whole
//! list. When the connection returns to the disconnected state the chain
//! is cleared and the old one is kept so its statistics stay available.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::error::FilterError;
use crate::stats::StatsReport;

/// A byte transformation layered between the transport and the XML
/// stream, e.g. compression.
#[async_trait]
pub trait InputOutputFilter: Send + Sync + 'static {
    fn filter_name(&self) -> &str;

    /// Transform outgoing bytes.
    fn output(&self, data: &[u8]) -> Result<Vec<u8>, FilterError>;

    /// Transform incoming bytes.
    fn input(&self, data: &[u8]) -> Result<Vec<u8>, FilterError>;

    /// First phase of closing: flush and stop accepting data.
    fn close_input_output(&self) {}

    /// Second phase of closing: wait until the filter is fully closed.
    async fn wait_until_input_output_closed(&self) -> Result<(), FilterError> {
        Ok(())
    }

    fn stats(&self) -> StatsReport {
        StatsReport::new()
    }
}

type Filters = Arc<Vec<Arc<dyn InputOutputFilter>>>;

#[derive(Default)]
pub struct FilterChain {
    current: RwLock<Filters>,
    previous: Mutex<Option<Filters>>,
}

impl FilterChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Filters {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Insert a filter at the head of the chain.
    pub fn add_first(&self, filter: Arc<dyn InputOutputFilter>) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        debug!(filter = filter.filter_name(), "adding filter at chain head");
        let mut filters = Vec::with_capacity(current.len() + 1);
        filters.push(filter);
        filters.extend(current.iter().cloned());
        *current = Arc::new(filters);
    }

    /// Remove `filter` (by identity). Returns whether it was in the chain.
    pub fn remove(&self, filter: &Arc<dyn InputOutputFilter>) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if !current.iter().any(|f| Arc::ptr_eq(f, filter)) {
            return false;
        }
        let filters: Vec<_> = current
            .iter()
            .filter(|f| !Arc::ptr_eq(f, filter))
            .cloned()
            .collect();
        *current = Arc::new(filters);
        true
    }

    /// Snapshot in output order.
    #[must_use]
    pub fn head_to_tail(&self) -> Vec<Arc<dyn InputOutputFilter>> {
        self.snapshot().iter().cloned().collect()
    }

    /// Snapshot in input order.
    #[must_use]
    pub fn tail_to_head(&self) -> Vec<Arc<dyn InputOutputFilter>> {
        self.snapshot().iter().rev().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Clear the chain, keeping the old filters for statistics.
    pub fn snapshot_and_clear(&self) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let old = std::mem::take(&mut *current);
        let mut previous = self.previous.lock().unwrap_or_else(PoisonError::into_inner);
        if !old.is_empty() {
            *previous = Some(old);
        }
    }

    pub fn process_output(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        let mut data = data.to_vec();
        for filter in self.snapshot().iter() {
            data = filter.output(&data)?;
        }
        Ok(data)
    }

    pub fn process_input(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        let mut data = data.to_vec();
        for filter in self.snapshot().iter().rev() {
            data = filter.input(&data)?;
        }
        Ok(data)
    }

    /// Per-filter statistics of the active chain, or of the chain preserved
    /// by the last [`snapshot_and_clear`](Self::snapshot_and_clear) while no
    /// filter is active.
    #[must_use]
    pub fn stats(&self) -> Vec<(String, StatsReport)> {
        let current = self.snapshot();
        let filters = if current.is_empty() {
            self.previous
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or(current)
        } else {
            current
        };
        filters
            .iter()
            .map(|f| (f.filter_name().to_owned(), f.stats()))
            .collect()
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.snapshot().iter().map(|filter| filter.filter_name().to_owned()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Appends its tag on output and strips it on input.
    struct TagFilter {
        tag: &'static str,
    }

    impl InputOutputFilter for TagFilter {
        fn filter_name(&self) -> &str {
            self.tag
        }

        fn output(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
            let mut out = data.to_vec();
            out.extend_from_slice(self.tag.as_bytes());
            Ok(out)
        }

        fn input(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
            data.strip_suffix(self.tag.as_bytes())
                .map(<[u8]>::to_vec)
                .ok_or_else(|| FilterError::Transform {
                    filter: self.tag.to_owned(),
                    reason: "missing tag".to_owned(),
                })
        }

        fn stats(&self) -> StatsReport {
            StatsReport::new().with("tag", self.tag)
        }
    }

    fn tag(tag: &'static str) -> Arc<dyn InputOutputFilter> {
        Arc::new(TagFilter { tag })
    }

    #[test]
    fn output_runs_head_to_tail_and_input_reverses() {
        let chain = FilterChain::new();
        chain.add_first(tag("a"));
        chain.add_first(tag("b"));

        let names: Vec<_> = chain
            .head_to_tail()
            .iter()
            .map(|f| f.filter_name().to_owned())
            .collect();
        assert_eq!(names, vec!["b", "a"]);

        let wire = chain.process_output(b"x").unwrap();
        assert_eq!(wire, b"xba");
        // Input order undoes the output transformation.
        assert_eq!(chain.process_input(&wire).unwrap(), b"x");
        assert!(chain.process_input(b"xab").is_err());
    }

    #[test]
    fn remove_by_identity() {
        let chain = FilterChain::new();
        let a = tag("a");
        chain.add_first(Arc::clone(&a));
        chain.add_first(tag("a"));
        assert!(chain.remove(&a));
        assert_eq!(chain.len(), 1);
        assert!(!chain.remove(&a));
    }

    #[test]
    fn stats_survive_clear() {
        let chain = FilterChain::new();
        assert!(chain.stats().is_empty());

        chain.add_first(tag("a"));
        chain.snapshot_and_clear();
        assert!(chain.is_empty());

        let stats = chain.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].0, "a");
        assert_eq!(stats[0].1.get("tag"), Some("a"));

        // Clearing an empty chain keeps the preserved one.
        chain.snapshot_and_clear();
        assert_eq!(chain.stats().len(), 1);
    }

    #[test]
    fn snapshots_are_stable_across_mutation() {
        let chain = FilterChain::new();
        chain.add_first(tag("a"));
        let snapshot = chain.head_to_tail();
        chain.add_first(tag("b"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(chain.tail_to_head()[0].filter_name(), "a");
    }
}
