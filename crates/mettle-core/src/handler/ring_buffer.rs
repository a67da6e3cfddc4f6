//! Time-windowed in-memory metric store.
//!
//! Entries are appended in arrival order and evicted by a periodic sweep
//! ([`RingBuffer::tidy_up`]) once they are older than the retention window.
//! Reads never evict. One `RwLock` guards the sequence: the dispatch path
//! writes, query and sweep paths read or evict.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use crate::metric::{Filter, Metric};

#[derive(Debug)]
struct Entry {
    metric: Metric,
    inserted_at: Instant,
}

#[derive(Debug)]
pub struct RingBuffer {
    retention: Duration,
    entries: RwLock<VecDeque<Entry>>,
}

impl RingBuffer {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Appends a metric unless it opted out of buffering. Returns whether it
    /// was stored.
    pub fn enqueue(&self, metric: Metric) -> bool {
        if !metric.buffered {
            return false;
        }
        self.entries.write().push_back(Entry {
            metric,
            inserted_at: Instant::now(),
        });
        true
    }

    /// Snapshot of every retained metric in insertion order.
    pub fn values(&self) -> Vec<Metric> {
        self.collect_where(|_| true)
    }

    /// Retained metrics NOT matching `filter`.
    pub fn filter(&self, filter: &Filter) -> Vec<Metric> {
        self.collect_where(|m| !filter.matches(m))
    }

    /// Retained metrics matching `filter`.
    pub fn matching(&self, filter: &Filter) -> Vec<Metric> {
        self.collect_where(|m| filter.matches(m))
    }

    fn collect_where(&self, keep: impl Fn(&Metric) -> bool) -> Vec<Metric> {
        self.entries
            .read()
            .iter()
            .filter(|e| keep(&e.metric))
            .map(|e| e.metric.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Evicts entries older than the retention window. Returns the number
    /// of evicted entries.
    pub fn tidy_up(&self) -> usize {
        self.tidy_up_at(Instant::now())
    }

    /// [`tidy_up`](Self::tidy_up) as of `now`.
    pub fn tidy_up_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        // Insertion order is also age order.
        while let Some(front) = entries.front() {
            if now.saturating_duration_since(front.inserted_at) <= self.retention {
                break;
            }
            entries.pop_front();
        }
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{Dimensions, MetricType};
    use std::sync::Arc;

    fn filled(retention: Duration) -> RingBuffer {
        let ring = RingBuffer::new(retention);
        for i in 0..5 {
            assert!(ring.enqueue(Metric::new(format!("m{i}")).with_value(i as f64)));
        }
        ring
    }

    #[test]
    fn test_values_in_insertion_order() {
        let ring = filled(Duration::from_secs(300));
        let names: Vec<String> = ring.values().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(ring.len(), 5);
    }

    #[test]
    fn test_tidy_up_after_retention() {
        let ring = filled(Duration::from_secs(300));
        assert_eq!(ring.tidy_up(), 0);
        assert_eq!(ring.len(), 5);

        let later = Instant::now() + Duration::from_secs(301);
        assert_eq!(ring.tidy_up_at(later), 5);
        assert!(ring.is_empty());
        assert!(ring.values().is_empty());
    }

    #[test]
    fn test_unbuffered_metrics_are_not_retained() {
        let ring = RingBuffer::new(Duration::from_secs(300));
        let mut m = Metric::new("one-shot");
        m.disable_buffering();
        assert!(!ring.enqueue(m));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_filter_and_matching_are_complements() {
        let ring = filled(Duration::from_secs(300));
        let f = Filter::new("m0", None, Dimensions::new()).unwrap();

        let rest = ring.filter(&f);
        assert_eq!(rest.len(), 4);
        assert!(rest.iter().all(|m| m.name != "m0"));

        let hit = ring.matching(&f);
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].name, "m0");
    }

    #[test]
    fn test_matching_by_type() {
        let ring = RingBuffer::new(Duration::from_secs(300));
        ring.enqueue(Metric::new("a").with_type(MetricType::Counter));
        ring.enqueue(Metric::new("b"));
        let f = Filter::new(".*", Some(MetricType::Counter), Dimensions::new()).unwrap();
        assert_eq!(ring.matching(&f).len(), 1);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let ring = Arc::new(RingBuffer::new(Duration::from_secs(300)));
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        ring.enqueue(Metric::new(format!("t{t}-{i}")));
                    }
                })
            })
            .collect();
        let reader = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let _ = ring.values();
                    ring.tidy_up();
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(ring.len(), 1000);
    }
}
