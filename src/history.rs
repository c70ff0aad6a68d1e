//! Bounded in-memory history ring.
//!
//! A session's history is a set of parallel arrays — one timestamp array and
//! one array per measurement name — capped at a fixed capacity. Appending
//! past capacity drops the oldest sample in O(1) amortized time; nothing here
//! ever copies the whole buffer to make room, only to produce a snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// A bounded parallel-array ring: one timestamp per sample, one named
/// measurement column per sample. All columns and the timestamp deque always
/// have equal length.
#[derive(Debug, Clone)]
pub struct History {
    capacity: usize,
    timestamps: VecDeque<DateTime<Utc>>,
    columns: HashMap<String, VecDeque<Option<f64>>>,
}

impl History {
    /// Builds an empty history capped at `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            timestamps: VecDeque::with_capacity(capacity.min(1024)),
            columns: HashMap::new(),
        }
    }

    /// Number of samples currently retained.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Appends one sample: a timestamp plus a named measurement value for
    /// each column in `values` (`None` for an invalid/sentinel reading).
    /// Columns not present in `values` get `None` for this sample, keeping
    /// every column's length equal to the timestamp deque's.
    pub fn push(&mut self, timestamp: DateTime<Utc>, values: &HashMap<String, Option<f64>>) {
        for name in values.keys() {
            self.columns
                .entry(name.clone())
                .or_insert_with(|| VecDeque::from(vec![None; self.timestamps.len()]));
        }
        for (name, column) in self.columns.iter_mut() {
            column.push_back(values.get(name).copied().flatten());
        }
        self.timestamps.push_back(timestamp);

        if self.timestamps.len() > self.capacity {
            self.timestamps.pop_front();
            for column in self.columns.values_mut() {
                column.pop_front();
            }
        }
    }

    /// A full snapshot: timestamps plus every column, in insertion order.
    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            timestamps: self.timestamps.iter().copied().collect(),
            columns: self
                .columns
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
                .collect(),
        }
    }
}

/// An owned copy of a [`History`]'s contents at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySnapshot {
    /// Sample timestamps, oldest first.
    pub timestamps: Vec<DateTime<Utc>>,
    /// Measurement columns keyed by name, each the same length as `timestamps`.
    pub columns: HashMap<String, Vec<Option<f64>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(v: f64) -> HashMap<String, Option<f64>> {
        HashMap::from([("voltage".to_string(), Some(v))])
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(0, 0).unwrap()
    }

    #[test]
    fn caps_length_and_keeps_columns_aligned() {
        let mut h = History::new(3);
        let t0 = epoch();
        for i in 0..5 {
            h.push(t0 + Duration::seconds(i), &sample(i as f64));
        }
        assert_eq!(h.len(), 3);
        let snap = h.snapshot();
        assert_eq!(snap.timestamps.len(), 3);
        assert_eq!(snap.columns["voltage"].len(), 3);
        assert_eq!(snap.columns["voltage"], vec![Some(2.0), Some(3.0), Some(4.0)]);
    }

    #[test]
    fn new_column_backfills_none_for_prior_samples() {
        let mut h = History::new(10);
        h.push(epoch(), &sample(1.0));
        let mut second = HashMap::new();
        second.insert("voltage".to_string(), Some(2.0));
        second.insert("current".to_string(), Some(0.5));
        h.push(epoch() + Duration::seconds(1), &second);

        let snap = h.snapshot();
        assert_eq!(snap.columns["current"], vec![None, Some(0.5)]);
        assert_eq!(snap.columns["voltage"], vec![Some(1.0), Some(2.0)]);
    }
}
