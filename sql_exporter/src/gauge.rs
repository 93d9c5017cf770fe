//! The exported gauge state.
//!
//! [`GaugeStore`] holds, per metric name, the label combinations currently
//! exported and their values. Every query tick reconciles its points into the
//! store with replace semantics: the combinations present in the tick are the
//! only ones that survive it.
//!
//! Label key order for a metric is fixed when the metric is first seen. The
//! order comes from the column order of the first row of that tick, which the
//! data source is assumed to keep stable. If a later tick reports a different
//! order the values are re-aligned by label name and a warning is logged.

use std::sync::{PoisonError, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::row::{MetricPoint, format_label_value};

/// The exported state of one metric name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaugeSeries {
    label_keys: Vec<String>,
    current: FxHashMap<Vec<String>, f64>,
}

impl GaugeSeries {
    fn new(label_keys: Vec<String>) -> Self {
        Self {
            label_keys,
            current: FxHashMap::default(),
        }
    }

    /// Label names, in exposition order.
    #[must_use]
    pub fn label_keys(&self) -> &[String] {
        &self.label_keys
    }

    /// Label value combination to value. Every key has the same arity as
    /// [`GaugeSeries::label_keys`].
    #[must_use]
    pub fn current(&self) -> &FxHashMap<Vec<String>, f64> {
        &self.current
    }

    /// Value for one label combination, in label key order.
    #[must_use]
    pub fn get(&self, label_values: &[&str]) -> Option<f64> {
        let key: Vec<String> = label_values.iter().map(|v| (*v).to_string()).collect();
        self.current.get(&key).copied()
    }

    /// The single value of a labelless metric.
    #[must_use]
    pub fn scalar(&self) -> Option<f64> {
        if self.label_keys.is_empty() {
            self.current.get(&Vec::new()).copied()
        } else {
            None
        }
    }

    /// Number of exported label combinations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current.len()
    }

    /// Whether nothing is exported for this metric.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    fn set_scalar(&mut self, value: f64) {
        self.current.clear();
        self.current.insert(Vec::new(), value);
    }

    fn replace(&mut self, next: FxHashMap<Vec<String>, f64>) {
        let stale: Vec<Vec<String>> = self
            .current
            .keys()
            .filter(|k| !next.contains_key(*k))
            .cloned()
            .collect();
        for label_values in &stale {
            self.current.remove(label_values);
        }
        if !stale.is_empty() {
            debug!("removed {} stale label combinations", stale.len());
        }

        for (label_values, value) in next {
            if self.label_keys.is_empty() {
                self.set_scalar(value);
            } else {
                self.current.insert(label_values, value);
            }
        }
    }
}

/// The points of one tick for one metric name.
#[derive(Debug, Default)]
struct Snapshot {
    label_keys: Vec<String>,
    values: FxHashMap<Vec<String>, f64>,
}

impl Snapshot {
    /// Re-key `values` so that label values follow `keys`.
    fn realign(self, keys: &[String]) -> FxHashMap<Vec<String>, f64> {
        let positions: Vec<Option<usize>> = keys
            .iter()
            .map(|k| self.label_keys.iter().position(|own| own == k))
            .collect();
        self.values
            .into_iter()
            .map(|(label_values, value)| {
                let aligned = positions
                    .iter()
                    .map(|pos| pos.map_or_else(String::new, |p| label_values[p].clone()))
                    .collect();
                (aligned, value)
            })
            .collect()
    }
}

/// Process-wide exported gauge state, keyed by metric name.
///
/// All mutation goes through [`GaugeStore::reconcile`], which holds the write
/// lock for the whole call so that readers never observe a partially applied
/// tick.
#[derive(Debug, Default)]
pub struct GaugeStore {
    series: RwLock<FxHashMap<String, GaugeSeries>>,
}

impl GaugeStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the exported state of `names` with `points`.
    ///
    /// `names` are the metric names owned by the calling query. Points are
    /// grouped by metric name; any name in `names` that receives no point has
    /// every label combination removed. Two points with the same name and
    /// label values in one call: the later one wins.
    pub fn reconcile(&self, names: &[String], points: &[MetricPoint]) {
        let mut grouped: FxHashMap<String, Snapshot> = FxHashMap::default();

        for point in points {
            let snapshot = grouped
                .entry(point.metric_name())
                .or_insert_with(|| Snapshot {
                    label_keys: point.labels.iter().map(|(k, _)| k.clone()).collect(),
                    values: FxHashMap::default(),
                });
            let label_values = snapshot
                .label_keys
                .iter()
                .map(|key| {
                    point
                        .labels
                        .iter()
                        .find_map(|(k, v)| (k == key).then(|| format_label_value(v)))
                        .unwrap_or_default()
                })
                .collect();
            snapshot.values.insert(label_values, point.value);
        }
        for name in names {
            grouped.entry(name.clone()).or_default();
        }

        let mut series = self.series.write().unwrap_or_else(PoisonError::into_inner);
        for (name, snapshot) in grouped {
            if snapshot.values.is_empty() && !series.contains_key(&name) {
                continue;
            }
            let gauge = series
                .entry(name)
                .or_insert_with(|| GaugeSeries::new(snapshot.label_keys.clone()));

            let next = if snapshot.values.is_empty() || snapshot.label_keys == gauge.label_keys {
                snapshot.values
            } else {
                warn!(
                    "label keys changed from {:?} to {:?}, realigning by name",
                    gauge.label_keys, snapshot.label_keys
                );
                snapshot.realign(&gauge.label_keys)
            };
            gauge.replace(next);
        }
    }

    /// A copy of one metric's exported state.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<GaugeSeries> {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// A copy of every metric's exported state, sorted by metric name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, GaugeSeries)> {
        let mut all: Vec<(String, GaugeSeries)> = self
            .series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, series)| (name.clone(), series.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Number of metric names ever seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no metric name has been seen yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::{collection::btree_set, prelude::*};

    use super::*;
    use crate::row::Labels;

    fn point(name: &str, labels: &[(&str, &str)], value: f64) -> MetricPoint {
        let labels: Labels = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), vec![(*v).to_string()]))
            .collect();
        MetricPoint {
            name: name.split('_').map(ToString::to_string).collect(),
            labels: Arc::new(labels),
            value,
        }
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn first_tick_creates_series() {
        let store = GaugeStore::new();
        store.reconcile(
            &names(&["load_cpu"]),
            &[
                point("load_cpu", &[("host", "a")], 1.5),
                point("load_cpu", &[("host", "b")], 2.25),
            ],
        );

        let series = store.get("load_cpu").expect("series missing");
        assert_eq!(series.label_keys(), ["host".to_string()]);
        assert_eq!(series.len(), 2);
        assert_eq!(series.get(&["a"]), Some(1.5));
        assert_eq!(series.get(&["b"]), Some(2.25));
    }

    #[test]
    fn lookup_requires_full_label_tuple() {
        let store = GaugeStore::new();
        store.reconcile(
            &names(&["load_cpu"]),
            &[point("load_cpu", &[("host", "a"), ("dc", "x")], 4.0)],
        );

        let series = store.get("load_cpu").expect("series missing");
        assert_eq!(series.get(&["a", "x"]), Some(4.0));
        assert_eq!(series.get(&["a"]), None);
        assert_eq!(series.get(&["x", "a"]), None);
        assert_eq!(series.get(&[]), None);
    }

    #[test]
    fn absent_combination_is_removed() {
        let store = GaugeStore::new();
        let owned = names(&["load_cpu"]);
        store.reconcile(
            &owned,
            &[
                point("load_cpu", &[("host", "a")], 1.5),
                point("load_cpu", &[("host", "b")], 2.25),
            ],
        );
        store.reconcile(&owned, &[point("load_cpu", &[("host", "a")], 3.0)]);

        let series = store.get("load_cpu").expect("series missing");
        assert_eq!(series.len(), 1);
        assert_eq!(series.get(&["a"]), Some(3.0));
        assert_eq!(series.get(&["b"]), None);
    }

    #[test]
    fn empty_tick_clears_owned_names() {
        let store = GaugeStore::new();
        let owned = names(&["load_cpu"]);
        store.reconcile(
            &owned,
            &[
                point("load_cpu", &[("host", "a")], 1.5),
                point("load_cpu", &[("host", "b")], 2.25),
            ],
        );
        store.reconcile(&owned, &[]);

        let series = store.get("load_cpu").expect("series is never destroyed");
        assert!(series.is_empty());
        assert_eq!(series.label_keys(), ["host".to_string()]);
    }

    #[test]
    fn empty_tick_for_unseen_name_creates_nothing() {
        let store = GaugeStore::new();
        store.reconcile(&names(&["load_cpu"]), &[]);
        assert!(store.is_empty());
    }

    #[test]
    fn other_queries_are_untouched() {
        let store = GaugeStore::new();
        store.reconcile(
            &names(&["load_cpu"]),
            &[point("load_cpu", &[("host", "a")], 1.0)],
        );
        store.reconcile(
            &names(&["disk_free"]),
            &[point("disk_free", &[("mount", "/")], 9.0)],
        );
        store.reconcile(&names(&["disk_free"]), &[]);

        assert_eq!(
            store.get("load_cpu").and_then(|s| s.get(&["a"])),
            Some(1.0)
        );
        assert!(store.get("disk_free").is_some_and(|s| s.is_empty()));
    }

    #[test]
    fn identical_ticks_are_idempotent() {
        let store = GaugeStore::new();
        let owned = names(&["load_cpu"]);
        let points = [
            point("load_cpu", &[("host", "a")], 1.5),
            point("load_cpu", &[("host", "b")], 2.25),
        ];
        store.reconcile(&owned, &points);
        let first = store.snapshot();
        store.reconcile(&owned, &points);
        assert_eq!(first, store.snapshot());
    }

    #[test]
    fn labelless_metric_holds_one_scalar() {
        let store = GaugeStore::new();
        let owned = names(&["sessions_total"]);
        store.reconcile(&owned, &[point("sessions_total", &[], 10.0)]);
        store.reconcile(&owned, &[point("sessions_total", &[], 12.0)]);

        let series = store.get("sessions_total").expect("series missing");
        assert!(series.label_keys().is_empty());
        assert_eq!(series.len(), 1);
        assert_eq!(series.scalar(), Some(12.0));

        store.reconcile(&owned, &[]);
        let series = store.get("sessions_total").expect("series missing");
        assert_eq!(series.scalar(), None);
    }

    #[test]
    fn duplicate_combination_last_write_wins() {
        let store = GaugeStore::new();
        store.reconcile(
            &names(&["load_cpu"]),
            &[
                point("load_cpu", &[("host", "a")], 1.0),
                point("load_cpu", &[("host", "a")], 2.0),
            ],
        );
        let series = store.get("load_cpu").expect("series missing");
        assert_eq!(series.len(), 1);
        assert_eq!(series.get(&["a"]), Some(2.0));
    }

    #[test]
    fn changed_label_order_is_realigned() {
        let store = GaugeStore::new();
        let owned = names(&["load_cpu"]);
        store.reconcile(
            &owned,
            &[point("load_cpu", &[("host", "a"), ("dc", "x")], 1.0)],
        );
        store.reconcile(
            &owned,
            &[point("load_cpu", &[("dc", "x"), ("host", "a")], 2.0)],
        );

        let series = store.get("load_cpu").expect("series missing");
        assert_eq!(series.label_keys(), ["host".to_string(), "dc".to_string()]);
        assert_eq!(series.len(), 1);
        assert_eq!(series.get(&["a", "x"]), Some(2.0));
    }

    #[test]
    fn multi_part_label_values_are_joined() {
        let store = GaugeStore::new();
        let p = MetricPoint {
            name: vec!["q".to_string(), "v".to_string()],
            labels: Arc::new(vec![(
                "site".to_string(),
                vec!["eu".to_string(), "west".to_string()],
            )]),
            value: 1.0,
        };
        store.reconcile(&names(&["q_v"]), &[p]);
        let series = store.get("q_v").expect("series missing");
        assert_eq!(series.get(&["eu_west"]), Some(1.0));
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let store = GaugeStore::new();
        store.reconcile(
            &names(&["b_x", "a_x"]),
            &[point("b_x", &[], 1.0), point("a_x", &[], 2.0)],
        );
        let order: Vec<String> = store.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["a_x".to_string(), "b_x".to_string()]);
    }

    proptest! {
        #[test]
        fn store_matches_latest_tick(
            first in btree_set("[a-z]{1,4}", 0..8),
            second in btree_set("[a-z]{1,4}", 0..8),
        ) {
            let store = GaugeStore::new();
            let owned = names(&["load_cpu"]);
            for hosts in [&first, &second] {
                let points: Vec<MetricPoint> = hosts
                    .iter()
                    .map(|h| point("load_cpu", &[("host", h.as_str())], 1.0))
                    .collect();
                store.reconcile(&owned, &points);
            }

            let exported: std::collections::BTreeSet<String> = store
                .get("load_cpu")
                .map(|s| s.current().keys().map(|k| k[0].clone()).collect())
                .unwrap_or_default();
            prop_assert_eq!(exported, second);
        }
    }
}
