use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    models::{Flag, Segment, TryParse},
    queries::{BigSegmentMembership, Queries},
    reason::BigSegmentsStatus,
};

/// An immutable snapshot of flags and segments.
#[derive(Debug, Default, Clone)]
pub struct DataSet {
    pub flags: HashMap<String, Arc<Flag>>,
    pub segments: HashMap<String, Arc<Segment>>,
}

#[derive(Deserialize)]
struct RawDataSet {
    #[serde(default)]
    flags: HashMap<String, TryParse<Flag>>,
    #[serde(default)]
    segments: HashMap<String, TryParse<Segment>>,
}

impl DataSet {
    pub fn new(
        flags: impl IntoIterator<Item = Flag>,
        segments: impl IntoIterator<Item = Segment>,
    ) -> DataSet {
        DataSet {
            flags: flags
                .into_iter()
                .map(|flag| (flag.key.clone(), Arc::new(flag)))
                .collect(),
            segments: segments
                .into_iter()
                .map(|segment| (segment.key.clone(), Arc::new(segment)))
                .collect(),
        }
    }

    /// Parse `{"flags": {...}, "segments": {...}}`.
    ///
    /// Flags and segments that fail to parse are logged and left out, so they evaluate as not
    /// found. Only a document that is not an object of that shape is an error.
    pub fn from_json(json: &str) -> serde_json::Result<DataSet> {
        let raw: RawDataSet = serde_json::from_str(json)?;

        let flags = raw
            .flags
            .into_iter()
            .filter_map(|(key, flag)| {
                let Some(flag) = Option::<Flag>::from(flag) else {
                    log::warn!(target: "flag_eval", flag_key:display = key; "failed to parse flag");
                    return None;
                };
                Some((key, Arc::new(flag)))
            })
            .collect();
        let segments = raw
            .segments
            .into_iter()
            .filter_map(|(key, segment)| {
                let Some(segment) = Option::<Segment>::from(segment) else {
                    log::warn!(target: "flag_eval", segment_key:display = key; "failed to parse segment");
                    return None;
                };
                Some((key, Arc::new(segment)))
            })
            .collect();

        Ok(DataSet { flags, segments })
    }
}

#[derive(Debug, Default)]
struct BigSegments {
    status: Option<BigSegmentsStatus>,
    memberships: HashMap<String, BigSegmentMembership>,
}

/// `InMemoryStore` provides a Sync storage for flags, segments, and big segment memberships that
/// allows concurrent access for readers and writers.
///
/// Readers get a consistent snapshot of the whole data set; writers replace it.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: RwLock<Arc<DataSet>>,
    big_segments: RwLock<BigSegments>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: DataSet) -> Self {
        Self {
            data: RwLock::new(Arc::new(data)),
            ..Self::default()
        }
    }

    pub fn data(&self) -> Option<Arc<DataSet>> {
        // The lock can only be poisoned by a panicking writer. Treat that as missing data instead
        // of crashing the app.
        let data = self.data.read().ok()?;
        Some(data.clone())
    }

    /// Replace the data set, returning the previous one.
    pub fn set_data(&self, data: DataSet) -> Option<Arc<DataSet>> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Arc::new(data);

        let mut slot = self.data.write().ok()?;
        Some(std::mem::replace(&mut slot, new_value))
    }

    /// Insert or replace one flag, returning the previous version.
    pub fn upsert_flag(&self, flag: Flag) -> Option<Arc<Flag>> {
        let new_value = Arc::new(flag);

        let mut slot = self.data.write().ok()?;
        Arc::make_mut(&mut slot)
            .flags
            .insert(new_value.key.clone(), new_value)
    }

    /// Insert or replace one segment, returning the previous version.
    pub fn upsert_segment(&self, segment: Segment) -> Option<Arc<Segment>> {
        let new_value = Arc::new(segment);

        let mut slot = self.data.write().ok()?;
        Arc::make_mut(&mut slot)
            .segments
            .insert(new_value.key.clone(), new_value)
    }

    /// Enable big segments and set the store health reported with every membership query.
    pub fn set_big_segments_status(&self, status: BigSegmentsStatus) {
        if let Ok(mut big_segments) = self.big_segments.write() {
            big_segments.status = Some(status);
        }
    }

    /// Set the big segment membership of one context key. Enables big segments as `HEALTHY` if
    /// they were not enabled yet.
    pub fn set_big_segment_membership(
        &self,
        context_key: impl Into<String>,
        membership: BigSegmentMembership,
    ) {
        if let Ok(mut big_segments) = self.big_segments.write() {
            big_segments.status.get_or_insert(BigSegmentsStatus::Healthy);
            big_segments
                .memberships
                .insert(context_key.into(), membership);
        }
    }
}

#[async_trait]
impl Queries for InMemoryStore {
    async fn get_flag(&self, key: &str) -> Option<Arc<Flag>> {
        self.data()?.flags.get(key).cloned()
    }

    async fn get_segment(&self, key: &str) -> Option<Arc<Segment>> {
        self.data()?.segments.get(key).cloned()
    }

    async fn get_big_segments_membership(
        &self,
        context_key: &str,
    ) -> Option<(BigSegmentMembership, BigSegmentsStatus)> {
        let big_segments = self.big_segments.read().ok()?;
        let status = big_segments.status?;
        let membership = big_segments
            .memberships
            .get(context_key)
            .cloned()
            .unwrap_or_default();
        Some((membership, status))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use serde_json::json;

    use super::*;

    fn flag(key: &str, version: u64) -> Flag {
        serde_json::from_value(json!({"key": key, "version": version})).unwrap()
    }

    #[test]
    fn parses_data_set_skipping_broken_entries() {
        let data = DataSet::from_json(
            &json!({
                "flags": {
                    "good": {"key": "good", "on": true, "variations": [1, 2]},
                    "bad": {"key": "bad", "variations": "not a list"},
                },
                "segments": {
                    "seg": {"key": "seg", "included": ["u"]},
                },
            })
            .to_string(),
        )
        .unwrap();

        assert!(data.flags.contains_key("good"));
        assert!(!data.flags.contains_key("bad"));
        assert_eq!(data.segments["seg"].included, vec!["u".to_owned()]);

        assert!(DataSet::from_json("42").is_err());
    }

    #[test]
    fn can_set_data_from_another_thread() {
        let store = Arc::new(InMemoryStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set_data(DataSet::new([flag("f", 1)], []));
            })
            .join();
        }

        assert!(store.data().unwrap().flags.contains_key("f"));
    }

    #[tokio::test]
    async fn upsert_replaces_single_items() {
        let store = InMemoryStore::with_data(DataSet::new([flag("a", 1), flag("b", 1)], []));
        let before = store.data().unwrap();

        let previous = store.upsert_flag(flag("a", 2));
        assert_eq!(previous.unwrap().version, 1);
        assert_eq!(store.get_flag("a").await.unwrap().version, 2);
        assert_eq!(store.get_flag("b").await.unwrap().version, 1);
        assert!(store.get_flag("c").await.is_none());

        // Earlier snapshots are unaffected.
        assert_eq!(before.flags["a"].version, 1);

        store.upsert_segment(serde_json::from_value(json!({"key": "s"})).unwrap());
        assert!(store.get_segment("s").await.is_some());
    }

    #[tokio::test]
    async fn big_segments_membership() {
        let store = InMemoryStore::new();
        assert_eq!(store.get_big_segments_membership("u").await, None);

        store.set_big_segment_membership("u", HashMap::from([("seg.g1".to_owned(), true)]));
        assert_eq!(
            store.get_big_segments_membership("u").await,
            Some((
                HashMap::from([("seg.g1".to_owned(), true)]),
                BigSegmentsStatus::Healthy
            ))
        );

        store.set_big_segments_status(BigSegmentsStatus::Stale);
        assert_eq!(
            store.get_big_segments_membership("other").await,
            Some((HashMap::new(), BigSegmentsStatus::Stale))
        );
    }
}
