//! The data access interface the evaluator depends on.
use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    models::{Flag, Segment},
    reason::BigSegmentsStatus,
};

/// Big segment membership of one context key, keyed by `"<segmentKey>.g<generation>"`.
///
/// `true` means included, `false` means explicitly excluded. Segments that are absent from the map
/// fall back to the segment's rules.
pub type BigSegmentMembership = HashMap<String, bool>;

/// Read-only access to flags, segments, and big segment membership.
///
/// The evaluator awaits these calls one at a time and never concurrently within one evaluation.
#[async_trait]
pub trait Queries: Send + Sync {
    async fn get_flag(&self, key: &str) -> Option<Arc<Flag>>;

    async fn get_segment(&self, key: &str) -> Option<Arc<Segment>>;

    /// Membership of the context with key `context_key` in all big segments, along with the
    /// health of the big segment store. `None` means big segments are not configured.
    async fn get_big_segments_membership(
        &self,
        context_key: &str,
    ) -> Option<(BigSegmentMembership, BigSegmentsStatus)>;
}

#[async_trait]
impl<Q: Queries + ?Sized> Queries for Arc<Q> {
    async fn get_flag(&self, key: &str) -> Option<Arc<Flag>> {
        (**self).get_flag(key).await
    }

    async fn get_segment(&self, key: &str) -> Option<Arc<Segment>> {
        (**self).get_segment(key).await
    }

    async fn get_big_segments_membership(
        &self,
        context_key: &str,
    ) -> Option<(BigSegmentMembership, BigSegmentsStatus)> {
        (**self).get_big_segments_membership(context_key).await
    }
}
