//! Data carried from the remote API into the pipeline

use crate::state::QuotaSnapshot;
use chrono::{DateTime, Utc};
use std::fmt;

/// Opaque continuation token returned by the search API
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One observed repository
///
/// `stable_id` is GitHub's node id and never changes for the same repository;
/// every other field is replaced by the latest observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub stable_id: String,
    pub owner: String,
    pub name: String,
    pub popularity_count: u64,
    pub observed_at: DateTime<Utc>,
}

impl Record {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Result of one search call
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Records in the order the API returned them (possibly empty)
    pub records: Vec<Record>,

    /// `None` once the sequence is exhausted
    pub next_cursor: Option<Cursor>,

    /// Quota information carried by the response, if any
    pub quota: Option<QuotaSnapshot>,
}

impl Page {
    /// True when this page ends the partition's sequence
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// A disjoint slice of the search space, crawled independently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub id: String,
    /// Qualifiers placed in front of the star range, e.g. `is:public`
    pub query: String,
    pub min_stars: u64,
    /// Inclusive upper bound; open-ended when `None`
    pub max_stars: Option<u64>,
}

impl PartitionSpec {
    pub fn new(id: impl Into<String>, min_stars: u64, max_stars: Option<u64>) -> Self {
        Self {
            id: id.into(),
            query: "is:public".to_string(),
            min_stars,
            max_stars,
        }
    }

    /// The search string sent to the API for this partition
    pub fn search_query(&self) -> String {
        let range = match self.max_stars {
            Some(max) if max == self.min_stars => format!("stars:{}", max),
            Some(max) => format!("stars:{}..{}", self.min_stars, max),
            None => format!("stars:>={}", self.min_stars),
        };

        let prefix = self.query.trim();
        if prefix.is_empty() {
            format!("{} sort:stars-desc", range)
        } else {
            format!("{} {} sort:stars-desc", prefix, range)
        }
    }

    /// True if the two star ranges share at least one value
    pub fn overlaps(&self, other: &PartitionSpec) -> bool {
        let self_max = self.max_stars.unwrap_or(u64::MAX);
        let other_max = other.max_stars.unwrap_or(u64::MAX);
        self.min_stars <= other_max && other.min_stars <= self_max
    }
}

/// Splits `[min, max]` into at most `count` contiguous, disjoint ranges
///
/// Partition ids are `stars-{min}-{max}`. Widths differ by at most one.
pub fn split_star_range(min: u64, max: u64, count: u32, query: &str) -> Vec<PartitionSpec> {
    if count == 0 || max < min {
        return Vec::new();
    }

    let width = max - min + 1;
    let parts = u64::from(count).min(width);
    let base = width / parts;
    let extra = width % parts;

    let mut specs = Vec::with_capacity(parts as usize);
    let mut lower = min;
    for i in 0..parts {
        let span = base + u64::from(i < extra);
        let upper = lower + span - 1;
        specs.push(PartitionSpec {
            id: format!("stars-{}-{}", lower, upper),
            query: query.to_string(),
            min_stars: lower,
            max_stars: Some(upper),
        });
        lower = upper + 1;
    }

    specs
}
