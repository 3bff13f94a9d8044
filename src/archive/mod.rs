//! Retention policy: which aged or excess segments to delete or move to the
//! secondary medium.
//!
//! Policy strings look like `"delete"` or `"swap,days:30;disk:1073741824"`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use crate::core::date::DateBucket;
use crate::core::error::{Error, Result};
use crate::core::types::SegmentId;
use crate::meta::state::{MetaState, SegmentSchema};
use crate::storage::layout::Medium;

pub const CRITERIA_DAYS: &str = "days";
pub const CRITERIA_DISK: &str = "disk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    /// Retire matching segments.
    Delete,
    /// Move matching segments to the secondary medium; they stay searchable.
    Swap,
}

impl ArchiveType {
    pub fn name(&self) -> &'static str {
        match self {
            ArchiveType::Delete => "delete",
            ArchiveType::Swap => "swap",
        }
    }
}

impl FromStr for ArchiveType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "delete" => Ok(ArchiveType::Delete),
            "swap" => Ok(ArchiveType::Swap),
            other => Err(Error::invalid_argument(format!("unknown archive type '{}'", other))),
        }
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConf {
    kind: ArchiveType,
    criteria: BTreeMap<String, u64>,
}

impl ArchiveConf {
    pub fn new(kind: &str, criteria: &str) -> Result<Self> {
        Ok(ArchiveConf {
            kind: kind.parse()?,
            criteria: parse_criteria(criteria)?,
        })
    }

    /// Parse `"<type>"` or `"<type>,<criteria>"`.
    pub fn parse(policy: &str) -> Result<Self> {
        match policy.split_once(',') {
            Some((kind, criteria)) => Self::new(kind, criteria),
            None => Self::new(policy, ""),
        }
    }

    pub fn kind(&self) -> ArchiveType {
        self.kind
    }

    pub fn criteria(&self) -> &BTreeMap<String, u64> {
        &self.criteria
    }

    pub fn days(&self) -> Option<u64> {
        self.criteria.get(CRITERIA_DAYS).copied()
    }

    pub fn disk(&self) -> Option<u64> {
        self.criteria.get(CRITERIA_DISK).copied()
    }

    /// Segments the policy applies to, given the current record set.
    pub fn select_targets(&self, state: &MetaState, today: DateBucket) -> Vec<SegmentSchema> {
        // Swap only relieves the primary medium
        let eligible: Vec<&SegmentSchema> = state
            .segments
            .values()
            .filter(|s| s.is_active())
            .filter(|s| self.kind == ArchiveType::Delete || s.medium == Medium::Primary)
            .collect();

        let mut selected: BTreeSet<SegmentId> = BTreeSet::new();

        if let Some(cutoff) = self.days().and_then(|days| today.days_before(days)) {
            selected.extend(eligible.iter().filter(|s| s.date < cutoff).map(|s| s.id));
        }

        if let Some(limit) = self.disk() {
            let mut oldest_first = eligible.clone();
            oldest_first.sort_by_key(|s| (s.date, s.id));

            let mut total: u64 = eligible.iter().map(|s| s.byte_size + s.index_byte_size).sum();
            for segment in oldest_first {
                if total <= limit {
                    break;
                }
                total = total.saturating_sub(segment.byte_size + segment.index_byte_size);
                selected.insert(segment.id);
            }
        }

        eligible
            .into_iter()
            .filter(|s| selected.contains(&s.id))
            .cloned()
            .collect()
    }
}

fn parse_criteria(criteria: &str) -> Result<BTreeMap<String, u64>> {
    let mut parsed = BTreeMap::new();
    for token in criteria.split(';').map(str::trim).filter(|t| !t.is_empty()) {
        let (dimension, value) = token
            .split_once(':')
            .ok_or_else(|| Error::invalid_argument(format!("archive criteria '{}' has no value", token)))?;
        let dimension = dimension.trim();
        if dimension != CRITERIA_DAYS && dimension != CRITERIA_DISK {
            return Err(Error::invalid_argument(format!("unknown archive criteria '{}'", dimension)));
        }
        let value: u64 = value.trim().parse().map_err(|_| {
            Error::invalid_argument(format!("archive criteria '{}' needs a numeric value, got '{}'", dimension, value))
        })?;
        parsed.insert(dimension.to_string(), value);
    }
    Ok(parsed)
}
