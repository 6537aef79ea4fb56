use std::collections::BTreeSet;

use crate::error::SymlabError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SampleUnit {
    #[default]
    Interval,
    Total,
}

impl SampleUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleUnit::Interval => "interval",
            SampleUnit::Total => "total",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplePolicy {
    unit: SampleUnit,
    resolution: u64,
}

impl SamplePolicy {
    pub fn new(unit: SampleUnit, resolution: i64) -> Result<Self, SymlabError> {
        if resolution < 1 {
            return Err(SymlabError::InvalidResolution(resolution));
        }
        Ok(Self {
            unit,
            resolution: resolution as u64,
        })
    }

    pub fn unit(&self) -> SampleUnit {
        self.unit
    }

    pub fn resolution(&self) -> u64 {
        self.resolution
    }

    pub fn sample(&self, indices: &[i64]) -> BTreeSet<i64> {
        let distinct: BTreeSet<i64> = indices.iter().copied().collect();
        let Some(&last) = distinct.iter().next_back() else {
            return distinct;
        };
        let mut kept: BTreeSet<i64> = match self.unit {
            SampleUnit::Interval => {
                let r = self.resolution as i128;
                distinct
                    .iter()
                    .copied()
                    .filter(|i| (*i as i128).rem_euclid(r) == 0)
                    .collect()
            }
            SampleUnit::Total => spread(&distinct, self.resolution),
        };
        kept.insert(last);
        kept
    }
}

fn spread(distinct: &BTreeSet<i64>, count: u64) -> BTreeSet<i64> {
    if distinct.len() as u64 <= count {
        return distinct.clone();
    }
    let sorted: Vec<i64> = distinct.iter().copied().collect();
    let first = sorted[0] as i128;
    let last = sorted[sorted.len() - 1] as i128;
    if count == 1 {
        return BTreeSet::from([last as i64]);
    }
    let steps = (count - 1) as i128;
    (0..count as i128)
        .filter_map(|k| {
            let target = first + (last - first) * k / steps;
            nearest_index(target as i64, sorted.iter().copied())
        })
        .collect()
}

/// Closest element of `indices` to `target`. On a tie the smaller index
/// wins. `None` only when `indices` is empty.
pub fn nearest_index(target: i64, indices: impl IntoIterator<Item = i64>) -> Option<i64> {
    indices
        .into_iter()
        .min_by_key(|i| ((*i as i128 - target as i128).abs(), *i))
}

pub fn resolve_target(target: Option<i64>, indices: &[i64]) -> Option<i64> {
    match target {
        None => indices.last().copied(),
        Some(t) => nearest_index(t, indices.iter().copied()),
    }
}

pub fn reached_target(target: Option<i64>, indices: &[i64]) -> bool {
    match target {
        None => true,
        Some(t) => indices.contains(&t),
    }
}
