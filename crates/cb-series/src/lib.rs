#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cb_units::{Quantity, Unit, UnitError};

pub type Year = i32;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SeriesError {
    #[error("duplicate year {year} in series construction")]
    DuplicateYear { year: Year },
    #[error("year {year} is present in only one operand")]
    MisalignedYears { year: Year },
    #[error(
        "year ranges do not overlap (left {left_first}..={left_last}, right {right_first}..={right_last})"
    )]
    DisjointYears {
        left_first: Year,
        left_last: Year,
        right_first: Year,
        right_last: Year,
    },
    #[error("operation requires a non-empty series")]
    EmptySeries,
    #[error("no value for year {year} in right operand")]
    MissingYear { year: Year },
    #[error("missing value at year {year} cannot enter a cumulative sum")]
    MissingValue { year: Year },
    #[error(transparent)]
    Unit(#[from] UnitError),
}

/// How two series with differing year sets combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignPolicy {
    /// Year sets must match exactly; a mismatch is an error.
    Strict,
    /// Truncate both operands to the year overlap; an empty overlap is an error.
    Intersect,
}

/// A year-indexed sequence of quantities, ascending by year.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct YearSeries {
    points: BTreeMap<Year, Quantity>,
}

impl YearSeries {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points(
        points: impl IntoIterator<Item = (Year, Quantity)>,
    ) -> Result<Self, SeriesError> {
        let mut out = BTreeMap::new();
        for (year, value) in points {
            if out.insert(year, value).is_some() {
                return Err(SeriesError::DuplicateYear { year });
            }
        }
        Ok(Self { points: out })
    }

    pub fn insert(&mut self, year: Year, value: Quantity) -> Option<Quantity> {
        self.points.insert(year, value)
    }

    #[must_use]
    pub fn get(&self, year: Year) -> Option<&Quantity> {
        self.points.get(&year)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<(Year, &Quantity)> {
        self.points.iter().next().map(|(y, v)| (*y, v))
    }

    #[must_use]
    pub fn last(&self) -> Option<(Year, &Quantity)> {
        self.points.iter().next_back().map(|(y, v)| (*y, v))
    }

    #[must_use]
    pub fn first_year(&self) -> Option<Year> {
        self.points.keys().next().copied()
    }

    #[must_use]
    pub fn last_year(&self) -> Option<Year> {
        self.points.keys().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Year, &Quantity)> {
        self.points.iter().map(|(y, v)| (*y, v))
    }

    pub fn years(&self) -> impl Iterator<Item = Year> + '_ {
        self.points.keys().copied()
    }

    /// Points with year >= `year`.
    #[must_use]
    pub fn from_year(&self, year: Year) -> Self {
        Self {
            points: self
                .points
                .range(year..)
                .map(|(y, v)| (*y, v.clone()))
                .collect(),
        }
    }

    /// Points within `first..=last`.
    #[must_use]
    pub fn clamp_years(&self, first: Year, last: Year) -> Self {
        Self {
            points: self
                .points
                .range(first..=last)
                .map(|(y, v)| (*y, v.clone()))
                .collect(),
        }
    }

    /// Restrict to the years also present in `other`.
    #[must_use]
    pub fn restrict_to(&self, other: &Self) -> Self {
        Self {
            points: self
                .points
                .iter()
                .filter(|(y, _)| other.points.contains_key(y))
                .map(|(y, v)| (*y, v.clone()))
                .collect(),
        }
    }

    fn overlap_years(&self, other: &Self) -> Vec<Year> {
        self.points
            .keys()
            .filter(|y| other.points.contains_key(y))
            .copied()
            .collect()
    }

    fn disjoint_error(&self, other: &Self) -> SeriesError {
        match (
            self.first_year(),
            self.last_year(),
            other.first_year(),
            other.last_year(),
        ) {
            (Some(lf), Some(ll), Some(rf), Some(rl)) => SeriesError::DisjointYears {
                left_first: lf,
                left_last: ll,
                right_first: rf,
                right_last: rl,
            },
            _ => SeriesError::EmptySeries,
        }
    }

    /// Element-wise sum under the given alignment policy. Values are
    /// converted into the left operand's units year by year.
    pub fn try_add(&self, other: &Self, policy: AlignPolicy) -> Result<Self, SeriesError> {
        let years = match policy {
            AlignPolicy::Strict => {
                for year in self.years() {
                    if !other.points.contains_key(&year) {
                        return Err(SeriesError::MisalignedYears { year });
                    }
                }
                for year in other.years() {
                    if !self.points.contains_key(&year) {
                        return Err(SeriesError::MisalignedYears { year });
                    }
                }
                self.years().collect::<Vec<_>>()
            }
            AlignPolicy::Intersect => {
                let overlap = self.overlap_years(other);
                if overlap.is_empty() {
                    return Err(self.disjoint_error(other));
                }
                overlap
            }
        };

        let mut out = BTreeMap::new();
        for year in years {
            let left = &self.points[&year];
            let right = &other.points[&year];
            out.insert(year, left.try_add(right)?);
        }
        Ok(Self { points: out })
    }

    /// Element-wise product over the left operand's year set. A year the
    /// right operand does not cover is an alignment bug, not a NaN.
    pub fn mul_aligned(&self, other: &Self) -> Result<Self, SeriesError> {
        let mut out = BTreeMap::new();
        for (year, value) in &self.points {
            let rhs = other
                .points
                .get(year)
                .ok_or(SeriesError::MissingYear { year: *year })?;
            out.insert(*year, value.mul(rhs));
        }
        Ok(Self { points: out })
    }

    /// Left-to-right running sum in `unit`. Refuses to accumulate across a
    /// missing value: a NaN inside a cumulative sum is unrecoverable.
    pub fn cumsum_to(&self, unit: &Unit) -> Result<Self, SeriesError> {
        let mut out = BTreeMap::new();
        let mut acc = 0.0_f64;
        for (year, value) in &self.points {
            let converted = value.convert_to(unit)?;
            if !converted.is_finite() {
                return Err(SeriesError::MissingValue { year: *year });
            }
            acc += converted.magnitude();
            out.insert(*year, Quantity::new(acc, unit.clone()));
        }
        Ok(Self { points: out })
    }

    pub fn convert_to(&self, unit: &Unit) -> Result<Self, SeriesError> {
        let mut out = BTreeMap::new();
        for (year, value) in &self.points {
            out.insert(*year, value.convert_to(unit)?);
        }
        Ok(Self { points: out })
    }

    #[must_use]
    pub fn scale(&self, factor: f64) -> Self {
        Self {
            points: self
                .points
                .iter()
                .map(|(y, v)| (*y, v.scale_by(factor)))
                .collect(),
        }
    }

    /// Fill the ragged left edge from `other`: every year strictly before
    /// this series' first finite value takes `other`'s value when available.
    /// An entirely non-finite series is replaced outright.
    #[must_use]
    pub fn fill_left_from(&self, other: &Self) -> Self {
        let first_finite = self
            .points
            .iter()
            .find(|(_, v)| v.is_finite())
            .map(|(y, _)| *y);
        let Some(first_finite) = first_finite else {
            return other.clone();
        };
        let mut out = self.clone();
        for (year, value) in other.points.range(..first_finite) {
            out.points.insert(*year, value.clone());
        }
        out
    }
}

// ── Keyed tables of series ─────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("duplicate row key {key}")]
    DuplicateKey { key: String },
}

/// An insertion-ordered table of series rows with unique keys. Row order is
/// part of the contract for downstream table operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesTable<K> {
    rows: Vec<(K, YearSeries)>,
}

impl<K> Default for SeriesTable<K> {
    fn default() -> Self {
        Self { rows: Vec::new() }
    }
}

impl<K: Ord + Clone + std::fmt::Debug> SeriesTable<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: K, series: YearSeries) -> Result<(), TableError> {
        if self.contains_key(&key) {
            return Err(TableError::DuplicateKey {
                key: format!("{key:?}"),
            });
        }
        self.rows.push((key, series));
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<&YearSeries> {
        self.rows.iter().find(|(k, _)| k == key).map(|(_, s)| s)
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.rows.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.rows.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &YearSeries)> {
        self.rows.iter().map(|(k, s)| (k, s))
    }

    /// Keys present in both tables, in this table's row order.
    #[must_use]
    pub fn intersect_keys(&self, other: &Self) -> Vec<K> {
        self.rows
            .iter()
            .filter(|(k, _)| other.contains_key(k))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Final-year value of every non-empty row, in row order.
    #[must_use]
    pub fn last_values(&self) -> Vec<(K, Quantity)> {
        self.rows
            .iter()
            .filter_map(|(k, s)| s.last().map(|(_, v)| (k.clone(), v.clone())))
            .collect()
    }
}
