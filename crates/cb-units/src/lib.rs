#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Base dimensions tracked by the engine.
///
/// Production is tagged by commodity family ("GWh", "t Steel", ...);
/// two families never convert into one another, mirroring how disclosed
/// production units behave in sector data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Dimension {
    Co2Mass,
    Production(String),
    Temperature,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("cannot convert {left} to {right}: incompatible dimensions")]
    Mismatch { left: String, right: String },
}

/// A unit of measure: a normalized dimension vector plus a scale factor to
/// the base unit of that vector (t CO2 for mass, the family label itself for
/// production). The symbol is display-only and ignored by equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    dims: Vec<(Dimension, i8)>,
    scale: f64,
    symbol: String,
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.dims == other.dims && self.scale == other.scale
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

fn normalize_dims(mut dims: Vec<(Dimension, i8)>) -> Vec<(Dimension, i8)> {
    dims.sort_by(|a, b| a.0.cmp(&b.0));
    let mut out: Vec<(Dimension, i8)> = Vec::with_capacity(dims.len());
    for (dim, exp) in dims {
        match out.last_mut() {
            Some((last_dim, last_exp)) if *last_dim == dim => *last_exp += exp,
            _ => out.push((dim, exp)),
        }
    }
    out.retain(|(_, exp)| *exp != 0);
    out
}

impl Unit {
    fn from_parts(dims: Vec<(Dimension, i8)>, scale: f64, symbol: impl Into<String>) -> Self {
        Self {
            dims: normalize_dims(dims),
            scale,
            symbol: symbol.into(),
        }
    }

    #[must_use]
    pub fn dimensionless() -> Self {
        Self::from_parts(Vec::new(), 1.0, "")
    }

    #[must_use]
    pub fn t_co2() -> Self {
        Self::from_parts(vec![(Dimension::Co2Mass, 1)], 1.0, "t CO2")
    }

    #[must_use]
    pub fn mt_co2() -> Self {
        Self::from_parts(vec![(Dimension::Co2Mass, 1)], 1e6, "Mt CO2")
    }

    #[must_use]
    pub fn gt_co2() -> Self {
        Self::from_parts(vec![(Dimension::Co2Mass, 1)], 1e9, "Gt CO2")
    }

    /// Base production unit of a commodity family, e.g. `production("GWh")`.
    #[must_use]
    pub fn production(family: impl Into<String>) -> Self {
        let family = family.into();
        Self::from_parts(
            vec![(Dimension::Production(family.clone()), 1)],
            1.0,
            family,
        )
    }

    #[must_use]
    pub fn delta_degc() -> Self {
        Self::from_parts(vec![(Dimension::Temperature, 1)], 1.0, "delta_degC")
    }

    /// A multiple of this unit under a new symbol, e.g.
    /// `production("GWh").scaled(1e3, "TWh")`.
    #[must_use]
    pub fn scaled(&self, factor: f64, symbol: impl Into<String>) -> Self {
        Self::from_parts(self.dims.clone(), self.scale * factor, symbol)
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[must_use]
    pub fn is_dimensionless(&self) -> bool {
        self.dims.is_empty()
    }

    /// self / other, e.g. `t_co2().per(&production("GWh"))` -> "t CO2/GWh".
    #[must_use]
    pub fn per(&self, other: &Self) -> Self {
        let mut dims = self.dims.clone();
        dims.extend(other.dims.iter().map(|(d, e)| (d.clone(), -e)));
        let symbol = if other.symbol.is_empty() {
            self.symbol.clone()
        } else {
            format!("{}/{}", self.symbol, other.symbol)
        };
        Self::from_parts(dims, self.scale / other.scale, symbol)
    }

    /// self * other; dimensions compose, never fails.
    #[must_use]
    pub fn times(&self, other: &Self) -> Self {
        let mut dims = self.dims.clone();
        dims.extend(other.dims.iter().cloned());
        let symbol = match (self.symbol.is_empty(), other.symbol.is_empty()) {
            (true, _) => other.symbol.clone(),
            (_, true) => self.symbol.clone(),
            (false, false) => format!("{} {}", self.symbol, other.symbol),
        };
        Self::from_parts(dims, self.scale * other.scale, symbol)
    }

    #[must_use]
    pub fn same_dimension(&self, other: &Self) -> bool {
        self.dims == other.dims
    }

    /// Multiplier converting a magnitude in `self` into one in `to`.
    pub fn conversion_factor(&self, to: &Self) -> Result<f64, UnitError> {
        if !self.same_dimension(to) {
            return Err(UnitError::Mismatch {
                left: self.symbol.clone(),
                right: to.symbol.clone(),
            });
        }
        Ok(self.scale / to.scale)
    }
}

/// A physical quantity: magnitude plus unit. A NaN magnitude models a
/// missing observation, matching how ragged disclosure data arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    magnitude: f64,
    unit: Unit,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.symbol().is_empty() {
            write!(f, "{}", self.magnitude)
        } else {
            write!(f, "{} {}", self.magnitude, self.unit)
        }
    }
}

impl Quantity {
    #[must_use]
    pub fn new(magnitude: f64, unit: Unit) -> Self {
        Self { magnitude, unit }
    }

    #[must_use]
    pub fn dimensionless(magnitude: f64) -> Self {
        Self::new(magnitude, Unit::dimensionless())
    }

    #[must_use]
    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    #[must_use]
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.magnitude.is_finite()
    }

    #[must_use]
    pub fn is_nan(&self) -> bool {
        self.magnitude.is_nan()
    }

    pub fn convert_to(&self, unit: &Unit) -> Result<Self, UnitError> {
        let factor = self.unit.conversion_factor(unit)?;
        Ok(Self::new(self.magnitude * factor, unit.clone()))
    }

    /// Sum in self's unit; the right operand is converted first.
    pub fn try_add(&self, other: &Self) -> Result<Self, UnitError> {
        let rhs = other.convert_to(&self.unit)?;
        Ok(Self::new(self.magnitude + rhs.magnitude, self.unit.clone()))
    }

    pub fn try_sub(&self, other: &Self) -> Result<Self, UnitError> {
        let rhs = other.convert_to(&self.unit)?;
        Ok(Self::new(self.magnitude - rhs.magnitude, self.unit.clone()))
    }

    #[must_use]
    pub fn mul(&self, other: &Self) -> Self {
        Self::new(
            self.magnitude * other.magnitude,
            self.unit.times(&other.unit),
        )
    }

    #[must_use]
    pub fn div(&self, other: &Self) -> Self {
        Self::new(
            self.magnitude / other.magnitude,
            self.unit.per(&other.unit),
        )
    }

    #[must_use]
    pub fn scale_by(&self, factor: f64) -> Self {
        Self::new(self.magnitude * factor, self.unit.clone())
    }

    /// Dimensionless ratio self / other.
    pub fn ratio_to(&self, other: &Self) -> Result<f64, UnitError> {
        let rhs = other.convert_to(&self.unit)?;
        Ok(self.magnitude / rhs.magnitude)
    }

    /// Unit-aware `self <= other`. NaN on either side compares not-≤.
    pub fn try_le(&self, other: &Self) -> Result<bool, UnitError> {
        let rhs = other.convert_to(&self.unit)?;
        Ok(self.magnitude <= rhs.magnitude)
    }
}
