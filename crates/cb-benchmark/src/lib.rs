#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cb_company::{
    BaseYearInfo, IntensityBenchmarkDataProvider, ProductionBenchmarkDataProvider,
    ProjectionControls, RowKey, Scope,
};
use cb_series::{SeriesError, Year, YearSeries};
use cb_units::{Quantity, Unit, UnitError};

/// Region label every sector falls back to when the benchmark does not
/// publish the company's own region.
pub const GLOBAL_REGION: &str = "Global";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BenchmarkError {
    #[error("benchmark publishes no intensity path for ({sector}, {region}, {scope})")]
    MissingIntensityPath {
        sector: String,
        region: String,
        scope: Scope,
    },
    #[error("benchmark publishes no production growth for ({sector}, {region})")]
    MissingGrowthPath { sector: String, region: String },
    #[error("benchmark path lacks year {year}")]
    MissingYear { year: Year },
    #[error("benchmark path for ({sector}, {region}, {scope}) is flat; no decarbonization path")]
    DegenerateBenchmark {
        sector: String,
        region: String,
        scope: Scope,
    },
    #[error(transparent)]
    Series(#[from] SeriesError),
    #[error(transparent)]
    Unit(#[from] UnitError),
}

/// Intensity benchmark: (sector, region, scope)-keyed decarbonization paths
/// plus benchmark-level metadata. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntensityBenchmark {
    controls: ProjectionControls,
    production_centric: bool,
    global_budget: Quantity,
    benchmark_temperature: Quantity,
    paths: BTreeMap<(String, String, Scope), YearSeries>,
}

impl IntensityBenchmark {
    #[must_use]
    pub fn new(
        controls: ProjectionControls,
        production_centric: bool,
        global_budget: Quantity,
        benchmark_temperature: Quantity,
    ) -> Self {
        Self {
            controls,
            production_centric,
            global_budget,
            benchmark_temperature,
            paths: BTreeMap::new(),
        }
    }

    pub fn insert_path(
        &mut self,
        sector: impl Into<String>,
        region: impl Into<String>,
        scope: Scope,
        path: YearSeries,
    ) {
        self.paths.insert((sector.into(), region.into(), scope), path);
    }

    #[must_use]
    pub fn controls(&self) -> ProjectionControls {
        self.controls
    }

    fn covers(&self, sector: &str, region: &str) -> bool {
        self.paths
            .keys()
            .any(|(s, r, _)| s == sector && r == region)
    }

    /// The single lookup fallback: exact (sector, region) first, then
    /// (sector, "Global"), else nothing. Every composite-key query in this
    /// crate routes through here.
    #[must_use]
    pub fn resolve_region(&self, sector: &str, region: &str) -> Option<String> {
        if self.covers(sector, region) {
            return Some(region.to_owned());
        }
        if self.covers(sector, GLOBAL_REGION) {
            return Some(GLOBAL_REGION.to_owned());
        }
        None
    }

    fn path(&self, sector: &str, region: &str, scope: Scope) -> Option<&YearSeries> {
        let region = self.resolve_region(sector, region)?;
        self.paths
            .get(&(sector.to_owned(), region, scope))
    }

    /// Per-company SDA intensity path: the benchmark decarbonization shape
    /// anchored at the company's own base-year intensity.
    ///
    /// d(y) = (ei(y) - ei(last)) / (ei(first) - ei(last)),
    /// out(y) = d(y) * (base_ei - ei(last)) + ei(last).
    pub fn sda_intensity_path(
        &self,
        sector: &str,
        region: &str,
        scope: Scope,
        base_intensity: &Quantity,
    ) -> Result<YearSeries, BenchmarkError> {
        let path = self
            .path(sector, region, scope)
            .ok_or_else(|| BenchmarkError::MissingIntensityPath {
                sector: sector.to_owned(),
                region: region.to_owned(),
                scope,
            })?;
        let first = path
            .get(self.controls.base_year)
            .ok_or(BenchmarkError::MissingYear {
                year: self.controls.base_year,
            })?;
        let last = path
            .get(self.controls.target_year)
            .ok_or(BenchmarkError::MissingYear {
                year: self.controls.target_year,
            })?;

        let unit = first.unit().clone();
        let first_m = first.magnitude();
        let last_m = last.convert_to(&unit)?.magnitude();
        let denom = first_m - last_m;
        if denom == 0.0 {
            return Err(BenchmarkError::DegenerateBenchmark {
                sector: sector.to_owned(),
                region: region.to_owned(),
                scope,
            });
        }
        let spread = base_intensity.convert_to(&unit)?.magnitude() - last_m;

        let mut out = YearSeries::new();
        for (year, value) in path
            .clamp_years(self.controls.base_year, self.controls.target_year)
            .iter()
        {
            let d = (value.convert_to(&unit)?.magnitude() - last_m) / denom;
            out.insert(year, Quantity::new(d * spread + last_m, unit.clone()));
        }
        Ok(out)
    }
}

impl IntensityBenchmarkDataProvider for IntensityBenchmark {
    fn get_sda_intensity_benchmarks(
        &self,
        base_year_rows: &[BaseYearInfo],
    ) -> cb_series::SeriesTable<RowKey> {
        let mut table = cb_series::SeriesTable::new();
        for row in base_year_rows {
            let Ok(path) =
                self.sda_intensity_path(&row.sector, &row.region, row.scope, &row.base_intensity)
            else {
                // Companies the benchmark cannot score simply get no row;
                // the warehouse reports and drops them.
                continue;
            };
            let _ = table.push(RowKey::new(&row.company_id, row.scope), path);
        }
        table
    }

    fn scopes_for(&self, sector: &str, region: &str) -> Vec<Scope> {
        let Some(region) = self.resolve_region(sector, region) else {
            return Vec::new();
        };
        self.paths
            .keys()
            .filter(|(s, r, _)| s == sector && *r == region)
            .map(|(_, _, scope)| *scope)
            .collect()
    }

    fn has_scope(&self, sector: &str, region: &str, scope: Scope) -> bool {
        self.path(sector, region, scope).is_some()
    }

    fn intensity_path(&self, sector: &str, region: &str, scope: Scope) -> Option<YearSeries> {
        self.path(sector, region, scope).cloned()
    }

    fn is_production_centric(&self) -> bool {
        self.production_centric
    }

    fn benchmark_global_budget(&self) -> Quantity {
        self.global_budget.clone()
    }

    fn benchmark_temperature(&self) -> Quantity {
        self.benchmark_temperature.clone()
    }
}

/// Production benchmark: (sector, region)-keyed year-over-year growth
/// factors, dimensionless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionBenchmark {
    controls: ProjectionControls,
    growth: BTreeMap<(String, String), YearSeries>,
}

impl ProductionBenchmark {
    #[must_use]
    pub fn new(controls: ProjectionControls) -> Self {
        Self {
            controls,
            growth: BTreeMap::new(),
        }
    }

    pub fn insert_growth(
        &mut self,
        sector: impl Into<String>,
        region: impl Into<String>,
        growth: YearSeries,
    ) {
        self.growth.insert((sector.into(), region.into()), growth);
    }

    fn covers(&self, sector: &str, region: &str) -> bool {
        self.growth
            .keys()
            .any(|(s, r)| s == sector && r == region)
    }

    #[must_use]
    pub fn resolve_region(&self, sector: &str, region: &str) -> Option<String> {
        if self.covers(sector, region) {
            return Some(region.to_owned());
        }
        if self.covers(sector, GLOBAL_REGION) {
            return Some(GLOBAL_REGION.to_owned());
        }
        None
    }

    /// Company production path: base-year production compounded through the
    /// growth factors, base year through target year.
    pub fn projected_production(
        &self,
        sector: &str,
        region: &str,
        base_production: &Quantity,
    ) -> Result<YearSeries, BenchmarkError> {
        let region =
            self.resolve_region(sector, region)
                .ok_or_else(|| BenchmarkError::MissingGrowthPath {
                    sector: sector.to_owned(),
                    region: region.to_owned(),
                })?;
        let growth = self
            .growth
            .get(&(sector.to_owned(), region.clone()))
            .ok_or(BenchmarkError::MissingGrowthPath {
                sector: sector.to_owned(),
                region,
            })?;

        let mut out = YearSeries::new();
        let mut factor = 1.0_f64;
        for year in self.controls.base_year..=self.controls.target_year {
            let rate = growth
                .get(year)
                .ok_or(BenchmarkError::MissingYear { year })?;
            let rate = rate.convert_to(&Unit::dimensionless())?;
            factor *= 1.0 + rate.magnitude();
            out.insert(year, base_production.scale_by(factor));
        }
        Ok(out)
    }
}

impl ProductionBenchmarkDataProvider for ProductionBenchmark {
    fn get_company_projected_production(
        &self,
        base_year_rows: &[BaseYearInfo],
    ) -> cb_series::SeriesTable<RowKey> {
        let mut table = cb_series::SeriesTable::new();
        for row in base_year_rows {
            let Ok(path) =
                self.projected_production(&row.sector, &row.region, &row.base_production)
            else {
                continue;
            };
            let _ = table.push(RowKey::new(&row.company_id, row.scope), path);
        }
        table
    }
}
