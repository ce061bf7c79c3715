#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cb_series::{SeriesTable, Year, YearSeries};
use cb_units::Quantity;

/// GHG accounting scope a series or score is expressed under.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    S1,
    S2,
    S1S2,
    S3,
    S1S2S3,
}

impl Scope {
    pub const ALL: [Scope; 5] = [Scope::S1, Scope::S2, Scope::S1S2, Scope::S3, Scope::S1S2S3];

    /// Preference order when a benchmark publishes several scopes for one
    /// (sector, region).
    pub const RESOLUTION_PRIORITY: [Scope; 4] =
        [Scope::S1S2S3, Scope::S1S2, Scope::S1, Scope::S3];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::S1 => "S1",
            Scope::S2 => "S2",
            Scope::S1S2 => "S1+S2",
            Scope::S3 => "S3",
            Scope::S1S2S3 => "S1+S2+S3",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown scope {0:?}")]
pub struct ParseScopeError(String);

impl FromStr for Scope {
    type Err = ParseScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S1" => Ok(Scope::S1),
            "S2" => Ok(Scope::S2),
            "S1S2" | "S1+S2" => Ok(Scope::S1S2),
            "S3" => Ok(Scope::S3),
            "S1S2S3" | "S1+S2+S3" => Ok(Scope::S1S2S3),
            other => Err(ParseScopeError(other.to_owned())),
        }
    }
}

/// Fixed per-scope series slots. Access goes through an exhaustive match on
/// the scope tag; there is no reflective field lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeBundle {
    s1: Option<YearSeries>,
    s2: Option<YearSeries>,
    s1s2: Option<YearSeries>,
    s3: Option<YearSeries>,
    s1s2s3: Option<YearSeries>,
}

impl ScopeBundle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, scope: Scope) -> Option<&YearSeries> {
        match scope {
            Scope::S1 => self.s1.as_ref(),
            Scope::S2 => self.s2.as_ref(),
            Scope::S1S2 => self.s1s2.as_ref(),
            Scope::S3 => self.s3.as_ref(),
            Scope::S1S2S3 => self.s1s2s3.as_ref(),
        }
    }

    pub fn set(&mut self, scope: Scope, series: YearSeries) {
        let slot = match scope {
            Scope::S1 => &mut self.s1,
            Scope::S2 => &mut self.s2,
            Scope::S1S2 => &mut self.s1s2,
            Scope::S3 => &mut self.s3,
            Scope::S1S2S3 => &mut self.s1s2s3,
        };
        *slot = Some(series);
    }

    pub fn take(&mut self, scope: Scope) -> Option<YearSeries> {
        match scope {
            Scope::S1 => self.s1.take(),
            Scope::S2 => self.s2.take(),
            Scope::S1S2 => self.s1s2.take(),
            Scope::S3 => self.s3.take(),
            Scope::S1S2S3 => self.s1s2s3.take(),
        }
    }

    /// True when the slot holds a series with at least one point.
    #[must_use]
    pub fn has(&self, scope: Scope) -> bool {
        self.get(scope).is_some_and(|s| !s.is_empty())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        Scope::ALL.iter().all(|scope| !self.has(*scope))
    }
}

/// Horizon endpoints bounding every projection and comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionControls {
    pub base_year: Year,
    pub target_year: Year,
}

impl Default for ProjectionControls {
    fn default() -> Self {
        Self {
            base_year: 2019,
            target_year: 2050,
        }
    }
}

/// Row identity of every aggregate table: company x scope.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RowKey {
    pub company_id: String,
    pub scope: Scope,
}

impl RowKey {
    #[must_use]
    pub fn new(company_id: impl Into<String>, scope: Scope) -> Self {
        Self {
            company_id: company_id.into(),
            scope,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.company_id, self.scope)
    }
}

/// One row of the base-year table consumed by the benchmark providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseYearInfo {
    pub company_id: String,
    pub sector: String,
    pub region: String,
    pub scope: Scope,
    pub base_intensity: Quantity,
    pub base_production: Quantity,
}

/// A company's disclosure record as the warehouse owns it for a scoring run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub company_id: String,
    pub company_name: String,
    pub sector: String,
    pub region: String,
    pub base_year_production: Quantity,
    pub ghg_s1s2: Option<Quantity>,
    pub ghg_s3: Option<Quantity>,
    pub historic_emissions: ScopeBundle,
    pub historic_intensities: ScopeBundle,
    pub projected_intensities: ScopeBundle,
    pub projected_targets: ScopeBundle,
    pub scoring_scope: Option<Scope>,
}

/// Exceedance outcome: the latest compliant year, or never within the horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExceedanceYear {
    Year(Year),
    NeverExceeds,
}

/// Facade output: original company fields plus the precalculated scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyAggregate {
    pub company_id: String,
    pub company_name: String,
    pub sector: String,
    pub region: String,
    pub scope: Scope,
    pub ghg_s1s2: Option<Quantity>,
    pub ghg_s3: Option<Quantity>,
    pub cumulative_trajectory: Quantity,
    pub cumulative_target: Quantity,
    pub cumulative_budget: Quantity,
    pub trajectory_exceedance_year: ExceedanceYear,
    pub target_exceedance_year: ExceedanceYear,
    pub benchmark_global_budget: Quantity,
    pub benchmark_temperature: Quantity,
}

// ── Provider seams ─────────────────────────────────────────────────────

pub trait CompanyDataProvider {
    fn projection_controls(&self) -> ProjectionControls;

    fn all_company_ids(&self) -> Vec<String>;

    fn get_company_data(&self, company_ids: &[&str]) -> Vec<CompanyRecord>;

    fn get_company_projected_trajectories(&self, company_ids: &[&str]) -> SeriesTable<RowKey>;

    fn get_company_projected_targets(&self, company_ids: &[&str]) -> SeriesTable<RowKey>;

    fn get_company_intensity_and_production_at_base_year(
        &self,
        company_ids: &[&str],
    ) -> Vec<BaseYearInfo>;
}

pub trait ProductionBenchmarkDataProvider {
    fn get_company_projected_production(
        &self,
        base_year_rows: &[BaseYearInfo],
    ) -> SeriesTable<RowKey>;
}

pub trait IntensityBenchmarkDataProvider {
    fn get_sda_intensity_benchmarks(&self, base_year_rows: &[BaseYearInfo])
        -> SeriesTable<RowKey>;

    /// Scopes the benchmark publishes for (sector, region), after the
    /// documented Global fallback.
    fn scopes_for(&self, sector: &str, region: &str) -> Vec<Scope>;

    fn has_scope(&self, sector: &str, region: &str, scope: Scope) -> bool;

    /// Raw benchmark intensity path for (sector, region, scope), after the
    /// Global fallback.
    fn intensity_path(&self, sector: &str, region: &str, scope: Scope) -> Option<YearSeries>;

    fn is_production_centric(&self) -> bool;

    fn benchmark_global_budget(&self) -> Quantity;

    fn benchmark_temperature(&self) -> Quantity;
}

// ── In-memory reference provider ───────────────────────────────────────

/// Record-backed provider used by tests and demos.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCompanyProvider {
    companies: Vec<CompanyRecord>,
    controls: ProjectionControls,
}

impl InMemoryCompanyProvider {
    #[must_use]
    pub fn new(companies: Vec<CompanyRecord>, controls: ProjectionControls) -> Self {
        Self {
            companies,
            controls,
        }
    }

    fn select<'a>(&'a self, company_ids: &[&str]) -> Vec<&'a CompanyRecord> {
        let mut seen = BTreeSet::new();
        company_ids
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| self.companies.iter().find(|c| c.company_id == *id))
            .collect()
    }

    fn bundle_table(
        &self,
        company_ids: &[&str],
        bundle_of: impl Fn(&CompanyRecord) -> &ScopeBundle,
    ) -> SeriesTable<RowKey> {
        let mut table = SeriesTable::new();
        for company in self.select(company_ids) {
            let bundle = bundle_of(company);
            for scope in Scope::ALL {
                if let Some(series) = bundle.get(scope) {
                    if !series.is_empty() {
                        // Keys are unique by construction: one row per company x scope.
                        let _ = table.push(RowKey::new(&company.company_id, scope), series.clone());
                    }
                }
            }
        }
        table
    }

    fn base_intensity_of(&self, company: &CompanyRecord) -> Option<Quantity> {
        for bundle in [&company.projected_intensities, &company.historic_intensities] {
            for scope in [Scope::S1S2, Scope::S1] {
                if let Some(value) = bundle.get(scope).and_then(|s| s.get(self.controls.base_year))
                {
                    return Some(value.clone());
                }
            }
        }
        None
    }
}

impl CompanyDataProvider for InMemoryCompanyProvider {
    fn projection_controls(&self) -> ProjectionControls {
        self.controls
    }

    fn all_company_ids(&self) -> Vec<String> {
        self.companies.iter().map(|c| c.company_id.clone()).collect()
    }

    fn get_company_data(&self, company_ids: &[&str]) -> Vec<CompanyRecord> {
        self.select(company_ids).into_iter().cloned().collect()
    }

    fn get_company_projected_trajectories(&self, company_ids: &[&str]) -> SeriesTable<RowKey> {
        self.bundle_table(company_ids, |c| &c.projected_intensities)
    }

    fn get_company_projected_targets(&self, company_ids: &[&str]) -> SeriesTable<RowKey> {
        self.bundle_table(company_ids, |c| &c.projected_targets)
    }

    fn get_company_intensity_and_production_at_base_year(
        &self,
        company_ids: &[&str],
    ) -> Vec<BaseYearInfo> {
        self.select(company_ids)
            .into_iter()
            .filter_map(|company| {
                let base_intensity = self.base_intensity_of(company)?;
                Some(BaseYearInfo {
                    company_id: company.company_id.clone(),
                    sector: company.sector.clone(),
                    region: company.region.clone(),
                    scope: Scope::S1S2,
                    base_intensity,
                    base_production: company.base_year_production.clone(),
                })
            })
            .collect()
    }
}
