#![forbid(unsafe_code)]

//! Scope reconciliation and carbon-budget exceedance.
//!
//! The warehouse owns every company record for the duration of a scoring
//! run. Construction fixes each company's scoring scope, optionally fills
//! missing scope-3 data from benchmark intensities, and applies the
//! production-centric scope folding; `get_preprocessed_company_data` then
//! turns the reconciled records into cumulative trajectory/target/budget
//! series and per-company exceedance years.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cb_company::{
    BaseYearInfo, CompanyAggregate, CompanyDataProvider, CompanyRecord, ExceedanceYear,
    IntensityBenchmarkDataProvider, ProductionBenchmarkDataProvider, ProjectionControls, RowKey,
    Scope, ScopeBundle,
};
use cb_diagnostics::{DiagnosticsLedger, IssueKind};
use cb_series::{AlignPolicy, SeriesError, SeriesTable, Year, YearSeries};
use cb_units::{Quantity, Unit, UnitError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WarehouseError {
    #[error(
        "company {company_id}: primary series has no data at or before back-cast anchor year {anchor_year}"
    )]
    NoBackcastAnchor {
        company_id: String,
        anchor_year: Year,
    },
    #[error("row {company_id}/{scope}: production table has no matching row")]
    MissingProductionRow { company_id: String, scope: Scope },
    #[error("row {company_id}/{scope}: cumulative product would carry missing values: {source}")]
    CumulativeInvariant {
        company_id: String,
        scope: Scope,
        source: SeriesError,
    },
    #[error(transparent)]
    Series(#[from] SeriesError),
    #[error(transparent)]
    Unit(#[from] UnitError),
}

/// Canonical mass unit for every cumulative emissions table.
#[must_use]
pub fn canonical_mass() -> Unit {
    Unit::mt_co2()
}

// ── Scope resolution ───────────────────────────────────────────────────

/// Pick the scope the benchmark scores a company under.
///
/// Region fallback happens inside the benchmark lookup. A single published
/// scope wins outright; several published scopes resolve through
/// `Scope::RESOLUTION_PRIORITY`; no usable scope means the company cannot
/// be scored.
#[must_use]
pub fn resolve_scope<I>(benchmark: &I, sector: &str, region: &str) -> Option<Scope>
where
    I: IntensityBenchmarkDataProvider + ?Sized,
{
    let published = benchmark.scopes_for(sector, region);
    match published.as_slice() {
        [] => None,
        [only] => Some(*only),
        several => Scope::RESOLUTION_PRIORITY
            .iter()
            .copied()
            .find(|scope| several.contains(scope)),
    }
}

// ── Scope-3 estimation ─────────────────────────────────────────────────

/// Fill in missing scope-3 data from the benchmark's S3 intensity.
///
/// No-op unless the benchmark defines an S3 path for the company's
/// (sector, region) and the company discloses no historic S3. A
/// dimensionally impossible estimate is abandoned and logged; the company
/// continues without it.
pub fn estimate_missing_s3<P, I>(
    company: &mut CompanyRecord,
    info: &BaseYearInfo,
    production_bm: &P,
    intensity_bm: &I,
    controls: ProjectionControls,
    ledger: &mut DiagnosticsLedger,
) where
    P: ProductionBenchmarkDataProvider + ?Sized,
    I: IntensityBenchmarkDataProvider + ?Sized,
{
    if company.historic_emissions.has(Scope::S3) {
        return;
    }
    let Some(bm_ei_s3) = intensity_bm.intensity_path(&company.sector, &company.region, Scope::S3)
    else {
        return;
    };

    let production_table = production_bm.get_company_projected_production(std::slice::from_ref(info));
    let Some(projected_production) = production_table.get(&RowKey::new(&company.company_id, info.scope))
    else {
        return;
    };

    // production x benchmark S3 intensity, in the canonical mass unit
    let raw = match bm_ei_s3
        .restrict_to(projected_production)
        .mul_aligned(projected_production)
    {
        Ok(raw) => raw,
        Err(err) => {
            ledger.push(
                IssueKind::InvariantViolation,
                &company.company_id,
                format!("scope 3 estimate failed: {err}"),
            );
            return;
        }
    };
    let s3_emissions = match raw.convert_to(&canonical_mass()) {
        Ok(series) => series,
        Err(err) => {
            ledger.push(
                IssueKind::UnitMismatch,
                &company.company_id,
                format!("benchmark S3 intensity and production do not multiply to a mass: {err}"),
            );
            return;
        }
    };

    let Some(ghg_s3) = s3_emissions.get(controls.base_year) else {
        ledger.push(
            IssueKind::InvariantViolation,
            &company.company_id,
            format!("scope 3 estimate has no value at base year {}", controls.base_year),
        );
        return;
    };
    company.ghg_s3 = Some(ghg_s3.clone());

    // Historic emissions: synthesized S3 paired against disclosed S1+S2
    // years at or after the base year.
    if let Some(s1s2) = company.historic_emissions.get(Scope::S1S2).cloned() {
        let mut s3_hist = YearSeries::new();
        for (year, _) in s1s2.iter().filter(|(y, _)| *y >= controls.base_year) {
            if let Some(value) = s3_emissions.get(year) {
                s3_hist.insert(year, value.clone());
            }
        }
        if !s3_hist.is_empty() {
            if let Ok(total) = s1s2.try_add(&s3_hist, AlignPolicy::Intersect) {
                company.historic_emissions.set(Scope::S1S2S3, total);
            }
            company.historic_emissions.set(Scope::S3, s3_hist);
        }
    }

    // Historic intensities: benchmark values at the disclosed years.
    if let Some(s1s2) = company.historic_intensities.get(Scope::S1S2).cloned() {
        let mut s3_hist = YearSeries::new();
        for (year, _) in s1s2.iter().filter(|(y, _)| *y >= controls.base_year) {
            if let Some(value) = bm_ei_s3.get(year) {
                s3_hist.insert(year, value.clone());
            }
        }
        if !s3_hist.is_empty() {
            if let Ok(total) = s1s2.try_add(&s3_hist, AlignPolicy::Intersect) {
                company.historic_intensities.set(Scope::S1S2S3, total);
            }
            company.historic_intensities.set(Scope::S3, s3_hist);
        }
    }

    // Projected S3 trajectory, aligned to whichever primary trajectory
    // exists. Without an S1+S2 trajectory there is no S1+S2+S3 either.
    if let Some(s1s2) = company.projected_intensities.get(Scope::S1S2).cloned() {
        let s3_traj = bm_ei_s3.restrict_to(&s1s2);
        if !s3_traj.is_empty() {
            match s1s2.try_add(&s3_traj, AlignPolicy::Intersect) {
                Ok(total) => company.projected_intensities.set(Scope::S1S2S3, total),
                Err(SeriesError::Unit(err)) => ledger.push(
                    IssueKind::UnitMismatch,
                    &company.company_id,
                    format!("benchmark S3 intensity incompatible with trajectory: {err}"),
                ),
                Err(_) => {}
            }
            company.projected_intensities.set(Scope::S3, s3_traj);
        }
    } else if let Some(s1) = company.projected_intensities.get(Scope::S1).cloned() {
        let s3_traj = bm_ei_s3.restrict_to(&s1);
        if !s3_traj.is_empty() {
            company.projected_intensities.set(Scope::S3, s3_traj);
        }
    }

    tracing::info!(
        company_id = %company.company_id,
        sector = %company.sector,
        "added scope 3 estimates from benchmark intensity"
    );
}

// ── Production-centric folding ─────────────────────────────────────────

/// Sum two target series over their year overlap, converting into the left
/// operand's units. An empty overlap is a genuine misalignment.
fn aligned_target_sum(left: &YearSeries, right: &YearSeries) -> Result<YearSeries, SeriesError> {
    left.try_add(right, AlignPolicy::Intersect)
}

/// Back-cast the S3 series onto a primary historic series and fold it in.
///
/// The S3 series' first year anchors the alignment. Primary points strictly
/// before the last pre-anchor point are rescaled to
/// `s3_first * point / pre_last` — the primary series' own shape stands in
/// for the unobserved S3 history — and the extended S3 series is then summed
/// onto the primary year by year. Primary points the extension does not
/// cover stay unchanged.
fn back_cast_onto(
    bundle: &mut ScopeBundle,
    primary: Scope,
    s3: &YearSeries,
    company_id: &str,
) -> Result<(), WarehouseError> {
    let Some(primary_series) = bundle.get(primary).filter(|s| !s.is_empty()).cloned() else {
        bundle.set(primary, s3.clone());
        return Ok(());
    };
    let Some((anchor, s3_first)) = s3.first() else {
        return Ok(());
    };
    let s3_first = s3_first.clone();

    let pre: Vec<(Year, Quantity)> = primary_series
        .iter()
        .filter(|(year, _)| *year <= anchor)
        .map(|(year, value)| (year, value.clone()))
        .collect();
    if pre.is_empty() {
        return Err(WarehouseError::NoBackcastAnchor {
            company_id: company_id.to_owned(),
            anchor_year: anchor,
        });
    }

    let mut s3_extended = s3.clone();
    if pre.len() > 1 {
        let (_, pivot) = &pre[pre.len() - 1];
        for (year, value) in &pre[..pre.len() - 1] {
            let ratio = value.ratio_to(pivot)?;
            s3_extended.insert(*year, s3_first.scale_by(ratio));
        }
    }

    let mut folded = primary_series;
    for (year, addend) in s3_extended.iter() {
        if let Some(existing) = folded.get(year) {
            let sum = existing.try_add(addend)?;
            folded.insert(year, sum);
        }
    }
    bundle.set(primary, folded);
    Ok(())
}

fn fold_historic_bundle(
    bundle: &mut ScopeBundle,
    company_id: &str,
) -> Result<(), WarehouseError> {
    if bundle.has(Scope::S3) {
        if let Some(s3) = bundle.get(Scope::S3).cloned() {
            back_cast_onto(bundle, Scope::S1, &s3, company_id)?;
            back_cast_onto(bundle, Scope::S1S2, &s3, company_id)?;
        }
        bundle.take(Scope::S3);
    }
    // The combined series is redundant once S3 has been absorbed.
    bundle.take(Scope::S1S2S3);
    Ok(())
}

fn fold_trajectory_bundle(
    bundle: &mut ScopeBundle,
    company_id: &str,
    ledger: &mut DiagnosticsLedger,
) {
    if bundle.has(Scope::S3) {
        if let Some(s3) = bundle.get(Scope::S3).cloned() {
            for primary in [Scope::S1, Scope::S1S2] {
                let existing = bundle.get(primary).filter(|s| !s.is_empty()).cloned();
                match existing {
                    Some(series) => match series.try_add(&s3, AlignPolicy::Strict) {
                        Ok(sum) => bundle.set(primary, sum),
                        Err(SeriesError::Unit(err)) => ledger.push(
                            IssueKind::UnitMismatch,
                            company_id,
                            format!("scope 3 trajectory units incompatible with {primary}: {err}"),
                        ),
                        Err(err) => ledger.push(
                            IssueKind::IrrecoverableMisalignment,
                            company_id,
                            format!("scope 3 trajectory not aligned with {primary}: {err}"),
                        ),
                    },
                    None => bundle.set(primary, s3.clone()),
                }
            }
        }
        bundle.take(Scope::S3);
    }
    bundle.take(Scope::S1S2S3);
}

fn fold_target_bundle(
    bundle: &mut ScopeBundle,
    company_id: &str,
    ledger: &mut DiagnosticsLedger,
) {
    if bundle.has(Scope::S3) {
        if let Some(s3) = bundle.get(Scope::S3).cloned() {
            // Snapshots taken before any fold: S3 lands in each primary
            // exactly once.
            let s1_before = bundle.get(Scope::S1).filter(|s| !s.is_empty()).cloned();
            let s2_before = bundle.get(Scope::S2).filter(|s| !s.is_empty()).cloned();
            let s1s2_before = bundle.get(Scope::S1S2).filter(|s| !s.is_empty()).cloned();

            if let Some(s1) = &s1_before {
                match aligned_target_sum(s1, &s3) {
                    Ok(sum) => bundle.set(Scope::S1, sum),
                    Err(err) => ledger.push(
                        IssueKind::IrrecoverableMisalignment,
                        company_id,
                        format!("scope 1 targets not aligned with scope 3 targets: {err}"),
                    ),
                }
            }

            let s1s2_base = match (&s1s2_before, &s1_before, &s2_before) {
                (Some(s1s2), _, _) => Some(s1s2.clone()),
                (None, Some(s1), Some(s2)) => {
                    ledger.push(
                        IssueKind::DataRepairApplied,
                        company_id,
                        "scope 1+2 target projections should have been present; repairing from scope 1 and scope 2",
                    );
                    match aligned_target_sum(s1, s2) {
                        Ok(sum) => Some(sum),
                        Err(err) => {
                            ledger.push(
                                IssueKind::IrrecoverableMisalignment,
                                company_id,
                                format!("scope 1 and scope 2 targets not aligned: {err}"),
                            );
                            None
                        }
                    }
                }
                (None, Some(s1), None) => {
                    ledger.push(
                        IssueKind::DataRepairApplied,
                        company_id,
                        "scope 2 target projections missing; treating scope 2 as zero",
                    );
                    Some(s1.clone())
                }
                (None, None, _) => None,
            };

            if let Some(s1s2_base) = s1s2_base {
                match aligned_target_sum(&s1s2_base, &s3) {
                    Ok(sum) => bundle.set(Scope::S1S2, sum),
                    Err(err) => {
                        // Fold skipped: the company scores on the unfolded
                        // scope 1+2 targets.
                        ledger.push(
                            IssueKind::IrrecoverableMisalignment,
                            company_id,
                            format!("scope 1+2 targets not aligned with scope 3 targets; ignoring scope 3 data: {err}"),
                        );
                        bundle.set(Scope::S1S2, s1s2_base);
                    }
                }
            }
        }
        bundle.take(Scope::S3);
    }
    bundle.take(Scope::S1S2S3);
}

/// Fold scope-3 data into scope 1 / scope 1+2 under production-centric
/// benchmark rules. Idempotent: a second run finds every S3 slot empty and
/// does nothing. A returned error fails this company only.
pub fn fold_production_centric(
    company: &mut CompanyRecord,
    ledger: &mut DiagnosticsLedger,
) -> Result<(), WarehouseError> {
    if let Some(s3) = company.ghg_s3.take() {
        if s3.is_finite() {
            company.ghg_s1s2 = match company.ghg_s1s2.take() {
                Some(s1s2) => Some(s1s2.try_add(&s3)?),
                None => Some(s3),
            };
        }
    }

    let company_id = company.company_id.clone();
    fold_historic_bundle(&mut company.historic_emissions, &company_id)?;
    fold_historic_bundle(&mut company.historic_intensities, &company_id)?;
    fold_trajectory_bundle(&mut company.projected_intensities, &company_id, ledger);
    fold_target_bundle(&mut company.projected_targets, &company_id, ledger);
    Ok(())
}

// ── Cumulative emissions ───────────────────────────────────────────────

/// Cumulative emissions for one row: intensity x production over the
/// intensity's year set, then a running sum in `unit`. A production year
/// the intensity covers but production does not, or a non-finite product,
/// is an upstream alignment bug and fails the row.
pub fn cumulative_emissions_row(
    projected_ei: &YearSeries,
    projected_production: &YearSeries,
    unit: &Unit,
) -> Result<YearSeries, SeriesError> {
    projected_ei.mul_aligned(projected_production)?.cumsum_to(unit)
}

/// Table version of [`cumulative_emissions_row`]: row order preserved, any
/// failing row fails the call. The facade instead loops rows itself so one
/// bad company drops alone.
pub fn cumulative_emissions(
    projected_ei: &SeriesTable<RowKey>,
    projected_production: &SeriesTable<RowKey>,
    unit: &Unit,
) -> Result<SeriesTable<RowKey>, WarehouseError> {
    let mut out = SeriesTable::new();
    for (key, ei) in projected_ei.iter() {
        let production =
            projected_production
                .get(key)
                .ok_or_else(|| WarehouseError::MissingProductionRow {
                    company_id: key.company_id.clone(),
                    scope: key.scope,
                })?;
        let row = cumulative_emissions_row(ei, production, unit).map_err(|source| {
            WarehouseError::CumulativeInvariant {
                company_id: key.company_id.clone(),
                scope: key.scope,
                source,
            }
        })?;
        let _ = out.push(key.clone(), row);
    }
    Ok(out)
}

// ── Exceedance evaluation ──────────────────────────────────────────────

/// Latest year each subject row stays within its budget row.
///
/// Only rows present in both tables produce a result. With `budget_year`
/// given, every comparison strictly before it uses the `budget_year` budget
/// value as a fixed ceiling. Scanning runs latest to earliest over the year
/// set common to both rows; no compliant year maps to the base year, and a
/// compliant year at or beyond the target year maps to the no-exceedance
/// sentinel.
pub fn exceedance_years(
    subject: &SeriesTable<RowKey>,
    budget: &SeriesTable<RowKey>,
    budget_year: Option<Year>,
    controls: ProjectionControls,
) -> Result<Vec<(RowKey, ExceedanceYear)>, WarehouseError> {
    let mut out = Vec::new();
    for key in subject.intersect_keys(budget) {
        let (Some(subject_row), Some(budget_row)) = (subject.get(&key), budget.get(&key)) else {
            continue;
        };

        let common_years: Vec<Year> = subject_row
            .years()
            .filter(|year| budget_row.get(*year).is_some())
            .collect();

        let mut latest_within = None;
        for year in common_years.into_iter().rev() {
            let Some(subject_value) = subject_row.get(year) else {
                continue;
            };
            let ceiling = match budget_year {
                Some(flat_year) if year < flat_year => {
                    budget_row.get(flat_year).or_else(|| budget_row.get(year))
                }
                _ => budget_row.get(year),
            };
            let Some(ceiling) = ceiling else {
                continue;
            };
            if subject_value.try_le(ceiling)? {
                latest_within = Some(year);
                break;
            }
        }

        let outcome = match latest_within {
            None => ExceedanceYear::Year(controls.base_year),
            Some(year) if year >= controls.target_year => ExceedanceYear::NeverExceeds,
            Some(year) => ExceedanceYear::Year(year),
        };
        out.push((key, outcome));
    }
    Ok(out)
}

// ── Warehouse facade ───────────────────────────────────────────────────

/// Whether warehouse construction synthesizes missing scope-3 data from
/// benchmark intensities before reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingDataEstimation {
    #[default]
    Disabled,
    FromBenchmark,
}

#[derive(Debug, Clone)]
pub struct DataWarehouse<P, I> {
    companies: Vec<CompanyRecord>,
    production_bm: P,
    intensity_bm: I,
    controls: ProjectionControls,
    ledger: DiagnosticsLedger,
}

impl<P, I> DataWarehouse<P, I>
where
    P: ProductionBenchmarkDataProvider,
    I: IntensityBenchmarkDataProvider,
{
    /// Build the warehouse's active company set: estimate missing S3 data
    /// (if enabled), apply production-centric folding, resolve each
    /// company's scoring scope and drop the unresolvable with a single
    /// aggregated warning.
    pub fn new<C>(
        company_data: &C,
        production_bm: P,
        intensity_bm: I,
        estimation: MissingDataEstimation,
    ) -> Self
    where
        C: CompanyDataProvider + ?Sized,
    {
        let controls = company_data.projection_controls();
        let all_ids = company_data.all_company_ids();
        let id_refs: Vec<&str> = all_ids.iter().map(String::as_str).collect();
        let mut companies = company_data.get_company_data(&id_refs);
        let mut ledger = DiagnosticsLedger::new();

        if estimation == MissingDataEstimation::FromBenchmark {
            let base_rows =
                company_data.get_company_intensity_and_production_at_base_year(&id_refs);
            for company in &mut companies {
                if let Some(info) = base_rows.iter().find(|r| r.company_id == company.company_id)
                {
                    estimate_missing_s3(
                        company,
                        info,
                        &production_bm,
                        &intensity_bm,
                        controls,
                        &mut ledger,
                    );
                }
            }
        }

        if intensity_bm.is_production_centric() {
            tracing::info!(
                "shifting scope 3 data into scope 1+2 under production-centric benchmark rules"
            );
            let mut kept = Vec::with_capacity(companies.len());
            for mut company in companies {
                match fold_production_centric(&mut company, &mut ledger) {
                    Ok(()) => kept.push(company),
                    Err(err) => ledger.push(
                        IssueKind::InvariantViolation,
                        &company.company_id,
                        err.to_string(),
                    ),
                }
            }
            companies = kept;
        }

        let mut resolved = Vec::with_capacity(companies.len());
        for mut company in companies {
            match resolve_scope(&intensity_bm, &company.sector, &company.region) {
                Some(scope) => {
                    company.scoring_scope = Some(scope);
                    resolved.push(company);
                }
                None => ledger.push(
                    IssueKind::UnresolvableScope,
                    &company.company_id,
                    "benchmark does not cover the company's (sector, region)",
                ),
            }
        }
        ledger.warn_aggregate(
            IssueKind::UnresolvableScope,
            "companies do not disclose scope data required by the benchmark and were removed",
        );

        Self {
            companies: resolved,
            production_bm,
            intensity_bm,
            controls,
            ledger,
        }
    }

    #[must_use]
    pub fn companies(&self) -> &[CompanyRecord] {
        &self.companies
    }

    #[must_use]
    pub fn controls(&self) -> ProjectionControls {
        self.controls
    }

    #[must_use]
    pub fn ledger(&self) -> &DiagnosticsLedger {
        &self.ledger
    }

    #[must_use]
    pub fn company_scope(&self, company_id: &str) -> Option<Scope> {
        self.companies
            .iter()
            .find(|c| c.company_id == company_id)
            .and_then(|c| c.scoring_scope)
    }

    fn select_companies(&self, company_ids: &[&str]) -> Vec<&CompanyRecord> {
        let mut seen = BTreeSet::new();
        company_ids
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| self.companies.iter().find(|c| c.company_id == *id))
            .collect()
    }

    /// Preprocess a set of companies into aggregates carrying cumulative
    /// trajectory/target/budget emissions and exceedance years. Companies
    /// the benchmark cannot score are dropped with one aggregate warning.
    pub fn get_preprocessed_company_data(&mut self, company_ids: &[&str]) -> Vec<CompanyAggregate> {
        let mut ledger = std::mem::take(&mut self.ledger);
        let aggregates = self.preprocess(company_ids, &mut ledger);
        self.ledger = ledger;
        aggregates
    }

    fn preprocess(
        &self,
        company_ids: &[&str],
        ledger: &mut DiagnosticsLedger,
    ) -> Vec<CompanyAggregate> {
        let selected = self.select_companies(company_ids);

        // Base-year rows at each company's scoring scope. The trajectory is
        // fitted from historics and is gap-free at the base year; a company
        // without it cannot anchor the SDA budget.
        let mut base_rows: Vec<BaseYearInfo> = Vec::with_capacity(selected.len());
        for company in &selected {
            let Some(scope) = company.scoring_scope else {
                continue;
            };
            let base_intensity = company
                .projected_intensities
                .get(scope)
                .and_then(|s| s.get(self.controls.base_year))
                .cloned();
            match base_intensity {
                Some(base_intensity) => base_rows.push(BaseYearInfo {
                    company_id: company.company_id.clone(),
                    sector: company.sector.clone(),
                    region: company.region.clone(),
                    scope,
                    base_intensity,
                    base_production: company.base_year_production.clone(),
                }),
                None => ledger.push(
                    IssueKind::SchemaValidationFailure,
                    &company.company_id,
                    format!(
                        "no {scope} trajectory intensity at base year {}",
                        self.controls.base_year
                    ),
                ),
            }
        }

        let production = self
            .production_bm
            .get_company_projected_production(&base_rows);

        // Trajectory and target tables come from the warehouse's own
        // reconciled records. Targets are restricted to production rows and
        // their ragged left edge is filled from the trajectory.
        let mut trajectory_table: SeriesTable<RowKey> = SeriesTable::new();
        let mut target_table: SeriesTable<RowKey> = SeriesTable::new();
        for info in &base_rows {
            let Some(company) = selected.iter().find(|c| c.company_id == info.company_id) else {
                continue;
            };
            let key = RowKey::new(&info.company_id, info.scope);
            let Some(trajectory) = company.projected_intensities.get(info.scope) else {
                continue;
            };
            let _ = trajectory_table.push(key.clone(), trajectory.clone());

            if !production.contains_key(&key) {
                continue;
            }
            if let Some(target) = company.projected_targets.get(info.scope) {
                if !target.is_empty() {
                    let _ = target_table.push(key, target.fill_left_from(trajectory));
                }
            }
        }

        let budget_table = self.intensity_bm.get_sda_intensity_benchmarks(&base_rows);

        let trajectory_cumulative =
            cumulative_table_lenient(&trajectory_table, &production, ledger);
        let target_cumulative = cumulative_table_lenient(&target_table, &production, ledger);
        let budget_cumulative = cumulative_table_lenient(&budget_table, &production, ledger);

        let trajectory_exceedance = self.exceedance_or_report(
            &trajectory_cumulative,
            &budget_cumulative,
            ledger,
        );
        let target_exceedance =
            self.exceedance_or_report(&target_cumulative, &budget_cumulative, ledger);

        let global_budget = {
            let raw = self.intensity_bm.benchmark_global_budget();
            raw.convert_to(&Unit::gt_co2()).unwrap_or(raw)
        };
        let benchmark_temperature = self.intensity_bm.benchmark_temperature();

        let mut aggregates = Vec::with_capacity(base_rows.len());
        for info in &base_rows {
            let key = RowKey::new(&info.company_id, info.scope);
            let Some(company) = selected.iter().find(|c| c.company_id == info.company_id) else {
                continue;
            };
            if !budget_cumulative.contains_key(&key) {
                // Benchmark cannot score this company at all.
                ledger.push(
                    IssueKind::SchemaValidationFailure,
                    &info.company_id,
                    "benchmark provides no budget for the company's scoring scope",
                );
                continue;
            }
            let pieces = (
                trajectory_cumulative.get(&key).and_then(|s| s.last()),
                target_cumulative.get(&key).and_then(|s| s.last()),
                budget_cumulative.get(&key).and_then(|s| s.last()),
                lookup_exceedance(&trajectory_exceedance, &key),
                lookup_exceedance(&target_exceedance, &key),
            );
            let (
                Some((_, cumulative_trajectory)),
                Some((_, cumulative_target)),
                Some((_, cumulative_budget)),
                Some(trajectory_exceedance_year),
                Some(target_exceedance_year),
            ) = pieces
            else {
                ledger.push(
                    IssueKind::SchemaValidationFailure,
                    &info.company_id,
                    format!("company {} could not be materialized into an aggregate", company.company_name),
                );
                continue;
            };

            aggregates.push(CompanyAggregate {
                company_id: company.company_id.clone(),
                company_name: company.company_name.clone(),
                sector: company.sector.clone(),
                region: company.region.clone(),
                scope: info.scope,
                ghg_s1s2: company.ghg_s1s2.clone(),
                ghg_s3: company.ghg_s3.clone(),
                cumulative_trajectory: cumulative_trajectory.clone(),
                cumulative_target: cumulative_target.clone(),
                cumulative_budget: cumulative_budget.clone(),
                trajectory_exceedance_year,
                target_exceedance_year,
                benchmark_global_budget: global_budget.clone(),
                benchmark_temperature: benchmark_temperature.clone(),
            });
        }

        ledger.warn_aggregate(
            IssueKind::SchemaValidationFailure,
            "dropping companies with no scope data",
        );
        aggregates
    }

    fn exceedance_or_report(
        &self,
        subject: &SeriesTable<RowKey>,
        budget: &SeriesTable<RowKey>,
        ledger: &mut DiagnosticsLedger,
    ) -> Vec<(RowKey, ExceedanceYear)> {
        match exceedance_years(subject, budget, Some(self.controls.target_year), self.controls) {
            Ok(rows) => rows,
            Err(err) => {
                ledger.push(IssueKind::InvariantViolation, "", err.to_string());
                Vec::new()
            }
        }
    }
}

fn lookup_exceedance(
    rows: &[(RowKey, ExceedanceYear)],
    key: &RowKey,
) -> Option<ExceedanceYear> {
    rows.iter()
        .find(|(k, _)| k == key)
        .map(|(_, outcome)| *outcome)
}

/// Per-row cumulative table: a failing row is reported against its company
/// and dropped; the rest of the batch continues.
fn cumulative_table_lenient(
    projected_ei: &SeriesTable<RowKey>,
    projected_production: &SeriesTable<RowKey>,
    ledger: &mut DiagnosticsLedger,
) -> SeriesTable<RowKey> {
    let unit = canonical_mass();
    let mut out = SeriesTable::new();
    for (key, ei) in projected_ei.iter() {
        let Some(production) = projected_production.get(key) else {
            ledger.push(
                IssueKind::InvariantViolation,
                &key.company_id,
                WarehouseError::MissingProductionRow {
                    company_id: key.company_id.clone(),
                    scope: key.scope,
                }
                .to_string(),
            );
            continue;
        };
        match cumulative_emissions_row(ei, production, &unit) {
            Ok(row) => {
                let _ = out.push(key.clone(), row);
            }
            Err(source) => ledger.push(
                IssueKind::InvariantViolation,
                &key.company_id,
                WarehouseError::CumulativeInvariant {
                    company_id: key.company_id.clone(),
                    scope: key.scope,
                    source,
                }
                .to_string(),
            ),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{
        DataWarehouse, MissingDataEstimation, WarehouseError, cumulative_emissions,
        cumulative_emissions_row, estimate_missing_s3, exceedance_years, fold_production_centric,
        resolve_scope,
    };
    use cb_benchmark::{GLOBAL_REGION, IntensityBenchmark, ProductionBenchmark};
    use cb_company::{
        BaseYearInfo, CompanyRecord, ExceedanceYear, InMemoryCompanyProvider, ProjectionControls,
        RowKey, Scope, ScopeBundle,
    };
    use cb_diagnostics::{DiagnosticsLedger, IssueKind};
    use cb_series::{SeriesTable, YearSeries};
    use cb_units::{Quantity, Unit};

    const SECTOR: &str = "Electricity Utilities";
    const REGION: &str = "Europe";

    fn controls() -> ProjectionControls {
        ProjectionControls {
            base_year: 2020,
            target_year: 2024,
        }
    }

    fn intensity_unit() -> Unit {
        Unit::t_co2().per(&Unit::production("GWh"))
    }

    fn mass_series(points: &[(i32, f64)]) -> YearSeries {
        YearSeries::from_points(
            points
                .iter()
                .map(|(y, m)| (*y, Quantity::new(*m, Unit::t_co2()))),
        )
        .expect("distinct years")
    }

    fn ei_series(points: &[(i32, f64)]) -> YearSeries {
        YearSeries::from_points(
            points
                .iter()
                .map(|(y, m)| (*y, Quantity::new(*m, intensity_unit()))),
        )
        .expect("distinct years")
    }

    fn production_series(points: &[(i32, f64)]) -> YearSeries {
        YearSeries::from_points(
            points
                .iter()
                .map(|(y, m)| (*y, Quantity::new(*m, Unit::production("GWh")))),
        )
        .expect("distinct years")
    }

    fn record(id: &str) -> CompanyRecord {
        CompanyRecord {
            company_id: id.to_owned(),
            company_name: format!("{id} Corp."),
            sector: SECTOR.to_owned(),
            region: REGION.to_owned(),
            base_year_production: Quantity::new(100.0, Unit::production("GWh")),
            ghg_s1s2: Some(Quantity::new(1.0, Unit::mt_co2())),
            ghg_s3: None,
            historic_emissions: ScopeBundle::new(),
            historic_intensities: ScopeBundle::new(),
            projected_intensities: ScopeBundle::new(),
            projected_targets: ScopeBundle::new(),
            scoring_scope: None,
        }
    }

    fn flat_path(value: f64) -> YearSeries {
        YearSeries::from_points((2020..=2024).map(|y| (y, Quantity::new(value, intensity_unit()))))
            .expect("distinct years")
    }

    fn benchmark_with_scopes(scopes: &[Scope]) -> IntensityBenchmark {
        let mut bm = IntensityBenchmark::new(
            controls(),
            false,
            Quantity::new(400.0, Unit::gt_co2()),
            Quantity::new(1.5, Unit::delta_degc()),
        );
        for scope in scopes {
            bm.insert_path(SECTOR, REGION, *scope, flat_path(1.0));
        }
        bm
    }

    fn flat_production_benchmark() -> ProductionBenchmark {
        let mut bm = ProductionBenchmark::new(controls());
        let growth =
            YearSeries::from_points((2020..=2024).map(|y| (y, Quantity::dimensionless(0.0))))
                .expect("distinct years");
        bm.insert_growth(SECTOR, GLOBAL_REGION, growth);
        bm
    }

    fn base_info(id: &str) -> BaseYearInfo {
        BaseYearInfo {
            company_id: id.to_owned(),
            sector: SECTOR.to_owned(),
            region: REGION.to_owned(),
            scope: Scope::S1S2,
            base_intensity: Quantity::new(5.0, intensity_unit()),
            base_production: Quantity::new(100.0, Unit::production("GWh")),
        }
    }

    // ── Scope resolution ───────────────────────────────────────────────

    #[test]
    fn single_published_scope_wins_outright() {
        let bm = benchmark_with_scopes(&[Scope::S3]);
        assert_eq!(resolve_scope(&bm, SECTOR, REGION), Some(Scope::S3));
    }

    #[test]
    fn several_scopes_resolve_through_priority() {
        let bm = benchmark_with_scopes(&[Scope::S1, Scope::S1S2, Scope::S1S2S3]);
        assert_eq!(resolve_scope(&bm, SECTOR, REGION), Some(Scope::S1S2S3));
        let bm = benchmark_with_scopes(&[Scope::S1, Scope::S1S2]);
        assert_eq!(resolve_scope(&bm, SECTOR, REGION), Some(Scope::S1S2));
        let bm = benchmark_with_scopes(&[Scope::S1, Scope::S3]);
        assert_eq!(resolve_scope(&bm, SECTOR, REGION), Some(Scope::S1));
    }

    #[test]
    fn resolution_falls_back_to_global_region() {
        let mut bm = IntensityBenchmark::new(
            controls(),
            false,
            Quantity::new(400.0, Unit::gt_co2()),
            Quantity::new(1.5, Unit::delta_degc()),
        );
        bm.insert_path(SECTOR, GLOBAL_REGION, Scope::S1S2, flat_path(1.0));
        assert_eq!(resolve_scope(&bm, SECTOR, "Asia"), Some(Scope::S1S2));
        assert_eq!(resolve_scope(&bm, "Steel", "Asia"), None);
    }

    // ── Production-centric folding ─────────────────────────────────────

    #[test]
    fn ghg_totals_absorb_finite_scope3() {
        let mut company = record("A");
        company.ghg_s3 = Some(Quantity::new(0.5, Unit::mt_co2()));
        let mut ledger = DiagnosticsLedger::new();
        fold_production_centric(&mut company, &mut ledger).expect("folds");
        assert_eq!(company.ghg_s1s2.as_ref().expect("present").magnitude(), 1.5);
        assert!(company.ghg_s3.is_none());
    }

    #[test]
    fn non_finite_ghg_scope3_is_dropped_not_added() {
        let mut company = record("A");
        company.ghg_s3 = Some(Quantity::new(f64::NAN, Unit::mt_co2()));
        let mut ledger = DiagnosticsLedger::new();
        fold_production_centric(&mut company, &mut ledger).expect("folds");
        assert_eq!(company.ghg_s1s2.as_ref().expect("present").magnitude(), 1.0);
        assert!(company.ghg_s3.is_none());
    }

    #[test]
    fn historic_fold_back_casts_before_anchor_and_sums_after() {
        let mut company = record("A");
        company
            .historic_emissions
            .set(Scope::S1S2, mass_series(&[(2019, 10.0), (2020, 12.0), (2021, 14.0)]));
        company
            .historic_emissions
            .set(Scope::S3, mass_series(&[(2020, 3.0), (2021, 4.0)]));
        let mut ledger = DiagnosticsLedger::new();
        fold_production_centric(&mut company, &mut ledger).expect("folds");

        let s1s2 = company.historic_emissions.get(Scope::S1S2).expect("kept");
        // 2019 back-cast: 10 + 3 * 10/12
        assert!((s1s2.get(2019).expect("2019").magnitude() - 12.5).abs() < 1e-12);
        assert_eq!(s1s2.get(2020).expect("2020").magnitude(), 15.0);
        assert_eq!(s1s2.get(2021).expect("2021").magnitude(), 18.0);
        assert!(!company.historic_emissions.has(Scope::S3));
        assert!(!company.historic_emissions.has(Scope::S1S2S3));
    }

    #[test]
    fn conservation_holds_on_every_aligned_year() {
        let before = mass_series(&[(2020, 12.0), (2021, 14.0), (2022, 16.0)]);
        let s3 = mass_series(&[(2020, 3.0), (2021, 4.0), (2022, 5.0)]);
        let mut company = record("A");
        company.historic_emissions.set(Scope::S1S2, before.clone());
        company.historic_emissions.set(Scope::S3, s3.clone());
        let mut ledger = DiagnosticsLedger::new();
        fold_production_centric(&mut company, &mut ledger).expect("folds");

        let after = company.historic_emissions.get(Scope::S1S2).expect("kept");
        for (year, value) in before.iter() {
            let expected = value.magnitude() + s3.get(year).expect("aligned").magnitude();
            assert_eq!(after.get(year).expect("aligned").magnitude(), expected);
        }
    }

    #[test]
    fn empty_primary_is_replaced_by_scope3_series() {
        let s3 = mass_series(&[(2020, 3.0), (2021, 4.0)]);
        let mut company = record("A");
        company.historic_emissions.set(Scope::S3, s3.clone());
        let mut ledger = DiagnosticsLedger::new();
        fold_production_centric(&mut company, &mut ledger).expect("folds");
        assert_eq!(company.historic_emissions.get(Scope::S1), Some(&s3));
        assert_eq!(company.historic_emissions.get(Scope::S1S2), Some(&s3));
    }

    #[test]
    fn missing_backcast_anchor_fails_the_company() {
        let mut company = record("A");
        company
            .historic_emissions
            .set(Scope::S1S2, mass_series(&[(2022, 10.0), (2023, 11.0)]));
        company
            .historic_emissions
            .set(Scope::S3, mass_series(&[(2020, 3.0)]));
        let mut ledger = DiagnosticsLedger::new();
        let err = fold_production_centric(&mut company, &mut ledger).expect_err("no anchor");
        assert_eq!(
            err,
            WarehouseError::NoBackcastAnchor {
                company_id: "A".to_owned(),
                anchor_year: 2020,
            }
        );
    }

    #[test]
    fn folding_twice_is_a_no_op() {
        let mut company = record("A");
        company.ghg_s3 = Some(Quantity::new(0.5, Unit::mt_co2()));
        company
            .historic_emissions
            .set(Scope::S1S2, mass_series(&[(2019, 10.0), (2020, 12.0)]));
        company
            .historic_emissions
            .set(Scope::S3, mass_series(&[(2020, 3.0)]));
        company
            .projected_intensities
            .set(Scope::S1S2, ei_series(&[(2020, 1.0), (2021, 0.9)]));
        company
            .projected_intensities
            .set(Scope::S3, ei_series(&[(2020, 0.5), (2021, 0.4)]));
        company
            .projected_targets
            .set(Scope::S1S2, ei_series(&[(2020, 1.0), (2021, 0.8)]));
        company
            .projected_targets
            .set(Scope::S3, ei_series(&[(2020, 0.5), (2021, 0.3)]));

        let mut ledger = DiagnosticsLedger::new();
        fold_production_centric(&mut company, &mut ledger).expect("first fold");
        let after_first = company.clone();
        fold_production_centric(&mut company, &mut ledger).expect("second fold");
        assert_eq!(company, after_first);
    }

    #[test]
    fn trajectory_fold_sums_aligned_series() {
        let mut company = record("A");
        company
            .projected_intensities
            .set(Scope::S1S2, ei_series(&[(2020, 1.0), (2021, 0.9)]));
        company
            .projected_intensities
            .set(Scope::S3, ei_series(&[(2020, 0.5), (2021, 0.4)]));
        let mut ledger = DiagnosticsLedger::new();
        fold_production_centric(&mut company, &mut ledger).expect("folds");
        let s1s2 = company.projected_intensities.get(Scope::S1S2).expect("kept");
        assert!((s1s2.get(2020).expect("2020").magnitude() - 1.5).abs() < 1e-12);
        assert!((s1s2.get(2021).expect("2021").magnitude() - 1.3).abs() < 1e-12);
        // S1 had no trajectory, so it inherits the scope 3 path
        assert_eq!(
            company.projected_intensities.get(Scope::S1).expect("set").len(),
            2
        );
    }

    #[test]
    fn misaligned_trajectory_skips_fold_and_reports() {
        let mut company = record("A");
        company
            .projected_intensities
            .set(Scope::S1S2, ei_series(&[(2020, 1.0), (2021, 0.9)]));
        company
            .projected_intensities
            .set(Scope::S3, ei_series(&[(2021, 0.4), (2022, 0.3)]));
        let mut ledger = DiagnosticsLedger::new();
        fold_production_centric(&mut company, &mut ledger).expect("company survives");
        // S1S2 untouched, S3 cleared, misalignment on the ledger
        let s1s2 = company.projected_intensities.get(Scope::S1S2).expect("kept");
        assert_eq!(s1s2.get(2020).expect("2020").magnitude(), 1.0);
        assert!(!company.projected_intensities.has(Scope::S3));
        assert!(ledger.count(IssueKind::IrrecoverableMisalignment) >= 1);
    }

    #[test]
    fn missing_scope2_target_treats_it_as_zero() {
        let mut company = record("A");
        company
            .projected_targets
            .set(Scope::S1, ei_series(&[(2020, 1.0), (2021, 0.9)]));
        company
            .projected_targets
            .set(Scope::S3, ei_series(&[(2020, 0.5), (2021, 0.4)]));
        let mut ledger = DiagnosticsLedger::new();
        fold_production_centric(&mut company, &mut ledger).expect("folds");

        let s1 = company.projected_targets.get(Scope::S1).expect("folded");
        assert!((s1.get(2020).expect("2020").magnitude() - 1.5).abs() < 1e-12);
        // S1+S2 synthesized from scope 1 alone, then folded: identical to S1
        let s1s2 = company.projected_targets.get(Scope::S1S2).expect("repaired");
        assert!((s1s2.get(2020).expect("2020").magnitude() - 1.5).abs() < 1e-12);
        assert_eq!(ledger.count(IssueKind::DataRepairApplied), 1);
        assert!(!company.projected_targets.has(Scope::S3));
    }

    #[test]
    fn scope3_lands_in_repaired_s1s2_exactly_once() {
        let mut company = record("A");
        company
            .projected_targets
            .set(Scope::S1, ei_series(&[(2020, 1.0)]));
        company
            .projected_targets
            .set(Scope::S2, ei_series(&[(2020, 0.2)]));
        company
            .projected_targets
            .set(Scope::S3, ei_series(&[(2020, 0.5)]));
        let mut ledger = DiagnosticsLedger::new();
        fold_production_centric(&mut company, &mut ledger).expect("folds");

        // s1s2 = s1_before + s2_before + s3 = 1.0 + 0.2 + 0.5, not 2.2
        let s1s2 = company.projected_targets.get(Scope::S1S2).expect("repaired");
        assert!((s1s2.get(2020).expect("2020").magnitude() - 1.7).abs() < 1e-12);
        assert_eq!(ledger.count(IssueKind::DataRepairApplied), 1);
    }

    #[test]
    fn disjoint_target_years_skip_fold_with_error() {
        let mut company = record("A");
        company
            .projected_targets
            .set(Scope::S1S2, ei_series(&[(2020, 1.0), (2021, 0.9)]));
        company
            .projected_targets
            .set(Scope::S3, ei_series(&[(2030, 0.5), (2031, 0.4)]));
        let mut ledger = DiagnosticsLedger::new();
        fold_production_centric(&mut company, &mut ledger).expect("company survives");

        let s1s2 = company.projected_targets.get(Scope::S1S2).expect("kept");
        assert_eq!(s1s2.get(2020).expect("2020").magnitude(), 1.0);
        assert!(!company.projected_targets.has(Scope::S3));
        assert_eq!(ledger.count(IssueKind::IrrecoverableMisalignment), 1);
    }

    // ── Scope-3 estimation ─────────────────────────────────────────────

    fn s3_benchmark() -> IntensityBenchmark {
        let mut bm = benchmark_with_scopes(&[Scope::S1S2]);
        bm.insert_path(SECTOR, REGION, Scope::S3, flat_path(0.5));
        bm
    }

    #[test]
    fn estimator_synthesizes_ghg_and_series() {
        let mut company = record("A");
        company
            .historic_emissions
            .set(Scope::S1S2, mass_series(&[(2019, 900.0), (2020, 1000.0), (2021, 1000.0)]));
        company
            .historic_intensities
            .set(Scope::S1S2, ei_series(&[(2020, 10.0), (2021, 10.0)]));
        company
            .projected_intensities
            .set(Scope::S1S2, flat_path(10.0));
        let mut ledger = DiagnosticsLedger::new();
        estimate_missing_s3(
            &mut company,
            &base_info("A"),
            &flat_production_benchmark(),
            &s3_benchmark(),
            controls(),
            &mut ledger,
        );

        // 0.5 t/GWh * 100 GWh = 50 t at the base year
        let ghg_s3 = company.ghg_s3.as_ref().expect("estimated");
        assert!((ghg_s3.convert_to(&Unit::t_co2()).expect("mass").magnitude() - 50.0).abs() < 1e-9);

        // Historic S3 only at disclosed S1+S2 years >= base year
        let s3_hist = company.historic_emissions.get(Scope::S3).expect("estimated");
        assert_eq!(s3_hist.years().collect::<Vec<_>>(), vec![2020, 2021]);
        assert!(company.historic_emissions.has(Scope::S1S2S3));

        // Trajectory S3 aligned to the S1+S2 trajectory, summed into S1S2S3
        let s3_traj = company.projected_intensities.get(Scope::S3).expect("estimated");
        assert_eq!(s3_traj.len(), 5);
        let total = company
            .projected_intensities
            .get(Scope::S1S2S3)
            .expect("synthesized");
        assert!((total.get(2020).expect("2020").magnitude() - 10.5).abs() < 1e-12);
    }

    #[test]
    fn estimator_skips_companies_disclosing_s3() {
        let mut company = record("A");
        company
            .historic_emissions
            .set(Scope::S3, mass_series(&[(2020, 5.0)]));
        let before = company.clone();
        let mut ledger = DiagnosticsLedger::new();
        estimate_missing_s3(
            &mut company,
            &base_info("A"),
            &flat_production_benchmark(),
            &s3_benchmark(),
            controls(),
            &mut ledger,
        );
        assert_eq!(company, before);
        assert!(ledger.is_empty());
    }

    #[test]
    fn estimator_skips_when_benchmark_has_no_s3_path() {
        let mut company = record("A");
        company
            .projected_intensities
            .set(Scope::S1S2, flat_path(10.0));
        let before = company.clone();
        let mut ledger = DiagnosticsLedger::new();
        estimate_missing_s3(
            &mut company,
            &base_info("A"),
            &flat_production_benchmark(),
            &benchmark_with_scopes(&[Scope::S1S2]),
            controls(),
            &mut ledger,
        );
        assert_eq!(company, before);
    }

    #[test]
    fn incompatible_units_abandon_estimate_without_stopping_batch() {
        // Steel production against an energy-denominated S3 intensity
        let mut bad = record("bad");
        bad.base_year_production = Quantity::new(30.0, Unit::production("t Steel"));
        bad.projected_intensities.set(Scope::S1S2, flat_path(10.0));
        let mut bad_info = base_info("bad");
        bad_info.base_production = bad.base_year_production.clone();

        let mut production_bm = flat_production_benchmark();
        let growth =
            YearSeries::from_points((2020..=2024).map(|y| (y, Quantity::dimensionless(0.0))))
                .expect("distinct years");
        production_bm.insert_growth(SECTOR, REGION, growth);

        let mut ledger = DiagnosticsLedger::new();
        estimate_missing_s3(
            &mut bad,
            &bad_info,
            &production_bm,
            &s3_benchmark(),
            controls(),
            &mut ledger,
        );
        assert!(bad.ghg_s3.is_none());
        assert_eq!(ledger.count(IssueKind::UnitMismatch), 1);

        // A well-formed company still estimates afterward
        let mut good = record("good");
        good.projected_intensities.set(Scope::S1S2, flat_path(10.0));
        estimate_missing_s3(
            &mut good,
            &base_info("good"),
            &production_bm,
            &s3_benchmark(),
            controls(),
            &mut ledger,
        );
        assert!(good.ghg_s3.is_some());
    }

    // ── Cumulative emissions ───────────────────────────────────────────

    #[test]
    fn cumulative_sum_matches_worked_example() {
        // intensities [[1,2],[3,4]] x production [[2,4],[6,8]] -> [10, 50]
        let mut ei = SeriesTable::new();
        ei.push(RowKey::new("r0", Scope::S1S2), ei_series(&[(2020, 1.0), (2021, 2.0)]))
            .expect("fresh");
        ei.push(RowKey::new("r1", Scope::S1S2), ei_series(&[(2020, 3.0), (2021, 4.0)]))
            .expect("fresh");
        let mut production = SeriesTable::new();
        production
            .push(
                RowKey::new("r0", Scope::S1S2),
                production_series(&[(2020, 2.0), (2021, 4.0)]),
            )
            .expect("fresh");
        production
            .push(
                RowKey::new("r1", Scope::S1S2),
                production_series(&[(2020, 6.0), (2021, 8.0)]),
            )
            .expect("fresh");

        let cumulative =
            cumulative_emissions(&ei, &production, &Unit::t_co2()).expect("well-formed");
        let last = cumulative.last_values();
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].0, RowKey::new("r0", Scope::S1S2));
        assert_eq!(last[0].1.magnitude(), 10.0);
        assert_eq!(last[1].1.magnitude(), 50.0);
        // Row 0 path: 1x2=2, then +2x4=8 -> [2, 10]
        let row0 = cumulative.get(&RowKey::new("r0", Scope::S1S2)).expect("row");
        assert_eq!(row0.get(2020).expect("2020").magnitude(), 2.0);
        assert_eq!(row0.get(2021).expect("2021").magnitude(), 10.0);
    }

    #[test]
    fn cumulative_ignores_production_years_outside_intensity() {
        let ei = ei_series(&[(2020, 1.0), (2021, 1.0)]);
        let production = production_series(&[(2020, 2.0), (2021, 2.0), (2022, 99.0)]);
        let row = cumulative_emissions_row(&ei, &production, &Unit::t_co2()).expect("covered");
        assert_eq!(row.years().collect::<Vec<_>>(), vec![2020, 2021]);
        assert_eq!(row.get(2021).expect("2021").magnitude(), 4.0);
    }

    #[test]
    fn cumulative_fails_on_missing_production_year() {
        let ei = ei_series(&[(2020, 1.0), (2021, 1.0)]);
        let production = production_series(&[(2020, 2.0)]);
        let err = cumulative_emissions_row(&ei, &production, &Unit::t_co2())
            .expect_err("2021 uncovered");
        assert_eq!(err, cb_series::SeriesError::MissingYear { year: 2021 });
    }

    #[test]
    fn cumulative_fails_on_missing_production_row() {
        let mut ei = SeriesTable::new();
        ei.push(RowKey::new("r0", Scope::S1S2), ei_series(&[(2020, 1.0)]))
            .expect("fresh");
        let production = SeriesTable::new();
        let err = cumulative_emissions(&ei, &production, &Unit::t_co2())
            .expect_err("no production row");
        assert!(matches!(err, WarehouseError::MissingProductionRow { .. }));
    }

    #[test]
    fn cumulative_refuses_nan_products() {
        let ei = YearSeries::from_points(vec![
            (2020, Quantity::new(1.0, intensity_unit())),
            (2021, Quantity::new(f64::NAN, intensity_unit())),
        ])
        .expect("distinct");
        let production = production_series(&[(2020, 2.0), (2021, 2.0)]);
        let err =
            cumulative_emissions_row(&ei, &production, &Unit::t_co2()).expect_err("NaN product");
        assert_eq!(err, cb_series::SeriesError::MissingValue { year: 2021 });
    }

    // ── Exceedance evaluation ──────────────────────────────────────────

    fn single_row_tables(
        subject: YearSeries,
        budget: YearSeries,
    ) -> (SeriesTable<RowKey>, SeriesTable<RowKey>) {
        let key = RowKey::new("A", Scope::S1S2);
        let mut subject_table = SeriesTable::new();
        subject_table.push(key.clone(), subject).expect("fresh");
        let mut budget_table = SeriesTable::new();
        budget_table.push(key, budget).expect("fresh");
        (subject_table, budget_table)
    }

    #[test]
    fn always_within_budget_never_exceeds() {
        let (subject, budget) = single_row_tables(
            mass_series(&[(2023, 1.0), (2024, 2.0)]),
            mass_series(&[(2023, 5.0), (2024, 5.0)]),
        );
        let rows = exceedance_years(&subject, &budget, None, controls()).expect("evaluates");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, ExceedanceYear::NeverExceeds);
    }

    #[test]
    fn always_over_budget_maps_to_base_year() {
        let (subject, budget) = single_row_tables(
            mass_series(&[(2022, 9.0), (2023, 9.5)]),
            mass_series(&[(2022, 5.0), (2023, 5.5)]),
        );
        let rows = exceedance_years(&subject, &budget, None, controls()).expect("evaluates");
        assert_eq!(rows[0].1, ExceedanceYear::Year(2020));
    }

    #[test]
    fn latest_compliant_year_before_target_is_returned() {
        let (subject, budget) = single_row_tables(
            mass_series(&[(2021, 1.0), (2022, 2.0), (2023, 9.0)]),
            mass_series(&[(2021, 2.0), (2022, 2.0), (2023, 3.0)]),
        );
        let rows = exceedance_years(&subject, &budget, None, controls()).expect("evaluates");
        assert_eq!(rows[0].1, ExceedanceYear::Year(2022));
    }

    #[test]
    fn budget_year_flattens_earlier_ceilings() {
        let subject = mass_series(&[(2020, 25.0), (2021, 25.0), (2022, 35.0)]);
        let budget = mass_series(&[(2020, 10.0), (2021, 20.0), (2022, 30.0)]);
        let (subject, budget) = single_row_tables(subject, budget);

        // Growing budget: no year admits the subject
        let rows = exceedance_years(&subject, &budget, None, controls()).expect("evaluates");
        assert_eq!(rows[0].1, ExceedanceYear::Year(2020));

        // Fixed early ceiling at the 2022 budget: 2021 becomes compliant
        let rows =
            exceedance_years(&subject, &budget, Some(2022), controls()).expect("evaluates");
        assert_eq!(rows[0].1, ExceedanceYear::Year(2021));
    }

    #[test]
    fn rows_missing_from_either_table_are_excluded() {
        let mut subject = SeriesTable::new();
        subject
            .push(RowKey::new("both", Scope::S1S2), mass_series(&[(2021, 1.0)]))
            .expect("fresh");
        subject
            .push(
                RowKey::new("subject_only", Scope::S1S2),
                mass_series(&[(2021, 1.0)]),
            )
            .expect("fresh");
        let mut budget = SeriesTable::new();
        budget
            .push(RowKey::new("both", Scope::S1S2), mass_series(&[(2021, 2.0)]))
            .expect("fresh");
        budget
            .push(
                RowKey::new("budget_only", Scope::S1S2),
                mass_series(&[(2021, 2.0)]),
            )
            .expect("fresh");

        let rows = exceedance_years(&subject, &budget, None, controls()).expect("evaluates");
        let keys: Vec<&str> = rows.iter().map(|(k, _)| k.company_id.as_str()).collect();
        assert_eq!(keys, vec!["both"]);
    }

    // ── Warehouse construction ─────────────────────────────────────────

    #[test]
    fn construction_resolves_scopes_and_drops_uncovered_companies() {
        let mut covered = record("covered");
        covered.projected_intensities.set(Scope::S1S2, flat_path(5.0));
        let mut uncovered = record("uncovered");
        uncovered.sector = "Shipping".to_owned();
        let provider =
            InMemoryCompanyProvider::new(vec![covered, uncovered], controls());
        let warehouse = DataWarehouse::new(
            &provider,
            flat_production_benchmark(),
            benchmark_with_scopes(&[Scope::S1S2]),
            MissingDataEstimation::Disabled,
        );

        assert_eq!(warehouse.companies().len(), 1);
        assert_eq!(warehouse.company_scope("covered"), Some(Scope::S1S2));
        assert_eq!(
            warehouse.ledger().companies_with(IssueKind::UnresolvableScope),
            vec!["uncovered"]
        );
    }

    #[test]
    fn production_centric_construction_folds_disclosed_scope3() {
        let mut company = record("A");
        company.ghg_s3 = Some(Quantity::new(0.5, Unit::mt_co2()));
        company.projected_intensities.set(Scope::S1S2, flat_path(1.0));
        company.projected_intensities.set(Scope::S3, flat_path(0.5));
        let provider = InMemoryCompanyProvider::new(vec![company], controls());

        let mut bm = IntensityBenchmark::new(
            controls(),
            true,
            Quantity::new(400.0, Unit::gt_co2()),
            Quantity::new(1.5, Unit::delta_degc()),
        );
        bm.insert_path(SECTOR, REGION, Scope::S1S2, flat_path(1.0));
        let warehouse = DataWarehouse::new(
            &provider,
            flat_production_benchmark(),
            bm,
            MissingDataEstimation::Disabled,
        );

        let folded = &warehouse.companies()[0];
        assert_eq!(folded.ghg_s1s2.as_ref().expect("present").magnitude(), 1.5);
        assert!(folded.ghg_s3.is_none());
        let s1s2 = folded.projected_intensities.get(Scope::S1S2).expect("kept");
        assert!((s1s2.get(2020).expect("2020").magnitude() - 1.5).abs() < 1e-12);
        assert!(!folded.projected_intensities.has(Scope::S3));
    }
}
