#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// What went wrong (or was repaired) while preparing a company's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Benchmark covers no scope for the company's (sector, region).
    UnresolvableScope,
    /// Physical units cannot combine; the operation was abandoned.
    UnitMismatch,
    /// A heuristic substitution was applied; results may be approximate.
    DataRepairApplied,
    /// Year ranges could not be reconciled; a fold was skipped.
    IrrecoverableMisalignment,
    /// A computation precondition failed; the company's pipeline stopped.
    InvariantViolation,
    /// A row failed to materialize into an aggregate record.
    SchemaValidationFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

impl IssueKind {
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            IssueKind::UnresolvableScope
            | IssueKind::DataRepairApplied
            | IssueKind::SchemaValidationFailure => Severity::Warning,
            IssueKind::UnitMismatch
            | IssueKind::IrrecoverableMisalignment
            | IssueKind::InvariantViolation => Severity::Error,
        }
    }
}

/// One recorded incident, attributable to a single company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub company_id: String,
    pub detail: String,
}

/// Append-only record of everything the engine repaired, skipped or dropped
/// during a run. Each push also emits a tracing event at the issue's
/// severity; batch-level summaries go out once via `warn_aggregate`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsLedger {
    issues: Vec<Issue>,
}

impl DiagnosticsLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        kind: IssueKind,
        company_id: impl Into<String>,
        detail: impl Into<String>,
    ) {
        let issue = Issue {
            kind,
            company_id: company_id.into(),
            detail: detail.into(),
        };
        match kind.severity() {
            Severity::Warning => tracing::warn!(
                company_id = %issue.company_id,
                kind = ?issue.kind,
                "{}",
                issue.detail
            ),
            Severity::Error => tracing::error!(
                company_id = %issue.company_id,
                kind = ?issue.kind,
                "{}",
                issue.detail
            ),
        }
        self.issues.push(issue);
    }

    #[must_use]
    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    #[must_use]
    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|i| i.kind == kind).count()
    }

    /// Company ids recorded under `kind`, in first-seen order, deduplicated.
    #[must_use]
    pub fn companies_with(&self, kind: IssueKind) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for issue in self.issues.iter().filter(|i| i.kind == kind) {
            if !out.contains(&issue.company_id.as_str()) {
                out.push(&issue.company_id);
            }
        }
        out
    }

    /// Emit one batch-level warning naming every company recorded under
    /// `kind`. Quiet when no company is affected.
    pub fn warn_aggregate(&self, kind: IssueKind, message: &str) {
        let companies = self.companies_with(kind);
        if companies.is_empty() {
            return;
        }
        tracing::warn!(kind = ?kind, companies = ?companies, "{message}");
    }
}
