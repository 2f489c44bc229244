//! Filterable churn dashboard over scored master rows

use crate::features::{ACCOUNT_KEY, CHURNED};
use crate::model::RISK_SCORE;
use crate::store::{number_field, text_field};
use mongodb::bson::Document;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Number of equal-width histogram bins over [0, 1]
pub const HISTOGRAM_BINS: usize = 20;
/// Accounts listed in the high-risk table
pub const TOP_RISK_ACCOUNTS: usize = 10;

/// The slice of a master row the dashboard reads
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardRow {
    pub account_id: String,
    pub account_name: Option<String>,
    pub industry: Option<String>,
    pub plan_tier: Option<String>,
    pub churned: bool,
    pub avg_mrr: f64,
    pub churn_risk_score: f64,
    pub total_usage: f64,
    pub total_tickets: f64,
}

impl DashboardRow {
    /// Read a row from a stored document. Missing numbers read as 0 and
    /// missing text as `None`.
    pub fn from_document(document: &Document) -> Self {
        Self {
            account_id: text_field(document, ACCOUNT_KEY).unwrap_or_default(),
            account_name: text_field(document, "account_name"),
            industry: text_field(document, "industry"),
            plan_tier: text_field(document, "plan_tier"),
            churned: number_field(document, CHURNED) >= 0.5,
            avg_mrr: number_field(document, "avg_mrr"),
            churn_risk_score: number_field(document, RISK_SCORE),
            total_usage: number_field(document, "total_usage"),
            total_tickets: number_field(document, "total_tickets"),
        }
    }

    pub fn status(&self) -> Status {
        if self.churned {
            Status::Churned
        } else {
            Status::Active
        }
    }
}

pub fn documents_to_rows(documents: &[Document]) -> Vec<DashboardRow> {
    documents.iter().map(DashboardRow::from_document).collect()
}

/// Account status derived from `churned`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Active,
    Churned,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Active => write!(f, "Active"),
            Status::Churned => write!(f, "Churned"),
        }
    }
}

/// Risk bands over the clamped score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskSegment {
    Low,
    Medium,
    High,
}

impl RiskSegment {
    pub const ALL: [RiskSegment; 3] = [RiskSegment::Low, RiskSegment::Medium, RiskSegment::High];

    /// Low [0, 0.3), Medium [0.3, 0.6), High [0.6, 1]. Scores outside [0, 1]
    /// are clamped first, NaN counts as 0.
    pub fn from_score(score: f64) -> Self {
        let score = clamp_score(score);
        if score < 0.3 {
            RiskSegment::Low
        } else if score < 0.6 {
            RiskSegment::Medium
        } else {
            RiskSegment::High
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RiskSegment::Low => "Low",
            RiskSegment::Medium => "Medium",
            RiskSegment::High => "High",
        }
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Industry and plan-tier selections. `None` selects rows where the value
/// is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    pub industries: BTreeSet<Option<String>>,
    pub plan_tiers: BTreeSet<Option<String>>,
}

impl Filters {
    /// Select every industry and plan tier that appears in `rows`, missing
    /// values included
    pub fn all_observed(rows: &[DashboardRow]) -> Self {
        Self {
            industries: rows.iter().map(|r| r.industry.clone()).collect(),
            plan_tiers: rows.iter().map(|r| r.plan_tier.clone()).collect(),
        }
    }

    /// Restrict to the named values
    pub fn select<I, S>(values: I) -> BTreeSet<Option<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        values.into_iter().map(|v| Some(v.into())).collect()
    }

    fn matches(&self, row: &DashboardRow) -> bool {
        self.industries.contains(&row.industry) && self.plan_tiers.contains(&row.plan_tier)
    }
}

/// Rows whose industry is selected AND whose plan tier is selected
pub fn apply_filters(rows: &[DashboardRow], filters: &Filters) -> Vec<DashboardRow> {
    let kept: Vec<DashboardRow> = rows.iter().filter(|r| filters.matches(r)).cloned().collect();
    debug!(total = rows.len(), kept = kept.len(), "dashboard filters applied");
    kept
}

/// Per-status counts and means
#[derive(Debug, Clone, PartialEq)]
pub struct StatusBreakdown {
    pub status: Status,
    pub accounts: usize,
    pub mean_usage: f64,
    pub mean_tickets: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndustryChurn {
    pub industry: String,
    pub accounts: usize,
    pub churn_rate_pct: f64,
}

/// Everything the dashboard shows for one filtered row set
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardSummary {
    pub total_accounts: usize,
    pub churn_rate_pct: f64,
    pub avg_mrr: f64,
    /// Active first, then Churned; both always present
    pub by_status: Vec<StatusBreakdown>,
    /// Highest risk first
    pub top_risk: Vec<DashboardRow>,
    /// Counts per bin; bin `i` covers [i/20, (i+1)/20), the last bin is closed
    pub risk_histogram: [usize; HISTOGRAM_BINS],
    /// Low, Medium, High
    pub segments: Vec<(RiskSegment, usize)>,
    /// Highest churn rate first
    pub churn_by_industry: Vec<IndustryChurn>,
}

impl DashboardSummary {
    pub fn compute(rows: &[DashboardRow]) -> Self {
        let total_accounts = rows.len();
        let churned = rows.iter().filter(|r| r.churned).count();

        let by_status = [Status::Active, Status::Churned]
            .into_iter()
            .map(|status| {
                let members: Vec<&DashboardRow> =
                    rows.iter().filter(|r| r.status() == status).collect();
                StatusBreakdown {
                    status,
                    accounts: members.len(),
                    mean_usage: mean(members.iter().map(|r| r.total_usage)),
                    mean_tickets: mean(members.iter().map(|r| r.total_tickets)),
                }
            })
            .collect();

        let mut ranked: Vec<DashboardRow> = rows.to_vec();
        ranked.sort_by(|a, b| b.churn_risk_score.total_cmp(&a.churn_risk_score));
        ranked.truncate(TOP_RISK_ACCOUNTS);

        let mut risk_histogram = [0usize; HISTOGRAM_BINS];
        for row in rows {
            risk_histogram[histogram_bin(row.churn_risk_score)] += 1;
        }

        let segments = RiskSegment::ALL
            .into_iter()
            .map(|segment| {
                let count = rows
                    .iter()
                    .filter(|r| RiskSegment::from_score(r.churn_risk_score) == segment)
                    .count();
                (segment, count)
            })
            .collect();

        Self {
            total_accounts,
            churn_rate_pct: percentage(churned, total_accounts),
            avg_mrr: mean(rows.iter().map(|r| r.avg_mrr)),
            by_status,
            top_risk: ranked,
            risk_histogram,
            segments,
            churn_by_industry: churn_by_industry(rows),
        }
    }
}

fn churn_by_industry(rows: &[DashboardRow]) -> Vec<IndustryChurn> {
    let mut groups: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    // Rows without an industry count toward the totals but not here
    for row in rows {
        let Some(industry) = row.industry.as_ref() else {
            continue;
        };
        let entry = groups.entry(industry.clone()).or_default();
        entry.0 += 1;
        if row.churned {
            entry.1 += 1;
        }
    }

    let mut industries: Vec<IndustryChurn> = groups
        .into_iter()
        .map(|(industry, (accounts, churned))| IndustryChurn {
            industry,
            accounts,
            churn_rate_pct: percentage(churned, accounts),
        })
        .collect();
    // Stable sort keeps alphabetical order among equal rates
    industries.sort_by(|a, b| b.churn_rate_pct.total_cmp(&a.churn_rate_pct));
    industries
}

fn histogram_bin(score: f64) -> usize {
    let bin = (clamp_score(score) * HISTOGRAM_BINS as f64).floor() as usize;
    bin.min(HISTOGRAM_BINS - 1)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Print the dashboard KPIs and tables to stdout
pub fn print_summary(summary: &DashboardSummary) {
    println!("\n=== SaaS Churn Dashboard ===");
    println!("Total accounts: {}", summary.total_accounts);
    println!("Churn rate: {:.2}%", summary.churn_rate_pct);
    println!("Average MRR: ${:.2}", summary.avg_mrr);

    println!("\nAccount status:");
    for status in &summary.by_status {
        println!("  {:8} {}", status.status.to_string(), status.accounts);
    }

    println!("\nRisk segments:");
    for (segment, count) in &summary.segments {
        println!("  {:8} {}", segment.label(), count);
    }

    println!("\nRisk score distribution:");
    let width = HISTOGRAM_BINS as f64;
    for (i, count) in summary.risk_histogram.iter().enumerate() {
        println!(
            "  [{:.2}, {:.2}) {:4} {}",
            i as f64 / width,
            (i + 1) as f64 / width,
            count,
            "#".repeat(*count)
        );
    }

    println!("\nTop {} high-risk accounts:", TOP_RISK_ACCOUNTS);
    println!("  {:<24} | {:<16} | {:<12} | Risk", "Account", "Industry", "Plan");
    println!("  {:-<24}-|-{:-<16}-|-{:-<12}-|------", "", "", "");
    for row in &summary.top_risk {
        println!(
            "  {:<24} | {:<16} | {:<12} | {:.3}",
            row.account_name.as_deref().unwrap_or(&row.account_id),
            row.industry.as_deref().unwrap_or("-"),
            row.plan_tier.as_deref().unwrap_or("-"),
            row.churn_risk_score
        );
    }

    println!("\nChurn rate by industry:");
    for industry in &summary.churn_by_industry {
        println!(
            "  {:<16} {:6.2}% ({} accounts)",
            industry.industry, industry.churn_rate_pct, industry.accounts
        );
    }

    println!("\nUsage and tickets by status:");
    println!("  Status   | Mean usage | Mean tickets");
    for status in &summary.by_status {
        println!(
            "  {:8} | {:10.2} | {:12.2}",
            status.status.to_string(),
            status.mean_usage,
            status.mean_tickets
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    fn row(id: &str, industry: &str, tier: &str, churned: bool, score: f64) -> DashboardRow {
        DashboardRow {
            account_id: id.to_string(),
            account_name: Some(format!("{} Corp", id)),
            industry: Some(industry.to_string()),
            plan_tier: Some(tier.to_string()),
            churned,
            avg_mrr: 100.0,
            churn_risk_score: score,
            total_usage: if churned { 10.0 } else { 50.0 },
            total_tickets: if churned { 4.0 } else { 1.0 },
        }
    }

    fn create_test_rows() -> Vec<DashboardRow> {
        vec![
            row("A1", "FinTech", "Pro", false, 0.10),
            row("A2", "FinTech", "Basic", true, 0.85),
            row("A3", "EdTech", "Pro", true, 0.45),
            row("A4", "EdTech", "Enterprise", false, 0.32),
            row("A5", "HealthTech", "Basic", false, 1.0),
        ]
    }

    #[test]
    fn test_from_document() {
        let document = doc! {
            "account_id": "A1",
            "account_name": "Acme",
            "industry": "FinTech",
            "plan_tier": mongodb::bson::Bson::Null,
            "churned": 1,
            "avg_mrr": 150.0,
            "churn_risk_score": 0.7,
            "total_usage": 50i64,
        };

        let row = DashboardRow::from_document(&document);
        assert_eq!(row.account_id, "A1");
        assert_eq!(row.account_name.as_deref(), Some("Acme"));
        assert_eq!(row.plan_tier, None);
        assert!(row.churned);
        assert_eq!(row.avg_mrr, 150.0);
        assert_eq!(row.total_usage, 50.0);
        assert_eq!(row.total_tickets, 0.0);
        assert_eq!(row.status(), Status::Churned);
    }

    #[test]
    fn test_risk_segments_partition() {
        assert_eq!(RiskSegment::from_score(0.0), RiskSegment::Low);
        assert_eq!(RiskSegment::from_score(0.2999), RiskSegment::Low);
        assert_eq!(RiskSegment::from_score(0.3), RiskSegment::Medium);
        assert_eq!(RiskSegment::from_score(0.5999), RiskSegment::Medium);
        assert_eq!(RiskSegment::from_score(0.6), RiskSegment::High);
        assert_eq!(RiskSegment::from_score(1.0), RiskSegment::High);
        assert_eq!(RiskSegment::from_score(-0.5), RiskSegment::Low);
        assert_eq!(RiskSegment::from_score(1.5), RiskSegment::High);
        assert_eq!(RiskSegment::from_score(f64::NAN), RiskSegment::Low);

        for i in 0..=100 {
            let score = i as f64 / 100.0;
            let hits = RiskSegment::ALL
                .iter()
                .filter(|s| RiskSegment::from_score(score) == **s)
                .count();
            assert_eq!(hits, 1);
        }
    }

    #[test]
    fn test_all_observed_filters_keep_everything() {
        let rows = create_test_rows();
        let filters = Filters::all_observed(&rows);

        assert_eq!(filters.industries.len(), 3);
        assert_eq!(filters.plan_tiers.len(), 3);
        assert_eq!(apply_filters(&rows, &filters).len(), rows.len());
    }

    #[test]
    fn test_apply_filters_and_across_or_within() {
        let rows = create_test_rows();
        let filters = Filters {
            industries: Filters::select(["FinTech", "EdTech"]),
            plan_tiers: Filters::select(["Pro"]),
        };

        let kept = apply_filters(&rows, &filters);
        let ids: Vec<&str> = kept.iter().map(|r| r.account_id.as_str()).collect();
        assert_eq!(ids, vec!["A1", "A3"]);
    }

    #[test]
    fn test_default_filters_keep_rows_with_missing_values() {
        let mut rows = create_test_rows();
        rows[0].industry = None;
        rows[1].plan_tier = None;

        let filters = Filters::all_observed(&rows);
        let summary = DashboardSummary::compute(&apply_filters(&rows, &filters));
        assert_eq!(summary.total_accounts, rows.len());
        assert!((summary.churn_rate_pct - 40.0).abs() < 1e-9);

        // Naming values excludes rows where they are missing
        let named = Filters {
            industries: Filters::select(["FinTech", "EdTech", "HealthTech"]),
            plan_tiers: filters.plan_tiers.clone(),
        };
        assert_eq!(apply_filters(&rows, &named).len(), rows.len() - 1);
    }

    #[test]
    fn test_churn_by_industry_skips_missing_industry() {
        let mut rows = create_test_rows();
        rows[4].industry = None;

        let summary = DashboardSummary::compute(&rows);
        assert_eq!(summary.total_accounts, 5);
        assert_eq!(summary.churn_by_industry.len(), 2);
        assert!(summary.churn_by_industry.iter().all(|i| i.industry != "HealthTech"));
    }

    #[test]
    fn test_summary_kpis() {
        let summary = DashboardSummary::compute(&create_test_rows());

        assert_eq!(summary.total_accounts, 5);
        assert!((summary.churn_rate_pct - 40.0).abs() < 1e-9);
        assert!((summary.avg_mrr - 100.0).abs() < 1e-9);

        assert_eq!(summary.by_status[0].status, Status::Active);
        assert_eq!(summary.by_status[0].accounts, 3);
        assert_eq!(summary.by_status[1].accounts, 2);
        assert!((summary.by_status[0].mean_usage - 50.0).abs() < 1e-9);
        assert!((summary.by_status[1].mean_tickets - 4.0).abs() < 1e-9);

        let segments: Vec<usize> = summary.segments.iter().map(|(_, c)| *c).collect();
        assert_eq!(segments, vec![1, 2, 2]);
    }

    #[test]
    fn test_summary_histogram_and_top_risk() {
        let summary = DashboardSummary::compute(&create_test_rows());

        assert_eq!(summary.risk_histogram.iter().sum::<usize>(), 5);
        assert_eq!(summary.risk_histogram[2], 1);
        assert_eq!(summary.risk_histogram[6], 1);
        assert_eq!(summary.risk_histogram[19], 1);

        let top: Vec<&str> = summary.top_risk.iter().map(|r| r.account_id.as_str()).collect();
        assert_eq!(top, vec!["A5", "A2", "A3", "A4", "A1"]);
    }

    #[test]
    fn test_top_risk_is_capped() {
        let rows: Vec<DashboardRow> = (0..25)
            .map(|i| row(&format!("A{}", i), "FinTech", "Pro", false, i as f64 / 25.0))
            .collect();
        let summary = DashboardSummary::compute(&rows);
        assert_eq!(summary.top_risk.len(), TOP_RISK_ACCOUNTS);
        assert_eq!(summary.top_risk[0].account_id, "A24");
    }

    #[test]
    fn test_churn_by_industry_sorted_descending() {
        let summary = DashboardSummary::compute(&create_test_rows());
        let industries: Vec<(&str, f64)> = summary
            .churn_by_industry
            .iter()
            .map(|i| (i.industry.as_str(), i.churn_rate_pct))
            .collect();

        assert_eq!(industries.len(), 3);
        assert_eq!(industries[0].0, "EdTech");
        assert_eq!(industries[1].0, "FinTech");
        assert_eq!(industries[2], ("HealthTech", 0.0));
    }

    #[test]
    fn test_empty_selection() {
        let rows = create_test_rows();
        let filters = Filters {
            industries: Filters::select(["Aerospace"]),
            plan_tiers: BTreeSet::new(),
        };

        let summary = DashboardSummary::compute(&apply_filters(&rows, &filters));
        assert_eq!(summary.total_accounts, 0);
        assert_eq!(summary.churn_rate_pct, 0.0);
        assert_eq!(summary.avg_mrr, 0.0);
        assert!(summary.top_risk.is_empty());
        assert!(summary.churn_by_industry.is_empty());
        assert_eq!(summary.by_status[1].mean_usage, 0.0);
    }
}
