//! Dashboard aggregation over a tenant's projects.
//!
//! Read-only. The only entry point takes a [`TenantPartition`], so there is
//! no way to aggregate without naming a tenant.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::Serialize;

use crate::{errors::AppError, partition::TenantPartition, structs::Project};

pub const DEFAULT_RECENT_LIMIT: usize = 10;
const TREND_MONTHS: u32 = 12;
const UNCATEGORIZED: &str = "Uncategorized";
const UNSPECIFIED_MODE: &str = "Unspecified";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeWindow {
    #[default]
    AllTime,
    /// Projects created at or after the instant.
    Since(DateTime<Utc>),
}

impl TimeWindow {
    /// The current calendar month and the eleven before it.
    pub fn last_12_months(now: DateTime<Utc>) -> Self {
        TimeWindow::Since(trend_start(now))
    }

    fn contains(&self, ts: DateTime<Utc>) -> bool {
        match self {
            TimeWindow::AllTime => true,
            TimeWindow::Since(start) => ts >= *start,
        }
    }
}

fn trend_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let month_start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    month_start
        .checked_sub_months(Months::new(TREND_MONTHS - 1))
        .unwrap_or(month_start)
}

#[derive(Debug, Clone, Copy)]
pub struct DashboardQuery {
    pub window: TimeWindow,
    pub recent: usize,
}

impl Default for DashboardQuery {
    fn default() -> Self {
        Self {
            window: TimeWindow::AllTime,
            recent: DEFAULT_RECENT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatusBucket {
    Closed,
    Active,
    Pending,
}

impl StatusBucket {
    /// Closing time against `now`; an exact tie, or no closing time, is Pending.
    pub fn classify(closing: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match closing {
            Some(closing) if closing < now => StatusBucket::Closed,
            Some(closing) if closing > now => StatusBucket::Active,
            _ => StatusBucket::Pending,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub total_projects: u64,
    /// Closing time in the future, or not set.
    pub active_projects: u64,
    pub closed_projects: u64,
    pub total_budget: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCount {
    pub status: StatusBucket,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthCount {
    /// `YYYY-MM`
    pub month: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryBudget {
    pub category: String,
    pub budget: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub metrics: Metrics,
    pub projects_by_status: Vec<StatusCount>,
    pub recent_projects: Vec<Project>,
    pub projects_over_time: Vec<MonthCount>,
    pub budget_by_category: Vec<CategoryBudget>,
    pub projects_by_category: Vec<GroupCount>,
    pub procurement_modes: Vec<GroupCount>,
}

/// Lenient budget parsing: the amount starts at the first digit and runs
/// through digits, `.` and thousands separators, so `"Php. 1,500.00"` reads as
/// 1500. Anything that still fails to parse counts as zero.
pub fn parse_budget(raw: Option<&str>) -> f64 {
    let Some(raw) = raw else {
        return 0.0;
    };
    // Skip any currency prefix ("PHP", "Php.", "Rs.", "$") up to the first digit.
    let Some(start) = raw.find(|c: char| c.is_ascii_digit()) else {
        return 0.0;
    };
    let negative = raw[..start].trim_end().ends_with('-');
    let cleaned: String = raw[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',' || c.is_whitespace())
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() => {
            if negative {
                -value
            } else {
                value
            }
        }
        _ => 0.0,
    }
}

fn label(value: Option<&str>, fallback: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_owned(),
        _ => fallback.to_owned(),
    }
}

/// Largest group first, ties by name.
fn group_counts<I>(names: I) -> Vec<GroupCount>
where
    I: IntoIterator<Item = String>,
{
    let mut counts: HashMap<String, u64> = HashMap::new();
    for name in names {
        *counts.entry(name).or_default() += 1;
    }
    let mut groups: Vec<GroupCount> = counts
        .into_iter()
        .map(|(name, count)| GroupCount { name, count })
        .collect();
    groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    groups
}

pub async fn dashboard(
    partition: &TenantPartition,
    query: &DashboardQuery,
    now: DateTime<Utc>,
) -> Result<Dashboard, AppError> {
    let projects = partition.list_projects().await?;
    let dashboard = summarize(&projects, query, now);
    log::debug!(
        "Dashboard for {}: {} projects in window",
        partition.locator(),
        dashboard.metrics.total_projects
    );
    Ok(dashboard)
}

fn summarize(projects: &[Project], query: &DashboardQuery, now: DateTime<Utc>) -> Dashboard {
    let in_window: Vec<&Project> = projects
        .iter()
        .filter(|p| query.window.contains(p.created_at))
        .collect();

    let total = in_window.len() as u64;
    let active = in_window
        .iter()
        .filter(|p| p.closing_date.map_or(true, |closing| closing > now))
        .count() as u64;
    let metrics = Metrics {
        total_projects: total,
        active_projects: active,
        closed_projects: total - active,
        total_budget: in_window
            .iter()
            .map(|p| parse_budget(p.budget.as_deref()))
            .sum(),
    };

    let mut by_status: HashMap<StatusBucket, u64> = HashMap::new();
    for p in &in_window {
        *by_status
            .entry(StatusBucket::classify(p.closing_date, now))
            .or_default() += 1;
    }
    let projects_by_status = [
        StatusBucket::Closed,
        StatusBucket::Active,
        StatusBucket::Pending,
    ]
    .into_iter()
    .filter_map(|status| {
        by_status
            .get(&status)
            .map(|&count| StatusCount { status, count })
    })
    .collect();

    let mut budgets: BTreeMap<String, f64> = BTreeMap::new();
    for p in &in_window {
        *budgets
            .entry(label(p.category.as_deref(), UNCATEGORIZED))
            .or_default() += parse_budget(p.budget.as_deref());
    }
    let budget_by_category = budgets
        .into_iter()
        .map(|(category, budget)| CategoryBudget { category, budget })
        .collect();

    let trend = TimeWindow::last_12_months(now);
    let mut months: BTreeMap<String, u64> = BTreeMap::new();
    for p in projects.iter().filter(|p| trend.contains(p.created_at)) {
        *months
            .entry(p.created_at.format("%Y-%m").to_string())
            .or_default() += 1;
    }
    let projects_over_time = months
        .into_iter()
        .map(|(month, count)| MonthCount { month, count })
        .collect();

    let mut recent = in_window.clone();
    recent.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    let recent_projects = recent
        .into_iter()
        .take(query.recent)
        .cloned()
        .collect();

    Dashboard {
        metrics,
        projects_by_status,
        recent_projects,
        projects_over_time,
        budget_by_category,
        projects_by_category: group_counts(
            in_window
                .iter()
                .map(|p| label(p.category.as_deref(), UNCATEGORIZED)),
        ),
        procurement_modes: group_counts(
            in_window
                .iter()
                .map(|p| label(p.procurement_mode.as_deref(), UNSPECIFIED_MODE)),
        ),
    }
}
