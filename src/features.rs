//! Account-level feature aggregation
//!
//! Turns the five event-grained tables into one row per account: four
//! rollups left-joined onto the account table, zero-filled, then extended
//! with offset-division ratios. The same frame feeds training and scoring.

use crate::data::{require_columns, RawTables};
use polars::prelude::*;
use tracing::{info, warn};

const ROW_INDEX: &str = "__account_row";

pub const ACCOUNT_KEY: &str = "account_id";
pub const SUBSCRIPTION_KEY: &str = "subscription_id";

/// Ground-truth label carried on the account table
pub const CHURN_FLAG: &str = "churn_flag";
/// Label derived from the presence of churn events
pub const CHURNED: &str = "churned";

/// Offset ratios appended to every master row: (name, numerator, denominator)
pub const DERIVED_RATIOS: [(&str, &str, &str); 4] = [
    ("usage_per_subscription", "total_usage", "total_subscriptions"),
    ("tickets_per_subscription", "total_tickets", "total_subscriptions"),
    ("error_rate", "total_errors", "total_usage"),
    ("mrr_per_seat", "avg_mrr", "seats"),
];

fn numeric_dtypes() -> Vec<DataType> {
    vec![
        DataType::Int8,
        DataType::Int16,
        DataType::Int32,
        DataType::Int64,
        DataType::UInt8,
        DataType::UInt16,
        DataType::UInt32,
        DataType::UInt64,
        DataType::Float32,
        DataType::Float64,
    ]
}

/// Build the account-level master dataset
///
/// # Arguments
/// * `tables` - Normalized raw tables
///
/// # Returns
/// * DataFrame with exactly one row per account, in account table order
pub fn build_master_dataset(tables: &RawTables) -> crate::Result<DataFrame> {
    require_columns("accounts", &tables.accounts, &[ACCOUNT_KEY, "seats"])?;
    require_columns(
        "subscriptions",
        &tables.subscriptions,
        &[SUBSCRIPTION_KEY, ACCOUNT_KEY, "mrr_amount", "upgrade_flag", "downgrade_flag"],
    )?;
    require_columns(
        "feature_usage",
        &tables.feature_usage,
        &[SUBSCRIPTION_KEY, "usage_count", "usage_duration_secs", "error_count", "is_beta_feature"],
    )?;
    require_columns(
        "support_tickets",
        &tables.support_tickets,
        &[
            "ticket_id",
            ACCOUNT_KEY,
            "resolution_time_hours",
            "first_response_time_minutes",
            "satisfaction_score",
            "escalation_flag",
        ],
    )?;
    require_columns("churn_events", &tables.churn_events, &[ACCOUNT_KEY])?;

    let master = tables
        .accounts
        .clone()
        .lazy()
        .with_column(col(ACCOUNT_KEY).cast(DataType::String))
        .with_row_index(ROW_INDEX, None)
        .left_join(subscription_rollup(tables), col(ACCOUNT_KEY), col(ACCOUNT_KEY))
        .left_join(usage_rollup(tables), col(ACCOUNT_KEY), col(ACCOUNT_KEY))
        .left_join(support_rollup(tables), col(ACCOUNT_KEY), col(ACCOUNT_KEY))
        .left_join(churn_rollup(tables), col(ACCOUNT_KEY), col(ACCOUNT_KEY))
        .with_column(col(CHURNED).fill_null(lit(0)))
        .with_column(dtype_cols(numeric_dtypes()).fill_null(lit(0)))
        .with_columns(derived_ratios())
        .sort([ROW_INDEX], SortMultipleOptions::default())
        .drop([ROW_INDEX])
        .collect()?;

    info!(
        accounts = tables.accounts.height(),
        rows = master.height(),
        columns = master.width(),
        "master dataset built"
    );

    Ok(master)
}

/// Subscriptions per account: count, mean MRR, upgrade and downgrade totals
fn subscription_rollup(tables: &RawTables) -> LazyFrame {
    let subs = &tables.subscriptions;
    subs.clone()
        .lazy()
        .with_column(col(ACCOUNT_KEY).cast(DataType::String))
        .group_by_stable([col(ACCOUNT_KEY)])
        .agg([
            col(SUBSCRIPTION_KEY).count().alias("total_subscriptions"),
            measure(subs, "mrr_amount").mean().alias("avg_mrr"),
            measure(subs, "upgrade_flag").sum().alias("total_upgrades"),
            measure(subs, "downgrade_flag").sum().alias("total_downgrades"),
        ])
}

/// Usage per account.
///
/// Events key on subscription, so they are summed per subscription first,
/// mapped back to their account through the subscription table, then summed
/// again across all of the account's subscriptions.
fn usage_rollup(tables: &RawTables) -> LazyFrame {
    let usage = &tables.feature_usage;
    let per_subscription = usage
        .clone()
        .lazy()
        .with_column(col(SUBSCRIPTION_KEY).cast(DataType::String))
        .group_by_stable([col(SUBSCRIPTION_KEY)])
        .agg([
            measure(usage, "usage_count").sum().alias("total_usage"),
            measure(usage, "usage_duration_secs").sum().alias("total_usage_duration"),
            measure(usage, "error_count").sum().alias("total_errors"),
            measure(usage, "is_beta_feature").sum().alias("beta_feature_usage"),
        ]);

    let owners = tables.subscriptions.clone().lazy().select([
        col(SUBSCRIPTION_KEY).cast(DataType::String),
        col(ACCOUNT_KEY).cast(DataType::String),
    ]);

    per_subscription
        .left_join(owners, col(SUBSCRIPTION_KEY), col(SUBSCRIPTION_KEY))
        .group_by_stable([col(ACCOUNT_KEY)])
        .agg([
            col("total_usage").sum(),
            col("total_usage_duration").sum(),
            col("total_errors").sum(),
            col("beta_feature_usage").sum(),
        ])
}

/// Tickets per account: count, mean timings and satisfaction, escalations
fn support_rollup(tables: &RawTables) -> LazyFrame {
    let tickets = &tables.support_tickets;
    tickets
        .clone()
        .lazy()
        .with_column(col(ACCOUNT_KEY).cast(DataType::String))
        .group_by_stable([col(ACCOUNT_KEY)])
        .agg([
            col("ticket_id").count().alias("total_tickets"),
            measure(tickets, "resolution_time_hours").mean().alias("avg_resolution_time"),
            measure(tickets, "first_response_time_minutes").mean().alias("avg_first_response"),
            measure(tickets, "satisfaction_score").mean().alias("avg_satisfaction"),
            measure(tickets, "escalation_flag").sum().alias("escalation_count"),
        ])
}

/// Churn label per account: `churned = 1` for any account with churn events
fn churn_rollup(tables: &RawTables) -> LazyFrame {
    tables
        .churn_events
        .clone()
        .lazy()
        .with_column(col(ACCOUNT_KEY).cast(DataType::String))
        .group_by_stable([col(ACCOUNT_KEY)])
        .agg([len().alias("churn_events")])
        .with_column(lit(1i32).alias(CHURNED))
        .select([col(ACCOUNT_KEY), col(CHURNED)])
}

fn derived_ratios() -> Vec<Expr> {
    DERIVED_RATIOS
        .iter()
        .map(|(name, numerator, denominator)| offset_ratio(numerator, denominator).alias(*name))
        .collect()
}

/// `numerator / (denominator + 1)`, with null or non-finite results as 0
pub fn offset_ratio(numerator: &str, denominator: &str) -> Expr {
    let ratio = col(numerator).cast(DataType::Float64)
        / (col(denominator).cast(DataType::Float64) + lit(1.0));
    when(ratio.clone().is_finite())
        .then(ratio)
        .otherwise(lit(0.0))
}

/// Expression reading `name` as a summable number.
///
/// Flag columns arrive as booleans, integers, or `True`/`False` text
/// depending on the export; all of them collapse to 0/1.
pub fn measure(df: &DataFrame, name: &str) -> Expr {
    let dtype = df.column(name).map(|s| s.dtype().clone()).unwrap_or(DataType::Null);
    match dtype {
        DataType::String => {
            let lowered = col(name).str().to_lowercase();
            when(lowered.clone().eq(lit("true")).or(lowered.clone().eq(lit("yes"))))
                .then(lit(1.0))
                .when(lowered.clone().eq(lit("false")).or(lowered.eq(lit("no"))))
                .then(lit(0.0))
                .otherwise(col(name).cast(DataType::Float64))
                .alias(name)
        }
        DataType::Boolean => col(name).cast(DataType::Int64),
        _ => col(name),
    }
}

/// Read a label-like column as booleans; nulls and unknown text are false
pub fn bool_values(df: &DataFrame, name: &str) -> crate::Result<Vec<bool>> {
    let series = df.column(name)?;
    let values = match series.dtype() {
        DataType::Boolean => series.bool()?.into_iter().map(|v| v.unwrap_or(false)).collect(),
        DataType::String => series
            .str()?
            .into_iter()
            .map(|v| {
                v.map(|text| {
                    let text = text.trim().to_ascii_lowercase();
                    text == "true" || text == "yes" || text == "1" || text == "1.0"
                })
                .unwrap_or(false)
            })
            .collect(),
        _ => series
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .map(|v| v.map(|x| x > 0.5).unwrap_or(false))
            .collect(),
    };
    Ok(values)
}

/// Read a numeric column as `f64`, nulls as 0
pub fn f64_values(df: &DataFrame, name: &str) -> crate::Result<Vec<f64>> {
    let values = df
        .column(name)?
        .cast(&DataType::Float64)?
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(0.0))
        .collect();
    Ok(values)
}

/// Count accounts where the ground-truth `churn_flag` and the event-derived
/// `churned` indicator disagree.
///
/// Returns `None` when the master frame carries no `churn_flag` column.
pub fn label_mismatches(master: &DataFrame) -> crate::Result<Option<usize>> {
    if master.column(CHURN_FLAG).is_err() {
        return Ok(None);
    }

    let flags = bool_values(master, CHURN_FLAG)?;
    let churned = bool_values(master, CHURNED)?;
    let mismatches = flags
        .iter()
        .zip(churned.iter())
        .filter(|(flag, derived)| flag != derived)
        .count();

    if mismatches > 0 {
        warn!(
            mismatches,
            accounts = master.height(),
            "churn_flag and event-derived churned disagree; both are kept as-is"
        );
    }

    Ok(Some(mismatches))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_tables() -> RawTables {
        let accounts = df!(
            "account_id" => ["A1", "A2", "A3"],
            "industry" => [Some("FinTech"), Some("EdTech"), None],
            "seats" => [10i64, 4, 0],
            "churn_flag" => [false, false, true]
        )
        .unwrap();

        let subscriptions = df!(
            "subscription_id" => ["S1", "S2", "S3"],
            "account_id" => ["A1", "A1", "A3"],
            "mrr_amount" => [100.0, 200.0, 50.0],
            "upgrade_flag" => [true, false, false],
            "downgrade_flag" => [false, false, true]
        )
        .unwrap();

        let feature_usage = df!(
            "subscription_id" => ["S1", "S1", "S2", "S9"],
            "usage_count" => [20i64, 10, 20, 99],
            "usage_duration_secs" => [60i64, 30, 90, 5],
            "error_count" => [1i64, 0, 2, 7],
            "is_beta_feature" => [true, false, true, true]
        )
        .unwrap();

        let support_tickets = df!(
            "ticket_id" => ["T1", "T2", "T3"],
            "account_id" => ["A1", "A3", "A3"],
            "resolution_time_hours" => [4.0, 10.0, 20.0],
            "first_response_time_minutes" => [30.0, 60.0, 90.0],
            "satisfaction_score" => [Some(5.0), None, Some(3.0)],
            "escalation_flag" => [false, true, true]
        )
        .unwrap();

        let churn_events = df!(
            "account_id" => ["A3", "A3"],
            "churn_date" => ["2024-03-01", "2024-04-01"]
        )
        .unwrap();

        RawTables {
            accounts,
            subscriptions,
            feature_usage,
            support_tickets,
            churn_events,
        }
    }

    fn value(master: &DataFrame, column: &str, row: usize) -> f64 {
        f64_values(master, column).unwrap()[row]
    }

    #[test]
    fn test_one_row_per_account_in_order() {
        let master = build_master_dataset(&scenario_tables()).unwrap();
        assert_eq!(master.height(), 3);

        let ids: Vec<&str> = master
            .column("account_id")
            .unwrap()
            .str()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(ids, vec!["A1", "A2", "A3"]);
    }

    #[test]
    fn test_account_with_two_subscriptions() {
        let master = build_master_dataset(&scenario_tables()).unwrap();

        assert_eq!(value(&master, "total_subscriptions", 0), 2.0);
        assert_eq!(value(&master, "avg_mrr", 0), 150.0);
        assert_eq!(value(&master, "total_usage", 0), 50.0);
        assert_eq!(value(&master, "total_tickets", 0), 1.0);
        assert_eq!(value(&master, "churned", 0), 0.0);
        assert_eq!(value(&master, "total_upgrades", 0), 1.0);
        assert_eq!(value(&master, "beta_feature_usage", 0), 2.0);
        assert!((value(&master, "usage_per_subscription", 0) - 50.0 / 3.0).abs() < 1e-9);
        assert!((value(&master, "mrr_per_seat", 0) - 150.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_account_without_subscriptions() {
        let master = build_master_dataset(&scenario_tables()).unwrap();

        assert_eq!(value(&master, "total_subscriptions", 1), 0.0);
        assert_eq!(value(&master, "avg_mrr", 1), 0.0);
        assert_eq!(value(&master, "total_usage", 1), 0.0);
        assert_eq!(value(&master, "usage_per_subscription", 1), 0.0);
        assert_eq!(value(&master, "tickets_per_subscription", 1), 0.0);
        assert_eq!(value(&master, "error_rate", 1), 0.0);
        assert_eq!(value(&master, "mrr_per_seat", 1), 0.0);
    }

    #[test]
    fn test_usage_for_unknown_subscription_is_dropped() {
        let master = build_master_dataset(&scenario_tables()).unwrap();
        let total: f64 = f64_values(&master, "total_usage").unwrap().iter().sum();
        assert_eq!(total, 50.0);
    }

    #[test]
    fn test_support_and_churn_rollups() {
        let master = build_master_dataset(&scenario_tables()).unwrap();

        assert_eq!(value(&master, "total_tickets", 2), 2.0);
        assert_eq!(value(&master, "avg_resolution_time", 2), 15.0);
        assert_eq!(value(&master, "avg_satisfaction", 2), 3.0);
        assert_eq!(value(&master, "escalation_count", 2), 2.0);
        assert_eq!(value(&master, "churned", 2), 1.0);
        assert_eq!(value(&master, "total_downgrades", 2), 1.0);
    }

    #[test]
    fn test_churned_is_binary() {
        let master = build_master_dataset(&scenario_tables()).unwrap();
        let churned = f64_values(&master, CHURNED).unwrap();
        assert_eq!(churned, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_non_numeric_nulls_are_kept() {
        let master = build_master_dataset(&scenario_tables()).unwrap();
        assert_eq!(master.column("industry").unwrap().null_count(), 1);
    }

    #[test]
    fn test_ratios_are_finite() {
        let master = build_master_dataset(&scenario_tables()).unwrap();
        for (name, _, _) in DERIVED_RATIOS {
            let values = f64_values(&master, name).unwrap();
            assert!(values.iter().all(|v| v.is_finite()), "{} has non-finite values", name);
        }
    }

    #[test]
    fn test_aggregation_is_deterministic() {
        let tables = scenario_tables();
        let first = build_master_dataset(&tables).unwrap();
        let second = build_master_dataset(&tables).unwrap();
        assert!(first.equals_missing(&second));
    }

    #[test]
    fn test_missing_column_is_reported() {
        let mut tables = scenario_tables();
        tables.accounts = tables.accounts.drop("seats").unwrap();
        assert!(build_master_dataset(&tables).is_err());
    }

    #[test]
    fn test_string_flags_are_coerced() {
        let df = df!("flag" => ["True", "false", "1", "yes"]).unwrap();
        let summed = df
            .clone()
            .lazy()
            .select([measure(&df, "flag").sum()])
            .collect()
            .unwrap();
        assert_eq!(f64_values(&summed, "flag").unwrap(), vec![3.0]);
    }

    #[test]
    fn test_label_mismatches() {
        let master = build_master_dataset(&scenario_tables()).unwrap();
        assert_eq!(label_mismatches(&master).unwrap(), Some(0));

        let mut tables = scenario_tables();
        tables.churn_events = df!("account_id" => ["A1"]).unwrap();
        let master = build_master_dataset(&tables).unwrap();
        assert_eq!(label_mismatches(&master).unwrap(), Some(2));
    }
}
