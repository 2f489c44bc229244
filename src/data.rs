//! Raw table loading and timestamp normalization using Polars

use crate::error::ChurnError;
use polars::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Formats tried, in order, when parsing timestamp columns
const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d",
];

pub const ACCOUNT_DATE_COLUMNS: &[&str] = &["signup_date"];
pub const SUBSCRIPTION_DATE_COLUMNS: &[&str] = &["start_date", "end_date"];
pub const TICKET_DATE_COLUMNS: &[&str] = &["created_at", "resolved_at"];
pub const CHURN_DATE_COLUMNS: &[&str] = &["churn_date"];

/// File names of the five source tables inside a data directory
#[derive(Debug, Clone)]
pub struct TableFiles {
    pub accounts: String,
    pub subscriptions: String,
    pub feature_usage: String,
    pub support_tickets: String,
    pub churn_events: String,
}

impl Default for TableFiles {
    fn default() -> Self {
        Self {
            accounts: "ravenstack_accounts.csv".to_string(),
            subscriptions: "ravenstack_subscriptions.csv".to_string(),
            feature_usage: "ravenstack_feature_usage.csv".to_string(),
            support_tickets: "ravenstack_support_tickets.csv".to_string(),
            churn_events: "ravenstack_churn_events.csv".to_string(),
        }
    }
}

impl TableFiles {
    fn resolve(&self, dir: &Path, name: &str) -> PathBuf {
        dir.join(name)
    }
}

/// The five raw operational tables for one batch run
#[derive(Debug, Clone)]
pub struct RawTables {
    /// One row per customer account
    pub accounts: DataFrame,
    /// One row per subscription, keyed to an account
    pub subscriptions: DataFrame,
    /// Feature usage events, keyed to a subscription
    pub feature_usage: DataFrame,
    /// Support tickets, keyed to an account
    pub support_tickets: DataFrame,
    /// Churn events, keyed to an account
    pub churn_events: DataFrame,
}

impl RawTables {
    /// Load all five tables from `dir`
    ///
    /// # Arguments
    /// * `dir` - Directory holding the CSV exports
    /// * `files` - File names of each table inside `dir`
    ///
    /// # Returns
    /// * `RawTables` with every table read as-is; any missing or malformed
    ///   file aborts the load
    pub fn load(dir: &Path, files: &TableFiles) -> crate::Result<Self> {
        info!(dir = %dir.display(), "loading raw tables");

        let tables = Self {
            accounts: load_table(&files.resolve(dir, &files.accounts))?,
            subscriptions: load_table(&files.resolve(dir, &files.subscriptions))?,
            feature_usage: load_table(&files.resolve(dir, &files.feature_usage))?,
            support_tickets: load_table(&files.resolve(dir, &files.support_tickets))?,
            churn_events: load_table(&files.resolve(dir, &files.churn_events))?,
        };

        info!(
            accounts = tables.accounts.height(),
            subscriptions = tables.subscriptions.height(),
            feature_usage = tables.feature_usage.height(),
            support_tickets = tables.support_tickets.height(),
            churn_events = tables.churn_events.height(),
            "raw tables loaded"
        );

        Ok(tables)
    }

    /// Parse the designated timestamp columns of every table
    pub fn normalize(self) -> crate::Result<Self> {
        Ok(Self {
            accounts: normalize_timestamps(self.accounts, ACCOUNT_DATE_COLUMNS)?,
            subscriptions: normalize_timestamps(self.subscriptions, SUBSCRIPTION_DATE_COLUMNS)?,
            feature_usage: self.feature_usage,
            support_tickets: normalize_timestamps(self.support_tickets, TICKET_DATE_COLUMNS)?,
            churn_events: normalize_timestamps(self.churn_events, CHURN_DATE_COLUMNS)?,
        })
    }
}

/// Read one CSV file with a header row into a DataFrame
pub fn load_table(path: &Path) -> crate::Result<DataFrame> {
    if !path.is_file() {
        anyhow::bail!("Input file not found: {}", path.display());
    }

    let df = LazyCsvReader::new(path)
        .with_has_header(true)
        .with_infer_schema_length(Some(10_000))
        .finish()?
        .collect()
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;

    debug!(path = %path.display(), rows = df.height(), columns = df.width(), "table read");
    Ok(df)
}

/// Write `df` as a CSV file with a header row
pub fn write_table(df: &mut DataFrame, path: &Path) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;

    info!(path = %path.display(), rows = df.height(), "table written");
    Ok(())
}

/// Check that every column in `columns` exists in `df`
pub fn require_columns(table: &str, df: &DataFrame, columns: &[&str]) -> Result<(), ChurnError> {
    for column in columns {
        if df.column(column).is_err() {
            return Err(ChurnError::MissingColumn {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
    }
    Ok(())
}

/// Replace each present column in `columns` with parsed timestamps.
///
/// Values that match none of the known formats become null. Columns that
/// the table does not have are skipped.
pub fn normalize_timestamps(df: DataFrame, columns: &[&str]) -> crate::Result<DataFrame> {
    let present: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|name| df.column(name).is_ok())
        .collect();

    if present.is_empty() {
        return Ok(df);
    }

    let parsed: Vec<Expr> = present.iter().map(|name| parse_timestamp(name)).collect();
    let df = df.lazy().with_columns(parsed).collect()?;

    for name in &present {
        let nulls = df.column(name)?.null_count();
        debug!(column = name, nulls, "timestamp column normalized");
    }

    Ok(df)
}

fn parse_timestamp(name: &str) -> Expr {
    let attempts: Vec<Expr> = TIMESTAMP_FORMATS
        .iter()
        .map(|format| {
            col(name).cast(DataType::String).str().to_datetime(
                Some(TimeUnit::Microseconds),
                None,
                StrptimeOptions {
                    format: Some((*format).into()),
                    strict: false,
                    exact: true,
                    cache: true,
                },
                lit("raise"),
            )
        })
        .collect();

    coalesce(&attempts).alias(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn create_test_csv(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn test_load_table() {
        let file = create_test_csv("account_id,seats\nA1,10\nA2,3\n");
        let df = load_table(file.path()).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 2);
    }

    #[test]
    fn test_load_table_missing_file() {
        let dir = tempdir().unwrap();
        let result = load_table(&dir.path().join("absent.csv"));
        assert!(result.is_err());
    }

    #[test]
    fn test_write_table_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("master.csv");
        let mut df = df!("account_id" => ["A1", "A2"], "churn_risk_score" => [0.25, 0.75]).unwrap();

        write_table(&mut df, &path).unwrap();
        let read = load_table(&path).unwrap();

        assert_eq!(read.shape(), (2, 2));
        assert_eq!(read.column("churn_risk_score").unwrap().f64().unwrap().get(1), Some(0.75));
    }

    #[test]
    fn test_require_columns() {
        let df = df!("account_id" => ["A1"], "seats" => [3i64]).unwrap();
        assert!(require_columns("accounts", &df, &["account_id", "seats"]).is_ok());

        let err = require_columns("accounts", &df, &["churn_flag"]).unwrap_err();
        assert!(matches!(err, ChurnError::MissingColumn { ref column, .. } if column == "churn_flag"));
    }

    #[test]
    fn test_unparseable_timestamps_become_null() {
        let df = df!(
            "account_id" => ["A1", "A2", "A3"],
            "signup_date" => ["2023-01-15", "not-a-date", "2023-02-01 10:30:00"]
        )
        .unwrap();

        let df = normalize_timestamps(df, ACCOUNT_DATE_COLUMNS).unwrap();
        let column = df.column("signup_date").unwrap();

        assert_eq!(df.height(), 3);
        assert!(matches!(column.dtype(), DataType::Datetime(_, _)));
        assert_eq!(column.null_count(), 1);
    }

    #[test]
    fn test_absent_timestamp_columns_are_skipped() {
        let df = df!("subscription_id" => ["S1"], "mrr_amount" => [100.0]).unwrap();
        let normalized = normalize_timestamps(df.clone(), SUBSCRIPTION_DATE_COLUMNS).unwrap();
        assert!(normalized.equals(&df));
    }
}
