//! Command-line interface definitions and argument parsing

use crate::data::TableFiles;
use crate::model::{PrimarySelection, TrainerConfig};
use crate::store::{StoreConfig, DEFAULT_COLLECTION, DEFAULT_DATABASE};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// SaaS churn analytics: build the account master dataset, score churn risk
/// and report on it
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output and debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// MongoDB connection string
    #[arg(long, env = "MONGO_URI", global = true)]
    pub mongo_uri: Option<String>,

    /// Database holding the master collection
    #[arg(long, env = "MONGO_DATABASE", default_value = DEFAULT_DATABASE, global = true)]
    pub database: String,

    /// Collection holding the scored master rows
    #[arg(long, env = "MONGO_COLLECTION", default_value = DEFAULT_COLLECTION, global = true)]
    pub collection: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the master dataset, train the classifiers and write artifacts
    Pipeline {
        /// Directory containing the five source CSV exports
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,

        /// Directory receiving master_with_risk.csv and the model artifacts
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// Model whose probabilities become the risk score
        #[arg(long, value_enum, default_value = "boosting")]
        primary: PrimarySelection,

        /// Seed for the train/test split and the random forest
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Replace the document store contents with a scored master CSV
    Load {
        /// Path to master_with_risk.csv
        #[arg(short, long, default_value = "output/master_with_risk.csv")]
        input: PathBuf,
    },

    /// Print the churn dashboard, optionally rendering charts
    Dashboard {
        /// Read a scored master CSV instead of the document store
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Comma-separated industries to keep (default: all observed)
        #[arg(long)]
        industry: Option<String>,

        /// Comma-separated plan tiers to keep (default: all observed)
        #[arg(long)]
        plan_tier: Option<String>,

        /// Directory to write PNG charts into
        #[arg(long)]
        charts: Option<PathBuf>,
    },
}

/// Settings of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub files: TableFiles,
    pub trainer: TrainerConfig,
}

impl PipelineConfig {
    pub fn new(data_dir: PathBuf, output_dir: PathBuf, primary: PrimarySelection, seed: u64) -> Self {
        Self {
            data_dir,
            output_dir,
            files: TableFiles::default(),
            trainer: TrainerConfig {
                primary,
                seed,
                ..TrainerConfig::default()
            },
        }
    }
}

impl Args {
    /// Build the store settings; a connection string is required
    pub fn store_config(&self) -> crate::Result<StoreConfig> {
        let uri = match self.mongo_uri.as_deref().map(str::trim) {
            Some(uri) if !uri.is_empty() => uri.to_string(),
            _ => anyhow::bail!("MongoDB URI not set: pass --mongo-uri or set MONGO_URI"),
        };

        Ok(StoreConfig {
            uri,
            database: self.database.clone(),
            collection: self.collection.clone(),
        })
    }
}

/// Split a comma-separated selection, dropping blanks
/// Example: "FinTech, EdTech" -> ["FinTech", "EdTech"]
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
