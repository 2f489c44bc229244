//! ChurnForge: SaaS churn analytics from raw operational exports
//!
//! This library joins five account-level tables into one master row per
//! account, trains churn classifiers on it, scores every account and
//! summarizes the scored rows as a filterable dashboard.

pub mod cli;
pub mod dashboard;
pub mod data;
pub mod error;
pub mod features;
pub mod model;
pub mod store;
pub mod viz;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// Re-export public items for easier access
pub use cli::{Args, PipelineConfig};
pub use dashboard::{apply_filters, documents_to_rows, DashboardRow, DashboardSummary, Filters};
pub use data::{RawTables, TableFiles};
pub use error::ChurnError;
pub use features::build_master_dataset;
pub use model::{attach_risk_scores, train_and_score, TrainerConfig, TrainingReport};
pub use store::{frame_to_documents, MasterStore, MemoryStore, MongoStore, StoreConfig};
pub use viz::render_dashboard;

/// Common result type used throughout the application
pub type Result<T> = anyhow::Result<T>;

/// Install the global log subscriber. `CHURNFORGE_LOG` overrides the level,
/// which otherwise is `debug` when verbose and `info` if not.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("CHURNFORGE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
