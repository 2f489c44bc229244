//! Typed errors raised by the churn pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChurnError {
    #[error("Table '{table}' is missing required column '{column}'")]
    MissingColumn { table: String, column: String },

    #[error("Training needs at least 2 accounts, got {rows}")]
    TooFewRows { rows: usize },

    #[error("Label '{label}' has a single class in the training split")]
    SingleClassLabel { label: String },

    #[error("Feature matrix has {rows} rows but {scores} scores were produced")]
    ScoreCountMismatch { rows: usize, scores: usize },

    #[error("Model training failed: {0}")]
    Model(String),

    #[error("Document store error: {0}")]
    Store(#[from] mongodb::error::Error),

    #[error("Artifact encoding error: {0}")]
    Artifact(#[from] bincode::Error),
}
