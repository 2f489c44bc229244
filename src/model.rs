//! Churn classifier training and full-population risk scoring
//!
//! Three classifiers are fit on an 80/20 seeded split of the master
//! dataset and ranked by held-out ROC AUC. The primary model then scores
//! every account, training rows included, and the probabilities are written
//! back as `churn_risk_score`.

use crate::error::ChurnError;
use crate::features::{bool_values, f64_values, ACCOUNT_KEY, CHURNED, CHURN_FLAG};
use linfa::prelude::*;
use linfa_logistic::{FittedLogisticRegression, LogisticRegression};
use linfa_trees::DecisionTree;
use ndarray::{Array1, Array2, Axis};
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_regressor::{
    DecisionTreeRegressor, DecisionTreeRegressorParameters,
};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::{debug, info};

pub const RISK_SCORE: &str = "churn_risk_score";

/// Columns never used as model inputs
const NON_FEATURE_COLUMNS: [&str; 5] = [ACCOUNT_KEY, "account_name", CHURN_FLAG, CHURNED, RISK_SCORE];

/// The three classifiers in the bake-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    LogisticRegression,
    RandomForest,
    GradientBoosting,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelKind::LogisticRegression => "Logistic Regression",
            ModelKind::RandomForest => "Random Forest",
            ModelKind::GradientBoosting => "Gradient Boosting",
        };
        write!(f, "{}", name)
    }
}

/// Which model's probabilities become the persisted risk score
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PrimarySelection {
    Logistic,
    Forest,
    Boosting,
    /// Highest held-out AUC
    Best,
}

/// Hyperparameters of the bake-off
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub primary: PrimarySelection,
    pub seed: u64,
    pub test_fraction: f64,
    pub logistic_max_iterations: u64,
    pub forest_trees: usize,
    pub boosting_stages: usize,
    pub boosting_learning_rate: f64,
    pub boosting_max_depth: u16,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            primary: PrimarySelection::Boosting,
            seed: 42,
            test_fraction: 0.2,
            logistic_max_iterations: 1000,
            forest_trees: 200,
            boosting_stages: 300,
            boosting_learning_rate: 0.05,
            boosting_max_depth: 5,
        }
    }
}

/// Model inputs extracted from the master dataset
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    /// Feature column names, indicator columns included
    pub names: Vec<String>,
    /// Feature values (n_accounts, n_features)
    pub values: Array2<f64>,
    /// Ground-truth labels from `churn_flag`
    pub labels: Vec<bool>,
}

impl FeatureMatrix {
    /// Extract features and labels from the master dataset.
    ///
    /// Identifier, label and timestamp columns are dropped. Text columns
    /// are expanded into one indicator per observed category, minus the
    /// first category in sorted order.
    pub fn from_master(master: &DataFrame) -> crate::Result<Self> {
        if master.column(CHURN_FLAG).is_err() {
            return Err(ChurnError::MissingColumn {
                table: "master".to_string(),
                column: CHURN_FLAG.to_string(),
            }
            .into());
        }

        let labels = bool_values(master, CHURN_FLAG)?;
        let mut names = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();

        for series in master.get_columns() {
            let name = series.name().to_string();
            if NON_FEATURE_COLUMNS.contains(&name.as_str()) {
                continue;
            }

            match series.dtype() {
                DataType::String => {
                    let values: Vec<Option<&str>> = series.str()?.into_iter().collect();
                    let categories: BTreeSet<&str> = values.iter().flatten().copied().collect();
                    for category in categories.iter().skip(1) {
                        names.push(format!("{}_{}", name, category));
                        columns.push(
                            values
                                .iter()
                                .map(|v| if *v == Some(*category) { 1.0 } else { 0.0 })
                                .collect(),
                        );
                    }
                }
                DataType::Boolean => {
                    names.push(name.clone());
                    columns.push(bool_values(master, &name)?.into_iter().map(indicator).collect());
                }
                dtype if dtype.is_numeric() => {
                    names.push(name.clone());
                    columns.push(f64_values(master, &name)?);
                }
                other => {
                    debug!(column = %name, dtype = %other, "column skipped for training");
                }
            }
        }

        let n_rows = master.height();
        let values = Array2::from_shape_fn((n_rows, columns.len()), |(i, j)| columns[j][i]);

        Ok(Self {
            names,
            values,
            labels,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }

    fn rows(&self, indices: &[usize]) -> (Array2<f64>, Vec<bool>) {
        let x = self.values.select(Axis(0), indices);
        let y = indices.iter().map(|&i| self.labels[i]).collect();
        (x, y)
    }
}

/// Per-column standardization fitted on training rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
}

impl StandardScaler {
    /// Fit column means and population standard deviations
    pub fn fit(features: &Array2<f64>) -> Self {
        let n_features = features.ncols();
        let mean = features
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(n_features));
        let std = features
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > f64::EPSILON { s } else { 1.0 });
        Self { mean, std }
    }

    pub fn transform(&self, features: &Array2<f64>) -> Array2<f64> {
        (features - &self.mean) / &self.std
    }
}

/// Seeded shuffle split into (train, test) row indices
///
/// The test side holds `ceil(n * test_fraction)` rows, always leaving at
/// least one training row.
pub fn train_test_split(n_rows: usize, test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n_rows).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let n_test = ((n_rows as f64) * test_fraction).ceil() as usize;
    let n_test = n_test.min(n_rows.saturating_sub(1));
    let train = indices[n_test..].to_vec();
    let test = indices[..n_test].to_vec();
    (train, test)
}

/// Area under the ROC curve, ties averaged.
///
/// Undefined (`None`) when only one class is present.
pub fn roc_auc(labels: &[bool], scores: &[f64]) -> Option<f64> {
    let n = labels.len().min(scores.len());
    let n_pos = labels[..n].iter().filter(|&&l| l).count();
    if n_pos == 0 || n_pos == n {
        return None;
    }

    let truth: Vec<f64> = labels[..n].iter().map(|&l| indicator(l)).collect();
    let predicted: Vec<f64> = scores[..n].to_vec();
    Some(smartcore::metrics::roc_auc_score(&truth, &predicted))
}

/// Logistic regression on standardized features
#[derive(Debug, Serialize, Deserialize)]
pub struct LogisticModel {
    scaler: StandardScaler,
    model: FittedLogisticRegression<f64, bool>,
}

impl LogisticModel {
    pub fn fit(x: &Array2<f64>, y: &[bool], max_iterations: u64) -> crate::Result<Self> {
        let scaler = StandardScaler::fit(x);
        let dataset = Dataset::new(scaler.transform(x), Array1::from(y.to_vec()));
        let model = LogisticRegression::default()
            .max_iterations(max_iterations)
            .fit(&dataset)
            .map_err(|e| ChurnError::Model(format!("logistic regression: {}", e)))?;
        Ok(Self { scaler, model })
    }

    pub fn predict_proba(&self, x: &Array2<f64>) -> Array1<f64> {
        let probabilities = self.model.predict_probabilities(&self.scaler.transform(x));
        if self.model.labels().pos.class {
            probabilities
        } else {
            probabilities.mapv(|p| 1.0 - p)
        }
    }

    pub fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }
}

/// Bagged decision trees, each on a bootstrap sample and a random feature
/// subspace. Probability is the share of trees voting churn.
#[derive(Debug, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<(Vec<usize>, DecisionTree<f64, usize>)>,
}

impl RandomForest {
    pub fn fit(x: &Array2<f64>, y: &[bool], n_trees: usize, seed: u64) -> crate::Result<Self> {
        let (n_rows, n_features) = x.dim();
        let subspace = ((n_features as f64).sqrt().ceil() as usize).clamp(1, n_features.max(1));
        let mut rng = StdRng::seed_from_u64(seed);
        let mut trees = Vec::with_capacity(n_trees);

        for _ in 0..n_trees {
            let rows: Vec<usize> = (0..n_rows).map(|_| rng.gen_range(0..n_rows)).collect();
            let mut features = rand::seq::index::sample(&mut rng, n_features, subspace).into_vec();
            features.sort_unstable();

            let records = x.select(Axis(0), &rows).select(Axis(1), &features);
            let targets: Array1<usize> = rows.iter().map(|&i| usize::from(y[i])).collect();
            let tree = DecisionTree::params()
                .max_depth(None)
                .fit(&Dataset::new(records, targets))
                .map_err(|e| ChurnError::Model(format!("random forest: {}", e)))?;
            trees.push((features, tree));
        }

        Ok(Self { trees })
    }

    pub fn predict_proba(&self, x: &Array2<f64>) -> Array1<f64> {
        let mut votes = Array1::<f64>::zeros(x.nrows());
        for (features, tree) in &self.trees {
            let predictions = tree.predict(&x.select(Axis(1), features));
            for (vote, &label) in votes.iter_mut().zip(predictions.iter()) {
                if label == 1 {
                    *vote += 1.0;
                }
            }
        }
        votes / (self.trees.len().max(1) as f64)
    }
}

type RegressionTree = DecisionTreeRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// Gradient boosted regression trees on the log-loss gradient
#[derive(Debug, Serialize, Deserialize)]
pub struct GradientBoosting {
    base_score: f64,
    learning_rate: f64,
    stages: Vec<RegressionTree>,
}

impl GradientBoosting {
    pub fn fit(
        x: &Array2<f64>,
        y: &[bool],
        n_stages: usize,
        learning_rate: f64,
        max_depth: u16,
    ) -> crate::Result<Self> {
        let matrix = to_dense_matrix(x);
        let targets: Vec<f64> = y.iter().map(|&l| indicator(l)).collect();

        let prior = (targets.iter().sum::<f64>() / targets.len().max(1) as f64).clamp(1e-6, 1.0 - 1e-6);
        let base_score = (prior / (1.0 - prior)).ln();
        let mut raw = vec![base_score; targets.len()];
        let mut stages = Vec::with_capacity(n_stages);

        for stage in 0..n_stages {
            let residuals: Vec<f64> = targets
                .iter()
                .zip(&raw)
                .map(|(&target, &f)| target - sigmoid(f))
                .collect();

            let params = DecisionTreeRegressorParameters::default().with_max_depth(max_depth);
            let tree = RegressionTree::fit(&matrix, &residuals, params)
                .map_err(|e| ChurnError::Model(format!("boosting stage {}: {}", stage, e)))?;
            let update = tree
                .predict(&matrix)
                .map_err(|e| ChurnError::Model(format!("boosting stage {}: {}", stage, e)))?;

            for (f, step) in raw.iter_mut().zip(update) {
                *f += learning_rate * step;
            }
            stages.push(tree);
        }

        Ok(Self {
            base_score,
            learning_rate,
            stages,
        })
    }

    pub fn predict_proba(&self, x: &Array2<f64>) -> crate::Result<Array1<f64>> {
        let matrix = to_dense_matrix(x);
        let mut raw = Array1::from_elem(x.nrows(), self.base_score);
        for tree in &self.stages {
            let update = tree
                .predict(&matrix)
                .map_err(|e| ChurnError::Model(format!("boosting prediction: {}", e)))?;
            for (f, step) in raw.iter_mut().zip(update) {
                *f += self.learning_rate * step;
            }
        }
        Ok(raw.mapv(sigmoid))
    }
}

fn indicator(value: bool) -> f64 {
    f64::from(u8::from(value))
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn to_dense_matrix(x: &Array2<f64>) -> DenseMatrix<f64> {
    let (rows, cols) = x.dim();
    let data: Vec<f64> = x.iter().copied().collect();
    DenseMatrix::new(rows, cols, data, false)
}

/// A fitted classifier from the bake-off
#[derive(Debug, Serialize, Deserialize)]
pub enum TrainedModel {
    Logistic(LogisticModel),
    Forest(RandomForest),
    Boosting(GradientBoosting),
}

impl TrainedModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            TrainedModel::Logistic(_) => ModelKind::LogisticRegression,
            TrainedModel::Forest(_) => ModelKind::RandomForest,
            TrainedModel::Boosting(_) => ModelKind::GradientBoosting,
        }
    }

    /// Churn probability for each row of `x`
    pub fn predict_proba(&self, x: &Array2<f64>) -> crate::Result<Array1<f64>> {
        match self {
            TrainedModel::Logistic(model) => Ok(model.predict_proba(x)),
            TrainedModel::Forest(model) => Ok(model.predict_proba(x)),
            TrainedModel::Boosting(model) => model.predict_proba(x),
        }
    }
}

/// Held-out AUC of one classifier
#[derive(Debug, Clone, Copy)]
pub struct ModelScore {
    pub kind: ModelKind,
    pub auc: Option<f64>,
}

/// Summary of a training run
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub n_rows: usize,
    pub n_features: usize,
    pub n_train: usize,
    pub n_test: usize,
    pub scores: Vec<ModelScore>,
    pub primary: ModelKind,
}

impl TrainingReport {
    pub fn print(&self) {
        println!("\n=== Model Bake-off ===");
        println!(
            "Accounts: {} (train {}, test {}), features: {}",
            self.n_rows, self.n_train, self.n_test, self.n_features
        );
        for score in &self.scores {
            match score.auc {
                Some(auc) => println!("{} AUC: {:.4}", score.kind, auc),
                None => println!("{} AUC: undefined (single-class test split)", score.kind),
            }
        }
        println!("Primary model: {}", self.primary);
    }
}

/// Everything a training run produces
#[derive(Debug)]
pub struct TrainingOutcome {
    pub report: TrainingReport,
    pub model: TrainedModel,
    pub scaler: StandardScaler,
    /// Primary model's churn probability for every account, in master order
    pub scores: Array1<f64>,
}

/// Fit the three classifiers, pick the primary one and score every account
///
/// # Arguments
/// * `master` - Master dataset from `build_master_dataset`
/// * `config` - Split, seed and model hyperparameters
///
/// # Returns
/// * `TrainingOutcome` with held-out AUCs and full-population scores
pub fn train_and_score(master: &DataFrame, config: &TrainerConfig) -> crate::Result<TrainingOutcome> {
    let features = FeatureMatrix::from_master(master)?;
    if features.n_features() == 0 {
        return Err(ChurnError::Model("no usable feature columns".to_string()).into());
    }
    if features.n_rows() < 2 {
        return Err(ChurnError::TooFewRows {
            rows: features.n_rows(),
        }
        .into());
    }

    let (train_idx, test_idx) = train_test_split(features.n_rows(), config.test_fraction, config.seed);
    let (x_train, y_train) = features.rows(&train_idx);
    let (x_test, y_test) = features.rows(&test_idx);

    if y_train.iter().all(|&l| l) || y_train.iter().all(|&l| !l) {
        return Err(ChurnError::SingleClassLabel {
            label: CHURN_FLAG.to_string(),
        }
        .into());
    }

    info!(
        rows = features.n_rows(),
        features = features.n_features(),
        train = train_idx.len(),
        test = test_idx.len(),
        "training churn classifiers"
    );

    let logistic = LogisticModel::fit(&x_train, &y_train, config.logistic_max_iterations)?;
    let scaler = logistic.scaler().clone();
    let forest = RandomForest::fit(&x_train, &y_train, config.forest_trees, config.seed)?;
    let boosting = GradientBoosting::fit(
        &x_train,
        &y_train,
        config.boosting_stages,
        config.boosting_learning_rate,
        config.boosting_max_depth,
    )?;

    let candidates = vec![
        TrainedModel::Logistic(logistic),
        TrainedModel::Forest(forest),
        TrainedModel::Boosting(boosting),
    ];

    let mut scores = Vec::with_capacity(candidates.len());
    for model in &candidates {
        let auc = roc_auc(&y_test, model.predict_proba(&x_test)?.as_slice().unwrap_or(&[]));
        info!(model = %model.kind(), auc = ?auc, "held-out evaluation");
        scores.push(ModelScore {
            kind: model.kind(),
            auc,
        });
    }

    let primary_kind = select_primary(config.primary, &scores);
    let model = candidates
        .into_iter()
        .find(|m| m.kind() == primary_kind)
        .ok_or_else(|| ChurnError::Model(format!("{} was not trained", primary_kind)))?;

    let risk = model.predict_proba(&features.values)?;
    if risk.len() != features.n_rows() {
        return Err(ChurnError::ScoreCountMismatch {
            rows: features.n_rows(),
            scores: risk.len(),
        }
        .into());
    }

    Ok(TrainingOutcome {
        report: TrainingReport {
            n_rows: features.n_rows(),
            n_features: features.n_features(),
            n_train: train_idx.len(),
            n_test: test_idx.len(),
            scores,
            primary: primary_kind,
        },
        model,
        scaler,
        scores: risk,
    })
}

/// Resolve the primary model; `Best` falls back to gradient boosting when no
/// AUC is defined
pub fn select_primary(selection: PrimarySelection, scores: &[ModelScore]) -> ModelKind {
    match selection {
        PrimarySelection::Logistic => ModelKind::LogisticRegression,
        PrimarySelection::Forest => ModelKind::RandomForest,
        PrimarySelection::Boosting => ModelKind::GradientBoosting,
        PrimarySelection::Best => scores
            .iter()
            .filter_map(|s| s.auc.map(|auc| (s.kind, auc)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(kind, _)| kind)
            .unwrap_or(ModelKind::GradientBoosting),
    }
}

/// Append `churn_risk_score` to the master dataset, replacing any prior one
pub fn attach_risk_scores(mut master: DataFrame, scores: &Array1<f64>) -> crate::Result<DataFrame> {
    if scores.len() != master.height() {
        return Err(ChurnError::ScoreCountMismatch {
            rows: master.height(),
            scores: scores.len(),
        }
        .into());
    }
    let series = Series::new(RISK_SCORE.into(), scores.to_vec());
    master.with_column(series)?;
    Ok(master)
}

/// Persist a model or scaler as an opaque binary blob
pub fn save_artifact<T: Serialize>(value: &T, path: &Path) -> crate::Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, value).map_err(ChurnError::from)?;
    info!(path = %path.display(), "artifact saved");
    Ok(())
}

pub fn load_artifact<T: for<'de> Deserialize<'de>>(path: &Path) -> crate::Result<T> {
    let reader = BufReader::new(File::open(path)?);
    let value = bincode::deserialize_from(reader).map_err(ChurnError::from)?;
    Ok(value)
}
