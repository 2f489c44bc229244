//! ChurnForge: SaaS churn analytics CLI
//!
//! This is the main entrypoint that wires the batch pipeline, the document
//! store load and the dashboard report to their subcommands.

use anyhow::{Context, Result};
use churnforge::cli::{parse_list, Command};
use churnforge::dashboard::{print_summary, DashboardRow};
use churnforge::data::{load_table, write_table};
use churnforge::features::label_mismatches;
use churnforge::model::save_artifact;
use churnforge::store::{fetch_and_close, replace_and_close};
use churnforge::{
    apply_filters, attach_risk_scores, build_master_dataset, documents_to_rows, frame_to_documents,
    init_tracing, render_dashboard, train_and_score, Args, DashboardSummary, Filters, MongoStore,
    PipelineConfig, RawTables,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

const MASTER_FILE: &str = "master_with_risk.csv";
const MODEL_FILE: &str = "churn_model.bin";
const SCALER_FILE: &str = "scaler.bin";

fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();
    init_tracing(args.verbose);

    if args.verbose {
        println!("ChurnForge - SaaS Churn Analytics");
        println!("=================================\n");
    }

    match &args.command {
        Command::Pipeline {
            data_dir,
            output_dir,
            primary,
            seed,
        } => {
            let config = PipelineConfig::new(data_dir.clone(), output_dir.clone(), *primary, *seed);
            run_pipeline(&config, args.verbose)
        }
        Command::Load { input } => run_load(&args, input),
        Command::Dashboard {
            input,
            industry,
            plan_tier,
            charts,
        } => run_dashboard(
            &args,
            input.as_deref(),
            industry.as_deref(),
            plan_tier.as_deref(),
            charts.as_deref(),
        ),
    }
}

/// Build the master dataset, train, score and persist everything
fn run_pipeline(config: &PipelineConfig, verbose: bool) -> Result<()> {
    println!("=== Churn Pipeline ===\n");

    let start_time = Instant::now();

    // Step 1: Load and normalize raw tables
    if verbose {
        println!("Step 1: Loading raw tables");
        println!("  Data directory: {}", config.data_dir.display());
    }

    let data_start = Instant::now();
    let tables = RawTables::load(&config.data_dir, &config.files)?.normalize()?;
    println!("✓ Raw tables loaded: {} accounts", tables.accounts.height());

    // Step 2: Aggregate into one row per account
    let master = build_master_dataset(&tables)?;
    let data_time = data_start.elapsed();

    println!(
        "✓ Master dataset built: {} rows, {} columns",
        master.height(),
        master.width()
    );
    if verbose {
        println!("  Processing time: {:.2}s", data_time.as_secs_f64());
    }
    if let Some(mismatches) = label_mismatches(&master)? {
        if mismatches > 0 {
            println!("  {} accounts disagree between churn_flag and churn events", mismatches);
        }
    }

    // Step 3: Train the classifiers and score every account
    if verbose {
        println!("\nStep 2: Training churn classifiers");
        println!("  Primary selection: {:?}", config.trainer.primary);
        println!("  Seed: {}", config.trainer.seed);
    }

    let model_start = Instant::now();
    let outcome = train_and_score(&master, &config.trainer)?;
    let model_time = model_start.elapsed();

    outcome.report.print();
    if verbose {
        println!("  Training time: {:.2}s", model_time.as_secs_f64());
    }

    // Step 4: Persist the scored dataset and artifacts
    let mut scored = attach_risk_scores(master, &outcome.scores)?;
    let master_path = config.output_dir.join(MASTER_FILE);
    write_table(&mut scored, &master_path)?;
    save_artifact(&outcome.model, &config.output_dir.join(MODEL_FILE))?;
    save_artifact(&outcome.scaler, &config.output_dir.join(SCALER_FILE))?;

    let total_time = start_time.elapsed();
    println!("\n=== Pipeline Complete ===");
    println!("Total processing time: {:.2}s", total_time.as_secs_f64());
    println!("Scored master saved to: {}", master_path.display());
    println!(
        "Model artifacts saved to: {}",
        config.output_dir.join(MODEL_FILE).display()
    );

    Ok(())
}

/// Replace the stored collection with the scored master CSV
fn run_load(args: &Args, input: &Path) -> Result<()> {
    println!("=== Document Store Load ===\n");

    let store_config = args.store_config()?;
    let master = load_table(input)?;
    let documents = frame_to_documents(&master)?;

    let store = MongoStore::connect(&store_config).context("Failed to connect to MongoDB")?;
    let written = replace_and_close(store, documents)?;

    info!(written, collection = %store_config.collection, "document store replaced");
    println!(
        "✓ Loaded {} accounts into {}.{}",
        written, store_config.database, store_config.collection
    );

    Ok(())
}

/// Print the dashboard for the selected accounts and render charts if asked
fn run_dashboard(
    args: &Args,
    input: Option<&Path>,
    industry: Option<&str>,
    plan_tier: Option<&str>,
    charts: Option<&Path>,
) -> Result<()> {
    let documents = match input {
        Some(path) => frame_to_documents(&load_table(path)?)?,
        None => {
            let store = MongoStore::connect(&args.store_config()?)
                .context("Failed to connect to MongoDB")?;
            fetch_and_close(store)?
        }
    };

    let rows: Vec<DashboardRow> = documents_to_rows(&documents);
    let mut filters = Filters::all_observed(&rows);
    if let Some(selection) = industry {
        filters.industries = Filters::select(parse_list(selection));
    }
    if let Some(selection) = plan_tier {
        filters.plan_tiers = Filters::select(parse_list(selection));
    }

    let selected = apply_filters(&rows, &filters);
    let summary = DashboardSummary::compute(&selected);
    print_summary(&summary);

    if let Some(dir) = charts {
        let written: Vec<PathBuf> = render_dashboard(&summary, dir)?;
        println!("\n✓ {} charts saved to: {}", written.len(), dir.display());
    }

    Ok(())
}
