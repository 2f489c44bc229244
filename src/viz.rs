//! Dashboard charts rendered to PNG with Plotters

use crate::dashboard::{DashboardSummary, HISTOGRAM_BINS};
use plotters::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Bar colors, cycled per category
const BAR_COLORS: [RGBColor; 5] = [BLUE, RED, GREEN, MAGENTA, CYAN];

/// Draw one vertical bar chart with a category label under each bar
///
/// # Arguments
/// * `output_path` - Path to save the PNG plot
/// * `title` - Chart caption
/// * `y_desc` - Y axis description
/// * `labels` - One label per bar
/// * `values` - One height per bar
fn draw_bar_chart(
    output_path: &Path,
    title: &str,
    y_desc: &str,
    labels: &[String],
    values: &[f64],
) -> crate::Result<()> {
    let max_value = values.iter().copied().fold(0.0_f64, f64::max).max(1.0);

    let root = BitMapBackend::new(output_path, (800, 500)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 28))
        .margin(10)
        .x_label_area_size(50)
        .y_label_area_size(60)
        .build_cartesian_2d((0u32..labels.len() as u32).into_segmented(), 0f64..(max_value * 1.1))?;

    let label_of = |value: &SegmentValue<u32>| match value {
        SegmentValue::CenterOf(i) | SegmentValue::Exact(i) => {
            labels.get(*i as usize).cloned().unwrap_or_default()
        }
        SegmentValue::Last => String::new(),
    };

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(labels.len())
        .x_label_formatter(&label_of)
        .y_desc(y_desc)
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    for (i, &value) in values.iter().enumerate() {
        let color = BAR_COLORS[i % BAR_COLORS.len()];
        chart.draw_series(
            Histogram::vertical(&chart)
                .style(color.filled())
                .margin(8)
                .data(std::iter::once((i as u32, value))),
        )?;
    }

    root.present()?;
    info!(path = %output_path.display(), "chart saved");

    Ok(())
}

/// Render every dashboard chart into `out_dir`
///
/// # Returns
/// * Paths of the charts written, in drawing order
pub fn render_dashboard(summary: &DashboardSummary, out_dir: &Path) -> crate::Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)?;
    let mut written = Vec::new();

    let status_labels: Vec<String> = summary.by_status.iter().map(|s| s.status.to_string()).collect();

    let path = out_dir.join("status_counts.png");
    let counts: Vec<f64> = summary.by_status.iter().map(|s| s.accounts as f64).collect();
    draw_bar_chart(&path, "Account Status", "Accounts", &status_labels, &counts)?;
    written.push(path);

    let path = out_dir.join("risk_histogram.png");
    let bin_labels: Vec<String> = (0..HISTOGRAM_BINS)
        .map(|i| format!("{:.2}", i as f64 / HISTOGRAM_BINS as f64))
        .collect();
    let bins: Vec<f64> = summary.risk_histogram.iter().map(|&c| c as f64).collect();
    draw_bar_chart(&path, "Churn Risk Score Distribution", "Accounts", &bin_labels, &bins)?;
    written.push(path);

    let path = out_dir.join("risk_segments.png");
    let segment_labels: Vec<String> = summary.segments.iter().map(|(s, _)| s.label().to_string()).collect();
    let segment_counts: Vec<f64> = summary.segments.iter().map(|(_, c)| *c as f64).collect();
    draw_bar_chart(&path, "Risk Segments", "Accounts", &segment_labels, &segment_counts)?;
    written.push(path);

    if summary.churn_by_industry.is_empty() {
        warn!("no industries in selection, skipping industry chart");
    } else {
        let path = out_dir.join("churn_by_industry.png");
        let industries: Vec<String> = summary
            .churn_by_industry
            .iter()
            .map(|i| i.industry.clone())
            .collect();
        let rates: Vec<f64> = summary.churn_by_industry.iter().map(|i| i.churn_rate_pct).collect();
        draw_bar_chart(&path, "Churn Rate by Industry", "Churn rate (%)", &industries, &rates)?;
        written.push(path);
    }

    let path = out_dir.join("usage_by_status.png");
    let usage: Vec<f64> = summary.by_status.iter().map(|s| s.mean_usage).collect();
    draw_bar_chart(&path, "Mean Usage by Status", "Usage events", &status_labels, &usage)?;
    written.push(path);

    let path = out_dir.join("tickets_by_status.png");
    let tickets: Vec<f64> = summary.by_status.iter().map(|s| s.mean_tickets).collect();
    draw_bar_chart(&path, "Mean Support Tickets by Status", "Tickets", &status_labels, &tickets)?;
    written.push(path);

    Ok(written)
}
