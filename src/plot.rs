use std::{error::Error, ops::Range, path::Path};

use anyhow::{anyhow, Result};
use plotters::prelude::*;

/// y-axis range covering every finite value with 5% headroom.
fn value_range(series: &[&[f64]]) -> Range<f64> {
    let finite = series
        .iter()
        .flat_map(|s| s.iter().copied())
        .filter(|v| v.is_finite());
    let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if lo > hi {
        return 0.0..1.0;
    }
    let pad = ((hi - lo) * 0.05).max(1e-3);
    (lo - pad).max(0.0)..hi + pad
}

fn points(values: &[f64]) -> impl Iterator<Item = (f64, f64)> + '_ {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, v)| ((i + 1) as f64, *v))
}

fn draw(
    train: &[f64],
    valid: &[f64],
    title: &str,
    path: &Path,
) -> std::result::Result<(), Box<dyn Error>> {
    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let epochs = train.len().max(valid.len()).max(2);
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 28))
        .margin(12)
        .x_label_area_size(40)
        .y_label_area_size(70)
        .build_cartesian_2d(1f64..epochs as f64, value_range(&[train, valid]))?;

    chart
        .configure_mesh()
        .x_desc("Epoch")
        .y_desc("Perplexity")
        .draw()?;

    chart
        .draw_series(LineSeries::new(points(train), &BLUE))?
        .label("Train Perplexity")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));
    chart
        .draw_series(LineSeries::new(points(valid), &RED))?
        .label("Valid Perplexity")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}

/// Renders train/valid perplexity curves (x = epoch starting at 1) to a PNG.
pub fn plot_perplexity(train: &[f64], valid: &[f64], title: &str, path: &Path) -> Result<()> {
    tracing::info!("Saving to {}", path.display());
    draw(train, valid, title, path)
        .map_err(|e| anyhow!("Failed to plot '{}': {e}", path.display()))
}

pub fn default_title(model_id: usize) -> String {
    format!("Model {model_id} Perplexity")
}
