//! SVG line charts of aggregated series.

use crate::{AggregatedSeries, BrainRobotSplit, Metric, Summary};
use anyhow::Result;
use bench_core::artifacts::ensure_dir;
use plotters::prelude::*;
use std::path::Path;
use tracing::debug;

const SIZE: (u32, u32) = (800, 600);

struct Line {
    label: String,
    points: Vec<(f64, f64)>,
    color: usize,
    reference: bool,
}

fn points(sweep: &[u32], values: &[f64]) -> Vec<(f64, f64)> {
    sweep
        .iter()
        .zip(values)
        .map(|(&n, &v)| (f64::from(n), v))
        .collect()
}

fn series_lines(label: &str, series: &AggregatedSeries, color: usize) -> Vec<Line> {
    let mut lines = vec![Line {
        label: label.to_string(),
        points: points(&series.sweep, &series.values),
        color,
        reference: false,
    }];
    if let Some(reference) = &series.reference {
        lines.push(Line {
            label: format!("{} (linear)", label),
            points: points(&series.sweep, reference),
            color,
            reference: true,
        });
    }
    lines
}

fn draw(path: &Path, title: &str, y_desc: &str, lines: &[Line]) -> Result<()> {
    let xs = lines.iter().flat_map(|l| l.points.iter().map(|p| p.0));
    let x_min = xs.clone().fold(f64::INFINITY, f64::min);
    let x_max = xs.fold(f64::NEG_INFINITY, f64::max);
    let (x_min, x_max) = if x_min.is_finite() && x_max > x_min {
        (x_min, x_max)
    } else {
        (0.0, x_min.max(0.0) + 1.0)
    };
    let mut y_max = lines
        .iter()
        .flat_map(|l| l.points.iter().map(|p| p.1))
        .filter(|v| v.is_finite())
        .fold(0.0f64, f64::max);
    if y_max <= 0.0 {
        y_max = 1.0;
    }
    let mut ticks: Vec<u32> = lines
        .iter()
        .flat_map(|l| l.points.iter().map(|p| p.0 as u32))
        .collect();
    ticks.sort_unstable();
    ticks.dedup();

    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min..x_max, 0.0..(y_max * 1.1))?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_desc("number of NEST tasks")
        .y_desc(y_desc)
        .x_labels(ticks.len().max(2))
        .x_label_formatter(&|x| format!("{:.0}", x))
        .draw()?;

    for line in lines {
        let base = Palette99::pick(line.color);
        let style = if line.reference {
            base.mix(0.25).stroke_width(4)
        } else {
            base.stroke_width(2)
        };
        chart
            .draw_series(LineSeries::new(line.points.clone(), style))?
            .label(line.label.clone())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], style));
        if !line.reference {
            chart.draw_series(
                line.points
                    .iter()
                    .map(|&p| Circle::new(p, 3, Palette99::pick(line.color).filled())),
            )?;
        }
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    root.present()?;
    debug!(path = %path.display(), "wrote chart");
    Ok(())
}

pub fn render_series(path: &Path, label: &str, series: &AggregatedSeries) -> Result<()> {
    draw(
        path,
        label,
        series.metric.label(),
        &series_lines(label, series, 0),
    )
}

pub fn render_split(path: &Path, split: &BrainRobotSplit) -> Result<()> {
    let categories = [
        ("brain step", &split.brain_step),
        ("robot step", &split.robot_step),
        ("brain refresh", &split.brain_refresh),
        ("transfer functions", &split.transfer_function),
    ];
    let lines: Vec<Line> = categories
        .iter()
        .enumerate()
        .map(|(i, (label, values))| Line {
            label: label.to_string(),
            points: points(&split.sweep, values),
            color: i,
            reference: false,
        })
        .collect();
    draw(path, "Brain to robot ratio", "share of cycle time (%)", &lines)
}

/// Per-metric charts plus the brain/robot split of one result directory.
pub fn render_summary(out: &Path, summary: &Summary) -> Result<()> {
    ensure_dir(out)?;
    for series in &summary.series {
        let path = out.join(format!("{}.svg", series.metric.stem()));
        render_series(&path, &summary.label, series)?;
    }
    if let Some(split) = &summary.brain_robot_split {
        render_split(&out.join("braintorobot_ratio.svg"), split)?;
    }
    Ok(())
}

/// One chart per metric overlaying every result directory that has it.
pub fn render_comparisons(out: &Path, summaries: &[Summary]) -> Result<()> {
    ensure_dir(out)?;
    for metric in Metric::ALL {
        let lines: Vec<Line> = summaries
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.series
                    .iter()
                    .find(|series| series.metric == metric)
                    .map(|series| series_lines(&format!("{:02}-{}", i, s.label), series, i))
            })
            .flatten()
            .collect();
        if lines.is_empty() {
            continue;
        }
        let path = out.join(format!("comparison-{}.svg", metric.stem()));
        draw(&path, "Coupled NRP+NEST HPC benchmark", metric.label(), &lines)?;
    }
    Ok(())
}
