//! Terminal output: comfy-table tables, JSON and CSV.
//!
//! Tables go to stdout and are meant for humans; `--format json` and
//! `--format csv` emit machine-readable output for piping. Logging stays on
//! stderr either way.

use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use comfy_table::{presets, Cell, CellAlignment, Table};

use crate::accuracy::AccuracyReport;
use crate::cli::OutputFormat;
use crate::evaluate::EvaluationResult;
use crate::model::store::LoadedModel;
use crate::predict::Forecast;
use crate::store::{ForecastSummary, TableSummary};
use crate::training::TrainingMetrics;

fn base_table() -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table
}

fn local_time(timestamp: i64, tz: Tz) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|t| t.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

fn right(text: impl ToString) -> Cell {
    Cell::new(text.to_string()).set_alignment(CellAlignment::Right)
}

pub fn print_forecast(forecast: &Forecast, format: OutputFormat, tz: Tz) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(forecast)?);
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            writer.write_record(["timestamp", "production_w", "ghi_wm2", "cloud_cover_pct"])?;
            for hour in &forecast.hours {
                writer.write_record([
                    hour.timestamp.to_string(),
                    hour.production_w.to_string(),
                    format!("{:.1}", hour.ghi_wm2),
                    hour.cloud_cover_pct.to_string(),
                ])?;
            }
            writer.flush()?;
        }
        OutputFormat::Table => {
            if forecast.is_empty() {
                println!("No forecast hours available.");
                return Ok(());
            }

            let mut table = base_table();
            table.set_header(vec!["Local time", "Power", "GHI", "Clouds"]);
            for hour in &forecast.hours {
                table.add_row(vec![
                    Cell::new(local_time(hour.timestamp, tz)),
                    right(format!("{} W", hour.production_w)),
                    right(format!("{:.0} W/m²", hour.ghi_wm2)),
                    right(format!("{}%", hour.cloud_cover_pct)),
                ]);
            }
            println!("{table}");
            println!(
                "Total: {:.2} kWh ({} hours, model {})",
                forecast.total_kwh,
                forecast.hours.len(),
                forecast.model_version
            );
        }
    }
    Ok(())
}

pub fn print_weather(
    records: &[crate::sources::WeatherRecord],
    format: OutputFormat,
    tz: Tz,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(records)?);
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            writer.write_record([
                "timestamp",
                "ghi_wm2",
                "cloud_cover_pct",
                "temperature_c",
                "wind_speed_ms",
                "humidity_pct",
                "dhi_wm2",
                "dni_wm2",
            ])?;
            for r in records {
                writer.write_record([
                    r.timestamp.to_string(),
                    format!("{:.1}", r.ghi_wm2),
                    r.cloud_cover_pct.to_string(),
                    format!("{:.1}", r.temperature_c),
                    format!("{:.1}", r.wind_speed_ms),
                    r.humidity_pct.to_string(),
                    r.dhi_wm2.map_or(String::new(), |v| format!("{v:.1}")),
                    format!("{:.1}", r.dni_wm2),
                ])?;
            }
            writer.flush()?;
        }
        OutputFormat::Table => {
            if records.is_empty() {
                println!("No weather rows returned.");
                return Ok(());
            }
            let mut table = base_table();
            table.set_header(vec!["Local time", "GHI", "Clouds", "Temp", "Wind"]);
            for r in records {
                table.add_row(vec![
                    Cell::new(local_time(r.timestamp, tz)),
                    right(format!("{:.0} W/m²", r.ghi_wm2)),
                    right(format!("{}%", r.cloud_cover_pct)),
                    right(format!("{:.1} °C", r.temperature_c)),
                    right(format!("{:.1} m/s", r.wind_speed_ms)),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}

pub fn print_metrics(metrics: &TrainingMetrics) {
    let mut table = base_table();
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec![Cell::new("Model"), Cell::new(metrics.model_type)]);
    table.add_row(vec![
        Cell::new("Samples (train/test)"),
        Cell::new(format!(
            "{} ({}/{})",
            metrics.n_samples, metrics.n_train, metrics.n_test
        )),
    ]);
    table.add_row(vec![Cell::new("MAE"), right(format!("{:.0} W", metrics.mae_w))]);
    table.add_row(vec![Cell::new("RMSE"), right(format!("{:.0} W", metrics.rmse_w))]);
    table.add_row(vec![Cell::new("R²"), right(format!("{:.3}", metrics.r2))]);
    table.add_row(vec![
        Cell::new("MAPE (>100 W)"),
        right(format!("{:.1}%", metrics.mape_pct)),
    ]);
    if let Some(cv_mae) = metrics.cv_mae_w {
        table.add_row(vec![Cell::new("CV MAE"), right(format!("{cv_mae:.0} W"))]);
    }
    if metrics.since_year.is_some() || metrics.until_year.is_some() {
        let since = metrics.since_year.map_or("…".to_string(), |y| y.to_string());
        let until = metrics.until_year.map_or("…".to_string(), |y| y.to_string());
        table.add_row(vec![Cell::new("Years"), Cell::new(format!("{since}–{until}"))]);
    }
    println!("{table}");
}

pub fn print_evaluation(result: &EvaluationResult) {
    println!("Backtest {} ({} hours)", result.year, result.n_hours);

    let mut table = base_table();
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec![Cell::new("MAE"), right(format!("{:.0} W", result.mae_w))]);
    table.add_row(vec![Cell::new("RMSE"), right(format!("{:.0} W", result.rmse_w))]);
    table.add_row(vec![Cell::new("R²"), right(format!("{:.3}", result.r2))]);
    table.add_row(vec![
        Cell::new("MAPE (>100 W)"),
        right(format!("{:.1}%", result.mape_pct)),
    ]);
    table.add_row(vec![
        Cell::new("Persistence MAE"),
        right(format!("{:.0} W", result.persistence_mae_w)),
    ]);
    table.add_row(vec![
        Cell::new("Skill vs persistence"),
        right(format!("{:+.1}%", result.skill_pct)),
    ]);
    table.add_row(vec![
        Cell::new("Energy (actual/predicted)"),
        right(format!(
            "{:.0} / {:.0} kWh",
            result.total_actual_kwh, result.total_predicted_kwh
        )),
    ]);
    if let Some(yield_kwh) = result.specific_yield_kwh_per_kwp {
        table.add_row(vec![
            Cell::new("Specific yield"),
            right(format!("{yield_kwh:.0} kWh/kWp")),
        ]);
    }
    println!("{table}");

    let mut table = base_table();
    table.set_header(vec!["Sky", "Hours", "MAE", "MAPE"]);
    for bucket in &result.by_condition {
        table.add_row(vec![
            Cell::new(bucket.condition.label()),
            right(bucket.n_hours),
            right(format!("{:.0} W", bucket.mae_w)),
            right(format!("{:.1}%", bucket.mape_pct)),
        ]);
    }
    println!("{table}");

    let mut table = base_table();
    table.set_header(vec!["Month", "Actual", "Predicted", "Error"]);
    for month in &result.monthly {
        table.add_row(vec![
            Cell::new(&month.label),
            right(format!("{:.1} kWh", month.actual_kwh)),
            right(format!("{:.1} kWh", month.predicted_kwh)),
            right(
                month
                    .error_pct
                    .map_or("—".to_string(), |pct| format!("{pct:+.1}%")),
            ),
        ]);
    }
    println!("{table}");
}

pub fn print_accuracy(report: &AccuracyReport, format: OutputFormat, tz: Tz) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if report.matched_forecasts == 0 {
        println!(
            "No archived forecasts matched an observation yet ({} stored).",
            report.total_forecasts
        );
        return Ok(());
    }

    println!(
        "{} of {} stored forecast hours matched observations ({} to {})",
        report.matched_forecasts,
        report.total_forecasts,
        local_time(report.analysis_start, tz),
        local_time(report.analysis_end, tz),
    );

    for source in &report.sources {
        println!("\nSource: {} ({} hours)", source.source, source.count);
        let mut table = base_table();
        table.set_header(vec!["Horizon", "Hours", "MAE", "RMSE", "Bias"]);
        table.add_row(vec![
            Cell::new("all"),
            right(source.count),
            right(format!("{:.0} W/m²", source.mae_wm2)),
            right(format!("{:.0} W/m²", source.rmse_wm2)),
            right(format!("{:+.0} W/m²", source.bias_wm2)),
        ]);
        for horizon in &source.by_horizon {
            table.add_row(vec![
                Cell::new(horizon.label),
                right(horizon.count),
                right(format!("{:.0} W/m²", horizon.mae_wm2)),
                right(format!("{:.0} W/m²", horizon.rmse_wm2)),
                right(format!("{:+.0} W/m²", horizon.bias_wm2)),
            ]);
        }
        println!("{table}");
    }

    if !report.correlations.is_empty() {
        let mut table = base_table();
        table.set_header(vec!["Sources", "Shared hours", "Error correlation"]);
        for corr in &report.correlations {
            table.add_row(vec![
                Cell::new(format!("{} / {}", corr.source_a, corr.source_b)),
                right(corr.common_points),
                right(format!("{:.2}", corr.pearson_r)),
            ]);
        }
        println!("{table}");
    }
    Ok(())
}

pub fn print_status(
    production: &TableSummary,
    weather: &TableSummary,
    forecasts: &[ForecastSummary],
    model: Option<&LoadedModel>,
    tz: Tz,
) {
    let range = |summary: &TableSummary| match (summary.first, summary.last) {
        (Some(first), Some(last)) => {
            format!("{} to {}", local_time(first, tz), local_time(last, tz))
        }
        _ => "—".to_string(),
    };

    let mut table = base_table();
    table.set_header(vec!["Data", "Rows", "Months", "Range"]);
    table.add_row(vec![
        Cell::new("Production"),
        right(production.rows),
        right(production.months),
        Cell::new(range(production)),
    ]);
    table.add_row(vec![
        Cell::new("Weather"),
        right(weather.rows),
        right(weather.months),
        Cell::new(range(weather)),
    ]);
    for summary in forecasts {
        table.add_row(vec![
            Cell::new(format!("Forecasts ({})", summary.source)),
            right(summary.rows),
            Cell::new(""),
            Cell::new(
                summary
                    .last_issued_at
                    .map_or("—".to_string(), |ts| {
                        format!("last fetched {}", local_time(ts, tz))
                    }),
            ),
        ]);
    }
    println!("{table}");

    match model {
        Some(loaded) => {
            println!(
                "Model: {} (trained {})",
                loaded.version,
                loaded.created_at.with_timezone(&tz).format("%Y-%m-%d %H:%M")
            );
            print_metrics(&loaded.metrics);
        }
        None => println!("Model: none trained yet — run `pvcast train`."),
    }
}

/// Format a UTC timestamp for terminal output in the configured zone.
pub fn format_local(timestamp: i64, tz: Tz) -> String {
    local_time(timestamp, tz)
}
