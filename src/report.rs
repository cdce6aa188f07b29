use anyhow::Result;
use chrono::{TimeZone, Utc};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::config::WeightingModel;
use crate::database::Database;
use crate::distance::{estimate_distance, format_distance};
use crate::pipeline::PerObservationResult;
use crate::position::PositionEstimate;
use crate::presence::PresenceInterval;
use crate::trail::Heatmap;

pub struct ReportGenerator;

impl ReportGenerator {
    pub fn generate_presence_report(db: &Database, hours: u32, output: Option<&Path>) -> Result<()> {
        let mut writer = open_writer(output)?;

        let now = Utc::now().timestamp_millis();
        let start = now - hours as i64 * 3_600_000;
        let intervals = db.get_presences_in_time_range(start, now)?;

        writeln!(writer, "========================================")?;
        writeln!(writer, "        ROOMSCAN PRESENCE REPORT")?;
        writeln!(writer, "========================================")?;
        writeln!(writer)?;
        writeln!(
            writer,
            "Generated: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        writeln!(writer, "Window: last {} hours", hours)?;
        writeln!(writer, "Intervals: {}", intervals.len())?;
        writeln!(writer)?;

        if intervals.is_empty() {
            writeln!(writer, "No asset presence recorded.")?;
            return Ok(());
        }

        write_presence_table(&mut writer, &intervals)?;
        Ok(())
    }

    pub fn generate_stats(db: &Database) -> Result<()> {
        let stats = db.stats()?;

        println!("Log Store Statistics");
        println!("--------------------");
        println!("Observations:      {}", stats.log_count);
        println!("Distinct devices:  {}", stats.device_count);
        println!("Asset sightings:   {}", stats.asset_log_count);
        println!("Presence records:  {}", stats.presence_count);
        println!("Open presences:    {}", stats.open_presence_count);

        if let (Some(first), Some(last)) = (stats.first_log, stats.last_log) {
            println!();
            println!("Time Range");
            println!("----------");
            println!("First observation: {}", format_millis(first));
            println!("Last observation:  {}", format_millis(last));

            let duration_hours = (last - first) as f64 / 3_600_000.0;
            if duration_hours > 0.0 {
                println!();
                println!("Averages");
                println!("--------");
                println!("Observations/hour: {:.2}", stats.log_count as f64 / duration_hours);
            }
        }

        Ok(())
    }
}

/// Print per-observation results of one batch
pub fn print_results(results: &[PerObservationResult]) {
    for (i, result) in results.iter().enumerate() {
        let device = result.device_address.as_deref().unwrap_or("<none>");
        match &result.reason {
            None => println!("[{:>3}] \x1b[32mOK\x1b[0m       {}", i, device),
            Some(reason) => println!("[{:>3}] \x1b[31mREJECTED\x1b[0m {} ({})", i, device, reason),
        }
    }
}

pub fn print_positions(positions: &[PositionEstimate], weighting: &WeightingModel) {
    if positions.is_empty() {
        println!("  (no positioned devices)");
        return;
    }

    for p in positions {
        let label = match (&p.asset_name, &p.asset_type) {
            (Some(name), Some(kind)) => format!("{} [{}]", name, kind),
            (Some(name), None) => name.clone(),
            _ => "-".to_string(),
        };
        let distance = match *weighting {
            WeightingModel::PathLoss {
                measured_power_dbm,
                path_loss_exponent,
                ..
            } => format!(
                "~{}",
                format_distance(estimate_distance(p.max_signal_strength, measured_power_dbm, path_loss_exponent))
            ),
            WeightingModel::Exponential { .. } => "-".to_string(),
        };
        println!(
            "  {} ({:6.2}, {:6.2}) {:4}dBm {:>7} {:9} {}",
            p.device_address,
            p.x,
            p.y,
            p.max_signal_strength,
            distance,
            p.proximity,
            label
        );
    }
}

pub fn print_presences(intervals: &[PresenceInterval]) -> Result<()> {
    if intervals.is_empty() {
        println!("  (no open presences)");
        return Ok(());
    }
    write_presence_table(&mut io::stdout(), intervals)
}

pub fn print_heatmap(heatmap: &Heatmap) {
    println!(
        "Room {} heatmap ({}x{} cells of {}m, {} devices)",
        heatmap.room_id,
        heatmap.cols,
        heatmap.rows,
        heatmap.cell_size,
        heatmap.total()
    );
    print!("{}", heatmap.render_ascii());
}

fn write_presence_table<W: Write + ?Sized>(writer: &mut W, intervals: &[PresenceInterval]) -> Result<()> {
    writeln!(writer, "Asset | Room | Entered             | Last Seen           | Exited")?;
    writeln!(writer, "------|------|---------------------|---------------------|--------------------")?;

    for interval in intervals {
        writeln!(
            writer,
            "{:5} | {:4} | {} | {} | {}",
            interval.asset_id,
            interval.room_id,
            interval.entered_at.format("%Y-%m-%d %H:%M:%S"),
            interval.last_seen_at.format("%Y-%m-%d %H:%M:%S"),
            interval
                .exited_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "present".to_string())
        )?;
    }

    Ok(())
}

fn open_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    })
}

fn format_millis(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "N/A".to_string())
}
