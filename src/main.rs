use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kiln::compactor::{compact_if_due, run_compactor};
use kiln::config::Config;
use kiln::engine::{DayCellState, MonthSummary, Studio};
use kiln::model::{CalendarDate, YearMonth};
use kiln::notify::NotifyHub;
use kiln::observability::TracingObserver;

#[derive(Parser)]
#[command(name = "kiln", version, about = "Studio availability and capacity")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load courses, slots, overrides and bookings from a JSON seed file
    Import { file: PathBuf },
    /// List every course
    Courses,
    /// Bookable windows for one date
    Day {
        /// Course slug or id
        course: String,
        date: CalendarDate,
    },
    /// Per-day seats left for a month
    Month {
        /// Course slug or id
        course: String,
        month: YearMonth,
        /// Also classify each day for a calendar view, relative to this date
        #[arg(long)]
        today: Option<CalendarDate>,
    },
    /// Rewrite the WAL with the minimal event set
    Compact,
}

#[derive(Serialize)]
struct MonthView<'a> {
    #[serde(flatten)]
    summary: &'a MonthSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    cells: Option<std::collections::BTreeMap<CalendarDate, DayCellState>>,
}

fn print_json(value: &impl Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.data_dir)?;

    let studio = Arc::new(Studio::open(
        config.wal_path(),
        config.studio_options(),
        Arc::new(NotifyHub::new()),
        Arc::new(TracingObserver),
    )?);

    match cli.command {
        Command::Import { file } => {
            let seed = kiln::seed::parse(&std::fs::read_to_string(&file)?)?;
            let compactor = tokio::spawn(run_compactor(
                studio.clone(),
                config.compact_threshold,
                Duration::from_secs(5),
            ));
            let report = kiln::seed::import(&studio, seed).await;
            compactor.abort();
            let report = report?;
            info!("imported {}", file.display());
            compact_if_due(&studio, config.compact_threshold).await?;
            print_json(&report)?;
        }
        Command::Courses => print_json(&studio.list_courses())?,
        Command::Day { course, date } => {
            let course = studio.find_course(&course)?;
            print_json(&studio.slots_for_day(course.id, date).await?)?;
        }
        Command::Month { course, month, today } => {
            let course = studio.find_course(&course)?;
            let summary = studio.month_summary(course.id, month).await?;
            let cells = match today {
                Some(today) => Some(studio.calendar(course.id, month, today).await?),
                None => None,
            };
            print_json(&MonthView { summary: &summary, cells })?;
        }
        Command::Compact => {
            let kept = studio.compact_wal().await?;
            info!("{} now holds {kept} events", config.wal_path().display());
        }
    }
    Ok(())
}
