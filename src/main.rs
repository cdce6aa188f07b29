use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use roomscan::config::Config;
use roomscan::database::{Database, LogWriter};
use roomscan::pipeline::IngestionPipeline;
use roomscan::reaper::Reaper;
use roomscan::registry::SiteRegistry;
use roomscan::report::{print_heatmap, print_positions, print_presences, print_results, ReportGenerator};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "roomscan")]
#[command(author = "spikehead")]
#[command(version = "0.1.0")]
#[command(about = "Anchor RSSI ingestion, room presence and position estimation")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Site file with rooms, anchors and assets (overrides config)
    #[arg(short, long)]
    site: Option<PathBuf>,

    /// Database file (overrides config)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one scan payload file ("-" for stdin) and print the result
    Ingest {
        /// JSON payload: one observation object or an array
        file: PathBuf,

        /// Print the occupancy heatmap of this room
        #[arg(long)]
        heatmap: Option<i64>,
    },

    /// Ingest newline-delimited payloads from stdin until EOF or Ctrl+C
    Run,

    /// Presence report from the log store
    Report {
        /// Number of hours to cover
        #[arg(long, default_value = "24")]
        last_hours: u32,

        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show log store statistics
    Stats,

    /// Write default configuration and a sample site file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_secs()
        .init();

    // Handle init command before loading config
    if matches!(cli.command, Commands::Init) {
        return handle_init();
    }

    let mut config = if cli.config.exists() {
        Config::load(&cli.config).context("Failed to load config")?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    if let Some(site) = cli.site {
        config.storage.site = site.to_string_lossy().to_string();
    }
    if let Some(database) = cli.database {
        config.storage.database = database.to_string_lossy().to_string();
    }

    match cli.command {
        Commands::Ingest { file, heatmap } => handle_ingest(config, &file, heatmap),
        Commands::Run => handle_run(config).await,
        Commands::Report { last_hours, output } => {
            let db = Database::open(&config.storage.database).context("Failed to open database")?;
            ReportGenerator::generate_presence_report(&db, last_hours, output.as_deref())
        }
        Commands::Stats => {
            let db = Database::open(&config.storage.database).context("Failed to open database")?;
            ReportGenerator::generate_stats(&db)
        }
        Commands::Init => unreachable!(),
    }
}

fn load_site(config: &Config) -> Result<Arc<SiteRegistry>> {
    let registry = SiteRegistry::load(&config.storage.site)
        .with_context(|| format!("Failed to load site {}; run 'roomscan init' first", config.storage.site))?;
    Ok(Arc::new(registry))
}

fn handle_ingest(config: Config, file: &Path, heatmap: Option<i64>) -> Result<()> {
    let payload = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read payload from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file).with_context(|| format!("Failed to read payload: {:?}", file))?
    };

    let registry = load_site(&config)?;
    let weighting = config.positioning.weighting;
    let pipeline = IngestionPipeline::new(config, registry.clone(), registry.clone());

    let results = pipeline.ingest_payload(&payload)?;
    println!("Results");
    println!("-------");
    print_results(&results);

    println!();
    println!("Open presences");
    println!("--------------");
    print_presences(&pipeline.open_presences())?;

    for room in registry.rooms() {
        println!();
        println!("Positions in room {} ({})", room.id, room.name);
        print_positions(&pipeline.current_positions(room.id), &weighting);
    }

    if let Some(room_id) = heatmap {
        println!();
        match pipeline.heatmap(room_id) {
            Some(grid) => print_heatmap(&grid),
            None => warn!("Unknown room: {}", room_id),
        }
    }

    Ok(())
}

async fn handle_run(config: Config) -> Result<()> {
    let registry = load_site(&config)?;
    let db = Database::open(&config.storage.database).context("Failed to open database")?;

    let (event_tx, event_rx) = mpsc::channel(config.storage.event_buffer.max(1));
    let writer = LogWriter::spawn(db, event_rx);

    let reaper_interval = config.reaper.interval_ms;
    let pipeline = Arc::new(IngestionPipeline::new(config, registry.clone(), registry).with_events(event_tx));

    // Set up shared running flag for signal handling
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, stopping ingestion...");
        r.store(false, Ordering::SeqCst);
    })?;

    let reaper = Reaper::new(pipeline.clone(), reaper_interval);
    let running_reaper = running.clone();
    let reaper_handle = tokio::spawn(async move {
        if let Err(e) = reaper.run(running_reaper).await {
            error!("Reaper error: {}", e);
        }
    });

    info!("Reading scan payloads from stdin. Press Ctrl+C to stop.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut batches = 0u64;

    while running.load(Ordering::SeqCst) {
        let line = match tokio::time::timeout(Duration::from_millis(500), lines.next_line()).await {
            Err(_) => continue,
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                info!("End of input");
                break;
            }
            Ok(Err(e)) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match pipeline.ingest_payload(&line) {
            Ok(results) => {
                batches += 1;
                println!("{}", serde_json::to_string(&results)?);
            }
            Err(e) => warn!("Rejected payload: {}", e),
        }
    }

    running.store(false, Ordering::SeqCst);
    if let Err(e) = reaper_handle.await {
        error!("Reaper task failed: {}", e);
    }

    // Dropping the last pipeline handle closes the event channel
    drop(pipeline);
    let written = writer.await.context("Log writer task failed")?;
    info!("Stopped. Batches: {}, events persisted: {}", batches, written);

    // Force exit so the blocking stdin reader does not hold the runtime open
    std::process::exit(0);
}

fn handle_init() -> Result<()> {
    info!("Initializing roomscan configuration...");

    let config = Config::default();
    config.save("config.json")?;
    info!("Created config.json");

    let site = Path::new(&config.storage.site);
    if site.exists() {
        info!("Keeping existing {}", config.storage.site);
    } else {
        SiteRegistry::sample().save(site)?;
        info!("Created sample {}", config.storage.site);
    }

    info!("Initialization complete!");
    info!("Edit {} to describe your rooms, anchors and assets.", config.storage.site);
    info!("Pipe scanner payloads into 'roomscan run' to start.");

    Ok(())
}
