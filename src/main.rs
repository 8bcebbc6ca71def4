// src/main.rs
//! Fleet Tracker - share a vehicle's position and follow the fleet live

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use fleet_tracker::{
    config::{SourceConfig, TrackerConfig},
    display::{self, terminal::{FleetScreen, TrackingScreen}},
    export::{TrailExporter, TrailFormat},
    gps::{nmea::list_serial_ports, GpsdSource, SerialNmeaSource},
    logging::{self, LogTarget},
    EntityId, FleetView, HttpTransport, LiveMap, LocationSampler, SceneBackend,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fleet-tracker")]
#[command(version, about = "Share a vehicle's location and follow the fleet on a live map")]
struct Cli {
    /// Line output instead of the full-screen display
    #[arg(long, global = true)]
    plain: bool,

    /// Write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample this device's position and send it for a vehicle
    Track(TrackArgs),
    /// Follow one or more vehicles on the live map
    Watch(WatchArgs),
    /// List available serial ports
    Ports,
    /// Show or change the stored configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct TrackArgs {
    /// Vehicle id (UUID); defaults to the last one tracked
    entity_id: Option<String>,

    /// Position source: gpsd or serial
    #[arg(long)]
    source: Option<String>,

    /// Serial port of the NMEA receiver
    #[arg(long)]
    port: Option<String>,

    #[arg(long)]
    baud: Option<u32>,

    /// gpsd host
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    gpsd_port: Option<u16>,

    /// Fleet API base URL
    #[arg(long)]
    api: Option<String>,
}

#[derive(Args)]
struct WatchArgs {
    /// Vehicle ids (UUID)
    #[arg(required = true)]
    entity_ids: Vec<String>,

    /// Display name, as ID=NAME
    #[arg(long = "name", value_name = "ID=NAME")]
    names: Vec<String>,

    #[arg(long)]
    auto_center: bool,

    #[arg(long)]
    no_trail: bool,

    /// Write trails on exit (.gpx, .geojson or .csv)
    #[arg(long)]
    export: Option<PathBuf>,

    /// Fleet API base URL
    #[arg(long)]
    api: Option<String>,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    /// Store the fleet API base URL
    SetApi { url: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match TrackerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: {}; using defaults", e);
            TrackerConfig::default()
        }
    };

    let fullscreen = !cli.plain && display::should_use_fullscreen();
    init_logging(&cli, fullscreen)?;

    match cli.command {
        Commands::Track(args) => track(config, args, fullscreen).await,
        Commands::Watch(args) => watch(config, args, fullscreen).await,
        Commands::Ports => {
            let ports = list_serial_ports()?;
            if ports.is_empty() {
                println!("No serial ports found.");
            } else {
                println!("Available serial ports:");
                for port in ports {
                    println!("  {}", port);
                }
            }
            Ok(())
        }
        Commands::Config { action } => configure(config, action),
    }
}

fn init_logging(cli: &Cli, fullscreen: bool) -> anyhow::Result<()> {
    let target = match (&cli.log_file, fullscreen) {
        (Some(path), _) => LogTarget::File(path.clone()),
        (None, true) => LogTarget::File(logging::default_log_file(&TrackerConfig::config_dir()?)),
        (None, false) => LogTarget::Stderr,
    };
    logging::init_logging(&target).context("logging setup failed")?;
    Ok(())
}

/// Cleared by Ctrl+C or by the display's quit key
fn running_flag() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(false, Ordering::Relaxed);
        }
    });
    running
}

async fn track(mut config: TrackerConfig, args: TrackArgs, fullscreen: bool) -> anyhow::Result<()> {
    let entity_id = args
        .entity_id
        .or_else(|| config.last_entity_id.clone())
        .ok_or_else(|| anyhow!("No vehicle id given and none remembered from a previous run"))?;

    let mut api = config.api.clone();
    if let Some(url) = args.api {
        api.base_url = url;
    }
    let mut source = config.source.clone();
    if let Some(kind) = args.source {
        source.source_type = kind;
    }
    if args.port.is_some() {
        source.serial_port = args.port;
    }
    if args.baud.is_some() {
        source.serial_baudrate = args.baud;
    }
    if args.host.is_some() {
        source.gpsd_host = args.host;
    }
    if args.gpsd_port.is_some() {
        source.gpsd_port = args.gpsd_port;
    }

    let transport = Arc::new(HttpTransport::new(&api)?);
    let sampler = LocationSampler::new(transport, config.sampler.clone());
    start_sampler(&sampler, &entity_id, &source)?;

    config.remember_entity(&entity_id);
    if let Err(e) = config.save() {
        warn!(error = %e, "could not remember the vehicle id");
    }

    let running = running_flag();
    if fullscreen {
        TrackingScreen::new().run(sampler.status_board(), Arc::clone(&running)).await?;
    } else {
        println!("Sharing location for {} via {} (Ctrl+C to stop)", entity_id, api.base_url);
        display::plain::run_tracking(sampler.status_board(), Arc::clone(&running)).await;
    }

    sampler.stop();
    let status = sampler.status();
    println!("Stopped. {} update(s) sent.", status.updates_sent);
    Ok(())
}

fn start_sampler(
    sampler: &LocationSampler<HttpTransport>,
    entity_id: &str,
    source: &SourceConfig,
) -> anyhow::Result<()> {
    match source.source_type.as_str() {
        "serial" => {
            let port = source
                .serial_port
                .clone()
                .ok_or_else(|| anyhow!("No serial port configured; pass --port"))?;
            let baudrate = source.serial_baudrate.unwrap_or(9600);
            sampler.start(entity_id, SerialNmeaSource::new(port, baudrate))?;
        }
        "gpsd" => {
            let host = source.gpsd_host.clone().unwrap_or_else(|| "localhost".to_string());
            let port = source.gpsd_port.unwrap_or(2947);
            sampler.start(entity_id, GpsdSource::new(host, port))?;
        }
        other => bail!("Unknown position source '{}'; use gpsd or serial", other),
    }
    Ok(())
}

async fn watch(config: TrackerConfig, args: WatchArgs, fullscreen: bool) -> anyhow::Result<()> {
    let entity_ids = args
        .entity_ids
        .iter()
        .map(|id| EntityId::parse(id))
        .collect::<Result<Vec<_>, _>>()?;

    let mut api = config.api.clone();
    if let Some(url) = args.api {
        api.base_url = url;
    }
    let mut options = config.map.clone();
    options.auto_center |= args.auto_center;
    options.show_trail &= !args.no_trail;

    let export_format = match &args.export {
        Some(path) => Some(TrailFormat::from_path(path).ok_or_else(|| {
            anyhow!("Cannot tell the export format of {}; use .gpx, .geojson or .csv", path.display())
        })?),
        None => None,
    };

    let map = LiveMap::new(Arc::new(SceneBackend::default()), options);
    for pair in &args.names {
        let (id, name) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid --name '{}', expected ID=NAME", pair))?;
        map.set_display_name(id.trim(), name.trim()).await;
    }

    let surface = map.mount("fleet").await.context("map initialization failed")?;
    let transport = HttpTransport::new(&api)?;
    let view = FleetView::new(surface.map().clone());
    view.start(&transport, &entity_ids);

    let running = running_flag();
    if fullscreen {
        FleetScreen::new().run(&view, Arc::clone(&running)).await?;
    } else {
        println!("Following {} vehicle(s) (Ctrl+C to stop)", entity_ids.len());
        display::plain::run_fleet(&view, Arc::clone(&running)).await;
    }
    view.stop();

    if let (Some(path), Some(format)) = (&args.export, export_format) {
        let exporter = TrailExporter::new(map.entities());
        exporter
            .export_to_file(path, format)
            .with_context(|| format!("failed to export trails to {}", path.display()))?;
        info!(path = %path.display(), vehicles = exporter.entity_count(), "trails exported");
        println!("Exported {} trail(s) to {} ({})", exporter.entity_count(), path.display(), format.extension());
    }

    drop(surface);
    Ok(())
}

fn configure(mut config: TrackerConfig, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("Config file: {}", TrackerConfig::get_config_path()?.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::SetApi { url } => {
            config.update_api(url);
            config.save()?;
            println!("API base URL set to {}", config.api.base_url);
        }
    }
    Ok(())
}
