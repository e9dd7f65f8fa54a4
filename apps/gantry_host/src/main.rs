use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tokio::signal;
use tokio::time::{Duration, interval};
use tracing::{Level, debug, error, info, warn};

use gantry_bridge::proxies::register_builtin;
use gantry_bridge::sim::SimEngine;
use gantry_bridge::{Bridge, FactoryTable, boundary};
use gantry_log::{LogConfig, init_logging, parse_level};
use gantry_schema::Validatable;

mod config;
use config::Config;

mod engine_driver;
use engine_driver::{DriverSettings, EngineDriver};

mod plugins;
use plugins::PluginHost;

const VERSION: &str = "0.1.0";

/// Get default config path based on executable location
fn default_config_path() -> String {
    env::current_exe()
        .ok()
        .and_then(|exe_path| {
            let stem = exe_path.file_stem()?;
            let parent = exe_path.parent()?;
            Some(parent.join(stem).with_extension("json"))
        })
        .and_then(|path| path.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "./gantry_host.json".to_string())
}

/// Gantry Host - runs a simulated engine against the object bridge
#[derive(Parser, Debug)]
#[command(name = "gantry_host")]
#[command(author = "Gantry Project")]
#[command(version = VERSION)]
#[command(about = "Gantry object bridge host", long_about = None)]
struct Args {
    /// Path to configuration file (JSON)
    #[arg(short, long, default_value_t = default_config_path())]
    config: String,

    /// Enable logging to file (gantry_host.log in current directory)
    #[arg(long, env = "GANTRY_LOG_FILE")]
    log_file: bool,

    /// Print the configuration JSON schema and exit
    #[arg(long)]
    print_schema: bool,

    /// Override the configured number of ticks to run (0 = until Ctrl+C)
    #[arg(long)]
    ticks: Option<u64>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.print_schema {
        match Config::schema_json() {
            Ok(schema) => println!("{}", schema),
            Err(e) => {
                eprintln!("Failed to generate schema: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Logging is not up yet, so early failures go to stderr
    let mut config = match Config::from_json_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config from '{}': {}", args.config, e);
            std::process::exit(1);
        }
    };
    if let Some(ticks) = args.ticks {
        config.run_ticks = ticks;
    }

    let log_level = parse_level(&config.log_level).unwrap_or_else(|| {
        eprintln!("Warning: Invalid log level '{}', using INFO", config.log_level);
        Level::INFO
    });

    let log_result = if args.log_file {
        match std::fs::File::create("gantry_host.log") {
            Ok(file) => init_logging(
                LogConfig::new("gantry_host::")
                    .with_level(log_level)
                    .with_log_file(file),
            ),
            Err(e) => {
                eprintln!("Unable to create gantry_host.log: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        init_logging(LogConfig::<std::fs::File>::new("gantry_host::").with_level(log_level))
    };
    if let Err(e) = log_result {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!("{} v{}", config.name, VERSION);
    info!("Configuration: {}", args.config);

    debug!("Settings:");
    debug!("  Tick Rate: {} Hz", config.tick_rate);
    debug!("  Run Ticks: {}", config.run_ticks);
    debug!("  Engine Workers: {}", config.engine_workers);
    debug!("  Spawns Per Tick: {}", config.spawns_per_tick);
    debug!("  Despawn Ratio: {}", config.despawn_ratio);
    debug!("  Collect Every: {} ticks", config.collect_every);
    debug!("  Plugins: {}", config.plugins.join(", "));
    debug!("  Log Level: {}", config.log_level);

    // 1. Plugins register their on-create hooks while the factory is open
    let mut plugins = match PluginHost::from_names(&config.plugins) {
        Ok(host) => host,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };
    let mut factory = FactoryTable::builder();
    if let Err(e) = register_builtin(&mut factory).and_then(|_| plugins.register_all(&mut factory)) {
        error!("Failed to build the factory table: {}", e);
        return;
    }
    let factory = factory.build();
    info!("Factory table ready with {} proxy types", factory.len());

    // 2. Bridge, boundary callbacks, engine workers
    let engine = Arc::new(SimEngine::new());
    let bridge = Bridge::new(engine.clone(), factory, config.bridge.clone());
    let callbacks = match boundary::install(bridge.clone()) {
        Ok(callbacks) => callbacks,
        Err(e) => {
            error!("Failed to install boundary callbacks: {}", e);
            return;
        }
    };

    let loaded = plugins.load_all(&bridge);
    info!("{} plugin(s) loaded", loaded);

    let driver = match EngineDriver::start(
        engine.clone(),
        bridge.clone(),
        callbacks,
        DriverSettings::from_config(&config),
    ) {
        Ok(driver) => driver,
        Err(e) => {
            error!("Failed to start engine workers: {}", e);
            return;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));

    // Setup SIGTERM handler (Linux/Unix only)
    #[cfg(unix)]
    {
        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM signal");
                    shutdown_clone.store(true, Ordering::Relaxed);
                }
                Err(err) => {
                    warn!("Error setting up SIGTERM handler: {}", err);
                }
            }
        });
    }

    let tick_duration = Duration::from_millis(1000 / config.tick_rate.max(1));
    let mut tick_interval = interval(tick_duration);
    let mut tick: u64 = 0;

    info!("Entering Main Loop (Use Ctrl+C to shutdown)");

    loop {
        tokio::select! {
            biased;

            _ = signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C)");
                break;
            }

            _ = tick_interval.tick() => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                tick += 1;
                if driver.tick(tick) < driver.worker_count() {
                    warn!("Some engine workers stopped accepting ticks");
                }
                plugins.tick_all(&bridge, tick);

                if config.run_ticks > 0 && tick >= config.run_ticks {
                    info!("Ran {} ticks", tick);
                    break;
                }
            }
        }
    }

    info!("Shutting down gracefully...");

    let engine_stats = driver.stop();
    info!(
        "Engine side: {} spawned, {} attached, {} despawned, {} released",
        engine_stats.spawned, engine_stats.attached, engine_stats.despawned, engine_stats.released
    );

    plugins.unload_all(&bridge);

    let report = bridge.shutdown();
    info!(
        "Bridge: {} proxies disposed, {} tokens issued, {} still outstanding",
        report.disposed, report.stats.issued, report.stats.outstanding
    );
    match serde_json::to_string_pretty(&report) {
        Ok(json) if !report.leaked.is_empty() => warn!("Leak report:\n{}", json),
        Ok(json) => debug!("Shutdown report:\n{}", json),
        Err(e) => error!("Failed to serialize shutdown report: {}", e),
    }
    debug!("Live engine objects left: {}", engine.live_objects().len());

    info!("Shutdown complete.");
}
