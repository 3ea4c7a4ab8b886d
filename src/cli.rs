//! Command line interface.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::EngineConfig;
use crate::error::{CacheScopeError, CacheScopeResult};
use crate::sampler::{Eligibility, RateSampler};
use crate::store::MemoryStore;
use crate::{ENGINE_FULL_NAME, ENGINE_VERSION};

// ----------------------------------------------------------------------------
// CLI Definition
// ----------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "cachescope",
    version,
    about = "Telemetry aggregation and enrichment engine for a LAN cache",
    long_about = "CacheScope samples network interface throughput into retained rate \
                  series, enriches cache download events against a content catalog, and \
                  pushes refresh signals so live views can merge new events cheaply."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "cachescope.toml", env = "CACHESCOPE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "CACHESCOPE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "CACHESCOPE_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine
    Run,

    /// Validate configuration file
    Validate {
        /// Print the fully parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,

    /// List interfaces the sampler sees, with eligibility and counters
    Interfaces,

    /// Subscribe to a refresh hub and print each signal
    #[cfg(feature = "websocket")]
    Watch {
        /// Hub URL, e.g. ws://127.0.0.1:8765/uirefreshhub
        #[arg(short, long)]
        url: String,
    },
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

pub fn handle_validate(config_path: &Path, verbose: bool) -> CacheScopeResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = match EngineConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("Configuration validation failed: {}", e);
            return Err(CacheScopeError::Config(e));
        }
    };

    println!("Configuration is valid.");
    if verbose {
        println!();
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    println!();
    println!("Summary:");
    println!("  instance:        {}", config.engine.instance_name);
    println!(
        "  sampler:         {} ({:?}, every {}ms, keep {}s)",
        on_off(config.sampler.enabled),
        config.sampler.source,
        config.sampler.tick_interval_ms,
        config.sampler.retention_secs
    );
    println!("  denylist:        {}", config.sampler.denylist.join(", "));
    println!(
        "  live view:       cap {}, delta {}",
        config.events.working_set_cap, config.events.delta_limit
    );
    println!(
        "  catalog:         {:?} provider, {:?} keying",
        config.catalog.provider, config.catalog.version_keying
    );
    println!(
        "  refresh hub:     {} ({}{})",
        on_off(config.notify.enabled),
        config.notify.bind_address,
        config.notify.hub_path
    );
    Ok(())
}

pub fn handle_generate_config(output: Option<&Path>) -> CacheScopeResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

pub fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  Target: {}", std::env::consts::ARCH);
    println!("  OS:     {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  websocket subscriber: {}", on_off(cfg!(feature = "websocket")));
}

/// One-shot survey of the interfaces the sampler would read.
pub fn handle_interfaces(config: &EngineConfig) -> CacheScopeResult<()> {
    let sampler = RateSampler::from_config(&config.sampler, Arc::new(MemoryStore::new()));
    let survey = sampler.survey()?;

    println!("Source: {}", sampler.source_name());
    println!(
        "{:<16} {:<12} {:>16} {:>16}  {}",
        "INTERFACE", "STATUS", "SENT", "RECEIVED", "DESCRIPTION"
    );
    for (info, verdict, counters) in survey {
        let status = match &verdict {
            Eligibility::Eligible => "sampled".to_string(),
            Eligibility::Loopback => "loopback".to_string(),
            Eligibility::Down => "down".to_string(),
            Eligibility::Denied(rule) => format!("denied:{}", rule),
        };
        let (sent, received) = match counters {
            Some(c) => (c.sent_bytes.to_string(), c.received_bytes.to_string()),
            None => ("-".into(), "-".into()),
        };
        println!(
            "{:<16} {:<12} {:>16} {:>16}  {}",
            info.name,
            status,
            sent,
            received,
            info.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Print a line per refresh signal heard from a remote hub until Ctrl-C.
#[cfg(feature = "websocket")]
pub async fn handle_watch(url: &str, config: &EngineConfig) -> CacheScopeResult<()> {
    use crate::notify::{RefreshHub, RemoteSubscriber};
    use tokio_util::sync::CancellationToken;

    let hub = Arc::new(RefreshHub::new(config.notify.capacity));
    let mut signals = hub.subscribe();
    let cancel = CancellationToken::new();
    let subscriber = RemoteSubscriber::new(url, hub.clone(), &config.notify);
    let task = tokio::spawn(subscriber.run(cancel.clone()));

    println!("Watching {} (Ctrl-C to stop)", url);
    let mut count = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            signal = signals.recv() => match signal {
                Some(_) => {
                    count += 1;
                    println!("{} {} #{}", chrono::Utc::now().to_rfc3339(), config.notify.event_name, count);
                }
                None => break,
            }
        }
    }

    cancel.cancel();
    task.await.map_err(|e| CacheScopeError::Internal(e.to_string()))?;
    println!("Received {} signal(s)", count);
    Ok(())
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}
