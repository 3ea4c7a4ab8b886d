use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tracing::{info, warn};

use cachescope::cli::{
    handle_generate_config, handle_interfaces, handle_validate, handle_version, Cli, Commands,
};
use cachescope::logging::init_logging;
use cachescope::{Engine, EngineConfig, ENGINE_FULL_NAME, ENGINE_VERSION};

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that need neither config nor logging
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _log_guard = init_logging(&logging_config).context("Failed to initialize logging")?;

    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    match cli.command {
        Some(Commands::Interfaces) => {
            handle_interfaces(&config)?;
        }
        #[cfg(feature = "websocket")]
        Some(Commands::Watch { url }) => {
            cachescope::cli::handle_watch(&url, &config).await?;
        }
        Some(Commands::Run) | None => {
            info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
            let engine = Engine::new(config).context("Failed to build engine")?;
            engine.run().await?;
        }
        Some(Commands::Version) | Some(Commands::GenerateConfig { .. }) | Some(Commands::Validate { .. }) => {}
    }

    Ok(())
}
