use std::path::Path;

use cinedex::{
    config::{ServerConfig, ServerConfigValidator, load_config},
    metrics, server, tracing_setup,
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{WrapErr, eyre},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the API server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve_command(&config).await,
        None => serve_command(&args.config).await,
    }
}

async fn serve_command(config_path: &str) -> Result<()> {
    let config: ServerConfig = load_config(config_path)
        .await
        .wrap_err_with(|| format!("Failed to load config from {config_path}"))?;
    ServerConfigValidator::validate(&config).wrap_err("Invalid configuration")?;

    tracing_setup::init_for_environment(config.env)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    let exporter =
        metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    tracing::info!(
        config = config_path,
        listen_addr = %config.listen_addr,
        env = %config.env,
        "Loaded configuration"
    );

    if let Err(e) = server::run(config, Some(exporter)).await {
        tracing::error!(error = ?e, "Server exited with an error");
        return Err(e);
    }
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        println!("ℹ️  '{config_path}' not found; checking defaults and environment overrides");
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:?}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Environment: {}", config.env);
            println!(
                "   • Rate Limiter: {} ({} rps, burst {})",
                if config.limiter.enabled { "enabled" } else { "disabled" },
                config.limiter.rps,
                config.limiter.burst
            );
            println!("   • Trusted Origins: {}", config.cors.trusted_origins.len());
            println!(
                "   • Shutdown: {}s grace, {}s background drain",
                config.shutdown.grace_period_secs, config.shutdown.background_timeout_secs
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Verify listen address format (e.g., '127.0.0.1:4000')");
            println!("   • Trusted origins must look like 'https://example.com' with no path");
            println!("   • Timeouts and burst must be greater than zero");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Cinedex API configuration
# Every value can be overridden from the environment, e.g.
#   CINEDEX__LIMITER__ENABLED=false
#   CINEDEX__CORS__TRUSTED_ORIGINS="https://a.example https://b.example"

listen_addr = "0.0.0.0:4000"
env = "development"

[limiter]
enabled = true
rps = 2.0
burst = 4

[cors]
trusted_origins = []

[timeouts]
idle_secs = 60
read_secs = 10
write_secs = 30

[shutdown]
grace_period_secs = 5
background_timeout_secs = 30

[mailer]
sender = "Cinedex <no-reply@cinedex.local>"
"#;

    tokio::fs::write(path, default_config)
        .await
        .wrap_err("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'cinedex serve --config {config_path}' to start the server");
    Ok(())
}
