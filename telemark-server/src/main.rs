mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
use server::run_server;
use telemark_core::{RestoreDeviceOperationOutcome, TelemetryService, VerificationStatus};

#[derive(Parser)]
#[command(name = "telemark")]
#[command(about = "Device telemetry ingest with ledger attestation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Rebuild a device's local timeline from ledger attestations
    Restore {
        device_id: String,

        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Compare a device's latest local snapshot with the ledger
    Verify {
        device_id: String,

        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telemark=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Telemark server with config: {}", config);
            let cfg = load_config(&config);

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Restore { device_id, config } => {
            let service = open_service(&load_config(&config)).await;

            match service.restore(&device_id).await {
                Ok(RestoreDeviceOperationOutcome::Restored(result)) => {
                    print_json(&result);
                }
                Ok(RestoreDeviceOperationOutcome::Declined(reason)) => {
                    tracing::error!("Restore of {} declined: {}", device_id, reason);
                    std::process::exit(2);
                }
                Err(e) => {
                    tracing::error!("Restore of {} failed: {}", device_id, e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Verify { device_id, config } => {
            let service = open_service(&load_config(&config)).await;

            match service.verify(&device_id).await {
                Ok(report) => {
                    print_json(&report);
                    if report.status != VerificationStatus::Verified {
                        std::process::exit(2);
                    }
                }
                Err(e) => {
                    tracing::error!("Verification of {} failed: {}", device_id, e);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn load_config(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    }
}

async fn open_service(cfg: &Config) -> TelemetryService {
    let result = async {
        let ledger = cfg.build_ledger()?;
        let service =
            TelemetryService::open(cfg.data_dir.clone(), ledger, cfg.service_options()).await?;
        service.start().await?;
        Ok::<_, telemark_core::TelemarkError>(service)
    }
    .await;

    match result {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("Failed to open data directory {:?}: {}", cfg.data_dir, e);
            std::process::exit(1);
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!("Failed to encode output: {}", e),
    }
}
