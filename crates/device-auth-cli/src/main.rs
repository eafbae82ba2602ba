use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use device_auth::{collect_identity, mask_token, AuthConfig, DeviceAuthClient};

#[derive(Parser)]
#[command(name = "device-auth")]
#[command(about = "Authenticate this device against its management server")]
#[command(version)]
struct Cli {
    /// TOML configuration file; DEVICE_AUTH_* variables override it
    #[arg(long, short, env = "DEVICE_AUTH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the handshake once and print the token
    FetchToken {
        /// Print the token masked
        #[arg(long)]
        masked: bool,
    },
    /// Run the identity helper and print the encoded identity
    ShowIdentity,
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .with_file(false),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = AuthConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::FetchToken { masked } => {
            config.validate()?;
            tracing::debug!("Authenticating against {}", config.server_url);
            let client = DeviceAuthClient::from_config(&config)?;
            let token = client
                .fetch_token(
                    &config.server_url,
                    &config.private_key,
                    &config.identity_script,
                )
                .await
                .context("authentication failed")?;
            if masked {
                println!("{}", mask_token(&token));
            } else {
                println!("{token}");
            }
        }
        Commands::ShowIdentity => {
            let identity = collect_identity(&config.identity_script)
                .await
                .with_context(|| format!("running {}", config.identity_script.display()))?;
            println!("{}", identity.to_json()?);
        }
    }

    Ok(())
}
