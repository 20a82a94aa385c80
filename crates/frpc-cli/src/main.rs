// frpc - command line server and client
//
// `frpc serve` hosts the demo Arith service; `frpc call` sends one request
// and prints the reply as JSON.

mod arith;
mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use frpc::{Client, Payload, Server};
use frpc_config::FrpcConfig;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(cli.level_filter().into()))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => FrpcConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => FrpcConfig::default(),
    };
    config.apply_env_overrides();

    match cli.command {
        Commands::Serve {
            addr,
            handle_timeout_ms,
        } => {
            if let Some(addr) = addr {
                config.server.listen_addr = addr;
            }
            if let Some(ms) = handle_timeout_ms {
                config.server.handle_timeout_ms = ms;
            }
            config.validate()?;
            serve(config).await
        }
        Commands::Call {
            service_method,
            args,
            addr,
            codec,
            timeout_ms,
        } => {
            if let Some(addr) = addr {
                config.client.server_addr = addr;
            }
            if let Some(codec) = codec {
                config.client.codec = codec;
            }
            config.validate()?;
            let args: Payload =
                serde_json::from_str(&args).context("Arguments must be a JSON value")?;
            call(config, &service_method, args, timeout_ms).await
        }
    }
}

async fn serve(config: FrpcConfig) -> Result<()> {
    info!("Starting frpc server v{}", env!("CARGO_PKG_VERSION"));

    let server = Server::new(config.server);
    server.register(arith::service()?)?;
    info!(
        services = ?server.registry().services(),
        codecs = ?server.codecs().tags(),
        handle_timeout = ?server.config().handle_timeout(),
        "server configured"
    );
    let listener = server.bind().await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            shutdown.cancel();
        }
    });

    server.accept(listener).await?;
    info!("frpc server stopped");
    Ok(())
}

async fn call(
    config: FrpcConfig,
    service_method: &str,
    args: Payload,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let client = Client::dial(&config.client.server_addr, &config.client)
        .await
        .with_context(|| format!("Failed to connect to {}", config.client.server_addr))?;
    debug!(codec = %config.client.codec, "connected");

    let reply: Payload = match timeout_ms {
        Some(ms) => {
            client
                .call_timeout(service_method, &args, Duration::from_millis(ms))
                .await?
        }
        None => client.call(service_method, &args).await?,
    };
    println!("{}", serde_json::to_string_pretty(&reply)?);

    client.close().await?;
    Ok(())
}
