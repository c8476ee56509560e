use anyhow::{anyhow, Result};
use is_terminal::IsTerminal;
use rabbitdns::controller::log_failures;
use rabbitdns::error::Error::DNSError;
use rabbitdns::{Config, Controller, Shared};
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    let mut first_args = std::env::args().take(2);
    let (program_name, config_file) = (
        first_args.next().unwrap_or("rabbitdns".to_string()),
        first_args.next(),
    );

    let config = config_init(&program_name, config_file)?;
    let geo = config.geo_database()?;
    if geo.is_empty() {
        tracing::info!("no geo database configured, geolocation answers use DEFAULT");
    }

    let controller = Arc::new(Controller::new(config.backends(), Arc::new(geo)));
    log_failures(&controller.reconcile().await);
    let reconciler = controller.spawn(config.reconcile_interval);

    tracing::info!("DNS listening on UDP {}", &config.dns_udp_bind_addr);
    tracing::info!("DNS listening on TCP {}", &config.dns_tcp_bind_addr);
    let dns_server = rabbitdns::new_dns(&config, controller.clone()).await?;
    let dns_handle = tokio::spawn(dns_server.block_until_done());

    tracing::info!("API listening on {}", &config.api_bind_addr);
    let api_server = rabbitdns::new_http(&config, controller.clone());
    let api_handle = tokio::spawn(api_server);

    let result: Result<()> = tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("quitting from signal");
            Ok(())
        },
        Ok(dns_res) = dns_handle => dns_res.map_err(|err| DNSError(err).into()),
        Ok(api_res) = api_handle => api_res.map_err(Into::into),
    };
    reconciler.cancel();
    tracing::info!("goodbye");
    result
}

fn tracing_init() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(std::io::stdout().is_terminal()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rabbitdns=info".into()),
        )
        .init();
}

fn config_init(program_name: &str, config_file: Option<String>) -> Result<Shared> {
    match config_file {
        None => Err(anyhow!("usage: {program_name} /path/to/config.json")),
        Some(config_file) => {
            tracing::debug!("loaded config from {config_file}");
            let config = Config::try_from_file(&config_file)?;
            Ok(Arc::new(config))
        }
    }
}
