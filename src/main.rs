use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dnsward::config::{self, ListenerSettings, ProxySettings};
use dnsward::events::DnsProxyEvents;
use dnsward::proxy::DnsProxy;

#[derive(Parser, Debug)]
#[command(author, version, about = "Filtering DNS forwarding proxy", long_about = None)]
struct Args {
    /// Settings file path (JSON). Built-in defaults are used when omitted.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Listen address used when the settings define no listeners.
    #[arg(short = 'l', long = "listen", default_value = "0.0.0.0:5353")]
    listen: String,
    /// Enable debug logging.
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut settings = match &args.config {
        Some(path) => config::load_settings(path).context("load settings")?,
        None => ProxySettings::default(),
    };
    if settings.listeners.is_empty() {
        settings.listeners = vec![ListenerSettings { address: args.listen.clone() }];
    }

    let mut proxy = DnsProxy::init(settings, DnsProxyEvents::default())
        .await
        .context("proxy init")?;

    info!("dns proxy started, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;

    info!("shutting down");
    proxy.deinit();
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
