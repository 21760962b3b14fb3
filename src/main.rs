#![warn(clippy::all)]

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::info;

use splitroute_proxy::config::Config;
use splitroute_proxy::proxy::ProxyServer;
use splitroute_proxy::refresher::{HttpSource, ListRefresher, RefreshSettings};
use splitroute_proxy::router::Router;
use splitroute_proxy::rules::RuleStore;
use splitroute_proxy::stats::Stats;
use splitroute_proxy::tunnel::BufferPool;

const LISTEN_BACKLOG: i32 = 1024;

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    /// YAML config file; missing is fine
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Proxy listen address
    #[arg(long)]
    listen: Option<String>,

    /// Upstream SOCKS5 proxy address
    #[arg(long)]
    socks5: Option<String>,

    /// Blocklist update frequency in hours
    #[arg(long = "update-hours")]
    update_hours: Option<u64>,

    #[arg(long)]
    blocklist_url: Option<String>,

    #[arg(long)]
    blocklist_cache: Option<PathBuf>,

    #[arg(long)]
    custom_domains: Option<PathBuf>,

    #[arg(long)]
    stats_interval: Option<u64>,

    /// Outbound connect timeout in seconds
    #[arg(long = "timeout-connect")]
    timeout_connect: Option<u64>,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(self, mut config: Config) -> Config {
        if let Some(v) = self.listen {
            config.listen_addr = v;
        }
        if let Some(v) = self.socks5 {
            config.socks5_addr = v;
        }
        if let Some(v) = self.update_hours {
            config.update_frequency_hours = v;
        }
        if let Some(v) = self.blocklist_url {
            config.blocklist_url = v;
        }
        if let Some(v) = self.blocklist_cache {
            config.blocklist_cache = v;
        }
        if let Some(v) = self.custom_domains {
            config.custom_domains = v;
        }
        if let Some(v) = self.stats_interval {
            config.stats_interval = v;
        }
        if let Some(v) = self.timeout_connect {
            config.connect_timeout = v;
        }
        config
    }
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let config = Config::load(&args.config)?;
    let config = args.apply(config);
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let rules = Arc::new(RuleStore::new());
    let router = Arc::new(
        Router::new(rules.clone(), &config.socks5_addr, config.connect_timeout())
            .context("Failed to set up outbound paths")?,
    );

    let source = HttpSource::new(router.proxied().http_client().clone(), config.blocklist_url.clone());
    let refresher = Arc::new(ListRefresher::new(
        rules,
        source,
        RefreshSettings {
            cache_path: config.blocklist_cache.clone(),
            custom_path: config.custom_domains.clone(),
            interval: config.refresh_interval(),
        },
    ));
    let _refresh_task = refresher.spawn();

    let stats = Arc::new(Stats::new());

    if config.stats_interval > 0 {
        let stats_clone = stats.clone();
        let interval = config.stats_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval));
            loop {
                timer.tick().await;
                stats_clone.print();
            }
        });
    }

    let listener = bind_listener(&config)?;
    let pool = Arc::new(BufferPool::new(config.buffer_size));

    info!("🚀 Proxy listening on http://{}", listener.local_addr()?);
    info!("🧦 Using SOCKS5 proxy: {}", config.socks5_addr);
    info!(
        "🔄 Blocklist refresh every {}h from {}",
        config.update_frequency_hours, config.blocklist_url
    );

    ProxyServer::new(router, pool, stats).serve(listener).await;
    Ok(())
}

fn bind_listener(config: &Config) -> anyhow::Result<TcpListener> {
    let addr = config.listen_socket_addr()?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    match socket.bind(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            anyhow::bail!("Port {} already in use, pick another with --listen", addr.port());
        }
        Err(e) => return Err(e).with_context(|| format!("Bind to {} failed", addr)),
    }

    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}
