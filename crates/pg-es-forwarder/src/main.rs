//! pg-es-forwarder CLI

use clap::Parser;
use pg_es_core::prelude::*;
use pg_es_core::LogFormat;
use pg_es_forwarder::{
    EnrichmentResolver, Forwarder, ForwarderOptions, HttpIndexWriter, HttpIndexWriterConfig,
    RoutingTable,
};
use pg_notify_source::{PgNotifySource, PgNotifySourceConfig};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "pg-es-forwarder")]
#[command(about = "Forwards PostgreSQL NOTIFY change events into Elasticsearch")]
#[command(version)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, short, env = "PG_ES_CONFIG")]
    config: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Source
    // ─────────────────────────────────────────────────────────────────────────
    /// PostgreSQL connection string
    #[arg(long, env = "PG_ES_DATABASE_URL")]
    database_url: Option<String>,

    /// Notification channel to LISTEN on
    #[arg(long, env = "PG_ES_CHANNEL")]
    channel: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Index
    // ─────────────────────────────────────────────────────────────────────────
    /// Elasticsearch base URL
    #[arg(long, env = "PG_ES_INDEX_URL")]
    index_url: Option<String>,

    /// Path between base URL and document key; `{table}` is substituted
    #[arg(long, env = "PG_ES_INDEX_PATH")]
    index_path: Option<String>,

    /// Stop on transport failures instead of dropping the event
    #[arg(long, env = "PG_ES_FAIL_FAST")]
    fail_fast: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Enrichment
    // ─────────────────────────────────────────────────────────────────────────
    /// Routing file; enables enrichment
    #[arg(long, env = "PG_ES_ROUTES")]
    routes: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────
    #[arg(long, env = "PG_ES_LOG_LEVEL")]
    log_level: Option<String>,

    /// "json" or "pretty"
    #[arg(long, env = "PG_ES_LOG_FORMAT")]
    log_format: Option<String>,
}

impl Args {
    fn apply(self, config: &mut ForwarderConfig) -> anyhow::Result<()> {
        if let Some(url) = self.database_url {
            config.listener.database_url = url;
        }
        if let Some(channel) = self.channel {
            config.listener.channel = channel;
        }
        if let Some(url) = self.index_url {
            config.index.base_url = url;
        }
        if let Some(path) = self.index_path {
            config.index.path_template = path;
        }
        if self.fail_fast {
            config.failure_mode = FailureMode::FailFast;
        }
        if let Some(routes) = self.routes {
            config.enrichment.enabled = true;
            config.enrichment.routes_path = Some(routes);
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.observability.log_format = match format.as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => anyhow::bail!("unknown log format '{}'", other),
            };
        }
        Ok(())
    }
}

fn init_tracing(config: &ForwarderConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let format = config.observability.log_format;

    tracing_subscriber::registry()
        .with((format == LogFormat::Json).then(|| fmt::layer().json()))
        .with((format == LogFormat::Pretty).then(|| fmt::layer().pretty()))
        .with(filter)
        .init();
}

#[cfg(unix)]
fn reload_on_hangup(routes: Arc<RoutingTable>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading routing table");
            // Failure is logged by reload and the previous table stays active
            let _ = routes.reload().await;
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn reload_on_hangup(_routes: Arc<RoutingTable>) -> anyhow::Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ForwarderConfig::load(args.config.as_deref())?;
    args.apply(&mut config)?;
    config.validate()?;

    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        channel = %config.listener.channel,
        index = %config.index.base_url,
        enrichment = config.enrichment.enabled,
        failure_mode = ?config.failure_mode,
        "Starting pg-es-forwarder"
    );

    let source = PgNotifySource::new(PgNotifySourceConfig::from(&config.listener));

    let writer = HttpIndexWriter::new(HttpIndexWriterConfig::from_index(
        &config.index,
        config.failure_mode,
    ))?;
    if let Err(e) = writer.health_check().await {
        warn!(error = %e, "Index store not reachable yet");
    }

    let mut forwarder = Forwarder::new(source, writer, ForwarderOptions::from(&config));

    if let (true, Some(path)) = (config.enrichment.enabled, &config.enrichment.routes_path) {
        let routes = Arc::new(RoutingTable::load(path)?);
        reload_on_hangup(routes.clone())?;
        let resolver = EnrichmentResolver::from_config(routes, &config.enrichment)?;
        forwarder = forwarder.with_enricher(Arc::new(resolver));
    }

    if let Err(e) = forwarder.run().await {
        error!(error = %e, kind = e.kind(), "Forwarder failed");
        return Err(e.into());
    }

    info!("Forwarder stopped gracefully");
    Ok(())
}
