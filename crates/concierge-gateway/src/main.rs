//! Concierge Gateway: loads configuration, the identity registry and the entity catalog,
//! then answers `<phone> <message>` lines read from stdin, one reply per line.
//!
//! Paths (environment, `.env` honoured):
//! - `CONCIERGE_CONFIG`   settings TOML (default `config/concierge.toml`, optional)
//! - `CONCIERGE_REGISTRY` identities TOML (default `config/identities.toml`)
//! - `CONCIERGE_CATALOG`  entity catalog TOML (default `config/catalog.toml`)
//! - `CONCIERGE_SNAPSHOT` metrics snapshot JSON (default `data/metrics.json`)
//! - `CONCIERGE_PROTECTED_TERMS` extra restricted terms, one per line (optional)
//! - `CONCIERGE_AUDIT_PATH` sled directory for a persistent audit log (optional)
//!
//! `--list-users` prints the registry and exits.

mod oracle;

use concierge_core::{
    Clock, Concierge, ConciergeConfig, ConciergeError, EntityTree, IdentityRegistry, MemoryMetricSource,
    Scope, SledAuditLog, SystemClock, TopicFilter,
};
use oracle::OpenRouterOracle;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

#[tokio::main]
async fn main() -> Result<(), ConciergeError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ConciergeConfig::load()?;
    let registry = Arc::new(IdentityRegistry::load_from_path(&env_path(
        "CONCIERGE_REGISTRY",
        "config/identities.toml",
    ))?);

    if std::env::args().skip(1).any(|a| a == "--list-users") {
        list_users(&registry);
        return Ok(());
    }

    let tree = Arc::new(EntityTree::load_from_path(&env_path("CONCIERGE_CATALOG", "config/catalog.toml"))?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::with_utc_offset_minutes(config.utc_offset_minutes));
    let snapshot = std::fs::read_to_string(env_path("CONCIERGE_SNAPSHOT", "data/metrics.json"))?;
    let source = MemoryMetricSource::from_json(&snapshot, clock.clone())?;

    let mut filter = TopicFilter::new();
    if let Ok(path) = std::env::var("CONCIERGE_PROTECTED_TERMS") {
        filter.merge_terms_from_path(&PathBuf::from(path))?;
    }

    let mut builder = Concierge::builder(registry.clone(), tree.clone())
        .config(config.clone())
        .clock(clock)
        .source(Arc::new(source))
        .topic_filter(filter);
    if let Ok(path) = std::env::var("CONCIERGE_AUDIT_PATH") {
        builder = builder.audit(Arc::new(SledAuditLog::open(Some(path))?));
    }
    match OpenRouterOracle::from_env(&config.oracle) {
        Some(oracle) => {
            tracing::info!(target: "concierge::router", "Using OpenRouter intent oracle");
            builder = builder.oracle(Arc::new(oracle));
        }
        None => tracing::info!(target: "concierge::router", "OPENROUTER_API_KEY not set; using keyword oracle"),
    }
    let concierge = Arc::new(builder.build()?);

    tracing::info!(
        target: "concierge::pipeline",
        version = concierge_core::version(),
        identities = registry.len(),
        entities = tree.len(),
        "Concierge ready"
    );

    let pruner = concierge.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            pruner.guard().prune_idle_sessions();
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        let Some((phone, text)) = split_message(&line) else {
            continue;
        };
        let reply = concierge.submit(phone, text).await;
        stdout.write_all(reply.as_bytes()).await?;
        stdout.write_all(b"\n\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// `<phone>|<text>` or `<phone> <text>`; the phone itself may not contain spaces
/// in the second form.
fn split_message(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (phone, text) = line
        .split_once('|')
        .or_else(|| line.split_once(char::is_whitespace))?;
    let (phone, text) = (phone.trim(), text.trim());
    (!phone.is_empty() && !text.is_empty()).then_some((phone, text))
}

fn list_users(registry: &IdentityRegistry) {
    println!("{} identities", registry.len());
    for identity in registry.list() {
        let scope = match &identity.scope {
            Scope::All => "*".to_string(),
            Scope::Entities(set) => set.iter().map(|e| e.as_str()).collect::<Vec<_>>().join(", "),
        };
        let permissions = identity
            .permissions
            .iter()
            .map(|p| format!("{p:?}").to_lowercase())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<16} {:<24} {:<6} [{}] scope: {}",
            identity.key,
            identity.name,
            identity.role.as_str(),
            permissions,
            scope
        );
    }
}
