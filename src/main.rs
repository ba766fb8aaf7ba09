use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use receipt_cache::cache::{
  CacheInvalidation, CacheManager, KeyParams, Namespace, NoopStore, PersistentStore, SqliteStore,
  Trigger,
};
use receipt_cache::config::{Config, LoggingConfig};

#[derive(Parser, Debug)]
#[command(name = "receipt-cache")]
#[command(about = "Inspect and maintain the on-device receipts cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/receipt-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// SQLite file to operate on, overriding the config
  #[arg(short, long)]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List cached entries
  List {
    #[arg(short, long)]
    namespace: Option<Namespace>,
  },
  /// Show one entry with its metadata
  Inspect { namespace: Namespace, key: String },
  /// Drop every entry in a namespace
  Clear { namespace: Namespace },
  /// Drop every entry
  ClearAll,
  /// Remove expired entries
  Prune,
  /// Apply the invalidation rules for a domain event
  Invalidate {
    trigger: Trigger,
    /// Subject (user) id for per-user keys
    #[arg(short, long)]
    subject: Option<String>,
    /// Extra key parameter, e.g. `record=r42`
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
  },
}

fn parse_param(s: &str) -> Result<(String, String), String> {
  s.split_once('=')
    .filter(|(k, _)| !k.is_empty())
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  // RUST_LOG wins over the configured filter
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&logging.filter))
    .map_err(|e| eyre!("Invalid log filter '{}': {}", logging.filter, e))?;

  if logging.file {
    let dir = dirs::data_dir()
      .ok_or_else(|| eyre!("Could not determine data directory"))?
      .join("receipt-cache")
      .join("logs");
    let appender = tracing_appender::rolling::daily(dir, "receipt-cache.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().with_ansi(false).with_writer(writer))
      .try_init()
      .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
    return Ok(Some(guard));
  }

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
  Ok(None)
}

fn open_cache(config: &Config, database: Option<PathBuf>) -> Result<CacheManager> {
  let store: Arc<dyn PersistentStore> = if config.cache.persist || database.is_some() {
    let path = match database {
      Some(path) => path,
      None => config.database_path()?,
    };
    tracing::debug!(path = %path.display(), "opening cache database");
    Arc::new(SqliteStore::open(&path)?)
  } else {
    Arc::new(NoopStore)
  };
  Ok(CacheManager::new(store, config.memory_limits()))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(&config.logging)?;

  let cache = open_cache(&config, args.database)?;

  match args.command {
    Command::List { namespace } => {
      let entries = cache.entries(namespace).await?;
      let now = cache.now();
      for entry in &entries {
        match entry.meta {
          Some(meta) => println!(
            "{:<40} {:>8} B  {:<8}  expires {}{}",
            entry.key.to_string(),
            meta.size_bytes,
            format!("{:?}", meta.priority).to_lowercase(),
            meta.expires_at().format("%Y-%m-%d %H:%M"),
            if meta.is_valid_at(now) { "" } else { " (expired)" },
          ),
          None => println!("{:<40} (unreadable)", entry.key.to_string()),
        }
      }
      println!("{} entries", entries.len());
    }
    Command::Inspect { namespace, key } => {
      let lookup = cache
        .lookup::<serde_json::Value>(&key, namespace)
        .await
        .ok_or_else(|| eyre!("No cached entry {}:{}", namespace, key))?;
      println!("key:      {}:{}", namespace, key);
      println!("created:  {}", lookup.meta.created_at);
      println!("expires:  {}", lookup.meta.expires_at());
      println!("priority: {:?}", lookup.meta.priority);
      println!("size:     {} B", lookup.meta.size_bytes);
      println!("valid:    {}", lookup.is_valid);
      println!("{}", serde_json::to_string_pretty(&lookup.value)?);
    }
    Command::Clear { namespace } => {
      cache.clear_namespace(namespace).await?;
      println!("Cleared {}", namespace);
    }
    Command::ClearAll => {
      cache.clear_all().await?;
      println!("Cleared all namespaces");
    }
    Command::Prune => {
      let report = cache.cleanup_expired().await?;
      println!("Removed {} expired entries", report.persisted);
    }
    Command::Invalidate {
      trigger,
      subject,
      params,
    } => {
      let mut key_params = subject.map(KeyParams::subject).unwrap_or_default();
      for (name, value) in params {
        key_params = key_params.with(name, value);
      }

      let invalidation = CacheInvalidation::new(cache);
      let report = invalidation.invalidate(trigger, &key_params).await;
      println!(
        "{}: {} applied, {} failed",
        trigger, report.applied, report.failed
      );
      if report.failed > 0 {
        return Err(eyre!("{} invalidation rules failed, see log", report.failed));
      }
    }
  }

  Ok(())
}
