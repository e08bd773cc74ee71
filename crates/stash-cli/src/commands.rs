use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use colored::Colorize;
use serde_json::{json, Value};
use stash_adapter::{AdapterConfig, Item, PersistentAdapter};
use stash_store::{LogBackend, LogConfig, SyncMode};

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    std::fs::create_dir_all(&cli.dir)
        .with_context(|| format!("cannot create {}", cli.dir.display()))?;
    let log_config = LogConfig {
        sync_mode: if cli.sync {
            SyncMode::EveryWrite
        } else {
            SyncMode::OsDefault
        },
    };
    let backend = Arc::new(LogBackend::new(&cli.dir, log_config));
    tracing::debug!(dir = %cli.dir.display(), store = %config.name, "using log backend");

    if let Command::Compact = cli.command {
        return cmd_compact(&backend, &config.name).await;
    }

    let adapter = PersistentAdapter::open(backend, config)?;
    let format = cli.format;
    match cli.command {
        Command::Get(args) => cmd_get(&adapter, args, format).await,
        Command::Set(args) => cmd_set(&adapter, args).await,
        Command::Rm(args) => cmd_rm(&adapter, args).await,
        Command::List => cmd_list(&adapter, format).await,
        Command::Clear => {
            adapter.clear().await?;
            println!("{} Cleared {}", "✓".green().bold(), adapter.config().name.bold());
            Ok(())
        }
        Command::Sweep => cmd_sweep(&adapter, format).await,
        Command::Size => cmd_size(&adapter, format).await,
        Command::Compact => Ok(()),
    }
}

/// Defaults, then the config file, then command-line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<AdapterConfig> {
    let mut config = match &cli.config {
        Some(path) => AdapterConfig::load(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => AdapterConfig::default(),
    };
    if let Some(name) = &cli.name {
        config.name = name.clone();
    }
    if let Some(max_size) = cli.max_size {
        config.max_size = max_size;
    }
    if cli.verbose {
        config.debug_logging = true;
    }
    config.validate()?;
    Ok(config)
}

/// Values that are not valid JSON are stored as strings.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn cmd_get(adapter: &PersistentAdapter, args: KeyArgs, format: OutputFormat) -> anyhow::Result<()> {
    let value = adapter.get_item(&args.key).await?;
    match (format, value) {
        (OutputFormat::Json, value) => println!("{}", value.unwrap_or(Value::Null)),
        (OutputFormat::Text, Some(value)) => println!("{}", serde_json::to_string_pretty(&value)?),
        (OutputFormat::Text, None) => println!("{} {}", args.key.yellow(), "(not found)".dimmed()),
    }
    Ok(())
}

async fn cmd_set(adapter: &PersistentAdapter, args: SetArgs) -> anyhow::Result<()> {
    let mut item = Item::new(parse_value(&args.value));
    if let Some(ttl) = args.ttl {
        item = item.expires_in(Duration::from_secs(ttl));
    }
    adapter.set_item(&args.key, item).await?;
    println!("{} Stored {}", "✓".green().bold(), args.key.yellow());
    Ok(())
}

async fn cmd_rm(adapter: &PersistentAdapter, args: KeyArgs) -> anyhow::Result<()> {
    adapter.remove_item(&args.key).await?;
    println!("{} Removed {}", "✓".green().bold(), args.key.yellow());
    Ok(())
}

async fn cmd_list(adapter: &PersistentAdapter, format: OutputFormat) -> anyhow::Result<()> {
    let items = adapter.get_all().await?;
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("No entries.");
        return Ok(());
    }
    for item in &items {
        println!(
            "{}  {}  {}",
            item.key.yellow().bold(),
            item.expires.to_rfc3339().dimmed(),
            item.value
        );
    }
    println!("{} entries", items.len().to_string().bold());
    Ok(())
}

async fn cmd_sweep(adapter: &PersistentAdapter, format: OutputFormat) -> anyhow::Result<()> {
    let report = adapter.sweep().await?;
    if format == OutputFormat::Json {
        let out = json!({
            "skipped": report.skipped,
            "passes": report.passes,
            "removed": report.removed,
            "removed_size": report.removed_size,
            "retained": report.retained,
            "retained_size": report.retained_size,
        });
        println!("{out}");
    } else if report.skipped {
        println!("Sweep skipped: last sweep was recent and the store is under capacity.");
    } else {
        println!(
            "{} Sweep: {} removed ({} bytes), {} retained ({} bytes)",
            "✓".green().bold(),
            report.removed.to_string().bold(),
            report.removed_size,
            report.retained.to_string().bold(),
            report.retained_size
        );
    }
    Ok(())
}

async fn cmd_size(adapter: &PersistentAdapter, format: OutputFormat) -> anyhow::Result<()> {
    let size = adapter.get_size().await?;
    let stats = adapter.size_stats();
    let limits = adapter.thresholds();
    if format == OutputFormat::Json {
        let out = json!({
            "size": size,
            "error_bar": stats.error_bar,
            "age": stats.age,
            "avg_entry_size": stats.avg_entry_size,
            "max_size": limits.max_size,
            "sweep_high": limits.sweep_high,
            "sweep_low": limits.sweep_low,
            "item_limit": limits.item,
            "mistake": stats.mistakes.mean(),
            "mistake_max": stats.mistakes.max,
            "outside_error_bar": stats.mistakes.outside_error_bar,
        });
        println!("{out}");
        return Ok(());
    }
    let usage = if size > limits.sweep_high {
        format!("{size}").red()
    } else {
        format!("{size}").green()
    };
    println!("Size: {} / {} bytes (±{})", usage, limits.max_size, stats.error_bar);
    println!("  Sweep marks: {} low, {} high", limits.sweep_low, limits.sweep_high);
    println!("  Item limit: {}", limits.item);
    println!("  Average entry: {:.1}", stats.avg_entry_size);
    Ok(())
}

async fn cmd_compact(backend: &LogBackend, name: &str) -> anyhow::Result<()> {
    let db = backend.open_log(name).await?;
    let reclaimed = tokio::task::spawn_blocking(move || db.compact()).await??;
    println!("{} Compacted {}: {} bytes reclaimed", "✓".green().bold(), name.bold(), reclaimed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(dir: &std::path::Path, args: &[&str]) -> Cli {
        let mut argv = vec!["stash", "--dir", dir.to_str().unwrap()];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn overrides_apply_on_top_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stash.toml");
        std::fs::write(&path, "name = \"from-file\"\nmax_size = 100\n").unwrap();

        let parsed = cli(dir.path(), &["--config", path.to_str().unwrap(), "size"]);
        let config = load_config(&parsed).unwrap();
        assert_eq!(config.name, "from-file");
        assert_eq!(config.max_size, 100);

        let parsed = cli(
            dir.path(),
            &["--config", path.to_str().unwrap(), "--max-size", "500", "-v", "size"],
        );
        let config = load_config(&parsed).unwrap();
        assert_eq!(config.max_size, 500);
        assert!(config.debug_logging);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(&cli(dir.path(), &["--max-size", "0", "size"])).is_err());
    }

    #[test]
    fn values_fall_back_to_strings() {
        assert_eq!(parse_value("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("hello world"), json!("hello world"));
    }

    #[tokio::test]
    async fn commands_share_the_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        dispatch(cli(dir.path(), &["set", "k", "[1,2]"])).await.unwrap();
        dispatch(cli(dir.path(), &["set", "tmp", "x"])).await.unwrap();
        dispatch(cli(dir.path(), &["rm", "tmp"])).await.unwrap();
        dispatch(cli(dir.path(), &["compact"])).await.unwrap();

        let backend = Arc::new(LogBackend::new(dir.path(), LogConfig::default()));
        let adapter = PersistentAdapter::open(backend, AdapterConfig::default()).unwrap();
        assert_eq!(adapter.get_item("k").await.unwrap(), Some(json!([1, 2])));
        assert_eq!(adapter.get_item("tmp").await.unwrap(), None);
    }
}
