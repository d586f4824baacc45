//! Network State Database CLI
//!
//! Starts an engine over the configured targets, prints one of its views
//! and exits, or follows a single object until interrupted.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - CM-8: System Component Inventory - Interface and address listings
//! - SI-4: System Monitoring - Live object watch

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use sonic_ndb::{Csv, Dump, Engine, Entity, Handle, Key, NdbConfig, Value, csv_line};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// How long a watch waits before re-checking the shutdown flag
const WATCH_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "ndb", version, about = "Network state database")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "/etc/sonic/ndb.toml")]
    config: PathBuf,

    /// Store location, overriding the configured one
    #[arg(long)]
    store_location: Option<String>,

    /// Record every applied message in the rtnl_log table
    #[arg(long)]
    verbose_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Curated overview of a table
    Summary { view: ViewName },
    /// Full rows of a table
    Dump {
        view: ViewName,
        /// Filter as field=value, repeatable
        #[arg(short, long = "match", value_parser = parse_match)]
        matches: Vec<(String, Value)>,
    },
    /// Full rows of a table as CSV
    Csv {
        view: ViewName,
        #[arg(short, long = "match", value_parser = parse_match)]
        matches: Vec<(String, Value)>,
    },
    /// Print an object every time it changes
    Watch { view: ViewName, key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ViewName {
    #[value(alias = "interface")]
    Interfaces,
    #[value(alias = "address")]
    Addresses,
    #[value(alias = "route")]
    Routes,
    #[value(alias = "neighbour")]
    Neighbours,
}

fn main() -> Result<()> {
    // NIST: AU-3, AU-12 - Audit logging setup
    init_logging()?;

    let cli = Cli::parse();
    let mut config = NdbConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(location) = cli.store_location.clone() {
        config.store.location = location;
    }
    config.verbose_protocol_log |= cli.verbose_log;

    let engine = Engine::new(config).context("starting engine")?;
    let outcome = run(&engine, cli.command);
    let closed = engine.close().context("closing engine");
    outcome.and(closed)
}

/// Initialize structured logging; `RUST_LOG` overrides the default level
fn init_logging() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set logger")
}

fn run(engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::Summary { view } => print_rows(&summary(engine, view)?),
        Command::Dump { view, matches } => print_rows(&dump(engine, view, matches)?),
        Command::Csv { view, matches } => {
            for line in csv(engine, view, matches)?.lines()? {
                println!("{}", line);
            }
            Ok(())
        }
        Command::Watch { view, key } => {
            let shutdown = setup_signal_handlers()?;
            match view {
                ViewName::Interfaces => watch(engine.interfaces().get(parse_key(&key))?, &shutdown),
                ViewName::Addresses => watch(engine.addresses().get(parse_key(&key))?, &shutdown),
                ViewName::Routes => watch(engine.routes().get(parse_key(&key))?, &shutdown),
                ViewName::Neighbours => watch(engine.neighbours().get(parse_key(&key))?, &shutdown),
            }
        }
    }
}

fn summary(engine: &Engine, view: ViewName) -> Result<Dump> {
    let dump = match view {
        ViewName::Interfaces => engine.interfaces().summary(),
        ViewName::Addresses => engine.addresses().summary(),
        ViewName::Routes => engine.routes().summary(),
        ViewName::Neighbours => engine.neighbours().summary(),
    };
    Ok(dump?)
}

fn dump(engine: &Engine, view: ViewName, matches: Vec<(String, Value)>) -> Result<Dump> {
    let dump = match view {
        ViewName::Interfaces => engine.interfaces().dump(matches),
        ViewName::Addresses => engine.addresses().dump(matches),
        ViewName::Routes => engine.routes().dump(matches),
        ViewName::Neighbours => engine.neighbours().dump(matches),
    };
    Ok(dump?)
}

fn csv(engine: &Engine, view: ViewName, matches: Vec<(String, Value)>) -> Result<Csv> {
    let csv = match view {
        ViewName::Interfaces => engine.interfaces().csv(matches),
        ViewName::Addresses => engine.addresses().csv(matches),
        ViewName::Routes => engine.routes().csv(matches),
        ViewName::Neighbours => engine.neighbours().csv(matches),
    };
    Ok(csv?)
}

fn print_rows(dump: &Dump) -> Result<()> {
    for row in dump.fetch()? {
        println!("{}", csv_line(&row).replace(',', "\t"));
    }
    Ok(())
}

fn watch<E: Entity>(handle: Handle<E>, shutdown: &AtomicBool) -> Result<()> {
    info!(key = ?handle.key(), "Watching");
    let mut seen = handle.version();
    print_snapshot(&handle);
    while !shutdown.load(Ordering::Relaxed) {
        let version = handle.wait_for_update(seen, WATCH_POLL);
        if version != seen {
            seen = version;
            print_snapshot(&handle);
        }
    }
    info!("Watch interrupted");
    Ok(())
}

fn print_snapshot<E: Entity>(handle: &Handle<E>) {
    match handle.snapshot() {
        Some(record) => match serde_json::to_string(&record) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!(error = %e, "Failed to render record"),
        },
        None => println!("null"),
    }
}

/// Flag raised on SIGINT; the watch loop polls it between waits
fn setup_signal_handlers() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;

    std::thread::Builder::new()
        .name("ndb-signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received SIGINT");
                    flag.store(true, Ordering::Relaxed);
                }
            })
        })
        .context("spawning signal thread")?;

    Ok(shutdown)
}

/// Numbers select by index, anything else is the entity's shorthand
fn parse_key(text: &str) -> Key {
    match text.parse::<i64>() {
        Ok(index) => Key::from(index),
        Err(_) => Key::from(text),
    }
}

fn parse_match(text: &str) -> Result<(String, Value)> {
    let Some((name, value)) = text.split_once('=') else {
        bail!("expected field=value, got {:?}", text);
    };
    if name.is_empty() {
        bail!("empty field name in {:?}", text);
    }
    let value = match value.parse::<i64>() {
        Ok(number) => Value::Integer(number),
        Err(_) => Value::from(value),
    };
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_match() {
        assert_eq!(
            parse_match("ifname=lo").unwrap(),
            ("ifname".to_string(), Value::from("lo"))
        );
        assert_eq!(
            parse_match("index=1").unwrap(),
            ("index".to_string(), Value::Integer(1))
        );
        assert!(parse_match("ifname").is_err());
        assert!(parse_match("=lo").is_err());
    }

    #[test]
    fn test_watch_accepts_singular_view() {
        let cli = Cli::try_parse_from(["ndb", "watch", "interface", "eth0"]).unwrap();
        match cli.command {
            Command::Watch { view, key } => {
                assert_eq!(view, ViewName::Interfaces);
                assert_eq!(key, "eth0");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_key() {
        assert!(matches!(parse_key("1"), Key::Index(1)));
        assert!(matches!(parse_key("lo"), Key::Name(_)));
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["ndb", "dump", "interfaces", "-m", "ifname=lo"]).unwrap();
        match cli.command {
            Command::Dump { view, matches } => {
                assert_eq!(view, ViewName::Interfaces);
                assert_eq!(matches.len(), 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
