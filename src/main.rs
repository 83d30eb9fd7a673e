//! mqlink - MQTT client session inspector
//!
//! Restores the persisted ledger of one client and prints its queues.
//!
//! Usage:
//!   mqlink --client-id <ID> [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path
//!   -i, --client-id <ID>     Client identifier to inspect
//!   -d, --data-dir <DIR>     Persistence directory (overrides config)
//!   --clear                  Delete the client's persisted records
//!   -l, --log-level          Log level (error, warn, info, debug, trace)
//!   -h, --help               Print help

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mqlink::config::Config;
use mqlink::ledger::Message;
use mqlink::persistence::{FjallBackend, Persistence};
use mqlink::registry::SessionRegistry;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// mqlink - inspect persisted MQTT client sessions
#[derive(Parser, Debug)]
#[command(name = "mqlink")]
#[command(version)]
#[command(about = "Inspect the persisted message ledger of an MQTT client session")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Client identifier whose ledger is restored
    #[arg(short = 'i', long)]
    client_id: String,

    /// Persistence directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Delete the client's persisted records after printing them
    #[arg(long)]
    clear: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn print_queue(name: &str, messages: Vec<&Message>) {
    println!("{} ({}):", name, messages.len());
    for message in messages {
        println!(
            "  seq={:<6} id={:<5} qos={} stage={:?} sent={} bytes={} topic={}",
            message.seqno,
            message.msgid,
            message.qos as u8,
            message.next_expected,
            message.transmissions(),
            message.len,
            message.topic()
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::from_env()?,
    };

    // CLI overrides config, config overrides default (warn)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| file_config.persistence.path.clone());
    info!("Opening ledger store at {:?}", data_dir);
    let backend = FjallBackend::open(&data_dir)?;
    let persistence = Persistence::new(Arc::new(backend.store_for(&args.client_id)))
        .with_mandatory(file_config.persistence.mandatory);

    let mut options = file_config.session_options()?;
    // Inspection never discards what it restores
    options.clean_start = false;

    let now = Instant::now();
    let registry = SessionRegistry::new();
    let handle = registry.register(&args.client_id, options, persistence.clone(), now)?;
    registry.finish_recovery();

    {
        let session = handle.lock();
        let ledger = session.ledger();
        println!("client {} (next seq {})", session.client_id(), ledger.seqno() + 1);
        print_queue("outbound", ledger.outbound().collect());
        print_queue("inbound", ledger.inbound().collect());
        print_queue("pending", ledger.pending().collect());
    }

    if args.clear {
        persistence.clear()?;
        persistence.flush()?;
        info!("Cleared persisted records of {}", args.client_id);
    }
    backend.flush()?;

    Ok(())
}
