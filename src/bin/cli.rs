//! mapkv CLI
//!
//! Inspect and edit a store file from the command line.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mapkv::{Config, Store, Value};
use tracing_subscriber::{fmt, EnvFilter};

/// mapkv CLI
#[derive(Parser, Debug)]
#[command(name = "mapkv-cli")]
#[command(about = "CLI for the mapkv memory-mapped key-value store")]
#[command(version)]
struct Args {
    /// Data file of the store
    #[arg(short, long)]
    path: PathBuf,

    /// Encryption key, if the store is encrypted
    #[arg(short, long)]
    key: Option<String>,

    /// Take the inter-process lock (other processes have the store open)
    #[arg(short, long)]
    multi_process: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key to a string value
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete one or more keys
    Del {
        /// The keys to delete
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// List all keys
    Keys,

    /// Rewrite the log without dead entries
    Compact,

    /// Print sizes and counters
    Stat,

    /// Shrink the data file to fit the log
    Trim,
}

fn main() -> ExitCode {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mapkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> mapkv::Result<()> {
    let mut builder = Config::builder().path(&args.path);
    if let Some(key) = args.key {
        builder = builder.encryption_key(key);
    }
    if args.multi_process {
        builder = builder.multi_process();
    }

    let store = Store::open(builder.build()?)?;

    match args.command {
        Commands::Get { key } => match store.get(&key)? {
            Some(value) => println!("{}", render(&value)),
            None => println!("(nil)"),
        },
        Commands::Set { key, value } => {
            store.set_string(&key, &value)?;
            println!("OK");
        }
        Commands::Del { keys } => {
            let removed = store.remove_many(&keys)?;
            println!("(integer) {}", removed);
        }
        Commands::Keys => {
            for key in store.all_keys()? {
                println!("{}", key);
            }
        }
        Commands::Compact => {
            let before = store.actual_size();
            store.compact()?;
            println!("{} -> {} bytes", before, store.actual_size());
        }
        Commands::Stat => {
            println!("path:         {}", store.path().display());
            println!("keys:         {}", store.count()?);
            println!("actual_size:  {}", store.actual_size());
            println!("total_size:   {}", store.total_size());
            println!("sequence_id:  {}", store.sequence_id());
            println!("encrypted:    {}", store.is_encrypted());
        }
        Commands::Trim => {
            store.trim()?;
            println!("total_size: {}", store.total_size());
        }
    }

    store.close()
}

fn render(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => format!("(integer) {}", i),
        Value::UInt(u) => format!("(integer) {}", u),
        Value::Float(f) => f.to_string(),
        Value::Double(d) => d.to_string(),
        Value::String(s) => format!("\"{}\"", s),
        Value::Bytes(b) => format!("(bytes) {:02x?}", b.as_ref()),
        Value::Nested(items) => {
            let parts: Vec<String> = items.iter().map(render).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}
