use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use scard_core::{ChannelSink, Config, Event, EventSink, NullSink, Smartcard};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Smartcard reader tool", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// NXP serial device, overrides the configuration
    #[arg(long)]
    device: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the type of the inserted card
    Type,
    /// Read eGK data and print it as key=value lines
    Info,
    /// Send an APDU (hex) and print the response
    Apdu { hex: String },
    /// Hex dump card data
    Read {
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 16)]
        len: usize,
    },
    /// Print card events
    Watch {
        /// Stop after this many seconds; runs until killed otherwise
        #[arg(long)]
        seconds: Option<u64>,
    },
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(device) = &args.device {
        config.smartcard.get_or_insert_with(Default::default).device = Some(device.clone());
    }
    Ok(config)
}

fn open(config: &Config, sink: Arc<dyn EventSink>) -> Result<Smartcard> {
    let card = Smartcard::create(config, sink).context("no smartcard reader found")?;
    info!(backend = card.backend_name().unwrap_or("none"), "Reader opened");
    Ok(card)
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    match args.command {
        Command::Type => {
            let card = open(&config, Arc::new(NullSink))?;
            println!("{}", card.card_type()?);
        }
        Command::Info => {
            let card = open(&config, Arc::new(NullSink))?;
            let record = card.read_info().context("reading card data")?;
            for (key, value) in record.iter() {
                println!("{key}={}", value.unwrap_or(""));
            }
        }
        Command::Apdu { hex } => {
            let apdu = hex::decode(hex.replace([' ', ':'], "")).context("APDU is not hex")?;
            if apdu.is_empty() {
                bail!("empty APDU");
            }
            let card = open(&config, Arc::new(NullSink))?;
            card.write(0, &apdu)?;
            let response = card.read(0, 0x1000)?;
            println!("{}", hex::encode_upper(response));
        }
        Command::Read { offset, len } => {
            let card = open(&config, Arc::new(NullSink))?;
            let data = card.read(offset, len)?;
            for (i, line) in data.chunks(16).enumerate() {
                println!("{:04X}: {}", offset + i * 16, hex::encode_upper(line));
            }
        }
        Command::Watch { seconds } => {
            let (tx, rx) = mpsc::channel();
            let _card = open(&config, Arc::new(ChannelSink::new(tx)))?;
            let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
            loop {
                let wait = match deadline {
                    Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                    None => Duration::from_secs(3600),
                };
                if wait.is_zero() {
                    break;
                }
                match rx.recv_timeout(wait) {
                    Ok(Event::Smartcard(state)) => println!("smartcard {state}"),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
