//! DLT Commands

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::output::{print_info, print_list, print_success, OutputFormat, TableDisplay};
use itf_dlt::codec::read_file;
use itf_dlt::{CaptureConfig, DltFrame, DltWindow, Query, Receiver};
use itf_harness::RunConfig;

#[derive(Subcommand)]
pub enum DltCommands {
    /// Capture live DLT traffic and print what matched
    Capture(CaptureArgs),

    /// Decode a DLT file
    Parse {
        /// File in DLT storage format
        file: PathBuf,

        /// Query term, `field=value` or `field~regex` (repeatable)
        #[arg(short, long)]
        query: Vec<String>,

        /// Print at most this many frames
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Args)]
pub struct CaptureArgs {
    /// Receive UDP on this local address
    #[arg(long, conflicts_with = "tcp")]
    udp: Option<SocketAddr>,

    /// Connect to a DLT daemon over TCP
    #[arg(long)]
    tcp: Option<SocketAddr>,

    /// Multicast group to join (repeatable)
    #[arg(long)]
    multicast: Vec<Ipv4Addr>,

    /// Receive through an external program such as dlt-receive
    #[arg(long)]
    receiver: Option<PathBuf>,

    /// Capture filter, `APID[:CTID],...`
    #[arg(long)]
    filter: Option<String>,

    /// Query term, `field=value` or `field~regex` (repeatable)
    #[arg(short, long)]
    query: Vec<String>,

    /// Stop after this many seconds
    #[arg(long, default_value_t = 10)]
    duration: u64,

    /// Stop as soon as this many frames matched the query
    #[arg(long)]
    count: Option<usize>,
}

/// Frame display wrapper for serialization
#[derive(Serialize)]
pub struct FrameDisplay {
    pub counter: u8,
    pub time: Option<String>,
    pub timestamp: Option<f64>,
    pub ecu: String,
    pub apid: String,
    pub ctid: String,
    pub kind: String,
    pub payload: String,
}

impl From<&DltFrame> for FrameDisplay {
    fn from(frame: &DltFrame) -> Self {
        let kind = match (frame.message_type(), frame.subtype()) {
            (Some(kind), Some(subtype)) => match kind.subtype_name(subtype) {
                Some(name) => format!("{} {}", kind, name),
                None => kind.to_string(),
            },
            _ => "-".to_string(),
        };
        Self {
            counter: frame.counter(),
            time: frame
                .storage_header()
                .and_then(|h| h.time())
                .map(|t| t.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
            timestamp: frame.timestamp_secs(),
            ecu: frame.ecu().to_string(),
            apid: frame.apid().to_string(),
            ctid: frame.ctid().to_string(),
            kind,
            payload: frame.text().into_owned(),
        }
    }
}

impl TableDisplay for FrameDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["#", "Time", "ECU", "APID", "CTID", "Type", "Payload"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.counter.to_string(),
            self.time
                .clone()
                .or_else(|| self.timestamp.map(|t| format!("{:.4}", t)))
                .unwrap_or_else(|| "-".to_string()),
            self.ecu.clone(),
            self.apid.clone(),
            self.ctid.clone(),
            self.kind.clone(),
            self.payload.clone(),
        ]
    }
}

pub async fn execute(cmd: DltCommands, config_path: &Path, format: OutputFormat) -> Result<()> {
    match cmd {
        DltCommands::Capture(args) => capture(args, config_path, format).await,
        DltCommands::Parse { file, query, limit } => {
            let query = Query::parse_terms(&query)?;
            let frames = read_file(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let total = frames.len();
            let shown: Vec<FrameDisplay> = frames
                .iter()
                .filter(|f| query.matches(f))
                .take(limit.unwrap_or(usize::MAX))
                .map(FrameDisplay::from)
                .collect();

            print_list(&shown, format);
            if matches!(format, OutputFormat::Table) {
                print_info(&format!("{} of {} frame(s) shown", shown.len(), total));
            }
            Ok(())
        }
    }
}

fn capture_config(args: &CaptureArgs, config_path: &Path) -> Result<CaptureConfig> {
    let mut config = match (args.udp, args.tcp) {
        (Some(addr), _) => CaptureConfig::udp(addr.ip(), addr.port()),
        (None, Some(addr)) => CaptureConfig::tcp(addr),
        (None, None) => match RunConfig::load(config_path)?.dlt {
            Some(dlt) => dlt.capture_config(),
            None => bail!(
                "no --udp/--tcp given and no [dlt] section in {}",
                config_path.display()
            ),
        },
    };

    for group in &args.multicast {
        config = config.with_multicast(*group);
    }
    if let Some(filter) = &args.filter {
        config = config.with_filter(filter.as_str());
    }
    if let Some(binary) = &args.receiver {
        config = config.with_receiver(Receiver::Process {
            binary: binary.clone(),
            args: None,
        });
    }
    config.validate()?;
    Ok(config)
}

async fn capture(args: CaptureArgs, config_path: &Path, format: OutputFormat) -> Result<()> {
    let config = capture_config(&args, config_path)?;
    let query = Query::parse_terms(&args.query)?;
    let duration = Duration::from_secs(args.duration);

    let window = DltWindow::open(&config).await?;
    match window.local_addr() {
        Some(addr) => info!("Capturing DLT on {} for up to {:?}", addr, duration),
        None => info!("Capturing DLT for up to {:?}", duration),
    }

    let record = window.record();
    let waiting = async {
        match args.count {
            Some(count) => record.wait_for(&query, count, duration).await.map(|_| ()),
            None => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    };

    let outcome = tokio::select! {
        outcome = waiting => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    let record: Arc<_> = window.close().await?;
    let frames: Vec<FrameDisplay> = record
        .find(Some(&query))
        .iter()
        .map(|f| FrameDisplay::from(f.as_ref()))
        .collect();
    print_list(&frames, format);

    match outcome {
        Ok(()) => {
            if matches!(format, OutputFormat::Table) {
                print_success(&format!(
                    "{} frame(s) captured, {} matched",
                    record.len(),
                    frames.len()
                ));
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
