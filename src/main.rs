use anyhow::Context;
use capacity_check::{
    units::parse_size, CancelToken, CleanupOutcome, Engine, ReportEvent, Run, RunConfig,
    RunStatus, DEFAULT_BLOCK_SIZE,
};
use clap::Parser;
use indicatif::{HumanBytes, ProgressStyle};
use std::path::PathBuf;
use tracing::{error, info, info_span, warn};
use tracing_indicatif::{span_ext::IndicatifSpanExt, IndicatifLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[macro_use]
extern crate lazy_static;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory on the medium to test.
    ///
    /// A hidden scratch directory is created inside it and removed again
    /// when the test ends.
    target: PathBuf,

    /// Size of each test block (e.g. 100MiB, 4G, 65536).
    #[clap(long, value_parser = parse_size, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u64,

    /// Stop after writing this much (e.g. 8G). Without it, writes until the medium is full.
    #[clap(long, value_parser = parse_size)]
    limit: Option<u64>,

    /// Leave the block files on disk after the test, for inspection.
    #[clap(long)]
    keep_files: bool,

    /// Seed for the random block contents, to reproduce a previous run's data.
    #[clap(long)]
    seed: Option<u64>,

    /// Print every engine event as a log line instead of only showing progress.
    #[clap(long)]
    log_events: bool,
}

fn main() -> anyhow::Result<()> {
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();
    let args = Args::parse();

    let mut config = RunConfig::new(&args.target)
        .block_size(args.block_size)
        .max_total_bytes(args.limit);
    if args.keep_files {
        config = config.keep_files();
    }
    if let Some(seed) = args.seed {
        config = config.seed(seed);
    }

    let cancel = CancelToken::new();
    ctrlc::set_handler({
        let cancel = cancel.clone();
        move || {
            warn!("Interrupted; stopping after the current block");
            cancel.cancel();
        }
    })
    .context("Installing the Ctrl-C handler")?;

    let run = Run::prepare(&config).context("Preparing the capacity test")?;
    let expected = run.budget().total_bytes(run.block_size());
    info!(
        path = ?run.location(),
        block_size = %HumanBytes(args.block_size),
        limit = ?expected,
        "Starting test"
    );

    let (handle, events) = Engine::new()
        .stream(run, cancel)
        .context("Starting the capacity test")?;

    let bar_span = info_span!("writing");
    match expected {
        Some(total) => {
            bar_span.pb_set_style(&PROGRESS_STYLE);
            bar_span.pb_set_length(total);
        }
        None => bar_span.pb_set_style(&UNBOUNDED_STYLE),
    }
    let bar_span_handle = bar_span.enter();

    for event in events {
        if args.log_events {
            info!("{event}");
        }
        match event {
            ReportEvent::BlockWritten { size, .. } => bar_span.pb_inc(size),
            ReportEvent::WriteFailed { index, cause } => {
                warn!(index, %cause, "Write failed; treating this as the capacity limit")
            }
            ReportEvent::Warning(message) => warn!("{message}"),
            ReportEvent::Info(_) | ReportEvent::Finished(_) => {}
        }
    }
    drop(bar_span_handle);

    let summary = handle.join().context("Waiting for the capacity test")?;
    match summary.status {
        RunStatus::Cancelled => warn!("Test cancelled; {summary}"),
        _ => info!("{summary}"),
    }
    if let CleanupOutcome::Failed(reason) = &summary.cleanup {
        error!(scratch_dir = ?summary.scratch_dir, %reason, "Test files were not fully removed");
    }
    if let Some(limit) = expected {
        if summary.status == RunStatus::CompletedWriteFailed && summary.bytes_written < limit {
            error!(
                written = %HumanBytes(summary.bytes_written),
                requested = %HumanBytes(limit),
                "The medium stopped accepting data before the requested amount"
            );
        }
    }
    Ok(())
}

lazy_static! {
    pub(crate) static ref PROGRESS_STYLE: ProgressStyle = ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.white/grey} {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta_precise}) {msg}",
    ).expect("Internal error in indicatif progress bar template syntax");
    pub(crate) static ref UNBOUNDED_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{spinner} [{elapsed_precise}] {bytes} written ({bytes_per_sec}) {msg}",
    ).expect("Internal error in indicatif progress bar template syntax");
}
