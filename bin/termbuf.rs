use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use termbuf::{
    BufferConfig, BufferError, DirectorySink, EntryBuffer, FjallCrawlState, FlushProfile,
    PageRef, PageStatus, TermPageEntry,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "termbuf")]
#[command(about = "Buffer term occurrences and flush them to an index spool", long_about = None)]
struct Args {
    /// Input file with one occurrence per line, or '-' for stdin
    #[arg(default_value = "-")]
    input: String,

    /// Flush profile (small, balanced, large, disabled)
    #[arg(long, env = "TERMBUF_PROFILE", default_value = "balanced")]
    profile: String,

    /// Flush threshold in bytes, overrides the profile
    #[arg(long, env = "TERMBUF_CAPACITY")]
    capacity: Option<usize>,

    /// Directory receiving flushed batches
    #[arg(long, env = "TERMBUF_SPOOL_DIR", default_value = "./spool")]
    spool_dir: PathBuf,

    /// Crawl-state database directory
    #[arg(long, env = "TERMBUF_STATE_DIR", default_value = "./crawl-state")]
    state_dir: PathBuf,

    /// Where undelivered entries are kept across restarts
    #[arg(long, env = "TERMBUF_RECOVERY_FILE", default_value = termbuf::persistence::RECOVERY_FILE_NAME)]
    recovery_file: PathBuf,

    /// Relevance assigned to every occurrence read from the input
    #[arg(long, env = "TERMBUF_RELEVANCE", default_value = "1.0")]
    relevance: f32,

    /// Flush whatever is left before shutting down
    #[arg(long, env = "TERMBUF_DRAIN")]
    drain: bool,

    /// How long to wait for an in-flight flush, in seconds
    #[arg(long, env = "TERMBUF_FLUSH_TIMEOUT", default_value = "60")]
    flush_timeout: u64,
}

/// One parsed input line
enum Line {
    Occurrence {
        subject: String,
        target: String,
        offset: u32,
        fragment: Option<String>,
    },
    Title {
        target: String,
        subject: String,
        title: String,
    },
}

fn parse_line(line: &str) -> Result<Option<Line>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split('\t').collect();

    if fields[0] == "#title" {
        if fields.len() != 4 {
            bail!("expected #title<TAB>target<TAB>subject<TAB>title");
        }
        return Ok(Some(Line::Title {
            target: fields[1].to_string(),
            subject: fields[2].to_string(),
            title: fields[3].to_string(),
        }));
    }

    if !(3..=4).contains(&fields.len()) {
        bail!("expected subject<TAB>target<TAB>offset[<TAB>fragment]");
    }
    let offset = fields[2]
        .trim()
        .parse()
        .with_context(|| format!("bad offset '{}'", fields[2]))?;
    Ok(Some(Line::Occurrence {
        subject: fields[0].to_string(),
        target: fields[1].to_string(),
        offset,
        fragment: fields.get(3).map(|f| f.to_string()),
    }))
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    info!("Starting termbuf v{}", termbuf::VERSION);

    let mut config = BufferConfig::default().with_recovery_path(args.recovery_file.clone());
    match FlushProfile::parse(&args.profile) {
        Some(profile) => profile.apply_to(&mut config),
        None => warn!("Unknown profile '{}', using 'balanced'", args.profile),
    }
    if let Some(capacity) = args.capacity {
        config = config.with_capacity(capacity);
    }
    info!("Buffer configuration: {}", serde_json::to_string(&config)?);

    let sink = Arc::new(DirectorySink::open(&args.spool_dir)?);
    info!("Spooling batches to {:?}", sink.dir());

    let crawl_state = Arc::new(FjallCrawlState::open(args.state_dir.clone())?);
    info!("Crawl state opened at {:?}", crawl_state.base_dir());

    let buffer = EntryBuffer::new(config, sink, crawl_state.clone())?;
    buffer.start()?;

    let reader: Box<dyn BufRead> = if args.input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&args.input).with_context(|| format!("opening {}", args.input))?;
        Box::new(BufReader::new(file))
    };

    let mut accepted = 0usize;
    let mut skipped = 0usize;
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let parsed = match parse_line(&line) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(e) => {
                warn!("Skipping line {}: {}", number + 1, e);
                skipped += 1;
                continue;
            }
        };

        let result = match parsed {
            Line::Occurrence {
                subject,
                target,
                offset,
                fragment,
            } => PageRef::parse(&target).and_then(|page| {
                crawl_state.set_status(&page, PageStatus::NotPushed)?;
                buffer
                    .record_occurrence(&subject, args.relevance, &target, offset, fragment)
                    .map(|_| ())
            }),
            Line::Title {
                target,
                subject,
                title,
            } => TermPageEntry::new(subject, args.relevance, &target).and_then(|entry| {
                let entry = buffer.get_or_insert(entry)?;
                buffer.set_title(&entry, title)
            }),
        };

        match result {
            Ok(()) => accepted += 1,
            Err(BufferError::InvalidFact(reason)) => {
                warn!("Skipping line {}: {}", number + 1, reason);
                skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }

        buffer.maybe_flush()?;
    }
    info!("Read {} lines ({} skipped)", accepted, skipped);

    let timeout = Duration::from_secs(args.flush_timeout);
    if args.drain {
        buffer.wait_for_idle(timeout)?;
        let generation = buffer.flush_now()?;
        buffer.wait_for_idle(timeout)?;
        info!("Drained generation {}", generation);
    }

    let report = buffer.shutdown()?;
    info!(
        "Shut down: {} entries drained, {} written to {:?}",
        report.drained,
        report.persisted,
        buffer.recovery_path()
    );
    if let Some(e) = report.recovery_error {
        warn!("Recovery file not written: {}", e);
    }

    let timings = buffer.timings();
    info!(
        "Time stalled: {:?}, time not stalled: {:?}",
        timings.stalled, timings.not_stalled
    );
    info!("Metrics:\n{}", buffer.metrics().gather_text());

    Ok(())
}
