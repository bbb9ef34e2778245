use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use easel_contracts::events::EventWriter;
use easel_contracts::progress::{ProgressEvent, ProgressLedger};
use easel_contracts::prompt::{default_patterns, extract_prompts, PromptPattern};
use easel_contracts::transcript::{InMemoryTranscript, TranscriptStore};
use easel_engine::insert::MarkdownInserter;
use easel_engine::session::{SessionConfig, SessionManager};
use easel_engine::{default_provider_registry, StyleOptions};

#[derive(Debug, Parser)]
#[command(name = "easel", version, about = "Streaming image-generation session driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a transcript as a live stream through a full session.
    Stream(StreamArgs),
    /// Extract image directives from a transcript and print them.
    Extract(ExtractArgs),
}

#[derive(Debug, Parser)]
struct StreamArgs {
    /// Transcript file to replay.
    #[arg(long, conflicts_with = "text")]
    file: Option<PathBuf>,
    /// Inline transcript text.
    #[arg(long)]
    text: Option<String>,
    /// Image backend to use (see `dryrun` for offline runs).
    #[arg(long, default_value = "dryrun")]
    provider: String,
    /// Directory generated images are written to.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Append the audit trail to this jsonl file.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Directive template with a `{prompt}` placeholder; repeatable.
    #[arg(long = "pattern")]
    patterns: Vec<String>,
    /// Characters delivered per simulated chunk.
    #[arg(long, default_value_t = 24)]
    chunk_size: usize,
    #[arg(long, default_value_t = 80)]
    chunk_delay_ms: u64,
    #[arg(long, default_value_t = 1)]
    max_concurrent: usize,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    size: Option<String>,
    /// Prepended to every prompt before generation.
    #[arg(long, default_value = "")]
    style_prefix: String,
    /// Appended to every prompt before generation.
    #[arg(long, default_value = "")]
    style_suffix: String,
}

#[derive(Debug, Parser)]
struct ExtractArgs {
    #[arg(long, conflicts_with = "text")]
    file: Option<PathBuf>,
    #[arg(long)]
    text: Option<String>,
    /// Directive template with a `{prompt}` placeholder; repeatable.
    #[arg(long = "pattern")]
    patterns: Vec<String>,
    /// One JSON object per match instead of the tabular form.
    #[arg(long)]
    json: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Stream(args) => run_stream(args),
        Command::Extract(args) => run_extract(args),
    }
}

fn run_stream(args: StreamArgs) -> Result<i32> {
    let source = read_source(args.file.as_deref(), args.text.as_deref())?;
    let patterns = resolve_patterns(&args.patterns)?;

    let registry = default_provider_registry();
    let provider = registry.get(&args.provider).with_context(|| {
        format!(
            "unknown provider {:?} (available: {})",
            args.provider,
            registry.names().join(", ")
        )
    })?;

    let audit = args
        .events
        .as_ref()
        .map(|path| EventWriter::new(path, "easel-cli"));
    let progress = Arc::new(match &audit {
        Some(writer) => ProgressLedger::with_audit(writer.clone()),
        None => ProgressLedger::new(),
    });
    progress.subscribe(|event| match event {
        ProgressEvent::Started { message_id, total } => {
            println!("[progress] {message_id}: started with {total} task(s)");
        }
        ProgressEvent::Updated {
            message_id,
            completed,
            total,
            ..
        } => {
            println!("[progress] {message_id}: {completed}/{total}");
        }
        ProgressEvent::AllComplete {
            message_id,
            succeeded,
            failed,
            duration_ms,
            ..
        } => {
            println!(
                "[progress] {message_id}: all complete ({succeeded} ok, {failed} failed, {duration_ms}ms)"
            );
        }
        ProgressEvent::Cleared { .. } => {}
    });

    let style_defaults = StyleOptions::default();
    let config_defaults = SessionConfig::default();
    let config = SessionConfig {
        patterns,
        poll_interval: Duration::from_millis((args.chunk_delay_ms / 2).clamp(10, 300)),
        max_concurrent: args.max_concurrent,
        style: StyleOptions {
            prompt_prefix: args.style_prefix,
            prompt_suffix: args.style_suffix,
            model: args.model.unwrap_or(style_defaults.model),
            size: args.size.unwrap_or(style_defaults.size),
        },
        finalize_timeout: config_defaults.finalize_timeout,
        out_dir: args.out.unwrap_or(config_defaults.out_dir),
    };

    let transcript = Arc::new(InMemoryTranscript::new());
    let manager = SessionManager::new(
        Arc::clone(&transcript) as Arc<dyn TranscriptStore>,
        provider,
        Arc::new(MarkdownInserter::new(
            Arc::clone(&transcript) as Arc<dyn TranscriptStore>
        )),
        Arc::clone(&progress),
        config,
        audit,
    );

    // The two host signals, in order: chunks arrive, generation ends.
    let message_id = "cli-stream";
    manager.start_streaming_session(message_id);
    for chunk in char_chunks(&source, args.chunk_size) {
        transcript.append(message_id, &chunk);
        thread::sleep(Duration::from_millis(args.chunk_delay_ms));
    }
    let inserted = manager.finalize_streaming_and_insert(message_id)?;

    let final_text = transcript.read(message_id).unwrap_or_default();
    println!("--- transcript ---");
    println!("{final_text}");
    println!("--- {inserted} image(s) inserted ---");
    Ok(0)
}

fn run_extract(args: ExtractArgs) -> Result<i32> {
    let source = read_source(args.file.as_deref(), args.text.as_deref())?;
    let patterns = resolve_patterns(&args.patterns)?;
    let matches = extract_prompts(&source, &patterns);

    if args.json {
        for found in &matches {
            println!("{}", serde_json::to_string(found)?);
        }
    } else {
        for found in &matches {
            println!("{}..{}\t{}", found.start, found.end, found.text);
        }
        println!("{} directive(s)", matches.len());
    }
    Ok(0)
}

fn read_source(file: Option<&std::path::Path>, text: Option<&str>) -> Result<String> {
    match (file, text) {
        (Some(path), _) => {
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        }
        (None, Some(text)) => Ok(text.to_string()),
        (None, None) => bail!("provide a transcript with --file or --text"),
    }
}

fn resolve_patterns(templates: &[String]) -> Result<Vec<PromptPattern>> {
    if templates.is_empty() {
        return Ok(default_patterns());
    }
    templates
        .iter()
        .map(|template| PromptPattern::from_template(template))
        .collect()
}

fn char_chunks(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}
