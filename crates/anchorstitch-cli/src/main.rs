use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use anchorstitch_core::ContentModel;
use anchorstitch_local::batch::{run_batch, BatchConfig};
use anchorstitch_local::normalize::{prepare_transcript, NormIndex};
use anchorstitch_local::ollama::OllamaClient;
use anchorstitch_local::openai_compat::OpenAiCompatClient;
use anchorstitch_local::payload::SchemaShape;
use anchorstitch_local::retry::Retrying;
use anchorstitch_local::session::{AnchorMode, CallBudget, MergePolicy, SessionConfig};
use anchorstitch_local::usage::UsageLedger;

#[derive(Parser, Debug)]
#[command(name = "anchorstitch")]
#[command(about = "Anchored, resumable structured extraction from long transcripts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Batch-extract a directory of transcripts (one JSON result per document).
    Run(RunCmd),
    /// Resolve an anchor against one transcript (json).
    Locate(LocateCmd),
    /// Print the prepared form of a transcript (or its normalized search view).
    Normalize(NormalizeCmd),
    /// Print today's usage-ledger entry (json).
    Usage(UsageCmd),
    /// Print version info (json).
    Version,
}

#[derive(clap::Args, Debug)]
struct RunCmd {
    /// Directory of transcript .txt files.
    #[arg(long)]
    input_dir: PathBuf,
    /// Output directory for per-document results. Existing results are skipped.
    #[arg(long)]
    out_dir: PathBuf,
    /// Where alignment-failure diagnostics land (default: <out_dir>/debug).
    #[arg(long)]
    debug_dir: Option<PathBuf>,
    /// Extraction instructions (system prompt + schema), read from a file.
    #[arg(long)]
    instructions: PathBuf,
    /// Backend. Allowed: ollama, openai-compat
    #[arg(long, default_value = "ollama")]
    backend: String,
    /// Model override for openai-compat.
    #[arg(long)]
    model: Option<String>,
    /// Concurrent documents.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Per-call slice size in chars. Default: derived from the token budget.
    #[arg(long)]
    window: Option<usize>,
    #[arg(long, default_value_t = 8192)]
    ctx_tokens: u64,
    #[arg(long, default_value_t = 2000)]
    max_output_tokens: u64,
    #[arg(long, default_value_t = 1200)]
    instruction_tokens: u64,
    #[arg(long, default_value_t = 1.2)]
    chars_per_token: f64,

    /// Resolve anchors by chunk vote with this fragment width instead of
    /// exact match.
    #[arg(long)]
    chunk_vote: Option<usize>,
    /// Rewind this many chars before the resolved anchor instead of
    /// replacing the boundary unit (requires downstream de-duplication).
    #[arg(long)]
    rewind: Option<usize>,
    /// Skip transcript preparation (line joining + whitespace collapse).
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    prepare: bool,

    /// Token cap for the usage ledger; omit to run uncapped.
    #[arg(long)]
    cap: Option<u64>,
    /// Ledger file (default: platform data dir).
    #[arg(long)]
    ledger: Option<PathBuf>,
    /// Bounded retries of a call on malformed output, with perturbed sampling.
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    top_p: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    max_tokens: Option<u64>,

    /// Top-level payload field holding the unit array.
    #[arg(long, default_value = "topic_chunks")]
    units_key: String,
    /// Per-unit field holding the unit's verbatim start phrase.
    #[arg(long, default_value = "start_anchor")]
    anchor_key: String,
    /// Optional top-level field carrying an explicit next-boundary anchor.
    #[arg(long)]
    next_anchor_key: Option<String>,
}

#[derive(clap::Args, Debug)]
struct LocateCmd {
    /// Transcript file.
    file: PathBuf,
    /// Anchor text to resolve.
    #[arg(long)]
    anchor: String,
    /// Normalized offset the search starts at; matches before it are ignored.
    #[arg(long, default_value_t = 0)]
    start_norm: usize,
    /// Use chunk-vote resolution with this fragment width.
    #[arg(long)]
    chunk_width: Option<usize>,
    /// Apply transcript preparation before indexing.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    prepare: bool,
}

#[derive(clap::Args, Debug)]
struct NormalizeCmd {
    /// Transcript file.
    file: PathBuf,
    /// Print the fully collapsed search view instead of the prepared text.
    #[arg(long, default_value_t = false)]
    search_view: bool,
}

#[derive(clap::Args, Debug)]
struct UsageCmd {
    /// Ledger file (default: platform data dir).
    #[arg(long)]
    ledger: Option<PathBuf>,
    #[arg(long, default_value_t = 2_000_000)]
    cap: u64,
    /// Ledger day keys are per model name.
    #[arg(long, default_value = "ollama")]
    model_name: String,
}

fn default_ledger_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("anchorstitch")
        .join("spent.json")
}

fn transcript_files(dir: &PathBuf) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("txt") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn cmd_run(cmd: RunCmd) -> Result<()> {
    let files = transcript_files(&cmd.input_dir)?;
    if files.is_empty() {
        bail!("no .txt transcripts under {}", cmd.input_dir.display());
    }
    let instructions = std::fs::read_to_string(&cmd.instructions)
        .with_context(|| format!("read {}", cmd.instructions.display()))?;

    let shape = SchemaShape {
        units_key: cmd.units_key.clone(),
        anchor_key: cmd.anchor_key.clone(),
        explicit_next_key: cmd.next_anchor_key.clone(),
    };
    let http = reqwest::Client::new();
    let model: Box<dyn ContentModel> = match cmd.backend.as_str() {
        "ollama" => Box::new(Retrying::new(
            OllamaClient::from_env(http, shape)?,
            cmd.max_retries,
        )),
        "openai-compat" => Box::new(Retrying::new(
            OpenAiCompatClient::from_env(http, cmd.model.clone(), shape)?,
            cmd.max_retries,
        )),
        other => bail!("unknown backend {other:?} (allowed: ollama, openai-compat)"),
    };

    let budget = CallBudget {
        ctx_tokens: cmd.ctx_tokens,
        max_output_tokens: cmd.max_output_tokens,
        instruction_tokens: cmd.instruction_tokens,
        chars_per_token: cmd.chars_per_token,
    };
    let session = SessionConfig {
        window: cmd.window.unwrap_or_else(|| budget.window_chars()),
        merge: match cmd.rewind {
            Some(chars) => MergePolicy::RewindOverlap { chars },
            None => MergePolicy::ReplaceLast,
        },
        anchor: match cmd.chunk_vote {
            Some(width) => AnchorMode::ChunkVote { width },
            None => AnchorMode::Exact,
        },
        opts: anchorstitch_core::GenOptions {
            temperature: cmd.temperature,
            top_p: cmd.top_p,
            seed: cmd.seed,
            max_tokens: cmd.max_tokens,
            ..Default::default()
        },
        helper: None,
        debug_dir: None,
    };
    let cfg = BatchConfig {
        out_dir: cmd.out_dir.clone(),
        debug_dir: cmd
            .debug_dir
            .clone()
            .unwrap_or_else(|| cmd.out_dir.join("debug")),
        workers: cmd.workers,
        session,
        prepare: cmd.prepare,
    };
    let ledger = cmd.cap.map(|cap| {
        UsageLedger::new(
            cmd.ledger.clone().unwrap_or_else(default_ledger_path),
            cap,
            cmd.backend.clone(),
        )
    });

    let reports = run_batch(&*model, &files, &instructions, ledger.as_ref(), &cfg).await;
    let ok = reports.iter().all(|r| {
        !matches!(
            r.status,
            anchorstitch_local::batch::DocStatus::Failed { .. }
        )
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "ok": ok,
            "documents": reports.len(),
            "reports": reports,
        }))?
    );
    Ok(())
}

fn cmd_locate(cmd: LocateCmd) -> Result<()> {
    let raw = std::fs::read_to_string(&cmd.file)
        .with_context(|| format!("read {}", cmd.file.display()))?;
    let text = if cmd.prepare {
        prepare_transcript(&raw)
    } else {
        raw
    };
    let index = NormIndex::new(&text);
    let out = match cmd.chunk_width {
        Some(width) => {
            let vote = index.find_by_chunk(&cmd.anchor, cmd.start_norm, width);
            serde_json::json!({
                "mode": "chunk_vote",
                "found": vote.raw_idx >= 0,
                "result": vote,
            })
        }
        None => match index.find(&cmd.anchor, cmd.start_norm) {
            Some(hit) => serde_json::json!({"mode": "exact", "found": true, "result": hit}),
            None => serde_json::json!({"mode": "exact", "found": false}),
        },
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn cmd_normalize(cmd: NormalizeCmd) -> Result<()> {
    let raw = std::fs::read_to_string(&cmd.file)
        .with_context(|| format!("read {}", cmd.file.display()))?;
    let prepared = prepare_transcript(&raw);
    if cmd.search_view {
        println!("{}", NormIndex::new(&prepared).norm_string());
    } else {
        println!("{prepared}");
    }
    Ok(())
}

fn cmd_usage(cmd: UsageCmd) -> Result<()> {
    let path = cmd.ledger.unwrap_or_else(default_ledger_path);
    let ledger = UsageLedger::new(path.clone(), cmd.cap, cmd.model_name);
    let spent = ledger.spent();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "ledger": path,
            "spent": spent,
            "cap": cmd.cap,
            "remaining": cmd.cap.saturating_sub(spent),
        }))?
    );
    Ok(())
}

fn cmd_version() -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "schema_version": 1,
            "name": "anchorstitch",
            "version": env!("CARGO_PKG_VERSION"),
        }))?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(cmd) => cmd_run(cmd).await,
        Commands::Locate(cmd) => cmd_locate(cmd),
        Commands::Normalize(cmd) => cmd_normalize(cmd),
        Commands::Usage(cmd) => cmd_usage(cmd),
        Commands::Version => cmd_version(),
    }
}
