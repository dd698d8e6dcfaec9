//! CLI command definitions for arvo-corpus.
//!
//! This module provides the command-line interface for checking the metadata
//! stores, extracting single cases, building the corpus in batch, selecting
//! memory-safety cases and inspecting the corpus index.

use crate::corpus::{CorpusEntry, CorpusIndex, INDEX_FILE};
use crate::execution::{DockerClient, EnvironmentRuntime};
use crate::metadata::{select_memory_cases, MetadataRepository, MetadataStore};
use crate::pipeline::{PipelineConfig, PipelineOrchestrator, RunSummary};
use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Builds a paired vulnerable/fixed source corpus from ARVO case images.
#[derive(Parser)]
#[command(name = "arvo-corpus")]
#[command(about = "Build a paired vulnerable/fixed source corpus from ARVO case images")]
#[command(version)]
#[command(
    long_about = "arvo-corpus resolves ARVO cases against the metadata database and the ARVO-Meta repository, copies the source trees out of the pre-fix and post-fix images, separates fuzzing harnesses from project source and writes a normalized, idempotent corpus.\n\nExample usage:\n  arvo-corpus prep-data\n  arvo-corpus build-corpus 25402 42470 --concurrency 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the case-metadata SQLite database.
    #[arg(long, global = true)]
    pub metadata_db: Option<PathBuf>,

    /// Path to the ARVO-Meta repository checkout.
    #[arg(long, global = true)]
    pub metadata_repo: Option<PathBuf>,

    /// Root directory of the corpus.
    #[arg(long, global = true)]
    pub output_root: Option<PathBuf>,

    /// Image namespace for case environments.
    #[arg(long, global = true)]
    pub namespace: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Check the metadata stores and the container runtime.
    #[command(name = "prep-data")]
    PrepData(PrepDataArgs),

    /// Extract and assemble a single case.
    #[command(name = "extract-case")]
    ExtractCase(ExtractCaseArgs),

    /// Extract and assemble many cases in parallel.
    #[command(name = "build-corpus", alias = "build")]
    BuildCorpus(BuildCorpusArgs),

    /// List ASan memory-safety cases from the metadata repository.
    #[command(name = "list-memory-cases")]
    ListMemoryCases(ListMemoryCasesArgs),

    /// Show corpus index entries.
    #[command(name = "corpus-status", alias = "status")]
    CorpusStatus(CorpusStatusArgs),
}

/// Arguments for `arvo-corpus prep-data`.
#[derive(Parser, Debug)]
pub struct PrepDataArgs {
    /// Do not ping the container runtime.
    #[arg(long)]
    pub skip_runtime: bool,

    /// Output the report as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `arvo-corpus extract-case`.
#[derive(Parser, Debug)]
pub struct ExtractCaseArgs {
    /// Case local ID.
    pub case_id: u64,

    /// Rebuild even if a complete entry exists.
    #[arg(short, long)]
    pub force: bool,

    /// Output the result as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `arvo-corpus build-corpus`.
#[derive(Parser, Debug)]
pub struct BuildCorpusArgs {
    /// Case local IDs.
    pub case_ids: Vec<u64>,

    /// File of case IDs: one per line, or JSON lines with a `localId` field.
    #[arg(long)]
    pub ids_file: Option<PathBuf>,

    /// Maximum number of cases in flight.
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Rebuild complete entries.
    #[arg(short, long)]
    pub force: bool,

    /// Output the summary as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `arvo-corpus list-memory-cases`.
#[derive(Parser, Debug)]
pub struct ListMemoryCasesArgs {
    /// Print JSON lines instead of a table.
    #[arg(short, long)]
    pub json: bool,

    /// Also write the selection as JSON lines to this file.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for `arvo-corpus corpus-status`.
#[derive(Parser, Debug)]
pub struct CorpusStatusArgs {
    /// Only show these case IDs.
    pub case_ids: Vec<u64>,

    /// Output as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
/// Use this when you need access to CLI args before running (e.g., for log level).
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// This is a convenience function that parses CLI args and runs the command.
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the arvo-corpus CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli)?;
    match cli.command {
        Commands::PrepData(args) => run_prep_data_command(config, args).await,
        Commands::ExtractCase(args) => run_extract_case_command(config, args).await,
        Commands::BuildCorpus(args) => run_build_corpus_command(config, args).await,
        Commands::ListMemoryCases(args) => run_list_memory_cases_command(config, args).await,
        Commands::CorpusStatus(args) => run_corpus_status_command(config, args).await,
    }
}

/// Defaults, then the config file, then `ARVO_CORPUS_*`, then global flags.
fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::new(),
    }
    .apply_env()?;

    if let Some(path) = &cli.metadata_db {
        config.metadata_db = path.clone();
    }
    if let Some(path) = &cli.metadata_repo {
        config.metadata_repo = path.clone();
    }
    if let Some(path) = &cli.output_root {
        config.output_root = path.clone();
    }
    if let Some(namespace) = &cli.namespace {
        config.image_namespace = namespace.clone();
    }
    Ok(config)
}

fn docker_runtime(config: &PipelineConfig) -> anyhow::Result<Arc<dyn EnvironmentRuntime>> {
    let client = DockerClient::new()
        .context("Docker is required for extraction")?
        .with_pull_missing(config.pull_missing_images);
    Ok(Arc::new(client))
}

/// Abort signal raised on the first Ctrl-C.
fn abort_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received: no new cases will start, waiting for in-flight cases");
            let _ = tx.send(true);
        }
    });
    rx
}

// ============================================================================
// prep-data
// ============================================================================

async fn run_prep_data_command(config: PipelineConfig, args: PrepDataArgs) -> anyhow::Result<ExitCode> {
    config.validate()?;

    let store = MetadataStore::open(&config)
        .await
        .context("opening metadata stores")?;
    let report = store
        .sanity_check()
        .await
        .context("metadata sanity check failed")?;

    let runtime = if args.skip_runtime {
        None
    } else {
        let runtime = docker_runtime(&config)?;
        runtime
            .ping()
            .await
            .context("container runtime is not reachable")?;
        Some("reachable")
    };

    if args.json {
        let output = serde_json::json!({
            "status": "ok",
            "metadata": report,
            "runtime": runtime.unwrap_or("skipped"),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Metadata database: {}", config.metadata_db.display());
    println!("  tables: {}", report.tables.join(", "));
    println!(
        "  case table: {} (key column {}), {} rows",
        report.case_table.table, report.case_table.key_column, report.case_rows
    );
    println!("Metadata repository: {}", config.metadata_repo.display());
    println!("  meta/: {} documents", report.meta_documents);
    println!("  patches/: {} files", report.patches);
    println!(
        "  commit: {}",
        report.repo_commit.as_deref().unwrap_or("unknown")
    );
    println!("Container runtime: {}", runtime.unwrap_or("skipped"));
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// extract-case / build-corpus
// ============================================================================

async fn run_extract_case_command(
    config: PipelineConfig,
    args: ExtractCaseArgs,
) -> anyhow::Result<ExitCode> {
    let force = args.force || config.force;
    let config = config.with_force(force);
    let summary = run_pipeline(config, &[args.case_id]).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if let Some(outcome) = summary.outcomes.first() {
        println!("Case {}: {}", outcome.case_id, outcome.status);
        if let Some(reason) = &outcome.reason {
            println!("  reason: {reason}");
        }
        if let Some(entry) = &outcome.entry {
            print_entry_paths(entry);
        }
    }
    Ok(exit_code(&summary))
}

async fn run_build_corpus_command(
    config: PipelineConfig,
    args: BuildCorpusArgs,
) -> anyhow::Result<ExitCode> {
    let mut case_ids = args.case_ids.clone();
    if let Some(path) = &args.ids_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        case_ids.extend(parse_ids_file(&raw).with_context(|| format!("parsing {}", path.display()))?);
    }
    if case_ids.is_empty() {
        anyhow::bail!("no case IDs given; pass IDs or --ids-file");
    }

    let force = args.force || config.force;
    let mut config = config.with_force(force);
    if let Some(concurrency) = args.concurrency {
        config = config.with_concurrency(concurrency);
    }

    let summary = run_pipeline(config, &case_ids).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render_table());
    }
    Ok(exit_code(&summary))
}

async fn run_pipeline(config: PipelineConfig, case_ids: &[u64]) -> anyhow::Result<RunSummary> {
    let runtime = docker_runtime(&config)?;
    let orchestrator = PipelineOrchestrator::new(&config, runtime)
        .await
        .context("pipeline initialization failed")?;

    info!(
        output = %orchestrator.context().output_root.display(),
        cases = case_ids.len(),
        "Building corpus"
    );
    let summary = orchestrator.run(case_ids, abort_on_ctrl_c()).await?;
    Ok(summary)
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    if summary.all_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Reads case IDs from plain lines or JSON lines carrying `localId`.
///
/// Blank lines and `#` comments are ignored.
fn parse_ids_file(raw: &str) -> anyhow::Result<Vec<u64>> {
    let mut ids = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let id = if line.starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(line)
                .with_context(|| format!("line {}: invalid JSON", n + 1))?;
            value
                .get("localId")
                .and_then(serde_json::Value::as_u64)
                .with_context(|| format!("line {}: missing numeric localId", n + 1))?
        } else {
            line.parse::<u64>()
                .with_context(|| format!("line {}: '{}' is not a case ID", n + 1, line))?
        };
        ids.push(id);
    }
    Ok(ids)
}

fn print_entry_paths(entry: &CorpusEntry) {
    let show = |label: &str, path: &Option<PathBuf>| {
        if let Some(path) = path {
            println!("  {label}: {}", path.display());
        }
    };
    println!("  directory: {}", entry.case_dir.display());
    show("buggy_src", &entry.buggy_src);
    show("fixed_src", &entry.fixed_src);
    show("poc", &entry.poc);
    show("runner", &entry.runner);
}

// ============================================================================
// list-memory-cases
// ============================================================================

async fn run_list_memory_cases_command(
    config: PipelineConfig,
    args: ListMemoryCasesArgs,
) -> anyhow::Result<ExitCode> {
    let repo = MetadataRepository::open(&config.metadata_repo)?;
    let cases = select_memory_cases(&repo.meta_dir()).await?;

    let lines = cases
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(path) = &args.output {
        write_lines(path, &lines).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), cases = cases.len(), "Memory-safety selection written");
    }

    if args.json {
        for line in &lines {
            println!("{line}");
        }
    } else {
        println!("{:<10} {:<10} CRASH TYPE", "LOCAL ID", "SANITIZER");
        for case in &cases {
            println!("{:<10} {:<10} {}", case.local_id, case.sanitizer, case.crash_type);
        }
        println!("\n{} memory-safety cases", cases.len());
    }
    Ok(ExitCode::SUCCESS)
}

fn write_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for line in lines {
        writeln!(file, "{line}")?;
    }
    file.flush()
}

// ============================================================================
// corpus-status
// ============================================================================

#[derive(Debug, Serialize)]
struct CorpusStatusOutput {
    index: String,
    entries: Vec<CorpusEntry>,
}

async fn run_corpus_status_command(
    config: PipelineConfig,
    args: CorpusStatusArgs,
) -> anyhow::Result<ExitCode> {
    let index_path = config.output_root.join(INDEX_FILE);
    if !index_path.is_file() {
        anyhow::bail!("no corpus index at {}", index_path.display());
    }

    let index = CorpusIndex::open(&config.output_root).await?;
    let mut entries = index.list().await?;
    if !args.case_ids.is_empty() {
        entries.retain(|e| args.case_ids.contains(&e.case_id));
    }

    if args.json {
        let output = CorpusStatusOutput {
            index: index_path.display().to_string(),
            entries,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<10} {:<9} {:<26} REASON", "CASE", "STATUS", "UPDATED");
    for entry in &entries {
        println!(
            "{:<10} {:<9} {:<26} {}",
            entry.case_id,
            entry.status,
            entry.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            entry.reason.as_deref().unwrap_or("-")
        );
    }
    let complete = entries.iter().filter(|e| e.is_complete()).count();
    println!("\n{} entries, {} complete", entries.len(), complete);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_corpus_defaults() {
        let cli = Cli::try_parse_from(["arvo-corpus", "build-corpus", "1", "2"]).expect("should parse");

        match cli.command {
            Commands::BuildCorpus(args) => {
                assert_eq!(args.case_ids, vec![1, 2]);
                assert!(args.concurrency.is_none());
                assert!(!args.force);
                assert!(!args.json);
                assert!(args.ids_file.is_none());
            }
            _ => panic!("Expected BuildCorpus command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_build_corpus_with_all_options() {
        let cli = Cli::try_parse_from([
            "arvo-corpus",
            "--output-root",
            "/data/corpus",
            "build-corpus",
            "25402",
            "-c",
            "8",
            "--force",
            "--ids-file",
            "ids.txt",
            "-j",
            "--log-level",
            "debug",
        ])
        .expect("should parse");

        assert_eq!(cli.output_root, Some(PathBuf::from("/data/corpus")));
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::BuildCorpus(args) => {
                assert_eq!(args.case_ids, vec![25402]);
                assert_eq!(args.concurrency, Some(8));
                assert!(args.force);
                assert!(args.json);
                assert_eq!(args.ids_file, Some(PathBuf::from("ids.txt")));
            }
            _ => panic!("Expected BuildCorpus command"),
        }
    }

    #[test]
    fn test_extract_case_requires_id() {
        assert!(Cli::try_parse_from(["arvo-corpus", "extract-case"]).is_err());
        assert!(Cli::try_parse_from(["arvo-corpus", "extract-case", "abc"]).is_err());

        let cli = Cli::try_parse_from(["arvo-corpus", "extract-case", "42", "--force"]).unwrap();
        match cli.command {
            Commands::ExtractCase(args) => {
                assert_eq!(args.case_id, 42);
                assert!(args.force);
            }
            _ => panic!("Expected ExtractCase command"),
        }
    }

    #[test]
    fn test_aliases() {
        let cli = Cli::try_parse_from(["arvo-corpus", "status", "7"]).unwrap();
        assert!(matches!(cli.command, Commands::CorpusStatus(_)));
        let cli = Cli::try_parse_from(["arvo-corpus", "build", "7"]).unwrap();
        assert!(matches!(cli.command, Commands::BuildCorpus(_)));
    }

    #[test]
    fn test_parse_ids_file_mixed() {
        let raw = "# selection\n25402\n\n{\"localId\": 42470, \"crash_type\": \"UAF\"}\n  7  \n";
        assert_eq!(parse_ids_file(raw).unwrap(), vec![25402, 42470, 7]);
    }

    #[test]
    fn test_parse_ids_file_reports_line() {
        let err = parse_ids_file("1\nnope\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));

        let err = parse_ids_file("{\"id\": 3}\n").unwrap_err();
        assert!(format!("{err:#}").contains("localId"));
    }

    #[test]
    fn test_global_flags_override_config() {
        let cli = Cli::try_parse_from([
            "arvo-corpus",
            "--metadata-db",
            "/m/arvo.db",
            "--metadata-repo",
            "/m/ARVO-Meta",
            "--namespace",
            "mirror.local/arvo",
            "prep-data",
            "--skip-runtime",
        ])
        .unwrap();

        let config = load_config(&cli).unwrap();
        assert_eq!(config.metadata_db, PathBuf::from("/m/arvo.db"));
        assert_eq!(config.metadata_repo, PathBuf::from("/m/ARVO-Meta"));
        assert_eq!(config.image_namespace, "mirror.local/arvo");
    }

    #[test]
    fn test_write_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/cases.jsonl");
        write_lines(&path, &["{\"localId\":1}".to_string(), "{\"localId\":2}".to_string()]).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"localId\":1}\n{\"localId\":2}\n"
        );
    }
}
