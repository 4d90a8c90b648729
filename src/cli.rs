//! Command-line interface
//!
//! The CLI is one consumer of the headless Run API: it starts runs,
//! subscribes to the event stream, relays cancellation (Ctrl-C) into the
//! cooperative flag, and queries the receipt ledger and open batches.

use anyhow::{Context, Result, anyhow};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;

use mirrorcast_capability::CapabilityCache;
use mirrorcast_config::{Config, CredentialProvider, EnvCredentialProvider, PricingTable};
use mirrorcast_engine::{RunHandle, Supervisor, SupervisorOptions, cancel_batch, list_open_batches};
use mirrorcast_ledger::{Ledger, ReceiptQuery};
use mirrorcast_provider::{HttpProviderClient, ProviderClient, Transport};
use mirrorcast_utils::cancel::CancelFlag;
use mirrorcast_utils::types::{RunFlags, RunMode, RunRequest, RunStatus};

/// How long cancellation may take before the hard-kill marker is written.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "mirrorcast", version, about = "Cascade orchestrator for a Responses-API provider")]
pub struct Cli {
    /// Explicit configuration file.
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a run and stream its progress.
    Run(RunArgs),
    /// Resume a non-terminal run by id.
    Resume { run_id: String },
    /// List known runs.
    Runs,
    /// Query the receipt ledger.
    Receipts(ReceiptArgs),
    /// Inspect or cancel asynchronous batches.
    Batches(BatchArgs),
    /// List models the provider offers.
    Models,
    /// Inspect or delete provider-side files.
    Files(FileArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Generate,
    Modify,
    Qa,
    Batch,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Generate => Self::Generate,
            ModeArg::Modify => Self::Modify,
            ModeArg::Qa => Self::Qa,
            ModeArg::Batch => Self::Batch,
        }
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, value_enum)]
    mode: ModeArg,
    #[arg(long)]
    model: String,
    /// Prompt text; mutually exclusive with --prompt-file.
    #[arg(long, conflicts_with = "prompt_file")]
    prompt: Option<String>,
    /// Read the prompt from a file.
    #[arg(long)]
    prompt_file: Option<Utf8PathBuf>,
    #[arg(long)]
    project: Option<String>,
    /// Input tree to mirror (MODIFY only).
    #[arg(long = "in")]
    input_root: Option<Utf8PathBuf>,
    /// Output tree (all modes but QA).
    #[arg(long = "out")]
    output_root: Option<Utf8PathBuf>,
    /// Continue a server-side chain.
    #[arg(long)]
    previous_response_id: Option<String>,
    /// Provider file ids attached to every request.
    #[arg(long = "attach")]
    attached_file_ids: Vec<String>,
    /// Snapshot the output tree before the first write.
    #[arg(long)]
    versioning: bool,
    /// MODIFY: halt after the touched-file list for confirmation.
    #[arg(long)]
    dry_run: bool,
    /// Attach collected diagnostics blobs.
    #[arg(long)]
    diagnostics_in: bool,
    /// Persist diagnostics produced during the run.
    #[arg(long)]
    diagnostics_out: bool,
    /// Re-probe model capabilities, ignoring the cache TTL.
    #[arg(long)]
    force_probe: bool,
}

#[derive(Debug, Args)]
struct ReceiptArgs {
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    mode: Option<String>,
    #[arg(long)]
    project: Option<String>,
    /// Substring match over the stored prompt digest.
    #[arg(long)]
    contains: Option<String>,
}

#[derive(Debug, Args)]
struct BatchArgs {
    #[command(subcommand)]
    command: BatchCommand,
}

#[derive(Debug, Subcommand)]
enum BatchCommand {
    /// List batches that have not reached a terminal state.
    List,
    /// Cancel one batch.
    Cancel { batch_id: String },
}

#[derive(Debug, Args)]
struct FileArgs {
    #[command(subcommand)]
    command: FileCommand,
}

#[derive(Debug, Subcommand)]
enum FileCommand {
    /// List files the provider holds.
    List,
    /// Delete one provider-side file.
    Delete { file_id: String },
}

impl Cli {
    /// Execute the selected command, returning the process exit code.
    ///
    /// # Errors
    ///
    /// Any configuration, provider, or run failure.
    pub async fn execute(self) -> Result<i32> {
        let config = Config::discover(self.config.as_deref())
            .context("failed to load configuration")?;

        match self.command {
            Command::Run(args) => run_command(&config, args).await,
            Command::Resume { run_id } => resume_command(&config, &run_id).await,
            Command::Runs => runs_command(&config),
            Command::Receipts(args) => receipts_command(&config, &args),
            Command::Batches(args) => batches_command(&config, args).await,
            Command::Models => models_command(&config).await,
            Command::Files(args) => files_command(&config, args).await,
        }
    }
}

fn build_client(config: &Config) -> Result<Arc<dyn ProviderClient>> {
    let credentials = EnvCredentialProvider;
    let api_key = credentials
        .get(&config.provider.api_key_env)
        .ok_or_else(|| {
            anyhow!(
                "no API key found; set the {} environment variable",
                config.provider.api_key_env
            )
        })?;
    let transport = Transport::new(&config.transport, CancelFlag::new())
        .context("failed to build provider transport")?;
    Ok(Arc::new(HttpProviderClient::new(
        transport,
        config.provider.base_url.clone(),
        api_key,
    )))
}

fn build_supervisor(config: &Config, force_probe: bool) -> Result<Supervisor> {
    let client = build_client(config)?;
    let ledger =
        Arc::new(Ledger::open(&config.ledger_path()).context("failed to open receipt ledger")?);
    let capability_cache = Arc::new(CapabilityCache::new(config.capability_cache_path()));
    let pricing = config
        .paths
        .pricing
        .as_ref()
        .and_then(|path| PricingTable::load(path).ok());

    Ok(Supervisor::new(
        client,
        ledger,
        capability_cache,
        pricing,
        SupervisorOptions {
            config: config.clone(),
            log_root: Utf8PathBuf::from("."),
            force_probe,
        },
    ))
}

async fn run_command(config: &Config, args: RunArgs) -> Result<i32> {
    let prompt = match (&args.prompt, &args.prompt_file) {
        (Some(prompt), None) => prompt.clone(),
        (None, Some(path)) => std::fs::read_to_string(path.as_std_path())
            .with_context(|| format!("failed to read prompt file {path}"))?,
        _ => return Err(anyhow!("exactly one of --prompt or --prompt-file is required")),
    };

    let request = RunRequest {
        mode: args.mode.into(),
        project: args.project,
        model: args.model,
        prompt,
        previous_response_id: args.previous_response_id,
        input_root: args.input_root,
        output_root: args.output_root,
        attached_file_ids: args.attached_file_ids,
        flags: RunFlags {
            versioning: args.versioning,
            dry_run: args.dry_run,
            diagnostics_in: args.diagnostics_in,
            diagnostics_out: args.diagnostics_out,
        },
    };

    let supervisor = build_supervisor(config, args.force_probe)?;
    let handle = supervisor.start(request)?;
    println!("run {} started", handle.run_id());
    drive_run(&supervisor, &handle).await
}

async fn resume_command(config: &Config, run_id: &str) -> Result<i32> {
    let supervisor = build_supervisor(config, false)?;
    let handle = supervisor.resume(run_id)?;
    println!("run {run_id} resumed");
    drive_run(&supervisor, &handle).await
}

/// Stream events, relay Ctrl-C into cooperative cancellation, release
/// dry-run halts interactively, and report the terminal status.
async fn drive_run(supervisor: &Supervisor, handle: &RunHandle) -> Result<i32> {
    let mut events = handle.events();
    let mut cancelling = false;

    let status = loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        println!("[{:>3}%] {} {}: {}", event.percent, event.step, event.kind, event.message);
                        match event.kind.as_str() {
                            "dry_run_halt" => {
                                println!("press Enter to continue past the dry-run halt");
                                let _ = tokio::task::spawn_blocking(|| {
                                    let mut line = String::new();
                                    let _ = std::io::stdin().read_line(&mut line);
                                })
                                .await;
                                handle.allow_continue();
                            }
                            "run_done" | "run_failed" | "run_cancelled" => {
                                break supervisor.finish(handle, CANCEL_GRACE).await;
                            }
                            _ => {}
                        }
                    }
                    // Stream closed or lagged; fall back to the join handle.
                    Err(_) => break supervisor.finish(handle, CANCEL_GRACE).await,
                }
            }
            result = tokio::signal::ctrl_c(), if !cancelling => {
                result.ok();
                println!("cancelling; waiting up to {}s", CANCEL_GRACE.as_secs());
                handle.cancel();
                cancelling = true;
            }
        }
    };

    println!("run {} finished: {status:?}", handle.run_id());
    Ok(match status {
        RunStatus::Done => 0,
        RunStatus::Cancelled => 130,
        _ => 1,
    })
}

fn runs_command(config: &Config) -> Result<i32> {
    let supervisor = build_supervisor(config, false);
    // Listing runs needs no provider client; read the log root directly
    // when client construction fails (e.g. no API key set).
    let summaries = match supervisor {
        Ok(supervisor) => supervisor.list_runs(),
        Err(_) => mirrorcast_runlog::list_states(camino::Utf8Path::new("."))
            .iter()
            .map(mirrorcast_utils::types::RunSummary::from)
            .collect(),
    };
    if summaries.is_empty() {
        println!("no runs found");
        return Ok(0);
    }
    for summary in summaries {
        println!(
            "{}  {:<8}  {:<9}  {}  {}",
            summary.run_id,
            summary.mode.as_str(),
            format!("{:?}", summary.status).to_lowercase(),
            summary.model,
            summary.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(0)
}

fn receipts_command(config: &Config, args: &ReceiptArgs) -> Result<i32> {
    let ledger = Ledger::open(&config.ledger_path()).context("failed to open receipt ledger")?;
    let receipts = ledger.query(&ReceiptQuery {
        run_id: args.run_id.clone(),
        model: args.model.clone(),
        mode: args.mode.clone(),
        project: args.project.clone(),
        digest_contains: args.contains.clone(),
        ..ReceiptQuery::default()
    })?;

    if receipts.is_empty() {
        println!("no receipts match");
        return Ok(0);
    }
    for receipt in receipts {
        let cost = receipt
            .cost
            .map_or("-".to_string(), |cost| format!("{cost:.6}"));
        let flag = if receipt.cost_estimated { "~" } else { " " };
        println!(
            "{}  {:<24}  in:{:<7} out:{:<7} {flag}{cost}",
            receipt.run_id,
            receipt.step_key,
            receipt.input_tokens,
            receipt.output_tokens,
        );
    }
    Ok(0)
}

async fn batches_command(config: &Config, args: BatchArgs) -> Result<i32> {
    let client = build_client(config)?;
    match args.command {
        BatchCommand::List => {
            let open = list_open_batches(client.as_ref()).await?;
            if open.is_empty() {
                println!("no open batches");
            }
            for batch in open {
                println!("{}  {}", batch.batch_id, batch.status);
            }
        }
        BatchCommand::Cancel { batch_id } => {
            cancel_batch(client.as_ref(), &batch_id).await?;
            println!("batch {batch_id} cancel requested");
        }
    }
    Ok(0)
}

async fn models_command(config: &Config) -> Result<i32> {
    let client = build_client(config)?;
    for model in client.list_models().await? {
        println!("{}", model.id);
    }
    Ok(0)
}

async fn files_command(config: &Config, args: FileArgs) -> Result<i32> {
    let client = build_client(config)?;
    match args.command {
        FileCommand::List => {
            for file in client.list_files().await? {
                println!("{}  {:<12}  {} bytes", file.file_id, file.purpose, file.bytes);
            }
        }
        FileCommand::Delete { file_id } => {
            client.delete_file(&file_id).await?;
            println!("file {file_id} deleted");
        }
    }
    Ok(0)
}
