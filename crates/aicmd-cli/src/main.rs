use aicmd_agent::{ChatEnd, ChatSession, CommandPipeline, PipelineOptions, PipelineOutcome};
use aicmd_context::{ContextCatalog, ContextMode};
use aicmd_core::{AicmdError, AppConfig, NO_HISTORY_ENV, Platform, env_flag, home_dir, state_dir};
use aicmd_llm::OpenAiClient;
use aicmd_observe::Observer;
use aicmd_store::{ConversationStore, ResultCache};
use anyhow::{Result, anyhow};
use clap::Parser;
use serde_json::json;
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

mod context;
mod interrupt;
mod output;
mod shell;
mod terminal;

use context::ensure_api_key;
use interrupt::{EXIT_INTERRUPTED, Interrupt};
use output::print_json;
use terminal::{TerminalChat, TerminalPrompter};

#[derive(Parser, Debug)]
#[command(name = "ai", version)]
#[command(about = "Turn a plain-language request into a shell command", long_about = None)]
struct Cli {
    /// What the command should do, e.g. `ai list files by size`.
    query: Vec<String>,

    /// Let the model pick a system context source for the request.
    #[arg(short = 'c', long = "context-auto", conflicts_with = "context")]
    context_auto: bool,

    /// Use the context source with this index (see --list-context).
    #[arg(long, value_name = "INDEX")]
    context: Option<usize>,

    /// Print the available context sources and exit.
    #[arg(long = "list-context")]
    list_context: bool,

    /// Explain the generated command.
    #[arg(short = 'e', long)]
    explain: bool,

    /// Number of alternatives offered when a command is rejected.
    #[arg(short = 'n', long = "alternatives", value_name = "N")]
    alternatives: Option<u32>,

    /// Start an interactive conversation instead of generating one command.
    #[arg(long)]
    chat: bool,

    /// Delete the saved conversation history.
    #[arg(long = "reset-history")]
    reset_history: bool,

    /// Delete the result cache.
    #[arg(long = "clear-cache")]
    clear_cache: bool,

    /// Show the command without asking to run it.
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Run the generated command without confirmation.
    #[arg(short = 'y', long)]
    yes: bool,

    /// Enable verbose logging to stderr.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Machine-readable output. Implies --dry-run unless --yes is given.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json_mode = cli.json;
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            if json_mode {
                let _ = print_json(&json!({"error": format!("{err:#}")}));
            } else {
                eprintln!("error: {err:#}");
            }
            exit_code_for(&err)
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<AicmdError>() {
        Some(AicmdError::MissingCredential(_)) => ExitCode::from(3),
        Some(AicmdError::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Some(
            AicmdError::Aborted(_)
            | AicmdError::InvalidSelection { .. }
            | AicmdError::InvalidContextIndex { .. },
        ) => ExitCode::from(2),
        None => ExitCode::FAILURE,
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let state_dir = state_dir();
    let observer = Arc::new(Observer::new(&state_dir)?);
    observer.set_verbose(cli.verbose);
    let cfg = AppConfig::ensure(&state_dir)?;
    let catalog = ContextCatalog::builtin();

    if cli.list_context {
        if cli.json {
            print_json(&catalog.summaries())?;
        } else {
            for provider in catalog.summaries() {
                println!("{:>3}  {}", provider.index, provider.name);
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let cache = ResultCache::new(&state_dir, cfg.cache.maxsize, Arc::clone(&observer));
    let history = ConversationStore::new(
        &state_dir,
        cfg.history.limit,
        cfg.history.word_budget,
        Arc::clone(&observer),
    );

    if cli.reset_history || cli.clear_cache {
        let history_reset = cli.reset_history && history.reset()?;
        let cache_cleared = cli.clear_cache && cache.clear()?;
        if cli.json {
            print_json(&json!({
                "history_reset": history_reset,
                "cache_cleared": cache_cleared,
            }))?;
        } else {
            if cli.reset_history {
                println!("history: {}", if history_reset { "reset" } else { "already empty" });
            }
            if cli.clear_cache {
                println!("cache: {}", if cache_cleared { "cleared" } else { "already empty" });
            }
        }
        if cli.query.is_empty() && !cli.chat {
            return Ok(ExitCode::SUCCESS);
        }
    }

    let mode = match (cli.context, cli.context_auto) {
        (Some(index), _) => {
            catalog.validate_index(index)?;
            ContextMode::Explicit(index)
        }
        (None, true) => ContextMode::Auto,
        (None, false) => ContextMode::None,
    };

    let platform = Platform::detect();
    if cli.chat {
        let source = ensure_api_key(&cfg.llm, cli.json)?;
        observer.record("CREDENTIAL", &format!("source={source:?}"));
        let llm = OpenAiClient::new(cfg.llm.clone())?;
        let interrupt = Interrupt::install()?;
        return run_chat(&llm, &history, &platform, &cfg, observer, interrupt);
    }

    let query = cli.query.join(" ");
    if query.trim().is_empty() {
        return Err(anyhow!(
            "please describe the command you want, e.g. `ai list files by size`"
        ));
    }

    let source = ensure_api_key(&cfg.llm, cli.json)?;
    observer.record("CREDENTIAL", &format!("source={source:?}"));
    let llm = OpenAiClient::new(cfg.llm.clone())?;
    let opts = PipelineOptions {
        context: mode,
        explain: cli.explain,
        alternatives: cli.alternatives.unwrap_or(cfg.pipeline.alternatives).max(1),
        dry_run: cli.dry_run || (cli.json && !cli.yes),
        assume_yes: cli.yes,
        color: !cli.json && std::io::stdout().is_terminal(),
    };
    let pipeline = CommandPipeline::new(
        &llm,
        &cache,
        &catalog,
        &platform,
        &cfg.pipeline,
        Arc::clone(&observer),
    );
    let interrupt = Interrupt::install()?;
    let mut prompter = TerminalPrompter::new(opts.color, interrupt.clone()).quiet(cli.json);
    let outcome = pipeline.run(&query, &opts, &mut prompter)?;
    if interrupt.is_raised() {
        observer.record("INTERRUPTED", "stopping before handoff");
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    if cli.json {
        print_json(&outcome)?;
    }

    match outcome {
        PipelineOutcome::Printed { .. } => Ok(ExitCode::SUCCESS),
        PipelineOutcome::Execute { command, shell } => {
            if !env_flag(NO_HISTORY_ENV)
                && let Some(path) = home_dir().and_then(|home| shell::history_file(&shell, &home))
                && let Err(err) = shell::append_history(&path, &command)
            {
                observer.warn_log(&format!("could not update shell history: {err:#}"));
            }
            let status = shell::execute(&command, &shell)?;
            observer.record("EXECUTED", &format!("status={status}"));
            Ok(status
                .code()
                .and_then(|code| u8::try_from(code).ok())
                .map_or(ExitCode::FAILURE, ExitCode::from))
        }
    }
}

fn run_chat(
    llm: &OpenAiClient,
    history: &ConversationStore,
    platform: &Platform,
    cfg: &AppConfig,
    observer: Arc<Observer>,
    interrupt: Interrupt,
) -> Result<ExitCode> {
    let session = ChatSession::new(llm, history, platform, &cfg.llm, observer)
        .with_interrupt_flag(interrupt.flag());
    match session.run(&mut TerminalChat::new(interrupt))? {
        ChatEnd::Finished => Ok(ExitCode::SUCCESS),
        ChatEnd::Interrupted => Ok(ExitCode::from(EXIT_INTERRUPTED)),
    }
}
