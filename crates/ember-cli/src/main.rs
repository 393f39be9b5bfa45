//! ember - terminal coding agent

mod commands;
mod config;
mod fetch;
mod repl;
mod utils;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use ember_agent::{
    Agent, AgentConfig, FileStore, LocalFilesystem, MemoryStore, ProcessSupervisor, SessionStore,
    WorkingDir, builtin_tools,
};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, DEFAULT_PROVIDER};
use crate::fetch::HttpFetcher;

/// ember - terminal coding agent
#[derive(Parser, Debug)]
#[command(name = "ember")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Provider (a name from the [providers] table of the config)
    #[arg(short, long)]
    provider: Option<String>,

    /// Run in non-interactive mode with a single prompt
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Working directory
    #[arg(short, long)]
    working_dir: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Run every tool without asking for permission
    #[arg(short = 'y', long)]
    yes: bool,

    /// Keep the session in memory only
    #[arg(long)]
    no_persist: bool,

    /// Resume the last session saved for the working directory
    #[arg(long)]
    resume: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

/// Log to stderr when asked to, so the REPL output stays readable.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        Some(EnvFilter::new("ember=debug,ember_agent=debug,ember_ai=debug"))
    } else if std::env::var_os("RUST_LOG").is_some() {
        Some(EnvFilter::from_default_env())
    } else {
        None
    };
    if let Some(filter) = filter {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    // Initialize config and exit
    if args.init_config {
        match Config::init() {
            Ok(path) => {
                println!("Config file at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = Config::load();

    // Change working directory if specified
    if let Some(ref dir) = args.working_dir {
        std::env::set_current_dir(dir)?;
    }
    let cwd = std::env::current_dir()?;

    // Merge config with CLI args (CLI takes precedence)
    let provider_name = args
        .provider
        .or(cfg.provider.clone())
        .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
    let provider = match cfg.bridge(&provider_name) {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let requested_model = args.model.or(cfg.model.clone());
    let model = cfg.model_for(&provider_name, requested_model.as_deref());
    tracing::debug!(provider = %provider_name, model = %model.id, ceiling = model.ceiling(), "Resolved model");

    let supervisor = Arc::new(ProcessSupervisor::new(
        WorkingDir::new(&cwd),
        cfg.supervisor_config(),
    ));
    let store: Arc<dyn SessionStore> = if args.no_persist {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(FileStore::for_working_dir(&cwd))
    };
    let fetcher = Arc::new(HttpFetcher::new()?);

    let mut agent_config = AgentConfig::new(model);
    if let Some(depth) = cfg.limits.max_depth {
        agent_config.max_depth = depth;
    }
    let mut agent = Agent::new(
        agent_config,
        Arc::new(provider),
        Arc::new(cfg.permission_gate(args.yes)),
        supervisor.clone(),
        store,
    );
    agent.set_tools(builtin_tools(
        Arc::new(LocalFilesystem),
        supervisor.clone(),
        fetcher,
    ));

    let system_prompt = match cfg.system_prompt_file.as_deref().map(load_prompt_file) {
        Some(Ok(prompt)) => prompt,
        Some(Err(e)) => {
            eprintln!("Warning: Failed to read system prompt file: {}", e);
            build_system_prompt(&agent.tool_names(), &cwd)
        }
        None => build_system_prompt(&agent.tool_names(), &cwd),
    };
    agent.set_system_prompt(system_prompt);

    if args.resume {
        match agent.load_session() {
            Some(count) => eprintln!("Resumed session ({} messages)", count),
            None => eprintln!("No saved session for {}", cwd.display()),
        }
    }

    let result = if let Some(ref command) = args.command {
        repl::run_command(&mut agent, command).await
    } else {
        repl::run_interactive(&mut agent, &cfg).await
    };

    supervisor.stop_all().await;
    result
}

fn load_prompt_file(path: &str) -> std::io::Result<String> {
    let path = match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().unwrap_or_default().join(rest),
        None => Path::new(path).to_path_buf(),
    };
    std::fs::read_to_string(path)
}

/// Build dynamic system prompt based on available tools
fn build_system_prompt(tool_names: &[&str], cwd: &Path) -> String {
    let has = |name: &str| tool_names.contains(&name);

    let mut prompt = String::from("You are ember, a coding assistant working in a terminal.\n\n");

    if !tool_names.is_empty() {
        prompt.push_str("Tools:\n");
        for (name, description) in [
            ("read_file", "Read a file"),
            ("write_file", "Write a whole file, creating parent directories"),
            ("list_dir", "List a directory"),
            ("run_command", "Run a shell command; slow commands move to the background"),
            ("stop_process", "Stop a background process"),
            ("list_processes", "List background processes"),
            ("get_logs", "Show recent output of a background process"),
            ("send_input", "Write to a background process's stdin"),
            ("fetch_url", "Fetch a web page as text"),
        ] {
            if has(name) {
                prompt.push_str(&format!("- {}: {}\n", name, description));
            }
        }
        prompt.push('\n');
    }

    prompt.push_str("Guidelines:\n");
    prompt.push_str("- Be concise and helpful\n");
    if has("read_file") && has("write_file") {
        prompt.push_str("- Read files before rewriting them\n");
    }
    if has("run_command") {
        prompt.push_str("- Dev servers keep running in the background; check them with get_logs instead of starting them again\n");
        prompt.push_str("- `cd <dir>` changes the working directory for later commands and file paths\n");
    }
    prompt.push_str("- Some tools need the user's approval; if one is denied, do not retry it unchanged\n");

    prompt.push_str(&format!("\nWorking directory: {}", cwd.display()));
    prompt
}
