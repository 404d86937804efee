//! Runs one crash-investigation session and streams its events to stdout.
//!
//! Usage:
//!   crashscope ./a.out --bug "segfaults on long input" -- ABCDEFGHIJKLMNOPQR
//!   crashscope ./a.out --script replies.txt --json

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crashscope_core::events::EventKind;
use crashscope_core::policy::{Allowlist, ChatConfig, ChatPolicy, Policy, ScriptedPolicy};
use crashscope_core::{SessionConfig, SessionDriver, SessionEvent};
use futures_util::StreamExt;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "crashscope", about = "Drive gdb through a crash investigation")]
struct Args {
    /// Executable to debug
    target: PathBuf,

    /// Arguments passed to the target
    #[arg(last = true)]
    target_args: Vec<String>,

    /// What goes wrong, in plain words; handed to the chat model
    #[arg(long, default_value = "The program crashes. Find out why.")]
    bug: String,

    /// Replay policy replies from a file (one reply per line) instead of a chat model
    #[arg(long)]
    script: Option<PathBuf>,

    /// Debugger binary (default: gdb from PATH)
    #[arg(long)]
    gdb: Option<PathBuf>,

    #[arg(long)]
    max_steps: Option<usize>,

    /// Per-command timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Timeout in milliseconds for commands that resume the target
    #[arg(long)]
    run_timeout_ms: Option<u64>,

    /// Directory searched for source files named in stop locations
    #[arg(long)]
    source_root: Option<PathBuf>,

    /// Write a JSONL transcript of all debugger traffic into this directory
    #[arg(long)]
    transcript_dir: Option<PathBuf>,

    /// Extra MI verbs the policy may use
    #[arg(long = "allow")]
    allow: Vec<String>,

    /// Chat model name (overrides CRASHSCOPE_LLM_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// Chat endpoint base URL (overrides CRASHSCOPE_LLM_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Request complete responses instead of streaming them
    #[arg(long)]
    no_stream: bool,

    /// Print events and the final report as JSON lines
    #[arg(long)]
    json: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::from_env(&self.target);
        config.target_args = self.target_args.clone();
        if let Some(gdb) = &self.gdb {
            config.debugger = Some(gdb.clone());
        }
        if let Some(steps) = self.max_steps {
            config.max_steps = steps;
        }
        if let Some(ms) = self.timeout_ms {
            config.command_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.run_timeout_ms {
            config.run_timeout = Duration::from_millis(ms);
        }
        if let Some(root) = &self.source_root {
            config.source_root = Some(root.clone());
        }
        if let Some(dir) = &self.transcript_dir {
            config.transcript_dir = Some(dir.clone());
        }
        config
    }

    async fn policy(&self, config: &SessionConfig) -> Result<Box<dyn Policy>> {
        if let Some(script) = &self.script {
            let content = std::fs::read_to_string(script)
                .with_context(|| format!("Failed to read script {}", script.display()))?;
            let replies: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect();
            return Ok(Box::new(ScriptedPolicy::new(replies)));
        }

        let mut chat = ChatConfig::from_env();
        if let Some(model) = &self.model {
            chat.model = model.clone();
        }
        if let Some(url) = &self.base_url {
            chat.base_url = url.clone();
        }
        chat.stream = !self.no_stream;
        chat.history_window = config.observation.history_window;
        let policy = ChatPolicy::connect(chat, self.bug.clone()).await?;
        info!(model = %policy.model(), "using chat model");
        Ok(Box::new(policy))
    }
}

fn print_event(event: &SessionEvent, json: bool) {
    if json {
        println!("{}", event.to_json_line());
        return;
    }
    match event.kind {
        EventKind::Trace => println!("{}", event.content),
        EventKind::Cot => {
            for line in event.content.lines() {
                println!("> {line}");
            }
        }
        EventKind::Answer => println!("\n=== Answer ===\n{}", event.content),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = args.session_config();
    let policy = args.policy(&config).await?;
    let allowlist = args
        .allow
        .iter()
        .fold(Allowlist::default(), |list, verb| list.allow(verb.as_str()));

    let (driver, mut events) = SessionDriver::new(config, policy);
    let driver = driver.with_allowlist(allowlist);
    info!(session = %driver.session_id(), "starting");

    let cancel = driver.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, shutting down the debugger...");
            cancel.cancel();
        }
    });

    let json = args.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            print_event(&event, json);
        }
    });

    let report = driver.run().await;
    printer.await.context("event printer panicked")?;

    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        eprintln!(
            "\n{} after {} steps (debugger {})",
            report.outcome, report.steps, report.lifecycle
        );
        if let Some(path) = &report.transcript {
            eprintln!("Transcript: {}", path.display());
        }
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
