use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use helm_core::events::AgentEvent;
use helm_core::provider::{Provider, StaticCredentials};
use helm_engine::{
    create_default_registry, AgentRunner, CompactionConfig, Compactor, MessageQueue, RunnerConfig,
    TurnRunner,
};
use helm_llm::{AnthropicProvider, OpenAiCompatProvider, ReliableConfig, ReliableProvider};
use helm_store::database::Database;
use helm_store::events::EventRepo;
use helm_store::sessions::SessionRepo;
use helm_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "helm", about = "Run an agent loop against an LLM provider")]
struct Args {
    /// The prompt to run.
    prompt: String,

    /// Provider backend: `anthropic` or `openai`.
    #[arg(long, default_value = "anthropic")]
    provider: String,

    /// Model identifier.
    #[arg(long, default_value = "claude-sonnet-4-5")]
    model: String,

    /// Base URL for OpenAI-compatible backends.
    #[arg(long, default_value = "https://api.openai.com/v1")]
    base_url: String,

    /// Database path. Defaults to ~/.helm/helm.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Resume an existing session instead of creating one.
    #[arg(long)]
    session: Option<String>,

    /// Maximum turns for this prompt.
    #[arg(long, default_value_t = 50)]
    max_turns: u32,

    /// System prompt override.
    #[arg(long)]
    system: Option<String>,

    /// Emit JSON log lines instead of the human format.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_telemetry(&TelemetryConfig {
        json: args.json_logs,
        ..Default::default()
    });

    let db_path = match args.db.clone() {
        Some(p) => p,
        None => {
            let dir = home_dir().join(".helm");
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            dir.join("helm.db")
        }
    };
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    let provider = build_provider(&args)?;
    let working_directory = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/tmp"));

    let session_repo = SessionRepo::new(db.clone());
    let session_id = match &args.session {
        Some(raw) => {
            let id = helm_core::ids::SessionId::from_raw(raw.clone());
            session_repo
                .get(&id)
                .with_context(|| format!("session {raw} not found"))?;
            id
        }
        None => session_repo.create(&args.prompt)?.id,
    };

    let (event_tx, event_rx) = broadcast::channel::<AgentEvent>(1024);
    let printer = tokio::spawn(print_events(event_rx));

    let mut turn_runner = TurnRunner::new(
        Arc::clone(&provider),
        Arc::new(create_default_registry()),
        db.clone(),
        event_tx.clone(),
        working_directory,
    );
    if let Some(system) = &args.system {
        turn_runner = turn_runner.with_system_prompt(system.clone());
    }

    let compactor = Compactor::new(
        Arc::clone(&provider),
        EventRepo::new(db.clone()),
        event_tx.clone(),
        CompactionConfig::default(),
    );

    let runner = AgentRunner::new(
        turn_runner,
        RunnerConfig {
            max_turns_per_prompt: args.max_turns,
            ..Default::default()
        },
        db,
        event_tx.clone(),
    )
    .with_compactor(compactor);

    let queue = MessageQueue::new();
    let cancel = CancellationToken::new();

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, aborting run");
            ctrl_c_cancel.cancel();
        }
    });

    tracing::info!(session_id = %session_id, model = provider.model(), "starting run");
    let outcome = runner
        .run(&session_id, args.prompt.clone(), &queue, &cancel)
        .await;

    // Let the printer catch up with the tail of the event stream.
    drop(event_tx);
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    match outcome {
        Ok(turns) => {
            tracing::info!(turns, "run complete");
            Ok(())
        }
        Err(e) => bail!("run failed: {e}"),
    }
}

fn build_provider(args: &Args) -> Result<Arc<dyn Provider>> {
    match args.provider.as_str() {
        "anthropic" => {
            let key = std::env::var("ANTHROPIC_API_KEY")
                .context("ANTHROPIC_API_KEY is not set")?;
            let credentials = Arc::new(StaticCredentials::single(
                "anthropic",
                SecretString::from(key),
            ));
            let inner = AnthropicProvider::new(credentials, args.model.clone());
            Ok(Arc::new(ReliableProvider::new(
                inner,
                ReliableConfig::default(),
            )))
        }
        "openai" => {
            let key =
                std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set")?;
            let credentials = Arc::new(StaticCredentials::single(
                "openai",
                SecretString::from(key),
            ));
            let inner = OpenAiCompatProvider::new(
                credentials,
                "openai",
                args.model.clone(),
                args.base_url.clone(),
            );
            Ok(Arc::new(ReliableProvider::new(
                inner,
                ReliableConfig::default(),
            )))
        }
        other => bail!("unknown provider: {other}"),
    }
}

async fn print_events(mut rx: broadcast::Receiver<AgentEvent>) {
    while let Ok(event) = rx.recv().await {
        match event {
            AgentEvent::TextDelta { delta, .. } => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            AgentEvent::TurnComplete { .. } => println!(),
            AgentEvent::ToolStart { name, tool_call_id, .. } => {
                tracing::info!(tool = %name, id = %tool_call_id, "tool started");
            }
            AgentEvent::ToolEnd { tool_call_id, is_error, duration_ms, .. } => {
                tracing::info!(id = %tool_call_id, is_error, duration_ms, "tool finished");
            }
            AgentEvent::Retrying { attempt, delay_ms, kind, .. } => {
                tracing::warn!(attempt, delay_ms, kind = %kind, "provider retry");
            }
            AgentEvent::CompactionComplete { summarized, kept, truncated, .. } => {
                tracing::info!(summarized, kept, truncated, "context compacted");
            }
            _ => {}
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
