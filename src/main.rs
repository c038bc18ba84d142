//! LLM Worker Chat - terminal front end
//!
//! Runs the chat session engine against an in-process worker.

use anyhow::Result;
use clap::{Parser, Subcommand};
use llm_worker_chat::chat::{ChatCommand, InputOutcome, RejectReason, SubmitOutcome};
use llm_worker_chat::events::StoreAction;
use llm_worker_chat::persistence::JsonFilePersistence;
use llm_worker_chat::worker::EchoRuntime;
use llm_worker_chat::{AppContext, Config};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "llm-worker-chat")]
#[command(about = "Chat with a language model running in a worker")]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model id to load (overrides config.yaml and WEBLLM_MODEL)
    #[arg(short, long)]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat; lines starting with ':' are commands
    Chat,

    /// Send a single prompt in a new session and print the reply
    Ask {
        prompt: String,
    },

    /// List stored sessions
    Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,llm_worker_chat=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_yaml_and_env(cli.config.as_deref())?;
    if let Some(model) = cli.model {
        config.chat.model = model;
    }

    let persistence = Arc::new(JsonFilePersistence::new(config.store_path.clone()));
    let app = AppContext::in_process(config, Arc::new(EchoRuntime::new()), persistence).await?;

    let result = match cli.command {
        Commands::Chat => run_chat(&app).await,
        Commands::Ask { prompt } => run_ask(&app, &prompt).await,
        Commands::Sessions => run_sessions(&app).await,
    };
    app.shutdown();
    result
}

async fn load_model(app: &AppContext) -> Result<()> {
    eprintln!("Loading {} ...", app.config.model());
    app.load_model(|report| {
        tracing::debug!(progress = report.progress, "{}", report.text);
    })
    .await
}

/// Print streamed deltas as they arrive
fn spawn_printer(app: &AppContext) -> JoinHandle<()> {
    let mut events = app.events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.action {
                StoreAction::MessageDelta => {
                    if let Some(delta) = event.payload.get("delta").and_then(|d| d.as_str()) {
                        print!("{}", delta);
                        let _ = std::io::stdout().flush();
                    }
                }
                StoreAction::MessageFinalized => println!(),
                _ => {}
            }
        }
    })
}

async fn run_chat(app: &AppContext) -> Result<()> {
    load_model(app).await?;
    let printer = spawn_printer(app);

    let commands: Vec<String> = ChatCommand::ALL
        .iter()
        .map(|c| format!("{} ({})", c, c.description()))
        .collect();
    eprintln!("Commands: {}", commands.join(", "));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match app.engine.handle_input(&line).await {
            Ok(InputOutcome::Command(command)) => {
                let session = app.engine.current_session().await;
                eprintln!(
                    "{} -> {} ({} messages)",
                    command,
                    session.topic,
                    session.messages.len()
                );
            }
            Ok(InputOutcome::Submitted(outcome)) => wait_for_turn(app, outcome).await,
            Err(e) => eprintln!("{}", e.format_for_display()),
        }
    }

    printer.abort();
    Ok(())
}

/// Wait for a started turn; Ctrl-C stops the generation instead of exiting
async fn wait_for_turn(app: &AppContext, outcome: SubmitOutcome) {
    let turn = match outcome {
        SubmitOutcome::Started(turn) => turn,
        SubmitOutcome::Rejected(RejectReason::EmptyInput) => return,
        SubmitOutcome::Rejected(RejectReason::AlreadyStreaming) => {
            eprintln!("A reply is still streaming");
            return;
        }
    };
    let finished = turn.finished();
    tokio::pin!(finished);
    tokio::select! {
        _ = &mut finished => {}
        _ = tokio::signal::ctrl_c() => {
            if let Err(e) = app.engine.stop().await {
                tracing::warn!(error = %e, "Failed to stop generation");
            }
            finished.await;
        }
    }
}

async fn run_ask(app: &AppContext, prompt: &str) -> Result<()> {
    load_model(app).await?;
    app.engine.new_session().await;

    match app.engine.submit(prompt, Vec::new()).await? {
        SubmitOutcome::Started(turn) => {
            let session_id = turn.session_id.clone();
            let message_id = turn.assistant_message_id.clone();
            turn.finished().await;
            let snapshot = app.engine.snapshot().await;
            if let Some(message) = snapshot
                .session(&session_id)
                .and_then(|s| s.message(&message_id))
            {
                println!("{}", message.content);
                if message.is_error {
                    anyhow::bail!("Generation failed");
                }
            }
            Ok(())
        }
        SubmitOutcome::Rejected(reason) => anyhow::bail!("Prompt rejected: {:?}", reason),
    }
}

async fn run_sessions(app: &AppContext) -> Result<()> {
    let store = app.engine.snapshot().await;
    for (index, session) in store.sessions().iter().enumerate() {
        let marker = if index == store.current_index() { "*" } else { " " };
        println!(
            "{} {:>3}  {:<32} {:>4} messages  {}",
            marker,
            index,
            session.topic,
            session.messages.len(),
            session.last_update.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
