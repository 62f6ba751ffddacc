use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voxloop::conversation::AppConfig;
use voxloop::engine::sim::SimEngines;
use voxloop::{ConversationEvent, ConversationOrchestrator, OrchestratorBuilder};

const HELP: &str = "Type what you would say and press enter. Commands: toggle, stats, help, quit";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxloop=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Voxloop voice assistant");

    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => AppConfig::default(),
    };

    let engines = SimEngines::new(config.engines);
    let conversation = OrchestratorBuilder::from_sim(&engines)
        .with_config(config.conversation)
        .build()
        .context("building orchestrator")?;

    conversation.start();
    tokio::spawn(print_events(conversation.clone()));

    conversation.initialize().await;
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "quit" | "exit" => break,
            "help" => println!("{}", HELP),
            "toggle" => {
                let active = conversation.toggle_conversation().await;
                println!("Conversation {}", if active { "on" } else { "off" });
            }
            "stats" => println!("{}", conversation.stats().lock().summary()),
            text => {
                if !engines.transcriber.hear(text) {
                    println!("(not listening: {})", conversation.current_state().label());
                }
            }
        }
    }

    conversation.shutdown();
    info!("Final stats: {}", conversation.stats().lock().summary());
    Ok(())
}

async fn print_events(conversation: ConversationOrchestrator) {
    let mut events = conversation.subscribe();
    loop {
        match events.recv().await {
            Ok(ConversationEvent::StateChanged(state)) => {
                println!("[{}]", state.label());
            }
            Ok(ConversationEvent::SentenceQueued { text, .. }) => {
                println!("Ava: {}", text);
            }
            Ok(ConversationEvent::EngineError { engine, message }) => {
                println!("! {} error: {}", engine, message);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event printer lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
