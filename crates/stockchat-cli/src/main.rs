//! Command-line client for the stock-analysis chat stream.
//!
//! `replay` plays a recorded JSONL frame fixture through the full controller;
//! `ask` sends a live query to the backend configured in the environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use stockchat_stream::prelude::*;
use stockchat_stream::{ToolCallStatus, codec, init_observability, project};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "stockchat")]
#[command(about = "Stream stock-analysis chat turns from the terminal", long_about = None)]
struct Args {
    /// Print the final message as JSON instead of streaming text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a JSONL frame fixture.
    Replay {
        /// One frame per line; `--- disconnect` ends a connection, `--- pause <ms>` waits.
        #[arg(short, long)]
        file: PathBuf,
        /// Query shown with the replayed answer.
        #[arg(short, long, default_value = "replay")]
        query: String,
        /// Resume after a disconnect instead of restarting from sequence 0.
        #[arg(long)]
        resume: bool,
    },
    /// Ask the configured backend.
    Ask {
        #[arg(short, long)]
        query: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_observability();

    let args = Args::parse();
    let config = StreamConfig::from_env()?;

    let (controller, request) = match args.command {
        Command::Replay {
            file,
            query,
            resume,
        } => {
            let fixture = Fixture::load(&file)?;
            info!(file = %file.display(), connections = fixture.connections.len(), "replaying fixture");
            let mut transport = ScriptedTransport::new().supports_resume(resume);
            for steps in fixture.connections {
                transport = transport.connection(steps);
            }
            let controller = StreamController::builder()
                .transport(Arc::new(transport))
                .credential(SessionToken::new("replay"))
                .config(config)
                .build()?;
            (controller, TurnRequest::new(query).turn_id(fixture.turn_id))
        }
        Command::Ask { query } => {
            let controller = StreamController::builder()
                .transport(Arc::new(HttpSseTransport::from_env()?))
                .credential(SessionToken::from_env()?)
                .config(config)
                .build()?;
            (controller, TurnRequest::new(query))
        }
    };

    let handle = controller.start_with(request)?;
    let cancel = handle.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let turn = render(handle, !args.json).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&project(&turn))?);
    }
    match turn.failure() {
        Some(failure) => bail!("turn {} failed: {failure}", turn.turn_id()),
        None => Ok(()),
    }
}

fn load_env() {
    let _ = dotenvy::dotenv();
}

/// Streams text to stdout and tool progress to stderr as snapshots arrive.
async fn render(mut handle: TurnHandle, stream_text: bool) -> anyhow::Result<Turn> {
    let mut printed = 0;
    let mut tools: HashMap<String, ToolCallStatus> = HashMap::new();
    while let Some(event) = handle.next_event().await {
        match &event {
            TurnEvent::Queued { .. } => eprintln!("[queued]"),
            TurnEvent::Retrying { attempt, mode, delay, .. } => {
                eprintln!("[reconnecting: attempt {attempt}, {mode:?} in {delay:?}]");
            }
            TurnEvent::Snapshot { view, .. } => {
                for call in &view.tool_calls {
                    if tools.insert(call.call_id.clone(), call.status) != Some(call.status) {
                        eprintln!("[tool {}: {}]", call.name, call.status.as_str());
                    }
                }
                if view.text.len() < printed {
                    printed = 0;
                    if stream_text {
                        println!();
                    }
                }
                if stream_text {
                    print!("{}", &view.text[printed..]);
                }
                printed = view.text.len();
            }
            TurnEvent::StateChanged { status, .. } if status.is_terminal() => {
                if stream_text {
                    println!();
                }
                eprintln!("[{status}]");
            }
            _ => {}
        }
        if event.is_terminal() {
            break;
        }
    }
    Ok(handle.finish().await?)
}

/// Recorded connections for a single turn.
#[derive(Debug)]
struct Fixture {
    turn_id: TurnId,
    connections: Vec<Vec<ScriptStep>>,
}

impl Fixture {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture {}", path.display()))?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> anyhow::Result<Self> {
        let mut connections = Vec::new();
        let mut current = Vec::new();
        let mut turn_id = None;
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            if let Some(directive) = line.strip_prefix("---") {
                let mut parts = directive.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some("disconnect"), _) => {
                        current.push(ScriptStep::Disconnect(format!(
                            "fixture disconnect at line {}",
                            index + 1
                        )));
                        connections.push(std::mem::take(&mut current));
                    }
                    (Some("pause"), Some(ms)) => {
                        let ms: u64 = ms
                            .parse()
                            .with_context(|| format!("line {}: invalid pause `{ms}`", index + 1))?;
                        current.push(ScriptStep::Pause(Duration::from_millis(ms)));
                    }
                    _ => bail!("line {}: unknown directive `{line}`", index + 1),
                }
                continue;
            }
            if turn_id.is_none()
                && let Ok(frame) = codec::decode(line)
            {
                turn_id = Some(frame.turn_id);
            }
            current.push(ScriptStep::Raw(line.to_string()));
        }
        if !current.is_empty() {
            connections.push(current);
        }
        let Some(turn_id) = turn_id else {
            bail!("fixture contains no decodable frame");
        };
        Ok(Self {
            turn_id,
            connections,
        })
    }
}
