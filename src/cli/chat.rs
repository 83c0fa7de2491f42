//! Interactive chat command.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio_util::sync::CancellationToken;

use parley::config::Config;
use parley::pipeline::{ConversationPipeline, ResponseSource, TurnRequest, TurnState};
use parley::session::SessionCache;
use parley::transport::{Broadcaster, ConversationEvent};
use parley::ParleyError;

use super::{build_cache, build_engine, build_router, build_store};

/// Writes streamed chunks straight to the terminal.
struct TerminalBroadcaster;

#[async_trait]
impl Broadcaster for TerminalBroadcaster {
    async fn broadcast(&self, _conversation_id: &str, event: ConversationEvent) {
        match event {
            ConversationEvent::Chunk { text, .. } => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            ConversationEvent::FinalMessage { .. } => println!(),
            ConversationEvent::Error { message, .. } => {
                println!();
                eprintln!("Error: {}", message);
            }
        }
    }
}

/// Run the chat REPL.
pub(crate) async fn cmd_chat(
    config: Config,
    user: String,
    conversation: Option<String>,
    resource: Option<String>,
    resource_file: Option<PathBuf>,
) -> Result<()> {
    let engine = build_engine(&config)?;
    let router = build_router(&config);
    let report = router.initialize().await;
    for (provider, reason) in &report.failed {
        eprintln!("Tool provider '{}' unavailable: {}", provider, reason);
    }

    let pipeline = ConversationPipeline::builder()
        .config(config.pipeline.clone())
        .engine(Arc::clone(&engine))
        .store(build_store()?)
        .sessions(SessionCache::new(&config.session))
        .cache(build_cache(&config, Some(engine)))
        .router(router)
        .broadcaster(Arc::new(TerminalBroadcaster))
        .build()?;

    let mut bound = match (resource, resource_file) {
        (Some(url), Some(path)) => {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Some((url, content))
        }
        _ => None,
    };

    let mut current = conversation;
    let mut last_assistant: Option<String> = None;
    let mut editor = DefaultEditor::new().with_context(|| "Failed to start line editor")?;

    println!("parley chat. /help for commands, Ctrl-D to exit.");
    loop {
        let line = match editor.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        if let Some(command) = input.strip_prefix('/') {
            let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
            let Some(id) = current.clone() else {
                match name {
                    "quit" | "exit" => break,
                    "new" => {}
                    "help" => print_help(),
                    _ => println!("No conversation yet. Say something first."),
                }
                continue;
            };
            let result = match name {
                "quit" | "exit" => break,
                "help" => {
                    print_help();
                    Ok(())
                }
                "new" => {
                    current = None;
                    last_assistant = None;
                    println!("Started a new conversation.");
                    Ok(())
                }
                "title" => pipeline.rename_conversation(&user, &id, arg).await,
                "star" => match last_assistant.as_deref() {
                    Some(message_id) => pipeline
                        .toggle_star(&user, &id, message_id)
                        .await
                        .map(|on| println!("{}", if on { "Starred." } else { "Unstarred." })),
                    None => {
                        println!("Nothing to star yet.");
                        Ok(())
                    }
                },
                "report" => match last_assistant.as_deref() {
                    Some(message_id) => pipeline
                        .report_message(&user, &id, message_id, arg)
                        .await
                        .map(|_| println!("Reported.")),
                    None => {
                        println!("Nothing to report yet.");
                        Ok(())
                    }
                },
                "delete" => {
                    let deleted = pipeline.delete_conversation(&user, &id).await;
                    if deleted.is_ok() {
                        current = None;
                        last_assistant = None;
                        println!("Conversation deleted.");
                    }
                    deleted
                }
                "info" => pipeline.conversation(&user, &id).await.map(|s| {
                    println!(
                        "{} | {} | {} messages{}",
                        s.id,
                        s.title,
                        s.message_count,
                        if s.is_context_full { " | context full" } else { "" }
                    )
                }),
                _ => {
                    println!("Unknown command '/{}'. Try /help.", name);
                    Ok(())
                }
            };
            if let Err(e) = result {
                eprintln!("Error: {}", e);
            }
            continue;
        }

        let mut request = TurnRequest::new(&user, input);
        request.conversation_id = current.clone();
        if current.is_none() {
            if let Some((url, content)) = bound.as_ref() {
                request = request.with_resource(url, content);
            }
        }

        let cancel = CancellationToken::new();
        let turn = pipeline.handle_turn(request, cancel.clone());
        tokio::pin!(turn);
        let result = tokio::select! {
            result = &mut turn => result,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                turn.await
            }
        };

        match result {
            Ok(outcome) => {
                if let ResponseSource::Cache(source) = &outcome.source {
                    tracing::debug!(?source, "Answered from cache");
                }
                current = Some(outcome.conversation_id);
                last_assistant = Some(outcome.assistant_message.id);
                bound = None;
            }
            Err(ParleyError::Cancelled) => println!("\n[cancelled]"),
            Err(e) => {
                if TurnState::for_error(&e) == Some(TurnState::Rejected) {
                    eprintln!("Turn rejected: {}", e);
                } else {
                    eprintln!("Turn failed: {}", e);
                }
            }
        }
    }

    pipeline.shutdown().await;
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  /new             start a new conversation");
    println!("  /title <text>    rename the conversation");
    println!("  /star            toggle star on the last answer");
    println!("  /report <reason> report the last answer");
    println!("  /info            show conversation details");
    println!("  /delete          delete the conversation");
    println!("  /quit            exit");
}
