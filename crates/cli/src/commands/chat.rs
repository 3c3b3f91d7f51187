//! `jarvis chat`: Interactive or single-message chat mode.

use super::CliResult;
use jarvis_agent::{Assistant, ChatEvent};
use std::io::{BufRead, Write};

pub async fn run(message: Option<String>, stream: bool) -> CliResult {
    let config = super::load_config()?;
    let assistant = super::assistant(config).await?;

    if let Some(msg) = message {
        turn(&assistant, &msg, stream).await?;
        assistant.shutdown().await;
        return Ok(());
    }

    println!("🤖 JARVIS ready. Type a message, or 'exit' to quit.");
    println!();
    let stdin = std::io::stdin();
    loop {
        print!("you › ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }
        if let Err(e) = turn(&assistant, line, stream).await {
            eprintln!("  ❌ {e}");
        }
        println!();
    }

    assistant.shutdown().await;
    Ok(())
}

async fn turn(assistant: &Assistant, message: &str, stream: bool) -> CliResult {
    if !stream {
        let response = assistant.chat(message).await?;
        println!("jarvis › {}", response.message);
        return Ok(());
    }

    let mut events = assistant.start_chat_stream(message);
    let mut stdout = std::io::stdout();
    let mut started = false;
    loop {
        let event = tokio::select! {
            event = events.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                events.cancel();
                continue;
            }
        };
        let Some(event) = event else { break };

        match event {
            ChatEvent::Thought(t) => eprintln!("  · {}: {}", t.step, t.detail),
            ChatEvent::Token { text } => {
                if !started {
                    print!("jarvis › ");
                    started = true;
                }
                print!("{text}");
                stdout.flush()?;
            }
            ChatEvent::Complete(response) => {
                println!();
                eprintln!(
                    "  ({} model, {} tokens, memory {})",
                    response.tier,
                    response.tokens_generated,
                    if response.memory_context_used { "used" } else { "unused" }
                );
            }
            ChatEvent::Cancelled { .. } => println!("\n  ⏹️  cancelled"),
            ChatEvent::Error { kind, message, .. } => {
                if started {
                    println!();
                }
                return Err(format!("{kind}: {message}").into());
            }
        }
    }
    Ok(())
}
