use crate::protocol::{Message, Role};
use crate::session::{ChatSession, LoadOutcome, SendOutcome};
use crate::state::ChatState;
use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

type CommandResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Sends one message and prints the reply as it streams in.
pub async fn send(session: &ChatSession, message: &str, stream: bool) -> CommandResult<()> {
    if !stream {
        session.send_message_once(message).await?;
        if let Some(reply) = latest_reply(&session.snapshot()) {
            println!("{}", reply);
        }
        return Ok(());
    }

    let mut updates = session.subscribe();
    let sending = session.send_message(message);
    tokio::pin!(sending);

    let mut printed = 0;
    let mut watching = true;
    let mut interrupted = false;
    let mut stdout = io::stdout();
    let result = loop {
        tokio::select! {
            result = &mut sending => break result,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                session.shutdown();
            }
            changed = updates.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let reply = latest_reply(&updates.borrow_and_update()).unwrap_or_default();
                printed = print_tail(&mut stdout, &reply, printed)?;
            }
        }
    };

    if let Some(reply) = latest_reply(&session.snapshot()) {
        print_tail(&mut stdout, &reply, printed)?;
    }
    println!();
    if result? == SendOutcome::Cancelled {
        println!("(interrupted)");
    }
    Ok(())
}

pub async fn history(session: &ChatSession, pages: usize) -> CommandResult<()> {
    session.load_history().await?;
    for _ in 1..pages {
        if session.load_more_history().await? == LoadOutcome::Skipped {
            break;
        }
    }

    let state = session.snapshot();
    for message in &state.messages {
        println!("{}", format_message(message));
    }
    println!(
        "-- showing {} of {} messages{}",
        state.messages.len(),
        state.total_messages,
        if state.has_more { " (more available)" } else { "" }
    );
    Ok(())
}

pub async fn search(session: &ChatSession, query: &str) -> CommandResult<()> {
    let results = session.search_history(query).await?;
    if results.is_empty() {
        println!("No matches.");
    }
    for message in &results {
        println!("{}", format_message(message));
    }
    Ok(())
}

pub async fn export(session: &ChatSession, output: Option<PathBuf>) -> CommandResult<()> {
    let snapshot = session.export_history().await?;
    let json = serde_json::to_string_pretty(&snapshot)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)?;
            println!("Exported history to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

pub async fn clear(session: &ChatSession, confirmed: bool) -> CommandResult<()> {
    if !confirmed && !confirm_clear(session.character_id())? {
        println!("Aborted.");
        return Ok(());
    }

    session.clear_messages().await?;
    println!("History cleared.");
    Ok(())
}

pub async fn stats(session: &ChatSession) -> CommandResult<()> {
    let stats = session.get_stats().await?;
    println!("Messages:   {}", stats.total_messages);
    println!("Chat days:  {}", stats.chat_days);
    println!("Characters: {}", stats.total_characters);
    Ok(())
}

pub fn format_message(message: &Message) -> String {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "them",
        Role::System => "system",
    };
    let time = message
        .timestamp
        .as_deref()
        .map(short_time)
        .unwrap_or_default();
    format!("[{:>5}] {}: {}", time, speaker, message.content)
}

/// Renders an ISO-8601 timestamp as `HH:MM`; unparseable values pass through.
pub fn short_time(timestamp: &str) -> String {
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(timestamp) {
        return parsed.with_timezone(&chrono::Local).format("%H:%M").to_string();
    }
    if let Ok(parsed) = chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f") {
        return parsed.format("%H:%M").to_string();
    }
    timestamp.to_string()
}

fn latest_reply(state: &ChatState) -> Option<String> {
    state
        .messages
        .last()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.content.clone())
}

fn print_tail(stdout: &mut io::Stdout, reply: &str, printed: usize) -> io::Result<usize> {
    if let Some(tail) = reply.get(printed..) {
        write!(stdout, "{}", tail)?;
        stdout.flush()?;
        return Ok(reply.len());
    }
    Ok(printed)
}

fn confirm_clear(character_id: &str) -> io::Result<bool> {
    print!(
        "Delete all chat history with {}? This cannot be undone. Type 'yes' to continue: ",
        character_id
    );
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}
