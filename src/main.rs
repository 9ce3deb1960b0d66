use anyhow::Result;
use ports::{Engine, EngineConfig};
use std::io::{BufRead, Write};
use std::time::Duration;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut config = EngineConfig::default();
    config.local_names = vec![whoami_fallback()];

    let engine = Engine::open(config)?;
    println!("connection code: {}", engine.generate_code());
    if let Some(group) = engine.owned_channel() {
        println!("announcing on {group}");
    } else {
        println!("no free channel, running discovery-only");
    }

    println!("commands: list | code <index|code> | send <id> <text> | recv <id> | quit");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.trim().splitn(3, ' ');
        match parts.next() {
            Some("list") => {
                for entry in engine.list_directory() {
                    println!(
                        "[{}] {} {} @ {:?} ({}s ago)",
                        entry.index,
                        entry.names,
                        entry.surnames,
                        entry.endpoint,
                        entry.last_seen_age.as_secs()
                    );
                }
            }
            Some("code") => {
                let Some(target) = parts.next() else { continue };
                let opened = if let Ok(index) = target.parse::<usize>() {
                    engine.open_session_by_index(index)
                } else {
                    engine.open_session_by_code(target)
                };
                match opened {
                    Ok(id) => println!("session {id} open"),
                    Err(e) => println!("failed to open session: {e}"),
                }
            }
            Some("send") => {
                let Some(id_str) = parts.next() else { continue };
                let Some(text) = parts.next() else { continue };
                let Ok(id) = id_str.parse() else { continue };
                if let Err(e) = engine.send(id, text.as_bytes().to_vec()) {
                    println!("send failed: {e}");
                }
            }
            Some("recv") => {
                let Some(id_str) = parts.next() else { continue };
                let Ok(id) = id_str.parse() else { continue };
                match engine.recv_history(id) {
                    Ok(history) => {
                        for blob in history {
                            println!("{}", String::from_utf8_lossy(&blob));
                        }
                    }
                    Err(e) => println!("recv failed: {e}"),
                }
            }
            Some("quit") | None => break,
            _ => {
                println!("unknown command");
                std::io::stdout().flush().ok();
            }
        }
        // give the accept/announce threads a moment between commands
        std::thread::sleep(Duration::from_millis(10));
    }

    engine.close();
    Ok(())
}

fn whoami_fallback() -> String {
    std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string())
}
