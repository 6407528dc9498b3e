//! Smoke client: joins as a player, configures itself and prints what arrives.

use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Websocket endpoint of the server
    #[clap(short, long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,
    /// Role to request once connected
    #[clap(short, long, default_value = "detective")]
    role: String,
    /// Trivia specialty to pick
    #[clap(short, long, default_value = "history")]
    specialty: String,
    /// Seconds to keep listening
    #[clap(short, long, default_value = "30")]
    duration: u64,
}

fn inbound(kind: &str, player_id: &str, payload: Value) -> Message {
    let frame = json!({
        "type": kind,
        "payload": { "auth": { "playerId": player_id }, "payload": payload },
    });
    Message::Text(frame.to_string().into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Connecting to {}", args.url);
    let (socket, _) = connect_async(args.url.as_str()).await?;
    let (mut sink, mut stream) = socket.split();

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let mut player_id: Option<String> = None;

    loop {
        let next = tokio::time::timeout_at(deadline, stream.next()).await;
        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                println!("Connection error: {}", e);
                break;
            }
            Ok(None) => {
                println!("Server closed the connection");
                break;
            }
            Err(_) => break,
        };

        let Message::Text(text) = frame else {
            continue;
        };
        let message: Value = serde_json::from_str(text.as_str())?;
        let kind = message["type"].as_str().unwrap_or_default();
        println!("<- {}: {}", kind, message["payload"]);

        if kind == "available_roles" && player_id.is_none() {
            let Some(id) = message["payload"]["playerId"].as_str() else {
                continue;
            };
            println!("Joined as {}", id);
            sink.send(inbound("role_selection", id, json!({ "role": args.role })))
                .await?;
            sink.send(inbound(
                "trivia_specialty_selection",
                id,
                json!({ "specialties": [args.specialty] }),
            ))
            .await?;
            player_id = Some(id.to_string());
        }
    }

    sink.send(Message::Close(None)).await.ok();
    println!("Test client finished");
    Ok(())
}
