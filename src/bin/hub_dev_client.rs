use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const USAGE: &str = "usage: hub_dev_client device <url>\n       hub_dev_client controller <url> [action] [speed]";

#[derive(Debug, Serialize)]
struct Handshake<'a> {
    role: &'a str,
}

#[derive(Debug, Serialize)]
struct CommandMessage<'a> {
    #[serde(rename = "type")]
    message_type: &'a str,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ActionMessage {
    #[serde(rename = "type")]
    message_type: String,
    value: String,
    speed: Option<i64>,
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// SOI, seq, timestamp, EOI
fn synthetic_frame(seq: u64) -> Vec<u8> {
    let mut frame = vec![0xff, 0xd8];
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&now_unix_ms().to_be_bytes());
    frame.extend_from_slice(&[0xff, 0xd9]);
    frame
}

async fn run_device(url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (ws, _) = connect_async(url).await?;
    println!("hub-dev-client: connected to {url} as device");
    let (mut write, mut read) = ws.split();

    write
        .send(Message::Text(serde_json::to_string(&Handshake { role: "esp32" })?))
        .await?;
    println!("-> handshake esp32");

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut seq = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                seq += 1;
                let frame = synthetic_frame(seq);
                write.send(Message::Text(r#"{"type":"image"}"#.to_string())).await?;
                write.send(Message::Binary(frame.clone())).await?;
                println!("-> frame #{seq} ({} bytes)", frame.len());
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ActionMessage>(&text) {
                        Ok(action) => println!("<- {} {} speed={:?}", action.message_type, action.value, action.speed),
                        Err(_) => println!("<- {text}"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        println!("hub-dev-client: closed by hub");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
    }
}

async fn run_controller(
    url: &str,
    action: Option<String>,
    speed: Option<i64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (ws, _) = connect_async(url).await?;
    println!("hub-dev-client: connected to {url} as controller");
    let (mut write, mut read) = ws.split();

    write
        .send(Message::Text(serde_json::to_string(&Handshake { role: "controller" })?))
        .await?;
    println!("-> handshake controller");

    if let Some(value) = action {
        let msg = CommandMessage {
            message_type: "command",
            value,
            speed,
        };
        write.send(Message::Text(serde_json::to_string(&msg)?)).await?;
        println!("-> command {} speed={:?}", msg.value, msg.speed);
    }

    while let Some(msg) = read.next().await {
        match msg? {
            Message::Binary(bytes) => println!("<- frame {} bytes at {}", bytes.len(), now_unix_ms()),
            Message::Text(text) => println!("<- {text}"),
            Message::Close(_) => break,
            _ => {}
        }
    }
    println!("hub-dev-client: closed by hub");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [mode, url] if mode == "device" => run_device(url).await,
        [mode, url, rest @ ..] if mode == "controller" && rest.len() <= 2 => {
            let action = rest.first().cloned();
            let speed = match rest.get(1) {
                Some(raw) => Some(raw.parse::<i64>()?),
                None => None,
            };
            run_controller(url, action, speed).await
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}
