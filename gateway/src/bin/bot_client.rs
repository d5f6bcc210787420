use clap::{Parser, ValueEnum};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use serde_json::json;
use shared::{ClientMessage, ServerMessage};
use std::f32::consts::TAU;
use std::time::Duration;
use tokio::time::{interval, sleep_until, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MotionArg {
    Impulse,
    Heading,
}

/// Headless client that wanders around an arena instance
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Gateway WebSocket URL
    #[clap(short, long, default_value = "ws://127.0.0.1:8080")]
    server: String,
    #[clap(short, long, default_value = "bot")]
    name: String,
    /// Must match the motion model of the instance
    #[clap(long, value_enum, default_value = "impulse")]
    motion: MotionArg,
    /// How long to stay connected
    #[clap(short, long, default_value = "10")]
    duration_secs: u64,
}

const DIRECTIONS: [&str; 4] = ["up", "down", "left", "right"];

fn next_movement(motion: MotionArg, rng: &mut impl Rng) -> ClientMessage {
    let payload = match motion {
        MotionArg::Impulse => json!({
            "direction": DIRECTIONS[rng.gen_range(0..DIRECTIONS.len())],
            "pressed": rng.gen_bool(0.7),
        }),
        MotionArg::Heading => json!({ "angle": rng.gen_range(0.0..TAU) }),
    };
    ClientMessage::Movement(payload)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    info!("Connecting to {}", args.server);
    let (ws_stream, _) = connect_async(args.server.as_str()).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let set_name = ClientMessage::SetName {
        name: args.name.clone(),
    };
    ws_sender.send(Message::Text(set_name.to_json()?)).await?;

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let mut input_timer = interval(Duration::from_millis(250));
    let mut rng = rand::thread_rng();
    let mut snapshots = 0u64;

    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                info!("Run finished after {} snapshots", snapshots);
                break;
            }
            _ = input_timer.tick() => {
                let movement = next_movement(args.motion, &mut rng);
                ws_sender.send(Message::Text(movement.to_json()?)).await?;
            }
            message = ws_receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                        Ok(ServerMessage::Register { identity }) => {
                            info!("Registered as {}", identity);
                        }
                        Ok(ServerMessage::ProblemState { objects }) => {
                            info!("Received {} problems", objects.len());
                        }
                        Ok(ServerMessage::PlayerState { players }) => {
                            snapshots += 1;
                            if snapshots % 20 == 0 {
                                debug!("Snapshot {}: {} players", snapshots, players.len());
                            }
                        }
                        Ok(ServerMessage::Ping { ping }) => info!("Ping: {} ms", ping),
                        Err(e) => warn!("Unreadable message from gateway: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Gateway closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Connection error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    ws_sender.send(Message::Close(None)).await.ok();
    Ok(())
}
