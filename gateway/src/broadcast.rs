//! Fan-out of snapshots and problem lists.
//!
//! Every message is serialized once and then handed to each recipient's
//! outbound queue with `try_send`. A full queue drops that one update for that
//! one recipient; nobody waits on a slow client.

use crate::bus::{MessageBus, Subscription};
use crate::error::GatewayError;
use crate::session_manager::SessionManager;
use crate::simulation::Snapshot;
use log::{debug, info};
use shared::{Problem, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::Message;

/// Delivers tick output to local sessions and to the bus.
#[derive(Clone)]
pub struct Broadcaster {
    sessions: Arc<RwLock<SessionManager>>,
    bus: Arc<dyn MessageBus>,
    snapshot_channel: String,
    problems_channel: String,
    problem_cache: Arc<watch::Sender<Option<String>>>,
}

impl Broadcaster {
    pub fn new(
        sessions: Arc<RwLock<SessionManager>>,
        bus: Arc<dyn MessageBus>,
        snapshot_channel: impl Into<String>,
        problems_channel: impl Into<String>,
    ) -> Self {
        let (problem_cache, _) = watch::channel(None);
        Self {
            sessions,
            bus,
            snapshot_channel: snapshot_channel.into(),
            problems_channel: problems_channel.into(),
            problem_cache: Arc::new(problem_cache),
        }
    }

    /// Latest serialized `problem_state`, handed to sessions on registration.
    pub fn problem_state(&self) -> watch::Receiver<Option<String>> {
        self.problem_cache.subscribe()
    }

    /// Serializes the snapshot once, publishes it for relays and delivers it
    /// to local sessions. Returns how many local sessions got it.
    pub async fn publish_snapshot(&self, snapshot: Snapshot) -> Result<usize, GatewayError> {
        let text = ServerMessage::PlayerState {
            players: snapshot.players,
        }
        .to_json()?;
        self.bus
            .publish(&self.snapshot_channel, text.clone().into_bytes());
        Ok(self.deliver_local(&text).await)
    }

    /// Serializes the problem list, caches it for sessions that register
    /// later, retains it on the bus for relays that start later and delivers
    /// it to local sessions.
    pub async fn publish_problems(&self, problems: Vec<Problem>) -> Result<usize, GatewayError> {
        let text = ServerMessage::ProblemState { objects: problems }.to_json()?;
        self.cache_problems(text.clone());
        self.bus
            .publish_retained(&self.problems_channel, text.clone().into_bytes());
        Ok(self.deliver_local(&text).await)
    }

    fn cache_problems(&self, text: String) {
        self.problem_cache.send_replace(Some(text));
    }

    /// Fills the cache from the list the simulator retained on the bus.
    /// Returns false if nothing was retained yet.
    pub fn restore_problems(&self) -> bool {
        let Some(payload) = self.bus.retained(&self.problems_channel) else {
            return false;
        };
        match String::from_utf8(payload.to_vec()) {
            Ok(text) => {
                self.cache_problems(text);
                true
            }
            Err(_) => {
                debug!("Ignoring non UTF-8 retained problem list");
                false
            }
        }
    }

    /// Hands `text` to every registered local session without blocking.
    pub async fn deliver_local(&self, text: &str) -> usize {
        let targets = self.sessions.read().await.broadcast_targets();

        let mut delivered = 0;
        for (identity, outbound) in targets {
            match outbound.try_send(Message::Text(text.to_string())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!("Outbound queue full for {}, dropping update", identity);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Session {} is closing, skipping update", identity);
                }
            }
        }
        delivered
    }
}

/// Forwards what the simulator publishes to this relay's own sessions.
pub async fn run_relay(
    mut snapshots: Subscription,
    mut problems: Subscription,
    broadcaster: Broadcaster,
) {
    info!(
        "Relaying {} and {} to local sessions",
        snapshots.channel(),
        problems.channel()
    );

    loop {
        tokio::select! {
            payload = snapshots.recv() => {
                let Some(payload) = payload else { break };
                match std::str::from_utf8(&payload) {
                    Ok(text) => {
                        broadcaster.deliver_local(text).await;
                    }
                    Err(_) => debug!("Dropping non UTF-8 snapshot"),
                }
            }
            payload = problems.recv() => {
                let Some(payload) = payload else { break };
                match String::from_utf8(payload.to_vec()) {
                    Ok(text) => {
                        broadcaster.cache_problems(text.clone());
                        broadcaster.deliver_local(&text).await;
                    }
                    Err(_) => debug!("Dropping non UTF-8 problem list"),
                }
            }
        }
    }
}
