//! Registry of the sessions held by this gateway process
//!
//! This module tracks every locally connected client:
//! - Session insertion and removal over the connection lifecycle
//! - Liveness sweeps that decide which sessions to probe or terminate
//! - Collection of outbound queues for snapshot fan-out
//!
//! All methods are synchronous and cheap so callers can hold the surrounding
//! lock briefly and perform any I/O after releasing it.

use crate::session::{Session, SessionPhase};
use shared::PlayerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;

/// What the liveness monitor has to do for one session after a sweep
#[derive(Debug)]
pub enum LivenessAction {
    /// Send a heartbeat ping through the session's outbound queue
    Probe {
        identity: PlayerId,
        outbound: mpsc::Sender<Message>,
    },
    /// The previous probe went unanswered; close the connection
    Terminate {
        identity: PlayerId,
        terminate: Arc<Notify>,
    },
}

/// Manages all sessions connected to this gateway
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<PlayerId, Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Adds a session. Returns false if the identity is already taken.
    pub fn insert(&mut self, session: Session) -> bool {
        if self.sessions.contains_key(&session.identity) {
            return false;
        }
        self.sessions.insert(session.identity.clone(), session);
        true
    }

    /// Removes a session, returning it if it was still present
    pub fn remove(&mut self, identity: &PlayerId) -> Option<Session> {
        self.sessions.remove(identity)
    }

    pub fn contains(&self, identity: &PlayerId) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn get(&self, identity: &PlayerId) -> Option<&Session> {
        self.sessions.get(identity)
    }

    pub fn get_mut(&mut self, identity: &PlayerId) -> Option<&mut Session> {
        self.sessions.get_mut(identity)
    }

    /// True while the session is registered but has not sent a mutation yet.
    pub fn awaiting_activation(&self, identity: &PlayerId) -> bool {
        self.sessions
            .get(identity)
            .map_or(false, |session| session.phase() == SessionPhase::Registered)
    }

    /// Records a heartbeat response. Returns the round trip time when this is
    /// the session's first answered probe.
    pub fn acknowledge_probe(&mut self, identity: &PlayerId, now: Instant) -> Option<Duration> {
        self.sessions
            .get_mut(identity)
            .and_then(|session| session.acknowledge_probe(now))
    }

    /// Runs one heartbeat period over every session
    ///
    /// Sessions that never answered the previous probe are marked for
    /// termination; all others start a new probe cycle. Exactly one action is
    /// produced per session per sweep.
    pub fn sweep_liveness(&mut self, now: Instant) -> Vec<LivenessAction> {
        self.sessions
            .values_mut()
            .map(|session| {
                if session.begin_probe(now) {
                    LivenessAction::Probe {
                        identity: session.identity.clone(),
                        outbound: session.outbound().clone(),
                    }
                } else {
                    LivenessAction::Terminate {
                        identity: session.identity.clone(),
                        terminate: session.terminate_handle(),
                    }
                }
            })
            .collect()
    }

    /// Outbound queues of every session that may receive broadcasts
    pub fn broadcast_targets(&self) -> Vec<(PlayerId, mpsc::Sender<Message>)> {
        self.sessions
            .values()
            .filter(|session| session.accepts_broadcasts())
            .map(|session| (session.identity.clone(), session.outbound().clone()))
            .collect()
    }

    pub fn identities(&self) -> Vec<PlayerId> {
        self.sessions.keys().cloned().collect()
    }

    /// Returns the number of currently connected sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no sessions are currently connected
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
