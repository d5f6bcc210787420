//! Connection sessions.
//!
//! A session binds one WebSocket connection to one player identity. It moves
//! through `Connecting -> Registered -> Active -> Closed`; whichever side
//! notices the end of the connection first (transport error, client close or
//! liveness timeout) drives it into `Closed`, and the cleanup path runs once.

use crate::error::GatewayError;
use crate::session_manager::SessionManager;
use crate::simulation::CommandSink;
use crate::world::WorldCommand;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{
    sanitize_name, ClientMessage, MotionModel, PlayerId, ServerMessage, Vector2,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Registered,
    Active,
    Closed,
}

/// Heartbeat bookkeeping, checked once per liveness period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    Outstanding { sent_at: Instant },
    Acknowledged,
}

/// Server-side record of one connected client.
#[derive(Debug)]
pub struct Session {
    pub identity: PlayerId,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    phase: SessionPhase,
    alive: bool,
    probe: ProbeState,
    latency_reported: bool,
    outbound: mpsc::Sender<Message>,
    terminate: Arc<Notify>,
}

impl Session {
    pub fn new(
        identity: PlayerId,
        addr: SocketAddr,
        outbound: mpsc::Sender<Message>,
        terminate: Arc<Notify>,
    ) -> Self {
        Self {
            identity,
            addr,
            connected_at: Instant::now(),
            phase: SessionPhase::Connecting,
            alive: true,
            probe: ProbeState::Idle,
            latency_reported: false,
            outbound,
            terminate,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn probe(&self) -> ProbeState {
        self.probe
    }

    /// Sessions only receive broadcasts once their registration went out.
    pub fn accepts_broadcasts(&self) -> bool {
        matches!(self.phase, SessionPhase::Registered | SessionPhase::Active)
    }

    pub fn mark_registered(&mut self) {
        if self.phase == SessionPhase::Connecting {
            self.phase = SessionPhase::Registered;
        }
    }

    pub fn mark_active(&mut self) {
        if matches!(self.phase, SessionPhase::Registered | SessionPhase::Active) {
            self.phase = SessionPhase::Active;
        }
    }

    pub fn mark_closed(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    /// Starts a new probe cycle. Returns false if the previous probe was never
    /// answered, in which case the session must be terminated instead.
    pub fn begin_probe(&mut self, now: Instant) -> bool {
        if !self.alive {
            return false;
        }
        self.alive = false;
        self.probe = ProbeState::Outstanding { sent_at: now };
        true
    }

    /// Records a probe response. Yields the round trip time for the first
    /// answered probe only.
    pub fn acknowledge_probe(&mut self, now: Instant) -> Option<Duration> {
        self.alive = true;
        let sent_at = match self.probe {
            ProbeState::Outstanding { sent_at } => sent_at,
            _ => return None,
        };
        self.probe = ProbeState::Acknowledged;

        if self.latency_reported {
            return None;
        }
        self.latency_reported = true;
        Some(now.saturating_duration_since(sent_at))
    }

    pub fn outbound(&self) -> &mpsc::Sender<Message> {
        &self.outbound
    }

    pub fn terminate_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.terminate)
    }
}

/// Everything a connection task needs from its gateway.
#[derive(Clone)]
pub struct SessionContext {
    pub sessions: Arc<RwLock<SessionManager>>,
    pub commands: CommandSink,
    pub problem_state: watch::Receiver<Option<String>>,
    pub motion_model: MotionModel,
    pub spawn: Vector2,
    pub outbound_queue: usize,
}

/// Short identity: first block of a v4 UUID.
pub fn generate_identity() -> PlayerId {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    PlayerId::new(&uuid[..8])
}

/// Turns one inbound text frame into a world mutation. Anything malformed,
/// unknown, or shaped for the other motion model yields `None`.
pub fn decode_command(model: MotionModel, identity: &PlayerId, text: &str) -> Option<WorldCommand> {
    let message = match ClientMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Dropping malformed message from {}: {}", identity, e);
            return None;
        }
    };

    match message {
        ClientMessage::Movement(payload) => match model.parse_movement(&payload) {
            Some(update) => Some(WorldCommand::SetIntent {
                identity: identity.clone(),
                update,
            }),
            None => {
                debug!("Dropping movement from {} with bad payload", identity);
                None
            }
        },
        ClientMessage::SetName { name } => Some(WorldCommand::SetName {
            identity: identity.clone(),
            name: sanitize_name(&name),
        }),
    }
}

pub fn latency_millis(latency: Duration) -> u64 {
    (latency.as_secs_f64() * 1000.0).ceil() as u64
}

/// Drives one client connection from handshake to cleanup.
pub async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: SessionContext,
) -> Result<(), GatewayError> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(ctx.outbound_queue.max(2));
    let terminate = Arc::new(Notify::new());

    let identity = {
        let mut sessions = ctx.sessions.write().await;
        let mut identity = generate_identity();
        while sessions.contains(&identity) {
            identity = generate_identity();
        }
        sessions.insert(Session::new(
            identity.clone(),
            addr,
            outbound_tx.clone(),
            Arc::clone(&terminate),
        ));
        identity
    };
    info!("Client {} connected from {}", identity, addr);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    ctx.commands
        .submit(WorldCommand::Register {
            identity: identity.clone(),
            position: ctx.spawn,
        })
        .await;

    if let Err(e) = send_registration(&ctx, &identity, &outbound_tx).await {
        warn!("Failed to register client {}: {}", identity, e);
        close_session(&ctx, &identity).await;
        writer.abort();
        return Err(e);
    }
    if let Some(session) = ctx.sessions.write().await.get_mut(&identity) {
        session.mark_registered();
    }

    loop {
        tokio::select! {
            message = ws_receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&ctx, &identity, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_text(&ctx, &identity, text).await,
                        Err(_) => debug!("Dropping non UTF-8 frame from {}", identity),
                    },
                    Some(Ok(Message::Pong(_))) => {
                        handle_pong(&ctx, &identity, &outbound_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client {} closed the connection", identity);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Transport error for {}: {}", identity, e);
                        break;
                    }
                }
            }
            _ = terminate.notified() => {
                info!("Client {} missed its heartbeat, terminating", identity);
                break;
            }
        }
    }

    close_session(&ctx, &identity).await;
    writer.abort();
    Ok(())
}

async fn send_registration(
    ctx: &SessionContext,
    identity: &PlayerId,
    outbound: &mpsc::Sender<Message>,
) -> Result<(), GatewayError> {
    let register = ServerMessage::Register {
        identity: identity.clone(),
    }
    .to_json()?;
    let problems = ctx.problem_state.borrow().clone();

    for text in std::iter::once(register).chain(problems) {
        outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| GatewayError::Bus("outbound queue closed".to_string()))?;
    }
    Ok(())
}

async fn handle_text(ctx: &SessionContext, identity: &PlayerId, text: &str) {
    let Some(command) = decode_command(ctx.motion_model, identity, text) else {
        return;
    };

    // Only the first mutation changes the phase, later frames stay on the read lock.
    let activate = ctx.sessions.read().await.awaiting_activation(identity);
    if activate {
        if let Some(session) = ctx.sessions.write().await.get_mut(identity) {
            session.mark_active();
        }
    }
    ctx.commands.submit(command).await;
}

async fn handle_pong(ctx: &SessionContext, identity: &PlayerId, outbound: &mpsc::Sender<Message>) {
    let latency = {
        let mut sessions = ctx.sessions.write().await;
        sessions.acknowledge_probe(identity, Instant::now())
    };

    let Some(latency) = latency else {
        return;
    };
    match (ServerMessage::Ping {
        ping: latency_millis(latency),
    })
    .to_json()
    {
        Ok(text) => {
            if outbound.try_send(Message::Text(text)).is_err() {
                debug!("Dropping ping report for {}", identity);
            }
        }
        Err(e) => warn!("Failed to encode ping for {}: {}", identity, e),
    }
}

/// Idempotent: removing an already removed session and unregistering an
/// absent player are both no-ops.
async fn close_session(ctx: &SessionContext, identity: &PlayerId) {
    let removed = ctx.sessions.write().await.remove(identity);
    if let Some(mut session) = removed {
        session.mark_closed();
        info!("Client {} disconnected", identity);
    }
    ctx.commands
        .submit(WorldCommand::Unregister {
            identity: identity.clone(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Direction, MovementUpdate};

    fn test_session() -> Session {
        let (tx, _rx) = mpsc::channel(4);
        Session::new(
            PlayerId::new("abcd1234"),
            "127.0.0.1:9000".parse().unwrap(),
            tx,
            Arc::new(Notify::new()),
        )
    }

    #[test]
    fn test_phase_transitions() {
        let mut session = test_session();
        assert_eq!(session.phase(), SessionPhase::Connecting);
        assert!(!session.accepts_broadcasts());

        session.mark_active();
        assert_eq!(session.phase(), SessionPhase::Connecting);

        session.mark_registered();
        assert_eq!(session.phase(), SessionPhase::Registered);
        assert!(session.accepts_broadcasts());

        session.mark_active();
        session.mark_active();
        assert_eq!(session.phase(), SessionPhase::Active);

        session.mark_closed();
        session.mark_registered();
        session.mark_active();
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(!session.accepts_broadcasts());
    }

    #[test]
    fn test_probe_cycle_reports_latency_once() {
        let mut session = test_session();
        let start = Instant::now();

        assert!(session.begin_probe(start));
        assert!(!session.is_alive());
        assert_eq!(session.probe(), ProbeState::Outstanding { sent_at: start });

        let latency = session.acknowledge_probe(start + Duration::from_millis(30));
        assert_eq!(latency, Some(Duration::from_millis(30)));
        assert!(session.is_alive());
        assert_eq!(session.probe(), ProbeState::Acknowledged);

        assert!(session.begin_probe(start + Duration::from_secs(2)));
        assert_eq!(
            session.acknowledge_probe(start + Duration::from_millis(2010)),
            None
        );
        assert!(session.is_alive());
    }

    #[test]
    fn test_unanswered_probe_fails_next_cycle() {
        let mut session = test_session();
        let start = Instant::now();

        assert!(session.begin_probe(start));
        assert!(!session.begin_probe(start + Duration::from_secs(2)));
    }

    #[test]
    fn test_unsolicited_pong_marks_alive_without_latency() {
        let mut session = test_session();
        assert_eq!(session.acknowledge_probe(Instant::now()), None);
        assert!(session.is_alive());
        assert_eq!(session.probe(), ProbeState::Idle);
    }

    #[test]
    fn test_generate_identity_is_short_hex() {
        let a = generate_identity();
        let b = generate_identity();
        assert_eq!(a.as_str().len(), 8);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_set_name_truncates() {
        let identity = PlayerId::new("p1");
        let command = decode_command(
            MotionModel::Impulse,
            &identity,
            r#"{"code":"set_name","payload":{"name":"a_very_long_name_over_sixteen_chars"}}"#,
        );
        match command {
            Some(WorldCommand::SetName { name, .. }) => assert_eq!(name, "a_very_long_name"),
            other => panic!("Unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_decode_movement_by_model() {
        let identity = PlayerId::new("p1");
        let impulse = r#"{"code":"movement","payload":{"pressed":1,"dir":"right"}}"#;
        let heading = r#"{"code":"movement","payload":{"angle":0.5}}"#;

        assert_eq!(
            decode_command(MotionModel::Impulse, &identity, impulse),
            Some(WorldCommand::SetIntent {
                identity: identity.clone(),
                update: MovementUpdate::Key {
                    direction: Direction::Right,
                    pressed: true
                }
            })
        );
        assert_eq!(decode_command(MotionModel::Impulse, &identity, heading), None);
        assert_eq!(
            decode_command(MotionModel::Heading, &identity, heading),
            Some(WorldCommand::SetIntent {
                identity: identity.clone(),
                update: MovementUpdate::Heading { angle: 0.5 }
            })
        );
        assert_eq!(decode_command(MotionModel::Heading, &identity, impulse), None);
    }

    #[test]
    fn test_decode_drops_malformed() {
        let identity = PlayerId::new("p1");
        for text in [
            "",
            "{",
            "[]",
            r#"{"code":"jump","payload":{}}"#,
            r#"{"code":"movement"}"#,
            r#"{"code":"movement","payload":{"pressed":true}}"#,
        ] {
            assert_eq!(decode_command(MotionModel::Impulse, &identity, text), None);
        }
    }

    #[test]
    fn test_latency_rounds_up() {
        assert_eq!(latency_millis(Duration::from_micros(12_100)), 13);
        assert_eq!(latency_millis(Duration::from_millis(12)), 12);
        assert_eq!(latency_millis(Duration::ZERO), 0);
    }
}
