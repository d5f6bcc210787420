//! Heartbeat probing of connected sessions.

use crate::session_manager::{LivenessAction, SessionManager};
use log::{debug, info};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub terminated: usize,
}

/// Runs one sweep. The session lock is released before any ping is queued
/// or any connection is told to close.
pub async fn sweep(sessions: &RwLock<SessionManager>) -> SweepReport {
    let actions = sessions.write().await.sweep_liveness(Instant::now());

    let mut report = SweepReport::default();
    for action in actions {
        match action {
            LivenessAction::Probe { identity, outbound } => {
                if outbound.try_send(Message::Ping(Vec::new())).is_err() {
                    debug!("Could not queue heartbeat for {}", identity);
                }
                report.probed += 1;
            }
            LivenessAction::Terminate {
                identity,
                terminate,
            } => {
                info!("Session {} did not answer its heartbeat", identity);
                terminate.notify_one();
                report.terminated += 1;
            }
        }
    }
    report
}

pub async fn run_liveness_monitor(sessions: Arc<RwLock<SessionManager>>, period: Duration) {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer.tick().await;

    loop {
        timer.tick().await;
        let report = sweep(&sessions).await;
        if report.terminated > 0 {
            debug!(
                "Liveness sweep: {} probed, {} terminated",
                report.probed, report.terminated
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use shared::PlayerId;
    use tokio::sync::{mpsc, Notify};

    fn add(manager: &mut SessionManager, id: &str) -> (mpsc::Receiver<Message>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(4);
        let terminate = Arc::new(Notify::new());
        manager.insert(Session::new(
            PlayerId::new(id),
            "127.0.0.1:9000".parse().unwrap(),
            tx,
            terminate.clone(),
        ));
        (rx, terminate)
    }

    #[tokio::test]
    async fn test_first_sweep_sends_ping() {
        let sessions = RwLock::new(SessionManager::new());
        let (mut rx, _) = add(&mut *sessions.write().await, "a");

        let report = sweep(&sessions).await;
        assert_eq!(report, SweepReport { probed: 1, terminated: 0 });
        assert!(matches!(rx.recv().await, Some(Message::Ping(_))));
    }

    /// No pong between two sweeps means the connection is closed
    #[tokio::test]
    async fn test_silent_session_is_terminated_on_second_sweep() {
        let sessions = RwLock::new(SessionManager::new());
        let (_rx, terminate) = add(&mut *sessions.write().await, "silent");

        sweep(&sessions).await;
        let report = sweep(&sessions).await;
        assert_eq!(report, SweepReport { probed: 0, terminated: 1 });

        // notify_one stores a permit, so the session sees it even if it was
        // not waiting yet.
        tokio::time::timeout(Duration::from_millis(100), terminate.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_answering_session_survives() {
        let sessions = RwLock::new(SessionManager::new());
        let (_rx, _) = add(&mut *sessions.write().await, "chatty");
        let id = PlayerId::new("chatty");

        for _ in 0..3 {
            let report = sweep(&sessions).await;
            assert_eq!(report.terminated, 0);
            sessions.write().await.acknowledge_probe(&id, Instant::now());
        }
    }

    #[tokio::test]
    async fn test_full_queue_still_counts_as_probed() {
        let sessions = RwLock::new(SessionManager::new());
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(Message::Text("filler".to_string())).unwrap();
        sessions.write().await.insert(Session::new(
            PlayerId::new("busy"),
            "127.0.0.1:9000".parse().unwrap(),
            tx,
            Arc::new(Notify::new()),
        ));

        assert_eq!(sweep(&sessions).await.probed, 1);
        assert_eq!(sweep(&sessions).await.terminated, 1);
    }
}
