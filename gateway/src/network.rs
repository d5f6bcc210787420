use crate::broadcast::{run_relay, Broadcaster};
use crate::bus::MessageBus;
use crate::config::{GatewayConfig, GatewayRole};
use crate::error::GatewayError;
use crate::liveness::run_liveness_monitor;
use crate::session::{run_session, SessionContext};
use crate::session_manager::SessionManager;
use crate::simulation::{
    run_command_bridge, run_simulation, CommandSink, LogPickups, PickupPolicy, Simulation,
};
use crate::world::{World, WorldCommand};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};

/// One gateway process: accepts WebSocket clients and, depending on its role,
/// either runs the instance's simulation or relays it from the bus.
pub struct GatewayServer {
    config: Arc<GatewayConfig>,
    listener: TcpListener,
    bus: Arc<dyn MessageBus>,
    sessions: Arc<RwLock<SessionManager>>,
    pickup_policy: Option<Box<dyn PickupPolicy>>,
}

impl GatewayServer {
    pub async fn bind(
        config: GatewayConfig,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(
            "Gateway for {} ({:?}) listening on {}",
            config.instance,
            config.role,
            listener.local_addr()?
        );

        Ok(Self {
            config: Arc::new(config),
            listener,
            bus,
            sessions: Arc::new(RwLock::new(SessionManager::new())),
            pickup_policy: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn sessions(&self) -> Arc<RwLock<SessionManager>> {
        Arc::clone(&self.sessions)
    }

    /// Replaces the default pickup handling. Only used by simulators.
    pub fn with_pickup_policy(mut self, policy: Box<dyn PickupPolicy>) -> Self {
        self.pickup_policy = Some(policy);
        self
    }

    /// Starts the background tasks for this role and serves clients until the
    /// task is dropped.
    pub async fn run(self) -> Result<(), GatewayError> {
        let GatewayServer {
            config,
            listener,
            bus,
            sessions,
            pickup_policy,
        } = self;

        let broadcaster = Broadcaster::new(
            Arc::clone(&sessions),
            Arc::clone(&bus),
            config.instance.clone(),
            config.problems_channel(),
        );

        let commands = match config.role {
            GatewayRole::Simulator => {
                let world = World::generate(config.world.clone());
                let policy = pickup_policy
                    .unwrap_or_else(|| Box::new(LogPickups) as Box<dyn PickupPolicy>);
                let simulation = Simulation::new(world, policy);
                broadcaster.publish_problems(simulation.problems()).await?;

                let queue = config.commands_queue();
                let consumer = bus.consume(&queue).ok_or_else(|| {
                    GatewayError::Bus(format!("{} is already consumed by a simulator", queue))
                })?;

                let (cmd_sender, cmd_receiver) = mpsc::channel::<WorldCommand>(1000);
                tokio::spawn(run_command_bridge(consumer, cmd_sender.clone()));
                tokio::spawn(run_simulation(
                    simulation,
                    cmd_receiver,
                    broadcaster.clone(),
                    config.tick_period,
                    config.problem_broadcast_ticks,
                ));
                CommandSink::Local(cmd_sender)
            }
            GatewayRole::Relay => {
                let snapshots = bus.subscribe(&config.instance);
                let problems = bus.subscribe(&config.problems_channel());
                if !broadcaster.restore_problems() {
                    warn!(
                        "No problem list retained for {} yet, new sessions get it once published",
                        config.instance
                    );
                }
                tokio::spawn(run_relay(snapshots, problems, broadcaster.clone()));
                CommandSink::Bus {
                    bus: Arc::clone(&bus),
                    queue: config.commands_queue(),
                }
            }
        };

        tokio::spawn(run_liveness_monitor(
            Arc::clone(&sessions),
            config.heartbeat_period,
        ));

        let ctx = SessionContext {
            sessions,
            commands,
            problem_state: broadcaster.problem_state(),
            motion_model: config.world.motion_model,
            spawn: config.world.spawn,
            outbound_queue: config.outbound_queue,
        };

        info!("Gateway started successfully");

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = run_session(stream, addr, ctx).await {
                            warn!("Session from {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;

    fn loopback_config(role: GatewayRole) -> GatewayConfig {
        GatewayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            role,
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let bus = Arc::new(LocalBus::new());
        let server = GatewayServer::bind(loopback_config(GatewayRole::Simulator), bus)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.sessions().read().await.is_empty());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
        let first = GatewayServer::bind(loopback_config(GatewayRole::Simulator), bus.clone())
            .await
            .unwrap();

        let taken = GatewayConfig {
            bind_addr: first.local_addr().unwrap(),
            ..loopback_config(GatewayRole::Relay)
        };
        let result = GatewayServer::bind(taken, bus).await;
        assert!(matches!(result, Err(GatewayError::Bind(_))));
    }

    #[tokio::test]
    async fn test_simulator_publishes_initial_problems() {
        let bus = Arc::new(LocalBus::new());
        let mut problems = bus.subscribe("game1.problems");
        let server = GatewayServer::bind(loopback_config(GatewayRole::Simulator), bus.clone())
            .await
            .unwrap();
        let task = tokio::spawn(server.run());

        let payload = tokio::time::timeout(Duration::from_secs(1), problems.recv())
            .await
            .unwrap()
            .unwrap();
        let text = std::str::from_utf8(&payload).unwrap();
        assert!(text.starts_with(r#"{"code":"problem_state""#));
        task.abort();
    }

    /// A second simulator for the same instance cannot steal the command queue
    #[tokio::test]
    async fn test_second_simulator_refused() {
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
        let first = GatewayServer::bind(loopback_config(GatewayRole::Simulator), bus.clone())
            .await
            .unwrap();
        let second = GatewayServer::bind(loopback_config(GatewayRole::Simulator), bus)
            .await
            .unwrap();
        let task = tokio::spawn(first.run());
        // Let the first simulator claim the queue.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = tokio::time::timeout(Duration::from_secs(1), second.run())
            .await
            .unwrap();
        assert!(matches!(result, Err(GatewayError::Bus(_))));
        task.abort();
    }
}
