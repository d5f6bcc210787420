//! Fixed-rate simulation of one instance.
//!
//! Each tick first applies every command queued since the previous tick, then
//! advances all players using the intents captured at that moment. Commands
//! arriving while a tick is in progress wait for the next one. Serialization
//! and fan-out happen after the world pass, outside of it.

use crate::broadcast::Broadcaster;
use crate::bus::{MessageBus, QueueConsumer};
use crate::world::{PickupEvent, World, WorldCommand};
use log::{debug, info, warn};
use shared::{PlayerId, PlayerView, Problem};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Where a session's world mutations go: straight into the local tick engine,
/// or over the bus to the simulator of the instance.
#[derive(Clone)]
pub enum CommandSink {
    Local(mpsc::Sender<WorldCommand>),
    /// Lossless bus queue drained by the simulator's command bridge.
    Bus {
        bus: Arc<dyn MessageBus>,
        queue: String,
    },
}

impl CommandSink {
    /// Hands one mutation to the simulator. Never drops a command while the
    /// simulator is running.
    pub async fn submit(&self, command: WorldCommand) {
        match self {
            CommandSink::Local(sender) => {
                if let Err(e) = sender.send(command).await {
                    warn!("Simulation is gone, dropping command: {:?}", e.0);
                }
            }
            CommandSink::Bus { bus, queue } => match serde_json::to_vec(&command) {
                Ok(payload) => {
                    if !bus.enqueue(queue, payload) {
                        warn!("Simulator stopped consuming {}, dropping command", queue);
                    }
                }
                Err(e) => warn!("Failed to encode command: {}", e),
            },
        }
    }
}

/// Player positions after one tick, rounded for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tick: u64,
    pub players: HashMap<PlayerId, PlayerView>,
}

/// Everything one tick produced.
#[derive(Debug, Clone)]
pub struct TickOutput {
    pub snapshot: Snapshot,
    pub pickups: Vec<PickupEvent>,
    pub problems_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickupOutcome {
    Keep,
    Remove,
}

/// Decides what a pickup does to the world.
pub trait PickupPolicy: Send {
    fn on_pickup(&mut self, event: &PickupEvent) -> PickupOutcome;
}

/// Logs each hit and leaves the problem in place.
#[derive(Debug, Default)]
pub struct LogPickups;

impl PickupPolicy for LogPickups {
    fn on_pickup(&mut self, event: &PickupEvent) -> PickupOutcome {
        debug!("Player {} hit problem {}", event.player, event.problem_id);
        PickupOutcome::Keep
    }
}

/// The tick engine's state: the world it owns, the pickup policy and the
/// number of ticks run so far.
pub struct Simulation {
    world: World,
    policy: Box<dyn PickupPolicy>,
    tick: u64,
}

impl Simulation {
    pub fn new(world: World, policy: Box<dyn PickupPolicy>) -> Self {
        Self {
            world,
            policy,
            tick: 0,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn problems(&self) -> Vec<Problem> {
        self.world.problems().to_vec()
    }

    /// Applies one queued mutation. Only called between ticks.
    pub fn apply(&mut self, command: WorldCommand) {
        self.world.apply(command);
    }

    /// Runs one tick
    ///
    /// Advances every player, lets the pickup policy decide the fate of each
    /// hit object and returns the rounded snapshot. Does no I/O.
    pub fn step(&mut self) -> TickOutput {
        self.tick += 1;

        let pickups = self.world.advance();
        let mut problems_changed = false;
        for event in &pickups {
            if self.policy.on_pickup(event) == PickupOutcome::Remove {
                problems_changed |= self.world.remove_problem(event.problem_id).is_some();
            }
        }

        let players = self
            .world
            .players()
            .map(|player| {
                let mut view = player.view();
                view.position = view.position.rounded();
                (player.identity.clone(), view)
            })
            .collect();

        TickOutput {
            snapshot: Snapshot {
                tick: self.tick,
                players,
            },
            pickups,
            problems_changed,
        }
    }
}

/// Runs the tick loop until the process exits.
pub async fn run_simulation(
    mut simulation: Simulation,
    mut commands: mpsc::Receiver<WorldCommand>,
    broadcaster: Broadcaster,
    tick_period: Duration,
    problem_broadcast_ticks: u64,
) {
    let mut interval_timer = interval(tick_period);
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Skip the first tick since it fires immediately
    interval_timer.tick().await;

    info!(
        "Simulation started at {:.1} ticks/s",
        1.0 / tick_period.as_secs_f64()
    );

    loop {
        interval_timer.tick().await;

        while let Ok(command) = commands.try_recv() {
            simulation.apply(command);
        }

        let output = simulation.step();
        let tick = output.snapshot.tick;

        if let Err(e) = broadcaster.publish_snapshot(output.snapshot).await {
            warn!("Failed to publish snapshot for tick {}: {}", tick, e);
        }

        let periodic = problem_broadcast_ticks > 0 && tick % problem_broadcast_ticks == 0;
        if output.problems_changed || periodic {
            if let Err(e) = broadcaster.publish_problems(simulation.problems()).await {
                warn!("Failed to publish problems: {}", e);
            }
        }

        if tick % 100 == 0 {
            debug!(
                "Tick {}: {} players, {} pickups",
                tick,
                simulation.world().len(),
                output.pickups.len()
            );
        }
    }
}

/// Feeds commands enqueued by relays into the local tick engine, in order.
pub async fn run_command_bridge(mut consumer: QueueConsumer, sender: mpsc::Sender<WorldCommand>) {
    while let Some(payload) = consumer.recv().await {
        match serde_json::from_slice::<WorldCommand>(&payload) {
            Ok(command) => {
                if sender.send(command).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Dropping undecodable command on {}: {}", consumer.queue(), e),
        }
    }
}
