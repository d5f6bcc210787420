//! Typed configuration for one gateway process.

use crate::error::GatewayError;
use shared::{
    MotionModel, Vector2, DEFAULT_INSTANCE, FIELD_MAX_HEIGHT, FIELD_MAX_WIDTH, HEARTBEAT_MILLIS,
    PICKUP_RADIUS, SPAWN_X, SPAWN_Y, TICK_MILLIS,
};
use std::net::SocketAddr;
use std::time::Duration;

/// Whether this gateway owns the simulation for its instance or only relays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayRole {
    /// Runs the tick engine and publishes snapshots.
    Simulator,
    /// Forwards mutations to the simulator and snapshots to its own sessions.
    Relay,
}

/// Rectangular playing field. Positions always stay inside `[0, width] x [0, height]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldBounds {
    pub width: f32,
    pub height: f32,
}

impl FieldBounds {
    pub fn clamp(&self, position: Vector2) -> Vector2 {
        Vector2 {
            x: position.x.clamp(0.0, self.width),
            y: position.y.clamp(0.0, self.height),
        }
    }

    pub fn contains(&self, position: &Vector2) -> bool {
        (0.0..=self.width).contains(&position.x) && (0.0..=self.height).contains(&position.y)
    }
}

impl Default for FieldBounds {
    fn default() -> Self {
        Self {
            width: FIELD_MAX_WIDTH,
            height: FIELD_MAX_HEIGHT,
        }
    }
}

/// Simulation parameters shared by the world store and the tick engine.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldConfig {
    pub motion_model: MotionModel,
    pub field: FieldBounds,
    pub spawn: Vector2,
    pub pickup_radius: f32,
    pub problem_count: u32,
    pub seed: Option<u64>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            motion_model: MotionModel::default(),
            field: FieldBounds::default(),
            spawn: Vector2::new(SPAWN_X, SPAWN_Y),
            pickup_radius: PICKUP_RADIUS,
            problem_count: 32,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    /// Instance name, also the bus channel snapshots are published on.
    pub instance: String,
    pub role: GatewayRole,
    pub world: WorldConfig,
    pub tick_period: Duration,
    pub heartbeat_period: Duration,
    /// Re-send the problem list every this many ticks.
    pub problem_broadcast_ticks: u64,
    /// Per-session outbound queue depth; updates beyond it are dropped.
    pub outbound_queue: usize,
}

impl GatewayConfig {
    /// Bus queue relays push world commands onto.
    pub fn commands_queue(&self) -> String {
        format!("{}.commands", self.instance)
    }

    pub fn problems_channel(&self) -> String {
        format!("{}.problems", self.instance)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            instance: DEFAULT_INSTANCE.to_string(),
            role: GatewayRole::Simulator,
            world: WorldConfig::default(),
            tick_period: Duration::from_millis(TICK_MILLIS),
            heartbeat_period: Duration::from_millis(HEARTBEAT_MILLIS),
            problem_broadcast_ticks: 100,
            outbound_queue: 64,
        }
    }
}

/// Checks a set of gateways sharing one in-process bus: every instance
/// served by a relay needs exactly one simulator among them.
pub fn validate_deployment(gateways: &[GatewayConfig]) -> Result<(), GatewayError> {
    for gateway in gateways {
        let simulators = gateways
            .iter()
            .filter(|g| g.instance == gateway.instance && g.role == GatewayRole::Simulator)
            .count();
        match simulators {
            1 => {}
            0 => {
                return Err(GatewayError::Config(format!(
                    "instance {} has relays but no simulator",
                    gateway.instance
                )))
            }
            n => {
                return Err(GatewayError::Config(format!(
                    "instance {} has {} simulators",
                    gateway.instance, n
                )))
            }
        }
    }
    Ok(())
}
