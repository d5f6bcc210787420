//! Authoritative world state for one instance.
//!
//! The world is owned by the simulation task. Sessions never touch it
//! directly; they describe mutations as [`WorldCommand`]s which the tick
//! engine applies between ticks, so a tick always observes either all or none
//! of a mutation.

use crate::config::{FieldBounds, WorldConfig};
use crate::error::WorldError;
use crate::physics::{within_pickup_range, Motion};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use shared::{sanitize_name, MovementUpdate, PlayerId, PlayerView, Problem, Vector2, DEFAULT_NAME};
use std::collections::HashMap;

/// Authoritative per-player record, owned by the tick task.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub identity: PlayerId,
    pub name: String,
    pub position: Vector2,
    pub motion: Motion,
}

impl PlayerState {
    pub fn view(&self) -> PlayerView {
        PlayerView {
            identity: self.identity.clone(),
            name: self.name.clone(),
            position: self.position,
        }
    }
}

/// A mutation requested by a session. Serializable so relays can forward
/// them to the simulator over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorldCommand {
    Register { identity: PlayerId, position: Vector2 },
    Unregister { identity: PlayerId },
    SetName { identity: PlayerId, name: String },
    SetIntent { identity: PlayerId, update: MovementUpdate },
}

impl WorldCommand {
    pub fn identity(&self) -> &PlayerId {
        match self {
            WorldCommand::Register { identity, .. }
            | WorldCommand::Unregister { identity }
            | WorldCommand::SetName { identity, .. }
            | WorldCommand::SetIntent { identity, .. } => identity,
        }
    }
}

/// A player came within pickup range of a problem during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickupEvent {
    pub player: PlayerId,
    pub problem_id: u32,
}

/// Read-only copy of the world handed out for serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldView {
    pub players: HashMap<PlayerId, PlayerView>,
    pub problems: Vec<Problem>,
}

/// Players and problems of one instance.
///
/// Only the simulation task holds a `World`; every change arrives as a
/// [`WorldCommand`] applied between ticks.
#[derive(Debug)]
pub struct World {
    config: WorldConfig,
    players: HashMap<PlayerId, PlayerState>,
    problems: Vec<Problem>,
}

impl World {
    pub fn new(config: WorldConfig, problems: Vec<Problem>) -> Self {
        Self {
            config,
            players: HashMap::new(),
            problems,
        }
    }

    /// Creates a world with freshly placed problems. A configured seed makes
    /// the placement reproducible.
    pub fn generate(config: WorldConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let problems = generate_problems(config.problem_count, &config.field, &mut rng);
        Self::new(config, problems)
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Adds a player at `position` (clamped to the field) with the default
    /// name and a resting motion state.
    ///
    /// Fails with [`WorldError::DuplicatePlayer`] if the identity is present.
    pub fn register(
        &mut self,
        identity: PlayerId,
        position: Vector2,
    ) -> Result<&PlayerState, WorldError> {
        if self.players.contains_key(&identity) {
            return Err(WorldError::DuplicatePlayer(identity));
        }

        let player = PlayerState {
            identity: identity.clone(),
            name: DEFAULT_NAME.to_string(),
            position: self.config.field.clamp(position),
            motion: Motion::at_rest(self.config.motion_model),
        };

        info!(
            "Added player {} at ({}, {})",
            identity, player.position.x, player.position.y
        );
        Ok(self.players.entry(identity).or_insert(player))
    }

    /// Removes a player. Unknown identities are a no-op.
    pub fn unregister(&mut self, identity: &PlayerId) -> Option<PlayerState> {
        let removed = self.players.remove(identity);
        if removed.is_some() {
            info!("Removed player {}", identity);
        }
        removed
    }

    /// Returns false when the player is unknown.
    pub fn set_name(&mut self, identity: &PlayerId, name: &str) -> bool {
        match self.players.get_mut(identity) {
            Some(player) => {
                player.name = sanitize_name(name);
                true
            }
            None => false,
        }
    }

    /// Replaces the player's intent. Returns false when the player is unknown
    /// or the update does not match the instance's motion model.
    pub fn set_intent(&mut self, identity: &PlayerId, update: MovementUpdate) -> bool {
        match self.players.get_mut(identity) {
            Some(player) => player.motion.apply(update),
            None => false,
        }
    }

    /// Applies one command as a whole. Commands that cannot take effect are
    /// logged and dropped.
    pub fn apply(&mut self, command: WorldCommand) {
        match command {
            WorldCommand::Register { identity, position } => {
                if let Err(e) = self.register(identity, position) {
                    debug!("Ignoring register: {}", e);
                }
            }
            WorldCommand::Unregister { identity } => {
                self.unregister(&identity);
            }
            WorldCommand::SetName { identity, name } => {
                if !self.set_name(&identity, &name) {
                    debug!("Ignoring name for unknown player {}", identity);
                }
            }
            WorldCommand::SetIntent { identity, update } => {
                if !self.set_intent(&identity, update) {
                    debug!("Ignoring intent for player {}", identity);
                }
            }
        }
    }

    /// Copies the current players and problems. Later mutations do not show
    /// through the returned view.
    pub fn snapshot(&self) -> WorldView {
        WorldView {
            players: self
                .players
                .iter()
                .map(|(id, player)| (id.clone(), player.view()))
                .collect(),
            problems: self.problems.clone(),
        }
    }

    pub fn player(&self, identity: &PlayerId) -> Option<&PlayerState> {
        self.players.get(identity)
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.values()
    }

    pub fn problems(&self) -> &[Problem] {
        &self.problems
    }

    /// Takes a problem out of the world, if it is still there.
    pub fn remove_problem(&mut self, problem_id: u32) -> Option<Problem> {
        let index = self.problems.iter().position(|p| p.id == problem_id)?;
        Some(self.problems.remove(index))
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Moves every player one tick, keeping them inside the field, and
    /// reports which problems they reached.
    pub fn advance(&mut self) -> Vec<PickupEvent> {
        let field = self.config.field;
        let radius = self.config.pickup_radius;
        let mut pickups = Vec::new();

        for player in self.players.values_mut() {
            player.position = player.motion.step(player.position, &field);

            for problem in &self.problems {
                if within_pickup_range(&player.position, &problem.position, radius) {
                    pickups.push(PickupEvent {
                        player: player.identity.clone(),
                        problem_id: problem.id,
                    });
                }
            }
        }

        pickups
    }
}

const OPERATORS: [char; 3] = ['+', '-', '*'];

pub fn generate_problems(count: u32, field: &FieldBounds, rng: &mut impl Rng) -> Vec<Problem> {
    (0..count)
        .map(|id| {
            let a: u32 = rng.gen_range(1..=12);
            let b: u32 = rng.gen_range(1..=12);
            let op = OPERATORS[rng.gen_range(0..OPERATORS.len())];
            Problem {
                id,
                position: Vector2::new(
                    rng.gen_range(0.0..=field.width),
                    rng.gen_range(0.0..=field.height),
                ),
                label: format!("{} {} {}", a, op, b),
            }
        })
        .collect()
}
