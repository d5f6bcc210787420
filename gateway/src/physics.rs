use crate::config::FieldBounds;
use shared::{Direction, MotionModel, MovementUpdate, Vector2, PLAYER_SPEED, VELOCITY_DECAY};

///Which direction keys a player currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectionKeys {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
}

impl DirectionKeys {
    pub fn set(&mut self, direction: Direction, pressed: bool) {
        match direction {
            Direction::Up => self.up = pressed,
            Direction::Down => self.down = pressed,
            Direction::Left => self.left = pressed,
            Direction::Right => self.right = pressed,
        }
    }
}

///Movement state of a single player.
///Velocity lives inside the impulse variant so position and velocity are
///always advanced together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Motion {
    Impulse {
        keys: DirectionKeys,
        velocity: Vector2,
    },
    ///`None` until the first heading arrives; the player stands still until then.
    Heading { angle: Option<f32> },
}

impl Motion {
    ///Returns a motionless state for the given model.
    pub fn at_rest(model: MotionModel) -> Self {
        match model {
            MotionModel::Impulse => Motion::Impulse {
                keys: DirectionKeys::default(),
                velocity: Vector2::ZERO,
            },
            MotionModel::Heading => Motion::Heading { angle: None },
        }
    }

    ///Stores the latest intent. Returns false if the update belongs to the other model.
    pub fn apply(&mut self, update: MovementUpdate) -> bool {
        match (self, update) {
            (Motion::Impulse { keys, .. }, MovementUpdate::Key { direction, pressed }) => {
                keys.set(direction, pressed);
                true
            }
            (Motion::Heading { angle }, MovementUpdate::Heading { angle: new_angle }) => {
                *angle = Some(new_angle);
                true
            }
            _ => false,
        }
    }

    pub fn velocity(&self) -> Option<Vector2> {
        match self {
            Motion::Impulse { velocity, .. } => Some(*velocity),
            Motion::Heading { .. } => None,
        }
    }

    /// Advances one tick and returns the new position, clamped into the field.
    pub fn step(&mut self, position: Vector2, field: &FieldBounds) -> Vector2 {
        let moved = match self {
            Motion::Impulse { keys, velocity } => {
                velocity.x *= VELOCITY_DECAY;
                velocity.y *= VELOCITY_DECAY;

                if keys.up {
                    velocity.y = -PLAYER_SPEED;
                }
                if keys.down {
                    velocity.y = PLAYER_SPEED;
                }
                if keys.left {
                    velocity.x = -PLAYER_SPEED;
                }
                if keys.right {
                    velocity.x = PLAYER_SPEED;
                }

                Vector2::new(position.x + velocity.x, position.y + velocity.y)
            }
            Motion::Heading { angle: Some(angle) } => Vector2::new(
                position.x + angle.cos() * PLAYER_SPEED,
                position.y + angle.sin() * PLAYER_SPEED,
            ),
            Motion::Heading { angle: None } => position,
        };

        field.clamp(moved)
    }
}

/// True when the player is close enough to collect the object. The boundary counts.
pub fn within_pickup_range(player: &Vector2, object: &Vector2, radius: f32) -> bool {
    player.distance(object) <= radius
}
