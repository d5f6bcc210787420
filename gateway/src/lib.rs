//! # Arena Gateway Library
//!
//! This library provides the authoritative gateway for a shared real-time
//! arena. It accepts WebSocket clients, runs the simulation of one world
//! instance at a fixed tick rate, and streams position snapshots back to every
//! connected client.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! Only the tick engine mutates the world. Connection handlers describe what
//! they want as [`world::WorldCommand`]s; the engine applies all of them at the
//! start of a tick and then advances every player with the intents captured
//! at that instant.
//!
//! ### Session Management
//! Handles the complete lifecycle of a client connection:
//! - Handshake, identity assignment and registration
//! - Decoding of `movement` and `set_name` messages
//! - Heartbeat probing and termination of silent clients
//! - One idempotent cleanup path for every kind of disconnect
//!
//! ### Fan-out
//! Each snapshot is serialized once and queued to every registered session
//! without waiting. Slow clients lose updates, they never delay the tick.
//!
//! ## Horizontal Scaling
//!
//! Gateways sharing an instance name talk over a [`bus::MessageBus`]. Exactly
//! one of them is the simulator; the others are relays that forward their
//! sessions' commands on `<instance>.commands` and hand the snapshots
//! published on `<instance>` to their own sessions.
//!
//! ## Module Organization
//!
//! - `world`: player and problem storage, command application
//! - `physics`: motion models and pickup detection
//! - `simulation`: the tick engine and pickup policies
//! - `session` / `session_manager`: per-connection state and the local registry
//! - `liveness`: periodic heartbeat sweeps
//! - `broadcast`: snapshot and problem list delivery
//! - `bus`: publish/subscribe boundary between gateways
//! - `network`: listener, role wiring and the accept loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use gateway::bus::LocalBus;
//! use gateway::config::GatewayConfig;
//! use gateway::network::GatewayServer;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = Arc::new(LocalBus::new());
//!     let server = GatewayServer::bind(GatewayConfig::default(), bus).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod bus;
pub mod config;
pub mod error;
pub mod liveness;
pub mod network;
pub mod physics;
pub mod session;
pub mod session_manager;
pub mod simulation;
pub mod world;
