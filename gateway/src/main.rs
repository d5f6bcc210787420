use clap::{Parser, ValueEnum};
use gateway::bus::{LocalBus, MessageBus};
use gateway::config::{validate_deployment, FieldBounds, GatewayConfig, GatewayRole, WorldConfig};
use gateway::network::GatewayServer;
use log::{error, info};
use shared::{MotionModel, Vector2, DEFAULT_INSTANCE, PICKUP_RADIUS};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Simulator,
    Relay,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MotionArg {
    Impulse,
    Heading,
}

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: IpAddr,
    /// Port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// World instance served by this gateway
    #[clap(short, long, default_value = DEFAULT_INSTANCE)]
    instance: String,
    /// Whether this gateway runs the simulation or relays it
    #[clap(long, value_enum, default_value = "simulator")]
    role: RoleArg,
    /// How movement messages are interpreted
    #[clap(long, value_enum, default_value = "impulse")]
    motion: MotionArg,
    #[clap(long, default_value = "4000")]
    field_width: f32,
    #[clap(long, default_value = "4000")]
    field_height: f32,
    /// Milliseconds between simulation ticks
    #[clap(long, default_value = "50")]
    tick_ms: u64,
    /// Milliseconds between heartbeat sweeps
    #[clap(long, default_value = "2000")]
    heartbeat_ms: u64,
    #[clap(long, default_value_t = PICKUP_RADIUS)]
    pickup_radius: f32,
    /// Number of problems placed at startup
    #[clap(long, default_value = "32")]
    problems: u32,
    /// Seed for problem placement
    #[clap(long)]
    seed: Option<u64>,
    /// Extra relay gateways to start on these ports, sharing this process's bus
    #[clap(long = "relay-port")]
    relay_ports: Vec<u16>,
}

impl Args {
    /// The main gateway first, then one relay per extra port.
    fn into_configs(self) -> Vec<GatewayConfig> {
        let field = FieldBounds {
            width: self.field_width.max(0.0),
            height: self.field_height.max(0.0),
        };
        let world = WorldConfig {
            motion_model: match self.motion {
                MotionArg::Impulse => MotionModel::Impulse,
                MotionArg::Heading => MotionModel::Heading,
            },
            field,
            spawn: field.clamp(Vector2::new(field.width / 2.0, field.height / 2.0)),
            pickup_radius: self.pickup_radius,
            problem_count: self.problems,
            seed: self.seed,
        };
        let config = GatewayConfig {
            bind_addr: SocketAddr::new(self.host, self.port),
            instance: self.instance,
            role: match self.role {
                RoleArg::Simulator => GatewayRole::Simulator,
                RoleArg::Relay => GatewayRole::Relay,
            },
            world,
            tick_period: Duration::from_millis(self.tick_ms.max(1)),
            heartbeat_period: Duration::from_millis(self.heartbeat_ms.max(1)),
            ..GatewayConfig::default()
        };
        let mut configs = vec![config.clone()];
        for port in self.relay_ports {
            configs.push(GatewayConfig {
                bind_addr: SocketAddr::new(config.bind_addr.ip(), port),
                role: GatewayRole::Relay,
                ..config.clone()
            });
        }
        configs
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let configs = Args::parse().into_configs();
    // Relays only see commands and snapshots through this process's bus.
    validate_deployment(&configs)?;
    let instance = configs[0].instance.clone();
    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());

    let mut servers = Vec::new();
    for config in configs {
        servers.push(GatewayServer::bind(config, Arc::clone(&bus)).await?);
    }

    let mut handles = Vec::new();
    for server in servers {
        handles.push(tokio::spawn(server.run()));
    }
    info!("Started {} gateway(s) for instance {}", handles.len(), instance);

    tokio::select! {
        (result, index, _) = futures_util::future::select_all(handles) => {
            match result {
                Ok(Ok(())) => info!("Gateway {} stopped", index),
                Ok(Err(e)) => error!("Gateway {} failed: {}", index, e),
                Err(e) => error!("Gateway {} task panicked: {}", index, e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
