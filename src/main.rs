use std::sync::Arc;
use thermo_sensorhub::config::load_sensor_config;
use thermo_sensorhub::grpc_service::{create_grpc_server, ThermoHubService};
use thermo_sensorhub::registry::init_all;
use thermo_sensorhub::scheduler::spawn_sensor_tasks;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // RUST_LOG=debug for verbose, RUST_LOG=info for normal operation
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("[ThermoSensorHub] starting up...");

    // Load configuration from CONFIG_PATH or default
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    let sensor_config_path = format!("{}/sensors.toml", config_path);
    let sensor_config =
        load_sensor_config(&sensor_config_path).expect("Failed to load sensor config");
    info!("[config] loaded {} sensor(s)", sensor_config.sensors.len());

    // Create gRPC service
    let grpc_service = Arc::new(ThermoHubService::new());
    info!("[gRPC] service initialized");

    // Initialize sensors and buses
    let (sensors, buses) = init_all(&sensor_config)
        .await
        .expect("Initialization failed");
    info!("[registry] sensors and buses initialized");

    // Spawn sensor polling tasks
    spawn_sensor_tasks(sensors, buses, grpc_service.clone()).await;
    info!("[main] sensor tasks launched");

    // Start gRPC server
    let host = std::env::var("GRPC_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("GRPC_PORT").unwrap_or_else(|_| "50051".to_string());
    let addr = format!("{}:{}", host, port).parse().expect("Invalid gRPC address");
    let server = create_grpc_server(grpc_service.as_ref().clone());

    info!("[gRPC] server starting on {}", addr);

    if let Err(e) = Server::builder().add_service(server).serve(addr).await {
        error!("[error] gRPC server failed: {}", e);
    }
}
