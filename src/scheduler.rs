use crate::errors::SensorError;
use crate::grpc_service::ThermoHubService;
use crate::messages::{messages_from_frame, Header};
use crate::registry::BusMap;
use crate::sensors::SensorDriver;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

const DEVICE_ID: &str = "thermo_hub";
const FRAME_ID: &str = "sensor_frame";

/// Spawns one task per sensor, each polling at the driver's measurement
/// interval and publishing decoded frames to the gRPC service.
pub async fn spawn_sensor_tasks(
    sensors: Vec<Box<dyn SensorDriver + Send>>,
    buses: BusMap,
    grpc_service: Arc<ThermoHubService>,
) {
    for mut sensor in sensors.into_iter() {
        let sensor_id = sensor.id().to_string();
        let bus = match buses.get(sensor.bus()) {
            Some(bus) => bus.clone(),
            None => {
                // init_all validated bus references already
                warn!("[{}] bus '{}' missing, sensor skipped", sensor_id, sensor.bus());
                continue;
            }
        };

        let interval = Duration::from_millis(sensor.interval_ms());
        let grpc_service = grpc_service.clone();
        let mut seq = 0u64;

        tokio::spawn(async move {
            info!(
                "[{}] sensor task started, polling every {}ms",
                sensor_id,
                interval.as_millis()
            );

            loop {
                let mut bus_lock = bus.lock().await;
                let result = sensor.read(&mut *bus_lock).await;
                drop(bus_lock);

                match result {
                    Ok(frame) => {
                        seq += 1;
                        let header = Header::new(
                            DEVICE_ID.to_string(),
                            sensor_id.clone(),
                            FRAME_ID.to_string(),
                            seq,
                        );
                        for msg in messages_from_frame(&header, &frame) {
                            grpc_service.publish(msg).await;
                        }
                    }
                    // The device simply has no new subpage yet; try again
                    // next tick
                    Err(SensorError::NotReady { .. }) => {
                        debug!("[{}] no fresh data", sensor_id);
                    }
                    Err(e) => {
                        warn!("[{}] read failed: {}", sensor_id, e);
                        grpc_service.record_error(&sensor_id, &e.to_string()).await;
                    }
                }

                sleep(interval).await;
            }
        });
    }
}
