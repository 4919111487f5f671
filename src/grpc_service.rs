use crate::messages::SensorMessage;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Result, Status};
use tracing::info;

// Include the generated protobuf code
pub mod thermohub {
    tonic::include_proto!("thermohub");
}

use thermohub::{
    thermo_hub_server::{ThermoHub, ThermoHubServer},
    Header, SensorData, SensorRequest, SensorStatus, SensorStatusResponse, ThermalImageData,
    ThermalStatsData, ThermometerData,
};

pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// gRPC service implementation for sensor data streaming
#[derive(Clone)]
pub struct ThermoHubService {
    // Broadcast channels per data kind
    thermometer_tx: broadcast::Sender<ThermometerData>,
    image_tx: broadcast::Sender<ThermalImageData>,
    all_tx: broadcast::Sender<SensorData>,

    // Sensor status tracking
    sensor_stats: Arc<RwLock<HashMap<String, SensorStats>>>,
}

#[derive(Clone, Debug, Default)]
struct SensorStats {
    is_active: bool,
    messages_sent: u64,
    last_message_time_ns: u64,
    error_message: Option<String>,
}

impl Default for ThermoHubService {
    fn default() -> Self {
        Self::new()
    }
}

impl ThermoHubService {
    pub fn new() -> Self {
        // Image frames are two orders of magnitude larger than thermometer
        // samples, so their channel buffers far fewer of them
        let (thermometer_tx, _) = broadcast::channel(800);
        let (image_tx, _) = broadcast::channel(64);
        let (all_tx, _) = broadcast::channel(800);

        Self {
            thermometer_tx,
            image_tx,
            all_tx,
            sensor_stats: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish sensor data to the matching streams. Send failures mean no
    /// subscriber is listening, which is fine.
    pub async fn publish(&self, message: SensorMessage) {
        let header = convert_header(message.header());
        let sensor_id = message.sensor_id().to_string();

        match message {
            SensorMessage::Thermometer(t) => {
                let data = ThermometerData {
                    header: Some(header),
                    ambient_c: t.ambient_c,
                    object_c: t.object_c,
                    object2_c: t.object2_c,
                };
                let _ = self.thermometer_tx.send(data.clone());
                let _ = self.all_tx.send(SensorData {
                    data: Some(thermohub::sensor_data::Data::Thermometer(data)),
                });
            }

            SensorMessage::ThermalStats(s) => {
                let data = ThermalStatsData {
                    header: Some(header),
                    median_c: s.median_c,
                    average_c: s.average_c,
                    most_diff_c: s.most_diff_c,
                    most_diff_x: s.most_diff_xy.0 as u32,
                    most_diff_y: s.most_diff_xy.1 as u32,
                    lowest_c: s.lowest_c,
                    lowest_x: s.lowest_xy.0 as u32,
                    lowest_y: s.lowest_xy.1 as u32,
                    highest_c: s.highest_c,
                    highest_x: s.highest_xy.0 as u32,
                    highest_y: s.highest_xy.1 as u32,
                };
                let _ = self.all_tx.send(SensorData {
                    data: Some(thermohub::sensor_data::Data::ThermalStats(data)),
                });
            }

            SensorMessage::ThermalImage(img) => {
                let data = ThermalImageData {
                    header: Some(header),
                    subpage: img.subpage as u32,
                    width: img.width as u32,
                    height: img.height as u32,
                    pixels_c: img.pixels_c,
                };
                let _ = self.image_tx.send(data.clone());
                let _ = self.all_tx.send(SensorData {
                    data: Some(thermohub::sensor_data::Data::ThermalImage(data)),
                });
            }
        }

        self.update_sensor_stats(&sensor_id).await;
    }

    async fn update_sensor_stats(&self, sensor_id: &str) {
        let mut stats = self.sensor_stats.write().await;
        let entry = stats.entry(sensor_id.to_string()).or_default();

        entry.is_active = true;
        entry.messages_sent += 1;
        entry.error_message = None;
        entry.last_message_time_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
    }

    /// Record a read failure so it shows up in the status response
    pub async fn record_error(&self, sensor_id: &str, error: &str) {
        let mut stats = self.sensor_stats.write().await;
        let entry = stats.entry(sensor_id.to_string()).or_default();
        entry.error_message = Some(error.to_string());
    }
}

// An empty sensor_id in the request streams everything
fn matches_filter(filter: &str, header: &Option<Header>) -> bool {
    filter.is_empty()
        || header
            .as_ref()
            .map(|h| h.sensor_id == filter)
            .unwrap_or(false)
}

fn filtered_stream<T, F>(
    rx: broadcast::Receiver<T>,
    filter: String,
    header_of: F,
) -> ResponseStream<T>
where
    T: Clone + Send + 'static,
    F: Fn(&T) -> &Option<Header> + Send + 'static,
{
    let stream = BroadcastStream::new(rx)
        .filter_map(move |item| match item {
            Ok(data) if matches_filter(&filter, header_of(&data)) => Some(Ok(data)),
            Ok(_) => None,
            Err(e) => Some(Err(Status::internal(format!("Broadcast error: {}", e)))),
        });
    Box::pin(stream)
}

#[tonic::async_trait]
impl ThermoHub for ThermoHubService {
    type StreamThermometerStream = ResponseStream<ThermometerData>;
    type StreamThermalImageStream = ResponseStream<ThermalImageData>;
    type StreamAllStream = ResponseStream<SensorData>;

    async fn stream_thermometer(
        &self,
        request: Request<SensorRequest>,
    ) -> Result<Response<Self::StreamThermometerStream>> {
        let filter = request.into_inner().sensor_id;
        info!("[gRPC] New thermometer stream client (filter: '{}')", filter);

        let rx = self.thermometer_tx.subscribe();
        Ok(Response::new(filtered_stream(rx, filter, |d| &d.header)))
    }

    async fn stream_thermal_image(
        &self,
        request: Request<SensorRequest>,
    ) -> Result<Response<Self::StreamThermalImageStream>> {
        let filter = request.into_inner().sensor_id;
        info!("[gRPC] New thermal image stream client (filter: '{}')", filter);

        let rx = self.image_tx.subscribe();
        Ok(Response::new(filtered_stream(rx, filter, |d| &d.header)))
    }

    async fn stream_all(
        &self,
        request: Request<SensorRequest>,
    ) -> Result<Response<Self::StreamAllStream>> {
        let filter = request.into_inner().sensor_id;
        info!("[gRPC] New unified stream client (filter: '{}')", filter);

        let rx = self.all_tx.subscribe();
        Ok(Response::new(filtered_stream(rx, filter, |d| {
            use thermohub::sensor_data::Data;
            match &d.data {
                Some(Data::Thermometer(t)) => &t.header,
                Some(Data::ThermalStats(s)) => &s.header,
                Some(Data::ThermalImage(i)) => &i.header,
                None => &None,
            }
        })))
    }

    async fn get_sensor_status(
        &self,
        _request: Request<SensorRequest>,
    ) -> Result<Response<SensorStatusResponse>> {
        let stats = self.sensor_stats.read().await;
        let sensors: Vec<SensorStatus> = stats
            .iter()
            .map(|(sensor_id, s)| SensorStatus {
                sensor_id: sensor_id.clone(),
                is_active: s.is_active,
                is_healthy: s.error_message.is_none(),
                messages_sent: s.messages_sent,
                last_message_time_ns: s.last_message_time_ns,
                error_message: s.error_message.clone(),
            })
            .collect();

        Ok(Response::new(SensorStatusResponse { sensors }))
    }
}

/// Convert internal message header to protobuf header
fn convert_header(header: &crate::messages::Header) -> Header {
    Header {
        device_id: header.device_id.clone(),
        sensor_id: header.sensor_id.clone(),
        frame_id: header.frame_id.clone(),
        seq: header.seq,
        t_utc_ns: header.t_utc_ns,
        t_mono_ns: header.t_mono_ns,
        schema_v: header.schema_v as u32,
    }
}

/// Create and configure gRPC server
pub fn create_grpc_server(service: ThermoHubService) -> ThermoHubServer<ThermoHubService> {
    // A full subpage message is ~2KB; 1MB leaves plenty of headroom
    ThermoHubServer::new(service)
        .max_encoding_message_size(1024 * 1024)
        .max_decoding_message_size(1024 * 1024)
}
