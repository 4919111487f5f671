use crate::sensors::ThermoFrame;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;

/// Header metadata common to all sensor messages
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Header {
    /// Unique device identifier
    pub device_id: String,
    /// Sensor identifier (e.g., "ir0", "cam0")
    pub sensor_id: String,
    /// Reference frame identifier
    pub frame_id: String,
    /// Sequence number for message ordering
    pub seq: u64,
    /// UTC timestamp in nanoseconds
    pub t_utc_ns: u64,
    /// Monotonic timestamp in nanoseconds since process start
    pub t_mono_ns: u64,
    /// Message schema version for evolution
    pub schema_v: u16,
}

static MONO_EPOCH: OnceLock<Instant> = OnceLock::new();

impl Header {
    /// Create a new header with current timestamps
    pub fn new(device_id: String, sensor_id: String, frame_id: String, seq: u64) -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        let t_utc_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let t_mono_ns = MONO_EPOCH
            .get_or_init(Instant::now)
            .elapsed()
            .as_nanos() as u64;

        Self {
            device_id,
            sensor_id,
            frame_id,
            seq,
            t_utc_ns,
            t_mono_ns,
            schema_v: 1,
        }
    }
}

/// Point thermometer reading; channels the device lacks stay `None`
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ThermometerMessage {
    pub h: Header,
    /// Ambient (die) temperature (°C)
    pub ambient_c: Option<f32>,
    /// Object temperature (°C)
    pub object_c: Option<f32>,
    /// Second object temperature (°C), dual-sensor devices only
    pub object2_c: Option<f32>,
}

/// Statistics over the monitor region of one thermal-array subpage
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ThermalStatsMessage {
    pub h: Header,
    pub median_c: f32,
    pub average_c: f32,
    pub most_diff_c: f32,
    pub most_diff_xy: (u8, u8),
    pub lowest_c: f32,
    pub lowest_xy: (u8, u8),
    pub highest_c: f32,
    pub highest_xy: (u8, u8),
}

/// Half-frame of pixel temperatures from a thermal array
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ThermalImageMessage {
    pub h: Header,
    /// 0: even rows, 1: odd rows
    pub subpage: u8,
    pub width: u8,
    pub height: u8,
    /// Pixel temperatures (°C), row major within the subpage
    pub pixels_c: Vec<f32>,
}

/// Unified sensor message enum for the different data kinds
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum SensorMessage {
    Thermometer(ThermometerMessage),
    ThermalStats(ThermalStatsMessage),
    ThermalImage(ThermalImageMessage),
}

impl SensorMessage {
    /// Get the header from any sensor message
    pub fn header(&self) -> &Header {
        match self {
            SensorMessage::Thermometer(msg) => &msg.h,
            SensorMessage::ThermalStats(msg) => &msg.h,
            SensorMessage::ThermalImage(msg) => &msg.h,
        }
    }

    /// Get the sensor ID from any sensor message
    pub fn sensor_id(&self) -> &str {
        &self.header().sensor_id
    }

    /// Serialize to JSON for debugging
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Split a measurement frame into messages, one per data kind present
pub fn messages_from_frame(header: &Header, frame: &ThermoFrame) -> Vec<SensorMessage> {
    let mut messages = Vec::new();

    if frame.ambient_c.is_some() || frame.object_c.is_some() {
        messages.push(SensorMessage::Thermometer(ThermometerMessage {
            h: header.clone(),
            ambient_c: frame.ambient_c,
            object_c: frame.object_c,
            object2_c: frame.object2_c,
        }));
    }

    if let Some(stats) = &frame.stats {
        messages.push(SensorMessage::ThermalStats(ThermalStatsMessage {
            h: header.clone(),
            median_c: stats.median_c,
            average_c: stats.average_c,
            most_diff_c: stats.most_diff_c,
            most_diff_xy: stats.most_diff_xy,
            lowest_c: stats.lowest_c,
            lowest_xy: stats.lowest_xy,
            highest_c: stats.highest_c,
            highest_xy: stats.highest_xy,
        }));
    }

    if let Some(image) = &frame.image {
        messages.push(SensorMessage::ThermalImage(ThermalImageMessage {
            h: header.clone(),
            subpage: image.subpage,
            width: image.width,
            height: image.height,
            pixels_c: image.pixels_c.clone(),
        }));
    }

    messages
}
