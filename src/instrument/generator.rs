//! Generator behind the VIFCON TCP bridge.
//!
//! `IW*` are actual values, `SW*` set values: power, voltage, current and
//! (actual only) frequency.

use super::sensor::{sample_tcp, Channel, SensorRecorder};
use super::Instrument;
use crate::config::GeneratorConfig;
use crate::error::AppResult;
use crate::hardware::{TcpTransport, TransportState};
use crate::measurement::{Sample, Timestamp};
use async_trait::async_trait;
use std::path::Path;

/// Channels of the generator, in column order.
pub const GENERATOR_CHANNELS: &[Channel] = &[
    Channel::new("IWP", "W"),
    Channel::new("IWU", "V"),
    Channel::new("IWI", "A"),
    Channel::new("IWf", "Hz"),
    Channel::new("SWP", "W"),
    Channel::new("SWU", "V"),
    Channel::new("SWI", "A"),
];

/// Generator device.
pub struct TcpGeneratorDevice {
    name: String,
    transport: TcpTransport,
    recorder: SensorRecorder,
}

impl TcpGeneratorDevice {
    /// Connect to the bridge; an unreachable bridge degrades to missing values.
    pub async fn connect(name: &str, config: &GeneratorConfig, template_dir: &Path) -> Self {
        tracing::info!(device = name, ip = %config.ip, port = config.port, "Initializing generator device '{name}'");
        let interface = config.interface();
        let transport =
            TcpTransport::connect(name, &interface.ip, interface.port, interface.timeout()).await;
        Self {
            name: name.to_string(),
            transport,
            recorder: SensorRecorder::new(
                name,
                GENERATOR_CHANNELS,
                config.comment.clone(),
                template_dir,
            ),
        }
    }

    /// State of the TCP transport.
    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    /// Recorded history.
    pub fn recorder(&self) -> &SensorRecorder {
        &self.recorder
    }
}

#[async_trait]
impl Instrument for TcpGeneratorDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "generator"
    }

    fn init_output(&mut self, directory: &Path) -> AppResult<()> {
        self.recorder.init_output(directory)
    }

    async fn sample(&mut self) -> AppResult<Sample> {
        let readings = sample_tcp(&self.name, &mut self.transport, GENERATOR_CHANNELS).await;
        Ok(Sample::Readings(readings))
    }

    fn save_measurement(&mut self, time_abs: &Timestamp, time_rel: f64, sample: Sample) -> AppResult<()> {
        self.recorder.save(time_abs, time_rel, sample)
    }

    fn write_archive_fragment(&mut self, directory: &Path) -> AppResult<()> {
        self.recorder.write_archive(directory)
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        self.transport.close().await;
        tracing::debug!(device = %self.name, "Generator shut down");
        Ok(())
    }
}
