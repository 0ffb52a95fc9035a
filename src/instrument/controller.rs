//! Eurotherm temperature controller, over a serial line or behind the VIFCON TCP bridge.
//!
//! ## Serial
//!
//! Two bisynch queries per sample, sharing one deadline:
//!
//! | Channel         | Mnemonic | Unit  |
//! |-----------------|----------|-------|
//! | Temperature     | `PV`     | DEG C |
//! | Operating point | `OP`     | -     |
//!
//! ## TCP
//!
//! One name-triggered exchange per sample; `IWT` and `SWT` are the actual and
//! set temperatures, `IWOp` the operating point.

use super::sensor::{log_read_failure, sample_tcp, Channel, SensorRecorder};
use super::Instrument;
use crate::config::{SerialInterfaceConfig, TcpInterfaceConfig};
use crate::error::AppResult;
use crate::hardware::serial::frame_command;
use crate::hardware::{SerialTransport, TcpTransport, TransportState};
use crate::measurement::{Readings, Sample, Timestamp, MISSING};
use async_trait::async_trait;
use std::path::Path;
use tokio::time::Instant;

/// Channels of the serial controller.
pub const SERIAL_CHANNELS: &[Channel] = &[
    Channel::new("Temperature", "DEG C"),
    Channel::new("Operating point", "-"),
];

/// Channels of the TCP controller.
pub const TCP_CHANNELS: &[Channel] = &[
    Channel::new("IWT", "DEG C"),
    Channel::new("SWT", "DEG C"),
    Channel::keyed("Operating point", "-", "IWOp"),
];

const TEMPERATURE_MNEMONIC: &str = "PV";
const OPERATING_POINT_MNEMONIC: &str = "OP";

/// Temperature controller on a serial line.
pub struct SerialControllerDevice {
    name: String,
    transport: SerialTransport,
    read_temperature: Vec<u8>,
    read_operating_point: Vec<u8>,
    recorder: SensorRecorder,
}

impl SerialControllerDevice {
    /// Open the serial port and prepare sampling.
    ///
    /// A port that cannot be opened is logged; the device then reports
    /// missing values on every sample.
    pub async fn connect(
        name: &str,
        interface: &SerialInterfaceConfig,
        address: &str,
        comment: Option<String>,
        template_dir: &Path,
    ) -> Self {
        tracing::info!(device = name, port = %interface.port, "Initializing Eurotherm device '{name}'");
        let transport = SerialTransport::open(name, interface).await;
        Self::with_transport(name, transport, address, comment, template_dir)
    }

    /// Build around an existing transport.
    pub fn with_transport(
        name: &str,
        transport: SerialTransport,
        address: &str,
        comment: Option<String>,
        template_dir: &Path,
    ) -> Self {
        Self {
            name: name.to_string(),
            transport,
            read_temperature: frame_command(address, TEMPERATURE_MNEMONIC),
            read_operating_point: frame_command(address, OPERATING_POINT_MNEMONIC),
            recorder: SensorRecorder::new(name, SERIAL_CHANNELS, comment, template_dir),
        }
    }

    /// State of the serial transport.
    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    /// Recorded history.
    pub fn recorder(&self) -> &SensorRecorder {
        &self.recorder
    }
}

/// One serial query; a failure yields the missing-value sentinel.
async fn read_channel(
    device: &str,
    transport: &mut SerialTransport,
    channel: &str,
    mnemonic: &str,
    command: &[u8],
    deadline: Instant,
) -> f64 {
    match transport.query_until(command, mnemonic, deadline).await {
        Ok(value) => value,
        Err(err) => {
            log_read_failure(device, Some(channel), &err);
            MISSING
        }
    }
}

#[async_trait]
impl Instrument for SerialControllerDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "serial-controller"
    }

    fn init_output(&mut self, directory: &Path) -> AppResult<()> {
        self.recorder.init_output(directory)
    }

    async fn sample(&mut self) -> AppResult<Sample> {
        let deadline = Instant::now() + self.transport.timeout();
        let temperature = read_channel(
            &self.name,
            &mut self.transport,
            "Temperature",
            TEMPERATURE_MNEMONIC,
            &self.read_temperature,
            deadline,
        )
        .await;
        let operating_point = read_channel(
            &self.name,
            &mut self.transport,
            "Operating point",
            OPERATING_POINT_MNEMONIC,
            &self.read_operating_point,
            deadline,
        )
        .await;

        let mut readings = Readings::new();
        readings.insert("Temperature", temperature);
        readings.insert("Operating point", operating_point);
        tracing::debug!(device = %self.name, temperature, operating_point, "Sampled");
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
        tracing::debug!(device = %self.name, "Serial controller shut down");
        Ok(())
    }
}

/// Temperature controller behind the VIFCON TCP bridge.
pub struct TcpControllerDevice {
    name: String,
    transport: TcpTransport,
    recorder: SensorRecorder,
}

impl TcpControllerDevice {
    /// Connect to the bridge and prepare sampling.
    ///
    /// An unreachable bridge is logged; the device then reports missing
    /// values on every sample.
    pub async fn connect(
        name: &str,
        interface: &TcpInterfaceConfig,
        comment: Option<String>,
        template_dir: &Path,
    ) -> Self {
        tracing::info!(device = name, ip = %interface.ip, port = interface.port, "Initializing Eurotherm device '{name}'");
        let transport =
            TcpTransport::connect(name, &interface.ip, interface.port, interface.timeout()).await;
        Self {
            name: name.to_string(),
            transport,
            recorder: SensorRecorder::new(name, TCP_CHANNELS, comment, template_dir),
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
impl Instrument for TcpControllerDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "tcp-controller"
    }

    fn init_output(&mut self, directory: &Path) -> AppResult<()> {
        self.recorder.init_output(directory)
    }

    async fn sample(&mut self) -> AppResult<Sample> {
        let readings = sample_tcp(&self.name, &mut self.transport, TCP_CHANNELS).await;
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
        tracing::debug!(device = %self.name, "TCP controller shut down");
        Ok(())
    }
}
