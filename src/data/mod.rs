//! Persistent outputs of a device: the measurement log and the archive document.
pub mod archive;
pub mod log_writer;

pub use archive::{
    archive_path, sanitize_channel_name, CameraArchive, CameraSummary, ImageEntry, SensorArchive,
};
pub use log_writer::MeasurementLog;
