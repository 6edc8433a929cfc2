//! Capture layer: options, devices, ffmpeg command lines and processes

mod command;
mod device;
mod log;
mod options;
mod process;

pub use command::CaptureCommand;
pub use device::{resolve_device, CaptureInput, DeviceAlias, ResolvedDevice};
pub use log::LogTail;
pub use options::{CaptureOptions, CaptureSettings, Resolution};
pub use process::{describe_exit, CaptureProcess, Termination};

/// Highest frame rate a request may ask for
pub const MAX_FRAME_RATE: u32 = 240;

/// Longest `duration_limit` accepted, in seconds (24 hours)
pub const MAX_DURATION_SECS: u64 = 24 * 60 * 60;

/// Audio sample rates accepted by the ALSA input
pub const ALLOWED_SAMPLE_RATES: &[u32] = &[8000, 16000, 22050, 32000, 44100, 48000, 96000];

/// Containers accepted for generated output names
pub const ALLOWED_CONTAINERS: &[&str] = &["mp4", "mkv", "mov", "ts"];
