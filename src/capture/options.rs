//! Capture options: the request-facing set and the resolved settings

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::CaptureConfig;
use crate::{Result, TapedeckError};

use super::{ALLOWED_CONTAINERS, ALLOWED_SAMPLE_RATES, MAX_DURATION_SECS, MAX_FRAME_RATE};

/// Capture frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl FromStr for Resolution {
    type Err = TapedeckError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TapedeckError::InvalidOptions(format!("Invalid resolution: {s:?}"));

        let (w, h) = s.split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;

        // Even dimensions keep yuv420p encoders happy
        if width == 0 || height == 0 || width > 7680 || height > 4320 || width % 2 != 0 || height % 2 != 0 {
            return Err(invalid());
        }

        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = TapedeckError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Options supplied with a start request
///
/// Every field is optional and falls back to [`CaptureSettings`] from the
/// configuration. Unknown fields are rejected at deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureOptions {
    /// Frame size, e.g. `1280x720`
    pub resolution: Option<String>,
    /// Frames per second requested from the video device
    pub frame_rate: Option<u32>,
    /// Audio sample rate in Hz
    pub sample_rate: Option<u32>,
    /// Video codec
    pub codec: Option<String>,
    /// Audio codec
    pub audio_codec: Option<String>,
    /// Video bitrate, e.g. `2M`
    pub video_bitrate: Option<String>,
    /// Audio bitrate, e.g. `192k`
    pub audio_bitrate: Option<String>,
    /// V4L2 input pixel format
    pub input_format: Option<String>,
    /// Container used for generated output names
    pub container: Option<String>,
    /// Stop recording after this many seconds
    pub duration_limit: Option<u64>,
}

/// Fully resolved capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureSettings {
    /// Frame size
    pub resolution: Resolution,
    /// Frames per second
    pub frame_rate: u32,
    /// Audio sample rate in Hz
    pub sample_rate: u32,
    /// Video codec
    pub codec: String,
    /// Audio codec
    pub audio_codec: String,
    /// Video bitrate
    pub video_bitrate: String,
    /// Audio bitrate
    pub audio_bitrate: String,
    /// V4L2 input pixel format
    pub input_format: String,
    /// Container for generated output names
    pub container: String,
    /// Recording duration cap in seconds
    pub duration_limit: Option<u64>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution {
                width: 1280,
                height: 720,
            },
            frame_rate: 30,
            sample_rate: 48000,
            codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            video_bitrate: "2M".to_string(),
            audio_bitrate: "192k".to_string(),
            input_format: "mjpeg".to_string(),
            container: "mp4".to_string(),
            duration_limit: None,
        }
    }
}

impl CaptureOptions {
    /// Merge these options over `defaults` and validate the result
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` if any value is out of range or not allowed
    pub fn resolve(&self, defaults: &CaptureSettings, policy: &CaptureConfig) -> Result<CaptureSettings> {
        let resolution = match &self.resolution {
            Some(value) => value.parse()?,
            None => defaults.resolution,
        };

        let settings = CaptureSettings {
            resolution,
            frame_rate: self.frame_rate.unwrap_or(defaults.frame_rate),
            sample_rate: self.sample_rate.unwrap_or(defaults.sample_rate),
            codec: pick(&self.codec, &defaults.codec),
            audio_codec: pick(&self.audio_codec, &defaults.audio_codec),
            video_bitrate: pick(&self.video_bitrate, &defaults.video_bitrate),
            audio_bitrate: pick(&self.audio_bitrate, &defaults.audio_bitrate),
            input_format: pick(&self.input_format, &defaults.input_format),
            container: pick(&self.container, &defaults.container),
            duration_limit: self.duration_limit.or(defaults.duration_limit),
        };

        settings.validate(policy)?;
        Ok(settings)
    }
}

fn pick(value: &Option<String>, default: &str) -> String {
    value.clone().unwrap_or_else(|| default.to_string())
}

impl CaptureSettings {
    /// Check every field against fixed limits and the configured allow-lists
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` naming the first offending field
    pub fn validate(&self, policy: &CaptureConfig) -> Result<()> {
        if self.frame_rate == 0 || self.frame_rate > MAX_FRAME_RATE {
            return Err(TapedeckError::InvalidOptions(format!(
                "frame_rate must be between 1 and {MAX_FRAME_RATE}, got {}",
                self.frame_rate
            )));
        }

        if !ALLOWED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(TapedeckError::InvalidOptions(format!(
                "Unsupported sample_rate: {}",
                self.sample_rate
            )));
        }

        if !policy.allowed_codecs.iter().any(|c| c == &self.codec) {
            return Err(TapedeckError::InvalidOptions(format!(
                "Codec not allowed: {:?}",
                self.codec
            )));
        }

        validate_token("audio_codec", &self.audio_codec)?;
        validate_token("input_format", &self.input_format)?;

        validate_bitrate("video_bitrate", &self.video_bitrate)?;
        if !policy.allowed_bitrates.is_empty()
            && !policy.allowed_bitrates.iter().any(|b| b == &self.video_bitrate)
        {
            return Err(TapedeckError::InvalidOptions(format!(
                "Bitrate not allowed: {:?}",
                self.video_bitrate
            )));
        }
        validate_bitrate("audio_bitrate", &self.audio_bitrate)?;

        if !ALLOWED_CONTAINERS.contains(&self.container.as_str()) {
            return Err(TapedeckError::InvalidOptions(format!(
                "Unsupported container: {:?}",
                self.container
            )));
        }

        if let Some(limit) = self.duration_limit {
            if limit == 0 || limit > MAX_DURATION_SECS {
                return Err(TapedeckError::InvalidOptions(format!(
                    "duration_limit must be between 1 and {MAX_DURATION_SECS} seconds, got {limit}"
                )));
            }
        }

        Ok(())
    }
}

/// Values forwarded verbatim to ffmpeg must look like identifiers
fn validate_token(field: &str, value: &str) -> Result<()> {
    let ok = !value.is_empty()
        && value.len() <= 32
        && !value.starts_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if ok {
        Ok(())
    } else {
        Err(TapedeckError::InvalidOptions(format!("Invalid {field}: {value:?}")))
    }
}

/// Accepts ffmpeg rate strings such as `192k`, `2M` or `128000`
fn validate_bitrate(field: &str, value: &str) -> Result<()> {
    let digits = value.strip_suffix(['k', 'K', 'M']).unwrap_or(value);
    let ok = !digits.is_empty() && digits.len() <= 9 && digits.chars().all(|c| c.is_ascii_digit());

    if ok && digits.chars().any(|c| c != '0') {
        Ok(())
    } else {
        Err(TapedeckError::InvalidOptions(format!("Invalid {field}: {value:?}")))
    }
}
