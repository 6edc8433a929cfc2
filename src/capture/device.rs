//! Device descriptors and their resolution to ffmpeg inputs

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Result, TapedeckError};

/// Prefixes recognised as ALSA PCM names
const ALSA_PREFIXES: &[&str] = &["hw:", "plughw:", "default", "sysdefault"];

/// A named device from the `[devices]` configuration table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceAlias {
    /// V4L2 device node
    pub video: Option<PathBuf>,
    /// ALSA PCM name
    pub audio: Option<String>,
}

impl DeviceAlias {
    /// Check that the alias names at least one well-formed input
    ///
    /// # Errors
    ///
    /// Returns error if the alias is empty or malformed
    pub fn validate(&self) -> Result<()> {
        if self.video.is_none() && self.audio.is_none() {
            return Err(TapedeckError::ConfigError(
                "alias must name a video or audio device".to_string(),
            ));
        }
        if let Some(video) = &self.video {
            if !video.is_absolute() {
                return Err(TapedeckError::ConfigError(format!(
                    "video device must be an absolute path: {}",
                    video.display()
                )));
            }
        }
        if let Some(audio) = &self.audio {
            if !is_alsa_name(audio) {
                return Err(TapedeckError::ConfigError(format!(
                    "not an ALSA device name: {audio}"
                )));
            }
        }
        Ok(())
    }
}

/// One ffmpeg input
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CaptureInput {
    /// V4L2 video device node
    Video(PathBuf),
    /// ALSA audio device
    Audio(String),
}

impl CaptureInput {
    /// Key used for device claims
    #[must_use]
    pub fn claim_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CaptureInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video(path) => write!(f, "v4l2:{}", path.display()),
            Self::Audio(name) => write!(f, "alsa:{name}"),
        }
    }
}

/// Inputs a device descriptor resolved to, audio first as ffmpeg expects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    /// Audio input, if any
    pub audio: Option<CaptureInput>,
    /// Video input, if any
    pub video: Option<CaptureInput>,
}

impl ResolvedDevice {
    /// All inputs in command-line order
    pub fn inputs(&self) -> impl Iterator<Item = &CaptureInput> {
        self.audio.iter().chain(self.video.iter())
    }

    /// Whether a video stream is captured
    #[must_use]
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    /// Whether an audio stream is captured
    #[must_use]
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Replace the video node with its canonical path
    ///
    /// `/dev/./video0` and udev links under `/dev/v4l/by-id` name the same
    /// node and must claim the same device. ALSA names are not probed.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError` if the video node is not reachable
    pub fn canonicalize(mut self) -> Result<Self> {
        if let Some(CaptureInput::Video(path)) = &mut self.video {
            let canonical = std::fs::canonicalize(&*path).map_err(|e| {
                TapedeckError::DeviceError(format!(
                    "Video device not reachable: {}: {e}",
                    path.display()
                ))
            })?;
            *path = canonical;
        }
        Ok(self)
    }
}

/// Resolve a caller-supplied descriptor
///
/// Aliases win over raw descriptors. An absolute path is a V4L2 node; ALSA
/// PCM names (`hw:0`, `plughw:1,0`, `default`) are audio inputs.
///
/// # Errors
///
/// Returns `InvalidRequest` if the descriptor matches nothing
pub fn resolve_device(spec: &str, aliases: &BTreeMap<String, DeviceAlias>) -> Result<ResolvedDevice> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(TapedeckError::InvalidRequest(
            "device_spec cannot be empty".to_string(),
        ));
    }

    if let Some(alias) = aliases.get(spec) {
        return Ok(ResolvedDevice {
            audio: alias.audio.clone().map(CaptureInput::Audio),
            video: alias.video.clone().map(CaptureInput::Video),
        });
    }

    if Path::new(spec).is_absolute() {
        return Ok(ResolvedDevice {
            audio: None,
            video: Some(CaptureInput::Video(PathBuf::from(spec))),
        });
    }

    if is_alsa_name(spec) {
        return Ok(ResolvedDevice {
            audio: Some(CaptureInput::Audio(spec.to_string())),
            video: None,
        });
    }

    Err(TapedeckError::InvalidRequest(format!(
        "Unknown device: {spec:?} (not an alias, device path or ALSA name)"
    )))
}

fn is_alsa_name(name: &str) -> bool {
    ALSA_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
        && !name.contains(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases() -> BTreeMap<String, DeviceAlias> {
        let mut map = BTreeMap::new();
        map.insert(
            "cam0".to_string(),
            DeviceAlias {
                video: Some(PathBuf::from("/dev/video0")),
                audio: Some("hw:0".to_string()),
            },
        );
        map
    }

    #[test]
    fn test_resolve_alias() {
        let device = resolve_device("cam0", &aliases()).unwrap();
        let keys: Vec<_> = device.inputs().map(CaptureInput::claim_key).collect();
        assert_eq!(keys, vec!["alsa:hw:0", "v4l2:/dev/video0"]);
        assert!(device.has_audio() && device.has_video());
    }

    #[test]
    fn test_resolve_raw_descriptors() {
        let video = resolve_device("/dev/video2", &aliases()).unwrap();
        assert_eq!(video.video, Some(CaptureInput::Video(PathBuf::from("/dev/video2"))));
        assert!(!video.has_audio());

        let audio = resolve_device("plughw:1,0", &aliases()).unwrap();
        assert_eq!(audio.audio, Some(CaptureInput::Audio("plughw:1,0".to_string())));
        assert!(!audio.has_video());
    }

    #[test]
    fn test_resolve_unknown() {
        assert_eq!(resolve_device("cam9", &aliases()).unwrap_err().kind(), "InvalidRequest");
        assert_eq!(resolve_device("  ", &aliases()).unwrap_err().kind(), "InvalidRequest");
    }

    #[test]
    fn test_reachability() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let present = resolve_device(file.path().to_str().unwrap(), &BTreeMap::new()).unwrap();
        assert!(present.canonicalize().is_ok());

        let missing = resolve_device("/nonexistent/video9", &BTreeMap::new()).unwrap();
        assert_eq!(missing.canonicalize().unwrap_err().kind(), "DeviceError");

        let audio = resolve_device("hw:3", &BTreeMap::new()).unwrap();
        assert_eq!(audio.clone().canonicalize().unwrap(), audio);
    }

    #[cfg(unix)]
    #[test]
    fn test_spellings_of_one_node_share_a_claim_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let node = dir.path().join("video0");
        std::fs::write(&node, b"").unwrap();
        let link = dir.path().join("by-id-usb-cam");
        std::os::unix::fs::symlink(&node, &link).unwrap();

        let key = |spec: PathBuf| {
            let device = resolve_device(spec.to_str().unwrap(), &BTreeMap::new()).unwrap();
            device.canonicalize().unwrap().video.unwrap().claim_key()
        };

        let plain = key(node.clone());
        assert_eq!(key(dir.path().join(".").join("video0")), plain);
        assert_eq!(key(PathBuf::from(format!("{}//video0", dir.path().display()))), plain);
        assert_eq!(key(link), plain);
    }

    #[test]
    fn test_alias_validation() {
        assert!(aliases()["cam0"].validate().is_ok());
        assert!(DeviceAlias::default().validate().is_err());
        assert!(DeviceAlias {
            video: Some(PathBuf::from("video0")),
            audio: None,
        }
        .validate()
        .is_err());
        assert!(DeviceAlias {
            video: None,
            audio: Some("mic".to_string()),
        }
        .validate()
        .is_err());
    }
}
