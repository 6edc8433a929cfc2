//! Shared fixtures: stand-in capture programs and test configuration

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use tempfile::TempDir;

use tapedeck::capture::DeviceAlias;
use tapedeck::config::Config;
use tapedeck::recording::{Session, SessionId, SessionManager, SessionState};

/// Writes to its output, then exits cleanly on SIGINT like ffmpeg
pub const GRACEFUL: &str = r#"#!/bin/sh
for last; do :; done
trap 'echo "Exiting normally, received signal 2." >&2; exit 0' INT
echo "Input #0, video4linux2,v4l2, from '/dev/video0':" >&2
echo "frame" >> "$last"
while :; do sleep 0.05; done
"#;

/// Ignores SIGINT and has to be killed
pub const STUBBORN: &str = r#"#!/bin/sh
trap '' INT
while :; do sleep 0.05; done
"#;

/// Fails before the startup probe ends
pub const CRASHING: &str = r#"#!/bin/sh
echo "/dev/video0: No such device" >&2
exit 1
"#;

/// Ends by itself with status 0, like a capture with `-t`
pub const FINITE: &str = r#"#!/bin/sh
sleep 0.4
exit 0
"#;

/// Runs for a while, then fails like an unplugged device
pub const DYING: &str = r#"#!/bin/sh
sleep 0.4
echo "Input/output error" >&2
sleep 0.2
exit 1
"#;

/// Directory of stand-in programs, written once per test binary so no
/// script is exec'd while a writer still has it open
fn scripts_dir() -> &'static Path {
    static DIR: OnceLock<TempDir> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = tempfile::Builder::new()
            .prefix("tapedeck-fake-ffmpeg")
            .tempdir()
            .unwrap();

        for (name, body) in [
            ("graceful", GRACEFUL),
            ("stubborn", STUBBORN),
            ("crashing", CRASHING),
            ("finite", FINITE),
            ("dying", DYING),
        ] {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        dir
    })
    .path()
}

/// Path of one stand-in program: `graceful`, `stubborn`, `crashing`,
/// `finite` or `dying`
pub fn fake_ffmpeg(name: &str) -> PathBuf {
    scripts_dir().join(name)
}

/// Configuration with short timings, recordings under `dir` and a `cam0`
/// alias pointing at a placeholder video node
pub fn test_config(dir: &Path, program: &str) -> Config {
    let mut config = Config::default();
    config.capture.ffmpeg_path = fake_ffmpeg(program);
    config.capture.recordings_dir = dir.join("recordings");
    config.capture.startup_probe_ms = 150;
    config.capture.stop_grace_ms = 300;
    config.capture.kill_timeout_ms = 2000;
    config.retention.reconcile_interval_ms = 50;

    let video = dir.join("video0");
    std::fs::write(&video, b"").unwrap();
    config.devices.insert(
        "cam0".to_string(),
        DeviceAlias {
            video: Some(video),
            audio: None,
        },
    );
    config.server.bind = "127.0.0.1:0".parse().unwrap();
    config
}

/// Poll `status` until the session reaches `state` or `timeout` passes
pub async fn wait_for_state(
    manager: &SessionManager,
    id: SessionId,
    state: SessionState,
    timeout: Duration,
) -> Session {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let session = manager.status(id).await.unwrap();
        if session.state == state || tokio::time::Instant::now() >= deadline {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
