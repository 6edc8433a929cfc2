//! ffmpeg command-line construction

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::{CaptureInput, CaptureSettings, ResolvedDevice};

/// Argument list for one capture process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CaptureCommand {
    /// Build the ffmpeg invocation for `device` writing to `output`
    #[must_use]
    pub fn build(program: &Path, device: &ResolvedDevice, settings: &CaptureSettings, output: &Path) -> Self {
        let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-loglevel", "info", "-y"]
            .into_iter()
            .map(OsString::from)
            .collect();

        for input in device.inputs() {
            match input {
                CaptureInput::Audio(name) => {
                    push(&mut args, &["-f", "alsa"]);
                    push(&mut args, &["-sample_rate", &settings.sample_rate.to_string()]);
                    push(&mut args, &["-i", name]);
                }
                CaptureInput::Video(path) => {
                    push(&mut args, &["-f", "v4l2"]);
                    push(&mut args, &["-input_format", &settings.input_format]);
                    push(&mut args, &["-framerate", &settings.frame_rate.to_string()]);
                    push(&mut args, &["-video_size", &settings.resolution.to_string()]);
                    args.push("-i".into());
                    args.push(path.as_os_str().to_owned());
                }
            }
        }

        if let Some(limit) = settings.duration_limit {
            push(&mut args, &["-t", &limit.to_string()]);
        }

        if device.has_video() {
            push(&mut args, &["-c:v", &settings.codec]);
            if settings.codec != "copy" {
                push(&mut args, &["-b:v", &settings.video_bitrate]);
                if settings.codec.starts_with("libx26") {
                    push(&mut args, &["-pix_fmt", "yuv420p"]);
                }
            }
        }

        if device.has_audio() {
            push(&mut args, &["-c:a", &settings.audio_codec]);
            push(&mut args, &["-b:a", &settings.audio_bitrate]);
        }

        args.push(output_arg(output));

        Self {
            program: program.to_path_buf(),
            args,
        }
    }

    /// Wrap an arbitrary program and argument list
    pub fn from_parts<I, S>(program: &Path, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.to_path_buf(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Program to execute
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments, excluding the program
    #[must_use]
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Shell-like rendering for logs and dry runs
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|arg| {
                let arg = arg.to_string_lossy();
                if arg.contains(char::is_whitespace) {
                    format!("'{arg}'")
                } else {
                    arg.into_owned()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A relative output starting with `-` would parse as an option and one
/// containing `:` as a protocol URL, so both are anchored with `./`
fn output_arg(output: &Path) -> OsString {
    let text = output.to_string_lossy();
    if output.is_relative() && (text.starts_with('-') || text.contains(':')) {
        Path::new(".").join(output).into_os_string()
    } else {
        output.as_os_str().to_owned()
    }
}

fn push(args: &mut Vec<OsString>, values: &[&str]) {
    args.extend(values.iter().map(OsString::from));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::resolve_device;
    use crate::config::Config;

    fn cam0_config() -> Config {
        let config_toml = r#"
            [devices.cam0]
            video = "/dev/video0"
            audio = "hw:0"
        "#;
        toml::from_str(config_toml).unwrap()
    }

    #[test]
    fn test_audio_video_command() {
        let config = cam0_config();
        let device = resolve_device("cam0", &config.devices).unwrap();
        let command = CaptureCommand::build(
            Path::new("/usr/bin/ffmpeg"),
            &device,
            &config.defaults,
            Path::new("/tmp/out.mp4"),
        );

        assert_eq!(
            command.display(),
            "/usr/bin/ffmpeg -hide_banner -nostdin -loglevel info -y \
             -f alsa -sample_rate 48000 -i hw:0 \
             -f v4l2 -input_format mjpeg -framerate 30 -video_size 1280x720 -i /dev/video0 \
             -c:v libx264 -b:v 2M -pix_fmt yuv420p -c:a aac -b:a 192k /tmp/out.mp4"
        );
    }

    #[test]
    fn test_video_only_with_limit() {
        let config = Config::default();
        let device = resolve_device("/dev/video1", &config.devices).unwrap();
        let mut settings = config.defaults.clone();
        settings.codec = "copy".to_string();
        settings.duration_limit = Some(30);

        let command = CaptureCommand::build(Path::new("ffmpeg"), &device, &settings, Path::new("out.mkv"));
        let args: Vec<_> = command.args().iter().map(|a| a.to_string_lossy().into_owned()).collect();

        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "30");
        assert!(args.contains(&"copy".to_string()));
        assert!(!args.contains(&"-b:v".to_string()));
        assert!(!args.contains(&"-c:a".to_string()));
        assert_eq!(args.last().unwrap(), "out.mkv");
    }

    #[test]
    fn test_display_quotes_whitespace() {
        let config = Config::default();
        let device = resolve_device("hw:1", &config.devices).unwrap();
        let command = CaptureCommand::build(
            Path::new("ffmpeg"),
            &device,
            &config.defaults,
            Path::new("/tmp/my recording.mp4"),
        );

        assert!(command.display().ends_with("'/tmp/my recording.mp4'"));
    }

    #[test]
    fn test_output_is_never_read_as_an_option() {
        let config = Config::default();
        let device = resolve_device("hw:1", &config.devices).unwrap();
        let last_arg = |output: &str| {
            let command = CaptureCommand::build(Path::new("ffmpeg"), &device, &config.defaults, Path::new(output));
            command.args().last().unwrap().to_string_lossy().into_owned()
        };

        assert_eq!(last_arg("-report"), "./-report");
        assert_eq!(last_arg("-f"), "./-f");
        assert_eq!(last_arg("pipe:1"), "./pipe:1");
        assert_eq!(last_arg("/tmp/-take1.mp4"), "/tmp/-take1.mp4");
        assert_eq!(last_arg("take1.mp4"), "take1.mp4");
    }
}
