//! Screenshot extraction planning.
//!
//! A screenshot request picks frames at absolute (`"3.5"`) or relative
//! (`"50%"`) timestamps and writes each as `frame-<index>.jpg` into one
//! directory, which is cached as a single artifact.

use crate::encode::{TranscodeCommand, TranscodeInput};
use crate::filters::format_number;
use crate::probe::StreamMetadata;
use crate::profile::ProfileError;
use serde::{Deserialize, Serialize};
use std::path::Path;

const SCREENSHOT_PROFILE: &str = "screenshots";

/// Key under which screenshots are folded into the cache key.
pub fn screenshot_profile_name() -> &'static str {
    SCREENSHOT_PROFILE
}

/// A requested frame position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTimestamp", into = "String")]
pub enum Timestamp {
    Seconds(f64),
    /// Percentage of the source duration, 0 to 100
    Percent(f64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Text(String),
    Number(f64),
}

impl TryFrom<RawTimestamp> for Timestamp {
    type Error = String;

    fn try_from(raw: RawTimestamp) -> Result<Self, Self::Error> {
        match raw {
            RawTimestamp::Text(text) => Timestamp::parse(&text),
            RawTimestamp::Number(secs) => Timestamp::parse(&secs.to_string()),
        }
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> Self {
        match ts {
            Timestamp::Seconds(secs) => format_number(secs),
            Timestamp::Percent(pct) => format!("{}%", format_number(pct)),
        }
    }
}

impl Timestamp {
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        let (number, percent) = match text.strip_suffix('%') {
            Some(number) => (number.trim(), true),
            None => (text, false),
        };
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid timestamp '{}'", text))?;
        if !value.is_finite() || value < 0.0 {
            return Err(format!("invalid timestamp '{}'", text));
        }

        if percent {
            if value > 100.0 {
                return Err(format!("timestamp '{}' is past the end", text));
            }
            Ok(Timestamp::Percent(value))
        } else {
            Ok(Timestamp::Seconds(value))
        }
    }

    /// Position in seconds. Percentages need the source duration.
    pub fn seconds(&self, duration_secs: Option<f64>) -> Result<f64, ProfileError> {
        match *self {
            Timestamp::Seconds(secs) => Ok(secs),
            Timestamp::Percent(pct) => duration_secs
                .map(|duration| duration * pct / 100.0)
                .ok_or_else(|| ProfileError::InvalidOption {
                    profile: SCREENSHOT_PROFILE.to_string(),
                    reason: format!(
                        "timestamp '{}' is relative but the source duration is unknown",
                        String::from(*self)
                    ),
                }),
        }
    }
}

fn default_timestamps() -> Vec<Timestamp> {
    vec![Timestamp::Seconds(0.0)]
}

/// Typed view of an option set for screenshot requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotOptions {
    #[serde(default = "default_timestamps")]
    pub timestamps: Vec<Timestamp>,
    /// Frame width; height follows the aspect ratio
    #[serde(default)]
    pub width: Option<u32>,
}

impl Default for ScreenshotOptions {
    fn default() -> Self {
        Self {
            timestamps: default_timestamps(),
            width: None,
        }
    }
}

/// File name of the frame at `index`.
pub fn frame_name(index: usize) -> String {
    format!("frame-{:02}.jpg", index)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFrame {
    pub name: String,
    pub seconds: f64,
}

/// Frames to extract for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenshotPlan {
    pub frames: Vec<PlannedFrame>,
    pub width: Option<u32>,
}

impl ScreenshotPlan {
    /// One single-frame command per planned frame, writing into `out_dir`.
    pub fn commands(&self, source: &Path, out_dir: &Path) -> Vec<TranscodeCommand> {
        self.frames
            .iter()
            .map(|frame| {
                let mut output_args = vec!["-frames:v".to_string(), "1".to_string()];
                if let Some(width) = self.width {
                    output_args.extend(["-vf".to_string(), format!("scale={}:-2", width)]);
                }
                output_args.extend(["-q:v".to_string(), "2".to_string()]);

                TranscodeCommand {
                    inputs: vec![TranscodeInput {
                        path: source.to_path_buf(),
                        // Input seeking: fast and frame-accurate for stills
                        pre_args: vec!["-ss".to_string(), format!("{:.3}", frame.seconds)],
                    }],
                    output_args,
                    output: out_dir.join(&frame.name),
                    duration_secs: None,
                }
            })
            .collect()
    }
}

/// Resolve timestamps against the probed source.
///
/// Positions at or past the end are pulled back by one frame so that a
/// frame always exists there. Widths are capped at the source width.
pub fn plan_screenshots(
    options: &ScreenshotOptions,
    metadata: &StreamMetadata,
) -> Result<ScreenshotPlan, ProfileError> {
    let timestamps = if options.timestamps.is_empty() {
        default_timestamps()
    } else {
        options.timestamps.clone()
    };
    let frame_len = 1.0 / metadata.frame_rate.unwrap_or(25.0);

    let frames = timestamps
        .iter()
        .enumerate()
        .map(|(index, ts)| {
            let mut seconds = ts.seconds(metadata.duration_secs)?;
            if let Some(duration) = metadata.duration_secs {
                if seconds >= duration {
                    seconds = (duration - frame_len).max(0.0);
                }
            }
            Ok(PlannedFrame {
                name: frame_name(index),
                seconds,
            })
        })
        .collect::<Result<Vec<_>, ProfileError>>()?;

    let width = options.width.map(|w| {
        if metadata.width > 0 {
            w.min(metadata.width)
        } else {
            w
        }
    });

    Ok(ScreenshotPlan { frames, width })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionSet;
    use serde_json::json;

    fn metadata(duration: Option<f64>) -> StreamMetadata {
        StreamMetadata {
            video_codec: "h264".into(),
            width: 1280,
            height: 720,
            frame_rate_raw: Some("25/1".into()),
            frame_rate: Some(25.0),
            duration_secs: duration,
            has_audio: false,
        }
    }

    #[test]
    fn test_timestamp_parsing() {
        assert_eq!(Timestamp::parse("3.5"), Ok(Timestamp::Seconds(3.5)));
        assert_eq!(Timestamp::parse(" 50% "), Ok(Timestamp::Percent(50.0)));
        assert!(Timestamp::parse("-1").is_err());
        assert!(Timestamp::parse("150%").is_err());
        assert!(Timestamp::parse("soon").is_err());
    }

    #[test]
    fn test_options_accept_strings_and_numbers() {
        let set = OptionSet::new()
            .with("timestamps", json!(["0", "50%", 3.5]))
            .with("width", 320);
        let options: ScreenshotOptions = set.resolve().unwrap();

        assert_eq!(
            options.timestamps,
            vec![
                Timestamp::Seconds(0.0),
                Timestamp::Percent(50.0),
                Timestamp::Seconds(3.5)
            ]
        );
        assert_eq!(options.width, Some(320));

        let defaults: ScreenshotOptions = OptionSet::new().resolve().unwrap();
        assert_eq!(defaults.timestamps, vec![Timestamp::Seconds(0.0)]);
    }

    #[test]
    fn test_plan_resolves_percentages() {
        let options = ScreenshotOptions {
            timestamps: vec![Timestamp::Seconds(1.0), Timestamp::Percent(50.0), Timestamp::Percent(100.0)],
            width: Some(4000),
        };
        let plan = plan_screenshots(&options, &metadata(Some(10.0))).unwrap();

        let names: Vec<&str> = plan.frames.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["frame-00.jpg", "frame-01.jpg", "frame-02.jpg"]);
        assert_eq!(plan.frames[1].seconds, 5.0);
        assert!((plan.frames[2].seconds - 9.96).abs() < 1e-9);
        assert_eq!(plan.width, Some(1280));
    }

    #[test]
    fn test_percentages_need_duration() {
        let options = ScreenshotOptions {
            timestamps: vec![Timestamp::Percent(25.0)],
            width: None,
        };
        assert!(matches!(
            plan_screenshots(&options, &metadata(None)),
            Err(ProfileError::InvalidOption { .. })
        ));

        // Absolute positions are fine without one
        let plan = plan_screenshots(&ScreenshotOptions::default(), &metadata(None)).unwrap();
        assert_eq!(plan.frames[0].seconds, 0.0);
    }

    #[test]
    fn test_commands_seek_per_frame() {
        let options = ScreenshotOptions {
            timestamps: vec![Timestamp::Seconds(2.0)],
            width: Some(320),
        };
        let plan = plan_screenshots(&options, &metadata(Some(10.0))).unwrap();
        let commands = plan.commands(Path::new("/src/in.mp4"), Path::new("/stage/shots"));

        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0].args(),
            [
                "-ss", "2.000", "-i", "/src/in.mp4", "-frames:v", "1", "-vf", "scale=320:-2",
                "-q:v", "2", "/stage/shots/frame-00.jpg",
            ]
            .map(String::from)
        );
    }
}
