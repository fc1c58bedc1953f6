//! VP9 profile (WebM container) with an automatic bitrate ladder.

use super::{AudioSpec, EncodeSpec, ProfileInput};

/// One rung of the VP9 bitrate ladder. Rates are in kbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vp9Bucket {
    pub height: u32,
    pub fps: u32,
    pub target_kbps: u32,
    pub min_kbps: u32,
    pub max_kbps: u32,
    pub crf: u32,
}

const fn bucket(height: u32, fps: u32, target_kbps: u32, min_kbps: u32, max_kbps: u32, crf: u32) -> Vp9Bucket {
    Vp9Bucket {
        height,
        fps,
        target_kbps,
        min_kbps,
        max_kbps,
        crf,
    }
}

/// Recommended VOD settings per resolution and frame rate, lowest first.
///
/// Min is 50% and max 145% of the target. The sub-720p 60fps rungs have no
/// published value and are scaled 1.5x from their 30fps counterparts.
pub const VP9_BUCKETS: &[Vp9Bucket] = &[
    bucket(240, 30, 150, 75, 218, 37),
    bucket(240, 60, 225, 113, 327, 37),
    bucket(360, 30, 276, 138, 400, 36),
    bucket(360, 60, 414, 207, 600, 36),
    bucket(480, 30, 512, 256, 742, 33),
    bucket(480, 60, 768, 384, 1113, 33),
    bucket(720, 30, 1024, 512, 1485, 32),
    bucket(720, 60, 1800, 900, 2610, 32),
    bucket(1080, 30, 1800, 900, 2610, 31),
    bucket(1080, 60, 3000, 1500, 4350, 31),
    bucket(1440, 30, 6000, 3000, 8700, 24),
    bucket(1440, 60, 9000, 4500, 13050, 24),
    bucket(2160, 30, 12000, 6000, 17400, 15),
    bucket(2160, 60, 18000, 9000, 26100, 15),
];

/// Closest value by absolute distance; ties go to the earlier candidate.
fn closest(candidates: impl Iterator<Item = u32>, wanted: f64) -> Option<u32> {
    candidates.fold(None, |best: Option<u32>, candidate| match best {
        Some(b) if (b as f64 - wanted).abs() <= (candidate as f64 - wanted).abs() => Some(b),
        _ => Some(candidate),
    })
}

/// Select the ladder rung for a frame whose smaller side is `dimension`.
pub fn select_vp9_bucket(dimension: u32, fps: f64) -> &'static Vp9Bucket {
    let height = closest(VP9_BUCKETS.iter().map(|b| b.height), dimension as f64)
        .unwrap_or(VP9_BUCKETS[0].height);
    let rate = closest(
        VP9_BUCKETS
            .iter()
            .filter(|b| b.height == height)
            .map(|b| b.fps),
        fps,
    )
    .unwrap_or(30);

    VP9_BUCKETS
        .iter()
        .find(|b| b.height == height && b.fps == rate)
        .unwrap_or(&VP9_BUCKETS[0])
}

/// Keyframe interval: eight seconds of frames.
pub fn keyframe_interval(fps: f64) -> u32 {
    ((fps * 8.0).round() as u32).max(1)
}

pub fn encode_vp9(input: &ProfileInput<'_>) -> EncodeSpec {
    let options = input.options;
    let fps = input.target_fps();
    let graph = input.graph;
    let rung = select_vp9_bucket(graph.output_width.min(graph.output_height), fps);

    let mut output_options = Vec::new();
    if options.has_explicit_rates() {
        for (flag, value) in [
            ("-b:v", &options.bitrate),
            ("-minrate", &options.min_rate),
            ("-maxrate", &options.max_rate),
        ] {
            if let Some(value) = value {
                output_options.extend([flag.to_string(), value.clone()]);
            }
        }
    } else {
        output_options.extend([
            "-b:v".to_string(),
            format!("{}k", rung.target_kbps),
            "-minrate".to_string(),
            format!("{}k", rung.min_kbps),
            "-maxrate".to_string(),
            format!("{}k", rung.max_kbps),
        ]);
    }

    output_options.extend([
        "-crf".to_string(),
        options.crf.unwrap_or(rung.crf).to_string(),
        "-g".to_string(),
        keyframe_interval(fps).to_string(),
        "-row-mt".to_string(),
        "1".to_string(),
    ]);
    if let Some(cpu_used) = options.cpu_used {
        output_options.extend(["-cpu-used".to_string(), cpu_used.to_string()]);
    }

    EncodeSpec {
        video_codec: "libvpx-vp9".to_string(),
        audio: AudioSpec::Encode {
            codec: "libopus".to_string(),
            channels: None,
            quality: None,
            bitrate: None,
        },
        filter_graph: graph.render(),
        video_label: crate::filters::VIDEO_OUTPUT_LABEL.to_string(),
        extra_inputs: graph.overlay_input.iter().cloned().collect(),
        output_options,
        container_flags: Vec::new(),
        extension: "webm".to_string(),
    }
}
