//! H.264 and H.265 profiles (MP4 container).

use super::{AudioSpec, EncodeSpec, ProfileInput};

/// AAC VBR quality tier used for every MP4 output
const AAC_QUALITY: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    H264,
    H265,
}

pub fn encode_h264(input: &ProfileInput<'_>) -> EncodeSpec {
    encode(input, Flavor::H264)
}

pub fn encode_h265(input: &ProfileInput<'_>) -> EncodeSpec {
    encode(input, Flavor::H265)
}

/// Keyframe interval: half a second of frames, never below one.
pub fn keyframe_interval(fps: f64) -> u32 {
    ((fps / 2.0).floor() as u32).max(1)
}

fn encode(input: &ProfileInput<'_>, flavor: Flavor) -> EncodeSpec {
    let options = input.options;
    let mut output_options = Vec::new();

    if let Some(preset) = &options.preset {
        output_options.extend(["-preset".to_string(), preset.clone()]);
    }

    // CRF and the VBV pair are exclusive; CRF wins
    match options.crf {
        Some(crf) => output_options.extend(["-crf".to_string(), crf.to_string()]),
        None => {
            if let Some(max_rate) = &options.max_rate {
                output_options.extend(["-maxrate".to_string(), max_rate.clone()]);
            }
            if let Some(buf_size) = &options.buf_size {
                output_options.extend(["-bufsize".to_string(), buf_size.clone()]);
            }
        }
    }

    output_options.extend([
        "-g".to_string(),
        keyframe_interval(input.target_fps()).to_string(),
        "-bf".to_string(),
        "2".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
    ]);

    let video_codec = match flavor {
        Flavor::H264 => {
            output_options.extend(["-profile:v".to_string(), "high".to_string()]);
            "libx264"
        }
        Flavor::H265 => {
            // Apple players only accept the hvc1 tag
            output_options.extend(["-tag:v".to_string(), "hvc1".to_string()]);
            "libx265"
        }
    };

    EncodeSpec {
        video_codec: video_codec.to_string(),
        // Stereo: some players reject multichannel AAC
        audio: AudioSpec::Encode {
            codec: "aac".to_string(),
            channels: Some(2),
            quality: Some(AAC_QUALITY),
            bitrate: None,
        },
        filter_graph: input.graph.render(),
        video_label: crate::filters::VIDEO_OUTPUT_LABEL.to_string(),
        extra_inputs: input.graph.overlay_input.iter().cloned().collect(),
        output_options,
        container_flags: vec!["-movflags".to_string(), "+faststart".to_string()],
        extension: "mp4".to_string(),
    }
}
