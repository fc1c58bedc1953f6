//! Animated image profiles: WebP and GIF. Neither carries audio.

use super::{AudioSpec, EncodeSpec, ProfileInput};

/// Label of the paletted GIF stream
pub const GIF_OUTPUT_LABEL: &str = "gif";

/// Two-pass palette: one branch generates the palette, the other applies it.
pub const GIF_PALETTE_TAIL: &str = "split[a][b];[a]palettegen[p];[b][p]paletteuse[gif]";

pub fn encode_webp(input: &ProfileInput<'_>) -> EncodeSpec {
    let graph = input.graph;
    EncodeSpec {
        video_codec: "libwebp".to_string(),
        audio: AudioSpec::None,
        filter_graph: graph.render(),
        video_label: crate::filters::VIDEO_OUTPUT_LABEL.to_string(),
        extra_inputs: graph.overlay_input.iter().cloned().collect(),
        output_options: [
            "-preset",
            "picture",
            "-compression_level",
            "6",
            "-loop",
            "0",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
        container_flags: Vec::new(),
        extension: "webp".to_string(),
    }
}

pub fn encode_gif(input: &ProfileInput<'_>) -> EncodeSpec {
    let graph = input.graph;
    EncodeSpec {
        video_codec: "gif".to_string(),
        audio: AudioSpec::None,
        filter_graph: graph.render_with_tail(GIF_PALETTE_TAIL),
        video_label: GIF_OUTPUT_LABEL.to_string(),
        extra_inputs: graph.overlay_input.iter().cloned().collect(),
        output_options: vec!["-loop".to_string(), "0".to_string()],
        container_flags: Vec::new(),
        extension: "gif".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::options::OptionSet;

    #[test]
    fn test_gif_appends_palette_passes() {
        let fixture = Fixture::new(
            OptionSet::new().with("duration", 2).with("fps", 4).with("maxWidth", 600),
            metadata(1920, 1080, 30.0),
        );
        let spec = encode_gif(&fixture.input());

        assert_eq!(
            spec.filter_graph,
            "[0:v]setpts=0.200000*PTS,fps=4,scale=600:-2:flags=lanczos[vout];\
             [vout]split[a][b];[a]palettegen[p];[b][p]paletteuse[gif]"
        );
        assert_eq!(spec.video_label, "gif");
        assert_eq!(spec.audio, AudioSpec::None);
    }

    #[test]
    fn test_webp_settings() {
        let fixture = Fixture::new(OptionSet::new(), metadata(320, 240, 15.0));
        let spec = encode_webp(&fixture.input());

        assert_eq!(spec.video_codec, "libwebp");
        assert!(has_pair(&spec.output_options, "-preset", "picture"));
        assert!(has_pair(&spec.output_options, "-compression_level", "6"));
        assert!(has_pair(&spec.output_options, "-loop", "0"));
        assert_eq!(spec.audio, AudioSpec::None);
        assert_eq!(spec.filter_graph, "[0:v]null[vout]");
    }
}
