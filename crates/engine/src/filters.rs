//! Filter graph construction.
//!
//! Turns [`ConversionOptions`] and probed [`StreamMetadata`] into an ordered
//! list of [`FilterStage`]s. The order is fixed (time remap, frame rate,
//! scale, saturation, overlay) because reordering changes the output.

use crate::options::{Anchor, ConversionOptions, OverlayOptions};
use crate::probe::StreamMetadata;
use std::fmt;
use std::path::PathBuf;

/// Label of the video stream produced by [`FilterGraph::render`].
pub const VIDEO_OUTPUT_LABEL: &str = "vout";

/// One dimension of a scale stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Pixels(u32),
    /// Derived from the other dimension, kept even.
    Auto,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Pixels(px) => write!(f, "{}", px),
            Dimension::Auto => f.write_str("-2"),
        }
    }
}

/// A single filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterStage {
    /// Playback-speed remap, `setpts=<factor>*PTS`.
    TimeRemap { factor: f64 },
    Fps(f64),
    Scale { width: Dimension, height: Dimension },
    Saturation(f64),
    /// Secondary input composited at the given x/y expressions.
    Overlay { x: String, y: String },
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterStage::TimeRemap { factor } => write!(f, "setpts={:.6}*PTS", factor),
            FilterStage::Fps(fps) => write!(f, "fps={}", format_number(*fps)),
            FilterStage::Scale { width, height } => {
                write!(f, "scale={}:{}:flags=lanczos", width, height)
            }
            FilterStage::Saturation(s) => write!(f, "eq=saturation={}", format_number(*s)),
            FilterStage::Overlay { x, y } => write!(f, "overlay={}:{}", x, y),
        }
    }
}

/// Formats a float without a trailing `.0` for whole numbers.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Largest even number not above `value`, never below 2.
pub fn floor_even(value: f64) -> u32 {
    // Absorb float error so that 300/1081*1081 still floors to 300
    let floored = (value + 1e-9).floor().max(0.0) as u32;
    (floored - floored % 2).max(2)
}

/// Ordered stages plus the secondary input they reference.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterGraph {
    pub stages: Vec<FilterStage>,
    /// Overlay image, fed to the transcoder as input #1
    pub overlay_input: Option<PathBuf>,
    /// Frame size after the scale stage
    pub output_width: u32,
    pub output_height: u32,
}

impl FilterGraph {
    /// Renders the stages as a labelled complex filter graph whose output
    /// is `[vout]`.
    pub fn render(&self) -> String {
        let chain: Vec<String> = self
            .stages
            .iter()
            .filter(|s| !matches!(s, FilterStage::Overlay { .. }))
            .map(ToString::to_string)
            .collect();
        let chain = if chain.is_empty() {
            "null".to_string()
        } else {
            chain.join(",")
        };

        match self
            .stages
            .iter()
            .find(|s| matches!(s, FilterStage::Overlay { .. }))
        {
            Some(overlay) => format!(
                "[0:v]{}[base];[base][1:v]{}[{}]",
                chain, overlay, VIDEO_OUTPUT_LABEL
            ),
            None => format!("[0:v]{}[{}]", chain, VIDEO_OUTPUT_LABEL),
        }
    }

    /// Renders the graph and continues it with `tail`, which reads
    /// `[vout]` and must label its own output.
    pub fn render_with_tail(&self, tail: &str) -> String {
        format!("{};[{}]{}", self.render(), VIDEO_OUTPUT_LABEL, tail)
    }

    pub fn has_stage(&self, predicate: impl Fn(&FilterStage) -> bool) -> bool {
        self.stages.iter().any(predicate)
    }
}

/// Builds the ordered filter stages for one conversion.
pub fn build_filters(options: &ConversionOptions, meta: &StreamMetadata) -> FilterGraph {
    let mut stages = Vec::new();

    // Duration remap needs both ends; silently skipped otherwise
    if let (Some(requested), Some(source)) = (options.duration, meta.duration_secs) {
        if requested > 0.0 && source > 0.0 {
            stages.push(FilterStage::TimeRemap {
                factor: requested / source,
            });
        }
    }

    if let Some(fps) = options.fps.filter(|fps| *fps > 0.0) {
        stages.push(FilterStage::Fps(fps));
    }

    let (mut output_width, mut output_height) = (meta.width, meta.height);
    if let Some((stage, width, height)) = scale_stage(options, meta) {
        stages.push(stage);
        output_width = width;
        output_height = height;
    }

    let saturation = options.saturation();
    if saturation != 1.0 {
        stages.push(FilterStage::Saturation(saturation));
    }

    let overlay_input = options.overlay.as_ref().map(|overlay| {
        stages.push(overlay_stage(overlay));
        overlay.path.clone()
    });

    FilterGraph {
        stages,
        overlay_input,
        output_width,
        output_height,
    }
}

/// Scale stage and the resulting frame size, or `None` when no limit is set.
fn scale_stage(options: &ConversionOptions, meta: &StreamMetadata) -> Option<(FilterStage, u32, u32)> {
    let (src_w, src_h) = (meta.width as f64, meta.height as f64);
    let aspect = if src_w > 0.0 { src_h / src_w } else { 1.0 };

    match (options.max_width, options.max_height) {
        (None, None) => None,
        (Some(max_w), None) => {
            let width = floor_even((max_w as f64).min(src_w));
            let height = floor_even(width as f64 * aspect);
            Some((
                FilterStage::Scale {
                    width: Dimension::Pixels(width),
                    height: Dimension::Auto,
                },
                width,
                height,
            ))
        }
        (None, Some(max_h)) => {
            let height = floor_even((max_h as f64).min(src_h));
            let width = if aspect > 0.0 {
                floor_even(height as f64 / aspect)
            } else {
                floor_even(src_w)
            };
            Some((
                FilterStage::Scale {
                    width: Dimension::Auto,
                    height: Dimension::Pixels(height),
                },
                width,
                height,
            ))
        }
        (Some(max_w), Some(max_h)) => {
            let factor = if src_w > 0.0 && src_h > 0.0 {
                (max_w as f64 / src_w).min(max_h as f64 / src_h).min(1.0)
            } else {
                1.0
            };
            let width = floor_even(src_w * factor);
            let height = floor_even(src_h * factor);
            Some((
                FilterStage::Scale {
                    width: Dimension::Pixels(width),
                    height: Dimension::Pixels(height),
                },
                width,
                height,
            ))
        }
    }
}

fn overlay_stage(overlay: &OverlayOptions) -> FilterStage {
    FilterStage::Overlay {
        x: anchor_expression(overlay.x, "main_w", "overlay_w", overlay.padding),
        y: anchor_expression(overlay.y, "main_h", "overlay_h", overlay.padding),
    }
}

/// Position expression along one axis; padding applies to start/end only.
fn anchor_expression(anchor: Anchor, main: &str, over: &str, padding: u32) -> String {
    match anchor {
        Anchor::Start => padding.to_string(),
        Anchor::Center => format!("({}-{})/2", main, over),
        Anchor::End => format!("{}-{}-{}", main, over, padding),
    }
}
