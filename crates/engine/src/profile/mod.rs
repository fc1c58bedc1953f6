//! Encoding profiles for clipcache
//!
//! One [`Profile`] variant per output codec. Each turns a filter graph plus
//! options and stream metadata into a complete [`EncodeSpec`]. Custom
//! profiles are registered by name in a [`ProfileRegistry`] and validated at
//! registration time.

pub mod animated;
pub mod custom;
pub mod h26x;
pub mod vp9;

pub use custom::{converter_from_config, Converter, CustomProfile, CustomProfileSpec};
pub use vp9::{select_vp9_bucket, Vp9Bucket, VP9_BUCKETS};

use crate::filters::FilterGraph;
use crate::options::{ConversionOptions, OptionSet};
use crate::probe::StreamMetadata;
use clipcache_config::Config;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for profile resolution and encode-spec construction
#[derive(Debug, Error)]
pub enum ProfileError {
    /// No built-in or registered profile has this name
    #[error("Unknown profile '{0}'")]
    UnknownProfile(String),

    /// A custom profile was registered without an output extension
    #[error("Custom profile '{0}' has no file extension")]
    MissingExtension(String),

    /// A custom profile was registered without a converter
    #[error("Custom profile '{0}' has no converter")]
    MissingConverter(String),

    /// A custom profile name shadows a built-in one
    #[error("Profile name '{0}' is reserved for a built-in profile")]
    ReservedName(String),

    /// An option value cannot be realized by this profile
    #[error("Invalid option for profile '{profile}': {reason}")]
    InvalidOption { profile: String, reason: String },
}

/// Closed set of output strategies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Profile {
    H264,
    H265,
    Vp9,
    WebP,
    Gif,
    Custom(String),
}

impl Profile {
    /// Built-in profile for a name, if any.
    pub fn builtin(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "h264" => Some(Profile::H264),
            "h265" => Some(Profile::H265),
            "vp9" => Some(Profile::Vp9),
            "webp" => Some(Profile::WebP),
            "gif" => Some(Profile::Gif),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Profile::H264 => "h264",
            Profile::H265 => "h265",
            Profile::Vp9 => "vp9",
            Profile::WebP => "webp",
            Profile::Gif => "gif",
            Profile::Custom(name) => name,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Audio handling of an encode.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioSpec {
    /// Drop all audio streams
    None,
    Encode {
        codec: String,
        channels: Option<u32>,
        /// Codec-specific VBR quality tier
        quality: Option<u32>,
        bitrate: Option<String>,
    },
}

/// Everything the transcoder needs to produce one output.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSpec {
    pub video_codec: String,
    pub audio: AudioSpec,
    /// Complex filter graph text
    pub filter_graph: String,
    /// Graph label mapped to the output video stream
    pub video_label: String,
    /// Inputs after the source, in order (`[1:v]`, ...)
    pub extra_inputs: Vec<PathBuf>,
    /// Codec and rate-control options
    pub output_options: Vec<String>,
    /// Container-level flags
    pub container_flags: Vec<String>,
    /// Output file extension, without the dot
    pub extension: String,
}

/// Inputs shared by every profile.
#[derive(Debug, Clone, Copy)]
pub struct ProfileInput<'a> {
    pub graph: &'a FilterGraph,
    pub options: &'a ConversionOptions,
    /// The untyped option set, for custom profiles reading their own knobs
    pub raw_options: &'a OptionSet,
    pub metadata: &'a StreamMetadata,
}

impl ProfileInput<'_> {
    /// Frame rate of the output: the requested one, else the source's, else 30.
    pub fn target_fps(&self) -> f64 {
        self.options
            .fps
            .filter(|fps| *fps > 0.0)
            .or(self.metadata.frame_rate)
            .unwrap_or(30.0)
    }
}

/// Custom profiles by name, alongside the built-in set.
#[derive(Clone, Default)]
pub struct ProfileRegistry {
    custom: HashMap<String, CustomProfile>,
}

impl fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("ProfileRegistry")
            .field("custom", &names)
            .finish()
    }
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every `[profiles.<name>]` table of the config registered.
    ///
    /// Fails on the first incomplete entry so that configuration problems
    /// surface before any transcoding starts.
    pub fn from_config(config: &Config) -> Result<Self, ProfileError> {
        let mut registry = Self::new();
        for (name, profile) in &config.profiles {
            registry.register(
                name,
                CustomProfileSpec {
                    extension: profile.extension.clone(),
                    converter: converter_from_config(profile),
                },
            )?;
        }
        Ok(registry)
    }

    /// Validate and register a custom profile.
    pub fn register(&mut self, name: &str, spec: CustomProfileSpec) -> Result<(), ProfileError> {
        if Profile::builtin(name).is_some() {
            return Err(ProfileError::ReservedName(name.to_string()));
        }
        let profile = CustomProfile::validate(name, spec)?;
        self.custom.insert(name.to_string(), profile);
        Ok(())
    }

    /// Resolve a profile name to a built-in or registered custom profile.
    pub fn resolve(&self, name: &str) -> Result<Profile, ProfileError> {
        if let Some(profile) = Profile::builtin(name) {
            return Ok(profile);
        }
        if self.custom.contains_key(name) {
            return Ok(Profile::Custom(name.to_string()));
        }
        Err(ProfileError::UnknownProfile(name.to_string()))
    }

    /// Output extension of a profile.
    pub fn extension(&self, profile: &Profile) -> Result<String, ProfileError> {
        Ok(match profile {
            Profile::H264 | Profile::H265 => "mp4".to_string(),
            Profile::Vp9 => "webm".to_string(),
            Profile::WebP => "webp".to_string(),
            Profile::Gif => "gif".to_string(),
            Profile::Custom(name) => self.custom_profile(name)?.extension().to_string(),
        })
    }

    /// Build the encode specification for one conversion.
    pub fn encode(&self, profile: &Profile, input: &ProfileInput<'_>) -> Result<EncodeSpec, ProfileError> {
        match profile {
            Profile::H264 => Ok(h26x::encode_h264(input)),
            Profile::H265 => Ok(h26x::encode_h265(input)),
            Profile::Vp9 => Ok(vp9::encode_vp9(input)),
            Profile::WebP => Ok(animated::encode_webp(input)),
            Profile::Gif => Ok(animated::encode_gif(input)),
            Profile::Custom(name) => self.custom_profile(name)?.encode(input),
        }
    }

    pub fn custom_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.custom.keys().cloned().collect();
        names.sort();
        names
    }

    fn custom_profile(&self, name: &str) -> Result<&CustomProfile, ProfileError> {
        self.custom
            .get(name)
            .ok_or_else(|| ProfileError::UnknownProfile(name.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::filters::build_filters;

    pub fn metadata(width: u32, height: u32, fps: f64) -> StreamMetadata {
        StreamMetadata {
            video_codec: "h264".to_string(),
            width,
            height,
            frame_rate_raw: Some(format!("{}/1", fps)),
            frame_rate: Some(fps),
            duration_secs: Some(10.0),
            has_audio: true,
        }
    }

    /// Owns everything a [`ProfileInput`] borrows.
    pub struct Fixture {
        pub graph: FilterGraph,
        pub options: ConversionOptions,
        pub raw: OptionSet,
        pub metadata: StreamMetadata,
    }

    impl Fixture {
        pub fn new(raw: OptionSet, metadata: StreamMetadata) -> Self {
            let options: ConversionOptions = raw.resolve().expect("valid options");
            let graph = build_filters(&options, &metadata);
            Self {
                graph,
                options,
                raw,
                metadata,
            }
        }

        pub fn input(&self) -> ProfileInput<'_> {
            ProfileInput {
                graph: &self.graph,
                options: &self.options,
                raw_options: &self.raw,
                metadata: &self.metadata,
            }
        }
    }

    /// True if `flag` is immediately followed by `value`.
    pub fn has_pair(options: &[String], flag: &str, value: &str) -> bool {
        options.windows(2).any(|w| w[0] == flag && w[1] == value)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use clipcache_config::CustomProfileConfig;
    use std::sync::Arc;

    #[test]
    fn test_builtin_resolution() {
        let registry = ProfileRegistry::new();
        assert_eq!(registry.resolve("h264").unwrap(), Profile::H264);
        assert_eq!(registry.resolve("VP9").unwrap(), Profile::Vp9);
        assert_eq!(registry.extension(&Profile::Gif).unwrap(), "gif");
        assert_eq!(registry.extension(&Profile::H265).unwrap(), "mp4");
        assert!(matches!(
            registry.resolve("av1"),
            Err(ProfileError::UnknownProfile(name)) if name == "av1"
        ));
    }

    #[test]
    fn test_register_validates_eagerly() {
        let mut registry = ProfileRegistry::new();
        let converter: Converter =
            Arc::new(|input: &ProfileInput<'_>| Ok::<_, ProfileError>(h26x::encode_h264(input)));

        assert!(matches!(
            registry.register("no-ext", CustomProfileSpec { extension: None, converter: Some(converter.clone()) }),
            Err(ProfileError::MissingExtension(_))
        ));
        assert!(matches!(
            registry.register("no-conv", CustomProfileSpec { extension: Some("mkv".into()), converter: None }),
            Err(ProfileError::MissingConverter(_))
        ));
        assert!(matches!(
            registry.register("gif", CustomProfileSpec { extension: Some("gif".into()), converter: Some(converter.clone()) }),
            Err(ProfileError::ReservedName(_))
        ));

        registry
            .register("mkv", CustomProfileSpec { extension: Some("mkv".into()), converter: Some(converter) })
            .unwrap();
        assert_eq!(registry.resolve("mkv").unwrap(), Profile::Custom("mkv".into()));
        assert_eq!(registry.extension(&Profile::Custom("mkv".into())).unwrap(), "mkv");
        assert_eq!(registry.custom_names(), vec!["mkv".to_string()]);
    }

    #[test]
    fn test_from_config_rejects_incomplete_profile() {
        let mut config = Config::default();
        config.profiles.insert(
            "broken".into(),
            CustomProfileConfig {
                extension: Some("mkv".into()),
                video_codec: None,
                ..Default::default()
            },
        );
        assert!(matches!(
            ProfileRegistry::from_config(&config),
            Err(ProfileError::MissingConverter(name)) if name == "broken"
        ));
    }

    #[test]
    fn test_target_fps_prefers_requested() {
        let fixture = Fixture::new(OptionSet::new().with("fps", 12), metadata(640, 360, 25.0));
        assert_eq!(fixture.input().target_fps(), 12.0);

        let fixture = Fixture::new(OptionSet::new(), metadata(640, 360, 25.0));
        assert_eq!(fixture.input().target_fps(), 25.0);
    }
}
