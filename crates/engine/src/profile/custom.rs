//! User-supplied profiles.

use super::{AudioSpec, EncodeSpec, ProfileError, ProfileInput};
use clipcache_config::CustomProfileConfig;
use std::fmt;
use std::sync::Arc;

/// Turns the shared profile input into an encode specification.
pub type Converter = Arc<dyn Fn(&ProfileInput<'_>) -> Result<EncodeSpec, ProfileError> + Send + Sync>;

/// Unvalidated registration request. Both fields are required.
#[derive(Clone, Default)]
pub struct CustomProfileSpec {
    pub extension: Option<String>,
    pub converter: Option<Converter>,
}

/// A custom profile that passed validation.
#[derive(Clone)]
pub struct CustomProfile {
    name: String,
    extension: String,
    converter: Converter,
}

impl fmt::Debug for CustomProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomProfile")
            .field("name", &self.name)
            .field("extension", &self.extension)
            .finish_non_exhaustive()
    }
}

impl CustomProfile {
    pub fn validate(name: &str, spec: CustomProfileSpec) -> Result<Self, ProfileError> {
        let extension = spec
            .extension
            .map(|ext| ext.trim().trim_start_matches('.').to_string())
            .filter(|ext| !ext.is_empty())
            .ok_or_else(|| ProfileError::MissingExtension(name.to_string()))?;
        let converter = spec
            .converter
            .ok_or_else(|| ProfileError::MissingConverter(name.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            extension,
            converter,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Run the converter; the registered extension always wins over the
    /// one the converter reports.
    pub fn encode(&self, input: &ProfileInput<'_>) -> Result<EncodeSpec, ProfileError> {
        let mut spec = (self.converter)(input)?;
        spec.extension = self.extension.clone();
        Ok(spec)
    }
}

/// Converter for a profile declared in the config file, or `None` when the
/// table names no video codec.
pub fn converter_from_config(profile: &CustomProfileConfig) -> Option<Converter> {
    let video_codec = profile.video_codec.clone()?;
    let audio_codec = profile.audio_codec.clone();
    let output_options = profile.output_options.clone();
    let extension = profile.extension.clone().unwrap_or_default();

    Some(Arc::new(move |input: &ProfileInput<'_>| -> Result<EncodeSpec, ProfileError> {
        let graph = input.graph;
        Ok(EncodeSpec {
            video_codec: video_codec.clone(),
            audio: match &audio_codec {
                Some(codec) => AudioSpec::Encode {
                    codec: codec.clone(),
                    channels: None,
                    quality: None,
                    bitrate: None,
                },
                None => AudioSpec::None,
            },
            filter_graph: graph.render(),
            video_label: crate::filters::VIDEO_OUTPUT_LABEL.to_string(),
            extra_inputs: graph.overlay_input.iter().cloned().collect(),
            output_options: output_options.clone(),
            container_flags: Vec::new(),
            extension: extension.clone(),
        })
    }))
}
