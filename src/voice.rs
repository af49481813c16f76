//! Voice resolution.
//!
//! Every field of a [`VoiceProfile`] is resolved independently through the
//! same layers, highest first:
//!
//! 1. caller overrides for this session,
//! 2. persona environment defaults (`TTS_PERSONA_<NAME>_*`), speaker name
//!    before persona mode,
//! 3. the pacing profile registered for the speaker or persona mode,
//! 4. global environment defaults (`TTS_*`),
//! 5. the backend's default voice and the crate's numeric defaults.
//!
//! A caller can therefore override the speed while still inheriting the
//! persona's exaggeration.

use serde::{Deserialize, Serialize};

use crate::config::EnvConfig;
use crate::error::ConfigurationError;

pub const DEFAULT_TEMPERATURE: f32 = 0.6;
pub const DEFAULT_EXAGGERATION: f32 = 0.9;
pub const DEFAULT_GUIDANCE_WEIGHT: f32 = 0.3;
pub const DEFAULT_SPEED_FACTOR: f32 = 1.0;
pub const DEFAULT_SEED: u64 = 2024;

/// One layer of partially specified voice settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub voice: Option<String>,
    pub temperature: Option<f32>,
    pub exaggeration: Option<f32>,
    pub guidance_weight: Option<f32>,
    pub speed_factor: Option<f32>,
    pub seed: Option<u64>,
    pub max_chunk_chars: Option<usize>,
    pub language: Option<String>,
}

impl VoiceSettings {
    /// Fill every unset field from `lower`.
    pub fn or(&self, lower: &VoiceSettings) -> VoiceSettings {
        VoiceSettings {
            voice: self.voice.clone().or_else(|| lower.voice.clone()),
            temperature: self.temperature.or(lower.temperature),
            exaggeration: self.exaggeration.or(lower.exaggeration),
            guidance_weight: self.guidance_weight.or(lower.guidance_weight),
            speed_factor: self.speed_factor.or(lower.speed_factor),
            seed: self.seed.or(lower.seed),
            max_chunk_chars: self.max_chunk_chars.or(lower.max_chunk_chars),
            language: self.language.clone().or_else(|| lower.language.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == VoiceSettings::default()
    }

    /// Conservative pacing: slightly slower, calmer delivery in smaller chunks.
    pub fn conservative_pacing() -> Self {
        Self {
            temperature: Some(0.75),
            exaggeration: Some(0.7),
            guidance_weight: Some(0.3),
            speed_factor: Some(0.95),
            max_chunk_chars: Some(240),
            ..Default::default()
        }
    }
}

/// Fully resolved voice identity and tuning for one speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub speaker_or_mode: String,
    /// `None` only when the active backend accepts no explicit voice.
    pub voice_id: Option<String>,
    pub temperature: f32,
    pub exaggeration: f32,
    pub guidance_weight: f32,
    pub speed_factor: f32,
    pub seed: Option<u64>,
    pub max_chunk_chars: Option<usize>,
    pub language: Option<String>,
}

/// What the primary backend needs from resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendVoiceInfo {
    pub default_voice: Option<String>,
    pub requires_voice: bool,
}

/// Pure resolver over an immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct VoiceResolver<'a> {
    config: &'a EnvConfig,
    backend: BackendVoiceInfo,
}

impl<'a> VoiceResolver<'a> {
    pub fn new(config: &'a EnvConfig, backend: BackendVoiceInfo) -> Self {
        Self { config, backend }
    }

    pub fn resolve(
        &self,
        speaker: &str,
        persona_mode: Option<&str>,
        overrides: &VoiceSettings,
    ) -> Result<VoiceProfile, ConfigurationError> {
        let speaker_key = persona_key(speaker);
        let mode_key = persona_mode.map(persona_key);

        let mut merged = overrides.clone();
        if let Some(persona) = self.config.personas.get(&speaker_key) {
            merged = merged.or(persona);
        }
        if let Some(persona) = mode_key.as_ref().and_then(|k| self.config.personas.get(k)) {
            merged = merged.or(persona);
        }
        if let Some(pacing) = self.config.pacing.get(&speaker_key) {
            merged = merged.or(pacing);
        }
        if let Some(pacing) = mode_key.as_ref().and_then(|k| self.config.pacing.get(k)) {
            merged = merged.or(pacing);
        }
        merged = merged.or(&self.config.global);

        let voice_id = merged.voice.or_else(|| self.backend.default_voice.clone());
        if voice_id.is_none() && self.backend.requires_voice {
            return Err(ConfigurationError::UnresolvedVoice {
                speaker: speaker.to_string(),
            });
        }

        Ok(VoiceProfile {
            speaker_or_mode: speaker.to_string(),
            voice_id,
            temperature: merged.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            exaggeration: merged.exaggeration.unwrap_or(DEFAULT_EXAGGERATION),
            guidance_weight: merged.guidance_weight.unwrap_or(DEFAULT_GUIDANCE_WEIGHT),
            speed_factor: merged.speed_factor.unwrap_or(DEFAULT_SPEED_FACTOR),
            seed: merged.seed.or(Some(DEFAULT_SEED)),
            max_chunk_chars: merged.max_chunk_chars,
            language: merged.language,
        })
    }
}

/// Normalize a speaker or persona name for lookups (`"DJ Cara"` → `"djcara"`).
pub fn persona_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}
