//! Encoded audio clips and the joins performed on them.
//!
//! WAV clips are always joinable: identical specs are joined sample-wise and
//! differing ones are resampled to the first clip's spec. MP3 files are joined
//! by frame-stream concatenation. Mixing containers needs the `transcode`
//! feature, which decodes everything and re-encodes as WAV.

pub mod mp3;
pub mod resample;
#[cfg(feature = "transcode")]
pub mod transcode;
pub mod wav;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AudioError;

/// Sample rate used for generated silence.
pub const SILENCE_SAMPLE_RATE: u32 = 24000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Flac,
    M4a,
}

impl AudioFormat {
    /// Identify a payload from its leading bytes.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            Some(AudioFormat::Wav)
        } else if bytes.starts_with(b"OggS") {
            Some(AudioFormat::Ogg)
        } else if bytes.starts_with(b"fLaC") {
            Some(AudioFormat::Flac)
        } else if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
            Some(AudioFormat::M4a)
        } else if mp3::looks_like_mp3(bytes) {
            Some(AudioFormat::Mp3)
        } else {
            None
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(AudioFormat::Wav),
            "mp3" => Some(AudioFormat::Mp3),
            "ogg" | "opus" => Some(AudioFormat::Ogg),
            "flac" => Some(AudioFormat::Flac),
            "m4a" => Some(AudioFormat::M4a),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Flac => "flac",
            AudioFormat::M4a => "m4a",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// One encoded unit of audio.
#[derive(Clone, PartialEq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
    pub duration: Duration,
}

impl fmt::Debug for AudioClip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioClip")
            .field("bytes", &self.bytes.len())
            .field("format", &self.format)
            .field("duration", &self.duration)
            .finish()
    }
}

impl AudioClip {
    /// Detect the format of `bytes` and probe its duration.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, AudioError> {
        let format = AudioFormat::detect(&bytes).ok_or(AudioError::UnknownFormat(bytes.len()))?;
        let duration = probe_duration(format, &bytes)?;
        Ok(Self {
            bytes,
            format,
            duration,
        })
    }

    pub fn read(path: &Path) -> Result<Self, AudioError> {
        Self::from_bytes(std::fs::read(path)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), AudioError> {
        std::fs::write(path, &self.bytes)?;
        Ok(())
    }

    /// Mono 16-bit WAV silence.
    pub fn silence(duration: Duration) -> Result<Self, AudioError> {
        let bytes = wav::silence(duration, SILENCE_SAMPLE_RATE)?;
        Self::from_bytes(bytes)
    }

    /// Silence shaped like `reference` when it is a WAV clip.
    pub fn silence_like(duration: Duration, reference: &AudioClip) -> Result<Self, AudioError> {
        match reference.format {
            AudioFormat::Wav => {
                let bytes = wav::silence_with_spec(duration, wav::spec(&reference.bytes)?)?;
                Self::from_bytes(bytes)
            }
            _ => Self::silence(duration),
        }
    }

    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

fn probe_duration(format: AudioFormat, bytes: &[u8]) -> Result<Duration, AudioError> {
    match format {
        AudioFormat::Wav => wav::duration(bytes),
        AudioFormat::Mp3 => Ok(mp3::duration(bytes).unwrap_or(Duration::ZERO)),
        #[cfg(feature = "transcode")]
        other => transcode::duration(bytes, other),
        #[cfg(not(feature = "transcode"))]
        _ => Ok(Duration::ZERO),
    }
}

/// Join clips in order, optionally crossfading at each boundary.
pub fn concat(clips: &[&AudioClip], crossfade: Duration) -> Result<AudioClip, AudioError> {
    let (first, rest) = clips.split_first().ok_or(AudioError::Empty)?;
    if rest.is_empty() {
        return Ok((*first).clone());
    }

    let same_format = rest.iter().all(|c| c.format == first.format);
    match first.format {
        AudioFormat::Wav if same_format => {
            let specs = clips
                .iter()
                .map(|c| wav::spec(&c.bytes))
                .collect::<Result<Vec<_>, _>>()?;
            let bytes = if specs.iter().all(|s| *s == specs[0]) {
                wav::concat_same_spec(clips, specs[0], crossfade)?
            } else {
                if let Some(other) = specs.iter().find(|s| **s != specs[0]) {
                    log::debug!(
                        "Resampling {} to join with {}",
                        describe_spec(*other),
                        describe_spec(specs[0])
                    );
                }
                wav::concat_normalized(clips, crossfade)?
            };
            AudioClip::from_bytes(bytes)
        }
        AudioFormat::Mp3 if same_format => {
            if !crossfade.is_zero() {
                log::warn!("Crossfade requires decoding; joining MP3 streams without it");
            }
            let bytes = mp3::concat(clips);
            AudioClip::from_bytes(bytes)
        }
        _ => {
            let found = rest
                .iter()
                .find(|c| c.format != first.format)
                .map(|c| c.format)
                .unwrap_or(first.format);
            transcode_or_mismatch(clips, crossfade, first.format.to_string(), found.to_string())
        }
    }
}

fn describe_spec(spec: hound::WavSpec) -> String {
    format!(
        "wav {}Hz/{}ch/{}bit",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    )
}

#[cfg(feature = "transcode")]
fn transcode_or_mismatch(
    clips: &[&AudioClip],
    crossfade: Duration,
    expected: String,
    found: String,
) -> Result<AudioClip, AudioError> {
    log::debug!("Transcoding to join {found} with {expected}");
    transcode::concat(clips, crossfade)
}

#[cfg(not(feature = "transcode"))]
fn transcode_or_mismatch(
    _clips: &[&AudioClip],
    _crossfade: Duration,
    expected: String,
    found: String,
) -> Result<AudioClip, AudioError> {
    Err(AudioError::FormatMismatch { expected, found })
}
