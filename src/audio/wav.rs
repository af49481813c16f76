//! WAV decoding, encoding and sample-level joins.

use std::io::Cursor;
use std::time::Duration;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use super::{resample, AudioClip};
use crate::error::AudioError;

/// Planar PCM: one sample vector per channel, normalized to [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Pcm {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl Pcm {
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames() as u64, self.sample_rate)
    }

    /// Append `other` (same rate and channel count), blending `overlap` frames.
    pub fn append(&mut self, other: &Pcm, overlap: usize) {
        for (dst, src) in self.channels.iter_mut().zip(&other.channels) {
            append_with_crossfade(dst, src, overlap);
        }
    }
}

fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = frames as u128 * 1_000_000_000 / sample_rate as u128;
    Duration::from_nanos(nanos as u64)
}

pub fn spec(bytes: &[u8]) -> Result<WavSpec, AudioError> {
    Ok(WavReader::new(Cursor::new(bytes))?.spec())
}

pub fn duration(bytes: &[u8]) -> Result<Duration, AudioError> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    Ok(frames_to_duration(
        reader.duration() as u64,
        reader.spec().sample_rate,
    ))
}

pub fn decode(bytes: &[u8]) -> Result<(Pcm, WavSpec), AudioError> {
    let mut reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let mut samples = vec![Vec::new(); channels];

    match spec.sample_format {
        SampleFormat::Float => {
            for (idx, sample) in reader.samples::<f32>().enumerate() {
                samples[idx % channels].push(sample?);
            }
        }
        SampleFormat::Int => {
            let max = int_scale(spec.bits_per_sample);
            for (idx, sample) in reader.samples::<i32>().enumerate() {
                samples[idx % channels].push(sample? as f32 / max);
            }
        }
    }

    Ok((
        Pcm {
            channels: samples,
            sample_rate: spec.sample_rate,
        },
        spec,
    ))
}

pub fn encode(pcm: &Pcm, spec: WavSpec) -> Result<Vec<u8>, AudioError> {
    let spec = WavSpec {
        channels: pcm.channels.len() as u16,
        sample_rate: pcm.sample_rate,
        ..spec
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        let frames = pcm.frames();
        match spec.sample_format {
            SampleFormat::Float => {
                for idx in 0..frames {
                    for channel in &pcm.channels {
                        writer.write_sample(channel[idx])?;
                    }
                }
            }
            SampleFormat::Int => {
                let max = int_scale(spec.bits_per_sample);
                for idx in 0..frames {
                    for channel in &pcm.channels {
                        let scaled = (channel[idx] * max).round().clamp(-max, max - 1.0);
                        writer.write_sample(scaled as i32)?;
                    }
                }
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

fn int_scale(bits: u16) -> f32 {
    (1_i64 << (bits.clamp(2, 32) - 1)) as f32
}

/// Mono 16-bit silence.
pub fn silence(duration: Duration, sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    silence_with_spec(
        duration,
        WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        },
    )
}

/// Silence encoded exactly as `spec`.
pub fn silence_with_spec(duration: Duration, spec: WavSpec) -> Result<Vec<u8>, AudioError> {
    let frames = (duration.as_secs_f64() * spec.sample_rate as f64).round() as usize;
    let pcm = Pcm {
        channels: vec![vec![0.0; frames]; spec.channels.max(1) as usize],
        sample_rate: spec.sample_rate,
    };
    encode(&pcm, spec)
}

/// Join WAV clips that share `spec`.
pub fn concat_same_spec(
    clips: &[&AudioClip],
    spec: WavSpec,
    crossfade: Duration,
) -> Result<Vec<u8>, AudioError> {
    let overlap = (crossfade.as_secs_f64() * spec.sample_rate as f64).round() as usize;
    let mut joined: Option<Pcm> = None;
    for clip in clips {
        let (pcm, _) = decode(&clip.bytes)?;
        match joined.as_mut() {
            Some(acc) => acc.append(&pcm, overlap),
            None => joined = Some(pcm),
        }
    }
    let joined = joined.ok_or(AudioError::Empty)?;
    encode(&joined, spec)
}

/// Join WAV clips of differing specs, resampling each to the first clip's
/// rate and channel count and encoding with the first clip's spec.
pub fn concat_normalized(clips: &[&AudioClip], crossfade: Duration) -> Result<Vec<u8>, AudioError> {
    let (first, rest) = clips.split_first().ok_or(AudioError::Empty)?;
    let (mut joined, target) = decode(&first.bytes)?;
    let channels = joined.channels.len();
    let overlap = (crossfade.as_secs_f64() * target.sample_rate as f64).round() as usize;
    for clip in rest {
        let (pcm, _) = decode(&clip.bytes)?;
        let pcm = resample::convert(pcm, target.sample_rate, channels)?;
        joined.append(&pcm, overlap);
    }
    encode(&joined, target)
}

/// Rewrite the RIFF and `data` sizes of a streamed WAV to match its length.
///
/// Streaming encoders (espeak-ng `--stdout` among them) cannot seek back and
/// leave placeholder sizes in the header.
pub fn repair_header(bytes: &mut [u8]) {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return;
    }
    let riff_len = (bytes.len() - 8) as u32;
    bytes[4..8].copy_from_slice(&riff_len.to_le_bytes());

    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        if &id == b"data" {
            let data_len = (bytes.len() - offset - 8) as u32;
            bytes[offset + 4..offset + 8].copy_from_slice(&data_len.to_le_bytes());
            return;
        }
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        offset = offset.saturating_add(8 + size + (size & 1));
    }
}

fn append_with_crossfade(dst: &mut Vec<f32>, src: &[f32], crossfade_samples: usize) {
    let overlap = crossfade_samples.min(dst.len()).min(src.len());
    if overlap == 0 {
        dst.extend_from_slice(src);
        return;
    }

    let dst_start = dst.len() - overlap;
    for i in 0..overlap {
        let t = (i + 1) as f32 / (overlap as f32 + 1.0);
        dst[dst_start + i] = dst[dst_start + i] * (1.0 - t) + src[i] * t;
    }

    dst.extend_from_slice(&src[overlap..]);
}
