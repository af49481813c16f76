//! Decode-normalize-encode joins for clips of differing formats.

use std::io::Cursor;
use std::time::Duration;

use hound::{SampleFormat, WavSpec};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::resample;
use super::wav::{self, Pcm};
use super::{AudioClip, AudioFormat};
use crate::error::AudioError;

pub fn duration(bytes: &[u8], format: AudioFormat) -> Result<Duration, AudioError> {
    Ok(decode(bytes, format)?.duration())
}

/// Decode any supported container to planar f32.
pub fn decode(bytes: &[u8], format: AudioFormat) -> Result<Pcm, AudioError> {
    if format == AudioFormat::Wav {
        return Ok(wav::decode(bytes)?.0);
    }

    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let mut hint = Hint::new();
    hint.with_extension(format.extension());

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioError::Decode(e.to_string()))?;
    let mut reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioError::Decode(format!("no decodable {format} track")))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::Decode(e.to_string()))?;

    let mut channels: Vec<Vec<f32>> = Vec::new();
    while let Ok(packet) = reader.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                log::debug!("Skipping undecodable {format} packet: {e}");
                continue;
            }
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        let count = spec.channels.count().max(1);
        if channels.len() != count {
            channels = vec![Vec::new(); count];
        }
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        for (idx, sample) in buf.samples().iter().enumerate() {
            channels[idx % count].push(*sample);
        }
    }

    if channels.is_empty() {
        return Err(AudioError::Decode(format!("{format} stream had no audio")));
    }
    Ok(Pcm {
        channels,
        sample_rate,
    })
}

/// Join clips of any format into a 32-bit float WAV shaped like the first clip.
pub fn concat(clips: &[&AudioClip], crossfade: Duration) -> Result<AudioClip, AudioError> {
    let mut decoded = clips.iter().map(|c| decode(&c.bytes, c.format));
    let mut joined = decoded.next().ok_or(AudioError::Empty)??;
    let target_rate = joined.sample_rate;
    let target_channels = joined.channels.len();
    let overlap = (crossfade.as_secs_f64() * target_rate as f64).round() as usize;

    for next in decoded {
        let next = resample::convert(next?, target_rate, target_channels)?;
        joined.append(&next, overlap);
    }

    let bytes = wav::encode(
        &joined,
        WavSpec {
            channels: target_channels as u16,
            sample_rate: target_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        },
    )?;
    AudioClip::from_bytes(bytes)
}
