//! Sample-rate and channel-count conversion of planar PCM.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::wav::Pcm;
use crate::error::AudioError;

/// Convert `pcm` to `to_rate` Hz with `to_channels` channels.
pub fn convert(pcm: Pcm, to_rate: u32, to_channels: usize) -> Result<Pcm, AudioError> {
    let from_rate = pcm.sample_rate;
    let channels = convert_channels(pcm.channels, to_channels)?;
    if from_rate == to_rate || channels.first().map_or(true, Vec::is_empty) {
        return Ok(Pcm {
            channels,
            sample_rate: to_rate,
        });
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler =
        SincFixedIn::<f32>::new(ratio, 2.0, params, channels[0].len(), channels.len())
            .map_err(|e| AudioError::Resample(e.to_string()))?;
    let resampled = resampler
        .process(&channels, None)
        .map_err(|e| AudioError::Resample(e.to_string()))?;
    Ok(Pcm {
        channels: resampled,
        sample_rate: to_rate,
    })
}

pub fn convert_channels(
    samples: Vec<Vec<f32>>,
    to_channels: usize,
) -> Result<Vec<Vec<f32>>, AudioError> {
    let from_channels = samples.len();
    if from_channels == to_channels || from_channels == 0 {
        return Ok(samples);
    }
    if to_channels == 1 {
        let len = samples[0].len();
        if samples.iter().any(|c| c.len() != len) {
            return Err(AudioError::Resample(
                "channel length mismatch in audio conversion".to_string(),
            ));
        }
        let scale = 1.0 / from_channels as f32;
        let mixed = (0..len)
            .map(|idx| samples.iter().map(|c| c[idx]).sum::<f32>() * scale)
            .collect();
        return Ok(vec![mixed]);
    }
    if from_channels == 1 {
        return Ok(vec![samples[0].clone(); to_channels]);
    }
    Err(AudioError::Resample(format!(
        "unsupported channel conversion from {from_channels} to {to_channels}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resamples_to_target_rate() {
        let pcm = Pcm {
            channels: vec![vec![0.25; 2205]],
            sample_rate: 22050,
        };
        let out = convert(pcm, 24000, 1).unwrap();
        assert_eq!(out.sample_rate, 24000);
        assert_eq!(out.channels.len(), 1);
        let frames = out.frames() as i64;
        assert!((frames - 2400).abs() <= 5, "got {frames} frames");
    }

    #[test]
    fn same_rate_only_converts_channels() {
        let pcm = Pcm {
            channels: vec![vec![0.5, -0.5]],
            sample_rate: 8000,
        };
        let out = convert(pcm, 8000, 2).unwrap();
        assert_eq!(out.channels, vec![vec![0.5, -0.5], vec![0.5, -0.5]]);
    }

    #[test]
    fn downmixes_to_mono() {
        let mixed = convert_channels(vec![vec![1.0, 0.0], vec![0.0, 0.0]], 1).unwrap();
        assert_eq!(mixed, vec![vec![0.5, 0.0]]);
    }

    #[test]
    fn rejects_unsupported_layouts() {
        let three = vec![vec![0.0]; 3];
        assert!(matches!(
            convert_channels(three, 2),
            Err(AudioError::Resample(_))
        ));
    }
}
