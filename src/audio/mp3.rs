//! MPEG audio frame-stream helpers.
//!
//! MP3 files are self-delimiting frame streams, so clips encoded with the same
//! settings can be joined by concatenating their frames. Only the leading
//! ID3v2 tag of the first clip and the trailing ID3v1 tag of the last clip are
//! kept.

use std::time::Duration;

use super::AudioClip;

const BITRATES_V1_L3: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L3: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

pub fn looks_like_mp3(bytes: &[u8]) -> bool {
    bytes.starts_with(b"ID3") || (bytes.len() >= 2 && is_frame_sync(bytes[0], bytes[1]))
}

fn is_frame_sync(b0: u8, b1: u8) -> bool {
    b0 == 0xFF && (b1 & 0xE0) == 0xE0
}

/// Length of a leading ID3v2 tag, including its footer.
fn id3v2_len(bytes: &[u8]) -> usize {
    if bytes.len() < 10 || !bytes.starts_with(b"ID3") {
        return 0;
    }
    let size = bytes[6..10]
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | (*b & 0x7F) as usize);
    let footer = if bytes[5] & 0x10 != 0 { 10 } else { 0 };
    (10 + size + footer).min(bytes.len())
}

fn id3v1_len(bytes: &[u8]) -> usize {
    if bytes.len() >= 128 && &bytes[bytes.len() - 128..bytes.len() - 125] == b"TAG" {
        128
    } else {
        0
    }
}

/// Estimate the playback length from the first Layer III frame header.
///
/// Assumes a constant bitrate; returns `None` when no frame header is found.
pub fn duration(bytes: &[u8]) -> Option<Duration> {
    let start = id3v2_len(bytes);
    let end = bytes.len() - id3v1_len(bytes);
    let audio = bytes.get(start..end)?;

    let pos = audio
        .windows(4)
        .position(|w| is_frame_sync(w[0], w[1]) && bitrate_kbps(w).is_some())?;
    let kbps = bitrate_kbps(&audio[pos..pos + 4])?;
    let bits = (audio.len() - pos) as f64 * 8.0;
    Some(Duration::from_secs_f64(bits / (kbps as f64 * 1000.0)))
}

fn bitrate_kbps(header: &[u8]) -> Option<u32> {
    let version = (header[1] >> 3) & 0b11;
    let layer = (header[1] >> 1) & 0b11;
    let bitrate_idx = (header[2] >> 4) as usize;
    let rate_idx = (header[2] >> 2) & 0b11;
    if version == 0b01 || layer != 0b01 || rate_idx == 0b11 || bitrate_idx == 0 || bitrate_idx > 14 {
        return None;
    }
    let table = if version == 0b11 {
        &BITRATES_V1_L3
    } else {
        &BITRATES_V2_L3
    };
    Some(table[bitrate_idx])
}

/// Concatenate MP3 clips as one frame stream.
pub fn concat(clips: &[&AudioClip]) -> Vec<u8> {
    let mut out = Vec::with_capacity(clips.iter().map(|c| c.bytes.len()).sum());
    let last = clips.len().saturating_sub(1);
    for (idx, clip) in clips.iter().enumerate() {
        let bytes = clip.bytes.as_slice();
        let start = if idx == 0 { 0 } else { id3v2_len(bytes) };
        let end = if idx == last {
            bytes.len()
        } else {
            bytes.len() - id3v1_len(bytes)
        };
        out.extend_from_slice(&bytes[start.min(end)..end]);
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::AudioFormat;

    /// `count` zero-filled MPEG-1 Layer III frames at 128 kbps / 44.1 kHz.
    pub(crate) fn frames(count: usize) -> Vec<u8> {
        const FRAME_LEN: usize = 417;
        let mut out = Vec::new();
        for _ in 0..count {
            let mut frame = vec![0u8; FRAME_LEN];
            frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
            out.extend(frame);
        }
        out
    }

    fn with_id3(body: Vec<u8>) -> Vec<u8> {
        let mut out = b"ID3\x04\x00\x00\x00\x00\x00\x05".to_vec();
        out.extend_from_slice(b"TAGGG");
        out.extend(body);
        out
    }

    fn clip(bytes: Vec<u8>) -> AudioClip {
        AudioClip {
            bytes,
            format: AudioFormat::Mp3,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn estimates_duration_from_bitrate() {
        // 16000 bytes at 128 kbps is one second
        let mut bytes = frames(1);
        bytes.resize(16000, 0);
        assert_eq!(duration(&bytes), Some(Duration::from_secs(1)));
    }

    #[test]
    fn skips_id3v2_before_probing() {
        let tagged = with_id3(frames(2));
        assert_eq!(id3v2_len(&tagged), 15);
        assert!(duration(&tagged).is_some());
    }

    #[test]
    fn no_frames_means_no_duration() {
        assert_eq!(duration(b"ID3\x04\x00\x00\x00\x00\x00\x00"), None);
    }

    #[test]
    fn concat_strips_tags_from_later_clips() {
        let first = clip(with_id3(frames(1)));
        let second = clip(with_id3(frames(2)));
        let joined = concat(&[&first, &second]);

        assert_eq!(joined.len(), first.bytes.len() + frames(2).len());
        assert!(joined.starts_with(b"ID3"));
        assert_eq!(&joined[first.bytes.len()..first.bytes.len() + 2], &[0xFF, 0xFB]);
    }
}
