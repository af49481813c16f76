//! Local fallback synthesis through the espeak-ng command-line tool.
//!
//! Needs no network or credentials. The voice id of a profile is ignored;
//! only its language and speed factor shape the output.

use std::borrow::Cow;
use std::io::Write;
use std::process::{Command, Stdio};

use async_trait::async_trait;

use super::{BackendKind, SynthesisBackend, VoiceEntry};
use crate::audio::{wav, AudioClip};
use crate::config::OfflineConfig;
use crate::error::SynthesisError;
use crate::voice::{BackendVoiceInfo, VoiceProfile};

const MIN_WPM: u32 = 80;
const MAX_WPM: u32 = 450;

pub struct OfflineBackend {
    config: OfflineConfig,
}

impl OfflineBackend {
    pub fn new(config: OfflineConfig) -> Self {
        Self { config }
    }

    fn words_per_minute(&self, speed_factor: f32) -> u32 {
        let wpm = (self.config.words_per_minute as f32 * speed_factor).round();
        (wpm.max(0.0) as u32).clamp(MIN_WPM, MAX_WPM)
    }
}

#[async_trait]
impl SynthesisBackend for OfflineBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Offline
    }

    fn voice_info(&self) -> BackendVoiceInfo {
        BackendVoiceInfo {
            default_voice: None,
            requires_voice: false,
        }
    }

    async fn synthesize(
        &self,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<AudioClip, SynthesisError> {
        if text.trim().is_empty() {
            return Err(SynthesisError::permanent(
                BackendKind::Offline,
                "refusing to synthesize empty text",
            ));
        }

        let lang = espeak_language(profile.language.as_deref().unwrap_or(&self.config.language))
            .to_string();
        let wpm = self.words_per_minute(profile.speed_factor);
        let bin = self.config.bin_path.clone();
        let text = text.to_string();

        log::debug!(
            "espeak-ng: {} chars, voice {lang}, {wpm} wpm",
            text.chars().count()
        );

        let bytes = tokio::task::spawn_blocking(move || run_espeak(&bin, &text, &lang, wpm))
            .await
            .map_err(|e| SynthesisError::permanent(BackendKind::Offline, e.to_string()))??;

        AudioClip::from_bytes(bytes).map_err(|e| {
            SynthesisError::permanent(BackendKind::Offline, format!("unreadable espeak-ng output: {e}"))
        })
    }

    async fn list_voices(&self) -> Result<Vec<VoiceEntry>, SynthesisError> {
        Ok(vec![VoiceEntry {
            display_name: format!("espeak-ng ({})", self.config.language),
            filename: self.config.language.clone(),
        }])
    }
}

/// Map a language hint to an espeak-ng voice name.
pub fn espeak_language(lang: &str) -> &str {
    match lang.to_ascii_lowercase().as_str() {
        "en" | "en-us" | "en_us" => "en-us",
        "en-gb" | "en_gb" => "en-gb",
        "pt" | "pt-br" | "pt_br" => "pt-br",
        "zh" | "zh-cn" | "cmn" => "cmn",
        _ => lang,
    }
}

fn run_espeak(
    bin: &std::path::Path,
    input: &str,
    lang: &str,
    wpm: u32,
) -> Result<Vec<u8>, SynthesisError> {
    let failed = |msg: String| SynthesisError::permanent(BackendKind::Offline, msg);

    let mut child = Command::new(bin)
        .args(["--stdout", "--stdin", "-q", "-v", lang, "-s"])
        .arg(wpm.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                failed(format!(
                    "{} not found; install espeak-ng or set ESPEAK_BIN",
                    bin.display()
                ))
            } else {
                failed(format!("failed to start {}: {e}", bin.display()))
            }
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // espeak-ng reads stdin line by line and can drop an unterminated last line
        let payload = canonicalize_stdin_payload(input);
        stdin
            .write_all(payload.as_bytes())
            .map_err(|e| failed(format!("failed to write to espeak-ng: {e}")))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| failed(format!("espeak-ng did not finish: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(failed(format!(
            "espeak-ng exited with code {:?}: {}",
            output.status.code(),
            stderr.trim()
        )));
    }

    let mut bytes = output.stdout;
    wav::repair_header(&mut bytes);
    Ok(bytes)
}

fn canonicalize_stdin_payload(input: &str) -> Cow<'_, str> {
    if input.ends_with('\n') {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(format!("{input}\n"))
    }
}
