//! Per-chunk synthesis with retry, fallback and ordered reassembly.
//!
//! Every line is planned into chunks up front. Chunks are submitted in
//! ascending (line, chunk) order, each holding one permit of a bounded
//! semaphore while it runs, and results are collected into an ordered map so
//! completion order never reaches the output.
//!
//! For each chunk the remote backend (when configured) is tried up to
//! `max_attempts` times; transient failures back off exponentially, permanent
//! ones stop retrying at once. The offline backend then synthesizes that chunk
//! alone. Fallback is per chunk, so a line can mix backends.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::audio::{self, AudioClip};
use crate::chunk;
use crate::config::RenderSettings;
use crate::engines::{BackendKind, Backends, SynthesisBackend};
use crate::error::{AudioError, RenderError, SynthesisError};
use crate::voice::VoiceProfile;

/// Chunk limit for profiles that carry none.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 500;

/// One line of generated dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueLine {
    pub index: usize,
    pub speaker: String,
    pub text: String,
}

impl DialogueLine {
    pub fn new(index: usize, speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            index,
            speaker: speaker.into(),
            text: text.into(),
        }
    }

    /// Parse a raw `"Speaker: text"` line; lines without a speaker prefix
    /// are attributed to `default_speaker`.
    pub fn from_prefixed(index: usize, raw: &str, default_speaker: &str) -> Self {
        let raw = raw.trim();
        if let Some((name, text)) = raw.split_once(':') {
            let name = name.trim();
            let looks_like_name = !name.is_empty()
                && name.chars().count() <= 32
                && name
                    .chars()
                    .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.'));
            if looks_like_name && !text.trim().is_empty() {
                return Self::new(index, name, text.trim());
            }
        }
        Self::new(index, default_speaker, raw)
    }

    /// Parse a script of prefixed lines, skipping blank ones.
    pub fn parse_script(script: &str, default_speaker: &str) -> Vec<Self> {
        script
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, l)| Self::from_prefixed(i, l, default_speaker))
            .collect()
    }
}

/// How one chunk was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkInfo {
    pub index: usize,
    pub chars: usize,
    /// `None` when silence was substituted.
    pub backend: Option<BackendKind>,
    /// Remote attempts made before the chunk settled.
    pub remote_attempts: u32,
    pub duration: Duration,
    /// Last error seen for this chunk, if any.
    pub error: Option<String>,
}

/// Joined audio for one dialogue line.
#[derive(Debug, Clone)]
pub struct LineAudio {
    pub line: DialogueLine,
    pub clip: AudioClip,
    /// Sum of chunk durations.
    pub duration: Duration,
    pub chunks: Vec<ChunkInfo>,
}

impl LineAudio {
    /// Backends that contributed audio, in first-use order.
    pub fn backends(&self) -> Vec<BackendKind> {
        let mut seen = Vec::new();
        for kind in self.chunks.iter().filter_map(|c| c.backend) {
            if !seen.contains(&kind) {
                seen.push(kind);
            }
        }
        seen
    }

    pub fn has_substitutions(&self) -> bool {
        self.chunks.iter().any(|c| c.backend.is_none())
    }
}

/// Rendered lines in ascending index order.
#[derive(Debug, Clone, Default)]
pub struct RenderResult {
    pub lines: Vec<LineAudio>,
}

impl RenderResult {
    pub fn total_duration(&self) -> Duration {
        self.lines.iter().map(|l| l.duration).sum()
    }

    /// Check that the result covers exactly `0..expected`, in order.
    pub fn ensure_complete(&self, expected: usize) -> Result<(), RenderError> {
        let present: BTreeSet<usize> = self.lines.iter().map(|l| l.line.index).collect();
        let ordered = self.lines.windows(2).all(|w| w[0].line.index < w[1].line.index);
        let missing: Vec<usize> = (0..expected).filter(|i| !present.contains(i)).collect();
        if missing.is_empty() && present.len() == expected && ordered {
            Ok(())
        } else {
            Err(RenderError::Incomplete { missing })
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound for a single synthesis call.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RenderSettings::default())
    }
}

impl From<&RenderSettings> for RetryPolicy {
    fn from(settings: &RenderSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: settings.initial_backoff,
            max_backoff: Duration::from_secs(10),
            call_timeout: settings.call_timeout,
        }
    }
}

/// What to do when every backend fails for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Fail the whole render with [`RenderError::ChunkFailed`].
    #[default]
    Abort,
    /// Put silence in place of the chunk and record the gap.
    SubstituteSilence { duration: Duration },
}

pub struct RenderOrchestrator {
    backends: Backends,
    retry: RetryPolicy,
    failure: FailurePolicy,
    concurrency: usize,
    offline_fallback: bool,
}

struct ChunkJob {
    line: usize,
    chunk: usize,
    text: String,
    profile: Arc<VoiceProfile>,
    backends: Backends,
    retry: RetryPolicy,
    failure: FailurePolicy,
    offline_fallback: bool,
}

struct ChunkAudio {
    clip: AudioClip,
    info: ChunkInfo,
}

impl RenderOrchestrator {
    pub fn new(backends: Backends) -> Self {
        Self {
            backends,
            retry: RetryPolicy::default(),
            failure: FailurePolicy::default(),
            concurrency: RenderSettings::default().concurrency,
            offline_fallback: true,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_failure_policy(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }

    /// Whether chunks the remote gives up on go to the offline backend.
    /// Ignored when no remote backend is configured.
    pub fn with_offline_fallback(mut self, enabled: bool) -> Self {
        self.offline_fallback = enabled;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Render every line, returning per-line audio in ascending index order.
    ///
    /// `profiles` is keyed by speaker name. Cancelling `cancel` aborts all
    /// in-flight calls and returns [`RenderError::Cancelled`]; no partial
    /// result is returned.
    pub async fn render(
        &self,
        lines: &[DialogueLine],
        profiles: &HashMap<String, VoiceProfile>,
        cancel: &CancellationToken,
    ) -> Result<RenderResult, RenderError> {
        validate(lines, profiles)?;

        let mut ordered: Vec<&DialogueLine> = lines.iter().collect();
        ordered.sort_by_key(|l| l.index);

        let mut chunk_counts = BTreeMap::new();
        let mut jobs = Vec::new();
        for line in &ordered {
            let profile = profiles
                .get(&line.speaker)
                .ok_or_else(|| RenderError::MissingProfile {
                    line: line.index,
                    speaker: line.speaker.clone(),
                })?;
            let profile = Arc::new(profile.clone());
            let limit = profile.max_chunk_chars.unwrap_or(DEFAULT_MAX_CHUNK_CHARS);
            let chunks = chunk::plan(&line.text, limit);
            log::debug!(
                "Line {} ({}): {} chars in {} chunk(s)",
                line.index,
                line.speaker,
                line.text.chars().count(),
                chunks.len()
            );
            chunk_counts.insert(line.index, chunks.len());
            for (idx, text) in chunks.into_iter().enumerate() {
                jobs.push(ChunkJob {
                    line: line.index,
                    chunk: idx,
                    text: text.trim().to_string(),
                    profile: Arc::clone(&profile),
                    backends: self.backends.clone(),
                    retry: self.retry.clone(),
                    failure: self.failure,
                    offline_fallback: self.offline_fallback,
                });
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<((usize, usize), Result<ChunkAudio, RenderError>)> = JoinSet::new();
        let mut pending = jobs.into_iter().peekable();
        let mut done: BTreeMap<(usize, usize), ChunkAudio> = BTreeMap::new();

        while pending.peek().is_some() || !tasks.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    let completed_lines = chunk_counts
                        .iter()
                        .filter(|(line, count)| {
                            (0..**count).all(|c| done.contains_key(&(**line, c)))
                        })
                        .count();
                    log::warn!("Render cancelled with {completed_lines} line(s) complete");
                    return Err(RenderError::Cancelled { completed_lines });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let (key, outcome) = joined.map_err(|e| RenderError::Task(e.to_string()))?;
                    match outcome {
                        Ok(audio) => {
                            done.insert(key, audio);
                        }
                        Err(e) => {
                            tasks.abort_all();
                            return Err(e);
                        }
                    }
                }
                permit = Arc::clone(&semaphore).acquire_owned(), if pending.peek().is_some() => {
                    let permit = permit.map_err(|e| RenderError::Task(e.to_string()))?;
                    if let Some(job) = pending.next() {
                        tasks.spawn(async move {
                            let _permit = permit;
                            let key = (job.line, job.chunk);
                            (key, job.run().await)
                        });
                    }
                }
            }
        }

        let mut result = RenderResult::default();
        for line in ordered {
            let count = chunk_counts.get(&line.index).copied().unwrap_or(0);
            let mut clips = Vec::with_capacity(count);
            let mut infos = Vec::with_capacity(count);
            for idx in 0..count {
                let audio = done
                    .remove(&(line.index, idx))
                    .ok_or_else(|| RenderError::Incomplete {
                        missing: vec![line.index],
                    })?;
                clips.push(audio.clip);
                infos.push(audio.info);
            }

            reshape_silence(&mut clips, &infos).map_err(|source| RenderError::Join {
                line: line.index,
                source,
            })?;
            let refs: Vec<&AudioClip> = clips.iter().collect();
            let clip = audio::concat(&refs, Duration::ZERO).map_err(|source| RenderError::Join {
                line: line.index,
                source,
            })?;
            let line_audio = LineAudio {
                line: line.clone(),
                clip,
                duration: infos.iter().map(|c| c.duration).sum(),
                chunks: infos,
            };
            if line_audio.backends().len() > 1 {
                log::warn!(
                    "Line {} mixes backends across chunks: {:?}",
                    line.index,
                    line_audio.backends()
                );
            }
            result.lines.push(line_audio);
        }

        result.ensure_complete(lines.len())?;
        Ok(result)
    }
}

/// Re-encode substituted silence like the line's first synthesized chunk.
fn reshape_silence(clips: &mut [AudioClip], infos: &[ChunkInfo]) -> Result<(), AudioError> {
    let Some(reference) = infos
        .iter()
        .position(|i| i.backend.is_some())
        .map(|idx| clips[idx].clone())
    else {
        return Ok(());
    };
    for (clip, info) in clips.iter_mut().zip(infos) {
        if info.backend.is_none() {
            *clip = AudioClip::silence_like(info.duration, &reference)?;
        }
    }
    Ok(())
}

fn validate(
    lines: &[DialogueLine],
    profiles: &HashMap<String, VoiceProfile>,
) -> Result<(), RenderError> {
    let indices: BTreeSet<usize> = lines.iter().map(|l| l.index).collect();
    if indices.len() != lines.len() {
        return Err(RenderError::InvalidInput(
            "line indices must be unique".to_string(),
        ));
    }
    if let Some(last) = indices.iter().next_back() {
        if *last + 1 != lines.len() {
            return Err(RenderError::InvalidInput(format!(
                "line indices must be contiguous from 0, got {} lines ending at {last}",
                lines.len()
            )));
        }
    }
    for line in lines {
        if line.text.trim().is_empty() {
            return Err(RenderError::InvalidInput(format!(
                "line {} ({}) is empty",
                line.index, line.speaker
            )));
        }
        if !profiles.contains_key(&line.speaker) {
            return Err(RenderError::MissingProfile {
                line: line.index,
                speaker: line.speaker.clone(),
            });
        }
    }
    Ok(())
}

impl ChunkJob {
    async fn run(self) -> Result<ChunkAudio, RenderError> {
        let mut attempts = 0;
        let mut remote_err: Option<SynthesisError> = None;

        if let Some(remote) = &self.backends.remote {
            loop {
                attempts += 1;
                match self.call(remote.as_ref(), attempts).await {
                    Ok(clip) => return Ok(self.finish(clip, Some(BackendKind::Remote), attempts, None)),
                    Err(e) => {
                        let retry = e.is_transient() && attempts < self.retry.max_attempts;
                        remote_err = Some(e);
                        if !retry {
                            break;
                        }
                        tokio::time::sleep(self.retry.backoff(attempts)).await;
                    }
                }
            }
        }

        let offline_err = if self.backends.remote.is_some() && !self.offline_fallback {
            log::error!(
                "Line {} chunk {}: remote gave up after {attempts} attempt(s); offline fallback is disabled",
                self.line,
                self.chunk
            );
            SynthesisError::permanent(
                BackendKind::Offline,
                "offline fallback disabled because the remote server is required",
            )
        } else {
            if self.backends.remote.is_some() {
                log::warn!(
                    "Line {} chunk {}: remote gave up after {attempts} attempt(s); falling back to offline",
                    self.line,
                    self.chunk
                );
            }
            match self.call(self.backends.offline.as_ref(), 1).await {
                Ok(clip) => {
                    let note = remote_err.map(|e| e.to_string());
                    return Ok(self.finish(clip, Some(BackendKind::Offline), attempts, note));
                }
                Err(e) => e,
            }
        };

        match self.failure {
            FailurePolicy::Abort => Err(RenderError::ChunkFailed {
                line: self.line,
                chunk: self.chunk,
                attempts,
                remote: remote_err,
                offline: offline_err,
            }),
            FailurePolicy::SubstituteSilence { duration } => {
                log::error!(
                    "Line {} chunk {}: all backends failed ({offline_err}); substituting {:.2}s of silence",
                    self.line,
                    self.chunk,
                    duration.as_secs_f64()
                );
                let clip = AudioClip::silence(duration).map_err(|source| RenderError::Join {
                    line: self.line,
                    source,
                })?;
                Ok(self.finish(clip, None, attempts, Some(offline_err.to_string())))
            }
        }
    }

    /// One timed synthesis call, logged as an attempt record.
    async fn call(
        &self,
        backend: &dyn SynthesisBackend,
        attempt: u32,
    ) -> Result<AudioClip, SynthesisError> {
        let started = Instant::now();
        let result = backend
            .synthesize_within(&self.text, &self.profile, self.retry.call_timeout)
            .await;

        let voice = self.profile.voice_id.as_deref().unwrap_or("-");
        let elapsed_ms = started.elapsed().as_millis();
        let chars = self.text.chars().count();
        match &result {
            Ok(clip) => log::info!(
                target: "dialogue_tts::attempt",
                "line={} chunk={} backend={} voice={voice} chars={chars} attempt={attempt} outcome=ok duration={:.2}s elapsed_ms={elapsed_ms}",
                self.line,
                self.chunk,
                backend.kind(),
                clip.duration_secs()
            ),
            Err(e) => log::warn!(
                target: "dialogue_tts::attempt",
                "line={} chunk={} backend={} voice={voice} chars={chars} attempt={attempt} outcome={} elapsed_ms={elapsed_ms} error={}",
                self.line,
                self.chunk,
                backend.kind(),
                e.kind,
                e.message
            ),
        }
        result
    }

    fn finish(
        &self,
        clip: AudioClip,
        backend: Option<BackendKind>,
        remote_attempts: u32,
        error: Option<String>,
    ) -> ChunkAudio {
        ChunkAudio {
            info: ChunkInfo {
                index: self.chunk,
                chars: self.text.chars().count(),
                backend,
                remote_attempts,
                duration: clip.duration,
                error,
            },
            clip,
        }
    }
}
