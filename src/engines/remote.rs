//! HTTP client for a Chatterbox-compatible TTS server.
//!
//! Endpoints used:
//! - `GET  get_predefined_voices`
//! - `POST tts`
//! - `GET  api/outputs?limit=10[&prefix=<voice stem>]`
//! - `GET  outputs/<filename>` (or the `url` field of an output item)
//!
//! Servers either answer `POST tts` with the audio itself or write it to
//! their output directory. In the second case the listing is snapshotted
//! before the request and polled afterwards; the newest filename missing from
//! the snapshot is the request's output. Matching is by voice-stem prefix, so
//! the snapshot, submit and poll steps run under a per-backend lock.
//!
//! A queued submission that is never claimed (poll timeout, dropped call)
//! still produces a file eventually. Such submissions are remembered as
//! orphans together with their snapshot, and each later listing attributes
//! the oldest unclaimed new file to the oldest orphan before a live request
//! may claim anything.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{call_timed_out, BackendKind, SynthesisBackend, VoiceEntry};
use crate::audio::{AudioClip, AudioFormat};
use crate::config::RemoteConfig;
use crate::error::{ConfigurationError, SynthesisError};
use crate::voice::{BackendVoiceInfo, VoiceProfile};

const DOWNLOAD_RETRY_DELAY: Duration = Duration::from_millis(1500);

/// Number of newest outputs fetched per listing.
pub const OUTPUT_WINDOW: usize = 10;

/// Orphans older than this many poll timeouts are forgotten.
const ORPHAN_HORIZON_FACTOR: u32 = 4;

/// An entry of `GET api/outputs`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputItem {
    pub filename: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    voice_mode: &'static str,
    predefined_voice_id: &'a str,
    output_format: &'a str,
    split_text: bool,
    chunk_size: usize,
    temperature: f32,
    exaggeration: f32,
    cfg_weight: f32,
    speed_factor: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_rate: Option<u32>,
}

/// Server-side chunk size: the profile's limit, else scaled with text length.
pub fn server_chunk_size(text: &str, profile_limit: Option<usize>) -> usize {
    if let Some(limit) = profile_limit {
        return limit;
    }
    match text.chars().count() {
        n if n > 2400 => 360,
        n if n > 1200 => 240,
        _ => 120,
    }
}

#[derive(Debug)]
struct Orphan {
    seen: HashSet<String>,
    abandoned_at: Instant,
}

/// Queued submissions whose output was never claimed, per voice prefix.
#[derive(Debug, Default)]
struct OutputClaims {
    orphans: HashMap<String, VecDeque<Orphan>>,
}

impl OutputClaims {
    pub fn pending(&self, prefix: &str) -> usize {
        self.orphans.get(prefix).map_or(0, VecDeque::len)
    }

    fn abandon(&mut self, prefix: &str, seen: HashSet<String>) {
        self.orphans
            .entry(prefix.to_string())
            .or_default()
            .push_back(Orphan {
                seen,
                abandoned_at: Instant::now(),
            });
    }

    /// Attribute files in `listing` (newest first) to waiting orphans, oldest
    /// orphan and oldest file first. Returns the attributed filenames.
    fn settle(&mut self, prefix: &str, listing: &[OutputItem], horizon: Duration) -> Vec<String> {
        let Some(queue) = self.orphans.get_mut(prefix) else {
            return Vec::new();
        };
        queue.retain(|orphan| orphan.abandoned_at.elapsed() < horizon);

        let mut taken: Vec<String> = Vec::new();
        while let Some(orphan) = queue.front() {
            let output = listing
                .iter()
                .rev()
                .map(|item| &item.filename)
                .find(|name| !orphan.seen.contains(*name) && !taken.contains(*name));
            match output {
                Some(name) => {
                    log::debug!("Skipping {name}: output of an abandoned request");
                    taken.push(name.clone());
                    queue.pop_front();
                }
                None => break,
            }
        }
        if queue.is_empty() {
            self.orphans.remove(prefix);
        }
        taken
    }
}

/// A queued submission waiting for its output. Dropped unclaimed, it is
/// recorded as an orphan.
struct PendingOutput<'a> {
    claims: &'a mut OutputClaims,
    prefix: String,
    seen: HashSet<String>,
    claimed: bool,
}

impl PendingOutput<'_> {
    /// Settle orphans against `listing`, then take the newest unseen file.
    fn claim_from(&mut self, listing: Vec<OutputItem>, horizon: Duration) -> Option<OutputItem> {
        let settled = self.claims.settle(&self.prefix, &listing, horizon);
        self.seen.extend(settled);
        let item = listing
            .into_iter()
            .find(|item| !self.seen.contains(&item.filename))?;
        self.claimed = true;
        Some(item)
    }
}

impl Drop for PendingOutput<'_> {
    fn drop(&mut self) {
        if !self.claimed {
            log::warn!(
                "Abandoning queued request for prefix {:?}; its output will be skipped",
                self.prefix
            );
            let seen = std::mem::take(&mut self.seen);
            self.claims.abandon(&self.prefix, seen);
        }
    }
}

enum Submitted {
    Inline(AudioClip),
    Queued(OutputItem),
}

pub struct RemoteBackend {
    client: reqwest::Client,
    config: RemoteConfig,
    claims: Mutex<OutputClaims>,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig) -> Result<Self, ConfigurationError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigurationError::InvalidUrl {
                url: config.base_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            config,
            claims: Mutex::new(OutputClaims::default()),
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Abandoned requests for `prefix` whose output has not appeared yet.
    pub async fn pending_orphans(&self, prefix: &str) -> usize {
        self.claims.lock().await.pending(prefix)
    }

    fn endpoint(&self, path: &str) -> Result<Url, SynthesisError> {
        self.config
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| SynthesisError::permanent(BackendKind::Remote, format!("bad URL {path}: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn orphan_horizon(&self) -> Duration {
        self.config.poll_timeout * ORPHAN_HORIZON_FACTOR
    }

    /// Newest outputs first, optionally restricted to filenames starting with `prefix`.
    pub async fn recent_outputs(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<OutputItem>, SynthesisError> {
        let limit = OUTPUT_WINDOW.to_string();
        let mut query = vec![("limit", limit.as_str())];
        if let Some(prefix) = prefix {
            query.push(("prefix", prefix));
        }
        let resp = self
            .request(Method::GET, self.endpoint("api/outputs")?)
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;
        resp.json().await.map_err(|e| {
            SynthesisError::transient(BackendKind::Remote, format!("malformed outputs listing: {e}"))
        })
    }

    /// Poll until a file outside the snapshot appears and claim it.
    ///
    /// Listing failures while polling are logged and retried until the poll
    /// timeout; the timeout itself is transient.
    async fn await_new_output(
        &self,
        pending: &mut PendingOutput<'_>,
        prefix: Option<&str>,
    ) -> Result<OutputItem, SynthesisError> {
        let started = Instant::now();
        let mut next_log = Duration::ZERO;
        loop {
            match self.recent_outputs(prefix).await {
                Ok(listing) => {
                    if let Some(item) = pending.claim_from(listing, self.orphan_horizon()) {
                        return Ok(item);
                    }
                }
                Err(e) => log::debug!("Output listing failed: {e}; still waiting"),
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.poll_timeout {
                return Err(SynthesisError::transient(
                    BackendKind::Remote,
                    format!(
                        "no new output with prefix {:?} after {:.1}s",
                        prefix.unwrap_or(""),
                        elapsed.as_secs_f64()
                    ),
                ));
            }
            if elapsed >= next_log {
                log::info!(
                    "Polling outputs ({}s/{}s), {} files known",
                    elapsed.as_secs(),
                    self.config.poll_timeout.as_secs(),
                    pending.seen.len()
                );
                next_log = elapsed + Duration::from_secs(5);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    pub async fn download(&self, item: &OutputItem) -> Result<Vec<u8>, SynthesisError> {
        let rel = item
            .url
            .clone()
            .unwrap_or_else(|| format!("outputs/{}", item.filename));
        let url = self.endpoint(&rel)?;
        let attempts = self.config.download_retries.max(1);

        let mut last_err = None;
        for attempt in 1..=attempts {
            let result = match self.request(Method::GET, url.clone()).send().await {
                Ok(resp) => match check_status(resp).await {
                    Ok(resp) => resp.bytes().await.map_err(transport_error),
                    Err(e) => Err(e),
                },
                Err(e) => Err(transport_error(e)),
            };
            match result {
                Ok(bytes) => {
                    log::debug!("Downloaded {} ({} bytes)", item.filename, bytes.len());
                    return Ok(bytes.to_vec());
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    log::warn!("Download attempt {attempt}/{attempts} of {url} failed: {e}");
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(DOWNLOAD_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            SynthesisError::transient(BackendKind::Remote, format!("download of {url} failed"))
        }))
    }

    fn voice_for<'p>(&'p self, profile: &'p VoiceProfile) -> Result<&'p str, SynthesisError> {
        profile
            .voice_id
            .as_deref()
            .or(self.config.default_voice.as_deref())
            .ok_or_else(|| {
                SynthesisError::permanent(
                    BackendKind::Remote,
                    format!("no voice for '{}'", profile.speaker_or_mode),
                )
            })
    }

    /// Snapshot, submit and, for queued requests, claim the output.
    /// Runs with the claims lock held.
    async fn submit(
        &self,
        claims: &mut OutputClaims,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<Submitted, SynthesisError> {
        let voice = self.voice_for(profile)?;
        let prefix = Path::new(voice)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty());
        let key = prefix.unwrap_or_default();

        let body = TtsRequest {
            text,
            voice_mode: "predefined",
            predefined_voice_id: voice,
            output_format: &self.config.response_format,
            split_text: self.config.split_text,
            chunk_size: server_chunk_size(text, profile.max_chunk_chars),
            temperature: profile.temperature,
            exaggeration: profile.exaggeration,
            cfg_weight: profile.guidance_weight,
            speed_factor: profile.speed_factor,
            seed: profile.seed,
            language: profile.language.as_deref(),
            sample_rate: self.config.sample_rate,
        };

        // only needed when the server queues; servers without a listing still
        // answer inline
        let snapshot = match self.recent_outputs(prefix).await {
            Ok(listing) => {
                let mut seen: HashSet<String> =
                    listing.iter().map(|item| item.filename.clone()).collect();
                seen.extend(claims.settle(key, &listing, self.orphan_horizon()));
                Some(seen)
            }
            Err(e) => {
                log::debug!("Output listing unavailable before submit: {e}");
                None
            }
        };

        log::info!(
            "POST tts voice={voice} text_len={} chunk_size={}",
            text.chars().count(),
            body.chunk_size
        );
        let sent = self
            .request(Method::POST, self.endpoint("tts")?)
            .json(&body)
            .send()
            .await;

        match sent {
            Ok(resp) => {
                let resp = check_status(resp).await?;
                let bytes = resp.bytes().await.map_err(transport_error)?;
                if AudioFormat::detect(&bytes).is_some() {
                    return decode_clip(bytes.to_vec()).map(Submitted::Inline);
                }
                log::debug!("Server queued the request; polling for output");
            }
            // the server may still finish a request whose response timed out
            Err(e) if e.is_timeout() => {
                log::warn!("POST tts timed out ({e}); polling for output");
            }
            Err(e) => return Err(transport_error(e)),
        }

        let Some(seen) = snapshot else {
            return Err(SynthesisError::transient(
                BackendKind::Remote,
                "server queued the request but its outputs could not be listed beforehand",
            ));
        };
        let mut pending = PendingOutput {
            claims,
            prefix: key.to_string(),
            seen,
            claimed: false,
        };
        self.await_new_output(&mut pending, prefix)
            .await
            .map(Submitted::Queued)
    }

    async fn fetch(&self, submitted: Submitted) -> Result<AudioClip, SynthesisError> {
        match submitted {
            Submitted::Inline(clip) => Ok(clip),
            Submitted::Queued(item) => decode_clip(self.download(&item).await?),
        }
    }
}

#[async_trait]
impl SynthesisBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn voice_info(&self) -> BackendVoiceInfo {
        BackendVoiceInfo {
            default_voice: self.config.default_voice.clone(),
            requires_voice: true,
        }
    }

    async fn synthesize(
        &self,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<AudioClip, SynthesisError> {
        let mut claims = self.claims.lock().await;
        let submitted = self.submit(&mut claims, text, profile).await?;
        drop(claims);
        self.fetch(submitted).await
    }

    /// The deadline starts once this call holds the submit lock.
    async fn synthesize_within(
        &self,
        text: &str,
        profile: &VoiceProfile,
        limit: Duration,
    ) -> Result<AudioClip, SynthesisError> {
        let mut claims = self.claims.lock().await;
        let started = Instant::now();
        let submitted = tokio::time::timeout(limit, self.submit(&mut claims, text, profile))
            .await
            .map_err(|_| call_timed_out(BackendKind::Remote, limit))??;
        drop(claims);

        let remaining = limit.saturating_sub(started.elapsed());
        tokio::time::timeout(remaining, self.fetch(submitted))
            .await
            .unwrap_or_else(|_| Err(call_timed_out(BackendKind::Remote, limit)))
    }

    async fn list_voices(&self) -> Result<Vec<VoiceEntry>, SynthesisError> {
        let resp = self
            .request(Method::GET, self.endpoint("get_predefined_voices")?)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;
        let data: serde_json::Value = resp.json().await.map_err(|e| {
            SynthesisError::transient(BackendKind::Remote, format!("malformed voice list: {e}"))
        })?;
        let voices = match data {
            serde_json::Value::Array(items) => items
                .into_iter()
                .filter(|v| v.is_object())
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect(),
            _ => Vec::new(),
        };
        Ok(voices)
    }
}

fn decode_clip(bytes: Vec<u8>) -> Result<AudioClip, SynthesisError> {
    AudioClip::from_bytes(bytes).map_err(|e| {
        SynthesisError::transient(BackendKind::Remote, format!("unusable audio payload: {e}"))
    })
}

fn transport_error(e: reqwest::Error) -> SynthesisError {
    SynthesisError::transient(BackendKind::Remote, e.to_string())
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SynthesisError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

/// Authentication failures and rejected voices are permanent; everything else
/// (rate limits, 5xx, gateway errors) may succeed on retry.
fn classify_status(status: StatusCode, body: &str) -> SynthesisError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("HTTP {status}: {snippet}");
    let rejects_voice = matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY
    ) && body.to_lowercase().contains("voice");

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN || rejects_voice {
        SynthesisError::permanent(BackendKind::Remote, message)
    } else {
        SynthesisError::transient(BackendKind::Remote, message)
    }
}
