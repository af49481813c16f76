//! Session facade: resolve voices, render, assemble and record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::assembly::{AssemblyEngine, AssemblyMode, OutputNaming, Stingers, Track};
use crate::audio::AudioClip;
use crate::config::{EnvConfig, StingerDirs};
use crate::engines::{select_backends, BackendKind, Backends, VoiceEntry};
use crate::error::{ConfigurationError, Error, Result};
use crate::render::{DialogueLine, FailurePolicy, RenderOrchestrator, RenderResult, RetryPolicy};
use crate::voice::{VoiceProfile, VoiceResolver, VoiceSettings};

/// File name of the session record written next to the tracks.
pub const RECORD_FILE: &str = "session.json";

/// Persona used for the bridge line when the session names none.
const DEFAULT_BRIDGE_PERSONA: &str = "djcara";

#[derive(Debug, Clone, Builder)]
#[builder(default, setter(into, strip_option))]
pub struct SessionOptions {
    pub title: String,
    pub persona_mode: Option<String>,
    pub overrides: VoiceSettings,
    pub mode: AssemblyMode,
    pub output_dir: PathBuf,
    /// Wrap outputs with intro/outro stingers when any are found.
    pub bookend: bool,
    /// Overrides the configured stinger directories.
    pub stinger_dirs: Option<StingerDirs>,
    /// Directory the default stinger folders are looked up in.
    pub stinger_base: PathBuf,
    pub crossfade: Option<Duration>,
    /// Short line spoken between the intro and the dialogue.
    pub bridge_text: Option<String>,
    pub failure_policy: FailurePolicy,
    pub concurrency: Option<usize>,
    pub date_token: Option<String>,
    pub write_record: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            title: "dialogue".to_string(),
            persona_mode: None,
            overrides: VoiceSettings::default(),
            mode: AssemblyMode::default(),
            output_dir: PathBuf::from("audio"),
            bookend: false,
            stinger_dirs: None,
            stinger_base: PathBuf::from("."),
            crossfade: None,
            bridge_text: None,
            failure_policy: FailurePolicy::default(),
            concurrency: None,
            date_token: None,
            write_record: true,
        }
    }
}

impl SessionOptions {
    pub fn builder() -> SessionOptionsBuilder {
        SessionOptionsBuilder::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: usize,
    pub chars: usize,
    pub backend: Option<BackendKind>,
    pub remote_attempts: u32,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRecord {
    pub index: usize,
    pub speaker: String,
    pub text: String,
    pub voice: Option<String>,
    pub duration_secs: f64,
    pub chunks: Vec<ChunkRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub label: String,
    pub path: PathBuf,
    pub bookended_path: Option<PathBuf>,
    pub line_indices: Vec<usize>,
    pub duration_secs: f64,
}

/// Ordered dialogue text plus per-line metadata for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub title: String,
    pub created_at: String,
    pub persona_mode: Option<String>,
    pub lines: Vec<LineRecord>,
    pub tracks: Vec<TrackRecord>,
    pub total_duration_secs: f64,
}

impl SessionRecord {
    fn new(
        options: &SessionOptions,
        result: &RenderResult,
        profiles: &HashMap<String, VoiceProfile>,
        tracks: &[Track],
    ) -> Self {
        let lines = result
            .lines
            .iter()
            .map(|l| LineRecord {
                index: l.line.index,
                speaker: l.line.speaker.clone(),
                text: l.line.text.clone(),
                voice: profiles.get(&l.line.speaker).and_then(|p| p.voice_id.clone()),
                duration_secs: l.duration.as_secs_f64(),
                chunks: l
                    .chunks
                    .iter()
                    .map(|c| ChunkRecord {
                        index: c.index,
                        chars: c.chars,
                        backend: c.backend,
                        remote_attempts: c.remote_attempts,
                        duration_secs: c.duration.as_secs_f64(),
                        error: c.error.clone(),
                    })
                    .collect(),
            })
            .collect();
        let tracks = tracks
            .iter()
            .map(|t| TrackRecord {
                label: t.label.clone(),
                path: t.main.path.clone(),
                bookended_path: t.bookended.as_ref().map(|b| b.path.clone()),
                line_indices: t.line_indices.clone(),
                duration_secs: t.main.clip.duration_secs(),
            })
            .collect();
        Self {
            title: options.title.clone(),
            created_at: chrono::Local::now().to_rfc3339(),
            persona_mode: options.persona_mode.clone(),
            lines,
            tracks,
            total_duration_secs: result.total_duration().as_secs_f64(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionOutput {
    pub tracks: Vec<Track>,
    pub record: SessionRecord,
}

/// Entry point for rendering dialogue to finished audio files.
pub struct Session {
    config: EnvConfig,
    backends: Backends,
}

impl Session {
    pub fn new(config: EnvConfig) -> Result<Self> {
        let backends = select_backends(&config)?;
        Ok(Self { config, backends })
    }

    /// Load configuration from the process environment (and `.env`).
    pub fn from_env() -> Result<Self> {
        Self::new(EnvConfig::from_env()?)
    }

    pub fn with_backends(config: EnvConfig, backends: Backends) -> Self {
        Self { config, backends }
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Voices offered by the primary backend.
    pub async fn list_voices(&self) -> Result<Vec<VoiceEntry>> {
        Ok(self.backends.primary().list_voices().await?)
    }

    /// Resolve one profile per distinct speaker.
    pub fn resolve_profiles(
        &self,
        lines: &[DialogueLine],
        options: &SessionOptions,
    ) -> std::result::Result<HashMap<String, VoiceProfile>, ConfigurationError> {
        let resolver = VoiceResolver::new(&self.config, self.backends.primary().voice_info());
        let mut profiles = HashMap::new();
        for line in lines {
            if profiles.contains_key(&line.speaker) {
                continue;
            }
            let profile = resolver.resolve(
                &line.speaker,
                options.persona_mode.as_deref(),
                &options.overrides,
            )?;
            log::debug!("Resolved {}: {:?}", line.speaker, profile);
            profiles.insert(line.speaker.clone(), profile);
        }
        Ok(profiles)
    }

    pub async fn render_session(
        &self,
        lines: &[DialogueLine],
        options: &SessionOptions,
    ) -> Result<SessionOutput> {
        self.render_session_with_cancel(lines, options, &CancellationToken::new())
            .await
    }

    pub async fn render_session_with_cancel(
        &self,
        lines: &[DialogueLine],
        options: &SessionOptions,
        cancel: &CancellationToken,
    ) -> Result<SessionOutput> {
        let profiles = self.resolve_profiles(lines, options)?;
        let orchestrator = self.orchestrator(options);

        log::info!(
            "Rendering '{}': {} line(s), {} speaker(s)",
            options.title,
            lines.len(),
            profiles.len()
        );
        let result = orchestrator.render(lines, &profiles, cancel).await?;
        result.ensure_complete(lines.len())?;

        let stingers = self.stingers(options);
        let bridge = match (&options.bridge_text, stingers.is_empty()) {
            (Some(text), false) if !text.trim().is_empty() => {
                self.render_bridge(&orchestrator, text, options, cancel).await
            }
            _ => None,
        };

        let mut naming = OutputNaming::new(options.title.clone());
        if let Some(token) = &options.date_token {
            naming = naming.with_date_token(token.clone());
        }
        let engine = AssemblyEngine::new(options.output_dir.clone())
            .with_crossfade(options.crossfade.unwrap_or(self.config.crossfade));
        let tracks = engine.assemble(&result, &options.mode, &naming, &stingers, bridge.as_ref())?;

        let record = SessionRecord::new(options, &result, &profiles, &tracks);
        if options.write_record {
            let path = options.output_dir.join(RECORD_FILE);
            record.write(&path)?;
            log::info!("Wrote session record {}", path.display());
        }
        Ok(SessionOutput { tracks, record })
    }

    fn orchestrator(&self, options: &SessionOptions) -> RenderOrchestrator {
        RenderOrchestrator::new(self.backends.clone())
            .with_retry(RetryPolicy::from(&self.config.render))
            .with_failure_policy(options.failure_policy)
            .with_concurrency(options.concurrency.unwrap_or(self.config.render.concurrency))
            .with_offline_fallback(!self.config.require_remote)
    }

    fn stingers(&self, options: &SessionOptions) -> Stingers {
        if !options.bookend {
            return Stingers::default();
        }
        let dirs = options
            .stinger_dirs
            .as_ref()
            .unwrap_or(&self.config.stingers);
        let stingers = dirs.pick(&options.stinger_base);
        if stingers.is_empty() {
            log::warn!("No intro/outro audio found; skipping bookended output");
        }
        stingers
    }

    /// Synthesize the bridge line; failures only drop the bridge.
    async fn render_bridge(
        &self,
        orchestrator: &RenderOrchestrator,
        text: &str,
        options: &SessionOptions,
        cancel: &CancellationToken,
    ) -> Option<AudioClip> {
        let persona = options
            .persona_mode
            .clone()
            .unwrap_or_else(|| DEFAULT_BRIDGE_PERSONA.to_string());
        let line = DialogueLine::new(0, persona.clone(), text.trim());
        let rendered = match self.resolve_profiles(std::slice::from_ref(&line), options) {
            Ok(profiles) => orchestrator
                .render(std::slice::from_ref(&line), &profiles, cancel)
                .await
                .map_err(Error::from),
            Err(e) => Err(Error::from(e)),
        };
        match rendered {
            Ok(mut result) => result.lines.pop().map(|l| l.clip),
            Err(e) => {
                log::warn!("Bridge synthesis for '{persona}' failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::tests::{samples, tone};
    use crate::engines::SynthesisBackend;
    use crate::error::{RenderError, SynthesisErrorKind};
    use crate::render::tests::ScriptedBackend;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn offline_session(config: EnvConfig) -> Session {
        let offline: Arc<dyn SynthesisBackend> = Arc::new(ScriptedBackend::ok(BackendKind::Offline));
        Session::with_backends(
            config,
            Backends {
                remote: None,
                offline,
            },
        )
    }

    fn empty_config() -> EnvConfig {
        EnvConfig::from_vars(Vec::<(String, String)>::new()).unwrap()
    }

    fn lines() -> Vec<DialogueLine> {
        vec![
            DialogueLine::new(0, "Rick", "Morty, get in."),
            DialogueLine::new(1, "Morty", "Aw geez."),
        ]
    }

    #[tokio::test]
    async fn renders_single_track_and_writes_record() {
        let dir = tempdir().unwrap();
        let session = offline_session(empty_config());
        let options = SessionOptions::builder()
            .title("Garage")
            .mode(AssemblyMode::SingleTrack { label: None })
            .output_dir(dir.path())
            .date_token("16 oct_")
            .build()
            .unwrap();

        let output = session.render_session(&lines(), &options).await.unwrap();
        assert_eq!(output.tracks.len(), 1);
        assert_eq!(output.tracks[0].label, "rick-morty");
        assert_eq!(output.record.lines.len(), 2);
        assert_eq!(output.record.lines[1].chunks[0].backend, Some(BackendKind::Offline));

        let written = std::fs::read_to_string(dir.path().join(RECORD_FILE)).unwrap();
        let parsed: SessionRecord = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.lines[0].text, "Morty, get in.");
        assert_eq!(parsed.tracks[0].line_indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn bookend_without_stingers_is_skipped() {
        let dir = tempdir().unwrap();
        let session = offline_session(empty_config());
        let options = SessionOptions::builder()
            .output_dir(dir.path().join("out"))
            .bookend(true)
            .stinger_base(dir.path())
            .write_record(false)
            .build()
            .unwrap();

        let output = session.render_session(&lines(), &options).await.unwrap();
        assert_eq!(output.tracks.len(), 2);
        assert!(output.tracks.iter().all(|t| t.bookended.is_none()));
        assert!(!dir.path().join("out").join(RECORD_FILE).exists());
    }

    #[tokio::test]
    async fn bookends_with_intro_and_bridge() {
        let dir = tempdir().unwrap();
        let intro_dir = dir.path().join("intro");
        std::fs::create_dir(&intro_dir).unwrap();
        tone(9, 100, 8000).write(&intro_dir.join("jingle.wav")).unwrap();

        let session = offline_session(empty_config());
        let options = SessionOptions::builder()
            .output_dir(dir.path().join("out"))
            .mode(AssemblyMode::SingleTrack {
                label: Some("show".to_string()),
            })
            .bookend(true)
            .stinger_base(dir.path())
            .crossfade(Duration::ZERO)
            .bridge_text("Back to the garage.")
            .build()
            .unwrap();

        let output = session.render_session(&lines(), &options).await.unwrap();
        let track = &output.tracks[0];
        let bookended = track.bookended.as_ref().expect("bookended output");
        let main = samples(&track.main.clip);
        let wrapped = samples(&bookended.clip);
        // intro, then the 19-char bridge, then the dialogue
        assert_eq!(wrapped.len(), 100 + 50 + main.len());
        assert!(wrapped[..100].iter().all(|&s| s == 9));
        assert!(wrapped[100..150].iter().all(|&s| s == 19));
        assert_eq!(&wrapped[150..], &main[..]);
        assert_eq!(
            output.record.tracks[0].bookended_path.as_deref(),
            Some(bookended.path.as_path())
        );
    }

    #[tokio::test]
    async fn required_server_failure_is_not_masked_by_offline() {
        let config = EnvConfig::from_vars([
            ("TTS_REQUIRE_SERVER", "1"),
            ("TTS_MAX_ATTEMPTS", "1"),
        ])
        .unwrap();
        let remote: Arc<dyn SynthesisBackend> = Arc::new(ScriptedBackend::always(
            BackendKind::Remote,
            SynthesisErrorKind::Transient,
        ));
        let offline = Arc::new(ScriptedBackend::ok(BackendKind::Offline));
        let session = Session::with_backends(
            config,
            Backends {
                remote: Some(remote),
                offline: offline.clone(),
            },
        );
        let dir = tempdir().unwrap();
        let options = SessionOptions::builder()
            .output_dir(dir.path())
            .build()
            .unwrap();

        let err = session.render_session(&lines(), &options).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Render(RenderError::ChunkFailed { remote: Some(_), .. })
        ));
        assert_eq!(offline.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unresolved_voice_fails_before_rendering() {
        let config = EnvConfig::from_vars([("CHATTERBOX_BASE_URL", "http://127.0.0.1:9")]).unwrap();
        let session = Session::new(config).unwrap();
        let dir = tempdir().unwrap();
        let options = SessionOptions::builder()
            .output_dir(dir.path())
            .build()
            .unwrap();

        let err = session.render_session(&lines(), &options).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigurationError::UnresolvedVoice { .. })
        ));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn lists_offline_voice_without_remote() {
        let session = Session::new(empty_config()).unwrap();
        let voices = session.list_voices().await.unwrap();
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].filename, "en");
    }

    #[test]
    fn resolves_one_profile_per_speaker() {
        let config = EnvConfig::from_vars([("TTS_PERSONA_RICK_SPEED_FACTOR", "1.2")]).unwrap();
        let session = offline_session(config);
        let mut dialogue = lines();
        dialogue.push(DialogueLine::new(2, "Rick", "Wubba lubba dub dub."));

        let profiles = session
            .resolve_profiles(&dialogue, &SessionOptions::default())
            .unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles["Rick"].speed_factor, 1.2);
        assert_eq!(profiles["Morty"].speed_factor, 1.0);
    }
}
