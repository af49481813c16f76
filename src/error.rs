//! Error taxonomy for rendering and assembly.

use std::fmt;
use std::path::PathBuf;

use crate::engines::BackendKind;

/// Whether a synthesis failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisErrorKind {
    /// Timeouts, connection drops, 5xx responses, malformed payloads.
    Transient,
    /// Authentication failures, unknown voices, local engine failures.
    Permanent,
}

impl fmt::Display for SynthesisErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthesisErrorKind::Transient => f.write_str("transient"),
            SynthesisErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// A single failed synthesis call.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{backend} synthesis failed ({kind}): {message}")]
pub struct SynthesisError {
    pub kind: SynthesisErrorKind,
    pub backend: BackendKind,
    pub message: String,
}

impl SynthesisError {
    pub fn transient(backend: BackendKind, message: impl Into<String>) -> Self {
        Self {
            kind: SynthesisErrorKind::Transient,
            backend,
            message: message.into(),
        }
    }

    pub fn permanent(backend: BackendKind, message: impl Into<String>) -> Self {
        Self {
            kind: SynthesisErrorKind::Permanent,
            backend,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == SynthesisErrorKind::Transient
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
    #[error(
        "No voice resolved for '{speaker}'. Pass a voice override, set TTS_DEFAULT_VOICE \
         or TTS_PERSONA_<NAME>_VOICE, or configure CHATTERBOX_DEFAULT_VOICE."
    )]
    UnresolvedVoice { speaker: String },
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("Invalid remote endpoint {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Remote synthesis required but unavailable: {0}")]
    MissingRemote(String),
}

#[derive(thiserror::Error, Debug)]
pub enum AudioError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unrecognized audio payload ({0} bytes)")]
    UnknownFormat(usize),
    #[error("Cannot join {found} with {expected} without transcoding (enable the `transcode` feature)")]
    FormatMismatch { expected: String, found: String },
    #[error("Nothing to join")]
    Empty,
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Resample failed: {0}")]
    Resample(String),
}

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("Invalid dialogue: {0}")]
    InvalidInput(String),
    #[error("No voice profile for speaker '{speaker}' (line {line})")]
    MissingProfile { line: usize, speaker: String },
    #[error(
        "Line {line} chunk {chunk}: all backends failed after {attempts} remote attempt(s); \
         remote: {}, offline: {offline}",
        describe_remote(.remote)
    )]
    ChunkFailed {
        line: usize,
        chunk: usize,
        attempts: u32,
        remote: Option<SynthesisError>,
        offline: SynthesisError,
    },
    #[error("Line {line}: failed to join chunk audio: {source}")]
    Join {
        line: usize,
        #[source]
        source: AudioError,
    },
    #[error("Render cancelled after {completed_lines} completed line(s)")]
    Cancelled { completed_lines: usize },
    #[error("Render result is missing lines {missing:?}")]
    Incomplete { missing: Vec<usize> },
    #[error("Synthesis task failed: {0}")]
    Task(String),
}

fn describe_remote(remote: &Option<SynthesisError>) -> String {
    match remote {
        Some(err) => err.to_string(),
        None => "not configured".to_string(),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AssemblyError {
    #[error("Stinger {} could not be read: {source}", .path.display())]
    StingerUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Stinger {} is not a recognized audio file", .path.display())]
    UnsupportedStinger { path: PathBuf },
    #[error("Audio assembly failed: {0}")]
    Audio(#[from] AudioError),
    #[error("Failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Render result has no lines to assemble")]
    EmptyResult,
}

/// Top-level error returned by the session facade.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error("Invalid session options: {0}")]
    Options(#[from] crate::session::SessionOptionsBuilderError),
    #[error("Failed to write session record: {0}")]
    Record(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
