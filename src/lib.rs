//! # dialogue-tts
//!
//! Renders generated dialogue into finished audio tracks.
//!
//! ## Features
//!
//! - **Remote synthesis**: Chatterbox-style HTTP server with predefined voices
//! - **Offline fallback**: `espeak-ng` picks up any chunk the server cannot render
//! - **Voice resolution**: per-persona and per-speaker defaults from the environment
//! - **Assembly**: per-speaker or single-track files, optionally wrapped in intro/outro stingers
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! dialogue-tts = { version = "2026.10", features = ["transcode"] }
//! ```
//!
//! ```ignore
//! use dialogue_tts::{DialogueLine, Session, SessionOptions};
//!
//! let session = Session::from_env()?;
//! let lines = DialogueLine::parse_script("Rick: Morty, get in.\nMorty: Aw geez.", "Narrator");
//! let options = SessionOptions::builder().title("Garage").build()?;
//!
//! let output = session.render_session(&lines, &options).await?;
//! for track in &output.tracks {
//!     println!("{}", track.main.path.display());
//! }
//! # Ok::<(), dialogue_tts::Error>(())
//! ```

pub mod assembly;
pub mod audio;
pub mod chunk;
pub mod config;
pub mod engines;
pub mod error;
pub mod render;
pub mod session;
pub mod voice;

pub use assembly::{AssemblyEngine, AssemblyMode, OutputNaming, Stingers, Track, TrackFile};
pub use audio::{AudioClip, AudioFormat};
pub use config::{EnvConfig, StingerDirs};
pub use engines::{BackendKind, Backends, SynthesisBackend, VoiceEntry};
pub use error::{Error, Result};
pub use render::{DialogueLine, FailurePolicy, RenderOrchestrator, RenderResult, RetryPolicy};
pub use session::{Session, SessionOptions, SessionOptionsBuilder, SessionOutput, SessionRecord};
pub use voice::{VoiceProfile, VoiceResolver, VoiceSettings};
