//! Speech synthesis backends.
//!
//! Two backends implement [`SynthesisBackend`]:
//! - [`remote::RemoteBackend`] - Chatterbox-compatible HTTP server (submit, then poll)
//! - [`offline::OfflineBackend`] - local espeak-ng, no credentials, always constructible
//!
//! [`select_backends`] picks them from configuration without touching the network.

pub mod offline;
pub mod remote;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::audio::AudioClip;
use crate::config::EnvConfig;
use crate::error::{ConfigurationError, SynthesisError};
use crate::voice::{BackendVoiceInfo, VoiceProfile};

pub use offline::OfflineBackend;
pub use remote::RemoteBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Remote,
    Offline,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Remote => f.write_str("remote"),
            BackendKind::Offline => f.write_str("offline"),
        }
    }
}

/// A voice advertised by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceEntry {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub filename: String,
}

/// Common interface for speech synthesis backends.
///
/// Implementations classify their failures as transient (worth retrying) or
/// permanent; the orchestrator owns retry and fallback.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Default voice and whether an explicit voice is mandatory.
    fn voice_info(&self) -> BackendVoiceInfo;

    /// Synthesize one chunk of text.
    async fn synthesize(
        &self,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<AudioClip, SynthesisError>;

    /// Synthesize with a deadline. A timeout is transient.
    ///
    /// Backends that serialize requests override this so time spent waiting
    /// for their turn does not count against `limit`.
    async fn synthesize_within(
        &self,
        text: &str,
        profile: &VoiceProfile,
        limit: Duration,
    ) -> Result<AudioClip, SynthesisError> {
        tokio::time::timeout(limit, self.synthesize(text, profile))
            .await
            .unwrap_or_else(|_| Err(call_timed_out(self.kind(), limit)))
    }

    /// Voices known to the backend.
    async fn list_voices(&self) -> Result<Vec<VoiceEntry>, SynthesisError> {
        Ok(Vec::new())
    }
}

/// The transient error reported when a call overruns its deadline.
pub fn call_timed_out(backend: BackendKind, limit: Duration) -> SynthesisError {
    SynthesisError::transient(
        backend,
        format!("call timed out after {:.1}s", limit.as_secs_f64()),
    )
}

/// The backends available to one session.
#[derive(Clone)]
pub struct Backends {
    pub remote: Option<Arc<dyn SynthesisBackend>>,
    pub offline: Arc<dyn SynthesisBackend>,
}

impl Backends {
    /// The backend whose voice requirements drive resolution.
    pub fn primary(&self) -> &Arc<dyn SynthesisBackend> {
        self.remote.as_ref().unwrap_or(&self.offline)
    }
}

/// Build the session backends from configuration.
///
/// The remote backend is only enabled when an endpoint is configured; the
/// offline backend is always present as the fallback tier.
pub fn select_backends(config: &EnvConfig) -> Result<Backends, ConfigurationError> {
    let remote: Option<Arc<dyn SynthesisBackend>> = match &config.remote {
        Some(remote_cfg) => Some(Arc::new(RemoteBackend::new(remote_cfg.clone())?)),
        None if config.require_remote => {
            return Err(ConfigurationError::MissingRemote(
                "set CHATTERBOX_BASE_URL (e.g. http://localhost:8014) or unset TTS_REQUIRE_SERVER"
                    .to_string(),
            ))
        }
        None => {
            log::info!("No remote endpoint configured; using offline synthesis only");
            None
        }
    };

    Ok(Backends {
        remote,
        offline: Arc::new(OfflineBackend::new(config.offline.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_offline_only_without_endpoint() {
        let cfg = EnvConfig::from_vars(Vec::<(String, String)>::new()).unwrap();
        let backends = select_backends(&cfg).unwrap();
        assert!(backends.remote.is_none());
        assert_eq!(backends.primary().kind(), BackendKind::Offline);
        assert!(!backends.primary().voice_info().requires_voice);
    }

    #[test]
    fn selects_remote_when_endpoint_configured() {
        let cfg = EnvConfig::from_vars([("CHATTERBOX_BASE_URL", "http://localhost:8014")]).unwrap();
        let backends = select_backends(&cfg).unwrap();
        assert_eq!(backends.primary().kind(), BackendKind::Remote);
        assert!(backends.primary().voice_info().requires_voice);
        assert_eq!(backends.offline.kind(), BackendKind::Offline);
    }

    #[test]
    fn strict_mode_requires_endpoint() {
        let cfg = EnvConfig::from_vars([("TTS_REQUIRE_SERVER", "1")]).unwrap();
        assert!(matches!(
            select_backends(&cfg),
            Err(ConfigurationError::MissingRemote(_))
        ));
    }
}
