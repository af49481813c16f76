//! Environment-sourced configuration, loaded once and passed explicitly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;

use crate::error::ConfigurationError;
use crate::voice::{persona_key, VoiceSettings};

/// Settings for the Chatterbox-compatible HTTP backend.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
    /// Voice used when resolution produced none.
    pub default_voice: Option<String>,
    /// Requested output format (`wav`, `mp3`, `opus`).
    pub response_format: String,
    pub split_text: bool,
    pub sample_rate: Option<u32>,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub download_retries: u32,
}

impl RemoteConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            api_key: None,
            default_voice: None,
            response_format: "wav".to_string(),
            split_text: true,
            sample_rate: None,
            request_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(120),
            download_retries: 3,
        }
    }
}

/// Settings for the local espeak-ng backend.
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    pub bin_path: PathBuf,
    /// Language/accent hint used when the profile carries none.
    pub language: String,
    pub words_per_minute: u32,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            bin_path: PathBuf::from("espeak-ng"),
            language: "en".to_string(),
            words_per_minute: 175,
        }
    }
}

/// Retry, timeout and concurrency knobs for the render orchestrator.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(180),
        }
    }
}

/// Where intro/outro stingers are looked up.
#[derive(Debug, Clone, Default)]
pub struct StingerDirs {
    pub intro_dir: Option<PathBuf>,
    pub outro_dir: Option<PathBuf>,
    pub shared_dir: Option<PathBuf>,
}

/// Immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub remote: Option<RemoteConfig>,
    pub offline: OfflineConfig,
    pub global: VoiceSettings,
    /// Persona defaults keyed by normalized persona name.
    pub personas: HashMap<String, VoiceSettings>,
    /// Pacing profiles keyed by normalized persona name.
    pub pacing: HashMap<String, VoiceSettings>,
    pub render: RenderSettings,
    pub stingers: StingerDirs,
    pub crossfade: Duration,
    pub require_remote: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        let mut pacing = HashMap::new();
        pacing.insert("djcara".to_string(), VoiceSettings::conservative_pacing());
        Self {
            remote: None,
            offline: OfflineConfig::default(),
            global: VoiceSettings::default(),
            personas: HashMap::new(),
            pacing,
            render: RenderSettings::default(),
            stingers: StingerDirs::default(),
            crossfade: Duration::ZERO,
            require_remote: false,
        }
    }
}

const PERSONA_PREFIX: &str = "TTS_PERSONA_";

/// Persona field suffixes, longest first so `_CFG_WEIGHT` wins over shorter matches.
const PERSONA_FIELDS: &[&str] = &[
    "_SPEED_FACTOR",
    "_CHUNK_SIZE",
    "_CFG_WEIGHT",
    "_LANGUAGE",
    "_VOICE",
    "_TEMP",
    "_EXAG",
    "_SEED",
];

impl EnvConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        match dotenvy::dotenv() {
            Ok(path) => log::debug!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => log::warn!("Ignoring unreadable .env file: {e}"),
        }
        Self::from_vars(std::env::vars())
    }

    /// Build a configuration from explicit key/value pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let env = Vars(&vars);

        let mut config = EnvConfig::default();

        if let Some(raw) = env.get("CHATTERBOX_BASE_URL") {
            // keep a trailing slash so `Url::join` appends endpoint paths
            let normalized = format!("{}/", raw.trim_end_matches('/'));
            let base_url = Url::parse(&normalized).map_err(|e| {
                ConfigurationError::InvalidUrl {
                    url: raw.to_string(),
                    reason: e.to_string(),
                }
            })?;
            let mut remote = RemoteConfig::new(base_url);
            remote.api_key = env.get("CHATTERBOX_API_KEY").map(str::to_string);
            remote.default_voice = env.get("CHATTERBOX_DEFAULT_VOICE").map(str::to_string);
            if let Some(fmt) = env.get("TTS_RESPONSE_FORMAT") {
                remote.response_format = fmt.to_lowercase();
            }
            if let Some(split) = env.parse_bool("TTS_SPLIT_TEXT")? {
                remote.split_text = split;
            }
            remote.sample_rate = env.parse("TTS_SAMPLE_RATE")?;
            if let Some(secs) = env.parse::<u64>("CHATTERBOX_REQUEST_TIMEOUT_SECS")? {
                remote.request_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = env.parse::<f64>("CHATTERBOX_POLL_INTERVAL")? {
                remote.poll_interval = env.seconds("CHATTERBOX_POLL_INTERVAL", secs)?;
            }
            if let Some(secs) = env.parse::<u64>("CHATTERBOX_POLL_TIMEOUT")? {
                remote.poll_timeout = Duration::from_secs(secs);
            }
            if let Some(retries) = env.parse::<u32>("CHATTERBOX_DOWNLOAD_RETRIES")? {
                remote.download_retries = retries.max(1);
            }
            config.remote = Some(remote);
        }

        if let Some(bin) = env.get("ESPEAK_BIN") {
            config.offline.bin_path = PathBuf::from(bin);
        }
        if let Some(lang) = env.get("TTS_OFFLINE_LANGUAGE") {
            config.offline.language = lang.to_string();
        }

        config.global = VoiceSettings {
            voice: env.get("TTS_DEFAULT_VOICE").map(str::to_string),
            temperature: env.parse("TTS_TEMP")?,
            exaggeration: env.parse("TTS_EXAG")?,
            guidance_weight: env.parse_first(&["TTS_CFG_WEIGHT", "TTS_CFG"])?,
            speed_factor: env.parse_first(&["TTS_SPEED_FACTOR", "TTS_SPEED"])?,
            seed: env.parse("TTS_SEED")?,
            max_chunk_chars: env.parse("TTS_CHUNK_SIZE")?,
            language: env.get("TTS_LANGUAGE").map(str::to_string),
        };

        for (key, value) in &vars {
            let Some(rest) = key.strip_prefix(PERSONA_PREFIX) else {
                continue;
            };
            let Some(field) = PERSONA_FIELDS.iter().find(|f| rest.ends_with(*f)) else {
                log::warn!("Ignoring unknown persona setting {key}");
                continue;
            };
            let name = persona_key(&rest[..rest.len() - field.len()]);
            if name.is_empty() {
                continue;
            }
            let entry = config.personas.entry(name).or_default();
            apply_persona_field(entry, field, key, value)?;
        }

        if let Some(n) = env.parse::<usize>("TTS_CONCURRENCY")? {
            config.render.concurrency = n.max(1);
        }
        if let Some(n) = env.parse::<u32>("TTS_MAX_ATTEMPTS")? {
            config.render.max_attempts = n.max(1);
        }
        if let Some(ms) = env.parse::<u64>("TTS_RETRY_BACKOFF_MS")? {
            config.render.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parse::<u64>("TTS_CALL_TIMEOUT_SECS")? {
            config.render.call_timeout = Duration::from_secs(secs);
        }

        config.stingers = StingerDirs {
            intro_dir: env.get("INTRO_DIR").map(PathBuf::from),
            outro_dir: env.get("OUTRO_DIR").map(PathBuf::from),
            shared_dir: env.get("INTRO_OUTRO_DIR").map(PathBuf::from),
        };
        if let Some(ms) = env.parse::<u64>("INTRO_OUTRO_CROSSFADE_MS")? {
            config.crossfade = Duration::from_millis(ms);
        }
        config.require_remote = env.parse_bool("TTS_REQUIRE_SERVER")?.unwrap_or(false);

        Ok(config)
    }
}

fn apply_persona_field(
    entry: &mut VoiceSettings,
    field: &str,
    key: &str,
    value: &str,
) -> Result<(), ConfigurationError> {
    match field {
        "_VOICE" => entry.voice = Some(value.to_string()),
        "_LANGUAGE" => entry.language = Some(value.to_string()),
        "_TEMP" => entry.temperature = Some(parse_value(key, value)?),
        "_EXAG" => entry.exaggeration = Some(parse_value(key, value)?),
        "_CFG_WEIGHT" => entry.guidance_weight = Some(parse_value(key, value)?),
        "_SPEED_FACTOR" => entry.speed_factor = Some(parse_value(key, value)?),
        "_SEED" => entry.seed = Some(parse_value(key, value)?),
        "_CHUNK_SIZE" => entry.max_chunk_chars = Some(parse_value(key, value)?),
        _ => {}
    }
    Ok(())
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigurationError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigurationError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

struct Vars<'a>(&'a HashMap<String, String>);

impl Vars<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.trim())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigurationError> {
        self.get(key).map(|v| parse_value(key, v)).transpose()
    }

    fn parse_first<T: FromStr>(&self, keys: &[&str]) -> Result<Option<T>, ConfigurationError> {
        for key in keys {
            if let Some(v) = self.parse(key)? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    fn parse_bool(&self, key: &str) -> Result<Option<bool>, ConfigurationError> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigurationError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    fn seconds(&self, key: &str, secs: f64) -> Result<Duration, ConfigurationError> {
        Duration::try_from_secs_f64(secs).map_err(|_| ConfigurationError::InvalidValue {
            key: key.to_string(),
            value: secs.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_environment_is_offline_only() {
        let cfg = EnvConfig::from_vars(Vec::<(String, String)>::new()).unwrap();
        assert!(cfg.remote.is_none());
        assert!(cfg.global.is_empty());
        assert_eq!(cfg.offline.bin_path, PathBuf::from("espeak-ng"));
        assert_eq!(cfg.render.max_attempts, 3);
        assert!(cfg.pacing.contains_key("djcara"));
        assert!(!cfg.require_remote);
    }

    #[test]
    fn reads_remote_settings() {
        let cfg = EnvConfig::from_vars([
            ("CHATTERBOX_BASE_URL", "http://localhost:8014/"),
            ("CHATTERBOX_API_KEY", "secret"),
            ("TTS_RESPONSE_FORMAT", "MP3"),
            ("TTS_SPLIT_TEXT", "off"),
            ("CHATTERBOX_POLL_INTERVAL", "0.25"),
            ("CHATTERBOX_DOWNLOAD_RETRIES", "0"),
        ])
        .unwrap();
        let remote = cfg.remote.expect("remote configured");
        assert_eq!(remote.base_url.as_str(), "http://localhost:8014/");
        assert_eq!(remote.api_key.as_deref(), Some("secret"));
        assert_eq!(remote.response_format, "mp3");
        assert!(!remote.split_text);
        assert_eq!(remote.poll_interval, Duration::from_millis(250));
        assert_eq!(remote.download_retries, 1);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = EnvConfig::from_vars([("CHATTERBOX_BASE_URL", "  "), ("TTS_TEMP", "")]).unwrap();
        assert!(cfg.remote.is_none());
        assert_eq!(cfg.global.temperature, None);
    }

    #[test]
    fn aliases_prefer_the_long_name() {
        let cfg = EnvConfig::from_vars([
            ("TTS_CFG", "0.2"),
            ("TTS_CFG_WEIGHT", "0.4"),
            ("TTS_SPEED", "0.9"),
        ])
        .unwrap();
        assert_eq!(cfg.global.guidance_weight, Some(0.4));
        assert_eq!(cfg.global.speed_factor, Some(0.9));
    }

    #[test]
    fn parses_persona_settings() {
        let cfg = EnvConfig::from_vars([
            ("TTS_PERSONA_DJ_CARA_VOICE", "DJ_Caralong.mp3"),
            ("TTS_PERSONA_DJ_CARA_CFG_WEIGHT", "0.25"),
            ("TTS_PERSONA_RICK_SPEED_FACTOR", "1.2"),
            ("TTS_PERSONA_RICK_CHUNK_SIZE", "300"),
        ])
        .unwrap();
        let cara = &cfg.personas["djcara"];
        assert_eq!(cara.voice.as_deref(), Some("DJ_Caralong.mp3"));
        assert_eq!(cara.guidance_weight, Some(0.25));
        let rick = &cfg.personas["rick"];
        assert_eq!(rick.speed_factor, Some(1.2));
        assert_eq!(rick.max_chunk_chars, Some(300));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = EnvConfig::from_vars([("TTS_TEMP", "warm")]).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { key, .. } if key == "TTS_TEMP"));
    }

    #[test]
    fn invalid_url_is_rejected() {
        let err = EnvConfig::from_vars([("CHATTERBOX_BASE_URL", "not a url")]).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidUrl { .. }));
    }

    #[test]
    fn reads_stingers_and_strict_mode() {
        let cfg = EnvConfig::from_vars([
            ("INTRO_OUTRO_DIR", "stingers"),
            ("INTRO_OUTRO_CROSSFADE_MS", "750"),
            ("TTS_REQUIRE_SERVER", "yes"),
        ])
        .unwrap();
        assert_eq!(cfg.stingers.shared_dir, Some(PathBuf::from("stingers")));
        assert_eq!(cfg.crossfade, Duration::from_millis(750));
        assert!(cfg.require_remote);
    }
}
