use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::ValueEnum;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

/// Platform family the client runs on; selects the candidate ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    /// Android devices and emulators.
    Android,
    /// iOS devices and simulators.
    Ios,
    /// Desktop and anything else.
    Other,
}

impl Platform {
    /// Platform of the running process.
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else {
            Platform::Other
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Android => write!(f, "android"),
            Platform::Ios => write!(f, "ios"),
            Platform::Other => write!(f, "other"),
        }
    }
}

/// User configuration for the assistant client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Forces a platform ordering instead of detecting it.
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub conversation: ConversationSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub journal: JournalSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            platform: None,
            discovery: DiscoverySettings::default(),
            transport: TransportSettings::default(),
            conversation: ConversationSettings::default(),
            capture: CaptureSettings::default(),
            journal: JournalSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl ClientSettings {
    /// Load settings from disk, writing defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            let parsed: Self = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?;
            Ok(parsed)
        } else {
            let settings = Self::default();
            settings
                .save(path)
                .with_context(|| format!("Failed to write default config to {}", path.display()))?;
            Ok(settings)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = serde_json::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    /// Platform used for candidate ordering.
    pub fn effective_platform(&self) -> Platform {
        self.platform.unwrap_or_else(Platform::current)
    }

    /// Resolve path to the JSON-L dispatch journal.
    pub fn resolve_journal_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.journal.path {
            return Ok(path.clone());
        }
        let dirs = project_dirs()?;
        Ok(dirs.data_dir().join("journal").join("dispatch.jsonl"))
    }

    /// Collect human-readable configuration problems.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for route in &self.discovery.routes {
            for address in &route.addresses {
                if let Err(err) = Url::parse(address) {
                    issues.push(format!(
                        "{} candidate '{address}' is not a valid URL: {err}",
                        route.platform
                    ));
                }
            }
        }
        if let Err(err) = Url::parse(&self.discovery.remote_fallback) {
            issues.push(format!(
                "remote fallback '{}' is not a valid URL: {err}",
                self.discovery.remote_fallback
            ));
        }
        if self.discovery.probe_timeout_ms == 0 {
            issues.push("probe timeout must be greater than zero".into());
        }
        if self.transport.request_timeout_ms == 0 {
            issues.push("request timeout must be greater than zero".into());
        }
        if self.transport.inline_max_chars == 0 {
            issues.push("inline encoding cap must be greater than zero".into());
        }
        if self.conversation.max_turns == 0 {
            issues.push("conversation history size must be greater than zero".into());
        }
        if self.conversation.context_turns > self.conversation.max_turns {
            issues.push(format!(
                "context window ({}) exceeds the retained history ({})",
                self.conversation.context_turns, self.conversation.max_turns
            ));
        }
        issues
    }
}

pub(crate) fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("app", "agrilink", "AgriLink")
        .context("Unable to resolve platform data directory")
}

/// One row of the platform lookup table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformRoute {
    pub platform: Platform,
    pub addresses: Vec<String>,
}

/// Where to look for the backend and how to check it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "DiscoverySettings::default_routes")]
    pub routes: Vec<PlatformRoute>,
    /// Appended to every platform ordering.
    #[serde(default = "DiscoverySettings::default_remote_fallback")]
    pub remote_fallback: String,
    #[serde(default = "DiscoverySettings::default_health_path")]
    pub health_path: String,
    #[serde(default = "DiscoverySettings::default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Probe non-sticky candidates before sending to them.
    #[serde(default = "bool_true")]
    pub probe_before_send: bool,
}

impl DiscoverySettings {
    fn default_routes() -> Vec<PlatformRoute> {
        vec![
            PlatformRoute {
                platform: Platform::Android,
                addresses: vec![
                    "http://10.0.2.2:8000".into(),
                    "http://127.0.0.1:8000".into(),
                    "http://localhost:8000".into(),
                ],
            },
            PlatformRoute {
                platform: Platform::Ios,
                addresses: vec![
                    "http://localhost:8000".into(),
                    "http://127.0.0.1:8000".into(),
                    "http://10.0.2.2:8000".into(),
                ],
            },
            PlatformRoute {
                platform: Platform::Other,
                addresses: vec![
                    "http://127.0.0.1:8000".into(),
                    "http://localhost:8000".into(),
                ],
            },
        ]
    }

    fn default_remote_fallback() -> String {
        "https://api.agrilink.app".into()
    }

    fn default_health_path() -> String {
        "/health".into()
    }

    const fn default_probe_timeout_ms() -> u64 {
        3_000
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Addresses configured for a platform, in priority order.
    pub fn addresses_for(&self, platform: Platform) -> &[String] {
        self.routes
            .iter()
            .find(|route| route.platform == platform)
            .map(|route| route.addresses.as_slice())
            .unwrap_or(&[])
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            routes: Self::default_routes(),
            remote_fallback: Self::default_remote_fallback(),
            health_path: Self::default_health_path(),
            probe_timeout_ms: Self::default_probe_timeout_ms(),
            probe_before_send: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "TransportSettings::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Maximum length of an inline-encoded media field, in characters.
    #[serde(default = "TransportSettings::default_inline_max_chars")]
    pub inline_max_chars: usize,
    #[serde(default = "TransportSettings::default_user_agent")]
    pub user_agent: String,
}

impl TransportSettings {
    const fn default_request_timeout_ms() -> u64 {
        30_000
    }

    const fn default_inline_max_chars() -> usize {
        1_000_000
    }

    fn default_user_agent() -> String {
        "AgriLink/0.1 (assistant-client)".into()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: Self::default_request_timeout_ms(),
            inline_max_chars: Self::default_inline_max_chars(),
            user_agent: Self::default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSettings {
    /// Maximum turns retained (H).
    #[serde(default = "ConversationSettings::default_max_turns")]
    pub max_turns: usize,
    /// Turns attached to each outbound chat request.
    #[serde(default = "ConversationSettings::default_context_turns")]
    pub context_turns: usize,
    #[serde(default = "ConversationSettings::default_advice_type")]
    pub default_advice_type: String,
}

impl ConversationSettings {
    const fn default_max_turns() -> usize {
        20
    }

    const fn default_context_turns() -> usize {
        10
    }

    fn default_advice_type() -> String {
        "general".into()
    }
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_turns: Self::default_max_turns(),
            context_turns: Self::default_context_turns(),
            default_advice_type: Self::default_advice_type(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Stand-in transcript used when transcription fails.
    #[serde(default = "CaptureSettings::default_fallback_transcript")]
    pub fallback_transcript: String,
    /// Reported as `metadata.source` on inline uploads.
    #[serde(default = "CaptureSettings::default_audio_source")]
    pub audio_source: String,
}

impl CaptureSettings {
    fn default_fallback_transcript() -> String {
        "I need advice about my crops.".into()
    }

    fn default_audio_source() -> String {
        "mobile_app".into()
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            fallback_transcript: Self::default_fallback_transcript(),
            audio_source: Self::default_audio_source(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub traces: TraceSettings,
}

/// Controls structured trace export to JSON files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "TraceSettings::default_max_files")]
    pub max_files: usize,
}

impl TraceSettings {
    const fn default_max_files() -> usize {
        10
    }
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

fn bool_true() -> bool {
    true
}

/// Compute the default path to the client configuration file.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = project_dirs()?;
    Ok(dirs.config_dir().join("config.json"))
}
