use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteSettings {
    /// Base URL of the realtime-database REST API. `None` keeps everything in memory.
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProctorSettings {
    pub face_poll_interval_ms: u64,
    pub face_miss_threshold: u32,
    pub violation_cooldown_ms: i64,
    pub max_tab_warnings: u32,
    /// External detector process (program followed by its arguments).
    pub presence_command: Option<Vec<String>>,
}

impl Default for ProctorSettings {
    fn default() -> Self {
        Self {
            face_poll_interval_ms: 750,
            face_miss_threshold: 3,
            violation_cooldown_ms: 10_000,
            max_tab_warnings: 3,
            presence_command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    pub video_interval_ms: u64,
    pub aggregate_interval_ms: u64,
    pub analytics_interval_ms: u64,
    pub retry_base_ms: i64,
    pub retry_max_ms: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            video_interval_ms: 5_000,
            aggregate_interval_ms: 30_000,
            analytics_interval_ms: 10_000,
            retry_base_ms: 5_000,
            retry_max_ms: 60_000,
        }
    }
}

impl SyncSettings {
    fn debug() -> Self {
        Self {
            video_interval_ms: 1_000,
            aggregate_interval_ms: 1_000,
            analytics_interval_ms: 1_000,
            retry_base_ms: 1_000,
            retry_max_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProgressPolicy {
    /// Fraction of `totalDuration` that must be validly watched to complete a video.
    pub completion_ratio: f64,
    /// Upper bound on `validWatchTime` as a multiple of `totalDuration`.
    pub replay_tolerance: f64,
    /// Duration assumed for every video synthesised from legacy progress.
    pub legacy_video_duration_secs: f64,
    /// Legacy entries claiming more videos than this per course are rejected.
    pub max_legacy_videos: u32,
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self {
            completion_ratio: 0.9,
            replay_tolerance: 1.2,
            legacy_video_duration_secs: 600.0,
            max_legacy_videos: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub database_path: PathBuf,
    pub bind_addr: String,
    pub remote: RemoteSettings,
    pub proctoring: ProctorSettings,
    pub sync: SyncSettings,
    pub progress: ProgressPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("studyguard.sqlite3"),
            bind_addr: "127.0.0.1:8787".into(),
            remote: RemoteSettings::default(),
            proctoring: ProctorSettings::default(),
            sync: SyncSettings::default(),
            progress: ProgressPolicy::default(),
        }
    }
}

impl EngineSettings {
    /// Applies `STUDYGUARD_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("STUDYGUARD_DB") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(addr) = lookup("STUDYGUARD_BIND") {
            self.bind_addr = addr;
        }
        if let Some(url) = lookup("STUDYGUARD_REMOTE_URL") {
            self.remote.base_url = Some(url);
        }
        if let Some(token) = lookup("STUDYGUARD_REMOTE_TOKEN") {
            self.remote.auth_token = Some(token);
        }

        let debug_mode = lookup("STUDYGUARD_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if debug_mode {
            self.sync = SyncSettings::debug();
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<EngineSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(
                    "Settings file {} is malformed ({err}); using defaults",
                    path.display()
                );
                EngineSettings::default()
            })
        } else {
            EngineSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn settings(&self) -> EngineSettings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, settings: EngineSettings) -> Result<()> {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    fn persist(&self, data: &EngineSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
