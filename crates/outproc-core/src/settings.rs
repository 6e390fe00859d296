use crate::escalation::EscalationPolicy;
use crate::object::Config;
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const HOST_BIN_ENV: &str = "OUTPROC_HOST_BIN";

const MIN_DELAY_MS: u64 = 10;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommunicatorSettings {
    #[serde(default = "default_connector")]
    pub connector: String,
    #[serde(default = "default_host_application")]
    pub host_application: String,
    #[serde(default)]
    pub persistent_path: String,
    #[serde(default)]
    pub system_path: String,
    #[serde(default)]
    pub data_path: String,
    #[serde(default)]
    pub application_path: String,
    #[serde(default)]
    pub proxy_stub_path: String,
    /// JSON array of tracing filter directives handed to every announcing
    /// process. Empty leaves the remote side on its own defaults.
    #[serde(default)]
    pub trace_categories: String,
    #[serde(default)]
    pub escalation: EscalationSettings,
    #[serde(default = "default_communication_timeout_ms")]
    pub communication_timeout_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscalationSettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_soft_kill_grace_ms")]
    pub soft_kill_grace_ms: u64,
    #[serde(default = "default_hard_kill_grace_ms")]
    pub hard_kill_grace_ms: u64,
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            soft_kill_grace_ms: default_soft_kill_grace_ms(),
            hard_kill_grace_ms: default_hard_kill_grace_ms(),
        }
    }
}

impl Default for CommunicatorSettings {
    fn default() -> Self {
        Self {
            connector: default_connector(),
            host_application: default_host_application(),
            persistent_path: String::new(),
            system_path: String::new(),
            data_path: String::new(),
            application_path: String::new(),
            proxy_stub_path: String::new(),
            trace_categories: String::new(),
            escalation: EscalationSettings::default(),
            communication_timeout_ms: default_communication_timeout_ms(),
        }
    }
}

impl CommunicatorSettings {
    pub fn to_escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            initial_delay: Duration::from_millis(self.escalation.initial_delay_ms.max(MIN_DELAY_MS)),
            soft_kill_grace: Duration::from_millis(self.escalation.soft_kill_grace_ms.max(MIN_DELAY_MS)),
            hard_kill_grace: Duration::from_millis(self.escalation.hard_kill_grace_ms.max(MIN_DELAY_MS)),
        }
    }

    pub fn communication_timeout(&self) -> Duration {
        Duration::from_millis(self.communication_timeout_ms.max(MIN_DELAY_MS))
    }

    pub fn to_config(&self, connector: &str) -> Config {
        Config {
            connector: connector.to_string(),
            host_application: self.host_application.clone(),
            persistent_path: self.persistent_path.clone(),
            system_path: self.system_path.clone(),
            data_path: self.data_path.clone(),
            application_path: self.application_path.clone(),
            proxy_stub_path: self.proxy_stub_path.clone(),
        }
    }
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join("communicator.json")
}

pub fn load_settings(config_dir: &Path) -> Result<CommunicatorSettings> {
    load_settings_from_path(&settings_path(config_dir))
}

pub fn save_settings(config_dir: &Path, settings: &CommunicatorSettings) -> Result<()> {
    save_settings_to_path(&settings_path(config_dir), settings)
}

pub fn load_settings_from_path(path: &Path) -> Result<CommunicatorSettings> {
    if !path.exists() {
        return Ok(CommunicatorSettings::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("read settings file: {}", path.display()))?;
    let settings: CommunicatorSettings = serde_json::from_str(&raw)
        .with_context(|| format!("parse settings file: {}", path.display()))?;
    Ok(settings)
}

pub fn save_settings_to_path(path: &Path, settings: &CommunicatorSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create config dir: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json).with_context(|| format!("write settings file: {}", path.display()))?;
    Ok(())
}

fn default_connector() -> String {
    "127.0.0.1:0".to_string()
}

fn default_host_application() -> String {
    #[cfg(target_os = "windows")]
    let host_binary = "outproc-host.exe";
    #[cfg(not(target_os = "windows"))]
    let host_binary = "outproc-host";

    std::env::var(HOST_BIN_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| host_binary.to_string())
}

const fn default_communication_timeout_ms() -> u64 {
    3000
}

const fn default_initial_delay_ms() -> u64 {
    3000
}

const fn default_soft_kill_grace_ms() -> u64 {
    6000
}

const fn default_hard_kill_grace_ms() -> u64 {
    8000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_defaults_when_missing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let settings = load_settings(dir.path()).expect("load defaults");
        assert_eq!(settings.connector, "127.0.0.1:0");
        assert_eq!(settings.escalation.initial_delay_ms, 3000);
        assert_eq!(settings.to_escalation_policy(), EscalationPolicy::default());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut settings = CommunicatorSettings {
            connector: "127.0.0.1:7800".to_string(),
            host_application: "/usr/bin/outproc-host".to_string(),
            proxy_stub_path: "/usr/lib/outproc/proxystubs".to_string(),
            trace_categories: r#"["outproc_core=debug"]"#.to_string(),
            ..CommunicatorSettings::default()
        };
        settings.escalation.soft_kill_grace_ms = 1500;

        save_settings(dir.path(), &settings).expect("save settings");
        let loaded = load_settings(dir.path()).expect("load settings");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = settings_path(dir.path());
        fs::write(&path, r#"{"connector":"127.0.0.1:9000","escalation":{"initial_delay_ms":100}}"#)
            .expect("write settings");

        let settings = load_settings_from_path(&path).expect("load");
        assert_eq!(settings.connector, "127.0.0.1:9000");
        assert_eq!(settings.escalation.initial_delay_ms, 100);
        assert_eq!(settings.escalation.hard_kill_grace_ms, 8000);
        assert_eq!(settings.communication_timeout_ms, 3000);
    }

    #[test]
    fn invalid_json_reports_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = settings_path(dir.path());
        fs::write(&path, "{not json").expect("write settings");

        let err = load_settings_from_path(&path).expect_err("parse failure");
        assert!(format!("{err:#}").contains("communicator.json"));
    }

    #[test]
    fn delays_are_clamped_to_a_minimum() {
        let mut settings = CommunicatorSettings::default();
        settings.escalation.initial_delay_ms = 0;
        settings.communication_timeout_ms = 0;

        let policy = settings.to_escalation_policy();
        assert_eq!(policy.initial_delay, Duration::from_millis(MIN_DELAY_MS));
        assert_eq!(settings.communication_timeout(), Duration::from_millis(MIN_DELAY_MS));
    }

    #[test]
    fn config_carries_paths_and_connector() {
        let settings = CommunicatorSettings {
            data_path: "/usr/share/outproc".to_string(),
            ..CommunicatorSettings::default()
        };
        let config = settings.to_config("127.0.0.1:4000");
        assert_eq!(config.connector, "127.0.0.1:4000");
        assert_eq!(config.data_path, "/usr/share/outproc");
        assert_eq!(config.host_application, settings.host_application);
    }
}
