use std::path::PathBuf;

use serde::Deserialize;

/// XMDS client type reported at registration.
pub const CLIENT_TYPE: &str = "linux";

/// Numeric client code reported at registration.
pub const CLIENT_CODE: u32 = 400;

/// Collection interval used until the CMS tells us otherwise (seconds).
pub const DEFAULT_COLLECT_INTERVAL_SECS: u64 = 300;

/// How often the schedule is re-assessed without an external trigger (seconds).
pub const DEFAULT_ASSESS_INTERVAL_SECS: u64 = 60;

/// Pending-log count above which the backlog is drained on its own loop.
pub const LOGS_THRESHOLD: usize = 100;

/// Interval of the log backlog drain loop (seconds).
pub const LOGS_DRAIN_INTERVAL_SECS: u64 = 10;

/// Interval of the stats cleanup loop (seconds).
pub const STATS_CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Open stats older than this are considered abandoned (seconds).
pub const STATS_MAX_OPEN_AGE_SECS: i64 = 24 * 3600;

/// Path prefix under which the local file server exposes the library.
pub const FILES_PREFIX: &str = "/files";

/// Top-level configuration for the player engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the CMS, e.g. `https://cms.example.com`.
    pub cms_url: String,
    /// CMS server key.
    pub cms_key: String,
    pub hardware_key: String,
    pub display_name: String,
    /// XMDS schema version. `None` means "ask the CMS".
    pub xmds_version: Option<u32>,
    pub xmr_channel: String,
    /// Directory holding downloaded content.
    pub library_dir: PathBuf,
    /// SQLite file for files/stats/logs.
    pub db_path: PathBuf,
    /// Bind address of the local file server.
    pub bind: String,
    pub collect_interval_secs: u64,
    pub assess_interval_secs: u64,
    /// Upper bound on concurrent downloads within one RequiredFiles batch.
    pub max_concurrent_downloads: usize,
    pub stats_enabled: bool,
    /// Use shareOfVoice as the per-hour interrupt target instead of one
    /// commit per pass.
    pub share_of_voice_targets: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cms_url: String::new(),
            cms_key: String::new(),
            hardware_key: String::new(),
            display_name: "signage-player".into(),
            xmds_version: None,
            xmr_channel: String::new(),
            library_dir: PathBuf::from("/var/lib/signage-engine/library"),
            db_path: PathBuf::from("/var/lib/signage-engine/engine.db"),
            bind: "127.0.0.1:9696".into(),
            collect_interval_secs: DEFAULT_COLLECT_INTERVAL_SECS,
            assess_interval_secs: DEFAULT_ASSESS_INTERVAL_SECS,
            max_concurrent_downloads: 4,
            stats_enabled: true,
            share_of_voice_targets: false,
        }
    }
}

impl EngineConfig {
    /// Read `SIGNAGE_*` environment variables over the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading keys through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = EngineConfig::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("SIGNAGE_CMS_URL") {
            cfg.cms_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("SIGNAGE_CMS_KEY") {
            cfg.cms_key = v;
        }
        if let Some(v) = get("SIGNAGE_HARDWARE_KEY") {
            cfg.hardware_key = v;
        }
        if let Some(v) = get("SIGNAGE_DISPLAY_NAME") {
            cfg.display_name = v;
        }
        if let Some(v) = get("SIGNAGE_XMDS_VERSION") {
            cfg.xmds_version = Some(
                v.parse()
                    .map_err(|e| anyhow::anyhow!("invalid SIGNAGE_XMDS_VERSION ({v}): {e}"))?,
            );
        }
        if let Some(v) = get("SIGNAGE_XMR_CHANNEL") {
            cfg.xmr_channel = v;
        }
        if let Some(v) = get("SIGNAGE_LIBRARY_DIR") {
            cfg.library_dir = PathBuf::from(v);
        }
        if let Some(v) = get("SIGNAGE_DB_PATH") {
            cfg.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("SIGNAGE_BIND") {
            cfg.bind = v;
        }
        if let Some(v) = get("SIGNAGE_COLLECT_INTERVAL") {
            cfg.collect_interval_secs = parse_positive("SIGNAGE_COLLECT_INTERVAL", &v)?;
        }
        if let Some(v) = get("SIGNAGE_ASSESS_INTERVAL") {
            cfg.assess_interval_secs = parse_positive("SIGNAGE_ASSESS_INTERVAL", &v)?;
        }
        if let Some(v) = get("SIGNAGE_MAX_DOWNLOADS") {
            cfg.max_concurrent_downloads = parse_positive("SIGNAGE_MAX_DOWNLOADS", &v)? as usize;
        }
        if let Some(v) = get("SIGNAGE_STATS_ENABLED") {
            cfg.stats_enabled = parse_flag(&v);
        }
        if let Some(v) = get("SIGNAGE_SOV_TARGETS") {
            cfg.share_of_voice_targets = parse_flag(&v);
        }

        if cfg.hardware_key.is_empty() {
            cfg.hardware_key = default_hardware_key();
        }

        Ok(cfg)
    }

    /// A display can only talk to a CMS once both address and key are known.
    pub fn is_configured(&self) -> bool {
        !self.cms_url.is_empty() && !self.cms_key.is_empty()
    }
}

fn parse_positive(key: &str, v: &str) -> anyhow::Result<u64> {
    match v.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => anyhow::bail!("{key} must be greater than zero"),
        Err(e) => anyhow::bail!("invalid {key} ({v}): {e}"),
    }
}

fn parse_flag(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
}

/// Stable per-machine identity: machine-id if the OS has one, else a fresh UUID.
fn default_hardware_key() -> String {
    std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_overrides_defaults() {
        let env: HashMap<&str, &str> = [
            ("SIGNAGE_CMS_URL", "https://cms.example.com/"),
            ("SIGNAGE_CMS_KEY", "secret"),
            ("SIGNAGE_HARDWARE_KEY", "hw-1"),
            ("SIGNAGE_COLLECT_INTERVAL", "60"),
            ("SIGNAGE_STATS_ENABLED", "false"),
        ]
        .into_iter()
        .collect();

        let cfg = EngineConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.cms_url, "https://cms.example.com");
        assert_eq!(cfg.hardware_key, "hw-1");
        assert_eq!(cfg.collect_interval_secs, 60);
        assert!(!cfg.stats_enabled);
        assert!(cfg.is_configured());
        assert_eq!(cfg.max_concurrent_downloads, 4);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let res = EngineConfig::from_lookup(|k| {
            (k == "SIGNAGE_COLLECT_INTERVAL").then(|| "0".to_string())
        });
        assert!(res.is_err());
    }
}
