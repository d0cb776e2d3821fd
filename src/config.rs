use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialConfig {
    #[serde(default)]
    server_url: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    app_password: Option<String>,
    #[serde(default)]
    roots: Option<Vec<RootConfig>>,
    #[serde(default)]
    options: Option<SyncOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootConfig {
    /// Absolute local directory kept in sync.
    pub local_dir: PathBuf,
    /// Remote collection path relative to the DAV endpoint, e.g. "/" or "/Photos".
    pub remote_path: String,
    #[serde(default)]
    pub vfs_mode: VfsMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VfsMode {
    #[default]
    Off,
    Suffix,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "value")]
pub enum BandwidthLimit {
    Unlimited,
    /// Absolute cap in KiB/s.
    Absolute(u64),
    /// Fraction of the measured link, 0.0..=1.0, sampled over 5 s windows.
    Relative(f64),
}

impl Default for BandwidthLimit {
    fn default() -> Self {
        BandwidthLimit::Unlimited
    }
}

/// Engine tuning knobs. Everything has a workable default; the config file
/// only needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncOptions {
    /// Files at or below this size upload as a single PUT.
    pub chunk_threshold: i64,
    pub min_chunk_size: i64,
    pub max_chunk_size: i64,
    /// Adaptive chunk sizing aims at this many seconds per chunk.
    pub target_chunk_upload_secs: u64,
    pub parallelism: usize,
    pub parallelism_http2: usize,
    pub download_limit: BandwidthLimit,
    pub upload_limit: BandwidthLimit,
    pub remote_poll_secs: u64,
    pub full_local_discovery_secs: u64,
    pub big_folder_threshold_bytes: i64,
    /// In-run transfer retry schedule, seconds.
    pub retry_schedule_secs: Vec<u64>,
    /// Hidden-file policy per root; dot-files stay local when false.
    pub sync_hidden_files: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            chunk_threshold: 10 * 1024 * 1024,
            min_chunk_size: 1024 * 1024,
            max_chunk_size: 100 * 1024 * 1024,
            target_chunk_upload_secs: 60,
            parallelism: 6,
            parallelism_http2: 20,
            download_limit: BandwidthLimit::Unlimited,
            upload_limit: BandwidthLimit::Unlimited,
            remote_poll_secs: 30,
            full_local_discovery_secs: 3600,
            big_folder_threshold_bytes: 500 * 1024 * 1024,
            retry_schedule_secs: vec![1, 2, 5, 10, 30],
            sync_hidden_files: false,
        }
    }
}

impl SyncOptions {
    pub fn retry_schedule(&self) -> Vec<Duration> {
        self.retry_schedule_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: String,
    pub username: String,
    pub app_password: Option<String>,
    pub roots: Vec<RootConfig>,
    pub options: SyncOptions,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub server_url: Option<String>,
    pub username: Option<String>,
    pub local_dir: Option<PathBuf>,
    pub remote_path: Option<String>,
}

pub fn default_log_file_path() -> PathBuf {
    home_dir().join(".davsync").join("logs").join("davsync.log")
}

impl Config {
    pub fn default_config_path() -> PathBuf {
        home_dir().join(".davsync").join("config.json")
    }

    pub fn resolve_config_path(flag_path: Option<&Path>) -> PathBuf {
        if let Some(p) = flag_path {
            return absolutize_path(p);
        }

        if let Ok(env_path) = std::env::var("DAVSYNC_CONFIG_PATH") {
            let env_path = env_path.trim();
            if !env_path.is_empty() {
                return absolutize_path(Path::new(env_path));
            }
        }

        let candidates = [
            Self::default_config_path(),
            home_dir()
                .join(".config")
                .join("davsync")
                .join("config.json"),
        ];
        for p in candidates {
            if p.exists() {
                return absolutize_path(&p);
            }
        }

        absolutize_path(&Self::default_config_path())
    }

    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let file_cfg = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str::<PartialConfig>(&data).context("parse config json")?
        } else {
            PartialConfig::default()
        };

        let env_cfg = read_env_config();

        let server_url = overrides
            .server_url
            .or(env_cfg.server_url)
            .or(file_cfg.server_url)
            .unwrap_or_default();
        let username = overrides
            .username
            .or(env_cfg.username)
            .or(file_cfg.username)
            .unwrap_or_default();
        let app_password = env_cfg.app_password.or(file_cfg.app_password);

        let mut roots = file_cfg.roots.unwrap_or_default();
        if let Some(local_dir) = overrides.local_dir {
            let remote_path = overrides.remote_path.unwrap_or_else(|| "/".to_string());
            roots = vec![RootConfig {
                local_dir,
                remote_path,
                vfs_mode: VfsMode::Off,
            }];
        }

        let mut cfg = Config {
            server_url,
            username,
            app_password,
            roots,
            options: file_cfg.options.unwrap_or_default(),
            config_path: Some(absolutize_path(path)),
        };
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn normalize(&mut self) -> Result<()> {
        self.server_url = self.server_url.trim().trim_end_matches('/').to_string();
        self.username = self.username.trim().to_string();
        for root in &mut self.roots {
            root.local_dir = absolutize_path(&root.local_dir);
            let remote = root.remote_path.trim();
            let remote = remote.trim_matches('/');
            root.remote_path = if remote.is_empty() {
                "/".to_string()
            } else {
                format!("/{remote}")
            };
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            anyhow::bail!("server_url is required");
        }
        Url::parse(&self.server_url)
            .with_context(|| format!("invalid server_url {}", self.server_url))?;
        if self.username.is_empty() {
            anyhow::bail!("username is required");
        }
        for (i, a) in self.roots.iter().enumerate() {
            for b in self.roots.iter().skip(i + 1) {
                if a.local_dir.starts_with(&b.local_dir) || b.local_dir.starts_with(&a.local_dir) {
                    anyhow::bail!(
                        "sync roots overlap: {} and {}",
                        a.local_dir.display(),
                        b.local_dir.display()
                    );
                }
            }
        }
        Ok(())
    }
}

fn read_env_config() -> PartialConfig {
    let get = |name: &str| {
        std::env::var(name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    PartialConfig {
        server_url: get("DAVSYNC_SERVER_URL"),
        username: get("DAVSYNC_USERNAME"),
        app_password: get("DAVSYNC_APP_PASSWORD"),
        roots: None,
        options: None,
    }
}

fn home_dir() -> PathBuf {
    if let Ok(h) = std::env::var("HOME") {
        if !h.trim().is_empty() {
            return PathBuf::from(h);
        }
    }
    if let Ok(h) = std::env::var("USERPROFILE") {
        if !h.trim().is_empty() {
            return PathBuf::from(h);
        }
    }
    PathBuf::from(".")
}

fn absolutize_path(p: &Path) -> PathBuf {
    let joined = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Lexical cleanup only; no filesystem access, so dangling paths stay usable.
    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn load_applies_defaults_and_normalizes_remote_path() {
        let tmp = make_temp_dir("davsync-config-test");
        let cfg_path = tmp.join("config.json");
        std::fs::write(
            &cfg_path,
            format!(
                r#"{{
                  "server_url": "https://cloud.example.com/",
                  "username": "alice",
                  "roots": [{{"local_dir": "{}", "remote_path": "Photos/"}}]
                }}"#,
                tmp.join("data").display()
            ),
        )
        .unwrap();

        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.server_url, "https://cloud.example.com");
        assert_eq!(cfg.roots.len(), 1);
        assert_eq!(cfg.roots[0].remote_path, "/Photos");
        assert_eq!(cfg.options, SyncOptions::default());
        assert_eq!(cfg.options.parallelism, 6);
        assert_eq!(cfg.options.chunk_threshold, 10 * 1024 * 1024);
    }

    #[test]
    fn overrides_replace_configured_roots() {
        let tmp = make_temp_dir("davsync-config-override-test");
        let cfg_path = tmp.join("config.json");
        std::fs::write(
            &cfg_path,
            r#"{"server_url": "https://cloud.example.com", "username": "alice", "roots": []}"#,
        )
        .unwrap();

        let overrides = ConfigOverrides {
            local_dir: Some(tmp.join("mirror")),
            remote_path: Some("docs".to_string()),
            ..Default::default()
        };
        let cfg = Config::load_with_overrides(&cfg_path, overrides).unwrap();
        assert_eq!(cfg.roots.len(), 1);
        assert_eq!(cfg.roots[0].remote_path, "/docs");
        assert!(cfg.roots[0].local_dir.is_absolute());
    }

    #[test]
    fn overlapping_roots_are_rejected() {
        let tmp = make_temp_dir("davsync-config-overlap-test");
        let cfg_path = tmp.join("config.json");
        std::fs::write(
            &cfg_path,
            format!(
                r#"{{
                  "server_url": "https://cloud.example.com",
                  "username": "alice",
                  "roots": [
                    {{"local_dir": "{0}", "remote_path": "/"}},
                    {{"local_dir": "{0}/nested", "remote_path": "/other"}}
                  ]
                }}"#,
                tmp.join("data").display()
            ),
        )
        .unwrap();

        let err = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn missing_server_url_is_rejected() {
        let tmp = make_temp_dir("davsync-config-missing-test");
        let cfg_path = tmp.join("config.json");
        std::fs::write(&cfg_path, r#"{"username": "alice"}"#).unwrap();
        assert!(Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).is_err());
    }
}
