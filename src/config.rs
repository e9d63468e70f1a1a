use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::{Path, PathBuf}, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorCfg {
    pub backend_url: String,
    pub runs_poll_secs: u64,
    pub metrics_poll_secs: u64,
    /// Applied to one-shot requests; the event stream is never timed out.
    pub request_timeout_secs: u64,
    pub state_path: PathBuf,
    pub bind: String,
}

impl Default for MonitorCfg {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:9009".into(),
            runs_poll_secs: 8,
            metrics_poll_secs: 10,
            request_timeout_secs: 10,
            state_path: PathBuf::from(".runscope/state.json"),
            bind: "127.0.0.1:3000".into(),
        }
    }
}

impl MonitorCfg {
    /// Reads the optional YAML file; absent fields keep their defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let cfg = match path {
            Some(path) => {
                let txt = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                Self::from_yaml(&txt)?
            }
            None => Self::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(txt: &str) -> Result<Self> {
        // An empty file deserializes to unit, not a mapping.
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt).context("Failed to parse config YAML")
    }

    pub fn validate(&self) -> Result<()> {
        if self.runs_poll_secs == 0 || self.metrics_poll_secs == 0 {
            bail!("poll intervals must be at least one second");
        }
        if self.backend_url.trim().is_empty() {
            bail!("backend_url is empty");
        }
        Ok(())
    }

    pub fn runs_every(&self) -> Duration {
        Duration::from_secs(self.runs_poll_secs)
    }

    pub fn metrics_every(&self) -> Duration {
        Duration::from_secs(self.metrics_poll_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
