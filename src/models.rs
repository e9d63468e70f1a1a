use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    Quick,
    #[default]
    Standard,
    Deep,
}

impl Depth {
    /// Source count the backend preset uses for this depth.
    pub fn default_sources(self) -> u32 {
        match self {
            Depth::Quick => 3,
            Depth::Standard => 6,
            Depth::Deep => 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResearchRequest {
    pub topic: String,
    pub depth: Depth,
    pub max_sources: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domains: Option<Vec<String>>,
}

impl ResearchRequest {
    /// `max_sources` follows the depth preset unless given; `domains` is a comma-separated list.
    pub fn new(topic: &str, depth: Depth, max_sources: Option<u32>, domains: Option<&str>) -> Result<Self> {
        let topic = topic.trim();
        if topic.is_empty() {
            bail!("topic must not be empty");
        }
        let max_sources = max_sources.unwrap_or_else(|| depth.default_sources());
        if !(1..=20).contains(&max_sources) {
            bail!("max_sources must be between 1 and 20, got {max_sources}");
        }
        let domains: Vec<String> = domains
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(String::from)
            .collect();
        Ok(Self {
            topic: topic.to_string(),
            depth,
            max_sources,
            domains: (!domains.is_empty()).then_some(domains),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunCreated {
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }
}

/// Backend view of one run. Timestamps are kept as sent; the backend emits naive ISO strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub created_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub depth: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub service: String,
    pub version: String,
    pub groq_model: String,
    pub search_provider: String,
}
