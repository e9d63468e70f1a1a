use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::Path;
use tokio::{fs, io::AsyncWriteExt};

pub const RECENT_RUNS_KEY: &str = "recent_runs";
pub const RECENT_RUNS_CAP: usize = 10;

/// Key-value slots persisted as one JSON object. Unreadable state reads as empty.
async fn read_slots(path: &Path) -> Map<String, Value> {
    let Ok(bytes) = fs::read(path).await else {
        return Map::new();
    };
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => map,
        _ => {
            tracing::warn!(path = %path.display(), "ignoring unreadable state file");
            Map::new()
        }
    }
}

async fn write_slots(path: &Path, slots: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(slots)?;
    {
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(&bytes).await?;
        let _ = f.sync_all().await; // best-effort
    }
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Remembered run ids, most recent first.
pub async fn load(path: &Path) -> Vec<String> {
    let slots = read_slots(path).await;
    slots
        .get(RECENT_RUNS_KEY)
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default()
}

/// Puts `run_id` in front and keeps the newest ten.
pub async fn remember(path: &Path, run_id: &str) -> Result<Vec<String>> {
    let mut slots = read_slots(path).await;
    let mut ids = load(path).await;
    ids.insert(0, run_id.to_string());
    ids.truncate(RECENT_RUNS_CAP);
    slots.insert(RECENT_RUNS_KEY.to_string(), Value::from(ids.clone()));
    write_slots(path, &slots)
        .await
        .with_context(|| format!("saving recent runs to {}", path.display()))?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn newest_first_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        assert!(load(&path).await.is_empty());
        for i in 0..12 {
            remember(&path, &format!("run-{i}")).await.unwrap();
        }
        let ids = load(&path).await;
        assert_eq!(ids.len(), RECENT_RUNS_CAP);
        assert_eq!(ids[0], "run-11");
        assert_eq!(ids[9], "run-2");
    }

    #[tokio::test]
    async fn other_slots_survive_and_garbage_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"theme":"dark","recent_runs":["old"]}"#).await.unwrap();
        remember(&path, "new").await.unwrap();
        let raw: Value = serde_json::from_slice(&fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(raw["theme"], "dark");
        assert_eq!(load(&path).await, vec!["new", "old"]);

        fs::write(&path, "not json").await.unwrap();
        assert!(load(&path).await.is_empty());
        assert_eq!(remember(&path, "fresh").await.unwrap(), vec!["fresh"]);
    }
}
