//! Persisted key/value settings with per-key update times, plus the ad-hoc
//! history-device-ids file.
//!
//! Storage is a flat JSON file rewritten atomically (tmp + rename, 0600;
//! cookies and access tokens live here).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_HISTORY_IDS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: Value,
    updated_at: u64,
}

pub struct Settings {
    path: PathBuf,
    entries: HashMap<String, Entry>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        file.write_all(data)?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

impl Settings {
    /// Load settings, starting empty when the file does not exist yet.
    pub fn load(path: PathBuf) -> Result<Self> {
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt settings file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        Ok(Self { path, entries })
    }

    fn save(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.entries)?;
        write_atomic(&self.path, &data)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .and_then(|e| e.value.as_str().map(|s| s.to_string()))
    }

    pub fn get_integer(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(|e| e.value.as_i64())
    }

    pub fn get_boolean(&self, key: &str) -> Option<bool> {
        self.entries.get(key).and_then(|e| e.value.as_bool())
    }

    /// Unix timestamp of the key's last write.
    pub fn update_time(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.updated_at)
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                updated_at: unix_now(),
            },
        );
        self.save()
    }

    pub fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        self.set(key, Value::String(value.to_string()))
    }

    pub fn set_integer(&mut self, key: &str, value: i64) -> Result<()> {
        self.set(key, Value::from(value))
    }

    pub fn set_boolean(&mut self, key: &str, value: bool) -> Result<()> {
        self.set(key, Value::Bool(value))
    }
}

/// Most-recently-used peer device ids, newest first, semicolon-separated on
/// disk, capped at [`MAX_HISTORY_IDS`].
pub struct HistoryIds {
    path: PathBuf,
    ids: Vec<String>,
}

impl HistoryIds {
    pub fn load(path: PathBuf) -> Self {
        let ids = match std::fs::read_to_string(&path) {
            Ok(raw) => raw
                .trim()
                .split(';')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
            Err(_) => Vec::new(),
        };
        Self { path, ids }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Move (or insert) an id to the front and persist.
    pub fn insert_newest(&mut self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Ok(());
        }
        self.ids.retain(|existing| existing != id);
        self.ids.insert(0, id.to_string());
        self.ids.truncate(MAX_HISTORY_IDS);
        write_atomic(&self.path, self.ids.join(";").as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "lanthing-settings-test-{}-{}",
            std::process::id(),
            name
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn typed_get_set_roundtrip() {
        let path = temp_path("typed.json");
        let mut settings = Settings::load(path.clone()).unwrap();
        settings.set_string("access_token", "ABC123").unwrap();
        settings.set_integer("device_id", 424242).unwrap();
        settings.set_boolean("allow_control", true).unwrap();

        // Reload from disk.
        let settings = Settings::load(path).unwrap();
        assert_eq!(settings.get_string("access_token").as_deref(), Some("ABC123"));
        assert_eq!(settings.get_integer("device_id"), Some(424242));
        assert_eq!(settings.get_boolean("allow_control"), Some(true));
    }

    #[test]
    fn missing_keys_are_none() {
        let settings = Settings::load(temp_path("empty.json")).unwrap();
        assert_eq!(settings.get_string("nope"), None);
        assert_eq!(settings.get_integer("nope"), None);
        assert_eq!(settings.get_boolean("nope"), None);
        assert_eq!(settings.update_time("nope"), None);
    }

    #[test]
    fn wrong_type_reads_as_none() {
        let path = temp_path("types.json");
        let mut settings = Settings::load(path).unwrap();
        settings.set_string("min_port", "not a number").unwrap();
        assert_eq!(settings.get_integer("min_port"), None);
    }

    #[test]
    fn set_records_update_time() {
        let path = temp_path("times.json");
        let mut settings = Settings::load(path).unwrap();
        let before = unix_now();
        settings.set_string("from_42", "cookie").unwrap();
        let at = settings.update_time("from_42").unwrap();
        assert!(at >= before);
    }

    #[test]
    fn settings_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let path = temp_path("perms.json");
        let mut settings = Settings::load(path.clone()).unwrap();
        settings.set_string("cookie_7", "secret").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn history_insert_dedup_and_cap() {
        let path = temp_path("historyids");
        let mut history = HistoryIds::load(path.clone());
        for i in 0..25 {
            history.insert_newest(&i.to_string()).unwrap();
        }
        assert_eq!(history.ids().len(), MAX_HISTORY_IDS);
        assert_eq!(history.ids()[0], "24");

        // Re-inserting an existing id moves it to the front without growing.
        history.insert_newest("10").unwrap();
        assert_eq!(history.ids()[0], "10");
        assert_eq!(history.ids().len(), MAX_HISTORY_IDS);

        // Semicolon-separated on disk, survives reload.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("10;24;23"));
        let reloaded = HistoryIds::load(path);
        assert_eq!(reloaded.ids(), history.ids());
    }

    #[test]
    fn empty_history_id_ignored() {
        let mut history = HistoryIds::load(temp_path("historyids2"));
        history.insert_newest("").unwrap();
        assert!(history.ids().is_empty());
    }
}
