//! Global settings: OpenList connection, extension classes, retry count
//! (spec.md §3 "Global Settings", §4.9 design note). Persisted as a single
//! `settings.json` document using the same write-then-rename discipline as
//! the task store (teacher's `save_store`/`load_store` idiom).

use crate::atomic_write::write_atomic;
use crate::error::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenListConnection {
    pub base_url: String,
    pub username: String,
    /// Base64-wrapped, reversible at rest — see DESIGN.md Open Question 2.
    /// Not a security boundary; CloudGather assumes a trusted single
    /// operator and must be able to replay the password to OpenList.
    password_b64: String,
    pub token: Option<String>,
    pub public_url: Option<String>,
}

impl OpenListConnection {
    pub fn set_password(&mut self, plaintext: &str) {
        self.password_b64 = BASE64.encode(plaintext.as_bytes());
    }

    pub fn password(&self) -> String {
        BASE64
            .decode(&self.password_b64)
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionClasses {
    pub video: Vec<String>,
    pub subtitle: Vec<String>,
    pub image: Vec<String>,
    pub nfo: Vec<String>,
}

impl Default for ExtensionClasses {
    fn default() -> Self {
        ExtensionClasses {
            video: vec![
                "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "ts", "m2ts", "iso",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            subtitle: vec!["srt", "ass", "ssa", "sub", "vtt"]
                .into_iter()
                .map(String::from)
                .collect(),
            image: vec!["jpg", "jpeg", "png", "webp"]
                .into_iter()
                .map(String::from)
                .collect(),
            nfo: vec!["nfo"].into_iter().map(String::from).collect(),
        }
    }
}

impl ExtensionClasses {
    pub fn classify(&self, ext: &str) -> ExtensionClass {
        let ext = ext.to_ascii_lowercase();
        if self.video.iter().any(|e| e == &ext) {
            ExtensionClass::Video
        } else if self.subtitle.iter().any(|e| e == &ext) {
            ExtensionClass::Subtitle
        } else if self.image.iter().any(|e| e == &ext) {
            ExtensionClass::Image
        } else if self.nfo.iter().any(|e| e == &ext) {
            ExtensionClass::Nfo
        } else {
            ExtensionClass::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionClass {
    Video,
    Subtitle,
    Image,
    Nfo,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub openlist: OpenListConnection,
    pub extensions: ExtensionClasses,
    #[serde(default = "default_retry_count")]
    pub sync_retry_count: u32,
}

fn default_retry_count() -> u32 {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            openlist: OpenListConnection::default(),
            extensions: ExtensionClasses::default(),
            sync_retry_count: default_retry_count(),
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    inner: parking_lot::RwLock<Settings>,
}

impl SettingsStore {
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("settings.json");
        let settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Settings::default()
        };
        Ok(SettingsStore {
            path,
            inner: parking_lot::RwLock::new(settings),
        })
    }

    pub fn get(&self) -> Settings {
        self.inner.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut guard = self.inner.write();
        f(&mut guard);
        let json = serde_json::to_vec_pretty(&*guard)?;
        write_atomic(&self.path, &json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trips_through_base64() {
        let mut conn = OpenListConnection::default();
        conn.set_password("hunter2");
        assert_eq!(conn.password(), "hunter2");
    }

    #[test]
    fn default_extensions_classify_common_cases() {
        let ext = ExtensionClasses::default();
        assert_eq!(ext.classify("MKV"), ExtensionClass::Video);
        assert_eq!(ext.classify("srt"), ExtensionClass::Subtitle);
        assert_eq!(ext.classify("exe"), ExtensionClass::Other);
    }

    #[test]
    fn load_creates_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path()).unwrap();
        assert_eq!(store.get().sync_retry_count, 3);
    }

    #[test]
    fn update_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path()).unwrap();
        store
            .update(|s| s.openlist.base_url = "https://example.test".to_string())
            .unwrap();
        let reloaded = SettingsStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.get().openlist.base_url, "https://example.test");
    }
}
