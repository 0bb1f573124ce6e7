#![allow(dead_code)]

use async_compression::tokio::write::GzipEncoder;
use lockmirror_core::{MirrorConfig, RegistrySettings};
use lockmirror_engine::{Fetcher, Reconciler};
use serde_json::Value;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

pub async fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(data).await.unwrap();
    encoder.shutdown().await.unwrap();
    encoder.into_inner()
}

/// A project directory with a lock file and a mirror directory.
pub struct Project {
    pub dir: TempDir,
}

impl Project {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn lockfile(&self) -> PathBuf {
        self.dir.path().join("package-lock.json")
    }

    pub fn mirror(&self) -> PathBuf {
        self.dir.path().join("mirror")
    }

    pub fn entry(&self, name: &str) -> PathBuf {
        self.mirror().join(name)
    }

    pub async fn write_lock(&self, lock: &Value) {
        let mut text = serde_json::to_string_pretty(lock).unwrap();
        text.push('\n');
        tokio::fs::write(self.lockfile(), text).await.unwrap();
    }

    pub async fn read_lock_text(&self) -> String {
        tokio::fs::read_to_string(self.lockfile()).await.unwrap()
    }

    pub async fn read_lock(&self) -> Value {
        serde_json::from_str(&self.read_lock_text().await).unwrap()
    }

    pub async fn seed_entry(&self, name: &str, contents: &[u8]) {
        tokio::fs::create_dir_all(self.mirror()).await.unwrap();
        tokio::fs::write(self.entry(name), contents).await.unwrap();
    }

    pub async fn mirror_files(&self) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.mirror()).await else {
            return names;
        };
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    pub fn reconciler(&self, registries: RegistrySettings) -> Reconciler {
        let config = MirrorConfig::from_settings(registries).with_mirror_path(self.mirror());
        Reconciler::new(config, Fetcher::new().unwrap())
    }
}

pub fn file_reference(path: &Path) -> String {
    format!("file:{}", path.display())
}
