//! Clip discovery on disk and the append-only annotation log.
//!
//! Layout:
//! - `<root>/*.wav` is the default pool.
//! - `<root>/<pool>/*.wav` are named pools (also used for per-user selections).
//! - `<stem>.ai.json` next to a clip carries model suggestions for it.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use clipmark::clip::AiClass;
use clipmark::region::SuggestedRegion;
use clipmark::submission::AnnotationSubmission;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipEntry {
    /// `<stem>` for the default pool, `<pool>/<stem>` otherwise.
    pub id: String,
    /// Path relative to the library root.
    pub rel_path: String,
    pub path: PathBuf,
}

/// Model assistance stored next to a clip.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSidecar {
    #[serde(default)]
    pub classes: Vec<AiClass>,
    #[serde(default)]
    pub regions: Vec<SuggestedRegion>,
    #[serde(default)]
    pub interface_version: Option<u32>,
}

pub struct ClipLibrary {
    root: PathBuf,
}

impl ClipLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `name` is an existing pool directory.
    pub async fn has_pool(&self, name: &str) -> bool {
        if !is_valid_pool_name(name) {
            return false;
        }
        tokio::fs::metadata(self.root.join(name))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Every WAV clip in a pool (or the default pool), sorted by id.
    pub async fn list(&self, pool: Option<&str>) -> Result<Vec<ClipEntry>> {
        let dir = match pool {
            Some(name) if !is_valid_pool_name(name) => return Ok(Vec::new()),
            Some(name) => self.root.join(name),
            None => self.root.clone(),
        };

        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to list {}", dir.display()));
            }
        };

        let mut clips = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let is_wav = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
            if !is_wav || !entry.file_type().await?.is_file() {
                continue;
            }
            let (Some(stem), Some(file_name)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.file_name().and_then(|s| s.to_str()),
            ) else {
                continue;
            };

            let (id, rel_path) = match pool {
                Some(name) => (format!("{name}/{stem}"), format!("{name}/{file_name}")),
                None => (stem.to_owned(), file_name.to_owned()),
            };
            clips.push(ClipEntry { id, rel_path, path });
        }

        clips.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(clips)
    }

    /// Read `<stem>.ai.json` for a clip. Missing sidecars are normal; broken ones are logged.
    pub async fn load_sidecar(&self, clip: &ClipEntry) -> Option<AiSidecar> {
        let path = clip.path.with_extension("ai.json");
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read AI sidecar");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(sidecar) => Some(sidecar),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring malformed AI sidecar");
                None
            }
        }
    }
}

fn is_valid_pool_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

/// One line of the annotation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAnnotation {
    pub received_at: u64,
    #[serde(flatten)]
    pub submission: AnnotationSubmission,
}

/// Which users annotated which clips.
pub type AnnotatedIndex = HashMap<String, HashSet<String>>;

/// Submissions appended as JSON lines.
pub struct AnnotationStore {
    path: PathBuf,
    index: Mutex<AnnotatedIndex>,
}

impl AnnotationStore {
    /// Open the log at `path`, rebuilding the annotated index from existing lines.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut index = AnnotatedIndex::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for (line_no, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<StoredAnnotation>(line) {
                        Ok(stored) => {
                            index
                                .entry(stored.submission.audio_file_id.to_string())
                                .or_default()
                                .insert(stored.submission.annotated_by);
                        }
                        Err(err) => {
                            warn!(line = line_no + 1, error = %err, "skipping unreadable annotation line");
                        }
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read annotation log {}", path.display()));
            }
        }

        debug!(clips = index.len(), path = %path.display(), "annotation log opened");
        Ok(Self {
            path,
            index: Mutex::new(index),
        })
    }

    pub async fn append(&self, submission: AnnotationSubmission) -> Result<()> {
        let stored = StoredAnnotation {
            received_at: now_ms(),
            submission,
        };
        let mut line = serde_json::to_vec(&stored)?;
        line.push(b'\n');

        // Holding the index lock serializes writers.
        let mut index = self.index.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open annotation log {}", self.path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;

        index
            .entry(stored.submission.audio_file_id.to_string())
            .or_default()
            .insert(stored.submission.annotated_by);
        Ok(())
    }

    pub async fn index(&self) -> AnnotatedIndex {
        self.index.lock().await.clone()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
