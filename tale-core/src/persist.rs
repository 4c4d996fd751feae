//! Chapter persistence.
//!
//! Chapters are immutable once committed, so a store only ever writes a
//! chapter once. [`JsonChapterStore`] keeps one human-readable JSON file per
//! chapter, tagged with a format version.

use crate::chapter::{Chapter, ChapterNumber};
use crate::error::PersistError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Current chapter file version.
const SAVE_VERSION: u32 = 1;

/// Durable storage for committed chapters.
#[async_trait]
pub trait ChapterStore: Send + Sync {
    async fn save(&self, chapter: &Chapter) -> Result<(), PersistError>;

    /// Load a chapter, or `None` if it was never saved.
    async fn load(&self, number: ChapterNumber) -> Result<Option<Chapter>, PersistError>;

    /// Every saved chapter, ordered by number.
    async fn load_all(&self) -> Result<Vec<Chapter>, PersistError>;
}

/// Store that keeps chapters in memory.
#[derive(Debug, Default)]
pub struct InMemoryChapterStore {
    chapters: RwLock<BTreeMap<ChapterNumber, Chapter>>,
}

impl InMemoryChapterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.read().is_empty()
    }
}

#[async_trait]
impl ChapterStore for InMemoryChapterStore {
    async fn save(&self, chapter: &Chapter) -> Result<(), PersistError> {
        self.chapters.write().insert(chapter.number, chapter.clone());
        Ok(())
    }

    async fn load(&self, number: ChapterNumber) -> Result<Option<Chapter>, PersistError> {
        Ok(self.chapters.read().get(&number).cloned())
    }

    async fn load_all(&self) -> Result<Vec<Chapter>, PersistError> {
        Ok(self.chapters.read().values().cloned().collect())
    }
}

/// On-disk form of a chapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedChapter {
    /// Save format version for compatibility checking.
    version: u32,
    chapter: Chapter,
}

/// Store writing `chapter-NNNN.json` files into a directory.
#[derive(Debug, Clone)]
pub struct JsonChapterStore {
    dir: PathBuf,
}

impl JsonChapterStore {
    /// Use `dir`, creating it if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, PersistError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, number: ChapterNumber) -> PathBuf {
        self.dir.join(format!("chapter-{number:04}.json"))
    }

    async fn read_file(path: &Path) -> Result<Chapter, PersistError> {
        let content = fs::read_to_string(path).await?;
        let saved: SavedChapter = serde_json::from_str(&content)?;

        if saved.version != SAVE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SAVE_VERSION,
                found: saved.version,
            });
        }

        Ok(saved.chapter)
    }
}

#[async_trait]
impl ChapterStore for JsonChapterStore {
    async fn save(&self, chapter: &Chapter) -> Result<(), PersistError> {
        let saved = SavedChapter {
            version: SAVE_VERSION,
            chapter: chapter.clone(),
        };
        let content = serde_json::to_string_pretty(&saved)?;

        // Write then rename; readers never see a partial file.
        let path = self.path_for(chapter.number);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        tracing::debug!(chapter = chapter.number, path = %path.display(), "chapter saved");
        Ok(())
    }

    async fn load(&self, number: ChapterNumber) -> Result<Option<Chapter>, PersistError> {
        let path = self.path_for(number);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_file(&path).await.map(Some)
    }

    async fn load_all(&self) -> Result<Vec<Chapter>, PersistError> {
        let mut chapters = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_chapter = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("chapter-") && n.ends_with(".json"));
            if is_chapter {
                chapters.push(Self::read_file(&path).await?);
            }
        }

        chapters.sort_by_key(|c| c.number);
        Ok(chapters)
    }
}
