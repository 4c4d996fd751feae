//! Chapter index: ordered storage and lookup over committed chapters.
//!
//! `append` is the only mutator. It validates numbering and turn contiguity
//! before the chapter becomes visible, and the shared wrapper swaps it in
//! under a single write lock, so readers never see a half-built chapter.

use crate::chapter::{Chapter, ChapterNumber, ChapterPreview};
use crate::error::IndexError;
use parking_lot::RwLock;
use std::sync::Arc;

/// Ordered collection of committed chapters.
///
/// Cloning is cheap (chapters are reference counted), so a clone serves as a
/// consistent snapshot for a retrieval in flight.
#[derive(Debug, Clone, Default)]
pub struct ChapterIndex {
    chapters: Vec<Arc<Chapter>>,
}

impl ChapterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed chapters.
    pub fn count(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    /// Previews of every chapter in order.
    pub fn list(&self) -> Vec<ChapterPreview> {
        self.chapters.iter().map(|c| c.preview()).collect()
    }

    /// Previews of chapters matching a search term.
    pub fn search(&self, term: &str) -> Vec<ChapterPreview> {
        self.chapters
            .iter()
            .filter(|c| c.matches(term))
            .map(|c| c.preview())
            .collect()
    }

    /// Get a chapter by number.
    pub fn get(&self, number: ChapterNumber) -> Result<Arc<Chapter>, IndexError> {
        let count = self.count();
        if number == 0 || number as usize > count {
            return Err(IndexError::NotFound { number, count });
        }
        Ok(Arc::clone(&self.chapters[number as usize - 1]))
    }

    /// Get chapters `start..=end`, requiring `1 <= start <= end <= count`.
    pub fn get_range(
        &self,
        start: ChapterNumber,
        end: ChapterNumber,
    ) -> Result<Vec<Arc<Chapter>>, IndexError> {
        let count = self.count();
        if start == 0 || start > end || end as usize > count {
            return Err(IndexError::InvalidRange { start, end, count });
        }
        Ok(self.chapters[start as usize - 1..end as usize].to_vec())
    }

    /// The most recently committed chapter.
    pub fn last(&self) -> Option<&Arc<Chapter>> {
        self.chapters.last()
    }

    /// Transcript position of the last turn covered by a chapter (0 if none).
    pub fn covered_through(&self) -> u64 {
        self.last().map_or(0, |c| c.end_position)
    }

    /// Number the next chapter must carry.
    pub fn next_number(&self) -> ChapterNumber {
        self.chapters.len() as ChapterNumber + 1
    }

    /// Which chapter a transcript position belongs to, if any.
    pub fn chapter_of(&self, position: u64) -> Option<ChapterNumber> {
        if position == 0 || position > self.covered_through() {
            return None;
        }
        let idx = self
            .chapters
            .partition_point(|c| c.end_position < position);
        self.chapters.get(idx).map(|c| c.number)
    }

    /// Append a chapter, enforcing numbering and contiguity.
    pub fn append(&mut self, chapter: Chapter) -> Result<Arc<Chapter>, IndexError> {
        let expected_number = self.next_number();
        if chapter.number != expected_number {
            return Err(IndexError::OutOfSequence {
                reason: format!(
                    "expected chapter number {expected_number}, got {}",
                    chapter.number
                ),
            });
        }

        let expected_start = self.covered_through() + 1;
        if chapter.start_position != expected_start {
            return Err(IndexError::OutOfSequence {
                reason: format!(
                    "chapter {} starts at turn {}, expected turn {expected_start}",
                    chapter.number, chapter.start_position
                ),
            });
        }

        if chapter.end_position < chapter.start_position
            || chapter.turn_count != chapter.end_position - chapter.start_position + 1
        {
            return Err(IndexError::OutOfSequence {
                reason: format!(
                    "chapter {} has inconsistent bounds {}-{} for {} turns",
                    chapter.number, chapter.start_position, chapter.end_position, chapter.turn_count
                ),
            });
        }

        let chapter = Arc::new(chapter);
        self.chapters.push(Arc::clone(&chapter));
        Ok(chapter)
    }
}

/// Chapter index shared between the single writer and many readers.
#[derive(Debug, Clone, Default)]
pub struct SharedIndex {
    inner: Arc<RwLock<ChapterIndex>>,
}

impl SharedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// A consistent copy of the index as of now.
    pub fn snapshot(&self) -> ChapterIndex {
        self.inner.read().clone()
    }

    pub fn count(&self) -> usize {
        self.inner.read().count()
    }

    pub fn covered_through(&self) -> u64 {
        self.inner.read().covered_through()
    }

    /// Validate and commit a fully built chapter.
    pub fn append(&self, chapter: Chapter) -> Result<Arc<Chapter>, IndexError> {
        self.inner.write().append(chapter)
    }
}
