//! Reading position within a book.
//!
//! The cursor only moves inside the chapter whose pages it holds. Moves that
//! leave the chapter come back as [`NavOutcome::ChapterChange`]; the caller
//! loads and paginates the target chapter and then calls
//! [`NavigationCursor::load_chapter`] with the returned [`Seek`].

use crate::pagination::{Page, page_for_paragraph};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Cursor {
    pub chapter_index: usize,
    pub page_index: usize,
    pub paragraph_index: usize,
}

/// Where to land once a chapter's pages are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek {
    Start,
    LastPage,
    LastParagraph,
    Position { page: usize, paragraph: usize },
    Paragraph(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavOutcome {
    Moved,
    Unchanged,
    AtBoundary,
    ChapterChange { chapter_index: usize, seek: Seek },
}

#[derive(Debug, Clone)]
pub struct NavigationCursor {
    chapter_count: usize,
    paragraph_count: usize,
    pages: Vec<Page>,
    cursor: Cursor,
    loaded: bool,
}

impl NavigationCursor {
    pub fn new(chapter_count: usize) -> Self {
        Self {
            chapter_count,
            paragraph_count: 0,
            pages: vec![Page::default()],
            cursor: Cursor::default(),
            loaded: false,
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn paragraph_count(&self) -> usize {
        self.paragraph_count
    }

    pub fn chapter_count(&self) -> usize {
        self.chapter_count
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Whether the cursor sits on the final paragraph of its chapter.
    pub fn at_chapter_end(&self) -> bool {
        self.cursor.paragraph_index + 1 >= self.paragraph_count
    }

    pub fn has_next_chapter(&self) -> bool {
        self.cursor.chapter_index + 1 < self.chapter_count
    }

    /// Chapter and seek to restore a saved position, clamped to this book.
    pub fn resume(&self, saved: Option<Cursor>) -> (usize, Seek) {
        let Some(saved) = saved else {
            return (0, Seek::Start);
        };
        let last = self.chapter_count.saturating_sub(1);
        if saved.chapter_index > last {
            warn!(
                saved = saved.chapter_index,
                chapters = self.chapter_count,
                "Saved chapter out of range; clamping"
            );
            return (last, Seek::Start);
        }
        (
            saved.chapter_index,
            Seek::Position {
                page: saved.page_index,
                paragraph: saved.paragraph_index,
            },
        )
    }

    pub fn goto_chapter(&mut self, index: usize, seek: Seek) -> NavOutcome {
        if self.chapter_count == 0 {
            return NavOutcome::AtBoundary;
        }
        let target = index.min(self.chapter_count - 1);
        if target != index {
            warn!(index, chapters = self.chapter_count, "Chapter index out of range; clamping");
        }
        if self.loaded && target == self.cursor.chapter_index {
            let before = self.cursor;
            self.apply_seek(seek);
            return self.outcome_since(before);
        }
        NavOutcome::ChapterChange {
            chapter_index: target,
            seek,
        }
    }

    /// Install freshly paginated content for `chapter_index`.
    pub fn load_chapter(
        &mut self,
        chapter_index: usize,
        paragraph_count: usize,
        pages: Vec<Page>,
        seek: Seek,
    ) {
        self.cursor.chapter_index = chapter_index.min(self.chapter_count.saturating_sub(1));
        self.paragraph_count = paragraph_count;
        self.pages = if pages.is_empty() {
            vec![Page::default()]
        } else {
            pages
        };
        self.loaded = true;
        self.apply_seek(seek);
        debug!(
            chapter = self.cursor.chapter_index,
            page = self.cursor.page_index,
            paragraph = self.cursor.paragraph_index,
            pages = self.pages.len(),
            "Loaded chapter into cursor"
        );
    }

    /// Replace the page set for the current chapter, keeping the paragraph.
    pub fn relayout(&mut self, pages: Vec<Page>) -> NavOutcome {
        let before = self.cursor;
        self.pages = if pages.is_empty() {
            vec![Page::default()]
        } else {
            pages
        };
        let paragraph = self.cursor.paragraph_index;
        self.apply_seek(Seek::Paragraph(paragraph));
        self.outcome_since(before)
    }

    pub fn next_page(&mut self) -> NavOutcome {
        if self.cursor.page_index + 1 < self.pages.len() {
            let before = self.cursor;
            self.set_page(self.cursor.page_index + 1);
            return self.outcome_since(before);
        }
        self.chapter_forward()
    }

    pub fn prev_page(&mut self) -> NavOutcome {
        if self.cursor.page_index > 0 {
            let before = self.cursor;
            self.set_page(self.cursor.page_index - 1);
            return self.outcome_since(before);
        }
        self.chapter_back(Seek::LastPage)
    }

    pub fn next_paragraph(&mut self) -> NavOutcome {
        if self.cursor.paragraph_index + 1 < self.paragraph_count {
            let before = self.cursor;
            self.apply_seek(Seek::Paragraph(self.cursor.paragraph_index + 1));
            return self.outcome_since(before);
        }
        self.chapter_forward()
    }

    pub fn prev_paragraph(&mut self) -> NavOutcome {
        if self.cursor.paragraph_index > 0 && self.paragraph_count > 0 {
            let before = self.cursor;
            self.apply_seek(Seek::Paragraph(self.cursor.paragraph_index - 1));
            return self.outcome_since(before);
        }
        self.chapter_back(Seek::LastParagraph)
    }

    pub fn next_chapter(&mut self) -> NavOutcome {
        self.chapter_forward()
    }

    pub fn prev_chapter(&mut self) -> NavOutcome {
        self.chapter_back(Seek::Start)
    }

    pub fn seek_paragraph(&mut self, paragraph: usize) -> NavOutcome {
        let before = self.cursor;
        self.apply_seek(Seek::Paragraph(paragraph));
        self.outcome_since(before)
    }

    /// True when the cursor indexes a real page and a paragraph on it.
    pub fn is_valid(&self) -> bool {
        let Some(page) = self.pages.get(self.cursor.page_index) else {
            return false;
        };
        if self.paragraph_count == 0 {
            return self.cursor.paragraph_index == 0;
        }
        self.cursor.paragraph_index < self.paragraph_count && page.contains(self.cursor.paragraph_index)
    }

    fn chapter_forward(&self) -> NavOutcome {
        if self.has_next_chapter() {
            NavOutcome::ChapterChange {
                chapter_index: self.cursor.chapter_index + 1,
                seek: Seek::Start,
            }
        } else {
            NavOutcome::AtBoundary
        }
    }

    fn chapter_back(&self, seek: Seek) -> NavOutcome {
        if self.cursor.chapter_index > 0 {
            NavOutcome::ChapterChange {
                chapter_index: self.cursor.chapter_index - 1,
                seek,
            }
        } else {
            NavOutcome::AtBoundary
        }
    }

    fn set_page(&mut self, page: usize) {
        self.cursor.page_index = page;
        self.cursor.paragraph_index = self.pages[page].start().unwrap_or(0);
        self.clamp();
    }

    fn apply_seek(&mut self, seek: Seek) {
        let last_page = self.pages.len() - 1;
        match seek {
            Seek::Start => self.set_page(0),
            Seek::LastPage => self.set_page(last_page),
            Seek::LastParagraph => {
                self.cursor.paragraph_index = self.paragraph_count.saturating_sub(1);
                self.cursor.page_index =
                    page_for_paragraph(&self.pages, self.cursor.paragraph_index).unwrap_or(last_page);
                self.clamp();
            }
            Seek::Position { page, paragraph } => {
                self.cursor.page_index = page;
                self.cursor.paragraph_index = paragraph;
                self.clamp();
            }
            Seek::Paragraph(paragraph) => {
                let paragraph = paragraph.min(self.paragraph_count.saturating_sub(1));
                self.cursor.paragraph_index = paragraph;
                self.cursor.page_index =
                    page_for_paragraph(&self.pages, paragraph).unwrap_or(self.cursor.page_index);
                self.clamp();
            }
        }
    }

    /// Heal any out-of-range index. Never fails.
    fn clamp(&mut self) {
        let last_page = self.pages.len() - 1;
        if self.cursor.page_index > last_page {
            warn!(
                page = self.cursor.page_index,
                pages = self.pages.len(),
                "Page index out of range; clamping"
            );
            self.cursor.page_index = last_page;
        }

        if self.paragraph_count == 0 {
            self.cursor.paragraph_index = 0;
            self.cursor.page_index = 0;
            return;
        }

        if self.cursor.paragraph_index >= self.paragraph_count {
            warn!(
                paragraph = self.cursor.paragraph_index,
                paragraphs = self.paragraph_count,
                "Paragraph index out of range; clamping"
            );
            self.cursor.paragraph_index = self.paragraph_count - 1;
        }

        let page = &self.pages[self.cursor.page_index];
        if !page.contains(self.cursor.paragraph_index) {
            match page_for_paragraph(&self.pages, self.cursor.paragraph_index) {
                Some(found) => self.cursor.page_index = found,
                None => {
                    warn!(
                        paragraph = self.cursor.paragraph_index,
                        page = self.cursor.page_index,
                        "Paragraph not on any page; snapping to page start"
                    );
                    self.cursor.paragraph_index = page.start().unwrap_or(0);
                }
            }
        }
    }

    fn outcome_since(&self, before: Cursor) -> NavOutcome {
        if before == self.cursor {
            NavOutcome::Unchanged
        } else {
            NavOutcome::Moved
        }
    }
}
