//! Pagination utilities.
//!
//! Pages are built greedily from measured paragraph heights: paragraphs are
//! stacked into a column until the next one would overflow it, a second
//! column is filled in two-column mode, and then a new page starts. Paragraphs
//! are never split. Hosts that cannot measure rendered text can fall back to
//! `estimate_heights`, which approximates heights from font metrics.

use crate::model::Paragraph;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use tracing::{debug, warn};
use ts_rs::TS;

/// Minimum allowed font size (points).
pub const MIN_FONT_SIZE: u32 = 12;
/// Maximum allowed font size (points).
pub const MAX_FONT_SIZE: u32 = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum ColumnMode {
    #[default]
    Single,
    TwoColumn,
}

impl ColumnMode {
    pub fn columns(self) -> usize {
        match self {
            ColumnMode::Single => 1,
            ColumnMode::TwoColumn => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportMetrics {
    pub width: f32,
    pub height: f32,
    pub column_gap: f32,
}

impl ViewportMetrics {
    /// Usable column height, or `None` when the viewport was not measured.
    pub fn column_height(&self) -> Option<f32> {
        (self.height.is_finite() && self.height > 0.0).then_some(self.height)
    }

    pub fn column_width(&self, mode: ColumnMode) -> Option<f32> {
        if !self.width.is_finite() || self.width <= 0.0 {
            return None;
        }
        let columns = mode.columns() as f32;
        let gaps = self.column_gap.max(0.0) * (columns - 1.0);
        Some(((self.width - gaps) / columns).max(1.0))
    }
}

/// Inclusive paragraph index range occupying one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ParagraphRange {
    pub start: usize,
    pub end: usize,
}

impl ParagraphRange {
    pub fn contains(&self, paragraph: usize) -> bool {
        (self.start..=self.end).contains(&paragraph)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Page {
    pub columns: Vec<ParagraphRange>,
}

impl Page {
    fn single(start: usize, end: usize) -> Self {
        Self {
            columns: vec![ParagraphRange { start, end }],
        }
    }

    pub fn start(&self) -> Option<usize> {
        self.columns.first().map(|range| range.start)
    }

    pub fn end(&self) -> Option<usize> {
        self.columns.last().map(|range| range.end)
    }

    pub fn paragraphs(&self) -> Option<RangeInclusive<usize>> {
        Some(self.start()?..=self.end()?)
    }

    pub fn contains(&self, paragraph: usize) -> bool {
        self.columns.iter().any(|range| range.contains(paragraph))
    }
}

/// Split measured paragraphs into pages for the given viewport.
///
/// Heights that are not finite or negative count as zero. An unmeasurable
/// viewport yields a single page with every paragraph.
pub fn compute_layout(
    heights: &[f32],
    viewport: Option<&ViewportMetrics>,
    mode: ColumnMode,
) -> Vec<Page> {
    if heights.is_empty() {
        return vec![Page::default()];
    }
    let last = heights.len() - 1;
    let Some(available) = viewport.and_then(ViewportMetrics::column_height) else {
        warn!(
            paragraphs = heights.len(),
            "Viewport not measurable; using a single page"
        );
        return vec![Page::single(0, last)];
    };

    let max_columns = mode.columns();
    let mut pages = Vec::new();
    let mut columns: Vec<ParagraphRange> = Vec::new();
    let mut column_start = 0usize;
    let mut used = 0.0f32;

    for (idx, raw) in heights.iter().copied().enumerate() {
        let height = if raw.is_finite() && raw > 0.0 { raw } else { 0.0 };

        if height > available {
            // Oversized paragraphs stand alone on their own page.
            if idx > column_start {
                columns.push(ParagraphRange {
                    start: column_start,
                    end: idx - 1,
                });
            }
            if !columns.is_empty() {
                pages.push(Page {
                    columns: std::mem::take(&mut columns),
                });
            }
            pages.push(Page::single(idx, idx));
            column_start = idx + 1;
            used = 0.0;
            continue;
        }

        if idx > column_start && used + height > available {
            columns.push(ParagraphRange {
                start: column_start,
                end: idx - 1,
            });
            if columns.len() == max_columns {
                pages.push(Page {
                    columns: std::mem::take(&mut columns),
                });
            }
            column_start = idx;
            used = 0.0;
        }
        used += height;
    }

    if column_start <= last {
        columns.push(ParagraphRange {
            start: column_start,
            end: last,
        });
    }
    if !columns.is_empty() {
        pages.push(Page { columns });
    }

    debug!(
        paragraphs = heights.len(),
        pages = pages.len(),
        columns = max_columns,
        "Computed chapter layout"
    );
    pages
}

/// Index of the page containing `paragraph`, if any.
pub fn page_for_paragraph(pages: &[Page], paragraph: usize) -> Option<usize> {
    pages.iter().position(|page| page.contains(paragraph))
}

/// Font metrics used to approximate rendered paragraph heights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextMetrics {
    pub font_size: f32,
    pub line_spacing: f32,
    pub paragraph_spacing: f32,
}

/// Approximate paragraph heights for a column of the given width.
///
/// Average glyph width is taken as half the font size, which is close enough
/// for proportional fonts to keep page breaks stable.
pub fn estimate_heights(paragraphs: &[Paragraph], metrics: &TextMetrics, column_width: f32) -> Vec<f32> {
    let font_size = metrics
        .font_size
        .clamp(MIN_FONT_SIZE as f32, MAX_FONT_SIZE as f32);
    let chars_per_line = (column_width / (font_size * 0.5)).floor().max(1.0) as usize;
    let line_height = font_size * metrics.line_spacing.max(1.0);

    paragraphs
        .iter()
        .map(|paragraph| {
            let chars = paragraph.content.trim().chars().count();
            let lines = chars.div_ceil(chars_per_line).max(1);
            lines as f32 * line_height + metrics.paragraph_spacing.max(0.0)
        })
        .collect()
}
