//! Windowed rendering math for long message lists.
//!
//! Pure bookkeeping, no rendering: callers report measured item sizes as
//! they appear, and the engine answers which index range a viewport should
//! render plus the pixel offset of any item. Unmeasured items use the
//! estimate, so offsets stay usable before anything has been measured.

use std::collections::HashMap;
use std::ops::Range;

/// Where the target item should land inside the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Alignment {
    Start,
    Center,
    End,
    /// Scroll the minimum distance that makes the item fully visible.
    #[default]
    Auto,
}

pub struct VirtualScroll {
    item_count: usize,
    estimated_size: f64,
    overscan: usize,
    measured: HashMap<usize, f64>,
    /// `prefix[i]` is the offset of item `i`; `prefix[item_count]` is the
    /// total size. Rebuilt lazily after any size change.
    prefix: Vec<f64>,
    dirty: bool,
}

impl VirtualScroll {
    pub fn new(item_count: usize, estimated_size: f64) -> Self {
        Self {
            item_count,
            estimated_size,
            overscan: 3,
            measured: HashMap::new(),
            prefix: Vec::new(),
            dirty: true,
        }
    }

    pub fn with_overscan(mut self, overscan: usize) -> Self {
        self.overscan = overscan;
        self
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn set_item_count(&mut self, item_count: usize) {
        if item_count < self.item_count {
            self.measured.retain(|&i, _| i < item_count);
        }
        self.item_count = item_count;
        self.dirty = true;
    }

    /// Report the real rendered size of one item.
    pub fn record_measured(&mut self, index: usize, size: f64) {
        if index >= self.item_count || !size.is_finite() || size < 0.0 {
            return;
        }
        if self.measured.insert(index, size) != Some(size) {
            self.dirty = true;
        }
    }

    pub fn size_of(&self, index: usize) -> f64 {
        self.measured.get(&index).copied().unwrap_or(self.estimated_size)
    }

    fn rebuild(&mut self) {
        if !self.dirty {
            return;
        }
        self.prefix.clear();
        self.prefix.reserve(self.item_count + 1);
        let mut offset = 0.0;
        self.prefix.push(0.0);
        for index in 0..self.item_count {
            offset += self.size_of(index);
            self.prefix.push(offset);
        }
        self.dirty = false;
    }

    pub fn total_size(&mut self) -> f64 {
        self.rebuild();
        self.prefix.last().copied().unwrap_or(0.0)
    }

    /// Offset of the top edge of `index`, clamped to the end of the list.
    pub fn offset_of(&mut self, index: usize) -> f64 {
        self.rebuild();
        let index = index.min(self.item_count);
        self.prefix[index]
    }

    /// Indices a viewport at `scroll_offset` should render, overscan
    /// included, clamped to the list bounds.
    pub fn visible_range(&mut self, scroll_offset: f64, viewport_size: f64) -> Range<usize> {
        self.rebuild();
        if self.item_count == 0 || viewport_size <= 0.0 {
            return 0..0;
        }
        let scroll_offset = scroll_offset.max(0.0);
        let bottom = scroll_offset + viewport_size;

        // First item whose bottom edge is below the top of the viewport.
        let first = self.prefix[1..=self.item_count]
            .partition_point(|&end| end <= scroll_offset);
        // One past the last item whose top edge is above the bottom edge.
        let last = self.prefix[..self.item_count].partition_point(|&start| start < bottom);

        let first = first.saturating_sub(self.overscan);
        let last = (last + self.overscan).min(self.item_count);
        first..last.max(first)
    }

    /// Scroll offset that places `index` per `alignment`, clamped so the
    /// viewport never runs past either end of the list.
    pub fn scroll_to(
        &mut self,
        index: usize,
        alignment: Alignment,
        viewport_size: f64,
        current_offset: f64,
    ) -> f64 {
        if self.item_count == 0 {
            return 0.0;
        }
        let index = index.min(self.item_count - 1);
        let top = self.offset_of(index);
        let size = self.size_of(index);
        let total = self.total_size();

        let target = match alignment {
            Alignment::Start => top,
            Alignment::Center => top + size / 2.0 - viewport_size / 2.0,
            Alignment::End => top + size - viewport_size,
            Alignment::Auto => {
                if top < current_offset {
                    top
                } else if top + size > current_offset + viewport_size {
                    top + size - viewport_size
                } else {
                    current_offset
                }
            }
        };
        target.clamp(0.0, (total - viewport_size).max(0.0))
    }
}
