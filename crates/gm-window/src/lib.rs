#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Inclusive range of visible row positions within the presented
/// (filtered and sorted) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRange {
    pub start_index: usize,
    pub end_index: usize,
}

impl WindowRange {
    #[must_use]
    pub fn len(&self) -> usize {
        self.end_index - self.start_index + 1
    }

    /// Always false: a range spans at least one row, the empty case is
    /// `None` at the call sites that produce ranges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        (self.start_index..=self.end_index).contains(&index)
    }
}

/// Pure visible-range math. Fail-soft by construction: out-of-range
/// scroll offsets clamp to the nearest valid window instead of
/// faulting, and an empty row set or degenerate row height yields no
/// window at all.
#[must_use]
pub fn compute_range(
    scroll_offset: f64,
    viewport_height: f64,
    row_height: f64,
    total_rows: usize,
) -> Option<WindowRange> {
    if total_rows == 0 || !row_height.is_finite() || row_height <= 0.0 {
        return None;
    }
    let scroll_offset = if scroll_offset.is_finite() {
        scroll_offset.max(0.0)
    } else {
        0.0
    };
    let viewport_height = if viewport_height.is_finite() {
        viewport_height.max(0.0)
    } else {
        0.0
    };

    // Overscroll past the end clamps the offset itself, so the last
    // window stays viewport-sized instead of shrinking.
    let content_height = total_rows as f64 * row_height;
    let scroll_offset = scroll_offset.min((content_height - viewport_height).max(0.0));

    // Row i covers pixels [i*row, (i+1)*row); any intersection with the
    // viewport [scroll, scroll+viewport) counts, so partially visible
    // rows at both edges are included.
    let start = ((scroll_offset / row_height).floor() as usize).min(total_rows - 1);
    let bottom = scroll_offset + viewport_height;
    let end = ((bottom / row_height).ceil() as usize)
        .saturating_sub(1)
        .clamp(start, total_rows - 1);
    Some(WindowRange {
        start_index: start,
        end_index: end,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPhase {
    /// No rows to present.
    Idle,
    /// The cached range matches the generation it was computed for.
    Stable,
    /// An upstream change invalidated the cached range.
    Stale,
}

/// Window cache keyed by a presentation generation. Invalidation only
/// marks the cache stale; the single recomputation point is
/// [`WindowManager::ensure`], so a burst of upstream changes costs one
/// recompute.
#[derive(Debug, Clone)]
pub struct WindowManager {
    phase: WindowPhase,
    seen_generation: u64,
    current: Option<WindowRange>,
}

impl Default for WindowManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: WindowPhase::Idle,
            seen_generation: 0,
            current: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> WindowPhase {
        self.phase
    }

    #[must_use]
    pub fn current(&self) -> Option<WindowRange> {
        self.current
    }

    /// Mark the cached range stale without recomputing it.
    pub fn invalidate(&mut self) {
        if self.phase == WindowPhase::Stable {
            self.phase = WindowPhase::Stale;
        }
    }

    /// Return the range for `generation`, recomputing only when the
    /// cache is stale or the generation moved on.
    pub fn ensure(
        &mut self,
        generation: u64,
        scroll_offset: f64,
        viewport_height: f64,
        row_height: f64,
        total_rows: usize,
    ) -> Option<WindowRange> {
        if total_rows == 0 {
            self.phase = WindowPhase::Idle;
            self.current = None;
            self.seen_generation = generation;
            return None;
        }
        let fresh = self.phase == WindowPhase::Stable && self.seen_generation == generation;
        if !fresh {
            self.current = compute_range(scroll_offset, viewport_height, row_height, total_rows);
            self.seen_generation = generation;
            self.phase = WindowPhase::Stable;
        }
        self.current
    }
}
