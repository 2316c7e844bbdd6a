//! Framebuffer Damage Tracking
//!
//! The display host repaints only what changed. Every store into the
//! framebuffer region grows a dirty rectangle; the host takes the rectangle
//! between execution slices, repaints those words, and the tracker starts
//! over empty.
//!
//! Coordinates are in framebuffer **words** (32 one-bit pixels each), not
//! pixels: `x` is the word column, `y` the scan line.

use serde::Serialize;

/// An inclusive dirty rectangle in framebuffer-word coordinates.
///
/// The rectangle is empty when `x1 > x2` or `y1 > y2`; [`DamageTracker::take`]
/// returns the empty sentinel `(width, 0, height, 0)` when nothing was
/// stored since the previous take.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Damage {
    pub x1: u32,
    pub x2: u32,
    pub y1: u32,
    pub y2: u32,
}

impl Damage {
    /// Returns true if the rectangle covers no words.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.x1 > self.x2 || self.y1 > self.y2
    }
}

/// Accumulates the dirty rectangle over framebuffer stores.
pub struct DamageTracker {
    width: u32,
    height: u32,
    dirty: Damage,
}

impl DamageTracker {
    /// Creates a tracker for a `width` × `height` word grid, initially
    /// fully dirty so the first frame repaints everything.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        let mut tracker = Self {
            width,
            height,
            dirty: Damage {
                x1: width,
                x2: 0,
                y1: height,
                y2: 0,
            },
        };
        tracker.mark_all();
        tracker
    }

    /// Marks the whole screen dirty (used at reset).
    pub fn mark_all(&mut self) {
        self.dirty = Damage {
            x1: 0,
            x2: self.width - 1,
            y1: 0,
            y2: self.height - 1,
        };
    }

    /// Grows the rectangle to include the framebuffer word at linear index
    /// `w` (words past the display base). Stores beyond the visible lines
    /// land in guest scratch space and leave the rectangle alone.
    pub fn mark_word(&mut self, w: u32) {
        let row = w / self.width;
        let col = w % self.width;
        if row >= self.height {
            return;
        }
        if col < self.dirty.x1 {
            self.dirty.x1 = col;
        }
        if col > self.dirty.x2 {
            self.dirty.x2 = col;
        }
        if row < self.dirty.y1 {
            self.dirty.y1 = row;
        }
        if row > self.dirty.y2 {
            self.dirty.y2 = row;
        }
    }

    /// Returns the accumulated rectangle and resets to the empty sentinel.
    pub fn take(&mut self) -> Damage {
        std::mem::replace(
            &mut self.dirty,
            Damage {
                x1: self.width,
                x2: 0,
                y1: self.height,
                y2: 0,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tracker_is_fully_dirty() {
        let mut t = DamageTracker::new(32, 768);
        let d = t.take();
        assert_eq!(
            d,
            Damage {
                x1: 0,
                x2: 31,
                y1: 0,
                y2: 767
            }
        );
    }

    #[test]
    fn test_take_resets_to_empty_sentinel() {
        let mut t = DamageTracker::new(32, 768);
        t.take();
        let d = t.take();
        assert_eq!(
            d,
            Damage {
                x1: 32,
                x2: 0,
                y1: 768,
                y2: 0
            }
        );
        assert!(d.is_empty());
    }

    #[test]
    fn test_single_store_yields_unit_rect() {
        let mut t = DamageTracker::new(32, 768);
        t.take();
        t.mark_word(32 * 10 + 5);
        let d = t.take();
        assert_eq!(
            d,
            Damage {
                x1: 5,
                x2: 5,
                y1: 10,
                y2: 10
            }
        );
        assert!(!d.is_empty());
    }

    #[test]
    fn test_rect_grows_to_cover_all_stores() {
        let mut t = DamageTracker::new(32, 768);
        t.take();
        t.mark_word(32 * 10 + 5);
        t.mark_word(32 * 2 + 20);
        t.mark_word(32 * 100);
        let d = t.take();
        assert_eq!(
            d,
            Damage {
                x1: 0,
                x2: 20,
                y1: 2,
                y2: 100
            }
        );
    }

    #[test]
    fn test_stores_past_visible_lines_are_ignored() {
        let mut t = DamageTracker::new(32, 768);
        t.take();
        t.mark_word(32 * 768);
        t.mark_word(32 * 1000 + 7);
        assert!(t.take().is_empty());
    }

    #[test]
    fn test_mark_all_after_take() {
        let mut t = DamageTracker::new(32, 768);
        t.take();
        t.mark_all();
        let d = t.take();
        assert_eq!(d.x2, 31);
        assert_eq!(d.y2, 767);
    }
}
