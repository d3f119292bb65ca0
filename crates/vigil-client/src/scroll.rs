//! Scroll-position reconciliation.
//!
//! Offsets are distances from the oldest loaded message; `0.0` is the very
//! top of the list. A programmatic scroll-to-top settles at the corrective
//! offset instead of `0.0`, and the near-top check stays disarmed until the
//! user touches the list again, so a scroll the app started never reads as
//! the user asking for older messages.

use serde::Serialize;
use tracing::trace;

/// Where the view should scroll.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScrollCommand {
    pub target: f64,
    pub animated: bool,
}

#[derive(Debug, Clone)]
pub struct ScrollReconciler {
    near_top_threshold: f64,
    corrective_scroll: f64,
    offset: Option<f64>,
    programmatic: bool,
}

impl ScrollReconciler {
    /// `corrective_scroll` is expected to exceed `near_top_threshold`; the
    /// configuration layer enforces it.
    pub fn new(near_top_threshold: f64, corrective_scroll: f64) -> Self {
        Self {
            near_top_threshold,
            corrective_scroll,
            offset: None,
            programmatic: false,
        }
    }

    /// Forget the recorded position. Used when the conversation changes.
    pub fn reset(&mut self) {
        self.offset = None;
        self.programmatic = false;
    }

    pub fn offset(&self) -> Option<f64> {
        self.offset
    }

    pub fn is_programmatic(&self) -> bool {
        self.programmatic
    }

    /// Plan a scroll toward the top that never lands at the absolute top.
    ///
    /// The target is the absolute `corrective_scroll` offset rather than a
    /// distance from the recorded position, so the landing point always sits
    /// outside the near-top zone however far down the view was. Returns
    /// `None` when the view already rests within the corrective band.
    pub fn scroll_to_top(&mut self) -> Option<ScrollCommand> {
        if let Some(current) = self.offset {
            if current > 0.0 && current <= self.corrective_scroll {
                trace!(current, "Already near the top, no corrective scroll");
                return None;
            }
        }

        self.programmatic = true;
        Some(ScrollCommand {
            target: self.corrective_scroll,
            animated: true,
        })
    }

    /// Record a scroll position reported by the view. Returns whether the
    /// consumer should ask for the next older page.
    pub fn on_scroll(&mut self, offset: f64) -> bool {
        if !offset.is_finite() {
            return false;
        }
        // Overscroll bounce reports negative offsets.
        let offset = offset.max(0.0);
        self.offset = Some(offset);

        if self.programmatic {
            trace!(offset, "Programmatic scroll, near-top check disarmed");
            return false;
        }
        offset <= self.near_top_threshold
    }

    /// The user started dragging: positions reported from now on are theirs.
    pub fn begin_drag(&mut self) {
        self.programmatic = false;
    }
}
