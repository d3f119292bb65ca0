//! Pagination controller.
//!
//! A small state machine deciding when a Fetch Page call may be issued. Every
//! issued call is identified by a [`PageTicket`]; a ticket from an earlier
//! generation (before a conversation switch or a refetch) no longer matches
//! and its result must be discarded.

use std::fmt;

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationState {
    #[default]
    Idle,
    LoadingInitial,
    LoadingMore,
    /// No older messages remain. Left only by a reset.
    Exhausted,
    /// The first page failed. Left by a reset or a manual refetch.
    Failed,
}

impl PaginationState {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::LoadingInitial | Self::LoadingMore)
    }
}

impl fmt::Display for PaginationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::LoadingInitial => "loading_initial",
            Self::LoadingMore => "loading_more",
            Self::Exhausted => "exhausted",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Initial,
    Older,
}

/// Identifies one issued Fetch Page call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTicket {
    pub generation: u64,
    pub kind: PageKind,
    pub offset: u32,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct PaginationController {
    state: PaginationState,
    generation: u64,
    page_size: u32,
}

impl PaginationController {
    pub fn new(page_size: u32) -> Self {
        Self {
            state: PaginationState::Idle,
            generation: 0,
            page_size: page_size.max(1),
        }
    }

    pub fn state(&self) -> PaginationState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Back to idle under a new generation. Outstanding tickets go stale.
    pub fn reset(&mut self) -> u64 {
        self.generation += 1;
        self.state = PaginationState::Idle;
        self.generation
    }

    /// Request the first page. Only allowed from `Idle` or `Failed`.
    pub fn begin_initial(&mut self) -> Option<PageTicket> {
        if !matches!(self.state, PaginationState::Idle | PaginationState::Failed) {
            debug!(state = %self.state, "Initial page not started");
            return None;
        }

        self.state = PaginationState::LoadingInitial;
        Some(PageTicket {
            generation: self.generation,
            kind: PageKind::Initial,
            offset: 0,
            limit: self.page_size,
        })
    }

    /// Request the next older page. Rejected, not queued, unless the
    /// controller is idle and older messages remain.
    pub fn begin_more(&mut self, has_more: bool, offset: u32) -> Option<PageTicket> {
        if self.state != PaginationState::Idle || !has_more {
            debug!(state = %self.state, has_more, "Older page not started");
            return None;
        }

        self.state = PaginationState::LoadingMore;
        Some(PageTicket {
            generation: self.generation,
            kind: PageKind::Older,
            offset,
            limit: self.page_size,
        })
    }

    /// Whether `ticket` belongs to the call currently in flight.
    pub fn is_current(&self, ticket: &PageTicket) -> bool {
        ticket.generation == self.generation
            && match ticket.kind {
                PageKind::Initial => self.state == PaginationState::LoadingInitial,
                PageKind::Older => self.state == PaginationState::LoadingMore,
            }
    }

    /// Settle a successful call. Returns `false` for a stale ticket.
    pub fn complete(&mut self, ticket: &PageTicket, has_more: bool) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        self.state = if has_more {
            PaginationState::Idle
        } else {
            PaginationState::Exhausted
        };
        true
    }

    /// Settle a failed call. A failed first page blocks; a failed older page
    /// leaves the controller idle so the consumer can try again. Returns
    /// `false` for a stale ticket.
    pub fn fail(&mut self, ticket: &PageTicket) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        self.state = match ticket.kind {
            PageKind::Initial => PaginationState::Failed,
            PageKind::Older => PaginationState::Idle,
        };
        true
    }
}
