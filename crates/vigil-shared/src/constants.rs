/// Application name
pub const APP_NAME: &str = "Vigil";

/// Messages requested per page when nothing else is configured
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Upper bound accepted for a configured page size
pub const MAX_PAGE_SIZE: u32 = 200;

/// Distance from the oldest loaded message (in scroll units) below which a
/// user-driven scroll asks for the next older page
pub const DEFAULT_NEAR_TOP_THRESHOLD: f64 = 24.0;

/// Offset a programmatic "scroll to top" settles at instead of zero
pub const DEFAULT_CORRECTIVE_SCROLL: f64 = 40.0;

/// Largest corrective scroll allowed
pub const MAX_CORRECTIVE_SCROLL: f64 = 100.0;

/// Capacity of command, completion and feed channels
pub const CHANNEL_CAPACITY: usize = 256;

/// Characters kept in a conversation list preview
pub const PREVIEW_MAX_CHARS: usize = 80;

/// Table whose changes the realtime feed publishes
pub const MESSAGES_TABLE: &str = "messages";
