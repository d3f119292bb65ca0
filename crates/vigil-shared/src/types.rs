use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identity of a chat message. Never reused, never mutated.
    MessageId
);
id_type!(
    /// A conversation (direct, small group, ministry or church-wide).
    ConversationId
);
id_type!(UserId);
id_type!(
    /// The church / organisation scope every query runs under.
    TenantId
);

/// What a message carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    PrayerCard,
    System,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::PrayerCard => "prayer_card",
            Self::System => "system",
        }
    }
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "prayer_card" => Ok(Self::PrayerCard),
            "system" => Ok(Self::System),
            other => Err(format!("unknown content kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    SmallGroup,
    Ministry,
    ChurchWide,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::SmallGroup => "small_group",
            Self::Ministry => "ministry",
            Self::ChurchWide => "church_wide",
        }
    }
}

impl FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "small_group" => Ok(Self::SmallGroup),
            "ministry" => Ok(Self::Ministry),
            "church_wide" => Ok(Self::ChurchWide),
            other => Err(format!("unknown conversation kind: {other}")),
        }
    }
}

/// Which messages of a conversation a window materializes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum MessageScope {
    /// Top-level messages only (the main conversation timeline).
    #[default]
    TopLevel,
    /// The replies of one top-level message (a thread view).
    Replies(MessageId),
}

impl MessageScope {
    /// Whether a message with the given parent belongs to this scope.
    pub fn admits_parent(&self, parent_id: Option<MessageId>) -> bool {
        match self {
            Self::TopLevel => parent_id.is_none(),
            Self::Replies(parent) => parent_id == Some(*parent),
        }
    }

    pub fn parent(&self) -> Option<MessageId> {
        match self {
            Self::TopLevel => None,
            Self::Replies(parent) => Some(*parent),
        }
    }
}
