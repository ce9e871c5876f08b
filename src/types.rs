//! Type-safe run direction and handler outcome types
//!
//! The verb travels as a string through environment variables and CLI
//! arguments, so both enums round-trip through strum's `Display`/`EnumString`.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Run direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    /// Provision: stages run in ascending order
    #[default]
    Up,
    /// Decommission: stages run in descending order
    Down,
}

impl Verb {
    /// Get the verb as it appears on the command line and in the databag
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    /// True when stage order must be reversed
    pub const fn is_reverse(self) -> bool {
        matches!(self, Self::Down)
    }
}

/// Outcome reported by a handler for one resource file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum HandlerStatus {
    /// Resource did not exist and was created
    Created,
    /// Resource already exists, nothing to do on up
    Exists,
    /// Resource existed and was removed
    Deleted,
    /// Nothing changed: already absent on down, or a teardown failure was tolerated
    Unchanged,
    /// Handler ran without an existence check
    Applied,
}

impl HandlerStatus {
    /// True if the handler changed remote state
    pub const fn changed(self) -> bool {
        matches!(self, Self::Created | Self::Deleted | Self::Applied)
    }
}
