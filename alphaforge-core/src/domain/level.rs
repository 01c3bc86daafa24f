use serde::{Deserialize, Serialize};
use std::fmt;

/// Generation order of a candidate.
///
/// `Template` covers expressions that did not come out of the three-level
/// ladder: direct template expansions and records first seen on the
/// simulation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Level {
    Template = 0,
    First = 1,
    Second = 2,
    Third = 3,
}

impl Level {
    pub const LADDER: [Level; 3] = [Level::First, Level::Second, Level::Third];

    /// Name used in batch numbers.
    pub fn name(self) -> &'static str {
        match self {
            Level::Template => "template",
            Level::First => "first_level",
            Level::Second => "second_level",
            Level::Third => "third_level",
        }
    }

    /// Level whose promoted candidates feed this one.
    pub fn parent(self) -> Option<Level> {
        match self {
            Level::Second => Some(Level::First),
            Level::Third => Some(Level::Second),
            Level::Template | Level::First => None,
        }
    }

    /// Template field the level's primary input is bound to.
    pub fn input_field(self) -> &'static str {
        match self {
            Level::Template | Level::First => "data_field",
            Level::Second => "sig1",
            Level::Third => "sig2",
        }
    }
}

impl From<Level> for u8 {
    fn from(level: Level) -> u8 {
        level as u8
    }
}

impl TryFrom<u8> for Level {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Level::Template),
            1 => Ok(Level::First),
            2 => Ok(Level::Second),
            3 => Ok(Level::Third),
            other => Err(format!("unknown level {other}")),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
