use std::fmt;

use serde::{Deserialize, Serialize};

/// Privilege stored on an access row. Ordering follows the level, so the
/// higher of two grants is simply their `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Privilege {
    None = 0,
    Read = 1,
    Write = 2,
}

impl Privilege {
    #[must_use]
    pub const fn level(self) -> i64 {
        self as i64
    }

    #[must_use]
    pub const fn allows_read(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }

    #[must_use]
    pub const fn allows_write(self) -> bool {
        matches!(self, Self::Write)
    }

    /// Parses the route keyword used on the access page.
    pub fn parse(s: &str) -> Option<Privilege> {
        match s {
            "none" => Some(Self::None),
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i64> for Privilege {
    type Error = i64;

    fn try_from(level: i64) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::None),
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            other => Err(other),
        }
    }
}

impl From<Privilege> for i64 {
    fn from(p: Privilege) -> Self {
        p.level()
    }
}
