//! Module lifecycle phases and the legal transitions between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a module as owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModulePhase {
    Announced,
    Preparing,
    Prepared,
    ConfigurationNeeded,
    Configured,
    Ready,
    Failed,
}

impl ModulePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Announced => "announced",
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::ConfigurationNeeded => "configuration-needed",
            Self::Configured => "configured",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Position along the happy path; used to decide what counts as an
    /// "earlier" phase for module-requested re-entry.
    fn ordinal(self) -> u8 {
        match self {
            Self::Announced => 0,
            Self::Preparing => 1,
            Self::Prepared => 2,
            Self::ConfigurationNeeded => 3,
            Self::Configured => 4,
            Self::Ready => 5,
            Self::Failed => u8::MAX,
        }
    }

    /// Transitions the host drives on its own.
    pub fn can_advance_to(self, next: Self) -> bool {
        use ModulePhase::*;
        match (self, next) {
            (Failed, _) => false,
            (_, Failed) => true,
            (Announced, Preparing)
            | (Preparing, Prepared)
            | (Preparing, ConfigurationNeeded)
            | (Prepared, ConfigurationNeeded)
            | (ConfigurationNeeded, Configured)
            | (Configured, Ready)
            | (Prepared, Ready) => true,
            _ => false,
        }
    }

    /// Transitions a module may request through `module:status:change`:
    /// forward steps the host would also take, or re-entry into an earlier
    /// phase from `prepared` onwards.
    pub fn can_request(self, next: Self) -> bool {
        if self.can_advance_to(next) {
            return true;
        }
        !self.is_terminal()
            && !next.is_terminal()
            && self.ordinal() >= Self::Prepared.ordinal()
            && next.ordinal() < self.ordinal()
            && next != Self::Announced
    }
}

impl fmt::Display for ModulePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
