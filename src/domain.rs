//! Domain types shared by the signal pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use zbus::zvariant::OwnedValue;

/// Direction of a unit job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Start,
    Stop,
}

impl Direction {
    /// The opposite direction.
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            Self::Start => Self::Stop,
            Self::Stop => Self::Start,
        }
    }

    /// Get the direction as a lowercase verb.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which service manager owns the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// The calling user's own manager (`systemctl --user`).
    #[default]
    User,
    /// The system-wide manager.
    System,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Match rule fields for a bus subscription. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignalFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
}

impl SignalFilter {
    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        self.sender.is_none()
            && self.path.is_none()
            && self.interface.is_none()
            && self.member.is_none()
    }
}

impl fmt::Display for SignalFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            ("sender", &self.sender),
            ("path", &self.path),
            ("interface", &self.interface),
            ("member", &self.member),
        ];
        let mut first = true;
        for (key, value) in fields {
            if let Some(value) = value {
                if !first {
                    f.write_str(",")?;
                }
                write!(f, "{key}='{value}'")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A signal received on a subscription.
#[derive(Debug)]
pub struct RawSignal {
    /// Object path the signal was emitted from.
    pub path: String,

    pub interface: String,

    /// Signal member name (e.g. "PrepareForSleep").
    pub member: String,

    /// Positional body arguments.
    pub args: Vec<OwnedValue>,
}

impl RawSignal {
    /// Create a new raw signal.
    pub fn new(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        args: Vec<OwnedValue>,
    ) -> Self {
        Self {
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            args,
        }
    }
}
