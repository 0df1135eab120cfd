//! In-memory domain enums backing the `TEXT CHECK (...)` columns (§3).
//! Kept as exhaustive-match enums at the Rust boundary so a typo in a
//! status string is a compile error, not a runtime one.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnVariant {
    Rcv,
    Snd,
    Duplex,
    Contact,
}

impl ConnVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rcv => "rcv",
            Self::Snd => "snd",
            Self::Duplex => "duplex",
            Self::Contact => "contact",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rcv" => Some(Self::Rcv),
            "snd" => Some(Self::Snd),
            "duplex" => Some(Self::Duplex),
            "contact" => Some(Self::Contact),
            _ => None,
        }
    }
}

impl fmt::Display for ConnVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RcvQueueStatus {
    New,
    Confirmed,
    Secured,
    Active,
    Disabled,
}

impl RcvQueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Confirmed => "confirmed",
            Self::Secured => "secured",
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "confirmed" => Some(Self::Confirmed),
            "secured" => Some(Self::Secured),
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }

    /// §3 invariant: status transitions are monotone.
    pub fn can_advance_to(&self, next: Self) -> bool {
        next > *self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SndQueueStatus {
    New,
    Confirmed,
    Active,
    Disabled,
}

impl SndQueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Confirmed => "confirmed",
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "confirmed" => Some(Self::Confirmed),
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }

    pub fn can_advance_to(&self, next: Self) -> bool {
        next > *self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationAction {
    CreateNext,
    SecureNext,
    SuspendCurrent,
    DeleteCurrent,
}

impl RotationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateNext => "create_next",
            Self::SecureNext => "secure_next",
            Self::SuspendCurrent => "suspend_current",
            Self::DeleteCurrent => "delete_current",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create_next" => Some(Self::CreateNext),
            "secure_next" => Some(Self::SecureNext),
            "suspend_current" => Some(Self::SuspendCurrent),
            "delete_current" => Some(Self::DeleteCurrent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    ConnInfo,
    Hello,
    Reply,
    AMsg,
    QNew,
    QKeys,
    QReady,
    QTest,
    QSwitch,
    QHello,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnInfo => "conn-info",
            Self::Hello => "hello",
            Self::Reply => "reply",
            Self::AMsg => "a-msg",
            Self::QNew => "q-new",
            Self::QKeys => "q-keys",
            Self::QReady => "q-ready",
            Self::QTest => "q-test",
            Self::QSwitch => "q-switch",
            Self::QHello => "q-hello",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "conn-info" => Some(Self::ConnInfo),
            "hello" => Some(Self::Hello),
            "reply" => Some(Self::Reply),
            "a-msg" => Some(Self::AMsg),
            "q-new" => Some(Self::QNew),
            "q-keys" => Some(Self::QKeys),
            "q-ready" => Some(Self::QReady),
            "q-test" => Some(Self::QTest),
            "q-switch" => Some(Self::QSwitch),
            "q-hello" => Some(Self::QHello),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NtfTokenStatus {
    None,
    Registered,
    Confirmed,
    Active,
    Expired,
}

impl NtfTokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Registered => "registered",
            Self::Confirmed => "confirmed",
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "registered" => Some(Self::Registered),
            "confirmed" => Some(Self::Confirmed),
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NtfMode {
    Instant,
    Periodic,
}

impl NtfMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instant => "instant",
            Self::Periodic => "periodic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "instant" => Some(Self::Instant),
            "periodic" => Some(Self::Periodic),
            _ => None,
        }
    }
}
