//! Type-safe wrappers for domain identifiers
//!
//! These newtypes prevent mixing different ID types at compile time.
//! For example, you cannot pass an AccountId where a UserId is expected.
//! Canonical event ids are ULIDs (lexically sortable, assigned exactly once
//! at first ingestion); everything else is a UUID v4.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Canonical event identifier (ULID, immutable after first ingestion)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct CanonicalId(String);

impl CanonicalId {
    /// Mint a fresh ULID-backed canonical id
    pub fn generate() -> Self {
        CanonicalId(ulid::Ulid::new().to_string())
    }

    /// Wrap an already-issued id (from storage or a provider tag)
    pub fn from_string(s: String) -> Self {
        CanonicalId(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
        )]
        #[sqlx(transparent)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                $name(Uuid::new_v4())
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

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                $name(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($name(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// User identifier
    UserId
);
uuid_id!(
    /// External calendar account identifier
    AccountId
);
uuid_id!(
    /// Policy edge identifier
    PolicyEdgeId
);
uuid_id!(
    /// Scheduling session identifier
    SessionId
);
uuid_id!(
    /// Candidate slot identifier
    CandidateId
);
uuid_id!(
    /// Hold identifier
    HoldId
);

/// External calendar provider variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Microsoft,
    /// ICS/CalDAV feeds are read-only sources; no mirror writes are
    /// dispatched to them.
    Ics,
}

impl ProviderKind {
    pub fn supports_writes(self) -> bool {
        !matches!(self, ProviderKind::Ics)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Microsoft => "microsoft",
            ProviderKind::Ics => "ics",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(ProviderKind::Google),
            "microsoft" => Ok(ProviderKind::Microsoft),
            "ics" => Ok(ProviderKind::Ics),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}
