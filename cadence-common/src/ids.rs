//! Identifier newtypes
//!
//! Entities owned by the scheduler are keyed by ULIDs, which sort by creation
//! time. Recipient ids come from the contacts collaborator and are opaque.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(ulid::Ulid);

        impl $name {
            /// Generate a fresh identifier
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new())
            }

            /// Parse from the canonical 26 character representation
            pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
                ulid::Ulid::from_string(s).map(Self)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

ulid_id!(
    /// Identifies a campaign
    CampaignId
);
ulid_id!(
    /// Identifies a single schedule entry (one concrete send event)
    EntryId
);
ulid_id!(
    /// Identifies an account holder
    UserId
);
ulid_id!(
    /// Identifies an A/B test
    TestId
);
ulid_id!(
    /// Identifies a variant within an A/B test
    VariantId
);
ulid_id!(
    /// Identifies a user-configured alert rule
    RuleId
);
ulid_id!(
    /// Identifies one row of the send log
    SendId
);

/// Identifies a recipient, as handed out by the contacts collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(String);

impl RecipientId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecipientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecipientId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
