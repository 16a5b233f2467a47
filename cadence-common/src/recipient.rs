use serde::{Deserialize, Serialize};

use crate::ids::RecipientId;

/// A resolved recipient, as returned by the contacts collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub email: String,
    /// IANA timezone, when the contact's locale allowed it to be inferred
    #[serde(default)]
    pub timezone: Option<String>,
}

impl Recipient {
    #[must_use]
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: RecipientId::new(id),
            email: email.into(),
            timezone: None,
        }
    }

    #[must_use]
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }
}
