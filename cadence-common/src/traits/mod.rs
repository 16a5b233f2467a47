//! Narrow interfaces to the collaborators the scheduler invokes
//!
//! Contacts, rendering, transport and billing live outside the scheduler.
//! The in-process implementations in [`directory`] back the daemon's
//! dry-run mode and the test suites.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    campaign::ContentRef,
    error::CollaboratorError,
    recipient::Recipient,
    user::{PlanLimits, UserConfig},
};

mod directory;

pub use directory::{ContactDirectory, LoggingTransport, PassthroughRenderer};

#[async_trait]
pub trait Contacts: Send + Sync {
    /// Recipients carrying any of the given tags, each listed once
    async fn resolve_recipients(&self, tags: &[String])
    -> Result<Vec<Recipient>, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        content: &ContentRef,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedContent, CollaboratorError>;
}

/// Result of a single transport call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    /// The provider rejected the recipient outright (hard bounce, invalid address)
    #[serde(default)]
    pub permanent: bool,
}

impl SendResult {
    #[must_use]
    pub fn sent(provider_message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            provider_message_id: Some(provider_message_id.into()),
            error: None,
            permanent: false,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>, permanent: bool) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error: Some(error.into()),
            permanent,
        }
    }
}

/// Email provider. Calls may be slow; callers bound them with a timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_email(&self, recipient: &Recipient, content: &RenderedContent) -> SendResult;
}

/// Billing collaborator: the send caps of the user's current plan
#[async_trait]
pub trait PlanLookup: Send + Sync {
    async fn plan_limits(&self, user: &UserConfig) -> Result<PlanLimits, CollaboratorError>;
}
