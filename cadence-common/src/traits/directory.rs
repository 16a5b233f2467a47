use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Contacts, RenderedContent, Renderer, SendResult, Transport};
use crate::{
    campaign::ContentRef, error::CollaboratorError, internal, outgoing, recipient::Recipient,
};

/// In-memory tag to recipient index
#[derive(Debug, Default)]
pub struct ContactDirectory {
    contacts: RwLock<Vec<(Recipient, Vec<String>)>>,
}

impl ContactDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a contact and its tags
    pub fn insert(&self, recipient: Recipient, tags: &[&str]) {
        let tags = tags.iter().map(ToString::to_string).collect();
        let mut contacts = self.contacts.write();
        contacts.retain(|(existing, _)| existing.id != recipient.id);
        contacts.push((recipient, tags));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contacts.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contacts.read().is_empty()
    }
}

#[async_trait]
impl Contacts for ContactDirectory {
    async fn resolve_recipients(
        &self,
        tags: &[String],
    ) -> Result<Vec<Recipient>, CollaboratorError> {
        Ok(self
            .contacts
            .read()
            .iter()
            .filter(|(_, contact_tags)| contact_tags.iter().any(|tag| tags.contains(tag)))
            .map(|(recipient, _)| recipient.clone())
            .collect())
    }
}

/// Renders content without variable substitution
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughRenderer;

#[async_trait]
impl Renderer for PassthroughRenderer {
    async fn render(
        &self,
        content: &ContentRef,
        _variables: &HashMap<String, String>,
    ) -> Result<RenderedContent, CollaboratorError> {
        Ok(match content {
            ContentRef::Template { template_id } => RenderedContent {
                subject: format!("[{template_id}]"),
                html_body: String::new(),
                text_body: String::new(),
            },
            ContentRef::Custom {
                subject,
                html,
                text,
            } => RenderedContent {
                subject: subject.clone(),
                html_body: html.clone(),
                text_body: text.clone(),
            },
        })
    }
}

/// Dry-run transport: logs each send and reports success
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTransport;

#[async_trait]
impl Transport for LoggingTransport {
    async fn send_email(&self, recipient: &Recipient, content: &RenderedContent) -> SendResult {
        outgoing!(
            level = INFO,
            recipient = %recipient.id,
            subject = %content.subject,
            "Dry-run send to {}",
            recipient.email
        );

        let id = ulid::Ulid::new();
        internal!("Assigned provider message id {id}");
        SendResult::sent(format!("dry-run-{id}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_resolves_any_matching_tag_once() {
        let directory = ContactDirectory::new();
        directory.insert(Recipient::new("a", "a@example.com"), &["news", "vip"]);
        directory.insert(Recipient::new("b", "b@example.com"), &["news"]);
        directory.insert(Recipient::new("c", "c@example.com"), &["other"]);

        let resolved = directory
            .resolve_recipients(&["news".to_string(), "vip".to_string()])
            .await
            .unwrap();

        let mut ids: Vec<_> = resolved.iter().map(|r| r.id.to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn reinserting_a_contact_replaces_its_tags() {
        let directory = ContactDirectory::new();
        directory.insert(Recipient::new("a", "a@example.com"), &["news"]);
        directory.insert(Recipient::new("a", "a@example.com"), &["other"]);

        assert_eq!(directory.len(), 1);
        assert!(
            directory
                .resolve_recipients(&["news".to_string()])
                .await
                .unwrap()
                .is_empty()
        );
    }
}
