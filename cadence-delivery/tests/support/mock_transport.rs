//! Scriptable transport for delivery tests
//!
//! Records every call, fails chosen recipients (always, or for their first
//! few attempts), and can hold sends until the test releases them.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use cadence_common::{Recipient, RenderedContent, SendResult, Transport};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

#[derive(Debug, Clone, Copy)]
enum Failure {
    Always { permanent: bool },
    Times(usize),
}

#[derive(Debug, Default)]
pub struct MockTransport {
    failures: HashMap<String, Failure>,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
    attempts: Mutex<HashMap<String, usize>>,
    delivered: Mutex<Vec<(String, String)>>,
    called: Notify,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send to `recipient` fails
    pub fn failing(mut self, recipient: &str, permanent: bool) -> Self {
        self.failures
            .insert(recipient.to_string(), Failure::Always { permanent });
        self
    }

    /// The first `times` sends to `recipient` fail temporarily
    pub fn flaky(mut self, recipient: &str, times: usize) -> Self {
        self.failures
            .insert(recipient.to_string(), Failure::Times(times));
        self
    }

    /// Sends block until [`Self::release`] lets them through
    pub fn held(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn release(&self, sends: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(sends);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// (recipient id, subject) of every successful send
    pub fn delivered(&self) -> Vec<(String, String)> {
        self.delivered.lock().clone()
    }

    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.called.notified();
                if self.calls() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_email(&self, recipient: &Recipient, content: &RenderedContent) -> SendResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.called.notify_waiters();

        if let Some(gate) = &self.gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }

        let id = recipient.id.as_str();
        let attempt = {
            let mut attempts = self.attempts.lock();
            let attempt = attempts.entry(id.to_string()).or_default();
            *attempt += 1;
            *attempt
        };

        match self.failures.get(id) {
            Some(Failure::Always { permanent }) => {
                SendResult::failed("550 mailbox unavailable", *permanent)
            }
            Some(Failure::Times(times)) if attempt <= *times => {
                SendResult::failed("421 try again later", false)
            }
            _ => {
                self.delivered
                    .lock()
                    .push((id.to_string(), content.subject.clone()));
                SendResult::sent(format!("mock-{id}-{attempt}"))
            }
        }
    }
}
