//! In-process message bus.
//!
//! Subject-exact fan-out over unbounded channels. Publishing to a subject
//! nobody listens on is not an error (the message is dropped), matching the
//! fire-and-forget semantics of a networked bus.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use super::{BusMessage, MessageBus};
use crate::error::BusError;

/// Prefix of generated reply subjects.
const INBOX_PREFIX: &str = "_INBOX.";

#[derive(Default)]
pub struct LocalBus {
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every message published on `subject`.
    pub async fn subscribe(&self, subject: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Generate a fresh reply subject.
    pub fn new_inbox() -> String {
        format!("{INBOX_PREFIX}{}", Uuid::new_v4().simple())
    }

    /// Publish a request and wait for the first reply.
    pub async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<BusMessage, BusError> {
        let inbox = Self::new_inbox();
        let mut rx = self.subscribe(&inbox).await;
        self.publish_request(subject, &inbox, payload).await?;

        let reply = match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::RequestTimeout {
                subject: subject.to_string(),
                timeout,
            }),
        };

        self.unsubscribe_closed(&inbox, Some(rx)).await;
        reply
    }

    /// Number of live subscriptions on a subject.
    pub async fn subscriber_count(&self, subject: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(subject)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    async fn unsubscribe_closed(
        &self,
        subject: &str,
        receiver: Option<mpsc::UnboundedReceiver<BusMessage>>,
    ) {
        drop(receiver);
        let mut subscribers = self.subscribers.write().await;
        if let Some(subs) = subscribers.get_mut(subject) {
            subs.retain(|s| !s.is_closed());
            if subs.is_empty() {
                subscribers.remove(subject);
            }
        }
    }

    async fn deliver(&self, message: BusMessage) {
        let subject = message.subject.clone();
        let mut saw_closed = false;
        {
            let subscribers = self.subscribers.read().await;
            let Some(subs) = subscribers.get(&subject) else {
                debug!(subject = %subject, "No subscribers, message dropped");
                return;
            };
            for sub in subs {
                if sub.send(message.clone()).is_err() {
                    saw_closed = true;
                }
            }
        }
        if saw_closed {
            self.unsubscribe_closed(&subject, None).await;
        }
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.deliver(BusMessage {
            subject: subject.to_string(),
            reply: None,
            payload,
        })
        .await;
        Ok(())
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.deliver(BusMessage {
            subject: subject.to_string(),
            reply: Some(reply.to_string()),
            payload,
        })
        .await;
        Ok(())
    }
}
