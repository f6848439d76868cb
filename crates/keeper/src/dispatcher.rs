// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Notification dispatcher: turns credential state changes into directed
//! messages on the owning agent's channel.
//!
//! Delivery is best effort. Nothing here waits for an acknowledgement or
//! retries; an agent that was offline learns the new state on resync.

use std::sync::Arc;

use serde_json::Value;
use tokenkeep_wire::{CredentialNotice, Envelope, Message, MessageType};

use crate::registry::Registry;
use crate::store::CredentialStore;

pub struct Dispatcher {
    registry: Arc<Registry>,
    store: Arc<dyn CredentialStore>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn CredentialStore>) -> Self {
        Self { registry, store }
    }

    /// Send `kind` to whichever agent owns `account_identity`.
    ///
    /// Returns whether a live channel accepted the write.
    pub async fn notify(&self, account_identity: &str, kind: MessageType, payload: Value) -> bool {
        let Some(owner) = self.store.owner_of(account_identity).await else {
            tracing::debug!(account = %account_identity, %kind, "no owner recorded, skipping notification");
            return false;
        };
        self.deliver(&owner, kind, payload).await
    }

    /// Send `kind` straight to `owner`.
    pub async fn deliver(&self, owner: &str, kind: MessageType, payload: Value) -> bool {
        let delivered = self.registry.send(owner, Envelope::new(kind, payload)).await;
        if delivered {
            tracing::info!(client = %owner, %kind, "notification delivered");
        } else {
            tracing::info!(client = %owner, %kind, "owner offline, notification dropped");
        }
        delivered
    }

    pub async fn notify_expired(&self, account_identity: &str, reason: &str) -> bool {
        let env = Message::CredentialExpired(notice(account_identity, reason)).into_envelope();
        self.notify(account_identity, env.kind, env.payload).await
    }

    /// The record is gone by the time this runs, so the caller supplies the owner.
    pub async fn notify_deleted(&self, owner: &str, account_identity: &str, reason: &str) -> bool {
        let env = Message::CredentialDeleted(notice(account_identity, reason)).into_envelope();
        self.deliver(owner, env.kind, env.payload).await
    }
}

fn notice(account_identity: &str, reason: &str) -> CredentialNotice {
    CredentialNotice { account_identity: account_identity.to_owned(), reason: reason.to_owned() }
}
