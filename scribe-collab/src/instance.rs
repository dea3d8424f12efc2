//! Per-document authoritative record.
//!
//! ```text
//!  oldest_version            version
//!        │                      │
//!        ▼                      ▼
//!  ──────┬────┬────┬────┬────┬──
//!   doc  │ s₁ │ s₂ │ s₃ │ s₄ │     step log (bounded by max_step_history)
//!  ──────┴────┴────┴────┴────┴──
//! ```
//!
//! Versions advance by one per applied step. A record's `version` is the
//! version its step produced, so "steps since v" are the records with
//! `version > v`. Requests older than `oldest_version` cannot be served from
//! the log anymore and are answered with `410`.
//!
//! An `Instance` has no locking of its own; the manager owns it behind a
//! single-writer lock.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use scribe_core::{apply_steps, rebase_steps_over, Step};
use serde_json::Value;

use crate::error::CollabError;
use crate::protocol::StepRecord;

/// Presence entry for a client that talked to this instance.
#[derive(Debug, Clone)]
pub struct ClientPresence {
    pub client_id: String,
    pub last_seen: Instant,
    /// Opaque attribution data supplied by the client
    pub data: Option<Value>,
}

/// The mutable record for one named document.
pub struct Instance<S: Step> {
    doc_name: String,
    doc: S::Doc,
    version: u64,
    steps: VecDeque<StepRecord<S>>,
    max_step_history: usize,
    clients: HashMap<String, ClientPresence>,
    last_active: Instant,
    /// Set once the manager dropped this instance; holders must look it up again.
    pub(crate) evicted: bool,
}

impl<S: Step> Instance<S> {
    pub fn new(doc_name: impl Into<String>, doc: S::Doc, version: u64, max_step_history: usize) -> Self {
        Self {
            doc_name: doc_name.into(),
            doc,
            version,
            steps: VecDeque::new(),
            max_step_history: max_step_history.max(1),
            clients: HashMap::new(),
            last_active: Instant::now(),
            evicted: false,
        }
    }

    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    pub fn doc(&self) -> &S::Doc {
        &self.doc
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// The oldest version a client may still pull or push from.
    pub fn oldest_version(&self) -> u64 {
        self.version - self.steps.len() as u64
    }

    /// Number of steps currently retained.
    pub fn retained_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    fn check_version(&self, version: u64) -> Result<(), CollabError> {
        if version > self.version {
            return Err(CollabError::bad_request(format!(
                "version {version} is ahead of '{}' (at {})",
                self.doc_name, self.version
            ))
            .from_origin("manager"));
        }
        if version < self.oldest_version() {
            return Err(CollabError::gone(format!(
                "history of '{}' before version {} is no longer available",
                self.doc_name,
                self.oldest_version()
            ))
            .from_origin("manager"));
        }
        Ok(())
    }

    fn records_since(&self, version: u64) -> Result<impl Iterator<Item = &StepRecord<S>>, CollabError> {
        self.check_version(version)?;
        let skip = (version - self.oldest_version()) as usize;
        Ok(self.steps.iter().skip(skip))
    }

    /// All retained steps with a version strictly greater than `version`.
    pub fn steps_since(&self, version: u64) -> Result<Vec<StepRecord<S>>, CollabError> {
        Ok(self.records_since(version)?.cloned().collect())
    }

    /// Validate, rebase if needed, and apply a batch created against `version`.
    ///
    /// The batch is applied all-or-nothing. Returns the new version.
    pub fn add_steps(&mut self, version: u64, steps: Vec<S>, client_id: &str) -> Result<u64, CollabError> {
        if steps.is_empty() {
            return Err(CollabError::bad_request("push contains no steps").from_origin("manager"));
        }

        let concurrent: Vec<&S> = self.records_since(version)?.map(|r| &r.step).collect();
        let rebased = !concurrent.is_empty();
        let steps = if rebased {
            rebase_steps_over(&steps, concurrent).ok_or_else(|| {
                CollabError::conflict(format!(
                    "steps from '{client_id}' at version {version} cannot be rebased onto version {}",
                    self.version
                ))
                .from_origin("manager")
            })?
        } else {
            steps
        };

        let doc = apply_steps(&self.doc, &steps).map_err(|e| {
            let message = format!("steps from '{client_id}' do not apply: {e}");
            if rebased {
                CollabError::conflict(message).from_origin("manager")
            } else {
                CollabError::bad_request(message).from_origin("manager")
            }
        })?;

        for step in steps {
            self.version += 1;
            self.steps.push_back(StepRecord {
                client_id: client_id.to_string(),
                version: self.version,
                step,
            });
        }
        self.doc = doc;
        while self.steps.len() > self.max_step_history {
            self.steps.pop_front();
        }
        self.touch(client_id);
        Ok(self.version)
    }

    /// Record activity from a client.
    pub fn touch(&mut self, client_id: &str) {
        let now = Instant::now();
        self.last_active = now;
        self.clients
            .entry(client_id.to_string())
            .and_modify(|p| p.last_seen = now)
            .or_insert_with(|| ClientPresence {
                client_id: client_id.to_string(),
                last_seen: now,
                data: None,
            });
    }

    /// Attach attribution data to a client.
    pub fn set_client_data(&mut self, client_id: &str, data: Value) {
        self.touch(client_id);
        if let Some(presence) = self.clients.get_mut(client_id) {
            presence.data = Some(data);
        }
    }

    pub fn clients(&self) -> Vec<ClientPresence> {
        let mut clients: Vec<_> = self.clients.values().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    /// Forget clients not seen since `cutoff`.
    pub fn prune_clients(&mut self, cutoff: Instant) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, p| p.last_seen >= cutoff);
        before - self.clients.len()
    }
}
