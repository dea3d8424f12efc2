//! Client sync states, error triage, and the per-client sync context.
//!
//! ```text
//!            ┌──────────────────────────── Reset ◄──────────────┐
//!            ▼                                                  │
//!   Init ──► InitDocument ──► Ready ◄──► PushEvents ──► PullEvents
//!                               ▲            │              │
//!                               └────────────┴── Error(Triage) ──► Error(..)
//!                                                    │
//!                                          backoff / Disconnected
//! ```
//!
//! Everything here is synchronous; the task in [`super`] drives it.

use std::fmt;

use scribe_core::{apply_steps, rebase_steps, Document, Step, StepError};
use uuid::Uuid;

use crate::error::{CollabError, ErrorCode};
use crate::protocol::StepRecord;

/// Error sub-states. Every one of them is entered from [`ErrorState::Triage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorState {
    /// Classifying a failure; also where transient `500`s back off
    Triage,
    /// Remote steps could not be applied or rebased locally
    ApplyFailed,
    DocumentNotFound,
    /// The version we hold predates the manager's retained history
    HistoryNotAvailable,
    /// A response came from a manager other than the one we initialized with
    IncorrectManager,
    /// The manager rejected the version we pulled from
    InvalidVersion,
    /// Our push was stale or conflicted with concurrent steps
    OutdatedVersion,
}

/// States of the client sync machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Init,
    InitDocument,
    Ready,
    PushEvents,
    PullEvents,
    Error(ErrorState),
    Reset,
    /// Retries exhausted; local edits are kept but not saved
    Disconnected,
    Destroyed,
}

impl ClientState {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// States the machine leaves only on `reinit` or `destroy`.
    pub fn is_halted(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Destroyed | Self::Error(ErrorState::IncorrectManager)
        )
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(e) => write!(f, "error({e:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Which request produced an error, or which client-side check on a
/// response did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    GetDocument,
    PushEvents,
    PullEvents,
    /// Pulled steps did not apply or rebase onto the local state
    LocalApply,
    /// A response carried an unexpected manager id
    ManagerCheck,
}

/// What the machine does after classifying an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Back off and retry; after too many attempts, disconnect
    Backoff,
    /// Pull to catch up, then retry the push
    Pull,
    /// Drop local state and start over
    Reset,
    /// Stop until reinitialized
    Halt,
}

/// Map a failed request to its error sub-state.
pub fn triage(error: &CollabError, request: RequestKind) -> ErrorState {
    match (error.error_code, request) {
        (_, RequestKind::LocalApply) => ErrorState::ApplyFailed,
        (_, RequestKind::ManagerCheck) => ErrorState::IncorrectManager,
        (ErrorCode::Internal, _) => ErrorState::Triage,
        (ErrorCode::NotFound, _) => ErrorState::DocumentNotFound,
        (ErrorCode::Gone, _) => ErrorState::HistoryNotAvailable,
        (ErrorCode::Conflict, _) => ErrorState::OutdatedVersion,
        (ErrorCode::BadRequest, RequestKind::PushEvents) => ErrorState::OutdatedVersion,
        (ErrorCode::BadRequest, _) => ErrorState::InvalidVersion,
    }
}

impl ErrorState {
    pub fn recovery(self) -> Recovery {
        match self {
            Self::Triage => Recovery::Backoff,
            Self::OutdatedVersion | Self::InvalidVersion => Recovery::Pull,
            Self::ApplyFailed | Self::DocumentNotFound | Self::HistoryNotAvailable => Recovery::Reset,
            Self::IncorrectManager => Recovery::Halt,
        }
    }
}

/// Result of folding pulled steps into the context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Integrated {
    /// Steps from other clients
    pub remote: usize,
    /// Our own steps coming back, retiring pending entries
    pub confirmed: usize,
}

/// Per-client synchronization state.
///
/// `pending` holds local steps the server has not been seen to apply. The
/// first `sent` of them were pushed; their outcome is settled by the next
/// pull, which either echoes them back or shows they were never applied.
#[derive(Debug, Clone)]
pub struct SyncContext<S: Step> {
    client_id: String,
    version: Option<u64>,
    confirmed: S::Doc,
    pending: Vec<S>,
    sent: usize,
    view: S::Doc,
    manager_id: Option<Uuid>,
}

impl<S: Step> SyncContext<S> {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            version: None,
            confirmed: S::Doc::empty(),
            pending: Vec::new(),
            sent: 0,
            view: S::Doc::empty(),
            manager_id: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Confirmed version, `None` until initialized.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Document at `version`, without local steps.
    pub fn confirmed(&self) -> &S::Doc {
        &self.confirmed
    }

    /// Confirmed document with pending steps applied.
    pub fn view(&self) -> &S::Doc {
        &self.view
    }

    pub fn pending(&self) -> &[S] {
        &self.pending
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn manager_id(&self) -> Option<Uuid> {
        self.manager_id
    }

    /// Pending steps not pushed yet.
    pub fn unsent(&self) -> &[S] {
        &self.pending[self.sent..]
    }

    pub fn has_unsent(&self) -> bool {
        self.sent < self.pending.len()
    }

    /// Install a freshly fetched document and re-apply surviving local steps.
    ///
    /// Returns how many pending steps had to be discarded because they no
    /// longer apply.
    pub fn install(&mut self, doc: S::Doc, version: u64, manager_id: Uuid) -> usize {
        self.version = Some(version);
        self.manager_id = Some(manager_id);
        self.sent = 0;
        self.confirmed = doc;
        match apply_steps(&self.confirmed, &self.pending) {
            Ok(view) => {
                self.view = view;
                0
            }
            Err(e) => {
                log::debug!("Dropping {} local steps that no longer apply: {e}", self.pending.len());
                self.view = self.confirmed.clone();
                std::mem::take(&mut self.pending).len()
            }
        }
    }

    /// Apply local steps to the view and queue them for pushing.
    pub fn apply_local(&mut self, steps: Vec<S>) -> Result<(), StepError> {
        self.view = apply_steps(&self.view, &steps)?;
        self.pending.extend(steps);
        Ok(())
    }

    /// Mark every unsent step as pushed. Returns the batch to send.
    pub fn take_unsent(&mut self) -> Vec<S> {
        let batch = self.unsent().to_vec();
        self.sent = self.pending.len();
        batch
    }

    /// The last push was rejected outright, so none of its steps were applied.
    pub fn push_rejected(&mut self, count: usize) {
        self.sent = self.sent.saturating_sub(count);
    }

    /// Drop the pushed prefix of `pending` whose outcome can no longer be
    /// learned. Returns how many steps were discarded.
    pub fn discard_sent(&mut self) -> usize {
        let sent = std::mem::take(&mut self.sent);
        if sent == 0 {
            return 0;
        }
        self.pending.drain(..sent);
        match apply_steps(&self.confirmed, &self.pending) {
            Ok(view) => {
                self.view = view;
                sent
            }
            Err(e) => {
                log::debug!("Dropping {} local steps built on discarded ones: {e}", self.pending.len());
                self.view = self.confirmed.clone();
                sent + std::mem::take(&mut self.pending).len()
            }
        }
    }

    /// True when `manager_id` is the manager this context was initialized with.
    pub fn is_same_manager(&self, manager_id: Uuid) -> bool {
        self.manager_id.map_or(true, |known| known == manager_id)
    }

    /// Fold pulled steps into the confirmed document and rebase local steps.
    ///
    /// Our own echoed steps retire pending entries; steps from other clients
    /// transform the pending sequence. On error the context is left as it
    /// was and must be reset.
    pub fn integrate(&mut self, records: &[StepRecord<S>], version: u64) -> Result<Integrated, StepError> {
        let Some(mut current) = self.version else {
            return Err(StepError::Rejected("context is not initialized".into()));
        };
        let mut confirmed = self.confirmed.clone();
        let mut pending = self.pending.clone();
        let mut sent = self.sent;
        let mut summary = Integrated::default();

        for record in records {
            if record.version <= current {
                continue;
            }
            confirmed = record.step.apply(&confirmed)?;
            if record.client_id == self.client_id && sent > 0 {
                pending.remove(0);
                sent -= 1;
                summary.confirmed += 1;
            } else {
                pending = rebase_steps(&pending, &record.step).ok_or_else(|| {
                    StepError::Rejected(format!(
                        "local steps cannot be rebased over version {}",
                        record.version
                    ))
                })?;
                summary.remote += 1;
            }
            current = record.version;
        }

        let view = apply_steps(&confirmed, &pending)?;
        self.confirmed = confirmed;
        self.pending = pending;
        self.view = view;
        self.version = Some(current.max(version));
        // Pushed steps that did not come back were never applied.
        self.sent = 0;
        Ok(summary)
    }

    /// Forget everything except the client id. Returns the discarded step count.
    pub fn reset(&mut self) -> usize {
        let discarded = self.pending.len();
        *self = Self::new(std::mem::take(&mut self.client_id));
        discarded
    }
}
