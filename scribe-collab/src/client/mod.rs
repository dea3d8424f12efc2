//! Client-side synchronization task.
//!
//! A [`SyncClient`] owns one document's [`SyncContext`] and runs the state
//! machine in [`state`] on its own tokio task. The application talks to it
//! through a [`SyncHandle`]:
//!
//! - `apply_local(steps)` queues edits; they are applied to the local view at
//!   once and pushed in the background
//! - `pull_now()`, `reinit()`, `destroy()`
//! - [`SyncEvent`]s arrive on an mpsc channel; the current [`ClientState`]
//!   and a [`SyncSnapshot`] of the view are published through watch channels
//!
//! Every network request is raced against local edits and commands, so edits
//! keep accumulating while a request is in flight. At most one push is
//! outstanding at any time. Destroying the client drops the in-flight request;
//! its result is never applied.

pub mod state;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use scribe_core::{Step, StepError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::{PullEventsRequest, PushEventsRequest, VersionBump};
use crate::transport::CollabTransport;

pub use state::{ClientState, ErrorState, Integrated, Recovery, RequestKind, SyncContext};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Document to synchronize
    pub doc_name: String,
    /// Client identity; a random UUID when `None`
    pub client_id: Option<String>,
    /// Pull this often while idle, in addition to bump notifications (None = bumps only)
    pub pull_interval: Option<Duration>,
    /// Consecutive failures tolerated per recovery path before giving up
    pub max_retries: u32,
    /// First backoff delay after a `500`
    pub retry_base_delay: Duration,
    /// Backoff ceiling
    pub retry_max_delay: Duration,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            doc_name: "default".to_string(),
            client_id: None,
            pull_interval: Some(Duration::from_secs(5)),
            max_retries: 5,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(doc_name: impl Into<String>) -> Self {
        Self {
            doc_name: doc_name.into(),
            ..Self::default()
        }
    }

    pub fn for_testing(doc_name: impl Into<String>) -> Self {
        Self {
            doc_name: doc_name.into(),
            client_id: None,
            pull_interval: None,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(50),
            event_capacity: 1024,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent<S: Step> {
    /// Document installed; `doc` includes surviving local steps
    Ready { doc: S::Doc, version: u64 },
    /// Steps from other clients changed the local view
    Remote { doc: S::Doc, version: u64, steps: usize },
    /// The manager accepted a push
    Pushed { version: u64, steps: usize },
    /// Local steps rejected because they do not apply to the view
    LocalRejected(StepError),
    /// A request failed and the machine entered an error state
    Error { state: ErrorState, error: CollabError },
    /// Local state was dropped; `discarded` pending steps were lost
    Reset { discarded: usize },
    /// Responses now come from a different manager; halted until `reinit`
    IncorrectManager { expected: Uuid, actual: Uuid },
    /// Retries exhausted: disconnected, edits not saved
    Disconnected { error: Option<CollabError>, unsaved: usize },
    Destroyed,
}

/// Latest local view published by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot<D> {
    pub version: Option<u64>,
    pub doc: D,
    pub pending: usize,
}

/// Commands sent to a destroyed client.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientError {
    #[error("sync client destroyed")]
    Destroyed,
}

enum Command<S> {
    Apply(Vec<S>),
    Pull,
    Reinit,
}

/// Handle to a running [`SyncClient`].
pub struct SyncHandle<S: Step> {
    client_id: String,
    commands: mpsc::UnboundedSender<Command<S>>,
    destroy: watch::Sender<bool>,
    status: watch::Receiver<ClientState>,
    snapshot: watch::Receiver<SyncSnapshot<S::Doc>>,
    event_rx: Option<mpsc::Receiver<SyncEvent<S>>>,
    task: Option<JoinHandle<()>>,
}

impl<S: Step> SyncHandle<S> {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent<S>>> {
        self.event_rx.take()
    }

    /// Queue local steps, built against the current view.
    pub fn apply_local(&self, steps: Vec<S>) -> Result<(), ClientError> {
        self.send(Command::Apply(steps))
    }

    /// Pull as soon as the current request, if any, completes.
    pub fn pull_now(&self) -> Result<(), ClientError> {
        self.send(Command::Pull)
    }

    /// Start over from `Init`, keeping local steps.
    pub fn reinit(&self) -> Result<(), ClientError> {
        self.send(Command::Reinit)
    }

    /// Stop the client. Later commands fail with [`ClientError::Destroyed`].
    pub fn destroy(&self) {
        self.destroy.send_replace(true);
    }

    pub fn status(&self) -> ClientState {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ClientState> {
        self.status.clone()
    }

    pub fn snapshot(&self) -> SyncSnapshot<S::Doc> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<SyncSnapshot<S::Doc>> {
        self.snapshot.clone()
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for_status(&self, predicate: impl FnMut(&ClientState) -> bool) -> ClientState {
        let mut rx = self.status.clone();
        let state = match rx.wait_for(predicate).await {
            Ok(state) => *state,
            Err(_) => ClientState::Destroyed,
        };
        state
    }

    /// Wait for the task to finish after [`destroy`](Self::destroy).
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, command: Command<S>) -> Result<(), ClientError> {
        if *self.destroy.borrow() {
            return Err(ClientError::Destroyed);
        }
        self.commands.send(command).map_err(|_| ClientError::Destroyed)
    }
}

impl<S: Step> Drop for SyncHandle<S> {
    fn drop(&mut self) {
        self.destroy.send_replace(true);
    }
}

enum Outcome<T> {
    Done(Result<T, CollabError>),
    /// A command preempted the request; continue in this state
    Interrupted(ClientState),
}

/// The sync state machine task for one document.
pub struct SyncClient<S: Step, T: CollabTransport<S>> {
    transport: Arc<T>,
    config: ClientConfig,
    ctx: SyncContext<S>,
    commands: mpsc::UnboundedReceiver<Command<S>>,
    destroy: watch::Receiver<bool>,
    events: mpsc::Sender<SyncEvent<S>>,
    status: watch::Sender<ClientState>,
    snapshot: watch::Sender<SyncSnapshot<S::Doc>>,
    bumps: Option<broadcast::Receiver<VersionBump>>,
    pull_timer: Option<Interval>,
    fetched: Option<(S::Doc, u64, Uuid)>,
    last_error: Option<(CollabError, RequestKind)>,
    pull_requested: bool,
    failures: u32,
    recoveries: u32,
    resets: u32,
}

impl<S: Step, T: CollabTransport<S>> SyncClient<S, T> {
    /// Start synchronizing `config.doc_name` over `transport`.
    pub fn spawn(transport: T, config: ClientConfig) -> SyncHandle<S> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (destroy_tx, destroy_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (status_tx, status_rx) = watch::channel(ClientState::Init);
        let (snapshot_tx, snapshot_rx) = watch::channel(SyncSnapshot {
            version: None,
            doc: <S::Doc as scribe_core::Document>::empty(),
            pending: 0,
        });

        let client = Self {
            transport: Arc::new(transport),
            ctx: SyncContext::new(client_id.clone()),
            config,
            commands: command_rx,
            destroy: destroy_rx,
            events: event_tx,
            status: status_tx,
            snapshot: snapshot_tx,
            bumps: None,
            pull_timer: None,
            fetched: None,
            last_error: None,
            pull_requested: false,
            failures: 0,
            recoveries: 0,
            resets: 0,
        };
        let task = tokio::spawn(client.run());

        SyncHandle {
            client_id,
            commands: command_tx,
            destroy: destroy_tx,
            status: status_rx,
            snapshot: snapshot_rx,
            event_rx: Some(event_rx),
            task: Some(task),
        }
    }

    async fn run(mut self) {
        log::debug!("Sync client '{}' starting on '{}'", self.ctx.client_id(), self.config.doc_name);
        if let Some(period) = self.config.pull_interval {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.pull_timer = Some(timer);
        }

        let mut state = ClientState::Init;
        loop {
            if *self.destroy.borrow() {
                state = ClientState::Destroyed;
            }
            self.status.send_replace(state);
            log::trace!("Client '{}' → {state}", self.ctx.client_id());

            state = match state {
                ClientState::Init => self.on_init().await,
                ClientState::InitDocument => self.on_init_document(),
                ClientState::Ready => self.on_ready().await,
                ClientState::PushEvents => self.on_push().await,
                ClientState::PullEvents => self.on_pull().await,
                ClientState::Error(error) => self.on_error(error).await,
                ClientState::Reset => self.on_reset(),
                ClientState::Disconnected => self.halt().await,
                ClientState::Destroyed => break,
            };
        }

        self.emit(SyncEvent::Destroyed);
        log::debug!("Sync client '{}' destroyed", self.ctx.client_id());
    }

    async fn on_init(&mut self) -> ClientState {
        if self.bumps.is_none() {
            self.bumps = self.transport.as_ref().subscribe(&self.config.doc_name).await;
        }
        if let Some(next) = self.settle_sent().await {
            return next;
        }
        let transport = self.transport.clone();
        let doc_name = self.config.doc_name.clone();
        match self.race(async move { transport.as_ref().get_document(&doc_name).await }).await {
            Outcome::Interrupted(next) => next,
            Outcome::Done(Ok(response)) => {
                self.fetched = Some((response.doc, response.version, response.manager_id));
                ClientState::InitDocument
            }
            Outcome::Done(Err(e)) => self.fail(e, RequestKind::GetDocument),
        }
    }

    /// Learn what became of pushed steps before a fetched document replaces
    /// the confirmed one. Echoed steps retire their pending entries; steps
    /// whose outcome cannot be learned are dropped, never replayed.
    async fn settle_sent(&mut self) -> Option<ClientState> {
        let version = self.ctx.version()?;
        if self.ctx.sent() == 0 {
            return None;
        }
        let request = PullEventsRequest {
            doc_name: self.config.doc_name.clone(),
            version,
            client_id: self.ctx.client_id().to_string(),
        };

        let transport = self.transport.clone();
        match self.race(async move { transport.as_ref().pull_events(request).await }).await {
            Outcome::Interrupted(next) => Some(next),
            Outcome::Done(Ok(response)) => match self.ctx.integrate(&response.steps, response.version) {
                Ok(summary) => {
                    log::debug!("{} pushed steps came back before re-fetching", summary.confirmed);
                    self.publish_snapshot();
                    None
                }
                Err(e) => Some(self.fail(
                    CollabError::conflict(e.to_string()).from_origin("client"),
                    RequestKind::LocalApply,
                )),
            },
            // Retried from Init, which settles again.
            Outcome::Done(Err(e)) if e.is_retryable() => Some(self.fail(e, RequestKind::GetDocument)),
            Outcome::Done(Err(e)) => {
                let discarded = self.ctx.discard_sent();
                log::warn!("Dropping {discarded} pushed steps with unknown outcome: {e}");
                self.publish_snapshot();
                self.emit(SyncEvent::Reset { discarded });
                None
            }
        }
    }

    fn on_init_document(&mut self) -> ClientState {
        let Some((doc, version, manager_id)) = self.fetched.take() else {
            return ClientState::Init;
        };
        let discarded = self.ctx.install(doc, version, manager_id);
        if discarded > 0 {
            self.emit(SyncEvent::Reset { discarded });
        }
        self.failures = 0;
        self.publish_snapshot();
        self.emit(SyncEvent::Ready {
            doc: self.ctx.view().clone(),
            version,
        });
        log::info!(
            "Client '{}' ready on '{}' at version {version}",
            self.ctx.client_id(),
            self.config.doc_name
        );

        if self.ctx.has_unsent() {
            ClientState::PushEvents
        } else {
            ClientState::Ready
        }
    }

    async fn on_ready(&mut self) -> ClientState {
        if std::mem::take(&mut self.pull_requested) {
            return ClientState::PullEvents;
        }
        if self.ctx.has_unsent() {
            return ClientState::PushEvents;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.destroy.changed() => return ClientState::Destroyed,
                command = self.commands.recv() => match command {
                    None => return ClientState::Destroyed,
                    Some(Command::Apply(steps)) => {
                        if self.accept_local(steps) {
                            return ClientState::PushEvents;
                        }
                    }
                    Some(Command::Pull) => return ClientState::PullEvents,
                    Some(Command::Reinit) => return ClientState::Init,
                },
                bump = next_bump(&mut self.bumps) => match bump {
                    Ok(bump) => {
                        let behind = self.ctx.version().map_or(true, |v| bump.version > v);
                        if bump.doc_name == self.config.doc_name && behind {
                            return ClientState::PullEvents;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("Missed {n} version bumps; pulling");
                        return ClientState::PullEvents;
                    }
                    Err(broadcast::error::RecvError::Closed) => self.bumps = None,
                },
                _ = next_tick(&mut self.pull_timer) => return ClientState::PullEvents,
            }
        }
    }

    async fn on_push(&mut self) -> ClientState {
        let Some(version) = self.ctx.version() else {
            return ClientState::Init;
        };
        let steps = self.ctx.take_unsent();
        if steps.is_empty() {
            return ClientState::Ready;
        }
        let count = steps.len();
        let request = PushEventsRequest {
            doc_name: self.config.doc_name.clone(),
            version,
            steps,
            client_id: self.ctx.client_id().to_string(),
        };

        let transport = self.transport.clone();
        match self.race(async move { transport.as_ref().push_events(request).await }).await {
            Outcome::Interrupted(next) => next,
            Outcome::Done(Ok(response)) => {
                if let Some(state) = self.check_manager(response.manager_id) {
                    return state;
                }
                self.succeeded();
                self.recoveries = 0;
                log::debug!("Pushed {count} steps; manager at version {}", response.version);
                self.emit(SyncEvent::Pushed {
                    version: response.version,
                    steps: count,
                });
                ClientState::PullEvents
            }
            Outcome::Done(Err(e)) => {
                // Anything but a 500 means the batch was rejected as a whole.
                if !e.is_retryable() {
                    self.ctx.push_rejected(count);
                }
                self.fail(e, RequestKind::PushEvents)
            }
        }
    }

    async fn on_pull(&mut self) -> ClientState {
        let Some(version) = self.ctx.version() else {
            return ClientState::Init;
        };
        let request = PullEventsRequest {
            doc_name: self.config.doc_name.clone(),
            version,
            client_id: self.ctx.client_id().to_string(),
        };

        let transport = self.transport.clone();
        match self.race(async move { transport.as_ref().pull_events(request).await }).await {
            Outcome::Interrupted(next) => next,
            Outcome::Done(Ok(response)) => {
                if let Some(state) = self.check_manager(response.manager_id) {
                    return state;
                }
                match self.ctx.integrate(&response.steps, response.version) {
                    Ok(summary) => {
                        // A failing push is only cleared by a successful push.
                        if !self.ctx.has_unsent() {
                            self.succeeded();
                        }
                        self.publish_snapshot();
                        if summary.remote > 0 {
                            self.emit(SyncEvent::Remote {
                                doc: self.ctx.view().clone(),
                                version: response.version,
                                steps: summary.remote,
                            });
                        }
                        if self.ctx.has_unsent() {
                            ClientState::PushEvents
                        } else {
                            ClientState::Ready
                        }
                    }
                    Err(e) => {
                        log::warn!("Pulled steps do not apply locally: {e}");
                        self.fail(
                            CollabError::conflict(e.to_string()).from_origin("client"),
                            RequestKind::LocalApply,
                        )
                    }
                }
            }
            Outcome::Done(Err(e)) => self.fail(e, RequestKind::PullEvents),
        }
    }

    async fn on_error(&mut self, error: ErrorState) -> ClientState {
        match error.recovery() {
            Recovery::Backoff => {
                let Some((err, kind)) = self.last_error.take() else {
                    return ClientState::Init;
                };
                let classified = state::triage(&err, kind);
                if classified != ErrorState::Triage {
                    log::debug!("{err} from {kind:?} → {classified:?}");
                    self.emit(SyncEvent::Error {
                        state: classified,
                        error: err.clone(),
                    });
                    self.last_error = Some((err, kind));
                    return ClientState::Error(classified);
                }

                self.failures += 1;
                if self.failures > self.config.max_retries {
                    log::warn!("Giving up after {} failed attempts: {err}", self.failures - 1);
                    self.last_error = Some((err, kind));
                    return ClientState::Disconnected;
                }
                let delay = self.config.backoff(self.failures);
                log::debug!("{err}; retrying {kind:?} in {delay:?} (attempt {})", self.failures);
                match self.race(async move {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await
                {
                    Outcome::Interrupted(next) => next,
                    Outcome::Done(_) => match kind {
                        RequestKind::GetDocument | RequestKind::LocalApply | RequestKind::ManagerCheck => {
                            ClientState::Init
                        }
                        // The push may have landed; pull before pushing again.
                        RequestKind::PushEvents | RequestKind::PullEvents => ClientState::PullEvents,
                    },
                }
            }
            Recovery::Pull => {
                self.recoveries += 1;
                if self.recoveries > self.config.max_retries || self.ctx.version().is_none() {
                    log::warn!("Recovery via pull failed {} times; resetting", self.recoveries);
                    return ClientState::Reset;
                }
                ClientState::PullEvents
            }
            Recovery::Reset => ClientState::Reset,
            Recovery::Halt => self.halt().await,
        }
    }

    fn on_reset(&mut self) -> ClientState {
        self.resets += 1;
        self.recoveries = 0;
        let discarded = self.ctx.reset();
        self.publish_snapshot();
        log::info!(
            "Client '{}' reset on '{}' ({discarded} pending steps discarded)",
            self.ctx.client_id(),
            self.config.doc_name
        );
        self.emit(SyncEvent::Reset { discarded });
        if self.resets > self.config.max_retries {
            ClientState::Disconnected
        } else {
            ClientState::Init
        }
    }

    /// Wait for `reinit` or `destroy`. Local edits keep accumulating.
    async fn halt(&mut self) -> ClientState {
        if *self.status.borrow() == ClientState::Disconnected {
            let error = self.last_error.take().map(|(e, _)| e);
            log::warn!(
                "Client '{}' disconnected from '{}', edits not saved",
                self.ctx.client_id(),
                self.config.doc_name
            );
            self.emit(SyncEvent::Disconnected {
                error,
                unsaved: self.ctx.pending().len(),
            });
        }

        loop {
            tokio::select! {
                biased;
                _ = self.destroy.changed() => return ClientState::Destroyed,
                command = self.commands.recv() => match command {
                    None => return ClientState::Destroyed,
                    Some(Command::Apply(steps)) => {
                        self.accept_local(steps);
                    }
                    Some(Command::Pull) => {}
                    Some(Command::Reinit) => {
                        self.failures = 0;
                        self.resets = 0;
                        self.recoveries = 0;
                        self.last_error = None;
                        return ClientState::Init;
                    }
                },
            }
        }
    }

    /// Drive `request` while serving commands. A destroy or reinit drops it.
    async fn race<R>(&mut self, request: impl Future<Output = Result<R, CollabError>>) -> Outcome<R> {
        tokio::pin!(request);
        loop {
            tokio::select! {
                biased;
                _ = self.destroy.changed() => return Outcome::Interrupted(ClientState::Destroyed),
                result = &mut request => return Outcome::Done(result),
                command = self.commands.recv() => match command {
                    None => return Outcome::Interrupted(ClientState::Destroyed),
                    Some(Command::Apply(steps)) => {
                        self.accept_local(steps);
                    }
                    Some(Command::Pull) => self.pull_requested = true,
                    Some(Command::Reinit) => return Outcome::Interrupted(ClientState::Init),
                },
            }
        }
    }

    fn accept_local(&mut self, steps: Vec<S>) -> bool {
        if steps.is_empty() {
            return false;
        }
        match self.ctx.apply_local(steps) {
            Ok(()) => {
                self.publish_snapshot();
                true
            }
            Err(e) => {
                log::debug!("Rejected local steps: {e}");
                self.emit(SyncEvent::LocalRejected(e));
                false
            }
        }
    }

    fn fail(&mut self, error: CollabError, request: RequestKind) -> ClientState {
        log::debug!("{request:?} on '{}' failed: {error}", self.config.doc_name);
        self.last_error = Some((error, request));
        ClientState::Error(ErrorState::Triage)
    }

    fn succeeded(&mut self) {
        self.failures = 0;
        self.resets = 0;
    }

    fn check_manager(&mut self, manager_id: Uuid) -> Option<ClientState> {
        if self.ctx.is_same_manager(manager_id) {
            return None;
        }
        let expected = self.ctx.manager_id().unwrap_or_default();
        log::warn!("Expected manager {expected}, got a response from {manager_id}");
        self.emit(SyncEvent::IncorrectManager {
            expected,
            actual: manager_id,
        });
        let error = CollabError::conflict(format!("expected manager {expected}, got {manager_id}"))
            .from_origin("client");
        Some(self.fail(error, RequestKind::ManagerCheck))
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(SyncSnapshot {
            version: self.ctx.version(),
            doc: self.ctx.view().clone(),
            pending: self.ctx.pending().len(),
        });
    }

    fn emit(&self, event: SyncEvent<S>) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            log::warn!("Sync event channel full; dropping {event:?}");
        }
    }
}

async fn next_bump(bumps: &mut Option<broadcast::Receiver<VersionBump>>) -> Result<VersionBump, broadcast::error::RecvError> {
    match bumps {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
