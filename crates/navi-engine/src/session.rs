//! One client connection's agents, handles and context.
//!
//! A session opens one reasoning handle per handle-owning role concurrently.
//! Roles whose handle failed are left out of dispatch and reopened in the
//! background at most once per `reopen_interval`. Events are admitted in
//! arrival order and dispatched one at a time in that order; a video frame
//! overtaken by a newer frame while waiting is answered with a
//! `frame_superseded` response instead of being run.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use navi_core::events::InboundEvent;
use navi_core::ids::SessionId;
use navi_core::reasoning::{ReasoningBackend, ReasoningSession};
use navi_core::results::{LastKnownGood, MergedResponse, Urgency};
use navi_core::roles::AgentRole;
use navi_store::NavigationStore;

use crate::agents::{build_agents, Agent, AgentContext, ContextView};
use crate::bus::HazardBus;
use crate::context::{ContextStats, ContextStore, NewEntry, TokenEstimator};
use crate::dispatcher::{Dispatcher, Participant};
use crate::error::EngineError;
use crate::orchestrator::EngineConfig;
use crate::persist::PersistWriter;
use crate::tools::{SessionCounters, ToolRunner};

/// Source tag on hazards the session publishes from merged responses.
pub const DISPATCH_SOURCE: &str = "dispatch";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Opening,
    Ready,
    /// Usable, with at least one role missing its handle.
    Degraded,
    Closing,
    Closed,
}

struct RoleSlot {
    agent: Arc<dyn Agent>,
    handle: Mutex<Option<Arc<dyn ReasoningSession>>>,
    last_attempt: Mutex<Instant>,
    reopening: AtomicBool,
}

impl RoleSlot {
    fn role(&self) -> AgentRole {
        self.agent.role()
    }

    fn handle(&self) -> Option<Arc<dyn ReasoningSession>> {
        self.handle.lock().clone()
    }
}

pub struct Session {
    id: SessionId,
    state: RwLock<SessionState>,
    slots: Vec<RoleSlot>,
    backend: Arc<dyn ReasoningBackend>,
    config: Arc<EngineConfig>,
    dispatcher: Dispatcher,
    context: Mutex<ContextStore>,
    estimator: TokenEstimator,
    lkg: Mutex<LastKnownGood>,
    turns: Arc<TurnOrder>,
    next_seq: AtomicU64,
    latest_frame: AtomicU64,
    position: Mutex<Option<(f64, f64)>>,
    tools: ToolRunner,
    writer: PersistWriter,
    counters: Arc<SessionCounters>,
    inflight: TaskTracker,
    cancel: CancellationToken,
}

impl Session {
    /// Open every role's handle concurrently. Never fails: roles that could
    /// not open leave the session degraded.
    pub async fn open(
        id: SessionId,
        backend: Arc<dyn ReasoningBackend>,
        store: Arc<dyn NavigationStore>,
        bus: HazardBus,
        config: Arc<EngineConfig>,
    ) -> Arc<Self> {
        let writer = PersistWriter::new();
        let counters = Arc::new(SessionCounters::default());
        let tools = ToolRunner::new(
            id.clone(),
            Arc::clone(&store),
            writer.clone(),
            bus,
            Arc::clone(&counters),
            config.agents.recall_limit,
        );

        {
            let store = Arc::clone(&store);
            let sid = id.clone();
            writer.spawn("create_session", async move { store.create_session(&sid).await });
        }

        let agents = build_agents(&config.agents);
        let opens = agents.iter().map(|agent| open_handle(&backend, agent.as_ref(), &config));
        let handles = join_all(opens).await;

        let now = Instant::now();
        let slots: Vec<RoleSlot> = agents
            .into_iter()
            .zip(handles)
            .map(|(agent, handle)| RoleSlot {
                agent,
                handle: Mutex::new(handle),
                last_attempt: Mutex::new(now),
                reopening: AtomicBool::new(false),
            })
            .collect();

        let estimator = TokenEstimator::new(Arc::clone(&backend), config.context.chars_per_token);
        let session = Arc::new(Self {
            id,
            state: RwLock::new(SessionState::Opening),
            slots,
            backend,
            dispatcher: Dispatcher::new(config.dispatch_timeout),
            context: Mutex::new(ContextStore::new(config.context.clone())),
            estimator,
            lkg: Mutex::new(LastKnownGood::default()),
            turns: Arc::new(TurnOrder::new()),
            next_seq: AtomicU64::new(0),
            latest_frame: AtomicU64::new(0),
            position: Mutex::new(None),
            tools,
            writer,
            counters,
            inflight: TaskTracker::new(),
            cancel: CancellationToken::new(),
            config,
        });
        session.refresh_state();

        let degraded = session.degraded_roles();
        if degraded.is_empty() {
            info!(session_id = %session.id, "session ready");
        } else {
            warn!(session_id = %session.id, degraded = ?degraded, "session opened degraded");
        }
        session
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    /// Roles currently excluded from dispatch for lack of a handle.
    pub fn degraded_roles(&self) -> Vec<AgentRole> {
        self.slots
            .iter()
            .filter(|s| s.handle.lock().is_none())
            .map(RoleSlot::role)
            .collect()
    }

    pub fn context_stats(&self) -> ContextStats {
        self.context.lock().stats()
    }

    pub fn last_known_good(&self) -> LastKnownGood {
        self.lkg.lock().clone()
    }

    pub fn frames_routed(&self) -> u64 {
        self.counters.frames.load(Ordering::Relaxed)
    }

    pub fn writer(&self) -> &PersistWriter {
        &self.writer
    }

    fn refresh_state(&self) {
        let mut state = self.state.write();
        if matches!(*state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        *state = if self.slots.iter().all(|s| s.handle.lock().is_some()) {
            SessionState::Ready
        } else {
            SessionState::Degraded
        };
    }

    /// Fix an event's place in the dispatch order. Events run in the order
    /// they were admitted, so callers admit before handing work to a task.
    pub fn admit(self: &Arc<Self>, event: InboundEvent) -> Result<Admission, EngineError> {
        if self.is_closing() {
            return Err(EngineError::SessionClosing(self.id.to_string()));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        if matches!(event, InboundEvent::VideoFrame(_)) {
            self.latest_frame.fetch_max(seq, Ordering::SeqCst);
        }
        Ok(Admission {
            session: Arc::clone(self),
            turn: Turn {
                seq,
                order: Arc::clone(&self.turns),
            },
            event,
        })
    }

    /// Dispatch one event and return its merged response.
    pub async fn route(self: &Arc<Self>, event: InboundEvent) -> Result<MergedResponse, EngineError> {
        self.admit(event)?.run().await
    }

    async fn run(self: &Arc<Self>, turn: Turn, event: InboundEvent) -> Result<MergedResponse, EngineError> {
        let seq = turn.seq;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(EngineError::SessionClosing(self.id.to_string())),
            _ = self.turns.wait(seq) => {}
        }
        if self.is_closing() {
            return Err(EngineError::SessionClosing(self.id.to_string()));
        }

        let is_frame = matches!(event, InboundEvent::VideoFrame(_));
        if is_frame {
            let latest = self.latest_frame.load(Ordering::SeqCst);
            if latest > seq {
                debug!(session_id = %self.id, frame_seq = seq, newer = latest, "frame superseded");
                return Ok(MergedResponse::superseded(self.id.clone(), seq, latest));
            }
        }

        self.reopen_failed_handles();

        if let InboundEvent::VideoFrame(frame) = &event {
            if let (Some(lat), Some(lon)) = (frame.lat, frame.lon) {
                *self.position.lock() = Some((lat, lon));
            }
        }

        let view = {
            let context = self.context.lock();
            Arc::new(ContextView {
                rendered: context.render(),
                entries: context.visible().into_iter().cloned().collect(),
            })
        };
        let position = *self.position.lock();
        let participants = self
            .slots
            .iter()
            .filter_map(|slot| {
                let handle = slot.handle()?;
                Some(Participant {
                    agent: Arc::clone(&slot.agent),
                    ctx: AgentContext {
                        session_id: self.id.clone(),
                        frame_seq: seq,
                        handle: Some(handle),
                        view: Arc::clone(&view),
                        tools: self.tools.clone(),
                        position,
                    },
                })
            })
            .collect();

        let started = Instant::now();
        let deadline = started + self.dispatcher.timeout();
        let dispatched = self
            .dispatcher
            .dispatch(&self.id, seq, Arc::new(event), participants, &self.lkg, &self.cancel)
            .await;
        let mut response = dispatched.response;

        if self.is_closing() {
            debug!(session_id = %self.id, frame_seq = seq, "session closed during dispatch, discarding side effects");
            return Ok(response);
        }

        let tokens = self.cost(&dispatched.entries, deadline).await;
        self.apply(dispatched.entries, tokens);
        response.latency_ms = started.elapsed().as_millis() as u64;

        self.persist(seq, &response);
        if is_frame {
            self.counters.frames.fetch_add(1, Ordering::Relaxed);
        }
        Ok(response)
    }

    /// Token cost of each proposed entry. Backend counting shares the
    /// dispatch deadline; whatever is left unanswered falls back to the
    /// character heuristic.
    async fn cost(&self, entries: &[NewEntry], deadline: Instant) -> Vec<usize> {
        if entries.is_empty() {
            return Vec::new();
        }
        let texts: Vec<String> = entries.iter().map(NewEntry::text).collect();
        let counts = join_all(texts.iter().map(|text| self.estimator.estimate(text)));
        match tokio::time::timeout_at(deadline, counts).await {
            Ok(counts) => counts,
            Err(_) => {
                debug!(session_id = %self.id, entries = texts.len(), "token counting hit the dispatch deadline");
                texts.iter().map(|text| self.estimator.fallback(text)).collect()
            }
        }
    }

    /// Append proposed entries in order. A landmark whose label is already
    /// pinned is kept as an ordinary entry.
    fn apply(&self, entries: Vec<NewEntry>, tokens: Vec<usize>) {
        let mut context = self.context.lock();
        for (entry, tokens) in entries.into_iter().zip(tokens) {
            let repeat = entry.pinned
                && entry
                    .label
                    .as_deref()
                    .is_some_and(|label| context.is_pinned_label(label));
            let entry = if repeat { entry.unpinned() } else { entry };
            context.append(entry, tokens);
        }
    }

    fn persist(&self, seq: u64, response: &MergedResponse) {
        if let Some(scene) = &response.roles.scene {
            let store = Arc::clone(self.tools.store());
            let sid = self.id.clone();
            let scene = scene.clone();
            self.writer.spawn("save_snapshot", async move {
                store.save_snapshot(&sid, seq, &scene).await
            });
        }
        for hazard in &response.hazards {
            self.tools.record_hazard(hazard);
            if hazard.urgency == Urgency::Critical {
                self.tools.publish_hazard(hazard.clone(), DISPATCH_SOURCE);
            }
        }
    }

    /// Retry failed handles in the background, spaced by `reopen_interval`.
    fn reopen_failed_handles(self: &Arc<Self>) {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.handle.lock().is_some() {
                continue;
            }
            {
                let mut last = slot.last_attempt.lock();
                if last.elapsed() < self.config.reopen_interval {
                    continue;
                }
                if slot.reopening.swap(true, Ordering::SeqCst) {
                    continue;
                }
                *last = Instant::now();
            }
            let session = Arc::clone(self);
            tokio::spawn(async move {
                let slot = &session.slots[index];
                let handle = tokio::select! {
                    _ = session.cancel.cancelled() => None,
                    handle = open_handle(&session.backend, slot.agent.as_ref(), &session.config) => handle,
                };
                if let Some(handle) = handle {
                    if session.is_closing() {
                        handle.close().await;
                    } else {
                        info!(session_id = %session.id, role = %slot.role(), "reasoning handle reopened");
                        *slot.handle.lock() = Some(handle);
                        session.refresh_state();
                    }
                }
                slot.reopening.store(false, Ordering::SeqCst);
            });
        }
    }

    /// Close handles and release context. Waits up to `close_grace` for an
    /// admitted dispatch, then cancels it. Safe to call more than once.
    pub async fn close(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }

        self.inflight.close();
        let grace = self.config.close_grace;
        if tokio::time::timeout(grace, self.inflight.wait()).await.is_err() {
            warn!(session_id = %self.id, grace_ms = grace.as_millis() as u64, "abandoning in-flight dispatch");
        }
        self.cancel.cancel();

        let handles: Vec<Arc<dyn ReasoningSession>> =
            self.slots.iter().filter_map(|s| s.handle.lock().take()).collect();
        join_all(handles.iter().map(|h| h.close())).await;

        let stats = {
            let mut context = self.context.lock();
            let stats = context.stats();
            context.clear();
            stats
        };

        let store = Arc::clone(self.tools.store());
        let sid = self.id.clone();
        let totals = self.counters.totals();
        self.writer.spawn("end_session", async move { store.end_session(&sid, totals).await });
        if !self.writer.drain_with_timeout(grace).await {
            warn!(session_id = %self.id, pending = self.writer.pending_count(), "persistence writes still pending at close");
        }

        *self.state.write() = SessionState::Closed;
        info!(
            session_id = %self.id,
            frames = totals.frames,
            hazards = totals.hazards,
            context_entries = stats.entry_count,
            "session closed"
        );
    }
}

/// An admitted event holding its place in the session's dispatch order.
/// Dropping it without running gives the place up.
pub struct Admission {
    session: Arc<Session>,
    turn: Turn,
    event: InboundEvent,
}

impl Admission {
    pub fn frame_seq(&self) -> u64 {
        self.turn.seq
    }

    pub async fn run(self) -> Result<MergedResponse, EngineError> {
        let Admission { session, turn, event } = self;
        session.inflight.track_future(session.run(turn, event)).await
    }
}

struct Turn {
    seq: u64,
    order: Arc<TurnOrder>,
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.order.finish(self.seq);
    }
}

/// Lets dispatches through strictly in sequence order. A turn that ends
/// early is remembered until every earlier turn has ended too.
struct TurnOrder {
    state: Mutex<TurnState>,
    changed: Notify,
}

struct TurnState {
    next: u64,
    finished: BTreeSet<u64>,
}

impl TurnOrder {
    fn new() -> Self {
        Self {
            state: Mutex::new(TurnState {
                next: 1,
                finished: BTreeSet::new(),
            }),
            changed: Notify::new(),
        }
    }

    async fn wait(&self, seq: u64) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().next >= seq {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self, seq: u64) {
        {
            let mut state = self.state.lock();
            state.finished.insert(seq);
            loop {
                let next = state.next;
                if !state.finished.remove(&next) {
                    break;
                }
                state.next += 1;
            }
        }
        self.changed.notify_waiters();
    }
}

async fn open_handle(
    backend: &Arc<dyn ReasoningBackend>,
    agent: &dyn Agent,
    config: &EngineConfig,
) -> Option<Arc<dyn ReasoningSession>> {
    let role = agent.role();
    let open = backend.open(agent.session_config(&config.backend));
    match tokio::time::timeout(config.open_timeout, open).await {
        Ok(Ok(handle)) => Some(handle),
        Ok(Err(e)) => {
            warn!(role = %role, error = %e, kind = e.error_kind(), "failed to open reasoning handle");
            None
        }
        Err(_) => {
            warn!(role = %role, timeout_ms = config.open_timeout.as_millis() as u64, "opening reasoning handle timed out");
            None
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
