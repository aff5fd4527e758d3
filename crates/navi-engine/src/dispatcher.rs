//! Concurrent fan-out of one inbound event to the agents its type selects.
//!
//! Every selected agent runs in its own task under a shared deadline. A
//! failure, panic or timeout in one agent becomes an absent result for that
//! role and never disturbs its siblings. The derived audio role is computed
//! once the sensing roles have joined or the deadline has passed.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use navi_core::errors::{AgentError, BackendError};
use navi_core::events::InboundEvent;
use navi_core::ids::SessionId;
use navi_core::results::{LastKnownGood, MergedResponse, ResponseKind, RoleOutput};
use navi_core::roles::AgentRole;

use crate::agents::{audio, recall, Agent, AgentContext, AgentReport};
use crate::context::NewEntry;
use crate::merge::{merge, MergeInput};

/// Which roles an event activates and how the response is tagged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    pub kind: ResponseKind,
    /// Roles that need a reasoning handle.
    pub sensing: Vec<AgentRole>,
    /// Whether audio parameters are derived from the sensing results.
    pub derive_audio: bool,
}

impl Plan {
    pub fn for_event(event: &InboundEvent) -> Self {
        match event {
            InboundEvent::VideoFrame(_) => Self {
                kind: ResponseKind::NavigationUpdate,
                sensing: vec![AgentRole::Scene, AgentRole::Hazard],
                derive_audio: true,
            },
            InboundEvent::AudioChunk(_) => Self {
                kind: ResponseKind::HazardUpdate,
                sensing: vec![AgentRole::Hazard],
                derive_audio: false,
            },
            InboundEvent::TextQuery(_) | InboundEvent::VoiceCommand(_) => {
                let is_recall = event.query_text().is_some_and(recall::is_recall_query);
                if is_recall {
                    Self {
                        kind: ResponseKind::RecallAnswer,
                        sensing: vec![AgentRole::Recall],
                        derive_audio: false,
                    }
                } else {
                    Self {
                        kind: ResponseKind::RouteGuidance,
                        sensing: vec![AgentRole::Route],
                        derive_audio: false,
                    }
                }
            }
        }
    }

    /// Every selected role, derived ones included.
    pub fn selected(&self) -> Vec<AgentRole> {
        let mut roles = self.sensing.clone();
        if self.derive_audio {
            roles.push(AgentRole::Audio);
        }
        roles
    }
}

/// How one agent invocation ended.
#[derive(Debug)]
pub enum AgentOutcome {
    Completed(AgentReport),
    Failed(AgentError),
    TimedOut,
    Crashed(String),
}

impl AgentOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "ok",
            Self::Failed(_) => "error",
            Self::TimedOut => "timed_out",
            Self::Crashed(_) => "crashed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// An agent with the context it runs against for this dispatch.
pub struct Participant {
    pub agent: Arc<dyn Agent>,
    pub ctx: AgentContext,
}

/// Result of one dispatch: the response to deliver plus the context entries
/// that successful agents proposed.
#[derive(Debug)]
pub struct Dispatched {
    pub response: MergedResponse,
    pub entries: Vec<NewEntry>,
    pub outcomes: Vec<(AgentRole, &'static str)>,
}

#[derive(Clone, Debug)]
pub struct Dispatcher {
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the planned agents and merge what they produce. Participants for
    /// roles outside the plan are ignored; planned roles without a
    /// participant count as failed.
    pub async fn dispatch(
        &self,
        session_id: &SessionId,
        frame_seq: u64,
        event: Arc<InboundEvent>,
        participants: Vec<Participant>,
        lkg: &Mutex<LastKnownGood>,
        cancel: &CancellationToken,
    ) -> Dispatched {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let plan = Plan::for_event(&event);

        let mut set = JoinSet::new();
        let mut pending = BTreeSet::new();
        for Participant { agent, ctx } in participants {
            let role = agent.role();
            if !plan.sensing.contains(&role) || !pending.insert(role) {
                continue;
            }
            let event = Arc::clone(&event);
            let cancel = cancel.clone();
            set.spawn(async move {
                let run = AssertUnwindSafe(agent.handle_event(&event, &ctx)).catch_unwind();
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => AgentOutcome::Failed(BackendError::SessionClosed.into()),
                    result = run => match result {
                        Ok(Ok(report)) => AgentOutcome::Completed(report),
                        Ok(Err(e)) => AgentOutcome::Failed(e),
                        Err(panic) => AgentOutcome::Crashed(panic_message(&panic)),
                    },
                };
                (role, outcome)
            });
        }

        let mut outcomes: Vec<(AgentRole, AgentOutcome)> = plan
            .sensing
            .iter()
            .filter(|r| !pending.contains(*r))
            .map(|r| (*r, AgentOutcome::Failed(AgentError::NoHandle(*r))))
            .collect();

        loop {
            match timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((role, outcome)))) => {
                    pending.remove(&role);
                    outcomes.push((role, outcome));
                }
                Ok(Some(Err(e))) => warn!(session_id = %session_id, error = %e, "agent task ended abnormally"),
                Ok(None) => break,
                Err(_) => {
                    set.abort_all();
                    break;
                }
            }
        }
        outcomes.extend(pending.into_iter().map(|r| (r, AgentOutcome::TimedOut)));

        if plan.derive_audio {
            let audio = {
                let scene = outcomes.iter().find_map(|(_, o)| match o {
                    AgentOutcome::Completed(AgentReport {
                        output: RoleOutput::Scene(s),
                        ..
                    }) => Some(s),
                    _ => None,
                });
                let hazard = outcomes.iter().find_map(|(_, o)| match o {
                    AgentOutcome::Completed(AgentReport {
                        output: RoleOutput::Hazard(h),
                        ..
                    }) => Some(h),
                    _ => None,
                });
                match audio::derive(scene, hazard) {
                    Ok(params) => AgentOutcome::Completed(AgentReport {
                        output: RoleOutput::Audio(params),
                        entries: Vec::new(),
                    }),
                    Err(e) => AgentOutcome::Failed(e),
                }
            };
            outcomes.push((AgentRole::Audio, audio));
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        let mut results = Vec::new();
        let mut entries = Vec::new();
        let mut labels = Vec::with_capacity(outcomes.len());
        for (role, outcome) in outcomes {
            labels.push((role, outcome.label()));
            match outcome {
                AgentOutcome::Completed(report) => {
                    results.push(report.output);
                    entries.extend(report.entries);
                }
                AgentOutcome::Failed(e) => {
                    warn!(session_id = %session_id, frame_seq, role = %role, error = %e, kind = e.error_kind(), "agent failed");
                }
                AgentOutcome::TimedOut => {
                    warn!(session_id = %session_id, frame_seq, role = %role, timeout_ms = self.timeout.as_millis() as u64, "agent timed out");
                }
                AgentOutcome::Crashed(msg) => {
                    warn!(session_id = %session_id, frame_seq, role = %role, panic = %msg, "agent crashed");
                }
            }
        }

        let selected = plan.selected();
        let response = {
            let lkg_guard = lkg.lock();
            merge(
                MergeInput {
                    kind: plan.kind,
                    session_id,
                    frame_seq,
                    latency_ms,
                    selected: &selected,
                },
                results,
                &lkg_guard,
            )
        };
        if !response.is_safe_fallback() {
            lkg.lock().absorb(&response);
        }

        info!(
            session_id = %session_id,
            frame_seq,
            kind = plan.kind.as_str(),
            outcomes = ?labels,
            elapsed_ms = latency_ms,
            "dispatch complete"
        );
        Dispatched {
            response,
            entries,
            outcomes: labels,
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::{runner, sqlite};
    use crate::agents::ContextView;
    use async_trait::async_trait;
    use navi_core::events::{AudioChunk, TextQuery, VideoFrame, VoiceCommand};
    use navi_core::results::{safe_fallback_payload, ClearPath, HazardReport, SceneReport};

    enum Behavior {
        Scene(&'static str),
        Safe,
        Fail,
        Panic,
        Sleep(Duration),
    }

    struct Stub {
        role: AgentRole,
        behavior: Behavior,
    }

    #[async_trait]
    impl Agent for Stub {
        fn role(&self) -> AgentRole {
            self.role
        }

        fn instruction(&self) -> &'static str {
            "stub"
        }

        async fn handle_event(&self, _: &InboundEvent, _: &AgentContext) -> Result<AgentReport, AgentError> {
            let output = match &self.behavior {
                Behavior::Scene(bearing) => RoleOutput::Scene(SceneReport {
                    clear_path: Some(ClearPath {
                        bearing: bearing.to_string(),
                        distance_feet: Some(6.0),
                    }),
                    confidence: 0.9,
                    ..SceneReport::default()
                }),
                Behavior::Safe => RoleOutput::Hazard(HazardReport {
                    safe: true,
                    ..HazardReport::default()
                }),
                Behavior::Fail => return Err(AgentError::Unparseable("garbage".into())),
                Behavior::Panic => panic!("agent blew up"),
                Behavior::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    RoleOutput::Hazard(HazardReport::default())
                }
            };
            Ok(AgentReport {
                output,
                entries: vec![NewEntry::observation(format!("{} done", self.role))],
            })
        }
    }

    fn participant(role: AgentRole, behavior: Behavior) -> Participant {
        Participant {
            agent: Arc::new(Stub { role, behavior }),
            ctx: AgentContext {
                session_id: SessionId::from_raw("nav_dispatch"),
                frame_seq: 1,
                handle: None,
                view: Arc::new(ContextView::default()),
                tools: runner(sqlite()),
                position: None,
            },
        }
    }

    fn frame() -> Arc<InboundEvent> {
        Arc::new(InboundEvent::VideoFrame(VideoFrame {
            data: "AAAA".into(),
            timestamp: None,
            mime: None,
            lat: None,
            lon: None,
        }))
    }

    async fn run(event: Arc<InboundEvent>, participants: Vec<Participant>, lkg: &Mutex<LastKnownGood>) -> Dispatched {
        Dispatcher::new(Duration::from_secs(3))
            .dispatch(
                &SessionId::from_raw("nav_dispatch"),
                1,
                event,
                participants,
                lkg,
                &CancellationToken::new(),
            )
            .await
    }

    #[test]
    fn routing_table() {
        assert_eq!(Plan::for_event(&frame()).selected(), vec![AgentRole::Scene, AgentRole::Hazard, AgentRole::Audio]);
        let audio = InboundEvent::AudioChunk(AudioChunk {
            data: "x".into(),
            timestamp: None,
            mime: None,
            image: None,
        });
        assert_eq!(Plan::for_event(&audio).selected(), vec![AgentRole::Hazard]);
        let route = InboundEvent::TextQuery(TextQuery {
            text: "take me to gate 12".into(),
            timestamp: None,
            current_scene: None,
        });
        let plan = Plan::for_event(&route);
        assert_eq!(plan.kind, ResponseKind::RouteGuidance);
        assert_eq!(plan.selected(), vec![AgentRole::Route]);
        let recall = InboundEvent::VoiceCommand(VoiceCommand {
            text: "Where was the elevator?".into(),
            timestamp: None,
        });
        let plan = Plan::for_event(&recall);
        assert_eq!(plan.kind, ResponseKind::RecallAnswer);
        assert_eq!(plan.selected(), vec![AgentRole::Recall]);
    }

    #[tokio::test]
    async fn all_roles_merge_and_derive_audio() {
        let lkg = Mutex::new(LastKnownGood::default());
        let out = run(
            frame(),
            vec![
                participant(AgentRole::Scene, Behavior::Scene("left")),
                participant(AgentRole::Hazard, Behavior::Safe),
            ],
            &lkg,
        )
        .await;
        assert_eq!(out.response.kind, ResponseKind::NavigationUpdate);
        assert!(out.response.omitted_roles.is_empty());
        let audio = out.response.roles.audio.as_ref().unwrap();
        assert_eq!(audio.pan, -0.7);
        assert_eq!(out.entries.len(), 2);
        assert_eq!(lkg.lock().direction.as_deref(), Some("left"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_agent_is_dropped_at_the_deadline() {
        let lkg = Mutex::new(LastKnownGood::default());
        let out = run(
            frame(),
            vec![
                participant(AgentRole::Scene, Behavior::Scene("forward")),
                participant(AgentRole::Hazard, Behavior::Sleep(Duration::from_secs(10))),
            ],
            &lkg,
        )
        .await;
        assert!(out.response.roles.scene.is_some());
        assert!(out.response.roles.hazard.is_none());
        assert_eq!(out.response.omitted_roles, vec![AgentRole::Hazard]);
        assert!(out.outcomes.contains(&(AgentRole::Hazard, "timed_out")));
        assert!(out.response.latency_ms >= 3000);
        assert!(out.response.latency_ms < 3100);
    }

    #[tokio::test]
    async fn panics_and_errors_are_isolated() {
        let lkg = Mutex::new(LastKnownGood::default());
        let out = run(
            frame(),
            vec![
                participant(AgentRole::Scene, Behavior::Panic),
                participant(AgentRole::Hazard, Behavior::Safe),
            ],
            &lkg,
        )
        .await;
        assert!(out.outcomes.contains(&(AgentRole::Scene, "crashed")));
        assert!(out.response.roles.hazard.is_some());
        assert!(out.response.roles.audio.is_some());
        assert_eq!(out.response.omitted_roles, vec![AgentRole::Scene]);
    }

    #[tokio::test]
    async fn total_failure_is_safe_fallback_and_keeps_last_known_good() {
        let lkg = Mutex::new(LastKnownGood {
            direction: Some("right".into()),
            ..LastKnownGood::default()
        });
        let out = run(
            frame(),
            vec![
                participant(AgentRole::Scene, Behavior::Fail),
                participant(AgentRole::Hazard, Behavior::Fail),
            ],
            &lkg,
        )
        .await;
        assert_eq!(out.response.payload(), safe_fallback_payload());
        assert!(out.outcomes.contains(&(AgentRole::Audio, "error")));
        assert_eq!(lkg.lock().direction.as_deref(), Some("right"));
        assert!(out.entries.is_empty());
    }

    #[tokio::test]
    async fn missing_participant_counts_as_omitted() {
        let lkg = Mutex::new(LastKnownGood {
            summary: Some("corridor".into()),
            ..LastKnownGood::default()
        });
        let out = run(frame(), vec![participant(AgentRole::Hazard, Behavior::Safe)], &lkg).await;
        assert_eq!(out.response.omitted_roles, vec![AgentRole::Scene]);
        assert_eq!(out.response.summary.as_deref(), Some("corridor"));
        assert!(out.outcomes.contains(&(AgentRole::Scene, "error")));
    }

    #[tokio::test]
    async fn cancellation_fails_running_agents() {
        let lkg = Mutex::new(LastKnownGood::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = Dispatcher::new(Duration::from_secs(3))
            .dispatch(
                &SessionId::from_raw("nav_dispatch"),
                1,
                frame(),
                vec![participant(AgentRole::Hazard, Behavior::Sleep(Duration::from_secs(1)))],
                &lkg,
                &cancel,
            )
            .await;
        assert!(out.response.is_safe_fallback());
        assert!(out.outcomes.contains(&(AgentRole::Hazard, "error")));
    }
}
