//! Folding per-role outputs into one [`MergedResponse`].

use std::collections::HashMap;

use navi_core::ids::SessionId;
use navi_core::results::{Hazard, LastKnownGood, MergedResponse, ResponseKind, RoleOutput};
use navi_core::roles::AgentRole;

/// Highest confidence a merged response may claim.
pub const CONFIDENCE_CAP: f64 = 0.95;

/// Dispatch metadata carried into the merge.
#[derive(Clone, Debug)]
pub struct MergeInput<'a> {
    pub kind: ResponseKind,
    pub session_id: &'a SessionId,
    pub frame_seq: u64,
    pub latency_ms: u64,
    /// Every role the routing table selected, including ones that failed.
    pub selected: &'a [AgentRole],
}

/// Merge successful outputs. Top-level fields come from the highest-priority
/// role that has them; gaps left by failed roles are filled from `lkg`.
/// With no outputs at all, the result is the safe fallback.
pub fn merge(input: MergeInput<'_>, mut outputs: Vec<RoleOutput>, lkg: &LastKnownGood) -> MergedResponse {
    if outputs.is_empty() {
        return MergedResponse::safe_fallback(input.session_id.clone(), input.frame_seq, input.latency_ms);
    }
    outputs.sort_by_key(|o| o.role().priority());

    let mut response = MergedResponse::empty(input.kind, input.session_id.clone(), input.frame_seq);
    response.latency_ms = input.latency_ms;
    response.direction = outputs.iter().find_map(|o| o.direction()).map(str::to_string);
    response.distance_feet = outputs.iter().find_map(|o| o.distance_feet());
    response.summary = outputs.iter().find_map(|o| o.summary()).map(str::to_string);
    response.instruction = outputs.iter().find_map(|o| o.instruction()).map(str::to_string);
    response.confidence = outputs
        .iter()
        .filter_map(|o| o.confidence())
        .reduce(f64::min)
        .map(|c| c.min(CONFIDENCE_CAP));
    response.hazards = union_hazards(outputs.iter().flat_map(|o| o.hazards()));

    for output in outputs {
        response.roles.insert(output);
    }
    response.omitted_roles = input
        .selected
        .iter()
        .copied()
        .filter(|r| !response.roles.contains(*r))
        .collect();

    if !response.omitted_roles.is_empty() {
        backfill(&mut response, lkg);
    }
    response
}

fn backfill(response: &mut MergedResponse, lkg: &LastKnownGood) {
    if response.direction.is_none() {
        if let Some(d) = &lkg.direction {
            response.direction = Some(d.clone());
            response.backfilled.push("direction".into());
        }
    }
    if response.distance_feet.is_none() {
        if let Some(d) = lkg.distance_feet {
            response.distance_feet = Some(d);
            response.backfilled.push("distance_feet".into());
        }
    }
    if response.summary.is_none() {
        if let Some(s) = &lkg.summary {
            response.summary = Some(s.clone());
            response.backfilled.push("summary".into());
        }
    }
}

/// One entry per (type, bearing), keeping the most urgent, most urgent first.
fn union_hazards<'a>(hazards: impl Iterator<Item = &'a Hazard>) -> Vec<Hazard> {
    let mut order: Vec<(String, Option<String>)> = Vec::new();
    let mut best: HashMap<(String, Option<String>), Hazard> = HashMap::new();
    for hazard in hazards {
        let key = (
            hazard.kind.to_lowercase(),
            hazard.bearing.as_ref().map(|b| b.to_lowercase()),
        );
        match best.get(&key) {
            Some(existing) if existing.urgency >= hazard.urgency => {}
            Some(_) => {
                best.insert(key, hazard.clone());
            }
            None => {
                order.push(key.clone());
                best.insert(key, hazard.clone());
            }
        }
    }
    let mut merged: Vec<Hazard> = order.into_iter().filter_map(|k| best.remove(&k)).collect();
    merged.sort_by(|a, b| b.urgency.cmp(&a.urgency));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use navi_core::results::{
        safe_fallback_payload, AudioParams, ClearPath, HazardReport, RouteStep, SceneReport, Urgency,
    };

    fn sid() -> SessionId {
        SessionId::from_raw("nav_merge")
    }

    fn input<'a>(session_id: &'a SessionId, selected: &'a [AgentRole]) -> MergeInput<'a> {
        MergeInput {
            kind: ResponseKind::NavigationUpdate,
            session_id,
            frame_seq: 4,
            latency_ms: 120,
            selected,
        }
    }

    fn scene(bearing: &str, confidence: f64) -> RoleOutput {
        RoleOutput::Scene(SceneReport {
            clear_path: Some(ClearPath {
                bearing: bearing.into(),
                distance_feet: Some(10.0),
            }),
            summary: Some("hallway".into()),
            confidence,
            floor_hazards: vec![Hazard {
                kind: "Cable".into(),
                bearing: Some("center".into()),
                distance_feet: Some(2.0),
                urgency: Urgency::Medium,
                approach: None,
            }],
            ..SceneReport::default()
        })
    }

    fn hazards() -> RoleOutput {
        RoleOutput::Hazard(HazardReport {
            hazards: vec![
                Hazard {
                    kind: "cable".into(),
                    bearing: Some("Center".into()),
                    distance_feet: Some(2.0),
                    urgency: Urgency::High,
                    approach: None,
                },
                Hazard {
                    kind: "stairs".into(),
                    bearing: Some("ahead".into()),
                    distance_feet: Some(8.0),
                    urgency: Urgency::Low,
                    approach: None,
                },
            ],
            safe: false,
            recommended_action: Some("Step over the cable".into()),
        })
    }

    #[test]
    fn no_outputs_is_safe_fallback() {
        let id = sid();
        let r = merge(input(&id, &[AgentRole::Scene]), Vec::new(), &LastKnownGood::default());
        assert_eq!(r.payload(), safe_fallback_payload());
        assert_eq!(r.frame_seq, 4);
    }

    #[test]
    fn priority_decides_top_level_fields_regardless_of_order() {
        let id = sid();
        let selected = [AgentRole::Scene, AgentRole::Hazard, AgentRole::Audio];
        let audio = RoleOutput::Audio(AudioParams {
            pan: 0.0,
            volume: 0.5,
            tone_hz: 440,
            cadence_bpm: 60,
            voice_instruction: "Clear path forward".into(),
        });
        let a = merge(input(&id, &selected), vec![audio.clone(), scene("forward", 0.9), hazards()], &LastKnownGood::default());
        let b = merge(input(&id, &selected), vec![hazards(), audio, scene("forward", 0.9)], &LastKnownGood::default());
        assert_eq!(a, b);
        assert_eq!(a.instruction.as_deref(), Some("Step over the cable"));
        assert_eq!(a.direction.as_deref(), Some("forward"));
        assert!(a.omitted_roles.is_empty());
    }

    #[test]
    fn hazards_are_deduplicated_and_ordered() {
        let id = sid();
        let r = merge(
            input(&id, &[AgentRole::Scene, AgentRole::Hazard]),
            vec![scene("left", 0.9), hazards()],
            &LastKnownGood::default(),
        );
        assert_eq!(r.hazards.len(), 2);
        assert_eq!(r.hazards[0].urgency, Urgency::High);
        assert_eq!(r.hazards[1].kind, "stairs");
    }

    #[test]
    fn confidence_is_minimum_and_capped() {
        let id = sid();
        let route = RoleOutput::Route(RouteStep {
            bearing: "right".into(),
            confidence: 0.99,
            ..RouteStep::default()
        });
        let r = merge(input(&id, &[AgentRole::Route]), vec![route], &LastKnownGood::default());
        assert_eq!(r.confidence, Some(CONFIDENCE_CAP));

        let r = merge(
            input(&id, &[AgentRole::Scene, AgentRole::Route]),
            vec![scene("left", 0.6), RoleOutput::Route(RouteStep { confidence: 0.8, ..RouteStep::default() })],
            &LastKnownGood::default(),
        );
        assert_eq!(r.confidence, Some(0.6));
    }

    #[test]
    fn partial_failure_backfills_from_last_known_good() {
        let id = sid();
        let lkg = LastKnownGood {
            direction: Some("forward-left".into()),
            distance_feet: Some(14.0),
            summary: Some("lobby".into()),
            updated_at: None,
        };
        let r = merge(input(&id, &[AgentRole::Scene, AgentRole::Hazard]), vec![hazards()], &lkg);
        assert_eq!(r.omitted_roles, vec![AgentRole::Scene]);
        assert_eq!(r.direction.as_deref(), Some("forward-left"));
        assert_eq!(r.distance_feet, Some(14.0));
        assert_eq!(r.backfilled, vec!["direction", "distance_feet", "summary"]);
        assert!(r.roles.scene.is_none());
    }

    #[test]
    fn complete_dispatch_never_backfills() {
        let id = sid();
        let lkg = LastKnownGood {
            summary: Some("stale".into()),
            ..LastKnownGood::default()
        };
        let r = merge(input(&id, &[AgentRole::Hazard]), vec![hazards()], &lkg);
        assert!(r.summary.is_none());
        assert!(r.backfilled.is_empty());
    }
}
