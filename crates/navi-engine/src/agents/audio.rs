//! Audio cue parameterization.
//!
//! A pure mapping from the scene and hazard results of the same dispatch to
//! rendering parameters. Hazards at high urgency or above steer the cue;
//! otherwise it follows the clear path.

use navi_core::errors::AgentError;
use navi_core::results::{AudioParams, Hazard, HazardReport, SceneReport, Urgency};

pub const MIN_TONE_HZ: u32 = 200;
pub const MAX_TONE_HZ: u32 = 1200;
pub const MIN_CADENCE_BPM: u32 = 40;
pub const MAX_CADENCE_BPM: u32 = 160;

/// Stereo position for a bearing word. Unknown words stay centered.
pub fn pan_for(bearing: &str) -> f32 {
    let b = bearing.trim().to_ascii_lowercase().replace(['_', ' '], "-");
    match b.as_str() {
        "hard-left" | "far-left" | "west" => -1.0,
        "left" | "to-the-left" => -0.7,
        "forward-left" | "ahead-left" | "front-left" | "slight-left" | "left-center" => -0.35,
        "forward-right" | "ahead-right" | "front-right" | "slight-right" | "right-center" => 0.35,
        "right" | "to-the-right" => 0.7,
        "hard-right" | "far-right" | "east" => 1.0,
        _ if b.contains("left") => -0.5,
        _ if b.contains("right") => 0.5,
        _ => 0.0,
    }
}

fn volume_and_tone(urgency: Option<Urgency>) -> (f32, u32) {
    match urgency {
        Some(Urgency::Critical) => (1.0, 1000),
        Some(Urgency::High) => (0.8, 800),
        Some(Urgency::Medium) => (0.6, 600),
        Some(Urgency::Low) => (0.4, 440),
        None => (0.5, 440),
    }
}

fn cadence_for(distance_feet: Option<f64>) -> u32 {
    let bpm = match distance_feet {
        Some(d) if d <= 3.0 => 140,
        Some(d) if d <= 6.0 => 110,
        Some(d) if d <= 10.0 => 80,
        _ => 60,
    };
    bpm.clamp(MIN_CADENCE_BPM, MAX_CADENCE_BPM)
}

/// Most urgent hazard across both reports, nearest first on ties.
fn leading_hazard<'a>(scene: Option<&'a SceneReport>, hazard: Option<&'a HazardReport>) -> Option<&'a Hazard> {
    let scene_hazards = scene.map(|s| s.floor_hazards.as_slice()).unwrap_or_default();
    let reported = hazard.map(|h| h.hazards.as_slice()).unwrap_or_default();
    scene_hazards.iter().chain(reported).max_by(|a, b| {
        a.urgency.cmp(&b.urgency).then_with(|| {
            let da = a.distance_feet.unwrap_or(f64::MAX);
            let db = b.distance_feet.unwrap_or(f64::MAX);
            db.total_cmp(&da)
        })
    })
}

pub fn derive(scene: Option<&SceneReport>, hazard: Option<&HazardReport>) -> Result<AudioParams, AgentError> {
    if scene.is_none() && hazard.is_none() {
        return Err(AgentError::UpstreamMissing);
    }

    let lead = leading_hazard(scene, hazard);
    let clear_path = scene.and_then(|s| s.clear_path.as_ref());
    let steering = lead.filter(|h| h.urgency >= Urgency::High);

    let (pan, distance) = match (steering, clear_path) {
        (Some(h), _) => (h.bearing.as_deref().map(pan_for).unwrap_or(0.0), h.distance_feet),
        (None, Some(path)) => (pan_for(&path.bearing), path.distance_feet),
        (None, None) => (0.0, lead.and_then(|h| h.distance_feet)),
    };
    let (volume, tone_hz) = volume_and_tone(lead.map(|h| h.urgency));

    let voice_instruction = hazard
        .and_then(|h| h.recommended_action.clone())
        .filter(|a| !a.is_empty())
        .or_else(|| {
            clear_path.map(|p| match p.distance_feet {
                Some(d) => format!("Clear path {}, about {} feet", p.bearing, d.round()),
                None => format!("Clear path {}", p.bearing),
            })
        })
        .or_else(|| scene.and_then(|s| s.summary.clone()))
        .unwrap_or_default();

    Ok(AudioParams {
        pan: pan.clamp(-1.0, 1.0),
        volume: volume.clamp(0.0, 1.0),
        tone_hz: tone_hz.clamp(MIN_TONE_HZ, MAX_TONE_HZ),
        cadence_bpm: cadence_for(distance),
        voice_instruction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use navi_core::results::ClearPath;

    fn scene(bearing: &str, distance: f64) -> SceneReport {
        SceneReport {
            clear_path: Some(ClearPath {
                bearing: bearing.into(),
                distance_feet: Some(distance),
            }),
            confidence: 0.9,
            ..SceneReport::default()
        }
    }

    fn hazard(kind: &str, bearing: &str, distance: f64, urgency: Urgency) -> Hazard {
        Hazard {
            kind: kind.into(),
            bearing: Some(bearing.into()),
            distance_feet: Some(distance),
            urgency,
            approach: None,
        }
    }

    #[test]
    fn follows_clear_path_when_calm() {
        let params = derive(Some(&scene("forward-right", 12.0)), None).unwrap();
        assert_eq!(params.pan, 0.35);
        assert_eq!(params.volume, 0.5);
        assert_eq!(params.cadence_bpm, 60);
        assert_eq!(params.voice_instruction, "Clear path forward-right, about 12 feet");
    }

    #[test]
    fn urgent_hazard_steers_the_cue() {
        let report = HazardReport {
            hazards: vec![
                hazard("cone", "right", 9.0, Urgency::Medium),
                hazard("cyclist", "left", 3.0, Urgency::Critical),
            ],
            safe: false,
            recommended_action: Some("Stop now".into()),
        };
        let params = derive(Some(&scene("forward", 20.0)), Some(&report)).unwrap();
        assert_eq!(params.pan, -0.7);
        assert_eq!(params.volume, 1.0);
        assert_eq!(params.tone_hz, 1000);
        assert_eq!(params.cadence_bpm, 140);
        assert_eq!(params.voice_instruction, "Stop now");
    }

    #[test]
    fn medium_hazard_raises_volume_without_steering() {
        let report = HazardReport {
            hazards: vec![hazard("sign", "hard-right", 5.0, Urgency::Medium)],
            safe: true,
            recommended_action: None,
        };
        let params = derive(Some(&scene("left", 8.0)), Some(&report)).unwrap();
        assert_eq!(params.pan, -0.7);
        assert_eq!(params.volume, 0.6);
        assert_eq!(params.cadence_bpm, 80);
    }

    #[test]
    fn parameters_stay_in_range() {
        let report = HazardReport {
            hazards: vec![hazard("wall", "somewhere", 0.5, Urgency::High)],
            safe: false,
            recommended_action: None,
        };
        let params = derive(None, Some(&report)).unwrap();
        assert!((-1.0..=1.0).contains(&params.pan));
        assert!((MIN_TONE_HZ..=MAX_TONE_HZ).contains(&params.tone_hz));
        assert!((MIN_CADENCE_BPM..=MAX_CADENCE_BPM).contains(&params.cadence_bpm));
        assert_eq!(params.voice_instruction, "");
    }

    #[test]
    fn needs_at_least_one_upstream_result() {
        assert!(matches!(derive(None, None), Err(AgentError::UpstreamMissing)));
    }

    #[test]
    fn bearing_words() {
        assert_eq!(pan_for("Left"), -0.7);
        assert_eq!(pan_for("slight right"), 0.35);
        assert_eq!(pan_for("ahead"), 0.0);
        assert_eq!(pan_for("back-left"), -0.5);
    }
}
