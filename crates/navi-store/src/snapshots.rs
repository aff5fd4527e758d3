use chrono::Utc;
use serde::{Deserialize, Serialize};

use navi_core::ids::SessionId;
use navi_core::results::SceneReport;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneSnapshotRecord {
    pub id: i64,
    pub session_id: SessionId,
    pub frame_seq: u64,
    pub captured_at: String,
    pub scene: SceneReport,
    pub confidence: f64,
    pub clear_path_direction: Option<String>,
    pub clear_path_distance_ft: Option<f64>,
}

pub struct SnapshotRepo {
    db: Database,
}

impl SnapshotRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn save(
        &self,
        session_id: &SessionId,
        frame_seq: u64,
        scene: &SceneReport,
    ) -> Result<i64, StoreError> {
        let json = serde_json::to_string(scene)?;
        let now = Utc::now().to_rfc3339();
        let (direction, distance) = match &scene.clear_path {
            Some(p) => (Some(p.bearing.clone()), p.distance_feet),
            None => (None, None),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scene_snapshots
                 (session_id, frame_seq, captured_at, scene_json, confidence, clear_path_direction, clear_path_distance_ft)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    session_id.as_str(),
                    frame_seq as i64,
                    now,
                    json,
                    scene.confidence,
                    direction,
                    distance,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Most recent snapshots first.
    pub fn recent(&self, session_id: &SessionId, limit: u32) -> Result<Vec<SceneSnapshotRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, frame_seq, captured_at, scene_json, confidence,
                        clear_path_direction, clear_path_distance_ft
                 FROM scene_snapshots WHERE session_id = ?1
                 ORDER BY frame_seq DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![session_id.as_str(), limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<f64>>(7)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, sid, seq, at, json, confidence, dir, dist)| {
                    Ok(SceneSnapshotRecord {
                        id,
                        session_id: SessionId::from_raw(sid),
                        frame_seq: seq as u64,
                        captured_at: at,
                        scene: serde_json::from_str(&json)?,
                        confidence,
                        clear_path_direction: dir,
                        clear_path_distance_ft: dist,
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navi_core::results::ClearPath;

    #[test]
    fn save_and_read_back_newest_first() {
        let repo = SnapshotRepo::new(Database::in_memory().unwrap());
        let sid = SessionId::new();
        for seq in 1..=3 {
            let scene = SceneReport {
                clear_path: Some(ClearPath { bearing: "forward".into(), distance_feet: Some(seq as f64) }),
                confidence: 0.5,
                summary: Some(format!("frame {seq}")),
                ..Default::default()
            };
            repo.save(&sid, seq, &scene).unwrap();
        }
        let recent = repo.recent(&sid, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].frame_seq, 3);
        assert_eq!(recent[0].clear_path_distance_ft, Some(3.0));
        assert_eq!(recent[1].scene.summary.as_deref(), Some("frame 2"));
    }

    #[test]
    fn snapshots_are_session_scoped() {
        let repo = SnapshotRepo::new(Database::in_memory().unwrap());
        let a = SessionId::new();
        repo.save(&a, 1, &SceneReport::default()).unwrap();
        assert!(repo.recent(&SessionId::new(), 10).unwrap().is_empty());
    }
}
