use chrono::Utc;
use serde::{Deserialize, Serialize};

use navi_core::ids::SessionId;
use navi_core::results::Hazard;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HazardEventRecord {
    pub id: i64,
    pub session_id: SessionId,
    pub detected_at: String,
    pub hazard_type: String,
    pub direction: Option<String>,
    pub distance_feet: Option<f64>,
    pub urgency: String,
}

pub struct HazardRepo {
    db: Database,
}

impl HazardRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn save(&self, session_id: &SessionId, hazard: &Hazard) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO hazard_events (session_id, detected_at, hazard_type, direction, distance_feet, urgency)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    session_id.as_str(),
                    now,
                    hazard.kind,
                    hazard.bearing,
                    hazard.distance_feet,
                    hazard.urgency.as_str(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn for_session(&self, session_id: &SessionId) -> Result<Vec<HazardEventRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, detected_at, hazard_type, direction, distance_feet, urgency
                 FROM hazard_events WHERE session_id = ?1 ORDER BY id DESC",
            )?;
            let rows = stmt
                .query_map([session_id.as_str()], |row| {
                    Ok(HazardEventRecord {
                        id: row.get(0)?,
                        session_id: SessionId::from_raw(row.get::<_, String>(1)?),
                        detected_at: row.get(2)?,
                        hazard_type: row.get(3)?,
                        direction: row.get(4)?,
                        distance_feet: row.get(5)?,
                        urgency: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navi_core::results::Urgency;

    #[test]
    fn saves_hazard_fields() {
        let repo = HazardRepo::new(Database::in_memory().unwrap());
        let sid = SessionId::new();
        repo.save(
            &sid,
            &Hazard {
                kind: "stairs".into(),
                bearing: Some("ahead".into()),
                distance_feet: Some(8.0),
                urgency: Urgency::High,
                approach: None,
            },
        )
        .unwrap();
        let rows = repo.for_session(&sid).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].hazard_type, "stairs");
        assert_eq!(rows[0].urgency, "high");
        assert_eq!(rows[0].distance_feet, Some(8.0));
    }
}
