use chrono::Utc;
use serde::{Deserialize, Serialize};

use navi_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;

/// One row per client connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NavigationSessionRecord {
    pub session_id: SessionId,
    pub user_id: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub total_frames: i64,
    pub total_hazards: i64,
}

/// Counters written when a session ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionTotals {
    pub frames: u64,
    pub hazards: u64,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, session_id: &SessionId, user_id: Option<&str>) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO navigation_sessions (session_id, user_id, started_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![session_id.as_str(), user_id, now],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("session {session_id} already exists")));
            }
            Ok(())
        })
    }

    pub fn end(&self, session_id: &SessionId, totals: SessionTotals) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE navigation_sessions
                 SET ended_at = ?2, total_frames = ?3, total_hazards = ?4
                 WHERE session_id = ?1",
                rusqlite::params![
                    session_id.as_str(),
                    now,
                    totals.frames as i64,
                    totals.hazards as i64
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            Ok(())
        })
    }

    pub fn get(&self, session_id: &SessionId) -> Result<NavigationSessionRecord, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT session_id, user_id, started_at, ended_at, total_frames, total_hazards
                 FROM navigation_sessions WHERE session_id = ?1",
                [session_id.as_str()],
                |row| {
                    Ok(NavigationSessionRecord {
                        session_id: SessionId::from_raw(row.get::<_, String>(0)?),
                        user_id: row.get(1)?,
                        started_at: row.get(2)?,
                        ended_at: row.get(3)?,
                        total_frames: row.get(4)?,
                        total_hazards: row.get(5)?,
                    })
                },
            )
            .map_err(|_| StoreError::NotFound(format!("session {session_id}")))
        })
    }
}
