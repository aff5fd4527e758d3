use async_trait::async_trait;

use navi_core::ids::SessionId;
use navi_core::results::{Hazard, SceneReport};

use crate::database::Database;
use crate::error::StoreError;
use crate::hazards::HazardRepo;
use crate::landmarks::{LandmarkRecord, LandmarkRepo, NewLandmark};
use crate::sessions::{SessionRepo, SessionTotals};
use crate::snapshots::SnapshotRepo;

/// Persistence operations the orchestration core needs. Every query is
/// scoped to one navigation session.
#[async_trait]
pub trait NavigationStore: Send + Sync {
    async fn create_session(&self, session_id: &SessionId) -> Result<(), StoreError>;
    async fn end_session(&self, session_id: &SessionId, totals: SessionTotals) -> Result<(), StoreError>;
    async fn save_snapshot(&self, session_id: &SessionId, frame_seq: u64, scene: &SceneReport) -> Result<i64, StoreError>;
    async fn save_hazard(&self, session_id: &SessionId, hazard: &Hazard) -> Result<i64, StoreError>;
    async fn record_landmark(&self, session_id: &SessionId, landmark: &NewLandmark) -> Result<LandmarkRecord, StoreError>;
    async fn find_landmark(&self, session_id: &SessionId, label: &str) -> Result<Option<LandmarkRecord>, StoreError>;
    async fn search_landmarks(&self, session_id: &SessionId, query: &str, limit: u32) -> Result<Vec<LandmarkRecord>, StoreError>;
    async fn landmarks_near(
        &self,
        session_id: &SessionId,
        lat: f64,
        lon: f64,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<LandmarkRecord>, StoreError>;
}

/// SQLite-backed store. Queries run on the blocking pool so they never
/// stall the runtime threads driving websockets.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db)).await?
    }
}

#[async_trait]
impl NavigationStore for SqliteStore {
    async fn create_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        let sid = session_id.clone();
        self.blocking(move |db| SessionRepo::new(db).create(&sid, None)).await
    }

    async fn end_session(&self, session_id: &SessionId, totals: SessionTotals) -> Result<(), StoreError> {
        let sid = session_id.clone();
        self.blocking(move |db| SessionRepo::new(db).end(&sid, totals)).await
    }

    async fn save_snapshot(&self, session_id: &SessionId, frame_seq: u64, scene: &SceneReport) -> Result<i64, StoreError> {
        let sid = session_id.clone();
        let scene = scene.clone();
        self.blocking(move |db| SnapshotRepo::new(db).save(&sid, frame_seq, &scene)).await
    }

    async fn save_hazard(&self, session_id: &SessionId, hazard: &Hazard) -> Result<i64, StoreError> {
        let sid = session_id.clone();
        let hazard = hazard.clone();
        self.blocking(move |db| HazardRepo::new(db).save(&sid, &hazard)).await
    }

    async fn record_landmark(&self, session_id: &SessionId, landmark: &NewLandmark) -> Result<LandmarkRecord, StoreError> {
        let sid = session_id.clone();
        let landmark = landmark.clone();
        self.blocking(move |db| LandmarkRepo::new(db).upsert(&sid, &landmark)).await
    }

    async fn find_landmark(&self, session_id: &SessionId, label: &str) -> Result<Option<LandmarkRecord>, StoreError> {
        let sid = session_id.clone();
        let label = label.to_owned();
        self.blocking(move |db| LandmarkRepo::new(db).find_exact(&sid, &label)).await
    }

    async fn search_landmarks(&self, session_id: &SessionId, query: &str, limit: u32) -> Result<Vec<LandmarkRecord>, StoreError> {
        let sid = session_id.clone();
        let query = query.to_owned();
        self.blocking(move |db| LandmarkRepo::new(db).search(&sid, &query, limit)).await
    }

    async fn landmarks_near(
        &self,
        session_id: &SessionId,
        lat: f64,
        lon: f64,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<LandmarkRecord>, StoreError> {
        let sid = session_id.clone();
        self.blocking(move |db| LandmarkRepo::new(db).near(&sid, lat, lon, radius_m, limit)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn trait_object_round_trip() {
        let store: Arc<dyn NavigationStore> = Arc::new(SqliteStore::new(Database::in_memory().unwrap()));
        let sid = SessionId::new();
        store.create_session(&sid).await.unwrap();
        store
            .record_landmark(&sid, &NewLandmark { label: "water fountain".into(), ..Default::default() })
            .await
            .unwrap();
        let hit = store.find_landmark(&sid, "water fountain").await.unwrap();
        assert!(hit.is_some());
        store.end_session(&sid, SessionTotals { frames: 1, hazards: 0 }).await.unwrap();
    }

    #[tokio::test]
    async fn hazards_and_snapshots_persist() {
        let store = SqliteStore::new(Database::in_memory().unwrap());
        let sid = SessionId::new();
        let id = store.save_snapshot(&sid, 1, &SceneReport::default()).await.unwrap();
        assert!(id > 0);
        store
            .save_hazard(
                &sid,
                &Hazard {
                    kind: "cable".into(),
                    bearing: None,
                    distance_feet: None,
                    urgency: Default::default(),
                    approach: None,
                },
            )
            .await
            .unwrap();
        let rows = HazardRepo::new(store.database().clone()).for_session(&sid).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
