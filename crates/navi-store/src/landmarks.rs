use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use navi_core::ids::SessionId;
use navi_core::results::LandmarkRef;

use crate::database::Database;
use crate::error::StoreError;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Landmark as reported by a scene or a tool call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewLandmark {
    pub label: String,
    pub description: Option<String>,
    pub direction: Option<String>,
    pub distance_feet: Option<f64>,
    pub frame_seq: u64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandmarkRecord {
    pub id: i64,
    pub session_id: SessionId,
    pub label: String,
    pub description: Option<String>,
    pub direction: Option<String>,
    pub distance_feet: Option<f64>,
    pub frame_seq: u64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub first_seen: String,
    pub last_seen: String,
    pub sightings: i64,
}

impl LandmarkRecord {
    pub fn to_ref(&self) -> LandmarkRef {
        LandmarkRef {
            label: self.label.clone(),
            description: self.description.clone(),
            bearing: self.direction.clone(),
            distance_feet: self.distance_feet,
            last_seen: DateTime::parse_from_rfc3339(&self.last_seen)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    /// Great-circle distance to a point, when this landmark has coordinates.
    pub fn metres_from(&self, lat: f64, lon: f64) -> Option<f64> {
        Some(haversine_m(self.lat?, self.lon?, lat, lon))
    }
}

pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lon2 - lon1).to_radians();
    let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

const SELECT_COLUMNS: &str = "SELECT id, session_id, label, description, direction, distance_feet,
        frame_seq, lat, lon, first_seen, last_seen, sightings FROM spatial_landmarks";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LandmarkRecord> {
    Ok(LandmarkRecord {
        id: row.get(0)?,
        session_id: SessionId::from_raw(row.get::<_, String>(1)?),
        label: row.get(2)?,
        description: row.get(3)?,
        direction: row.get(4)?,
        distance_feet: row.get(5)?,
        frame_seq: row.get::<_, i64>(6)? as u64,
        lat: row.get(7)?,
        lon: row.get(8)?,
        first_seen: row.get(9)?,
        last_seen: row.get(10)?,
        sightings: row.get(11)?,
    })
}

/// Labels are compared case-insensitively with surrounding whitespace ignored.
pub fn normalize_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

pub struct LandmarkRepo {
    db: Database,
}

impl LandmarkRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a landmark, or refresh `last_seen` and the latest position for
    /// a label already known in this session.
    pub fn upsert(&self, session_id: &SessionId, landmark: &NewLandmark) -> Result<LandmarkRecord, StoreError> {
        let label = normalize_label(&landmark.label);
        if label.is_empty() {
            return Err(StoreError::Conflict("landmark label is empty".into()));
        }
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO spatial_landmarks
                 (session_id, label, description, direction, distance_feet, frame_seq, lat, lon, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT (session_id, label) DO UPDATE SET
                     description = COALESCE(excluded.description, description),
                     direction = COALESCE(excluded.direction, direction),
                     distance_feet = COALESCE(excluded.distance_feet, distance_feet),
                     frame_seq = excluded.frame_seq,
                     lat = COALESCE(excluded.lat, lat),
                     lon = COALESCE(excluded.lon, lon),
                     last_seen = excluded.last_seen,
                     sightings = sightings + 1",
                rusqlite::params![
                    session_id.as_str(),
                    label,
                    landmark.description,
                    landmark.direction,
                    landmark.distance_feet,
                    landmark.frame_seq as i64,
                    landmark.lat,
                    landmark.lon,
                    now,
                ],
            )?;
            let record = conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE session_id = ?1 AND label = ?2"),
                rusqlite::params![session_id.as_str(), label],
                row_to_record,
            )?;
            Ok(record)
        })
    }

    /// Exact (normalized) label match.
    pub fn find_exact(&self, session_id: &SessionId, label: &str) -> Result<Option<LandmarkRecord>, StoreError> {
        let label = normalize_label(label);
        self.db.with_conn(|conn| {
            match conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE session_id = ?1 AND label = ?2"),
                rusqlite::params![session_id.as_str(), label],
                row_to_record,
            ) {
                Ok(r) => Ok(Some(r)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Substring match on label or description, most recently seen first.
    pub fn search(&self, session_id: &SessionId, query: &str, limit: u32) -> Result<Vec<LandmarkRecord>, StoreError> {
        let pattern = format!("%{}%", normalize_label(query));
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE session_id = ?1
                 AND (label LIKE ?2 OR lower(COALESCE(description, '')) LIKE ?2)
                 ORDER BY last_seen DESC, id DESC LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![session_id.as_str(), pattern, limit], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Landmarks within `radius_m` of a point, nearest first.
    pub fn near(
        &self,
        session_id: &SessionId,
        lat: f64,
        lon: f64,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<LandmarkRecord>, StoreError> {
        let candidates = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE session_id = ?1 AND lat IS NOT NULL AND lon IS NOT NULL"
            ))?;
            let rows = stmt
                .query_map([session_id.as_str()], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut within: Vec<(f64, LandmarkRecord)> = candidates
            .into_iter()
            .filter_map(|r| r.metres_from(lat, lon).map(|d| (d, r)))
            .filter(|(d, _)| *d <= radius_m)
            .collect();
        within.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(within.into_iter().take(limit).map(|(_, r)| r).collect())
    }

    pub fn list(&self, session_id: &SessionId) -> Result<Vec<LandmarkRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY id ASC"))?;
            let rows = stmt
                .query_map([session_id.as_str()], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> LandmarkRepo {
        LandmarkRepo::new(Database::in_memory().unwrap())
    }

    fn landmark(label: &str) -> NewLandmark {
        NewLandmark {
            label: label.into(),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_refreshes_existing_label() {
        let repo = repo();
        let sid = SessionId::new();
        let first = repo
            .upsert(&sid, &NewLandmark { direction: Some("left".into()), ..landmark("Water Fountain") })
            .unwrap();
        assert_eq!(first.label, "water fountain");
        assert_eq!(first.sightings, 1);

        let second = repo
            .upsert(&sid, &NewLandmark { distance_feet: Some(15.0), ..landmark("water  fountain ") })
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.sightings, 2);
        assert_eq!(second.direction.as_deref(), Some("left"));
        assert_eq!(second.distance_feet, Some(15.0));
        assert_eq!(repo.list(&sid).unwrap().len(), 1);
    }

    #[test]
    fn empty_label_rejected() {
        assert!(repo().upsert(&SessionId::new(), &landmark("   ")).is_err());
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let repo = repo();
        let sid = SessionId::new();
        repo.upsert(&sid, &landmark("water fountain")).unwrap();
        assert!(repo.find_exact(&sid, "Water Fountain").unwrap().is_some());
        assert!(repo.find_exact(&sid, "fountain").unwrap().is_none());
        assert!(repo.find_exact(&SessionId::new(), "water fountain").unwrap().is_none());
    }

    #[test]
    fn substring_search_covers_description() {
        let repo = repo();
        let sid = SessionId::new();
        repo.upsert(&sid, &landmark("water fountain")).unwrap();
        repo.upsert(
            &sid,
            &NewLandmark { description: Some("Next to the Elevator bank".into()), ..landmark("bench") },
        )
        .unwrap();
        repo.upsert(&sid, &landmark("exit sign")).unwrap();

        let hits = repo.search(&sid, "fountain", 5).unwrap();
        assert_eq!(hits.len(), 1);
        let hits = repo.search(&sid, "elevator", 5).unwrap();
        assert_eq!(hits[0].label, "bench");
    }

    #[test]
    fn proximity_filters_and_sorts() {
        let repo = repo();
        let sid = SessionId::new();
        repo.upsert(&sid, &NewLandmark { lat: Some(37.7750), lon: Some(-122.4194), ..landmark("near door") })
            .unwrap();
        repo.upsert(&sid, &NewLandmark { lat: Some(37.7752), lon: Some(-122.4194), ..landmark("close kiosk") })
            .unwrap();
        repo.upsert(&sid, &NewLandmark { lat: Some(37.7800), lon: Some(-122.4194), ..landmark("far cafe") })
            .unwrap();
        repo.upsert(&sid, &landmark("no coordinates")).unwrap();

        let hits = repo.near(&sid, 37.7750, -122.4194, 50.0, 10).unwrap();
        let labels: Vec<_> = hits.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["near door", "close kiosk"]);
    }

    #[test]
    fn haversine_sanity() {
        // 0.001 degrees of latitude is about 111 m.
        let d = haversine_m(0.0, 0.0, 0.001, 0.0);
        assert!((d - 111.19).abs() < 0.5, "got {d}");
    }

    #[test]
    fn to_ref_parses_last_seen() {
        let repo = repo();
        let sid = SessionId::new();
        let rec = repo.upsert(&sid, &landmark("door")).unwrap();
        let r = rec.to_ref();
        assert_eq!(r.label, "door");
        assert!(r.last_seen.is_some());
    }
}
