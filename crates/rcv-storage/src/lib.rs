use chrono::{DateTime, SecondsFormat, Utc};
use rcv_core::synthetics_contracts::SETTINGS_ROW_ID;
use rcv_core::{
    ActivitySummary, ActivityWindow, CleanupReport, ContentEngagement, JourneyInstance,
    JourneyStatus, MindblockEntry, MindblockEvent, MindblockSignalType, NewJourneyInstance,
    Organization, QueuedNotification, SceneEvent, SceneEventType, SeedJourneyRun, SimUser,
    SyntheticSettings,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

pub const SYNTHETICS_SCHEMA_VERSION: i64 = 3;
const JOURNEY_RUN_STATUS: &str = "running";
const SCENE_RUN_STATUS: &str = "completed";
const NOTIFICATION_AUDIENCE: &str = "user";
const NOTIFICATION_STATUS: &str = "queued";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

pub struct SyntheticsStore {
    conn: Connection,
}

impl SyntheticsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > SYNTHETICS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SYNTHETICS_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_synthetics_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_content_engagements.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
            current = 2;
        }

        if current < 3 {
            let sql = include_str!("../migrations/0003_seed_extras.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 3", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn settings(&self) -> Result<Option<SyntheticSettings>, StorageError> {
        let settings = self
            .conn
            .query_row(
                "
                SELECT enabled, sessions_per_min, max_per_run, error_rate, abandon_rate, updated_at
                FROM synthetic_settings
                WHERE id = ?1
                ",
                [SETTINGS_ROW_ID],
                |row| {
                    Ok(SyntheticSettings {
                        enabled: row.get::<_, i64>(0)? != 0,
                        sessions_per_min: row.get::<_, i64>(1)? as u32,
                        max_per_run: row.get::<_, i64>(2)? as u32,
                        error_rate: row.get(3)?,
                        abandon_rate: row.get(4)?,
                        updated_at: timestamp_column(row, 5)?,
                    })
                },
            )
            .optional()?;
        Ok(settings)
    }

    pub fn save_settings(&self, settings: &SyntheticSettings) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO synthetic_settings (
                id,
                enabled,
                sessions_per_min,
                max_per_run,
                error_rate,
                abandon_rate,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                enabled=excluded.enabled,
                sessions_per_min=excluded.sessions_per_min,
                max_per_run=excluded.max_per_run,
                error_rate=excluded.error_rate,
                abandon_rate=excluded.abandon_rate,
                updated_at=excluded.updated_at
            ",
            params![
                SETTINGS_ROW_ID,
                i64::from(settings.enabled),
                i64::from(settings.sessions_per_min),
                i64::from(settings.max_per_run),
                settings.error_rate,
                settings.abandon_rate,
                format_timestamp(settings.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn find_or_create_organization(
        &self,
        name: &str,
        organization_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Organization, StorageError> {
        let existing = self
            .conn
            .query_row(
                "SELECT id, name, organization_type FROM organizations WHERE name = ?1",
                [name],
                |row| {
                    Ok(Organization {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        organization_type: row.get(2)?,
                    })
                },
            )
            .optional()?;
        if let Some(organization) = existing {
            return Ok(organization);
        }

        let organization = Organization {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            organization_type: organization_type.to_string(),
        };
        self.conn.execute(
            "
            INSERT INTO organizations (id, name, organization_type, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                organization.id,
                organization.name,
                organization.organization_type,
                format_timestamp(now),
            ],
        )?;
        Ok(organization)
    }

    /// Upserts on `profile_id`; an existing row keeps its `started_at`.
    pub fn upsert_sim_users(&self, users: &[SimUser]) -> Result<usize, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut statement = tx.prepare(
                "
                INSERT INTO sim_users (
                    profile_id,
                    org_id,
                    persona_key,
                    cohort_label,
                    started_at,
                    metadata_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(profile_id) DO UPDATE SET
                    org_id=excluded.org_id,
                    persona_key=excluded.persona_key,
                    cohort_label=excluded.cohort_label,
                    metadata_json=excluded.metadata_json
                ",
            )?;
            for user in users {
                statement.execute(params![
                    user.profile_id,
                    user.org_id,
                    user.persona_key,
                    user.cohort_label,
                    format_timestamp(user.started_at),
                    to_json(&user.metadata)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(users.len())
    }

    pub fn sim_users(&self, limit: usize) -> Result<Vec<SimUser>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT profile_id, org_id, persona_key, cohort_label, started_at, metadata_json
            FROM sim_users
            ORDER BY started_at ASC, profile_id ASC
            LIMIT ?1
            ",
        )?;

        let rows = statement.query_map([limit as i64], |row| {
            Ok(SimUser {
                profile_id: row.get(0)?,
                org_id: row.get(1)?,
                persona_key: row.get(2)?,
                cohort_label: row.get(3)?,
                started_at: timestamp_column(row, 4)?,
                metadata: json_column(row, 5)?,
            })
        })?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    pub fn sim_user_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sim_users", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn insert_mindblock(&self, entry: &MindblockEntry) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "INSERT OR IGNORE INTO mindblock_library (id, title, family) VALUES (?1, ?2, ?3)",
            params![entry.id, entry.title, entry.family],
        )?;
        Ok(changes > 0)
    }

    pub fn mindblocks(&self, limit: usize) -> Result<Vec<MindblockEntry>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, title, family
            FROM mindblock_library
            ORDER BY id ASC
            LIMIT ?1
            ",
        )?;
        let rows = statement.query_map([limit as i64], |row| {
            Ok(MindblockEntry {
                id: row.get(0)?,
                title: row.get(1)?,
                family: row.get(2)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn mindblock_ids(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        let mut statement = self
            .conn
            .prepare("SELECT id FROM mindblock_library ORDER BY id ASC LIMIT ?1")?;
        let rows = statement.query_map([limit as i64], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn insert_journey_instance(
        &self,
        journey: &NewJourneyInstance,
    ) -> Result<JourneyInstance, StorageError> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "
            INSERT INTO journey_instances (
                id,
                user_id,
                organization_id,
                template_id,
                status,
                current_scene_number,
                total_scenes,
                started_at,
                completed_at,
                metadata_json,
                synthetic
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                id,
                journey.user_id,
                journey.organization_id,
                journey.template_id,
                journey.status.as_str(),
                i64::from(journey.current_scene_number),
                i64::from(journey.total_scenes),
                format_timestamp(journey.started_at),
                journey.completed_at.map(format_timestamp),
                to_json(&journey.metadata)?,
                i64::from(is_synthetic(&journey.metadata)),
            ],
        )?;
        Ok(JourneyInstance::from_new(id, journey.clone()))
    }

    pub fn journey_instance(&self, id: &str) -> Result<Option<JourneyInstance>, StorageError> {
        let journey = self
            .conn
            .query_row(
                "
                SELECT id, user_id, organization_id, template_id, status, current_scene_number,
                       total_scenes, started_at, completed_at, metadata_json
                FROM journey_instances
                WHERE id = ?1
                ",
                [id],
                map_journey,
            )
            .optional()?;
        Ok(journey)
    }

    pub fn recent_synthetic_journeys(
        &self,
        limit: usize,
    ) -> Result<Vec<JourneyInstance>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, user_id, organization_id, template_id, status, current_scene_number,
                   total_scenes, started_at, completed_at, metadata_json
            FROM journey_instances
            WHERE synthetic = 1
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?1
            ",
        )?;
        let rows = statement.query_map([limit as i64], map_journey)?;
        let mut journeys = Vec::new();
        for row in rows {
            journeys.push(row?);
        }
        Ok(journeys)
    }

    pub fn journeys(&self) -> Result<Vec<JourneyInstance>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, user_id, organization_id, template_id, status, current_scene_number,
                   total_scenes, started_at, completed_at, metadata_json
            FROM journey_instances
            ORDER BY rowid ASC
            ",
        )?;
        let rows = statement.query_map([], map_journey)?;
        let mut journeys = Vec::new();
        for row in rows {
            journeys.push(row?);
        }
        Ok(journeys)
    }

    pub fn journey_count(&self) -> Result<u64, StorageError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM journey_instances", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn synthetic_journeys_started_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM journey_instances WHERE synthetic = 1 AND started_at >= ?1",
            [format_timestamp(since)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn insert_scene_event(&self, event: &SceneEvent) -> Result<i64, StorageError> {
        self.conn.execute(
            "
            INSERT INTO journey_scene_events (
                journey_instance_id,
                user_id,
                organization_id,
                template_id,
                scene_number,
                event_type,
                event_payload_json,
                synthetic,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                event.journey_instance_id,
                event.user_id,
                event.organization_id,
                event.template_id,
                i64::from(event.scene_number),
                event.event_type.as_str(),
                to_json(&event.event_payload)?,
                i64::from(is_synthetic(&event.event_payload)),
                format_timestamp(event.created_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn scene_events_for_journey(
        &self,
        journey_instance_id: &str,
    ) -> Result<Vec<SceneEvent>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT journey_instance_id, user_id, organization_id, template_id, scene_number,
                   event_type, event_payload_json, created_at
            FROM journey_scene_events
            WHERE journey_instance_id = ?1
            ORDER BY id ASC
            ",
        )?;
        let rows = statement.query_map([journey_instance_id], |row| {
            let event_type: String = row.get(5)?;
            Ok(SceneEvent {
                journey_instance_id: row.get(0)?,
                user_id: row.get(1)?,
                organization_id: row.get(2)?,
                template_id: row.get(3)?,
                scene_number: row.get::<_, i64>(4)? as u32,
                event_type: event_type
                    .parse::<SceneEventType>()
                    .map_err(|err| conversion_error(5, err))?,
                event_payload: json_column(row, 6)?,
                created_at: timestamp_column(row, 7)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn scene_event_count(&self) -> Result<u64, StorageError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM journey_scene_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn insert_mindblock_event(&self, event: &MindblockEvent) -> Result<i64, StorageError> {
        self.conn.execute(
            "
            INSERT INTO mindblock_events (
                individual_id,
                organization_id,
                mindblock_id,
                signal_type,
                evidence_json,
                synthetic,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                event.individual_id,
                event.organization_id,
                event.mindblock_id,
                event.signal_type.as_str(),
                to_json(&event.evidence)?,
                i64::from(is_synthetic(&event.evidence)),
                format_timestamp(event.created_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn mindblock_events_for_journey(
        &self,
        journey_instance_id: &str,
    ) -> Result<Vec<MindblockEvent>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT individual_id, organization_id, mindblock_id, signal_type, evidence_json, created_at
            FROM mindblock_events
            WHERE json_extract(evidence_json, '$.journey_instance_id') = ?1
            ORDER BY id ASC
            ",
        )?;
        let rows = statement.query_map([journey_instance_id], |row| {
            let signal_type: String = row.get(3)?;
            Ok(MindblockEvent {
                individual_id: row.get(0)?,
                organization_id: row.get(1)?,
                mindblock_id: row.get(2)?,
                signal_type: signal_type
                    .parse::<MindblockSignalType>()
                    .map_err(|err| conversion_error(3, err))?,
                evidence: json_column(row, 4)?,
                created_at: timestamp_column(row, 5)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn mindblock_event_count(&self) -> Result<u64, StorageError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM mindblock_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Synthetic event volume created at or after `since`.
    pub fn activity_window(&self, since: DateTime<Utc>) -> Result<ActivityWindow, StorageError> {
        let since = format_timestamp(since);
        let scene_events: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM journey_scene_events WHERE synthetic = 1 AND created_at >= ?1",
            [&since],
            |row| row.get(0),
        )?;
        let mindblock_events: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM mindblock_events WHERE synthetic = 1 AND created_at >= ?1",
            [&since],
            |row| row.get(0),
        )?;
        Ok(ActivityWindow {
            scene_events: scene_events as u64,
            mindblock_events: mindblock_events as u64,
        })
    }

    pub fn activity_summary(
        &self,
        since: DateTime<Utc>,
        period_hours: u32,
    ) -> Result<ActivitySummary, StorageError> {
        let since = format_timestamp(since);
        let scene_events_by_type = self.grouped_counts(
            "
            SELECT event_type, COUNT(*)
            FROM journey_scene_events
            WHERE synthetic = 1 AND created_at >= ?1
            GROUP BY event_type
            ",
            &since,
        )?;
        let mindblock_events_by_type = self.grouped_counts(
            "
            SELECT signal_type, COUNT(*)
            FROM mindblock_events
            WHERE synthetic = 1 AND created_at >= ?1
            GROUP BY signal_type
            ",
            &since,
        )?;
        let journeys_completed: i64 = self.conn.query_row(
            "
            SELECT COUNT(*)
            FROM journey_instances
            WHERE synthetic = 1 AND status = ?1 AND completed_at >= ?2
            ",
            params![JourneyStatus::Completed.as_str(), since],
            |row| row.get(0),
        )?;

        let scenes_completed = scene_events_by_type
            .get(SceneEventType::SceneCompleted.as_str())
            .copied()
            .unwrap_or(0);
        let total_events = scene_events_by_type.values().sum::<u64>()
            + mindblock_events_by_type.values().sum::<u64>();

        Ok(ActivitySummary {
            period_hours,
            scene_events_by_type,
            mindblock_events_by_type,
            journeys_completed: journeys_completed as u64,
            scenes_completed,
            total_events,
        })
    }

    fn grouped_counts(&self, sql: &str, since: &str) -> Result<BTreeMap<String, u64>, StorageError> {
        let mut statement = self.conn.prepare(sql)?;
        let rows = statement.query_map([since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (key, count) = row?;
            counts.insert(key, count);
        }
        Ok(counts)
    }

    /// Deletes synthetic rows older than `cutoff`: events first, then journeys.
    /// Events belonging to a deleted journey go with it even when they were
    /// stamped after the cutoff.
    pub fn delete_synthetic_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<CleanupReport, StorageError> {
        let cutoff_text = format_timestamp(cutoff);
        let tx = self.conn.unchecked_transaction()?;
        let scene_events_deleted = tx.execute(
            "
            DELETE FROM journey_scene_events
            WHERE synthetic = 1
              AND (
                created_at < ?1
                OR journey_instance_id IN (
                    SELECT id FROM journey_instances WHERE synthetic = 1 AND started_at < ?1
                )
              )
            ",
            [&cutoff_text],
        )?;
        let mindblock_events_deleted = tx.execute(
            "
            DELETE FROM mindblock_events
            WHERE synthetic = 1
              AND (
                created_at < ?1
                OR json_extract(evidence_json, '$.journey_instance_id') IN (
                    SELECT id FROM journey_instances WHERE synthetic = 1 AND started_at < ?1
                )
              )
            ",
            [&cutoff_text],
        )?;
        let journeys_deleted = tx.execute(
            "DELETE FROM journey_instances WHERE synthetic = 1 AND started_at < ?1",
            [&cutoff_text],
        )?;
        tx.commit()?;

        Ok(CleanupReport {
            journeys_deleted: journeys_deleted as u64,
            scene_events_deleted: scene_events_deleted as u64,
            mindblock_events_deleted: mindblock_events_deleted as u64,
            cutoff,
        })
    }

    pub fn engagement_exists(
        &self,
        cohort_label: &str,
        content_type: &str,
        content_id: &str,
        individual_id: &str,
    ) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM content_engagements
                WHERE content_type = ?1
                  AND content_id = ?2
                  AND individual_id = ?3
                  AND cohort_label = ?4
                LIMIT 1
                ",
                params![content_type, content_id, individual_id, cohort_label],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Inserts a batch of engagements in one transaction.
    pub fn insert_engagements(&self, rows: &[ContentEngagement]) -> Result<usize, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut statement = tx.prepare(
                "
                INSERT INTO content_engagements (
                    individual_id,
                    organization_id,
                    content_type,
                    content_id,
                    action,
                    duration_seconds,
                    cohort_label,
                    seed_key,
                    metadata_json,
                    created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ",
            )?;
            for row in rows {
                statement.execute(params![
                    row.individual_id,
                    row.organization_id,
                    row.content_type,
                    row.content_id,
                    row.action.as_str(),
                    row.duration_seconds.map(i64::from),
                    row.metadata.get("cohort_label").and_then(Value::as_str),
                    row.metadata.get("seed_key").and_then(Value::as_str),
                    to_json(&row.metadata)?,
                    format_timestamp(row.created_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Engagement rows per content id for one cohort.
    pub fn engagement_coverage(
        &self,
        cohort_label: &str,
        content_type: &str,
    ) -> Result<BTreeMap<String, u64>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT content_id, COUNT(*)
            FROM content_engagements
            WHERE cohort_label = ?1 AND content_type = ?2
            GROUP BY content_id
            ",
        )?;
        let rows = statement.query_map(params![cohort_label, content_type], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut coverage = BTreeMap::new();
        for row in rows {
            let (content_id, count) = row?;
            coverage.insert(content_id, count);
        }
        Ok(coverage)
    }

    pub fn distinct_engaged_users(
        &self,
        cohort_label: &str,
        content_id: &str,
    ) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "
            SELECT COUNT(DISTINCT individual_id)
            FROM content_engagements
            WHERE cohort_label = ?1 AND content_id = ?2
            ",
            params![cohort_label, content_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn journey_run_exists(&self, user_id: &str, template_id: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM journey_runs WHERE user_id = ?1 AND template_id = ?2 LIMIT 1",
                params![user_id, template_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Writes the run and its completed scene rows in one transaction and
    /// returns the run id.
    pub fn insert_journey_run(&self, run: &SeedJourneyRun) -> Result<String, StorageError> {
        let id = Uuid::new_v4().to_string();
        let started_at = format_timestamp(run.started_at);
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "
            INSERT INTO journey_runs (id, user_id, template_id, status, cohort_label, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                id,
                run.user_id,
                run.template_id,
                JOURNEY_RUN_STATUS,
                run.cohort_label,
                started_at
            ],
        )?;
        for scene_number in 1..=run.completed_scenes {
            tx.execute(
                "
                INSERT INTO scene_runs (
                    journey_run_id,
                    template_id,
                    scene_number,
                    status,
                    started_at,
                    completed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                ",
                params![
                    id,
                    run.template_id,
                    i64::from(scene_number),
                    SCENE_RUN_STATUS,
                    started_at
                ],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    pub fn journey_run_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM journey_runs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn completed_scene_runs(&self, journey_run_id: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM scene_runs WHERE journey_run_id = ?1 AND status = ?2",
            params![journey_run_id, SCENE_RUN_STATUS],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn notification_queued(
        &self,
        recipient_profile_id: &str,
        cohort_label: &str,
    ) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM notifications_outbox
                WHERE recipient_profile_id = ?1 AND cohort_label = ?2
                LIMIT 1
                ",
                params![recipient_profile_id, cohort_label],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Queues in-app notifications in one transaction.
    pub fn queue_notifications(&self, rows: &[QueuedNotification]) -> Result<usize, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut statement = tx.prepare(
                "
                INSERT INTO notifications_outbox (
                    audience,
                    recipient_profile_id,
                    channel,
                    category,
                    template_id,
                    rendered_title,
                    rendered_body,
                    status,
                    send_after,
                    cohort_label,
                    metadata_json
                ) VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?7, ?8, ?9, ?10)
                ",
            )?;
            for row in rows {
                statement.execute(params![
                    NOTIFICATION_AUDIENCE,
                    row.recipient_profile_id,
                    row.channel,
                    row.category,
                    row.title,
                    row.body,
                    NOTIFICATION_STATUS,
                    format_timestamp(row.send_after),
                    row.metadata.get("cohort_label").and_then(Value::as_str),
                    to_json(&row.metadata)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn queued_notification_count(&self, cohort_label: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "
            SELECT COUNT(*)
            FROM notifications_outbox
            WHERE cohort_label = ?1 AND status = ?2
            ",
            params![cohort_label, NOTIFICATION_STATUS],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn map_journey(row: &Row<'_>) -> rusqlite::Result<JourneyInstance> {
    let status: String = row.get(4)?;
    Ok(JourneyInstance {
        id: row.get(0)?,
        user_id: row.get(1)?,
        organization_id: row.get(2)?,
        template_id: row.get(3)?,
        status: status
            .parse::<JourneyStatus>()
            .map_err(|err| conversion_error(4, err))?,
        current_scene_number: row.get::<_, i64>(5)? as u32,
        total_scenes: row.get::<_, i64>(6)? as u32,
        started_at: timestamp_column(row, 7)?,
        completed_at: row
            .get::<_, Option<String>>(8)?
            .map(|value| parse_timestamp(value).map_err(|err| conversion_error(8, err)))
            .transpose()?,
        metadata: json_column(row, 9)?,
    })
}

fn is_synthetic(value: &Value) -> bool {
    value
        .get("synthetic")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn to_json(value: &Value) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn timestamp_column(row: &Row<'_>, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(row.get::<_, String>(column)?).map_err(|err| conversion_error(column, err))
}

fn json_column(row: &Row<'_>, column: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|err| conversion_error(column, err))
}

/// Fixed-width UTC timestamps so range filters can compare text directly.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rcv_core::EngagementAction;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn sim_user(profile_id: &str) -> SimUser {
        SimUser {
            profile_id: profile_id.to_string(),
            org_id: Some("org-alpha".to_string()),
            persona_key: "early_recovery".to_string(),
            cohort_label: "synthetics_v1".to_string(),
            started_at: ts(),
            metadata: json!({"created_by": "test"}),
        }
    }

    fn journey(started_at: DateTime<Utc>, synthetic: bool) -> NewJourneyInstance {
        NewJourneyInstance {
            user_id: "synthetic-00001".to_string(),
            organization_id: None,
            template_id: "onboarding".to_string(),
            status: JourneyStatus::Completed,
            current_scene_number: 3,
            total_scenes: 3,
            started_at,
            completed_at: Some(started_at + Duration::minutes(4)),
            metadata: json!({"synthetic": synthetic}),
        }
    }

    fn scene_event(journey_id: &str, kind: SceneEventType, at: DateTime<Utc>) -> SceneEvent {
        SceneEvent {
            journey_instance_id: journey_id.to_string(),
            user_id: "synthetic-00001".to_string(),
            organization_id: None,
            template_id: "onboarding".to_string(),
            scene_number: 1,
            event_type: kind,
            event_payload: json!({"synthetic": true}),
            created_at: at,
        }
    }

    fn mindblock_event(journey_id: &str, at: DateTime<Utc>) -> MindblockEvent {
        MindblockEvent {
            individual_id: "synthetic-00001".to_string(),
            organization_id: None,
            mindblock_id: "mb-001".to_string(),
            signal_type: MindblockSignalType::Resonated,
            evidence: json!({"synthetic": true, "journey_instance_id": journey_id}),
            created_at: at,
        }
    }

    #[test]
    fn migration_creates_synthetics_tables() {
        let db = SyntheticsStore::open_in_memory().expect("open db");

        for table in [
            "synthetic_settings",
            "organizations",
            "sim_users",
            "mindblock_library",
            "journey_instances",
            "journey_scene_events",
            "mindblock_events",
            "content_engagements",
            "journey_runs",
            "scene_runs",
            "notifications_outbox",
        ] {
            assert!(db.table_exists(table).expect("table check"));
        }

        assert_eq!(
            db.schema_version().expect("schema version"),
            SYNTHETICS_SCHEMA_VERSION
        );
    }

    #[test]
    fn reopening_file_keeps_schema_and_rows() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let db = SyntheticsStore::open(file.path()).expect("open db");
            db.save_settings(&SyntheticSettings::defaults(ts()))
                .expect("save settings");
        }
        let db = SyntheticsStore::open(file.path()).expect("reopen db");
        assert_eq!(
            db.schema_version().expect("schema version"),
            SYNTHETICS_SCHEMA_VERSION
        );
        assert!(db.settings().expect("settings query").is_some());
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let conn = Connection::open(file.path()).expect("open raw");
            conn.execute("PRAGMA user_version = 99", [])
                .expect("bump version");
        }
        let err = SyntheticsStore::open(file.path())
            .err()
            .expect("future schema must fail");
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion { found: 99, .. }
        ));
    }

    #[test]
    fn settings_roundtrip_and_update_in_place() {
        let db = SyntheticsStore::open_in_memory().expect("open db");
        assert!(db.settings().expect("settings query").is_none());

        let mut settings = SyntheticSettings::defaults(ts());
        db.save_settings(&settings).expect("save settings");
        settings.enabled = false;
        settings.max_per_run = 11;
        db.save_settings(&settings).expect("update settings");

        let loaded = db
            .settings()
            .expect("settings query")
            .expect("settings present");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn organizations_are_found_by_name() {
        let db = SyntheticsStore::open_in_memory().expect("open db");
        let first = db
            .find_or_create_organization("alpha", "platform", ts())
            .expect("create org");
        let second = db
            .find_or_create_organization("alpha", "platform", ts())
            .expect("find org");
        assert_eq!(first, second);
    }

    #[test]
    fn sim_user_upsert_is_idempotent_and_keeps_started_at() {
        let db = SyntheticsStore::open_in_memory().expect("open db");
        db.upsert_sim_users(&[sim_user("synthetic-00001"), sim_user("synthetic-00002")])
            .expect("insert users");

        let mut changed = sim_user("synthetic-00001");
        changed.persona_key = "dual_diagnosis".to_string();
        changed.started_at = ts() + Duration::days(1);
        db.upsert_sim_users(&[changed]).expect("upsert user");

        assert_eq!(db.sim_user_count().expect("count"), 2);
        let users = db.sim_users(10).expect("list users");
        assert_eq!(users[0].profile_id, "synthetic-00001");
        assert_eq!(users[0].persona_key, "dual_diagnosis");
        assert_eq!(users[0].started_at, ts());
        assert_eq!(db.sim_users(1).expect("limited").len(), 1);
    }

    #[test]
    fn journey_roundtrip_preserves_nullable_completion() {
        let db = SyntheticsStore::open_in_memory().expect("open db");
        let mut abandoned = journey(ts(), true);
        abandoned.status = JourneyStatus::Abandoned;
        abandoned.current_scene_number = 1;
        abandoned.total_scenes = 5;
        abandoned.completed_at = None;

        let stored = db
            .insert_journey_instance(&abandoned)
            .expect("insert journey");
        let loaded = db
            .journey_instance(&stored.id)
            .expect("journey query")
            .expect("journey present");
        assert_eq!(loaded, stored);
        assert!(loaded.completed_at.is_none());
        assert!(db
            .journey_instance("missing")
            .expect("journey query")
            .is_none());
    }

    #[test]
    fn scene_and_mindblock_events_are_listed_per_journey() {
        let db = SyntheticsStore::open_in_memory().expect("open db");
        let stored = db
            .insert_journey_instance(&journey(ts(), true))
            .expect("insert journey");
        db.insert_scene_event(&scene_event(&stored.id, SceneEventType::SceneStarted, ts()))
            .expect("insert start");
        db.insert_scene_event(&scene_event(
            &stored.id,
            SceneEventType::SceneCompleted,
            ts() + Duration::seconds(40),
        ))
        .expect("insert end");
        db.insert_mindblock_event(&mindblock_event(&stored.id, ts()))
            .expect("insert mindblock event");
        db.insert_mindblock_event(&mindblock_event("other-journey", ts()))
            .expect("insert unrelated event");

        let events = db
            .scene_events_for_journey(&stored.id)
            .expect("scene events");
        assert_eq!(
            events.iter().map(|event| event.event_type).collect::<Vec<_>>(),
            vec![SceneEventType::SceneStarted, SceneEventType::SceneCompleted]
        );
        let signals = db
            .mindblock_events_for_journey(&stored.id)
            .expect("mindblock events");
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, MindblockSignalType::Resonated);
    }

    #[test]
    fn activity_summary_groups_by_type_within_window() {
        let db = SyntheticsStore::open_in_memory().expect("open db");
        let stored = db
            .insert_journey_instance(&journey(ts(), true))
            .expect("insert journey");
        let old = ts() - Duration::hours(30);
        for (kind, at) in [
            (SceneEventType::SceneStarted, ts()),
            (SceneEventType::SceneCompleted, ts()),
            (SceneEventType::SceneStarted, ts()),
            (SceneEventType::SceneStarted, old),
        ] {
            db.insert_scene_event(&scene_event(&stored.id, kind, at))
                .expect("insert scene event");
        }
        db.insert_mindblock_event(&mindblock_event(&stored.id, ts()))
            .expect("insert mindblock event");

        let summary = db
            .activity_summary(ts() - Duration::hours(24), 24)
            .expect("summary");
        assert_eq!(summary.period_hours, 24);
        assert_eq!(summary.scene_events_by_type.get("scene_started"), Some(&2));
        assert_eq!(summary.scenes_completed, 1);
        assert_eq!(summary.mindblock_events_by_type.get("resonated"), Some(&1));
        assert_eq!(summary.journeys_completed, 1);
        assert_eq!(summary.total_events, 4);

        let window = db
            .activity_window(ts() - Duration::minutes(5))
            .expect("window");
        assert_eq!(window.scene_events, 3);
        assert_eq!(window.mindblock_events, 1);
    }

    #[test]
    fn cleanup_removes_only_old_synthetic_rows() {
        let db = SyntheticsStore::open_in_memory().expect("open db");
        let old_at = ts() - Duration::days(60);
        let old = db
            .insert_journey_instance(&journey(old_at, true))
            .expect("old journey");
        let fresh = db
            .insert_journey_instance(&journey(ts(), true))
            .expect("fresh journey");
        let real = db
            .insert_journey_instance(&journey(old_at, false))
            .expect("real journey");
        db.insert_scene_event(&scene_event(&old.id, SceneEventType::SceneStarted, old_at))
            .expect("old event");
        db.insert_scene_event(&scene_event(&fresh.id, SceneEventType::SceneStarted, ts()))
            .expect("fresh event");
        db.insert_mindblock_event(&mindblock_event(&old.id, old_at))
            .expect("old signal");

        let report = db
            .delete_synthetic_before(ts() - Duration::days(45))
            .expect("cleanup");
        assert_eq!(report.journeys_deleted, 1);
        assert_eq!(report.scene_events_deleted, 1);
        assert_eq!(report.mindblock_events_deleted, 1);

        assert!(db.journey_instance(&old.id).expect("query").is_none());
        assert!(db.journey_instance(&fresh.id).expect("query").is_some());
        assert!(db.journey_instance(&real.id).expect("query").is_some());
        assert_eq!(db.scene_event_count().expect("count"), 1);
    }

    #[test]
    fn cleanup_takes_late_events_of_deleted_journeys() {
        let db = SyntheticsStore::open_in_memory().expect("open db");
        let cutoff = ts() - Duration::days(45);
        let started = cutoff - Duration::minutes(1);
        let late = cutoff + Duration::minutes(2);
        let spanning = db
            .insert_journey_instance(&journey(started, true))
            .expect("spanning journey");
        let fresh = db
            .insert_journey_instance(&journey(ts(), true))
            .expect("fresh journey");
        db.insert_scene_event(&scene_event(&spanning.id, SceneEventType::SceneStarted, started))
            .expect("early event");
        db.insert_scene_event(&scene_event(&spanning.id, SceneEventType::SceneCompleted, late))
            .expect("late event");
        db.insert_mindblock_event(&mindblock_event(&spanning.id, late))
            .expect("late signal");
        db.insert_scene_event(&scene_event(&fresh.id, SceneEventType::SceneStarted, ts()))
            .expect("fresh event");
        db.insert_mindblock_event(&mindblock_event(&fresh.id, ts()))
            .expect("fresh signal");

        let report = db.delete_synthetic_before(cutoff).expect("cleanup");
        assert_eq!(report.journeys_deleted, 1);
        assert_eq!(report.scene_events_deleted, 2);
        assert_eq!(report.mindblock_events_deleted, 1);
        assert!(db
            .scene_events_for_journey(&spanning.id)
            .expect("events")
            .is_empty());
        assert_eq!(db.scene_event_count().expect("count"), 1);
        assert_eq!(db.mindblock_event_count().expect("count"), 1);
    }

    #[test]
    fn journey_runs_carry_completed_scenes() {
        let db = SyntheticsStore::open_in_memory().expect("open db");
        let run = SeedJourneyRun {
            user_id: "synthetic-00001".to_string(),
            template_id: "onboarding".to_string(),
            cohort_label: "synthetics_v1".to_string(),
            completed_scenes: 2,
            started_at: ts(),
        };
        assert!(!db
            .journey_run_exists("synthetic-00001", "onboarding")
            .expect("exists query"));
        let id = db.insert_journey_run(&run).expect("insert run");
        assert!(db
            .journey_run_exists("synthetic-00001", "onboarding")
            .expect("exists query"));
        assert_eq!(db.journey_run_count().expect("count"), 1);
        assert_eq!(db.completed_scene_runs(&id).expect("scene runs"), 2);
    }

    #[test]
    fn notifications_are_queued_per_cohort() {
        let db = SyntheticsStore::open_in_memory().expect("open db");
        let row = QueuedNotification {
            recipient_profile_id: "synthetic-00001".to_string(),
            channel: "in_app".to_string(),
            category: "system".to_string(),
            title: "Welcome".to_string(),
            body: "Hello".to_string(),
            send_after: ts(),
            metadata: json!({"cohort_label": "c1"}),
        };
        assert_eq!(db.queue_notifications(&[row]).expect("queue"), 1);
        assert!(db
            .notification_queued("synthetic-00001", "c1")
            .expect("queued query"));
        assert!(!db
            .notification_queued("synthetic-00001", "c2")
            .expect("queued query"));
        assert_eq!(db.queued_notification_count("c1").expect("count"), 1);
    }

    #[test]
    fn engagements_track_cohort_coverage() {
        let db = SyntheticsStore::open_in_memory().expect("open db");
        let row = |user: &str, content: &str, action| ContentEngagement {
            individual_id: user.to_string(),
            organization_id: None,
            content_type: "mindblock".to_string(),
            content_id: content.to_string(),
            action,
            duration_seconds: None,
            metadata: json!({
                "cohort_label": "c1",
                "seed_key": format!("c1:{content}:{user}"),
            }),
            created_at: ts(),
        };
        db.insert_engagements(&[
            row("u1", "mb-1", EngagementAction::Viewed),
            row("u1", "mb-1", EngagementAction::Started),
            row("u2", "mb-1", EngagementAction::Viewed),
            row("u2", "mb-2", EngagementAction::Viewed),
        ])
        .expect("insert engagements");

        assert!(db
            .engagement_exists("c1", "mindblock", "mb-1", "u1")
            .expect("exists"));
        assert!(!db
            .engagement_exists("c2", "mindblock", "mb-1", "u1")
            .expect("exists"));

        let coverage = db
            .engagement_coverage("c1", "mindblock")
            .expect("coverage");
        assert_eq!(coverage.get("mb-1"), Some(&3));
        assert_eq!(coverage.get("mb-2"), Some(&1));
        assert_eq!(db.distinct_engaged_users("c1", "mb-1").expect("users"), 2);
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let whole = format_timestamp(ts());
        let fractional = format_timestamp(ts() + Duration::microseconds(1_500));
        assert_eq!(whole, "2026-03-02T14:00:00.000Z");
        assert_eq!(whole.len(), fractional.len());
    }
}
