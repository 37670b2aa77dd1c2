//! Settings, status and retention operations shared by the hub and the CLI.

use crate::runner::load_or_init_settings;
use crate::BackendError;
use chrono::{DateTime, Duration, Utc};
use rcv_core::{
    ActivitySummary, CleanupReport, ContractError, MindblockEntry, RunState, SettingsPatch,
    SimUser, StatusActivity, SyntheticSettings, SyntheticsStatus,
};
use rcv_storage::{StorageError, SyntheticsStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const ACTIVE_WINDOW_MINUTES: i64 = 5;
pub const RECENT_JOURNEY_LIMIT: usize = 10;
pub const SIM_USER_PREVIEW_LIMIT: usize = 20;
pub const DEFAULT_RETAIN_DAYS: u32 = 45;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid settings: {0}")]
    Invalid(#[from] ContractError),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimUserPreview {
    pub count: u64,
    pub users: Vec<SimUser>,
}

pub fn status(store: &SyntheticsStore, now: DateTime<Utc>) -> Result<SyntheticsStatus, ControlError> {
    let settings = load_or_init_settings(store, now)?;
    let since = now - Duration::minutes(ACTIVE_WINDOW_MINUTES);
    let activity = StatusActivity {
        last_5_min: store.activity_window(since)?,
        active_journeys: store.synthetic_journeys_started_since(since)?,
        recent_journeys: store.recent_synthetic_journeys(RECENT_JOURNEY_LIMIT)?,
    };
    let status = if settings.enabled {
        RunState::Running
    } else {
        RunState::Paused
    };
    Ok(SyntheticsStatus {
        settings,
        activity,
        status,
    })
}

pub fn activity(
    store: &SyntheticsStore,
    hours: u32,
    now: DateTime<Utc>,
) -> Result<ActivitySummary, ControlError> {
    let since = now
        .checked_sub_signed(Duration::hours(i64::from(hours)))
        .ok_or(ControlError::OutOfRange {
            field: "hours",
            value: hours,
        })?;
    Ok(store.activity_summary(since, hours)?)
}

pub fn toggle(
    store: &SyntheticsStore,
    enabled: bool,
    now: DateTime<Utc>,
) -> Result<SyntheticSettings, ControlError> {
    update_settings(
        store,
        &SettingsPatch {
            enabled: Some(enabled),
            ..SettingsPatch::default()
        },
        now,
    )
}

/// Applies `patch` to the stored row. Nothing is written when any resulting
/// value is out of range.
pub fn update_settings(
    store: &SyntheticsStore,
    patch: &SettingsPatch,
    now: DateTime<Utc>,
) -> Result<SyntheticSettings, ControlError> {
    let mut settings = load_or_init_settings(store, now)?;
    settings.apply(patch, now)?;
    store.save_settings(&settings)?;
    info!(
        event = "synthetics_settings_updated",
        enabled = settings.enabled,
        sessions_per_min = settings.sessions_per_min,
        max_per_run = settings.max_per_run,
        error_rate = settings.error_rate,
        abandon_rate = settings.abandon_rate
    );
    Ok(settings)
}

pub fn cleanup(
    store: &SyntheticsStore,
    retain_days: u32,
    now: DateTime<Utc>,
) -> Result<CleanupReport, ControlError> {
    let cutoff = now
        .checked_sub_signed(Duration::days(i64::from(retain_days)))
        .ok_or(ControlError::OutOfRange {
            field: "retain_days",
            value: retain_days,
        })?;
    let report = store.delete_synthetic_before(cutoff)?;
    info!(
        event = "synthetics_cleanup",
        retain_days,
        journeys = report.journeys_deleted,
        scene_events = report.scene_events_deleted,
        mindblock_events = report.mindblock_events_deleted
    );
    Ok(report)
}

pub fn sim_user_preview(store: &SyntheticsStore) -> Result<SimUserPreview, ControlError> {
    Ok(SimUserPreview {
        count: store.sim_user_count()?,
        users: store.sim_users(SIM_USER_PREVIEW_LIMIT)?,
    })
}

pub fn mindblock_listing(
    store: &SyntheticsStore,
    limit: usize,
) -> Result<Vec<MindblockEntry>, ControlError> {
    Ok(store.mindblocks(limit)?)
}
