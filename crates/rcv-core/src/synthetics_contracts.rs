use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const SETTINGS_ROW_ID: i64 = 1;
pub const DEFAULT_SESSIONS_PER_MIN: u32 = 2;
pub const DEFAULT_MAX_PER_RUN: u32 = 5;
pub const DEFAULT_ERROR_RATE: f64 = 0.05;
pub const DEFAULT_ABANDON_RATE: f64 = 0.15;
pub const SETTINGS_COUNT_LIMIT: u32 = 1_000;

pub const MIN_SCENES: u32 = 3;
pub const MAX_SCENES: u32 = 7;
pub const ARTIFACT_PROBABILITY: f64 = 0.3;
pub const MIN_SCENE_SECONDS: u32 = 30;
pub const SCENE_SECONDS_SPAN: u32 = 180;
pub const MIN_MINDBLOCKS_PER_JOURNEY: u32 = 1;
pub const MINDBLOCKS_PER_JOURNEY_SPAN: u32 = 4;

pub const DISABLED_MESSAGE: &str =
    "Synthetics are disabled. Use /toggle to enable or provide target param.";
pub const NO_SIM_USERS_MESSAGE: &str = "No sim_users found. Run seed-synthetics first.";

pub const JOURNEY_TEMPLATES: [&str; 9] = [
    "onboarding",
    "daily_check_in",
    "trigger_awareness",
    "craving_management",
    "emotional_regulation",
    "identity_work",
    "relapse_prevention",
    "morning_intention",
    "evening_reflection",
];

pub const ARTIFACT_TYPES: [&str; 4] = ["reflection", "insight", "commitment", "practice"];

pub const PERSONA_KEYS: [&str; 10] = [
    "motivated_beginner",
    "struggling_returner",
    "high_risk_relapse",
    "stable_maintainer",
    "crisis_intervention",
    "family_concerned",
    "mandated_treatment",
    "dual_diagnosis",
    "chronic_relapser",
    "early_recovery",
];

#[derive(Debug, Error, PartialEq)]
pub enum ContractError {
    #[error("{field} must be within [0, 1], got {value}")]
    RateOutOfRange { field: &'static str, value: f64 },
    #[error("{field} exceeds limit {limit}: {value}")]
    CountOutOfRange {
        field: &'static str,
        value: u32,
        limit: u32,
    },
    #[error("unknown scene event type: {0}")]
    UnknownSceneEventType(String),
    #[error("unknown mindblock signal type: {0}")]
    UnknownSignalType(String),
    #[error("unknown journey status: {0}")]
    UnknownJourneyStatus(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SceneEventType {
    SceneStarted,
    SceneProgressed,
    SceneCompleted,
    SceneAbandoned,
    ArtifactCaptured,
    ChoiceSelected,
    ReflectionSubmitted,
    TimerExpired,
}

impl SceneEventType {
    pub const ALL: [SceneEventType; 8] = [
        Self::SceneStarted,
        Self::SceneProgressed,
        Self::SceneCompleted,
        Self::SceneAbandoned,
        Self::ArtifactCaptured,
        Self::ChoiceSelected,
        Self::ReflectionSubmitted,
        Self::TimerExpired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SceneStarted => "scene_started",
            Self::SceneProgressed => "scene_progressed",
            Self::SceneCompleted => "scene_completed",
            Self::SceneAbandoned => "scene_abandoned",
            Self::ArtifactCaptured => "artifact_captured",
            Self::ChoiceSelected => "choice_selected",
            Self::ReflectionSubmitted => "reflection_submitted",
            Self::TimerExpired => "timer_expired",
        }
    }

    /// Closes a scene: exactly one of these follows every `scene_started`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::SceneProgressed | Self::SceneCompleted | Self::SceneAbandoned
        )
    }
}

impl fmt::Display for SceneEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SceneEventType {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == input.trim())
            .ok_or_else(|| ContractError::UnknownSceneEventType(input.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MindblockSignalType {
    Viewed,
    Engaged,
    Completed,
    Applied,
    Resonated,
    Challenged,
    Bookmarked,
    Shared,
}

impl MindblockSignalType {
    pub const ALL: [MindblockSignalType; 8] = [
        Self::Viewed,
        Self::Engaged,
        Self::Completed,
        Self::Applied,
        Self::Resonated,
        Self::Challenged,
        Self::Bookmarked,
        Self::Shared,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewed => "viewed",
            Self::Engaged => "engaged",
            Self::Completed => "completed",
            Self::Applied => "applied",
            Self::Resonated => "resonated",
            Self::Challenged => "challenged",
            Self::Bookmarked => "bookmarked",
            Self::Shared => "shared",
        }
    }
}

impl fmt::Display for MindblockSignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MindblockSignalType {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == input.trim())
            .ok_or_else(|| ContractError::UnknownSignalType(input.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
    Completed,
    Abandoned,
}

impl JourneyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for JourneyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JourneyStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(ContractError::UnknownJourneyStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyntheticSettings {
    pub enabled: bool,
    pub sessions_per_min: u32,
    pub max_per_run: u32,
    pub error_rate: f64,
    pub abandon_rate: f64,
    pub updated_at: DateTime<Utc>,
}

impl SyntheticSettings {
    pub fn defaults(now: DateTime<Utc>) -> Self {
        Self {
            enabled: true,
            sessions_per_min: DEFAULT_SESSIONS_PER_MIN,
            max_per_run: DEFAULT_MAX_PER_RUN,
            error_rate: DEFAULT_ERROR_RATE,
            abandon_rate: DEFAULT_ABANDON_RATE,
            updated_at: now,
        }
    }

    /// Sessions a scheduled run creates when no explicit target is given.
    pub fn scheduled_target(&self) -> u32 {
        self.sessions_per_min.min(self.max_per_run)
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        validate_rate("error_rate", self.error_rate)?;
        validate_rate("abandon_rate", self.abandon_rate)?;
        validate_count("sessions_per_min", self.sessions_per_min)?;
        validate_count("max_per_run", self.max_per_run)?;
        Ok(())
    }

    /// Applies a partial update and validates the result; `self` is left
    /// untouched when validation fails.
    pub fn apply(&mut self, patch: &SettingsPatch, now: DateTime<Utc>) -> Result<(), ContractError> {
        let mut next = self.clone();
        if let Some(enabled) = patch.enabled {
            next.enabled = enabled;
        }
        if let Some(value) = patch.sessions_per_min {
            next.sessions_per_min = value;
        }
        if let Some(value) = patch.max_per_run {
            next.max_per_run = value;
        }
        if let Some(value) = patch.error_rate {
            next.error_rate = value;
        }
        if let Some(value) = patch.abandon_rate {
            next.abandon_rate = value;
        }
        next.validate()?;
        next.updated_at = now;
        *self = next;
        Ok(())
    }
}

fn validate_rate(field: &'static str, value: f64) -> Result<(), ContractError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ContractError::RateOutOfRange { field, value })
    }
}

fn validate_count(field: &'static str, value: u32) -> Result<(), ContractError> {
    if value <= SETTINGS_COUNT_LIMIT {
        Ok(())
    } else {
        Err(ContractError::CountOutOfRange {
            field,
            value,
            limit: SETTINGS_COUNT_LIMIT,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SettingsPatch {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub sessions_per_min: Option<u32>,
    #[serde(default)]
    pub max_per_run: Option<u32>,
    #[serde(default)]
    pub error_rate: Option<f64>,
    #[serde(default)]
    pub abandon_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimUser {
    pub profile_id: String,
    pub org_id: Option<String>,
    pub persona_key: String,
    pub cohort_label: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub organization_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MindblockEntry {
    pub id: String,
    pub title: String,
    pub family: String,
}

/// Journey row as handed to storage; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewJourneyInstance {
    pub user_id: String,
    pub organization_id: Option<String>,
    pub template_id: String,
    pub status: JourneyStatus,
    pub current_scene_number: u32,
    pub total_scenes: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JourneyInstance {
    pub id: String,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub template_id: String,
    pub status: JourneyStatus,
    pub current_scene_number: u32,
    pub total_scenes: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

impl JourneyInstance {
    pub fn from_new(id: String, journey: NewJourneyInstance) -> Self {
        Self {
            id,
            user_id: journey.user_id,
            organization_id: journey.organization_id,
            template_id: journey.template_id,
            status: journey.status,
            current_scene_number: journey.current_scene_number,
            total_scenes: journey.total_scenes,
            started_at: journey.started_at,
            completed_at: journey.completed_at,
            metadata: journey.metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneEvent {
    pub journey_instance_id: String,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub template_id: String,
    pub scene_number: u32,
    pub event_type: SceneEventType,
    pub event_payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MindblockEvent {
    pub individual_id: String,
    pub organization_id: Option<String>,
    pub mindblock_id: String,
    pub signal_type: MindblockSignalType,
    pub evidence: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EngagementAction {
    Viewed,
    Started,
    Completed,
    Rated,
}

impl EngagementAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewed => "viewed",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Rated => "rated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentEngagement {
    pub individual_id: String,
    pub organization_id: Option<String>,
    pub content_type: String,
    pub content_id: String,
    pub action: EngagementAction,
    pub duration_seconds: Option<u32>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Onboarding run written by the cohort seeder. It stays `running` with its
/// first `completed_scenes` scenes finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeedJourneyRun {
    pub user_id: String,
    pub template_id: String,
    pub cohort_label: String,
    pub completed_scenes: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedNotification {
    pub recipient_profile_id: String,
    pub channel: String,
    pub category: String,
    pub title: String,
    pub body: String,
    pub send_after: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSettingsEcho {
    pub target: u32,
    pub abandon_rate: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub success: bool,
    pub sessions_created: u32,
    pub scene_events_created: u32,
    pub mindblock_events_created: u32,
    pub settings: RunSettingsEcho,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    pub fn failed(settings: RunSettingsEcho, timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            sessions_created: 0,
            scene_events_created: 0,
            mindblock_events_created: 0,
            settings,
            seed: None,
            timestamp,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityWindow {
    pub scene_events: u64,
    pub mindblock_events: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusActivity {
    pub last_5_min: ActivityWindow,
    pub active_journeys: u64,
    pub recent_journeys: Vec<JourneyInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyntheticsStatus {
    pub settings: SyntheticSettings,
    pub activity: StatusActivity,
    pub status: RunState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivitySummary {
    pub period_hours: u32,
    pub scene_events_by_type: BTreeMap<String, u64>,
    pub mindblock_events_by_type: BTreeMap<String, u64>,
    pub journeys_completed: u64,
    pub scenes_completed: u64,
    pub total_events: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub journeys_deleted: u64,
    pub scene_events_deleted: u64,
    pub mindblock_events_deleted: u64,
    pub cutoff: DateTime<Utc>,
}
