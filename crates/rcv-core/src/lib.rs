//! Contracts shared by the synthetics store, generator and hub.

pub mod cohort_plan;
pub mod journey_plan;
pub mod prng;
pub mod synthetics_contracts;

pub use prng::Xorshift32;
pub use synthetics_contracts::{
    ActivitySummary, ActivityWindow, CleanupReport, ContentEngagement, ContractError,
    EngagementAction, JourneyInstance, JourneyStatus, MindblockEntry, MindblockEvent,
    MindblockSignalType, NewJourneyInstance, Organization, QueuedNotification, RunResult,
    RunSettingsEcho, RunState, SceneEvent, SceneEventType, SeedJourneyRun, SettingsPatch, SimUser,
    StatusActivity, SyntheticSettings, SyntheticsStatus,
};
