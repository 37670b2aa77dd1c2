//! Synthetic activity generation: the journey runner, the cohort seeder and
//! the settings/activity operations the hub and CLI expose.

pub mod control;
pub mod runner;
pub mod seeder;

use rcv_core::{
    JourneyInstance, MindblockEvent, NewJourneyInstance, SceneEvent, SimUser, SyntheticSettings,
};
use rcv_storage::{StorageError, SyntheticsStore};
use thiserror::Error;

pub use control::{ControlError, SimUserPreview};
pub use runner::{RunRequest, RunnerConfig, SyntheticsRunner};
pub use seeder::{seed_cohort, seed_library, SeedError, SeedReport};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Persistence seam for the runner. Each call is independent; nothing here
/// is expected to span a transaction.
pub trait SyntheticsBackend {
    fn load_settings(&self) -> Result<Option<SyntheticSettings>, BackendError>;

    fn save_settings(&self, settings: &SyntheticSettings) -> Result<(), BackendError>;

    fn sim_users(&self, limit: usize) -> Result<Vec<SimUser>, BackendError>;

    /// Candidate mindblock ids, in a stable order.
    fn mindblock_pool(&self, limit: usize) -> Result<Vec<String>, BackendError>;

    fn insert_journey(&self, journey: &NewJourneyInstance)
        -> Result<JourneyInstance, BackendError>;

    fn insert_scene_event(&self, event: &SceneEvent) -> Result<(), BackendError>;

    fn insert_mindblock_event(&self, event: &MindblockEvent) -> Result<(), BackendError>;
}

impl SyntheticsBackend for SyntheticsStore {
    fn load_settings(&self) -> Result<Option<SyntheticSettings>, BackendError> {
        Ok(self.settings()?)
    }

    fn save_settings(&self, settings: &SyntheticSettings) -> Result<(), BackendError> {
        Ok(SyntheticsStore::save_settings(self, settings)?)
    }

    fn sim_users(&self, limit: usize) -> Result<Vec<SimUser>, BackendError> {
        Ok(SyntheticsStore::sim_users(self, limit)?)
    }

    fn mindblock_pool(&self, limit: usize) -> Result<Vec<String>, BackendError> {
        Ok(self.mindblock_ids(limit)?)
    }

    fn insert_journey(
        &self,
        journey: &NewJourneyInstance,
    ) -> Result<JourneyInstance, BackendError> {
        Ok(self.insert_journey_instance(journey)?)
    }

    fn insert_scene_event(&self, event: &SceneEvent) -> Result<(), BackendError> {
        SyntheticsStore::insert_scene_event(self, event)?;
        Ok(())
    }

    fn insert_mindblock_event(&self, event: &MindblockEvent) -> Result<(), BackendError> {
        SyntheticsStore::insert_mindblock_event(self, event)?;
        Ok(())
    }
}
