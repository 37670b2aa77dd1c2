use crate::{BackendError, SyntheticsBackend};
use chrono::{DateTime, Utc};
use rcv_core::journey_plan::{
    plan_journey, plan_mindblock_signals, plan_scenes, scene_timeline, JourneyPlan,
    MindblockSignalPlan, ScenePlan,
};
use rcv_core::synthetics_contracts::{DISABLED_MESSAGE, NO_SIM_USERS_MESSAGE, SETTINGS_COUNT_LIMIT};
use rcv_core::{
    JourneyInstance, MindblockEvent, NewJourneyInstance, RunResult, RunSettingsEcho, SceneEvent,
    SceneEventType, SimUser, SyntheticSettings, Xorshift32,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub const DEFAULT_MINDBLOCK_POOL_LIMIT: usize = 500;
const SIM_USER_FETCH_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRequest {
    #[serde(default)]
    pub target: Option<u32>,
    #[serde(default)]
    pub seed: Option<u32>,
}

impl RunRequest {
    pub fn scheduled() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub mindblock_pool_limit: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            mindblock_pool_limit: DEFAULT_MINDBLOCK_POOL_LIMIT,
        }
    }
}

/// Everything drawn for one iteration before any row is written.
#[derive(Debug, Clone)]
struct IterationPlan {
    journey: JourneyPlan,
    scenes: Vec<ScenePlan>,
    signals: Vec<MindblockSignalPlan>,
}

pub struct SyntheticsRunner {
    config: RunnerConfig,
}

impl Default for SyntheticsRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl SyntheticsRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn run<B>(&self, backend: &B, request: RunRequest) -> Result<RunResult, BackendError>
    where
        B: SyntheticsBackend + ?Sized,
    {
        self.run_at(backend, request, Utc::now())
    }

    /// One generator pass stamped at `now`.
    ///
    /// Only a failure to read settings or users aborts the run. Individual
    /// inserts that fail are logged and skipped; counts reflect successful
    /// writes only.
    pub fn run_at<B>(
        &self,
        backend: &B,
        request: RunRequest,
        now: DateTime<Utc>,
    ) -> Result<RunResult, BackendError>
    where
        B: SyntheticsBackend + ?Sized,
    {
        let settings = load_or_init_settings(backend, now)?;
        let override_target = request
            .target
            .filter(|target| *target > 0)
            .map(|target| target.min(SETTINGS_COUNT_LIMIT));
        let target = override_target.unwrap_or_else(|| settings.scheduled_target());
        let echo = RunSettingsEcho {
            target,
            abandon_rate: settings.abandon_rate,
            error_rate: settings.error_rate,
        };

        if !settings.enabled && override_target.is_none() {
            info!(event = "synthetics_run_skipped", reason = "disabled");
            let echo = RunSettingsEcho { target: 0, ..echo };
            return Ok(RunResult::failed(echo, now, DISABLED_MESSAGE));
        }

        let mut rng = request
            .seed
            .map(Xorshift32::new)
            .unwrap_or_else(Xorshift32::from_clock);
        let mut result = RunResult {
            success: true,
            sessions_created: 0,
            scene_events_created: 0,
            mindblock_events_created: 0,
            settings: echo,
            seed: Some(rng.seed()),
            timestamp: now,
            error: None,
        };
        if target == 0 {
            debug!(event = "synthetics_run_empty", seed = rng.seed());
            return Ok(result);
        }

        let users = backend.sim_users(target as usize * SIM_USER_FETCH_FACTOR)?;
        if users.is_empty() {
            warn!(event = "synthetics_run_skipped", reason = "no_sim_users");
            return Ok(RunResult::failed(result.settings, now, NO_SIM_USERS_MESSAGE));
        }

        let library = match backend.mindblock_pool(self.config.mindblock_pool_limit) {
            Ok(ids) => ids,
            Err(err) => {
                warn!(event = "synthetics_library_unavailable", error = %err);
                Vec::new()
            }
        };

        info!(
            event = "synthetics_run_start",
            target,
            seed = rng.seed(),
            sim_users = users.len(),
            library = library.len()
        );

        for _ in 0..target {
            let journey = plan_journey(
                &mut rng,
                users.len(),
                settings.abandon_rate,
                settings.error_rate,
            );
            let scenes = plan_scenes(&mut rng, &journey);
            let signals = plan_mindblock_signals(&mut rng, &library);
            let plan = IterationPlan {
                journey,
                scenes,
                signals,
            };
            let user = &users[plan.journey.user_index];
            write_iteration(backend, user, &plan, rng.seed(), now, &mut result);
        }

        info!(
            event = "synthetics_run_complete",
            sessions = result.sessions_created,
            scene_events = result.scene_events_created,
            mindblock_events = result.mindblock_events_created,
            seed = rng.seed()
        );
        Ok(result)
    }
}

/// Reads the settings row, writing the defaults first when it is missing.
pub fn load_or_init_settings<B>(
    backend: &B,
    now: DateTime<Utc>,
) -> Result<SyntheticSettings, BackendError>
where
    B: SyntheticsBackend + ?Sized,
{
    if let Some(settings) = backend.load_settings()? {
        return Ok(settings);
    }
    let settings = SyntheticSettings::defaults(now);
    backend.save_settings(&settings)?;
    info!(event = "synthetics_settings_initialized");
    Ok(settings)
}

fn write_iteration<B>(
    backend: &B,
    user: &SimUser,
    plan: &IterationPlan,
    seed: u32,
    now: DateTime<Utc>,
    result: &mut RunResult,
) where
    B: SyntheticsBackend + ?Sized,
{
    let timeline = scene_timeline(now, &plan.scenes);
    let finished_at = timeline.last().map_or(now, |timing| timing.ended_at);

    let new_journey = NewJourneyInstance {
        user_id: user.profile_id.clone(),
        organization_id: user.org_id.clone(),
        template_id: plan.journey.template_id.to_string(),
        status: plan.journey.status(),
        current_scene_number: plan.journey.completed_scenes,
        total_scenes: plan.journey.total_scenes,
        started_at: now,
        completed_at: (!plan.journey.abandon).then_some(finished_at),
        metadata: json!({
            "synthetic": true,
            "persona_key": user.persona_key,
            "cohort_label": user.cohort_label,
            "seed": seed,
            "error_injected": plan.journey.error_injected,
        }),
    };

    let journey = match backend.insert_journey(&new_journey) {
        Ok(journey) => journey,
        Err(err) => {
            warn!(
                event = "synthetics_journey_insert_failed",
                user_id = %user.profile_id,
                error = %err
            );
            return;
        }
    };
    result.sessions_created += 1;

    for (scene, timing) in plan.scenes.iter().zip(&timeline) {
        let started = scene_event(
            &journey,
            scene.scene_number,
            SceneEventType::SceneStarted,
            json!({"synthetic": true, "persona_key": user.persona_key}),
            timing.started_at,
        );
        tally(
            backend.insert_scene_event(&started),
            &mut result.scene_events_created,
            "scene_started",
            &journey.id,
        );

        let terminal = scene_event(
            &journey,
            scene.scene_number,
            scene.terminal,
            json!({"synthetic": true, "duration_seconds": scene.duration_seconds}),
            timing.ended_at,
        );
        tally(
            backend.insert_scene_event(&terminal),
            &mut result.scene_events_created,
            scene.terminal.as_str(),
            &journey.id,
        );

        if let Some(artifact_type) = scene.artifact_type {
            let artifact = scene_event(
                &journey,
                scene.scene_number,
                SceneEventType::ArtifactCaptured,
                json!({"synthetic": true, "artifact_type": artifact_type}),
                timing.ended_at,
            );
            tally(
                backend.insert_scene_event(&artifact),
                &mut result.scene_events_created,
                "artifact_captured",
                &journey.id,
            );
        }
    }

    for signal in &plan.signals {
        let event = MindblockEvent {
            individual_id: journey.user_id.clone(),
            organization_id: journey.organization_id.clone(),
            mindblock_id: signal.mindblock_id.clone(),
            signal_type: signal.signal_type,
            evidence: json!({
                "synthetic": true,
                "journey_instance_id": journey.id,
                "template_id": journey.template_id,
                "persona_key": user.persona_key,
            }),
            created_at: finished_at,
        };
        tally(
            backend.insert_mindblock_event(&event),
            &mut result.mindblock_events_created,
            "mindblock_event",
            &journey.id,
        );
    }
}

fn scene_event(
    journey: &JourneyInstance,
    scene_number: u32,
    event_type: SceneEventType,
    event_payload: Value,
    created_at: DateTime<Utc>,
) -> SceneEvent {
    SceneEvent {
        journey_instance_id: journey.id.clone(),
        user_id: journey.user_id.clone(),
        organization_id: journey.organization_id.clone(),
        template_id: journey.template_id.clone(),
        scene_number,
        event_type,
        event_payload,
        created_at,
    }
}

fn tally(outcome: Result<(), BackendError>, counter: &mut u32, kind: &str, journey_id: &str) {
    match outcome {
        Ok(()) => *counter += 1,
        Err(err) => warn!(
            event = "synthetics_insert_failed",
            kind,
            journey_id,
            error = %err
        ),
    }
}
