//! Pure planning of one synthetic journey.
//!
//! Planning is split in three steps, always drawn in this order: the journey
//! header, its scenes, then the mindblock signals. All three are drawn before
//! anything is written, so a failed insert never shifts the PRNG stream.

use crate::prng::Xorshift32;
use crate::synthetics_contracts::{
    JourneyStatus, MindblockSignalType, SceneEventType, ARTIFACT_PROBABILITY, ARTIFACT_TYPES,
    JOURNEY_TEMPLATES, MAX_SCENES, MINDBLOCKS_PER_JOURNEY_SPAN, MIN_MINDBLOCKS_PER_JOURNEY,
    MIN_SCENES, MIN_SCENE_SECONDS, SCENE_SECONDS_SPAN,
};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JourneyPlan {
    pub user_index: usize,
    pub template_id: &'static str,
    pub abandon: bool,
    pub error_injected: bool,
    pub total_scenes: u32,
    pub completed_scenes: u32,
}

impl JourneyPlan {
    pub fn status(&self) -> JourneyStatus {
        if self.abandon {
            JourneyStatus::Abandoned
        } else {
            JourneyStatus::Completed
        }
    }

    /// Terminal event closing `scene_number`.
    pub fn terminal_event(&self, scene_number: u32) -> SceneEventType {
        let is_last = scene_number == self.completed_scenes;
        match (is_last, self.abandon) {
            (true, true) => SceneEventType::SceneAbandoned,
            (true, false) => SceneEventType::SceneCompleted,
            (false, _) => SceneEventType::SceneProgressed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenePlan {
    pub scene_number: u32,
    pub terminal: SceneEventType,
    pub duration_seconds: u32,
    pub artifact_type: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MindblockSignalPlan {
    pub mindblock_id: String,
    pub signal_type: MindblockSignalType,
}

/// Wall-clock placement of one scene inside a journey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneTiming {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

pub fn plan_journey(
    rng: &mut Xorshift32,
    user_count: usize,
    abandon_rate: f64,
    error_rate: f64,
) -> JourneyPlan {
    let user_index = rng.index(user_count.max(1));
    let template_id = JOURNEY_TEMPLATES[rng.index(JOURNEY_TEMPLATES.len())];
    let abandon = rng.chance(abandon_rate);
    let error_injected = rng.chance(error_rate);
    let total_scenes = rng
        .floor_range(MIN_SCENES, MAX_SCENES - MIN_SCENES + 1)
        .clamp(MIN_SCENES, MAX_SCENES);
    let completed_scenes = if abandon {
        rng.floor_range(0, total_scenes).min(total_scenes - 1)
    } else {
        total_scenes
    };

    JourneyPlan {
        user_index,
        template_id,
        abandon,
        error_injected,
        total_scenes,
        completed_scenes,
    }
}

pub fn plan_scenes(rng: &mut Xorshift32, journey: &JourneyPlan) -> Vec<ScenePlan> {
    let mut scenes = Vec::with_capacity(journey.completed_scenes as usize);
    for scene_number in 1..=journey.completed_scenes {
        let duration_seconds = rng.floor_range(MIN_SCENE_SECONDS, SCENE_SECONDS_SPAN);
        // The artifact draw happens even for abandoning journeys.
        let artifact_roll = rng.chance(ARTIFACT_PROBABILITY);
        let artifact_type = if artifact_roll && !journey.abandon {
            Some(ARTIFACT_TYPES[rng.index(ARTIFACT_TYPES.len())])
        } else {
            None
        };
        scenes.push(ScenePlan {
            scene_number,
            terminal: journey.terminal_event(scene_number),
            duration_seconds,
            artifact_type,
        });
    }
    scenes
}

/// Draws the per-journey mindblock count, a candidate sample of twice that
/// size from `library`, then one candidate and signal per event.
pub fn plan_mindblock_signals(
    rng: &mut Xorshift32,
    library: &[String],
) -> Vec<MindblockSignalPlan> {
    let count = rng.floor_range(MIN_MINDBLOCKS_PER_JOURNEY, MINDBLOCKS_PER_JOURNEY_SPAN);
    if library.is_empty() {
        return Vec::new();
    }

    let candidates: Vec<&String> = (0..count * 2)
        .map(|_| &library[rng.index(library.len())])
        .collect();

    (0..count)
        .map(|_| {
            let mindblock_id = candidates[rng.index(candidates.len())].clone();
            let signal_type =
                MindblockSignalType::ALL[rng.index(MindblockSignalType::ALL.len())];
            MindblockSignalPlan {
                mindblock_id,
                signal_type,
            }
        })
        .collect()
}

/// Lays scenes end to end starting at `journey_started_at`.
pub fn scene_timeline(journey_started_at: DateTime<Utc>, scenes: &[ScenePlan]) -> Vec<SceneTiming> {
    let mut cursor = journey_started_at;
    scenes
        .iter()
        .map(|scene| {
            let started_at = cursor;
            let ended_at = started_at + Duration::seconds(i64::from(scene.duration_seconds));
            cursor = ended_at;
            SceneTiming {
                started_at,
                ended_at,
            }
        })
        .collect()
}
