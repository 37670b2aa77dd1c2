use crate::prng::Xorshift32;
use crate::synthetics_contracts::PERSONA_KEYS;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_COUNT_USERS: u32 = 3_000;
pub const DEFAULT_COVERAGE_PER_MINDBLOCK: u32 = 15;
pub const DEFAULT_DAYS: u32 = 45;
pub const DEFAULT_COHORT_LABEL: &str = "synthetics_v1";

pub const COMPLETION_PROBABILITY: f64 = 0.65;
pub const RATING_PROBABILITY: f64 = 0.5;
pub const REFLECTION_PROBABILITY: f64 = 0.2;
pub const MAX_STRIDE: u32 = 13;

const DURATION_MEDIAN_SECONDS: f64 = 180.0;
const DURATION_SIGMA: f64 = 0.9;
const DURATION_MIN_SECONDS: f64 = 15.0;
const DURATION_MAX_SECONDS: f64 = 1_800.0;
const RATING_MEAN: f64 = 4.1;
const RATING_STDDEV: f64 = 0.7;
const ACTIVITY_FIRST_HOUR: u32 = 8;
const ACTIVITY_HOURS: u32 = 14;

pub const REFLECTION_TEXTS: [&str; 5] = [
    "Felt helpful and practical.",
    "Noticed a small shift in perspective.",
    "Will try this again later today.",
    "A bit challenging, but made sense.",
    "Good reminder during a rough moment.",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CohortOrg {
    Alpha,
    Beta,
    Gamma,
}

impl CohortOrg {
    pub const ALL: [CohortOrg; 3] = [Self::Alpha, Self::Beta, Self::Gamma];

    pub fn name(self) -> &'static str {
        match self {
            Self::Alpha => "alpha",
            Self::Beta => "beta",
            Self::Gamma => "gamma",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CohortParams {
    #[serde(default = "default_count_users")]
    pub count_users: u32,
    #[serde(default = "default_coverage")]
    pub coverage_per_mindblock: u32,
    #[serde(default = "default_days")]
    pub days: u32,
    #[serde(default = "default_cohort_label")]
    pub cohort_label: String,
    #[serde(default = "default_true")]
    pub with_orgs: bool,
    /// Onboarding runs for the head of the cohort.
    #[serde(default)]
    pub with_journeys: bool,
    /// Welcome notifications for the head of the cohort.
    #[serde(default)]
    pub with_notifications: bool,
}

impl Default for CohortParams {
    fn default() -> Self {
        Self {
            count_users: DEFAULT_COUNT_USERS,
            coverage_per_mindblock: DEFAULT_COVERAGE_PER_MINDBLOCK,
            days: DEFAULT_DAYS,
            cohort_label: DEFAULT_COHORT_LABEL.to_string(),
            with_orgs: true,
            with_journeys: false,
            with_notifications: false,
        }
    }
}

fn default_count_users() -> u32 {
    DEFAULT_COUNT_USERS
}

fn default_coverage() -> u32 {
    DEFAULT_COVERAGE_PER_MINDBLOCK
}

fn default_days() -> u32 {
    DEFAULT_DAYS
}

fn default_cohort_label() -> String {
    DEFAULT_COHORT_LABEL.to_string()
}

fn default_true() -> bool {
    true
}

impl CohortParams {
    /// Deterministic seed derived from the cohort shape, so re-seeding the
    /// same cohort replays the same plan.
    pub fn seed(&self) -> u32 {
        let label_sum = self
            .cohort_label
            .encode_utf16()
            .fold(0_u32, |acc, unit| acc.wrapping_add(u32::from(unit)));
        label_sum
            .wrapping_add(self.count_users)
            .wrapping_add(self.coverage_per_mindblock)
    }
}

pub fn profile_id(index: usize) -> String {
    format!("synthetic-{:05}", index + 1)
}

pub fn profile_email(index: usize) -> String {
    format!("synthetic+{:05}@example.com", index + 1)
}

pub fn persona_for(index: usize) -> &'static str {
    PERSONA_KEYS[index % PERSONA_KEYS.len()]
}

/// 60% alpha, 30% beta, remainder gamma, by position in the cohort.
pub fn org_for(index: usize, user_count: usize) -> CohortOrg {
    let alpha = (user_count as f64 * 0.6).round() as usize;
    let beta = (user_count as f64 * 0.3).round() as usize;
    if index < alpha {
        CohortOrg::Alpha
    } else if index < alpha + beta {
        CohortOrg::Beta
    } else {
        CohortOrg::Gamma
    }
}

/// Picks `min(k, user_count)` distinct user slots: a random start followed by
/// random strides of 1..=13 around the pool.
pub fn choose_user_slots(rng: &mut Xorshift32, user_count: usize, k: usize) -> Vec<usize> {
    let wanted = k.min(user_count);
    let mut chosen: Vec<usize> = Vec::with_capacity(wanted);
    if wanted == 0 {
        return chosen;
    }
    let mut taken = vec![false; user_count];
    let mut cursor = rng.index(user_count);
    let mut steps = 0_usize;
    let step_budget = user_count.saturating_mul(64).max(1_024);
    while chosen.len() < wanted {
        if !taken[cursor] {
            taken[cursor] = true;
            chosen.push(cursor);
        }
        steps += 1;
        if steps > step_budget {
            // Unlucky strides: fill the rest in pool order.
            for (slot, used) in taken.iter_mut().enumerate() {
                if chosen.len() == wanted {
                    break;
                }
                if !*used {
                    *used = true;
                    chosen.push(slot);
                }
            }
            break;
        }
        let stride = rng.floor_range(1, MAX_STRIDE) as usize;
        cursor = (cursor + stride) % user_count;
    }
    chosen
}

/// Lognormal-ish session length: median ~180s with a fat tail, 15..=1800s.
pub fn sample_duration_seconds(rng: &mut Xorshift32) -> u32 {
    let z = rng.standard_normal();
    let value = (DURATION_MEDIAN_SECONDS.ln() + DURATION_SIGMA * z).exp();
    value.round().clamp(DURATION_MIN_SECONDS, DURATION_MAX_SECONDS) as u32
}

pub fn sample_rating(rng: &mut Xorshift32) -> u8 {
    let value = RATING_MEAN + RATING_STDDEV * rng.standard_normal();
    value.round().clamp(1.0, 5.0) as u8
}

pub fn maybe_reflection(rng: &mut Xorshift32) -> Option<&'static str> {
    if rng.chance(REFLECTION_PROBABILITY) {
        Some(REFLECTION_TEXTS[rng.index(REFLECTION_TEXTS.len())])
    } else {
        None
    }
}

/// Uniform instant in `[window_start, window_end)`, moved to a daytime hour
/// (08:00-21:59 UTC) on the same day.
pub fn sample_timestamp(
    rng: &mut Xorshift32,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> DateTime<Utc> {
    let span_ms = (window_end - window_start).num_milliseconds().max(0);
    let offset_ms = (rng.next_f64() * span_ms as f64).floor() as i64;
    let instant = window_start + Duration::milliseconds(offset_ms);
    let hour = rng.floor_range(ACTIVITY_FIRST_HOUR, ACTIVITY_HOURS);
    let minute = rng.floor_range(0, 60);
    let second = rng.floor_range(0, 60);
    match NaiveTime::from_hms_opt(hour, minute, second) {
        Some(time) => instant.date_naive().and_time(time).and_utc(),
        None => instant,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionPlan {
    pub at: DateTime<Utc>,
    pub duration_seconds: u32,
    pub reflection: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RatingPlan {
    pub at: DateTime<Utc>,
    pub rating: u8,
}

/// Engagement rows planned for one (mindblock, user) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct EngagementPlan {
    pub viewed_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completion: Option<CompletionPlan>,
    pub rating: Option<RatingPlan>,
}

impl EngagementPlan {
    pub fn row_count(&self) -> usize {
        2 + usize::from(self.completion.is_some()) + usize::from(self.rating.is_some())
    }
}

pub fn plan_engagement(
    rng: &mut Xorshift32,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> EngagementPlan {
    let viewed_at = sample_timestamp(rng, window_start, window_end);
    let started_at = sample_timestamp(rng, window_start, window_end);
    let do_complete = rng.chance(COMPLETION_PROBABILITY);
    let do_rate = rng.chance(RATING_PROBABILITY);
    let duration_seconds = sample_duration_seconds(rng);
    let rating = do_rate.then(|| sample_rating(rng));
    let reflection = if do_complete {
        maybe_reflection(rng)
    } else {
        None
    };

    let completion = do_complete.then(|| CompletionPlan {
        at: sample_timestamp(rng, window_start, window_end),
        duration_seconds,
        reflection,
    });
    let rating = rating.map(|rating| RatingPlan {
        at: sample_timestamp(rng, window_start, window_end),
        rating,
    });

    EngagementPlan {
        viewed_at,
        started_at,
        completion,
        rating,
    }
}

pub fn seed_key(cohort_label: &str, mindblock_id: &str, user_id: &str) -> String {
    format!("{cohort_label}:{mindblock_id}:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use std::collections::BTreeSet;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn seed_depends_on_label_and_shape() {
        let params = CohortParams {
            cohort_label: "ab".to_string(),
            count_users: 10,
            coverage_per_mindblock: 2,
            ..CohortParams::default()
        };
        assert_eq!(params.seed(), 97 + 98 + 10 + 2);
    }

    #[test]
    fn params_fill_defaults_from_partial_json() {
        let params: CohortParams =
            serde_json::from_str(r#"{"count_users": 40}"#).expect("params json");
        assert_eq!(params.count_users, 40);
        assert_eq!(params.days, DEFAULT_DAYS);
        assert_eq!(params.cohort_label, DEFAULT_COHORT_LABEL);
        assert!(params.with_orgs);
        assert!(!params.with_journeys);
        assert!(!params.with_notifications);
    }

    #[test]
    fn org_split_is_sixty_thirty_ten() {
        let counts = (0..100).fold([0_usize; 3], |mut acc, idx| {
            match org_for(idx, 100) {
                CohortOrg::Alpha => acc[0] += 1,
                CohortOrg::Beta => acc[1] += 1,
                CohortOrg::Gamma => acc[2] += 1,
            }
            acc
        });
        assert_eq!(counts, [60, 30, 10]);
    }

    #[test]
    fn personas_rotate_round_robin() {
        assert_eq!(persona_for(0), "motivated_beginner");
        assert_eq!(persona_for(10), "motivated_beginner");
        assert_eq!(persona_for(9), "early_recovery");
        assert_eq!(profile_id(0), "synthetic-00001");
    }

    #[test]
    fn user_slots_are_distinct_and_bounded() {
        let mut rng = Xorshift32::new(77);
        for (pool, k) in [(1, 15), (2, 15), (20, 15), (500, 15), (13, 13)] {
            let slots = choose_user_slots(&mut rng, pool, k);
            assert_eq!(slots.len(), k.min(pool));
            let unique: BTreeSet<_> = slots.iter().copied().collect();
            assert_eq!(unique.len(), slots.len());
            assert!(slots.iter().all(|slot| *slot < pool));
        }
        assert!(choose_user_slots(&mut rng, 0, 5).is_empty());
    }

    #[test]
    fn durations_and_ratings_are_clamped() {
        let mut rng = Xorshift32::new(4242);
        for _ in 0..5_000 {
            let duration = sample_duration_seconds(&mut rng);
            assert!((15..=1_800).contains(&duration));
            let rating = sample_rating(&mut rng);
            assert!((1..=5).contains(&rating));
        }
    }

    #[test]
    fn sampled_timestamps_fall_in_daytime_hours() {
        let mut rng = Xorshift32::new(8);
        let start = ts() - Duration::days(45);
        for _ in 0..1_000 {
            let at = sample_timestamp(&mut rng, start, ts());
            assert!((8..22).contains(&at.hour()));
            assert!(at.date_naive() >= start.date_naive());
            assert!(at.date_naive() <= ts().date_naive());
        }
    }

    #[test]
    fn engagement_plan_row_count_matches_options() {
        let mut rng = Xorshift32::new(19);
        let start = ts() - Duration::days(3);
        for _ in 0..200 {
            let plan = plan_engagement(&mut rng, start, ts());
            let expected = 2
                + plan.completion.as_ref().map_or(0, |_| 1)
                + plan.rating.as_ref().map_or(0, |_| 1);
            assert_eq!(plan.row_count(), expected);
            if let Some(completion) = &plan.completion {
                assert!((15..=1_800).contains(&completion.duration_seconds));
            }
        }
    }
}
