//! Cohort seeding: sim users, their organisations, and a deterministic spread
//! of content engagements over the mindblock library.

use chrono::{DateTime, Duration, Utc};
use rcv_core::cohort_plan::{
    choose_user_slots, org_for, persona_for, plan_engagement, profile_email, profile_id, seed_key,
    CohortOrg, CohortParams, EngagementPlan,
};
use rcv_core::{
    ContentEngagement, EngagementAction, MindblockEntry, QueuedNotification, SeedJourneyRun,
    SimUser, Xorshift32,
};
use rcv_storage::{format_timestamp, StorageError, SyntheticsStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

pub const ENGAGEMENT_BATCH_ROWS: usize = 10_000;
pub const SIM_USER_BATCH_ROWS: usize = 1_000;
pub const MINDBLOCK_CONTENT_TYPE: &str = "mindblock";
pub const MAX_COHORT_USERS: u32 = 100_000;
pub const SEED_JOURNEY_USERS: usize = 200;
pub const SEED_NOTIFICATION_USERS: usize = 100;
pub const ONBOARDING_TEMPLATE: &str = "onboarding";
const ONBOARDING_COMPLETED_SCENES: u32 = 2;
const NOTIFICATION_CHANNEL: &str = "in_app";
const NOTIFICATION_CATEGORY: &str = "system";
const NOTIFICATION_TITLE: &str = "Welcome to synthetic seed";
const NOTIFICATION_BODY: &str = "This is a test notification for synthetic cohort.";
const ORGANIZATION_TYPE: &str = "platform";
const LIBRARY_SCAN_LIMIT: usize = 1_000_000;

const LIBRARY_FAMILIES: [&str; 6] = [
    "craving",
    "identity",
    "regulation",
    "connection",
    "purpose",
    "resilience",
];

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid seed params: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedReport {
    pub users_created: u64,
    pub engagements_created: u64,
    pub pairs_skipped: u64,
    pub mindblocks_covered: u64,
    pub min_engagements_per_mindblock: u64,
    pub max_engagements_per_mindblock: u64,
    pub journey_runs_created: u64,
    pub notifications_queued: u64,
}

pub fn seed_cohort(
    store: &SyntheticsStore,
    params: &CohortParams,
    now: DateTime<Utc>,
) -> Result<SeedReport, SeedError> {
    validate_params(params)?;
    let window_start = now
        .checked_sub_signed(Duration::days(i64::from(params.days)))
        .ok_or_else(|| SeedError::InvalidParams(format!("days out of range: {}", params.days)))?;

    let mut org_ids: BTreeMap<CohortOrg, String> = BTreeMap::new();
    if params.with_orgs {
        for org in CohortOrg::ALL {
            let organization =
                store.find_or_create_organization(org.name(), ORGANIZATION_TYPE, now)?;
            org_ids.insert(org, organization.id);
        }
    }

    let user_count = params.count_users as usize;
    let users: Vec<SimUser> = (0..user_count)
        .map(|idx| SimUser {
            profile_id: profile_id(idx),
            org_id: org_ids.get(&org_for(idx, user_count)).cloned(),
            persona_key: persona_for(idx).to_string(),
            cohort_label: params.cohort_label.clone(),
            started_at: now,
            metadata: json!({
                "email": profile_email(idx),
                "created_by": "seed-synthetics",
                "batch_timestamp": format_timestamp(now),
            }),
        })
        .collect();
    for chunk in users.chunks(SIM_USER_BATCH_ROWS) {
        store.upsert_sim_users(chunk)?;
    }
    info!(
        event = "synthetics_seed_users",
        cohort = %params.cohort_label,
        users = users.len(),
        with_orgs = params.with_orgs
    );

    let mindblocks = store.mindblock_ids(LIBRARY_SCAN_LIMIT)?;
    let mut rng = Xorshift32::new(params.seed());
    let coverage = params.coverage_per_mindblock as usize;

    let mut report = SeedReport {
        users_created: users.len() as u64,
        ..SeedReport::default()
    };
    let mut batch: Vec<ContentEngagement> = Vec::new();

    for mindblock_id in &mindblocks {
        for slot in choose_user_slots(&mut rng, user_count, coverage) {
            let user = &users[slot];
            let plan = plan_engagement(&mut rng, window_start, now);
            if store.engagement_exists(
                &params.cohort_label,
                MINDBLOCK_CONTENT_TYPE,
                mindblock_id,
                &user.profile_id,
            )? {
                report.pairs_skipped += 1;
                continue;
            }
            push_engagement_rows(&mut batch, &params.cohort_label, mindblock_id, user, &plan);
            if batch.len() >= ENGAGEMENT_BATCH_ROWS {
                report.engagements_created += flush(store, &mut batch)?;
            }
        }
    }
    report.engagements_created += flush(store, &mut batch)?;

    if params.with_journeys {
        report.journey_runs_created = seed_onboarding_runs(store, params, &users, now)?;
    }
    if params.with_notifications {
        report.notifications_queued = queue_welcome_notifications(store, params, &users, now)?;
    }

    let coverage_map = store.engagement_coverage(&params.cohort_label, MINDBLOCK_CONTENT_TYPE)?;
    report.mindblocks_covered = coverage_map.len() as u64;
    report.min_engagements_per_mindblock = coverage_map.values().copied().min().unwrap_or(0);
    report.max_engagements_per_mindblock = coverage_map.values().copied().max().unwrap_or(0);

    info!(
        event = "synthetics_seed_complete",
        cohort = %params.cohort_label,
        seed = params.seed(),
        engagements = report.engagements_created,
        skipped = report.pairs_skipped,
        mindblocks = report.mindblocks_covered,
        journey_runs = report.journey_runs_created,
        notifications = report.notifications_queued
    );
    Ok(report)
}

/// Running onboarding journeys with two finished scenes for the first users of
/// the cohort. Users that already have one are skipped.
fn seed_onboarding_runs(
    store: &SyntheticsStore,
    params: &CohortParams,
    users: &[SimUser],
    now: DateTime<Utc>,
) -> Result<u64, SeedError> {
    let mut created = 0;
    for user in users.iter().take(SEED_JOURNEY_USERS) {
        if store.journey_run_exists(&user.profile_id, ONBOARDING_TEMPLATE)? {
            continue;
        }
        store.insert_journey_run(&SeedJourneyRun {
            user_id: user.profile_id.clone(),
            template_id: ONBOARDING_TEMPLATE.to_string(),
            cohort_label: params.cohort_label.clone(),
            completed_scenes: ONBOARDING_COMPLETED_SCENES,
            started_at: now,
        })?;
        created += 1;
    }
    debug!(event = "synthetics_seed_journeys", created);
    Ok(created)
}

fn queue_welcome_notifications(
    store: &SyntheticsStore,
    params: &CohortParams,
    users: &[SimUser],
    now: DateTime<Utc>,
) -> Result<u64, SeedError> {
    let mut rows = Vec::new();
    for user in users.iter().take(SEED_NOTIFICATION_USERS) {
        if store.notification_queued(&user.profile_id, &params.cohort_label)? {
            continue;
        }
        rows.push(QueuedNotification {
            recipient_profile_id: user.profile_id.clone(),
            channel: NOTIFICATION_CHANNEL.to_string(),
            category: NOTIFICATION_CATEGORY.to_string(),
            title: NOTIFICATION_TITLE.to_string(),
            body: NOTIFICATION_BODY.to_string(),
            send_after: now,
            metadata: json!({ "cohort_label": params.cohort_label }),
        });
    }
    let queued = store.queue_notifications(&rows)?;
    debug!(event = "synthetics_seed_notifications", queued);
    Ok(queued as u64)
}

fn validate_params(params: &CohortParams) -> Result<(), SeedError> {
    if params.cohort_label.trim().is_empty() {
        return Err(SeedError::InvalidParams(
            "cohort_label must not be empty".to_string(),
        ));
    }
    if params.count_users > MAX_COHORT_USERS {
        return Err(SeedError::InvalidParams(format!(
            "count_users exceeds {MAX_COHORT_USERS}: {}",
            params.count_users
        )));
    }
    Ok(())
}

fn flush(store: &SyntheticsStore, batch: &mut Vec<ContentEngagement>) -> Result<u64, SeedError> {
    if batch.is_empty() {
        return Ok(0);
    }
    let inserted = store.insert_engagements(batch)?;
    debug!(event = "synthetics_seed_batch", rows = inserted);
    batch.clear();
    Ok(inserted as u64)
}

fn push_engagement_rows(
    batch: &mut Vec<ContentEngagement>,
    cohort_label: &str,
    mindblock_id: &str,
    user: &SimUser,
    plan: &EngagementPlan,
) {
    let base = json!({
        "cohort_label": cohort_label,
        "seed_key": seed_key(cohort_label, mindblock_id, &user.profile_id),
    });
    let row = |action, duration_seconds, metadata: Value, created_at| ContentEngagement {
        individual_id: user.profile_id.clone(),
        organization_id: user.org_id.clone(),
        content_type: MINDBLOCK_CONTENT_TYPE.to_string(),
        content_id: mindblock_id.to_string(),
        action,
        duration_seconds,
        metadata,
        created_at,
    };

    batch.push(row(EngagementAction::Viewed, None, base.clone(), plan.viewed_at));
    batch.push(row(EngagementAction::Started, None, base.clone(), plan.started_at));
    if let Some(completion) = &plan.completion {
        batch.push(row(
            EngagementAction::Completed,
            Some(completion.duration_seconds),
            with_field(&base, "reflection", json!(completion.reflection)),
            completion.at,
        ));
    }
    if let Some(rating) = &plan.rating {
        batch.push(row(
            EngagementAction::Rated,
            None,
            with_field(&base, "rating", json!(rating.rating)),
            rating.at,
        ));
    }
}

fn with_field(base: &Value, key: &str, value: Value) -> Value {
    let mut merged = base.clone();
    if let Value::Object(map) = &mut merged {
        map.insert(key.to_string(), value);
    }
    merged
}

/// Fills the mindblock library with `count` demo entries (`mb-0001`, ...).
/// Existing ids are left alone; returns the number of new rows.
pub fn seed_library(store: &SyntheticsStore, count: usize) -> Result<usize, SeedError> {
    let mut inserted = 0;
    for idx in 0..count {
        let family = LIBRARY_FAMILIES[idx % LIBRARY_FAMILIES.len()];
        let entry = MindblockEntry {
            id: format!("mb-{:04}", idx + 1),
            title: format!("{} practice {}", capitalize(family), idx / LIBRARY_FAMILIES.len() + 1),
            family: family.to_string(),
        };
        if store.insert_mindblock(&entry)? {
            inserted += 1;
        }
    }
    info!(event = "synthetics_library_seeded", requested = count, inserted);
    Ok(inserted)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
