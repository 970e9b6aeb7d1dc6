use std::collections::BTreeMap;

use chrono::{DateTime, Days, NaiveDate, Utc};

use crate::model::{
    AggregateState, DailyActivity, DayActivity, ModelUsage, ProjectSummary, RefreshStats, Streaks,
    TokenUsage,
};

pub fn build(
    mut projects: Vec<ProjectSummary>,
    refresh: RefreshStats,
    generated_at: DateTime<Utc>,
) -> AggregateState {
    projects.sort_by(|a, b| b.last_active.cmp(&a.last_active).then_with(|| a.id.cmp(&b.id)));

    let mut total_tokens = TokenUsage::default();
    let mut total_estimated_cost = 0.0;
    let mut total_sessions = 0u64;
    let mut total_messages = 0u64;
    let mut model_breakdown: BTreeMap<String, ModelUsage> = BTreeMap::new();
    let mut days: BTreeMap<NaiveDate, DayActivity> = BTreeMap::new();

    for project in &projects {
        total_tokens += project.total_tokens;
        total_estimated_cost += project.estimated_cost;
        total_sessions += project.session_count;
        total_messages += project.message_count;
        for (family, usage) in &project.models {
            let slot = model_breakdown.entry(family.clone()).or_default();
            slot.tokens += usage.tokens;
            slot.estimated_cost += usage.estimated_cost;
        }
        for (day, activity) in &project.daily {
            *days.entry(*day).or_default() += *activity;
        }
    }

    let daily_activity = daily_series(&days, total_estimated_cost, total_tokens.billable());
    let streaks = streaks(&daily_activity, generated_at.date_naive());
    let most_active_day = most_active_day(&daily_activity);

    AggregateState {
        projects,
        total_estimated_cost,
        total_tokens,
        total_sessions,
        total_messages,
        cache_hit_ratio: cache_hit_ratio(&total_tokens),
        model_breakdown,
        daily_activity,
        streaks,
        most_active_day,
        refresh,
        generated_at,
    }
}

pub fn cache_hit_ratio(tokens: &TokenUsage) -> f64 {
    let denominator = tokens
        .input
        .saturating_add(tokens.cache_read)
        .saturating_add(tokens.cache_creation);
    if denominator == 0 {
        0.0
    } else {
        tokens.cache_read as f64 / denominator as f64
    }
}

// Per-day cost is the all-time cost scaled by the day's share of billable
// tokens. Cache categories are not tracked per day, so this drifts.
fn daily_series(
    days: &BTreeMap<NaiveDate, DayActivity>,
    total_cost: f64,
    total_billable: u64,
) -> Vec<DailyActivity> {
    days.iter()
        .map(|(date, activity)| DailyActivity {
            date: *date,
            message_count: activity.message_count,
            session_count: activity.session_count,
            token_count: activity.token_count,
            estimated_cost: if total_billable == 0 {
                0.0
            } else {
                total_cost * activity.token_count as f64 / total_billable as f64
            },
        })
        .collect()
}

fn is_active(day: &DailyActivity) -> bool {
    day.message_count > 0 || day.session_count > 0 || day.token_count > 0
}

// Longest run of consecutive active days, and the run ending today (or
// yesterday, when today has nothing yet).
pub fn streaks(series: &[DailyActivity], today: NaiveDate) -> Streaks {
    let active: Vec<NaiveDate> = series
        .iter()
        .filter(|day| is_active(day))
        .map(|day| day.date)
        .collect();

    let mut longest = 0u32;
    let mut run = 0u32;
    let mut previous: Option<NaiveDate> = None;
    for date in &active {
        run = match previous {
            Some(prev) if prev.checked_add_days(Days::new(1)) == Some(*date) => run + 1,
            _ => 1,
        };
        longest = longest.max(run);
        previous = Some(*date);
    }

    let mut current = 0u32;
    let yesterday = today.checked_sub_days(Days::new(1));
    let anchor = if active.contains(&today) {
        Some(today)
    } else if yesterday.is_some_and(|day| active.contains(&day)) {
        yesterday
    } else {
        None
    };
    let mut cursor = anchor;
    while let Some(day) = cursor
        && active.binary_search(&day).is_ok()
    {
        current += 1;
        cursor = day.checked_sub_days(Days::new(1));
    }

    Streaks { current, longest }
}

pub fn most_active_day(series: &[DailyActivity]) -> Option<DailyActivity> {
    series
        .iter()
        .filter(|day| day.message_count > 0)
        .fold(None::<&DailyActivity>, |best, day| match best {
            Some(best) if best.message_count >= day.message_count => Some(best),
            _ => Some(day),
        })
        .cloned()
}
