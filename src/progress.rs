use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use crate::models::{
    Achievement, Badge, BadgeCategory, QuizCompletion, UserProgress, UserStats,
};

/// Flat CPD estimate for a passed quiz whose episode duration is unknown.
const FALLBACK_CPD_HOURS: f64 = 0.75;
/// Minimum CPD credit for a passed quiz with a known episode.
const MIN_CPD_HOURS: f64 = 0.5;

pub fn new_progress(user_id: Uuid, now: DateTime<Utc>) -> UserProgress {
    UserProgress {
        user_id,
        total_completed: 0,
        total_passed: 0,
        total_score: 0,
        total_max_score: 0,
        average_score: 0,
        completion_rate: 0,
        total_time_seconds: 0,
        last_activity: now,
        badges: BTreeMap::new(),
    }
}

/// Fold one newly persisted completion into the rollup and re-run
/// badge eligibility. Called only for completions that were actually
/// inserted, never for deduplicated resubmissions.
pub fn apply_completion(progress: &mut UserProgress, completion: &QuizCompletion) {
    progress.total_completed += 1;
    if completion.passed {
        progress.total_passed += 1;
    }
    progress.total_score += i64::from(completion.score);
    progress.total_max_score += i64::from(completion.max_score);
    progress.average_score = if progress.total_max_score == 0 {
        0
    } else {
        ((100.0 * progress.total_score as f64 / progress.total_max_score as f64).round()) as i32
    };
    progress.completion_rate = if progress.total_completed == 0 {
        0
    } else {
        ((100.0 * progress.total_passed as f64 / progress.total_completed as f64).round()) as i32
    };
    progress.total_time_seconds += completion.time_spent_seconds;
    progress.last_activity = completion.completed_at;

    award_badges(progress, completion);
}

fn award_badges(progress: &mut UserProgress, completion: &QuizCompletion) {
    let earned_at = completion.completed_at;

    if progress.total_completed == 1 {
        award(
            progress,
            Badge {
                id: "first-quiz".to_string(),
                name: "First Quiz".to_string(),
                description: "Completed your first quiz".to_string(),
                icon: "🎓".to_string(),
                earned_at,
                category: BadgeCategory::Completion,
            },
        );
    }
    if progress.average_score >= 80 && progress.total_completed >= 5 {
        award(
            progress,
            Badge {
                id: "high-scorer".to_string(),
                name: "High Scorer".to_string(),
                description: "Average score of 80% or more across 5 quizzes".to_string(),
                icon: "⭐".to_string(),
                earned_at,
                category: BadgeCategory::Score,
            },
        );
    }
    if completion.percentage == 100 {
        award(
            progress,
            Badge {
                id: "perfect-score".to_string(),
                name: "Perfect Score".to_string(),
                description: "Scored 100% on a quiz".to_string(),
                icon: "💯".to_string(),
                earned_at,
                category: BadgeCategory::Score,
            },
        );
    }
    if progress.total_completed >= 10 {
        award(
            progress,
            Badge {
                id: "quiz-master".to_string(),
                name: "Quiz Master".to_string(),
                description: "Completed 10 quizzes".to_string(),
                icon: "🏆".to_string(),
                earned_at,
                category: BadgeCategory::Completion,
            },
        );
    }
}

// The badge map is keyed by id, so a repeat award is a no-op.
fn award(progress: &mut UserProgress, badge: Badge) {
    progress.badges.entry(badge.id.clone()).or_insert(badge);
}

/// Consecutive-day run of activity ending at the most recent unique
/// completion date, walked backward from today. A gap of more than one
/// calendar day before the latest completion yields zero.
pub fn streak_days(completions: &[QuizCompletion], today: NaiveDate) -> i32 {
    let mut dates: Vec<NaiveDate> = completions
        .iter()
        .map(|c| c.completed_at.date_naive())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    dates.sort_unstable_by(|a, b| b.cmp(a));

    let mut streak = 0;
    let mut expected = today;
    for date in dates {
        if date == expected {
            streak += 1;
            expected = expected.pred_opt().unwrap_or(expected);
        } else if streak == 0 && date == today.pred_opt().unwrap_or(today) {
            // Streak may end yesterday if nothing was completed today.
            streak = 1;
            expected = date.pred_opt().unwrap_or(date);
        } else {
            break;
        }
    }
    streak
}

/// Total CPD hours over passed completions. Episodes with a known
/// duration credit listening time with a floor of half an hour; the
/// rest get a flat estimate.
pub fn cpd_hours(completions: &[QuizCompletion], episode_durations: &HashMap<Uuid, i64>) -> f64 {
    completions
        .iter()
        .filter(|c| c.passed)
        .map(|c| {
            c.episode_id
                .and_then(|id| episode_durations.get(&id))
                .map(|seconds| (*seconds as f64 / 3600.0).max(MIN_CPD_HOURS))
                .unwrap_or(FALLBACK_CPD_HOURS)
        })
        .sum()
}

/// Lightweight display-only achievements, distinct from the persisted
/// badge set, generated from completion and perfect-score counts.
pub fn achievements(completions: &[QuizCompletion]) -> Vec<Achievement> {
    let completed = completions.len();
    let perfect = completions.iter().filter(|c| c.percentage == 100).count();

    let mut list = Vec::new();
    if completed >= 1 {
        list.push(Achievement {
            id: "getting-started".to_string(),
            name: "Getting Started".to_string(),
            description: "Completed a quiz".to_string(),
        });
    }
    if completed >= 5 {
        list.push(Achievement {
            id: "regular-learner".to_string(),
            name: "Regular Learner".to_string(),
            description: "Completed 5 quizzes".to_string(),
        });
    }
    if completed >= 10 {
        list.push(Achievement {
            id: "dedicated-learner".to_string(),
            name: "Dedicated Learner".to_string(),
            description: "Completed 10 quizzes".to_string(),
        });
    }
    if perfect >= 1 {
        list.push(Achievement {
            id: "perfectionist".to_string(),
            name: "Perfectionist".to_string(),
            description: "Earned a perfect score".to_string(),
        });
    }
    if perfect >= 5 {
        list.push(Achievement {
            id: "consistent-perfectionist".to_string(),
            name: "Consistent Perfectionist".to_string(),
            description: "Earned 5 perfect scores".to_string(),
        });
    }
    list
}

pub fn derive_stats(
    completions: &[QuizCompletion],
    episode_durations: &HashMap<Uuid, i64>,
    today: NaiveDate,
) -> UserStats {
    UserStats {
        streak_days: streak_days(completions, today),
        cpd_hours: cpd_hours(completions, episode_durations),
        achievements: achievements(completions),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn completion(percentage: i32, passed: bool, completed_at: DateTime<Utc>) -> QuizCompletion {
        QuizCompletion {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            quiz_id: Uuid::new_v4(),
            episode_id: None,
            score: percentage,
            max_score: 100,
            percentage,
            time_spent_seconds: 120,
            completed_at,
            answers: vec![],
            passed,
            attempt_number: 1,
        }
    }

    #[test]
    fn rollup_accumulates_totals_and_averages() {
        let user = Uuid::new_v4();
        let now = Utc::now();
        let mut progress = new_progress(user, now);

        apply_completion(&mut progress, &completion(100, true, now));
        apply_completion(&mut progress, &completion(50, false, now));

        assert_eq!(progress.total_completed, 2);
        assert_eq!(progress.total_passed, 1);
        assert_eq!(progress.average_score, 75);
        assert_eq!(progress.completion_rate, 50);
        assert_eq!(progress.total_time_seconds, 240);
    }

    #[test]
    fn first_quiz_badge_awarded_exactly_once() {
        let user = Uuid::new_v4();
        let now = Utc::now();
        let mut progress = new_progress(user, now);

        apply_completion(&mut progress, &completion(100, true, now));
        assert!(progress.badges.contains_key("first-quiz"));
        let first_earned = progress.badges["first-quiz"].earned_at;

        apply_completion(&mut progress, &completion(100, true, now + Duration::days(1)));
        let first_quiz_count = progress.badges.keys().filter(|k| *k == "first-quiz").count();
        assert_eq!(first_quiz_count, 1);
        assert_eq!(progress.badges["first-quiz"].earned_at, first_earned);
    }

    #[test]
    fn perfect_score_badge_requires_hundred_percent() {
        let user = Uuid::new_v4();
        let now = Utc::now();
        let mut progress = new_progress(user, now);

        apply_completion(&mut progress, &completion(90, false, now));
        assert!(!progress.badges.contains_key("perfect-score"));

        apply_completion(&mut progress, &completion(100, true, now));
        assert!(progress.badges.contains_key("perfect-score"));
    }

    #[test]
    fn high_scorer_needs_average_and_volume() {
        let user = Uuid::new_v4();
        let now = Utc::now();
        let mut progress = new_progress(user, now);

        for _ in 0..4 {
            apply_completion(&mut progress, &completion(90, false, now));
        }
        assert!(!progress.badges.contains_key("high-scorer"));

        apply_completion(&mut progress, &completion(90, false, now));
        assert!(progress.badges.contains_key("high-scorer"));
    }

    #[test]
    fn quiz_master_at_ten_completions() {
        let user = Uuid::new_v4();
        let now = Utc::now();
        let mut progress = new_progress(user, now);

        for _ in 0..9 {
            apply_completion(&mut progress, &completion(60, false, now));
        }
        assert!(!progress.badges.contains_key("quiz-master"));
        apply_completion(&mut progress, &completion(60, false, now));
        assert!(progress.badges.contains_key("quiz-master"));
    }

    #[test]
    fn streak_counts_consecutive_days_backwards() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let at = |y, m, d| Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap();

        let completions = vec![
            completion(100, true, at(2026, 3, 10)),
            completion(100, true, at(2026, 3, 9)),
            completion(100, true, at(2026, 3, 9)), // same day, counted once
            completion(100, true, at(2026, 3, 8)),
            completion(100, true, at(2026, 3, 5)), // gap breaks the run
        ];
        assert_eq!(streak_days(&completions, today), 3);
    }

    #[test]
    fn streak_may_end_yesterday() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let at = |d| Utc.with_ymd_and_hms(2026, 3, d, 9, 0, 0).unwrap();

        let completions = vec![
            completion(100, true, at(9)),
            completion(100, true, at(8)),
        ];
        assert_eq!(streak_days(&completions, today), 2);
    }

    #[test]
    fn streak_zero_when_history_is_stale() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let old = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        assert_eq!(streak_days(&[completion(100, true, old)], today), 0);
        assert_eq!(streak_days(&[], today), 0);
    }

    #[test]
    fn cpd_hours_floors_and_falls_back() {
        let now = Utc::now();
        let episode = Uuid::new_v4();
        let short_episode = Uuid::new_v4();
        let mut durations = HashMap::new();
        durations.insert(episode, 5400_i64); // 1.5 h
        durations.insert(short_episode, 600_i64); // 10 min, floored to 0.5 h

        let mut with_episode = completion(100, true, now);
        with_episode.episode_id = Some(episode);
        let mut with_short = completion(100, true, now);
        with_short.episode_id = Some(short_episode);
        let without = completion(100, true, now);
        let failed = completion(50, false, now);

        let hours = cpd_hours(&[with_episode, with_short, without, failed], &durations);
        assert!((hours - (1.5 + 0.5 + 0.75)).abs() < 1e-9);
    }

    #[test]
    fn achievements_follow_thresholds() {
        let now = Utc::now();
        let one = vec![completion(100, true, now)];
        let ids: Vec<_> = achievements(&one).into_iter().map(|a| a.id).collect();
        assert!(ids.contains(&"getting-started".to_string()));
        assert!(ids.contains(&"perfectionist".to_string()));
        assert!(!ids.contains(&"regular-learner".to_string()));

        let many: Vec<_> = (0..10).map(|_| completion(80, true, now)).collect();
        let ids: Vec<_> = achievements(&many).into_iter().map(|a| a.id).collect();
        assert!(ids.contains(&"dedicated-learner".to_string()));
    }
}
