//! Progression tables and pure lookups
//!
//! Every threshold the ledger applies lives here as a fixed, ordered table:
//! rank thresholds, streak milestones, daily combo bonuses, bandwidth tier
//! bands and achievement definitions. Lookups are pure functions of their
//! inputs so score -> rank, length -> bonus and amount -> tier are always
//! reproducible.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ============================================================================
// RANKS
// ============================================================================

/// One rung of the rank ladder. `min_score` thresholds are strictly
/// increasing; a user's rank is the last rung whose threshold their score
/// has reached.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RankTier {
    pub label: &'static str,
    pub min_score: i64,
}

pub const RANKS: [RankTier; 12] = [
    RankTier { label: "Private", min_score: 0 },
    RankTier { label: "Corporal", min_score: 50 },
    RankTier { label: "Sergeant", min_score: 120 },
    RankTier { label: "Lieutenant", min_score: 220 },
    RankTier { label: "Captain", min_score: 370 },
    RankTier { label: "Major", min_score: 600 },
    RankTier { label: "Colonel", min_score: 1_000 },
    RankTier { label: "Brigadier", min_score: 1_600 },
    RankTier { label: "General", min_score: 2_500 },
    RankTier { label: "Major General", min_score: 4_000 },
    RankTier { label: "Lieutenant General", min_score: 6_500 },
    RankTier { label: "Marshal", min_score: 10_000 },
];

/// How many of the highest ranks qualify for a physical reward.
pub const TOP_REWARD_RANK_COUNT: usize = 3;

/// Zero-based index of the rank a score earns. Rank transitions are
/// detected by comparing indices, never display labels.
pub fn rank_for_score(score: i64) -> usize {
    let mut idx = 0;
    for (i, tier) in RANKS.iter().enumerate() {
        if score >= tier.min_score {
            idx = i;
        } else {
            break;
        }
    }
    idx
}

pub fn rank_label(idx: usize) -> &'static str {
    RANKS.get(idx).map_or(RANKS[0].label, |tier| tier.label)
}

pub fn is_top_reward_rank(idx: usize) -> bool {
    idx + TOP_REWARD_RANK_COUNT >= RANKS.len() && idx < RANKS.len()
}

/// Physical reward class for a rank, highest rank first.
pub fn reward_type_for_rank(idx: usize) -> Option<&'static str> {
    if !is_top_reward_rank(idx) {
        return None;
    }
    match RANKS.len() - 1 - idx {
        0 => Some("GOLD_MEDAL_MARSHAL"),
        1 => Some("SILVER_MEDAL_GENERAL"),
        2 => Some("BRONZE_MEDAL_COMMANDER"),
        _ => None,
    }
}

// ============================================================================
// STREAKS
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct StreakMilestone {
    pub days: i32,
    pub bonus_points: i64,
    pub multiplier: f64,
}

pub const STREAK_MILESTONES: [StreakMilestone; 4] = [
    StreakMilestone { days: 7, bonus_points: 15, multiplier: 1.25 },
    StreakMilestone { days: 14, bonus_points: 35, multiplier: 1.35 },
    StreakMilestone { days: 30, bonus_points: 100, multiplier: 1.5 },
    StreakMilestone { days: 100, bonus_points: 500, multiplier: 2.0 },
];

/// Point multiplier for a streak length: the highest milestone at or below
/// the length, 1.0 below the first milestone.
pub fn streak_multiplier(length: i32) -> f64 {
    let mut multiplier = 1.0;
    for milestone in STREAK_MILESTONES.iter() {
        if length >= milestone.days {
            multiplier = milestone.multiplier;
        }
    }
    multiplier
}

/// Bonus points when a streak length lands exactly on a milestone multiple
/// (day 7, 14, 21... pay out; day 8 does not). Overlaps resolve to the
/// highest qualifying milestone, so day 14 pays the 14-day bonus.
pub fn streak_bonus(length: i32) -> i64 {
    for milestone in STREAK_MILESTONES.iter().rev() {
        if length >= milestone.days && length % milestone.days == 0 {
            return milestone.bonus_points;
        }
    }
    0
}

/// Outcome of applying one qualifying day to a streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreakAdvance {
    pub current: i32,
    pub longest: i32,
    /// False only for a same-day repeat, which must not double count.
    pub changed: bool,
}

/// Pure streak transition: first occurrence starts at 1, a same-day repeat
/// is a no-op, exactly one day's gap extends, two or more days reset to 1.
pub fn advance_streak(
    current: i32,
    longest: i32,
    last: Option<NaiveDate>,
    today: NaiveDate,
) -> StreakAdvance {
    match last {
        None => StreakAdvance { current: 1, longest: longest.max(1), changed: true },
        Some(date) if date == today => StreakAdvance { current, longest, changed: false },
        Some(date) if today.signed_duration_since(date).num_days() == 1 => {
            let extended = current + 1;
            StreakAdvance { current: extended, longest: longest.max(extended), changed: true }
        }
        Some(_) => StreakAdvance { current: 1, longest: longest.max(1), changed: true },
    }
}

// ============================================================================
// DAILY COMBOS
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ComboBonus {
    pub distinct_actions: i64,
    pub bonus_points: i64,
}

pub const COMBO_BONUSES: [ComboBonus; 4] = [
    ComboBonus { distinct_actions: 3, bonus_points: 15 },
    ComboBonus { distinct_actions: 4, bonus_points: 30 },
    ComboBonus { distinct_actions: 5, bonus_points: 60 },
    ComboBonus { distinct_actions: 7, bonus_points: 150 },
];

/// Bonus for performing `distinct` different action types in one day;
/// the highest qualifying threshold wins, below the first it is 0.
pub fn combo_bonus(distinct: i64) -> i64 {
    let mut bonus = 0;
    for combo in COMBO_BONUSES.iter() {
        if distinct >= combo.distinct_actions {
            bonus = combo.bonus_points;
        }
    }
    bonus
}

// ============================================================================
// BANDWIDTH TIERS
// ============================================================================

/// One ascending bandwidth band. A band is entered strictly above the
/// previous band's inclusive upper bound, so 10.0 GB is still the lowest
/// band and 10.1 GB is the next one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierBand {
    pub label: &'static str,
    /// Inclusive upper bound in GB; `None` for the open-ended top band.
    pub max_gb: Option<f64>,
    pub points: i64,
}

/// Amounts below this many GB classify as undetermined.
pub const MIN_TIER_GB: f64 = 1.0;

pub const TIER_BANDS: [TierBand; 5] = [
    TierBand { label: "1-10", max_gb: Some(10.0), points: 25 },
    TierBand { label: "11-50", max_gb: Some(50.0), points: 75 },
    TierBand { label: "51-100", max_gb: Some(100.0), points: 150 },
    TierBand { label: "101-500", max_gb: Some(500.0), points: 300 },
    TierBand { label: "500+", max_gb: None, points: 600 },
];

/// Map a normalized GB amount to its band, or `None` when the amount is
/// below the qualifying minimum (or not a finite number).
pub fn classify_tier(gb: f64) -> Option<&'static TierBand> {
    if !gb.is_finite() || gb < MIN_TIER_GB {
        return None;
    }
    for band in TIER_BANDS.iter() {
        match band.max_gb {
            Some(max) if gb <= max => return Some(band),
            None => return Some(band),
            _ => {}
        }
    }
    None
}

/// Find a band by its label (manual tier selection arrives as a label).
pub fn tier_band(label: &str) -> Option<&'static TierBand> {
    TIER_BANDS.iter().find(|band| band.label == label)
}

// ============================================================================
// ACHIEVEMENTS
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub enum Requirement {
    /// Cumulative score reached.
    TotalScore(i64),
    /// A specific action performed at least this many times.
    ActionCount(&'static str, i64),
}

#[derive(Debug, Clone, Copy)]
pub struct AchievementDef {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub reward_points: i64,
    pub requirement: Requirement,
}

pub const ACHIEVEMENTS: [AchievementDef; 6] = [
    AchievementDef {
        id: "first_step",
        name: "First Step",
        description: "Earn your first 10 points",
        category: "general",
        reward_points: 10,
        requirement: Requirement::TotalScore(10),
    },
    AchievementDef {
        id: "century",
        name: "Century",
        description: "Reach 100 points",
        category: "milestone",
        reward_points: 50,
        requirement: Requirement::TotalScore(100),
    },
    AchievementDef {
        id: "half_k",
        name: "Half Thousand",
        description: "Reach 500 points",
        category: "milestone",
        reward_points: 100,
        requirement: Requirement::TotalScore(500),
    },
    AchievementDef {
        id: "one_k",
        name: "Thousand Club",
        description: "Reach 1,000 points",
        category: "milestone",
        reward_points: 200,
        requirement: Requirement::TotalScore(1_000),
    },
    AchievementDef {
        id: "outreach_regular",
        name: "Outreach Regular",
        description: "Confirm 50 social posts",
        category: "specialist",
        reward_points: 100,
        requirement: Requirement::ActionCount("post_confirmed", 50),
    },
    AchievementDef {
        id: "media_marathon",
        name: "Media Marathon",
        description: "Submit 100 media reports",
        category: "specialist",
        reward_points: 150,
        requirement: Requirement::ActionCount("media_submitted", 100),
    },
];

impl AchievementDef {
    pub fn satisfied(&self, score: i64, action_counts: &HashMap<String, i64>) -> bool {
        match self.requirement {
            Requirement::TotalScore(needed) => score >= needed,
            Requirement::ActionCount(action, needed) => {
                action_counts.get(action).copied().unwrap_or(0) >= needed
            }
        }
    }

    /// Stable encoding of the requirement for the definitions table.
    pub fn requirement_type(&self) -> &'static str {
        match self.requirement {
            Requirement::TotalScore(_) => "points",
            Requirement::ActionCount(_, _) => "action_count",
        }
    }

    pub fn requirement_value(&self) -> String {
        match self.requirement {
            Requirement::TotalScore(needed) => needed.to_string(),
            Requirement::ActionCount(action, needed) => format!("{}:{}", action, needed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_thresholds_increasing() {
        for pair in RANKS.windows(2) {
            assert!(pair[0].min_score < pair[1].min_score);
        }
        assert_eq!(RANKS[0].min_score, 0);
    }

    #[test]
    fn test_rank_for_score_boundaries() {
        assert_eq!(rank_for_score(0), 0);
        assert_eq!(rank_for_score(49), 0);
        assert_eq!(rank_for_score(50), 1);
        assert_eq!(rank_for_score(119), 1);
        assert_eq!(rank_for_score(120), 2);
        assert_eq!(rank_for_score(9_999), 10);
        assert_eq!(rank_for_score(10_000), 11);
        assert_eq!(rank_for_score(1_000_000), 11);
    }

    #[test]
    fn test_rank_label_out_of_range() {
        assert_eq!(rank_label(0), "Private");
        assert_eq!(rank_label(11), "Marshal");
        assert_eq!(rank_label(99), "Private");
    }

    #[test]
    fn test_top_rank_physical_rewards() {
        assert!(!is_top_reward_rank(8));
        assert!(is_top_reward_rank(9));
        assert!(is_top_reward_rank(10));
        assert!(is_top_reward_rank(11));
        assert_eq!(reward_type_for_rank(11), Some("GOLD_MEDAL_MARSHAL"));
        assert_eq!(reward_type_for_rank(10), Some("SILVER_MEDAL_GENERAL"));
        assert_eq!(reward_type_for_rank(9), Some("BRONZE_MEDAL_COMMANDER"));
        assert_eq!(reward_type_for_rank(8), None);
    }

    #[test]
    fn test_streak_multiplier() {
        assert_eq!(streak_multiplier(1), 1.0);
        assert_eq!(streak_multiplier(6), 1.0);
        assert_eq!(streak_multiplier(7), 1.25);
        assert_eq!(streak_multiplier(13), 1.25);
        assert_eq!(streak_multiplier(30), 1.5);
        assert_eq!(streak_multiplier(250), 2.0);
    }

    #[test]
    fn test_streak_bonus_exact_multiples() {
        assert_eq!(streak_bonus(6), 0);
        assert_eq!(streak_bonus(7), 15);
        assert_eq!(streak_bonus(8), 0);
        assert_eq!(streak_bonus(14), 35);
        assert_eq!(streak_bonus(21), 15);
        assert_eq!(streak_bonus(30), 100);
        assert_eq!(streak_bonus(100), 500);
    }

    #[test]
    fn test_streak_same_day_idempotent() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let advance = advance_streak(5, 8, Some(today), today);
        assert_eq!(advance, StreakAdvance { current: 5, longest: 8, changed: false });
    }

    #[test]
    fn test_streak_extends_next_day() {
        let yesterday = NaiveDate::from_ymd_opt(2025, 6, 9).unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let advance = advance_streak(8, 8, Some(yesterday), today);
        assert_eq!(advance, StreakAdvance { current: 9, longest: 9, changed: true });
    }

    #[test]
    fn test_streak_resets_after_gap() {
        let last = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let advance = advance_streak(20, 20, Some(last), today);
        assert_eq!(advance, StreakAdvance { current: 1, longest: 20, changed: true });
    }

    #[test]
    fn test_streak_first_occurrence() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let advance = advance_streak(0, 0, None, today);
        assert_eq!(advance, StreakAdvance { current: 1, longest: 1, changed: true });
    }

    #[test]
    fn test_combo_bonus_thresholds() {
        assert_eq!(combo_bonus(0), 0);
        assert_eq!(combo_bonus(2), 0);
        assert_eq!(combo_bonus(3), 15);
        assert_eq!(combo_bonus(4), 30);
        assert_eq!(combo_bonus(5), 60);
        assert_eq!(combo_bonus(6), 60);
        assert_eq!(combo_bonus(7), 150);
        assert_eq!(combo_bonus(9), 150);
    }

    #[test]
    fn test_tier_boundaries() {
        assert!(classify_tier(0.9).is_none());
        assert_eq!(classify_tier(1.0).unwrap().label, "1-10");
        assert_eq!(classify_tier(10.0).unwrap().label, "1-10");
        assert_eq!(classify_tier(10.1).unwrap().label, "11-50");
        assert_eq!(classify_tier(50.0).unwrap().label, "11-50");
        assert_eq!(classify_tier(100.0).unwrap().label, "51-100");
        assert_eq!(classify_tier(500.0).unwrap().label, "101-500");
        assert_eq!(classify_tier(500.1).unwrap().label, "500+");
        assert_eq!(classify_tier(40_000.0).unwrap().label, "500+");
    }

    #[test]
    fn test_tier_non_finite_amounts() {
        assert!(classify_tier(f64::NAN).is_none());
        assert!(classify_tier(f64::INFINITY).is_none());
        assert!(classify_tier(f64::NEG_INFINITY).is_none());
    }

    #[test]
    fn test_tier_points() {
        assert_eq!(classify_tier(5.0).unwrap().points, 25);
        assert_eq!(classify_tier(45.0).unwrap().points, 75);
        assert_eq!(classify_tier(99.0).unwrap().points, 150);
        assert_eq!(classify_tier(200.0).unwrap().points, 300);
        assert_eq!(classify_tier(9_000.0).unwrap().points, 600);
    }

    #[test]
    fn test_tier_band_by_label() {
        assert_eq!(tier_band("51-100").unwrap().points, 150);
        assert!(tier_band("nope").is_none());
    }

    #[test]
    fn test_achievement_score_requirement() {
        let counts = HashMap::new();
        let century = ACHIEVEMENTS.iter().find(|a| a.id == "century").unwrap();
        assert!(!century.satisfied(99, &counts));
        assert!(century.satisfied(100, &counts));
    }

    #[test]
    fn test_achievement_action_count() {
        let mut counts = HashMap::new();
        counts.insert("post_confirmed".to_string(), 49);
        let outreach = ACHIEVEMENTS.iter().find(|a| a.id == "outreach_regular").unwrap();
        assert!(!outreach.satisfied(10_000, &counts));
        counts.insert("post_confirmed".to_string(), 50);
        assert!(outreach.satisfied(0, &counts));
    }

    #[test]
    fn test_achievement_requirement_encoding() {
        let outreach = ACHIEVEMENTS.iter().find(|a| a.id == "outreach_regular").unwrap();
        assert_eq!(outreach.requirement_type(), "action_count");
        assert_eq!(outreach.requirement_value(), "post_confirmed:50");
        let century = ACHIEVEMENTS.iter().find(|a| a.id == "century").unwrap();
        assert_eq!(century.requirement_type(), "points");
        assert_eq!(century.requirement_value(), "100");
    }
}
