use crate::db::models::Breakdown;

/// How a scalar total is split across violation types for one class of camera
#[derive(Debug, PartialEq)]
pub struct WeightProfile {
    pub name: &'static str,
    /// Case-insensitive substrings of the camera id that select this profile
    pub patterns: &'static [&'static str],
    /// Weights in priority order; the first entry is the dominant type. Sums to 1.
    pub weights: &'static [(&'static str, f64)],
}

/// Profiles are tried in order; the last one matches every camera.
pub const WEIGHT_PROFILES: &[WeightProfile] = &[
    WeightProfile {
        name: "kitchen",
        patterns: &["kitchen", "cook", "28"],
        weights: &[("mask", 0.6), ("hat", 0.4)],
    },
    WeightProfile {
        name: "entrance",
        patterns: &["entrance", "front", "11"],
        weights: &[("mask", 0.7), ("hat", 0.2), ("uniform", 0.1)],
    },
    WeightProfile {
        name: "prep",
        patterns: &["prep", "34"],
        weights: &[("mask", 0.5), ("hat", 0.35), ("phone", 0.15)],
    },
    WeightProfile {
        name: "default",
        patterns: &[],
        weights: &[("mask", 0.5), ("hat", 0.3), ("phone", 0.15), ("uniform", 0.05)],
    },
];

pub fn profile_for(camera_id: &str) -> &'static WeightProfile {
    let camera = camera_id.to_lowercase();
    WEIGHT_PROFILES
        .iter()
        .find(|profile| profile.patterns.iter().any(|p| camera.contains(p)))
        .unwrap_or(&WEIGHT_PROFILES[WEIGHT_PROFILES.len() - 1])
}

/// Split `total` into a per-type breakdown using the camera's weight profile.
///
/// The result always sums to `total`, gives the dominant type at least one
/// unit and contains no zero entries. Non-positive totals yield an empty map.
pub fn synthesize_breakdown(total: i64, camera_id: &str) -> Breakdown {
    if total <= 0 {
        return Breakdown::new();
    }

    let profile = profile_for(camera_id);
    let mut counts: Vec<(&str, i64)> = profile
        .weights
        .iter()
        .map(|(violation_type, weight)| (*violation_type, (total as f64 * weight).round() as i64))
        .collect();
    counts[0].1 = counts[0].1.max(1);

    let assigned = counts
        .iter()
        .fold(0i64, |sum, (_, count)| sum.saturating_add(*count));
    if assigned < total {
        counts[0].1 += total - assigned;
    } else if assigned > total {
        let mut surplus = assigned - total;
        for (index, (_, count)) in counts.iter_mut().enumerate() {
            let floor = if index == 0 { 1 } else { 0 };
            let take = (*count - floor).clamp(0, surplus);
            *count -= take;
            surplus -= take;
            if surplus == 0 {
                break;
            }
        }
    }

    counts
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(violation_type, count)| (violation_type.to_string(), count))
        .collect()
}
