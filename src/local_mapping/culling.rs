//! Map-point and keyframe culling.
//!
//! Recent points get a grace period of a few keyframes to collect
//! observations; those that do not are erased. A keyframe is culled when
//! most of its points are already seen, at a similar scale, by enough other
//! keyframes.

use tracing::debug;

use crate::config::SlamConfig;
use crate::map::{KeyFrameId, Map, MapPointId};

#[derive(Debug, Clone)]
pub struct CullingConfig {
    pub grace_keyframes: u64,
    pub min_observations: usize,
    pub redundancy_factor: f64,
    pub min_observers: usize,
}

impl CullingConfig {
    pub fn from_config(config: &SlamConfig) -> Self {
        Self {
            grace_keyframes: config.recent_point_grace_keyframes,
            min_observations: config.recent_point_min_observations,
            redundancy_factor: config.redundancy_factor,
            min_observers: config.redundant_min_observers,
        }
    }
}

impl Default for CullingConfig {
    fn default() -> Self {
        Self::from_config(&SlamConfig::default())
    }
}

/// Check recently created points whose grace period has run out.
///
/// Points still too young stay in `recent`; the rest leave the list, and
/// those with fewer than `min_observations` observers are erased from the
/// map. Returns the number erased.
pub fn cull_recent_points(map: &mut Map, recent: &mut Vec<MapPointId>, config: &CullingConfig) -> usize {
    let now = map.keyframes_inserted();
    let mut erased = 0;

    recent.retain(|&mp_id| {
        let (age, observations) = match map.get_map_point(mp_id) {
            Some(mp) => (now.saturating_sub(mp.created_at), mp.num_observations()),
            None => return false,
        };
        if age < config.grace_keyframes {
            return true;
        }
        if observations < config.min_observations && map.erase_map_point(mp_id) {
            erased += 1;
        }
        false
    });

    if erased > 0 {
        debug!("[MapCulling] Erased {} weakly observed points, {} still recent", erased, recent.len());
    }
    erased
}

/// Redundant and total point counts of one keyframe.
///
/// A point is redundant when at least `min_observers` other keyframes see it
/// within one pyramid level of this keyframe's observation.
pub fn redundancy(map: &Map, kf_id: KeyFrameId, min_observers: usize) -> (usize, usize) {
    let kf = match map.get_keyframe(kf_id) {
        Some(kf) => kf,
        None => return (0, 0),
    };

    let mut n_points = 0;
    let mut n_redundant = 0;
    for (idx, mp_id) in kf.map_point_indices() {
        let mp = match map.get_map_point(mp_id) {
            Some(mp) => mp,
            None => continue,
        };
        n_points += 1;
        let level = kf.features[idx].level;

        let observers = mp
            .observations
            .iter()
            .filter(|(other, _)| **other != kf_id)
            .filter_map(|(other, other_idx)| map.get_keyframe(*other)?.features.get(*other_idx))
            .filter(|f| f.level + 1 >= level && f.level <= level + 1)
            .take(min_observers)
            .count();
        if observers >= min_observers {
            n_redundant += 1;
        }
    }
    (n_redundant, n_points)
}

/// Erase covisible neighbors of `kf_id` whose redundant fraction exceeds
/// `redundancy_factor`. The first keyframe and `kf_id` itself are kept.
pub fn cull_keyframes(map: &mut Map, kf_id: KeyFrameId, config: &CullingConfig) -> Vec<KeyFrameId> {
    let neighbors: Vec<KeyFrameId> = map.covisibility().neighbors(kf_id).iter().map(|(id, _)| *id).collect();
    let first = map.first_keyframe();

    let mut culled = Vec::new();
    for nb_id in neighbors {
        if Some(nb_id) == first || nb_id == kf_id {
            continue;
        }
        let (n_redundant, n_points) = redundancy(map, nb_id, config.min_observers);
        if n_points == 0 {
            continue;
        }
        let fraction = n_redundant as f64 / n_points as f64;
        if fraction > config.redundancy_factor && map.erase_keyframe(nb_id).is_some() {
            debug!(
                "[KFCulling] Erased {}: {}/{} points redundant ({:.2})",
                nb_id, n_redundant, n_points, fraction
            );
            culled.push(nb_id);
        }
    }
    culled
}
