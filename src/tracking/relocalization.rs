//! Recovery after tracking loss.
//!
//! Candidates come from the keyframe database (bag-of-words overlap). Each
//! candidate is verified in turn: descriptor matches against its map points,
//! pose-only refinement starting from the candidate's pose, then a projection
//! search over the candidate's covisible neighborhood to gather more
//! support. The first candidate with enough inliers wins.

use tracing::debug;

use crate::camera::Camera;
use crate::config::{ScalePyramid, SlamConfig};
use crate::frame::Frame;
use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::matcher::Matcher;
use crate::optimizer::{Optimizer, PoseObservation};

use super::local_map::{project_candidates, LocalMapParams, PointCache};

#[derive(Debug, Clone)]
pub struct RelocParams {
    pub min_overlap: f64,
    pub max_candidates: usize,
    pub min_inliers: usize,
    pub neighbors: usize,
    pub local_map: LocalMapParams,
}

impl RelocParams {
    pub fn from_config(config: &SlamConfig) -> Self {
        Self {
            min_overlap: config.min_overlap_ratio,
            max_candidates: config.max_reloc_candidates,
            min_inliers: config.reloc_min_inliers,
            neighbors: config.local_map_neighbors,
            local_map: LocalMapParams::from_config(config),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Relocalization {
    pub keyframe: KeyFrameId,
    /// Camera to world.
    pub pose: SE3,
    /// Inlier `(feature index, map point)` pairs.
    pub matches: Vec<(usize, MapPointId)>,
}

#[derive(Debug, Clone)]
pub struct RelocCandidate {
    pub keyframe: KeyFrameId,
    pub pose_cw: SE3,
    /// Points the keyframe observes.
    pub points: Vec<MapPointId>,
    /// Points of the keyframe and its best covisible neighbors.
    pub local_points: Vec<MapPointId>,
}

/// Everything verification needs, copied out of the map.
#[derive(Debug, Clone, Default)]
pub struct RelocQuery {
    /// Best database score first.
    pub candidates: Vec<RelocCandidate>,
    pub points: PointCache,
}

impl RelocQuery {
    /// Query the keyframe database and copy the candidates' neighborhoods.
    /// Returns None when `frame` has no bag-of-words vector.
    pub fn collect(map: &Map, frame: &Frame, params: &RelocParams) -> Option<Self> {
        let bow = frame.bow.as_ref()?;
        let mut query = RelocQuery::default();
        for candidate in map.keyframe_db().query(bow, params.min_overlap, params.max_candidates) {
            let Some(kf) = map.get_keyframe(candidate.keyframe_id) else {
                continue;
            };
            let points: Vec<MapPointId> = kf.map_point_indices().map(|(_, mp_id)| mp_id).collect();
            let mut local_kfs = vec![kf.id];
            local_kfs.extend(map.best_covisibles(kf.id, params.neighbors));
            let local_points = map.map_points_of(&local_kfs);

            query.points.capture(map, points.iter().copied());
            query.points.capture(map, local_points.iter().copied());
            query.candidates.push(RelocCandidate {
                keyframe: kf.id,
                pose_cw: kf.pose_cw(),
                points,
                local_points,
            });
        }
        Some(query)
    }
}

/// Pose-only refinement over `matches`; returns the refined T_cw and inliers.
/// Matches whose point is not cached are dropped.
pub(crate) fn refine_matches(
    cache: &PointCache,
    pyramid: &ScalePyramid,
    frame: &Frame,
    camera: &Camera,
    optimizer: &dyn Optimizer,
    initial_cw: &SE3,
    matches: &[(usize, MapPointId)],
) -> (SE3, Vec<(usize, MapPointId)>) {
    let (kept, observations): (Vec<_>, Vec<_>) = matches
        .iter()
        .filter_map(|&(idx, mp_id)| {
            let mp = cache.get(mp_id)?;
            let feature = &frame.features[idx];
            Some((
                (idx, mp_id),
                PoseObservation {
                    point: mp.position,
                    pixel: feature.pixel,
                    inv_sigma2: pyramid.inv_sigma2(feature.level),
                },
            ))
        })
        .unzip();

    let refined = optimizer.pose_only_refine(camera, initial_cw, &observations);
    let inliers = kept
        .into_iter()
        .zip(&refined.inliers)
        .filter_map(|(m, ok)| ok.then_some(m))
        .collect();
    (refined.pose, inliers)
}

/// Verify the candidates of `query` in order and return the first accepted.
/// Runs on copies only; the map lock is not needed.
pub fn relocalize(
    query: &RelocQuery,
    frame: &Frame,
    camera: &Camera,
    matcher: &dyn Matcher,
    optimizer: &dyn Optimizer,
    pyramid: &ScalePyramid,
    params: &RelocParams,
) -> Option<Relocalization> {
    debug!("[Reloc] Frame {}: {} candidates", frame.id, query.candidates.len());
    let cache = &query.points;

    for candidate in &query.candidates {
        let kf_id = candidate.keyframe;
        let matches = matcher.search_by_descriptors(frame, &cache.descriptors(&candidate.points));
        if matches.len() < params.min_inliers {
            debug!("[Reloc] {}: only {} descriptor matches", kf_id, matches.len());
            continue;
        }

        let (pose_cw, mut inliers) =
            refine_matches(cache, pyramid, frame, camera, optimizer, &candidate.pose_cw, &matches);
        if inliers.len() < params.min_inliers / 2 {
            debug!("[Reloc] {}: {} inliers after refinement", kf_id, inliers.len());
            continue;
        }

        // More support from the candidate's neighborhood.
        let mut posed = frame.clone();
        posed.clear_map_points();
        for &(idx, mp_id) in &inliers {
            posed.set_map_point(idx, mp_id);
        }
        let projected = project_candidates(
            cache,
            &posed,
            &pose_cw,
            &candidate.local_points,
            camera,
            pyramid,
            &params.local_map,
        );
        let extra = matcher.search_by_projection(&posed, &projected, params.local_map.radius, pyramid);
        let (pose_cw, all) = if extra.is_empty() {
            (pose_cw, inliers)
        } else {
            inliers.extend(extra);
            refine_matches(cache, pyramid, frame, camera, optimizer, &pose_cw, &inliers)
        };

        if all.len() >= params.min_inliers {
            debug!("[Reloc] Accepted {} with {} inliers", kf_id, all.len());
            return Some(Relocalization {
                keyframe: kf_id,
                pose: pose_cw.inverse(),
                matches: all,
            });
        }
        debug!("[Reloc] {}: {} inliers, need {}", kf_id, all.len(), params.min_inliers);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    use crate::map::KeyFrame;
    use crate::matcher::OrbMatcher;
    use crate::optimizer::LmOptimizer;
    use crate::test_support::{create_test_camera, create_test_pose, SyntheticScene};
    use crate::vocabulary::{BowVector, OrbVocabulary, Vocabulary};

    /// One keyframe at the origin seeing every visible landmark.
    fn create_test_map(scene: &SyntheticScene, vocab: &OrbVocabulary) -> Map {
        let config = SlamConfig::default();
        let mut map = Map::from_config(&config);
        let (mut frame, landmark_of) = scene.frame(0, &SE3::identity());
        frame.bow = Some(vocab.summarize(&frame.descriptors()));
        frame.promote_to_keyframe();
        let kf = KeyFrame::from_frame(frame).unwrap();
        let kf_id = kf.id;
        map.insert_keyframe(kf).unwrap();
        for (idx, lm) in landmark_of.iter().enumerate() {
            let mp = map.create_map_point(scene.landmarks[*lm], scene.descriptors[*lm], kf_id);
            map.associate(kf_id, idx, mp);
            map.update_map_point_geometry(mp);
        }
        map.update_connections(kf_id);
        map
    }

    fn run_relocalize(map: &Map, lost: &Frame) -> Option<Relocalization> {
        let params = create_test_params();
        let query = RelocQuery::collect(map, lost, &params)?;
        relocalize(
            &query,
            lost,
            &create_test_camera(),
            &OrbMatcher::new(),
            &LmOptimizer::default(),
            map.pyramid(),
            &params,
        )
    }

    fn create_test_params() -> RelocParams {
        RelocParams {
            min_inliers: 20,
            ..RelocParams::from_config(&SlamConfig::default())
        }
    }

    #[test]
    fn test_relocalize_near_keyframe() {
        let scene = SyntheticScene::new(150, 21);
        let vocab = OrbVocabulary::from_words(scene.descriptors.clone());
        let map = create_test_map(&scene, &vocab);

        let truth = create_test_pose(0.15, -0.05, 0.1);
        let (mut lost, _) = scene.frame(7, &truth);
        lost.pose = SE3::identity();
        lost.bow = Some(vocab.summarize(&lost.descriptors()));

        let reloc = run_relocalize(&map, &lost).expect("relocalization should succeed");

        assert_eq!(reloc.keyframe, KeyFrameId::new(0));
        assert!(reloc.matches.len() >= 20);
        assert_relative_eq!(reloc.pose.translation, truth.translation, epsilon = 1e-4);
    }

    #[test]
    fn test_relocalize_without_candidates() {
        let scene = SyntheticScene::new(150, 22);
        let vocab = OrbVocabulary::from_words(scene.descriptors.clone());
        let map = create_test_map(&scene, &vocab);

        // Words unknown to the database: no candidate passes the overlap gate.
        let (mut lost, _) = scene.frame(3, &SE3::identity());
        lost.bow = Some(BowVector::from([(10_000, 1.0)]));

        let query = RelocQuery::collect(&map, &lost, &create_test_params()).unwrap();
        assert!(query.candidates.is_empty());
        assert!(run_relocalize(&map, &lost).is_none());

        lost.bow = None;
        assert!(RelocQuery::collect(&map, &lost, &create_test_params()).is_none());
    }

    #[test]
    fn test_relocalize_falls_through_to_second_candidate() {
        let scene = SyntheticScene::new(150, 23);
        let vocab = OrbVocabulary::from_words(scene.descriptors.clone());
        let config = SlamConfig::default();
        let mut map = Map::from_config(&config);

        // Best-scoring keyframe: same view as the lost frame, but its points
        // sit at the positions of other landmarks, so no pose explains them.
        let (mut frame_a, landmark_of) = scene.frame(0, &SE3::identity());
        frame_a.bow = Some(vocab.summarize(&frame_a.descriptors()));
        frame_a.promote_to_keyframe();
        let kf_a = KeyFrame::from_frame(frame_a).unwrap();
        let kf_a_id = kf_a.id;
        map.insert_keyframe(kf_a).unwrap();
        let n = landmark_of.len();
        for (idx, lm) in landmark_of.iter().enumerate() {
            let wrong = scene.landmarks[landmark_of[(idx + n / 2) % n]];
            let mp = map.create_map_point(wrong, scene.descriptors[*lm], kf_a_id);
            map.associate(kf_a_id, idx, mp);
            map.update_map_point_geometry(mp);
        }
        map.update_connections(kf_a_id);

        // Weaker keyframe: only part of the view, with correct points.
        let (full_b, _) = scene.frame(1, &SE3::identity());
        let keep = full_b.features.len() * 3 / 5;
        let mut frame_b = Frame::from_features(full_b.id, full_b.timestamp, full_b.features[..keep].to_vec());
        frame_b.bow = Some(vocab.summarize(&frame_b.descriptors()));
        frame_b.promote_to_keyframe();
        let kf_b = KeyFrame::from_frame(frame_b).unwrap();
        let kf_b_id = kf_b.id;
        map.insert_keyframe(kf_b).unwrap();
        for (idx, lm) in landmark_of[..keep].iter().enumerate() {
            let mp = map.create_map_point(scene.landmarks[*lm], scene.descriptors[*lm], kf_b_id);
            map.associate(kf_b_id, idx, mp);
            map.update_map_point_geometry(mp);
        }
        map.update_connections(kf_b_id);

        let truth = create_test_pose(0.1, 0.0, 0.05);
        let (mut lost, _) = scene.frame(9, &truth);
        lost.pose = SE3::identity();
        lost.bow = Some(vocab.summarize(&lost.descriptors()));

        let query = RelocQuery::collect(&map, &lost, &create_test_params()).unwrap();
        assert_eq!(query.candidates.len(), 2);
        assert_eq!(query.candidates[0].keyframe, kf_a_id);

        let reloc = run_relocalize(&map, &lost).expect("second candidate should be accepted");
        assert_eq!(reloc.keyframe, kf_b_id);
        assert!(reloc.matches.len() >= 20);
        assert_relative_eq!(reloc.pose.translation, truth.translation, epsilon = 1e-4);
    }
}
