//! Tracking: estimates the pose of every incoming frame and decides when a
//! new keyframe is needed.
//!
//! - `UNINITIALIZED`: frames feed the [`Initializer`]; on success the two
//!   bootstrap keyframes and their points are written into the map.
//! - `GOOD`: constant-velocity prediction, projection matching against the
//!   last frame (retried with a doubled radius, then a descriptor search
//!   against the reference keyframe), pose-only refinement, then track the
//!   local map and refine again. Keyframes go to LocalMapping through the
//!   bounded queue without ever blocking.
//! - `LOST`: relocalization against the keyframe database; if no candidate
//!   verifies, the whole session is reset.
//!
//! The map read lock is only held while map data is copied into a
//! [`PointCache`]. Matching and pose refinement run on the copies.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::camera::Camera;
use crate::config::{ScalePyramid, SlamConfig};
use crate::error::Result;
use crate::frame::{Descriptor, Frame};
use crate::geometry::SE3;
use crate::map::{KeyFrame, KeyFrameId, MapPointId};
use crate::system::collaborators::Collaborators;
use crate::system::messages::{FrameUpdate, NewKeyFrameMsg, ViewerEvent};
use crate::system::shared_state::SharedState;
use crate::tracking::initializer::{Bootstrap, InitOutcome, Initializer};
use crate::tracking::keyframe_decision::{KeyFrameInputs, KeyFramePolicy};
use crate::tracking::local_map::{build_local_map, project_candidates, LocalMapParams, PointCache};
use crate::tracking::motion_model::MotionModel;
use crate::tracking::relocalization::{refine_matches, relocalize, RelocParams, RelocQuery};
use crate::tracking::result::{TrackingEvent, TrackingMetrics, TrackingResult};
use crate::tracking::TrackingState;

/// Outcome of tracking one frame against the map.
#[derive(Debug, Clone, Copy)]
struct FrameTracking {
    n_matches: usize,
    n_inliers: usize,
    n_weak: usize,
    n_local_points: usize,
    /// Voted reference keyframe and its map point count.
    reference: Option<(KeyFrameId, usize)>,
}

pub struct Tracker {
    config: Arc<SlamConfig>,
    camera: Camera,
    pyramid: ScalePyramid,
    shared: Arc<SharedState>,
    collab: Collaborators,

    /// Keyframes to LocalMapping.
    kf_sender: Sender<NewKeyFrameMsg>,
    /// Receiving end of the same queue, only used to drain it on reset.
    kf_drain: Receiver<NewKeyFrameMsg>,
    viewer: Option<Sender<ViewerEvent>>,

    state: TrackingState,
    initializer: Initializer,
    motion: MotionModel,
    policy: KeyFramePolicy,
    local_params: LocalMapParams,
    reloc_params: RelocParams,

    /// Only the previous frame is kept, for the motion prior and projection matching.
    last_frame: Option<Frame>,
    reference_kf: Option<KeyFrameId>,
    reference_tracked: usize,
    frames_since_keyframe: usize,
}

impl Tracker {
    pub fn new(
        config: Arc<SlamConfig>,
        camera: Camera,
        shared: Arc<SharedState>,
        collab: Collaborators,
        kf_sender: Sender<NewKeyFrameMsg>,
        kf_drain: Receiver<NewKeyFrameMsg>,
    ) -> Self {
        Self {
            initializer: Initializer::new(&config),
            policy: KeyFramePolicy::from_config(&config),
            local_params: LocalMapParams::from_config(&config),
            reloc_params: RelocParams::from_config(&config),
            pyramid: config.pyramid(),
            config,
            camera,
            shared,
            collab,
            kf_sender,
            kf_drain,
            viewer: None,
            state: TrackingState::Uninitialized,
            motion: MotionModel::new(),
            last_frame: None,
            reference_kf: None,
            reference_tracked: 0,
            frames_since_keyframe: 0,
        }
    }

    pub fn with_viewer(mut self, viewer: Sender<ViewerEvent>) -> Self {
        self.viewer = Some(viewer);
        self
    }

    /// Hand back the viewer sender so the viewer thread can see its channel close.
    pub fn detach_viewer(&mut self) -> Option<Sender<ViewerEvent>> {
        self.viewer.take()
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn reference_keyframe(&self) -> Option<KeyFrameId> {
        self.reference_kf
    }

    /// Camera to world pose of the last tracked frame.
    pub fn last_pose(&self) -> Option<SE3> {
        self.last_frame.as_ref().map(|f| f.pose)
    }

    /// Process one frame. Frames must arrive in order on a single thread.
    pub fn track(&mut self, mut frame: Frame) -> TrackingResult {
        let mut result = TrackingResult {
            frame_id: frame.id,
            timestamp: frame.timestamp,
            state: self.state,
            pose: None,
            reference_kf: None,
            new_keyframe: None,
            event: None,
            metrics: TrackingMetrics {
                n_features: frame.num_features(),
                ..TrackingMetrics::default()
            },
        };

        match self.state {
            TrackingState::Uninitialized => self.step_initialize(&mut frame, &mut result),
            TrackingState::Good => self.step_track(&mut frame, &mut result),
            TrackingState::Lost => self.step_relocalize(&mut frame, &mut result),
        }

        result.state = self.state;
        result.reference_kf = self.reference_kf;
        if self.state.is_good() {
            result.pose = Some(frame.pose);
        }
        self.publish(&frame, &result);
        if self.state.is_good() {
            self.last_frame = Some(frame);
        }
        result
    }

    /// Discard the map and every queued keyframe and start over.
    pub fn reset(&mut self) {
        let epoch = self.shared.reset_map();
        let dropped = self.kf_drain.try_iter().count();

        self.state = TrackingState::Uninitialized;
        self.initializer.reset();
        self.motion.reset();
        self.last_frame = None;
        self.reference_kf = None;
        self.reference_tracked = 0;
        self.frames_since_keyframe = 0;

        // A dropped event is fine: the viewer also follows the shared epoch.
        if let Some(viewer) = &self.viewer {
            let _ = viewer.try_send(ViewerEvent::Reset { epoch });
        }
        info!("[Tracking] Session reset (epoch {}), {} queued keyframes dropped", epoch, dropped);
    }

    // ─────────────────────────────────────────────────────────────────────
    // UNINITIALIZED
    // ─────────────────────────────────────────────────────────────────────

    fn step_initialize(&mut self, frame: &mut Frame, result: &mut TrackingResult) {
        let outcome = self
            .initializer
            .add_frame(frame, &self.camera, self.collab.matcher.as_ref());
        let bootstrap = match outcome {
            InitOutcome::Ready(bootstrap) => bootstrap,
            InitOutcome::Pending | InitOutcome::Failed => return,
        };

        match self.seed_map(*bootstrap) {
            Ok(current) => {
                result.metrics.n_matches = current.num_tracked();
                result.metrics.n_inliers = current.num_tracked();
                *frame = current;
                self.state = TrackingState::Good;
                result.event = Some(TrackingEvent::Initialized);
                info!("[Tracking] {} -> {}", TrackingState::Uninitialized, self.state);
            }
            Err(e) => {
                warn!("[Init] Could not seed the map: {}", e);
                self.reset();
            }
        }
    }

    /// Insert the two bootstrap keyframes and their points in one write.
    /// Returns the current frame with its associations.
    fn seed_map(&mut self, bootstrap: Bootstrap) -> Result<Frame> {
        let Bootstrap {
            mut reference,
            mut current,
            points,
        } = bootstrap;

        for frame in [&mut reference, &mut current] {
            frame.bow = Some(self.collab.vocabulary.summarize(&frame.descriptors()));
            frame.promote_to_keyframe();
        }
        let ref_kf = KeyFrame::from_frame(reference)?;
        let cur_kf = KeyFrame::from_frame(current.clone())?;
        let (ref_id, cur_id) = (ref_kf.id, cur_kf.id);
        let descriptors: Vec<Descriptor> = points.iter().map(|(i1, _, _)| ref_kf.features[*i1].descriptor).collect();

        let linked = self.shared.write_map(|map| -> Result<Vec<(usize, MapPointId)>> {
            map.insert_keyframe(ref_kf)?;
            map.insert_keyframe(cur_kf)?;
            let mut linked = Vec::with_capacity(points.len());
            for ((i1, i2, position), descriptor) in points.iter().zip(descriptors) {
                let mp_id = map.create_map_point(*position, descriptor, ref_id);
                map.associate(ref_id, *i1, mp_id);
                map.associate(cur_id, *i2, mp_id);
                map.update_map_point_geometry(mp_id);
                linked.push((*i2, mp_id));
            }
            map.update_connections(ref_id);
            map.update_connections(cur_id);
            Ok(linked)
        })?;

        current.clear_map_points();
        for (idx, mp_id) in &linked {
            current.set_map_point(*idx, *mp_id);
        }

        self.motion.reset();
        self.motion.update(&SE3::identity());
        self.motion.update(&current.pose);
        self.reference_kf = Some(cur_id);
        self.reference_tracked = linked.len();
        self.frames_since_keyframe = 0;

        info!(
            "[Init] Map seeded with {} and {}, {} map points",
            ref_id,
            cur_id,
            linked.len()
        );
        Ok(current)
    }

    // ─────────────────────────────────────────────────────────────────────
    // GOOD
    // ─────────────────────────────────────────────────────────────────────

    fn step_track(&mut self, frame: &mut Frame, result: &mut TrackingResult) {
        self.frames_since_keyframe += 1;
        frame.pose = self
            .motion
            .predict()
            .or_else(|| self.last_pose())
            .unwrap_or_else(SE3::identity);

        let tracked = match self.track_frame(frame) {
            Some(t) if t.n_inliers >= self.config.min_track_inliers => t,
            other => {
                warn!(
                    "[Tracking] Frame {} lost ({} inliers, need {})",
                    frame.id,
                    other.map_or(0, |t| t.n_inliers),
                    self.config.min_track_inliers
                );
                self.state = TrackingState::Lost;
                result.event = Some(TrackingEvent::Lost);
                info!("[Tracking] {} -> {}", TrackingState::Good, self.state);
                return;
            }
        };

        self.motion.update(&frame.pose);
        if let Some((kf_id, n_points)) = tracked.reference {
            self.reference_kf = Some(kf_id);
            self.reference_tracked = n_points;
        }
        result.metrics.n_matches = tracked.n_matches;
        result.metrics.n_inliers = tracked.n_inliers;
        result.metrics.n_weak = tracked.n_weak;
        result.metrics.n_local_points = tracked.n_local_points;

        let inputs = KeyFrameInputs {
            frames_since_keyframe: self.frames_since_keyframe,
            tracked: tracked.n_inliers,
            reference_tracked: self.reference_tracked,
            weak_tracked: tracked.n_weak,
            queue_depth: self.kf_sender.len(),
        };
        debug!(
            "[Tracking] Frame {}: {} inliers ({} weak), queue {}",
            frame.id, tracked.n_inliers, tracked.n_weak, inputs.queue_depth
        );
        if self.policy.evaluate(&inputs) {
            result.new_keyframe = self.send_keyframe(frame, tracked.n_inliers);
        }
    }

    /// Motion-prior matching plus local map tracking. Leaves the refined pose
    /// and inlier associations on `frame`.
    fn track_frame(&self, frame: &mut Frame) -> Option<FrameTracking> {
        let min_matches = self.config.min_projection_matches;
        let mut cache = PointCache::default();
        let last_points: Vec<MapPointId> = self
            .last_frame
            .as_ref()
            .map(|last| last.tracked_map_points().map(|(_, id)| id).collect())
            .unwrap_or_default();
        self.shared.read_map(|map| cache.capture(map, last_points.iter().copied()));

        let mut matches = self.match_last_frame(&cache, &last_points, frame);
        if matches.len() < min_matches {
            debug!(
                "[Tracking] {} matches from the motion prior, searching reference keyframe",
                matches.len()
            );
            matches = self.match_reference_keyframe(&mut cache, frame);
        }
        if matches.len() < min_matches {
            return None;
        }

        let (pose_cw, inliers) = self.refine(&cache, frame, &frame.pose_cw(), &matches);
        if inliers.len() < self.config.min_motion_inliers {
            return None;
        }
        apply_matches(frame, &pose_cw, &inliers);

        // Track local map.
        let local = self.shared.read_map(|map| {
            let local = build_local_map(map, frame, self.local_params.neighbors);
            cache.capture(map, local.points.iter().copied());
            local
        });
        let candidates = project_candidates(
            &cache,
            frame,
            &pose_cw,
            &local.points,
            &self.camera,
            &self.pyramid,
            &self.local_params,
        );
        let extra = self
            .collab
            .matcher
            .search_by_projection(frame, &candidates, self.local_params.radius, &self.pyramid);

        let mut all: Vec<(usize, MapPointId)> = frame.tracked_map_points().collect();
        all.extend(extra);
        let (pose_cw, inliers) = self.refine(&cache, frame, &pose_cw, &all);
        apply_matches(frame, &pose_cw, &inliers);

        let n_weak = inliers
            .iter()
            .filter(|(_, mp_id)| {
                cache
                    .get(*mp_id)
                    .map_or(true, |mp| mp.num_observations < self.config.min_mature_observations)
            })
            .count();

        Some(FrameTracking {
            n_matches: all.len(),
            n_inliers: inliers.len(),
            n_weak,
            n_local_points: candidates.len(),
            reference: local.reference,
        })
    }

    fn refine(
        &self,
        cache: &PointCache,
        frame: &Frame,
        initial_cw: &SE3,
        matches: &[(usize, MapPointId)],
    ) -> (SE3, Vec<(usize, MapPointId)>) {
        refine_matches(
            cache,
            &self.pyramid,
            frame,
            &self.camera,
            self.collab.optimizer.as_ref(),
            initial_cw,
            matches,
        )
    }

    fn match_last_frame(&self, cache: &PointCache, points: &[MapPointId], frame: &Frame) -> Vec<(usize, MapPointId)> {
        if points.is_empty() {
            return Vec::new();
        }
        let params = LocalMapParams {
            min_view_cos: -1.0,
            ..self.local_params.clone()
        };
        let candidates = project_candidates(
            cache,
            frame,
            &frame.pose_cw(),
            points,
            &self.camera,
            &self.pyramid,
            &params,
        );

        let radius = self.config.search_radius_px;
        let matcher = self.collab.matcher.as_ref();
        let matches = matcher.search_by_projection(frame, &candidates, radius, &self.pyramid);
        if matches.len() >= self.config.min_projection_matches {
            return matches;
        }
        debug!("[Tracking] {} matches from last frame, widening search", matches.len());
        matcher.search_by_projection(frame, &candidates, 2.0 * radius, &self.pyramid)
    }

    fn match_reference_keyframe(&self, cache: &mut PointCache, frame: &Frame) -> Vec<(usize, MapPointId)> {
        let Some(reference) = self.reference_kf else {
            return Vec::new();
        };
        let points: Vec<MapPointId> = self.shared.read_map(|map| {
            let points: Vec<MapPointId> = map
                .get_keyframe(reference)
                .map(|kf| kf.map_point_indices().map(|(_, id)| id).collect())
                .unwrap_or_default();
            cache.capture(map, points.iter().copied());
            points
        });
        let candidates: Vec<(MapPointId, Descriptor)> = cache.descriptors(&points);
        self.collab.matcher.search_by_descriptors(frame, &candidates)
    }

    /// Queue a keyframe built from `frame`. Never blocks; a full queue drops it.
    fn send_keyframe(&mut self, frame: &Frame, tracked: usize) -> Option<KeyFrameId> {
        let mut kf_frame = frame.clone();
        kf_frame.bow = Some(self.collab.vocabulary.summarize(&kf_frame.descriptors()));
        kf_frame.promote_to_keyframe();
        let keyframe = match KeyFrame::from_frame(kf_frame) {
            Ok(kf) => kf,
            Err(e) => {
                warn!("[Tracking] Could not build keyframe from {}: {}", frame.id, e);
                return None;
            }
        };

        let kf_id = keyframe.id;
        let msg = NewKeyFrameMsg {
            epoch: self.shared.epoch(),
            keyframe,
        };
        match self.kf_sender.try_send(msg) {
            Ok(()) => {
                self.shared.request_abort_ba();
                self.frames_since_keyframe = 0;
                self.reference_kf = Some(kf_id);
                self.reference_tracked = tracked;
                debug!("[Tracking] Queued {} with {} tracked points", kf_id, tracked);
                Some(kf_id)
            }
            Err(TrySendError::Full(_)) => {
                warn!("[Tracking] Keyframe queue full, dropping {}", kf_id);
                None
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("[Tracking] LocalMapping stopped, dropping {}", kf_id);
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // LOST
    // ─────────────────────────────────────────────────────────────────────

    fn step_relocalize(&mut self, frame: &mut Frame, result: &mut TrackingResult) {
        frame.bow = Some(self.collab.vocabulary.summarize(&frame.descriptors()));
        let query = self
            .shared
            .read_map(|map| RelocQuery::collect(map, frame, &self.reloc_params));
        let reloc = query.and_then(|query| {
            relocalize(
                &query,
                frame,
                &self.camera,
                self.collab.matcher.as_ref(),
                self.collab.optimizer.as_ref(),
                &self.pyramid,
                &self.reloc_params,
            )
        });

        let reloc = match reloc {
            Some(r) => r,
            None => {
                warn!("[Reloc] No candidate verified for frame {}, resetting session", frame.id);
                self.reset();
                result.event = Some(TrackingEvent::Reset);
                return;
            }
        };

        apply_matches(frame, &reloc.pose.inverse(), &reloc.matches);
        self.motion.reset();
        self.motion.update(&frame.pose);
        self.state = TrackingState::Good;
        self.reference_kf = Some(reloc.keyframe);
        result.event = Some(TrackingEvent::Relocalized(reloc.keyframe));
        result.metrics.n_matches = reloc.matches.len();
        result.metrics.n_inliers = reloc.matches.len();
        info!(
            "[Reloc] Frame {} relocalized against {} ({} inliers)",
            frame.id,
            reloc.keyframe,
            reloc.matches.len()
        );
        info!("[Tracking] {} -> {}", TrackingState::Lost, self.state);

        result.new_keyframe = self.send_keyframe(frame, reloc.matches.len());
    }

    // ─────────────────────────────────────────────────────────────────────

    fn publish(&self, frame: &Frame, result: &TrackingResult) {
        let viewer = match &self.viewer {
            Some(v) => v,
            None => return,
        };
        let tracked_points = if result.state.is_good() {
            self.shared.read_map(|map| {
                frame
                    .tracked_map_points()
                    .filter_map(|(_, id)| map.get_map_point(id).map(|mp| mp.position))
                    .collect()
            })
        } else {
            Vec::new()
        };
        let _ = viewer.try_send(ViewerEvent::Frame(FrameUpdate {
            epoch: self.shared.epoch(),
            frame_id: frame.id,
            timestamp: frame.timestamp,
            state: result.state,
            pose: result.pose,
            tracked_points,
        }));
    }
}

/// Set pose (from T_cw) and replace the frame's associations with `matches`.
fn apply_matches(frame: &mut Frame, pose_cw: &SE3, matches: &[(usize, MapPointId)]) {
    frame.pose = pose_cw.inverse();
    frame.clear_map_points();
    for (idx, mp_id) in matches {
        frame.set_map_point(*idx, *mp_id);
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("state", &self.state)
            .field("reference_kf", &self.reference_kf)
            .field("frames_since_keyframe", &self.frames_since_keyframe)
            .field("last_frame", &self.last_frame.as_ref().map(|f| f.id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crossbeam_channel::bounded;

    use nalgebra::Vector3;

    use crate::map::{FrameId, MapSnapshot};
    use crate::matcher::OrbMatcher;
    use crate::optimizer::LmOptimizer;
    use crate::test_support::{create_test_pose, SyntheticScene};
    use crate::tracking::initializer::Initializer;
    use crate::viewer::{Viewer, ViewerSink};
    use crate::vocabulary::OrbVocabulary;

    fn create_test_config() -> SlamConfig {
        SlamConfig {
            min_matches_init: 50,
            init_min_triangulated: 30,
            reloc_min_inliers: 20,
            ..SlamConfig::default()
        }
    }

    struct Harness {
        tracker: Tracker,
        queue: Receiver<NewKeyFrameMsg>,
        shared: Arc<SharedState>,
        scene: SyntheticScene,
    }

    fn create_test_tracker(config: SlamConfig, seed: u64) -> Harness {
        let scene = SyntheticScene::new(300, seed);
        let config = Arc::new(config);
        let shared = SharedState::from_config(&config);
        let vocabulary = Arc::new(OrbVocabulary::from_words(scene.descriptors.clone()));
        let collab = Collaborators::with_vocabulary(vocabulary, LmOptimizer::from_config(&config));
        let (tx, rx) = bounded(config.max_queue_depth + 1);
        let tracker = Tracker::new(config, scene.camera, shared.clone(), collab, tx, rx.clone());
        Harness {
            tracker,
            queue: rx,
            shared,
            scene,
        }
    }

    fn bootstrap(h: &mut Harness) {
        let (f0, _) = h.scene.frame(0, &SE3::identity());
        let (f1, _) = h.scene.frame(1, &create_test_pose(0.4, 0.0, 0.0));
        h.tracker.track(f0);
        let result = h.tracker.track(f1);
        assert_eq!(result.event, Some(TrackingEvent::Initialized));
    }

    fn blank_frame(id: u64) -> Frame {
        Frame::from_features(FrameId::new(id), None, Vec::new())
    }

    #[test]
    fn test_bootstrap_seeds_two_keyframes() {
        let mut h = create_test_tracker(create_test_config(), 41);

        // Same frames through a standalone initializer give the expected count.
        let (f0, _) = h.scene.frame(0, &SE3::identity());
        let (f1, _) = h.scene.frame(1, &create_test_pose(0.4, 0.0, 0.0));
        let mut init = Initializer::new(&create_test_config());
        init.add_frame(&f0, &h.scene.camera, &OrbMatcher::new());
        let expected = match init.add_frame(&f1, &h.scene.camera, &OrbMatcher::new()) {
            InitOutcome::Ready(b) => b.points.len(),
            other => panic!("expected success, got {:?}", other),
        };

        let first = h.tracker.track(f0);
        assert_eq!(first.state, TrackingState::Uninitialized);
        let second = h.tracker.track(f1);
        assert_eq!(second.state, TrackingState::Good);
        assert_eq!(second.metrics.n_inliers, expected);

        h.shared.read_map(|map| {
            assert_eq!(map.num_keyframes(), 2);
            assert_eq!(map.num_map_points(), expected);
            assert!(map.integrity_violations().is_empty());
            assert_eq!(map.covisibility().num_edges(), 1);
        });
        // Bootstrap keyframes go straight into the map.
        assert!(h.queue.is_empty());
    }

    #[test]
    fn test_tracks_constant_motion() {
        let mut h = create_test_tracker(create_test_config(), 42);
        bootstrap(&mut h);
        let scale = h.tracker.last_pose().unwrap().translation.x / 0.4;

        for k in 1..=6 {
            let x = 0.4 + 0.1 * k as f64;
            let (frame, _) = h.scene.frame(1 + k, &create_test_pose(x, 0.0, 0.0));
            let result = h.tracker.track(frame);
            assert_eq!(result.state, TrackingState::Good, "frame {}", k);
            let pose = result.pose.unwrap();
            assert_relative_eq!(pose.translation.x, x * scale, epsilon = 1e-3 * scale);
            assert!(pose.translation.yz().norm() < 1e-3 * scale);
            assert!(result.metrics.n_inliers >= 15);
        }
    }

    #[test]
    fn test_lost_then_reset_clears_map() {
        let mut h = create_test_tracker(create_test_config(), 43);
        bootstrap(&mut h);
        let mut states = vec![h.tracker.state()];

        let lost = h.tracker.track(blank_frame(10));
        states.push(lost.state);
        assert_eq!(lost.event, Some(TrackingEvent::Lost));

        let reset = h.tracker.track(blank_frame(11));
        states.push(reset.state);
        assert_eq!(reset.event, Some(TrackingEvent::Reset));

        assert_eq!(
            states,
            vec![TrackingState::Good, TrackingState::Lost, TrackingState::Uninitialized]
        );
        assert!(h.shared.read_map(|map| map.is_empty()));
        assert_eq!(h.shared.epoch(), 1);
        assert!(h.queue.is_empty());
        assert!(h.tracker.last_pose().is_none());
    }

    #[test]
    fn test_relocalizes_after_loss() {
        let mut h = create_test_tracker(create_test_config(), 44);
        bootstrap(&mut h);
        let scale = h.tracker.last_pose().unwrap().translation.x / 0.4;

        assert_eq!(h.tracker.track(blank_frame(10)).state, TrackingState::Lost);

        let (frame, _) = h.scene.frame(11, &create_test_pose(0.3, 0.0, 0.0));
        let result = h.tracker.track(frame);
        assert_eq!(result.state, TrackingState::Good);
        assert!(matches!(result.event, Some(TrackingEvent::Relocalized(_))));
        assert_relative_eq!(result.pose.unwrap().translation.x, 0.3 * scale, epsilon = 1e-3 * scale);

        // Relocalization forces a keyframe.
        assert!(result.new_keyframe.is_some());
        assert_eq!(h.queue.len(), 1);
    }

    #[test]
    fn test_saturated_queue_skips_keyframe() {
        let config = SlamConfig {
            min_keyframe_gap: 1,
            ..create_test_config()
        };
        let max_depth = config.max_queue_depth;
        let mut h = create_test_tracker(config, 45);
        bootstrap(&mut h);

        // Fill the queue up to its policy bound with unrelated keyframes.
        for i in 0..max_depth {
            let (mut f, _) = h.scene.frame(100 + i as u64, &SE3::identity());
            f.promote_to_keyframe();
            h.queue_sender().send(NewKeyFrameMsg {
                epoch: 0,
                keyframe: KeyFrame::from_frame(f).unwrap(),
            })
            .unwrap();
        }

        let (frame, _) = h.scene.frame(2, &create_test_pose(0.5, 0.0, 0.0));
        let result = h.tracker.track(frame);
        assert_eq!(result.state, TrackingState::Good);
        assert!(result.new_keyframe.is_none());
        assert_eq!(h.queue.len(), max_depth);

        // Once drained, the same conditions produce a keyframe.
        while h.queue.try_recv().is_ok() {}
        let (frame, _) = h.scene.frame(3, &create_test_pose(0.6, 0.0, 0.0));
        let result = h.tracker.track(frame);
        assert!(result.new_keyframe.is_some());
    }

    #[derive(Clone, Default)]
    struct ClearCounter(Arc<parking_lot::Mutex<usize>>);

    impl ViewerSink for ClearCounter {
        fn draw_frame(&mut self, _update: &FrameUpdate, _pose: &SE3, _trajectory: &[Vector3<f64>]) {}

        fn draw_map(&mut self, _snapshot: &MapSnapshot, _current_kf: Option<KeyFrameId>) {}

        fn clear(&mut self) {
            *self.0.lock() += 1;
        }
    }

    #[test]
    fn test_reset_reaches_viewer_with_full_channel() {
        let mut h = create_test_tracker(create_test_config(), 46);
        let (viewer_tx, viewer_rx) = bounded(4);
        h.tracker.viewer = Some(viewer_tx);
        let counter = ClearCounter::default();
        let mut viewer = Viewer::new(Box::new(counter.clone())).with_session(h.shared.clone());

        bootstrap(&mut h);
        for k in 1..=2 {
            let (frame, _) = h.scene.frame(1 + k, &create_test_pose(0.4 + 0.1 * k as f64, 0.0, 0.0));
            assert_eq!(h.tracker.track(frame).state, TrackingState::Good);
        }
        assert!(viewer_rx.is_full());

        // The reset event cannot be queued.
        h.tracker.reset();
        assert_eq!(viewer_rx.len(), 4);

        for event in viewer_rx.try_iter() {
            assert_eq!(event.epoch(), 0);
            viewer.handle(event);
        }
        assert_eq!(*counter.0.lock(), 1);
        assert!(viewer.trajectory().is_empty());
        assert_eq!(viewer.epoch(), 1);

        // Frames of the new session are drawn again.
        let (f0, _) = h.scene.frame(20, &SE3::identity());
        let (f1, _) = h.scene.frame(21, &create_test_pose(0.4, 0.0, 0.0));
        h.tracker.track(f0);
        h.tracker.track(f1);
        for event in viewer_rx.try_iter() {
            viewer.handle(event);
        }
        assert_eq!(viewer.trajectory().len(), 1);
        assert_eq!(*counter.0.lock(), 1);
    }

    impl Harness {
        fn queue_sender(&self) -> Sender<NewKeyFrameMsg> {
            self.tracker.kf_sender.clone()
        }
    }
}
