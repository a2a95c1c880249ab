//! The LocalMapping worker.
//!
//! Keyframes arrive from Tracking over a bounded channel and are handled one
//! per cycle, in arrival order:
//! 1. integrate the keyframe into the map and refresh its connections
//! 2. cull recently created points that failed to gather observations
//! 3. triangulate new points against the best covisible neighbors
//! 4. local bundle adjustment, only when no other keyframe is waiting
//! 5. cull redundant neighbor keyframes
//!
//! Every map write runs under [`SharedState::write_map_in_epoch`], so a
//! reset issued by Tracking in the middle of a cycle discards the rest of it.
//! Local BA is split into collect (read lock), solve (no lock) and apply
//! (write lock) so Tracking keeps running while the solver works.

use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::camera::Camera;
use crate::config::SlamConfig;
use crate::error::SlamError;
use crate::map::{KeyFrame, KeyFrameId, MapPointId};
use crate::optimizer::{apply_local_ba, collect_local_ba, LocalBAConfig};
use crate::system::collaborators::Collaborators;
use crate::system::messages::{NewKeyFrameMsg, ViewerEvent};
use crate::system::shared_state::SharedState;

use super::culling::{cull_keyframes, cull_recent_points, CullingConfig};
use super::triangulation::{triangulate_new_points, TriangulationConfig};

/// Local BA needs more than this many keyframes in the map.
const MIN_KEYFRAMES_FOR_BA: usize = 2;

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingReport {
    pub keyframe: Option<KeyFrameId>,
    pub linked_points: usize,
    pub new_points: usize,
    pub culled_points: usize,
    pub ba_ran: bool,
    pub culled_keyframes: Vec<KeyFrameId>,
}

pub struct LocalMapper {
    camera: Camera,
    shared: Arc<SharedState>,
    collab: Collaborators,
    viewer: Option<Sender<ViewerEvent>>,

    triangulation: TriangulationConfig,
    culling: CullingConfig,
    local_ba: LocalBAConfig,

    /// Points created by this worker still within their grace period.
    recent_points: Vec<MapPointId>,
    /// Session the recent list belongs to.
    epoch: u64,
}

impl LocalMapper {
    pub fn new(config: &SlamConfig, camera: Camera, shared: Arc<SharedState>, collab: Collaborators) -> Self {
        let epoch = shared.epoch();
        Self {
            camera,
            shared,
            collab,
            viewer: None,
            triangulation: TriangulationConfig::from_config(config),
            culling: CullingConfig::from_config(config),
            local_ba: LocalBAConfig::from_config(config),
            recent_points: Vec::new(),
            epoch,
        }
    }

    pub fn with_viewer(mut self, viewer: Sender<ViewerEvent>) -> Self {
        self.viewer = Some(viewer);
        self
    }

    pub fn num_recent_points(&self) -> usize {
        self.recent_points.len()
    }

    /// Worker loop. Returns when `stop` fires or is dropped, when every
    /// keyframe sender is gone, or when the running flag is cleared.
    pub fn run(&mut self, keyframes: Receiver<NewKeyFrameMsg>, stop: Receiver<()>) {
        self.shared.set_mapping_running(true);
        info!("[LocalMapping] Worker started");

        loop {
            select! {
                recv(stop) -> _ => break,
                recv(keyframes) -> msg => match msg {
                    Ok(msg) => {
                        let queue_empty = keyframes.is_empty();
                        self.process_keyframe(msg, queue_empty);
                    }
                    Err(_) => break,
                },
            }
            if !self.shared.is_mapping_running() {
                debug!("[LocalMapping] Running flag cleared");
                break;
            }
        }

        self.shared.set_mapping_running(false);
        info!("[LocalMapping] Worker stopped");
    }

    /// Run one full cycle on `msg`. `queue_empty` gates local BA.
    pub fn process_keyframe(&mut self, msg: NewKeyFrameMsg, queue_empty: bool) -> MappingReport {
        let mut report = MappingReport::default();
        let epoch = msg.epoch;
        if epoch != self.shared.epoch() {
            debug!("[LocalMapping] Dropping {} from stale session {}", msg.keyframe.id, epoch);
            return report;
        }
        if epoch != self.epoch {
            self.recent_points.clear();
            self.epoch = epoch;
        }
        self.shared.clear_abort_ba();

        let kf_id = msg.keyframe.id;
        match self.integrate(msg.keyframe, epoch) {
            Some(linked) => {
                report.keyframe = Some(kf_id);
                report.linked_points = linked;
            }
            None => return report,
        }

        let culling = &self.culling;
        let recent = &mut self.recent_points;
        report.culled_points = self
            .shared
            .write_map_in_epoch(epoch, |map| cull_recent_points(map, recent, culling))
            .unwrap_or(0);

        let (camera, matcher, tri_config) = (&self.camera, &self.collab.matcher, &self.triangulation);
        if let Some(result) = self
            .shared
            .write_map_in_epoch(epoch, |map| triangulate_new_points(map, kf_id, camera, matcher.as_ref(), tri_config))
        {
            report.new_points = result.num_new_points();
            self.recent_points.extend(result.created);
        }

        let num_keyframes = self.shared.read_map(|map| map.num_keyframes());
        if queue_empty && num_keyframes > MIN_KEYFRAMES_FOR_BA {
            report.ba_ran = self.local_bundle_adjustment(kf_id, epoch);
        }

        let culling = &self.culling;
        report.culled_keyframes = self
            .shared
            .write_map_in_epoch(epoch, |map| cull_keyframes(map, kf_id, culling))
            .unwrap_or_default();

        debug!(
            "[LocalMapping] {}: linked={} new={} culled_points={} ba={} culled_kfs={}",
            kf_id,
            report.linked_points,
            report.new_points,
            report.culled_points,
            report.ba_ran,
            report.culled_keyframes.len()
        );
        self.publish(kf_id);
        report
    }

    /// Insert the keyframe, link the associations it carries and refresh the
    /// geometry of those points. `None` if the session changed or the
    /// keyframe was rejected.
    fn integrate(&self, keyframe: KeyFrame, epoch: u64) -> Option<usize> {
        let kf_id = keyframe.id;
        let outcome = self.shared.write_map_in_epoch(epoch, |map| {
            let linked = map.insert_keyframe(keyframe)?;
            map.update_connections(kf_id);
            let points: Vec<MapPointId> = map
                .get_keyframe(kf_id)
                .map(|kf| kf.map_point_indices().map(|(_, mp)| mp).collect())
                .unwrap_or_default();
            for mp_id in points {
                map.update_map_point_geometry(mp_id);
            }
            Ok::<_, SlamError>(linked)
        })?;

        match outcome {
            Ok(linked) => Some(linked),
            Err(e) => {
                warn!("[LocalMapping] Could not insert {}: {}", kf_id, e);
                None
            }
        }
    }

    /// Three-phase local BA. Returns whether a result was applied.
    fn local_bundle_adjustment(&self, kf_id: KeyFrameId, epoch: u64) -> bool {
        let problem = match self.shared.read_map(|map| collect_local_ba(map, kf_id, &self.local_ba)) {
            Some(p) => p,
            None => return false,
        };

        let shared = &self.shared;
        let should_stop = || shared.should_abort_ba();
        let result = match self.collab.optimizer.local_refine(&problem, &self.camera, &should_stop) {
            Some(r) => r,
            None => {
                debug!("[LocalBA] {} skipped or aborted", kf_id);
                return false;
            }
        };

        match self.shared.write_map_in_epoch(epoch, |map| apply_local_ba(map, &result)) {
            Some(removed) => {
                debug!(
                    "[LocalBA] {} iters={} cost {:.3} -> {:.3}, {} outliers unlinked",
                    kf_id, result.iterations, result.initial_cost, result.final_cost, removed
                );
                true
            }
            None => false,
        }
    }

    fn publish(&self, kf_id: KeyFrameId) {
        if let Some(viewer) = &self.viewer {
            let snapshot = self.shared.snapshot();
            let _ = viewer.try_send(ViewerEvent::Map {
                epoch: self.epoch,
                snapshot,
                current_kf: Some(kf_id),
            });
        }
    }
}

impl std::fmt::Debug for LocalMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMapper")
            .field("epoch", &self.epoch)
            .field("recent_points", &self.recent_points.len())
            .finish_non_exhaustive()
    }
}
