//! SLAM system: top-level entry point and thread orchestration.
//!
//! `SlamSystem` owns the shared map and the tracker, which runs on the
//! caller's thread. LocalMapping and the optional viewer each get a
//! dedicated thread. Keyframes travel over a bounded channel; a separate
//! stop channel wakes the mapping worker on shutdown.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use tracing::{info, warn};

use crate::camera::Camera;
use crate::config::SlamConfig;
use crate::error::{Result, SlamError};
use crate::frame::{FeatureExtractor, Frame};
use crate::io::{ImageSource, TimedImage, TrajectoryEntry};
use crate::local_mapping::LocalMapper;
use crate::map::{FrameId, MapSnapshot};
use crate::tracking::{Tracker, TrackingEvent, TrackingResult, TrackingState};
use crate::viewer::Viewer;

use super::collaborators::Collaborators;
use super::messages::ViewerEvent;
use super::shared_state::SharedState;

/// Capacity of the viewer event channel. Events are dropped when it is full.
const VIEWER_CHANNEL_CAPACITY: usize = 64;

/// Counters for one [`SlamSystem::run`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: usize,
    pub tracked: usize,
    pub keyframes: usize,
    pub lost: usize,
    pub resets: usize,
}

/// Main SLAM system orchestrating Tracking, LocalMapping and the viewer.
pub struct SlamSystem {
    config: Arc<SlamConfig>,
    camera: Camera,
    shared: Arc<SharedState>,

    /// Runs on the caller's thread.
    tracker: Tracker,
    extractor: Option<Box<dyn FeatureExtractor>>,
    next_frame_id: u64,

    /// Camera to world pose of every frame tracked in the current session.
    trajectory: Vec<TrajectoryEntry>,

    /// Dropping it stops LocalMapping.
    stop_tx: Option<Sender<()>>,
    mapping_handle: Option<JoinHandle<()>>,
    viewer_handle: Option<JoinHandle<()>>,
}

impl SlamSystem {
    /// Build the system without a viewer and spawn LocalMapping.
    pub fn new(config: SlamConfig, collab: Collaborators) -> Result<Self> {
        Self::with_viewer(config, collab, None)
    }

    /// Build the system, spawning LocalMapping and, when given, the viewer thread.
    pub fn with_viewer(config: SlamConfig, collab: Collaborators, viewer: Option<Viewer>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let camera = Camera::from_config(&config.camera);
        let shared = SharedState::from_config(&config);

        // One slot above the policy bound so a forced relocalization keyframe always fits.
        let (kf_tx, kf_rx) = bounded(config.max_queue_depth + 1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let (viewer_tx, viewer_handle) = match viewer {
            Some(viewer) => {
                let (tx, rx) = bounded::<ViewerEvent>(VIEWER_CHANNEL_CAPACITY);
                (Some(tx), Some(viewer.with_session(shared.clone()).spawn(rx)?))
            }
            None => (None, None),
        };

        let mut mapper = LocalMapper::new(&config, camera, shared.clone(), collab.clone());
        if let Some(tx) = &viewer_tx {
            mapper = mapper.with_viewer(tx.clone());
        }
        let mapping_rx = kf_rx.clone();
        let mapping_handle = thread::Builder::new()
            .name("local-mapping".to_string())
            .spawn(move || mapper.run(mapping_rx, stop_rx))?;

        let mut tracker = Tracker::new(config.clone(), camera, shared.clone(), collab, kf_tx, kf_rx);
        if let Some(tx) = viewer_tx {
            tracker = tracker.with_viewer(tx);
        }

        info!(
            "[System] Started (queue depth {}, viewer {})",
            config.max_queue_depth,
            if viewer_handle.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            config,
            camera,
            shared,
            tracker,
            extractor: None,
            next_frame_id: 0,
            trajectory: Vec::new(),
            stop_tx: Some(stop_tx),
            mapping_handle: Some(mapping_handle),
            viewer_handle,
        })
    }

    pub fn with_extractor(mut self, extractor: Box<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn state(&self) -> TrackingState {
        self.tracker.state()
    }

    /// Camera to world poses tracked since the last reset.
    pub fn trajectory(&self) -> &[TrajectoryEntry] {
        &self.trajectory
    }

    pub fn map_snapshot(&self) -> MapSnapshot {
        self.shared.snapshot()
    }

    /// Extract features from `image` and track the resulting frame.
    pub fn process_image(&mut self, image: &TimedImage) -> Result<TrackingResult> {
        let extractor = self
            .extractor
            .as_mut()
            .ok_or_else(|| SlamError::Extraction("no feature extractor configured".to_string()))?;
        let features = extractor.extract(&image.image)?;
        let frame = Frame::new(FrameId::new(self.next_frame_id), image.timestamp, features, &self.camera);
        self.process_frame(frame)
    }

    /// Track an already built frame. Ids must increase.
    pub fn process_frame(&mut self, frame: Frame) -> Result<TrackingResult> {
        if self.stop_tx.is_none() {
            return Err(SlamError::WorkerStopped);
        }
        self.next_frame_id = self.next_frame_id.max(frame.id.0 + 1);

        let result = self.tracker.track(frame);
        if result.event == Some(TrackingEvent::Reset) {
            self.trajectory.clear();
        }
        if let (TrackingState::Good, Some(pose)) = (result.state, result.pose) {
            let timestamp = result.timestamp.unwrap_or(result.frame_id.0 as f64);
            self.trajectory.push(TrajectoryEntry { timestamp, pose });
        }
        Ok(result)
    }

    /// Feed every image of `source` through [`Self::process_image`]. With
    /// `real_time`, frames are paced by their timestamps.
    pub fn run(&mut self, source: &mut dyn ImageSource, real_time: bool) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut last_timestamp: Option<f64> = None;
        if let Some(n) = source.len_hint() {
            info!("[System] Processing {} images", n);
        }

        while let Some(image) = source.next_image()? {
            let started = Instant::now();
            let timestamp = image.timestamp;
            let result = self.process_image(&image)?;

            summary.frames += 1;
            if result.state.is_good() {
                summary.tracked += 1;
            }
            if result.new_keyframe.is_some() {
                summary.keyframes += 1;
            }
            match result.event {
                Some(TrackingEvent::Lost) => summary.lost += 1,
                Some(TrackingEvent::Reset) => summary.resets += 1,
                _ => {}
            }

            if real_time {
                if let (Some(prev), Some(now)) = (last_timestamp, timestamp) {
                    let period = Duration::from_secs_f64((now - prev).max(0.0));
                    if let Some(wait) = period.checked_sub(started.elapsed()) {
                        thread::sleep(wait);
                    }
                }
            }
            last_timestamp = timestamp;
        }

        info!(
            "[System] Run finished: {} frames, {} tracked, {} keyframes, {} lost, {} resets",
            summary.frames, summary.tracked, summary.keyframes, summary.lost, summary.resets
        );
        Ok(summary)
    }

    /// Drop the map and start a new session.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.trajectory.clear();
    }

    /// Stop LocalMapping and the viewer and join both threads. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stop_tx.is_none() && self.mapping_handle.is_none() && self.viewer_handle.is_none() {
            return;
        }
        info!("[System] Shutting down");

        self.shared.set_mapping_running(false);
        self.shared.request_abort_ba();
        drop(self.stop_tx.take());
        if let Some(handle) = self.mapping_handle.take() {
            if handle.join().is_err() {
                warn!("[System] LocalMapping thread panicked");
            }
        }

        // The mapper's sender went with its thread; the tracker holds the last one.
        drop(self.tracker.detach_viewer());
        if let Some(handle) = self.viewer_handle.take() {
            if handle.join().is_err() {
                warn!("[System] Viewer thread panicked");
            }
        }
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SlamSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlamSystem")
            .field("state", &self.tracker.state())
            .field("next_frame_id", &self.next_frame_id)
            .field("trajectory", &self.trajectory.len())
            .field("running", &self.stop_tx.is_some())
            .finish_non_exhaustive()
    }
}
