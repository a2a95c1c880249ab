//! Read-only viewer thread.
//!
//! Tracking and LocalMapping push [`ViewerEvent`]s into a channel; the
//! viewer folds them into a trajectory and the latest map copy and hands
//! both to a [`ViewerSink`]. It never touches the live map.
//!
//! Frames are only drawn while tracking is `GOOD`. A new session epoch
//! clears everything drawn so far and events from older sessions are
//! ignored. With [`Viewer::with_session`] the epoch is also read from the
//! shared state, so a reset is honored even when its event was dropped by
//! a full channel.

mod log_sink;
#[cfg(feature = "rerun")]
mod rerun_sink;

pub use log_sink::LogSink;
#[cfg(feature = "rerun")]
pub use rerun_sink::RerunSink;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use nalgebra::Vector3;
use tracing::{debug, info};

use crate::geometry::SE3;
use crate::io::GroundTruth;
use crate::map::{KeyFrameId, MapSnapshot};
use crate::system::messages::{FrameUpdate, ViewerEvent};
use crate::system::shared_state::SharedState;

/// Where the viewer draws.
pub trait ViewerSink: Send {
    /// Current camera (camera to world), its tracked points and the trajectory so far.
    fn draw_frame(&mut self, update: &FrameUpdate, pose: &SE3, trajectory: &[Vector3<f64>]);

    /// Whole map. Points referenced to `current_kf` are the freshly created ones.
    fn draw_map(&mut self, snapshot: &MapSnapshot, current_kf: Option<KeyFrameId>);

    /// Ground-truth positions up to the current frame.
    fn draw_groundtruth(&mut self, _positions: &[Vector3<f64>]) {}

    fn clear(&mut self);
}

/// Event folding, separate from the thread so it can be driven directly.
pub struct Viewer {
    sink: Box<dyn ViewerSink>,
    groundtruth: Option<GroundTruth>,
    session: Option<Arc<SharedState>>,
    /// Session currently drawn.
    epoch: u64,
    trajectory: Vec<Vector3<f64>>,
    frames_drawn: usize,
    maps_drawn: usize,
}

impl Viewer {
    pub fn new(sink: Box<dyn ViewerSink>) -> Self {
        Self {
            sink,
            groundtruth: None,
            session: None,
            epoch: 0,
            trajectory: Vec::new(),
            frames_drawn: 0,
            maps_drawn: 0,
        }
    }

    pub fn with_groundtruth(mut self, groundtruth: GroundTruth) -> Self {
        self.groundtruth = Some(groundtruth);
        self
    }

    /// Follow the session epoch of `shared` in addition to the event stamps.
    pub fn with_session(mut self, shared: Arc<SharedState>) -> Self {
        self.epoch = shared.epoch();
        self.session = Some(shared);
        self
    }

    pub fn trajectory(&self) -> &[Vector3<f64>] {
        &self.trajectory
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn handle(&mut self, event: ViewerEvent) {
        if let Some(current) = self.session.as_ref().map(|s| s.epoch()) {
            self.enter_epoch(current);
        }
        if event.epoch() < self.epoch {
            debug!("[Viewer] Ignoring event from session {}", event.epoch());
            return;
        }
        self.enter_epoch(event.epoch());

        match event {
            ViewerEvent::Frame(update) => {
                let pose = match (update.state.is_good(), update.pose) {
                    (true, Some(pose)) => pose,
                    _ => return,
                };
                self.trajectory.push(pose.translation);
                self.sink.draw_frame(&update, &pose, &self.trajectory);
                if let (Some(gt), Some(t)) = (&self.groundtruth, update.timestamp) {
                    let positions = gt.positions_until((t * 1e9) as u64);
                    self.sink.draw_groundtruth(&positions);
                }
                self.frames_drawn += 1;
            }
            ViewerEvent::Map {
                snapshot, current_kf, ..
            } => {
                self.sink.draw_map(&snapshot, current_kf);
                self.maps_drawn += 1;
            }
            ViewerEvent::Reset { .. } => {}
        }
    }

    fn enter_epoch(&mut self, epoch: u64) {
        if epoch <= self.epoch {
            return;
        }
        debug!(
            "[Viewer] Session {} -> {}, dropping {} trajectory poses",
            self.epoch,
            epoch,
            self.trajectory.len()
        );
        self.epoch = epoch;
        self.trajectory.clear();
        self.sink.clear();
    }

    /// Consume events until every sender is dropped.
    pub fn run(mut self, events: Receiver<ViewerEvent>) {
        info!("[Viewer] Started");
        for event in events.iter() {
            self.handle(event);
        }
        info!(
            "[Viewer] Stopped after {} frames and {} map updates",
            self.frames_drawn, self.maps_drawn
        );
    }

    pub fn spawn(self, events: Receiver<ViewerEvent>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("viewer".to_string())
            .spawn(move || self.run(events))
    }
}

impl std::fmt::Debug for Viewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Viewer")
            .field("epoch", &self.epoch)
            .field("trajectory", &self.trajectory.len())
            .field("frames_drawn", &self.frames_drawn)
            .field("maps_drawn", &self.maps_drawn)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crossbeam_channel::unbounded;
    use parking_lot::Mutex;

    use crate::map::FrameId;
    use crate::test_support::create_test_pose;
    use crate::tracking::TrackingState;

    #[derive(Debug, Default)]
    struct Recorded {
        frames: Vec<usize>,
        maps: usize,
        clears: usize,
    }

    struct RecordingSink(Arc<Mutex<Recorded>>);

    impl ViewerSink for RecordingSink {
        fn draw_frame(&mut self, _update: &FrameUpdate, _pose: &SE3, trajectory: &[Vector3<f64>]) {
            self.0.lock().frames.push(trajectory.len());
        }

        fn draw_map(&mut self, _snapshot: &MapSnapshot, _current_kf: Option<KeyFrameId>) {
            self.0.lock().maps += 1;
        }

        fn clear(&mut self) {
            self.0.lock().clears += 1;
        }
    }

    fn create_test_update(id: u64, state: TrackingState, epoch: u64) -> ViewerEvent {
        ViewerEvent::Frame(FrameUpdate {
            epoch,
            frame_id: FrameId::new(id),
            timestamp: Some(id as f64),
            state,
            pose: state.is_good().then(|| create_test_pose(id as f64, 0.0, 0.0)),
            tracked_points: Vec::new(),
        })
    }

    #[test]
    fn test_draws_only_good_frames_and_clears_on_reset() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let mut viewer = Viewer::new(Box::new(RecordingSink(recorded.clone())));

        viewer.handle(create_test_update(0, TrackingState::Uninitialized, 0));
        viewer.handle(create_test_update(1, TrackingState::Good, 0));
        viewer.handle(create_test_update(2, TrackingState::Good, 0));
        viewer.handle(create_test_update(3, TrackingState::Lost, 0));
        assert_eq!(viewer.trajectory().len(), 2);

        viewer.handle(ViewerEvent::Reset { epoch: 1 });
        assert!(viewer.trajectory().is_empty());
        viewer.handle(create_test_update(4, TrackingState::Good, 1));

        let recorded = recorded.lock();
        assert_eq!(recorded.frames, vec![1, 2, 1]);
        assert_eq!(recorded.clears, 1);
    }

    #[test]
    fn test_newer_epoch_clears_without_reset_event() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let mut viewer = Viewer::new(Box::new(RecordingSink(recorded.clone())));

        viewer.handle(create_test_update(0, TrackingState::Good, 0));
        viewer.handle(create_test_update(1, TrackingState::Good, 0));
        // Reset event lost; the first frame of session 1 still clears.
        viewer.handle(create_test_update(2, TrackingState::Good, 1));
        assert_eq!(viewer.trajectory().len(), 1);
        assert_eq!(viewer.epoch(), 1);

        // Late frame from session 0 is ignored.
        viewer.handle(create_test_update(1, TrackingState::Good, 0));
        assert_eq!(viewer.trajectory().len(), 1);
        assert_eq!(recorded.lock().clears, 1);
    }

    #[test]
    fn test_session_epoch_discards_queued_stale_events() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let shared = SharedState::from_config(&crate::config::SlamConfig::default());
        let mut viewer = Viewer::new(Box::new(RecordingSink(recorded.clone()))).with_session(shared.clone());

        viewer.handle(create_test_update(0, TrackingState::Good, 0));
        assert_eq!(viewer.trajectory().len(), 1);

        shared.reset_map();
        viewer.handle(create_test_update(1, TrackingState::Good, 0));
        viewer.handle(ViewerEvent::Map {
            epoch: 0,
            snapshot: MapSnapshot::default(),
            current_kf: None,
        });

        assert!(viewer.trajectory().is_empty());
        let recorded = recorded.lock();
        assert_eq!(recorded.clears, 1);
        assert_eq!(recorded.maps, 0);
    }

    #[test]
    fn test_thread_exits_when_senders_drop() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let (tx, rx) = unbounded();
        let handle = Viewer::new(Box::new(RecordingSink(recorded.clone()))).spawn(rx).unwrap();

        tx.send(ViewerEvent::Map {
            epoch: 0,
            snapshot: MapSnapshot::default(),
            current_kf: None,
        })
        .unwrap();
        drop(tx);
        handle.join().unwrap();
        assert_eq!(recorded.lock().maps, 1);
    }
}
