//! Text-only sink: periodic summaries through `tracing`.

use nalgebra::Vector3;
use tracing::info;

use crate::geometry::SE3;
use crate::map::{KeyFrameId, MapSnapshot};
use crate::system::messages::FrameUpdate;

use super::ViewerSink;

#[derive(Debug)]
pub struct LogSink {
    /// Log one line every `every` frames.
    every: usize,
    frames: usize,
    keyframes: usize,
    points: usize,
}

impl LogSink {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            frames: 0,
            keyframes: 0,
            points: 0,
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ViewerSink for LogSink {
    fn draw_frame(&mut self, update: &FrameUpdate, pose: &SE3, trajectory: &[Vector3<f64>]) {
        self.frames += 1;
        if self.frames % self.every != 0 {
            return;
        }
        let travelled: f64 = trajectory.windows(2).map(|w| (w[1] - w[0]).norm()).sum();
        let t = pose.translation;
        info!(
            "[Viewer] {} at [{:.2}, {:.2}, {:.2}], {} tracked, path {:.2}, map {} KFs / {} points",
            update.frame_id,
            t.x,
            t.y,
            t.z,
            update.tracked_points.len(),
            travelled,
            self.keyframes,
            self.points
        );
    }

    fn draw_map(&mut self, snapshot: &MapSnapshot, _current_kf: Option<KeyFrameId>) {
        self.keyframes = snapshot.keyframes.len();
        self.points = snapshot.points.len();
    }

    fn clear(&mut self) {
        self.frames = 0;
        self.keyframes = 0;
        self.points = 0;
    }
}
