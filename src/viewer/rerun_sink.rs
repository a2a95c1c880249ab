//! Rerun sink.
//!
//! Entity hierarchy:
//!     world/
//!         camera           - current camera transform
//!         tracked_points   - points matched in the current frame (white)
//!         trajectory       - estimated trajectory (gray)
//!         groundtruth      - ground truth trajectory (green)
//!         keyframes/       - one transform and box per keyframe (blue)
//!         map_points       - all map points (dim gray)
//!         current_points   - points created from the latest keyframe (red)

use nalgebra::Vector3;
use rerun::{external::glam, RecordingStream};
use tracing::warn;

use crate::error::{Result, SlamError};
use crate::geometry::SE3;
use crate::map::{KeyFrameId, MapSnapshot};
use crate::system::messages::FrameUpdate;

use super::ViewerSink;

pub struct RerunSink {
    rec: RecordingStream,
    /// Keyframe entities logged last time, to clear the culled ones.
    logged_keyframes: Vec<KeyFrameId>,
}

fn to_points(positions: impl IntoIterator<Item = Vector3<f64>>) -> Vec<[f32; 3]> {
    positions
        .into_iter()
        .map(|p| [p.x as f32, p.y as f32, p.z as f32])
        .collect()
}

fn to_transform(pose: &SE3) -> rerun::Transform3D {
    let t = pose.translation;
    let q = pose.rotation;
    rerun::Transform3D::from_translation_rotation(
        glam::Vec3::new(t.x as f32, t.y as f32, t.z as f32),
        glam::Quat::from_xyzw(q.coords.x as f32, q.coords.y as f32, q.coords.z as f32, q.w as f32),
    )
}

impl RerunSink {
    /// Spawn a Rerun viewer process and connect to it.
    pub fn spawn(app_name: &str) -> Result<Self> {
        let rec = rerun::RecordingStreamBuilder::new(app_name)
            .spawn()
            .map_err(|e| SlamError::Viewer(format!("cannot start rerun: {}", e)))?;
        // Camera convention: X right, Y down, Z forward.
        rec.log_static("world", &rerun::ViewCoordinates::RDF()).ok();
        Ok(Self {
            rec,
            logged_keyframes: Vec::new(),
        })
    }

    fn log<AS: ?Sized + rerun::AsComponents>(&self, path: &str, archetype: &AS) {
        if let Err(e) = self.rec.log(path, archetype) {
            warn!("[Viewer] rerun log of {} failed: {}", path, e);
        }
    }
}

impl ViewerSink for RerunSink {
    fn draw_frame(&mut self, update: &FrameUpdate, pose: &SE3, trajectory: &[Vector3<f64>]) {
        if let Some(t) = update.timestamp {
            self.rec.set_duration_secs("time", t);
        }
        self.log("world/camera", &to_transform(pose));
        self.log(
            "world/tracked_points",
            &rerun::Points3D::new(to_points(update.tracked_points.iter().copied()))
                .with_colors([[255u8, 255, 255]])
                .with_radii([0.02f32]),
        );
        if trajectory.len() >= 2 {
            self.log(
                "world/trajectory",
                &rerun::LineStrips3D::new([to_points(trajectory.iter().copied())])
                    .with_colors([[128u8, 128, 128]])
                    .with_radii([0.005f32]),
            );
        }
    }

    fn draw_map(&mut self, snapshot: &MapSnapshot, current_kf: Option<KeyFrameId>) {
        let current: Vec<Vector3<f64>> = snapshot
            .points
            .iter()
            .filter(|p| Some(p.reference_kf) == current_kf)
            .map(|p| p.position)
            .collect();
        let others = snapshot
            .points
            .iter()
            .filter(|p| Some(p.reference_kf) != current_kf)
            .map(|p| p.position);

        self.log(
            "world/map_points",
            &rerun::Points3D::new(to_points(others))
                .with_colors([[100u8, 100, 100]])
                .with_radii([0.01f32]),
        );
        self.log(
            "world/current_points",
            &rerun::Points3D::new(to_points(current))
                .with_colors([[255u8, 60, 60]])
                .with_radii([0.02f32]),
        );

        let alive: Vec<KeyFrameId> = snapshot.keyframes.iter().map(|k| k.id).collect();
        for gone in self.logged_keyframes.iter().filter(|id| !alive.contains(id)) {
            self.log(&format!("world/keyframes/{}", gone.0), &rerun::Clear::recursive());
        }
        for kf in &snapshot.keyframes {
            let path = format!("world/keyframes/{}", kf.id.0);
            self.log(&path, &to_transform(&kf.pose));
            self.log(
                &format!("{}/box", path),
                &rerun::Boxes3D::from_half_sizes([[0.05f32, 0.05, 0.05]]).with_colors([[0u8, 100, 255]]),
            );
        }
        self.logged_keyframes = alive;
    }

    fn draw_groundtruth(&mut self, positions: &[Vector3<f64>]) {
        if positions.len() < 2 {
            return;
        }
        self.log(
            "world/groundtruth",
            &rerun::LineStrips3D::new([to_points(positions.iter().copied())])
                .with_colors([[0u8, 255, 0]])
                .with_radii([0.005f32]),
        );
    }

    fn clear(&mut self) {
        self.log("world", &rerun::Clear::recursive());
        self.logged_keyframes.clear();
    }
}
