//! Monocular map bootstrap.
//!
//! A small stage machine: the first frame with enough features becomes the
//! reference; each following frame is matched against it and, once a
//! two-view reconstruction succeeds, the pair and its triangulated points
//! seed the map. A failed attempt promotes the current frame to be the new
//! reference.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::camera::Camera;
use crate::config::SlamConfig;
use crate::frame::Frame;
use crate::geometry::{reconstruct_two_view, TwoViewParams, SE3};
use crate::matcher::Matcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    AwaitingReference,
    AwaitingCurrent,
    Success,
    Failed,
}

/// Everything needed to build the first two keyframes.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    /// Posed at the world origin.
    pub reference: Frame,
    /// Posed relative to the reference, map scale fixed by median depth 1.
    pub current: Frame,
    /// `(reference feature, current feature, world position)` per valid correspondence.
    pub points: Vec<(usize, usize, Vector3<f64>)>,
}

#[derive(Debug)]
pub enum InitOutcome {
    /// Waiting for more frames.
    Pending,
    /// This attempt failed; the current frame is the new reference.
    Failed,
    Ready(Box<Bootstrap>),
}

pub struct Initializer {
    stage: InitStage,
    reference: Option<Frame>,
    params: TwoViewParams,
    min_matches: usize,
    search_window: f64,
    rng: StdRng,
}

impl Initializer {
    pub fn new(config: &SlamConfig) -> Self {
        Self {
            stage: InitStage::AwaitingReference,
            reference: None,
            params: TwoViewParams {
                ransac_iterations: config.init_ransac_iterations,
                sigma_px: 1.0,
                chi2_threshold: config.chi2_threshold,
                min_parallax_cos: config.min_parallax_cos(),
                min_triangulated: config.init_min_triangulated,
            },
            min_matches: config.min_matches_init,
            search_window: config.init_search_window_px,
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn stage(&self) -> InitStage {
        self.stage
    }

    pub fn reference(&self) -> Option<&Frame> {
        self.reference.as_ref()
    }

    pub fn reset(&mut self) {
        self.stage = InitStage::AwaitingReference;
        self.reference = None;
    }

    /// Feed the next frame.
    pub fn add_frame(&mut self, frame: &Frame, camera: &Camera, matcher: &dyn Matcher) -> InitOutcome {
        match self.stage {
            InitStage::AwaitingReference | InitStage::Success => {
                self.set_reference(frame);
                InitOutcome::Pending
            }
            InitStage::AwaitingCurrent | InitStage::Failed => self.try_initialize(frame, camera, matcher),
        }
    }

    fn set_reference(&mut self, frame: &Frame) {
        if frame.num_features() > self.min_matches {
            debug!("[Init] Reference frame {} ({} features)", frame.id, frame.num_features());
            self.reference = Some(frame.clone());
            self.stage = InitStage::AwaitingCurrent;
        } else {
            self.reference = None;
            self.stage = InitStage::AwaitingReference;
        }
    }

    fn fail_with(&mut self, frame: &Frame) -> InitOutcome {
        self.set_reference(frame);
        if self.stage == InitStage::AwaitingCurrent {
            self.stage = InitStage::Failed;
        }
        InitOutcome::Failed
    }

    fn try_initialize(&mut self, frame: &Frame, camera: &Camera, matcher: &dyn Matcher) -> InitOutcome {
        let reference = match self.reference.take() {
            Some(r) => r,
            None => {
                self.set_reference(frame);
                return InitOutcome::Pending;
            }
        };

        if frame.num_features() <= self.min_matches {
            debug!("[Init] Frame {} has too few features, restarting", frame.id);
            self.reset();
            return InitOutcome::Failed;
        }

        let matches = matcher.search_for_initialization(&reference, frame, self.search_window);
        let pairs: Vec<(usize, usize)> = matches
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
            .collect();
        if pairs.len() < self.min_matches {
            debug!("[Init] Only {} matches with reference {} (need {})", pairs.len(), reference.id, self.min_matches);
            return self.fail_with(frame);
        }

        let px1: Vec<_> = pairs.iter().map(|(i1, _)| reference.features[*i1].pixel).collect();
        let px2: Vec<_> = pairs.iter().map(|(_, i2)| frame.features[*i2].pixel).collect();
        let reconstruction = match reconstruct_two_view(camera, &px1, &px2, &self.params, &mut self.rng) {
            Some(r) => r,
            None => {
                debug!("[Init] Two-view reconstruction failed for frames {} / {}", reference.id, frame.id);
                return self.fail_with(frame);
            }
        };

        let mut depths: Vec<f64> = reconstruction.points.iter().flatten().map(|p| p.z).collect();
        depths.sort_by(|a, b| a.total_cmp(b));
        let median = match depths.get(depths.len() / 2) {
            Some(d) if *d > 0.0 => *d,
            _ => return self.fail_with(frame),
        };
        let scale = 1.0 / median;

        let points: Vec<_> = pairs
            .iter()
            .zip(&reconstruction.points)
            .filter_map(|((i1, i2), p)| p.map(|p| (*i1, *i2, p * scale)))
            .collect();

        let t21 = SE3::new(reconstruction.t21.rotation, reconstruction.t21.translation * scale);
        let mut reference = reference;
        reference.pose = SE3::identity();
        let mut current = frame.clone();
        current.pose = t21.inverse();

        info!(
            "[Init] Map bootstrapped from frames {} and {}: {} points, baseline {:.3}",
            reference.id,
            current.id,
            points.len(),
            t21.translation.norm()
        );
        self.stage = InitStage::Success;
        InitOutcome::Ready(Box::new(Bootstrap {
            reference,
            current,
            points,
        }))
    }
}

impl std::fmt::Debug for Initializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Initializer")
            .field("stage", &self.stage)
            .field("reference", &self.reference.as_ref().map(|r| r.id))
            .finish()
    }
}
