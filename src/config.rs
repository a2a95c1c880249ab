//! Runtime configuration.
//!
//! The whole pipeline is parameterized by a single [`SlamConfig`], loaded once
//! from YAML and shared read-only (behind an `Arc`) by every thread. Every
//! field has a default, so a config file only needs to list what it overrides:
//!
//! ```yaml
//! camera:
//!   fx: 458.654
//!   fy: 457.296
//!   cx: 367.215
//!   cy: 248.375
//!   width: 752
//!   height: 480
//! min_matches_init: 100
//! max_queue_depth: 3
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, SlamError};

/// Pinhole intrinsics plus radial-tangential distortion.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        // EuRoC MAV cam0
        Self {
            fx: 458.654,
            fy: 457.296,
            cx: 367.215,
            cy: 248.375,
            k1: -0.28340811,
            k2: 0.07395907,
            p1: 0.00019359,
            p2: 1.76187114e-05,
            width: 752,
            height: 480,
        }
    }
}

/// Input/output locations used by the binary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Directory holding the images.
    pub image_dir: Option<PathBuf>,
    /// CSV of `timestamp_ns,filename` rows. Without it the folder is read in name order.
    pub timestamps: Option<PathBuf>,
    /// Ground-truth CSV (`timestamp_ns, tx, ty, tz, qw, qx, qy, qz`, ...).
    pub groundtruth: Option<PathBuf>,
    /// DBoW2 text vocabulary.
    pub vocabulary: Option<PathBuf>,
    /// Where the estimated trajectory CSV is written on exit.
    pub trajectory_output: Option<PathBuf>,
    /// Sleep between frames so the stream plays back at its recorded rate.
    pub real_time: bool,
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    pub camera: CameraConfig,
    pub dataset: DatasetConfig,

    // ─────────────────────────────────────────────────────────────────────
    // Feature extraction
    // ─────────────────────────────────────────────────────────────────────
    /// Target number of features per image.
    pub n_features: usize,
    /// Scale factor of every pyramid level relative to level 0 (`scale_factors[0] == 1`).
    pub scale_factors: Vec<f64>,

    // ─────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────
    /// Minimum reference/current correspondences to attempt a two-view bootstrap.
    pub min_matches_init: usize,
    /// Minimum parallax angle (degrees) for a triangulated point to be accepted.
    pub min_parallax_deg: f64,
    /// RANSAC iterations of the essential matrix search.
    pub init_ransac_iterations: usize,
    /// Minimum number of triangulated points for the bootstrap to succeed.
    pub init_min_triangulated: usize,
    /// Search window (pixels) around each reference feature.
    pub init_search_window_px: f64,

    // ─────────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────────
    /// Fewer inliers than this after pose refinement means tracking is lost.
    pub min_track_inliers: usize,
    /// Fewer matches than this from one search strategy and the next one is tried.
    pub min_projection_matches: usize,
    /// Inliers required after the first, motion-prior pose refinement.
    pub min_motion_inliers: usize,
    /// Projection search radius (pixels at level 0).
    pub search_radius_px: f64,
    /// Covisible keyframes added per matched keyframe when building the local map.
    pub local_map_neighbors: usize,
    /// Projection search radius (pixels at level 0) when tracking the local map.
    pub local_map_radius_px: f64,
    /// Cosine of the widest angle between a point's mean viewing direction and the current ray.
    pub min_view_cos: f64,
    /// Frames since the last keyframe after which gap condition (a) holds.
    pub min_keyframe_gap: usize,
    /// Condition (a) also holds once tracked points fall below this fraction of the reference keyframe's.
    pub tracked_ratio_threshold: f64,
    /// Condition (b): fraction of weakly observed tracked points that must be exceeded.
    pub structure_need_ratio: f64,
    /// A tracked point observed by fewer keyframes than this counts as weakly observed.
    pub min_mature_observations: usize,
    /// Keyframe queue capacity; the policy declines new keyframes once it is reached.
    pub max_queue_depth: usize,

    // ─────────────────────────────────────────────────────────────────────
    // Relocalization
    // ─────────────────────────────────────────────────────────────────────
    /// Minimum fraction of the query's visual words a candidate keyframe must share.
    pub min_overlap_ratio: f64,
    pub max_reloc_candidates: usize,
    pub reloc_min_inliers: usize,

    // ─────────────────────────────────────────────────────────────────────
    // Local mapping
    // ─────────────────────────────────────────────────────────────────────
    /// Neighbor pairs yielding fewer putative matches than this are skipped.
    pub tri_min_matches: usize,
    pub num_triangulation_neighbors: usize,
    /// Baseline over median scene depth below which a neighbor is skipped.
    pub min_baseline_ratio: f64,
    /// Two-DOF chi-square gate on squared reprojection error (multiplied by sigma² of the level).
    pub chi2_threshold: f64,
    /// Band for (level scale ratio) / (distance ratio) of a new point's two views.
    pub min_scale_ratio: f64,
    pub max_scale_ratio: f64,
    /// A keyframe whose redundant-point fraction exceeds this is culled.
    pub redundancy_factor: f64,
    /// Other keyframes that must observe a point for it to count as redundant.
    pub redundant_min_observers: usize,
    /// Keyframes a new point is given before the observation check applies.
    pub recent_point_grace_keyframes: u64,
    pub recent_point_min_observations: usize,
    pub min_covisibility_weight: usize,

    // ─────────────────────────────────────────────────────────────────────
    // Optimization
    // ─────────────────────────────────────────────────────────────────────
    pub local_ba_iterations: usize,
    pub local_ba_max_points: usize,
    /// Huber kernel width (pixels).
    pub huber_delta: f64,
    /// Outlier re-classification rounds of pose-only refinement.
    pub pose_refine_rounds: usize,
}

fn default_scale_factors() -> Vec<f64> {
    (0..8).map(|level| 1.2f64.powi(level)).collect()
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            dataset: DatasetConfig::default(),
            n_features: 1000,
            scale_factors: default_scale_factors(),
            min_matches_init: 100,
            min_parallax_deg: 1.0,
            init_ransac_iterations: 200,
            init_min_triangulated: 50,
            init_search_window_px: 100.0,
            min_track_inliers: 15,
            min_projection_matches: 20,
            min_motion_inliers: 10,
            search_radius_px: 15.0,
            local_map_neighbors: 10,
            local_map_radius_px: 4.0,
            min_view_cos: 0.5,
            min_keyframe_gap: 8,
            tracked_ratio_threshold: 0.9,
            structure_need_ratio: 0.1,
            min_mature_observations: 3,
            max_queue_depth: 3,
            min_overlap_ratio: 0.3,
            max_reloc_candidates: 5,
            reloc_min_inliers: 30,
            tri_min_matches: 10,
            num_triangulation_neighbors: 10,
            min_baseline_ratio: 0.01,
            chi2_threshold: 5.991,
            min_scale_ratio: 0.5,
            max_scale_ratio: 1.5,
            redundancy_factor: 0.9,
            redundant_min_observers: 3,
            recent_point_grace_keyframes: 3,
            recent_point_min_observations: 3,
            min_covisibility_weight: 1,
            local_ba_iterations: 10,
            local_ba_max_points: 2000,
            huber_delta: 5.991f64.sqrt(),
            pose_refine_rounds: 4,
        }
    }
}

impl SlamConfig {
    /// Load and validate a configuration file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a configuration from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: SlamConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make the gates meaningless.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(SlamError::Config(msg));

        if self.scale_factors.is_empty() {
            return fail("scale_factors must list at least one level".into());
        }
        if (self.scale_factors[0] - 1.0).abs() > 1e-9 {
            return fail(format!("scale_factors[0] must be 1.0, got {}", self.scale_factors[0]));
        }
        if self.scale_factors.windows(2).any(|w| w[1] < w[0]) {
            return fail("scale_factors must be non-decreasing".into());
        }
        if self.camera.fx <= 0.0 || self.camera.fy <= 0.0 {
            return fail("camera focal lengths must be positive".into());
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return fail("camera image size must be non-zero".into());
        }
        if !(self.min_parallax_deg > 0.0 && self.min_parallax_deg < 90.0) {
            return fail(format!("min_parallax_deg out of range: {}", self.min_parallax_deg));
        }
        if self.chi2_threshold <= 0.0 {
            return fail("chi2_threshold must be positive".into());
        }
        if self.max_queue_depth == 0 {
            return fail("max_queue_depth must be at least 1".into());
        }
        if !(self.min_scale_ratio > 0.0 && self.min_scale_ratio <= 1.0 && self.max_scale_ratio >= 1.0) {
            return fail(format!(
                "scale ratio band must contain 1, got [{}, {}]",
                self.min_scale_ratio, self.max_scale_ratio
            ));
        }
        for (name, value) in [
            ("redundancy_factor", self.redundancy_factor),
            ("min_overlap_ratio", self.min_overlap_ratio),
            ("tracked_ratio_threshold", self.tracked_ratio_threshold),
            ("structure_need_ratio", self.structure_need_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return fail(format!("{} must lie in [0, 1], got {}", name, value));
            }
        }
        if self.min_motion_inliers < 3 {
            return fail("min_motion_inliers must be at least 3".into());
        }
        if self.min_matches_init < 8 {
            return fail("min_matches_init must be at least 8".into());
        }
        Ok(())
    }

    /// Per-level scale tables derived from `scale_factors`.
    pub fn pyramid(&self) -> ScalePyramid {
        ScalePyramid::from_factors(&self.scale_factors)
    }

    pub fn min_parallax_cos(&self) -> f64 {
        self.min_parallax_deg.to_radians().cos()
    }
}

/// Scale factors and measurement uncertainty per pyramid level.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalePyramid {
    factors: Vec<f64>,
    sigma2: Vec<f64>,
    inv_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn from_factors(factors: &[f64]) -> Self {
        let factors = if factors.is_empty() { vec![1.0] } else { factors.to_vec() };
        let sigma2: Vec<f64> = factors.iter().map(|f| f * f).collect();
        let inv_sigma2 = sigma2.iter().map(|s| 1.0 / s).collect();
        Self { factors, sigma2, inv_sigma2 }
    }

    pub fn n_levels(&self) -> usize {
        self.factors.len()
    }

    /// Levels past the top of the pyramid are clamped to it.
    pub fn scale(&self, level: usize) -> f64 {
        self.factors[self.clamp(level)]
    }

    pub fn sigma2(&self, level: usize) -> f64 {
        self.sigma2[self.clamp(level)]
    }

    pub fn inv_sigma2(&self, level: usize) -> f64 {
        self.inv_sigma2[self.clamp(level)]
    }

    /// Ratio between the coarsest and finest level.
    pub fn max_scale(&self) -> f64 {
        self.factors[self.factors.len() - 1]
    }

    /// Level at which a point with `max_distance` is expected to appear at `distance`.
    pub fn predict_level(&self, distance: f64, max_distance: f64) -> usize {
        if distance <= 0.0 || max_distance <= 0.0 {
            return 0;
        }
        let ratio = max_distance / distance;
        // Largest level whose scale does not exceed the ratio.
        let level = self.factors.iter().take_while(|&&f| f <= ratio).count();
        level.saturating_sub(1).min(self.n_levels() - 1)
    }

    fn clamp(&self, level: usize) -> usize {
        level.min(self.factors.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SlamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scale_factors.len(), 8);
        assert!((config.scale_factors[1] - 1.2).abs() < 1e-12);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "max_queue_depth: 5\nredundancy_factor: 0.8\ncamera:\n  fx: 500.0\n";
        let config = SlamConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.max_queue_depth, 5);
        assert!((config.redundancy_factor - 0.8).abs() < 1e-12);
        assert!((config.camera.fx - 500.0).abs() < 1e-12);
        // Untouched fields fall back to defaults.
        assert_eq!(config.min_matches_init, 100);
        assert!((config.camera.fy - 457.296).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_scale_factors_rejected() {
        let yaml = "scale_factors: [1.2, 1.44]\n";
        assert!(matches!(SlamConfig::from_yaml_str(yaml), Err(SlamError::Config(_))));

        let yaml = "scale_factors: [1.0, 1.5, 1.2]\n";
        assert!(matches!(SlamConfig::from_yaml_str(yaml), Err(SlamError::Config(_))));
    }

    #[test]
    fn test_tracking_gates_from_yaml() {
        let defaults = SlamConfig::default();
        assert_eq!(defaults.min_projection_matches, 20);
        assert_eq!(defaults.min_motion_inliers, 10);

        let yaml = "min_projection_matches: 30\nmin_motion_inliers: 12\n";
        let config = SlamConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.min_projection_matches, 30);
        assert_eq!(config.min_motion_inliers, 12);
        assert_eq!(config.min_track_inliers, defaults.min_track_inliers);

        assert!(SlamConfig::from_yaml_str("min_motion_inliers: 2\n").is_err());
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let mut config = SlamConfig::default();
        config.redundancy_factor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_yaml_is_yaml_error() {
        let result = SlamConfig::from_yaml_str("max_queue_depth: [not, a, number]");
        assert!(matches!(result, Err(SlamError::Yaml(_))));
    }

    #[test]
    fn test_pyramid_sigma() {
        let pyramid = ScalePyramid::from_factors(&[1.0, 1.2, 1.44]);
        assert_eq!(pyramid.n_levels(), 3);
        assert!((pyramid.sigma2(1) - 1.44).abs() < 1e-12);
        assert!((pyramid.inv_sigma2(2) - 1.0 / (1.44 * 1.44)).abs() < 1e-12);
        // Clamped past the top.
        assert!((pyramid.scale(10) - 1.44).abs() < 1e-12);
    }

    #[test]
    fn test_predict_level() {
        let pyramid = ScalePyramid::from_factors(&[1.0, 1.2, 1.44, 1.728]);
        // At max distance the point is seen at the finest level.
        assert_eq!(pyramid.predict_level(10.0, 10.0), 0);
        // Twice as close: ratio 2 covers every level.
        assert_eq!(pyramid.predict_level(5.0, 10.0), 3);
        assert_eq!(pyramid.predict_level(10.0 / 1.3, 10.0), 1);
    }
}
