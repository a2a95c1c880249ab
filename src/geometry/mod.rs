//! Geometry primitives: rigid transforms, SO(3) helpers, triangulation and
//! two-view relative pose.

pub mod se3;
pub mod so3;
pub mod triangulation;
pub mod two_view;

pub use se3::SE3;
pub use triangulation::{parallax_cos, reprojection_error_sq, triangulate_dlt};
pub use two_view::{reconstruct_two_view, TwoViewParams, TwoViewReconstruction};
