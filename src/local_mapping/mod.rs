//! LocalMapping: the background worker that grows and prunes the map.
//!
//! - integrates keyframes queued by Tracking
//! - triangulates new points against covisible neighbors
//! - runs local bundle adjustment when idle
//! - culls weak points and redundant keyframes

pub mod culling;
mod local_mapper;
pub mod triangulation;

pub use culling::{cull_keyframes, cull_recent_points, CullingConfig};
pub use local_mapper::{LocalMapper, MappingReport};
pub use triangulation::{triangulate_new_points, Rejection, TriangulationConfig, TriangulationResult};
