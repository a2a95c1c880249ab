//! Monocular visual SLAM core.
//!
//! Tracking estimates a pose for every image and hands keyframes to the
//! LocalMapping worker, which grows and refines a sparse map of keyframes and
//! 3D points. See [`system::SlamSystem`] for the entry point.

pub mod camera;
pub mod config;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod io;
pub mod local_mapping;
pub mod map;
pub mod matcher;
pub mod optimizer;
pub mod system;
pub mod tracking;
pub mod viewer;
pub mod vocabulary;

#[cfg(test)]
mod test_support;

pub use error::{Result, SlamError};
