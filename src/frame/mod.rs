//! Per-image data: features, descriptors and the [`Frame`] type.

pub mod extractor;
pub mod feature;
#[allow(clippy::module_inception)]
pub mod frame;

pub use extractor::FeatureExtractor;
pub use feature::{hamming_distance, Descriptor, ExtractedFeature, Feature};
pub use frame::Frame;
