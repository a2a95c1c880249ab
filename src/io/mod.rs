//! Image ingestion and dataset files.
//!
//! The pipeline pulls [`TimedImage`]s from an [`ImageSource`] until it
//! returns `None`. The OpenCV-backed folder source and ORB extractor are
//! behind the `opencv` feature; the CSV helpers are always available.

pub mod dataset;
#[cfg(feature = "opencv")]
pub mod image_folder;
#[cfg(feature = "opencv")]
pub mod orb_extractor;

pub use dataset::{
    load_groundtruth, load_image_list, write_trajectory, GroundTruth, GroundTruthEntry, ImageEntry,
    TrajectoryEntry,
};

use crate::error::Result;

/// 8-bit single channel image, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self { width, height, data })
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get((y as usize) * (self.width as usize) + x as usize).copied()
    }
}

/// One image and its capture time in seconds, when known.
#[derive(Debug, Clone)]
pub struct TimedImage {
    pub image: GrayImage,
    pub timestamp: Option<f64>,
}

/// Pull-based image stream. `Ok(None)` is end of stream.
pub trait ImageSource {
    fn next_image(&mut self) -> Result<Option<TimedImage>>;

    /// Total number of images, if known up front.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// In-memory source, mostly for tests and replays.
#[derive(Debug, Default)]
pub struct VecSource {
    images: std::collections::VecDeque<TimedImage>,
}

impl VecSource {
    pub fn new(images: Vec<TimedImage>) -> Self {
        Self { images: images.into() }
    }
}

impl ImageSource for VecSource {
    fn next_image(&mut self) -> Result<Option<TimedImage>> {
        Ok(self.images.pop_front())
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.images.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gray_image_bounds() {
        assert!(GrayImage::new(4, 2, vec![0; 7]).is_none());
        let image = GrayImage::new(4, 2, (0..8).collect()).unwrap();
        assert_eq!(image.pixel(3, 1), Some(7));
        assert_eq!(image.pixel(4, 0), None);
    }

    #[test]
    fn test_vec_source_ends_with_none() {
        let image = GrayImage::new(1, 1, vec![9]).unwrap();
        let mut source = VecSource::new(vec![TimedImage {
            image,
            timestamp: Some(0.5),
        }]);
        assert_eq!(source.len_hint(), Some(1));
        assert!(source.next_image().unwrap().is_some());
        assert!(source.next_image().unwrap().is_none());
    }
}
