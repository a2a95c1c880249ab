//! ORB features through OpenCV.

use opencv::core::{KeyPoint, Mat, Ptr, Vector};
use opencv::features2d;
use opencv::prelude::*;

use crate::config::SlamConfig;
use crate::error::{Result, SlamError};
use crate::frame::{Descriptor, ExtractedFeature, FeatureExtractor};

use super::image_folder::gray_to_mat;
use super::GrayImage;

pub struct OrbExtractor {
    orb: Ptr<features2d::ORB>,
}

fn cv_err(e: opencv::Error) -> SlamError {
    SlamError::Extraction(e.to_string())
}

impl OrbExtractor {
    /// Pyramid of `n_levels` levels with a constant `scale_factor` between them.
    pub fn new(n_features: usize, scale_factor: f64, n_levels: usize) -> Result<Self> {
        let orb = features2d::ORB::create(
            n_features as i32,
            scale_factor as f32,
            n_levels as i32,
            31,
            0,
            2,
            features2d::ORB_ScoreType::HARRIS_SCORE,
            31,
            20,
        )
        .map_err(cv_err)?;
        Ok(Self { orb })
    }

    pub fn from_config(config: &SlamConfig) -> Result<Self> {
        let n_levels = config.scale_factors.len().max(1);
        let scale_factor = config.scale_factors.get(1).copied().unwrap_or(1.2);
        Self::new(config.n_features, scale_factor, n_levels)
    }
}

impl FeatureExtractor for OrbExtractor {
    fn extract(&mut self, image: &GrayImage) -> Result<Vec<ExtractedFeature>> {
        let mat = gray_to_mat(image).map_err(|e| SlamError::Extraction(e.to_string()))?;
        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        let mask = Mat::default();
        self.orb
            .detect_and_compute(&mat, &mask, &mut keypoints, &mut descriptors, false)
            .map_err(cv_err)?;

        let mut features = Vec::with_capacity(keypoints.len());
        for (i, kp) in keypoints.iter().enumerate() {
            let row = descriptors.at_row::<u8>(i as i32).map_err(cv_err)?;
            let descriptor: Descriptor = row
                .get(..32)
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or_else(|| SlamError::Extraction(format!("descriptor {} is not 32 bytes", i)))?;
            features.push(ExtractedFeature {
                keypoint: nalgebra::Vector2::new(kp.pt().x as f64, kp.pt().y as f64),
                descriptor,
                level: kp.octave().max(0) as usize,
            });
        }
        Ok(features)
    }
}
