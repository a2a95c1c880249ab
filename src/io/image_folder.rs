//! Grayscale images from a directory, read with OpenCV.

use std::path::{Path, PathBuf};

use opencv::core::Mat;
use opencv::imgcodecs::{self, IMREAD_GRAYSCALE};
use opencv::prelude::*;
use tracing::{info, warn};

use crate::error::{Result, SlamError};

use super::dataset::{load_image_list, ImageEntry};
use super::{GrayImage, ImageSource, TimedImage};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "pgm"];

/// Images listed in a timestamp CSV, or every image in the folder by name.
#[derive(Debug)]
pub struct ImageFolder {
    dir: PathBuf,
    entries: Vec<ImageEntry>,
    /// Frame period (seconds) used when the folder has no timestamp list.
    period: Option<f64>,
    next: usize,
}

impl ImageFolder {
    /// `timestamps` is a `timestamp_ns,filename` CSV. Without it images are
    /// taken in file name order and timestamped `index * period`.
    pub fn open<P: AsRef<Path>>(dir: P, timestamps: Option<&Path>, period: Option<f64>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let entries = match timestamps {
            Some(csv) => load_image_list(csv)?,
            None => list_images(&dir)?,
        };
        if entries.is_empty() {
            return Err(SlamError::ImageSource(format!("no images in {}", dir.display())));
        }
        info!("[System] {} images in {}", entries.len(), dir.display());
        Ok(Self {
            dir,
            entries,
            period: if timestamps.is_some() { None } else { period },
            next: 0,
        })
    }

    fn timestamp(&self, idx: usize) -> Option<f64> {
        match self.period {
            Some(period) => Some(idx as f64 * period),
            None if self.entries[idx].timestamp_ns > 0 => Some(self.entries[idx].timestamp_s()),
            None => None,
        }
    }
}

fn list_images(dir: &Path) -> Result<Vec<ImageEntry>> {
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|x| x.to_str())
                .map_or(false, |x| IMAGE_EXTENSIONS.contains(&x.to_ascii_lowercase().as_str()))
        })
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect();
    names.sort();
    Ok(names
        .into_iter()
        .map(|filename| ImageEntry {
            timestamp_ns: 0,
            filename,
        })
        .collect())
}

fn cv_err(e: opencv::Error) -> SlamError {
    SlamError::ImageSource(e.to_string())
}

/// Copy a single channel 8-bit `Mat` into a [`GrayImage`].
pub fn mat_to_gray(mat: &Mat) -> Result<GrayImage> {
    let (width, height) = (mat.cols() as u32, mat.rows() as u32);
    let mut data = Vec::with_capacity((width * height) as usize);
    for row in 0..mat.rows() {
        let slice = mat.at_row::<u8>(row).map_err(cv_err)?;
        data.extend_from_slice(&slice[..width as usize]);
    }
    GrayImage::new(width, height, data)
        .ok_or_else(|| SlamError::ImageSource("image buffer size mismatch".to_string()))
}

/// Build a `Mat` view-copy of a [`GrayImage`].
pub fn gray_to_mat(image: &GrayImage) -> Result<Mat> {
    let flat = Mat::from_slice(&image.data).map_err(cv_err)?;
    let mat = flat.reshape(1, image.height as i32).map_err(cv_err)?;
    mat.try_clone().map_err(cv_err)
}

impl ImageSource for ImageFolder {
    fn next_image(&mut self) -> Result<Option<TimedImage>> {
        while self.next < self.entries.len() {
            let idx = self.next;
            self.next += 1;

            let path = self.dir.join(&self.entries[idx].filename);
            let path_str = path
                .to_str()
                .ok_or_else(|| SlamError::ImageSource(format!("non UTF-8 path {}", path.display())))?;
            let mat = imgcodecs::imread(path_str, IMREAD_GRAYSCALE).map_err(cv_err)?;
            if mat.empty() {
                warn!("[System] Could not read {}, skipping", path.display());
                continue;
            }
            return Ok(Some(TimedImage {
                image: mat_to_gray(&mat)?,
                timestamp: self.timestamp(idx),
            }));
        }
        Ok(None)
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}
