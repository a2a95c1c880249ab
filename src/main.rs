use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mono_vslam::config::SlamConfig;
use mono_vslam::io::image_folder::ImageFolder;
use mono_vslam::io::orb_extractor::OrbExtractor;
use mono_vslam::io::{load_groundtruth, write_trajectory};
use mono_vslam::optimizer::LmOptimizer;
use mono_vslam::system::{Collaborators, SlamSystem};
use mono_vslam::viewer::{Viewer, ViewerSink};
use mono_vslam::vocabulary::OrbVocabulary;

/// Frame period assumed when the image folder has no timestamp list.
const DEFAULT_FRAME_PERIOD: f64 = 0.05;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/euroc_mono.yaml"));
    let config = SlamConfig::from_yaml_file(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let dataset = config.dataset.clone();

    let Some(image_dir) = dataset.image_dir.as_deref() else {
        bail!("dataset.image_dir is not set in {}", config_path.display());
    };
    let Some(vocab_path) = dataset.vocabulary.as_deref() else {
        bail!("dataset.vocabulary is not set in {}", config_path.display());
    };

    let vocabulary = OrbVocabulary::load_from_text(vocab_path)
        .with_context(|| format!("loading vocabulary {}", vocab_path.display()))?;
    let mut source = ImageFolder::open(image_dir, dataset.timestamps.as_deref(), Some(DEFAULT_FRAME_PERIOD))
        .with_context(|| format!("opening images in {}", image_dir.display()))?;
    let extractor = OrbExtractor::from_config(&config).context("creating ORB extractor")?;

    let mut viewer = Viewer::new(create_sink()?);
    if let Some(gt_path) = dataset.groundtruth.as_deref() {
        let groundtruth =
            load_groundtruth(gt_path).with_context(|| format!("loading ground truth {}", gt_path.display()))?;
        info!("[System] {} ground-truth poses", groundtruth.len());
        viewer = viewer.with_groundtruth(groundtruth);
    }

    let collab = Collaborators::with_vocabulary(Arc::new(vocabulary), LmOptimizer::from_config(&config));
    let mut system = SlamSystem::with_viewer(config, collab, Some(viewer))
        .context("starting SLAM system")?
        .with_extractor(Box::new(extractor));

    let summary = system.run(&mut source, dataset.real_time)?;
    system.shutdown();

    let snapshot = system.map_snapshot();
    info!(
        "[System] Final map: {} keyframes, {} points, {} covisibility edges",
        snapshot.keyframes.len(),
        snapshot.points.len(),
        snapshot.covisibility_edges.len()
    );

    if let Some(out) = dataset.trajectory_output.as_deref() {
        write_trajectory(out, system.trajectory())
            .with_context(|| format!("writing trajectory {}", out.display()))?;
        info!("[System] Wrote {} poses to {}", system.trajectory().len(), out.display());
    }

    info!("Done! Processed {} frames, {} tracked", summary.frames, summary.tracked);
    Ok(())
}

#[cfg(feature = "rerun")]
fn create_sink() -> Result<Box<dyn ViewerSink>> {
    let sink = mono_vslam::viewer::RerunSink::spawn("mono-vslam").context("starting rerun viewer")?;
    Ok(Box::new(sink))
}

#[cfg(not(feature = "rerun"))]
fn create_sink() -> Result<Box<dyn ViewerSink>> {
    Ok(Box::new(mono_vslam::viewer::LogSink::default()))
}
