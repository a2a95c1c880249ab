//! CSV files around an image sequence: image lists, ground truth and the
//! estimated trajectory.
//!
//! Timestamps in the input files are integer nanoseconds (EuRoC layout);
//! everything handed to the pipeline is in seconds.

use std::path::Path;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::error::{Result, SlamError};
use crate::geometry::SE3;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageEntry {
    pub timestamp_ns: u64,
    pub filename: String,
}

impl ImageEntry {
    pub fn timestamp_s(&self) -> f64 {
        self.timestamp_ns as f64 * 1e-9
    }
}

#[derive(Debug, Clone)]
pub struct GroundTruthEntry {
    pub timestamp_ns: u64,
    /// Body to world.
    pub pose: SE3,
}

/// One row of the exported trajectory.
#[derive(Debug, Clone)]
pub struct TrajectoryEntry {
    pub timestamp: f64,
    /// Camera to world.
    pub pose: SE3,
}

fn parse_field<T: std::str::FromStr>(rec: &StringRecord, idx: usize, line: u64) -> Result<T> {
    rec.get(idx)
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| SlamError::ImageSource(format!("line {}: bad field {}", line, idx)))
}

fn line_of(rec: &StringRecord) -> u64 {
    rec.position().map_or(0, |p| p.line())
}

/// `timestamp_ns,filename` rows; `#` lines are comments.
pub fn load_image_list<P: AsRef<Path>>(csv_path: P) -> Result<Vec<ImageEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(csv_path.as_ref())?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 2 {
            continue;
        }
        entries.push(ImageEntry {
            timestamp_ns: parse_field(&rec, 0, line_of(&rec))?,
            filename: rec[1].trim().to_string(),
        });
    }
    Ok(entries)
}

/// Ground-truth trajectory sorted by time.
#[derive(Debug, Clone, Default)]
pub struct GroundTruth {
    pub entries: Vec<GroundTruthEntry>,
}

impl GroundTruth {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Positions up to and including `timestamp_ns`, relative to the first entry.
    pub fn positions_until(&self, timestamp_ns: u64) -> Vec<Vector3<f64>> {
        let origin = match self.entries.first() {
            Some(first) => first.pose.translation,
            None => return Vec::new(),
        };
        let cutoff = self.entries.partition_point(|gt| gt.timestamp_ns <= timestamp_ns);
        self.entries[..cutoff]
            .iter()
            .map(|gt| gt.pose.translation - origin)
            .collect()
    }
}

/// `timestamp_ns, tx, ty, tz, qw, qx, qy, qz, ...` rows. Extra columns are ignored.
pub fn load_groundtruth<P: AsRef<Path>>(csv_path: P) -> Result<GroundTruth> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(csv_path.as_ref())?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 8 {
            continue;
        }
        let line = line_of(&rec);
        let f = |i| parse_field::<f64>(&rec, i, line);
        let position = Vector3::new(f(1)?, f(2)?, f(3)?);
        // w-first in the file
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(f(4)?, f(5)?, f(6)?, f(7)?));
        entries.push(GroundTruthEntry {
            timestamp_ns: parse_field(&rec, 0, line)?,
            pose: SE3::new(rotation, position),
        });
    }
    entries.sort_by_key(|e| e.timestamp_ns);
    Ok(GroundTruth { entries })
}

/// Write `timestamp, tx, ty, tz, qx, qy, qz, qw` rows with a header.
pub fn write_trajectory<P: AsRef<Path>>(path: P, trajectory: &[TrajectoryEntry]) -> Result<()> {
    let mut wtr = WriterBuilder::new().from_path(path.as_ref())?;
    wtr.write_record(["timestamp", "tx", "ty", "tz", "qx", "qy", "qz", "qw"])?;
    for entry in trajectory {
        let t = entry.pose.translation;
        let q = entry.pose.rotation.quaternion();
        wtr.write_record(&[
            format!("{:.9}", entry.timestamp),
            format!("{:.9}", t.x),
            format!("{:.9}", t.y),
            format!("{:.9}", t.z),
            format!("{:.9}", q.i),
            format!("{:.9}", q.j),
            format!("{:.9}", q.k),
            format!("{:.9}", q.w),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    fn create_test_file(name: &str, contents: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("mono_vslam_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("data.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_image_list_skips_comments() {
        let path = create_test_file(
            "images",
            "#timestamp [ns],filename\n1403636579763555584,1403636579763555584.png\n1403636579813555456,1403636579813555456.png\n",
        );
        let entries = load_image_list(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].filename, "1403636579813555456.png");
        assert_relative_eq!(entries[0].timestamp_s(), 1403636579.763555584, epsilon = 1e-6);
    }

    #[test]
    fn test_load_image_list_rejects_bad_timestamp() {
        let path = create_test_file("bad_images", "abc,frame.png\n");
        assert!(load_image_list(&path).is_err());
    }

    #[test]
    fn test_groundtruth_positions_are_origin_aligned() {
        let path = create_test_file(
            "gt",
            "#ts,x,y,z,qw,qx,qy,qz\n300,3.0,0,0,1,0,0,0\n100,1.0,2.0,0,1,0,0,0\n200,2.0,2.0,0,1,0,0,0,0.1,0.2\n",
        );
        let gt = load_groundtruth(&path).unwrap();
        assert_eq!(gt.len(), 3);
        assert_eq!(gt.entries[0].timestamp_ns, 100);

        let positions = gt.positions_until(250);
        assert_eq!(positions.len(), 2);
        assert_relative_eq!(positions[0], Vector3::zeros());
        assert_relative_eq!(positions[1], Vector3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_write_trajectory() {
        let path = create_test_file("traj", "");
        let pose = SE3::new(UnitQuaternion::identity(), Vector3::new(1.0, -2.0, 0.5));
        write_trajectory(&path, &[TrajectoryEntry { timestamp: 0.25, pose }]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("timestamp,tx,ty,tz,qx,qy,qz,qw"));
        let row: Vec<f64> = lines.next().unwrap().split(',').map(|v| v.parse().unwrap()).collect();
        assert_eq!(row.len(), 8);
        assert_relative_eq!(row[1], 1.0);
        assert_relative_eq!(row[2], -2.0);
        assert_relative_eq!(row[7], 1.0);
    }
}
