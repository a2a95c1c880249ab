//! Id types for frames and map entities.
//!
//! Everything in the map is addressed by integer id: observation lists and
//! feature associations store ids, never references, so the keyframe ↔ point
//! cycle becomes an indexed lookup with an explicit liveness check.

/// Identifier of a frame, assigned in increasing order per image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

impl FrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Identifier of a KeyFrame within the Map.
///
/// A keyframe keeps the number of the frame it was promoted from, so ids are
/// increasing but not contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl From<FrameId> for KeyFrameId {
    fn from(id: FrameId) -> Self {
        Self(id.0)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Identifier of a MapPoint, assigned sequentially by the Map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

impl MapPointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", FrameId::new(5)), "F5");
        assert_eq!(format!("{}", KeyFrameId::new(42)), "KF42");
        assert_eq!(format!("{}", MapPointId::new(123)), "MP123");
    }

    #[test]
    fn test_keyframe_id_from_frame() {
        assert_eq!(KeyFrameId::from(FrameId::new(9)), KeyFrameId::new(9));
    }

    #[test]
    fn test_id_ordering() {
        let mut ids = vec![KeyFrameId::new(3), KeyFrameId::new(1), KeyFrameId::new(2)];
        ids.sort();
        assert_eq!(ids, vec![KeyFrameId::new(1), KeyFrameId::new(2), KeyFrameId::new(3)]);
    }
}
