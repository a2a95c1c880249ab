//! New-keyframe policy.
//!
//! A keyframe is requested only when all three conditions hold:
//! - (a) enough frames have passed since the last keyframe, or the tracked
//!   point count dropped relative to the reference keyframe;
//! - (b) enough of the tracked points are weakly observed (seen by few
//!   keyframes), so new structure is needed;
//! - (c) the LocalMapping queue is not saturated.
//!
//! [`KeyFramePolicy::evaluate`] is a pure function of its inputs, so
//! re-evaluating it without a state change yields the same decision.

use crate::config::SlamConfig;

/// Everything the policy looks at for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyFrameInputs {
    pub frames_since_keyframe: usize,
    /// Map points tracked in the current frame.
    pub tracked: usize,
    /// Map points of the reference keyframe.
    pub reference_tracked: usize,
    /// Tracked points observed by fewer than `min_mature_observations` keyframes.
    pub weak_tracked: usize,
    /// Keyframes waiting in the LocalMapping queue.
    pub queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyFramePolicy {
    pub min_frame_gap: usize,
    pub tracked_ratio_threshold: f64,
    pub structure_need_ratio: f64,
    pub max_queue_depth: usize,
}

impl KeyFramePolicy {
    pub fn from_config(config: &SlamConfig) -> Self {
        Self {
            min_frame_gap: config.min_keyframe_gap,
            tracked_ratio_threshold: config.tracked_ratio_threshold,
            structure_need_ratio: config.structure_need_ratio,
            max_queue_depth: config.max_queue_depth,
        }
    }

    /// Condition (a).
    pub fn gap_or_drop(&self, inputs: &KeyFrameInputs) -> bool {
        let gap = inputs.frames_since_keyframe >= self.min_frame_gap;
        let dropped = inputs.reference_tracked > 0
            && (inputs.tracked as f64) < self.tracked_ratio_threshold * inputs.reference_tracked as f64;
        gap || dropped
    }

    /// Condition (b).
    pub fn needs_structure(&self, inputs: &KeyFrameInputs) -> bool {
        inputs.tracked > 0 && inputs.weak_tracked as f64 / inputs.tracked as f64 > self.structure_need_ratio
    }

    /// Condition (c).
    pub fn queue_has_room(&self, inputs: &KeyFrameInputs) -> bool {
        inputs.queue_depth < self.max_queue_depth
    }

    pub fn evaluate(&self, inputs: &KeyFrameInputs) -> bool {
        self.gap_or_drop(inputs) && self.needs_structure(inputs) && self.queue_has_room(inputs)
    }
}

impl Default for KeyFramePolicy {
    fn default() -> Self {
        Self::from_config(&SlamConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_policy() -> KeyFramePolicy {
        KeyFramePolicy {
            min_frame_gap: 5,
            tracked_ratio_threshold: 0.9,
            structure_need_ratio: 0.1,
            max_queue_depth: 3,
        }
    }

    fn create_test_inputs() -> KeyFrameInputs {
        KeyFrameInputs {
            frames_since_keyframe: 6,
            tracked: 100,
            reference_tracked: 100,
            weak_tracked: 40,
            queue_depth: 0,
        }
    }

    #[test]
    fn test_all_conditions_hold() {
        assert!(create_test_policy().evaluate(&create_test_inputs()));
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let policy = create_test_policy();
        for inputs in [
            create_test_inputs(),
            KeyFrameInputs { frames_since_keyframe: 1, ..create_test_inputs() },
            KeyFrameInputs { queue_depth: 3, ..create_test_inputs() },
        ] {
            let first = policy.evaluate(&inputs);
            for _ in 0..5 {
                assert_eq!(policy.evaluate(&inputs), first);
            }
        }
    }

    #[test]
    fn test_tracking_drop_satisfies_gap_condition() {
        let policy = create_test_policy();
        let inputs = KeyFrameInputs {
            frames_since_keyframe: 1,
            tracked: 50,
            ..create_test_inputs()
        };
        assert!(policy.gap_or_drop(&inputs));
        assert!(policy.evaluate(&inputs));

        let steady = KeyFrameInputs { frames_since_keyframe: 1, ..create_test_inputs() };
        assert!(!policy.evaluate(&steady));
    }

    #[test]
    fn test_no_structure_need() {
        let policy = create_test_policy();
        let inputs = KeyFrameInputs { weak_tracked: 5, ..create_test_inputs() };
        assert!(!policy.evaluate(&inputs));
        let empty = KeyFrameInputs { tracked: 0, weak_tracked: 0, ..create_test_inputs() };
        assert!(!policy.evaluate(&empty));
    }

    #[test]
    fn test_saturated_queue_blocks_keyframe() {
        let policy = create_test_policy();
        let inputs = KeyFrameInputs { queue_depth: 4, ..create_test_inputs() };
        assert!(policy.gap_or_drop(&inputs));
        assert!(policy.needs_structure(&inputs));
        assert!(!policy.evaluate(&inputs));

        let at_bound = KeyFrameInputs { queue_depth: 3, ..create_test_inputs() };
        assert!(!policy.evaluate(&at_bound));
    }
}
