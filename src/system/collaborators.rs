//! The pluggable capabilities the pipeline calls into.

use std::sync::Arc;

use crate::matcher::{Matcher, OrbMatcher};
use crate::optimizer::{LmOptimizer, Optimizer};
use crate::vocabulary::Vocabulary;

/// Matcher, optimizer and vocabulary shared by Tracking and LocalMapping.
#[derive(Clone)]
pub struct Collaborators {
    pub matcher: Arc<dyn Matcher>,
    pub optimizer: Arc<dyn Optimizer>,
    pub vocabulary: Arc<dyn Vocabulary>,
}

impl Collaborators {
    pub fn new(matcher: Arc<dyn Matcher>, optimizer: Arc<dyn Optimizer>, vocabulary: Arc<dyn Vocabulary>) -> Self {
        Self {
            matcher,
            optimizer,
            vocabulary,
        }
    }

    /// Default ORB matcher and LM optimizer around the given vocabulary.
    pub fn with_vocabulary(vocabulary: Arc<dyn Vocabulary>, optimizer: LmOptimizer) -> Self {
        Self::new(Arc::new(OrbMatcher::new()), Arc::new(optimizer), vocabulary)
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
