//! Linear build log: one record per executed, cached, or metadata step.

use std::fmt;

use berth_image::layer::LayerDescriptor;
use serde::{Deserialize, Serialize};

/// What a build step produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "layer", rename_all = "lowercase")]
pub enum StepOutcome {
    /// The step ran and committed a new layer.
    Executed(LayerDescriptor),
    /// The step was served from the step cache.
    Cached(LayerDescriptor),
    /// The step only changed image metadata.
    Metadata,
}

impl StepOutcome {
    /// Returns the layer the step contributed, if any.
    #[must_use]
    pub const fn layer(&self) -> Option<&LayerDescriptor> {
        match self {
            Self::Executed(layer) | Self::Cached(layer) => Some(layer),
            Self::Metadata => None,
        }
    }
}

/// One entry of the build log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// One-based position in the build.
    pub index: usize,
    /// Instruction text as recorded in the layer.
    pub instruction: String,
    /// What the step produced.
    pub outcome: StepOutcome,
}

impl fmt::Display for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step {} : {}", self.index, self.instruction)?;
        match &self.outcome {
            StepOutcome::Executed(layer) => write!(f, " ---> {}", layer.digest),
            StepOutcome::Cached(layer) => write!(f, " ---> {} (cached)", layer.digest),
            StepOutcome::Metadata => Ok(()),
        }
    }
}

/// Ordered record of every step of one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLog {
    records: Vec<StepRecord>,
}

impl BuildLog {
    /// Appends a record and returns its index.
    pub fn push(&mut self, instruction: impl Into<String>, outcome: StepOutcome) -> usize {
        let index = self.records.len() + 1;
        let record = StepRecord {
            index,
            instruction: instruction.into(),
            outcome,
        };
        tracing::info!(step = %record, "build step");
        self.records.push(record);
        index
    }

    /// Returns the records in execution order.
    #[must_use]
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// Returns how many layer steps were served from the cache.
    #[must_use]
    pub fn cached_steps(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::Cached(_)))
            .count()
    }
}
