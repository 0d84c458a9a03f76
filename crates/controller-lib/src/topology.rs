//! Pipeline topology descriptor
//!
//! A topology is one source stage feeding a tree (or chain) of processing
//! stages. The descriptor validates the graph and enumerates the
//! source-to-leaf paths the latency projection walks.

use crate::error::{AllocError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Supported topology shapes
///
/// Only single-source pipelines are modeled; additional shapes would need
/// their own network construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TopologyShape {
    #[default]
    SingleSource,
}

/// One stage and its downstream edges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: String,
    #[serde(default)]
    pub downstream: Vec<String>,
}

impl StageSpec {
    pub fn new(id: impl Into<String>, downstream: &[&str]) -> Self {
        Self {
            id: id.into(),
            downstream: downstream.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Topology as supplied by configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySpec {
    #[serde(default)]
    pub shape: TopologyShape,
    pub sources: Vec<StageSpec>,
    pub stages: Vec<StageSpec>,
}

/// Validated topology
#[derive(Debug, Clone)]
pub struct Topology {
    shape: TopologyShape,
    source: String,
    edges: BTreeMap<String, Vec<String>>,
    processing: BTreeSet<String>,
    paths: Vec<Vec<String>>,
}

impl Topology {
    /// Build a single-source topology from a spec, validating its structure
    pub fn from_spec(spec: &TopologySpec) -> Result<Self> {
        match spec.shape {
            TopologyShape::SingleSource => Self::single_source(spec),
        }
    }

    /// Convenience constructor for a linear pipeline `source -> stages[0] -> stages[1] ...`
    pub fn chain(source: &str, stages: &[&str]) -> Result<Self> {
        let mut specs = Vec::with_capacity(stages.len());
        for (i, id) in stages.iter().enumerate() {
            let next: Vec<&str> = stages.get(i + 1).into_iter().copied().collect();
            specs.push(StageSpec::new(*id, &next));
        }
        let first: Vec<&str> = stages.first().into_iter().copied().collect();
        Self::from_spec(&TopologySpec {
            shape: TopologyShape::SingleSource,
            sources: vec![StageSpec::new(source, &first)],
            stages: specs,
        })
    }

    fn single_source(spec: &TopologySpec) -> Result<Self> {
        let source = match spec.sources.as_slice() {
            [only] => only,
            [] => {
                return Err(AllocError::InvalidTopology(
                    "topology has no source stage".to_string(),
                ))
            }
            many => {
                return Err(AllocError::UnsupportedTopology(format!(
                    "{} source stages; only a single source is modeled",
                    many.len()
                )))
            }
        };
        if source.id.is_empty() {
            return Err(AllocError::InvalidTopology("empty source id".to_string()));
        }
        if spec.stages.is_empty() {
            return Err(AllocError::InvalidTopology(
                "topology has no processing stages".to_string(),
            ));
        }

        let mut processing = BTreeSet::new();
        for stage in &spec.stages {
            if stage.id.is_empty() {
                return Err(AllocError::InvalidTopology("empty stage id".to_string()));
            }
            if stage.id == source.id || !processing.insert(stage.id.clone()) {
                return Err(AllocError::InvalidTopology(format!(
                    "duplicate stage id '{}'",
                    stage.id
                )));
            }
        }

        let mut edges = BTreeMap::new();
        for stage in std::iter::once(source).chain(spec.stages.iter()) {
            for target in &stage.downstream {
                if !processing.contains(target) {
                    return Err(AllocError::InvalidTopology(format!(
                        "stage '{}' feeds unknown processing stage '{}'",
                        stage.id, target
                    )));
                }
            }
            edges.insert(stage.id.clone(), stage.downstream.clone());
        }

        let mut topology = Self {
            shape: TopologyShape::SingleSource,
            source: source.id.clone(),
            edges,
            processing,
            paths: Vec::new(),
        };
        topology.paths = topology.enumerate_paths()?;

        let reached: BTreeSet<&String> = topology.paths.iter().flatten().collect();
        if let Some(orphan) = topology.processing.iter().find(|id| !reached.contains(id)) {
            return Err(AllocError::InvalidTopology(format!(
                "stage '{}' is not reachable from source '{}'",
                orphan, topology.source
            )));
        }
        Ok(topology)
    }

    /// Depth-first walk from the source collecting every path to a leaf
    fn enumerate_paths(&self) -> Result<Vec<Vec<String>>> {
        let mut paths = Vec::new();
        let mut trail: Vec<String> = Vec::new();
        self.walk(&self.source, &mut trail, &mut paths)?;
        Ok(paths)
    }

    fn walk(
        &self,
        node: &str,
        trail: &mut Vec<String>,
        paths: &mut Vec<Vec<String>>,
    ) -> Result<()> {
        if trail.iter().any(|seen| seen == node) {
            return Err(AllocError::InvalidTopology(format!(
                "cycle through stage '{}'",
                node
            )));
        }
        let downstream = self.edges.get(node).map(Vec::as_slice).unwrap_or_default();
        let is_source = node == self.source;
        if !is_source {
            trail.push(node.to_string());
        }
        if downstream.is_empty() {
            if !trail.is_empty() {
                paths.push(trail.clone());
            }
        } else {
            for next in downstream {
                self.walk(next, trail, paths)?;
            }
        }
        if !is_source {
            trail.pop();
        }
        Ok(())
    }

    pub fn shape(&self) -> TopologyShape {
        self.shape
    }

    /// The single source stage
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Processing stages in identifier order
    pub fn processing_stages(&self) -> impl Iterator<Item = &str> {
        self.processing.iter().map(String::as_str)
    }

    pub fn is_processing(&self, id: &str) -> bool {
        self.processing.contains(id)
    }

    /// True for the source and every processing stage
    pub fn contains(&self, id: &str) -> bool {
        id == self.source || self.processing.contains(id)
    }

    /// All stages, source first
    pub fn all_stages(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.source.as_str()).chain(self.processing_stages())
    }

    pub fn stage_count(&self) -> usize {
        self.processing.len() + 1
    }

    /// Source-to-leaf paths over processing stages (source excluded)
    pub fn paths(&self) -> &[Vec<String>] {
        &self.paths
    }
}
