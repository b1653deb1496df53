use std::fmt::Debug;

use tracing::{debug, info, trace, warn};

use crate::graph::{Graph, NodeId};
use crate::optimizer::result::OptimizerResult;

/// A single graph rewrite rule.
pub trait OptimizerPass: Debug {
    fn name(&self) -> &str;

    /// Whether this pass wants to rewrite `node`.
    ///
    /// Must not have side effects or depend on the order in which nodes are visited.
    /// After a successful [OptimizerPass::transform] this must return `false` for the same node,
    /// otherwise the optimizer never reaches a fixpoint.
    fn matches(&self, graph: &Graph, node: NodeId) -> bool;

    /// Rewrite `node`, only called right after [OptimizerPass::matches] returned `true` for it.
    ///
    /// Returns whether the set of nodes or edges changed, in which case all previously collected ids are stale.
    fn transform(&self, graph: &mut Graph, node: NodeId) -> OptimizerResult<bool>;
}

/// Applies a list of passes to a graph until none of them matches any more.
#[derive(Debug)]
pub struct Optimizer {
    max_iterations: Option<usize>,
    passes: Vec<Box<dyn OptimizerPass>>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OptimizeReport {
    /// The number of (partial) scans over the graph, including restarts.
    /// This is the count compared against the iteration limit.
    pub scans: usize,
    /// The total number of transforms applied.
    pub transforms: usize,
    /// `false` if the iteration limit was hit before reaching a fixpoint.
    pub converged: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ScanResult {
    Fixpoint,
    Changed,
    Restart,
}

impl Optimizer {
    pub fn new(max_iterations: Option<usize>) -> Self {
        Optimizer {
            max_iterations,
            passes: vec![],
        }
    }

    /// Add a pass. Passes are tried in registration order.
    pub fn register(&mut self, pass: impl OptimizerPass + 'static) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|pass| pass.name()).collect()
    }

    /// Run all passes until a fixpoint is reached or the iteration limit is hit.
    ///
    /// Hitting the limit is not an error, the graph is left in its current (consistent) state.
    /// An error from any pass aborts the whole run.
    pub fn run(&self, graph: &mut Graph) -> OptimizerResult<OptimizeReport> {
        let mut report = OptimizeReport {
            scans: 0,
            transforms: 0,
            converged: false,
        };

        loop {
            if let Some(max_iterations) = self.max_iterations {
                if report.scans >= max_iterations {
                    warn!(
                        max_iterations,
                        transforms = report.transforms,
                        "optimizer hit the iteration limit before reaching a fixpoint, check the pass configuration"
                    );
                    return Ok(report);
                }
            }

            report.scans += 1;
            let result = self.scan(graph, &mut report)?;
            trace!(scan = report.scans, ?result, "finished scan");

            if result == ScanResult::Fixpoint {
                report.converged = true;
                info!(scans = report.scans, transforms = report.transforms, "optimizer reached a fixpoint");
                return Ok(report);
            }
        }
    }

    fn scan(&self, graph: &mut Graph, report: &mut OptimizeReport) -> OptimizerResult<ScanResult> {
        let mut changed = false;

        for id in graph.node_ids() {
            // only topology changes remove nodes, and those restart the scan
            debug_assert!(graph.contains(id));

            let pass = match self.passes.iter().find(|pass| pass.matches(graph, id)) {
                Some(pass) => pass,
                None => continue,
            };

            let name = graph[id].name.clone();
            let topology_changed = pass.transform(graph, id)?;

            report.transforms += 1;
            changed = true;
            debug!(pass = pass.name(), node = %name, topology_changed, "applied pass");

            if topology_changed {
                return Ok(ScanResult::Restart);
            }
        }

        Ok(if changed { ScanResult::Changed } else { ScanResult::Fixpoint })
    }
}
