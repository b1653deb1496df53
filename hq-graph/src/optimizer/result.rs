use crate::graph::GraphError;
use crate::precision::PrecisionError;

pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// A fatal error inside a pass. The optimization session stops and the graph must not be used for code generation.
#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("node `{node}` has an output precision that cannot be rewritten")]
    PrecisionMismatch {
        node: String,
        #[source]
        source: PrecisionError,
    },

    #[error("node `{node}` is missing the {what} needed to factorize its scale")]
    MissingQuantizerData { node: String, what: &'static str },

    #[error("node `{node}`: cannot broadcast {left:?} with {right:?}")]
    ShapeMismatch {
        node: String,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),
}
