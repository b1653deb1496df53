use std::fmt::{Debug, Display, Formatter};
use std::ops::Index;

use decorum::Total;
use indexmap::IndexMap;
use itertools::Itertools;
use ndarray::ArrayD;
use rand::random;
use thiserror::Error;

use crate::precision::PrecisionType;
use crate::quantizer::QuantizerConfig;
use crate::weight::{WeightEntry, WeightRole};

/// The layer graph of a quantized model.
///
/// Nodes live in an arena and are identified by [NodeId]s, which stay valid until that specific node is removed.
/// Inserting or removing other nodes never invalidates an id, so it is safe to iterate over a snapshot of
/// [Graph::node_ids] while mutating the graph, as long as removed ids are skipped.
///
/// Next to the arena the graph keeps the node order, which is always topological:
/// a node only comes after the producers of all of its inputs.
///
/// ```
/// # use hq_graph::graph::*;
/// # use hq_graph::precision::PrecisionType;
/// # use indexmap::IndexMap;
/// let mut graph = Graph::new();
/// let x = graph.input("x", vec![1, 4], PrecisionType::fixed(16, 6));
///
/// let node = graph.make_node(
///     LayerKind::Activation,
///     "relu",
///     IndexMap::new(),
///     vec![TensorRef::new(x, 0)],
///     vec![1, 4],
///     PrecisionType::fixed(16, 6),
/// );
/// let relu = graph.push_node(node).unwrap();
/// graph.output(TensorRef::new(relu, 0));
///
/// println!("{}", graph);
/// ```
#[derive(Clone)]
pub struct Graph {
    check: u32,
    nodes: Vec<Option<Node>>,
    order: Vec<NodeId>,
    outputs: Vec<TensorRef>,
}

/// A node in a [Graph].
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct NodeId {
    index: usize,
    check: u32,
}

/// A specific output of a node.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TensorRef {
    pub node: NodeId,
    pub output: usize,
}

/// The closed set of layer kinds.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LayerKind {
    Input,
    Dense,
    Conv1D,
    Conv2D,
    BatchNormalization,
    /// Re-applies a scale factor that was extracted from the weights of the layer in front of it.
    ApplyAlpha,
    Activation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(Total<f32>),
    Str(String),
    Precision(PrecisionType),
    Quantizer(QuantizerConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputVariable {
    pub name: String,
    pub shape: Vec<usize>,
    pub precision: PrecisionType,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: LayerKind,
    pub name: String,
    pub inputs: Vec<TensorRef>,
    pub outputs: Vec<OutputVariable>,
    pub weights: IndexMap<WeightRole, WeightEntry>,
    pub attrs: IndexMap<String, AttrValue>,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("node {0:?} is not part of the graph")]
    UnknownNode(NodeId),
    #[error("input {input:?} of node `{node}` does not refer to an existing output")]
    DetachedInput { node: String, input: TensorRef },
    #[error("node `{0}` has {1} inputs, expected exactly one")]
    NotSingleInput(String, usize),
    #[error("node `{0}` has no output")]
    MissingOutput(String),
    #[error("node `{0}` cannot be removed without rewiring, its outputs are still used")]
    StillConsumed(String),
    #[error("node `{node}` already has a `{role}` weight")]
    DuplicateWeight { node: String, role: WeightRole },
    #[error("node `{node}` has no `{role}` weight")]
    MissingWeight { node: String, role: WeightRole },
}

pub type GraphResult<T> = Result<T, GraphError>;

impl LayerKind {
    pub const ALL: &'static [Self] = &[
        LayerKind::Input,
        LayerKind::Dense,
        LayerKind::Conv1D,
        LayerKind::Conv2D,
        LayerKind::BatchNormalization,
        LayerKind::ApplyAlpha,
        LayerKind::Activation,
    ];

    /// The class name, which is what layer selections in configurations refer to.
    pub fn name(self) -> &'static str {
        match self {
            LayerKind::Input => "Input",
            LayerKind::Dense => "Dense",
            LayerKind::Conv1D => "Conv1D",
            LayerKind::Conv2D => "Conv2D",
            LayerKind::BatchNormalization => "BatchNormalization",
            LayerKind::ApplyAlpha => "ApplyAlpha",
            LayerKind::Activation => "Activation",
        }
    }

    /// Whether the layer multiplies its input with a weight tensor.
    pub fn has_weighted_inputs(self) -> bool {
        match self {
            LayerKind::Dense | LayerKind::Conv1D | LayerKind::Conv2D => true,
            LayerKind::Input | LayerKind::BatchNormalization | LayerKind::ApplyAlpha | LayerKind::Activation => false,
        }
    }

    /// Whether the layer computes `scale * x + bias` per channel.
    pub fn is_affine(self) -> bool {
        match self {
            LayerKind::BatchNormalization | LayerKind::ApplyAlpha => true,
            LayerKind::Input | LayerKind::Dense | LayerKind::Conv1D | LayerKind::Conv2D | LayerKind::Activation => {
                false
            }
        }
    }
}

impl AttrValue {
    pub fn float(value: f32) -> Self {
        AttrValue::Float(Total::from_inner(value))
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            AttrValue::Int(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_precision(&self) -> Option<&PrecisionType> {
        match self {
            AttrValue::Precision(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_quantizer(&self) -> Option<&QuantizerConfig> {
        match self {
            AttrValue::Quantizer(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_quantizer_mut(&mut self) -> Option<&mut QuantizerConfig> {
        match self {
            AttrValue::Quantizer(value) => Some(value),
            _ => None,
        }
    }
}

impl TensorRef {
    pub fn new(node: NodeId, output: usize) -> Self {
        TensorRef { node, output }
    }
}

impl Node {
    pub fn new(kind: LayerKind, name: impl Into<String>) -> Self {
        Node {
            kind,
            name: name.into(),
            inputs: vec![],
            outputs: vec![],
            weights: IndexMap::new(),
            attrs: IndexMap::new(),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    pub fn weight(&self, role: WeightRole) -> Option<&WeightEntry> {
        self.weights.get(&role)
    }

    pub fn with_weight(mut self, role: WeightRole, entry: WeightEntry) -> Self {
        self.weights.insert(role, entry);
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

impl Index<NodeId> for Graph {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Self::Output {
        match self.get(id) {
            Some(node) => node,
            None => panic!("Node {:?} has been removed from the graph", id),
        }
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            check: random(),
            nodes: vec![],
            order: vec![],
            outputs: vec![],
        }
    }

    fn check_contains(&self, id: NodeId) {
        assert_eq!(id.check, self.check, "Node {:?} does not belong to this graph", id);
        assert!(id.index < self.nodes.len());
    }

    /// The node with the given id, `None` if it has been removed.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.check_contains(id);
        self.nodes[id.index].as_ref()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn node(&self, id: NodeId) -> GraphResult<&Node> {
        self.get(id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> GraphResult<&mut Node> {
        self.check_contains(id);
        self.nodes[id.index].as_mut().ok_or(GraphError::UnknownNode(id))
    }

    /// Snapshot of the current node order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.order.clone()
    }

    /// Iterate over the nodes in graph order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.order.iter().map(move |&id| (id, &self[id]))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes().find(|(_, node)| node.name == name).map(|(id, _)| id)
    }

    pub fn inputs(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, node)| node.kind == LayerKind::Input)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn outputs(&self) -> &[TensorRef] {
        &self.outputs
    }

    /// Mark `tensor` as an output of the graph.
    pub fn output(&mut self, tensor: TensorRef) {
        assert!(self.check_tensor(tensor), "Tensor {:?} does not exist", tensor);
        self.outputs.push(tensor);
    }

    pub fn is_output(&self, tensor: TensorRef) -> bool {
        self.outputs.contains(&tensor)
    }

    fn check_tensor(&self, tensor: TensorRef) -> bool {
        tensor.node.check == self.check
            && tensor.node.index < self.nodes.len()
            && self.nodes[tensor.node.index]
                .as_ref()
                .map_or(false, |node| tensor.output < node.outputs.len())
    }

    pub fn tensor(&self, tensor: TensorRef) -> &OutputVariable {
        &self[tensor.node].outputs[tensor.output]
    }

    /// All nodes that use `tensor` as an input, in graph order.
    pub fn consumers(&self, tensor: TensorRef) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, node)| node.inputs.contains(&tensor))
            .map(|(id, _)| id)
            .collect()
    }

    /// The producer of the single input of `id`, `None` if the node does not have exactly one input.
    pub fn input_node(&self, id: NodeId) -> Option<NodeId> {
        match self.get(id)?.inputs.as_slice() {
            &[input] => Some(input.node),
            _ => None,
        }
    }

    /// Declare a new input node.
    pub fn input(&mut self, name: impl Into<String>, shape: Vec<usize>, precision: PrecisionType) -> NodeId {
        let name = name.into();
        let mut node = Node::new(LayerKind::Input, name.clone());
        node.outputs.push(OutputVariable { name, shape, precision });

        let id = self.alloc(node);
        self.order.push(id);
        id
    }

    /// Build a detached node with a single output, ready to be passed to [Graph::push_node] or [Graph::insert_node].
    pub fn make_node(
        &self,
        kind: LayerKind,
        name: impl Into<String>,
        attrs: IndexMap<String, AttrValue>,
        inputs: Vec<TensorRef>,
        output_shape: Vec<usize>,
        precision: PrecisionType,
    ) -> Node {
        let name = name.into();
        let output = OutputVariable {
            name: name.clone(),
            shape: output_shape,
            precision,
        };

        Node {
            kind,
            name,
            inputs,
            outputs: vec![output],
            weights: IndexMap::new(),
            attrs,
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId {
            index: self.nodes.len(),
            check: self.check,
        };
        self.nodes.push(Some(node));
        id
    }

    fn validate_new(&self, node: &Node) -> GraphResult<()> {
        if node.outputs.is_empty() {
            return Err(GraphError::MissingOutput(node.name.clone()));
        }
        for &input in &node.inputs {
            if !self.check_tensor(input) {
                return Err(GraphError::DetachedInput {
                    node: node.name.clone(),
                    input,
                });
            }
        }
        Ok(())
    }

    /// Append a node at the end of the graph order.
    pub fn push_node(&mut self, node: Node) -> GraphResult<NodeId> {
        self.validate_new(&node)?;
        let id = self.alloc(node);
        self.order.push(id);
        Ok(id)
    }

    /// Insert a node directly behind the producer of its first input.
    ///
    /// All other consumers of that input, including the graph outputs, are rewired to use output 0 of the new node.
    pub fn insert_node(&mut self, node: Node) -> GraphResult<NodeId> {
        self.validate_new(&node)?;
        let anchor = match node.inputs.first() {
            Some(&anchor) => anchor,
            None => return Err(GraphError::NotSingleInput(node.name.clone(), 0)),
        };

        let consumers = self.consumers(anchor);

        let id = self.alloc(node);
        let position = self.position(anchor.node) + 1;
        self.order.insert(position, id);

        let replacement = TensorRef::new(id, 0);
        for consumer in consumers {
            self.replace_input(consumer, anchor, replacement);
        }
        self.replace_output(anchor, replacement);

        Ok(id)
    }

    /// Remove a node from the graph.
    ///
    /// With `rewire`, the node must have exactly one input, and every use of any of its outputs is replaced by that input.
    /// Without `rewire`, the outputs of the node must not be used any more.
    pub fn remove_node(&mut self, id: NodeId, rewire: bool) -> GraphResult<()> {
        let node = self.node(id)?;
        let outputs = (0..node.outputs.len()).map(|i| TensorRef::new(id, i)).collect_vec();

        if rewire {
            let replacement = match node.inputs.as_slice() {
                &[input] => input,
                inputs => return Err(GraphError::NotSingleInput(node.name.clone(), inputs.len())),
            };

            for &output in &outputs {
                for consumer in self.consumers(output) {
                    self.replace_input(consumer, output, replacement);
                }
                self.replace_output(output, replacement);
            }
        } else {
            let used = outputs
                .iter()
                .any(|&output| self.is_output(output) || !self.consumers(output).is_empty());
            if used {
                return Err(GraphError::StillConsumed(node.name.clone()));
            }
        }

        let position = self.position(id);
        self.order.remove(position);
        self.nodes[id.index] = None;

        Ok(())
    }

    fn position(&self, id: NodeId) -> usize {
        match self.order.iter().position(|&cand| cand == id) {
            Some(position) => position,
            None => panic!("Node {:?} is missing from the graph order", id),
        }
    }

    fn replace_input(&mut self, consumer: NodeId, old: TensorRef, new: TensorRef) {
        if let Some(node) = self.nodes[consumer.index].as_mut() {
            for input in node.inputs.iter_mut().filter(|input| **input == old) {
                *input = new;
            }
        }
    }

    fn replace_output(&mut self, old: TensorRef, new: TensorRef) {
        for output in self.outputs.iter_mut().filter(|output| **output == old) {
            *output = new;
        }
    }

    /// The precision of output 0 of `id`.
    pub fn output_precision(&self, id: NodeId) -> GraphResult<&PrecisionType> {
        let node = self.node(id)?;
        node.outputs
            .first()
            .map(|output| &output.precision)
            .ok_or_else(|| GraphError::MissingOutput(node.name.clone()))
    }

    pub fn set_output_precision(&mut self, id: NodeId, precision: PrecisionType) -> GraphResult<()> {
        let node = self.node_mut(id)?;
        match node.outputs.first_mut() {
            Some(output) => {
                output.precision = precision;
                Ok(())
            }
            None => Err(GraphError::MissingOutput(node.name.clone())),
        }
    }

    pub fn attr(&self, id: NodeId, key: &str) -> Option<&AttrValue> {
        self.get(id)?.attrs.get(key)
    }

    pub fn set_attr(&mut self, id: NodeId, key: impl Into<String>, value: AttrValue) -> GraphResult<()> {
        self.node_mut(id)?.attrs.insert(key.into(), value);
        Ok(())
    }

    pub fn weight(&self, id: NodeId, role: WeightRole) -> GraphResult<&WeightEntry> {
        let node = self.node(id)?;
        node.weights.get(&role).ok_or_else(|| GraphError::MissingWeight {
            node: node.name.clone(),
            role,
        })
    }

    pub fn weight_mut(&mut self, id: NodeId, role: WeightRole) -> GraphResult<&mut WeightEntry> {
        let node = self.node_mut(id)?;
        let name = &node.name;
        node.weights.get_mut(&role).ok_or_else(|| GraphError::MissingWeight {
            node: name.clone(),
            role,
        })
    }

    /// Replace the data of an existing weight, leaving its quantizer untouched.
    pub fn set_weight(&mut self, id: NodeId, role: WeightRole, data: ArrayD<f32>) -> GraphResult<()> {
        self.weight_mut(id, role)?.data = data;
        Ok(())
    }

    pub fn add_weight(&mut self, id: NodeId, role: WeightRole, entry: WeightEntry) -> GraphResult<()> {
        let node = self.node_mut(id)?;
        if node.weights.contains_key(&role) {
            return Err(GraphError::DuplicateWeight {
                node: node.name.clone(),
                role,
            });
        }
        node.weights.insert(role, entry);
        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

impl NodeId {
    pub fn index(self) -> usize {
        self.index
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let NodeId { index, check } = self;
        if f.alternate() {
            write!(f, "NodeId {{ index: {}, check: {} }}", index, check)
        } else {
            write!(f, "NodeId({})", index)
        }
    }
}

impl Debug for Graph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("check", &self.check)
            .field("nodes", &self.len())
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl Display for LayerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Display for Graph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Graph {{")?;
        writeln!(f, "  check: {},", self.check)?;
        writeln!(f, "  outputs: {:?},", self.outputs)?;
        writeln!(f, "  nodes: [")?;

        for (id, node) in self.nodes() {
            let inputs = node.inputs.iter().map(|i| format!("{:?}.{}", i.node, i.output)).join(", ");
            let outputs = node
                .outputs
                .iter()
                .map(|o| format!("{:?}: {}", o.shape, o.precision))
                .join(", ");
            let weights = node.weights.keys().join(", ");

            writeln!(
                f,
                "    {:?} = {} `{}` ({}) -> [{}] weights: [{}],",
                id, node.kind, node.name, inputs, outputs, weights
            )?;
        }

        writeln!(f, "  ],")?;
        writeln!(f, "}}")?;

        Ok(())
    }
}
