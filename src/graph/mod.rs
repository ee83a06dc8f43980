//! Symbolic graph construction
//!
//! Variable-backed tensors hold a [`VarRef`] into a graph instead of a live
//! handle. Their shape, dtype and device resolve from the node itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    error::{IngotError, IngotResult},
    ops::{check_inputs, OpDef},
    tensor::{handle::SharedHandle, DType, Device, Shape, TensorLayout},
};

pub type VarId = usize;

static GRAPH_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A node in a computing graph
pub struct VarNode {
    id: VarId,
    graph: usize,
    name: Option<String>,
    layout: TensorLayout,
    owner_op: Option<String>,
    inputs: Vec<VarId>,
    backward: bool,
    captured: Option<SharedHandle>,
}

/// Shared reference to a [`VarNode`]
#[derive(Clone)]
pub struct VarRef(Arc<VarNode>);

impl VarRef {
    pub fn id(&self) -> VarId {
        self.0.id
    }

    pub fn graph_id(&self) -> usize {
        self.0.graph
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn layout(&self) -> &TensorLayout {
        &self.0.layout
    }

    pub fn shape(&self) -> &Shape {
        &self.0.layout.shape
    }

    pub fn dtype(&self) -> DType {
        self.0.layout.dtype
    }

    pub fn device(&self) -> Device {
        self.0.layout.device
    }

    /// Name of the operator that produced this var, `None` for graph inputs
    pub fn owner_op(&self) -> Option<&str> {
        self.0.owner_op.as_deref()
    }

    pub fn inputs(&self) -> &[VarId] {
        &self.0.inputs
    }

    pub fn is_backward(&self) -> bool {
        self.0.backward
    }

    /// Handle kept alive by an imported constant
    pub fn captured_handle(&self) -> Option<&SharedHandle> {
        self.0.captured.as_ref()
    }

    pub fn ptr_eq(&self, other: &VarRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VarRef")
            .field("id", &self.0.id)
            .field("graph", &self.0.graph)
            .field("layout", &self.0.layout)
            .field("owner_op", &self.0.owner_op)
            .finish()
    }
}

/// Graph-construction collaborator consumed by the dispatcher
pub trait GraphBuilder: Send + Sync {
    fn name(&self) -> &str;

    /// Insert `op` over `inputs` and return its output vars in declared order
    fn apply_op(&self, op: &dyn OpDef, inputs: &[VarRef]) -> IngotResult<Vec<VarRef>>;

    /// Same as [`GraphBuilder::apply_op`] for requests issued while building
    /// the backward pass of a var
    fn apply_backward(&self, op: &dyn OpDef, inputs: &[VarRef]) -> IngotResult<Vec<VarRef>> {
        self.apply_op(op, inputs)
    }

    /// Turn a live handle into a graph constant, if this builder can
    fn import_handle(&self, handle: &SharedHandle) -> IngotResult<VarRef> {
        Err(IngotError::MixedRepresentation(format!(
            "graph builder '{}' cannot import handle {}",
            self.name(),
            handle.get()
        )))
    }

    /// Forget vars created for a request that failed part way
    fn discard(&self, _vars: &[VarRef]) {}
}

#[derive(Default)]
struct GraphState {
    next_id: VarId,
    nodes: HashMap<VarId, VarRef>,
}

/// In-memory graph builder that records every var it creates
pub struct ComputingGraph {
    id: usize,
    allow_handle_import: bool,
    state: Mutex<GraphState>,
}

impl ComputingGraph {
    pub fn new() -> Self {
        Self {
            id: GRAPH_COUNTER.fetch_add(1, Ordering::Relaxed),
            allow_handle_import: false,
            state: Mutex::new(GraphState::default()),
        }
    }

    /// Accept handle-backed inputs by capturing them as constants
    pub fn with_handle_import(mut self) -> Self {
        self.allow_handle_import = true;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Create a named graph input
    pub fn input(&self, name: &str, layout: TensorLayout) -> VarRef {
        self.insert(Some(name.to_string()), layout, None, Vec::new(), false, None)
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node(&self, id: VarId) -> Option<VarRef> {
        self.state.lock().nodes.get(&id).cloned()
    }

    fn insert(
        &self,
        name: Option<String>,
        layout: TensorLayout,
        owner_op: Option<String>,
        inputs: Vec<VarId>,
        backward: bool,
        captured: Option<SharedHandle>,
    ) -> VarRef {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let var = VarRef(Arc::new(VarNode {
            id,
            graph: self.id,
            name,
            layout,
            owner_op,
            inputs,
            backward,
            captured,
        }));
        state.nodes.insert(id, var.clone());
        var
    }

    fn build(&self, op: &dyn OpDef, inputs: &[VarRef], backward: bool) -> IngotResult<Vec<VarRef>> {
        check_inputs(op, inputs.len())?;

        if let Some(foreign) = inputs.iter().find(|var| var.graph_id() != self.id) {
            return Err(IngotError::backend(
                self.name(),
                format!("var {} belongs to graph {}, not {}", foreign.id(), foreign.graph_id(), self.id),
            ));
        }

        let layouts = inputs.iter().map(|var| var.layout().clone()).collect::<Vec<_>>();
        let outputs = op.infer_output_layouts(&layouts)?;
        let parents = inputs.iter().map(VarRef::id).collect::<Vec<_>>();

        Ok(outputs
            .into_iter()
            .map(|layout| {
                self.insert(None, layout, Some(op.name().to_string()), parents.clone(), backward, None)
            })
            .collect())
    }
}

impl Default for ComputingGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder for ComputingGraph {
    fn name(&self) -> &str {
        "computing-graph"
    }

    fn apply_op(&self, op: &dyn OpDef, inputs: &[VarRef]) -> IngotResult<Vec<VarRef>> {
        self.build(op, inputs, false)
    }

    fn apply_backward(&self, op: &dyn OpDef, inputs: &[VarRef]) -> IngotResult<Vec<VarRef>> {
        self.build(op, inputs, true)
    }

    fn import_handle(&self, handle: &SharedHandle) -> IngotResult<VarRef> {
        if !self.allow_handle_import {
            return Err(IngotError::MixedRepresentation(format!(
                "graph {} does not import live handles (got {})",
                self.id,
                handle.get()
            )));
        }

        let interpreter = handle.interpreter().ok_or_else(|| {
            IngotError::UnresolvedTensor("cannot import a null handle into a graph".to_string())
        })?;
        let layout = interpreter.layout(handle.get())?;

        Ok(self.insert(
            None,
            layout,
            Some("SharedDeviceTensor".to_string()),
            Vec::new(),
            false,
            Some(handle.clone()),
        ))
    }

    fn discard(&self, vars: &[VarRef]) {
        let mut state = self.state.lock();
        for var in vars.iter().filter(|var| var.graph_id() == self.id) {
            state.nodes.remove(&var.id());
        }
    }
}
