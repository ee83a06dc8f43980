//! Operator dispatch
//!
//! An [`ApplyContext`] packages one operator application: the operator, its
//! ordered inputs and the union of their flags. [`Dispatcher::apply`] routes
//! it to a flag handler, the interpreter or the graph builder and wraps the
//! backend's raw results into new tensors carrying the merged flags.

pub mod context;
pub mod handler;

pub use context::{
    ambient_flags, disabled, is_compiled, is_tracing, ScopedCompiled, ScopedDisable, ScopedTracing,
};
pub use handler::FlagHandler;

use std::fmt;
use std::sync::Arc;

use crate::{
    config::DispatchConfig,
    error::{ErrorContext, IngotError, IngotResult, WithContext},
    graph::GraphBuilder,
    interpreter::Interpreter,
    ops::{check_inputs, OpDef},
    tensor::{Backing, Flags, SharedHandle, Tensor, TensorLayout},
};

pub type ApplyResult = Vec<Tensor>;

/// Front-end type the caller wants results wrapped as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeHint(pub String);

pub struct ApplyContext<'a> {
    pub flags: Flags,
    pub op: Arc<dyn OpDef>,
    pub args: Vec<&'a Tensor>,
    pub type_hint: Option<TypeHint>,
    pub backward: bool,
}

impl<'a> ApplyContext<'a> {
    /// Merge the inputs' flags, plus TRACE when tracing mode is on
    pub fn new<I>(op: Arc<dyn OpDef>, args: I) -> Self
    where
        I: IntoIterator<Item = &'a Tensor>,
    {
        let args = args.into_iter().collect::<Vec<_>>();
        let flags = args.iter().fold(ambient_flags(), |flags, arg| flags | arg.flags());
        Self {
            flags,
            op,
            args,
            type_hint: None,
            backward: false,
        }
    }

    pub fn with_type_hint(mut self, hint: &str) -> Self {
        self.type_hint = Some(TypeHint(hint.to_string()));
        self
    }

    /// Mark the request as issued from a var's backward pass
    pub fn backward(mut self) -> Self {
        self.backward = true;
        self
    }

    pub fn nargs(&self) -> usize {
        self.args.len()
    }
}

impl fmt::Debug for ApplyContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyContext")
            .field("op", &self.op.name())
            .field("nargs", &self.args.len())
            .field("flags", &self.flags)
            .field("type_hint", &self.type_hint)
            .field("backward", &self.backward)
            .finish()
    }
}

/// Backend a request ends up on once no flag handler claims it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Eager,
    Graph,
    Backward,
}

impl Route {
    pub fn select(ctx: &ApplyContext<'_>) -> Route {
        if ctx.backward {
            Route::Backward
        } else if ctx.args.iter().any(|arg| matches!(arg.backing(), Backing::Var(_))) {
            Route::Graph
        } else {
            Route::Eager
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Eager => "eager",
            Route::Graph => "graph",
            Route::Backward => "backward",
        }
    }
}

pub struct Dispatcher {
    interpreter: Arc<dyn Interpreter>,
    graph: Option<Arc<dyn GraphBuilder>>,
    handlers: Vec<Arc<dyn FlagHandler>>,
    compiled: Option<Arc<dyn FlagHandler>>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(interpreter: Arc<dyn Interpreter>) -> Self {
        Self {
            interpreter,
            graph: None,
            handlers: Vec::new(),
            compiled: None,
            config: DispatchConfig::default(),
        }
    }

    pub fn with_graph(mut self, graph: Arc<dyn GraphBuilder>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Handlers are consulted in registration order
    pub fn with_handler(mut self, handler: Arc<dyn FlagHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Handler that replays a compiled trace while compiled mode is on
    pub fn with_compiled_handler(mut self, handler: Arc<dyn FlagHandler>) -> Self {
        self.compiled = Some(handler);
        self
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn interpreter(&self) -> &Arc<dyn Interpreter> {
        &self.interpreter
    }

    pub fn graph(&self) -> Option<&Arc<dyn GraphBuilder>> {
        self.graph.as_ref()
    }

    /// Allocate a fresh handle-backed tensor
    pub fn put(&self, layout: TensorLayout) -> IngotResult<Tensor> {
        let raw = self.interpreter.put(layout)?;
        Ok(Tensor::from_raw(raw, self.interpreter.clone()))
    }

    pub fn apply_op<'a, I>(&self, op: Arc<dyn OpDef>, args: I) -> IngotResult<ApplyResult>
    where
        I: IntoIterator<Item = &'a Tensor>,
    {
        self.apply(&ApplyContext::new(op, args))
    }

    pub fn apply(&self, ctx: &ApplyContext<'_>) -> IngotResult<ApplyResult> {
        check_inputs(ctx.op.as_ref(), ctx.nargs())?;

        let effective = ctx.flags.difference(disabled());

        if !ctx.backward {
            if let Some(handler) = self.select_handler(ctx, effective)? {
                tracing::trace!(op = ctx.op.name(), handler = handler.name(), "flag handler");
                return handler.apply(self, ctx);
            }
        }

        let route = Route::select(ctx);
        tracing::debug!(
            op = ctx.op.name(),
            nargs = ctx.nargs(),
            route = route.as_str(),
            flags = ?ctx.flags,
            "dispatch"
        );

        let mut outputs = match route {
            Route::Eager => self.apply_eager(ctx),
            Route::Graph | Route::Backward => self.apply_graph(ctx, route),
        }
        .with_context(|| ErrorContext::new(ctx.op.name()).with_route(route.as_str()))?;

        for output in &mut outputs {
            output.set_flags(ctx.flags);
        }
        Ok(outputs)
    }

    /// Traced requests in compiled mode go to the compiled handler; anything
    /// else goes to the first handler whose flag survives the disable mask
    fn select_handler(
        &self,
        ctx: &ApplyContext<'_>,
        effective: Flags,
    ) -> IngotResult<Option<&Arc<dyn FlagHandler>>> {
        if is_compiled() && effective.contains(Flags::TRACE) {
            return self.compiled.as_ref().map(Some).ok_or_else(|| {
                IngotError::backend(
                    "dispatcher",
                    format!("{} reached compiled mode with no compiled handler registered", ctx.op.name()),
                )
            });
        }
        Ok(self.handlers.iter().find(|h| effective.intersects(h.flag())))
    }

    fn apply_eager(&self, ctx: &ApplyContext<'_>) -> IngotResult<ApplyResult> {
        let mut handles = Vec::with_capacity(ctx.nargs());
        for (i, arg) in ctx.args.iter().enumerate() {
            match arg.backing() {
                Backing::Handle(handle) if !handle.is_null() => {
                    self.check_owner(handle)?;
                    handles.push(handle);
                }
                Backing::Var(_) => {
                    return Err(IngotError::MixedRepresentation(format!(
                        "input {} of {} is var-backed on the eager route",
                        i,
                        ctx.op.name()
                    )))
                }
                Backing::Handle(_) | Backing::Unresolved => return Err(unresolved_input(ctx, i)),
            }
        }

        if self.config.fastpath_copy && ctx.op.is_fastpath_copy() {
            return Ok(handles
                .into_iter()
                .map(|handle| Tensor::from_handle(handle.clone()))
                .collect());
        }

        let raw = handles.iter().map(|handle| handle.get()).collect::<Vec<_>>();
        let produced = self
            .interpreter
            .apply_op(&ctx.op, &raw)
            .map_err(|e| into_backend_error(self.interpreter.name(), e))?;

        // wrap first so an early return below releases every handle
        let outputs = produced
            .into_iter()
            .map(|raw| Tensor::from_raw(raw, self.interpreter.clone()))
            .collect::<Vec<_>>();
        self.check_output_count(ctx, Route::Eager, outputs.len())?;
        Ok(outputs)
    }

    fn apply_graph(&self, ctx: &ApplyContext<'_>, route: Route) -> IngotResult<ApplyResult> {
        let graph = self.graph.as_ref().ok_or_else(|| {
            IngotError::backend("dispatcher", format!("no graph builder registered for the {} route", route.as_str()))
        })?;

        // validate every input before the graph sees any of them
        for (i, arg) in ctx.args.iter().enumerate() {
            match arg.backing() {
                Backing::Var(_) => {}
                Backing::Handle(handle) if !handle.is_null() => self.check_owner(handle)?,
                Backing::Handle(_) | Backing::Unresolved => return Err(unresolved_input(ctx, i)),
            }
        }

        let mut imported = Vec::new();
        let mut vars = Vec::with_capacity(ctx.nargs());
        for arg in &ctx.args {
            match arg.backing() {
                Backing::Var(var) => vars.push(var.clone()),
                Backing::Handle(handle) => match graph.import_handle(handle) {
                    Ok(var) => {
                        imported.push(var.clone());
                        vars.push(var);
                    }
                    Err(e) => {
                        graph.discard(&imported);
                        return Err(e);
                    }
                },
                Backing::Unresolved => {}
            }
        }

        let built = match route {
            Route::Backward => graph.apply_backward(ctx.op.as_ref(), &vars),
            _ => graph.apply_op(ctx.op.as_ref(), &vars),
        };
        let produced = match built {
            Ok(produced) => produced,
            Err(e) => {
                graph.discard(&imported);
                return Err(into_backend_error(graph.name(), e));
            }
        };

        if let Err(e) = self.check_output_count(ctx, route, produced.len()) {
            imported.extend(produced);
            graph.discard(&imported);
            return Err(e);
        }
        Ok(produced.into_iter().map(Tensor::from_var).collect())
    }

    fn check_output_count(&self, ctx: &ApplyContext<'_>, route: Route, produced: usize) -> IngotResult<()> {
        let declared = ctx.op.num_outputs(ctx.nargs());
        if self.config.check_output_arity && produced != declared {
            return Err(IngotError::backend(
                route.as_str(),
                format!("{} returned {} results, declared {}", ctx.op.name(), produced, declared),
            ));
        }
        Ok(())
    }

    fn check_owner(&self, handle: &SharedHandle) -> IngotResult<()> {
        let issued_here = handle
            .interpreter()
            .map_or(false, |owner| same_interpreter(owner, &self.interpreter));
        if issued_here {
            Ok(())
        } else {
            Err(IngotError::backend(
                self.interpreter.name(),
                format!("handle {} was issued by another interpreter", handle.get()),
            ))
        }
    }

    /// Block until the interpreter has finished everything queued so far
    pub fn sync(&self) -> IngotResult<()> {
        self.interpreter.sync()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("interpreter", &self.interpreter.name())
            .field("graph", &self.graph.as_ref().map(|g| g.name().to_string()))
            .field("handlers", &self.handlers.iter().map(|h| h.name().to_string()).collect::<Vec<_>>())
            .field("compiled", &self.compiled.as_ref().map(|h| h.name().to_string()))
            .field("config", &self.config)
            .finish()
    }
}

fn same_interpreter(a: &Arc<dyn Interpreter>, b: &Arc<dyn Interpreter>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn unresolved_input(ctx: &ApplyContext<'_>, index: usize) -> IngotError {
    IngotError::UnresolvedTensor(format!("input {} of {} has no handle or var", index, ctx.op.name()))
}

/// Backend failures keep their own report; anything else a backend returns
/// is wrapped so callers see a single failure kind
fn into_backend_error(backend: &str, err: IngotError) -> IngotError {
    match err {
        e @ IngotError::BackendDispatch { .. } => e,
        other => IngotError::backend(backend, other.to_string()),
    }
}
