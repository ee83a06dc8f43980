//! Command-channel interpreter
//!
//! Requests are queued to a dedicated worker thread and processed in FIFO
//! order. Everything except `release` blocks the caller on a oneshot reply;
//! `release` is fire-and-forget. Calls must come from outside an async
//! runtime, since the blocking receives would stall an executor thread.
//!
//! Shutdown: [`ChannelInterpreter::shutdown`] (or dropping the last
//! reference) drains the queue and joins the worker. Requests issued after
//! that fail with a backend error and `release` becomes a logged no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::{
    config::InterpreterConfig,
    error::{IngotError, IngotResult},
    ops::OpDef,
    tensor::{handle::RawHandle, DType, Device, Shape, TensorLayout},
};
use super::Interpreter;

const BACKEND: &str = "channel-interpreter";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    Resident,
    SwappedOut,
    Dropped,
}

#[derive(Debug, Clone, Copy)]
enum ResidencyChange {
    SwapIn,
    SwapOut,
    Drop,
}

/// Counters reported by the worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterpreterStats {
    pub live_handles: usize,
    pub live_bytes: usize,
    pub allocated: u64,
    pub released: u64,
    pub ops_executed: u64,
    pub regenerated: u64,
}

type Reply<T> = oneshot::Sender<IngotResult<T>>;

enum Command {
    Put {
        layout: TensorLayout,
        reply: Reply<RawHandle>,
    },
    Del {
        handle: RawHandle,
    },
    Layout {
        handle: RawHandle,
        reply: Reply<TensorLayout>,
    },
    Apply {
        op: Arc<dyn OpDef>,
        inputs: Vec<RawHandle>,
        reply: Reply<Vec<RawHandle>>,
    },
    Residency {
        handle: RawHandle,
        change: ResidencyChange,
        reply: Reply<()>,
    },
    Sync {
        reply: Reply<InterpreterStats>,
    },
    Close,
}

struct Entry {
    layout: TensorLayout,
    nbytes: usize,
    residency: Residency,
}

struct Worker {
    next_id: u64,
    memory_limit: Option<usize>,
    tensors: HashMap<RawHandle, Entry>,
    stats: InterpreterStats,
}

impl Worker {
    fn new(config: &InterpreterConfig) -> Self {
        Self {
            next_id: 1,
            memory_limit: config.memory_limit,
            tensors: HashMap::new(),
            stats: InterpreterStats::default(),
        }
    }

    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!("interpreter worker started");

        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Put { layout, reply } => {
                    let _ = reply.send(self.reserve(std::slice::from_ref(&layout)).map(|mut handles| {
                        handles.remove(0)
                    }));
                }
                Command::Del { handle } => self.del(handle),
                Command::Layout { handle, reply } => {
                    let _ = reply.send(self.entry(handle).map(|entry| entry.layout.clone()));
                }
                Command::Apply { op, inputs, reply } => {
                    let _ = reply.send(self.apply(op.as_ref(), &inputs));
                }
                Command::Residency { handle, change, reply } => {
                    let _ = reply.send(self.change_residency(handle, change));
                }
                Command::Sync { reply } => {
                    let _ = reply.send(Ok(self.stats.clone()));
                }
                Command::Close => break,
            }
        }

        if !self.tensors.is_empty() {
            tracing::warn!("interpreter closing with {} live handles", self.tensors.len());
        }
        tracing::debug!("interpreter worker stopped");
    }

    fn entry(&self, handle: RawHandle) -> IngotResult<&Entry> {
        self.tensors
            .get(&handle)
            .ok_or_else(|| IngotError::backend(BACKEND, format!("unknown handle {}", handle)))
    }

    /// Allocate every layout or none of them
    fn reserve(&mut self, layouts: &[TensorLayout]) -> IngotResult<Vec<RawHandle>> {
        let sizes = layouts
            .iter()
            .map(|layout| {
                layout.nbytes().ok_or_else(|| {
                    IngotError::backend(BACKEND, format!("size overflow: {} does not fit in memory", layout))
                })
            })
            .collect::<IngotResult<Vec<_>>>()?;

        let requested = sizes
            .iter()
            .try_fold(0usize, |acc, &size| acc.checked_add(size))
            .ok_or_else(|| IngotError::backend(BACKEND, "size overflow: requested outputs exceed usize"))?;
        let live_bytes = self.stats.live_bytes.checked_add(requested).ok_or_else(|| {
            IngotError::backend(
                BACKEND,
                format!("out of memory: {} bytes live, {} requested", self.stats.live_bytes, requested),
            )
        })?;

        if let Some(limit) = self.memory_limit {
            if live_bytes > limit {
                return Err(IngotError::backend(
                    BACKEND,
                    format!(
                        "out of memory: {} bytes live, {} requested, limit {}",
                        self.stats.live_bytes, requested, limit
                    ),
                ));
            }
        }

        let handles = layouts
            .iter()
            .zip(sizes)
            .map(|(layout, nbytes)| {
                let handle = RawHandle(self.next_id);
                self.next_id += 1;
                self.tensors.insert(
                    handle,
                    Entry {
                        layout: layout.clone(),
                        nbytes,
                        residency: Residency::Resident,
                    },
                );
                handle
            })
            .collect::<Vec<_>>();

        self.stats.live_handles = self.tensors.len();
        self.stats.live_bytes = live_bytes;
        self.stats.allocated += handles.len() as u64;
        Ok(handles)
    }

    fn del(&mut self, handle: RawHandle) {
        match self.tensors.remove(&handle) {
            Some(entry) => {
                self.stats.live_handles = self.tensors.len();
                self.stats.live_bytes -= entry.nbytes;
                self.stats.released += 1;
            }
            None => tracing::error!("release of unknown handle {}", handle),
        }
    }

    fn apply(&mut self, op: &dyn OpDef, inputs: &[RawHandle]) -> IngotResult<Vec<RawHandle>> {
        let layouts = inputs
            .iter()
            .map(|&handle| self.entry(handle).map(|entry| entry.layout.clone()))
            .collect::<IngotResult<Vec<_>>>()?;

        let outputs = op
            .infer_output_layouts(&layouts)
            .map_err(|e| IngotError::backend(BACKEND, format!("{}: {}", op.name(), e)))?;
        let handles = self.reserve(&outputs)?;

        // inputs only come back once the op is known to run
        for handle in inputs {
            if let Some(entry) = self.tensors.get_mut(handle) {
                if entry.residency == Residency::Dropped {
                    tracing::trace!("regenerating dropped input {}", handle);
                    self.stats.regenerated += 1;
                }
                entry.residency = Residency::Resident;
            }
        }
        self.stats.ops_executed += 1;

        tracing::trace!("{} {:?} -> {:?}", op.name(), inputs, handles);
        Ok(handles)
    }

    fn change_residency(&mut self, handle: RawHandle, change: ResidencyChange) -> IngotResult<()> {
        let entry = self
            .tensors
            .get_mut(&handle)
            .ok_or_else(|| IngotError::backend(BACKEND, format!("unknown handle {}", handle)))?;

        entry.residency = match (change, entry.residency) {
            (ResidencyChange::SwapIn, Residency::Dropped) => {
                self.stats.regenerated += 1;
                Residency::Resident
            }
            (ResidencyChange::SwapIn, _) => Residency::Resident,
            (ResidencyChange::SwapOut, Residency::Dropped) => {
                return Err(IngotError::backend(
                    BACKEND,
                    format!("cannot swap out dropped handle {}", handle),
                ))
            }
            (ResidencyChange::SwapOut, _) => Residency::SwappedOut,
            (ResidencyChange::Drop, _) => Residency::Dropped,
        };
        Ok(())
    }
}

/// Interpreter backed by a worker thread fed through a command channel
pub struct ChannelInterpreter {
    tx: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelInterpreter {
    pub fn new(config: &InterpreterConfig) -> IngotResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker::new(config);

        let handle = std::thread::Builder::new()
            .name(config.worker_name.clone())
            .spawn(move || worker.run(rx))?;

        tracing::info!("interpreter '{}' started", config.worker_name);

        Ok(Self {
            tx,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Drain queued requests and stop the worker
    pub fn shutdown(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = self.tx.send(Command::Close);
            if worker.join().is_err() {
                tracing::error!("interpreter worker panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Waits for queued requests, then reports the worker's counters
    pub fn stats(&self) -> IngotResult<InterpreterStats> {
        self.request(|reply| Command::Sync { reply })
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> IngotResult<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| IngotError::backend(BACKEND, "interpreter has shut down"))?;
        response
            .blocking_recv()
            .map_err(|_| IngotError::backend(BACKEND, "worker dropped the request"))?
    }

    fn residency(&self, handle: RawHandle, change: ResidencyChange) -> IngotResult<()> {
        self.request(|reply| Command::Residency { handle, change, reply })
    }
}

impl Interpreter for ChannelInterpreter {
    fn name(&self) -> &str {
        BACKEND
    }

    fn put(&self, layout: TensorLayout) -> IngotResult<RawHandle> {
        self.request(|reply| Command::Put { layout, reply })
    }

    fn release(&self, handle: RawHandle) {
        if self.tx.send(Command::Del { handle }).is_err() {
            tracing::debug!("release of {} after interpreter shutdown", handle);
        }
    }

    fn dtype(&self, handle: RawHandle) -> IngotResult<DType> {
        Ok(self.layout(handle)?.dtype)
    }

    fn device(&self, handle: RawHandle) -> IngotResult<Device> {
        Ok(self.layout(handle)?.device)
    }

    fn shape(&self, handle: RawHandle) -> IngotResult<Shape> {
        Ok(self.layout(handle)?.shape)
    }

    fn layout(&self, handle: RawHandle) -> IngotResult<TensorLayout> {
        self.request(|reply| Command::Layout { handle, reply })
    }

    fn apply_op(&self, op: &Arc<dyn OpDef>, inputs: &[RawHandle]) -> IngotResult<Vec<RawHandle>> {
        self.request(|reply| Command::Apply {
            op: op.clone(),
            inputs: inputs.to_vec(),
            reply,
        })
    }

    fn swap_in(&self, handle: RawHandle) -> IngotResult<()> {
        self.residency(handle, ResidencyChange::SwapIn)
    }

    fn swap_out(&self, handle: RawHandle) -> IngotResult<()> {
        self.residency(handle, ResidencyChange::SwapOut)
    }

    fn drop_value(&self, handle: RawHandle) -> IngotResult<()> {
        self.residency(handle, ResidencyChange::Drop)
    }

    fn sync(&self) -> IngotResult<()> {
        self.stats().map(|_| ())
    }
}

impl Drop for ChannelInterpreter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::GenericOp;

    fn layout(dims: &[usize]) -> TensorLayout {
        TensorLayout::new(dims.to_vec(), DType::F32, Device::Cpu)
    }

    #[test]
    fn test_put_query_release() {
        let interp = ChannelInterpreter::new(&InterpreterConfig::default()).unwrap();
        let handle = interp.put(layout(&[2, 3])).unwrap();
        assert!(!handle.is_null());
        assert_eq!(interp.shape(handle).unwrap(), Shape::new([2, 3]));
        assert_eq!(interp.dtype(handle).unwrap(), DType::F32);
        assert_eq!(interp.device(handle).unwrap(), Device::Cpu);

        interp.release(handle);
        let stats = interp.stats().unwrap();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.live_handles, 0);
        assert_eq!(stats.live_bytes, 0);
        assert!(interp.shape(handle).is_err());
    }

    #[test]
    fn test_apply_allocates_outputs() {
        let interp = ChannelInterpreter::new(&InterpreterConfig::default()).unwrap();
        let a = interp.put(layout(&[4, 1])).unwrap();
        let b = interp.put(layout(&[3])).unwrap();

        let out = interp.apply_op(&GenericOp::elemwise("add", 2), &[a, b]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(interp.shape(out[0]).unwrap(), Shape::new([4, 3]));
        assert_eq!(interp.stats().unwrap().ops_executed, 1);
    }

    #[test]
    fn test_apply_unknown_handle_fails() {
        let interp = ChannelInterpreter::new(&InterpreterConfig::default()).unwrap();
        let err = interp
            .apply_op(&GenericOp::elemwise("neg", 1), &[RawHandle(99)])
            .unwrap_err();
        assert!(matches!(err, IngotError::BackendDispatch { .. }));
    }

    #[test]
    fn test_memory_limit_is_all_or_nothing() {
        let config = InterpreterConfig {
            memory_limit: Some(64),
            ..InterpreterConfig::default()
        };
        let interp = ChannelInterpreter::new(&config).unwrap();
        let two = GenericOp::creation("pair", vec![layout(&[4]), layout(&[16])]);

        let err = interp.apply_op(&two, &[]).unwrap_err();
        assert!(err.to_string().contains("out of memory"));
        let stats = interp.stats().unwrap();
        assert_eq!(stats.live_handles, 0);
        assert_eq!(stats.allocated, 0);
    }

    #[test]
    fn test_residency_transitions() {
        let interp = ChannelInterpreter::new(&InterpreterConfig::default()).unwrap();
        let handle = interp.put(layout(&[8])).unwrap();

        interp.swap_out(handle).unwrap();
        interp.swap_in(handle).unwrap();
        interp.drop_value(handle).unwrap();
        assert!(interp.swap_out(handle).is_err());

        // a dropped input is regenerated on use
        interp.apply_op(&GenericOp::elemwise("neg", 1), &[handle]).unwrap();
        assert_eq!(interp.stats().unwrap().regenerated, 1);
    }

    #[test]
    fn test_oversized_layout_keeps_worker_alive() {
        let interp = ChannelInterpreter::new(&InterpreterConfig::default()).unwrap();
        let huge = TensorLayout::new([usize::MAX, 2], DType::F32, Device::Cpu);

        let err = interp.put(huge).unwrap_err();
        assert!(matches!(err, IngotError::BackendDispatch { .. }));
        assert!(err.to_string().contains("size overflow"));

        let handle = interp.put(layout(&[1])).unwrap();
        assert_eq!(interp.shape(handle).unwrap(), Shape::new([1]));
        assert!(interp.is_running());
    }

    #[test]
    fn test_overflowing_live_bytes_rejected() {
        let interp = ChannelInterpreter::new(&InterpreterConfig::default()).unwrap();
        let half = TensorLayout::new([usize::MAX / 2], DType::U8, Device::Cpu);
        interp.put(half.clone()).unwrap();

        let err = interp.apply_op(&GenericOp::creation("pair", vec![half.clone(), half]), &[]).unwrap_err();
        assert!(err.to_string().contains("out of memory"));
        assert_eq!(interp.stats().unwrap().live_handles, 1);
    }

    #[test]
    fn test_rejected_op_leaves_inputs_untouched() {
        let interp = ChannelInterpreter::new(&InterpreterConfig::default()).unwrap();
        let dropped = interp.put(layout(&[2])).unwrap();
        let other = interp.put(layout(&[5])).unwrap();
        interp.drop_value(dropped).unwrap();

        assert!(interp.apply_op(&GenericOp::elemwise("add", 2), &[dropped, other]).is_err());
        let stats = interp.stats().unwrap();
        assert_eq!(stats.regenerated, 0);
        assert_eq!(stats.ops_executed, 0);
        // still dropped, so it cannot be swapped out
        assert!(interp.swap_out(dropped).is_err());
    }

    #[test]
    fn test_requests_after_shutdown() {
        let interp = ChannelInterpreter::new(&InterpreterConfig::default()).unwrap();
        let handle = interp.put(layout(&[1])).unwrap();
        interp.shutdown();
        assert!(!interp.is_running());

        interp.release(handle);
        assert!(matches!(interp.sync(), Err(IngotError::BackendDispatch { .. })));
        assert!(interp.put(layout(&[1])).is_err());
    }
}
