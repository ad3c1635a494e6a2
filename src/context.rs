//! Owns the tensor arena, the device backend, and the kernel registries.
//! Grounded on the teacher's `Graph { nodes, backend, values, gradients }`
//! plus spec §9's "Context... is process-wide state with explicit init...
//! must expose a scoped acquisition so tests can construct their own
//! contexts" — resolved here as a plain `Context::new`/`with_backend`
//! constructor rather than a global singleton (see DESIGN.md).

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use tracing::instrument;

use crate::backend::cpu::CpuBackend;
use crate::backend::{Buffer, FusedKernelSpec, GpuBackend, HostBuffer, KernelKey};
use crate::config::Config;
use crate::dtype::Dtype;
use crate::errors::{GPError, GPResult};
use crate::shape::Shape;
use crate::tensor::{Op, Tensor, TensorData, TensorId};

pub struct Context {
    nodes: Vec<TensorData>,
    backend: Box<dyn GpuBackend>,
    config: Config,
    fused: HashSet<KernelKey>,
}

impl Context {
    /// A scoped context over the CPU reference backend, used by tests and
    /// environments without a GPU.
    pub fn new_cpu() -> Rc<RefCell<Context>> {
        Context::with_backend(Box::new(CpuBackend::new()), Config::default())
    }

    pub fn with_backend(backend: Box<dyn GpuBackend>, config: Config) -> Rc<RefCell<Context>> {
        Rc::new(RefCell::new(Context {
            nodes: Vec::new(),
            backend,
            config,
            fused: HashSet::new(),
        }))
    }

    #[cfg(feature = "cuda")]
    pub fn new_cuda(config: Config) -> GPResult<Rc<RefCell<Context>>> {
        let backend = crate::backend::cuda::CudaBackend::new(config.device_index)?;
        Ok(Context::with_backend(Box::new(backend), config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &dyn GpuBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn GpuBackend {
        self.backend.as_mut()
    }

    pub fn node(&self, id: TensorId) -> &TensorData {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: TensorId) -> &mut TensorData {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Appends a new node. Operand ids are always strictly less than the
    /// new id by construction (every factory takes already-built operand
    /// handles), which is what keeps the graph acyclic (spec §9).
    pub(crate) fn push(&mut self, dtype: Dtype, shape: Shape, op: Op) -> TensorId {
        for operand in op.operands() {
            debug_assert!(operand.0 < self.nodes.len(), "operand id must already exist in the arena");
        }
        let id = TensorId(self.nodes.len());
        self.nodes.push(TensorData {
            id,
            dtype,
            shape,
            op,
            storage: None,
            grad: None,
            base: None,
        });
        id
    }

    pub fn register_fused(&mut self, spec: FusedKernelSpec) -> GPResult<()> {
        if self.fused.contains(&spec.key) {
            return Err(GPError::Backend(format!("kernel key already registered: {}", spec.key.name)));
        }
        self.backend.compile_fused(&spec)?;
        self.fused.insert(spec.key);
        Ok(())
    }

    pub fn is_fused(&self, key: &KernelKey) -> bool {
        self.fused.contains(key)
    }

    /// Resolves `id` to the nearest ancestor (including itself) that owns
    /// physical storage, walking `base` through view chains (reshape,
    /// permute, slice). Views never materialize their own buffer.
    fn owning_buffer_id(&self, mut id: TensorId) -> TensorId {
        loop {
            let node = &self.nodes[id.0];
            if node.storage.is_some() {
                return id;
            }
            match node.base {
                Some(base) => id = base,
                None => return id,
            }
        }
    }

    /// Returns a clone of the owning buffer together with `id`'s own shape,
    /// which already carries the strides/offset composed relative to that
    /// buffer's layout. Cloning keeps the exec engine free of overlapping
    /// borrows between `nodes` and `backend`.
    pub(crate) fn buffer_and_shape(&self, id: TensorId) -> GPResult<(Buffer, Shape)> {
        let owning = self.owning_buffer_id(id);
        let buf = self.nodes[owning.0]
            .storage
            .clone()
            .ok_or_else(|| GPError::Backend(format!("tensor {} read before materialization", id.0)))?;
        Ok((buf, self.nodes[id.0].shape.clone()))
    }

    /// Downloads `id`'s materialized value to the host, gathering through a
    /// dense scratch buffer first if the tensor is a non-contiguous view.
    /// `Graph::forward`/`backward` must have run first.
    pub fn download(&mut self, id: TensorId) -> GPResult<HostBuffer> {
        let (buf, shape) = self.buffer_and_shape(id)?;
        let dtype = self.nodes[id.0].dtype;
        let numel = shape.numel();
        if shape.has_dense_strides() {
            return self.backend.to_host(&buf, dtype, numel);
        }
        let mut scratch = self.backend.alloc(dtype, numel)?;
        self.backend.dispatch_copy(&buf, &shape, &mut scratch)?;
        self.backend.to_host(&scratch, dtype, numel)
    }
}

/// Factories. All of these live on `Context` rather than `Tensor` because
/// they don't need an existing node to build from.
impl Context {
    pub fn constant(ctx: &Rc<RefCell<Context>>, dtype: Dtype, dims: &[usize], value: f64) -> Tensor {
        let shape = Shape::contiguous(dims.to_vec());
        let id = ctx.borrow_mut().push(dtype, shape, Op::Constant(value));
        Tensor { ctx: ctx.clone(), id }
    }

    pub fn zeros(ctx: &Rc<RefCell<Context>>, dtype: Dtype, dims: &[usize]) -> Tensor {
        Context::constant(ctx, dtype, dims, 0.0)
    }

    pub fn ones(ctx: &Rc<RefCell<Context>>, dtype: Dtype, dims: &[usize]) -> Tensor {
        Context::constant(ctx, dtype, dims, 1.0)
    }

    pub fn full(ctx: &Rc<RefCell<Context>>, dtype: Dtype, dims: &[usize], value: f64) -> Tensor {
        Context::constant(ctx, dtype, dims, value)
    }

    pub fn arange(ctx: &Rc<RefCell<Context>>, dtype: Dtype, dims: &[usize], start: f64, step: f64) -> Tensor {
        let shape = Shape::contiguous(dims.to_vec());
        let id = ctx.borrow_mut().push(dtype, shape, Op::Arange { start, step });
        Tensor { ctx: ctx.clone(), id }
    }

    /// `from_host_buffer`/`from_numpy`-equivalent: wraps an existing host
    /// buffer as a `Constant` initializer whose materialization is a
    /// memcpy to device memory (spec §4.2).
    #[instrument(skip(ctx, host))]
    pub fn from_host_buffer(ctx: &Rc<RefCell<Context>>, dims: &[usize], host: HostBuffer) -> GPResult<Tensor> {
        let numel: usize = dims.iter().product();
        if numel != host.len() {
            return Err(GPError::shape(
                "from_host_buffer",
                format!("host buffer has {} elements, shape has {numel}", host.len()),
                vec![dims.to_vec()],
            ));
        }
        let dtype = host.dtype();
        let shape = Shape::contiguous(dims.to_vec());
        let mut guard = ctx.borrow_mut();
        let buffer = guard.backend.alloc_from_host(&host)?;
        let id = guard.push(dtype, shape, Op::FromHostBuffer);
        guard.node_mut(id).storage = Some(buffer);
        drop(guard);
        Ok(Tensor { ctx: ctx.clone(), id })
    }
}
