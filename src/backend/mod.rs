//! GPU backend collaborator: device, kernel compilation, buffer allocation
//! and dispatch. `Context` owns a `Box<dyn GpuBackend>`, mirroring the
//! teacher's `Graph { backend: Option<Box<dyn Backend>> }` split between
//! graph orchestration and device execution.

pub mod cpu;

#[cfg(feature = "cuda")]
pub mod cuda;

use crate::dtype::Dtype;
use crate::errors::GPResult;
use crate::shape::Shape;
use crate::tensor::{BinaryOp, TensorId, UnaryOp};

/// Host-side typed buffer, used for `from_host_slice` uploads and `to_host`
/// downloads. Kept separate from the backend's device `Buffer` so the
/// public API never has to know backend internals.
#[derive(Debug, Clone)]
pub enum HostBuffer {
    B8(Vec<u8>),
    I32(Vec<i32>),
    F32(Vec<f32>),
}

impl HostBuffer {
    pub fn dtype(&self) -> Dtype {
        match self {
            HostBuffer::B8(_) => Dtype::B8,
            HostBuffer::I32(_) => Dtype::I32,
            HostBuffer::F32(_) => Dtype::F32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostBuffer::B8(v) => v.len(),
            HostBuffer::I32(v) => v.len(),
            HostBuffer::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            HostBuffer::F32(v) => Some(v),
            _ => None,
        }
    }
}

/// Opaque device-resident storage. Each backend fills in exactly one
/// variant; the other variants exist so `Context` can be built against a
/// single concrete `Buffer` type without making the backend trait generic
/// (mirrors the teacher's `Storage` enum switching on `Cpu`/`Cuda`).
#[derive(Debug, Clone)]
pub enum Buffer {
    Cpu(cpu::CpuBuffer),
    #[cfg(feature = "cuda")]
    Cuda(cuda::CudaBuffer),
}

/// Uniquely identifies a compiled kernel: either a catalog entry registered
/// at context construction (`name` like `"add_f32"`) or a fused kernel
/// (`name` like `"kernel12_f32"`). Duplicate registration is rejected,
/// matching `MTLContext.register_kernel`'s "must reject duplicate keys".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub name: String,
}

impl KernelKey {
    pub fn new(name: impl Into<String>) -> Self {
        KernelKey { name: name.into() }
    }

    pub fn dense(op: &str, dtype: Dtype) -> Self {
        KernelKey::new(format!("{op}_{dtype}"))
    }

    pub fn sparse(op: &str, dtype: Dtype) -> Self {
        KernelKey::new(format!("sparse_{op}_{dtype}"))
    }

    pub fn fused(root_id: usize, dtype: Dtype) -> Self {
        KernelKey::new(format!("kernel{root_id}_{dtype}"))
    }
}

/// One assignment in a fused kernel body, in emission order. The last step
/// is the fusion root's value. `Terminal` indices refer to
/// `FusedKernelSpec::terminals`; other indices refer back into this same
/// `steps` vector (by position), matching the symbol-table inlining the
/// fusion compiler performs.
#[derive(Debug, Clone)]
pub enum FusedStep {
    Terminal(usize),
    Unary(UnaryOp, usize),
    Binary(BinaryOp, usize, usize),
}

/// A compiled fusion root: both an interpretable step list (used directly
/// by the CPU reference backend) and CUDA C source text (compiled via NVRTC
/// by the CUDA backend). Built by `graph::fusion::FusionCompiler`.
#[derive(Debug, Clone)]
pub struct FusedKernelSpec {
    pub key: KernelKey,
    pub dtype: Dtype,
    pub terminals: Vec<TensorId>,
    pub steps: Vec<FusedStep>,
    pub cuda_source: String,
}

/// Required GPU backend capabilities (spec §6). Object-safe so `Context`
/// can hold `Box<dyn GpuBackend>` and swap CPU/CUDA implementations without
/// the rest of the crate knowing which one is active.
pub trait GpuBackend {
    fn alloc(&mut self, dtype: Dtype, numel: usize) -> GPResult<Buffer>;

    /// Wrap (no-copy where the backend allows it) an existing host buffer.
    fn alloc_from_host(&mut self, host: &HostBuffer) -> GPResult<Buffer>;

    fn to_host(&mut self, buf: &Buffer, dtype: Dtype, numel: usize) -> GPResult<HostBuffer>;

    /// Register a fused kernel. Returns `BackendError` if `spec.key` is
    /// already registered (duplicate-key rejection per spec §5).
    fn compile_fused(&mut self, spec: &FusedKernelSpec) -> GPResult<()>;

    fn is_fused_compiled(&self, key: &KernelKey) -> bool;

    /// Dispatch a previously compiled fused kernel, binding `inputs` (one
    /// per terminal, in the spec's terminal order) at indices `0..k-1` and
    /// `output` at `k`.
    fn dispatch_fused(&mut self, key: &KernelKey, inputs: &[&Buffer], output: &mut Buffer, numel: usize) -> GPResult<()>;

    /// Dispatch a dense per-op kernel from the catalog registered at
    /// construction (e.g. `"add_f32"`), binding `inputs` at indices
    /// `0..k-1` and `output` at `k`.
    fn dispatch(&mut self, key: &KernelKey, inputs: &[&Buffer], output: &mut Buffer, numel: usize) -> GPResult<()>;

    /// Dispatch the strided ("sparse") variant: additionally binds
    /// per-input (ndim, shape, stride) buffers, per spec §4.4.
    fn dispatch_strided(
        &mut self,
        key: &KernelKey,
        inputs: &[(&Buffer, &Shape)],
        output: &mut Buffer,
        out_shape: &Shape,
    ) -> GPResult<()>;

    fn dispatch_constant(&mut self, dtype: Dtype, value: f64, output: &mut Buffer, numel: usize) -> GPResult<()>;

    fn dispatch_arange(&mut self, dtype: Dtype, start: f64, step: f64, output: &mut Buffer, numel: usize) -> GPResult<()>;

    fn dispatch_copy(&mut self, input: &Buffer, in_shape: &Shape, output: &mut Buffer) -> GPResult<()>;

    /// Inverse of `dispatch_copy`: `input` is densely packed in
    /// `view_shape`'s dim order, `output` is a zero-filled dense buffer
    /// (from `alloc`) at least as large as `view_shape`'s owning buffer.
    /// Writes `input[e]` to `output`'s physical position `view_shape`
    /// describes for linear index `e`, for every `e`.
    fn dispatch_scatter(&mut self, input: &Buffer, output: &mut Buffer, view_shape: &Shape) -> GPResult<()>;

    fn dispatch_matmul(
        &mut self,
        a: &Buffer,
        a_shape: &Shape,
        b: &Buffer,
        b_shape: &Shape,
        out: &mut Buffer,
        out_shape: &Shape,
        dtype: Dtype,
    ) -> GPResult<()>;

    fn dispatch_reduce_sum(
        &mut self,
        input: &Buffer,
        in_shape: &Shape,
        dims: &[usize],
        output: &mut Buffer,
        out_shape: &Shape,
        dtype: Dtype,
    ) -> GPResult<()>;

    fn dispatch_reduce_max(
        &mut self,
        input: &Buffer,
        in_shape: &Shape,
        dims: &[usize],
        output: &mut Buffer,
        out_shape: &Shape,
        argmax_out: &mut Buffer,
        dtype: Dtype,
    ) -> GPResult<()>;

    /// Block until all previously enqueued dispatches complete. Called once
    /// at the end of `forward()`/`backward()`, never between dispatches.
    fn wait(&mut self) -> GPResult<()>;

    fn name(&self) -> &'static str;
}
