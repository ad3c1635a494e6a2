//! CUDA backend: the concrete GPU collaborator of spec §6, implemented
//! against `cudarc`. Grounded on the teacher's `backend::cuda::CUDABackend`
//! (`CudaDevice`/NVRTC compile-then-load pattern, per-op `get_func` +
//! `LaunchConfig::for_num_elems` + `unsafe { func.launch(...) }`).

pub mod kernels;

use std::collections::HashMap;
use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaFunction, CudaSlice, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::compile_ptx;
use tracing::instrument;

use crate::backend::{Buffer, FusedKernelSpec, GpuBackend, HostBuffer, KernelKey};
use crate::dtype::Dtype;
use crate::errors::{GPError, GPResult};
use crate::shape::Shape;

const MODULE: &str = "tensorgraph";

#[derive(Clone)]
pub enum CudaBuffer {
    B8(CudaSlice<u8>),
    I32(CudaSlice<i32>),
    F32(CudaSlice<f32>),
}

impl std::fmt::Debug for CudaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CudaBuffer")
    }
}

pub struct CudaBackend {
    device: Arc<CudaDevice>,
    functions: HashMap<String, CudaFunction>,
    fused: HashMap<KernelKey, FusedKernelSpec>,
}

impl CudaBackend {
    #[instrument]
    pub fn new(device_index: usize) -> GPResult<Self> {
        let device = CudaDevice::new(device_index).map_err(|e| GPError::Backend(e.to_string()))?;
        let mut backend = CudaBackend {
            device,
            functions: HashMap::new(),
            fused: HashMap::new(),
        };
        for dtype in [Dtype::B8, Dtype::I32, Dtype::F32] {
            backend.load_catalog(dtype)?;
        }
        Ok(backend)
    }

    fn load_catalog(&mut self, dtype: Dtype) -> GPResult<()> {
        let source = kernels::catalog_source(dtype);
        let ptx = compile_ptx(source).map_err(|e| GPError::Backend(e.to_string()))?;
        let names: Vec<String> = self.catalog_function_names(dtype);
        let module_name = format!("{MODULE}_{dtype}");
        self.device
            .load_ptx(ptx, &module_name, &names.iter().map(String::as_str).collect::<Vec<_>>())
            .map_err(|e| GPError::Backend(e.to_string()))?;
        for name in names {
            let func = self
                .device
                .get_func(&module_name, &name)
                .ok_or_else(|| GPError::Backend(format!("kernel function `{name}` missing after load")))?;
            self.functions.insert(name, func);
        }
        Ok(())
    }

    fn catalog_function_names(&self, dtype: Dtype) -> Vec<String> {
        let mut names = vec![];
        for (op, _) in kernels::UNARY_EXPRS {
            names.push(format!("{op}_{dtype}"));
            names.push(format!("sparse_{op}_{dtype}"));
        }
        for (op, _) in kernels::BINARY_EXPRS {
            names.push(format!("{op}_{dtype}"));
            names.push(format!("sparse_{op}_{dtype}"));
        }
        names.push(format!("copy_{dtype}"));
        names.push(format!("sparse_copy_{dtype}"));
        names.push(format!("scatter_{dtype}"));
        names.push(format!("constant_c_{dtype}"));
        names.push(format!("arange_{dtype}"));
        names
    }

    fn launch_config(&self, numel: usize) -> LaunchConfig {
        LaunchConfig::for_num_elems(numel as u32)
    }

    fn slice_u8<'a>(&self, b: &'a Buffer) -> GPResult<&'a CudaSlice<u8>> {
        match b {
            Buffer::Cuda(CudaBuffer::B8(s)) => Ok(s),
            _ => Err(GPError::Backend("expected a b8 CUDA buffer".into())),
        }
    }

    fn slice_i32<'a>(&self, b: &'a Buffer) -> GPResult<&'a CudaSlice<i32>> {
        match b {
            Buffer::Cuda(CudaBuffer::I32(s)) => Ok(s),
            _ => Err(GPError::Backend("expected an i32 CUDA buffer".into())),
        }
    }

    fn slice_f32<'a>(&self, b: &'a Buffer) -> GPResult<&'a CudaSlice<f32>> {
        match b {
            Buffer::Cuda(CudaBuffer::F32(s)) => Ok(s),
            _ => Err(GPError::Backend("expected an f32 CUDA buffer".into())),
        }
    }

    fn upload_shape_meta(&self, shape: &Shape) -> GPResult<(CudaSlice<i32>, CudaSlice<i32>)> {
        let dims: Vec<i32> = shape.dims().iter().map(|&d| d as i32).collect();
        let strides: Vec<i32> = shape.strides().iter().map(|&s| s as i32).collect();
        let shape_buf = self.device.htod_copy(dims).map_err(|e| GPError::Backend(e.to_string()))?;
        let stride_buf = self.device.htod_copy(strides).map_err(|e| GPError::Backend(e.to_string()))?;
        Ok((shape_buf, stride_buf))
    }
}

impl GpuBackend for CudaBackend {
    fn alloc(&mut self, dtype: Dtype, numel: usize) -> GPResult<Buffer> {
        let buf = match dtype {
            Dtype::B8 => CudaBuffer::B8(self.device.alloc_zeros::<u8>(numel).map_err(|e| GPError::Backend(e.to_string()))?),
            Dtype::I32 => CudaBuffer::I32(self.device.alloc_zeros::<i32>(numel).map_err(|e| GPError::Backend(e.to_string()))?),
            Dtype::F32 => CudaBuffer::F32(self.device.alloc_zeros::<f32>(numel).map_err(|e| GPError::Backend(e.to_string()))?),
        };
        Ok(Buffer::Cuda(buf))
    }

    fn alloc_from_host(&mut self, host: &HostBuffer) -> GPResult<Buffer> {
        let buf = match host {
            HostBuffer::B8(v) => CudaBuffer::B8(self.device.htod_copy(v.clone()).map_err(|e| GPError::Backend(e.to_string()))?),
            HostBuffer::I32(v) => CudaBuffer::I32(self.device.htod_copy(v.clone()).map_err(|e| GPError::Backend(e.to_string()))?),
            HostBuffer::F32(v) => CudaBuffer::F32(self.device.htod_copy(v.clone()).map_err(|e| GPError::Backend(e.to_string()))?),
        };
        Ok(Buffer::Cuda(buf))
    }

    fn to_host(&mut self, buf: &Buffer, dtype: Dtype, _numel: usize) -> GPResult<HostBuffer> {
        Ok(match dtype {
            Dtype::B8 => HostBuffer::B8(self.device.dtoh_sync_copy(self.slice_u8(buf)?).map_err(|e| GPError::Backend(e.to_string()))?),
            Dtype::I32 => HostBuffer::I32(self.device.dtoh_sync_copy(self.slice_i32(buf)?).map_err(|e| GPError::Backend(e.to_string()))?),
            Dtype::F32 => HostBuffer::F32(self.device.dtoh_sync_copy(self.slice_f32(buf)?).map_err(|e| GPError::Backend(e.to_string()))?),
        })
    }

    #[instrument(skip(self, spec))]
    fn compile_fused(&mut self, spec: &FusedKernelSpec) -> GPResult<()> {
        if self.fused.contains_key(&spec.key) {
            return Err(GPError::Backend(format!("fused kernel already registered: {}", spec.key.name)));
        }
        let ptx = compile_ptx(spec.cuda_source.clone()).map_err(|e| GPError::Backend(e.to_string()))?;
        self.device
            .load_ptx(ptx, &spec.key.name, &[spec.key.name.as_str()])
            .map_err(|e| GPError::Backend(e.to_string()))?;
        let func = self
            .device
            .get_func(&spec.key.name, &spec.key.name)
            .ok_or_else(|| GPError::Backend("fused kernel function missing after load".into()))?;
        self.functions.insert(spec.key.name.clone(), func);
        self.fused.insert(spec.key.clone(), spec.clone());
        Ok(())
    }

    fn is_fused_compiled(&self, key: &KernelKey) -> bool {
        self.fused.contains_key(key)
    }

    fn dispatch_fused(&mut self, key: &KernelKey, inputs: &[&Buffer], output: &mut Buffer, numel: usize) -> GPResult<()> {
        self.dispatch(key, inputs, output, numel)
    }

    #[instrument(skip(self, inputs, output))]
    fn dispatch(&mut self, key: &KernelKey, inputs: &[&Buffer], output: &mut Buffer, numel: usize) -> GPResult<()> {
        let func = self
            .functions
            .get(&key.name)
            .ok_or_else(|| GPError::Backend(format!("kernel not registered: {}", key.name)))?
            .clone();
        let cfg = self.launch_config(numel);
        let n = numel as i32;
        unsafe {
            match (inputs.len(), output) {
                (1, Buffer::Cuda(CudaBuffer::F32(out))) => func
                    .launch(cfg, (self.slice_f32(inputs[0])?, out, n))
                    .map_err(|e| GPError::Backend(e.to_string()))?,
                (2, Buffer::Cuda(CudaBuffer::F32(out))) => func
                    .launch(cfg, (self.slice_f32(inputs[0])?, self.slice_f32(inputs[1])?, out, n))
                    .map_err(|e| GPError::Backend(e.to_string()))?,
                (1, Buffer::Cuda(CudaBuffer::B8(out))) => func
                    .launch(cfg, (self.slice_f32(inputs[0])?, out, n))
                    .map_err(|e| GPError::Backend(e.to_string()))?,
                (2, Buffer::Cuda(CudaBuffer::B8(out))) => func
                    .launch(cfg, (self.slice_f32(inputs[0])?, self.slice_f32(inputs[1])?, out, n))
                    .map_err(|e| GPError::Backend(e.to_string()))?,
                _ => return Err(GPError::Backend(format!("unsupported arity/dtype combination for `{}`", key.name))),
            }
        }
        Ok(())
    }

    #[instrument(skip(self, inputs, output, out_shape))]
    fn dispatch_strided(
        &mut self,
        key: &KernelKey,
        inputs: &[(&Buffer, &Shape)],
        output: &mut Buffer,
        out_shape: &Shape,
    ) -> GPResult<()> {
        let func = self
            .functions
            .get(&key.name)
            .ok_or_else(|| GPError::Backend(format!("kernel not registered: {}", key.name)))?
            .clone();
        let numel = out_shape.numel();
        let cfg = self.launch_config(numel);
        let n = numel as i32;
        let ndim = out_shape.ndim() as i32;
        let (shape_buf, _unused) = self.upload_shape_meta(out_shape)?;
        let stride_bufs: Vec<CudaSlice<i32>> = inputs
            .iter()
            .map(|(_, s)| self.upload_shape_meta(s).map(|(_, strides)| strides))
            .collect::<GPResult<_>>()?;

        unsafe {
            match (inputs.len(), output) {
                (1, Buffer::Cuda(CudaBuffer::F32(out))) => func
                    .launch(cfg, (ndim, &shape_buf, &stride_bufs[0], self.slice_f32(inputs[0].0)?, out, n))
                    .map_err(|e| GPError::Backend(e.to_string()))?,
                (2, Buffer::Cuda(CudaBuffer::F32(out))) => func
                    .launch(
                        cfg,
                        (
                            ndim,
                            &shape_buf,
                            &stride_bufs[0],
                            &stride_bufs[1],
                            self.slice_f32(inputs[0].0)?,
                            self.slice_f32(inputs[1].0)?,
                            out,
                            n,
                        ),
                    )
                    .map_err(|e| GPError::Backend(e.to_string()))?,
                _ => return Err(GPError::Backend(format!("unsupported arity/dtype combination for `{}`", key.name))),
            }
        }
        Ok(())
    }

    fn dispatch_constant(&mut self, dtype: Dtype, value: f64, output: &mut Buffer, numel: usize) -> GPResult<()> {
        let key = KernelKey::dense("constant_c", dtype);
        let func = self
            .functions
            .get(&key.name)
            .ok_or_else(|| GPError::Backend(format!("kernel not registered: {}", key.name)))?
            .clone();
        let c = self.device.htod_copy(vec![value as f32]).map_err(|e| GPError::Backend(e.to_string()))?;
        let cfg = self.launch_config(numel);
        let n = numel as i32;
        unsafe {
            match output {
                Buffer::Cuda(CudaBuffer::F32(out)) => func.launch(cfg, (&c, out, n)),
                Buffer::Cuda(CudaBuffer::I32(out)) => func.launch(cfg, (&c, out, n)),
                Buffer::Cuda(CudaBuffer::B8(out)) => func.launch(cfg, (&c, out, n)),
                _ => return Err(GPError::Backend("unsupported output buffer for constant".into())),
            }
            .map_err(|e| GPError::Backend(e.to_string()))?
        }
        Ok(())
    }

    fn dispatch_arange(&mut self, dtype: Dtype, start: f64, step: f64, output: &mut Buffer, numel: usize) -> GPResult<()> {
        let key = KernelKey::dense("arange", dtype);
        let func = self
            .functions
            .get(&key.name)
            .ok_or_else(|| GPError::Backend(format!("kernel not registered: {}", key.name)))?
            .clone();
        let s = self.device.htod_copy(vec![start as f32]).map_err(|e| GPError::Backend(e.to_string()))?;
        let st = self.device.htod_copy(vec![step as f32]).map_err(|e| GPError::Backend(e.to_string()))?;
        let cfg = self.launch_config(numel);
        let n = numel as i32;
        unsafe {
            match output {
                Buffer::Cuda(CudaBuffer::F32(out)) => func.launch(cfg, (&s, &st, out, n)),
                Buffer::Cuda(CudaBuffer::I32(out)) => func.launch(cfg, (&s, &st, out, n)),
                _ => return Err(GPError::Backend("unsupported output buffer for arange".into())),
            }
            .map_err(|e| GPError::Backend(e.to_string()))?
        }
        Ok(())
    }

    fn dispatch_copy(&mut self, input: &Buffer, in_shape: &Shape, output: &mut Buffer) -> GPResult<()> {
        let dtype = Dtype::F32;
        if in_shape.has_dense_strides() {
            let key = KernelKey::dense("copy", dtype);
            self.dispatch(&key, &[input], output, in_shape.numel())
        } else {
            let key = KernelKey::sparse("copy", dtype);
            self.dispatch_strided(&key, &[(input, in_shape)], output, in_shape)
        }
    }

    fn dispatch_scatter(&mut self, input: &Buffer, output: &mut Buffer, view_shape: &Shape) -> GPResult<()> {
        let dtype = Dtype::F32;
        let key = KernelKey::new(format!("scatter_{dtype}"));
        let func = self
            .functions
            .get(&key.name)
            .ok_or_else(|| GPError::Backend(format!("kernel not registered: {}", key.name)))?
            .clone();
        let numel = view_shape.numel();
        let cfg = self.launch_config(numel);
        let n = numel as i32;
        let ndim = view_shape.ndim() as i32;
        let (dims_buf, stride_buf) = self.upload_shape_meta(view_shape)?;
        unsafe {
            match output {
                Buffer::Cuda(CudaBuffer::F32(out)) => func
                    .launch(cfg, (ndim, &dims_buf, &stride_buf, self.slice_f32(input)?, out, n))
                    .map_err(|e| GPError::Backend(e.to_string()))?,
                _ => return Err(GPError::Backend("scatter requires an f32 output buffer".into())),
            }
        }
        Ok(())
    }

    #[instrument(skip(self, a, b, out))]
    fn dispatch_matmul(
        &mut self,
        a: &Buffer,
        a_shape: &Shape,
        b: &Buffer,
        b_shape: &Shape,
        out: &mut Buffer,
        out_shape: &Shape,
        _dtype: Dtype,
    ) -> GPResult<()> {
        let rank = out_shape.ndim();
        let batch: usize = out_shape.dims()[..rank - 2].iter().product();
        let m = a_shape.dims()[a_shape.ndim() - 2];
        let k = a_shape.dims()[a_shape.ndim() - 1];
        let n = b_shape.dims()[b_shape.ndim() - 1];
        let key = KernelKey::dense("matmul", Dtype::F32);
        let func = self
            .functions
            .get(&key.name)
            .cloned()
            .ok_or_else(|| GPError::Backend("matmul kernel not loaded".into()))?;
        let cfg = self.launch_config(batch * m * n);
        unsafe {
            match out {
                Buffer::Cuda(CudaBuffer::F32(out_slice)) => func
                    .launch(
                        cfg,
                        (
                            self.slice_f32(a)?,
                            self.slice_f32(b)?,
                            out_slice,
                            batch as i32,
                            m as i32,
                            k as i32,
                            n as i32,
                        ),
                    )
                    .map_err(|e| GPError::Backend(e.to_string()))?,
                _ => return Err(GPError::Backend("matmul requires an f32 output buffer".into())),
            }
        }
        Ok(())
    }

    /// The `group_size`-based reduce kernels assume the reduced axes are the
    /// trailing, densely-packed axes of their input (`in0[idx * group_size
    /// + g]`). `dims` can name any subset of axes in any order, and
    /// `in_shape` can be an arbitrary strided view, so this gathers `input`
    /// into a fresh dense buffer ordered `[kept axes..., reduced axes...]`
    /// (each group keeping its original relative order) before the kernel
    /// ever runs, the same scratch-copy pattern `dispatch_fused` uses for
    /// non-contiguous terminals. Returns the dense buffer and the resulting
    /// group size.
    fn reduce_input_dense(&mut self, input: &Buffer, in_shape: &Shape, dims: &[usize]) -> GPResult<(Buffer, usize)> {
        let ndim = in_shape.ndim();
        let reduced: Vec<usize> = if dims.is_empty() { (0..ndim).collect() } else { dims.to_vec() };
        let group_size: usize = reduced.iter().map(|&d| in_shape.dims()[d]).product();
        let mut order: Vec<usize> = (0..ndim).filter(|d| !reduced.contains(d)).collect();
        order.extend(reduced.iter().copied());
        let permuted = in_shape.permute(&order)?;
        let mut dense = self.alloc(Dtype::F32, in_shape.numel())?;
        self.dispatch_copy(input, &permuted, &mut dense)?;
        Ok((dense, group_size))
    }

    fn dispatch_reduce_sum(
        &mut self,
        input: &Buffer,
        in_shape: &Shape,
        dims: &[usize],
        output: &mut Buffer,
        out_shape: &Shape,
        _dtype: Dtype,
    ) -> GPResult<()> {
        let (dense_input, group_size) = self.reduce_input_dense(input, in_shape, dims)?;
        let key = KernelKey::dense("reduce_sum", Dtype::F32);
        let func = self
            .functions
            .get(&key.name)
            .cloned()
            .ok_or_else(|| GPError::Backend("reduce_sum kernel not loaded".into()))?;
        let n_out = out_shape.numel();
        let cfg = self.launch_config(n_out);
        unsafe {
            match output {
                Buffer::Cuda(CudaBuffer::F32(out)) => func
                    .launch(cfg, (self.slice_f32(&dense_input)?, out, n_out as i32, group_size as i32))
                    .map_err(|e| GPError::Backend(e.to_string()))?,
                _ => return Err(GPError::Backend("reduce_sum requires an f32 output buffer".into())),
            }
        }
        Ok(())
    }

    fn dispatch_reduce_max(
        &mut self,
        input: &Buffer,
        in_shape: &Shape,
        dims: &[usize],
        output: &mut Buffer,
        out_shape: &Shape,
        argmax_out: &mut Buffer,
        _dtype: Dtype,
    ) -> GPResult<()> {
        let (dense_input, group_size) = self.reduce_input_dense(input, in_shape, dims)?;
        let key = KernelKey::dense("reduce_max", Dtype::F32);
        let func = self
            .functions
            .get(&key.name)
            .cloned()
            .ok_or_else(|| GPError::Backend("reduce_max kernel not loaded".into()))?;
        let n_out = out_shape.numel();
        let cfg = self.launch_config(n_out);
        unsafe {
            match (output, argmax_out) {
                (Buffer::Cuda(CudaBuffer::F32(out)), Buffer::Cuda(CudaBuffer::I32(argmax))) => func
                    .launch(cfg, (self.slice_f32(&dense_input)?, out, argmax, n_out as i32, group_size as i32))
                    .map_err(|e| GPError::Backend(e.to_string()))?,
                _ => return Err(GPError::Backend("reduce_max requires f32 output and i32 argmax buffers".into())),
            }
        }
        Ok(())
    }

    fn wait(&mut self) -> GPResult<()> {
        self.device.synchronize().map_err(|e| GPError::Backend(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "cuda"
    }
}
