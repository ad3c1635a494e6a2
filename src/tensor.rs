//! Nodes in the expression graph. `Tensor` is a cheap-clone handle into a
//! `Context`-owned arena; `TensorData` is the node payload, matching the
//! teacher's `Graph { nodes: Vec<Node> }` arena keyed by `NodeId`.

use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::backend::Buffer;
use crate::context::Context;
use crate::dtype::Dtype;
use crate::errors::{GPError, GPResult};
use crate::shape::{Shape, SliceRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Exp,
    Log,
    Neg,
    Recip,
    Sqrt,
    Sq,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Neg => "neg",
            UnaryOp::Recip => "recip",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Sq => "sq",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Neq,
    Lt,
    Gt,
    Leq,
    Geq,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Eq => "eq",
            BinaryOp::Neq => "neq",
            BinaryOp::Lt => "lt",
            BinaryOp::Gt => "gt",
            BinaryOp::Leq => "leq",
            BinaryOp::Geq => "geq",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Leq | BinaryOp::Geq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Max,
}

#[derive(Debug, Clone)]
pub enum Op {
    Constant(f64),
    Arange { start: f64, step: f64 },
    FromHostBuffer,
    Unary(UnaryOp, TensorId),
    Binary(BinaryOp, TensorId, TensorId),
    Reduce { op: ReduceOp, input: TensorId, dims: Vec<usize> },
    Reshape { input: TensorId, requires_copy: bool },
    Permute { input: TensorId, order: Vec<usize> },
    Slice { input: TensorId, ranges: Vec<SliceRange> },
    AsContiguous { input: TensorId },
    MatMul(TensorId, TensorId),
    /// Inverse of `Slice`: writes a densely-shaped `input` into the
    /// positions `ranges` describes inside a zero-filled buffer of
    /// `full_dims`, zero elsewhere. Never built directly from the public
    /// `Tensor` API; `Autograd` uses it as `Slice`'s gradient rule.
    SliceScatter { input: TensorId, ranges: Vec<SliceRange>, full_dims: Vec<usize> },
}

impl Op {
    pub fn is_initializer(&self) -> bool {
        matches!(self, Op::Constant(_) | Op::Arange { .. } | Op::FromHostBuffer)
    }

    /// Comparison binaries are excluded: they change dtype to `B8`, which
    /// would leave a fused kernel mixing the root's bool output type with
    /// an upstream float input type in the same templated source. They
    /// still execute, just never inlined into a fusion.
    pub fn is_fusable(&self) -> bool {
        match self {
            Op::Constant(_) | Op::Arange { .. } | Op::FromHostBuffer | Op::Unary(..) => true,
            Op::Binary(op, ..) => !op.is_comparison(),
            _ => false,
        }
    }

    pub fn operands(&self) -> Vec<TensorId> {
        match self {
            Op::Constant(_) | Op::Arange { .. } | Op::FromHostBuffer => vec![],
            Op::Unary(_, a) => vec![*a],
            Op::Binary(_, a, b) => vec![*a, *b],
            Op::Reduce { input, .. } => vec![*input],
            Op::Reshape { input, .. } => vec![*input],
            Op::Permute { input, .. } => vec![*input],
            Op::Slice { input, .. } => vec![*input],
            Op::AsContiguous { input } => vec![*input],
            Op::MatMul(a, b) => vec![*a, *b],
            Op::SliceScatter { input, .. } => vec![*input],
        }
    }
}

/// Node payload held in the `Context` arena. `storage` is `None` until
/// materialized; `base` is set for non-materializing views so the
/// execution engine can find the owning buffer.
pub struct TensorData {
    pub id: TensorId,
    pub dtype: Dtype,
    pub shape: Shape,
    pub op: Op,
    pub storage: Option<Buffer>,
    pub grad: Option<TensorId>,
    pub base: Option<TensorId>,
}

/// Cheap-clone handle into a `Context`'s arena. Cloning a `Tensor` clones
/// the `Rc`, not the node data.
#[derive(Clone)]
pub struct Tensor {
    pub(crate) ctx: Rc<RefCell<Context>>,
    pub id: TensorId,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tensor(id={})", self.id.0)
    }
}

impl Tensor {
    pub fn ctx(&self) -> Rc<RefCell<Context>> {
        self.ctx.clone()
    }

    pub fn shape(&self) -> Shape {
        self.ctx.borrow().node(self.id).shape.clone()
    }

    pub fn dtype(&self) -> Dtype {
        self.ctx.borrow().node(self.id).dtype
    }

    pub fn numel(&self) -> usize {
        self.shape().numel()
    }

    pub fn grad(&self) -> Option<Tensor> {
        let grad_id = self.ctx.borrow().node(self.id).grad?;
        Some(Tensor { ctx: self.ctx.clone(), id: grad_id })
    }

    /// Downloads this tensor's materialized value as an f64 vector in
    /// row-major order, regardless of its device dtype. Intended for tests
    /// and debugging; production consumers should use `Context::download`
    /// directly to keep the dtype.
    pub fn to_vec_f64(&self) -> GPResult<Vec<f64>> {
        let host = self.ctx.borrow_mut().download(self.id)?;
        Ok(match host {
            crate::backend::HostBuffer::B8(v) => v.into_iter().map(|b| b as f64).collect(),
            crate::backend::HostBuffer::I32(v) => v.into_iter().map(|i| i as f64).collect(),
            crate::backend::HostBuffer::F32(v) => v.into_iter().map(|f| f as f64).collect(),
        })
    }

    fn unary(&self, op: UnaryOp) -> Tensor {
        let shape = self.shape();
        let dtype = self.dtype();
        let id = self.ctx.borrow_mut().push(dtype, shape, Op::Unary(op, self.id));
        Tensor { ctx: self.ctx.clone(), id }
    }

    fn binary(&self, other: &Tensor, op: BinaryOp) -> GPResult<Tensor> {
        assert!(Rc::ptr_eq(&self.ctx, &other.ctx), "tensors from different contexts");
        let a_shape = self.shape();
        let b_shape = other.shape();
        let out_shape = a_shape.broadcast(b_shape.dims())?;
        let dtype = if op.is_comparison() { Dtype::B8 } else { self.dtype() };
        let id = self
            .ctx
            .borrow_mut()
            .push(dtype, out_shape, Op::Binary(op, self.id, other.id));
        Ok(Tensor { ctx: self.ctx.clone(), id })
    }

    pub fn exp(&self) -> Tensor {
        self.unary(UnaryOp::Exp)
    }
    pub fn log(&self) -> Tensor {
        self.unary(UnaryOp::Log)
    }
    pub fn recip(&self) -> Tensor {
        self.unary(UnaryOp::Recip)
    }
    pub fn sqrt(&self) -> Tensor {
        self.unary(UnaryOp::Sqrt)
    }
    pub fn sq(&self) -> Tensor {
        self.unary(UnaryOp::Sq)
    }

    pub fn sum(&self, dims: &[usize]) -> GPResult<Tensor> {
        self.reduce(ReduceOp::Sum, dims)
    }

    pub fn max(&self, dims: &[usize]) -> GPResult<Tensor> {
        self.reduce(ReduceOp::Max, dims)
    }

    fn reduce(&self, op: ReduceOp, dims: &[usize]) -> GPResult<Tensor> {
        let shape = self.shape();
        for &d in dims {
            if d >= shape.ndim() {
                return Err(GPError::shape(
                    "reduce",
                    format!("axis {d} out of range for rank {}", shape.ndim()),
                    vec![shape.dims().to_vec()],
                ));
            }
        }
        let out_dims: Vec<usize> = if dims.is_empty() {
            vec![]
        } else {
            shape
                .dims()
                .iter()
                .enumerate()
                .map(|(i, &d)| if dims.contains(&i) { 1 } else { d })
                .collect()
        };
        let out_shape = Shape::contiguous(out_dims);
        let dtype = self.dtype();
        let id = self.ctx.borrow_mut().push(
            dtype,
            out_shape,
            Op::Reduce { op, input: self.id, dims: dims.to_vec() },
        );
        Ok(Tensor { ctx: self.ctx.clone(), id })
    }

    pub fn reshape(&self, new_dims: &[usize]) -> GPResult<Tensor> {
        let shape = self.shape();
        let view = shape.reshape_view(new_dims)?;
        let (out_shape, requires_copy) = match view {
            Some(s) => (s, false),
            None => (shape.reshape_contiguous(new_dims)?, true),
        };
        let dtype = self.dtype();
        let mut ctx = self.ctx.borrow_mut();
        let id = ctx.push(dtype, out_shape, Op::Reshape { input: self.id, requires_copy });
        if !requires_copy {
            ctx.node_mut(id).base = Some(self.id);
        }
        drop(ctx);
        Ok(Tensor { ctx: self.ctx.clone(), id })
    }

    pub fn flatten(&self) -> GPResult<Tensor> {
        self.reshape(&[self.numel()])
    }

    pub fn permute(&self, order: &[usize]) -> GPResult<Tensor> {
        let out_shape = self.shape().permute(order)?;
        let dtype = self.dtype();
        let mut ctx = self.ctx.borrow_mut();
        let id = ctx.push(dtype, out_shape, Op::Permute { input: self.id, order: order.to_vec() });
        ctx.node_mut(id).base = Some(self.id);
        drop(ctx);
        Ok(Tensor { ctx: self.ctx.clone(), id })
    }

    pub fn transpose(&self) -> GPResult<Tensor> {
        let ndim = self.shape().ndim();
        if ndim < 2 {
            return Err(GPError::shape("transpose", "requires rank >= 2", vec![self.shape().dims().to_vec()]));
        }
        let mut order: Vec<usize> = (0..ndim).collect();
        order.swap(ndim - 1, ndim - 2);
        self.permute(&order)
    }

    pub fn slice(&self, ranges: &[SliceRange]) -> GPResult<Tensor> {
        let out_shape = self.shape().slice(ranges)?;
        let dtype = self.dtype();
        let mut ctx = self.ctx.borrow_mut();
        let id = ctx.push(dtype, out_shape, Op::Slice { input: self.id, ranges: ranges.to_vec() });
        ctx.node_mut(id).base = Some(self.id);
        drop(ctx);
        Ok(Tensor { ctx: self.ctx.clone(), id })
    }

    /// Inverse of `slice`: scatters `self` (shaped like the output of
    /// `Shape::contiguous(full_dims).slice(ranges)`) back into a zero-filled
    /// tensor of `full_dims`. Not exposed on the public `Tensor` surface;
    /// `Autograd` uses it to route gradients back through `Slice`.
    pub(crate) fn scatter_into(&self, ranges: &[SliceRange], full_dims: &[usize]) -> Tensor {
        let shape = Shape::contiguous(full_dims.to_vec());
        let dtype = self.dtype();
        let id = self.ctx.borrow_mut().push(
            dtype,
            shape,
            Op::SliceScatter { input: self.id, ranges: ranges.to_vec(), full_dims: full_dims.to_vec() },
        );
        Tensor { ctx: self.ctx.clone(), id }
    }

    pub fn as_contiguous(&self) -> Tensor {
        let shape = Shape::contiguous(self.shape().dims().to_vec());
        let dtype = self.dtype();
        let id = self.ctx.borrow_mut().push(dtype, shape, Op::AsContiguous { input: self.id });
        Tensor { ctx: self.ctx.clone(), id }
    }

    pub fn matmul(&self, other: &Tensor) -> GPResult<Tensor> {
        assert!(Rc::ptr_eq(&self.ctx, &other.ctx), "tensors from different contexts");
        let out_shape = self.shape().matmul_broadcast(other.shape().dims())?;
        let dtype = self.dtype();
        let id = self
            .ctx
            .borrow_mut()
            .push(dtype, out_shape, Op::MatMul(self.id, other.id));
        Ok(Tensor { ctx: self.ctx.clone(), id })
    }

    pub fn scalar(&self, value: f64) -> Tensor {
        let shape = Shape::contiguous(self.shape().dims().to_vec());
        let dtype = self.dtype();
        let id = self.ctx.borrow_mut().push(dtype, shape, Op::Constant(value));
        Tensor { ctx: self.ctx.clone(), id }
    }

    fn binary_with_scalar(&self, value: f64, op: BinaryOp) -> Tensor {
        let c = self.scalar(value);
        self.binary(&c, op).expect("scalar broadcast against its own shape cannot fail")
    }

    pub fn add_scalar(&self, v: f64) -> Tensor {
        self.binary_with_scalar(v, BinaryOp::Add)
    }
    pub fn mul_scalar(&self, v: f64) -> Tensor {
        self.binary_with_scalar(v, BinaryOp::Mul)
    }

    pub fn try_add(&self, other: &Tensor) -> GPResult<Tensor> {
        self.binary(other, BinaryOp::Add)
    }
    pub fn try_sub(&self, other: &Tensor) -> GPResult<Tensor> {
        self.binary(other, BinaryOp::Sub)
    }
    pub fn try_mul(&self, other: &Tensor) -> GPResult<Tensor> {
        self.binary(other, BinaryOp::Mul)
    }
    pub fn try_div(&self, other: &Tensor) -> GPResult<Tensor> {
        self.binary(other, BinaryOp::Div)
    }

    pub fn eq(&self, other: &Tensor) -> GPResult<Tensor> {
        self.binary(other, BinaryOp::Eq)
    }
    pub fn neq(&self, other: &Tensor) -> GPResult<Tensor> {
        self.binary(other, BinaryOp::Neq)
    }
    pub fn lt(&self, other: &Tensor) -> GPResult<Tensor> {
        self.binary(other, BinaryOp::Lt)
    }
    pub fn gt(&self, other: &Tensor) -> GPResult<Tensor> {
        self.binary(other, BinaryOp::Gt)
    }
    pub fn leq(&self, other: &Tensor) -> GPResult<Tensor> {
        self.binary(other, BinaryOp::Leq)
    }
    pub fn geq(&self, other: &Tensor) -> GPResult<Tensor> {
        self.binary(other, BinaryOp::Geq)
    }
}

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $binop:expr) => {
        impl $trait for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                self.binary(rhs, $binop).expect("shape mismatch in operator overload")
            }
        }
    };
}

impl_binop!(Add, add, BinaryOp::Add);
impl_binop!(Sub, sub, BinaryOp::Sub);
impl_binop!(Mul, mul, BinaryOp::Mul);
impl_binop!(Div, div, BinaryOp::Div);

impl Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        self.unary(UnaryOp::Neg)
    }
}
