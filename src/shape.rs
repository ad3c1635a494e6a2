//! Immutable view descriptor: logical dims, strides, and an element offset
//! into the owning buffer. Pure algebra, no storage or device concerns.

use crate::errors::GPError;

/// A half-open, strided range used by [`Shape::slice`]: `start..stop` with a
/// (possibly negative) `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    pub start: isize,
    pub stop: isize,
    pub step: isize,
}

impl SliceRange {
    pub fn new(start: isize, stop: isize, step: isize) -> Self {
        SliceRange { start, stop, step }
    }

    pub fn full(len: usize) -> Self {
        SliceRange {
            start: 0,
            stop: len as isize,
            step: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
    strides: Vec<isize>,
    offset: usize,
}

impl Shape {
    /// A fresh, densely packed row-major shape.
    pub fn contiguous(dims: impl Into<Vec<usize>>) -> Self {
        let dims = dims.into();
        let strides = row_major_strides(&dims);
        Shape {
            dims,
            strides,
            offset: 0,
        }
    }

    pub fn scalar() -> Self {
        Shape::contiguous(vec![])
    }

    pub fn from_parts(dims: Vec<usize>, strides: Vec<isize>, offset: usize) -> Self {
        assert_eq!(dims.len(), strides.len());
        Shape {
            dims,
            strides,
            offset,
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn contiguous_layout(&self) -> bool {
        self.strides == row_major_strides(&self.dims)
    }

    /// A layout is "simple" when every dim with size > 1 has a positive
    /// stride and the strides, sorted descending, match a (possibly
    /// permuted) dense packing. Used to pick dense-copy fast paths over
    /// the general strided kernel, mirroring `has_simple_strides` in
    /// device-tensor code.
    pub fn has_simple_strides(&self) -> bool {
        self.strides.iter().all(|&s| s >= 0)
    }

    pub fn has_dense_strides(&self) -> bool {
        self.contiguous_layout() && self.offset == 0
    }

    // --- broadcasting -----------------------------------------------------

    pub fn broadcastable(&self, other: &[usize]) -> bool {
        right_aligned_pairs(&self.dims, other).all(|(a, b)| a == b || a == 1 || b == 1)
    }

    pub fn broadcast(&self, other: &[usize]) -> Result<Shape, GPError> {
        if !self.broadcastable(other) {
            return Err(GPError::shape(
                "broadcast",
                "dimensions are not broadcast-compatible",
                vec![self.dims.clone(), other.to_vec()],
            ));
        }
        let ndim = self.ndim().max(other.len());
        let self_dims = left_pad(&self.dims, ndim, 1);
        let self_strides = left_pad_isize(&self.strides, ndim, 0);
        let other_dims = left_pad(other, ndim, 1);

        let mut out_dims = Vec::with_capacity(ndim);
        let mut out_strides = Vec::with_capacity(ndim);
        for i in 0..ndim {
            let d = self_dims[i].max(other_dims[i]);
            out_dims.push(d);
            out_strides.push(if self_dims[i] == 1 && d != 1 {
                0
            } else {
                self_strides[i]
            });
        }
        Ok(Shape::from_parts(out_dims, out_strides, self.offset))
    }

    /// Asymmetric variant: forbids the receiver from growing beyond `target`
    /// (every dim of `self` must equal the target dim or be 1).
    pub fn broadcastable_to(&self, target: &[usize]) -> bool {
        if self.ndim() > target.len() {
            return false;
        }
        let self_dims = left_pad(&self.dims, target.len(), 1);
        self_dims
            .iter()
            .zip(target.iter())
            .all(|(&a, &b)| a == b || a == 1)
    }

    pub fn broadcast_to(&self, target: &[usize]) -> Result<Shape, GPError> {
        if !self.broadcastable_to(target) {
            return Err(GPError::shape(
                "broadcast_to",
                "shape cannot be broadcast to the requested target without growing a non-1 dim",
                vec![self.dims.clone(), target.to_vec()],
            ));
        }
        self.broadcast(target)
    }

    // --- permute ------------------------------------------------------

    pub fn permute(&self, order: &[usize]) -> Result<Shape, GPError> {
        if order.len() != self.ndim() {
            return Err(GPError::shape(
                "permute",
                format!(
                    "order length {} does not match rank {}",
                    order.len(),
                    self.ndim()
                ),
                vec![self.dims.clone()],
            ));
        }
        let mut seen = vec![false; self.ndim()];
        for &axis in order {
            if axis >= self.ndim() || seen[axis] {
                return Err(GPError::shape(
                    "permute",
                    format!("order must be a permutation of 0..{}, got {:?}", self.ndim(), order),
                    vec![self.dims.clone()],
                ));
            }
            seen[axis] = true;
        }
        let dims = order.iter().map(|&a| self.dims[a]).collect();
        let strides = order.iter().map(|&a| self.strides[a]).collect();
        Ok(Shape::from_parts(dims, strides, self.offset))
    }

    pub fn transpose(&self) -> Result<Shape, GPError> {
        if self.ndim() < 2 {
            return Err(GPError::shape(
                "transpose",
                "transpose requires at least 2 dimensions",
                vec![self.dims.clone()],
            ));
        }
        let mut order: Vec<usize> = (0..self.ndim()).collect();
        let n = order.len();
        order.swap(n - 1, n - 2);
        self.permute(&order)
    }

    // --- reshape --------------------------------------------------------

    /// Returns `Some(view)` when the reshape can be expressed as a pure
    /// stride recomputation over the existing contiguous storage, `None`
    /// when it requires materializing a copy first.
    pub fn reshape_view(&self, new_dims: &[usize]) -> Result<Option<Shape>, GPError> {
        let new_numel: usize = new_dims.iter().product();
        if new_numel != self.numel() {
            return Err(GPError::shape(
                "reshape",
                format!("numel mismatch: {} vs {}", self.numel(), new_numel),
                vec![self.dims.clone(), new_dims.to_vec()],
            ));
        }
        if !self.contiguous_layout() {
            return Ok(None);
        }
        let strides = row_major_strides(new_dims);
        Ok(Some(Shape::from_parts(new_dims.to_vec(), strides, self.offset)))
    }

    /// Reshape assuming the storage is already (or has been made)
    /// contiguous: always a view.
    pub fn reshape_contiguous(&self, new_dims: &[usize]) -> Result<Shape, GPError> {
        let new_numel: usize = new_dims.iter().product();
        if new_numel != self.numel() {
            return Err(GPError::shape(
                "reshape",
                format!("numel mismatch: {} vs {}", self.numel(), new_numel),
                vec![self.dims.clone(), new_dims.to_vec()],
            ));
        }
        Ok(Shape::contiguous(new_dims.to_vec()))
    }

    // --- slice ------------------------------------------------------------

    pub fn slice(&self, ranges: &[SliceRange]) -> Result<Shape, GPError> {
        if ranges.len() != self.ndim() {
            return Err(GPError::shape(
                "slice",
                format!("expected {} ranges, got {}", self.ndim(), ranges.len()),
                vec![self.dims.clone()],
            ));
        }
        let mut dims = Vec::with_capacity(self.ndim());
        let mut strides = Vec::with_capacity(self.ndim());
        let mut offset = self.offset as isize;
        for (i, r) in ranges.iter().enumerate() {
            if r.step == 0 {
                return Err(GPError::shape(
                    "slice",
                    "step must not be zero",
                    vec![self.dims.clone()],
                ));
            }
            let new_len = if r.step > 0 {
                ((r.stop - r.start).max(0) + r.step - 1) / r.step
            } else {
                ((r.start - r.stop).max(0) + (-r.step) - 1) / (-r.step)
            };
            dims.push(new_len.max(0) as usize);
            strides.push(self.strides[i] * r.step);
            offset += r.start * self.strides[i];
        }
        if offset < 0 {
            return Err(GPError::shape(
                "slice",
                "slice offset underflowed the buffer start",
                vec![self.dims.clone()],
            ));
        }
        Ok(Shape::from_parts(dims, strides, offset as usize))
    }

    // --- matmul -------------------------------------------------------

    pub fn matmul_compat(&self, other: &[usize]) -> Result<(), GPError> {
        if self.ndim() < 2 || other.len() < 2 {
            return Err(GPError::shape(
                "matmul",
                "1-D operands are not supported; both sides need at least 2 dims",
                vec![self.dims.clone(), other.to_vec()],
            ));
        }
        let k_left = self.dims[self.ndim() - 1];
        let k_right = other[other.len() - 2];
        if k_left != k_right {
            return Err(GPError::shape(
                "matmul",
                format!("inner dimension mismatch: {} vs {}", k_left, k_right),
                vec![self.dims.clone(), other.to_vec()],
            ));
        }
        let left_batch = &self.dims[..self.ndim() - 2];
        let right_batch = &other[..other.len() - 2];
        if !right_aligned_pairs(left_batch, right_batch).all(|(a, b)| a == b || a == 1 || b == 1) {
            return Err(GPError::shape(
                "matmul",
                "batch dimensions are not broadcast-compatible",
                vec![self.dims.clone(), other.to_vec()],
            ));
        }
        Ok(())
    }

    pub fn matmul_broadcast(&self, other: &[usize]) -> Result<Shape, GPError> {
        self.matmul_compat(other)?;
        let m = self.dims[self.ndim() - 2];
        let n = other[other.len() - 1];
        let left_batch = &self.dims[..self.ndim() - 2];
        let right_batch = &other[..other.len() - 2];
        let batch_shape = Shape::contiguous(left_batch.to_vec()).broadcast(right_batch)?;
        let mut dims = batch_shape.dims().to_vec();
        dims.push(m);
        dims.push(n);
        Ok(Shape::contiguous(dims))
    }
}

fn row_major_strides(dims: &[usize]) -> Vec<isize> {
    let mut strides = vec![0isize; dims.len()];
    let mut acc: isize = 1;
    for i in (0..dims.len()).rev() {
        strides[i] = if dims[i] == 0 { 0 } else { acc };
        acc *= dims[i] as isize;
    }
    strides
}

fn left_pad(dims: &[usize], ndim: usize, fill: usize) -> Vec<usize> {
    let pad = ndim - dims.len();
    let mut out = vec![fill; pad];
    out.extend_from_slice(dims);
    out
}

fn left_pad_isize(vals: &[isize], ndim: usize, fill: isize) -> Vec<isize> {
    let pad = ndim - vals.len();
    let mut out = vec![fill; pad];
    out.extend_from_slice(vals);
    out
}

fn right_aligned_pairs<'a>(a: &'a [usize], b: &'a [usize]) -> impl Iterator<Item = (usize, usize)> + 'a {
    let ndim = a.len().max(b.len());
    (0..ndim).map(move |i| {
        let ai = if i < ndim - a.len() { 1 } else { a[i - (ndim - a.len())] };
        let bi = if i < ndim - b.len() { 1 } else { b[i - (ndim - b.len())] };
        (ai, bi)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permute_preserves_numel_and_inverts() {
        let s = Shape::contiguous(vec![2, 3, 4]);
        let order = [2, 0, 1];
        let permuted = s.permute(&order).unwrap();
        assert_eq!(permuted.numel(), s.numel());

        let mut inverse = vec![0; order.len()];
        for (i, &o) in order.iter().enumerate() {
            inverse[o] = i;
        }
        let back = permuted.permute(&inverse).unwrap();
        assert_eq!(back.dims(), s.dims());
    }

    #[test]
    fn broadcast_sets_stride_zero_on_size_one() {
        let s = Shape::contiguous(vec![1, 3]);
        let b = s.broadcast(&[2, 3]).unwrap();
        assert_eq!(b.dims(), &[2, 3]);
        assert_eq!(b.strides()[0], 0);
    }

    #[test]
    fn broadcast_scalar_has_all_zero_strides() {
        let s = Shape::contiguous(vec![1]);
        let b = s.broadcast(&[4, 5]).unwrap();
        assert!(b.strides().iter().all(|&s| s == 0));
    }

    #[test]
    fn reshape_contiguous_is_a_view() {
        let s = Shape::contiguous(vec![2, 3]);
        let reshaped = s.reshape_view(&[3, 2]).unwrap();
        assert!(reshaped.is_some());
    }

    #[test]
    fn reshape_numel_mismatch_errors() {
        let s = Shape::contiguous(vec![2, 3]);
        assert!(s.reshape_view(&[4, 4]).is_err());
    }

    #[test]
    fn slice_with_negative_step_reverses() {
        let s = Shape::contiguous(vec![5]);
        let sliced = s.slice(&[SliceRange::new(4, -1, -1)]).unwrap();
        assert_eq!(sliced.dims(), &[5]);
        assert_eq!(sliced.strides(), &[-1]);
    }

    #[test]
    fn slice_with_empty_range_is_valid_zero_numel() {
        let s = Shape::contiguous(vec![5]);
        let sliced = s.slice(&[SliceRange::new(2, 2, 1)]).unwrap();
        assert_eq!(sliced.numel(), 0);
    }

    #[test]
    fn matmul_broadcast_combines_batch_dims() {
        let a = Shape::contiguous(vec![4, 1, 2, 3]);
        let b = Shape::contiguous(vec![1, 5, 3, 6]);
        let out = a.matmul_broadcast(b.dims()).unwrap();
        assert_eq!(out.dims(), &[4, 5, 2, 6]);
    }

    #[test]
    fn matmul_rejects_1d_operands() {
        let a = Shape::contiguous(vec![3]);
        let b = Shape::contiguous(vec![3, 4]);
        assert!(a.matmul_compat(b.dims()).is_err());
    }

    #[test]
    fn permute_rejects_duplicate_axes() {
        let s = Shape::contiguous(vec![2, 3, 4]);
        assert!(s.permute(&[0, 0, 1]).is_err());
    }
}
