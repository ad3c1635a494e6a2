//! CUDA C kernel source templates, dtype-specialized by textual
//! substitution. Grounded on the teacher's `backend/cuda/kernels.rs`
//! (`extern "C" __global__` elementwise kernels, thread index from
//! `blockIdx`/`blockDim`/`threadIdx`) and on `original_source/python/metal`'s
//! catalog of initializer/unary/binary/copy kernels, generalized from
//! Metal shading language to CUDA C.

use crate::dtype::Dtype;

const THREAD_INDEX: &str = "int idx = blockIdx.x * blockDim.x + threadIdx.x;";

/// `<op>_<dtype>`: dense unary kernel, `in[idx] -> out[idx]`.
pub fn unary_dense(dtype: Dtype, op: &str, expr: &str) -> String {
    let t = dtype.c_type();
    format!(
        "extern \"C\" __global__ void {op}_{dtype}({t}* in0, {t}* out, int n) {{\n    {THREAD_INDEX}\n    if (idx >= n) return;\n    {t} x = in0[idx];\n    out[idx] = {expr};\n}}\n",
    )
}

/// `<op>_<dtype>`: dense binary kernel, `(a[idx], b[idx]) -> out[idx]`.
pub fn binary_dense(dtype: Dtype, op: &str, expr: &str) -> String {
    let t = dtype.c_type();
    let out_t = if matches!(op, "eq" | "neq" | "lt" | "gt" | "leq" | "geq") {
        Dtype::B8.c_type()
    } else {
        t
    };
    format!(
        "extern \"C\" __global__ void {op}_{dtype}({t}* in0, {t}* in1, {out_t}* out, int n) {{\n    {THREAD_INDEX}\n    if (idx >= n) return;\n    {t} a = in0[idx];\n    {t} b = in1[idx];\n    out[idx] = {expr};\n}}\n",
    )
}

/// `sparse_<op>_<dtype>`: strided variant; additionally takes ndim plus a
/// (shape, stride) pair per input, computing the physical index from the
/// thread id the way `sparse_ss_op` does in the original kernel catalog.
pub fn unary_strided(dtype: Dtype, op: &str, expr: &str) -> String {
    let t = dtype.c_type();
    format!(
        "extern \"C\" __global__ void sparse_{op}_{dtype}(\n    int ndim, int* shape, int* stride0,\n    {t}* in0, {t}* out, int n\n) {{\n    {THREAD_INDEX}\n    if (idx >= n) return;\n    int off0 = 0, rem = idx;\n    for (int d = ndim - 1; d >= 0; d--) {{\n        int coord = rem % shape[d];\n        rem /= shape[d];\n        off0 += coord * stride0[d];\n    }}\n    {t} x = in0[off0];\n    out[idx] = {expr};\n}}\n",
    )
}

pub fn binary_strided(dtype: Dtype, op: &str, expr: &str) -> String {
    let t = dtype.c_type();
    let out_t = if matches!(op, "eq" | "neq" | "lt" | "gt" | "leq" | "geq") {
        Dtype::B8.c_type()
    } else {
        t
    };
    format!(
        "extern \"C\" __global__ void sparse_{op}_{dtype}(\n    int ndim, int* shape, int* stride0, int* stride1,\n    {t}* in0, {t}* in1, {out_t}* out, int n\n) {{\n    {THREAD_INDEX}\n    if (idx >= n) return;\n    int off0 = 0, off1 = 0, rem = idx;\n    for (int d = ndim - 1; d >= 0; d--) {{\n        int coord = rem % shape[d];\n        rem /= shape[d];\n        off0 += coord * stride0[d];\n        off1 += coord * stride1[d];\n    }}\n    {t} a = in0[off0];\n    {t} b = in1[off1];\n    out[idx] = {expr};\n}}\n",
    )
}

pub fn copy_dense(dtype: Dtype) -> String {
    let t = dtype.c_type();
    format!("extern \"C\" __global__ void copy_{dtype}({t}* in0, {t}* out, int n) {{\n    {THREAD_INDEX}\n    if (idx >= n) return;\n    out[idx] = in0[idx];\n}}\n")
}

pub fn sparse_copy(dtype: Dtype) -> String {
    let t = dtype.c_type();
    format!(
        "extern \"C\" __global__ void sparse_copy_{dtype}(\n    int ndim, int* shape, int* stride0,\n    {t}* in0, {t}* out, int n\n) {{\n    {THREAD_INDEX}\n    if (idx >= n) return;\n    int off0 = 0, rem = idx;\n    for (int d = ndim - 1; d >= 0; d--) {{\n        int coord = rem % shape[d];\n        rem /= shape[d];\n        off0 += coord * stride0[d];\n    }}\n    out[idx] = in0[off0];\n}}\n",
    )
}

/// `scatter_<dtype>`: inverse of `sparse_copy`. `n` indexes the dense
/// `in0`; the strided destination offset in `out` is computed the same way
/// `sparse_copy` computes its strided source offset.
pub fn scatter_kernel(dtype: Dtype) -> String {
    let t = dtype.c_type();
    format!(
        "extern \"C\" __global__ void scatter_{dtype}(\n    int ndim, int* shape, int* stride0,\n    {t}* in0, {t}* out, int n\n) {{\n    {THREAD_INDEX}\n    if (idx >= n) return;\n    int off0 = 0, rem = idx;\n    for (int d = ndim - 1; d >= 0; d--) {{\n        int coord = rem % shape[d];\n        rem /= shape[d];\n        off0 += coord * stride0[d];\n    }}\n    out[off0] = in0[idx];\n}}\n",
    )
}

pub fn constant_kernel(dtype: Dtype) -> String {
    let t = dtype.c_type();
    format!("extern \"C\" __global__ void constant_c_{dtype}(float* c, {t}* out, int n) {{\n    {THREAD_INDEX}\n    if (idx >= n) return;\n    out[idx] = ({t}) c[0];\n}}\n")
}

pub fn arange_kernel(dtype: Dtype) -> String {
    let t = dtype.c_type();
    format!("extern \"C\" __global__ void arange_{dtype}(float* start, float* step, {t}* out, int n) {{\n    {THREAD_INDEX}\n    if (idx >= n) return;\n    out[idx] = ({t}) (start[0] + step[0] * idx);\n}}\n")
}

/// One thread per output element `(batch, i, j)`; `batch` indexes the
/// broadcast batch prefix, flattened row-major like `out`.
pub fn matmul_kernel(dtype: Dtype) -> String {
    let t = dtype.c_type();
    format!(
        "extern \"C\" __global__ void matmul_{dtype}(\n    {t}* a, {t}* b, {t}* out,\n    int batch, int m, int k, int n\n) {{\n    {THREAD_INDEX}\n    int total = batch * m * n;\n    if (idx >= total) return;\n    int j = idx % n;\n    int i = (idx / n) % m;\n    int bi = idx / (m * n);\n    {t} acc = 0;\n    for (int p = 0; p < k; p++) {{\n        acc += a[bi * m * k + i * k + p] * b[bi * k * n + p * n + j];\n    }}\n    out[idx] = acc;\n}}\n",
    )
}

/// Full-reduction sum over contiguous input, one thread per output group;
/// `group_size` is the number of contiguous input elements folded into
/// each output element (keepdim semantics handled by the caller's shape).
pub fn reduce_sum_kernel(dtype: Dtype) -> String {
    let t = dtype.c_type();
    format!(
        "extern \"C\" __global__ void reduce_sum_{dtype}({t}* in0, {t}* out, int n_out, int group_size) {{\n    {THREAD_INDEX}\n    if (idx >= n_out) return;\n    {t} acc = 0;\n    for (int g = 0; g < group_size; g++) {{\n        acc += in0[idx * group_size + g];\n    }}\n    out[idx] = acc;\n}}\n",
    )
}

pub fn reduce_max_kernel(dtype: Dtype) -> String {
    let t = dtype.c_type();
    format!(
        "extern \"C\" __global__ void reduce_max_{dtype}({t}* in0, {t}* out, int* argmax, int n_out, int group_size) {{\n    {THREAD_INDEX}\n    if (idx >= n_out) return;\n    {t} best = in0[idx * group_size];\n    int best_g = 0;\n    for (int g = 1; g < group_size; g++) {{\n        {t} v = in0[idx * group_size + g];\n        if (v > best) {{ best = v; best_g = g; }}\n    }}\n    out[idx] = best;\n    argmax[idx] = idx * group_size + best_g;\n}}\n",
    )
}

pub const UNARY_EXPRS: &[(&str, &str)] = &[
    ("exp", "expf(x)"),
    ("log", "logf(x)"),
    ("neg", "-x"),
    ("recip", "1.0f / x"),
    ("sqrt", "sqrtf(x)"),
    ("sq", "x * x"),
];

pub const BINARY_EXPRS: &[(&str, &str)] = &[
    ("add", "a + b"),
    ("sub", "a - b"),
    ("mul", "a * b"),
    ("div", "a / b"),
    ("eq", "a == b"),
    ("neq", "a != b"),
    ("lt", "a < b"),
    ("gt", "a > b"),
    ("leq", "a <= b"),
    ("geq", "a >= b"),
];

/// Whole-catalog source text for the dtypes the backend supports, suitable
/// for a single `compile_ptx` call at context construction, mirroring
/// `ELEMENTWISE_KERNELS` in the teacher's `backend/cuda/kernels.rs`.
pub fn catalog_source(dtype: Dtype) -> String {
    let mut src = String::new();
    for (op, expr) in UNARY_EXPRS {
        src.push_str(&unary_dense(dtype, op, expr));
        src.push_str(&unary_strided(dtype, op, expr));
    }
    for (op, expr) in BINARY_EXPRS {
        src.push_str(&binary_dense(dtype, op, expr));
        src.push_str(&binary_strided(dtype, op, expr));
    }
    src.push_str(&copy_dense(dtype));
    src.push_str(&sparse_copy(dtype));
    src.push_str(&scatter_kernel(dtype));
    src.push_str(&constant_kernel(dtype));
    src.push_str(&arange_kernel(dtype));
    src
}
