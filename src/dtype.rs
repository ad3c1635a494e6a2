use serde::{Deserialize, Serialize};

/// Element type carried by a tensor.
///
/// `B8` is a one-byte boolean representation (used by comparison ops),
/// `I32` backs integer ranges (`arange`) and index tensors, `F32` is the
/// default floating dtype for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    B8,
    I32,
    F32,
}

impl Dtype {
    pub fn byte_size(self) -> usize {
        match self {
            Dtype::B8 => 1,
            Dtype::I32 => 4,
            Dtype::F32 => 4,
        }
    }

    /// Suffix used in generated/cached kernel names, e.g. `add_f32`.
    pub fn kernel_suffix(self) -> &'static str {
        match self {
            Dtype::B8 => "b8",
            Dtype::I32 => "i32",
            Dtype::F32 => "f32",
        }
    }

    /// C type name used in generated CUDA kernel source.
    pub fn c_type(self) -> &'static str {
        match self {
            Dtype::B8 => "unsigned char",
            Dtype::I32 => "int",
            Dtype::F32 => "float",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Dtype::F32)
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kernel_suffix())
    }
}

impl Default for Dtype {
    fn default() -> Self {
        Dtype::F32
    }
}
