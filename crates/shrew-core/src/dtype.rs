use std::fmt;

// DType — Element data types understood by the Shrew backends
//
// Every tensor handed to a backend carries a DType that fixes its element
// size. The emitters only accept the subset the kernel library implements;
// the rest exist so graph-level tensors can be described before a backend
// is chosen.
//
//   F16  — 16-bit IEEE half float
//   BF16 — 16-bit brain float
//   F32  — 32-bit float, the default workhorse
//   F64  — 64-bit float
//   I8   — signed byte, quantized weights and activations
//   U8   — unsigned byte, quantized activations and pooling masks
//   I32  — signed 32-bit int, quantized accumulators and biases
//   U32  — unsigned 32-bit int, indices
//   I64  — signed 64-bit int, labels/indices

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I8,
    U8,
    I32,
    U32,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::I8 | DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::U32 => "u32",
            DType::I64 => "i64",
        };
        write!(f, "{}", s)
    }
}
