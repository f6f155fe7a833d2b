// Primitives — what a registry slot holds and how slots reference each other
//
// Two kinds of primitive live in the registry:
//
//   Memory  — a buffer described by a MemoryDesc. Its data pointer is bound
//             at execution time; at build time only the layout is known.
//   Kernel  — a resolved compute primitive plus its attribute set, bound to
//             the memory primitives it reads and writes (`args`, in the
//             engine's execution order).
//
// A kernel slot also owns a DependencyList: the handles generated code uses
// to patch buffer pointers, in a fixed per-operation order (inputs first,
// result last, workspace entries where the operation has them).

use std::fmt;

use crate::attr::PrimitiveAttr;
use crate::emitter::batchnorm::{BatchNormBackwardPd, BatchNormForwardPd};
use crate::emitter::conv::{
    ConvolutionBackwardDataPd, ConvolutionBackwardWeightsPd, ConvolutionForwardPd,
};
use crate::emitter::eltwise::{EltwiseBackwardPd, EltwiseForwardPd, LrnPd, SoftmaxPd, SumPd};
use crate::emitter::pool::{PoolingBackwardPd, PoolingForwardPd};
use crate::emitter::reorder::{ConcatPd, ReorderPd};
use crate::emitter::rnn::RnnForwardPd;
use crate::memory::MemoryDesc;

/// Stable index of a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimitiveHandle(pub(crate) usize);

impl PrimitiveHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for PrimitiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a workspace buffer; separate index space from primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkspaceHandle(pub(crate) usize);

impl WorkspaceHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkspaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws#{}", self.0)
    }
}

/// One entry of a dependency list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    Primitive(PrimitiveHandle),
    Workspace(WorkspaceHandle),
    /// Reserved workspace position, filled by the rebuild that allocates it.
    PendingWorkspace,
}

/// Ordered handles a kernel depends on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DependencyList(Vec<Dependency>);

impl DependencyList {
    pub fn new(deps: Vec<Dependency>) -> Self {
        DependencyList(deps)
    }

    /// A list of primitive handles only.
    pub fn primitives(handles: &[PrimitiveHandle]) -> Self {
        DependencyList(handles.iter().copied().map(Dependency::Primitive).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<Dependency> {
        self.0.get(i).copied()
    }

    /// The primitive handle at position `i`, if that entry is one.
    pub fn primitive(&self, i: usize) -> Option<PrimitiveHandle> {
        match self.0.get(i) {
            Some(Dependency::Primitive(h)) => Some(*h),
            _ => None,
        }
    }

    /// The workspace handle at position `i`, if that entry is one.
    pub fn workspace(&self, i: usize) -> Option<WorkspaceHandle> {
        match self.0.get(i) {
            Some(Dependency::Workspace(h)) => Some(*h),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.0.iter()
    }

    /// Raw indices as generated code consumes them. Pending workspace
    /// entries read as 0 until their buffer is allocated.
    pub fn indices(&self) -> Vec<usize> {
        self.0
            .iter()
            .map(|d| match d {
                Dependency::Primitive(h) => h.0,
                Dependency::Workspace(w) => w.0,
                Dependency::PendingWorkspace => 0,
            })
            .collect()
    }

    pub(crate) fn set(&mut self, i: usize, dep: Dependency) -> bool {
        match self.0.get_mut(i) {
            Some(slot) => {
                *slot = dep;
                true
            }
            None => false,
        }
    }
}

/// A resolved compute primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelDesc {
    ConvolutionForward(ConvolutionForwardPd),
    ConvolutionBackwardData(ConvolutionBackwardDataPd),
    ConvolutionBackwardWeights(ConvolutionBackwardWeightsPd),
    PoolingForward(PoolingForwardPd),
    PoolingBackward(PoolingBackwardPd),
    BatchNormForward(BatchNormForwardPd),
    BatchNormBackward(BatchNormBackwardPd),
    EltwiseForward(EltwiseForwardPd),
    EltwiseBackward(EltwiseBackwardPd),
    Sum(SumPd),
    Softmax(SoftmaxPd),
    Lrn(LrnPd),
    Reorder(ReorderPd),
    Concat(ConcatPd),
    Rnn(RnnForwardPd),
}

impl KernelDesc {
    /// Short kernel name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            KernelDesc::ConvolutionForward(_) => "convolution_forward",
            KernelDesc::ConvolutionBackwardData(_) => "convolution_backward_data",
            KernelDesc::ConvolutionBackwardWeights(_) => "convolution_backward_weights",
            KernelDesc::PoolingForward(_) => "pooling_forward",
            KernelDesc::PoolingBackward(_) => "pooling_backward",
            KernelDesc::BatchNormForward(_) => "batch_normalization_forward",
            KernelDesc::BatchNormBackward(_) => "batch_normalization_backward",
            KernelDesc::EltwiseForward(_) => "eltwise_forward",
            KernelDesc::EltwiseBackward(_) => "eltwise_backward",
            KernelDesc::Sum(_) => "sum",
            KernelDesc::Softmax(_) => "softmax_forward",
            KernelDesc::Lrn(_) => "lrn_forward",
            KernelDesc::Reorder(_) => "reorder",
            KernelDesc::Concat(_) => "concat",
            KernelDesc::Rnn(_) => "rnn_forward",
        }
    }
}

/// A compute primitive bound to its memory primitives.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub desc: KernelDesc,
    pub attr: PrimitiveAttr,
    /// Memory primitives in the engine's execution order.
    pub args: Vec<PrimitiveHandle>,
}

/// Contents of a built registry slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Memory(MemoryDesc),
    Kernel(Kernel),
}

impl Primitive {
    pub fn as_memory(&self) -> Option<&MemoryDesc> {
        match self {
            Primitive::Memory(desc) => Some(desc),
            Primitive::Kernel(_) => None,
        }
    }

    pub fn as_kernel(&self) -> Option<&Kernel> {
        match self {
            Primitive::Kernel(kernel) => Some(kernel),
            Primitive::Memory(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Memory(_) => "memory",
            Primitive::Kernel(k) => k.desc.name(),
        }
    }
}
