//! Data movement kernels: layout reorders, quantize/dequantize reorders,
//! slices (a view of the source copied into the result) and concatenation.

use log::trace;

use crate::attr::PrimitiveAttr;
use crate::engine::{expect, expect_rank, expect_types, Engine};
use crate::error::{BackendError, Result};
use crate::memory::MemoryDesc;
use crate::primitive::{Kernel, KernelDesc, PrimitiveHandle};

use super::{construct, Emitter};

const REORDER: &str = "reorder";
const QUANTIZE: &str = "quantize reorder";
const SLICE: &str = "slice";
const CONCAT: &str = "concat";

/// Copy `src` into `dst`, converting layout and element type.
#[derive(Debug, Clone, PartialEq)]
pub struct ReorderDesc {
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
}

/// A resolved reorder. `view` is the window of `src` that is actually read;
/// it is set for slices and shares the source buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReorderPd {
    pub src: MemoryDesc,
    pub view: Option<MemoryDesc>,
    pub dst: MemoryDesc,
}

impl ReorderPd {
    /// The descriptor the kernel reads from.
    pub fn input(&self) -> &MemoryDesc {
        self.view.as_ref().unwrap_or(&self.src)
    }
}

impl ReorderDesc {
    pub fn new(src: MemoryDesc, dst: MemoryDesc) -> Self {
        ReorderDesc { src, dst }
    }

    pub(crate) fn resolve(
        &self,
        engine: &Engine,
        attr: &PrimitiveAttr,
    ) -> std::result::Result<ReorderPd, BackendError> {
        expect(!self.src.is_any(), || "reorder source layout must be known".to_string())?;
        expect(self.src.dims() == self.dst.dims(), || {
            format!(
                "reorder from {:?} to {:?} changes dims",
                self.src.dims(),
                self.dst.dims()
            )
        })?;
        let dst = engine.resolve_data(&self.dst, Some(&self.src))?;
        resolve_scales(&self.src, &dst, attr)?;
        Ok(ReorderPd {
            src: self.src.clone(),
            view: None,
            dst,
        })
    }
}

fn resolve_scales(
    src: &MemoryDesc,
    dst: &MemoryDesc,
    attr: &PrimitiveAttr,
) -> std::result::Result<(), BackendError> {
    if attr.output_scales.is_some() {
        expect(!src.data_type().is_int8() || dst.data_type() != src.data_type(), || {
            format!("cannot requantize {} in place", src.data_type())
        })?;
    }
    attr.validate(dst.dims())
}

/// Copy the window `[lower_bounds, lower_bounds + result_shape)` of `src`.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceDesc {
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub lower_bounds: Vec<usize>,
    pub result_shape: Vec<usize>,
}

impl SliceDesc {
    pub fn new(src: MemoryDesc, dst: MemoryDesc, lower_bounds: Vec<usize>, result_shape: Vec<usize>) -> Self {
        SliceDesc {
            src,
            dst,
            lower_bounds,
            result_shape,
        }
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> std::result::Result<ReorderPd, BackendError> {
        let view = self
            .src
            .view(&self.result_shape, &self.lower_bounds)
            .map_err(|e| BackendError::invalid(e.to_string()))?;
        expect(self.dst.dims() == view.dims(), || {
            format!(
                "slice result {:?} does not match window {:?}",
                self.dst.dims(),
                view.dims()
            )
        })?;
        expect(self.dst.data_type() == view.data_type(), || {
            "slice cannot convert element types".to_string()
        })?;
        let dst = engine.resolve_data(&self.dst, Some(&self.src))?;
        Ok(ReorderPd {
            src: self.src.clone(),
            view: Some(view),
            dst,
        })
    }
}

/// Join `srcs` along `axis`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcatDesc {
    pub srcs: Vec<MemoryDesc>,
    pub dst: MemoryDesc,
    pub axis: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcatPd {
    pub srcs: Vec<MemoryDesc>,
    pub dst: MemoryDesc,
    pub axis: usize,
}

impl ConcatDesc {
    pub fn new(srcs: Vec<MemoryDesc>, dst: MemoryDesc, axis: usize) -> Self {
        ConcatDesc { srcs, dst, axis }
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> std::result::Result<ConcatPd, BackendError> {
        let first = self
            .srcs
            .first()
            .ok_or_else(|| BackendError::invalid("concat needs at least one input"))?;
        let rank = first.ndims();
        expect(self.axis < rank, || {
            format!("concat axis {} out of range for rank {}", self.axis, rank)
        })?;
        expect_rank("dst", &self.dst, &[rank])?;

        let mut extent = 0;
        for (i, src) in self.srcs.iter().enumerate() {
            expect_rank("input", src, &[rank])?;
            expect(!src.is_any(), || format!("concat input {} has no layout", i))?;
            expect(src.data_type() == first.data_type(), || {
                format!("concat input {} is {}, expected {}", i, src.data_type(), first.data_type())
            })?;
            for d in (0..rank).filter(|&d| d != self.axis) {
                expect(src.dims()[d] == self.dst.dims()[d], || {
                    format!(
                        "concat input {} has extent {} on dim {}, result has {}",
                        i,
                        src.dims()[d],
                        d,
                        self.dst.dims()[d]
                    )
                })?;
            }
            extent += src.dims()[self.axis];
        }
        expect(extent == self.dst.dims()[self.axis], || {
            format!(
                "concat inputs sum to {} on axis {}, result has {}",
                extent,
                self.axis,
                self.dst.dims()[self.axis]
            )
        })?;

        expect_types("dst", &self.dst, &[first.data_type()])?;
        let dst = engine.resolve_data(&self.dst, Some(first))?;
        Ok(ConcatPd {
            srcs: self.srcs.clone(),
            dst,
            axis: self.axis,
        })
    }
}

impl Emitter {
    /// Layout conversion. Dependencies: `[src, dst]`.
    pub fn build_reorder(&mut self, input: &MemoryDesc, result: &MemoryDesc) -> Result<PrimitiveHandle> {
        let attr = PrimitiveAttr::default();
        let pd = construct(REORDER, ReorderDesc::new(input.clone(), result.clone()).resolve(&self.engine, &attr))?;
        let handle = self.reserve_primitive_space(3, false)?;
        self.install_reorder(pd, attr, handle)?;
        Ok(handle)
    }

    pub fn rebuild_reorder(&mut self, desc: &ReorderDesc, handle: PrimitiveHandle) -> Result<()> {
        let attr = PrimitiveAttr::default();
        let pd = construct(REORDER, desc.resolve(&self.engine, &attr))?;
        self.install_reorder(pd, attr, handle)
    }

    /// Scaled type-converting reorder with per-tensor scales and nearest
    /// rounding. Dependencies: `[src, dst]`.
    pub fn build_quantize_reorder(
        &mut self,
        input: &MemoryDesc,
        result: &MemoryDesc,
        scales: &[f32],
    ) -> Result<PrimitiveHandle> {
        let attr = PrimitiveAttr::quantized(0, scales.to_vec());
        let pd = construct(QUANTIZE, ReorderDesc::new(input.clone(), result.clone()).resolve(&self.engine, &attr))?;
        let handle = self.reserve_primitive_space(3, false)?;
        self.install_reorder(pd, attr, handle)?;
        Ok(handle)
    }

    /// Rebuild a quantize reorder; `mask` selects the per-channel axes.
    pub fn rebuild_quantize_reorder(
        &mut self,
        desc: &ReorderDesc,
        scales: &[f32],
        mask: u32,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let attr = PrimitiveAttr::quantized(mask, scales.to_vec());
        let pd = construct(QUANTIZE, desc.resolve(&self.engine, &attr))?;
        self.install_reorder(pd, attr, handle)
    }

    /// Dequantize with the first scale of a constant scale operand, or 1.0
    /// when the scale is not a constant. Dependencies: `[src, dst]`.
    pub fn build_dequantization(
        &mut self,
        input: &MemoryDesc,
        result: &MemoryDesc,
        scale: Option<&[f32]>,
    ) -> Result<PrimitiveHandle> {
        let first = scale.and_then(|s| s.first().copied()).unwrap_or(1.0);
        trace!("emitter: dequantization scale {}", first);
        self.build_quantize_reorder(input, result, &[first])
    }

    /// Copy a window of `input` into `result`. Dependencies: `[src, dst]`;
    /// `src` holds the whole input buffer.
    pub fn build_slice(
        &mut self,
        input: &MemoryDesc,
        result: &MemoryDesc,
        lower_bounds: &[usize],
        result_shape: &[usize],
    ) -> Result<PrimitiveHandle> {
        let desc = SliceDesc::new(
            input.clone(),
            result.clone(),
            lower_bounds.to_vec(),
            result_shape.to_vec(),
        );
        let pd = construct(SLICE, desc.resolve(&self.engine))?;
        let handle = self.reserve_primitive_space(3, false)?;
        self.install_reorder(pd, PrimitiveAttr::default(), handle)?;
        Ok(handle)
    }

    pub fn rebuild_slice(&mut self, desc: &SliceDesc, handle: PrimitiveHandle) -> Result<()> {
        let pd = construct(SLICE, desc.resolve(&self.engine))?;
        self.install_reorder(pd, PrimitiveAttr::default(), handle)
    }

    fn install_reorder(&mut self, pd: ReorderPd, attr: PrimitiveAttr, handle: PrimitiveHandle) -> Result<()> {
        let deps = self.install_deps(handle, 2)?;
        let src = self.place_memory(&deps, handle, 0, &pd.src)?;
        let dst = self.place_memory(&deps, handle, 1, &pd.dst)?;
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::Reorder(pd),
                attr,
                args: vec![src, dst],
            },
        )
    }

    /// Concatenation along `axis`. Dependencies: the inputs in order, then
    /// the result.
    pub fn build_concat(&mut self, inputs: &[MemoryDesc], result: &MemoryDesc, axis: usize) -> Result<PrimitiveHandle> {
        let pd = construct(CONCAT, ConcatDesc::new(inputs.to_vec(), result.clone(), axis).resolve(&self.engine))?;
        let handle = self.reserve_primitive_space(pd.srcs.len() + 2, false)?;
        self.install_concat(pd, handle)?;
        Ok(handle)
    }

    pub fn rebuild_concat(&mut self, desc: &ConcatDesc, handle: PrimitiveHandle) -> Result<()> {
        let pd = construct(CONCAT, desc.resolve(&self.engine))?;
        self.install_concat(pd, handle)
    }

    fn install_concat(&mut self, pd: ConcatPd, handle: PrimitiveHandle) -> Result<()> {
        let n = pd.srcs.len();
        let deps = self.install_deps(handle, n + 1)?;
        let mut args = Vec::with_capacity(n + 1);
        for (i, src) in pd.srcs.iter().enumerate() {
            args.push(self.place_memory(&deps, handle, i, src)?);
        }
        args.push(self.place_memory(&deps, handle, n, &pd.dst)?);
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::Concat(pd),
                attr: PrimitiveAttr::default(),
                args,
            },
        )
    }
}
