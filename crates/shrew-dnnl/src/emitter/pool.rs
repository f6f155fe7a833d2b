//! Pooling kernels.
//!
//! Max pooling needs the argmax of every window to run backward, recorded in
//! a workspace the forward pass writes. Two ways of providing it exist:
//!
//! - with indices: the forward kernel owns a workspace (memory primitive plus
//!   buffer) and the backward kernel references the very same handles;
//! - without indices: forward and backward are emitted together at backward
//!   time, and the forward's throwaway output is written into the backward
//!   result buffer (see [`Emitter::alias_diff_src_as_forward_scratch`]).

use crate::attr::PrimitiveAttr;
use crate::engine::{expect, expect_rank, expect_types, window_output, Engine, PropKind};
use crate::error::{BackendError, Error, Result};
use crate::memory::{DataType, MemoryDesc};
use crate::primitive::{
    Dependency, DependencyList, Kernel, KernelDesc, Primitive, PrimitiveHandle, WorkspaceHandle,
};

use super::conv::adopt;
use super::{construct, Emitter};

const POOL_FORWARD: &str = "pooling forward";
const POOL_BACKWARD: &str = "pooling backward";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingAlgorithm {
    Max,
    /// Average over the window, padding counted in the divisor.
    AvgIncludePadding,
    /// Average over the in-bounds part of the window.
    AvgExcludePadding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolGeometry {
    pub window_shape: Vec<usize>,
    pub strides: Vec<usize>,
    pub padding_below: Vec<usize>,
    pub padding_above: Vec<usize>,
}

impl PoolGeometry {
    pub fn new(
        window_shape: Vec<usize>,
        strides: Vec<usize>,
        padding_below: Vec<usize>,
        padding_above: Vec<usize>,
    ) -> Self {
        PoolGeometry {
            window_shape,
            strides,
            padding_below,
            padding_above,
        }
    }

    fn window_volume(&self) -> usize {
        self.window_shape.iter().product()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolingForwardDesc {
    pub prop_kind: PropKind,
    pub algorithm: PoolingAlgorithm,
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub geometry: PoolGeometry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolingForwardPd {
    pub prop_kind: PropKind,
    pub algorithm: PoolingAlgorithm,
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    /// Argmax workspace; present for max pooling in training mode.
    pub workspace: Option<MemoryDesc>,
    pub geometry: PoolGeometry,
}

impl PoolingForwardDesc {
    pub fn new(
        prop_kind: PropKind,
        algorithm: PoolingAlgorithm,
        src: MemoryDesc,
        dst: MemoryDesc,
        geometry: PoolGeometry,
    ) -> Self {
        PoolingForwardDesc {
            prop_kind,
            algorithm,
            src,
            dst,
            geometry,
        }
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> std::result::Result<PoolingForwardPd, BackendError> {
        expect_rank("src", &self.src, &[4, 5])?;
        expect_rank("dst", &self.dst, &[self.src.ndims()])?;
        let spatial = self.src.ndims() - 2;
        let g = &self.geometry;
        for (name, v) in [
            ("window_shape", &g.window_shape),
            ("strides", &g.strides),
            ("padding_below", &g.padding_below),
            ("padding_above", &g.padding_above),
        ] {
            expect(v.len() == spatial, || {
                format!("{} has {} entries for {} spatial dims", name, v.len(), spatial)
            })?;
        }
        expect_types(
            "src",
            &self.src,
            &[DataType::F32, DataType::S32, DataType::S8, DataType::U8],
        )?;
        expect_types("dst", &self.dst, &[self.src.data_type()])?;
        let src = self.src.dims();
        let dst = self.dst.dims();
        expect(src[..2] == dst[..2], || {
            format!(
                "pooling keeps batch and channels: src {:?}, dst {:?}",
                src, dst
            )
        })?;
        for i in 0..spatial {
            let out = window_output(
                src[2 + i],
                g.window_shape[i],
                g.strides[i],
                1,
                g.padding_below[i],
                g.padding_above[i],
            );
            expect(out == Some(dst[2 + i]), || {
                format!(
                    "spatial dim {}: dst extent {} does not match computed {:?}",
                    i,
                    dst[2 + i],
                    out
                )
            })?;
        }

        let src = engine.resolve_data(&self.src, Some(&self.dst))?;
        let dst = engine.resolve_data(&self.dst, Some(&src))?;
        let workspace = if self.algorithm == PoolingAlgorithm::Max
            && self.prop_kind == PropKind::ForwardTraining
        {
            let ws_type = if g.window_volume() < 256 {
                DataType::U8
            } else {
                DataType::S32
            };
            Some(dst.with_data_type(ws_type))
        } else {
            None
        };
        Ok(PoolingForwardPd {
            prop_kind: self.prop_kind,
            algorithm: self.algorithm,
            src,
            dst,
            workspace,
            geometry: self.geometry.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolingBackwardDesc {
    pub algorithm: PoolingAlgorithm,
    pub diff_src: MemoryDesc,
    pub diff_dst: MemoryDesc,
    pub geometry: PoolGeometry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolingBackwardPd {
    pub algorithm: PoolingAlgorithm,
    pub diff_src: MemoryDesc,
    pub diff_dst: MemoryDesc,
    pub workspace: Option<MemoryDesc>,
    pub geometry: PoolGeometry,
    pub hint: Box<PoolingForwardPd>,
}

impl PoolingBackwardDesc {
    pub fn new(
        algorithm: PoolingAlgorithm,
        diff_src: MemoryDesc,
        diff_dst: MemoryDesc,
        geometry: PoolGeometry,
    ) -> Self {
        PoolingBackwardDesc {
            algorithm,
            diff_src,
            diff_dst,
            geometry,
        }
    }

    /// The training-mode forward descriptor over the same geometry.
    pub fn forward_hint(&self) -> PoolingForwardDesc {
        PoolingForwardDesc::new(
            PropKind::ForwardTraining,
            self.algorithm,
            self.diff_src.clone(),
            self.diff_dst.clone(),
            self.geometry.clone(),
        )
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> std::result::Result<PoolingBackwardPd, BackendError> {
        expect_types("diff_src", &self.diff_src, &[DataType::F32])?;
        expect_types("diff_dst", &self.diff_dst, &[DataType::F32])?;
        let hint = self.forward_hint().resolve(engine)?;
        Ok(PoolingBackwardPd {
            algorithm: self.algorithm,
            diff_src: adopt(&self.diff_src, &hint.src)?,
            diff_dst: adopt(&self.diff_dst, &hint.dst)?,
            workspace: hint.workspace.clone(),
            geometry: self.geometry.clone(),
            hint: Box::new(hint),
        })
    }
}

fn max_only(desc: &PoolingForwardDesc) -> Result<()> {
    if desc.algorithm == PoolingAlgorithm::Max && desc.prop_kind == PropKind::ForwardTraining {
        Ok(())
    } else {
        Err(Error::Unsupported(
            "pooling with indices requires max pooling in training mode".into(),
        ))
    }
}

fn missing_workspace(primitive: &'static str) -> Error {
    Error::construction(
        primitive,
        BackendError::invalid("max pooling workspace was not resolved"),
    )
}

impl Emitter {
    /// Pooling forward in inference mode. Dependencies: `[src, dst]`.
    pub fn build_pooling_forward(
        &mut self,
        algorithm: PoolingAlgorithm,
        src: &MemoryDesc,
        dst: &MemoryDesc,
        geometry: &PoolGeometry,
    ) -> Result<PrimitiveHandle> {
        let desc = PoolingForwardDesc::new(
            PropKind::ForwardInference,
            algorithm,
            src.clone(),
            dst.clone(),
            geometry.clone(),
        );
        let pd = self.resolve_pooling_forward(&desc)?;
        let handle = self.reserve_primitive_space(3, false)?;
        self.install_pooling_forward(pd, handle)?;
        Ok(handle)
    }

    pub fn rebuild_pooling_forward(&mut self, desc: &PoolingForwardDesc, handle: PrimitiveHandle) -> Result<()> {
        let pd = self.resolve_pooling_forward(desc)?;
        self.install_pooling_forward(pd, handle)
    }

    fn resolve_pooling_forward(&self, desc: &PoolingForwardDesc) -> Result<PoolingForwardPd> {
        let pd = construct(POOL_FORWARD, desc.resolve(&self.engine))?;
        if pd.workspace.is_some() {
            return Err(Error::Unsupported(
                "max pooling in training mode needs a workspace; build it with indices".into(),
            ));
        }
        Ok(pd)
    }

    fn install_pooling_forward(&mut self, pd: PoolingForwardPd, handle: PrimitiveHandle) -> Result<()> {
        let deps = self.install_deps(handle, 2)?;
        let src = self.place_memory(&deps, handle, 0, &pd.src)?;
        let dst = self.place_memory(&deps, handle, 1, &pd.dst)?;
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::PoolingForward(pd),
                attr: PrimitiveAttr::default(),
                args: vec![src, dst],
            },
        )
    }

    /// Quantized max pooling over integer data. Dependencies: `[src, dst]`.
    pub fn build_quantized_max_pool(
        &mut self,
        src: &MemoryDesc,
        dst: &MemoryDesc,
        geometry: &PoolGeometry,
    ) -> Result<PrimitiveHandle> {
        Self::check_quantized_pool(src)?;
        self.build_pooling_forward(PoolingAlgorithm::Max, src, dst, geometry)
    }

    /// Quantized average pooling over integer data. Dependencies: `[src, dst]`.
    pub fn build_quantized_avg_pool(
        &mut self,
        src: &MemoryDesc,
        dst: &MemoryDesc,
        geometry: &PoolGeometry,
        include_padding: bool,
    ) -> Result<PrimitiveHandle> {
        Self::check_quantized_pool(src)?;
        let algorithm = if include_padding {
            PoolingAlgorithm::AvgIncludePadding
        } else {
            PoolingAlgorithm::AvgExcludePadding
        };
        self.build_pooling_forward(algorithm, src, dst, geometry)
    }

    fn check_quantized_pool(src: &MemoryDesc) -> Result<()> {
        if src.data_type().is_int8() {
            Ok(())
        } else {
            Err(Error::Unsupported(format!(
                "quantized pooling expects u8 or s8 input, got {}",
                src.data_type()
            )))
        }
    }

    /// Average pooling backward. Dependencies: `[diff_dst, diff_src]`.
    /// Max pooling goes through [`Emitter::build_max_pooling_backward`] or
    /// the with-indices pair instead.
    pub fn build_pooling_backward(
        &mut self,
        algorithm: PoolingAlgorithm,
        diff_dst: &MemoryDesc,
        diff_src: &MemoryDesc,
        geometry: &PoolGeometry,
    ) -> Result<PrimitiveHandle> {
        let desc = PoolingBackwardDesc::new(algorithm, diff_src.clone(), diff_dst.clone(), geometry.clone());
        let pd = self.resolve_pooling_backward(&desc)?;
        let handle = self.reserve_primitive_space(3, false)?;
        self.install_pooling_backward(pd, handle)?;
        Ok(handle)
    }

    pub fn rebuild_pooling_backward(&mut self, desc: &PoolingBackwardDesc, handle: PrimitiveHandle) -> Result<()> {
        let pd = self.resolve_pooling_backward(desc)?;
        self.install_pooling_backward(pd, handle)
    }

    fn resolve_pooling_backward(&self, desc: &PoolingBackwardDesc) -> Result<PoolingBackwardPd> {
        if desc.algorithm == PoolingAlgorithm::Max {
            return Err(Error::Unsupported(
                "max pooling backward needs the forward workspace".into(),
            ));
        }
        construct(POOL_BACKWARD, desc.resolve(&self.engine))
    }

    fn install_pooling_backward(&mut self, pd: PoolingBackwardPd, handle: PrimitiveHandle) -> Result<()> {
        let deps = self.install_deps(handle, 2)?;
        let diff_dst = self.place_memory(&deps, handle, 0, &pd.diff_dst)?;
        let diff_src = self.place_memory(&deps, handle, 1, &pd.diff_src)?;
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::PoolingBackward(pd),
                attr: PrimitiveAttr::default(),
                args: vec![diff_dst, diff_src],
            },
        )
    }

    // Max pooling backward without an index workspace

    /// The forward pass that regenerates the argmax workspace writes its
    /// pooled output into the backward result buffer: the backward pass
    /// overwrites diff_src anyway, and the forward output is never read.
    /// Only valid while diff_src is at least as large as that output.
    fn alias_diff_src_as_forward_scratch(diff_src: &MemoryDesc, forward_dst: &MemoryDesc) -> Result<()> {
        let required = forward_dst.size_in_bytes();
        let available = diff_src.size_in_bytes();
        if available < required {
            return Err(Error::WorkspaceAlias {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Reserve the forward/backward pair of [`Emitter::build_max_pooling_backward`]:
    /// slots `fprop_src, diff_dst, diff_src, ws, forward, backward`.
    pub fn reserve_max_pooling_backward(&mut self) -> Result<(PrimitiveHandle, PrimitiveHandle)> {
        let first = self.registry.reserve(6)?;
        let at = |i: usize| PrimitiveHandle(first.0 + i);
        let (fprop_src, diff_dst, diff_src, ws, fwd, bwd) = (at(0), at(1), at(2), at(3), at(4), at(5));
        self.registry.set_dependencies(
            fwd,
            DependencyList::new(vec![
                Dependency::Primitive(fprop_src),
                Dependency::Primitive(diff_src),
                Dependency::Primitive(ws),
                Dependency::PendingWorkspace,
            ]),
        )?;
        self.registry.set_dependencies(
            bwd,
            DependencyList::new(vec![
                Dependency::Primitive(diff_dst),
                Dependency::Primitive(ws),
                Dependency::Primitive(diff_src),
                Dependency::PendingWorkspace,
            ]),
        )?;
        Ok((fwd, bwd))
    }

    /// Max pooling backward that recomputes the argmax workspace with a
    /// forward kernel of its own. Forward dependencies: `[fprop_src,
    /// diff_src, ws, ws_buf]`; backward: `[diff_dst, ws, diff_src, ws_buf]`.
    /// Returns the backward handle.
    pub fn build_max_pooling_backward(
        &mut self,
        fprop_src: &MemoryDesc,
        diff_dst: &MemoryDesc,
        diff_src: &MemoryDesc,
        geometry: &PoolGeometry,
    ) -> Result<PrimitiveHandle> {
        let desc = PoolingBackwardDesc::new(
            PoolingAlgorithm::Max,
            diff_src.clone(),
            diff_dst.clone(),
            geometry.clone(),
        );
        let pd = construct(POOL_BACKWARD, desc.resolve(&self.engine))?;
        Self::check_max_pooling_pair(&pd, fprop_src)?;
        let (fwd, bwd) = self.reserve_max_pooling_backward()?;
        self.install_max_pooling_backward(pd, fprop_src, fwd, bwd)?;
        Ok(bwd)
    }

    pub fn rebuild_max_pooling_backward(
        &mut self,
        desc: &PoolingBackwardDesc,
        fprop_src: &MemoryDesc,
        fwd: PrimitiveHandle,
        bwd: PrimitiveHandle,
    ) -> Result<()> {
        let pd = construct(POOL_BACKWARD, desc.resolve(&self.engine))?;
        Self::check_max_pooling_pair(&pd, fprop_src)?;
        self.install_max_pooling_backward(pd, fprop_src, fwd, bwd)
    }

    fn check_max_pooling_pair(pd: &PoolingBackwardPd, fprop_src: &MemoryDesc) -> Result<()> {
        if pd.workspace.is_none() {
            return Err(missing_workspace(POOL_BACKWARD));
        }
        if fprop_src.dims() != pd.hint.src.dims() {
            return Err(Error::construction(
                POOL_FORWARD,
                BackendError::invalid(format!(
                    "forward src dims {:?} differ from diff_src dims {:?}",
                    fprop_src.dims(),
                    pd.hint.src.dims()
                )),
            ));
        }
        Self::alias_diff_src_as_forward_scratch(&pd.diff_src, &pd.hint.dst)
    }

    fn install_max_pooling_backward(
        &mut self,
        pd: PoolingBackwardPd,
        fprop_src_desc: &MemoryDesc,
        fwd: PrimitiveHandle,
        bwd: PrimitiveHandle,
    ) -> Result<()> {
        let ws_desc = pd.workspace.clone().ok_or_else(|| missing_workspace(POOL_BACKWARD))?;
        let fwd_deps = self.install_deps(fwd, 4)?;
        let bwd_deps = self.install_deps(bwd, 4)?;

        let fprop_src = self.place_memory(&fwd_deps, fwd, 0, fprop_src_desc)?;
        let diff_src = self.place_memory(&fwd_deps, fwd, 1, &pd.diff_src)?;
        let ws = self.place_memory(&fwd_deps, fwd, 2, &ws_desc)?;
        let diff_dst = self.place_memory(&bwd_deps, bwd, 0, &pd.diff_dst)?;
        if Self::dep_primitive(&bwd_deps, bwd, 1)? != ws || Self::dep_primitive(&bwd_deps, bwd, 2)? != diff_src {
            return Err(Error::msg(format!(
                "max pooling pair {} / {} does not share its workspace and diff_src slots",
                fwd, bwd
            )));
        }

        let ws_buf = self.place_workspace(fwd, 3, ws_desc.size_in_bytes())?;
        self.registry
            .patch_workspace(bwd, 3, Dependency::Workspace(ws_buf))?;

        let forward = (*pd.hint).clone();
        self.place_kernel(
            fwd,
            Kernel {
                desc: KernelDesc::PoolingForward(forward),
                attr: PrimitiveAttr::default(),
                args: vec![fprop_src, diff_src, ws],
            },
        )?;
        self.place_kernel(
            bwd,
            Kernel {
                desc: KernelDesc::PoolingBackward(pd),
                attr: PrimitiveAttr::default(),
                args: vec![diff_dst, ws, diff_src],
            },
        )
    }

    // Max pooling with indices

    /// Max pooling forward that keeps its argmax workspace for a later
    /// backward kernel. Dependencies: `[src, dst, ws, ws_buf]`.
    pub fn build_max_pooling_with_indices_forward(
        &mut self,
        src: &MemoryDesc,
        dst: &MemoryDesc,
        geometry: &PoolGeometry,
    ) -> Result<PrimitiveHandle> {
        let desc = PoolingForwardDesc::new(
            PropKind::ForwardTraining,
            PoolingAlgorithm::Max,
            src.clone(),
            dst.clone(),
            geometry.clone(),
        );
        let pd = construct(POOL_FORWARD, desc.resolve(&self.engine))?;
        let handle = self.reserve_primitive_space(4, true)?;
        self.install_max_pooling_with_indices_forward(pd, handle)?;
        Ok(handle)
    }

    /// Each rebuild allocates a fresh workspace buffer. Backward kernels tied
    /// to `handle` keep the previous buffer until they are rebuilt, so rebuild
    /// the forward first and its backward kernels after it.
    pub fn rebuild_max_pooling_with_indices_forward(
        &mut self,
        desc: &PoolingForwardDesc,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        max_only(desc)?;
        let pd = construct(POOL_FORWARD, desc.resolve(&self.engine))?;
        self.install_max_pooling_with_indices_forward(pd, handle)
    }

    fn install_max_pooling_with_indices_forward(
        &mut self,
        pd: PoolingForwardPd,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let ws_desc = pd.workspace.clone().ok_or_else(|| missing_workspace(POOL_FORWARD))?;
        let deps = self.install_deps(handle, 4)?;
        let src = self.place_memory(&deps, handle, 0, &pd.src)?;
        let dst = self.place_memory(&deps, handle, 1, &pd.dst)?;
        let ws = self.place_memory(&deps, handle, 2, &ws_desc)?;
        self.place_workspace(handle, 3, ws_desc.size_in_bytes())?;
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::PoolingForward(pd),
                attr: PrimitiveAttr::default(),
                args: vec![src, dst, ws],
            },
        )
    }

    /// Reserve a with-indices backward kernel tied to `forward`: slots
    /// `diff_dst, diff_src, backward`, with the forward's workspace entries
    /// in positions 1 and 3.
    pub fn reserve_max_pooling_with_indices_backward(&mut self, forward: PrimitiveHandle) -> Result<PrimitiveHandle> {
        let fwd_deps = self.install_deps(forward, 4)?;
        let ws = Self::dep_primitive(&fwd_deps, forward, 2)?;
        let ws_buf = fwd_deps.get(3).unwrap_or(Dependency::PendingWorkspace);
        let first = self.registry.reserve(3)?;
        let (diff_dst, diff_src, bwd) = (
            first,
            PrimitiveHandle(first.0 + 1),
            PrimitiveHandle(first.0 + 2),
        );
        self.registry.set_dependencies(
            bwd,
            DependencyList::new(vec![
                Dependency::Primitive(diff_dst),
                Dependency::Primitive(ws),
                Dependency::Primitive(diff_src),
                ws_buf,
            ]),
        )?;
        Ok(bwd)
    }

    /// Max pooling backward reading the workspace of `forward`.
    /// Dependencies: `[diff_dst, ws, diff_src, ws_buf]`, with `ws` and
    /// `ws_buf` identical to the forward's.
    pub fn build_max_pooling_with_indices_backward(
        &mut self,
        diff_dst: &MemoryDesc,
        diff_src: &MemoryDesc,
        geometry: &PoolGeometry,
        forward: PrimitiveHandle,
    ) -> Result<PrimitiveHandle> {
        let desc = PoolingBackwardDesc::new(
            PoolingAlgorithm::Max,
            diff_src.clone(),
            diff_dst.clone(),
            geometry.clone(),
        );
        let pd = construct(POOL_BACKWARD, desc.resolve(&self.engine))?;
        self.indices_forward_workspace(forward, &pd)?;
        let handle = self.reserve_max_pooling_with_indices_backward(forward)?;
        self.install_max_pooling_with_indices_backward(pd, forward, handle)?;
        Ok(handle)
    }

    /// `forward` must already be built; the backward takes over its current
    /// workspace buffer.
    pub fn rebuild_max_pooling_with_indices_backward(
        &mut self,
        desc: &PoolingBackwardDesc,
        forward: PrimitiveHandle,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let pd = construct(POOL_BACKWARD, desc.resolve(&self.engine))?;
        self.install_max_pooling_with_indices_backward(pd, forward, handle)
    }

    /// The workspace slot and buffer of the max pooling forward `forward`,
    /// checked against the backward kernel that is to share them.
    fn indices_forward_workspace(
        &self,
        forward: PrimitiveHandle,
        pd: &PoolingBackwardPd,
    ) -> Result<(PrimitiveHandle, WorkspaceHandle)> {
        let unlinked = |message: String| Error::construction(POOL_BACKWARD, BackendError::invalid(message));
        let kernel = self.registry.get(forward).ok().and_then(Primitive::as_kernel);
        let fwd = match kernel.map(|k| &k.desc) {
            Some(KernelDesc::PoolingForward(fwd)) => fwd,
            Some(other) => {
                return Err(unlinked(format!(
                    "{} is a {} kernel, not a max pooling forward",
                    forward,
                    other.name()
                )))
            }
            None => return Err(unlinked(format!("{} is not a built kernel", forward))),
        };
        let fwd_ws_desc = fwd
            .workspace
            .as_ref()
            .ok_or_else(|| unlinked(format!("forward {} keeps no argmax workspace", forward)))?;
        let ws_desc = pd.workspace.as_ref().ok_or_else(|| missing_workspace(POOL_BACKWARD))?;
        if pd.geometry != fwd.geometry
            || pd.diff_src.dims() != fwd.src.dims()
            || pd.diff_dst.dims() != fwd.dst.dims()
        {
            return Err(unlinked(format!(
                "backward {:?} -> {:?} does not match forward {} over {:?} -> {:?}",
                pd.diff_dst.dims(),
                pd.diff_src.dims(),
                forward,
                fwd.src.dims(),
                fwd.dst.dims()
            )));
        }
        if ws_desc.dims() != fwd_ws_desc.dims() || ws_desc.data_type() != fwd_ws_desc.data_type() {
            return Err(unlinked(format!(
                "backward workspace {} differs from forward workspace {}",
                ws_desc, fwd_ws_desc
            )));
        }

        let fwd_deps = self.install_deps(forward, 4)?;
        let ws = Self::dep_primitive(&fwd_deps, forward, 2)?;
        let ws_buf = fwd_deps
            .workspace(3)
            .ok_or_else(|| unlinked(format!("forward {} has no workspace buffer", forward)))?;
        let required = ws_desc.size_in_bytes();
        let available = self.workspaces.get(ws_buf)?.size();
        if available < required {
            return Err(Error::WorkspaceAlias {
                required,
                available,
            });
        }
        Ok((ws, ws_buf))
    }

    fn install_max_pooling_with_indices_backward(
        &mut self,
        pd: PoolingBackwardPd,
        forward: PrimitiveHandle,
        handle: PrimitiveHandle,
    ) -> Result<()> {
        let ws_desc = pd.workspace.clone().ok_or_else(|| missing_workspace(POOL_BACKWARD))?;
        let (fwd_ws, fwd_ws_buf) = self.indices_forward_workspace(forward, &pd)?;
        let deps = self.install_deps(handle, 4)?;
        if Self::dep_primitive(&deps, handle, 1)? != fwd_ws {
            return Err(Error::msg(format!(
                "pooling backward {} does not reference the workspace of forward {}",
                handle, forward
            )));
        }
        self.registry
            .patch_workspace(handle, 3, Dependency::Workspace(fwd_ws_buf))?;

        let diff_dst = self.place_memory(&deps, handle, 0, &pd.diff_dst)?;
        let ws = self.place_memory(&deps, handle, 1, &ws_desc)?;
        let diff_src = self.place_memory(&deps, handle, 2, &pd.diff_src)?;
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::PoolingBackward(pd),
                attr: PrimitiveAttr::default(),
                args: vec![diff_dst, ws, diff_src],
            },
        )
    }
}
