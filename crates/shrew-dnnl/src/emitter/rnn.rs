// RNN forward — one fused multi-layer, multi-direction recurrent kernel
//
// Operand dims, with L layers, D directions, T time steps, N batch, S states
// per cell, G gates per cell:
//
//   src_layer      [T, N, SLC]         tnc
//   src_iter       [L, D, S, N, SIC]   ldsnc
//   weights_layer  [L, D, SLC, G, DIC] ldigo
//   weights_iter   [L, D, SIC, G, DIC] ldigo
//   bias           [L, D, Gb, DIC]     ldgo  (Gb = G, or G + 1 for GRU-LBR)
//   dst_layer      [T, N, DLC]         tnc   (DLC = 2 * DIC for concat)
//   dst_iter       [L, D, S, N, DIC]   ldsnc
//
// The kernel always writes a workspace, even for inference.

use std::fmt;

use crate::attr::PrimitiveAttr;
use crate::engine::{expect, expect_dims, expect_rank, expect_types, Engine, PropKind};
use crate::error::{BackendError, Result};
use crate::memory::{DataType, MemoryDesc, MemoryFormat};
use crate::primitive::{Kernel, KernelDesc, PrimitiveHandle};

use super::{construct, Emitter};

const RNN_FORWARD: &str = "rnn forward";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RnnCell {
    VanillaRnn,
    Lstm,
    Gru,
    /// GRU with the reset gate applied after the recurrent product.
    GruLinearBeforeReset,
}

impl RnnCell {
    pub fn gates(&self) -> usize {
        match self {
            RnnCell::VanillaRnn => 1,
            RnnCell::Lstm => 4,
            RnnCell::Gru | RnnCell::GruLinearBeforeReset => 3,
        }
    }

    pub fn states(&self) -> usize {
        match self {
            RnnCell::Lstm => 2,
            _ => 1,
        }
    }

    pub fn bias_gates(&self) -> usize {
        match self {
            RnnCell::GruLinearBeforeReset => self.gates() + 1,
            _ => self.gates(),
        }
    }
}

impl fmt::Display for RnnCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RnnCell::VanillaRnn => write!(f, "vanilla_rnn"),
            RnnCell::Lstm => write!(f, "vanilla_lstm"),
            RnnCell::Gru => write!(f, "vanilla_gru"),
            RnnCell::GruLinearBeforeReset => write!(f, "gru_linear_before_reset"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RnnDirection {
    UnidirectionalLeft2Right,
    UnidirectionalRight2Left,
    BidirectionalConcat,
    BidirectionalSum,
}

impl RnnDirection {
    pub fn directions(&self) -> usize {
        match self {
            RnnDirection::UnidirectionalLeft2Right | RnnDirection::UnidirectionalRight2Left => 1,
            RnnDirection::BidirectionalConcat | RnnDirection::BidirectionalSum => 2,
        }
    }

    /// Channels of `dst_layer` per output channel of one direction.
    fn dst_layer_factor(&self) -> usize {
        match self {
            RnnDirection::BidirectionalConcat => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RnnForwardDesc {
    pub prop_kind: PropKind,
    pub cell: RnnCell,
    pub direction: RnnDirection,
    pub src_layer: MemoryDesc,
    pub src_iter: MemoryDesc,
    pub weights_layer: MemoryDesc,
    pub weights_iter: MemoryDesc,
    pub bias: MemoryDesc,
    pub dst_layer: MemoryDesc,
    pub dst_iter: MemoryDesc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RnnForwardPd {
    pub prop_kind: PropKind,
    pub cell: RnnCell,
    pub direction: RnnDirection,
    pub src_layer: MemoryDesc,
    pub src_iter: MemoryDesc,
    pub weights_layer: MemoryDesc,
    pub weights_iter: MemoryDesc,
    pub bias: MemoryDesc,
    pub dst_layer: MemoryDesc,
    pub dst_iter: MemoryDesc,
    pub workspace: MemoryDesc,
}

/// Problem sizes read off the operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RnnSizes {
    layers: usize,
    dirs: usize,
    steps: usize,
    batch: usize,
    slc: usize,
    sic: usize,
    dic: usize,
}

impl RnnSizes {
    /// Workspace bytes: gate activations, per-step states and, for GRU-LBR,
    /// the extra grid of recurrent products, all in f32.
    fn workspace_bytes(&self, cell: RnnCell) -> std::result::Result<usize, BackendError> {
        let RnnSizes {
            layers,
            dirs,
            steps,
            batch,
            slc,
            sic,
            dic,
        } = *self;
        let overflow = || BackendError::invalid("rnn workspace size overflows usize");
        let product = |factors: &[usize]| {
            factors
                .iter()
                .try_fold(1usize, |acc, &f| acc.checked_mul(f))
                .ok_or_else(overflow)
        };
        let gates = product(&[layers, dirs, steps, batch, cell.gates(), dic])?;
        let states = product(&[
            layers.saturating_add(1),
            dirs,
            steps.saturating_add(1),
            cell.states(),
            batch,
            slc.max(sic).max(dic),
        ])?;
        let grid = match cell {
            RnnCell::GruLinearBeforeReset => product(&[layers, dirs, steps, batch, dic])?,
            _ => 0,
        };
        gates
            .checked_add(states)
            .and_then(|n| n.checked_add(grid))
            .and_then(|n| n.checked_mul(DataType::F32.size_in_bytes()))
            .ok_or_else(overflow)
    }
}

impl RnnForwardDesc {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cell: RnnCell,
        direction: RnnDirection,
        src_layer: MemoryDesc,
        src_iter: MemoryDesc,
        weights_layer: MemoryDesc,
        weights_iter: MemoryDesc,
        bias: MemoryDesc,
        dst_layer: MemoryDesc,
        dst_iter: MemoryDesc,
    ) -> Self {
        RnnForwardDesc {
            prop_kind: PropKind::ForwardTraining,
            cell,
            direction,
            src_layer,
            src_iter,
            weights_layer,
            weights_iter,
            bias,
            dst_layer,
            dst_iter,
        }
    }

    fn sizes(&self) -> std::result::Result<RnnSizes, BackendError> {
        expect_rank("src_layer", &self.src_layer, &[3])?;
        expect_rank("src_iter", &self.src_iter, &[5])?;
        expect_rank("weights_layer", &self.weights_layer, &[5])?;
        expect_rank("weights_iter", &self.weights_iter, &[5])?;
        expect_rank("bias", &self.bias, &[4])?;
        expect_rank("dst_layer", &self.dst_layer, &[3])?;
        expect_rank("dst_iter", &self.dst_iter, &[5])?;

        let [steps, batch, slc] = [0, 1, 2].map(|i| self.src_layer.dims()[i]);
        let layers = self.weights_layer.dims()[0];
        let dirs = self.direction.directions();
        let g = self.cell.gates();
        let s = self.cell.states();
        let dic = self.weights_layer.dims()[4];
        let sic = self.weights_iter.dims()[2];

        expect(layers > 0 && steps > 0 && batch > 0, || {
            "rnn needs at least one layer, step and batch entry".to_string()
        })?;
        expect_dims("weights_layer", &self.weights_layer, &[layers, dirs, slc, g, dic])?;
        expect_dims("weights_iter", &self.weights_iter, &[layers, dirs, sic, g, dic])?;
        expect_dims("bias", &self.bias, &[layers, dirs, self.cell.bias_gates(), dic])?;
        expect_dims("src_iter", &self.src_iter, &[layers, dirs, s, batch, sic])?;
        expect_dims("dst_iter", &self.dst_iter, &[layers, dirs, s, batch, dic])?;
        expect_dims(
            "dst_layer",
            &self.dst_layer,
            &[steps, batch, dic * self.direction.dst_layer_factor()],
        )?;
        if layers > 1 {
            expect(slc == dic, || {
                format!(
                    "stacked rnn layers need matching channels, got input {} and output {}",
                    slc, dic
                )
            })?;
        }
        Ok(RnnSizes {
            layers,
            dirs,
            steps,
            batch,
            slc,
            sic,
            dic,
        })
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> std::result::Result<RnnForwardPd, BackendError> {
        let operands = [
            ("src_layer", &self.src_layer),
            ("src_iter", &self.src_iter),
            ("weights_layer", &self.weights_layer),
            ("weights_iter", &self.weights_iter),
            ("bias", &self.bias),
            ("dst_layer", &self.dst_layer),
            ("dst_iter", &self.dst_iter),
        ];
        for (name, desc) in operands {
            expect_types(name, desc, &[DataType::F32])?;
        }
        let sizes = self.sizes()?;
        let workspace = MemoryDesc::new(
            vec![sizes.workspace_bytes(self.cell)?],
            DataType::U8,
            MemoryFormat::X,
        )
        .map_err(|e| BackendError::invalid(e.to_string()))?;

        Ok(RnnForwardPd {
            prop_kind: self.prop_kind,
            cell: self.cell,
            direction: self.direction,
            src_layer: engine.resolve_fixed(&self.src_layer, MemoryFormat::Tnc)?,
            src_iter: engine.resolve_fixed(&self.src_iter, MemoryFormat::Ldsnc)?,
            weights_layer: engine.resolve_fixed(&self.weights_layer, MemoryFormat::Ldigo)?,
            weights_iter: engine.resolve_fixed(&self.weights_iter, MemoryFormat::Ldigo)?,
            bias: engine.resolve_fixed(&self.bias, MemoryFormat::Ldgo)?,
            dst_layer: engine.resolve_fixed(&self.dst_layer, MemoryFormat::Tnc)?,
            dst_iter: engine.resolve_fixed(&self.dst_iter, MemoryFormat::Ldsnc)?,
            workspace,
        })
    }
}

impl Emitter {
    /// RNN forward. Dependencies: `[src_layer, src_iter, weights_layer,
    /// weights_iter, bias, dst_layer, dst_iter, ws, ws_buf]`.
    pub fn build_rnn_forward(&mut self, desc: &RnnForwardDesc) -> Result<PrimitiveHandle> {
        let pd = construct(RNN_FORWARD, desc.resolve(&self.engine))?;
        let handle = self.reserve_primitive_space(9, true)?;
        self.install_rnn_forward(pd, handle)?;
        Ok(handle)
    }

    /// Rebuild into a reserved RNN slot. A fresh workspace buffer sized for
    /// the new descriptor replaces the previous one.
    pub fn rebuild_rnn_forward(&mut self, desc: &RnnForwardDesc, handle: PrimitiveHandle) -> Result<()> {
        let pd = construct(RNN_FORWARD, desc.resolve(&self.engine))?;
        self.install_rnn_forward(pd, handle)
    }

    fn install_rnn_forward(&mut self, pd: RnnForwardPd, handle: PrimitiveHandle) -> Result<()> {
        let deps = self.install_deps(handle, 9)?;
        let mut args = Vec::with_capacity(8);
        for (i, desc) in [
            &pd.src_layer,
            &pd.src_iter,
            &pd.weights_layer,
            &pd.weights_iter,
            &pd.bias,
            &pd.dst_layer,
            &pd.dst_iter,
            &pd.workspace,
        ]
        .into_iter()
        .enumerate()
        {
            args.push(self.place_memory(&deps, handle, i, desc)?);
        }
        self.place_workspace(handle, 8, pd.workspace.size_in_bytes())?;
        self.place_kernel(
            handle,
            Kernel {
                desc: KernelDesc::Rnn(pd),
                attr: PrimitiveAttr::default(),
                args,
            },
        )
    }
}
