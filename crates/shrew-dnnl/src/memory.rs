//! Memory descriptors: dims, element type, and the layout of a buffer.
//!
//! A [`MemoryDesc`] is what every kernel descriptor is built from. Its layout
//! is either a named [`MemoryFormat`] (plain or channel-blocked), an explicit
//! stride description, or the [`MemoryFormat::Any`] placeholder that lets the
//! engine choose during kernel resolution.
//!
//! Resolved descriptors carry a [`BlockingDesc`], the explicit
//! `{block_dims, strides[outer, inner], padding_dims, offset_padding}` form
//! the engine uses to size and address buffers.

use std::fmt;

use shrew_core::{DType, Layout, Shape};

use crate::error::{Error, Result};

// Element types

/// Element types the engine implements kernels for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    S32,
    S8,
    U8,
}

impl DataType {
    /// Map a graph element type onto the engine's types.
    pub fn from_dtype(dtype: DType) -> Result<DataType> {
        match dtype {
            DType::F32 => Ok(DataType::F32),
            DType::I32 => Ok(DataType::S32),
            DType::I8 => Ok(DataType::S8),
            DType::U8 => Ok(DataType::U8),
            other => Err(Error::Unsupported(format!(
                "element type {} has no engine data type",
                other
            ))),
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 4,
            DataType::S8 | DataType::U8 => 1,
        }
    }

    pub fn is_int8(&self) -> bool {
        matches!(self, DataType::S8 | DataType::U8)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::F32 => "f32",
            DataType::S32 => "s32",
            DataType::S8 => "s8",
            DataType::U8 => "u8",
        };
        write!(f, "{}", s)
    }
}

// Layout tags

/// Named layouts, plus the three non-materializable tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFormat {
    /// No layout at all.
    Undef,
    /// Let the engine pick during kernel resolution.
    Any,
    /// Explicit strides; only produced by [`MemoryDesc::blocked`].
    Blocked,
    X,
    Nc,
    Ncw,
    Nwc,
    Nchw,
    Nhwc,
    Chwn,
    NChw8c,
    NChw16c,
    Ncdhw,
    Ndhwc,
    NCdhw16c,
    Oi,
    Io,
    Oiw,
    Wio,
    Oihw,
    Ihwo,
    Hwio,
    OIhw8i8o,
    OIhw16i16o,
    Goihw,
    Oidhw,
    Tnc,
    Ntc,
    Ldsnc,
    Ldigo,
    Ldgoi,
    Ldgo,
}

/// Storage recipe of a named layout: outer dimension order, channel-style
/// blocks as (dim, size), and the order of blocked dims inside a block.
struct FormatPlan {
    order: &'static [usize],
    blocks: &'static [(usize, usize)],
    inner: &'static [usize],
}

const fn plain(order: &'static [usize]) -> FormatPlan {
    FormatPlan {
        order,
        blocks: &[],
        inner: &[],
    }
}

impl MemoryFormat {
    /// Rank implied by the tag; `None` for the placeholders.
    pub fn ndims(&self) -> Option<usize> {
        self.plan().map(|p| p.order.len())
    }

    /// `Undef`, `Any` and `Blocked` never name a concrete layout.
    pub fn is_placeholder(&self) -> bool {
        matches!(
            self,
            MemoryFormat::Undef | MemoryFormat::Any | MemoryFormat::Blocked
        )
    }

    /// Block size applied to the channel dimension, 1 for plain layouts.
    pub fn channel_block(&self) -> usize {
        match self {
            MemoryFormat::NChw8c => 8,
            MemoryFormat::NChw16c | MemoryFormat::NCdhw16c => 16,
            _ => 1,
        }
    }

    /// The plain activation layout of the given rank.
    pub fn plain_data(rank: usize) -> Option<MemoryFormat> {
        match rank {
            1 => Some(MemoryFormat::X),
            2 => Some(MemoryFormat::Nc),
            3 => Some(MemoryFormat::Ncw),
            4 => Some(MemoryFormat::Nchw),
            5 => Some(MemoryFormat::Ncdhw),
            _ => None,
        }
    }

    /// The plain weights layout of the given rank.
    pub fn plain_weights(rank: usize, grouped: bool) -> Option<MemoryFormat> {
        match (rank, grouped) {
            (2, false) => Some(MemoryFormat::Oi),
            (3, false) => Some(MemoryFormat::Oiw),
            (4, false) => Some(MemoryFormat::Oihw),
            (5, false) => Some(MemoryFormat::Oidhw),
            (5, true) => Some(MemoryFormat::Goihw),
            _ => None,
        }
    }

    fn plan(&self) -> Option<FormatPlan> {
        use MemoryFormat::*;
        let plan = match self {
            Undef | Any | Blocked => return None,
            X => plain(&[0]),
            Nc | Oi => plain(&[0, 1]),
            Io => plain(&[1, 0]),
            Ncw | Oiw | Tnc => plain(&[0, 1, 2]),
            Nwc => plain(&[0, 2, 1]),
            Wio => plain(&[2, 1, 0]),
            Ntc => plain(&[1, 0, 2]),
            Nchw | Oihw | Ldgo => plain(&[0, 1, 2, 3]),
            Nhwc => plain(&[0, 2, 3, 1]),
            Chwn | Ihwo => plain(&[1, 2, 3, 0]),
            Hwio => plain(&[2, 3, 1, 0]),
            Ncdhw | Goihw | Oidhw | Ldsnc | Ldigo => plain(&[0, 1, 2, 3, 4]),
            Ndhwc => plain(&[0, 2, 3, 4, 1]),
            Ldgoi => plain(&[0, 1, 3, 4, 2]),
            NChw8c => FormatPlan {
                order: &[0, 1, 2, 3],
                blocks: &[(1, 8)],
                inner: &[1],
            },
            NChw16c => FormatPlan {
                order: &[0, 1, 2, 3],
                blocks: &[(1, 16)],
                inner: &[1],
            },
            NCdhw16c => FormatPlan {
                order: &[0, 1, 2, 3, 4],
                blocks: &[(1, 16)],
                inner: &[1],
            },
            OIhw8i8o => FormatPlan {
                order: &[0, 1, 2, 3],
                blocks: &[(0, 8), (1, 8)],
                inner: &[1, 0],
            },
            OIhw16i16o => FormatPlan {
                order: &[0, 1, 2, 3],
                blocks: &[(0, 16), (1, 16)],
                inner: &[1, 0],
            },
        };
        Some(plan)
    }
}

impl fmt::Display for MemoryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use MemoryFormat::*;
        let s = match self {
            Undef => "undef",
            Any => "any",
            Blocked => "blocked",
            X => "x",
            Nc => "nc",
            Ncw => "ncw",
            Nwc => "nwc",
            Nchw => "nchw",
            Nhwc => "nhwc",
            Chwn => "chwn",
            NChw8c => "nChw8c",
            NChw16c => "nChw16c",
            Ncdhw => "ncdhw",
            Ndhwc => "ndhwc",
            NCdhw16c => "nCdhw16c",
            Oi => "oi",
            Io => "io",
            Oiw => "oiw",
            Wio => "wio",
            Oihw => "oihw",
            Ihwo => "ihwo",
            Hwio => "hwio",
            OIhw8i8o => "OIhw8i8o",
            OIhw16i16o => "OIhw16i16o",
            Goihw => "goihw",
            Oidhw => "oidhw",
            Tnc => "tnc",
            Ntc => "ntc",
            Ldsnc => "ldsnc",
            Ldigo => "ldigo",
            Ldgoi => "ldgoi",
            Ldgo => "ldgo",
        };
        write!(f, "{}", s)
    }
}

// Blocking

/// Explicit addressing of a resolved buffer. All vectors have one entry per
/// dimension; strides are in elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingDesc {
    pub block_dims: Vec<usize>,
    /// `strides[0]` steps between blocks, `strides[1]` steps inside a block.
    pub strides: [Vec<usize>; 2],
    pub padding_dims: Vec<usize>,
    /// Per-dimension start of a view inside its parent buffer.
    pub offset_padding_to_data: Vec<usize>,
    /// Element offset of the first element.
    pub offset_padding: usize,
}

impl BlockingDesc {
    fn for_plan(dims: &[usize], plan: &FormatPlan) -> BlockingDesc {
        let rank = dims.len();
        let mut block_dims = vec![1usize; rank];
        for &(d, size) in plan.blocks {
            block_dims[d] = size;
        }
        let padding_dims: Vec<usize> = dims
            .iter()
            .zip(&block_dims)
            .map(|(&d, &b)| d.div_ceil(b) * b)
            .collect();

        let mut inner = vec![1usize; rank];
        let mut step = 1usize;
        for &d in plan.inner.iter().rev() {
            inner[d] = step;
            step *= block_dims[d];
        }
        let block_volume = step;

        let mut outer = vec![0usize; rank];
        let mut step = block_volume;
        for &d in plan.order.iter().rev() {
            outer[d] = step;
            step *= padding_dims[d] / block_dims[d];
        }

        BlockingDesc {
            block_dims,
            strides: [outer, inner],
            padding_dims,
            offset_padding_to_data: vec![0; rank],
            offset_padding: 0,
        }
    }

    fn explicit(dims: &[usize], strides: &[usize], offset: usize) -> BlockingDesc {
        let rank = dims.len();
        BlockingDesc {
            block_dims: vec![1; rank],
            strides: [strides.to_vec(), vec![1; rank]],
            padding_dims: dims.to_vec(),
            offset_padding_to_data: vec![0; rank],
            offset_padding: offset,
        }
    }

    /// Elements spanned from the start of the buffer, offset included.
    fn span_elements(&self) -> usize {
        let body = self
            .padding_dims
            .iter()
            .zip(&self.block_dims)
            .zip(&self.strides[0])
            .map(|((&p, &b), &s)| (p / b) * s)
            .max()
            .unwrap_or(0);
        body + self.offset_padding
    }
}

// Descriptors

/// Dims, element type and layout of one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDesc {
    dims: Vec<usize>,
    data_type: DataType,
    format: MemoryFormat,
    blocking: Option<BlockingDesc>,
}

fn check_dims(dims: &[usize]) -> Result<()> {
    if dims.is_empty() {
        return Err(Error::invalid("descriptor needs at least one dimension"));
    }
    if dims.iter().any(|&d| d == 0) {
        return Err(Error::invalid(format!(
            "descriptor dims {:?} contain a zero extent",
            dims
        )));
    }
    Ok(())
}

impl MemoryDesc {
    /// Describe a buffer in a named layout, or with [`MemoryFormat::Any`].
    pub fn new(dims: Vec<usize>, data_type: DataType, format: MemoryFormat) -> Result<Self> {
        check_dims(&dims)?;
        match format {
            MemoryFormat::Undef | MemoryFormat::Blocked => {
                return Err(Error::invalid(format!(
                    "cannot create a descriptor with the {} layout tag",
                    format
                )))
            }
            MemoryFormat::Any => {
                return Ok(MemoryDesc {
                    dims,
                    data_type,
                    format,
                    blocking: None,
                })
            }
            _ => {}
        }
        let plan = format
            .plan()
            .ok_or_else(|| Error::invalid(format!("layout {} has no storage plan", format)))?;
        if plan.order.len() != dims.len() {
            return Err(Error::invalid(format!(
                "layout {} expects {} dims, got {:?}",
                format,
                plan.order.len(),
                dims
            )));
        }
        let blocking = BlockingDesc::for_plan(&dims, &plan);
        Ok(MemoryDesc {
            dims,
            data_type,
            format,
            blocking: Some(blocking),
        })
    }

    /// A descriptor whose layout the engine picks.
    pub fn any(dims: Vec<usize>, data_type: DataType) -> Result<Self> {
        MemoryDesc::new(dims, data_type, MemoryFormat::Any)
    }

    /// Explicit-stride descriptor with no internal blocking.
    pub fn blocked(dims: Vec<usize>, strides: &[usize], data_type: DataType) -> Result<Self> {
        check_dims(&dims)?;
        if strides.len() != dims.len() {
            return Err(Error::invalid(format!(
                "{} strides given for {} dims",
                strides.len(),
                dims.len()
            )));
        }
        let blocking = BlockingDesc::explicit(&dims, strides, 0);
        Ok(MemoryDesc {
            dims,
            data_type,
            format: MemoryFormat::Blocked,
            blocking: Some(blocking),
        })
    }

    /// Explicit-stride descriptor matching a strided tensor layout, offset
    /// included.
    pub fn from_layout(layout: &Layout, dtype: DType) -> Result<Self> {
        let data_type = DataType::from_dtype(dtype)?;
        let mut desc = MemoryDesc::blocked(layout.dims().to_vec(), layout.strides(), data_type)?;
        if let Some(blocking) = desc.blocking.as_mut() {
            blocking.offset_padding = layout.offset();
        }
        Ok(desc)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn format(&self) -> MemoryFormat {
        self.format
    }

    pub fn blocking(&self) -> Option<&BlockingDesc> {
        self.blocking.as_ref()
    }

    /// Whether a buffer can be laid out from this descriptor.
    pub fn is_materializable(&self) -> bool {
        self.blocking.is_some()
    }

    /// Whether the layout is still for the engine to choose.
    pub fn is_any(&self) -> bool {
        self.format == MemoryFormat::Any
    }

    /// Bytes needed to back the buffer; 0 while the layout is unresolved.
    pub fn size_in_bytes(&self) -> usize {
        self.blocking
            .as_ref()
            .map(|b| b.span_elements() * self.data_type.size_in_bytes())
            .unwrap_or(0)
    }

    /// Same dims and element type in another named layout.
    pub fn with_format(&self, format: MemoryFormat) -> Result<Self> {
        MemoryDesc::new(self.dims.clone(), self.data_type, format)
    }

    /// Same dims and layout with another element type.
    pub fn with_data_type(&self, data_type: DataType) -> Self {
        MemoryDesc {
            data_type,
            ..self.clone()
        }
    }

    /// Sub-view of this buffer: `dims` elements starting at `offsets`. The
    /// view shares the parent's strides; blocked dimensions must start on a
    /// block boundary.
    pub fn view(&self, dims: &[usize], offsets: &[usize]) -> Result<MemoryDesc> {
        let blocking = self.blocking.as_ref().ok_or_else(|| {
            Error::invalid("cannot take a view of a descriptor with an unresolved layout")
        })?;
        if dims.len() != self.ndims() || offsets.len() != self.ndims() {
            return Err(Error::invalid(format!(
                "view of rank {}/{} over a rank {} descriptor",
                dims.len(),
                offsets.len(),
                self.ndims()
            )));
        }
        check_dims(dims)?;
        let mut offset_padding = blocking.offset_padding;
        for d in 0..self.ndims() {
            if offsets[d] + dims[d] > self.dims[d] {
                return Err(Error::invalid(format!(
                    "view [{}, {}) exceeds dim {} of size {}",
                    offsets[d],
                    offsets[d] + dims[d],
                    d,
                    self.dims[d]
                )));
            }
            let block = blocking.block_dims[d];
            if offsets[d] % block != 0 {
                return Err(Error::invalid(format!(
                    "view offset {} on dim {} is not aligned to block {}",
                    offsets[d], d, block
                )));
            }
            offset_padding += (offsets[d] / block) * blocking.strides[0][d];
        }
        let view = BlockingDesc {
            block_dims: blocking.block_dims.clone(),
            strides: blocking.strides.clone(),
            padding_dims: dims
                .iter()
                .zip(&blocking.block_dims)
                .map(|(&d, &b)| d.div_ceil(b) * b)
                .collect(),
            offset_padding_to_data: offsets.to_vec(),
            offset_padding,
        };
        Ok(MemoryDesc {
            dims: dims.to_vec(),
            data_type: self.data_type,
            format: self.format,
            blocking: Some(view),
        })
    }
}

impl fmt::Display for MemoryDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{:?}", self.data_type, self.format, self.dims)
    }
}

// Builders

/// Describe a tensor in a named layout. The `Blocked` and `Undef` tags are
/// rejected: only [`build_blocked_descriptor`] produces explicit strides.
pub fn build_descriptor(shape: &Shape, dtype: DType, format: MemoryFormat) -> Result<MemoryDesc> {
    if matches!(format, MemoryFormat::Blocked | MemoryFormat::Undef) {
        return Err(Error::invalid(format!(
            "cannot create a {} descriptor without strides",
            format
        )));
    }
    MemoryDesc::new(shape.dims().to_vec(), DataType::from_dtype(dtype)?, format)
}

/// Explicit-stride descriptor, block size 1 on every dimension.
pub fn build_blocked_descriptor(shape: &Shape, strides: &[usize], dtype: DType) -> Result<MemoryDesc> {
    let layout = Layout::new(shape.clone(), strides.to_vec(), 0)?;
    MemoryDesc::from_layout(&layout, dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_nchw_strides() {
        let d = MemoryDesc::new(vec![2, 3, 4, 5], DataType::F32, MemoryFormat::Nchw).unwrap();
        let b = d.blocking().unwrap();
        assert_eq!(b.strides[0], vec![60, 20, 5, 1]);
        assert_eq!(b.block_dims, vec![1, 1, 1, 1]);
        assert_eq!(d.size_in_bytes(), 120 * 4);
    }

    #[test]
    fn test_nhwc_strides() {
        let d = MemoryDesc::new(vec![2, 3, 4, 5], DataType::U8, MemoryFormat::Nhwc).unwrap();
        assert_eq!(d.blocking().unwrap().strides[0], vec![60, 1, 15, 3]);
        assert_eq!(d.size_in_bytes(), 120);
    }

    #[test]
    fn test_channel_blocked_pads_channels() {
        // C = 3 padded to 8
        let d = MemoryDesc::new(vec![2, 3, 4, 5], DataType::F32, MemoryFormat::NChw8c).unwrap();
        let b = d.blocking().unwrap();
        assert_eq!(b.padding_dims, vec![2, 8, 4, 5]);
        assert_eq!(b.strides[0], vec![160, 160, 40, 8]);
        assert_eq!(b.strides[1], vec![1, 1, 1, 1]);
        assert_eq!(d.size_in_bytes(), 2 * 8 * 4 * 5 * 4);
    }

    #[test]
    fn test_weight_blocking_inner_order() {
        let d =
            MemoryDesc::new(vec![16, 16, 3, 3], DataType::F32, MemoryFormat::OIhw8i8o).unwrap();
        let b = d.blocking().unwrap();
        assert_eq!(b.strides[1], vec![1, 8, 1, 1]);
        assert_eq!(b.strides[0], vec![2 * 9 * 64, 9 * 64, 3 * 64, 64]);
    }

    #[test]
    fn test_rank_must_match_tag() {
        let err = MemoryDesc::new(vec![2, 3], DataType::F32, MemoryFormat::Nchw).unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[test]
    fn test_zero_extent_rejected() {
        assert!(MemoryDesc::new(vec![2, 0], DataType::F32, MemoryFormat::Nc).is_err());
        assert!(MemoryDesc::new(vec![], DataType::F32, MemoryFormat::Any).is_err());
    }

    #[test]
    fn test_placeholders() {
        let any = MemoryDesc::any(vec![1, 2], DataType::F32).unwrap();
        assert!(!any.is_materializable());
        assert_eq!(any.size_in_bytes(), 0);
        let shape = Shape::from((1, 2));
        assert!(matches!(
            build_descriptor(&shape, DType::F32, MemoryFormat::Blocked),
            Err(Error::InvalidDescriptor(_))
        ));
        assert!(build_descriptor(&shape, DType::F32, MemoryFormat::Undef).is_err());
    }

    #[test]
    fn test_unsupported_dtype() {
        let shape = Shape::from((1, 2));
        assert!(matches!(
            build_descriptor(&shape, DType::F64, MemoryFormat::Nc),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_blocked_descriptor() {
        let d = build_blocked_descriptor(&Shape::from((4, 6)), &[1, 4], DType::F32).unwrap();
        let b = d.blocking().unwrap();
        assert_eq!(d.format(), MemoryFormat::Blocked);
        assert_eq!(b.block_dims, vec![1, 1]);
        assert_eq!(b.strides[1], vec![1, 1]);
        assert_eq!(b.padding_dims, vec![4, 6]);
        assert_eq!(b.offset_padding, 0);
        assert_eq!(d.size_in_bytes(), 24 * 4);
        assert!(matches!(
            build_blocked_descriptor(&Shape::from((4, 6)), &[1], DType::F32),
            Err(Error::Core(shrew_core::Error::RankMismatch { expected: 2, got: 1 }))
        ));
    }

    #[test]
    fn test_from_layout_keeps_offset() {
        let layout = Layout::contiguous(Shape::from((4, 6)))
            .narrow(0, 1, 2)
            .unwrap();
        let d = MemoryDesc::from_layout(&layout, DType::I8).unwrap();
        assert_eq!(d.dims(), &[2, 6]);
        assert_eq!(d.blocking().unwrap().offset_padding, 6);
        assert_eq!(d.data_type(), DataType::S8);
    }

    #[test]
    fn test_view_offsets() {
        let d = MemoryDesc::new(vec![2, 4, 6], DataType::F32, MemoryFormat::Ncw).unwrap();
        let v = d.view(&[1, 2, 3], &[1, 1, 2]).unwrap();
        let b = v.blocking().unwrap();
        assert_eq!(v.dims(), &[1, 2, 3]);
        assert_eq!(b.offset_padding, 24 + 6 + 2);
        assert_eq!(b.offset_padding_to_data, vec![1, 1, 2]);
        assert!(d.view(&[1, 4, 6], &[1, 1, 0]).is_err());
    }

    #[test]
    fn test_view_requires_block_alignment() {
        let d = MemoryDesc::new(vec![1, 16, 2, 2], DataType::F32, MemoryFormat::NChw8c).unwrap();
        assert!(d.view(&[1, 8, 2, 2], &[0, 8, 0, 0]).is_ok());
        assert!(d.view(&[1, 4, 2, 2], &[0, 4, 0, 0]).is_err());
    }
}
