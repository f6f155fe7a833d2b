// Emitter tests — dependency layouts, reserve/rebuild equivalence and
// failure behavior of the kernel builders

use proptest::prelude::*;
use shrew_core::{DType, Shape};
use shrew_dnnl::emitter::batchnorm::{BatchNormFlags, BatchNormForwardDesc};
use shrew_dnnl::emitter::conv::{ConvGeometry, ConvolutionForwardDesc};
use shrew_dnnl::emitter::eltwise::{EltwiseForwardDesc, SumDesc};
use shrew_dnnl::emitter::pool::{PoolGeometry, PoolingAlgorithm, PoolingBackwardDesc, PoolingForwardDesc};
use shrew_dnnl::emitter::reorder::{ConcatDesc, SliceDesc};
use shrew_dnnl::emitter::rnn::{RnnCell, RnnDirection, RnnForwardDesc};
use shrew_dnnl::*;

// Helpers

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn emitter() -> Emitter {
    init_logging();
    Emitter::new(Engine::default()).unwrap()
}

fn md(dims: &[usize], format: MemoryFormat) -> MemoryDesc {
    MemoryDesc::new(dims.to_vec(), DataType::F32, format).unwrap()
}

fn nchw(dims: &[usize]) -> MemoryDesc {
    md(dims, MemoryFormat::Nchw)
}

fn deps(em: &Emitter, h: PrimitiveHandle) -> Vec<usize> {
    em.get_dependencies(h).unwrap().indices()
}

fn memory_at(em: &Emitter, h: PrimitiveHandle, i: usize) -> MemoryDesc {
    let slot = em.get_dependencies(h).unwrap().primitive(i).unwrap();
    em.get(slot).unwrap().as_memory().unwrap().clone()
}

fn kernel_named(em: &Emitter, name: &str) -> PrimitiveHandle {
    em.primitives()
        .find(|(_, p)| p.as_kernel().map(|k| k.desc.name()) == Some(name))
        .map(|(h, _)| h)
        .unwrap()
}

fn pool2() -> PoolGeometry {
    PoolGeometry::new(vec![2, 2], vec![2, 2], vec![0, 0], vec![0, 0])
}

// Convolution

#[test]
fn test_conv_forward_dependencies() {
    let mut em = emitter();
    let h = em
        .build_convolution_forward(
            &nchw(&[1, 3, 8, 8]),
            &md(&[4, 3, 3, 3], MemoryFormat::Oihw),
            None,
            &nchw(&[1, 4, 6, 6]),
            &ConvGeometry::unit(2),
            &PrimitiveAttr::default(),
        )
        .unwrap();
    assert_eq!(h.index(), 3);
    assert_eq!(deps(&em, h), vec![0, 1, 2]);
    let kernel = em.get_kernel(h).unwrap();
    assert_eq!(kernel.desc.name(), "convolution_forward");
    assert_eq!(kernel.args.len(), 3);

    let hb = em
        .build_convolution_forward(
            &nchw(&[1, 3, 8, 8]),
            &md(&[4, 3, 3, 3], MemoryFormat::Oihw),
            Some(&md(&[4], MemoryFormat::X)),
            &nchw(&[1, 4, 6, 6]),
            &ConvGeometry::unit(2),
            &PrimitiveAttr::default(),
        )
        .unwrap();
    assert_eq!(deps(&em, hb), vec![4, 5, 6, 7]);
    assert_eq!(memory_at(&em, hb, 2).dims(), &[4]);
}

#[test]
fn test_conv_reserve_then_rebuild_matches_one_phase() {
    let src = nchw(&[2, 8, 5, 5]);
    let weights = MemoryDesc::any(vec![16, 8, 3, 3], DataType::F32).unwrap();
    let dst = nchw(&[2, 16, 3, 3]);
    let geometry = ConvGeometry::unit(2);
    let attr = PrimitiveAttr::default();

    let mut one = emitter();
    let h1 = one
        .build_convolution_forward(&src, &weights, None, &dst, &geometry, &attr)
        .unwrap();

    let mut two = emitter();
    let h2 = two.convolution_forward_init(false).unwrap();
    assert!(two.get(h2).is_err());
    let desc = ConvolutionForwardDesc::new(src, weights, None, dst, geometry);
    two.rebuild_convolution_forward(&desc, &attr, h2).unwrap();

    assert_eq!(h1, h2);
    assert_eq!(deps(&one, h1), deps(&two, h2));
    for (a, b) in one.primitives().zip(two.primitives()) {
        assert_eq!(a, b);
    }
    assert_eq!(one.registry_stats(), two.registry_stats());
}

#[test]
fn test_rebuild_preserves_handle_and_dependencies() {
    let mut em = emitter();
    let geometry = ConvGeometry::unit(2);
    let h = em
        .build_convolution_forward(
            &nchw(&[1, 3, 8, 8]),
            &md(&[4, 3, 3, 3], MemoryFormat::Oihw),
            None,
            &nchw(&[1, 4, 6, 6]),
            &geometry,
            &PrimitiveAttr::default(),
        )
        .unwrap();
    let before = deps(&em, h);
    let len = em.registry().len();

    // Same slots, new spatial extent.
    let desc = ConvolutionForwardDesc::new(
        nchw(&[1, 3, 10, 10]),
        md(&[4, 3, 3, 3], MemoryFormat::Oihw),
        None,
        nchw(&[1, 4, 8, 8]),
        geometry,
    );
    em.rebuild_convolution_forward(&desc, &PrimitiveAttr::default(), h)
        .unwrap();
    assert_eq!(deps(&em, h), before);
    assert_eq!(em.registry().len(), len);
    assert_eq!(memory_at(&em, h, 2).dims(), &[1, 4, 8, 8]);
}

#[test]
fn test_failed_build_leaves_registry_untouched() {
    let mut em = emitter();
    let err = em
        .build_convolution_forward(
            &nchw(&[1, 3, 8, 8]),
            &md(&[4, 3, 3, 3], MemoryFormat::Oihw),
            None,
            &nchw(&[1, 4, 7, 7]),
            &ConvGeometry::unit(2),
            &PrimitiveAttr::default(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Construction {
            primitive: "convolution forward",
            ..
        }
    ));
    assert!(em.registry().is_empty());
}

#[test]
fn test_quantized_convolution_attributes() {
    let mut em = emitter();
    let src = MemoryDesc::new(vec![1, 4, 3, 3], DataType::U8, MemoryFormat::Nhwc).unwrap();
    let weights = MemoryDesc::new(vec![8, 4, 1, 1], DataType::S8, MemoryFormat::Oihw).unwrap();
    let dst = MemoryDesc::new(vec![1, 8, 3, 3], DataType::S8, MemoryFormat::Nhwc).unwrap();
    let h = em
        .build_quantized_convolution_forward(
            &src,
            &weights,
            None,
            &dst,
            &ConvGeometry::unit(2),
            &[0.5; 8],
            2,
            PostOps::new().append_sum(1.0),
        )
        .unwrap();
    let attr = &em.get_kernel(h).unwrap().attr;
    assert_eq!(attr.round_mode, Some(RoundMode::Nearest));
    assert_eq!(attr.output_scales.as_ref().unwrap().scales.len(), 8);
    assert_eq!(attr.post_ops.len(), 1);

    // mask 2 selects 8 channels; two scales do not fit
    assert!(em
        .build_quantized_convolution_forward(
            &src,
            &weights,
            None,
            &dst,
            &ConvGeometry::unit(2),
            &[0.5, 0.5],
            2,
            PostOps::new(),
        )
        .is_err());
}

#[test]
fn test_weight_format_query_follows_blocked_source() {
    let em = emitter();
    let format = em
        .query_convolution_forward_weight_format(
            &md(&[1, 16, 4, 4], MemoryFormat::NChw16c),
            &MemoryDesc::any(vec![32, 16, 3, 3], DataType::F32).unwrap(),
            &MemoryDesc::any(vec![1, 32, 2, 2], DataType::F32).unwrap(),
            &ConvGeometry::unit(2),
        )
        .unwrap();
    assert_eq!(format, MemoryFormat::OIhw16i16o);
}

#[test]
fn test_conv_backward_dependencies() {
    let mut em = emitter();
    let data = em
        .build_convolution_backward_data(
            &md(&[4, 3, 3, 3], MemoryFormat::Oihw),
            &nchw(&[1, 4, 6, 6]),
            &nchw(&[1, 3, 8, 8]),
            &ConvGeometry::unit(2),
        )
        .unwrap();
    assert_eq!(em.get_dependencies(data).unwrap().len(), 3);
    // engine order is diff_dst, weights, diff_src
    let d = em.get_dependencies(data).unwrap().clone();
    let args = &em.get_kernel(data).unwrap().args;
    assert_eq!(args[0], d.primitive(1).unwrap());
    assert_eq!(args[1], d.primitive(0).unwrap());

    let weights = em
        .build_convolution_backward_weights(
            &nchw(&[1, 3, 8, 8]),
            &nchw(&[1, 4, 6, 6]),
            &md(&[4, 3, 3, 3], MemoryFormat::Oihw),
            Some(&md(&[4], MemoryFormat::X)),
            &ConvGeometry::unit(2),
        )
        .unwrap();
    assert_eq!(em.get_dependencies(weights).unwrap().len(), 4);
}

// Pooling

#[test]
fn test_pooling_forward_and_avg_backward() {
    let mut em = emitter();
    let fwd = em
        .build_pooling_forward(
            PoolingAlgorithm::AvgExcludePadding,
            &nchw(&[1, 2, 4, 4]),
            &nchw(&[1, 2, 2, 2]),
            &pool2(),
        )
        .unwrap();
    assert_eq!(deps(&em, fwd).len(), 2);

    let bwd = em
        .build_pooling_backward(
            PoolingAlgorithm::AvgExcludePadding,
            &nchw(&[1, 2, 2, 2]),
            &nchw(&[1, 2, 4, 4]),
            &pool2(),
        )
        .unwrap();
    assert_eq!(memory_at(&em, bwd, 0).dims(), &[1, 2, 2, 2]);
    assert_eq!(memory_at(&em, bwd, 1).dims(), &[1, 2, 4, 4]);

    assert!(matches!(
        em.build_pooling_backward(
            PoolingAlgorithm::Max,
            &nchw(&[1, 2, 2, 2]),
            &nchw(&[1, 2, 4, 4]),
            &pool2(),
        ),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn test_quantized_pool_requires_int8() {
    let mut em = emitter();
    let src = MemoryDesc::new(vec![1, 2, 4, 4], DataType::U8, MemoryFormat::Nhwc).unwrap();
    let dst = MemoryDesc::new(vec![1, 2, 2, 2], DataType::U8, MemoryFormat::Nhwc).unwrap();
    assert!(em.build_quantized_max_pool(&src, &dst, &pool2()).is_ok());
    assert!(em.build_quantized_avg_pool(&src, &dst, &pool2(), true).is_ok());
    assert!(matches!(
        em.build_quantized_max_pool(&nchw(&[1, 2, 4, 4]), &nchw(&[1, 2, 2, 2]), &pool2()),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn test_max_pool_backward_pair() {
    let mut em = emitter();
    let bwd = em
        .build_max_pooling_backward(
            &nchw(&[1, 2, 4, 4]),
            &nchw(&[1, 2, 2, 2]),
            &nchw(&[1, 2, 4, 4]),
            &pool2(),
        )
        .unwrap();
    let fwd = kernel_named(&em, "pooling_forward");
    assert_eq!(fwd.index() + 1, bwd.index());
    let f = em.get_dependencies(fwd).unwrap().clone();
    let b = em.get_dependencies(bwd).unwrap().clone();
    assert_eq!(f.len(), 4);
    assert_eq!(b.len(), 4);
    // shared ws memory, diff_src and ws buffer
    assert_eq!(f.primitive(2), b.primitive(1));
    assert_eq!(f.primitive(1), b.primitive(2));
    assert_eq!(f.workspace(3), b.workspace(3));
    assert!(f.workspace(3).is_some());
    assert_eq!(em.workspace_stats().buffers, 1);
}

#[test]
fn test_max_pool_backward_two_phase() {
    let mut em = emitter();
    let (fwd, bwd) = em.reserve_max_pooling_backward().unwrap();
    assert_eq!((fwd.index(), bwd.index()), (4, 5));
    let desc = PoolingBackwardDesc::new(
        PoolingAlgorithm::Max,
        nchw(&[1, 2, 4, 4]),
        nchw(&[1, 2, 2, 2]),
        pool2(),
    );
    em.rebuild_max_pooling_backward(&desc, &nchw(&[1, 2, 4, 4]), fwd, bwd)
        .unwrap();
    assert!(em.get_kernel(fwd).is_ok());
    assert!(em.get_kernel(bwd).is_ok());
}

#[test]
fn test_max_pool_with_indices_shares_workspace() {
    let mut em = emitter();
    let fwd = em
        .build_max_pooling_with_indices_forward(&nchw(&[1, 2, 4, 4]), &nchw(&[1, 2, 2, 2]), &pool2())
        .unwrap();
    let bwd = em
        .build_max_pooling_with_indices_backward(
            &nchw(&[1, 2, 2, 2]),
            &nchw(&[1, 2, 4, 4]),
            &pool2(),
            fwd,
        )
        .unwrap();
    let f = em.get_dependencies(fwd).unwrap().clone();
    let b = em.get_dependencies(bwd).unwrap().clone();
    assert_eq!(f.len(), 4);
    assert_eq!(b.len(), 4);
    assert_eq!(f.primitive(2), b.primitive(1));
    assert_eq!(f.workspace(3), b.workspace(3));
    assert_eq!(memory_at(&em, fwd, 2).data_type(), DataType::U8);
    assert_eq!(em.get_workspace_buffers().len(), 1);
}

#[test]
fn test_max_pool_with_indices_rejects_mismatched_forward() {
    let mut em = emitter();
    let fwd = em
        .build_max_pooling_with_indices_forward(&nchw(&[1, 2, 4, 4]), &nchw(&[1, 2, 2, 2]), &pool2())
        .unwrap();
    let before = em.registry().len();
    let ws_size = em.workspace_stats();

    // larger tensors would need a larger argmax buffer than the forward owns
    let err = em
        .build_max_pooling_with_indices_backward(
            &nchw(&[1, 2, 8, 8]),
            &nchw(&[1, 2, 16, 16]),
            &pool2(),
            fwd,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Construction { .. }));
    assert_eq!(em.registry().len(), before);
    assert_eq!(em.workspace_stats().buffers, ws_size.buffers);
    assert_eq!(memory_at(&em, fwd, 2).dims(), &[1, 2, 2, 2]);

    let wider = PoolGeometry::new(vec![3, 3], vec![1, 1], vec![1, 1], vec![1, 1]);
    assert!(em
        .build_max_pooling_with_indices_backward(&nchw(&[1, 2, 2, 2]), &nchw(&[1, 2, 4, 4]), &wider, fwd)
        .is_err());
    assert_eq!(em.registry().len(), before);
}

#[test]
fn test_max_pool_with_indices_requires_pooling_forward() {
    let mut em = emitter();
    let conv = em.convolution_forward_init(true).unwrap();
    let before = em.registry().len();
    let err = em
        .build_max_pooling_with_indices_backward(&nchw(&[1, 2, 2, 2]), &nchw(&[1, 2, 4, 4]), &pool2(), conv)
        .unwrap_err();
    assert!(matches!(err, Error::Construction { .. }));
    assert_eq!(em.registry().len(), before);

    let x = nchw(&[1, 2, 4, 4]);
    let relu = em.build_relu_forward(&x, &x).unwrap();
    let before = em.registry().len();
    assert!(matches!(
        em.build_max_pooling_with_indices_backward(&nchw(&[1, 2, 2, 2]), &x, &pool2(), relu),
        Err(Error::Construction { .. })
    ));
    assert_eq!(em.registry().len(), before);
}

#[test]
fn test_max_pool_with_indices_rebuild_forward_then_backward() {
    let mut em = emitter();
    let (src, dst) = (nchw(&[1, 2, 4, 4]), nchw(&[1, 2, 2, 2]));
    let fwd = em
        .build_max_pooling_with_indices_forward(&src, &dst, &pool2())
        .unwrap();
    let bwd = em
        .build_max_pooling_with_indices_backward(&dst, &src, &pool2(), fwd)
        .unwrap();
    let old = em.get_dependencies(fwd).unwrap().workspace(3);

    let fwd_desc = PoolingForwardDesc::new(
        PropKind::ForwardTraining,
        PoolingAlgorithm::Max,
        src.clone(),
        dst.clone(),
        pool2(),
    );
    em.rebuild_max_pooling_with_indices_forward(&fwd_desc, fwd)
        .unwrap();
    let bwd_desc = PoolingBackwardDesc::new(PoolingAlgorithm::Max, src, dst, pool2());
    em.rebuild_max_pooling_with_indices_backward(&bwd_desc, fwd, bwd)
        .unwrap();

    let current = em.get_dependencies(fwd).unwrap().workspace(3);
    assert_ne!(current, old);
    assert_eq!(em.get_dependencies(bwd).unwrap().workspace(3), current);
    assert_eq!(
        em.get_dependencies(bwd).unwrap().primitive(1),
        em.get_dependencies(fwd).unwrap().primitive(2)
    );
}

// Batch normalization

#[test]
fn test_batchnorm_forward_dependency_order() {
    let src = nchw(&[2, 3, 4, 4]);
    let weights = md(&[2, 3], MemoryFormat::Nc);
    let stats = md(&[3], MemoryFormat::X);

    let mut em = emitter();
    let train = em
        .build_batchnorm_forward(
            &src,
            &weights,
            &src,
            &stats,
            &stats,
            1e-5,
            false,
            true,
            &PrimitiveAttr::default(),
        )
        .unwrap();
    assert_eq!(deps(&em, train).len(), 5);
    // weights second when statistics are computed
    assert_eq!(memory_at(&em, train, 1).dims(), &[2, 3]);

    let infer = em
        .build_batchnorm_forward(
            &src,
            &weights,
            &src,
            &stats,
            &stats,
            1e-5,
            true,
            false,
            &PrimitiveAttr::default(),
        )
        .unwrap();
    // mean second when statistics are inputs
    assert_eq!(memory_at(&em, infer, 1).dims(), &[3]);
    assert_eq!(memory_at(&em, infer, 3).dims(), &[2, 3]);
}

#[test]
fn test_batchnorm_global_stats_in_training() {
    let src = nchw(&[2, 3, 4, 4]);
    let weights = md(&[2, 3], MemoryFormat::Nc);
    let stats = md(&[3], MemoryFormat::X);

    let mut em = emitter();
    let h = em
        .build_batchnorm_forward(
            &src,
            &weights,
            &src,
            &stats,
            &stats,
            1e-5,
            true,
            true,
            &PrimitiveAttr::default(),
        )
        .unwrap();
    assert_eq!(deps(&em, h).len(), 5);
    assert_eq!(memory_at(&em, h, 1).dims(), &[3]);
    assert_eq!(memory_at(&em, h, 2).dims(), &[3]);
    assert_eq!(memory_at(&em, h, 3).dims(), &[2, 3]);
    assert_eq!(memory_at(&em, h, 4).dims(), &[2, 3, 4, 4]);
}

#[test]
fn test_batchnorm_rejects_mistyped_operands() {
    let src = nchw(&[2, 3, 4, 4]);
    let weights = md(&[2, 3], MemoryFormat::Nc);
    let stats = md(&[3], MemoryFormat::X);
    let s8_weights = weights.with_data_type(DataType::S8);
    let u8_dst = src.with_data_type(DataType::U8);
    let s32_stats = stats.with_data_type(DataType::S32);
    let attr = PrimitiveAttr::default();

    let mut em = emitter();
    for (w, d, s) in [
        (&s8_weights, &src, &stats),
        (&weights, &u8_dst, &stats),
        (&weights, &src, &s32_stats),
    ] {
        let err = em
            .build_batchnorm_forward(&src, w, d, s, s, 1e-5, false, true, &attr)
            .unwrap_err();
        assert!(matches!(err, Error::Construction { .. }));
    }
    assert!(em
        .build_batchnorm_backward(&weights, &src, &stats, &stats, &src, &u8_dst, &weights, 1e-5)
        .is_err());
    assert!(em
        .build_batchnorm_backward(&weights, &src, &s32_stats, &stats, &src, &src, &weights, 1e-5)
        .is_err());
    assert!(em.registry().is_empty());
}

#[test]
fn test_batchnorm_rebuild_reads_flags() {
    let mut em = emitter();
    let h = em.reserve_primitive_space(6, false).unwrap();
    let desc = BatchNormForwardDesc::new(
        PropKind::ForwardTraining,
        nchw(&[1, 4, 2, 2]),
        1e-3,
        BatchNormFlags::from_bits(BatchNormFlags::GLOBAL_STATS | BatchNormFlags::SCALE_SHIFT),
    );
    em.rebuild_batchnorm_forward(&desc, &md(&[2, 4], MemoryFormat::Nc), &PrimitiveAttr::default(), h)
        .unwrap();
    assert_eq!(memory_at(&em, h, 1).dims(), &[4]);
    assert_eq!(memory_at(&em, h, 4).dims(), &[1, 4, 2, 2]);
}

#[test]
fn test_batchnorm_backward_dependencies() {
    let mut em = emitter();
    let src = nchw(&[2, 3, 4, 4]);
    let weights = md(&[2, 3], MemoryFormat::Nc);
    let stats = md(&[3], MemoryFormat::X);
    let h = em
        .build_batchnorm_backward(&weights, &src, &stats, &stats, &src, &src, &weights, 1e-5)
        .unwrap();
    assert_eq!(deps(&em, h).len(), 7);
    assert_eq!(memory_at(&em, h, 0).dims(), &[2, 3]);
    assert_eq!(memory_at(&em, h, 6).dims(), &[2, 3]);
}

// Elementwise, softmax, LRN

#[test]
fn test_activation_dependencies() {
    let mut em = emitter();
    let x = nchw(&[1, 2, 3, 3]);
    let relu = em.build_relu_forward(&x, &x).unwrap();
    let leaky = em.build_leaky_relu(&x, &x, 0.1).unwrap();
    let bounded = em.build_bounded_relu(&x, &x, 6.0).unwrap();
    let sigmoid = em.build_sigmoid_forward(&x, &x).unwrap();
    for h in [relu, leaky, bounded, sigmoid] {
        assert_eq!(deps(&em, h).len(), 2);
    }
    let relu_bwd = em.build_relu_backward(&x, &x, &x).unwrap();
    let sigmoid_bwd = em.build_sigmoid_backward(&x, &x, &x).unwrap();
    assert_eq!(deps(&em, relu_bwd).len(), 3);
    assert_eq!(deps(&em, sigmoid_bwd).len(), 3);
    assert_eq!(em.registry_stats().kernels, 6);
}

#[test]
fn test_leaky_relu_rebuild_updates_slope() {
    let mut em = emitter();
    let x = nchw(&[1, 2, 3, 3]);
    let h = em.build_leaky_relu(&x, &x, 0.1).unwrap();
    em.rebuild_eltwise_forward(&EltwiseForwardDesc::leaky_relu(x, 0.2), h)
        .unwrap();
    match &em.get_kernel(h).unwrap().desc {
        KernelDesc::EltwiseForward(pd) => assert_eq!(pd.alpha, 0.2),
        other => panic!("unexpected kernel {}", other.name()),
    }
}

#[test]
fn test_elementwise_add() {
    let mut em = emitter();
    let x = nchw(&[2, 2, 2, 2]);
    let any = MemoryDesc::any(vec![2, 2, 2, 2], DataType::F32).unwrap();
    let h = em.build_elementwise_add(&x, &x, &any).unwrap();
    assert_eq!(deps(&em, h).len(), 3);
    assert_eq!(memory_at(&em, h, 2).format(), MemoryFormat::Nchw);

    let desc = SumDesc::new(vec![1.0, 1.0], vec![x.clone(), x.clone()], x);
    em.rebuild_elementwise_add(&desc, h).unwrap();
    assert_eq!(deps(&em, h).len(), 3);
}

#[test]
fn test_elementwise_add_dst_type_must_match() {
    let mut em = emitter();
    let x = nchw(&[2, 2, 2, 2]);
    let s8 = x.with_data_type(DataType::S8);
    assert!(matches!(
        em.build_elementwise_add(&x, &x, &s8),
        Err(Error::Construction { .. })
    ));
    let any = MemoryDesc::any(vec![2, 2, 2, 2], DataType::S8).unwrap();
    assert!(em.build_elementwise_add(&x, &x, &any).is_err());
    assert!(em.registry().is_empty());
}

#[test]
fn test_softmax_and_lrn() {
    let mut em = emitter();
    let x = md(&[4, 10], MemoryFormat::Nc);
    let h = em.build_softmax_forward(&x, &x, 1).unwrap();
    assert_eq!(deps(&em, h).len(), 2);
    assert!(em.build_softmax_forward(&x, &x, 2).is_err());

    let y = nchw(&[1, 8, 4, 4]);
    let h = em.build_lrn_forward(&y, &y, 1e-4, 0.75, 1.0, 5).unwrap();
    assert_eq!(em.get_kernel(h).unwrap().desc.name(), "lrn_forward");
}

// Reorder, slice, concat

#[test]
fn test_reorder_and_quantize() {
    let mut em = emitter();
    let src = nchw(&[1, 16, 2, 2]);
    let blocked = md(&[1, 16, 2, 2], MemoryFormat::NChw16c);
    let h = em.build_reorder(&src, &blocked).unwrap();
    assert_eq!(deps(&em, h), vec![0, 1]);

    let q = MemoryDesc::new(vec![1, 16, 2, 2], DataType::U8, MemoryFormat::Nchw).unwrap();
    let h = em.build_quantize_reorder(&src, &q, &[127.0]).unwrap();
    let attr = &em.get_kernel(h).unwrap().attr;
    assert_eq!(attr.output_scales.as_ref().unwrap().mask, 0);
    assert_eq!(attr.round_mode, Some(RoundMode::Nearest));
}

#[test]
fn test_dequantization_uses_first_scale() {
    let mut em = emitter();
    let q = MemoryDesc::new(vec![8], DataType::S8, MemoryFormat::X).unwrap();
    let f = md(&[8], MemoryFormat::X);
    let h = em.build_dequantization(&q, &f, Some(&[0.25, 4.0])).unwrap();
    assert_eq!(
        em.get_kernel(h).unwrap().attr.output_scales.as_ref().unwrap().scales,
        vec![0.25]
    );
    let h = em.build_dequantization(&q, &f, None).unwrap();
    assert_eq!(
        em.get_kernel(h).unwrap().attr.output_scales.as_ref().unwrap().scales,
        vec![1.0]
    );
}

#[test]
fn test_slice_keeps_full_input_slot() {
    let mut em = emitter();
    let h = em
        .build_slice(&nchw(&[2, 4, 6, 6]), &nchw(&[1, 2, 3, 3]), &[1, 2, 0, 3], &[1, 2, 3, 3])
        .unwrap();
    assert_eq!(memory_at(&em, h, 0).dims(), &[2, 4, 6, 6]);
    assert_eq!(memory_at(&em, h, 1).dims(), &[1, 2, 3, 3]);

    let desc = SliceDesc::new(nchw(&[2, 4, 6, 6]), nchw(&[1, 2, 2, 2]), vec![0, 0, 0, 0], vec![1, 2, 2, 2]);
    em.rebuild_slice(&desc, h).unwrap();
    assert_eq!(memory_at(&em, h, 1).dims(), &[1, 2, 2, 2]);
}

#[test]
fn test_concat_dependencies() {
    let mut em = emitter();
    let inputs = [nchw(&[1, 2, 3, 3]), nchw(&[1, 3, 3, 3]), nchw(&[1, 1, 3, 3])];
    let any = MemoryDesc::any(vec![1, 6, 3, 3], DataType::F32).unwrap();
    let h = em.build_concat(&inputs, &any, 1).unwrap();
    assert_eq!(deps(&em, h), vec![0, 1, 2, 3]);
    assert_eq!(memory_at(&em, h, 3).format(), MemoryFormat::Nchw);

    let desc = ConcatDesc::new(inputs[..2].to_vec(), nchw(&[1, 5, 3, 3]), 1);
    assert!(matches!(
        em.rebuild_concat(&desc, h),
        Err(Error::DependencyArity {
            expected: 3,
            found: 4,
            ..
        })
    ));
}

#[test]
fn test_concat_dst_type_must_match() {
    let mut em = emitter();
    let inputs = [nchw(&[1, 2, 3, 3]), nchw(&[1, 3, 3, 3])];
    let u8_dst = MemoryDesc::new(vec![1, 5, 3, 3], DataType::U8, MemoryFormat::Nchw).unwrap();
    assert!(matches!(
        em.build_concat(&inputs, &u8_dst, 1),
        Err(Error::Construction { .. })
    ));
    assert!(em.registry().is_empty());
}

// RNN

fn vanilla_rnn(steps: usize) -> RnnForwardDesc {
    RnnForwardDesc::new(
        RnnCell::VanillaRnn,
        RnnDirection::UnidirectionalLeft2Right,
        md(&[steps, 2, 4], MemoryFormat::Tnc),
        md(&[1, 1, 1, 2, 4], MemoryFormat::Ldsnc),
        md(&[1, 1, 4, 1, 4], MemoryFormat::Ldigo),
        md(&[1, 1, 4, 1, 4], MemoryFormat::Ldigo),
        md(&[1, 1, 1, 4], MemoryFormat::Ldgo),
        md(&[steps, 2, 4], MemoryFormat::Tnc),
        md(&[1, 1, 1, 2, 4], MemoryFormat::Ldsnc),
    )
}

#[test]
fn test_rnn_forward_dependencies() {
    let mut em = emitter();
    let h = em.build_rnn_forward(&vanilla_rnn(3)).unwrap();
    let d = em.get_dependencies(h).unwrap().clone();
    assert_eq!(d.len(), 9);
    assert!(d.workspace(8).is_some());
    assert_eq!(memory_at(&em, h, 7).data_type(), DataType::U8);
    let ws = em.workspace(d.workspace(8).unwrap()).unwrap();
    assert_eq!(ws.size(), memory_at(&em, h, 7).size_in_bytes());
}

#[test]
fn test_rnn_rebuild_allocates_new_workspace() {
    let mut em = emitter();
    let h = em.reserve_primitive_space(9, true).unwrap();
    assert_eq!(deps(&em, h)[8], 0);
    em.rebuild_rnn_forward(&vanilla_rnn(3), h).unwrap();
    let first = em.get_dependencies(h).unwrap().workspace(8).unwrap();
    em.rebuild_rnn_forward(&vanilla_rnn(5), h).unwrap();
    let second = em.get_dependencies(h).unwrap().workspace(8).unwrap();
    assert_ne!(first, second);
    assert!(em.workspace(second).unwrap().size() > em.workspace(first).unwrap().size());
    assert_eq!(em.workspace_stats().buffers, 2);
}

// Memory descriptors

#[test]
fn test_placeholder_memory_primitive_creates_no_entry() {
    let mut em = emitter();
    let shape = Shape::new(vec![2, 3]);
    let any = em
        .build_memory_descriptor(&shape, DType::F32, MemoryFormat::Any)
        .unwrap();
    assert!(em.build_memory_primitive(&any).is_err());
    assert!(em.build_memory_descriptor(&shape, DType::F32, MemoryFormat::Undef).is_err());
    assert!(em.registry().is_empty());
}

#[test]
fn test_unsupported_dtype() {
    let shape = Shape::new(vec![4]);
    assert!(matches!(
        build_descriptor(&shape, DType::F64, MemoryFormat::X),
        Err(Error::Unsupported(_))
    ));
}

proptest! {
    #[test]
    fn prop_plain_descriptor_size(n in 1usize..4, c in 1usize..9, h in 1usize..9, w in 1usize..9) {
        let shape = Shape::new(vec![n, c, h, w]);
        let plain = build_descriptor(&shape, DType::F32, MemoryFormat::Nchw).unwrap();
        prop_assert_eq!(plain.size_in_bytes(), n * c * h * w * 4);

        let blocked = build_blocked_descriptor(&shape, &shape.stride_contiguous(), DType::F32).unwrap();
        prop_assert_eq!(blocked.size_in_bytes(), plain.size_in_bytes());
        prop_assert_eq!(blocked.format(), MemoryFormat::Blocked);
    }

    #[test]
    fn prop_channel_blocking_pads(c in 1usize..40) {
        let d = MemoryDesc::new(vec![1, c, 2, 2], DataType::F32, MemoryFormat::NChw16c).unwrap();
        prop_assert_eq!(d.size_in_bytes(), c.div_ceil(16) * 16 * 4 * 4);
    }
}
