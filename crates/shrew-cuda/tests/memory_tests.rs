// Device memory tests — buffer cache, copies and fills on device 0
//
// Compiled only with `--features cuda`; requires a CUDA device.

#![cfg(feature = "cuda")]

use shrew_cuda::GpuMemory;

fn gpu() -> GpuMemory {
    GpuMemory::new(0).expect("CUDA device 0 not available")
}

#[test]
fn test_roundtrip_through_device() {
    let mem = gpu();
    let mut a = mem.create_gpu_buffer(16).unwrap();
    let mut b = mem.create_gpu_buffer(16).unwrap();
    let host: Vec<u8> = (0..16).collect();
    mem.memcpy_htod(&mut a, &host).unwrap();
    mem.memcpy_dtod(&mut b, &a, 16).unwrap();
    let mut back = vec![0u8; 16];
    mem.memcpy_dtoh(&mut back, &b).unwrap();
    assert_eq!(back, host);
}

#[test]
fn test_memset_prefix() {
    let mem = gpu();
    let mut a = mem.create_gpu_buffer(8).unwrap();
    mem.memset(&mut a, 0, 8).unwrap();
    mem.memset(&mut a, 7, 4).unwrap();
    let mut back = vec![0u8; 8];
    mem.memcpy_dtoh(&mut back, &a).unwrap();
    assert_eq!(back, vec![7, 7, 7, 7, 0, 0, 0, 0]);
    assert!(mem.memset(&mut a, 1, 9).is_err());
}

#[test]
fn test_format_f32_tensor() {
    let mem = gpu();
    let mut a = mem.create_gpu_buffer(12).unwrap();
    let host: Vec<u8> = [1.0f32, 2.5, -3.0]
        .iter()
        .flat_map(|v| v.to_ne_bytes())
        .collect();
    mem.memcpy_htod(&mut a, &host).unwrap();
    assert_eq!(mem.format_f32_tensor(&a, 3).unwrap(), "{1, 2.5, -3}");
}

#[test]
fn test_freed_buffers_are_reused() {
    let mem = gpu();
    let a = mem.create_gpu_buffer(64).unwrap();
    mem.free_gpu_buffer(a);
    assert_eq!(mem.pool_stats().cached_buffers, 1);
    let _b = mem.create_gpu_buffer(64).unwrap();
    let stats = mem.pool_stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
    assert_eq!(stats.cached_buffers, 0);
    mem.empty_cache();
}
