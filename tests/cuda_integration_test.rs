//! Integration tests for the CUDA device backend.
//!
//! Require the `cuda` feature and a CUDA device at runtime; each test
//! skips itself when no device is present.

#![cfg(feature = "cuda")]

use cudarc::driver::CudaDevice;
use halocline::{CudaLink, HaloExchanger, Hints};

macro_rules! skip_if_no_cuda {
    ($dev:ident) => {
        let Ok($dev) = CudaDevice::new(0) else {
            eprintln!("skipping: no CUDA device available");
            return;
        };
    };
}

#[test]
fn device_pack_unpack_round_trip() {
    skip_if_no_cuda!(dev);
    let link = CudaLink::<f64>::from_device(dev.clone());
    let mut x = HaloExchanger::<f64>::single_process().with_cuda(link);

    // Column of a 4x4 grid plus a contiguous run.
    let send = x
        .add_send_halo(&[1, 5, 9, 13], 1, Some(0), Hints::NONE)
        .unwrap();
    let recv = x
        .add_recv_halo(&[0, 1, 2, 3], 1, Some(0), Hints::NONE)
        .unwrap();

    let host: Vec<f64> = (0..16).map(|v| v as f64).collect();
    let device_src = dev.htod_copy(host).unwrap();
    let mut device_dst = dev.alloc_zeros::<f64>(16).unwrap();

    x.pack_cuda(send, 0, &device_src).unwrap();
    x.send(send, 0).unwrap();
    x.recv(recv, 0).unwrap();
    x.unpack_cuda(recv, 0, &mut device_dst).unwrap();

    let out = dev.dtoh_sync_copy(&device_dst).unwrap();
    assert_eq!(&out[0..4], &[1.0, 5.0, 9.0, 13.0]);
    assert!(out[4..].iter().all(|&v| v == 0.0));
}

#[test]
fn overwrite_variants_patch_individual_elements() {
    skip_if_no_cuda!(dev);
    let link = CudaLink::<f64>::from_device(dev.clone());
    let mut x = HaloExchanger::<f64>::single_process().with_cuda(link);

    let send = x.add_send_halo(&[0, 1, 2], 1, Some(0), Hints::NONE).unwrap();
    let recv = x.add_recv_halo(&[0, 1, 2], 1, Some(0), Hints::NONE).unwrap();

    let device_src = dev.htod_copy(vec![5.0, 6.0, 7.0, 99.0]).unwrap();
    x.pack_cuda(send, 0, &device_src).unwrap();
    x.pack_cuda_overwrite(send, 0, &device_src, &[1], &[3])
        .unwrap();
    x.send(send, 0).unwrap();
    x.recv(recv, 0).unwrap();

    let mut device_dst = dev.alloc_zeros::<f64>(4).unwrap();
    x.unpack_cuda_overwrite(recv, 0, &mut device_dst, &[1, 2], &[3, 0])
        .unwrap();
    let out = dev.dtoh_sync_copy(&device_dst).unwrap();
    assert_eq!(out, vec![7.0, 0.0, 0.0, 99.0]);
}

#[test]
fn device_resident_staging_loopback() {
    skip_if_no_cuda!(dev);
    let link = CudaLink::<f64>::from_device(dev.clone());
    let mut x = HaloExchanger::<f64>::single_process().with_cuda(link);

    let send = x
        .add_send_halo(&[1, 2], 1, Some(0), Hints::STAYS_ON_DEVICE)
        .unwrap();
    let recv = x
        .add_recv_halo(&[4, 5], 1, Some(0), Hints::STAYS_ON_DEVICE)
        .unwrap();

    let device_src = dev.htod_copy(vec![0.0, 8.0, 9.0, 0.0, 0.0, 0.0]).unwrap();
    let mut device_dst = dev.alloc_zeros::<f64>(6).unwrap();

    x.pack_cuda(send, 0, &device_src).unwrap();
    assert!(!x.send(send, 0).unwrap());
    assert!(!x.recv_cuda(recv, 0, None).unwrap());
    x.unpack_cuda(recv, 0, &mut device_dst).unwrap();

    let out = dev.dtoh_sync_copy(&device_dst).unwrap();
    assert_eq!(out, vec![0.0, 0.0, 0.0, 0.0, 8.0, 9.0]);
}
