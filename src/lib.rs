//! # halocline
//!
//! Halo-exchange runtime for stencil codes on partitioned
//! distributed-memory meshes.
//!
//! Each rank owns a dense buffer of scalar values; at iteration boundaries
//! it must import ghost values from its neighbors and export the symmetric
//! set of its own values. This crate compiles the scattered halo index
//! lists into compact strided regions once, at registration, then drives
//! the exchange: gather into a per-halo staging buffer, send through
//! persistent point-to-point transport, receive, scatter out. Same-rank
//! exchanges short-circuit the transport entirely, and derived-datatype
//! halos let the transport gather/scatter in place with no staging at all.
//! Packing works against host buffers, portable-GPU buffers (wgpu), and
//! CUDA buffers (cudarc).
//!
//! ## Quick start
//!
//! ```
//! use halocline::{HaloExchanger, Hints};
//!
//! // Single-process: both halos live on rank 0.
//! let mut exchanger = HaloExchanger::<f64>::single_process();
//! let send = exchanger
//!     .add_send_halo(&[10, 11, 12, 13], 1, Some(0), Hints::NONE)
//!     .unwrap();
//! let recv = exchanger
//!     .add_recv_halo(&[0, 1, 2, 3], 1, Some(0), Hints::NONE)
//!     .unwrap();
//!
//! let src: Vec<f64> = (0..16).map(|v| v as f64).collect();
//! let mut dst = vec![0.0; 16];
//! exchanger.pack(send, 0, &src).unwrap();
//! exchanger.send(send, 42).unwrap();
//! exchanger.recv(recv, 42).unwrap();
//! exchanger.unpack(recv, 0, &mut dst).unwrap();
//! assert_eq!(&dst[0..4], &[10.0, 11.0, 12.0, 13.0]);
//! ```
//!
//! Cross-rank exchange uses the same verbs over [`MpiTransport`]
//! (`distributed` feature):
//!
//! ```ignore
//! let _universe = mpi::initialize().expect("MPI init failed");
//! let mut exchanger =
//!     HaloExchanger::<f64, MpiTransport>::new(MpiTransport::world());
//! ```
//!
//! ## Feature flags
//!
//! | Feature       | Description                          | Crates   |
//! |---------------|--------------------------------------|----------|
//! | `distributed` | MPI transport for cross-rank halos   | `mpi`    |
//! | `cuda`        | Vendor device backend                | `cudarc` |
//!
//! The portable device backend (wgpu) is always available.

pub mod error;
pub mod exchanger;
pub mod gpu;
pub mod gpu_shaders;
pub mod halo;
pub mod region;
pub mod scalar;
pub mod transport;

#[cfg(feature = "cuda")]
pub mod cuda;
#[cfg(feature = "distributed")]
pub mod transport_mpi;

pub use error::{HaloError, Result};
pub use exchanger::{HaloExchanger, RecvOptions, SendOptions};
pub use gpu::WgpuLink;
pub use halo::Hints;
pub use region::{compress_indices, Region};
pub use scalar::{GpuScalar, Scalar};
pub use transport::{Rank, SingleProcess, Tag, Transport, TransportRequest};

#[cfg(feature = "cuda")]
pub use cuda::CudaLink;
#[cfg(feature = "distributed")]
pub use transport_mpi::{MpiRequest, MpiTransport};
