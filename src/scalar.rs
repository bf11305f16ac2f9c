//! Element type traits for halo payloads.
//!
//! [`Scalar`] is a **sealed trait** mapping the supported element types to
//! what the engines need: a `Pod` bound so staging memory can be viewed as
//! bytes, and `Send + Sync` so exchangers can be moved across threads.
//! [`GpuScalar`] additionally carries the element's spelling in embedded
//! kernel source for the portable device backend.

/// Internal module to seal the traits — prevents external implementations.
mod sealed {
    pub trait Sealed {}
}

/// Trait for types that can ride through a halo exchange.
///
/// Supported types: [`f32`], [`f64`], [`i32`], [`i64`], [`u8`], [`u32`],
/// [`u64`]. The MPI transport additionally requires
/// `mpi::datatype::Equivalence`, which all of these implement.
pub trait Scalar: sealed::Sealed + bytemuck::Pod + Send + Sync + 'static {}

/// Scalar types the portable device backend can address.
///
/// `WGSL_TYPE` is the array element spelling used when the gather/scatter
/// kernel source is generated. The kernels only move bits, so 8-byte types
/// ride as `vec2<u32>` (WGSL has no 64-bit scalars). `u8` is excluded:
/// WGSL storage arrays cannot address single bytes.
pub trait GpuScalar: Scalar {
    /// Element spelling in generated WGSL kernel source.
    const WGSL_TYPE: &'static str;
}

macro_rules! impl_scalar {
    ($ty:ty) => {
        impl sealed::Sealed for $ty {}
        impl Scalar for $ty {}
    };
    ($ty:ty, $wgsl:expr) => {
        impl_scalar!($ty);
        impl GpuScalar for $ty {
            const WGSL_TYPE: &'static str = $wgsl;
        }
    };
}

impl_scalar!(f32, "f32");
impl_scalar!(f64, "vec2<u32>");
impl_scalar!(i32, "i32");
impl_scalar!(i64, "vec2<u32>");
impl_scalar!(u8);
impl_scalar!(u32, "u32");
impl_scalar!(u64, "vec2<u32>");
