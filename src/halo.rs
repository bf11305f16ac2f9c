//! Per-halo bookkeeping: optimization hints, the aligned staging slab, and
//! the registry entry that ties a descriptor to its transport state.

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::error::{HaloError, Result};
use crate::region::{self, Region};
use crate::scalar::Scalar;
use crate::transport::{Rank, Transport};

/// Staging slabs are aligned for cache-line and wide-load friendliness.
pub(crate) const STAGING_ALIGN: usize = 64;

/// Optimization hints for a halo, combinable with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hints(u32);

impl Hints {
    /// No hints.
    pub const NONE: Hints = Hints(1);
    /// Skip staging: describe the halo to the transport as a derived
    /// datatype and gather/scatter directly over the user buffer.
    pub const DERIVED_DATATYPE: Hints = Hints(2);
    /// Keep the staging buffer in device memory. Only meaningful for
    /// same-rank exchanges where both halos use the same device backend.
    pub const STAYS_ON_DEVICE: Hints = Hints(4);
    /// Explicitly request host staging for a device-packed halo.
    pub const DOES_NOT_STAY_ON_DEVICE: Hints = Hints(8);

    /// Whether every hint in `other` is set in `self`.
    pub fn contains(self, other: Hints) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation.
    pub fn bits(self) -> u32 {
        self.0
    }

    pub(crate) fn validate(self) -> Result<()> {
        if self.contains(Hints::STAYS_ON_DEVICE) && self.contains(Hints::DOES_NOT_STAY_ON_DEVICE) {
            return Err(HaloError::Config(
                "stays-on-device and does-not-stay-on-device are mutually exclusive".into(),
            ));
        }
        if self.contains(Hints::DERIVED_DATATYPE) && self.contains(Hints::STAYS_ON_DEVICE) {
            return Err(HaloError::Config(
                "derived-datatype halos have no staging to keep on the device".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Hints {
    fn default() -> Self {
        Hints::NONE
    }
}

impl std::ops::BitOr for Hints {
    type Output = Hints;

    fn bitor(self, rhs: Hints) -> Hints {
        Hints(self.0 | rhs.0)
    }
}

/// Contiguous staging slab owned by one halo entry.
///
/// Allocated once at registration, 64-byte aligned and zero-filled. The
/// address is stable for the life of the entry — persistent transport
/// handles are bound to it. Empty and derived-datatype halos get a
/// 1-element placeholder that is never written.
pub(crate) struct StagingBuffer<T> {
    ptr: NonNull<T>,
    len: usize,
    layout: Layout,
}

impl<T: Scalar> StagingBuffer<T> {
    pub(crate) fn zeroed(len: usize) -> Self {
        let len = len.max(1);
        let layout = Layout::array::<T>(len)
            .and_then(|l| l.align_to(STAGING_ALIGN))
            .expect("staging layout overflow");
        // Pod guarantees the all-zero bit pattern is a valid T.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw as *mut T) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Self { ptr, len, layout }
    }
}

impl<T> Deref for StagingBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for StagingBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for StagingBuffer<T> {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, self.layout) };
    }
}

unsafe impl<T: Send> Send for StagingBuffer<T> {}
unsafe impl<T: Sync> Sync for StagingBuffer<T> {}

/// Transport binding state of one halo entry.
///
/// `Unbound` until the first send/recv resolves a peer; `Loopback` when
/// that peer is the local rank (no transport handle is ever created);
/// `Bound` holds the persistent handle that subsequent calls restart.
pub(crate) enum Binding<R> {
    Unbound,
    Loopback,
    Bound(R),
}

/// Device-side staging slab for a stays-on-device halo.
pub(crate) enum DeviceStaging<T> {
    Wgpu(wgpu::Buffer, PhantomData<T>),
    #[cfg(feature = "cuda")]
    Cuda(cudarc::driver::CudaSlice<T>),
}

/// One registered halo: the compiled descriptor plus everything the
/// pack/unpack engines and the transport coordinator need. Send and
/// receive registries hold the same shape.
pub(crate) struct HaloEntry<T: Scalar, C: Transport<T>> {
    pub(crate) regions: Vec<Region>,
    /// Elements covered by one payload (`Σ cols·rows`).
    pub(crate) count: usize,
    /// Independent payloads multiplexed through this halo.
    pub(crate) num_buffers: usize,
    /// Default peer; calls may override it until the halo is bound.
    pub(crate) peer: Option<Rank>,
    pub(crate) hints: Hints,
    /// Derived layout handle, present iff the hint asked for one.
    pub(crate) datatype: Option<C::Datatype>,
    // Request handles are declared before the staging slab they point
    // into, so drop releases them first.
    pub(crate) binding: Binding<C::Request>,
    /// In-flight one-shot request from the derived-datatype path.
    pub(crate) oneshot: Option<C::Request>,
    pub(crate) device: Option<DeviceStaging<T>>,
    pub(crate) staging: StagingBuffer<T>,
}

impl<T: Scalar, C: Transport<T>> HaloEntry<T, C> {
    pub(crate) fn new(
        regions: Vec<Region>,
        num_buffers: usize,
        peer: Option<Rank>,
        hints: Hints,
        datatype: Option<C::Datatype>,
    ) -> Self {
        let count = region::element_count(&regions);
        let staging_len = if datatype.is_some() || count == 0 {
            1
        } else {
            num_buffers * count
        };
        Self {
            regions,
            count,
            num_buffers,
            peer,
            hints,
            datatype,
            binding: Binding::Unbound,
            oneshot: None,
            device: None,
            staging: StagingBuffer::zeroed(staging_len),
        }
    }

    /// Staging window of payload `buffer`.
    pub(crate) fn window(&self, buffer: usize) -> std::ops::Range<usize> {
        buffer * self.count..(buffer + 1) * self.count
    }
}
