//! Vendor device backend on CUDA (requires the `cuda` feature).
//!
//! [`CudaLink`] mirrors the portable backend's verbs with cudarc typed
//! slices. The 2-D strided transfers fold the pitch parameters into
//! per-row slice offsets; a contiguous region is a single copy. The
//! overwrite path copies element-wise — the patch lists are small by
//! contract, and that keeps the backend free of runtime kernel
//! compilation.

use std::marker::PhantomData;
use std::sync::Arc;

use bytemuck::Zeroable;
use cudarc::driver::{CudaDevice, CudaSlice, DeviceRepr, DriverError, ValidAsZeroBits};

use crate::error::{HaloError, Result};
use crate::region::Region;
use crate::scalar::Scalar;

fn device_err(e: DriverError) -> HaloError {
    HaloError::Device(format!("CUDA: {e}"))
}

/// Device link for the vendor backend: one CUDA device (context and
/// default stream included) shared by all halos on it.
pub struct CudaLink<T> {
    dev: Arc<CudaDevice>,
    _elem: PhantomData<T>,
}

impl<T: Scalar + DeviceRepr + ValidAsZeroBits> CudaLink<T> {
    /// Create a link on the CUDA device at `ordinal`.
    pub fn new(ordinal: usize) -> Result<Self> {
        let dev = CudaDevice::new(ordinal).map_err(device_err)?;
        Ok(Self::from_device(dev))
    }

    /// Adopt an existing device handle.
    pub fn from_device(dev: Arc<CudaDevice>) -> Self {
        Self {
            dev,
            _elem: PhantomData,
        }
    }

    /// The underlying device handle.
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.dev
    }

    /// Allocate a zero-filled device-resident staging buffer.
    pub(crate) fn alloc_device_staging(&self, len: usize) -> Result<CudaSlice<T>> {
        self.dev.alloc_zeros::<T>(len).map_err(device_err)
    }

    /// Gather the region-covered elements of `buf` into host `staging`.
    pub(crate) fn pack(
        &self,
        regions: &[Region],
        buf: &CudaSlice<T>,
        staging: &mut [T],
    ) -> Result<()> {
        let mut cursor = 0;
        for region in regions {
            for r in 0..region.rows {
                let row = region.row_start(r);
                self.dev
                    .dtoh_sync_copy_into(
                        &buf.slice(row..row + region.cols),
                        &mut staging[cursor..cursor + region.cols],
                    )
                    .map_err(device_err)?;
                cursor += region.cols;
            }
        }
        Ok(())
    }

    /// Scatter host `staging` back into the region-covered elements of
    /// `buf`.
    pub(crate) fn unpack(
        &self,
        regions: &[Region],
        staging: &[T],
        buf: &mut CudaSlice<T>,
    ) -> Result<()> {
        let mut cursor = 0;
        for region in regions {
            for r in 0..region.rows {
                let row = region.row_start(r);
                self.dev
                    .htod_sync_copy_into(
                        &staging[cursor..cursor + region.cols],
                        &mut buf.slice_mut(row..row + region.cols),
                    )
                    .map_err(device_err)?;
                cursor += region.cols;
            }
        }
        Ok(())
    }

    /// Device-to-device gather from `buf` into the device staging window
    /// starting at element `offset`.
    pub(crate) fn pack_resident(
        &self,
        regions: &[Region],
        buf: &CudaSlice<T>,
        staging: &mut CudaSlice<T>,
        offset: usize,
    ) -> Result<()> {
        let mut cursor = offset;
        for region in regions {
            for r in 0..region.rows {
                let row = region.row_start(r);
                self.dev
                    .dtod_copy(
                        &buf.slice(row..row + region.cols),
                        &mut staging.slice_mut(cursor..cursor + region.cols),
                    )
                    .map_err(device_err)?;
                cursor += region.cols;
            }
        }
        Ok(())
    }

    /// Device-to-device scatter from the device staging window starting at
    /// element `offset` back into `buf`.
    pub(crate) fn unpack_resident(
        &self,
        regions: &[Region],
        staging: &CudaSlice<T>,
        offset: usize,
        buf: &mut CudaSlice<T>,
    ) -> Result<()> {
        let mut cursor = offset;
        for region in regions {
            for r in 0..region.rows {
                let row = region.row_start(r);
                self.dev
                    .dtod_copy(
                        &staging.slice(cursor..cursor + region.cols),
                        &mut buf.slice_mut(row..row + region.cols),
                    )
                    .map_err(device_err)?;
                cursor += region.cols;
            }
        }
        Ok(())
    }

    /// Whole-buffer device-to-device copy of `len` elements (same-rank
    /// staging handoff).
    pub(crate) fn copy_device(
        &self,
        src: &CudaSlice<T>,
        dst: &mut CudaSlice<T>,
        len: usize,
    ) -> Result<()> {
        self.dev
            .dtod_copy(&src.slice(0..len), &mut dst.slice_mut(0..len))
            .map_err(device_err)
    }

    /// Fetch `buf[indices[i]]` for each `i`.
    pub(crate) fn gather_indices(&self, buf: &CudaSlice<T>, indices: &[usize]) -> Result<Vec<T>> {
        let mut out = Vec::with_capacity(indices.len());
        let mut one = [T::zeroed(); 1];
        for &i in indices {
            self.dev
                .dtoh_sync_copy_into(&buf.slice(i..i + 1), &mut one)
                .map_err(device_err)?;
            out.push(one[0]);
        }
        Ok(out)
    }

    /// Store `values[i]` at `buf[indices[i]]`.
    pub(crate) fn scatter_indices(
        &self,
        buf: &mut CudaSlice<T>,
        indices: &[usize],
        values: &[T],
    ) -> Result<()> {
        for (&i, value) in indices.iter().zip(values) {
            self.dev
                .htod_sync_copy_into(std::slice::from_ref(value), &mut buf.slice_mut(i..i + 1))
                .map_err(device_err)?;
        }
        Ok(())
    }
}
