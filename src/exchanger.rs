//! The halo registry and transport coordinator.
//!
//! [`HaloExchanger`] owns two dense registries (send halos, receive halos),
//! packs and unpacks payloads between user buffers and per-halo staging,
//! and drives the transport: persistent handles are bound lazily on first
//! use and restarted afterwards, same-rank exchanges short-circuit the
//! transport through an in-process staging copy, and derived-datatype
//! halos skip staging entirely.
//!
//! A halo id is owned by one logical thread of control; concurrent calls
//! on the same id are not supported. Within one id the verbs are strictly
//! ordered: a send restarts only after the previous transmission drained.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use crate::error::{HaloError, Result};
use crate::gpu::WgpuLink;
use crate::halo::{Binding, DeviceStaging, HaloEntry, Hints};
use crate::region::{self, Region};
use crate::scalar::{GpuScalar, Scalar};
use crate::transport::{Rank, SingleProcess, Tag, Transport, TransportRequest};

#[cfg(feature = "cuda")]
use crate::cuda::CudaLink;
#[cfg(feature = "cuda")]
use cudarc::driver::{CudaSlice, DeviceRepr, ValidAsZeroBits};

/// Per-call options for [`HaloExchanger::send_opts`].
///
/// `user_buf` is consulted only on the derived-datatype path. Sends
/// default to non-blocking.
pub struct SendOptions<'a, T> {
    /// Override the halo's default peer. Ignored once the halo is bound.
    pub peer: Option<Rank>,
    /// Source buffer for derived-datatype halos.
    pub user_buf: Option<&'a [T]>,
    /// Wait for completion before returning.
    pub blocking: bool,
}

impl<T> Default for SendOptions<'_, T> {
    fn default() -> Self {
        Self {
            peer: None,
            user_buf: None,
            blocking: false,
        }
    }
}

/// Per-call options for [`HaloExchanger::recv_opts`]. Receives default to
/// blocking.
pub struct RecvOptions<'a, T> {
    /// Override the halo's default peer. Ignored once the halo is bound.
    pub peer: Option<Rank>,
    /// Destination buffer for derived-datatype halos.
    pub user_buf: Option<&'a mut [T]>,
    /// Wait for completion before returning.
    pub blocking: bool,
}

impl<T> Default for RecvOptions<'_, T> {
    fn default() -> Self {
        Self {
            peer: None,
            user_buf: None,
            blocking: true,
        }
    }
}

/// Halo-exchange runtime for one element type over one transport.
///
/// ```
/// use halocline::{HaloExchanger, Hints};
///
/// let mut exchanger = HaloExchanger::<f64>::single_process();
/// let send = exchanger
///     .add_send_halo(&[1, 2], 1, Some(0), Hints::NONE)
///     .unwrap();
/// let recv = exchanger
///     .add_recv_halo(&[7, 8], 1, Some(0), Hints::NONE)
///     .unwrap();
///
/// let src = [0.0, 1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
/// let mut dst = [0.0; 9];
/// exchanger.pack_and_send(send, &src, 0, None).unwrap();
/// exchanger.recv_and_unpack(recv, &mut dst, 0, None).unwrap();
/// assert_eq!(&dst[7..9], &[1.0, 2.0]);
/// ```
pub struct HaloExchanger<T: Scalar, C: Transport<T> = SingleProcess<T>> {
    transport: C,
    sends: Vec<HaloEntry<T, C>>,
    recvs: Vec<HaloEntry<T, C>>,
    /// Same-rank routing: (local rank, tag) -> send halo id.
    loopback: BTreeMap<(Rank, Tag), usize>,
    gpu: Option<WgpuLink<T>>,
    #[cfg(feature = "cuda")]
    cuda: Option<CudaLink<T>>,
}

impl<T: Scalar> HaloExchanger<T, SingleProcess<T>> {
    /// Exchanger over the in-process transport: every halo is same-rank.
    pub fn single_process() -> Self {
        Self::new(SingleProcess::new())
    }
}

impl<T: Scalar, C: Transport<T>> HaloExchanger<T, C> {
    pub fn new(transport: C) -> Self {
        Self {
            transport,
            sends: Vec::new(),
            recvs: Vec::new(),
            loopback: BTreeMap::new(),
            gpu: None,
            #[cfg(feature = "cuda")]
            cuda: None,
        }
    }

    /// Attach a portable device link for the `*_gpu` verbs.
    pub fn with_wgpu(mut self, link: WgpuLink<T>) -> Self {
        self.gpu = Some(link);
        self
    }

    /// Attach a CUDA device link for the `*_cuda` verbs.
    #[cfg(feature = "cuda")]
    pub fn with_cuda(mut self, link: CudaLink<T>) -> Self {
        self.cuda = Some(link);
        self
    }

    /// The underlying transport.
    pub fn transport(&self) -> &C {
        &self.transport
    }

    // ---- registration -------------------------------------------------

    /// Register an outgoing halo from a flat ordered index list. Returns
    /// the halo's dense id.
    pub fn add_send_halo(
        &mut self,
        indices: &[usize],
        num_buffers: usize,
        peer: Option<Rank>,
        hints: Hints,
    ) -> Result<usize> {
        self.add_send_regions(region::compress_indices(indices), num_buffers, peer, hints)
    }

    /// Register an outgoing halo from a prebuilt region list.
    pub fn add_send_regions(
        &mut self,
        regions: Vec<Region>,
        num_buffers: usize,
        peer: Option<Rank>,
        hints: Hints,
    ) -> Result<usize> {
        let entry = self.new_entry(regions, num_buffers, peer, hints)?;
        self.sends.push(entry);
        let id = self.sends.len() - 1;
        let entry = &self.sends[id];
        tracing::debug!(
            id,
            regions = entry.regions.len(),
            elements = entry.count,
            num_buffers,
            "registered send halo"
        );
        Ok(id)
    }

    /// Register an incoming halo from a flat ordered index list.
    pub fn add_recv_halo(
        &mut self,
        indices: &[usize],
        num_buffers: usize,
        peer: Option<Rank>,
        hints: Hints,
    ) -> Result<usize> {
        self.add_recv_regions(region::compress_indices(indices), num_buffers, peer, hints)
    }

    /// Register an incoming halo from a prebuilt region list.
    pub fn add_recv_regions(
        &mut self,
        regions: Vec<Region>,
        num_buffers: usize,
        peer: Option<Rank>,
        hints: Hints,
    ) -> Result<usize> {
        let entry = self.new_entry(regions, num_buffers, peer, hints)?;
        self.recvs.push(entry);
        let id = self.recvs.len() - 1;
        let entry = &self.recvs[id];
        tracing::debug!(
            id,
            regions = entry.regions.len(),
            elements = entry.count,
            num_buffers,
            "registered recv halo"
        );
        Ok(id)
    }

    fn new_entry(
        &self,
        regions: Vec<Region>,
        num_buffers: usize,
        peer: Option<Rank>,
        hints: Hints,
    ) -> Result<HaloEntry<T, C>> {
        region::validate(&regions)?;
        hints.validate()?;
        if num_buffers == 0 {
            return Err(HaloError::Config("num_buffers must be at least 1".into()));
        }
        let datatype = if hints.contains(Hints::DERIVED_DATATYPE) && !regions.is_empty() {
            if num_buffers > 1 {
                return Err(HaloError::Config(
                    "derived-datatype halos describe a single payload; num_buffers must be 1"
                        .into(),
                ));
            }
            Some(self.transport.build_datatype(&regions)?)
        } else {
            None
        };
        Ok(HaloEntry::new(regions, num_buffers, peer, hints, datatype))
    }

    /// Number of registered send halos.
    pub fn send_halo_count(&self) -> usize {
        self.sends.len()
    }

    /// Number of registered receive halos.
    pub fn recv_halo_count(&self) -> usize {
        self.recvs.len()
    }

    /// Elements covered by one payload of a send halo.
    pub fn send_element_count(&self, halo: usize) -> Result<usize> {
        self.check_send_id(halo)?;
        Ok(self.sends[halo].count)
    }

    /// Elements covered by one payload of a receive halo.
    pub fn recv_element_count(&self, halo: usize) -> Result<usize> {
        self.check_recv_id(halo)?;
        Ok(self.recvs[halo].count)
    }

    // ---- host pack/unpack ---------------------------------------------

    /// Gather the halo-covered elements of `buf` into staging payload
    /// window `buffer`.
    pub fn pack(&mut self, halo: usize, buffer: usize, buf: &[T]) -> Result<()> {
        self.check_send_id(halo)?;
        let entry = &mut self.sends[halo];
        Self::check_staged(entry, buffer)?;
        if entry.count == 0 {
            return Ok(());
        }
        let window = entry.window(buffer);
        region::gather(&entry.regions, buf, &mut entry.staging[window]);
        Ok(())
    }

    /// Patch staging payload window `buffer` element-wise:
    /// `staging[slots[i]] = buf[sources[i]]`.
    pub fn pack_overwrite(
        &mut self,
        halo: usize,
        buffer: usize,
        buf: &[T],
        slots: &[usize],
        sources: &[usize],
    ) -> Result<()> {
        self.check_send_id(halo)?;
        check_parallel(slots, sources)?;
        let entry = &mut self.sends[halo];
        Self::check_staged(entry, buffer)?;
        if entry.count == 0 {
            return Ok(());
        }
        let window = entry.window(buffer);
        region::gather_overwrite(slots, sources, buf, &mut entry.staging[window]);
        Ok(())
    }

    /// Scatter staging payload window `buffer` into the halo-covered
    /// elements of `buf`.
    pub fn unpack(&self, halo: usize, buffer: usize, buf: &mut [T]) -> Result<()> {
        self.check_recv_id(halo)?;
        let entry = &self.recvs[halo];
        Self::check_staged(entry, buffer)?;
        if entry.count == 0 {
            return Ok(());
        }
        let window = entry.window(buffer);
        region::scatter(&entry.regions, &entry.staging[window], buf);
        Ok(())
    }

    /// Element-wise mirror of [`pack_overwrite`](Self::pack_overwrite):
    /// `buf[targets[i]] = staging[slots[i]]`.
    pub fn unpack_overwrite(
        &self,
        halo: usize,
        buffer: usize,
        buf: &mut [T],
        slots: &[usize],
        targets: &[usize],
    ) -> Result<()> {
        self.check_recv_id(halo)?;
        check_parallel(slots, targets)?;
        let entry = &self.recvs[halo];
        Self::check_staged(entry, buffer)?;
        if entry.count == 0 {
            return Ok(());
        }
        let window = entry.window(buffer);
        region::scatter_overwrite(slots, targets, &entry.staging[window], buf);
        Ok(())
    }

    // ---- transport ----------------------------------------------------

    /// Send staging (or, for derived-datatype halos, the user buffer in
    /// the options) to the halo's peer. Non-blocking by default.
    ///
    /// Returns `Ok(true)` when a transport operation was issued and
    /// `Ok(false)` for the null-handle cases: empty descriptors and
    /// same-rank loopback.
    pub fn send(&mut self, halo: usize, tag: Tag) -> Result<bool> {
        self.send_opts(halo, tag, SendOptions::default())
    }

    pub fn send_opts(&mut self, halo: usize, tag: Tag, opts: SendOptions<'_, T>) -> Result<bool> {
        validate_tag(tag)?;
        self.check_send_id(halo)?;
        let SendOptions {
            peer,
            user_buf,
            blocking,
        } = opts;
        let rank = self.transport.rank();
        let entry = &mut self.sends[halo];

        if entry.regions.is_empty() {
            return Ok(false);
        }

        if entry.hints.contains(Hints::DERIVED_DATATYPE) {
            let buf = user_buf.ok_or_else(|| {
                HaloError::Config("derived-datatype send requires a user buffer".into())
            })?;
            if region::max_extent(&entry.regions) > buf.len() {
                return Err(HaloError::Config(
                    "user buffer is smaller than the halo extent".into(),
                ));
            }
            let resolved = resolve_peer(peer, entry.peer, halo)?;
            if let Some(request) = entry.oneshot.as_mut() {
                request.wait()?;
            }
            let datatype = entry
                .datatype
                .as_ref()
                .expect("derived-datatype halo carries a datatype");
            entry.oneshot = self
                .transport
                .send_typed(datatype, buf, resolved, tag, blocking)?;
            return Ok(true);
        }

        match &mut entry.binding {
            Binding::Bound(request) => {
                request.wait()?;
                request.start()?;
                if blocking {
                    request.wait()?;
                }
                return Ok(true);
            }
            Binding::Loopback => {
                self.loopback.insert((rank, tag), halo);
                return Ok(false);
            }
            Binding::Unbound => {}
        }

        let resolved = resolve_peer(peer, entry.peer, halo)?;
        if resolved == rank {
            self.loopback.insert((rank, tag), halo);
            self.sends[halo].binding = Binding::Loopback;
            tracing::debug!(halo, tag, "registered same-rank send");
            return Ok(false);
        }

        let entry = &mut self.sends[halo];
        if entry.hints.contains(Hints::STAYS_ON_DEVICE) {
            return Err(HaloError::Config(
                "stays-on-device halo bound to a remote peer".into(),
            ));
        }
        let count = entry.num_buffers * entry.count;
        let mut request = unsafe {
            self.transport
                .bind_send(entry.staging.as_ptr(), count, resolved, tag)?
        };
        tracing::debug!(halo, peer = resolved, tag, elements = count, "bound persistent send");
        request.start()?;
        if blocking {
            request.wait()?;
        }
        entry.binding = Binding::Bound(request);
        Ok(true)
    }

    /// Receive into staging (or, for derived-datatype halos, into the user
    /// buffer in the options). Blocking by default.
    ///
    /// Same-rank receives copy the matching send halo's staging in
    /// process; a receive with no matching same-rank send is fatal.
    pub fn recv(&mut self, halo: usize, tag: Tag) -> Result<bool> {
        self.recv_opts(halo, tag, RecvOptions::default())
    }

    pub fn recv_opts(&mut self, halo: usize, tag: Tag, opts: RecvOptions<'_, T>) -> Result<bool> {
        validate_tag(tag)?;
        self.check_recv_id(halo)?;
        let RecvOptions {
            peer,
            user_buf,
            blocking,
        } = opts;
        let rank = self.transport.rank();
        let entry = &mut self.recvs[halo];

        if entry.regions.is_empty() {
            return Ok(false);
        }

        if entry.hints.contains(Hints::DERIVED_DATATYPE) {
            let buf = user_buf.ok_or_else(|| {
                HaloError::Config("derived-datatype receive requires a user buffer".into())
            })?;
            if region::max_extent(&entry.regions) > buf.len() {
                return Err(HaloError::Config(
                    "user buffer is smaller than the halo extent".into(),
                ));
            }
            let resolved = resolve_peer(peer, entry.peer, halo)?;
            if let Some(request) = entry.oneshot.as_mut() {
                request.wait()?;
            }
            let datatype = entry
                .datatype
                .as_ref()
                .expect("derived-datatype halo carries a datatype");
            entry.oneshot = self
                .transport
                .recv_typed(datatype, buf, resolved, tag, blocking)?;
            return Ok(true);
        }

        if entry.hints.contains(Hints::STAYS_ON_DEVICE) {
            return Err(HaloError::Config(
                "device-resident halo: receive with recv_gpu or recv_cuda".into(),
            ));
        }

        match &mut entry.binding {
            Binding::Bound(request) => {
                request.wait()?;
                request.start()?;
                if blocking {
                    request.wait()?;
                }
                return Ok(true);
            }
            Binding::Loopback => {
                self.loopback_copy_host(halo, tag);
                return Ok(false);
            }
            Binding::Unbound => {}
        }

        let resolved = resolve_peer(peer, entry.peer, halo)?;
        if resolved == rank {
            self.loopback_copy_host(halo, tag);
            self.recvs[halo].binding = Binding::Loopback;
            return Ok(false);
        }

        let entry = &mut self.recvs[halo];
        let count = entry.num_buffers * entry.count;
        let mut request = unsafe {
            self.transport
                .bind_recv(entry.staging.as_mut_ptr(), count, resolved, tag)?
        };
        tracing::debug!(halo, peer = resolved, tag, elements = count, "bound persistent recv");
        request.start()?;
        if blocking {
            request.wait()?;
        }
        entry.binding = Binding::Bound(request);
        Ok(true)
    }

    /// Copy the matching same-rank send halo's staging into this halo's
    /// staging. Fatal if no sender registered the tag or the descriptors
    /// disagree on size.
    fn loopback_copy_host(&mut self, halo: usize, tag: Tag) {
        let rank = self.transport.rank();
        let sender = self.lookup_loopback(halo, tag);
        let entry = &mut self.recvs[halo];
        let needed = entry.num_buffers * entry.count;
        let sender_staging = &self.sends[sender].staging;
        if sender_staging.len() < needed {
            tracing::error!(
                halo,
                sender,
                rank,
                "halo descriptor element mismatch between peers"
            );
            panic!("halo descriptor element mismatch between send halo {sender} and recv halo {halo}");
        }
        entry.staging[..needed].copy_from_slice(&sender_staging[..needed]);
    }

    fn lookup_loopback(&self, halo: usize, tag: Tag) -> usize {
        let rank = self.transport.rank();
        match self.loopback.get(&(rank, tag)) {
            Some(&sender) => sender,
            None => {
                tracing::error!(halo, tag, "receive with no matching same-rank send");
                panic!("receive with no matching same-rank send for tag {tag}");
            }
        }
    }

    /// Drain the halo's outstanding send, if any.
    pub fn wait_send(&mut self, halo: usize) -> Result<()> {
        self.check_send_id(halo)?;
        let entry = &mut self.sends[halo];
        if let Some(request) = entry.oneshot.as_mut() {
            request.wait()?;
            entry.oneshot = None;
        }
        if let Binding::Bound(request) = &mut entry.binding {
            request.wait()?;
        }
        Ok(())
    }

    /// Drain the halo's outstanding receive, if any.
    pub fn wait_recv(&mut self, halo: usize) -> Result<()> {
        self.check_recv_id(halo)?;
        let entry = &mut self.recvs[halo];
        if let Some(request) = entry.oneshot.as_mut() {
            request.wait()?;
            entry.oneshot = None;
        }
        if let Binding::Bound(request) = &mut entry.binding {
            request.wait()?;
        }
        Ok(())
    }

    // ---- combined verbs -----------------------------------------------

    /// `pack(halo, 0, buf)` followed by `send`. Derived-datatype halos
    /// skip the pack and send straight from `buf`.
    pub fn pack_and_send(
        &mut self,
        halo: usize,
        buf: &[T],
        tag: Tag,
        peer: Option<Rank>,
    ) -> Result<bool> {
        self.check_send_id(halo)?;
        if self.sends[halo].hints.contains(Hints::DERIVED_DATATYPE) {
            return self.send_opts(
                halo,
                tag,
                SendOptions {
                    peer,
                    user_buf: Some(buf),
                    blocking: false,
                },
            );
        }
        self.pack(halo, 0, buf)?;
        self.send_opts(
            halo,
            tag,
            SendOptions {
                peer,
                ..Default::default()
            },
        )
    }

    /// Blocking `recv` followed by `unpack(halo, 0, buf)`. Derived-datatype
    /// halos receive straight into `buf`.
    pub fn recv_and_unpack(
        &mut self,
        halo: usize,
        buf: &mut [T],
        tag: Tag,
        peer: Option<Rank>,
    ) -> Result<()> {
        self.check_recv_id(halo)?;
        if self.recvs[halo].hints.contains(Hints::DERIVED_DATATYPE) {
            self.recv_opts(
                halo,
                tag,
                RecvOptions {
                    peer,
                    user_buf: Some(buf),
                    blocking: true,
                },
            )?;
            return Ok(());
        }
        self.recv_opts(
            halo,
            tag,
            RecvOptions {
                peer,
                ..Default::default()
            },
        )?;
        self.unpack(halo, 0, buf)
    }

    // ---- helpers ------------------------------------------------------

    fn check_send_id(&self, halo: usize) -> Result<()> {
        if halo >= self.sends.len() {
            return Err(HaloError::Config(format!("invalid send halo id {halo}")));
        }
        Ok(())
    }

    fn check_recv_id(&self, halo: usize) -> Result<()> {
        if halo >= self.recvs.len() {
            return Err(HaloError::Config(format!("invalid recv halo id {halo}")));
        }
        Ok(())
    }

    fn check_staged(entry: &HaloEntry<T, C>, buffer: usize) -> Result<()> {
        if entry.hints.contains(Hints::DERIVED_DATATYPE) {
            return Err(HaloError::Config(
                "derived-datatype halos are not staged; pass the user buffer to send/recv".into(),
            ));
        }
        if buffer >= entry.num_buffers {
            return Err(HaloError::Config(format!(
                "buffer id {buffer} out of range for {} payloads",
                entry.num_buffers
            )));
        }
        Ok(())
    }
}

// ---- portable device verbs ---------------------------------------------

impl<T: Scalar, C: Transport<T>> HaloExchanger<T, C> {
    /// Gather the halo-covered elements of the device buffer `buf` into
    /// staging (host staging, or device-resident staging when hinted).
    pub fn pack_gpu(&mut self, halo: usize, buffer: usize, buf: &wgpu::Buffer) -> Result<()>
    where
        T: GpuScalar,
    {
        self.check_send_id(halo)?;
        let link = require_wgpu(&self.gpu)?;
        let entry = &mut self.sends[halo];
        Self::check_staged(entry, buffer)?;
        if entry.count == 0 {
            return Ok(());
        }
        let window = entry.window(buffer);
        if entry.hints.contains(Hints::STAYS_ON_DEVICE) {
            ensure_wgpu_staging(&mut entry.device, link, entry.num_buffers * entry.count)?;
            let Some(DeviceStaging::Wgpu(staging, _)) = &entry.device else {
                unreachable!()
            };
            link.pack_resident(&entry.regions, buf, staging, window.start)
        } else {
            link.pack(&entry.regions, buf, &mut entry.staging[window])
        }
    }

    /// Scatter staging back into the halo-covered elements of the device
    /// buffer `buf`.
    pub fn unpack_gpu(&self, halo: usize, buffer: usize, buf: &wgpu::Buffer) -> Result<()>
    where
        T: GpuScalar,
    {
        self.check_recv_id(halo)?;
        let link = require_wgpu(&self.gpu)?;
        let entry = &self.recvs[halo];
        Self::check_staged(entry, buffer)?;
        if entry.count == 0 {
            return Ok(());
        }
        let window = entry.window(buffer);
        if entry.hints.contains(Hints::STAYS_ON_DEVICE) {
            match &entry.device {
                Some(DeviceStaging::Wgpu(staging, _)) => {
                    link.unpack_resident(&entry.regions, staging, window.start, buf)
                }
                _ => Err(HaloError::Config(
                    "no device-resident staging on this backend; receive first".into(),
                )),
            }
        } else {
            link.unpack(&entry.regions, &entry.staging[window], buf)
        }
    }

    /// Overwrite-pack from a device buffer: gathers `buf[sources[i]]` with
    /// a compute kernel and patches the staging slots.
    pub fn pack_gpu_overwrite(
        &mut self,
        halo: usize,
        buffer: usize,
        buf: &wgpu::Buffer,
        slots: &[usize],
        sources: &[usize],
    ) -> Result<()>
    where
        T: GpuScalar,
    {
        self.check_send_id(halo)?;
        check_parallel(slots, sources)?;
        let link = require_wgpu(&self.gpu)?;
        let entry = &mut self.sends[halo];
        Self::check_staged(entry, buffer)?;
        if entry.count == 0 {
            return Ok(());
        }
        let values = link.gather_indices(buf, sources)?;
        let window = entry.window(buffer);
        let staging = &mut entry.staging[window];
        for (&slot, value) in slots.iter().zip(&values) {
            staging[slot] = *value;
        }
        Ok(())
    }

    /// Overwrite-unpack into a device buffer: scatters the staging slots
    /// to `buf[targets[i]]` with a compute kernel.
    pub fn unpack_gpu_overwrite(
        &self,
        halo: usize,
        buffer: usize,
        buf: &wgpu::Buffer,
        slots: &[usize],
        targets: &[usize],
    ) -> Result<()>
    where
        T: GpuScalar,
    {
        self.check_recv_id(halo)?;
        check_parallel(slots, targets)?;
        let link = require_wgpu(&self.gpu)?;
        let entry = &self.recvs[halo];
        Self::check_staged(entry, buffer)?;
        if entry.count == 0 {
            return Ok(());
        }
        let window = entry.window(buffer);
        let staging = &entry.staging[window];
        let values: Vec<T> = slots.iter().map(|&slot| staging[slot]).collect();
        link.scatter_indices(buf, targets, &values)
    }

    /// Receive for halos packed through the portable backend. Same-rank
    /// device-resident halos copy staging device-to-device; everything
    /// else behaves like [`recv`](Self::recv).
    pub fn recv_gpu(&mut self, halo: usize, tag: Tag, peer: Option<Rank>) -> Result<bool>
    where
        T: GpuScalar,
    {
        validate_tag(tag)?;
        self.check_recv_id(halo)?;
        let rank = self.transport.rank();
        let entry = &self.recvs[halo];
        if entry.regions.is_empty() {
            return Ok(false);
        }
        if entry.hints.contains(Hints::STAYS_ON_DEVICE) {
            let same_rank = match entry.binding {
                Binding::Loopback => true,
                Binding::Unbound => resolve_peer(peer, entry.peer, halo)? == rank,
                Binding::Bound(_) => false,
            };
            if !same_rank {
                return Err(HaloError::Config(
                    "stays-on-device halo bound to a remote peer".into(),
                ));
            }
            self.loopback_copy_gpu(halo, tag)?;
            return Ok(false);
        }
        self.recv_opts(
            halo,
            tag,
            RecvOptions {
                peer,
                ..Default::default()
            },
        )
    }

    fn loopback_copy_gpu(&mut self, halo: usize, tag: Tag) -> Result<()>
    where
        T: GpuScalar,
    {
        let sender = self.lookup_loopback(halo, tag);
        let link = require_wgpu(&self.gpu)?;
        let src = match &self.sends[sender].device {
            Some(DeviceStaging::Wgpu(src, _)) => src,
            _ => {
                return Err(HaloError::Config(
                    "same-rank device-resident exchange requires the send halo staged on the same backend"
                        .into(),
                ))
            }
        };
        let entry = &mut self.recvs[halo];
        let needed = entry.num_buffers * entry.count;
        if (src.size() as usize) < needed * std::mem::size_of::<T>() {
            tracing::error!(halo, sender, "halo descriptor element mismatch between peers");
            panic!("halo descriptor element mismatch between send halo {sender} and recv halo {halo}");
        }
        ensure_wgpu_staging(&mut entry.device, link, needed)?;
        let Some(DeviceStaging::Wgpu(dst, _)) = &entry.device else {
            unreachable!()
        };
        link.copy_device(src, dst, needed)?;
        entry.binding = Binding::Loopback;
        Ok(())
    }
}

fn require_wgpu<T>(link: &Option<WgpuLink<T>>) -> Result<&WgpuLink<T>> {
    link.as_ref().ok_or_else(|| {
        HaloError::Config("no wgpu link attached; construct the exchanger with_wgpu".into())
    })
}

/// Allocate wgpu device-resident staging on first use; reject a slab that
/// already lives on the other backend.
fn ensure_wgpu_staging<T: GpuScalar>(
    device: &mut Option<DeviceStaging<T>>,
    link: &WgpuLink<T>,
    len: usize,
) -> Result<()> {
    match device {
        Some(DeviceStaging::Wgpu(..)) => Ok(()),
        None => {
            *device = Some(DeviceStaging::Wgpu(
                link.alloc_device_staging(len),
                PhantomData,
            ));
            tracing::debug!(elements = len, "allocated device-resident staging");
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Some(DeviceStaging::Cuda(_)) => Err(HaloError::Config(
            "halo staging is device-resident on the CUDA backend".into(),
        )),
    }
}

// ---- vendor device verbs ------------------------------------------------

#[cfg(feature = "cuda")]
impl<T, C> HaloExchanger<T, C>
where
    T: Scalar + DeviceRepr + ValidAsZeroBits,
    C: Transport<T>,
{
    /// Gather the halo-covered elements of the CUDA buffer `buf` into
    /// staging (host staging, or device-resident staging when hinted).
    pub fn pack_cuda(&mut self, halo: usize, buffer: usize, buf: &CudaSlice<T>) -> Result<()> {
        self.check_send_id(halo)?;
        let link = require_cuda(&self.cuda)?;
        let entry = &mut self.sends[halo];
        Self::check_staged(entry, buffer)?;
        if entry.count == 0 {
            return Ok(());
        }
        let window = entry.window(buffer);
        if entry.hints.contains(Hints::STAYS_ON_DEVICE) {
            ensure_cuda_staging(&mut entry.device, link, entry.num_buffers * entry.count)?;
            let Some(DeviceStaging::Cuda(staging)) = &mut entry.device else {
                unreachable!()
            };
            link.pack_resident(&entry.regions, buf, staging, window.start)
        } else {
            link.pack(&entry.regions, buf, &mut entry.staging[window])
        }
    }

    /// Scatter staging back into the halo-covered elements of the CUDA
    /// buffer `buf`.
    pub fn unpack_cuda(&self, halo: usize, buffer: usize, buf: &mut CudaSlice<T>) -> Result<()> {
        self.check_recv_id(halo)?;
        let link = require_cuda(&self.cuda)?;
        let entry = &self.recvs[halo];
        Self::check_staged(entry, buffer)?;
        if entry.count == 0 {
            return Ok(());
        }
        let window = entry.window(buffer);
        if entry.hints.contains(Hints::STAYS_ON_DEVICE) {
            match &entry.device {
                Some(DeviceStaging::Cuda(staging)) => {
                    link.unpack_resident(&entry.regions, staging, window.start, buf)
                }
                _ => Err(HaloError::Config(
                    "no device-resident staging on this backend; receive first".into(),
                )),
            }
        } else {
            link.unpack(&entry.regions, &entry.staging[window], buf)
        }
    }

    /// Overwrite-pack from a CUDA buffer.
    pub fn pack_cuda_overwrite(
        &mut self,
        halo: usize,
        buffer: usize,
        buf: &CudaSlice<T>,
        slots: &[usize],
        sources: &[usize],
    ) -> Result<()> {
        self.check_send_id(halo)?;
        check_parallel(slots, sources)?;
        let link = require_cuda(&self.cuda)?;
        let entry = &mut self.sends[halo];
        Self::check_staged(entry, buffer)?;
        if entry.count == 0 {
            return Ok(());
        }
        let values = link.gather_indices(buf, sources)?;
        let window = entry.window(buffer);
        let staging = &mut entry.staging[window];
        for (&slot, value) in slots.iter().zip(&values) {
            staging[slot] = *value;
        }
        Ok(())
    }

    /// Overwrite-unpack into a CUDA buffer.
    pub fn unpack_cuda_overwrite(
        &self,
        halo: usize,
        buffer: usize,
        buf: &mut CudaSlice<T>,
        slots: &[usize],
        targets: &[usize],
    ) -> Result<()> {
        self.check_recv_id(halo)?;
        check_parallel(slots, targets)?;
        let link = require_cuda(&self.cuda)?;
        let entry = &self.recvs[halo];
        Self::check_staged(entry, buffer)?;
        if entry.count == 0 {
            return Ok(());
        }
        let window = entry.window(buffer);
        let staging = &entry.staging[window];
        let values: Vec<T> = slots.iter().map(|&slot| staging[slot]).collect();
        link.scatter_indices(buf, targets, &values)
    }

    /// Receive for halos packed through the CUDA backend. Same-rank
    /// device-resident halos copy staging device-to-device; everything
    /// else behaves like [`recv`](Self::recv).
    pub fn recv_cuda(&mut self, halo: usize, tag: Tag, peer: Option<Rank>) -> Result<bool> {
        validate_tag(tag)?;
        self.check_recv_id(halo)?;
        let rank = self.transport.rank();
        let entry = &self.recvs[halo];
        if entry.regions.is_empty() {
            return Ok(false);
        }
        if entry.hints.contains(Hints::STAYS_ON_DEVICE) {
            let same_rank = match entry.binding {
                Binding::Loopback => true,
                Binding::Unbound => resolve_peer(peer, entry.peer, halo)? == rank,
                Binding::Bound(_) => false,
            };
            if !same_rank {
                return Err(HaloError::Config(
                    "stays-on-device halo bound to a remote peer".into(),
                ));
            }
            self.loopback_copy_cuda(halo, tag)?;
            return Ok(false);
        }
        self.recv_opts(
            halo,
            tag,
            RecvOptions {
                peer,
                ..Default::default()
            },
        )
    }

    fn loopback_copy_cuda(&mut self, halo: usize, tag: Tag) -> Result<()> {
        let sender = self.lookup_loopback(halo, tag);
        let link = require_cuda(&self.cuda)?;
        let src = match &self.sends[sender].device {
            Some(DeviceStaging::Cuda(src)) => src,
            _ => {
                return Err(HaloError::Config(
                    "same-rank device-resident exchange requires the send halo staged on the same backend"
                        .into(),
                ))
            }
        };
        let entry = &mut self.recvs[halo];
        let needed = entry.num_buffers * entry.count;
        if src.len() < needed {
            tracing::error!(halo, sender, "halo descriptor element mismatch between peers");
            panic!("halo descriptor element mismatch between send halo {sender} and recv halo {halo}");
        }
        ensure_cuda_staging(&mut entry.device, link, needed)?;
        let Some(DeviceStaging::Cuda(dst)) = &mut entry.device else {
            unreachable!()
        };
        link.copy_device(src, dst, needed)?;
        entry.binding = Binding::Loopback;
        Ok(())
    }
}

#[cfg(feature = "cuda")]
fn require_cuda<T>(link: &Option<CudaLink<T>>) -> Result<&CudaLink<T>> {
    link.as_ref().ok_or_else(|| {
        HaloError::Config("no CUDA link attached; construct the exchanger with_cuda".into())
    })
}

#[cfg(feature = "cuda")]
fn ensure_cuda_staging<T: Scalar + DeviceRepr + ValidAsZeroBits>(
    device: &mut Option<DeviceStaging<T>>,
    link: &CudaLink<T>,
    len: usize,
) -> Result<()> {
    match device {
        Some(DeviceStaging::Cuda(_)) => Ok(()),
        None => {
            *device = Some(DeviceStaging::Cuda(link.alloc_device_staging(len)?));
            tracing::debug!(elements = len, "allocated device-resident staging");
            Ok(())
        }
        Some(DeviceStaging::Wgpu(..)) => Err(HaloError::Config(
            "halo staging is device-resident on the portable backend".into(),
        )),
    }
}

// ---- free helpers -------------------------------------------------------

fn validate_tag(tag: Tag) -> Result<()> {
    if tag < 0 {
        return Err(HaloError::Config(format!(
            "message tag {tag} must be nonnegative"
        )));
    }
    Ok(())
}

fn resolve_peer(override_peer: Option<Rank>, default_peer: Option<Rank>, halo: usize) -> Result<Rank> {
    override_peer.or(default_peer).ok_or_else(|| {
        HaloError::Config(format!(
            "halo {halo} has no default peer; pass one explicitly"
        ))
    })
}

fn check_parallel(slots: &[usize], indices: &[usize]) -> Result<()> {
    if slots.len() != indices.len() {
        return Err(HaloError::Config(format!(
            "overwrite vectors differ in length: {} slots vs {} indices",
            slots.len(),
            indices.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchanger() -> HaloExchanger<f64> {
        HaloExchanger::single_process()
    }

    #[test]
    fn ids_are_dense_and_monotonic() {
        let mut x = exchanger();
        assert_eq!(x.add_send_halo(&[0], 1, Some(0), Hints::NONE).unwrap(), 0);
        assert_eq!(x.add_send_halo(&[1], 1, Some(0), Hints::NONE).unwrap(), 1);
        assert_eq!(x.add_recv_halo(&[2], 1, Some(0), Hints::NONE).unwrap(), 0);
        assert_eq!(x.send_halo_count(), 2);
        assert_eq!(x.recv_halo_count(), 1);
    }

    #[test]
    fn invalid_ids_are_configuration_errors() {
        let mut x = exchanger();
        assert!(matches!(x.pack(0, 0, &[]), Err(HaloError::Config(_))));
        assert!(matches!(x.send(3, 0), Err(HaloError::Config(_))));
        assert!(matches!(x.wait_recv(1), Err(HaloError::Config(_))));
    }

    #[test]
    fn zero_num_buffers_is_rejected() {
        let mut x = exchanger();
        assert!(x.add_send_halo(&[0], 0, Some(0), Hints::NONE).is_err());
    }

    #[test]
    fn derived_halos_reject_multiplexing_and_staged_access() {
        let mut x = exchanger();
        assert!(x
            .add_send_halo(&[0, 1], 2, Some(0), Hints::DERIVED_DATATYPE)
            .is_err());
        let id = x
            .add_send_halo(&[0, 1], 1, Some(0), Hints::DERIVED_DATATYPE)
            .unwrap();
        let buf = [1.0, 2.0];
        assert!(matches!(x.pack(id, 0, &buf), Err(HaloError::Config(_))));
        // Sending without a user buffer is a configuration error too.
        assert!(matches!(x.send(id, 0), Err(HaloError::Config(_))));
    }

    #[test]
    fn negative_tags_are_rejected() {
        let mut x = exchanger();
        let id = x.add_send_halo(&[0], 1, Some(0), Hints::NONE).unwrap();
        assert!(matches!(x.send(id, -1), Err(HaloError::Config(_))));
    }

    #[test]
    fn buffer_id_out_of_range_is_rejected() {
        let mut x = exchanger();
        let id = x.add_send_halo(&[0, 1], 2, Some(0), Hints::NONE).unwrap();
        let buf = [1.0, 2.0];
        assert!(x.pack(id, 1, &buf).is_ok());
        assert!(matches!(x.pack(id, 2, &buf), Err(HaloError::Config(_))));
    }

    #[test]
    fn missing_peer_is_rejected() {
        let mut x = exchanger();
        let id = x.add_send_halo(&[0], 1, None, Hints::NONE).unwrap();
        assert!(matches!(x.send(id, 0), Err(HaloError::Config(_))));
        // An explicit peer on the call fixes it.
        let buf = [5.0];
        x.pack(id, 0, &buf).unwrap();
        assert!(!x
            .send_opts(
                id,
                0,
                SendOptions {
                    peer: Some(0),
                    ..Default::default()
                }
            )
            .unwrap());
    }
}
