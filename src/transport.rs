//! Transport abstraction for point-to-point halo messages.
//!
//! Provides a trait for the message-passing layer (persistent restartable
//! send/recv over staging slabs, plus one-shot strided transfers for the
//! derived-datatype path) and a single-process implementation that needs no
//! MPI installation.
//!
//! Implementations: [`SingleProcess`] (in-process), `MpiTransport` (via the
//! mpi crate, `distributed` feature).

use std::collections::HashMap;

use bytemuck::Zeroable;

use crate::error::{HaloError, Result};
use crate::region::{self, Region};
use crate::scalar::Scalar;

/// Process index within the communicator, MPI-style.
pub type Rank = i32;
/// Message tag. Must be nonnegative.
pub type Tag = i32;

/// A restartable point-to-point operation handle.
///
/// Lifecycle: create bound but idle, `start()` to begin a transmission,
/// `wait()` to complete it, repeat. `wait()` on an idle handle is a no-op,
/// so callers can unconditionally drain the previous transmission before
/// restarting.
pub trait TransportRequest {
    fn start(&mut self) -> Result<()>;
    fn wait(&mut self) -> Result<()>;
    fn is_active(&self) -> bool;
}

/// Abstraction over the message-passing layer for one element type.
pub trait Transport<T: Scalar> {
    /// Persistent (and one-shot) operation handle.
    type Request: TransportRequest;
    /// Transport-side description of a strided halo layout, built once at
    /// registration for derived-datatype halos.
    type Datatype;

    /// This process's rank.
    fn rank(&self) -> Rank;

    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Bind a restartable send of `count` elements at `buf` to
    /// `(peer, tag)`.
    ///
    /// # Safety
    ///
    /// `buf` must point to `count` valid elements and stay valid, at the
    /// same address, until the returned request is dropped.
    unsafe fn bind_send(
        &mut self,
        buf: *const T,
        count: usize,
        peer: Rank,
        tag: Tag,
    ) -> Result<Self::Request>;

    /// Receive-side mirror of [`bind_send`](Transport::bind_send).
    ///
    /// # Safety
    ///
    /// As for `bind_send`; the region must additionally be writable.
    unsafe fn bind_recv(
        &mut self,
        buf: *mut T,
        count: usize,
        peer: Rank,
        tag: Tag,
    ) -> Result<Self::Request>;

    /// Compile a region list into a transport-side layout description.
    fn build_datatype(&self, regions: &[Region]) -> Result<Self::Datatype>;

    /// One-shot send of the strided layout directly from `buf`, no staging.
    /// Returns a handle when the operation is still in flight.
    fn send_typed(
        &mut self,
        datatype: &Self::Datatype,
        buf: &[T],
        peer: Rank,
        tag: Tag,
        blocking: bool,
    ) -> Result<Option<Self::Request>>;

    /// One-shot receive of the strided layout directly into `buf`.
    fn recv_typed(
        &mut self,
        datatype: &Self::Datatype,
        buf: &mut [T],
        peer: Rank,
        tag: Tag,
        blocking: bool,
    ) -> Result<Option<Self::Request>>;
}

/// Request handle for operations that complete synchronously.
pub struct NoRequest;

impl TransportRequest for NoRequest {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_active(&self) -> bool {
        false
    }
}

/// In-process transport for single-rank runs.
///
/// Rank 0 of 1. Every exchange is same-rank, which the coordinator
/// short-circuits before reaching the transport, so the persistent verbs
/// are unreachable in correct programs and report a transport error. The
/// derived-datatype path works: `send_typed` gathers the strided payload
/// into a tag-keyed mailbox and `recv_typed` scatters it back out.
pub struct SingleProcess<T> {
    mailbox: HashMap<Tag, Vec<T>>,
}

impl<T> SingleProcess<T> {
    pub fn new() -> Self {
        Self {
            mailbox: HashMap::new(),
        }
    }
}

impl<T> Default for SingleProcess<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Scalar> Transport<T> for SingleProcess<T> {
    type Request = NoRequest;
    type Datatype = Vec<Region>;

    fn rank(&self) -> Rank {
        0
    }

    fn size(&self) -> usize {
        1
    }

    unsafe fn bind_send(
        &mut self,
        _buf: *const T,
        _count: usize,
        peer: Rank,
        _tag: Tag,
    ) -> Result<NoRequest> {
        Err(HaloError::Transport(format!(
            "single-process transport cannot reach rank {peer}"
        )))
    }

    unsafe fn bind_recv(
        &mut self,
        _buf: *mut T,
        _count: usize,
        peer: Rank,
        _tag: Tag,
    ) -> Result<NoRequest> {
        Err(HaloError::Transport(format!(
            "single-process transport cannot reach rank {peer}"
        )))
    }

    fn build_datatype(&self, regions: &[Region]) -> Result<Vec<Region>> {
        Ok(regions.to_vec())
    }

    fn send_typed(
        &mut self,
        datatype: &Vec<Region>,
        buf: &[T],
        peer: Rank,
        tag: Tag,
        _blocking: bool,
    ) -> Result<Option<NoRequest>> {
        if peer != 0 {
            return Err(HaloError::Transport(format!(
                "single-process transport cannot reach rank {peer}"
            )));
        }
        let mut payload = vec![T::zeroed(); region::element_count(datatype)];
        region::gather(datatype, buf, &mut payload);
        self.mailbox.insert(tag, payload);
        Ok(None)
    }

    fn recv_typed(
        &mut self,
        datatype: &Vec<Region>,
        buf: &mut [T],
        peer: Rank,
        tag: Tag,
        _blocking: bool,
    ) -> Result<Option<NoRequest>> {
        if peer != 0 {
            return Err(HaloError::Transport(format!(
                "single-process transport cannot reach rank {peer}"
            )));
        }
        let payload = match self.mailbox.remove(&tag) {
            Some(payload) => payload,
            None => {
                tracing::error!(tag, "receive with no matching same-rank send");
                panic!("receive with no matching same-rank send for tag {tag}");
            }
        };
        if payload.len() != region::element_count(datatype) {
            tracing::error!(tag, "halo descriptor element mismatch between peers");
            panic!("halo descriptor element mismatch between peers for tag {tag}");
        }
        region::scatter(datatype, &payload, buf);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::compress_indices;

    #[test]
    fn single_process_rank_and_size() {
        let transport = SingleProcess::<f64>::new();
        assert_eq!(Transport::<f64>::rank(&transport), 0);
        assert_eq!(Transport::<f64>::size(&transport), 1);
    }

    #[test]
    fn persistent_verbs_report_unreachable_peers() {
        let mut transport = SingleProcess::<f64>::new();
        let mut slab = [0.0f64; 4];
        let err = unsafe { transport.bind_send(slab.as_ptr(), 4, 1, 0) };
        assert!(err.is_err());
        let err = unsafe { transport.bind_recv(slab.as_mut_ptr(), 4, 1, 0) };
        assert!(err.is_err());
    }

    #[test]
    fn typed_mailbox_round_trips_a_strided_layout() {
        let mut transport = SingleProcess::<f64>::new();
        let send_layout = transport.build_datatype(&compress_indices(&[1, 2])).unwrap();
        let recv_layout = transport.build_datatype(&compress_indices(&[7, 8])).unwrap();

        let src = vec![0.0, 1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mut dst = vec![0.0; 9];
        transport.send_typed(&send_layout, &src, 0, 5, false).unwrap();
        transport.recv_typed(&recv_layout, &mut dst, 0, 5, true).unwrap();
        assert_eq!(dst, vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    #[should_panic(expected = "no matching same-rank send")]
    fn typed_receive_without_send_is_fatal() {
        let mut transport = SingleProcess::<f64>::new();
        let layout = transport.build_datatype(&compress_indices(&[0])).unwrap();
        let mut dst = vec![0.0];
        let _ = transport.recv_typed(&layout, &mut dst, 0, 9, true);
    }
}
