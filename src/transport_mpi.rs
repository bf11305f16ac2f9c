//! MPI transport backend for cross-rank halo exchange.
//!
//! Requires the `distributed` feature flag and an MPI installation. The
//! safe rsmpi surface stops short of persistent point-to-point operations,
//! so the restartable handles wrap `MPI_Send_init` / `MPI_Recv_init` /
//! `MPI_Start` / `MPI_Wait` through `mpi::ffi` directly; all unsafe lives
//! in this module. Derived datatypes are built with
//! [`UserDatatype::indexed`] over the per-row expansion of the region list.
//!
//! The caller must initialize MPI before constructing [`MpiTransport`]:
//!
//! ```ignore
//! let _universe = mpi::initialize().expect("MPI init failed");
//! let transport = MpiTransport::world();
//! ```

use std::os::raw::{c_int, c_void};

use mpi::datatype::UserDatatype;
use mpi::ffi;
use mpi::raw::AsRaw;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::Count;

use crate::error::{HaloError, Result};
use crate::region::Region;
use crate::scalar::Scalar;
use crate::transport::{Rank, Tag, Transport, TransportRequest};

fn check(ret: c_int, what: &str) -> Result<()> {
    if ret == ffi::MPI_SUCCESS as c_int {
        Ok(())
    } else {
        Err(HaloError::Transport(format!(
            "{what} failed with MPI error code {ret}"
        )))
    }
}

fn as_count(value: usize, what: &str) -> Result<Count> {
    Count::try_from(value)
        .map_err(|_| HaloError::Config(format!("{what} {value} exceeds the MPI count range")))
}

/// An MPI request handle: persistent (restartable) or one-shot.
///
/// `wait` drains an active transmission and is a no-op otherwise. Dropping
/// an active handle waits first; persistent handles are freed on drop.
pub struct MpiRequest {
    raw: ffi::MPI_Request,
    active: bool,
    persistent: bool,
}

// MPI_Request is an opaque handle; the MPI library owns the referent.
unsafe impl Send for MpiRequest {}

impl TransportRequest for MpiRequest {
    fn start(&mut self) -> Result<()> {
        if self.active {
            return Err(HaloError::Transport(
                "request is already active; wait on it first".into(),
            ));
        }
        check(unsafe { ffi::MPI_Start(&mut self.raw) }, "MPI_Start")?;
        self.active = true;
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let ret = unsafe { ffi::MPI_Wait(&mut self.raw, ffi::RSMPI_STATUS_IGNORE) };
        self.active = false;
        check(ret, "MPI_Wait")
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for MpiRequest {
    fn drop(&mut self) {
        unsafe {
            if self.active {
                ffi::MPI_Wait(&mut self.raw, ffi::RSMPI_STATUS_IGNORE);
            }
            if self.persistent && self.raw != ffi::RSMPI_REQUEST_NULL {
                ffi::MPI_Request_free(&mut self.raw);
            }
        }
    }
}

/// MPI-based transport over an rsmpi communicator.
pub struct MpiTransport {
    comm: SimpleCommunicator,
}

impl MpiTransport {
    /// Transport over the world communicator, shared with user traffic.
    pub fn world() -> Self {
        Self {
            comm: SimpleCommunicator::world(),
        }
    }

    /// Duplicate `comm` so halo traffic cannot collide with user messages
    /// on the same communicator.
    pub fn duplicated<C: Communicator>(comm: &C) -> Self {
        Self {
            comm: comm.duplicate(),
        }
    }

    /// Adopt an owned communicator as-is.
    pub fn from_communicator(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }

    /// The underlying communicator.
    pub fn communicator(&self) -> &SimpleCommunicator {
        &self.comm
    }
}

impl<T: Scalar + Equivalence> Transport<T> for MpiTransport {
    type Request = MpiRequest;
    type Datatype = UserDatatype;

    fn rank(&self) -> Rank {
        self.comm.rank()
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    unsafe fn bind_send(
        &mut self,
        buf: *const T,
        count: usize,
        peer: Rank,
        tag: Tag,
    ) -> Result<MpiRequest> {
        let count = as_count(count, "send halo element count")?;
        let mut raw = ffi::RSMPI_REQUEST_NULL;
        let ret = ffi::MPI_Send_init(
            buf as *const c_void,
            count,
            T::equivalent_datatype().as_raw(),
            peer,
            tag,
            self.comm.as_raw(),
            &mut raw,
        );
        check(ret, "MPI_Send_init")?;
        Ok(MpiRequest {
            raw,
            active: false,
            persistent: true,
        })
    }

    unsafe fn bind_recv(
        &mut self,
        buf: *mut T,
        count: usize,
        peer: Rank,
        tag: Tag,
    ) -> Result<MpiRequest> {
        let count = as_count(count, "recv halo element count")?;
        let mut raw = ffi::RSMPI_REQUEST_NULL;
        let ret = ffi::MPI_Recv_init(
            buf as *mut c_void,
            count,
            T::equivalent_datatype().as_raw(),
            peer,
            tag,
            self.comm.as_raw(),
            &mut raw,
        );
        check(ret, "MPI_Recv_init")?;
        Ok(MpiRequest {
            raw,
            active: false,
            persistent: true,
        })
    }

    fn build_datatype(&self, regions: &[Region]) -> Result<UserDatatype> {
        let mut blocklengths = Vec::new();
        let mut displacements = Vec::new();
        for region in regions {
            let cols = as_count(region.cols, "region width")?;
            for r in 0..region.rows {
                blocklengths.push(cols);
                displacements.push(as_count(region.row_start(r), "region displacement")?);
            }
        }
        Ok(UserDatatype::indexed(
            &blocklengths,
            &displacements,
            &T::equivalent_datatype(),
        ))
    }

    fn send_typed(
        &mut self,
        datatype: &UserDatatype,
        buf: &[T],
        peer: Rank,
        tag: Tag,
        blocking: bool,
    ) -> Result<Option<MpiRequest>> {
        let mut raw = unsafe { ffi::RSMPI_REQUEST_NULL };
        let ret = unsafe {
            ffi::MPI_Isend(
                buf.as_ptr() as *const c_void,
                1,
                datatype.as_raw(),
                peer,
                tag,
                self.comm.as_raw(),
                &mut raw,
            )
        };
        check(ret, "MPI_Isend")?;
        let mut request = MpiRequest {
            raw,
            active: true,
            persistent: false,
        };
        if blocking {
            request.wait()?;
            Ok(None)
        } else {
            Ok(Some(request))
        }
    }

    fn recv_typed(
        &mut self,
        datatype: &UserDatatype,
        buf: &mut [T],
        peer: Rank,
        tag: Tag,
        blocking: bool,
    ) -> Result<Option<MpiRequest>> {
        let mut raw = unsafe { ffi::RSMPI_REQUEST_NULL };
        let ret = unsafe {
            ffi::MPI_Irecv(
                buf.as_mut_ptr() as *mut c_void,
                1,
                datatype.as_raw(),
                peer,
                tag,
                self.comm.as_raw(),
                &mut raw,
            )
        };
        check(ret, "MPI_Irecv")?;
        let mut request = MpiRequest {
            raw,
            active: true,
            persistent: false,
        };
        if blocking {
            request.wait()?;
            Ok(None)
        } else {
            Ok(Some(request))
        }
    }
}
