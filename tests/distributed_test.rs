//! Multi-process exchange tests over the MPI transport.
//!
//! These tests require MPI and the `distributed` feature flag. Run with:
//! `mpirun -n 2 cargo test --features distributed --test distributed_test`
//!
//! MPI may only be initialized once per process, so everything lives in a
//! single test function.

#![cfg(feature = "distributed")]

use halocline::{HaloExchanger, Hints, MpiTransport, RecvOptions, SendOptions};
use mpi::traits::*;

#[test]
fn full_exchange_over_mpi() {
    let universe = mpi::initialize().expect("MPI init failed");
    let world = universe.world();
    let size = world.size();

    let mut exchanger =
        HaloExchanger::<f64, MpiTransport>::new(MpiTransport::duplicated(&world));
    let rank = exchanger.transport().communicator().rank();

    // Same-rank loopback works identically under MPI.
    let send = exchanger
        .add_send_halo(&[1, 2], 1, Some(rank), Hints::NONE)
        .unwrap();
    let recv = exchanger
        .add_recv_halo(&[7, 8], 1, Some(rank), Hints::NONE)
        .unwrap();
    let src = [0.0, 1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    let mut dst = [0.0; 9];
    exchanger.pack_and_send(send, &src, 0, None).unwrap();
    exchanger.recv_and_unpack(recv, &mut dst, 0, None).unwrap();
    assert_eq!(&dst[7..9], &[1.0, 2.0]);

    // Derived-datatype self-exchange goes through real MPI requests.
    let dsend = exchanger
        .add_send_halo(&[0, 1, 2], 1, Some(rank), Hints::DERIVED_DATATYPE)
        .unwrap();
    let drecv = exchanger
        .add_recv_halo(&[3, 4, 5], 1, Some(rank), Hints::DERIVED_DATATYPE)
        .unwrap();
    let typed_src = [4.0, 5.0, 6.0, 0.0, 0.0, 0.0];
    let mut typed_dst = [0.0; 6];
    exchanger
        .send_opts(
            dsend,
            1,
            SendOptions {
                user_buf: Some(&typed_src),
                ..Default::default()
            },
        )
        .unwrap();
    exchanger
        .recv_opts(
            drecv,
            1,
            RecvOptions {
                user_buf: Some(&mut typed_dst),
                ..Default::default()
            },
        )
        .unwrap();
    exchanger.wait_send(dsend).unwrap();
    assert_eq!(&typed_dst[3..6], &[4.0, 5.0, 6.0]);

    // Cross-rank persistent exchange between ranks 0 and 1, run twice to
    // exercise the restart path.
    if size >= 2 && rank < 2 {
        let peer = 1 - rank;
        let xsend = exchanger
            .add_send_halo(&[0, 1], 1, Some(peer), Hints::NONE)
            .unwrap();
        let xrecv = exchanger
            .add_recv_halo(&[2, 3], 1, Some(peer), Hints::NONE)
            .unwrap();

        for round in 0..2 {
            let base = (rank as f64 + 1.0) * 10.0 + round as f64;
            let src = [base, base + 1.0, 0.0, 0.0];
            let mut dst = [0.0; 4];
            exchanger.pack(xsend, 0, &src).unwrap();
            assert!(exchanger.send(xsend, 2).unwrap());
            assert!(exchanger.recv(xrecv, 2).unwrap());
            exchanger.unpack(xrecv, 0, &mut dst).unwrap();

            let expected = (peer as f64 + 1.0) * 10.0 + round as f64;
            assert_eq!(&dst[2..4], &[expected, expected + 1.0]);
        }
        exchanger.wait_send(xsend).unwrap();
    }

    world.barrier();
}
