//! End-to-end halo exchange scenarios on the host-simulated runtime.

use std::sync::Arc;

use stencil_halo::comm::{NoComm, ThreadWorld};
use stencil_halo::domain::distributed::DistributedDomain;
use stencil_halo::grid::dim3::Dim3;
use stencil_halo::halo_error::HaloError;
use stencil_halo::runtime::DeviceRuntime;

/// The scalar field used throughout: one digit per axis.
fn field(x: i64, y: i64, z: i64) -> f64 {
    (100 * x + 10 * y + z) as f64
}

/// Interior fill for a subdomain whose interior origin is `origin` in
/// global coordinates, row-major with x fastest.
fn interior_fill(origin: Dim3, extents: Dim3) -> Vec<f64> {
    let mut out = Vec::with_capacity(extents.flatten() as usize);
    for z in 0..extents.z {
        for y in 0..extents.y {
            for x in 0..extents.x {
                out.push(field(origin.x + x, origin.y + y, origin.z + z));
            }
        }
    }
    out
}

#[test]
fn single_domain_wraps_onto_itself() {
    // size (4,4,4), radius 1, one rank, one accelerator: all 26 neighbors
    // are the domain itself through the periodic wrap.
    let rt = Arc::new(DeviceRuntime::new(1));
    let mut dd = DistributedDomain::new(Dim3::splat(4), Arc::new(NoComm), rt).unwrap();
    dd.set_radius(1).unwrap();
    let data = dd.register_data::<f64>().unwrap();
    dd.realize(false).unwrap();

    let dom = &dd.domains()[0];
    dom.write_interior(data.index(), &interior_fill(Dim3::ZERO, Dim3::splat(4)))
        .unwrap();

    dd.exchange().unwrap();

    let dom = &dd.domains()[0];
    let all = dom.read_all::<f64>(data.index()).unwrap();
    let raw = dom.raw_size();
    assert_eq!(raw, Dim3::splat(6));
    for z in 0..raw.z {
        for y in 0..raw.y {
            for x in 0..raw.x {
                let g = (Dim3::new(x, y, z) - Dim3::ONE).wrap(Dim3::splat(4));
                let got = all[Dim3::new(x, y, z).to_linear(raw) as usize];
                assert_eq!(got, field(g.x, g.y, g.z), "at ({x},{y},{z})");
            }
        }
    }
}

fn check_two_gpu_exchange(rt: DeviceRuntime) {
    // size (8,4,4) over one rank with two accelerators: gpuDim (2,1,1),
    // each subdomain (4,4,4).
    let size = Dim3::new(8, 4, 4);
    let mut dd = DistributedDomain::new(size, Arc::new(NoComm), Arc::new(rt)).unwrap();
    dd.set_radius(1).unwrap();
    let data = dd.register_data::<f64>().unwrap();
    dd.realize(false).unwrap();

    assert_eq!(dd.partition().rank_dim(), Dim3::ONE);
    assert_eq!(dd.partition().gpu_dim(), Dim3::new(2, 1, 1));
    assert_eq!(dd.domains().len(), 2);

    for (di, dom) in dd.domains().iter().enumerate() {
        let origin = Dim3::new(dd.domain_indices()[di].x * 4, 0, 0);
        dom.write_interior(data.index(), &interior_fill(origin, dom.extents()))
            .unwrap();
    }

    dd.exchange().unwrap();

    // Every halo cell mirrors the periodic global field; in particular at
    // the shared face each side's halo equals the other's interior edge.
    for (di, dom) in dd.domains().iter().enumerate() {
        let origin = Dim3::new(dd.domain_indices()[di].x * 4, 0, 0);
        let raw = dom.raw_size();
        let all = dom.read_all::<f64>(data.index()).unwrap();
        for z in 0..raw.z {
            for y in 0..raw.y {
                for x in 0..raw.x {
                    let g = (origin + Dim3::new(x, y, z) - Dim3::ONE).wrap(size);
                    let got = all[Dim3::new(x, y, z).to_linear(raw) as usize];
                    assert_eq!(got, field(g.x, g.y, g.z), "domain {di} at ({x},{y},{z})");
                }
            }
        }
    }
}

#[test]
fn two_accelerators_with_peer_access() {
    check_two_gpu_exchange(DeviceRuntime::new(2));
}

#[test]
fn two_accelerators_staged_through_host() {
    check_two_gpu_exchange(DeviceRuntime::with_peer_links(
        2,
        vec![vec![true, false], vec![false, true]],
    ));
}

#[test]
fn two_ranks_exchange_x_faces() {
    // size (6,6,6), radius 2, two co-located ranks with one accelerator
    // each: rankDim (2,1,1), extents (3,6,6).
    let size = Dim3::splat(6);
    let world = ThreadWorld::new(2);
    let rt = Arc::new(DeviceRuntime::new(2));

    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let comm = Arc::new(world.comm(rank));
            let rt = Arc::clone(&rt);
            std::thread::spawn(move || {
                let mut dd = DistributedDomain::new(size, comm, rt).unwrap();
                dd.set_radius(2).unwrap();
                let data = dd.register_data::<f64>().unwrap();
                dd.realize(false).unwrap();

                let dom = &dd.domains()[0];
                assert_eq!(dom.extents(), Dim3::new(3, 6, 6));
                let fill = vec![(rank + 1) as f64; dom.extents().flatten() as usize];
                dom.write_interior(data.index(), &fill).unwrap();

                dd.exchange().unwrap();

                dd.domains()[0].read_all::<f64>(data.index()).unwrap()
            })
        })
        .collect();

    let results: Vec<Vec<f64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // rank 0's raw array is (7,10,10): x halos [0,2) and [5,7)
    let raw = Dim3::new(7, 10, 10);
    let at = |data: &[f64], x: i64, y: i64, z: i64| data[Dim3::new(x, y, z).to_linear(raw) as usize];
    for z in 0..raw.z {
        for y in 0..raw.y {
            // both x slabs come from rank 1, directly on one side and
            // through the periodic wrap on the other
            for x in [0, 1, 5, 6] {
                assert_eq!(at(&results[0], x, y, z), 2.0, "rank0 halo at ({x},{y},{z})");
                assert_eq!(at(&results[1], x, y, z), 1.0, "rank1 halo at ({x},{y},{z})");
            }
        }
    }
    // interiors are untouched
    for z in 2..8 {
        for y in 2..8 {
            for x in 2..5 {
                assert_eq!(at(&results[0], x, y, z), 1.0);
                assert_eq!(at(&results[1], x, y, z), 2.0);
            }
        }
    }
    // y/z halos wrap onto the owning rank itself
    for x in 2..5 {
        assert_eq!(at(&results[0], x, 0, 5), 1.0);
        assert_eq!(at(&results[1], x, 9, 5), 2.0);
    }
}

#[test]
fn four_ranks_on_two_hosts() {
    // rankDim (2,2,1): x neighbors co-located, y neighbors on the other
    // simulated host.
    let size = Dim3::new(8, 8, 4);
    let world = ThreadWorld::with_hosts(vec![0, 0, 1, 1]);
    let rt_a = Arc::new(DeviceRuntime::new(2));
    let rt_b = Arc::new(DeviceRuntime::new(2));

    let handles: Vec<_> = (0..4)
        .map(|rank| {
            let comm = Arc::new(world.comm(rank));
            let rt = if rank < 2 {
                Arc::clone(&rt_a)
            } else {
                Arc::clone(&rt_b)
            };
            std::thread::spawn(move || {
                let mut dd = DistributedDomain::new(size, comm, rt).unwrap();
                dd.set_radius(1).unwrap();
                let data = dd.register_data::<f64>().unwrap();
                dd.realize(false).unwrap();

                let dom = &dd.domains()[0];
                let fill = vec![(rank + 1) as f64; dom.extents().flatten() as usize];
                dom.write_interior(data.index(), &fill).unwrap();

                dd.exchange().unwrap();

                let dom = &dd.domains()[0];
                let plus_x = dom.read_region::<f64>(data.index(), dom.recv_region(Dim3::new(1, 0, 0))).unwrap();
                let plus_y = dom.read_region::<f64>(data.index(), dom.recv_region(Dim3::new(0, 1, 0))).unwrap();
                let corner = dom.read_region::<f64>(data.index(), dom.recv_region(Dim3::new(1, 1, 0))).unwrap();
                (rank, dd.domain_indices()[0], plus_x, plus_y, corner)
            })
        })
        .collect();

    let part = stencil_halo::partition::Partition::new(size, 4, 1).unwrap();
    let dom_dim = part.dom_dim();
    for handle in handles {
        let (rank, idx, plus_x, plus_y, corner) = handle.join().unwrap();
        assert_eq!(part.dom_idx(rank, 0), idx);
        let expect = |dir: Dim3| (part.get_rank((idx + dir).wrap(dom_dim)) + 1) as f64;
        assert!(plus_x.iter().all(|&v| v == expect(Dim3::new(1, 0, 0))), "rank {rank} +x");
        assert!(plus_y.iter().all(|&v| v == expect(Dim3::new(0, 1, 0))), "rank {rank} +y");
        assert!(corner.iter().all(|&v| v == expect(Dim3::new(1, 1, 0))), "rank {rank} corner");
    }
}

#[test]
fn repeated_exchange_is_idempotent() {
    let rt = Arc::new(DeviceRuntime::new(1));
    let mut dd = DistributedDomain::new(Dim3::splat(4), Arc::new(NoComm), rt).unwrap();
    dd.set_radius(1).unwrap();
    let data = dd.register_data::<f64>().unwrap();
    dd.realize(false).unwrap();

    dd.domains()[0]
        .write_interior(data.index(), &interior_fill(Dim3::ZERO, Dim3::splat(4)))
        .unwrap();

    dd.exchange().unwrap();
    let first: Vec<u64> = dd.domains()[0]
        .read_all::<f64>(data.index())
        .unwrap()
        .into_iter()
        .map(f64::to_bits)
        .collect();

    dd.exchange().unwrap();
    let second: Vec<u64> = dd.domains()[0]
        .read_all::<f64>(data.index())
        .unwrap()
        .into_iter()
        .map(f64::to_bits)
        .collect();

    assert_eq!(first, second);
}

#[test]
fn lifecycle_misuse_is_rejected() {
    let rt = Arc::new(DeviceRuntime::new(1));
    let mut dd = DistributedDomain::new(Dim3::splat(4), Arc::new(NoComm), rt).unwrap();

    assert!(matches!(dd.set_radius(0), Err(HaloError::InvalidRadius)));
    assert!(matches!(dd.exchange(), Err(HaloError::NotRealized)));
    // realize without a radius
    assert!(matches!(dd.realize(false), Err(HaloError::InvalidRadius)));

    dd.set_radius(1).unwrap();
    dd.register_data::<f64>().unwrap();
    dd.realize(false).unwrap();
    assert!(matches!(
        dd.register_data::<f64>(),
        Err(HaloError::RegisterAfterRealize)
    ));
    assert!(matches!(dd.realize(false), Err(HaloError::AlreadyRealized)));
}

#[test]
fn oversized_radius_is_rejected() {
    let rt = Arc::new(DeviceRuntime::new(1));
    let mut dd = DistributedDomain::new(Dim3::splat(4), Arc::new(NoComm), rt).unwrap();
    dd.set_radius(5).unwrap();
    dd.register_data::<f64>().unwrap();
    assert!(matches!(
        dd.realize(false),
        Err(HaloError::RadiusExceedsSubdomain { .. })
    ));
}

#[test]
fn empty_subdomain_is_rejected_at_realize() {
    // one cell split over two accelerators
    let rt = Arc::new(DeviceRuntime::new(2));
    let mut dd = DistributedDomain::new(Dim3::ONE, Arc::new(NoComm), rt).unwrap();
    dd.set_radius(1).unwrap();
    dd.register_data::<f64>().unwrap();
    assert!(matches!(
        dd.realize(false),
        Err(HaloError::EmptySubdomain { .. })
    ));
}

#[test]
fn unified_allocation_exchanges_identically() {
    let rt = Arc::new(DeviceRuntime::new(1));
    let mut dd = DistributedDomain::new(Dim3::splat(4), Arc::new(NoComm), rt).unwrap();
    dd.set_radius(1).unwrap();
    let data = dd.register_data::<f64>().unwrap();
    dd.realize(true).unwrap();

    dd.domains()[0]
        .write_interior(data.index(), &interior_fill(Dim3::ZERO, Dim3::splat(4)))
        .unwrap();
    dd.exchange().unwrap();

    let dom = &dd.domains()[0];
    let raw = dom.raw_size();
    let all = dom.read_all::<f64>(data.index()).unwrap();
    // halo cell (5,3,3) is global (4,2,2), which wraps to (0,2,2)
    assert_eq!(all[Dim3::new(5, 3, 3).to_linear(raw) as usize], field(0, 2, 2));
}
