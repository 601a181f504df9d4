// tests/convolution.rs
//
// Convolution-plan checks through the public API: point-source
// identities, kernel aliasing and pruning, and the classic uniformly
// magnetized cube (self-field -mu0*M/3).
//
// Run with: cargo test --test convolution

use std::sync::Arc;

use fieldconv::device::DeviceSet;
use fieldconv::dist_array::DistributedArray;
use fieldconv::field::HostField;
use fieldconv::grid::Grid3D;
use fieldconv::kernels::monopole_kernel;
use fieldconv::plan::{
    ConvolutionPlanBuilder, Realness, TensorSymmetry, SLOT_CURL, SLOT_DIPOLE,
};

const MU0: f64 = 4.0e-7 * std::f64::consts::PI;

fn device_set(n: usize) -> Arc<DeviceSet> {
    Arc::new(DeviceSet::new(&vec![0; n]).expect("device set"))
}

#[test]
fn point_charge_reproduces_the_monopole_kernel() {
    // A single charged cell at the origin: the output field is the
    // kernel itself, scaled by the source value and slot multiplier.
    let grid = Grid3D::new(2, 4, 4, 1.0, 1.0, 1.0);
    let set = device_set(1);
    let logic = grid.padded_size([0, 0, 0]);

    let rho = DistributedArray::allocate(&set, 1, grid.size()).unwrap();
    let out = DistributedArray::allocate(&set, 3, grid.size()).unwrap();

    let mut host_rho = HostField::new(1, grid.size());
    host_rho.component_mut(0)[0] = 2.0; // cell (0,0,0)
    rho.copy_from_host(&host_rho).unwrap();

    let mut plan = ConvolutionPlanBuilder::new(&set, grid, [0, 0, 0])
        .with_charge(rho.view(), 3.0)
        .build(&out)
        .unwrap();
    plan.update().unwrap();

    let kern = monopole_kernel(&grid, logic, [0, 0, 0]);
    let result = out.local_copy();
    let scale = 2.0f32 * 3.0;
    let max_k = kern.max_abs();
    let [nx, ny, nz] = grid.size();
    for c in 0..3 {
        for x in 0..nx {
            for y in 0..ny {
                for z in 0..nz {
                    let got = result.component(c)[result.idx(x, y, z)];
                    let want = scale * kern.component(c)[(x * logic[1] + y) * logic[2] + z];
                    assert!(
                        (got - want).abs() <= 1e-4 * scale * max_k,
                        "component {c} at ({x},{y},{z}): got {got}, want {want}"
                    );
                }
            }
        }
    }
}

#[test]
fn delta_kernel_translates_the_source() {
    // Kernel concentrated at the origin cell: convolution against a
    // single nonzero source cell reproduces the kernel amplitudes at
    // the source position.
    let grid = Grid3D::new(2, 4, 4, 1.0, 1.0, 1.0);
    let set = device_set(2);
    let logic = grid.padded_size([0, 0, 0]);

    let amp = [1.5f32, -0.5, 2.0];
    let mut kernel = HostField::new(3, logic);
    for (c, &a) in amp.iter().enumerate() {
        kernel.component_mut(c)[0] = a;
    }

    let src = DistributedArray::allocate(&set, 1, grid.size()).unwrap();
    let out = DistributedArray::allocate(&set, 3, grid.size()).unwrap();
    let mut host_src = HostField::new(1, grid.size());
    let at = host_src.idx(1, 2, 3);
    host_src.component_mut(0)[at] = 2.0;
    src.copy_from_host(&host_src).unwrap();

    let mut plan = ConvolutionPlanBuilder::new(&set, grid, [0, 0, 0])
        .with_kernel(
            0,
            kernel,
            TensorSymmetry::Diagonal,
            Realness::PureReal,
            vec![src.view()],
            0.5,
        )
        .build(&out)
        .unwrap();
    plan.update().unwrap();

    let result = out.local_copy();
    let [nx, ny, nz] = grid.size();
    for c in 0..3 {
        for x in 0..nx {
            for y in 0..ny {
                for z in 0..nz {
                    let got = result.component(c)[result.idx(x, y, z)];
                    let want = if (x, y, z) == (1, 2, 3) {
                        amp[c] * 2.0 * 0.5
                    } else {
                        0.0
                    };
                    assert!(
                        (got - want).abs() <= 5e-4,
                        "component {c} at ({x},{y},{z}): got {got}, want {want}"
                    );
                }
            }
        }
    }
}

#[test]
fn zero_components_are_pruned_and_contribute_nothing() {
    // A full-complex pattern kernel in component x only; y and z are
    // identically zero and must neither be stored nor contribute.
    let grid = Grid3D::new(2, 4, 4, 1.0, 1.0, 1.0);
    let set = device_set(1);
    let logic = grid.padded_size([0, 0, 0]);

    let mut kernel = HostField::new(3, logic);
    for (i, v) in kernel.component_mut(0).iter_mut().enumerate() {
        *v = ((i * 17 % 29) as f32) / 29.0 - 0.4;
    }

    let src = DistributedArray::allocate(&set, 1, grid.size()).unwrap();
    let out = DistributedArray::allocate(&set, 3, grid.size()).unwrap();
    let mut host_src = HostField::new(1, grid.size());
    host_src.component_mut(0)[0] = 1.0;
    src.copy_from_host(&host_src).unwrap();

    let pattern: Vec<f32> = kernel.component(0).to_vec();
    let mut plan = ConvolutionPlanBuilder::new(&set, grid, [0, 0, 0])
        .with_kernel(
            0,
            kernel,
            TensorSymmetry::Diagonal,
            Realness::FullComplex,
            vec![src.view()],
            1.0,
        )
        .build(&out)
        .unwrap();

    assert!(plan.kernel_slot(0, 0).is_some());
    assert!(plan.kernel_slot(0, 1).is_none(), "zero component retained");
    assert!(plan.kernel_slot(0, 2).is_none(), "zero component retained");

    plan.update().unwrap();
    let result = out.local_copy();

    // Component x reproduces the pattern over the data region...
    let [nx, ny, nz] = grid.size();
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                let got = result.component(0)[result.idx(x, y, z)];
                let want = pattern[(x * logic[1] + y) * logic[2] + z];
                assert!(
                    (got - want).abs() <= 1e-4,
                    "at ({x},{y},{z}): got {got}, want {want}"
                );
            }
        }
    }
    // ...and the pruned components stay exactly quiet.
    assert_eq!(result.component(1).iter().map(|v| v.abs()).fold(0.0, f32::max), 0.0);
    assert_eq!(result.component(2).iter().map(|v| v.abs()).fold(0.0, f32::max), 0.0);
}

fn cube_demag(n_dev: usize) -> HostField {
    let grid = Grid3D::new(2, 2, 2, 1.0, 1.0, 1.0);
    let set = device_set(n_dev);

    let m = DistributedArray::allocate(&set, 3, grid.size()).unwrap();
    let out = DistributedArray::allocate(&set, 3, grid.size()).unwrap();

    let mut host_m = HostField::new(3, grid.size());
    host_m.component_mut(2).fill(1.0); // uniform magnetization along +z
    m.copy_from_host(&host_m).unwrap();

    let ms = 8.0e5;
    let mut plan = ConvolutionPlanBuilder::new(&set, grid, [0, 0, 0])
        .with_accuracy(8.0)
        .with_dipole(m.view(), MU0 * ms)
        .build(&out)
        .unwrap();
    plan.update().unwrap();
    out.local_copy()
}

#[test]
fn uniformly_magnetized_cube_self_field_is_minus_third() {
    // All eight cells of a 2x2x2 cube are equivalent by symmetry, so
    // each carries the cube's average demag field: B = -mu0*Ms/3.
    let ms = 8.0e5;
    let expected = -(MU0 * ms / 3.0) as f32;
    let b = cube_demag(1);
    for i in 0..b.len() {
        let (bx, by, bz) = (
            b.component(0)[i],
            b.component(1)[i],
            b.component(2)[i],
        );
        assert!(
            (bz - expected).abs() < 0.01 * expected.abs(),
            "cell {i}: bz = {bz}, expected {expected}"
        );
        assert!(bx.abs() < 1e-3 * expected.abs(), "cell {i}: bx = {bx}");
        assert!(by.abs() < 1e-3 * expected.abs(), "cell {i}: by = {by}");
    }
}

#[test]
fn demag_field_is_invariant_under_device_count() {
    let one = cube_demag(1);
    let two = cube_demag(2);
    let max_ref = one.max_abs();
    for c in 0..3 {
        for (a, b) in one.component(c).iter().zip(two.component(c).iter()) {
            assert!(
                (a - b).abs() <= 1e-4 * max_ref,
                "component {c}: {a} vs {b}"
            );
        }
    }
}

#[test]
fn symmetric_kernel_entries_share_one_spectrum() {
    let grid = Grid3D::new(2, 2, 2, 1.0, 1.0, 1.0);
    let set = device_set(1);
    let m = DistributedArray::allocate(&set, 3, grid.size()).unwrap();
    let out = DistributedArray::allocate(&set, 3, grid.size()).unwrap();

    let plan = ConvolutionPlanBuilder::new(&set, grid, [0, 0, 0])
        .with_accuracy(4.0)
        .with_dipole(m.view(), 1.0)
        .build(&out)
        .unwrap();

    // K_xy lives at (slot dipole+x, comp y); K_yx at (slot dipole+y,
    // comp x). One stored spectrum, shared.
    let xy = plan.kernel_slot(SLOT_DIPOLE, 1).expect("xy retained");
    let yx = plan.kernel_slot(SLOT_DIPOLE + 1, 0).expect("yx retained");
    assert!(
        Arc::ptr_eq(xy.values(), yx.values()),
        "symmetric aliases must share the stored buffer"
    );
    assert_eq!(xy.scale(), yx.scale());
}

#[test]
fn antisymmetric_kernel_entries_negate_the_shared_spectrum() {
    let grid = Grid3D::new(2, 2, 2, 1.0, 1.0, 1.0);
    let set = device_set(1);
    let j = DistributedArray::allocate(&set, 3, grid.size()).unwrap();
    let out = DistributedArray::allocate(&set, 3, grid.size()).unwrap();

    let mut plan = ConvolutionPlanBuilder::new(&set, grid, [0, 0, 0])
        .with_curl(j.view(), 1.0)
        .build(&out)
        .unwrap();

    let xy = plan.kernel_slot(SLOT_CURL, 1).expect("xy retained");
    let yx = plan.kernel_slot(SLOT_CURL + 1, 0).expect("yx retained");
    assert!(Arc::ptr_eq(xy.values(), yx.values()));
    assert_eq!(yx.scale(), -xy.scale());

    // The rotor diagonal is identically zero: pruned, never stored.
    assert!(plan.kernel_slot(SLOT_CURL, 0).is_none());
    assert!(plan.kernel_slot(SLOT_CURL + 1, 1).is_none());
    assert!(plan.kernel_slot(SLOT_CURL + 2, 2).is_none());

    // And the plan still runs with an all-zero source.
    plan.update().unwrap();
    assert_eq!(out.local_copy().max_abs(), 0.0);
}
