// src/kernels.rs
//
// Real-space convolution kernels, tabulated on the padded transform
// grid, plus the rank-2 tensor index tables shared with the plan.
//
// Kernels are dimensionless interaction tensors: the physical
// prefactors (mu0, 1/epsilon0, saturation values) enter through the
// per-slot multipliers of the convolution plan. The dipole kernel uses
// face-charge integration with distance-adaptive integration point
// counts; the monopole and rotor kernels are point-evaluated at cell
// centres. All of them are tabulated with exact parity (octant fill +
// signed reflection) so their spectra come out purely real or purely
// imaginary to rounding.

use rayon::prelude::*;
use std::f64::consts::PI;

use crate::field::HostField;
use crate::grid::Grid3D;

// Tensor component order. Diagonal first, then the upper triangle, then
// the (derived) lower triangle, so symmetric kernels can store only the
// first six components.
pub const XX: usize = 0;
pub const YY: usize = 1;
pub const ZZ: usize = 2;
pub const YZ: usize = 3;
pub const XZ: usize = 4;
pub const XY: usize = 5;
pub const ZY: usize = 6;
pub const ZX: usize = 7;
pub const YX: usize = 8;

/// Component names, for diagnostics.
pub const TENSOR_NAME: [&str; 9] = ["xx", "yy", "zz", "yz", "xz", "xy", "zy", "zx", "yx"];

/// (row, column) of tensor component `k`.
#[inline]
pub fn idx_to_ij(k: usize) -> (usize, usize) {
    [
        (0, 0),
        (1, 1),
        (2, 2),
        (1, 2),
        (0, 2),
        (0, 1),
        (2, 1),
        (2, 0),
        (1, 0),
    ][k]
}

/// Tensor component of (row, column).
pub const TENSOR_IDX: [[usize; 3]; 3] = [[XX, XY, XZ], [YX, YY, YZ], [ZX, ZY, ZZ]];

/// Wrap a displacement to [0, max) by adding/subtracting multiples of max.
#[inline]
pub fn wrap_index(d: isize, max: usize) -> usize {
    let max = max as isize;
    let mut v = d % max;
    if v < 0 {
        v += max;
    }
    v as usize
}

/// Closest distance between two cells in units of the cell size, given
/// their integer centre distance. Touching cells give 0.
#[inline]
fn delta_cell(d: isize) -> f64 {
    let mut a = d.unsigned_abs() as f64;
    if a > 0.0 {
        a -= 1.0;
    }
    a
}

/// Displacement range along one axis: all source-observer offsets that
/// contribute. Open boundaries reach (n-1); periodic boundaries sum
/// `images` repetitions.
fn kernel_range(n: usize, images: usize) -> isize {
    if images == 0 {
        n as isize - 1
    } else {
        (n * images) as isize - 1
    }
}

// --- dipole / demagnetization kernel --------------------------------

/// Symmetric 6-component dipole (demagnetization) tensor on the padded
/// grid `logic`, by face-charge integration over the cells of `grid`.
///
/// `accuracy` controls the integration point density (higher is finer);
/// `periodic[i]` is the number of periodic images along axis i, 0 for
/// open boundaries.
pub fn dipole_kernel(
    grid: &Grid3D,
    logic: [usize; 3],
    accuracy: f64,
    periodic: [usize; 3],
) -> HostField {
    let mut kern = HostField::new(6, logic);
    let cell = grid.cell_size();
    let open = periodic == [0, 0, 0];

    if open {
        // Base octant, reflected with exact parity: diagonals even in
        // every axis, off-diagonal ij odd in i and j.
        let (rx, ry, rz) = (
            grid.nx as isize - 1,
            grid.ny as isize - 1,
            grid.nz as isize - 1,
        );
        let base: Vec<(isize, isize, isize)> = (0..=rx)
            .flat_map(|sx| {
                (0..=ry).flat_map(move |sy| (0..=rz).map(move |sz| (sx, sy, sz)))
            })
            .collect();
        let entries: Vec<_> = base
            .par_iter()
            .map(|&(sx, sy, sz)| {
                (sx, sy, sz, dipole_entries(cell, [sx, sy, sz], accuracy))
            })
            .collect();

        for (sx, sy, sz, v) in entries {
            for &gx in &[1isize, -1] {
                for &gy in &[1isize, -1] {
                    for &gz in &[1isize, -1] {
                        let ix = wrap_index(gx * sx, logic[0]);
                        let iy = wrap_index(gy * sy, logic[1]);
                        let iz = wrap_index(gz * sz, logic[2]);
                        let at = (ix * logic[1] + iy) * logic[2] + iz;
                        let (fx, fy, fz) = (gx as f64, gy as f64, gz as f64);
                        kern.comp[XX][at] = v[XX] as f32;
                        kern.comp[YY][at] = v[YY] as f32;
                        kern.comp[ZZ][at] = v[ZZ] as f32;
                        kern.comp[YZ][at] = (fy * fz * v[YZ]) as f32;
                        kern.comp[XZ][at] = (fx * fz * v[XZ]) as f32;
                        kern.comp[XY][at] = (fx * fy * v[XY]) as f32;
                    }
                }
            }
        }
        // Parity forces the off-diagonals to vanish on their own axis
        // planes; enforce that exactly (the integration only cancels to
        // rounding there).
        zero_plane(&mut kern, XY, 0, logic);
        zero_plane(&mut kern, XY, 1, logic);
        zero_plane(&mut kern, XZ, 0, logic);
        zero_plane(&mut kern, XZ, 2, logic);
        zero_plane(&mut kern, YZ, 1, logic);
        zero_plane(&mut kern, YZ, 2, logic);
    } else {
        // Periodic images accumulate into wrapped bins; many images can
        // fold onto the same cell, hence +=.
        let (rx, ry, rz) = (
            kernel_range(grid.nx, periodic[0]),
            kernel_range(grid.ny, periodic[1]),
            kernel_range(grid.nz, periodic[2]),
        );
        let disp: Vec<(isize, isize, isize)> = (-rx..=rx)
            .flat_map(|sx| {
                (-ry..=ry).flat_map(move |sy| (-rz..=rz).map(move |sz| (sx, sy, sz)))
            })
            .collect();
        let entries: Vec<_> = disp
            .par_iter()
            .map(|&(sx, sy, sz)| {
                (sx, sy, sz, dipole_entries(cell, [sx, sy, sz], accuracy))
            })
            .collect();
        for (sx, sy, sz, v) in entries {
            let ix = wrap_index(sx, logic[0]);
            let iy = wrap_index(sy, logic[1]);
            let iz = wrap_index(sz, logic[2]);
            let at = (ix * logic[1] + iy) * logic[2] + iz;
            for c in 0..6 {
                kern.comp[c][at] += v[c] as f32;
            }
        }
    }
    kern
}

/// Zero one component of `kern` on the plane where displacement along
/// `axis` is zero.
fn zero_plane(kern: &mut HostField, comp: usize, axis: usize, logic: [usize; 3]) {
    for x in 0..logic[0] {
        for y in 0..logic[1] {
            for z in 0..logic[2] {
                let on_plane = match axis {
                    0 => x == 0,
                    1 => y == 0,
                    _ => z == 0,
                };
                if on_plane {
                    kern.comp[comp][(x * logic[1] + y) * logic[2] + z] = 0.0;
                }
            }
        }
    }
}

/// The six tensor entries for one displacement: columns of the field
/// produced by unit dipole density along each axis.
fn dipole_entries(cell: [f64; 3], disp: [isize; 3], accuracy: f64) -> [f64; 6] {
    let h_x = field_of_unit_dipole(0, cell, disp, accuracy);
    let h_y = field_of_unit_dipole(1, cell, disp, accuracy);
    let h_z = field_of_unit_dipole(2, cell, disp, accuracy);
    [
        h_x[0], // xx
        h_y[1], // yy
        h_z[2], // zz
        h_z[1], // yz (Hy from unit Mz)
        h_z[0], // xz
        h_y[0], // xy
    ]
}

/// Field at the observer cell (displaced by `disp` cells) per unit
/// dipole density along `source_axis`, by integrating the two charged
/// faces of the source cell against integration points spread over the
/// observer cell volume. Point counts scale with distance over
/// `accuracy`; the face grid is staggered at twice the density.
fn field_of_unit_dipole(
    source_axis: usize,
    cell: [f64; 3],
    disp: [isize; 3],
    accuracy: f64,
) -> [f64; 3] {
    let u = source_axis;
    let v = (u + 1) % 3;
    let w = (u + 2) % 3;

    let r_center = [
        disp[0] as f64 * cell[0],
        disp[1] as f64 * cell[1],
        disp[2] as f64 * cell[2],
    ];

    let lmin = cell[0].min(cell[1]).min(cell[2]);
    let dx_min = delta_cell(disp[0]) * cell[0];
    let dy_min = delta_cell(disp[1]) * cell[1];
    let dz_min = delta_cell(disp[2]) * cell[2];
    let mut d = (dx_min * dx_min + dy_min * dy_min + dz_min * dz_min).sqrt();
    if d == 0.0 {
        d = lmin;
    }
    let max_size = d / accuracy;

    #[inline]
    fn points(x: f64) -> usize {
        ((x.max(1.0) + 0.5).floor()) as usize
    }

    let nx = points(cell[0] / max_size);
    let ny = points(cell[1] / max_size);
    let nz = points(cell[2] / max_size);
    let nv = 2 * points(cell[v] / max_size);
    let nw = 2 * points(cell[w] / max_size);

    let scale = 1.0 / ((nv * nw * nx * ny * nz) as f64);
    let charge = cell[v] * cell[w] * scale;

    let pu1 = 0.5 * cell[u];
    let pu2 = -pu1;

    let mut pole = [0.0f64; 3];
    let mut h = [0.0f64; 3];

    for i in 0..nv {
        pole[v] = -0.5 * cell[v] + cell[v] / (2.0 * nv as f64) + (i as f64) * (cell[v] / nv as f64);
        for j in 0..nw {
            pole[w] =
                -0.5 * cell[w] + cell[w] / (2.0 * nw as f64) + (j as f64) * (cell[w] / nw as f64);

            for ax in 0..nx {
                let rx = r_center[0] - 0.5 * cell[0]
                    + cell[0] / (2.0 * nx as f64)
                    + (ax as f64) * (cell[0] / nx as f64);
                for ay in 0..ny {
                    let ry = r_center[1] - 0.5 * cell[1]
                        + cell[1] / (2.0 * ny as f64)
                        + (ay as f64) * (cell[1] / ny as f64);
                    for az in 0..nz {
                        let rz = r_center[2] - 0.5 * cell[2]
                            + cell[2] / (2.0 * nz as f64)
                            + (az as f64) * (cell[2] / nz as f64);

                        // + face
                        pole[u] = pu1;
                        let r1x = rx - pole[0];
                        let r1y = ry - pole[1];
                        let r1z = rz - pole[2];
                        let r1 = (r1x * r1x + r1y * r1y + r1z * r1z).sqrt();
                        let q1 = charge / (4.0 * PI * r1 * r1 * r1);

                        // - face
                        pole[u] = pu2;
                        let r2x = rx - pole[0];
                        let r2y = ry - pole[1];
                        let r2z = rz - pole[2];
                        let r2 = (r2x * r2x + r2y * r2y + r2z * r2z).sqrt();
                        let q2 = -charge / (4.0 * PI * r2 * r2 * r2);

                        h[0] += r1x * q1 + r2x * q2;
                        h[1] += r1y * q1 + r2y * q2;
                        h[2] += r1z * q1 + r2z * q2;
                    }
                }
            }
        }
    }

    h
}

// --- monopole / charge kernel ---------------------------------------

/// 3-component vector kernel: field of a unit charge density,
/// `K(s) = V * s / (4 pi |s|^3)`, zero at the origin cell. Odd in
/// space, so its spectrum is purely imaginary. Loaded diagonally (one
/// input slot feeding all three output components).
pub fn monopole_kernel(grid: &Grid3D, logic: [usize; 3], periodic: [usize; 3]) -> HostField {
    let mut kern = HostField::new(3, logic);
    let cell = grid.cell_size();
    let vol = cell[0] * cell[1] * cell[2];

    let (rx, ry, rz) = (
        kernel_range(grid.nx, periodic[0]),
        kernel_range(grid.ny, periodic[1]),
        kernel_range(grid.nz, periodic[2]),
    );
    for sx in -rx..=rx {
        for sy in -ry..=ry {
            for sz in -rz..=rz {
                if sx == 0 && sy == 0 && sz == 0 {
                    continue;
                }
                let r = [
                    sx as f64 * cell[0],
                    sy as f64 * cell[1],
                    sz as f64 * cell[2],
                ];
                let rr = (r[0] * r[0] + r[1] * r[1] + r[2] * r[2]).sqrt();
                let c = vol / (4.0 * PI * rr * rr * rr);
                let ix = wrap_index(sx, logic[0]);
                let iy = wrap_index(sy, logic[1]);
                let iz = wrap_index(sz, logic[2]);
                let at = (ix * logic[1] + iy) * logic[2] + iz;
                kern.comp[0][at] += (r[0] * c) as f32;
                kern.comp[1][at] += (r[1] * c) as f32;
                kern.comp[2][at] += (r[2] * c) as f32;
            }
        }
    }
    kern
}

// --- rotor / curl kernel --------------------------------------------

/// Full 9-component antisymmetric curl kernel,
/// `K_ij(s) = -eps_ijk * V * s_k / (4 pi |s|^3)`. Odd in space, purely
/// imaginary spectrum, diagonal identically zero.
pub fn rotor_kernel(grid: &Grid3D, logic: [usize; 3], periodic: [usize; 3]) -> HostField {
    let mut kern = HostField::new(9, logic);
    let cell = grid.cell_size();
    let vol = cell[0] * cell[1] * cell[2];

    let (rx, ry, rz) = (
        kernel_range(grid.nx, periodic[0]),
        kernel_range(grid.ny, periodic[1]),
        kernel_range(grid.nz, periodic[2]),
    );
    for sx in -rx..=rx {
        for sy in -ry..=ry {
            for sz in -rz..=rz {
                if sx == 0 && sy == 0 && sz == 0 {
                    continue;
                }
                let r = [
                    sx as f64 * cell[0],
                    sy as f64 * cell[1],
                    sz as f64 * cell[2],
                ];
                let rr = (r[0] * r[0] + r[1] * r[1] + r[2] * r[2]).sqrt();
                let c = vol / (4.0 * PI * rr * rr * rr);
                let ix = wrap_index(sx, logic[0]);
                let iy = wrap_index(sy, logic[1]);
                let iz = wrap_index(sz, logic[2]);
                let at = (ix * logic[1] + iy) * logic[2] + iz;
                kern.comp[XY][at] += (-r[2] * c) as f32;
                kern.comp[YX][at] += (r[2] * c) as f32;
                kern.comp[XZ][at] += (r[1] * c) as f32;
                kern.comp[ZX][at] += (-r[1] * c) as f32;
                kern.comp[YZ][at] += (-r[0] * c) as f32;
                kern.comp[ZY][at] += (r[0] * c) as f32;
            }
        }
    }
    kern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_index_folds_negatives() {
        assert_eq!(wrap_index(0, 8), 0);
        assert_eq!(wrap_index(3, 8), 3);
        assert_eq!(wrap_index(-1, 8), 7);
        assert_eq!(wrap_index(-9, 8), 7);
        assert_eq!(wrap_index(8, 8), 0);
    }

    #[test]
    fn tensor_tables_are_inverse() {
        for k in 0..9 {
            let (i, j) = idx_to_ij(k);
            assert_eq!(TENSOR_IDX[i][j], k, "component {}", TENSOR_NAME[k]);
        }
    }

    #[test]
    fn cube_self_demag_is_one_third_per_axis() {
        // A cubic cell demagnetizes itself isotropically: N_ii(0) = -1/3.
        let v = dipole_entries([1.0, 1.0, 1.0], [0, 0, 0], 8.0);
        for (c, name) in [(XX, "xx"), (YY, "yy"), (ZZ, "zz")] {
            assert!(
                (v[c] + 1.0 / 3.0).abs() < 2e-3,
                "N_{name}(0) = {} not close to -1/3",
                v[c]
            );
        }
        assert!(v[XY].abs() < 1e-9 && v[XZ].abs() < 1e-9 && v[YZ].abs() < 1e-9);
    }

    #[test]
    fn dipole_kernel_has_exact_parity() {
        let grid = Grid3D::new(2, 2, 2, 1.0, 1.0, 1.0);
        let kern = dipole_kernel(&grid, [4, 4, 4], 4.0, [0, 0, 0]);
        let at = |x: isize, y: isize, z: isize| {
            (wrap_index(x, 4) * 4 + wrap_index(y, 4)) * 4 + wrap_index(z, 4)
        };
        // Diagonals even, xy odd in x and y.
        assert_eq!(kern.comp[XX][at(1, 1, 0)], kern.comp[XX][at(-1, -1, 0)]);
        assert_eq!(kern.comp[XY][at(1, 1, 0)], kern.comp[XY][at(-1, -1, 0)]);
        assert_eq!(kern.comp[XY][at(1, 1, 0)], -kern.comp[XY][at(-1, 1, 0)]);
    }

    #[test]
    fn monopole_kernel_is_odd_with_empty_origin() {
        let grid = Grid3D::new(2, 2, 2, 1.0, 1.0, 1.0);
        let kern = monopole_kernel(&grid, [4, 4, 4], [0, 0, 0]);
        let at = |x: isize, y: isize, z: isize| {
            (wrap_index(x, 4) * 4 + wrap_index(y, 4)) * 4 + wrap_index(z, 4)
        };
        assert_eq!(kern.comp[0][at(0, 0, 0)], 0.0);
        for c in 0..3 {
            assert_eq!(kern.comp[c][at(1, 1, 1)], -kern.comp[c][at(-1, -1, -1)]);
        }
        assert!(kern.comp[0][at(1, 0, 0)] > 0.0, "K_x points along +x");
    }

    #[test]
    fn rotor_kernel_is_antisymmetric() {
        let grid = Grid3D::new(2, 2, 2, 1.0, 1.0, 1.0);
        let kern = rotor_kernel(&grid, [4, 4, 4], [0, 0, 0]);
        for (upper, lower) in [(XY, YX), (XZ, ZX), (YZ, ZY)] {
            for i in 0..kern.len() {
                assert_eq!(kern.comp[upper][i], -kern.comp[lower][i]);
            }
        }
        assert!(crate::field::is_zero(kern.component(XX)));
    }
}
