// src/fft.rs
//
// Distributed zero-padded 3D FFT: real-to-complex forward, complex-to-
// real inverse, staged so that no device ever holds the whole grid.
//
// Forward data flow (inverse mirrors it):
//
//   1. copy/pad-in : y-slab (Dx, Dy/N, Dz) -> padded rows of Lz (+2)
//   2. Z transform : per-device batched R2C along z (rows stay resident)
//   3. YZ transpose: per-device (Dx, Dy/N, Fz) -> (Dx, Fz, Dy/N)
//   4. exchange    : cross-device chunk redistribution along z'
//   5. insertion   : assemble (Lx, Cz, Ly) with zero-padding in x and y
//   6. Y transform : per-device batched C2C along y
//   7. X transform : per-device strided batched C2C along x (3D only)
//
// with Fz = Lz/2+1 one-sided bins, Cz0 = (Lz/2)/N logical z'-rows per
// device and Cz = Cz0+1 local rows: the extra row holds the Nyquist
// plane on the last device and stays zero everywhere else. Keeping the
// Nyquist plane addressable is what makes the inverse path exact.
//
// The exchange is a table of (src device, src offset, dst device, dst
// offset, length) copy descriptors computed once at construction and
// replayed identically on every call, one table per direction.
//
// Transforms are unnormalized in both directions; a forward/inverse
// round trip scales by normalization() = Lx*Ly*Lz.

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::device::{sync_all, DeviceBuffer, DeviceSet, Stream};
use crate::dist_array::ArrayView;
use crate::error::{Error, Result};

fn fft_timing_enabled() -> bool {
    std::env::var("FIELDCONV_FFT_TIMING").is_ok()
}

/// One replayed cross-device copy. Offsets and length count f32 elements.
#[derive(Debug, Clone, Copy)]
struct CopyDesc {
    src_dev: usize,
    src_off: usize,
    dst_dev: usize,
    dst_off: usize,
    len: usize,
}

/// Multi-stage distributed FFT plan.
///
/// All scratch buffers are sized at construction and reused on every
/// call; `forward`/`inverse` allocate nothing on the devices.
pub struct FftPipeline {
    devices: Arc<DeviceSet>,
    data_size: [usize; 3],
    logic_size: [usize; 3],

    fz: usize,  // one-sided bins along z
    cz0: usize, // logical z'-rows per device
    cz: usize,  // local z'-rows per device (cz0 + Nyquist/pad slot)

    pad_z: Vec<DeviceBuffer>,   // (Dx, Dy/N, Lz+2) floats per device
    transp1: Vec<DeviceBuffer>, // same extent, transposed content
    chunk: Vec<DeviceBuffer>,   // (Dx, N, Cz, Dy/N) complex per device
    transp2: Vec<DeviceBuffer>, // (Lx, Cz, Ly) complex per device
    streams: Vec<Stream>,

    fwd_exchange: Vec<CopyDesc>,
    inv_exchange: Vec<CopyDesc>,

    fft_z_fwd: Arc<dyn Fft<f32>>,
    fft_z_inv: Arc<dyn Fft<f32>>,
    fft_y_fwd: Arc<dyn Fft<f32>>,
    fft_y_inv: Arc<dyn Fft<f32>>,
    fft_x_fwd: Option<Arc<dyn Fft<f32>>>,
    fft_x_inv: Option<Arc<dyn Fft<f32>>>,
}

impl FftPipeline {
    /// Build a plan for transforming `data_size` fields inside a
    /// `logic_size` (zero-padded) transform volume.
    pub fn new(
        devices: &Arc<DeviceSet>,
        data_size: [usize; 3],
        logic_size: [usize; 3],
    ) -> Result<Self> {
        let n = devices.count();
        let [dx, dy, _dz] = data_size;
        let [lx, ly, lz] = logic_size;

        if data_size.iter().any(|&s| s == 0) || logic_size.iter().any(|&s| s == 0) {
            return Err(Error::Config(format!(
                "degenerate transform size: data {data_size:?}, logic {logic_size:?}"
            )));
        }
        for i in 0..3 {
            if logic_size[i] < data_size[i] {
                return Err(Error::Config(format!(
                    "logic size {logic_size:?} smaller than data size {data_size:?}"
                )));
            }
        }
        if lz < 2 || lz % 2 != 0 {
            return Err(Error::Config(format!(
                "z transform length {lz} must be even and at least 2"
            )));
        }
        if dy % n != 0 {
            return Err(Error::Config(format!(
                "data y dimension {dy} not divisible by device count {n}"
            )));
        }
        if (lz / 2) % n != 0 {
            return Err(Error::Config(format!(
                "half z length {} not divisible by device count {n}",
                lz / 2
            )));
        }
        if ly % n != 0 {
            return Err(Error::Config(format!(
                "logic y dimension {ly} not divisible by device count {n}"
            )));
        }

        let fz = lz / 2 + 1;
        let cz0 = (lz / 2) / n;
        let cz = cz0 + 1;
        let dy_l = dy / n;

        let mut pad_z = Vec::with_capacity(n);
        let mut transp1 = Vec::with_capacity(n);
        let mut chunk = Vec::with_capacity(n);
        let mut transp2 = Vec::with_capacity(n);
        let mut streams = Vec::with_capacity(n);
        for d in 0..n {
            devices.set_current(d);
            pad_z.push(devices.alloc(d, dx * dy_l * (lz + 2)));
            transp1.push(devices.alloc(d, dx * dy_l * (lz + 2)));
            chunk.push(devices.alloc(d, dx * n * cz * dy_l * 2));
            transp2.push(devices.alloc(d, lx * cz * ly * 2));
            streams.push(devices.new_stream(d));
        }

        // Exchange tables: source device s sends, for every x-plane, the
        // contiguous block of z'-rows owned by destination device d. The
        // last device's block includes the Nyquist row.
        let mut fwd_exchange = Vec::with_capacity(n * n * dx);
        let mut inv_exchange = Vec::with_capacity(n * n * dx);
        for s in 0..n {
            for d in 0..n {
                assert!(
                    devices.can_copy(s, d),
                    "no peer path between devices {s} and {d}"
                );
                let rows = if d == n - 1 { cz0 + 1 } else { cz0 };
                for x in 0..dx {
                    let t1_off = ((x * fz) + d * cz0) * dy_l * 2;
                    let ch_off = (x * n + s) * cz * dy_l * 2;
                    let len = rows * dy_l * 2;
                    fwd_exchange.push(CopyDesc {
                        src_dev: s,
                        src_off: t1_off,
                        dst_dev: d,
                        dst_off: ch_off,
                        len,
                    });
                    inv_exchange.push(CopyDesc {
                        src_dev: d,
                        src_off: ch_off,
                        dst_dev: s,
                        dst_off: t1_off,
                        len,
                    });
                }
            }
        }

        let mut planner = FftPlanner::<f32>::new();
        let fft_z_fwd = planner.plan_fft_forward(lz);
        let fft_z_inv = planner.plan_fft_inverse(lz);
        let fft_y_fwd = planner.plan_fft_forward(ly);
        let fft_y_inv = planner.plan_fft_inverse(ly);
        let (fft_x_fwd, fft_x_inv) = if lx > 1 {
            (
                Some(planner.plan_fft_forward(lx)),
                Some(planner.plan_fft_inverse(lx)),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            devices: devices.clone(),
            data_size,
            logic_size,
            fz,
            cz0,
            cz,
            pad_z,
            transp1,
            chunk,
            transp2,
            streams,
            fwd_exchange,
            inv_exchange,
            fft_z_fwd,
            fft_z_inv,
            fft_y_fwd,
            fft_y_inv,
            fft_x_fwd,
            fft_x_inv,
        })
    }

    pub fn data_size(&self) -> [usize; 3] {
        self.data_size
    }

    pub fn logic_size(&self) -> [usize; 3] {
        self.logic_size
    }

    /// Scale factor accumulated by one forward + inverse pass.
    pub fn normalization(&self) -> usize {
        self.logic_size[0] * self.logic_size[1] * self.logic_size[2]
    }

    /// Logical float shape of a frequency-space array for this plan:
    /// (Lx, Ly, Lz + 2N). Reduces to the classical (Lx, Ly, Lz+2) on a
    /// single device; the 2(N-1) extra z-floats are the per-device
    /// Nyquist/pad slots.
    pub fn freq_size(&self) -> [usize; 3] {
        let n = self.devices.count();
        [
            self.logic_size[0],
            self.logic_size[1],
            self.logic_size[2] + 2 * n,
        ]
    }

    /// Shape of a real-half or imaginary-half extraction of a
    /// frequency-space array.
    pub fn half_freq_size(&self) -> [usize; 3] {
        let f = self.freq_size();
        [f[0], f[1], f[2] / 2]
    }

    fn dy_local(&self) -> usize {
        self.data_size[1] / self.devices.count()
    }

    fn check_data_view(&self, v: &ArrayView, what: &str) {
        assert!(v.ncomp() == 1, "{what}: expected a scalar view");
        assert!(
            v.size3() == self.data_size,
            "{what}: shape {:?} does not match plan data size {:?}",
            v.size3(),
            self.data_size
        );
        assert!(
            v.device_count() == self.devices.count(),
            "{what}: device count mismatch"
        );
    }

    fn check_freq_view(&self, v: &ArrayView, what: &str) {
        assert!(v.ncomp() == 1, "{what}: expected a scalar view");
        assert!(
            v.size3() == self.freq_size(),
            "{what}: shape {:?} does not match plan frequency size {:?}",
            v.size3(),
            self.freq_size()
        );
        assert!(
            v.device_count() == self.devices.count(),
            "{what}: device count mismatch"
        );
    }

    // --- forward -----------------------------------------------------

    /// Forward transform: real-space scalar view (data size) into a
    /// frequency-space view (freq size).
    pub fn forward(&mut self, input: &ArrayView, output: &ArrayView) -> Result<()> {
        self.check_data_view(input, "fft forward input");
        self.check_freq_view(output, "fft forward output");
        let t_start = Instant::now();

        self.stage_pad_in(input)?;
        self.stage_z(true)?;
        sync_all(&self.streams)?;

        self.stage_transpose_yz()?;
        self.replay_exchange(&self.fwd_exchange, &self.transp1, &self.chunk)?;
        sync_all(&self.streams)?;

        self.stage_insert()?;
        self.stage_y(true, None, Some(output))?;
        sync_all(&self.streams)?;

        if self.logic_size[0] > 1 {
            self.stage_x(true, output)?;
            sync_all(&self.streams)?;
        }

        if fft_timing_enabled() {
            println!(
                "[fft timing] forward {:?} -> {:?} took {:.3}s",
                self.data_size,
                self.logic_size,
                t_start.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    // --- inverse -----------------------------------------------------

    /// Inverse transform: frequency-space view into a real-space view.
    ///
    /// The transform runs in place through `input`; its contents are
    /// consumed (undefined afterwards), matching the out-of-place
    /// forward with reused plan scratch.
    pub fn inverse(&mut self, input: &ArrayView, output: &ArrayView) -> Result<()> {
        self.check_freq_view(input, "fft inverse input");
        self.check_data_view(output, "fft inverse output");
        let t_start = Instant::now();

        if self.logic_size[0] > 1 {
            self.stage_x(false, input)?;
            sync_all(&self.streams)?;
        }

        self.stage_y(false, Some(input), None)?;
        sync_all(&self.streams)?;

        self.stage_extract()?;
        self.replay_exchange(&self.inv_exchange, &self.chunk, &self.transp1)?;
        sync_all(&self.streams)?;

        self.stage_transpose_zy()?;
        self.stage_z(false)?;
        sync_all(&self.streams)?;

        self.stage_unpad_out(output)?;
        sync_all(&self.streams)?;

        if fft_timing_enabled() {
            println!(
                "[fft timing] inverse {:?} -> {:?} took {:.3}s",
                self.logic_size,
                self.data_size,
                t_start.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    // --- stages ------------------------------------------------------

    /// Stage 1: copy the unpadded input into the z-padded rows.
    fn stage_pad_in(&self, input: &ArrayView) -> Result<()> {
        let dz = self.data_size[2];
        let lz = self.logic_size[2];
        let rows = self.data_size[0] * self.dy_local();
        for d in 0..self.devices.count() {
            self.devices.set_current(d);
            let (in_buf, in_off, _) = input.part(d);
            let src = in_buf.clone();
            let dst = self.pad_z[d].clone();
            self.streams[d].launch(move || {
                let a = src.lock();
                let mut b = dst.lock();
                for r in 0..rows {
                    let row_in = &a[in_off + r * dz..in_off + (r + 1) * dz];
                    let row_out = &mut b[r * (lz + 2)..(r + 1) * (lz + 2)];
                    row_out[..dz].copy_from_slice(row_in);
                    row_out[dz..].fill(0.0);
                }
            })?;
        }
        Ok(())
    }

    /// Stage 2: device-local batched 1D transforms along z.
    /// Forward: R2C, one-sided output written in place over each row.
    /// Inverse: C2R via Hermitian reconstruction of the full spectrum.
    fn stage_z(&self, fwd: bool) -> Result<()> {
        let lz = self.logic_size[2];
        let fz = self.fz;
        for d in 0..self.devices.count() {
            self.devices.set_current(d);
            let buf = self.pad_z[d].clone();
            let fft = if fwd {
                self.fft_z_fwd.clone()
            } else {
                self.fft_z_inv.clone()
            };
            self.streams[d].launch(move || {
                let mut data = buf.lock();
                data.par_chunks_mut(lz + 2).for_each_init(
                    || vec![Complex::new(0.0f32, 0.0); lz],
                    |scratch, row| {
                        if fwd {
                            for k in 0..lz {
                                scratch[k] = Complex::new(row[k], 0.0);
                            }
                            fft.process(scratch);
                            for k in 0..fz {
                                row[2 * k] = scratch[k].re;
                                row[2 * k + 1] = scratch[k].im;
                            }
                        } else {
                            for k in 0..fz {
                                scratch[k] = Complex::new(row[2 * k], row[2 * k + 1]);
                            }
                            for k in 1..fz - 1 {
                                scratch[lz - k] = scratch[k].conj();
                            }
                            fft.process(scratch);
                            for k in 0..lz {
                                row[k] = scratch[k].re;
                            }
                            row[lz] = 0.0;
                            row[lz + 1] = 0.0;
                        }
                    },
                );
            })?;
        }
        Ok(())
    }

    /// Stage 3: device-local transpose (Dx, Dy/N, Fz) -> (Dx, Fz, Dy/N)
    /// so the exchange moves contiguous z'-row blocks.
    fn stage_transpose_yz(&self) -> Result<()> {
        let dx = self.data_size[0];
        let dy_l = self.dy_local();
        let fz = self.fz;
        for d in 0..self.devices.count() {
            self.devices.set_current(d);
            let src = self.pad_z[d].clone();
            let dst = self.transp1[d].clone();
            self.streams[d].launch(move || {
                let a = src.lock();
                let mut b = dst.lock();
                for x in 0..dx {
                    for y in 0..dy_l {
                        for k in 0..fz {
                            let from = (((x * dy_l) + y) * fz + k) * 2;
                            let to = (((x * fz) + k) * dy_l + y) * 2;
                            b[to] = a[from];
                            b[to + 1] = a[from + 1];
                        }
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Inverse of stage 3.
    fn stage_transpose_zy(&self) -> Result<()> {
        let dx = self.data_size[0];
        let dy_l = self.dy_local();
        let fz = self.fz;
        for d in 0..self.devices.count() {
            self.devices.set_current(d);
            let src = self.transp1[d].clone();
            let dst = self.pad_z[d].clone();
            self.streams[d].launch(move || {
                let a = src.lock();
                let mut b = dst.lock();
                for x in 0..dx {
                    for k in 0..fz {
                        for y in 0..dy_l {
                            let from = (((x * fz) + k) * dy_l + y) * 2;
                            let to = (((x * dy_l) + y) * fz + k) * 2;
                            b[to] = a[from];
                            b[to + 1] = a[from + 1];
                        }
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Stage 4: replay the copy-descriptor table. Each copy is issued on
    /// its source device's stream; the caller barriers afterwards.
    fn replay_exchange(
        &self,
        table: &[CopyDesc],
        src: &[DeviceBuffer],
        dst: &[DeviceBuffer],
    ) -> Result<()> {
        for desc in table {
            let from = src[desc.src_dev].clone();
            let to = dst[desc.dst_dev].clone();
            let (src_off, dst_off, len) = (desc.src_off, desc.dst_off, desc.len);
            self.devices.set_current(desc.src_dev);
            self.streams[desc.src_dev].launch(move || {
                let a = from.lock();
                let mut b = to.lock();
                b[dst_off..dst_off + len].copy_from_slice(&a[src_off..src_off + len]);
            })?;
        }
        Ok(())
    }

    /// Stage 5: assemble the received chunks into the padded layout for
    /// the y transform, zero-filling the padding regions.
    fn stage_insert(&self) -> Result<()> {
        let dx = self.data_size[0];
        let dy_l = self.dy_local();
        let ly = self.logic_size[1];
        let n = self.devices.count();
        let (cz0, cz) = (self.cz0, self.cz);
        for d in 0..n {
            self.devices.set_current(d);
            let rows = if d == n - 1 { cz0 + 1 } else { cz0 };
            let src = self.chunk[d].clone();
            let dst = self.transp2[d].clone();
            self.streams[d].launch(move || {
                let a = src.lock();
                let mut b = dst.lock();
                b.fill(0.0);
                for x in 0..dx {
                    for s in 0..n {
                        for r in 0..rows {
                            let from = ((x * n + s) * cz + r) * dy_l * 2;
                            let to = (((x * cz) + r) * ly + s * dy_l) * 2;
                            b[to..to + dy_l * 2].copy_from_slice(&a[from..from + dy_l * 2]);
                        }
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Inverse of stage 5: pull the owned y-blocks back out of the
    /// padded layout into the per-source chunk buffer.
    fn stage_extract(&self) -> Result<()> {
        let dx = self.data_size[0];
        let dy_l = self.dy_local();
        let ly = self.logic_size[1];
        let n = self.devices.count();
        let (cz0, cz) = (self.cz0, self.cz);
        for d in 0..n {
            self.devices.set_current(d);
            let rows = if d == n - 1 { cz0 + 1 } else { cz0 };
            let src = self.transp2[d].clone();
            let dst = self.chunk[d].clone();
            self.streams[d].launch(move || {
                let a = src.lock();
                let mut b = dst.lock();
                for x in 0..dx {
                    for s in 0..n {
                        for r in 0..rows {
                            let from = (((x * cz) + r) * ly + s * dy_l) * 2;
                            let to = ((x * n + s) * cz + r) * dy_l * 2;
                            b[to..to + dy_l * 2].copy_from_slice(&a[from..from + dy_l * 2]);
                        }
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Stage 6: batched 1D C2C transforms along y.
    /// Forward reads the insertion buffer and writes the output view;
    /// inverse reads the input view and writes the insertion buffer.
    fn stage_y(
        &self,
        fwd: bool,
        input: Option<&ArrayView>,
        output: Option<&ArrayView>,
    ) -> Result<()> {
        let lx = self.logic_size[0];
        let ly = self.logic_size[1];
        let cz = self.cz;
        for d in 0..self.devices.count() {
            self.devices.set_current(d);
            let fft = if fwd {
                self.fft_y_fwd.clone()
            } else {
                self.fft_y_inv.clone()
            };
            let (src, src_off) = match input {
                Some(v) => {
                    let (buf, off, _) = v.part(d);
                    (buf.clone(), off)
                }
                None => (self.transp2[d].clone(), 0),
            };
            let (dst, dst_off) = match output {
                Some(v) => {
                    let (buf, off, _) = v.part(d);
                    (buf.clone(), off)
                }
                None => (self.transp2[d].clone(), 0),
            };
            let rows = lx * cz;
            let same = src.same_arena(&dst);
            self.streams[d].launch(move || {
                if same {
                    let mut b = dst.lock();
                    y_rows(&mut b[dst_off..dst_off + rows * ly * 2], None, ly, &fft);
                } else {
                    let a = src.lock();
                    let mut b = dst.lock();
                    y_rows(
                        &mut b[dst_off..dst_off + rows * ly * 2],
                        Some(&a[src_off..src_off + rows * ly * 2]),
                        ly,
                        &fft,
                    );
                }
            })?;
        }
        Ok(())
    }

    /// Stage 7: strided batched 1D C2C transforms along x, in place on
    /// the frequency view. Skipped entirely for 2D grids (Lx == 1).
    fn stage_x(&self, fwd: bool, view: &ArrayView) -> Result<()> {
        let lx = self.logic_size[0];
        let ly = self.logic_size[1];
        let cz = self.cz;
        let stride = cz * ly; // complex elements between consecutive x
        for d in 0..self.devices.count() {
            self.devices.set_current(d);
            let fft = if fwd {
                self.fft_x_fwd.as_ref().expect("x plan missing").clone()
            } else {
                self.fft_x_inv.as_ref().expect("x plan missing").clone()
            };
            let (buf, off, _) = view.part(d);
            let buf = buf.clone();
            self.streams[d].launch(move || {
                let mut data = buf.lock();
                let mut scratch = vec![Complex::new(0.0f32, 0.0); lx];
                for col in 0..stride {
                    for k in 0..lx {
                        let at = off + (k * stride + col) * 2;
                        scratch[k] = Complex::new(data[at], data[at + 1]);
                    }
                    fft.process(&mut scratch);
                    for k in 0..lx {
                        let at = off + (k * stride + col) * 2;
                        data[at] = scratch[k].re;
                        data[at + 1] = scratch[k].im;
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Inverse stage 1: strip the z padding back off.
    fn stage_unpad_out(&self, output: &ArrayView) -> Result<()> {
        let dz = self.data_size[2];
        let lz = self.logic_size[2];
        let rows = self.data_size[0] * self.dy_local();
        for d in 0..self.devices.count() {
            self.devices.set_current(d);
            let (out_buf, out_off, _) = output.part(d);
            let src = self.pad_z[d].clone();
            let dst = out_buf.clone();
            self.streams[d].launch(move || {
                let a = src.lock();
                let mut b = dst.lock();
                for r in 0..rows {
                    let row_in = &a[r * (lz + 2)..r * (lz + 2) + dz];
                    b[out_off + r * dz..out_off + (r + 1) * dz].copy_from_slice(row_in);
                }
            })?;
        }
        Ok(())
    }
}

/// Run length-`ly` complex row transforms over a packed f32 region,
/// reading either from `src` (out of place) or from `dst` itself.
fn y_rows(dst: &mut [f32], src: Option<&[f32]>, ly: usize, fft: &Arc<dyn Fft<f32>>) {
    dst.par_chunks_mut(ly * 2)
        .enumerate()
        .for_each_init(
            || vec![Complex::new(0.0f32, 0.0); ly],
            |scratch, (r, row_out)| {
                match src {
                    Some(a) => {
                        for j in 0..ly {
                            scratch[j] =
                                Complex::new(a[(r * ly + j) * 2], a[(r * ly + j) * 2 + 1]);
                        }
                    }
                    None => {
                        for j in 0..ly {
                            scratch[j] = Complex::new(row_out[2 * j], row_out[2 * j + 1]);
                        }
                    }
                }
                fft.process(scratch);
                for j in 0..ly {
                    row_out[2 * j] = scratch[j].re;
                    row_out[2 * j + 1] = scratch[j].im;
                }
            },
        );
}
