// src/plan.rs
//
// Frequency-domain convolution plan: up to 7 input slots (one charge
// density, three dipole components, three curl-source components)
// multiplied against a 7x3 matrix of transformed kernel components and
// accumulated into one 3-component output field.
//
// The plan is built in two phases. A builder collects the requested
// physical effects and their input bindings; build() then loads each
// distinct kernel exactly once, in a fixed order, and returns the
// ready-to-run plan. Kernel loading exploits tensor symmetry: redundant
// lower-triangle entries share the stored upper-triangle spectrum
// (same allocation, sign folded into the scale factor), and components
// that are exactly zero in real space are pruned outright — they cost
// no memory and no multiply-add at update() time.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use serde::Serialize;

use crate::device::{sync_all, DeviceSet, Stream};
use crate::dist_array::{ArrayView, DistributedArray};
use crate::error::{Error, Result};
use crate::fft::FftPipeline;
use crate::field::{is_zero, HostField};
use crate::grid::Grid3D;
use crate::kernels::{
    dipole_kernel, idx_to_ij, monopole_kernel, rotor_kernel, TENSOR_IDX, TENSOR_NAME, XY, ZZ,
};

/// Input slot of the charge/monopole density.
pub const SLOT_CHARGE: usize = 0;
/// First input slot of the dipole (polarization/magnetization) vector.
pub const SLOT_DIPOLE: usize = 1;
/// First input slot of the curl source (current density) vector.
pub const SLOT_CURL: usize = 4;
/// Total number of input slots.
pub const NUM_SLOTS: usize = 7;

/// Ratio above which the discarded spectrum half is no longer
/// negligible; crossing it means the kernel was constructed wrong.
const EXTRACT_RATIO_LIMIT: f32 = 1e-5;

/// Structural redundancy of a rank-2 interaction tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorSymmetry {
    /// Kij independent of Kji.
    None,
    /// Kij == Kji.
    Symmetric,
    /// Kij == -Kji (diagonal identically zero).
    Antisymmetric,
    /// Every off-diagonal entry identically zero.
    Diagonal,
}

/// Which part of a transformed kernel survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Realness {
    /// Spectrum is purely real (even kernel); keep the real half.
    PureReal,
    /// Spectrum is purely imaginary (odd kernel); keep the imag half.
    PureImag,
    /// No structure to exploit; keep the full spectrum.
    FullComplex,
}

/// Classify a full 9-component tensor kernel.
///
/// Off-diagonals all zero classifies as `Diagonal` (this covers the
/// all-zero tensor); otherwise elementwise comparison of Kij with
/// +-Kji decides.
pub fn classify(tensor: &HostField) -> TensorSymmetry {
    assert!(tensor.ncomp == 9, "classify needs a full 9-component tensor");
    let mut diagonal = true;
    let mut symm = true;
    let mut asymm = true;
    for i in 0..3 {
        for j in 0..3 {
            if i == j {
                continue;
            }
            let a = tensor.component(TENSOR_IDX[i][j]);
            let b = tensor.component(TENSOR_IDX[j][i]);
            for (&x, &y) in a.iter().zip(b.iter()) {
                if x != 0.0 {
                    diagonal = false;
                }
                if x != y {
                    symm = false;
                }
                if x != -y {
                    asymm = false;
                }
            }
        }
    }
    if diagonal {
        TensorSymmetry::Diagonal
    } else if symm {
        TensorSymmetry::Symmetric
    } else if asymm {
        TensorSymmetry::Antisymmetric
    } else {
        TensorSymmetry::None
    }
}

/// Does `tensor` satisfy the redundancy the tag promises?
fn satisfies(tensor: &HostField, tag: TensorSymmetry) -> bool {
    if tensor.ncomp < 9 {
        // Compact storage (3 or 6 components) cannot contradict its tag.
        return true;
    }
    match tag {
        TensorSymmetry::None => true,
        TensorSymmetry::Diagonal => classify(tensor) == TensorSymmetry::Diagonal,
        TensorSymmetry::Symmetric => matches!(
            classify(tensor),
            TensorSymmetry::Symmetric | TensorSymmetry::Diagonal
        ),
        TensorSymmetry::Antisymmetric => {
            let c = classify(tensor);
            c == TensorSymmetry::Antisymmetric
                || (c == TensorSymmetry::Diagonal
                    && (0..3).all(|k| is_zero(tensor.component(k))))
        }
    }
}

/// One retained frequency-space kernel component. Aliased tensor
/// entries clone this (the `Arc` target is shared, never copied).
#[derive(Clone)]
pub struct KernelSlot {
    values: Arc<DistributedArray>,
    scale: Complex<f32>,
    full: bool,
}

impl KernelSlot {
    pub fn values(&self) -> &Arc<DistributedArray> {
        &self.values
    }

    pub fn scale(&self) -> Complex<f32> {
        self.scale
    }

    /// True when the full complex spectrum is stored rather than one half.
    pub fn is_full_complex(&self) -> bool {
        self.full
    }
}

struct CustomKernel {
    pos: usize,
    kernel: HostField,
    symmetry: TensorSymmetry,
    realness: Realness,
    inputs: Vec<ArrayView>,
    multiplier: f64,
}

/// Configuration phase of a convolution plan: collect effects, then
/// `build()` once.
pub struct ConvolutionPlanBuilder {
    devices: Arc<DeviceSet>,
    grid: Grid3D,
    periodic: [usize; 3],
    logic: [usize; 3],
    accuracy: f64,
    charge: Option<(ArrayView, f64)>,
    dipole: Option<(ArrayView, f64)>,
    curl: Option<(ArrayView, f64)>,
    custom: Vec<CustomKernel>,
}

impl ConvolutionPlanBuilder {
    pub fn new(devices: &Arc<DeviceSet>, grid: Grid3D, periodic: [usize; 3]) -> Self {
        let logic = grid.padded_size(periodic);
        Self {
            devices: devices.clone(),
            grid,
            periodic,
            logic,
            accuracy: 8.0,
            charge: None,
            dipole: None,
            curl: None,
            custom: Vec::new(),
        }
    }

    /// Integration point density for the dipole kernel tabulation.
    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    /// Field of a charge density: binds `rho` (scalar) at slot 0 with
    /// the given multiplier (e.g. 1/epsilon0). Re-registration replaces
    /// the previous binding.
    pub fn with_charge(mut self, rho: ArrayView, multiplier: f64) -> Self {
        self.charge = Some((rho, multiplier));
        self
    }

    /// Field of a dipole density: binds the 3-component `m` at slots
    /// 1..=3 (e.g. multiplier mu0 * Msat for magnetization).
    pub fn with_dipole(mut self, m: ArrayView, multiplier: f64) -> Self {
        self.dipole = Some((m, multiplier));
        self
    }

    /// Field of a curl source: binds the 3-component `j` at slots 4..=6.
    pub fn with_curl(mut self, j: ArrayView, multiplier: f64) -> Self {
        self.curl = Some((j, multiplier));
        self
    }

    /// Caller-supplied kernel at input-slot position `pos`. Diagonal
    /// kernels bind one scalar input; tensor kernels bind three.
    pub fn with_kernel(
        mut self,
        pos: usize,
        kernel: HostField,
        symmetry: TensorSymmetry,
        realness: Realness,
        inputs: Vec<ArrayView>,
        multiplier: f64,
    ) -> Self {
        self.custom.push(CustomKernel {
            pos,
            kernel,
            symmetry,
            realness,
            inputs,
            multiplier,
        });
        self
    }

    /// Load every requested kernel (each exactly once, fixed order:
    /// charge, dipole, curl, customs in registration order), bind the
    /// output, and return the runnable plan.
    pub fn build(self, output: &DistributedArray) -> Result<ConvolutionPlan> {
        let data_size = self.grid.size();
        if output.ncomp() != 3 || output.size3() != data_size {
            return Err(Error::ShapeMismatch {
                expected: (3, data_size),
                got: (output.ncomp(), output.size3()),
            });
        }

        let fft = FftPipeline::new(&self.devices, data_size, self.logic)?;
        let fft_buffer = DistributedArray::allocate(&self.devices, 1, fft.freq_size())?;
        let fft_out = DistributedArray::allocate(&self.devices, 3, fft.freq_size())?;
        let streams: Vec<Stream> = (0..self.devices.count())
            .map(|d| self.devices.new_stream(d))
            .collect();

        let mut plan = ConvolutionPlan {
            devices: self.devices.clone(),
            data_size,
            logic_size: self.logic,
            fft,
            kern: Default::default(),
            inputs: Default::default(),
            in_mul: [0.0; NUM_SLOTS],
            out: output.view(),
            fft_buffer,
            fft_out,
            streams,
        };

        // One full-grid (unpadded) pipeline transforms every kernel
        // component; it only lives for the duration of the build.
        let mut full_fft = FftPipeline::new(&self.devices, self.logic, self.logic)?;

        if let Some((rho, mul)) = self.charge {
            plan.bind_input(SLOT_CHARGE, scalar_view(&rho, data_size)?, mul)?;
            println!("[plan] loading monopole kernel on {:?}", self.logic);
            let kern = monopole_kernel(&self.grid, self.logic, self.periodic);
            plan.load_kernel(
                &mut full_fft,
                &kern,
                SLOT_CHARGE,
                TensorSymmetry::Diagonal,
                Realness::PureImag,
            )?;
        }
        if let Some((m, mul)) = self.dipole {
            for c in 0..3 {
                plan.bind_input(SLOT_DIPOLE + c, vector_comp(&m, c, data_size)?, mul)?;
            }
            println!(
                "[plan] loading dipole kernel on {:?} (accuracy {})",
                self.logic, self.accuracy
            );
            let kern = dipole_kernel(&self.grid, self.logic, self.accuracy, self.periodic);
            plan.load_kernel(
                &mut full_fft,
                &kern,
                SLOT_DIPOLE,
                TensorSymmetry::Symmetric,
                Realness::PureReal,
            )?;
        }
        if let Some((j, mul)) = self.curl {
            for c in 0..3 {
                plan.bind_input(SLOT_CURL + c, vector_comp(&j, c, data_size)?, mul)?;
            }
            println!("[plan] loading rotor kernel on {:?}", self.logic);
            let kern = rotor_kernel(&self.grid, self.logic, self.periodic);
            plan.load_kernel(
                &mut full_fft,
                &kern,
                SLOT_CURL,
                TensorSymmetry::Antisymmetric,
                Realness::PureImag,
            )?;
        }
        for custom in self.custom {
            // A diagonal (vector) kernel feeds all three output
            // components from one input slot; tensor kernels bind three.
            let arity = if custom.symmetry == TensorSymmetry::Diagonal {
                1
            } else {
                3
            };
            if custom.inputs.len() != arity {
                return Err(Error::Config(format!(
                    "custom kernel at slot {} needs {arity} input binding(s), got {}",
                    custom.pos,
                    custom.inputs.len()
                )));
            }
            if custom.pos + arity > NUM_SLOTS {
                return Err(Error::Config(format!(
                    "custom kernel at slot {} overruns the {NUM_SLOTS} input slots",
                    custom.pos
                )));
            }
            for (c, input) in custom.inputs.into_iter().enumerate() {
                plan.bind_input(custom.pos + c, scalar_view(&input, data_size)?, custom.multiplier)?;
            }
            plan.load_kernel(
                &mut full_fft,
                &custom.kernel,
                custom.pos,
                custom.symmetry,
                custom.realness,
            )?;
        }

        Ok(plan)
    }
}

fn scalar_view(v: &ArrayView, data_size: [usize; 3]) -> Result<ArrayView> {
    if v.ncomp() != 1 || v.size3() != data_size {
        return Err(Error::ShapeMismatch {
            expected: (1, data_size),
            got: (v.ncomp(), v.size3()),
        });
    }
    Ok(v.clone())
}

fn vector_comp(v: &ArrayView, c: usize, data_size: [usize; 3]) -> Result<ArrayView> {
    if v.ncomp() != 3 || v.size3() != data_size {
        return Err(Error::ShapeMismatch {
            expected: (3, data_size),
            got: (v.ncomp(), v.size3()),
        });
    }
    Ok(v.component(c))
}

/// A built convolution plan. `update()` recomputes the output field
/// from the currently bound inputs; not safe for concurrent use (it
/// owns its scratch buffers, hence `&mut self`).
pub struct ConvolutionPlan {
    devices: Arc<DeviceSet>,
    data_size: [usize; 3],
    logic_size: [usize; 3],
    fft: FftPipeline,
    kern: [[Option<KernelSlot>; 3]; NUM_SLOTS],
    inputs: [Option<ArrayView>; NUM_SLOTS],
    in_mul: [f64; NUM_SLOTS],
    out: ArrayView,
    fft_buffer: DistributedArray,
    fft_out: DistributedArray,
    streams: Vec<Stream>,
}

impl ConvolutionPlan {
    fn bind_input(&mut self, slot: usize, view: ArrayView, multiplier: f64) -> Result<()> {
        if self.inputs[slot].is_some() {
            return Err(Error::Config(format!("input slot {slot} bound twice")));
        }
        self.inputs[slot] = Some(view);
        self.in_mul[slot] = multiplier;
        Ok(())
    }

    /// Load one (possibly tensor) kernel into the slot rows starting at
    /// `pos`, transforming each retained component through `full_fft`.
    fn load_kernel(
        &mut self,
        full_fft: &mut FftPipeline,
        kernel: &HostField,
        pos: usize,
        symmetry: TensorSymmetry,
        realness: Realness,
    ) -> Result<()> {
        if kernel.size != self.logic_size {
            return Err(Error::ShapeMismatch {
                expected: (kernel.ncomp, self.logic_size),
                got: (kernel.ncomp, kernel.size),
            });
        }
        let comp_ok = match symmetry {
            TensorSymmetry::Diagonal => kernel.ncomp == 3,
            TensorSymmetry::Symmetric | TensorSymmetry::Antisymmetric => {
                kernel.ncomp == 6 || kernel.ncomp == 9
            }
            TensorSymmetry::None => kernel.ncomp == 9,
        };
        if !comp_ok {
            return Err(Error::Config(format!(
                "kernel with {} components cannot carry {symmetry:?} symmetry",
                kernel.ncomp
            )));
        }
        if !satisfies(kernel, symmetry) {
            return Err(Error::Config(format!(
                "kernel does not satisfy declared {symmetry:?} symmetry"
            )));
        }

        let scale = match realness {
            Realness::PureReal | Realness::FullComplex => Complex::new(1.0, 0.0),
            Realness::PureImag => Complex::new(0.0, 1.0),
        };

        let mut dev_in = DistributedArray::allocate(&self.devices, 1, self.logic_size)?;
        let mut dev_out = DistributedArray::allocate(&self.devices, 1, full_fft.freq_size())?;
        let mut comp_host = HostField::new(1, self.logic_size);

        for k in 0..9 {
            let (mut i, j) = idx_to_ij(k);

            // A diagonal kernel has no off-diagonal entries at all, and
            // its three entries live in one slot row.
            if symmetry == TensorSymmetry::Diagonal {
                if k > ZZ {
                    break;
                }
                i = 0;
            }

            if self.kern[pos + i][j].is_some() {
                return Err(Error::NumericalInvariant(format!(
                    "kernel slot ({}, {}) populated twice",
                    pos + i,
                    j
                )));
            }

            // Sparsity pruning: all-zero components are never stored.
            if k < kernel.ncomp && is_zero(kernel.component(k)) {
                println!("[plan] kernel component {} == 0, pruned", TENSOR_NAME[k]);
                continue;
            }

            // Redundant lower triangle: share the stored entry, folding
            // the sign into the scale for antisymmetric kernels.
            if k > XY {
                match symmetry {
                    TensorSymmetry::Symmetric => {
                        let src = self.kern[pos + j][i].clone();
                        self.kern[pos + i][j] = src;
                        continue;
                    }
                    TensorSymmetry::Antisymmetric => {
                        let src = self.kern[pos + j][i].clone().map(|ks| KernelSlot {
                            values: ks.values,
                            scale: -ks.scale,
                            full: ks.full,
                        });
                        self.kern[pos + i][j] = src;
                        continue;
                    }
                    _ => {}
                }
            }

            if k >= kernel.ncomp {
                return Err(Error::Config(format!(
                    "kernel is missing component {}",
                    TENSOR_NAME[k]
                )));
            }

            // Transform this component on the full logical grid.
            comp_host
                .component_mut(0)
                .copy_from_slice(kernel.component(k));
            dev_in.copy_from_host(&comp_host)?;
            full_fft.forward(&dev_in.view(), &dev_out.view())?;
            let freq_host = dev_out.local_copy();

            let kept = extract(&freq_host, realness, self.fft.normalization() as f64)?;
            let store = DistributedArray::allocate(&self.devices, 1, kept.size)?;
            store.copy_from_host(&kept)?;
            self.kern[pos + i][j] = Some(KernelSlot {
                values: Arc::new(store),
                scale,
                full: realness == Realness::FullComplex,
            });
        }

        dev_in.free();
        dev_out.free();
        Ok(())
    }

    pub fn data_size(&self) -> [usize; 3] {
        self.data_size
    }

    pub fn logic_size(&self) -> [usize; 3] {
        self.logic_size
    }

    /// Scale accumulated by one forward+inverse pass of the pipeline.
    pub fn normalization(&self) -> usize {
        self.fft.normalization()
    }

    /// Retained kernel component feeding output component `comp` from
    /// input slot `slot`, if any survived pruning.
    pub fn kernel_slot(&self, slot: usize, comp: usize) -> Option<&KernelSlot> {
        self.kern[slot][comp].as_ref()
    }

    /// Adjust the scalar multiplier of one input slot between updates.
    pub fn set_multiplier(&mut self, slot: usize, multiplier: f64) {
        assert!(slot < NUM_SLOTS, "input slot {slot} out of range");
        self.in_mul[slot] = multiplier;
    }

    /// Recompute the output field: zero the frequency accumulator,
    /// forward-transform every bound input once, multiply-accumulate
    /// against its kernel row, inverse-transform per output component.
    pub fn update(&mut self) -> Result<()> {
        self.fft_out.zero()?;

        for slot in 0..NUM_SLOTS {
            let Some(input) = self.inputs[slot].clone() else {
                continue;
            };
            // A slot whose whole kernel row was pruned contributes
            // nothing; skip its transform outright.
            if self.kern[slot].iter().all(Option::is_none) {
                continue;
            }
            self.fft.forward(&input, &self.fft_buffer.view())?;
            for comp in 0..3 {
                let Some(ks) = self.kern[slot][comp].clone() else {
                    continue;
                };
                let mul = Complex::new(self.in_mul[slot] as f32, 0.0) * ks.scale;
                self.multiply_accumulate(comp, &ks, mul)?;
            }
        }

        for comp in 0..3 {
            self.fft
                .inverse(&self.fft_out.component(comp), &self.out.component(comp))?;
        }
        Ok(())
    }

    /// accum[comp] += mul * kernel * transformed-input, pointwise over
    /// every device chunk. Synchronous: the transform buffer is reused
    /// by the next slot as soon as this returns.
    fn multiply_accumulate(
        &self,
        comp: usize,
        ks: &KernelSlot,
        mul: Complex<f32>,
    ) -> Result<()> {
        let acc_view = self.fft_out.component(comp);
        let in_view = self.fft_buffer.view();
        let kern_view = ks.values.view();
        let full = ks.full;

        for d in 0..self.devices.count() {
            self.devices.set_current(d);
            let (acc_buf, acc_off, acc_len) = acc_view.part(d);
            let (in_buf, in_off, _) = in_view.part(d);
            let (k_buf, k_off, _) = kern_view.part(d);
            let (acc_buf, in_buf, k_buf) = (acc_buf.clone(), in_buf.clone(), k_buf.clone());
            self.streams[d].launch(move || {
                let input = in_buf.lock();
                let kern = k_buf.lock();
                let mut acc = acc_buf.lock();
                let bins = acc_len / 2;
                for b in 0..bins {
                    let c_in =
                        Complex::new(input[in_off + 2 * b], input[in_off + 2 * b + 1]);
                    let t = if full {
                        let c_k =
                            Complex::new(kern[k_off + 2 * b], kern[k_off + 2 * b + 1]);
                        mul * c_k * c_in
                    } else {
                        mul * kern[k_off + b] * c_in
                    };
                    acc[acc_off + 2 * b] += t.re;
                    acc[acc_off + 2 * b + 1] += t.im;
                }
            })?;
        }
        sync_all(&self.streams)
    }

    /// Serializable summary of the built plan.
    pub fn report(&self) -> PlanReport {
        let mut slots = Vec::new();
        for s in 0..NUM_SLOTS {
            for c in 0..3 {
                if let Some(ks) = &self.kern[s][c] {
                    slots.push(KernelSlotReport {
                        input_slot: s,
                        output_comp: c,
                        scale: [ks.scale.re, ks.scale.im],
                        full_complex: ks.full,
                        input_bound: self.inputs[s].is_some(),
                    });
                }
            }
        }
        PlanReport {
            data_size: self.data_size,
            logic_size: self.logic_size,
            devices: self.devices.count(),
            normalization: self.normalization(),
            slots,
        }
    }
}

/// Extract the surviving part of a transformed kernel and undo the
/// unnormalized-transform scaling.
///
/// For half extractions the discarded part must be negligible next to
/// the kept part; a ratio above 1e-5 means the kernel construction is
/// defective and is reported as an invariant violation, not tolerated.
fn extract(freq: &HostField, realness: Realness, norm: f64) -> Result<HostField> {
    let inv_norm = 1.0 / norm;
    if realness == Realness::FullComplex {
        let mut out = HostField::new(1, freq.size);
        for (dst, src) in out
            .component_mut(0)
            .iter_mut()
            .zip(freq.component(0).iter())
        {
            *dst = (*src as f64 * inv_norm) as f32;
        }
        return Ok(out);
    }

    let keep = match realness {
        Realness::PureReal => 0,
        Realness::PureImag => 1,
        Realness::FullComplex => unreachable!(),
    };
    let half_size = [freq.size[0], freq.size[1], freq.size[2] / 2];
    let mut out = HostField::new(1, half_size);
    let src = freq.component(0);
    let dst = out.component_mut(0);

    let mut max_good = 0.0f32;
    let mut max_bad = 0.0f32;
    for b in 0..dst.len() {
        let good = src[2 * b + keep];
        let bad = src[2 * b + 1 - keep];
        if good.abs() > max_good {
            max_good = good.abs();
        }
        if bad.abs() > max_bad {
            max_bad = bad.abs();
        }
        dst[b] = (good as f64 * inv_norm) as f32;
    }
    if max_bad > EXTRACT_RATIO_LIMIT * max_good {
        return Err(Error::NumericalInvariant(format!(
            "discarded spectrum half not negligible: max |bad| = {max_bad:e}, max |good| = {max_good:e}"
        )));
    }
    Ok(out)
}

/// Serializable plan summary, written next to run output for
/// provenance.
#[derive(Serialize)]
pub struct PlanReport {
    pub data_size: [usize; 3],
    pub logic_size: [usize; 3],
    pub devices: usize,
    pub normalization: usize,
    pub slots: Vec<KernelSlotReport>,
}

#[derive(Serialize)]
pub struct KernelSlotReport {
    pub input_slot: usize,
    pub output_comp: usize,
    pub scale: [f32; 2],
    pub full_complex: bool,
    pub input_bound: bool,
}

impl PlanReport {
    pub fn write_to_dir(&self, out_dir: &Path) -> std::io::Result<()> {
        let path = out_dir.join("convolution_plan.json");
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(values: [f32; 9]) -> HostField {
        let mut t = HostField::new(9, [1, 1, 2]);
        for (c, v) in values.into_iter().enumerate() {
            t.component_mut(c).fill(v);
        }
        t
    }

    #[test]
    fn classify_all_zero_is_diagonal_eligible() {
        let t = tensor([0.0; 9]);
        assert_eq!(classify(&t), TensorSymmetry::Diagonal);
    }

    #[test]
    fn classify_diagonal_tensor() {
        // Nonzero diagonal, zero off-diagonals.
        let t = tensor([1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(classify(&t), TensorSymmetry::Diagonal);
    }

    #[test]
    fn classify_symmetric_tensor() {
        // K_yz = K_zy etc.
        let t = tensor([1.0, 1.0, 1.0, 0.5, 0.25, 0.75, 0.5, 0.25, 0.75]);
        assert_eq!(classify(&t), TensorSymmetry::Symmetric);
    }

    #[test]
    fn classify_antisymmetric_tensor() {
        let t = tensor([0.0, 0.0, 0.0, 0.5, -0.25, 0.75, -0.5, 0.25, -0.75]);
        assert_eq!(classify(&t), TensorSymmetry::Antisymmetric);
    }

    #[test]
    fn classify_generic_tensor_is_none() {
        let t = tensor([1.0, 1.0, 1.0, 0.5, 0.0, 0.0, 0.4, 0.0, 0.0]);
        assert_eq!(classify(&t), TensorSymmetry::None);
    }

    #[test]
    fn satisfies_rejects_wrong_tag() {
        let t = tensor([1.0, 1.0, 1.0, 0.5, 0.0, 0.0, 0.4, 0.0, 0.0]);
        assert!(!satisfies(&t, TensorSymmetry::Symmetric));
        assert!(!satisfies(&t, TensorSymmetry::Antisymmetric));
        assert!(satisfies(&t, TensorSymmetry::None));
    }

    #[test]
    fn extract_keeps_the_requested_half() {
        // Interleaved (re, im) pairs with negligible imaginary parts.
        let mut freq = HostField::new(1, [1, 1, 4]);
        freq.component_mut(0).copy_from_slice(&[2.0, 1e-7, 4.0, -1e-7]);
        let kept = extract(&freq, Realness::PureReal, 2.0).unwrap();
        assert_eq!(kept.size, [1, 1, 2]);
        assert_eq!(kept.component(0), &[1.0, 2.0]);
    }

    #[test]
    fn extract_flags_non_negligible_discard() {
        let mut freq = HostField::new(1, [1, 1, 4]);
        freq.component_mut(0).copy_from_slice(&[2.0, 0.5, 4.0, 0.0]);
        assert!(matches!(
            extract(&freq, Realness::PureReal, 1.0),
            Err(Error::NumericalInvariant(_))
        ));
    }

    #[test]
    fn extract_full_complex_only_rescales() {
        let mut freq = HostField::new(1, [1, 1, 4]);
        freq.component_mut(0).copy_from_slice(&[2.0, 1.0, -4.0, 3.0]);
        let kept = extract(&freq, Realness::FullComplex, 2.0).unwrap();
        assert_eq!(kept.size, [1, 1, 4]);
        assert_eq!(kept.component(0), &[1.0, 0.5, -2.0, 1.5]);
    }
}
