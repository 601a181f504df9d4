// src/dist_array.rs
//
// 3D vector fields distributed over the device set.
//
// The split axis is Y: device d of N owns the y-slab
// [d*sy/N, (d+1)*sy/N), stored locally x-major with z contiguous, as
// one contiguous arena sliced into ncomp equal sub-ranges:
//
//   device 0: C0[slab 0] C1[slab 0] ... | device 1: C0[slab 1] C1[slab 1] ...
//
// Component boundaries therefore do not align with device boundaries,
// which is why host transfers iterate sub-ranges per component, per
// device, per x-plane.

use std::sync::Arc;

use crate::device::{sync_all, DeviceBuffer, DeviceSet, Stream};
use crate::error::{Error, Result};
use crate::field::HostField;

/// A multi-component 3D field split over the devices of a `DeviceSet`.
pub struct DistributedArray {
    devices: Arc<DeviceSet>,
    ncomp: usize,
    size: [usize; 3],
    parts: Vec<DeviceBuffer>,
    streams: Vec<Stream>,
    freed: bool,
}

impl DistributedArray {
    /// Allocate a zeroed array of `ncomp` components with logical size
    /// `size`, split along Y across all devices of the set.
    pub fn allocate(devices: &Arc<DeviceSet>, ncomp: usize, size: [usize; 3]) -> Result<Self> {
        if ncomp == 0 {
            return Err(Error::Config("component count must be positive".into()));
        }
        if size.iter().any(|&s| s == 0) {
            return Err(Error::Config(format!("degenerate array size {size:?}")));
        }
        let n = devices.count();
        if size[1] % n != 0 {
            return Err(Error::Config(format!(
                "split-axis dimension {} not divisible by device count {n}",
                size[1]
            )));
        }

        let chunk = ncomp * size[0] * (size[1] / n) * size[2];
        let mut parts = Vec::with_capacity(n);
        let mut streams = Vec::with_capacity(n);
        for d in 0..n {
            parts.push(devices.alloc(d, chunk));
            streams.push(devices.new_stream(d));
        }

        Ok(Self {
            devices: devices.clone(),
            ncomp,
            size,
            parts,
            streams,
            freed: false,
        })
    }

    #[inline]
    fn assert_alive(&self) {
        assert!(!self.freed, "use of a freed distributed array");
    }

    pub fn ncomp(&self) -> usize {
        self.ncomp
    }

    pub fn size3(&self) -> [usize; 3] {
        self.size
    }

    /// Elements per component over all devices.
    pub fn len(&self) -> usize {
        self.size[0] * self.size[1] * self.size[2]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows of the y-slab owned by each device.
    fn slab_rows(&self) -> usize {
        self.size[1] / self.devices.count()
    }

    /// Elements per component per device.
    fn comp_chunk(&self) -> usize {
        self.size[0] * self.slab_rows() * self.size[2]
    }

    pub fn device_set(&self) -> &Arc<DeviceSet> {
        &self.devices
    }

    /// Asynchronous per-device memset to zero, then a barrier over all
    /// device streams.
    pub fn zero(&self) -> Result<()> {
        self.assert_alive();
        for (d, part) in self.parts.iter().enumerate() {
            self.devices.set_current(d);
            let buf = part.clone();
            self.streams[d].launch(move || {
                buf.lock().fill(0.0);
            })?;
        }
        sync_all(&self.streams)
    }

    /// Synchronous host -> device upload.
    pub fn copy_from_host(&self, src: &HostField) -> Result<()> {
        self.assert_alive();
        self.check_host_shape(src.ncomp, src.size)?;
        sync_all(&self.streams)?;

        let [sx, sy, sz] = self.size;
        let n = self.devices.count();
        let rows = sy / n;
        let plane = rows * sz;
        for c in 0..self.ncomp {
            let host = src.component(c);
            for (d, part) in self.parts.iter().enumerate() {
                self.devices.set_current(d);
                let mut data = part.lock();
                let base = c * self.comp_chunk();
                for x in 0..sx {
                    let dst = &mut data[base + x * plane..base + (x + 1) * plane];
                    let from = (x * sy + d * rows) * sz;
                    dst.copy_from_slice(&host[from..from + plane]);
                }
            }
        }
        Ok(())
    }

    /// Synchronous device -> host download.
    pub fn copy_to_host(&self, dst: &mut HostField) -> Result<()> {
        self.assert_alive();
        self.check_host_shape(dst.ncomp, dst.size)?;
        sync_all(&self.streams)?;

        let [sx, sy, sz] = self.size;
        let n = self.devices.count();
        let rows = sy / n;
        let plane = rows * sz;
        for c in 0..self.ncomp {
            let host = dst.component_mut(c);
            for (d, part) in self.parts.iter().enumerate() {
                self.devices.set_current(d);
                let data = part.lock();
                let base = c * self.comp_chunk();
                for x in 0..sx {
                    let src_chunk = &data[base + x * plane..base + (x + 1) * plane];
                    let to = (x * sy + d * rows) * sz;
                    host[to..to + plane].copy_from_slice(src_chunk);
                }
            }
        }
        Ok(())
    }

    /// Device-to-device copy of a whole array: one asynchronous copy per
    /// device chunk, then a barrier over the streams of both arrays.
    pub fn copy_from_device(&self, src: &DistributedArray) -> Result<()> {
        self.assert_alive();
        src.assert_alive();
        if self.ncomp != src.ncomp || self.size != src.size {
            return Err(Error::ShapeMismatch {
                expected: (self.ncomp, self.size),
                got: (src.ncomp, src.size),
            });
        }
        assert!(
            Arc::ptr_eq(&self.devices, &src.devices),
            "arrays belong to different device sets"
        );

        for d in 0..self.devices.count() {
            self.devices.set_current(d);
            let from = src.parts[d].clone();
            let to = self.parts[d].clone();
            src.streams[d].launch(move || {
                let a = from.lock();
                let mut b = to.lock();
                b.copy_from_slice(&a);
            })?;
        }
        sync_all(&src.streams)?;
        sync_all(&self.streams)
    }

    /// Release all device arenas and poison the handle. Any further use
    /// is a caller defect and panics.
    pub fn free(&mut self) {
        if self.freed {
            return;
        }
        // Best effort: drain pending work before the arenas go away.
        let _ = sync_all(&self.streams);
        self.parts.clear();
        self.streams.clear();
        self.freed = true;
    }

    /// Debug helper: freshly allocated host copy.
    pub fn local_copy(&self) -> HostField {
        let mut host = HostField::new(self.ncomp, self.size);
        self.copy_to_host(&mut host)
            .expect("local_copy download failed");
        host
    }

    /// View of the whole array.
    pub fn view(&self) -> ArrayView {
        self.assert_alive();
        ArrayView {
            ncomp: self.ncomp,
            size: self.size,
            parts: self
                .parts
                .iter()
                .map(|p| (p.clone(), 0, p.len()))
                .collect(),
        }
    }

    /// View of a single component (a scalar field handle into this
    /// array's storage).
    pub fn component(&self, c: usize) -> ArrayView {
        self.assert_alive();
        assert!(c < self.ncomp, "component {c} out of range");
        let chunk = self.comp_chunk();
        ArrayView {
            ncomp: 1,
            size: self.size,
            parts: self
                .parts
                .iter()
                .map(|p| (p.clone(), c * chunk, chunk))
                .collect(),
        }
    }

    fn check_host_shape(&self, ncomp: usize, size: [usize; 3]) -> Result<()> {
        if ncomp != self.ncomp || size != self.size {
            return Err(Error::ShapeMismatch {
                expected: (self.ncomp, self.size),
                got: (ncomp, size),
            });
        }
        Ok(())
    }
}

/// A borrowed window into a `DistributedArray`: per-device arena plus
/// the sub-range belonging to this view. Cloning is shallow; the view
/// keeps the arenas alive but carries no streams of its own.
#[derive(Clone)]
pub struct ArrayView {
    ncomp: usize,
    size: [usize; 3],
    parts: Vec<(DeviceBuffer, usize, usize)>,
}

impl ArrayView {
    pub fn ncomp(&self) -> usize {
        self.ncomp
    }

    pub fn size3(&self) -> [usize; 3] {
        self.size
    }

    pub fn device_count(&self) -> usize {
        self.parts.len()
    }

    /// Arena, offset and length of this view's slice on device `d`.
    pub fn part(&self, d: usize) -> (&DeviceBuffer, usize, usize) {
        let (buf, off, len) = &self.parts[d];
        (buf, *off, *len)
    }

    /// Narrow a multi-component view to one component.
    pub fn component(&self, c: usize) -> ArrayView {
        assert!(c < self.ncomp, "component {c} out of range");
        let per_comp: Vec<(DeviceBuffer, usize, usize)> = self
            .parts
            .iter()
            .map(|(buf, off, len)| {
                let chunk = len / self.ncomp;
                (buf.clone(), off + c * chunk, chunk)
            })
            .collect();
        ArrayView {
            ncomp: 1,
            size: self.size,
            parts: per_comp,
        }
    }
}
