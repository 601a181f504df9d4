// src/device.rs
//
// Multi-device capability layer. Devices are compute units granted by
// the driver: each one owns its memory arenas and executes work from
// one FIFO command stream. The driver here is simulated in-process
// (arenas are host memory, streams are worker threads), which keeps the
// distributed layout, ordering and synchronization semantics of the
// engine fully exercisable on any machine; the same device may be
// listed more than once to run the multi-device code paths on a single
// unit.
//
// Ordering guarantees: within one stream, jobs execute in issue order;
// across streams, nothing is guaranteed except at explicit sync()
// barriers. A job that panics kills its worker; every later launch or
// sync on that stream reports a device failure, and no retry is
// attempted (stream state is undefined).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};

/// Simulated device count when `FIELDCONV_DEVICES` is not set.
const DEFAULT_DEVICE_COUNT: usize = 8;

/// Number of device ordinals the simulated driver exposes.
///
/// Override with `FIELDCONV_DEVICES=<n>`.
pub fn probe_device_count() -> usize {
    std::env::var("FIELDCONV_DEVICES")
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_DEVICE_COUNT)
}

/// Capability attributes of one device, queried once at set construction.
#[derive(Debug, Clone)]
pub struct DeviceCaps {
    /// Ordinal the attributes were read from.
    pub ordinal: usize,
    /// Concurrent lanes the device executes (simulated: host threads).
    pub max_concurrency: usize,
    /// Arena memory in bytes.
    pub memory_bytes: u64,
}

fn query_caps(ordinal: usize) -> DeviceCaps {
    DeviceCaps {
        ordinal,
        max_concurrency: thread::available_parallelism().map_or(1, |n| n.get()),
        memory_bytes: 4 * 1024 * 1024 * 1024,
    }
}

/// The ordered set of devices participating in a computation.
///
/// Constructed exactly once and passed by reference to every component
/// that needs it (arrays, pipelines, plans) — there is no global device
/// list. Indices into the set (`0..count()`) identify devices
/// everywhere else in this crate; `ordinal(i)` maps back to the
/// driver's numbering.
#[derive(Debug)]
pub struct DeviceSet {
    ordinals: Vec<usize>,
    caps: DeviceCaps,
    peer: Vec<Vec<bool>>,
    current: AtomicUsize,
}

impl DeviceSet {
    /// Validate the device list and build the set.
    ///
    /// Fails with a config error when the list is empty or names an
    /// ordinal the driver does not expose. When more than one distinct
    /// ordinal is listed, bidirectional peer access is enabled for
    /// every ordered pair; the distributed array model cannot work
    /// without it, so a refusal is fatal.
    pub fn new(devices: &[usize]) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::Config("device list is empty".into()));
        }
        let available = probe_device_count();
        for &ord in devices {
            if ord >= available {
                return Err(Error::Config(format!(
                    "invalid device ordinal {ord} (driver exposes {available})"
                )));
            }
        }

        let n = devices.len();
        let caps = query_caps(devices[0]);

        let distinct = devices.iter().any(|&d| d != devices[0]);
        let mut peer = vec![vec![false; n]; n];
        if n > 1 && distinct {
            for i in 0..n {
                for j in 0..n {
                    if i != j {
                        enable_peer_access(devices[i], devices[j])?;
                        peer[i][j] = true;
                    }
                }
            }
        }

        Ok(Self {
            ordinals: devices.to_vec(),
            caps,
            peer,
            current: AtomicUsize::new(0),
        })
    }

    /// Number of devices in the set.
    pub fn count(&self) -> usize {
        self.ordinals.len()
    }

    /// Driver ordinal of device index `i`.
    pub fn ordinal(&self, i: usize) -> usize {
        self.ordinals[i]
    }

    /// Capability attributes (queried from the first listed device).
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Make device `i` current. Switches only when `i` differs from the
    /// currently active device; a no-op otherwise.
    pub fn set_current(&self, i: usize) {
        assert!(i < self.count(), "device index {i} out of range");
        if self.current.load(Ordering::Relaxed) != i {
            self.current.store(i, Ordering::Relaxed);
        }
    }

    /// Index of the currently active device.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// True if device `i` may read/write device `j`'s memory directly.
    pub fn peer_enabled(&self, i: usize, j: usize) -> bool {
        self.peer[i][j]
    }

    /// True if a device-to-device copy from `src` to `dst` is legal:
    /// same device, same underlying ordinal, or peer access enabled.
    pub fn can_copy(&self, src: usize, dst: usize) -> bool {
        src == dst || self.ordinals[src] == self.ordinals[dst] || self.peer[src][dst]
    }

    /// Allocate a zero-initialized arena of `len` f32 elements on
    /// device `i`.
    pub fn alloc(&self, i: usize, len: usize) -> DeviceBuffer {
        assert!(i < self.count(), "device index {i} out of range");
        self.set_current(i);
        DeviceBuffer {
            dev: i,
            len,
            data: Arc::new(Mutex::new(vec![0.0; len])),
        }
    }

    /// Create a command stream bound to device `i`.
    pub fn new_stream(&self, i: usize) -> Stream {
        assert!(i < self.count(), "device index {i} out of range");
        Stream::spawn(i)
    }
}

/// Simulated peer-access enable. The in-process driver always grants it;
/// the signature keeps refusal on the fatal path it must have.
fn enable_peer_access(_from: usize, _to: usize) -> Result<()> {
    Ok(())
}

/// A memory arena on one device.
///
/// Cloning is shallow (shared arena). Jobs lock the arena only for the
/// duration of one operation; within a pipeline stage every copy runs
/// source-to-destination, so lock order never cycles.
#[derive(Clone)]
pub struct DeviceBuffer {
    dev: usize,
    len: usize,
    data: Arc<Mutex<Vec<f32>>>,
}

impl DeviceBuffer {
    /// Device index this arena lives on.
    pub fn device(&self) -> usize {
        self.dev
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lock the arena for one operation.
    pub fn lock(&self) -> MutexGuard<'_, Vec<f32>> {
        self.data.lock().expect("device arena mutex poisoned")
    }

    /// True if both handles refer to the same arena.
    pub fn same_arena(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Sync(Sender<()>),
}

/// FIFO command stream of one device.
///
/// `launch` enqueues work and returns immediately; `sync` blocks the
/// controller until everything issued so far has executed. One worker
/// thread per stream preserves issue order.
pub struct Stream {
    dev: usize,
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    fn spawn(dev: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(format!("fieldconv-dev{dev}"))
            .spawn(move || {
                for job in rx {
                    match job {
                        Job::Run(f) => f(),
                        Job::Sync(ack) => {
                            // Receiver may have given up waiting; nothing to do then.
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .expect("failed to spawn stream worker");
        Self {
            dev,
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Device index this stream issues to.
    pub fn device(&self) -> usize {
        self.dev
    }

    /// Enqueue an operation; returns without waiting for it to run.
    pub fn launch(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .expect("stream used after shutdown");
        tx.send(Job::Run(Box::new(job))).map_err(|_| {
            Error::Device(format!("stream worker for device {} terminated", self.dev))
        })
    }

    /// Block until every previously launched operation has executed.
    pub fn sync(&self) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .expect("stream used after shutdown");
        let (ack_tx, ack_rx) = mpsc::channel();
        tx.send(Job::Sync(ack_tx)).map_err(|_| {
            Error::Device(format!("stream worker for device {} terminated", self.dev))
        })?;
        ack_rx.recv().map_err(|_| {
            Error::Device(format!(
                "stream worker for device {} died before the barrier",
                self.dev
            ))
        })
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            // A worker that died from a panicked job already reported
            // through launch/sync errors; nothing more to surface here.
            let _ = worker.join();
        }
    }
}

/// Barrier over several streams: every stream must drain before any
/// caller-side read of cross-device data.
pub fn sync_all(streams: &[Stream]) -> Result<()> {
    for s in streams {
        s.sync()?;
    }
    Ok(())
}
