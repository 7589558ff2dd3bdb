// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process device binding.
//!
//! Device memory is a host allocation behind a lock, and every queue is a
//! dedicated worker thread that drains its operations in submission order.
//! Operations wait for their wait-list events before running, so the only
//! ordering between two queues is the one expressed through events, as on a
//! real accelerator.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::mpsc;

use super::{Device, DeviceEvent, DeviceStorage, HostStorage, PackArgs, decode_indices};
use crate::error::{HaloError, Result};
use crate::kernels::{KernelKey, KernelSource};

pub(crate) type Work = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// In-process device.
#[derive(Debug, Default)]
pub struct HostDevice {
    compilations: AtomicUsize,
    launches: AtomicUsize,
    next_queue_id: AtomicUsize,
}

impl HostDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of kernels compiled by this device so far.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    /// Number of gather kernels dispatched so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }
}

/// Simulated device memory.
#[derive(Debug)]
pub struct HostDeviceBuffer {
    data: RwLock<Vec<u8>>,
}

impl HostDeviceBuffer {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }
}

impl DeviceStorage for HostDeviceBuffer {
    fn size(&self) -> usize {
        self.data.read().len()
    }
}

/// Host mirror used as the network staging area.
#[derive(Debug)]
pub struct HostMirror {
    data: Mutex<Vec<u8>>,
}

impl HostStorage for HostMirror {
    fn size(&self) -> usize {
        self.data.lock().len()
    }

    fn read_into(&self, dst: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        check_len(data.len(), dst.len())?;
        dst.copy_from_slice(&data);
        Ok(())
    }

    fn write_from(&self, src: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        check_len(data.len(), src.len())?;
        data.copy_from_slice(src);
        Ok(())
    }
}

fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(HaloError::SizeMismatch { expected, actual });
    }
    Ok(())
}

/// A "compiled" gather kernel.
///
/// The rendered source is kept for inspection; execution is a native gather
/// specialized on the element width of the kernel key.
#[derive(Debug)]
pub struct HostKernel {
    key: KernelKey,
    entry: String,
    source: String,
}

impl HostKernel {
    pub fn key(&self) -> KernelKey {
        self.key
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone)]
enum EventStatus {
    Pending,
    Ready,
    Poisoned(Arc<str>),
}

#[derive(Debug)]
struct EventSlot {
    status: Mutex<EventStatus>,
    cv: Condvar,
}

/// Completion event of an operation queued on a [`HostQueue`].
#[derive(Debug, Clone)]
pub struct HostEvent {
    slot: Arc<EventSlot>,
}

impl HostEvent {
    fn pending() -> Self {
        Self {
            slot: Arc::new(EventSlot {
                status: Mutex::new(EventStatus::Pending),
                cv: Condvar::new(),
            }),
        }
    }

    fn complete(&self, status: EventStatus) {
        *self.slot.status.lock() = status;
        self.slot.cv.notify_all();
    }

    fn wait_status(&self) -> EventStatus {
        let mut status = self.slot.status.lock();
        while matches!(*status, EventStatus::Pending) {
            self.slot.cv.wait(&mut status);
        }
        status.clone()
    }
}

impl DeviceEvent for HostEvent {
    fn is_complete(&self) -> Result<bool> {
        match &*self.slot.status.lock() {
            EventStatus::Pending => Ok(false),
            EventStatus::Ready => Ok(true),
            EventStatus::Poisoned(reason) => Err(HaloError::Device(reason.to_string())),
        }
    }

    fn synchronize(&self) -> Result<()> {
        match self.wait_status() {
            EventStatus::Poisoned(reason) => Err(HaloError::Device(reason.to_string())),
            _ => Ok(()),
        }
    }
}

struct QueueOp {
    label: &'static str,
    wait_for: Vec<HostEvent>,
    work: Work,
    done: HostEvent,
}

/// In-order queue backed by a worker thread.
pub struct HostQueue {
    id: usize,
    tx: Option<mpsc::UnboundedSender<QueueOp>>,
    worker: Option<JoinHandle<()>>,
}

impl HostQueue {
    fn spawn(id: usize) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<QueueOp>();
        let worker = std::thread::Builder::new()
            .name(format!("halo-queue-{id}"))
            .spawn(move || Self::drain(id, rx))
            .map_err(HaloError::device)?;

        Ok(Self {
            id,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    fn drain(id: usize, mut rx: mpsc::UnboundedReceiver<QueueOp>) {
        while let Some(op) = rx.blocking_recv() {
            let upstream = op.wait_for.iter().find_map(|event| match event.wait_status() {
                EventStatus::Poisoned(reason) => Some(reason),
                _ => None,
            });

            let status = match upstream {
                Some(reason) => {
                    tracing::warn!(queue = id, op = op.label, %reason, "dependency failed, skipping");
                    EventStatus::Poisoned(format!("dependency failed: {reason}").into())
                }
                None => match (op.work)() {
                    Ok(()) => EventStatus::Ready,
                    Err(e) => {
                        tracing::error!(queue = id, op = op.label, error = %e, "queued operation failed");
                        EventStatus::Poisoned(e.to_string().into())
                    }
                },
            };
            op.done.complete(status);
        }
        tracing::trace!(queue = id, "queue worker exiting");
    }

    pub(crate) fn submit(
        &self,
        label: &'static str,
        wait_for: &[HostEvent],
        work: Work,
    ) -> Result<HostEvent> {
        let done = HostEvent::pending();
        let op = QueueOp {
            label,
            wait_for: wait_for.to_vec(),
            work,
            done: done.clone(),
        };
        self.tx
            .as_ref()
            .ok_or_else(|| HaloError::Device(format!("queue {} is shut down", self.id)))?
            .send(op)
            .map_err(|_| HaloError::Device(format!("queue {} worker exited", self.id)))?;
        Ok(done)
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish what is queued and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(queue = self.id, "queue worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for HostQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostQueue").field("id", &self.id).finish()
    }
}

// Copies stage through a temporary so that no two buffer locks are ever held at
// once; pack and unpack copies on the same matrix lock in opposite directions.
fn read_prefix(data: &[u8], bytes: usize) -> Result<Vec<u8>> {
    data.get(..bytes)
        .map(<[u8]>::to_vec)
        .ok_or(HaloError::SizeMismatch {
            expected: data.len(),
            actual: bytes,
        })
}

fn write_prefix(data: &mut [u8], src: &[u8]) -> Result<()> {
    let len = data.len();
    data.get_mut(..src.len())
        .ok_or(HaloError::SizeMismatch {
            expected: len,
            actual: src.len(),
        })?
        .copy_from_slice(src);
    Ok(())
}

fn finish(event: HostEvent, blocking: bool) -> Result<HostEvent> {
    if blocking {
        event.synchronize()?;
    }
    Ok(event)
}

impl Device for HostDevice {
    type Buffer = HostDeviceBuffer;
    type HostBuffer = HostMirror;
    type Queue = HostQueue;
    type Event = HostEvent;
    type Kernel = HostKernel;

    fn name(&self) -> &'static str {
        "host"
    }

    fn alloc(&self, bytes: usize) -> Result<Arc<HostDeviceBuffer>> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|e| HaloError::Allocation {
                location: "device",
                bytes,
                reason: e.to_string(),
            })?;
        data.resize(bytes, 0);
        Ok(Arc::new(HostDeviceBuffer::new(data)))
    }

    fn alloc_host(&self, bytes: usize) -> Result<Arc<HostMirror>> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|e| HaloError::Allocation {
                location: "host",
                bytes,
                reason: e.to_string(),
            })?;
        data.resize(bytes, 0);
        Ok(Arc::new(HostMirror {
            data: Mutex::new(data),
        }))
    }

    fn upload(&self, data: &[u8]) -> Result<Arc<HostDeviceBuffer>> {
        let buffer = self.alloc(data.len())?;
        buffer.data.write().copy_from_slice(data);
        Ok(buffer)
    }

    fn download(&self, src: &HostDeviceBuffer, dst: &mut [u8]) -> Result<()> {
        let data = src.data.read();
        if dst.len() > data.len() {
            return Err(HaloError::SizeMismatch {
                expected: data.len(),
                actual: dst.len(),
            });
        }
        dst.copy_from_slice(&data[..dst.len()]);
        Ok(())
    }

    fn create_queue(&self) -> Result<HostQueue> {
        HostQueue::spawn(self.next_queue_id.fetch_add(1, Ordering::Relaxed))
    }

    fn compile(&self, source: &KernelSource) -> Result<HostKernel> {
        let signature = format!("void {}(", source.entry);
        if !source.code.contains(&signature) {
            return Err(HaloError::KernelBuild {
                name: source.entry.clone(),
                reason: "entry point not found in rendered source".into(),
            });
        }

        self.compilations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(entry = %source.entry, key = ?source.key, "compiled host kernel");

        Ok(HostKernel {
            key: source.key,
            entry: source.entry.clone(),
            source: source.code.clone(),
        })
    }

    fn launch_pack(
        &self,
        kernel: &HostKernel,
        queue: &HostQueue,
        args: &PackArgs<'_, Self>,
    ) -> Result<HostEvent> {
        if kernel.key.dtype != args.dtype {
            return Err(HaloError::ElementTypeMismatch {
                expected: kernel.key.dtype,
                actual: args.dtype,
            });
        }

        let job = GatherJob {
            count: args.count,
            rows: args.rows,
            cols: args.cols,
            width: kernel.key.dtype.size(),
            base: args.base.clone(),
            offsets: args.offsets.clone(),
            col_strides: args.col_strides.clone(),
            row_strides: args.row_strides.clone(),
            dst: args.dst.clone(),
        };

        self.launches.fetch_add(1, Ordering::Relaxed);
        queue.submit("gather", &[], Box::new(move || job.run()))
    }

    fn copy_to_host(
        &self,
        queue: &HostQueue,
        src: &Arc<HostDeviceBuffer>,
        dst: &Arc<HostMirror>,
        bytes: usize,
        blocking: bool,
        wait_for: &[HostEvent],
    ) -> Result<HostEvent> {
        let (src, dst) = (src.clone(), dst.clone());
        let event = queue.submit(
            "copy_d2h",
            wait_for,
            Box::new(move || {
                let staged = read_prefix(&src.data.read(), bytes)?;
                write_prefix(&mut dst.data.lock(), &staged)
            }),
        )?;
        finish(event, blocking)
    }

    fn copy_to_device(
        &self,
        queue: &HostQueue,
        src: &Arc<HostMirror>,
        dst: &Arc<HostDeviceBuffer>,
        bytes: usize,
        blocking: bool,
        wait_for: &[HostEvent],
    ) -> Result<HostEvent> {
        let (src, dst) = (src.clone(), dst.clone());
        let event = queue.submit(
            "copy_h2d",
            wait_for,
            Box::new(move || {
                let staged = read_prefix(&src.data.lock(), bytes)?;
                write_prefix(&mut dst.data.write(), &staged)
            }),
        )?;
        finish(event, blocking)
    }
}

/// Native gather: entry `i`, row `r`, column `c` is read from
/// `base + offsets[i] + r * row_strides[i] + c * col_strides[i]` and written to
/// element `(i * rows + r) * cols + c` of `dst`.
struct GatherJob {
    count: usize,
    rows: usize,
    cols: usize,
    width: usize,
    base: Arc<HostDeviceBuffer>,
    offsets: Arc<HostDeviceBuffer>,
    col_strides: Arc<HostDeviceBuffer>,
    row_strides: Arc<HostDeviceBuffer>,
    dst: Arc<HostDeviceBuffer>,
}

impl GatherJob {
    fn run(self) -> Result<()> {
        let offsets = decode_indices(&self.offsets.data.read());
        let col_strides = decode_indices(&self.col_strides.data.read());
        let row_strides = decode_indices(&self.row_strides.data.read());

        let bytes = self.count * self.rows * self.cols * self.width;
        let mut packed = Vec::with_capacity(bytes);
        {
            let base = self.base.data.read();
            for i in 0..self.count {
                for r in 0..self.rows {
                    for c in 0..self.cols {
                        let at = offsets[i] + r as u64 * row_strides[i] + c as u64 * col_strides[i];
                        let at = usize::try_from(at).map_err(HaloError::device)?;
                        let element = base.get(at..at + self.width).ok_or_else(|| {
                            HaloError::Device(format!("gather read past end of base at byte {at}"))
                        })?;
                        packed.extend_from_slice(element);
                    }
                }
            }
        }

        // The base guard is released first: a view may alias its own staging buffer.
        write_prefix(&mut self.dst.data.write(), &packed)
    }
}
