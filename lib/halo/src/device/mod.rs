// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device binding.
//!
//! The packing layer never talks to an accelerator API directly. It drives a
//! [`Device`], which provides:
//!
//! - kernel compilation from rendered template source,
//! - queues (streams) for compute and copy work,
//! - asynchronous copies that take a wait-list of prior events and return a
//!   completion event.
//!
//! Two bindings ship with the crate:
//!
//! - [`HostDevice`]: an in-process binding whose "device memory" lives in host
//!   allocations and whose queues are worker threads. It keeps the ordering
//!   semantics of a real stream (in-order per queue, cross-queue ordering only
//!   through events) and is what the test suite runs against.
//! - `CudaDevice` (feature `cuda`): a cudarc binding using NVRTC, pinned host
//!   memory and CUDA events.

pub(crate) mod host;

#[cfg(feature = "cuda")]
mod cuda;

pub use host::{HostDevice, HostDeviceBuffer, HostEvent, HostKernel, HostMirror, HostQueue};

#[cfg(feature = "cuda")]
pub use cuda::{CudaDevice, CudaDeviceBuffer, CudaPinnedBuffer, CudaStreamEvent};

use std::sync::Arc;

use crate::dtype::ElementType;
use crate::error::Result;
use crate::kernels::KernelSource;

/// Device-resident storage.
pub trait DeviceStorage: Send + Sync + 'static {
    /// Allocated size in bytes, including alignment padding.
    fn size(&self) -> usize;
}

/// Host-resident storage that the network layer may read and write.
///
/// Communicators only ever see a host mirror through this trait.
pub trait HostStorage: Send + Sync + 'static {
    fn size(&self) -> usize;

    /// Copy the whole buffer into `dst`, which must be exactly [`size`](Self::size) bytes.
    fn read_into(&self, dst: &mut [u8]) -> Result<()>;

    /// Overwrite the whole buffer from `src`, which must be exactly [`size`](Self::size) bytes.
    fn write_from(&self, src: &[u8]) -> Result<()>;
}

/// Completion marker for work scheduled on a queue.
pub trait DeviceEvent: Clone + Send + Sync + 'static {
    /// Non-blocking query.
    fn is_complete(&self) -> Result<bool>;

    /// Block the calling thread until the work behind this event finished.
    fn synchronize(&self) -> Result<()>;
}

/// Arguments of one gather launch.
///
/// Index tables (`offsets`, `col_strides`, `row_strides`) are device copies of
/// the per-entry byte offsets and strides, encoded as native-endian `u64`.
/// `block_size` is the launch width for bindings that dispatch thread blocks.
pub struct PackArgs<'a, D: Device> {
    pub count: usize,
    pub rows: usize,
    pub cols: usize,
    pub dtype: ElementType,
    pub base: &'a Arc<D::Buffer>,
    pub offsets: &'a Arc<D::Buffer>,
    pub col_strides: &'a Arc<D::Buffer>,
    pub row_strides: &'a Arc<D::Buffer>,
    pub dst: &'a Arc<D::Buffer>,
    pub block_size: u32,
}

pub trait Device: Send + Sync + Sized + 'static {
    type Buffer: DeviceStorage;
    type HostBuffer: HostStorage;
    type Queue: Send + Sync;
    type Event: DeviceEvent;
    type Kernel: Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Allocate `bytes` of zeroed device memory.
    fn alloc(&self, bytes: usize) -> Result<Arc<Self::Buffer>>;

    /// Allocate `bytes` of zeroed, transfer-capable host memory.
    fn alloc_host(&self, bytes: usize) -> Result<Arc<Self::HostBuffer>>;

    /// Allocate device memory holding a copy of `data`. Synchronous.
    fn upload(&self, data: &[u8]) -> Result<Arc<Self::Buffer>>;

    /// Copy the first `dst.len()` bytes of `src` to the host. Synchronous, and
    /// not ordered against queued work; synchronize first.
    fn download(&self, src: &Self::Buffer, dst: &mut [u8]) -> Result<()>;

    fn create_queue(&self) -> Result<Self::Queue>;

    fn compile(&self, source: &KernelSource) -> Result<Self::Kernel>;

    /// Launch the gather kernel over `args.count` work-items on `queue`.
    fn launch_pack(
        &self,
        kernel: &Self::Kernel,
        queue: &Self::Queue,
        args: &PackArgs<'_, Self>,
    ) -> Result<Self::Event>;

    /// Copy `bytes` from device memory into a host buffer once every event in
    /// `wait_for` has fired.
    fn copy_to_host(
        &self,
        queue: &Self::Queue,
        src: &Arc<Self::Buffer>,
        dst: &Arc<Self::HostBuffer>,
        bytes: usize,
        blocking: bool,
        wait_for: &[Self::Event],
    ) -> Result<Self::Event>;

    /// Copy `bytes` from a host buffer into device memory once every event in
    /// `wait_for` has fired.
    fn copy_to_device(
        &self,
        queue: &Self::Queue,
        src: &Arc<Self::HostBuffer>,
        dst: &Arc<Self::Buffer>,
        bytes: usize,
        blocking: bool,
        wait_for: &[Self::Event],
    ) -> Result<Self::Event>;
}

/// Encode an index table the way the gather kernel reads it.
pub(crate) fn encode_indices(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub(crate) fn decode_indices(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(std::mem::size_of::<u64>())
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_ne_bytes(word)
        })
        .collect()
}
