// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runnable packing units.
//!
//! [`PackingKernels`] builds three kinds of [`Kernel`]:
//!
//! - [`PackKernel`]: gather a view into its exchange matrix, then copy the
//!   matrix to its host mirror
//! - [`UnpackKernel`]: copy a host mirror back to its device buffer
//! - [`SendRecvKernel`]: start a persistent send or receive on a host mirror
//!
//! Building a kernel does all of the one-time work (compilation, request
//! creation, validation). Running one only schedules work on an [`ExecQueue`]
//! and never blocks.

mod cache;
mod pack;
mod sendrecv;
mod template;
mod unpack;

pub use cache::KernelCache;
pub use pack::PackKernel;
pub use sendrecv::SendRecvKernel;
pub use unpack::UnpackKernel;

use std::fmt;
use std::sync::Arc;

use validator::Validate;

use crate::comm::{Communicator, Tag, TransferKind, request_init};
use crate::config::{ConfigError, HaloConfig, PackingConfig};
use crate::device::Device;
use crate::dtype::ElementType;
use crate::error::{HaloError, Result};
use crate::layout::{ExchangeMatrix, ExchangeView, Exchangeable, IndirectView};
use crate::queue::ExecQueue;

/// Specialization key of a compiled gather kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub alignment: usize,
    pub dtype: ElementType,
}

/// Rendered kernel source handed to [`Device::compile`].
#[derive(Debug, Clone)]
pub struct KernelSource {
    pub entry: String,
    pub code: String,
    pub key: KernelKey,
}

/// A unit of work that can be scheduled on an execution context.
pub trait Kernel<D: Device>: Send + Sync {
    fn run(&self, queue: &mut ExecQueue<D>) -> Result<()>;
}

/// Factory for pack, unpack and transfer kernels on one device.
pub struct PackingKernels<D: Device> {
    device: Arc<D>,
    cache: KernelCache<D>,
    alignment: usize,
    block_size: u32,
}

impl<D: Device> PackingKernels<D> {
    pub fn new(device: Arc<D>, config: &PackingConfig) -> Result<Self> {
        config.validate().map_err(ConfigError::Validation)?;

        Ok(Self {
            cache: KernelCache::new(device.clone()),
            device,
            alignment: config.alignment,
            block_size: config.block_size,
        })
    }

    pub fn from_config(device: Arc<D>, config: &HaloConfig) -> Result<Self> {
        Self::new(device, &config.packing)
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn cache(&self) -> &KernelCache<D> {
        &self.cache
    }

    /// Allocate an exchange matrix padded to this provider's alignment.
    pub fn alloc_matrix(
        &self,
        dtype: ElementType,
        count: usize,
        rows: usize,
        cols: usize,
    ) -> Result<Arc<ExchangeMatrix<D>>> {
        ExchangeMatrix::new(self.device.as_ref(), dtype, count, rows, cols, self.alignment)
            .map(Arc::new)
    }

    /// Pair `view` with a freshly allocated exchange matrix.
    pub fn xchg_view(&self, view: Arc<IndirectView<D>>) -> Result<ExchangeView<D>> {
        ExchangeView::allocate(self.device.as_ref(), view, self.alignment)
    }

    /// Build a pack kernel for `xchg`, compiling the gather kernel for its
    /// element type if no exchange view used it yet.
    pub fn pack(&self, xchg: &ExchangeView<D>) -> Result<PackKernel<D>> {
        let key = KernelKey {
            alignment: self.alignment,
            dtype: xchg.view().dtype(),
        };
        if key.dtype != xchg.matrix().dtype() {
            return Err(HaloError::ElementTypeMismatch {
                expected: xchg.matrix().dtype(),
                actual: key.dtype,
            });
        }

        let kernel = self.cache.get_or_compile(key)?;
        Ok(PackKernel::new(self.device.clone(), kernel, xchg.clone(), self.block_size))
    }

    pub fn unpack<'a>(&self, operand: impl Into<Exchangeable<'a, D>>) -> UnpackKernel<D> {
        UnpackKernel::new(operand.into().xchg_matrix().clone())
    }

    /// Build a persistent send of the operand's host mirror to `peer`.
    pub fn send_pack<'a>(
        &self,
        comm: &dyn Communicator,
        operand: impl Into<Exchangeable<'a, D>>,
        peer: usize,
        tag: Tag,
    ) -> Result<SendRecvKernel> {
        self.sendrecv(comm, TransferKind::Send, operand.into(), peer, tag)
    }

    /// Build a persistent receive from `peer` into the operand's host mirror.
    pub fn recv_pack<'a>(
        &self,
        comm: &dyn Communicator,
        operand: impl Into<Exchangeable<'a, D>>,
        peer: usize,
        tag: Tag,
    ) -> Result<SendRecvKernel> {
        self.sendrecv(comm, TransferKind::Recv, operand.into(), peer, tag)
    }

    fn sendrecv(
        &self,
        comm: &dyn Communicator,
        kind: TransferKind,
        operand: Exchangeable<'_, D>,
        peer: usize,
        tag: Tag,
    ) -> Result<SendRecvKernel> {
        let matrix = operand.xchg_matrix();
        let request = request_init(comm, kind, matrix.host_storage(), peer, tag)?;
        Ok(SendRecvKernel::new(request))
    }
}

impl<D: Device> fmt::Debug for PackingKernels<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackingKernels")
            .field("device", &self.device.name())
            .field("alignment", &self.alignment)
            .field("block_size", &self.block_size)
            .field("cache", &self.cache)
            .finish()
    }
}
