// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;

use super::KernelKey;
use super::template::render_pack;
use crate::device::Device;
use crate::error::Result;

type Slot<K> = Arc<OnceCell<Arc<K>>>;

/// Compiled gather kernels, one per [`KernelKey`].
///
/// Each key is compiled at most once even when several threads ask for it at
/// the same time; concurrent callers block on the same initialization. A failed
/// compilation leaves the slot empty so a later call retries it.
pub struct KernelCache<D: Device> {
    device: Arc<D>,
    kernels: DashMap<KernelKey, Slot<D::Kernel>>,
}

impl<D: Device> KernelCache<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            kernels: DashMap::new(),
        }
    }

    /// Return the kernel for `key`, compiling it on first use.
    pub fn get_or_compile(&self, key: KernelKey) -> Result<Arc<D::Kernel>> {
        // Clone the slot out so the shard lock is not held across compilation.
        let slot = self.kernels.entry(key).or_default().clone();

        slot.get_or_try_init(|| {
            let source = render_pack(key);
            tracing::debug!(
                entry = %source.entry,
                alignment = key.alignment,
                dtype = %key.dtype,
                device = self.device.name(),
                "compiling pack kernel"
            );
            self.device.compile(&source).map(Arc::new)
        })
        .cloned()
    }

    /// Number of compiled kernel instances.
    pub fn len(&self) -> usize {
        self.kernels
            .iter()
            .filter(|entry| entry.value().get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: Device> fmt::Debug for KernelCache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCache")
            .field("device", &self.device.name())
            .field("compiled", &self.len())
            .finish()
    }
}
