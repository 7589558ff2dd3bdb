// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Exchange matrices: a contiguous device buffer plus its host mirror.

use std::fmt;
use std::sync::Arc;

use crate::device::{Device, HostStorage};
use crate::dtype::ElementType;
use crate::error::{HaloError, Result};

/// Staging buffer for one boundary region.
///
/// Packed entries are laid out entry-major: element `(i, r, c)` sits at index
/// `(i * rows + r) * cols + c`. The device allocation is padded up to the
/// alignment; the host mirror holds exactly the logical bytes and is the only
/// buffer handed to the network layer.
///
/// Allocated once per region and reused for every exchange round; never resized.
pub struct ExchangeMatrix<D: Device> {
    dtype: ElementType,
    count: usize,
    rows: usize,
    cols: usize,
    device: Arc<D::Buffer>,
    host: Arc<D::HostBuffer>,
}

impl<D: Device> ExchangeMatrix<D> {
    pub fn new(
        device: &D,
        dtype: ElementType,
        count: usize,
        rows: usize,
        cols: usize,
        alignment: usize,
    ) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(HaloError::InvalidView(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        let bytes = count
            .checked_mul(rows)
            .and_then(|n| n.checked_mul(cols))
            .and_then(|n| n.checked_mul(dtype.size()))
            .ok_or_else(|| {
                HaloError::InvalidView(format!(
                    "exchange matrix {count}x{rows}x{cols} of {dtype} overflows usize"
                ))
            })?;
        let padded = bytes.next_multiple_of(alignment);

        let buffer = device.alloc(padded)?;
        let host = device.alloc_host(bytes)?;

        tracing::debug!(
            count,
            rows,
            cols,
            %dtype,
            bytes,
            padded,
            device = device.name(),
            "allocated exchange matrix"
        );

        Ok(Self {
            dtype,
            count,
            rows,
            cols,
            device: buffer,
            host,
        })
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Logical size in bytes; the amount moved by every copy.
    pub fn bytes(&self) -> usize {
        self.count * self.rows * self.cols * self.dtype.size()
    }

    pub fn device_buffer(&self) -> &Arc<D::Buffer> {
        &self.device
    }

    pub fn host_buffer(&self) -> &Arc<D::HostBuffer> {
        &self.host
    }

    /// The host mirror as seen by a communicator.
    pub fn host_storage(&self) -> Arc<dyn HostStorage> {
        self.host.clone()
    }

    /// Snapshot of the host mirror.
    pub fn read_host(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.bytes()];
        self.host.read_into(&mut out)?;
        Ok(out)
    }

    /// Overwrite the host mirror.
    pub fn write_host(&self, data: &[u8]) -> Result<()> {
        self.host.write_from(data)
    }

    /// Synchronous snapshot of the logical bytes of the device buffer.
    pub fn read_device(&self, device: &D) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.bytes()];
        device.download(&self.device, &mut out)?;
        Ok(out)
    }
}

impl<D: Device> fmt::Debug for ExchangeMatrix<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeMatrix")
            .field("dtype", &self.dtype)
            .field("count", &self.count)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}
