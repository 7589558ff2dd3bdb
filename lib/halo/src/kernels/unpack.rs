// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use super::Kernel;
use crate::device::Device;
use crate::error::Result;
use crate::layout::ExchangeMatrix;
use crate::queue::ExecQueue;

/// Copy an exchange matrix's host mirror into its device buffer on the compute
/// queue.
///
/// The copy has no wait list. Run it only once the receive that filled the
/// mirror has been observed complete, and synchronize on the recorded event
/// before reading the device buffer.
pub struct UnpackKernel<D: Device> {
    matrix: Arc<ExchangeMatrix<D>>,
}

impl<D: Device> UnpackKernel<D> {
    pub(crate) fn new(matrix: Arc<ExchangeMatrix<D>>) -> Self {
        Self { matrix }
    }

    pub fn matrix(&self) -> &Arc<ExchangeMatrix<D>> {
        &self.matrix
    }
}

impl<D: Device> Kernel<D> for UnpackKernel<D> {
    fn run(&self, queue: &mut ExecQueue<D>) -> Result<()> {
        let bytes = self.matrix.bytes();
        if bytes == 0 {
            tracing::trace!("unpack of empty matrix, nothing to do");
            return Ok(());
        }

        tracing::trace!(bytes, dtype = %self.matrix.dtype(), "unpack");

        let device = queue.device().clone();
        let copied = device.copy_to_device(
            queue.compute(),
            self.matrix.host_buffer(),
            self.matrix.device_buffer(),
            bytes,
            false,
            &[],
        )?;

        queue.record(copied);
        Ok(())
    }
}

impl<D: Device> fmt::Debug for UnpackKernel<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnpackKernel")
            .field("matrix", &self.matrix)
            .finish()
    }
}
