// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::Kernel;
use crate::comm::RequestHandle;
use crate::device::Device;
use crate::error::Result;
use crate::queue::ExecQueue;

/// Start a persistent send or receive and hand it to the pending-request queue.
///
/// The request is created once, when the kernel is built, and reused on every
/// run.
#[derive(Debug, Clone)]
pub struct SendRecvKernel {
    request: RequestHandle,
}

impl SendRecvKernel {
    pub(crate) fn new(request: RequestHandle) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &RequestHandle {
        &self.request
    }
}

impl<D: Device> Kernel<D> for SendRecvKernel {
    fn run(&self, queue: &mut ExecQueue<D>) -> Result<()> {
        tracing::trace!(
            kind = %self.request.kind(),
            peer = self.request.peer(),
            tag = self.request.tag(),
            "start persistent request"
        );

        self.request.start()?;
        queue.pending_requests_mut().push(self.request.clone());
        Ok(())
    }
}
