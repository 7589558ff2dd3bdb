// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Execution context for packing kernels.
//!
//! An [`ExecQueue`] owns a compute queue, a copy queue, the completion events of
//! the device work scheduled so far, and the [`PendingRequests`] started by
//! transfer kernels. Kernels only append to it. Deciding when to synchronize
//! and when to wait on requests is left to the caller.

use std::fmt;
use std::sync::Arc;

use crate::comm::RequestHandle;
use crate::device::{Device, DeviceEvent};
use crate::error::Result;
use crate::kernels::Kernel;

/// Started persistent requests not yet confirmed complete.
#[derive(Debug, Default)]
pub struct PendingRequests {
    requests: Vec<RequestHandle>,
}

impl PendingRequests {
    pub fn push(&mut self, request: RequestHandle) {
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestHandle> {
        self.requests.iter()
    }

    /// Take every pending request, in the order they were started.
    pub fn drain(&mut self) -> Vec<RequestHandle> {
        std::mem::take(&mut self.requests)
    }
}

pub struct ExecQueue<D: Device> {
    device: Arc<D>,
    compute: D::Queue,
    copy: D::Queue,
    events: Vec<D::Event>,
    pending: PendingRequests,
}

impl<D: Device> ExecQueue<D> {
    pub fn new(device: Arc<D>) -> Result<Self> {
        let compute = device.create_queue()?;
        let copy = device.create_queue()?;

        Ok(Self {
            device,
            compute,
            copy,
            events: Vec::new(),
            pending: PendingRequests::default(),
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn compute(&self) -> &D::Queue {
        &self.compute
    }

    pub fn copy(&self) -> &D::Queue {
        &self.copy
    }

    /// Track a completion event for [`synchronize_device`](Self::synchronize_device).
    pub fn record(&mut self, event: D::Event) {
        self.events.push(event);
    }

    /// Device events recorded since the last synchronization.
    pub fn outstanding_events(&self) -> usize {
        self.events.len()
    }

    pub fn pending_requests(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn pending_requests_mut(&mut self) -> &mut PendingRequests {
        &mut self.pending
    }

    /// Run `kernels` in order, stopping at the first failure.
    pub fn run(&mut self, kernels: &[&dyn Kernel<D>]) -> Result<()> {
        for kernel in kernels {
            kernel.run(self)?;
        }
        Ok(())
    }

    /// Block until every recorded device event fired.
    ///
    /// All events are waited on and cleared even if one of them failed; the
    /// first failure is returned.
    pub fn synchronize_device(&mut self) -> Result<()> {
        let mut first = None;
        for event in self.events.drain(..) {
            if let Err(e) = event.synchronize() {
                tracing::warn!(error = %e, "device work failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Hand the pending requests to the caller, who becomes responsible for
    /// testing or waiting on them.
    pub fn drain_requests(&mut self) -> Vec<RequestHandle> {
        self.pending.drain()
    }

    /// Synchronize the device, then wait on every pending request.
    ///
    /// Every request is waited on even after a failure, so none is left active.
    /// The first failure is returned.
    pub fn wait_all(&mut self) -> Result<()> {
        let mut first = self.synchronize_device().err();
        for request in self.drain_requests() {
            if let Err(e) = request.wait() {
                tracing::warn!(
                    peer = request.peer(),
                    tag = request.tag(),
                    error = %e,
                    "persistent request failed"
                );
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl<D: Device> fmt::Debug for ExecQueue<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecQueue")
            .field("device", &self.device.name())
            .field("outstanding_events", &self.events.len())
            .field("pending_requests", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{Communicator, LocalWorld, RequestState};
    use crate::device::HostDevice;

    #[test]
    fn test_wait_all_drains_and_completes() {
        let device = HostDevice::new();
        let world = LocalWorld::new(1);
        let comm = world.communicator(0).unwrap();
        let mut queue = ExecQueue::new(device.clone()).unwrap();

        let send_buf = device.alloc_host(4).unwrap();
        let recv_buf = device.alloc_host(4).unwrap();
        let send = comm.send_init(send_buf, 0, 1).unwrap();
        let recv = comm.recv_init(recv_buf, 0, 1).unwrap();

        send.start().unwrap();
        recv.start().unwrap();
        queue.pending_requests_mut().push(send.clone());
        queue.pending_requests_mut().push(recv.clone());
        assert_eq!(queue.pending_requests().len(), 2);

        queue.wait_all().unwrap();
        assert!(queue.pending_requests().is_empty());
        assert_eq!(send.state(), RequestState::Completed);
        assert_eq!(recv.state(), RequestState::Completed);
    }

    #[test]
    fn test_drain_hands_requests_back_in_order() {
        let device = HostDevice::new();
        let world = LocalWorld::new(2);
        let comm = world.communicator(0).unwrap();
        let mut queue = ExecQueue::new(device.clone()).unwrap();

        for tag in 0..3 {
            let request = comm.recv_init(device.alloc_host(1).unwrap(), 1, tag).unwrap();
            queue.pending_requests_mut().push(request);
        }

        let drained = queue.drain_requests();
        assert_eq!(drained.iter().map(|r| r.tag()).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(queue.pending_requests().is_empty());
    }

    #[test]
    fn test_synchronize_clears_events() {
        let device = HostDevice::new();
        let mut queue = ExecQueue::new(device.clone()).unwrap();

        let src = device.upload(&[7; 16]).unwrap();
        let dst = device.alloc_host(16).unwrap();
        let event = device
            .copy_to_host(queue.copy(), &src, &dst, 16, false, &[])
            .unwrap();
        queue.record(event);
        assert_eq!(queue.outstanding_events(), 1);

        queue.synchronize_device().unwrap();
        assert_eq!(queue.outstanding_events(), 0);
    }
}
