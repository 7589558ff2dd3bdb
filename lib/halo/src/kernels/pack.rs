// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use super::Kernel;
use crate::device::{Device, PackArgs};
use crate::error::{HaloError, Result};
use crate::layout::ExchangeView;
use crate::queue::ExecQueue;

/// Gather an exchange view into its matrix, then copy the matrix to its host
/// mirror.
///
/// The gather runs on the compute queue. The device-to-host copy runs on the
/// copy queue and waits on the gather's completion event, so later compute work
/// can overlap with the copy. Only the copy event is recorded on the
/// [`ExecQueue`]; it cannot fire before the gather did.
///
/// The compiled kernel belongs to the device of the [`PackingKernels`] that
/// built it, so the kernel only runs on an [`ExecQueue`] of that same device.
///
/// [`PackingKernels`]: super::PackingKernels
pub struct PackKernel<D: Device> {
    device: Arc<D>,
    kernel: Arc<D::Kernel>,
    xchg: ExchangeView<D>,
    block_size: u32,
}

impl<D: Device> PackKernel<D> {
    pub(crate) fn new(
        device: Arc<D>,
        kernel: Arc<D::Kernel>,
        xchg: ExchangeView<D>,
        block_size: u32,
    ) -> Self {
        Self {
            device,
            kernel,
            xchg,
            block_size,
        }
    }

    pub fn xchg(&self) -> &ExchangeView<D> {
        &self.xchg
    }

    pub fn kernel(&self) -> &Arc<D::Kernel> {
        &self.kernel
    }
}

impl<D: Device> Kernel<D> for PackKernel<D> {
    fn run(&self, queue: &mut ExecQueue<D>) -> Result<()> {
        if !Arc::ptr_eq(&self.device, queue.device()) {
            return Err(HaloError::ForeignQueue {
                built_for: self.device.name(),
            });
        }

        let view = self.xchg.view();
        let matrix = self.xchg.matrix();

        if view.count() == 0 {
            tracing::trace!("pack of empty view, nothing to do");
            return Ok(());
        }

        tracing::trace!(
            count = view.count(),
            rows = view.rows(),
            cols = view.cols(),
            dtype = %view.dtype(),
            bytes = matrix.bytes(),
            "pack"
        );

        let device = &self.device;
        let args = PackArgs {
            count: view.count(),
            rows: view.rows(),
            cols: view.cols(),
            dtype: view.dtype(),
            base: view.base(),
            offsets: view.device_offsets(),
            col_strides: view.device_col_strides(),
            row_strides: view.device_row_strides(),
            dst: matrix.device_buffer(),
            block_size: self.block_size,
        };

        let gathered = device.launch_pack(&self.kernel, queue.compute(), &args)?;
        let copied = device.copy_to_host(
            queue.copy(),
            matrix.device_buffer(),
            matrix.host_buffer(),
            matrix.bytes(),
            false,
            &[gathered],
        )?;

        queue.record(copied);
        Ok(())
    }
}

impl<D: Device> fmt::Debug for PackKernel<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackKernel")
            .field("xchg", &self.xchg)
            .field("block_size", &self.block_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::PackingConfig;
    use crate::device::{DeviceEvent, HostDevice};
    use crate::dtype::ElementType;
    use crate::kernels::PackingKernels;
    use crate::layout::{IndirectView, ViewDescriptor};

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn setup(device: &Arc<HostDevice>) -> (PackingKernels<HostDevice>, ExchangeView<HostDevice>) {
        let kernels = PackingKernels::new(device.clone(), &PackingConfig::default()).unwrap();
        let base = device.upload(&f32_bytes(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        let descriptor = ViewDescriptor::uniform(ElementType::F32, 1, 4, vec![0], 4, 0);
        let view = IndirectView::new(device.as_ref(), base, descriptor).unwrap();
        let xchg = kernels.xchg_view(Arc::new(view)).unwrap();
        (kernels, xchg)
    }

    #[test]
    fn test_host_copy_waits_for_gather() {
        let device = HostDevice::new();
        let (kernels, xchg) = setup(&device);
        let matrix = xchg.matrix().clone();
        let pack = kernels.pack(&xchg).unwrap();
        let mut queue = ExecQueue::new(device.clone()).unwrap();

        // stale device contents that an unordered copy would pick up
        matrix.write_host(&[0xAA; 16]).unwrap();
        device
            .copy_to_device(
                queue.copy(),
                matrix.host_buffer(),
                matrix.device_buffer(),
                16,
                true,
                &[],
            )
            .unwrap();
        matrix.write_host(&[0; 16]).unwrap();

        // hold the compute queue so the gather cannot start yet
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let hold: crate::device::host::Work = Box::new(move || {
            let _ = gate.recv();
            Ok(())
        });
        queue.compute().submit("hold", &[], hold).unwrap();
        queue.run(&[&pack]).unwrap();

        // in-order copy queue: this marker fires only after the pack copy ran
        let scratch = device.alloc_host(0).unwrap();
        let marker = device
            .copy_to_host(
                queue.copy(),
                matrix.device_buffer(),
                &scratch,
                0,
                false,
                &[],
            )
            .unwrap();
        let deadline = Instant::now() + Duration::from_millis(200);
        while Instant::now() < deadline && !marker.is_complete().unwrap() {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!marker.is_complete().unwrap(), "copy ran before the gather");
        assert_eq!(matrix.read_host().unwrap(), vec![0; 16]);

        release.send(()).unwrap();
        queue.synchronize_device().unwrap();
        marker.synchronize().unwrap();
        assert_eq!(matrix.read_host().unwrap(), f32_bytes(&[1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_rejects_queue_of_another_device() {
        let device = HostDevice::new();
        let (kernels, xchg) = setup(&device);
        let pack = kernels.pack(&xchg).unwrap();

        let other = HostDevice::new();
        let mut queue = ExecQueue::new(other.clone()).unwrap();
        let err = queue.run(&[&pack]).unwrap_err();

        assert!(matches!(err, HaloError::ForeignQueue { built_for: "host" }));
        assert_eq!(err.kind(), crate::ErrorKind::Usage);
        assert_eq!(device.launches() + other.launches(), 0);
        assert_eq!(queue.outstanding_events(), 0);
    }
}
