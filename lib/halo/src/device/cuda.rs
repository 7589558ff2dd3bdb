// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! CUDA device binding.
//!
//! Kernels are compiled with NVRTC for the device's compute capability (or the
//! configured `cuda.arch`). Host mirrors are pinned allocations so the async
//! copies are true DMA transfers. Wait lists are expressed as stream waits on
//! recorded events.

use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::sys::{self, CUdevice_attribute_enum, CUdeviceptr, CUresult};
use cudarc::driver::{
    CudaContext, CudaEvent, CudaFunction, CudaStream, LaunchConfig, PushKernelArg, result,
};
use cudarc::nvrtc::{CompileOptions, compile_ptx_with_opts};

use super::{Device, DeviceEvent, DeviceStorage, HostStorage, PackArgs};
use crate::config::CudaConfig;
use crate::error::{HaloError, Result};
use crate::kernels::KernelSource;

pub struct CudaDevice {
    ctx: Arc<CudaContext>,
    arch: String,
}

impl CudaDevice {
    pub fn new(config: &CudaConfig) -> Result<Arc<Self>> {
        let ctx = CudaContext::new(config.device_id).map_err(HaloError::device)?;

        let arch = match &config.arch {
            Some(arch) => arch.clone(),
            None => {
                let major = ctx
                    .attribute(
                        CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
                    )
                    .map_err(HaloError::device)?;
                let minor = ctx
                    .attribute(
                        CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
                    )
                    .map_err(HaloError::device)?;
                format!("compute_{major}{minor}")
            }
        };

        tracing::debug!(device_id = config.device_id, %arch, "created CUDA device");
        Ok(Arc::new(Self { ctx, arch }))
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    fn record(&self, stream: &CudaStream, blocking: bool) -> Result<CudaStreamEvent> {
        let event = stream.record_event(None).map_err(HaloError::device)?;
        if blocking {
            event.synchronize().map_err(HaloError::device)?;
        }
        Ok(CudaStreamEvent(Arc::new(event)))
    }

    fn wait_events(&self, stream: &CudaStream, wait_for: &[CudaStreamEvent]) -> Result<()> {
        for event in wait_for {
            stream.wait(&event.0).map_err(HaloError::device)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDevice")
            .field("ordinal", &self.ctx.ordinal())
            .field("arch", &self.arch)
            .finish()
    }
}

/// Raw device allocation. A zero-length buffer holds no allocation.
#[derive(Debug)]
pub struct CudaDeviceBuffer {
    ptr: CUdeviceptr,
    len: usize,
    ctx: Arc<CudaContext>,
}

impl DeviceStorage for CudaDeviceBuffer {
    fn size(&self) -> usize {
        self.len
    }
}

impl Drop for CudaDeviceBuffer {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        if let Err(e) = self.ctx.bind_to_thread() {
            tracing::error!("failed to bind CUDA context to free 0x{:x}: {}", self.ptr, e);
            return;
        }
        if let Err(e) = unsafe { result::free_sync(self.ptr) } {
            tracing::error!("failed to free device buffer 0x{:x}: {}", self.ptr, e);
        }
    }
}

/// Page-locked host allocation used as a host mirror.
#[derive(Debug)]
pub struct CudaPinnedBuffer {
    ptr: *mut u8,
    len: usize,
}

// The pointer is owned by this buffer and only dereferenced through `&self`
// copies; cross-thread access is ordered by the stream/request contract.
unsafe impl Send for CudaPinnedBuffer {}
unsafe impl Sync for CudaPinnedBuffer {}

impl CudaPinnedBuffer {
    fn check_len(&self, actual: usize) -> Result<()> {
        if actual != self.len {
            return Err(HaloError::SizeMismatch {
                expected: self.len,
                actual,
            });
        }
        Ok(())
    }
}

impl HostStorage for CudaPinnedBuffer {
    fn size(&self) -> usize {
        self.len
    }

    fn read_into(&self, dst: &mut [u8]) -> Result<()> {
        self.check_len(dst.len())?;
        if self.len > 0 {
            unsafe { std::ptr::copy_nonoverlapping(self.ptr, dst.as_mut_ptr(), self.len) };
        }
        Ok(())
    }

    fn write_from(&self, src: &[u8]) -> Result<()> {
        self.check_len(src.len())?;
        if self.len > 0 {
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr, self.len) };
        }
        Ok(())
    }
}

impl Drop for CudaPinnedBuffer {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        if let Err(e) = unsafe { result::free_host(self.ptr as *mut c_void) } {
            tracing::error!("failed to free pinned buffer {:p}: {}", self.ptr, e);
        }
    }
}

/// Event recorded on a CUDA stream.
#[derive(Debug, Clone)]
pub struct CudaStreamEvent(Arc<CudaEvent>);

impl DeviceEvent for CudaStreamEvent {
    fn is_complete(&self) -> Result<bool> {
        match unsafe { sys::cuEventQuery(self.0.cu_event()) } {
            CUresult::CUDA_SUCCESS => Ok(true),
            CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            status => Err(HaloError::Device(format!("event query failed: {status:?}"))),
        }
    }

    fn synchronize(&self) -> Result<()> {
        self.0.synchronize().map_err(HaloError::device)
    }
}

fn check_extent(what: &str, bytes: usize, len: usize) -> Result<()> {
    if bytes > len {
        return Err(HaloError::Device(format!(
            "{what} of {bytes} bytes exceeds buffer of {len} bytes"
        )));
    }
    Ok(())
}

fn as_i32(name: &str, value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| {
        HaloError::Device(format!(
            "{name} = {value} exceeds the kernel's int range"
        ))
    })
}

impl Device for CudaDevice {
    type Buffer = CudaDeviceBuffer;
    type HostBuffer = CudaPinnedBuffer;
    type Queue = Arc<CudaStream>;
    type Event = CudaStreamEvent;
    type Kernel = CudaFunction;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn alloc(&self, bytes: usize) -> Result<Arc<CudaDeviceBuffer>> {
        self.ctx.bind_to_thread().map_err(HaloError::device)?;

        let ptr = if bytes == 0 {
            0
        } else {
            let ptr = unsafe { result::malloc_sync(bytes) }.map_err(|e| HaloError::Allocation {
                location: "device",
                bytes,
                reason: e.to_string(),
            })?;
            if let Err(e) = unsafe { result::memset_d8_sync(ptr, 0, bytes) } {
                let _ = unsafe { result::free_sync(ptr) };
                return Err(HaloError::device(e));
            }
            ptr
        };

        Ok(Arc::new(CudaDeviceBuffer {
            ptr,
            len: bytes,
            ctx: self.ctx.clone(),
        }))
    }

    fn alloc_host(&self, bytes: usize) -> Result<Arc<CudaPinnedBuffer>> {
        self.ctx.bind_to_thread().map_err(HaloError::device)?;

        let ptr = if bytes == 0 {
            std::ptr::null_mut()
        } else {
            let ptr = unsafe { result::malloc_host(bytes, 0) }.map_err(|e| {
                HaloError::Allocation {
                    location: "pinned host",
                    bytes,
                    reason: e.to_string(),
                }
            })? as *mut u8;
            unsafe { std::ptr::write_bytes(ptr, 0, bytes) };
            ptr
        };

        Ok(Arc::new(CudaPinnedBuffer { ptr, len: bytes }))
    }

    fn upload(&self, data: &[u8]) -> Result<Arc<CudaDeviceBuffer>> {
        let buffer = self.alloc(data.len())?;
        if !data.is_empty() {
            unsafe { result::memcpy_htod_sync(buffer.ptr, data) }.map_err(HaloError::device)?;
        }
        Ok(buffer)
    }

    fn download(&self, src: &CudaDeviceBuffer, dst: &mut [u8]) -> Result<()> {
        check_extent("download", dst.len(), src.len)?;
        if !dst.is_empty() {
            self.ctx.bind_to_thread().map_err(HaloError::device)?;
            unsafe { result::memcpy_dtoh_sync(dst, src.ptr) }.map_err(HaloError::device)?;
        }
        Ok(())
    }

    fn create_queue(&self) -> Result<Arc<CudaStream>> {
        self.ctx.new_stream().map_err(HaloError::device)
    }

    fn compile(&self, source: &KernelSource) -> Result<CudaFunction> {
        let build_error = |reason: String| HaloError::KernelBuild {
            name: source.entry.clone(),
            reason,
        };

        let mut compile_opts = CompileOptions {
            name: Some(format!("{}.cu", source.entry)),
            ..Default::default()
        };
        compile_opts
            .options
            .push(format!("--gpu-architecture={}", self.arch));

        let ptx = compile_ptx_with_opts(&source.code, compile_opts)
            .map_err(|e| build_error(e.to_string()))?;
        let module = self
            .ctx
            .load_module(ptx)
            .map_err(|e| build_error(e.to_string()))?;
        let function = module
            .load_function(&source.entry)
            .map_err(|e| build_error(e.to_string()))?;

        tracing::debug!(entry = %source.entry, key = ?source.key, arch = %self.arch, "compiled CUDA kernel");
        Ok(function)
    }

    fn launch_pack(
        &self,
        kernel: &CudaFunction,
        queue: &Arc<CudaStream>,
        args: &PackArgs<'_, Self>,
    ) -> Result<CudaStreamEvent> {
        self.ctx.bind_to_thread().map_err(HaloError::device)?;

        let n = as_i32("count", args.count)?;
        let nrv = as_i32("rows", args.rows)?;
        let ncv = as_i32("cols", args.cols)?;

        let grid = u32::try_from(args.count.div_ceil(args.block_size as usize))
            .map_err(HaloError::device)?;
        let launch_cfg = LaunchConfig {
            grid_dim: (grid, 1, 1),
            block_dim: (args.block_size, 1, 1),
            shared_mem_bytes: 0,
        };

        let mut launch = queue.launch_builder(kernel);
        unsafe {
            launch.arg(&n);
            launch.arg(&nrv);
            launch.arg(&ncv);
            launch.arg(&args.base.ptr);
            launch.arg(&args.offsets.ptr);
            launch.arg(&args.col_strides.ptr);
            launch.arg(&args.row_strides.ptr);
            launch.arg(&args.dst.ptr);
            launch.launch(launch_cfg).map_err(HaloError::device)?;
        }

        self.record(queue, false)
    }

    fn copy_to_host(
        &self,
        queue: &Arc<CudaStream>,
        src: &Arc<CudaDeviceBuffer>,
        dst: &Arc<CudaPinnedBuffer>,
        bytes: usize,
        blocking: bool,
        wait_for: &[CudaStreamEvent],
    ) -> Result<CudaStreamEvent> {
        check_extent("device read", bytes, src.len)?;
        check_extent("host write", bytes, dst.len)?;
        self.ctx.bind_to_thread().map_err(HaloError::device)?;
        self.wait_events(queue, wait_for)?;

        if bytes > 0 {
            unsafe {
                let dst_slice = std::slice::from_raw_parts_mut(dst.ptr, bytes);
                result::memcpy_dtoh_async(dst_slice, src.ptr, queue.cu_stream())
            }
            .map_err(HaloError::device)?;
        }

        self.record(queue, blocking)
    }

    fn copy_to_device(
        &self,
        queue: &Arc<CudaStream>,
        src: &Arc<CudaPinnedBuffer>,
        dst: &Arc<CudaDeviceBuffer>,
        bytes: usize,
        blocking: bool,
        wait_for: &[CudaStreamEvent],
    ) -> Result<CudaStreamEvent> {
        check_extent("host read", bytes, src.len)?;
        check_extent("device write", bytes, dst.len)?;
        self.ctx.bind_to_thread().map_err(HaloError::device)?;
        self.wait_events(queue, wait_for)?;

        if bytes > 0 {
            unsafe {
                let src_slice = std::slice::from_raw_parts(src.ptr as *const u8, bytes);
                result::memcpy_htod_async(dst.ptr, src_slice, queue.cu_stream())
            }
            .map_err(HaloError::device)?;
        }

        self.record(queue, blocking)
    }
}
