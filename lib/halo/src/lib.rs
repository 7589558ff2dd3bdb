// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Halo exchange packing.
//!
//! Gathers strided boundary data out of device matrices into contiguous
//! exchange matrices, moves them through host mirrors to peer partitions with
//! persistent point-to-point requests, and copies received mirrors back to the
//! device.
//!
//! A round on the sending side:
//!
//! ```rust,ignore
//! let kernels = PackingKernels::new(device.clone(), &config.packing)?;
//! let xchg = kernels.xchg_view(view)?;
//! let pack = kernels.pack(&xchg)?;
//! let send = kernels.send_pack(&comm, &xchg, peer, tag)?;
//!
//! let mut queue = ExecQueue::new(device)?;
//! queue.run(&[&pack])?;
//! queue.synchronize_device()?;
//! queue.run(&[&send])?;
//! queue.wait_all()?;
//! ```
//!
//! and on the receiving side `recv_pack`, `wait_all`, then `unpack`.

pub mod comm;
pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod kernels;
pub mod layout;
pub mod queue;

pub use comm::{Communicator, LocalWorld, PersistentRequest, RequestHandle, RequestState};
pub use config::HaloConfig;
pub use device::{Device, HostDevice};
pub use dtype::ElementType;
pub use error::{ErrorKind, HaloError, Result};
pub use kernels::{Kernel, PackingKernels};
pub use layout::{ExchangeMatrix, ExchangeView, Exchangeable, IndirectView, ViewDescriptor};
pub use queue::ExecQueue;
