// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Boundary data layouts.
//!
//! - [`IndirectView`]: where the boundary data lives inside a device matrix
//! - [`ExchangeMatrix`]: the contiguous staging buffer and its host mirror
//! - [`ExchangeView`]: one of each, the unit that gets packed

mod matrix;
mod view;
mod xchg;

pub use matrix::ExchangeMatrix;
pub use view::{IndirectView, ViewDescriptor, ViewDescriptorBuilder, ViewDescriptorBuilderError};
pub use xchg::{ExchangeView, Exchangeable};
