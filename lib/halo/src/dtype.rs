// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Floating-point element tags carried by views, matrices and compiled kernels.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Width and precision of the scalars stored in an exchange matrix.
///
/// Packing never interprets values, it only moves them, so two tags of the same
/// width still compile to distinct kernels: the tag is part of the kernel key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F16,
    BF16,
    F32,
    F64,
}

impl ElementType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            ElementType::F16 | ElementType::BF16 => 2,
            ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }

    /// Scalar type used in the rendered device source.
    ///
    /// Half-precision tags are moved as raw 16-bit words so the template does
    /// not depend on the fp16 headers.
    pub(crate) const fn kernel_type(self) -> &'static str {
        match self {
            ElementType::F16 | ElementType::BF16 => "unsigned short",
            ElementType::F32 => "float",
            ElementType::F64 => "double",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ElementType::F16 => "f16",
            ElementType::BF16 => "bf16",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
