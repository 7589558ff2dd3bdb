// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the packing layer.
//!
//! Every failure raised by this crate is reported synchronously at the call that
//! caused it. Failures of in-flight transfers surface later, when the caller
//! tests or waits on the corresponding request handle.

use crate::config::ConfigError;
use crate::dtype::ElementType;

pub type Result<T, E = HaloError> = std::result::Result<T, E>;

/// Coarse classification of a [`HaloError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed views, mismatched element types or shapes, bad peers. Raised at
    /// construction or compile time, never at launch.
    Configuration,
    /// Device or host buffer allocation failed.
    ResourceExhaustion,
    /// A network transfer completed with an error status.
    Transport,
    /// The caller broke an ordering contract that this layer was able to detect.
    Usage,
    /// The device binding reported a failure while scheduling work.
    Device,
}

#[derive(Debug, thiserror::Error)]
pub enum HaloError {
    #[error("invalid indirect view: {0}")]
    InvalidView(String),

    #[error("entry {index} reaches byte {end} but the backing matrix holds only {len} bytes")]
    OutOfBounds { index: usize, end: u64, len: usize },

    #[error("element type mismatch: expected {expected}, got {actual}")]
    ElementTypeMismatch {
        expected: ElementType,
        actual: ElementType,
    },

    #[error(
        "shape mismatch: view is {view_count}x{view_rows}x{view_cols}, \
         matrix is {matrix_count}x{matrix_rows}x{matrix_cols}"
    )]
    ShapeMismatch {
        view_count: usize,
        view_rows: usize,
        view_cols: usize,
        matrix_count: usize,
        matrix_rows: usize,
        matrix_cols: usize,
    },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("peer {peer} is outside of a world of size {world_size}")]
    InvalidPeer { peer: usize, world_size: usize },

    #[error("failed to allocate {bytes} bytes of {location} memory: {reason}")]
    Allocation {
        location: &'static str,
        bytes: usize,
        reason: String,
    },

    #[error("failed to build kernel `{name}`: {reason}")]
    KernelBuild { name: String, reason: String },

    #[error("persistent request (peer {peer}, tag {tag}) is still active")]
    RequestActive { peer: usize, tag: i32 },

    #[error("kernel built for device {built_for} was run on a queue of another device")]
    ForeignQueue { built_for: &'static str },

    #[error("transfer with peer {peer} (tag {tag}) failed: {reason}")]
    Transport { peer: usize, tag: i32, reason: String },

    #[error("device operation failed: {0}")]
    Device(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HaloError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HaloError::InvalidView(_)
            | HaloError::OutOfBounds { .. }
            | HaloError::ElementTypeMismatch { .. }
            | HaloError::ShapeMismatch { .. }
            | HaloError::SizeMismatch { .. }
            | HaloError::InvalidPeer { .. }
            | HaloError::KernelBuild { .. }
            | HaloError::Config(_) => ErrorKind::Configuration,
            HaloError::Allocation { .. } => ErrorKind::ResourceExhaustion,
            HaloError::Transport { .. } => ErrorKind::Transport,
            HaloError::RequestActive { .. } | HaloError::ForeignQueue { .. } => ErrorKind::Usage,
            HaloError::Device(_) => ErrorKind::Device,
        }
    }

    pub(crate) fn device(err: impl std::fmt::Display) -> Self {
        HaloError::Device(err.to_string())
    }
}
