// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Indirect views: strided, per-entry addressing into a larger device matrix.

use std::fmt;
use std::sync::Arc;

use derive_builder::Builder;
use validator::Validate;

use crate::device::{Device, DeviceStorage, encode_indices};
use crate::dtype::ElementType;
use crate::error::{HaloError, Result};

/// Shape and addressing of an indirect view, independent of any device.
///
/// Entry `i` is a `rows x cols` block of scalars whose element `(r, c)` lives at
/// byte `offsets[i] + r * row_strides[i] + c * col_strides[i]` of the base
/// matrix. All offsets and strides are in bytes.
#[derive(Debug, Clone, Builder, Validate, PartialEq, Eq)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate_tables"))]
pub struct ViewDescriptor {
    pub dtype: ElementType,

    #[validate(range(min = 1))]
    pub rows: usize,

    #[validate(range(min = 1))]
    pub cols: usize,

    #[builder(default)]
    pub offsets: Vec<u64>,

    #[builder(default)]
    pub col_strides: Vec<u64>,

    #[builder(default)]
    pub row_strides: Vec<u64>,
}

impl ViewDescriptorBuilder {
    fn validate_tables(&self) -> Result<(), String> {
        let len = |v: &Option<Vec<u64>>| v.as_ref().map_or(0, Vec::len);
        let (n, c, r) = (
            len(&self.offsets),
            len(&self.col_strides),
            len(&self.row_strides),
        );
        if n != c || n != r {
            return Err(format!(
                "offset and stride tables differ in length: offsets={n}, col_strides={c}, row_strides={r}"
            ));
        }
        Ok(())
    }
}

impl From<ViewDescriptorBuilderError> for HaloError {
    fn from(err: ViewDescriptorBuilderError) -> Self {
        HaloError::InvalidView(err.to_string())
    }
}

impl ViewDescriptor {
    pub fn builder() -> ViewDescriptorBuilder {
        ViewDescriptorBuilder::default()
    }

    /// Descriptor where every entry shares the same column and row stride.
    pub fn uniform(
        dtype: ElementType,
        rows: usize,
        cols: usize,
        offsets: Vec<u64>,
        col_stride: u64,
        row_stride: u64,
    ) -> Self {
        let count = offsets.len();
        Self {
            dtype,
            rows,
            cols,
            offsets,
            col_strides: vec![col_stride; count],
            row_strides: vec![row_stride; count],
        }
    }

    pub fn count(&self) -> usize {
        self.offsets.len()
    }

    /// One past the last byte touched by entry `index`.
    fn entry_end(&self, index: usize) -> Option<u64> {
        let last_col = (self.cols as u64 - 1).checked_mul(self.col_strides[index])?;
        let last_row = (self.rows as u64 - 1).checked_mul(self.row_strides[index])?;
        self.offsets[index]
            .checked_add(last_col)?
            .checked_add(last_row)?
            .checked_add(self.dtype.size() as u64)
    }

    /// Check the descriptor against a base matrix of `base_len` bytes.
    pub fn check(&self, base_len: usize) -> Result<()> {
        self.validate()
            .map_err(|e| HaloError::InvalidView(e.to_string()))?;
        self.validate_tables_len()?;

        let width = self.dtype.size() as u64;
        for index in 0..self.count() {
            let misaligned = [
                ("offset", self.offsets[index]),
                ("column stride", self.col_strides[index]),
                ("row stride", self.row_strides[index]),
            ]
            .into_iter()
            .find(|(_, value)| value % width != 0);

            if let Some((what, value)) = misaligned {
                return Err(HaloError::InvalidView(format!(
                    "entry {index}: {what} {value} is not a multiple of the {} element width",
                    self.dtype
                )));
            }

            let end = self.entry_end(index).ok_or_else(|| {
                HaloError::InvalidView(format!("entry {index}: extent overflows u64"))
            })?;
            if end > base_len as u64 {
                return Err(HaloError::OutOfBounds {
                    index,
                    end,
                    len: base_len,
                });
            }
        }
        Ok(())
    }

    fn validate_tables_len(&self) -> Result<()> {
        let n = self.offsets.len();
        if self.col_strides.len() != n || self.row_strides.len() != n {
            return Err(HaloError::InvalidView(format!(
                "offset and stride tables differ in length: offsets={n}, col_strides={}, row_strides={}",
                self.col_strides.len(),
                self.row_strides.len()
            )));
        }
        Ok(())
    }
}

/// A validated view bound to a device matrix, with its index tables resident
/// on the device.
pub struct IndirectView<D: Device> {
    descriptor: ViewDescriptor,
    base: Arc<D::Buffer>,
    offsets: Arc<D::Buffer>,
    col_strides: Arc<D::Buffer>,
    row_strides: Arc<D::Buffer>,
}

impl<D: Device> IndirectView<D> {
    /// Validate `descriptor` against `base` and upload its index tables.
    ///
    /// Rejects, with a configuration error, any entry that would read outside
    /// `base` or whose offset or strides are not element aligned.
    pub fn new(device: &D, base: Arc<D::Buffer>, descriptor: ViewDescriptor) -> Result<Self> {
        descriptor.check(base.size())?;

        let offsets = device.upload(&encode_indices(&descriptor.offsets))?;
        let col_strides = device.upload(&encode_indices(&descriptor.col_strides))?;
        let row_strides = device.upload(&encode_indices(&descriptor.row_strides))?;

        tracing::trace!(
            count = descriptor.count(),
            rows = descriptor.rows,
            cols = descriptor.cols,
            dtype = %descriptor.dtype,
            "created indirect view"
        );

        Ok(Self {
            descriptor,
            base,
            offsets,
            col_strides,
            row_strides,
        })
    }

    pub fn count(&self) -> usize {
        self.descriptor.count()
    }

    pub fn rows(&self) -> usize {
        self.descriptor.rows
    }

    pub fn cols(&self) -> usize {
        self.descriptor.cols
    }

    pub fn dtype(&self) -> ElementType {
        self.descriptor.dtype
    }

    pub fn descriptor(&self) -> &ViewDescriptor {
        &self.descriptor
    }

    pub fn base(&self) -> &Arc<D::Buffer> {
        &self.base
    }

    pub(crate) fn device_offsets(&self) -> &Arc<D::Buffer> {
        &self.offsets
    }

    pub(crate) fn device_col_strides(&self) -> &Arc<D::Buffer> {
        &self.col_strides
    }

    pub(crate) fn device_row_strides(&self) -> &Arc<D::Buffer> {
        &self.row_strides
    }
}

impl<D: Device> fmt::Debug for IndirectView<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndirectView")
            .field("count", &self.count())
            .field("rows", &self.rows())
            .field("cols", &self.cols())
            .field("dtype", &self.dtype())
            .field("base_bytes", &self.base.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    fn base(device: &HostDevice, bytes: usize) -> Arc<<HostDevice as Device>::Buffer> {
        device.alloc(bytes).unwrap()
    }

    #[test]
    fn test_builder_rejects_ragged_tables() {
        let err = ViewDescriptor::builder()
            .dtype(ElementType::F64)
            .rows(1)
            .cols(3)
            .offsets(vec![0, 24])
            .col_strides(vec![8])
            .row_strides(vec![0, 0])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("differ in length"));
    }

    #[test]
    fn test_builder_requires_shape() {
        let err = ViewDescriptor::builder()
            .dtype(ElementType::F32)
            .rows(2)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("cols"));
    }

    #[test]
    fn test_in_bounds_view_accepted() {
        let device = HostDevice::new();
        // two entries of 1x3 f64, entry stride 24 bytes: exactly 48 bytes
        let descriptor = ViewDescriptor::uniform(ElementType::F64, 1, 3, vec![0, 24], 8, 0);
        let view = IndirectView::new(device.as_ref(), base(&device, 48), descriptor).unwrap();
        assert_eq!(view.count(), 2);
        assert_eq!(view.base().size(), 48);
    }

    #[test]
    fn test_out_of_bounds_rejected_at_construction() {
        let device = HostDevice::new();
        let descriptor = ViewDescriptor::uniform(ElementType::F64, 1, 3, vec![0, 32], 8, 0);
        let err = IndirectView::new(device.as_ref(), base(&device, 48), descriptor).unwrap_err();
        assert!(matches!(
            err,
            HaloError::OutOfBounds {
                index: 1,
                end: 56,
                len: 48
            }
        ));
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn test_row_stride_counts_toward_extent() {
        let device = HostDevice::new();
        // 3x4 f32 block, columns 8 bytes apart, rows 40 bytes apart:
        // last element at 2*40 + 3*8 = 104, ends at 108
        let descriptor = ViewDescriptor::uniform(ElementType::F32, 3, 4, vec![0], 8, 40);
        assert!(IndirectView::new(device.as_ref(), base(&device, 108), descriptor.clone()).is_ok());
        assert!(matches!(
            IndirectView::new(device.as_ref(), base(&device, 104), descriptor),
            Err(HaloError::OutOfBounds { end: 108, .. })
        ));
    }

    #[test]
    fn test_misaligned_offset_rejected() {
        let device = HostDevice::new();
        let descriptor = ViewDescriptor::uniform(ElementType::F64, 1, 1, vec![4], 8, 0);
        let err = IndirectView::new(device.as_ref(), base(&device, 64), descriptor).unwrap_err();
        assert!(matches!(err, HaloError::InvalidView(_)));
    }

    #[test]
    fn test_overflowing_extent_rejected() {
        let device = HostDevice::new();
        let descriptor = ViewDescriptor::uniform(ElementType::F64, 1, 3, vec![0], u64::MAX - 7, 0);
        let err = IndirectView::new(device.as_ref(), base(&device, 64), descriptor).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_empty_view_is_valid() {
        let device = HostDevice::new();
        let descriptor = ViewDescriptor::uniform(ElementType::F32, 2, 2, Vec::new(), 4, 8);
        let view = IndirectView::new(device.as_ref(), base(&device, 0), descriptor).unwrap();
        assert_eq!(view.count(), 0);
    }
}
