// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use super::{ExchangeMatrix, IndirectView};
use crate::device::Device;
use crate::error::{HaloError, Result};

/// A boundary dataset: an indirect view paired with the exchange matrix it is
/// packed into. Both halves are shared, not owned.
pub struct ExchangeView<D: Device> {
    view: Arc<IndirectView<D>>,
    matrix: Arc<ExchangeMatrix<D>>,
}

impl<D: Device> ExchangeView<D> {
    /// Pair a view with a matrix of the same element type and shape.
    pub fn new(view: Arc<IndirectView<D>>, matrix: Arc<ExchangeMatrix<D>>) -> Result<Self> {
        if view.dtype() != matrix.dtype() {
            return Err(HaloError::ElementTypeMismatch {
                expected: matrix.dtype(),
                actual: view.dtype(),
            });
        }

        if (view.count(), view.rows(), view.cols())
            != (matrix.count(), matrix.rows(), matrix.cols())
        {
            return Err(HaloError::ShapeMismatch {
                view_count: view.count(),
                view_rows: view.rows(),
                view_cols: view.cols(),
                matrix_count: matrix.count(),
                matrix_rows: matrix.rows(),
                matrix_cols: matrix.cols(),
            });
        }

        Ok(Self { view, matrix })
    }

    /// Allocate a matching exchange matrix for `view`.
    pub fn allocate(device: &D, view: Arc<IndirectView<D>>, alignment: usize) -> Result<Self> {
        let matrix = ExchangeMatrix::new(
            device,
            view.dtype(),
            view.count(),
            view.rows(),
            view.cols(),
            alignment,
        )?;
        Self::new(view, Arc::new(matrix))
    }

    pub fn view(&self) -> &Arc<IndirectView<D>> {
        &self.view
    }

    pub fn matrix(&self) -> &Arc<ExchangeMatrix<D>> {
        &self.matrix
    }
}

impl<D: Device> Clone for ExchangeView<D> {
    fn clone(&self) -> Self {
        Self {
            view: self.view.clone(),
            matrix: self.matrix.clone(),
        }
    }
}

impl<D: Device> fmt::Debug for ExchangeView<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeView")
            .field("view", &self.view)
            .field("matrix", &self.matrix)
            .finish()
    }
}

/// Anything that carries an exchange matrix.
///
/// Transfer and unpack kernels only need the staging matrix; callers may hand
/// them either the matrix itself or the exchange view wrapping it.
pub enum Exchangeable<'a, D: Device> {
    Matrix(&'a Arc<ExchangeMatrix<D>>),
    View(&'a ExchangeView<D>),
}

impl<'a, D: Device> Exchangeable<'a, D> {
    pub fn xchg_matrix(&self) -> &'a Arc<ExchangeMatrix<D>> {
        match *self {
            Exchangeable::Matrix(matrix) => matrix,
            Exchangeable::View(view) => view.matrix(),
        }
    }
}

impl<'a, D: Device> From<&'a Arc<ExchangeMatrix<D>>> for Exchangeable<'a, D> {
    fn from(matrix: &'a Arc<ExchangeMatrix<D>>) -> Self {
        Exchangeable::Matrix(matrix)
    }
}

impl<'a, D: Device> From<&'a ExchangeView<D>> for Exchangeable<'a, D> {
    fn from(view: &'a ExchangeView<D>) -> Self {
        Exchangeable::View(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use crate::dtype::ElementType;
    use crate::layout::ViewDescriptor;

    fn view(device: &HostDevice, dtype: ElementType) -> Arc<IndirectView<HostDevice>> {
        let base = device.alloc(256).unwrap();
        let width = dtype.size() as u64;
        let descriptor = ViewDescriptor::uniform(dtype, 1, 3, vec![0, 3 * width], width, 0);
        Arc::new(IndirectView::new(device, base, descriptor).unwrap())
    }

    #[test]
    fn test_allocate_matches_view() {
        let device = HostDevice::new();
        let xchg = ExchangeView::allocate(device.as_ref(), view(&device, ElementType::F64), 32)
            .unwrap();
        assert_eq!(xchg.matrix().count(), 2);
        assert_eq!(xchg.matrix().cols(), 3);
        assert_eq!(xchg.matrix().bytes(), 48);
    }

    #[test]
    fn test_element_type_mismatch_rejected() {
        let device = HostDevice::new();
        let matrix =
            ExchangeMatrix::new(device.as_ref(), ElementType::F32, 2, 1, 3, 32).unwrap();
        let err = ExchangeView::new(view(&device, ElementType::F64), Arc::new(matrix)).unwrap_err();
        assert!(matches!(
            err,
            HaloError::ElementTypeMismatch {
                expected: ElementType::F32,
                actual: ElementType::F64
            }
        ));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let device = HostDevice::new();
        let matrix =
            ExchangeMatrix::new(device.as_ref(), ElementType::F64, 3, 1, 3, 32).unwrap();
        let err = ExchangeView::new(view(&device, ElementType::F64), Arc::new(matrix)).unwrap_err();
        assert!(matches!(err, HaloError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_exchangeable_resolves_matrix() {
        let device = HostDevice::new();
        let xchg = ExchangeView::allocate(device.as_ref(), view(&device, ElementType::F32), 32)
            .unwrap();

        let from_view = Exchangeable::from(&xchg);
        let from_matrix = Exchangeable::from(xchg.matrix());
        assert!(Arc::ptr_eq(from_view.xchg_matrix(), xchg.matrix()));
        assert!(Arc::ptr_eq(from_matrix.xchg_matrix(), xchg.matrix()));
    }
}
