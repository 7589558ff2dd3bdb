// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Gather kernel source.
//!
//! One work-item per view entry. Entry `i` reads its `nrv x ncv` block through
//! the per-entry byte offset and strides and writes it contiguously at element
//! `i * nrv * ncv` of the exchange matrix.

use super::{KernelKey, KernelSource};

pub(crate) const PACK_ENTRY: &str = "pack_view";

pub(crate) fn render_pack(key: KernelKey) -> KernelSource {
    let code = format!(
        r#"#define ALIGNB {alignment}

typedef {fpdtype} fpdtype_t;

extern "C" __global__ void pack_view(int n, int nrv, int ncv,
                                     const char* __restrict__ v,
                                     const unsigned long long* __restrict__ vix,
                                     const unsigned long long* __restrict__ vcstri,
                                     const unsigned long long* __restrict__ vrstri,
                                     fpdtype_t* __restrict__ m)
{{
    int i = blockIdx.x*blockDim.x + threadIdx.x;

    if (i < n)
    {{
        fpdtype_t* mi = (fpdtype_t*) __builtin_assume_aligned(m, ALIGNB)
                      + (size_t) i*nrv*ncv;
        const char* vi = v + vix[i];

        for (int r = 0; r < nrv; ++r)
            for (int c = 0; c < ncv; ++c)
                mi[r*ncv + c] = *(const fpdtype_t*) (vi + r*vrstri[i] + c*vcstri[i]);
    }}
}}
"#,
        alignment = key.alignment,
        fpdtype = key.dtype.kernel_type(),
    );

    KernelSource {
        entry: PACK_ENTRY.to_string(),
        code,
        key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::ElementType;

    #[test]
    fn test_render_is_specialized_on_key() {
        let source = render_pack(KernelKey {
            alignment: 64,
            dtype: ElementType::F64,
        });
        assert_eq!(source.entry, PACK_ENTRY);
        assert!(source.code.contains("#define ALIGNB 64"));
        assert!(source.code.contains("typedef double fpdtype_t;"));
        assert!(source.code.contains("void pack_view("));
    }

    #[test]
    fn test_half_types_move_raw_words() {
        for dtype in [ElementType::F16, ElementType::BF16] {
            let source = render_pack(KernelKey {
                alignment: 32,
                dtype,
            });
            assert!(source.code.contains("typedef unsigned short fpdtype_t;"));
        }
    }
}
