//! Symbolic dimensions and stride predicates.

use crate::runtime::contiguous_strides;

/// One entry of a symbolic shape: a static extent or a symbol id shared by
/// every dimension with the same run-time length. Symbol ids are negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymDim {
    Static(i64),
    Sym(i64),
}

impl SymDim {
    pub fn is_static(self) -> bool {
        matches!(self, SymDim::Static(_))
    }

    pub fn static_size(self) -> Option<i64> {
        match self {
            SymDim::Static(size) => Some(size),
            SymDim::Sym(_) => None,
        }
    }

    pub fn sym_id(self) -> Option<i64> {
        match self {
            SymDim::Static(_) => None,
            SymDim::Sym(id) => Some(id),
        }
    }
}

/// Static dims for a whole shape, or `None` if any entry is symbolic.
pub fn concrete_sizes(dims: &[SymDim]) -> Option<Vec<i64>> {
    dims.iter().map(|d| d.static_size()).collect()
}

pub fn static_dims(sizes: &[i64]) -> Vec<SymDim> {
    sizes.iter().map(|&s| SymDim::Static(s)).collect()
}

/// True if `strides` are the canonical strides of some permutation of
/// `sizes`: no two logical indices alias the same linear offset and there
/// are no gaps. Size-1 dimensions match any stride.
pub fn dense_and_non_overlapping(sizes: &[i64], strides: &[i64]) -> bool {
    if sizes.len() != strides.len() {
        return false;
    }
    let mut order: Vec<usize> = (0..sizes.len()).collect();
    order.sort_by_key(|&i| strides[i]);
    let mut expected = 1i64;
    for &i in &order {
        if sizes[i] == 1 {
            continue;
        }
        if strides[i] != expected {
            return false;
        }
        expected *= sizes[i];
    }
    true
}

/// True if `strides` are exactly the row-major strides of `sizes`.
pub fn is_contiguous_layout(sizes: &[i64], strides: &[i64]) -> bool {
    strides == contiguous_strides(sizes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_is_dense() {
        assert!(dense_and_non_overlapping(&[2, 3], &[3, 1]));
    }

    #[test]
    fn test_permuted_is_dense() {
        // Column-major layout of [2, 3].
        assert!(dense_and_non_overlapping(&[2, 3], &[1, 2]));
    }

    #[test]
    fn test_overlapping_is_not_dense() {
        assert!(!dense_and_non_overlapping(&[2, 3], &[0, 1]));
        assert!(!dense_and_non_overlapping(&[2, 3], &[1, 1]));
    }

    #[test]
    fn test_gapped_is_not_dense() {
        assert!(!dense_and_non_overlapping(&[2, 3], &[6, 2]));
    }

    #[test]
    fn test_size_one_matches_any_stride() {
        assert!(dense_and_non_overlapping(&[1, 4], &[4, 1]));
        assert!(dense_and_non_overlapping(&[1, 4], &[1, 1]));
    }
}
