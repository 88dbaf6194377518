use nalgebra::{DMatrix, DVector, RealField};
use num_traits::Float;

/// Covariance `$(\mathbf{J}^\top\mathbf{J})^{-1}$` from the pivoted QR factors.
///
/// `r` is the upper triangular factor of `$\mathbf{J}\mathbf{P} = \mathbf{Q}\mathbf{R}$`
/// and `permutation` the column permutation. Columns `$k$` with
/// `$|r_{kk}| \leq \mathtt{tol}\,|r_{11}|$` and all following ones are
/// treated as linearly dependent and get zero rows and columns.
///
/// This resembles `COVAR` from `MINPACK`.
pub(super) fn covariance<F>(mut r: DMatrix<F>, permutation: &[usize], tol: F) -> DMatrix<F>
where
    F: RealField + Float,
{
    let n = r.ncols();
    if n == 0 {
        return r;
    }
    let tolr = tol * Float::abs(r[(0, 0)]);

    // invert R in place
    let mut rank = 0;
    for k in 0..n {
        if Float::abs(r[(k, k)]) <= tolr {
            break;
        }
        r[(k, k)] = F::one() / r[(k, k)];
        for j in 0..k {
            let temp = r[(k, k)] * r[(j, k)];
            r[(j, k)] = F::zero();
            for i in 0..=j {
                r[(i, k)] = r[(i, k)] - temp * r[(i, j)];
            }
        }
        rank = k + 1;
    }

    // upper triangle of inverse(R^T R)
    for k in 0..rank {
        for j in 0..k {
            let temp = r[(j, k)];
            for i in 0..=j {
                r[(i, j)] = r[(i, j)] + temp * r[(i, k)];
            }
        }
        let temp = r[(k, k)];
        for i in 0..=k {
            r[(i, k)] = r[(i, k)] * temp;
        }
    }

    // undo the permutation into the lower triangle
    let mut diagonal = DVector::zeros(n);
    for j in 0..n {
        let jj = permutation[j];
        let singular = j >= rank;
        for i in 0..=j {
            if singular {
                r[(i, j)] = F::zero();
            }
            let ii = permutation[i];
            if ii > jj {
                r[(ii, jj)] = r[(i, j)];
            } else if ii < jj {
                r[(jj, ii)] = r[(i, j)];
            }
        }
        diagonal[jj] = r[(j, j)];
    }

    for j in 0..n {
        for i in 0..j {
            r[(i, j)] = r[(j, i)];
        }
        r[(j, j)] = diagonal[j];
    }
    r
}
