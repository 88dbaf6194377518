//! Householder QR with column pivoting and the damped least-squares
//! solves built on it.
//!
//! The MPFIT kernel factors the Jacobian once per iteration and then solves
//! the damped problem for several trial diagonals, so the factorization is
//! kept and only the Givens elimination of the diagonal is repeated.
use nalgebra::{convert, DMatrix, DVector, RealField};
use num_traits::Float;

use crate::error::{MinimizationError, Result};
use crate::utils::{enorm, epsmch};

/// `$\mathbf{A}\mathbf{P} = \mathbf{Q}\mathbf{R}$` for a tall matrix `$\mathbf{A}\in\R^{m\times n}$`.
///
/// The column of largest remaining norm is moved to the front at every
/// step, so the diagonal of `$\mathbf{R}$` decreases in magnitude and a
/// rank deficiency shows up as trailing zeros.
pub struct PivotedQR<F> {
    column_norms: DVector<F>,
    /// Householder vectors below and on the diagonal, `$\mathbf{R}$` above it.
    factors: DMatrix<F>,
    r_diagonal: DVector<F>,
    /// `permutation[j]` is the column of `$\mathbf{A}$` stored at position `$j$`.
    permutation: Vec<usize>,
    scratch: DVector<F>,
}

impl<F: RealField + Float> PivotedQR<F> {
    /// Factor `a`.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `a` has fewer rows than columns.
    pub fn new(mut a: DMatrix<F>) -> Result<Self> {
        // column norm downdating as in LAPACK xGEQPF
        let (m, n) = a.shape();
        if m < n {
            return Err(MinimizationError::invalid_input(format!(
                "QR factorization needs at least as many rows as columns, got {m}x{n}"
            )));
        }
        let column_norms = DVector::from_iterator(n, (0..n).map(|j| enorm(a.column(j).iter().copied())));
        let mut r_diagonal = column_norms.clone();
        let mut scratch = column_norms.clone();
        let mut permutation: Vec<usize> = (0..n).collect();
        let z05: F = convert(0.05f64);
        for j in 0..n {
            // pivot
            let kmax = (j..n).fold(j, |kmax, k| if r_diagonal[k] > r_diagonal[kmax] { k } else { kmax });
            if kmax != j {
                a.swap_columns(j, kmax);
                permutation.swap(j, kmax);
                r_diagonal[kmax] = r_diagonal[j];
                scratch[kmax] = scratch[j];
            }

            // reflector that zeroes column j below the diagonal
            let mut aj_norm = enorm((j..m).map(|i| a[(i, j)]));
            if aj_norm.is_zero() {
                r_diagonal[j] = F::zero();
                continue;
            }
            if a[(j, j)] < F::zero() {
                aj_norm = -aj_norm;
            }
            for i in j..m {
                a[(i, j)] = a[(i, j)] / aj_norm;
            }
            a[(j, j)] = a[(j, j)] + F::one();

            // apply reflection to remaining columns
            for k in j + 1..n {
                let sum = (j..m).fold(F::zero(), |sum, i| sum + a[(i, j)] * a[(i, k)]);
                let temp = sum / a[(j, j)];
                for i in j..m {
                    a[(i, k)] = a[(i, k)] - temp * a[(i, j)];
                }
                // downdate the norm, recompute it once cancellation sets in
                if r_diagonal[k].is_zero() {
                    continue;
                }
                let temp = a[(j, k)] / r_diagonal[k];
                r_diagonal[k] = r_diagonal[k] * Float::sqrt(Float::max(F::one() - temp * temp, F::zero()));
                if z05 * Float::powi(r_diagonal[k] / scratch[k], 2) <= epsmch() {
                    r_diagonal[k] = enorm((j + 1..m).map(|i| a[(i, k)]));
                    scratch[k] = r_diagonal[k];
                }
            }
            r_diagonal[j] = -aj_norm;
        }
        Ok(Self {
            column_norms,
            factors: a,
            r_diagonal,
            permutation,
            scratch,
        })
    }

    /// Apply `$\mathbf{Q}^\top$` to the right hand side `b` and keep the
    /// factorization for damped solves.
    ///
    /// # Panics
    ///
    /// Panics if `b` does not have one entry per row of `$\mathbf{A}$`.
    pub fn into_damped_least_squares(
        mut self,
        mut b: DVector<F>,
    ) -> DampedLeastSquares<F> {
        let (m, n) = self.factors.shape();
        assert_eq!(b.len(), m, "right hand side has the wrong length");
        // leading n entries of Q^T b
        let mut qtb = DVector::zeros(n);
        for j in 0..n {
            let pivot = self.factors[(j, j)];
            if !pivot.is_zero() {
                let sum = (j..m).fold(F::zero(), |sum, i| sum + b[i] * self.factors[(i, j)]);
                let temp = -sum / pivot;
                for i in j..m {
                    b[i] = b[i] + temp * self.factors[(i, j)];
                }
            }
            qtb[j] = b[j];
        }
        self.factors.set_diagonal(&self.r_diagonal);
        DampedLeastSquares {
            qtb,
            column_norms: self.column_norms,
            packed: self.factors,
            l_diagonal: self.r_diagonal,
            permutation: self.permutation,
            scratch: self.scratch,
        }
    }
}

/// The damped linear least-squares problem
/// ```math
///   \min_{\vec{x}\in\R^n}\frac{1}{2}\Bigl\|
///     \begin{bmatrix}
///        \mathbf{A} \\
///        \mathbf{D}
///     \end{bmatrix}\vec{x} -
///     \begin{bmatrix}
///         \vec{b} \\
///         \vec{0}
///     \end{bmatrix}
///   \Bigr\|^2,
/// ```
/// with `$\mathbf{A}$` and `$\vec{b}$` fixed by
/// [`PivotedQR::into_damped_least_squares`] and a diagonal `$\mathbf{D}$`
/// that changes from solve to solve.
pub struct DampedLeastSquares<F> {
    qtb: DVector<F>,
    /// `$\mathbf{R}$` on and above the diagonal, `$\mathbf{L}$` strictly below.
    packed: DMatrix<F>,
    l_diagonal: DVector<F>,
    permutation: Vec<usize>,
    column_norms: DVector<F>,
    scratch: DVector<F>,
}

/// Triangular factor of the last solve of a [`DampedLeastSquares`].
pub struct CholeskyFactor<'a, F> {
    pub permutation: &'a [usize],
    l: &'a DMatrix<F>,
    scratch: &'a mut DVector<F>,
    qtb: &'a DVector<F>,
    lower: bool,
    l_diagonal: &'a DVector<F>,
}

impl<'a, F: RealField + Float> CholeskyFactor<'a, F> {
    /// `$\mathbf{L}^{-1}\mathbf{P}^\top\vec{b}$`, overwriting `rhs`.
    pub fn solve(&mut self, mut rhs: DVector<F>) -> DVector<F> {
        let n = self.scratch.len();
        for i in 0..n {
            self.scratch[i] = rhs[self.permutation[i]];
        }
        if self.lower {
            for j in 0..n {
                let x = self.scratch[j] / self.l_diagonal[j];
                self.scratch[j] = x;
                for i in j + 1..n {
                    self.scratch[i] = self.scratch[i] - x * self.l[(i, j)];
                }
            }
        } else {
            for j in 0..n {
                let sum = (0..j).fold(F::zero(), |sum, i| sum + self.scratch[i] * self.l[(i, j)]);
                self.scratch[j] = (self.scratch[j] - sum) / self.l[(j, j)];
            }
        }
        std::mem::swap(self.scratch, &mut rhs);
        rhs
    }

    /// `$\mathbf{L}\mathbf{Q}^\top\vec{b}$` into `out`.
    pub fn mul_qtb(&mut self, mut out: DVector<F>) -> DVector<F> {
        let n = self.qtb.len();
        out.fill(F::zero());
        if self.lower {
            for i in 0..n {
                for k in i + 1..n {
                    out[k] = out[k] + self.qtb[i] * self.l[(k, i)];
                }
                out[i] = out[i] + self.qtb[i] * self.l_diagonal[i];
            }
        } else {
            for i in 0..n {
                out[i] = (0..=i).fold(F::zero(), |sum, k| sum + self.qtb[k] * self.l[(k, i)]);
            }
        }
        out
    }
}

impl<F: RealField + Float> DampedLeastSquares<F> {
    /// Largest cosine between `$\vec{b}$` and a column of `$\mathbf{A}$`,
    /// ```math
    ///   \max_{i=1,\ldots,n}\frac{|(\mathbf{A}^\top \vec{b})_i|}{\|\mathbf{A}\vec{e}_i\|\,\|\vec{b}\|}.
    /// ```
    ///
    /// Zero columns are skipped. `None` if a term is `NaN`.
    pub fn max_scaled_correlation(&mut self, b_norm: F) -> Option<F> {
        let n = self.qtb.len();
        for i in 0..n {
            self.scratch[i] = self.qtb[i] / b_norm;
        }
        let mut max = F::zero();
        for j in 0..n {
            let scale = self.column_norms[self.permutation[j]];
            if scale.is_zero() {
                continue;
            }
            let sum = (0..=j).fold(F::zero(), |sum, i| sum + self.packed[(i, j)] * self.scratch[i]);
            let temp = Float::abs(sum / scale);
            if Float::is_nan(temp) {
                return None;
            }
            max = Float::max(max, temp);
        }
        Some(max)
    }

    /// `$\|\mathbf{A}\vec{x}\|$` from the stored `$\mathbf{R}$`.
    pub fn product_norm(&mut self, x: &DVector<F>) -> F {
        let n = self.qtb.len();
        self.scratch.fill(F::zero());
        for (j, idx) in self.permutation.iter().enumerate() {
            for i in 0..=j {
                self.scratch[i] = self.scratch[i] + x[*idx] * self.packed[(i, j)];
            }
        }
        enorm((0..n).map(|i| self.scratch[i]))
    }

    /// Solve
    /// ```math
    /// (\mathbf{A}^\top\mathbf{A} + \mathbf{D}^2)\vec{x} = \mathbf{A}^\top \vec{b}
    /// ```
    /// for `$\mathbf{D} = \mathrm{diag}(\mathtt{diag})$`.
    ///
    /// Also returns the factor `$\mathbf{L}$` of
    /// ```math
    ///   \mathbf{P}^\top(\mathbf{A}^\top\mathbf{A} + \mathbf{D}\mathbf{D})\mathbf{P} = \mathbf{L}\mathbf{L}^\top.
    /// ```
    pub fn solve_with_diagonal(
        &mut self,
        diag: &DVector<F>,
        mut out: DVector<F>,
    ) -> (DVector<F>, CholeskyFactor<'_, F>) {
        out.copy_from(&self.qtb);
        let mut rhs = self.rotate_in_diagonal(diag, out);
        std::mem::swap(&mut self.scratch, &mut rhs);
        self.solve_after_elimination(rhs)
    }

    /// The Gauss-Newton solution for `$\mathbf{D} = 0$`. Components beyond
    /// the numerical rank of `$\mathbf{R}$` are set to zero.
    pub fn solve_undamped(&mut self) -> (DVector<F>, CholeskyFactor<'_, F>) {
        let n = self.qtb.len();
        self.scratch.copy_from(&self.qtb);
        let rank = self.r_rank();
        for i in rank..n {
            self.scratch[i] = F::zero();
        }
        for j in (0..rank).rev() {
            let x = self.scratch[j] / self.packed[(j, j)];
            self.scratch[j] = x;
            for i in 0..j {
                self.scratch[i] = self.scratch[i] - self.packed[(i, j)] * x;
            }
        }
        let mut x = DVector::zeros(n);
        for j in 0..n {
            x[self.permutation[j]] = self.scratch[j];
        }
        let factor = CholeskyFactor {
            permutation: &self.permutation,
            l: &self.packed,
            scratch: &mut self.scratch,
            qtb: &self.qtb,
            lower: false,
            l_diagonal: &self.l_diagonal,
        };
        (x, factor)
    }

    /// Whether `$\mathbf{R}$` has no zero on its diagonal.
    pub fn has_full_rank(&self) -> bool {
        self.r_rank() == self.qtb.len()
    }

    /// The upper triangular factor `$\mathbf{R}$` as an `$n\times n$` matrix.
    pub fn r(&self) -> DMatrix<F> {
        let n = self.qtb.len();
        DMatrix::from_fn(n, n, |i, j| if i <= j { self.packed[(i, j)] } else { F::zero() })
    }

    /// Column permutation of the factorization.
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    /// Euclidean norms of the columns of `$\mathbf{A}$`, in the original order.
    pub fn column_norms(&self) -> &DVector<F> {
        &self.column_norms
    }

    fn r_rank(&self) -> usize {
        let n = self.qtb.len();
        (0..n)
            .position(|i| self.packed[(i, i)].is_zero())
            .unwrap_or(n)
    }

    fn rank(&self) -> usize {
        self.l_diagonal
            .iter()
            .position(|x| x.is_zero())
            .unwrap_or(self.l_diagonal.len())
    }

    fn solve_after_elimination(&mut self, mut x: DVector<F>) -> (DVector<F>, CholeskyFactor<'_, F>) {
        let n = self.qtb.len();
        let rank = self.rank();
        for i in rank..n {
            self.scratch[i] = F::zero();
        }

        // back substitution with L^T
        for j in (0..rank).rev() {
            let dot = (j + 1..rank).fold(F::zero(), |sum, i| sum + self.packed[(i, j)] * self.scratch[i]);
            self.scratch[j] = (self.scratch[j] - dot) / self.l_diagonal[j];
        }

        for j in 0..n {
            x[self.permutation[j]] = self.scratch[j];
        }
        let cholesky_factor = CholeskyFactor {
            l: &self.packed,
            scratch: &mut self.scratch,
            permutation: &self.permutation,
            qtb: &self.qtb,
            lower: true,
            l_diagonal: &self.l_diagonal,
        };
        (x, cholesky_factor)
    }

    fn rotate_in_diagonal(&mut self, diag: &DVector<F>, mut rhs: DVector<F>) -> DVector<F> {
        let n = self.qtb.len();
        // copy R^T below the diagonal, the rotations turn it into L
        for j in 0..n {
            for i in j + 1..n {
                self.packed[(i, j)] = self.packed[(j, i)];
            }
            self.scratch[j] = self.packed[(j, j)];
        }
        // rotate each row of D into the triangle
        let p5: F = convert(0.5);
        let p25: F = convert(0.25);
        for j in 0..n {
            let diag_entry = diag[self.permutation[j]];
            if !diag_entry.is_zero() {
                self.l_diagonal[j] = diag_entry;
                for k in j + 1..n {
                    self.l_diagonal[k] = F::zero();
                }

                let mut extra = F::zero();
                for k in j..n {
                    if self.l_diagonal[k].is_zero() {
                        continue;
                    }
                    let r_kk = self.packed[(k, k)];
                    let (sin, cos) = if Float::abs(r_kk) < Float::abs(self.l_diagonal[k]) {
                        let cot = r_kk / self.l_diagonal[k];
                        let sin = p5 / Float::sqrt(p25 + p25 * (cot * cot));
                        (sin, sin * cot)
                    } else {
                        let tan = self.l_diagonal[k] / r_kk;
                        let cos = p5 / Float::sqrt(p25 + p25 * (tan * tan));
                        (cos * tan, cos)
                    };
                    self.packed[(k, k)] = cos * r_kk + sin * self.l_diagonal[k];
                    let temp = cos * rhs[k] + sin * extra;
                    extra = -sin * rhs[k] + cos * extra;
                    rhs[k] = temp;

                    // rest of row k
                    for i in k + 1..n {
                        let r_ik = self.packed[(i, k)];
                        let temp = cos * r_ik + sin * self.l_diagonal[i];
                        self.l_diagonal[i] = -sin * r_ik + cos * self.l_diagonal[i];
                        self.packed[(i, k)] = temp;
                    }
                }
            }
            self.l_diagonal[j] = self.packed[(j, j)];
            self.packed[(j, j)] = self.scratch[j];
        }
        rhs
    }
}
