use cfg_if::cfg_if;
use nalgebra::{DMatrix, DVector, RealField};
use num_traits::Float;

use super::{evaluate, MpFit, MpFunction, ParameterSpec, Side};
use crate::error::{MinimizationError, Result};
use crate::utils::{epsmch, to_f64};

/// Jacobian of the residuals with respect to the free parameters.
///
/// Columns of parameters with [`Side::Analytic`] are taken from one call to
/// [`MpFunction::jacobian`], all others are approximated by differences of
/// the residuals. The default step is `$\sqrt{\max(\mathtt{epsfcn},
/// \varepsilon)}\,|x_j|$`, or the square root itself for `$x_j = 0$`.
pub(super) fn jacobian<F, O>(
    config: &MpFit<F>,
    target: &mut O,
    xall: &DVector<F>,
    residuals: &DVector<F>,
    specs: &[ParameterSpec<F>],
    free: &[usize],
    evaluations: &mut usize,
) -> Result<DMatrix<F>>
where
    F: RealField + Float,
    O: MpFunction<F> + ?Sized,
{
    let m = residuals.len();
    let eps = Float::sqrt(Float::max(config.epsfcn, epsmch()));
    let mut jacobian = DMatrix::zeros(m, free.len());

    if free.iter().any(|i| specs[*i].side == Side::Analytic) {
        target.set_params(xall);
        let analytic = target.jacobian().ok_or_else(|| {
            MinimizationError::evaluation_failed("jacobian returned None", &to_f64(xall), None)
        })?;
        if analytic.shape() != (m, xall.len()) {
            return Err(MinimizationError::evaluation_failed(
                format!(
                    "expected a {}x{} Jacobian, got {}x{}",
                    m,
                    xall.len(),
                    analytic.nrows(),
                    analytic.ncols()
                ),
                &to_f64(xall),
                None,
            ));
        }
        for (j, &i) in free.iter().enumerate() {
            if specs[i].side == Side::Analytic {
                jacobian.set_column(j, &analytic.column(i));
            }
        }
    }

    let mut perturbed = xall.clone();
    let mut evaluate_at = |i: usize, value: F| -> Result<DVector<F>> {
        perturbed[i] = value;
        let result = evaluate(&mut *target, evaluations, &perturbed);
        perturbed[i] = xall[i];
        let values = result?;
        if values.len() != m {
            return Err(MinimizationError::evaluation_failed(
                "number of residuals changed",
                &to_f64(xall),
                None,
            ));
        }
        Ok(values)
    };

    for (j, &i) in free.iter().enumerate() {
        let spec = &specs[i];
        if spec.side == Side::Analytic {
            continue;
        }
        let x = xall[i];
        let mut h = match (spec.relative_step, spec.step) {
            (Some(relative), _) => Float::abs(relative * x),
            (None, Some(step)) => step,
            (None, None) => eps * Float::abs(x),
        };
        if h.is_zero() {
            h = eps;
        }
        let near_upper = spec.upper.map_or(false, |upper| x + h > upper);
        let near_lower = spec.lower.map_or(false, |lower| x - h < lower);

        let column = match spec.side {
            Side::TwoSided if !near_upper && !near_lower => {
                let forward = evaluate_at(i, x + h)?;
                let backward = evaluate_at(i, x - h)?;
                (forward - backward) / (h + h)
            }
            side => {
                let h = match side {
                    Side::Backward if !near_lower => -h,
                    Side::Forward | Side::TwoSided if near_upper => -h,
                    _ => h,
                };
                let values = evaluate_at(i, x + h)?;
                (values - residuals) / h
            }
        };
        jacobian.set_column(j, &column);
    }

    cfg_if! {
        if #[cfg(not(feature = "minpack-compat"))] {
            if jacobian.iter().any(|v| !Float::is_finite(*v)) {
                return Err(MinimizationError::evaluation_failed(
                    "Jacobian not finite",
                    &to_f64(xall),
                    None,
                ));
            }
        }
    }
    Ok(jacobian)
}
