//! Adaptive central differences for checking derivatives.
use nalgebra::Matrix3;

#[cfg(test)]
use approx::assert_relative_eq;

/// Ratio between consecutive step sizes.
const STEP_RATIO: f64 = 2.;

/// Derivative of `f` at `x` by an adaptive central difference quotient.
///
/// The initial step follows
///
/// > R. S. Stepleman and N. D. Winarsky. Adaptive Numerical Differentiation.
/// > Mathematics of Computation, Vol. 33, No. 148 (Oct., 1979), pp. 1257-1264.
///
/// The sequence of quotients for shrinking steps is then improved by a
/// Richardson extrapolation followed by Wynn's epsilon algorithm, and the
/// estimate with the smallest error (penalized for outliers) is returned.
///
/// Returns `None` if `f` fails at one of the trial points.
pub fn derivative(x: f64, f: impl Fn(f64) -> Option<f64>) -> Option<f64> {
    let p_cbrt = f64::EPSILON.cbrt();
    let quotient = |h: f64| Some((f(x + h)? - f(x - h)?) / (2. * h));

    let mut h = (1. + x.abs())
        .ln()
        .max(1.)
        .max(STEP_RATIO * p_cbrt * if x == 0. { 0.01 } else { x });

    // grow h until the difference f(x+h) - f(x-h) is above the noise level
    let (f1, f2) = (f(x + h)?, f(x - h)?);
    if f1 * f2 > 0. && f1 != f2 {
        let fx = match f(x)? {
            v if v == 0. => 1.,
            v => v,
        };
        let relative_difference = ((f1 - f2) / fx).abs();
        if relative_difference > 0. {
            let mut digits = -relative_difference.ln();
            while digits > -(p_cbrt * STEP_RATIO).ln() {
                h *= STEP_RATIO;
                digits -= STEP_RATIO.ln();
            }
        }
    }

    let mut quotients = vec![quotient(h)?];
    h /= STEP_RATIO;
    quotients.push(quotient(h)?);
    for i in 1.. {
        h /= STEP_RATIO;
        if x + h == x || h < f64::EPSILON {
            break;
        }
        let last = quotients[quotients.len() - 1];
        let before_last = quotients[quotients.len() - 2];
        let next = quotient(h)?;
        // rounding error starts to dominate
        if i >= 4 && (next - last).abs() > (last - before_last).abs() * 10. {
            break;
        }
        quotients.push(next);
    }
    extrapolate(&quotients)
}

fn extrapolate(quotients: &[f64]) -> Option<f64> {
    let estimates = richardson_extrapolate(quotients)?;
    if estimates.len() <= 2 {
        return estimates.last().copied();
    }
    least_error_estimate(wynn_extrapolate(&estimates))
}

/// Combine three consecutive quotients so that the `$h^2$` and `$h^4$`
/// error terms cancel.
fn richardson_extrapolate(quotients: &[f64]) -> Option<Vec<f64>> {
    if quotients.len() <= 3 {
        return quotients.last().map(|q| vec![*q]);
    }
    let term = |i: i32, j: i32| STEP_RATIO.powi(-i * (2 * j + 2));
    #[rustfmt::skip]
    let system = Matrix3::new(
        1., 1.,         1.,
        1., term(1, 0), term(2, 0),
        1., term(1, 1), term(2, 1),
    );
    let pinv = system.pseudo_inverse(f64::EPSILON).ok()?;
    let weights = pinv.column(0);
    Some(
        quotients
            .windows(3)
            .map(|q| weights[0] * q[0] + weights[1] * q[1] + weights[2] * q[2])
            .collect(),
    )
}

/// Wynn's epsilon algorithm, returning `(estimate, error)` pairs.
fn wynn_extrapolate(estimates: &[f64]) -> Vec<(f64, f64)> {
    let tiny = f64::MIN_POSITIVE;
    estimates
        .windows(3)
        .map(|e| {
            let (err1, err2) = ((e[1] - e[0]).abs(), (e[2] - e[1]).abs());
            let d1 = if err1 < tiny { tiny } else { e[1] - e[0] };
            let d2 = if err2 < tiny { tiny } else { e[2] - e[1] };
            let tol1 = e[1].abs().max(e[0].abs()) * f64::EPSILON;
            let tol2 = e[2].abs().max(e[1].abs()) * f64::EPSILON;
            let ss = d2.recip() - d1.recip() + tiny;
            let converged = (err1 <= tol1 && err2 <= tol2) || (ss * e[1]).abs() <= 1e-3;
            if converged {
                (e[2], err1 + err2 + tol2 * 10.)
            } else {
                let estimate = e[1] + ss.recip();
                (estimate, err1 + err2 + (estimate - e[2]).abs())
            }
        })
        .collect()
}

/// The estimate with the smallest error, where estimates far from the
/// median are penalized by their distance to it.
fn least_error_estimate(mut values: Vec<(f64, f64)>) -> Option<f64> {
    values.retain(|(estimate, _)| !estimate.is_nan());
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));
    let last = (values.len() - 1) as f64;
    let percentile = |p: f64| {
        let i = last * p;
        let w = i.fract();
        values[i.floor() as usize].0 * (1. - w) + values[i.ceil() as usize].0 * w
    };
    let p25 = percentile(0.25);
    let median = percentile(0.5).abs();
    let p75 = percentile(0.75);
    let fence = (p75 - p25).abs() * 1.5;

    let mut best = (1., f64::MAX);
    for &(estimate, error) in &values {
        let off_median = median > 1e-8
            && (estimate.abs() < median / 10. || estimate.abs() > median * 10.);
        let outside_fences = estimate < p25 - fence || p75 + fence < estimate;
        let error = if off_median || outside_fences {
            error + (estimate - median).abs()
        } else {
            error
        };
        if error < best.1 {
            best = (estimate, error);
        }
    }
    Some(best.0)
}

#[test]
fn test_linear() {
    assert_relative_eq!(
        derivative(0.123, |x| Some(3. * x - 1.)).unwrap(),
        3.,
        epsilon = 1e-12
    );
    assert_relative_eq!(
        derivative(0.0, |x| Some(-3. * x - 1.)).unwrap(),
        -3.,
        epsilon = 1e-12
    );
    assert_relative_eq!(derivative(0.2, |_| Some(1.)).unwrap(), 0.);
}

#[test]
fn test_standard_functions() {
    assert_relative_eq!(derivative(0., |x| Some(x.exp())).unwrap(), 1., epsilon = 1e-12);
    assert_relative_eq!(
        derivative(90., |x| Some(x.ln())).unwrap(),
        1. / 90.,
        epsilon = 1e-12
    );
    assert_relative_eq!(
        derivative(-34.233, |x| Some(x.sin())).unwrap(),
        (-34.233f64).cos(),
        epsilon = 1e-10
    );
}

#[test]
fn test_polynomial() {
    assert_relative_eq!(derivative(3., |x| Some(x * x)).unwrap(), 6., epsilon = 1e-10);
    assert_relative_eq!(
        derivative(2., |x| Some(4. * x * x - 2. * x)).unwrap(),
        14.,
        epsilon = 1e-10
    );
}

#[test]
fn test_failing_function() {
    assert!(derivative(1., |x| if x > 1.5 { None } else { Some(x) }).is_none());
}
