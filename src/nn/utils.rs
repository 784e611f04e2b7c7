use anyhow::{Error, Result};
use ndarray::{prelude::*, Zip};
use ndarray_rand::RandomExt;
use num::Float;
use rand::Rng;
use rand_distr::{Normal, Uniform};

/// Central difference estimate of `d f(x) / d x`, one row per input element
/// and one column per output element.
fn numeric_jacobian(x: &Array1<f64>, f: impl Fn(&Array1<f64>) -> Array1<f64>, h: f64, outputs: usize) -> Array2<f64> {
    let mut shifted = x.clone();
    let mut jac = Array2::<f64>::zeros((x.len(), outputs));
    for (i, mut row) in jac.outer_iter_mut().enumerate() {
        shifted[i] = x[i] + h;
        let up = f(&shifted);
        shifted[i] = x[i] - h;
        let down = f(&shifted);
        shifted[i] = x[i];
        Zip::from(&mut row).and(&up).and(&down).for_each(|j, u, d| *j = (u - d) / (2.0 * h));
    }
    jac
}

/// Checks a hand written backward `df` against finite differences of `f`.
/// `df` maps an output gradient to an input gradient, so feeding it each unit
/// vector in turn recovers one column of the jacobian. Entries agree when
/// `|analytic - numeric| <= atol + rtol * |numeric|`. Defaults: `h = 1e-6`,
/// `atol = 1e-5`, `rtol = 1e-3`.
pub fn grad_check(
    input: Array1<f64>,
    f: impl Fn(&Array1<f64>) -> Array1<f64>,
    df: impl Fn(&Array1<f64>) -> Array1<f64>,
    h: Option<f64>,
    atol: Option<f64>,
    rtol: Option<f64>,
) -> Result<()> {
    let (h, atol, rtol) = (h.unwrap_or(1e-6), atol.unwrap_or(1e-5), rtol.unwrap_or(1e-3));

    let outputs = f(&input).len();
    let mut unit = Array1::<f64>::zeros(outputs);
    let width = df(&unit).len();
    if width != input.len() {
        return Err(Error::msg(format!(
            "backward returns {width} values for an input of {}",
            input.len()
        )));
    }
    let numeric = numeric_jacobian(&input, f, h, outputs);

    for (col, expected) in numeric.axis_iter(Axis(1)).enumerate() {
        unit[col] = 1.0;
        let analytic = df(&unit);
        unit[col] = 0.0;
        if let Some(row) = (0..width).find(|r| (analytic[*r] - expected[*r]).abs() > atol + rtol * expected[*r].abs()) {
            return Err(Error::msg(format!(
                "output {col}, input {row}: analytic {} vs numeric {}",
                analytic[row], expected[row]
            )));
        }
    }
    Ok(())
}

pub fn isclose<D: Dimension, A: Float>(a: &Array<A, D>, b: &Array<A, D>) -> bool {
    let rtol = A::from(1e-5).unwrap();
    let atol = A::from(1e-6).unwrap();
    a.shape() == b.shape()
        && a.iter().zip(b.iter()).all(|(i, j)| (*i - *j).abs() <= atol + rtol * j.abs())
}

/// He normal initialisation for a [fan_out, fan_in] weight matrix
pub fn he_normal(fan_out: usize, fan_in: usize) -> Result<Array2<f32>> {
    let std = (2.0 / fan_in.max(1) as f32).sqrt();
    Ok(Array2::random((fan_out, fan_in), Normal::new(0.0, std)?))
}

/// Inverted dropout mask, kept entries scaled by 1 / keep so the expected
/// activation is unchanged.
pub fn dropout_mask<R: Rng>(shape: (usize, usize), keep: f32, rng: &mut R) -> Array2<f32> {
    let scale = 1.0 / keep;
    Array2::random_using(shape, Uniform::new(0.0f32, 1.0), rng).mapv_into(|u| if u < keep { scale } else { 0.0 })
}

#[test]
fn test_grad_check() {
    fn test_grad_check_pointwise(f: impl Fn(f64) -> f64, df: impl Fn(f64) -> f64, elems: usize) {
        let f = |x: &Array1<f64>| x.map(|x| f(*x));

        let x = Array1::random(elems, Normal::new(0.0, 1.0).unwrap());
        let df_ = |grad: &Array1<f64>| x.iter().zip(grad.iter()).map(|(x, g)| g * df(*x)).collect();
        grad_check(x.clone(), f, df_, None, None, None).unwrap();
    }

    test_grad_check_pointwise(|x| 2.0 * x + 3.0 * x * x + 1.0, |x| 2.0 + 6.0 * x, 32);
    test_grad_check_pointwise(|x| x.sin() * x.exp(), |x| x.cos() * x.exp() + x.sin() * x.exp(), 32);

    // a wrong derivative is caught
    let x = Array1::random(8, Normal::new(0.0, 1.0).unwrap());
    let wrong = grad_check(x, |x| x.map(|v| v * v), |g| g.clone(), None, None, None);
    assert!(wrong.is_err());
}

#[test]
fn test_dropout_mask() {
    use rand::{rngs::StdRng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(7);
    let mask = dropout_mask((64, 64), 0.5, &mut rng);
    assert!(mask.iter().all(|m| *m == 0.0 || *m == 2.0));
    let kept = mask.iter().filter(|m| **m > 0.0).count();
    // 4096 draws at p = 0.5, far outside this band is a broken mask
    assert!(kept > 1500 && kept < 2600);

    assert!(dropout_mask((3, 3), 1.0, &mut rng).iter().all(|m| *m == 1.0));
}

#[test]
fn test_he_normal() {
    let w = he_normal(16, 8).unwrap();
    assert_eq!(w.dim(), (16, 8));
    assert!(isclose(&w, &w.clone()));
    assert!(!isclose(&w, &(&w + 1.0)));
}
