//! Stable reductions and hard decisions shared by every scoring site.
//!
//! All probabilistic scores in the model are log-likelihoods of soft values in
//! \([0,1]\). Logs are always taken of `p + EPSILON` so a hard zero never
//! produces \(-\infty\):
//! \[
//! \ell_{\text{bern}}(c, p) = c \log(p+\epsilon) + (1-c)\log(1-p+\epsilon),
//! \qquad
//! \ell_{\text{cat}}(c, p) = \sum_i c_i \log(p_i+\epsilon).
//! \]
//!
//! Reductions over alternatives (permutations, attention logits) use the
//! max-shifted log-sum-exp.

use candle_core::{DType, Tensor, D};

use crate::config::CheckMode;
use crate::error::{Error, Result};

/// Offset added before every `log` of a probability.
pub const EPSILON: f64 = 1e-7;

/// `log(Σ exp(x_i))` over a slice, stabilized by the maximum.
///
/// Returns `-∞` for an empty slice or when every entry is `-∞`.
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let mut m = f64::NEG_INFINITY;
    for &x in xs {
        if x > m {
            m = x;
        }
    }
    if !m.is_finite() {
        return f64::NEG_INFINITY;
    }
    let mut s = 0.0;
    for &x in xs {
        s += (x - m).exp();
    }
    m + s.ln()
}

/// `ln(n!)`, the log repetition factor of `n` indistinguishable slots.
pub fn ln_factorial(n: usize) -> f64 {
    (2..=n).map(|i| (i as f64).ln()).sum()
}

/// Log-sum-exp of `t` over `dim`, removing that dimension.
///
/// The shift by the max cancels analytically, so gradients flow through it unchanged.
pub fn log_sum_exp_dim(t: &Tensor, dim: usize) -> Result<Tensor> {
    let m = t.max_keepdim(dim)?;
    let s = t.broadcast_sub(&m)?.exp()?.sum_keepdim(dim)?.log()?;
    Ok((s + m)?.squeeze(dim)?)
}

/// Logistic sigmoid written through `tanh`, which stays finite for large logits.
pub fn sigmoid(t: &Tensor) -> Result<Tensor> {
    Ok(t.affine(0.5, 0.0)?.tanh()?.affine(0.5, 0.5)?)
}

/// `1 - t`.
pub fn complement(t: &Tensor) -> Result<Tensor> {
    Ok(t.affine(-1.0, 1.0)?)
}

/// Elementwise Bernoulli log-likelihood of `target` under probability `prob` (broadcasting).
///
/// A hard match scores `ln(1 + ε)`, which is slightly above zero.
pub fn bernoulli_log_likelihood(target: &Tensor, prob: &Tensor) -> Result<Tensor> {
    let on = prob.affine(1.0, EPSILON)?.log()?;
    let off = prob.affine(-1.0, 1.0 + EPSILON)?.log()?;
    let a = target.broadcast_mul(&on)?;
    let b = complement(target)?.broadcast_mul(&off)?;
    Ok(a.broadcast_add(&b)?)
}

/// Elementwise categorical log-likelihood terms `target * log(prob + ε)` (broadcasting).
///
/// Sum over the category axis to obtain the cross-entropy of one distribution.
pub fn categorical_log_likelihood(target: &Tensor, prob: &Tensor) -> Result<Tensor> {
    Ok(target.broadcast_mul(&prob.affine(1.0, EPSILON)?.log()?)?)
}

/// Snap independent probabilities to hard `{0, 1}` decisions.
pub fn independent_best(prob: &Tensor) -> Result<Tensor> {
    Ok(prob.ge(0.5)?.to_dtype(DType::F32)?)
}

/// Snap distributions over the last axis to one-hot vectors at their argmax.
pub fn categorical_best(prob: &Tensor) -> Result<Tensor> {
    let width = prob.dim(D::Minus1)?;
    let best = prob.argmax_keepdim(D::Minus1)?;
    let classes = Tensor::arange(0u32, width as u32, prob.device())?;
    Ok(best.broadcast_eq(&classes)?.to_dtype(DType::F32)?)
}

/// Closeness with absolute tolerance `1e-8` and relative tolerance `1e-5` of `b`.
pub fn is_close(a: f32, b: f32) -> bool {
    (a - b).abs() <= 1e-8 + 1e-5 * b.abs()
}

/// Fail with [`Error::NonFinite`] if `t` holds a NaN or infinity and strict checking is on.
pub fn check_finite(t: &Tensor, op: &'static str, mode: CheckMode) -> Result<()> {
    if mode == CheckMode::Off || t.elem_count() == 0 {
        return Ok(());
    }
    let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    if values.iter().any(|v| !v.is_finite()) {
        log::error!("non-finite value in output of {op}");
        return Err(Error::NonFinite { op });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use proptest::prelude::*;

    #[test]
    fn ln_factorial_small_values() {
        assert_eq!(ln_factorial(0), 0.0);
        assert_eq!(ln_factorial(1), 0.0);
        assert!((ln_factorial(3) - 6.0f64.ln()).abs() < 1e-12);
        assert!((ln_factorial(5) - 120.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn tensor_log_sum_exp_matches_slice_version() {
        let rows = [[0.5f32, -1.0, 2.0], [-30.0, -31.0, -29.5]];
        let t = Tensor::new(&rows, &Device::Cpu).unwrap();
        let got = log_sum_exp_dim(&t, 1).unwrap().to_vec1::<f32>().unwrap();
        for (row, g) in rows.iter().zip(got) {
            let xs: Vec<f64> = row.iter().map(|&x| x as f64).collect();
            let want = log_sum_exp(&xs);
            assert!((g as f64 - want).abs() < 1e-5, "got={} want={}", g, want);
        }
    }

    #[test]
    fn categorical_best_is_one_hot_at_argmax() {
        let p = Tensor::new(&[[0.2f32, 0.5, 0.3], [0.9, 0.05, 0.05]], &Device::Cpu).unwrap();
        let snapped = categorical_best(&p).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(snapped, vec![vec![0.0, 1.0, 0.0], vec![1.0, 0.0, 0.0]]);
    }

    #[test]
    fn check_finite_only_trips_in_strict_mode() {
        let t = Tensor::new(&[1.0f32, f32::NAN], &Device::Cpu).unwrap();
        assert!(check_finite(&t, "scores", CheckMode::Off).is_ok());
        match check_finite(&t, "scores", CheckMode::Nan) {
            Err(Error::NonFinite { op }) => assert_eq!(op, "scores"),
            other => panic!("expected NonFinite, got {:?}", other),
        }
    }

    #[test]
    fn bernoulli_log_likelihood_of_hard_match_is_near_zero() {
        let c = Tensor::new(&[1.0f32, 0.0], &Device::Cpu).unwrap();
        let p = Tensor::new(&[1.0f32, 0.0], &Device::Cpu).unwrap();
        let ll = bernoulli_log_likelihood(&c, &p).unwrap().to_vec1::<f32>().unwrap();
        for v in ll {
            assert!(v.abs() < 1e-5, "ll={}", v);
        }
    }

    proptest! {
        #[test]
        fn log_sum_exp_is_bounded_by_max_plus_ln_n(
            xs in prop::collection::vec(-50.0f64..50.0, 1..12)
        ) {
            let m = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let v = log_sum_exp(&xs);
            prop_assert!(v >= m - 1e-12);
            prop_assert!(v <= m + (xs.len() as f64).ln() + 1e-12);
        }

        #[test]
        fn sigmoid_stays_in_unit_interval(x in -200.0f32..200.0) {
            let t = Tensor::new(&[x], &Device::Cpu).unwrap();
            let s = sigmoid(&t).unwrap().to_vec1::<f32>().unwrap()[0];
            prop_assert!((0.0..=1.0).contains(&s), "s={}", s);
            let want = 1.0 / (1.0 + (-(x as f64)).exp());
            prop_assert!((s as f64 - want).abs() < 1e-5);
        }
    }
}
