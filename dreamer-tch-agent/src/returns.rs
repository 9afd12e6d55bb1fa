//! Bootstrapped multi-step return estimation.
//!
//! Shared by both behavior learners. All tensors here are time-major:
//! dimension 0 is time, everything after is batch.
use tch::Tensor;

/// Generalized lambda-return.
///
/// Takes `reward`, `value` and `discount` sequences of equal time length T
/// (time-major), plus a `bootstrap` value estimate for the step beyond the
/// horizon, and folds strictly backward in time:
///
/// `R[t] = reward[t] + discount[t] * ((1 - lambda) * value[t+1] + lambda * R[t+1])`
///
/// seeded with `R[T] = bootstrap`, where `value[t+1]` is the next element of
/// `value` or `bootstrap` at the end. `lambda = 0` reduces to the one-step TD
/// target, `lambda = 1` to the Monte-Carlo return bootstrapped at the
/// horizon. The fold cannot be parallelized over time; each step consumes
/// the previous output.
pub fn lambda_return(
    reward: &Tensor,
    value: &Tensor,
    discount: &Tensor,
    bootstrap: &Tensor,
    lambda: f64,
) -> Tensor {
    let horizon = reward.size()[0];
    debug_assert_eq!(value.size()[0], horizon);
    debug_assert_eq!(discount.size()[0], horizon);

    // value shifted one step ahead of reward/discount
    let next_values = Tensor::cat(
        &[value.slice(0, 1, horizon, 1), bootstrap.unsqueeze(0)],
        0,
    );
    let inputs = reward + discount * (1.0 - lambda) * &next_values;

    let mut last = bootstrap.shallow_clone();
    let mut outputs = Vec::with_capacity(horizon as usize);
    for t in (0..horizon).rev() {
        last = inputs.get(t) + discount.get(t) * lambda * &last;
        outputs.push(last.shallow_clone());
    }
    outputs.reverse();
    Tensor::stack(&outputs, 0)
}

/// Cumulative-product discount weights for loss aggregation.
///
/// `weights[0] = 1` and `weights[t] = prod(discount[0..t])`, detached. They
/// down-weight losses at timesteps reached through low-continuation paths.
pub fn discount_weights(discount: &Tensor) -> Tensor {
    let horizon = discount.size()[0];
    let shifted = Tensor::cat(
        &[
            discount.slice(0, 0, 1, 1).ones_like(),
            discount.slice(0, 0, horizon - 1, 1),
        ],
        0,
    );
    shifted.cumprod(0, tch::Kind::Float).detach()
}

#[cfg(test)]
mod tests {
    use super::{discount_weights, lambda_return};
    use tch::Tensor;

    fn t(v: &[f32]) -> Tensor {
        Tensor::from_slice(v)
    }

    #[test]
    fn test_lambda_zero_is_one_step_td() {
        let reward = t(&[1.0, 2.0, 3.0]);
        let value = t(&[10.0, 20.0, 30.0]);
        let discount = t(&[0.9, 0.9, 0.9]);
        let bootstrap = Tensor::from(40f32);
        let ret = lambda_return(&reward, &value, &discount, &bootstrap, 0.0);
        // R[t] = r[t] + d[t] * v[t+1], with bootstrap as the last next-value
        assert!((ret.double_value(&[0]) - (1.0 + 0.9 * 20.0)).abs() < 1e-5);
        assert!((ret.double_value(&[1]) - (2.0 + 0.9 * 30.0)).abs() < 1e-5);
        assert!((ret.double_value(&[2]) - (3.0 + 0.9 * 40.0)).abs() < 1e-5);
    }

    #[test]
    fn test_lambda_one_is_monte_carlo() {
        let reward = t(&[1.0, 2.0, 3.0]);
        let value = t(&[-5.0, -6.0, -7.0]); // must not contribute
        let discount = t(&[0.5, 0.5, 0.5]);
        let bootstrap = Tensor::from(8f32);
        let ret = lambda_return(&reward, &value, &discount, &bootstrap, 1.0);
        let r2 = 3.0 + 0.5 * 8.0;
        let r1 = 2.0 + 0.5 * r2;
        let r0 = 1.0 + 0.5 * r1;
        assert!((ret.double_value(&[2]) - r2).abs() < 1e-5);
        assert!((ret.double_value(&[1]) - r1).abs() < 1e-5);
        assert!((ret.double_value(&[0]) - r0).abs() < 1e-5);
    }

    #[test]
    fn test_discount_weights() {
        let discount = t(&[0.5, 0.5, 1.0]);
        let w = discount_weights(&discount);
        assert!((w.double_value(&[0]) - 1.0).abs() < 1e-6);
        assert!((w.double_value(&[1]) - 0.5).abs() < 1e-6);
        assert!((w.double_value(&[2]) - 0.25).abs() < 1e-6);
        assert!(!w.requires_grad());
    }
}
