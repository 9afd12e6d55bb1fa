//! Distribution objects over tensors.
//!
//! tch does not ship a distributions module, so the few families the learning
//! core needs are implemented here with plain tensor math: diagonal Gaussians,
//! Bernoulli over logits, and sets of one-hot categoricals with
//! straight-through sampling. Batch dimensions are arbitrary; `event_dims`
//! counts how many trailing dimensions are summed by `log_prob`/`entropy`.
use tch::{Kind, Tensor};

const LOG_2PI: f64 = 1.8378770664093453;

fn sum_event(t: &Tensor, event_dims: usize) -> Tensor {
    if event_dims == 0 {
        t.shallow_clone()
    } else {
        t.flatten(-(event_dims as i64), -1)
            .sum_dim_intlist(-1, false, Kind::Float)
    }
}

/// Diagonal Gaussian.
pub struct Normal {
    pub mean: Tensor,
    pub std: Tensor,
    event_dims: usize,
}

impl Normal {
    pub fn new(mean: Tensor, std: Tensor, event_dims: usize) -> Self {
        Self {
            mean,
            std,
            event_dims,
        }
    }

    /// Reparameterized sample.
    pub fn sample(&self) -> Tensor {
        &self.mean + &self.std * self.mean.randn_like()
    }

    pub fn mode(&self) -> Tensor {
        self.mean.shallow_clone()
    }

    pub fn mean(&self) -> Tensor {
        self.mean.shallow_clone()
    }

    pub fn log_prob(&self, x: &Tensor) -> Tensor {
        let z = (x - &self.mean) / &self.std;
        let lp: Tensor = -0.5 * z.pow_tensor_scalar(2) - self.std.log() - 0.5 * LOG_2PI;
        sum_event(&lp, self.event_dims)
    }

    pub fn entropy(&self) -> Tensor {
        let e: Tensor = 0.5 * (1.0 + LOG_2PI) + self.std.log();
        sum_event(&e, self.event_dims)
    }

    /// KL(self ‖ other), elementwise over batch dimensions.
    pub fn kl(&self, other: &Normal) -> Tensor {
        let var_ratio = (&self.std / &other.std).pow_tensor_scalar(2);
        let t1 = ((&self.mean - &other.mean) / &other.std).pow_tensor_scalar(2);
        let kl: Tensor = 0.5 * (var_ratio.shallow_clone() + t1 - 1.0) - var_ratio.log() * 0.5;
        sum_event(&kl, self.event_dims)
    }

    pub fn detach(&self) -> Normal {
        Normal {
            mean: self.mean.detach(),
            std: self.std.detach(),
            event_dims: self.event_dims,
        }
    }
}

/// Bernoulli over logits, used by the continuation head.
pub struct Bernoulli {
    pub logits: Tensor,
    event_dims: usize,
}

impl Bernoulli {
    pub fn new(logits: Tensor, event_dims: usize) -> Self {
        Self { logits, event_dims }
    }

    pub fn sample(&self) -> Tensor {
        let probs = self.logits.sigmoid();
        probs.bernoulli().to_kind(Kind::Float)
    }

    pub fn mode(&self) -> Tensor {
        self.logits
            .sigmoid()
            .gt(0.5)
            .to_kind(Kind::Float)
    }

    pub fn mean(&self) -> Tensor {
        self.logits.sigmoid()
    }

    pub fn log_prob(&self, x: &Tensor) -> Tensor {
        let lp = x * self.logits.log_sigmoid() + (1.0 - x) * (-&self.logits).log_sigmoid();
        sum_event(&lp, self.event_dims)
    }

    pub fn entropy(&self) -> Tensor {
        let p = self.logits.sigmoid();
        let e = -(&p * self.logits.log_sigmoid() + (1.0 - &p) * (-&self.logits).log_sigmoid());
        sum_event(&e, self.event_dims)
    }
}

/// A set of independent one-hot categorical distributions.
///
/// `logits` has shape `(..., k)` with `independent` extra trailing batch
/// dimensions treated as event dimensions (e.g. the group axis of a discrete
/// latent). Sampling is straight-through: the sample is one-hot in the
/// forward pass and carries the probability gradient in the backward pass.
pub struct OneHotCategorical {
    pub logits: Tensor,
    independent: usize,
}

impl OneHotCategorical {
    pub fn new(logits: Tensor, independent: usize) -> Self {
        Self {
            logits: logits.log_softmax(-1, Kind::Float),
            independent,
        }
    }

    /// Mixes the softmax of `logits` with a uniform distribution.
    ///
    /// `unimix` is the probability mass given to the uniform component, which
    /// keeps every class reachable during exploration.
    pub fn with_unimix(logits: Tensor, unimix: f64, independent: usize) -> Self {
        let logits = if unimix > 0.0 {
            let k = *logits.size().last().unwrap() as f64;
            let probs: Tensor = (1.0 - unimix) * logits.softmax(-1, Kind::Float) + unimix / k;
            probs.log()
        } else {
            logits
        };
        Self::new(logits, independent)
    }

    pub fn probs(&self) -> Tensor {
        self.logits.exp()
    }

    /// Straight-through gradient sample.
    pub fn sample(&self) -> Tensor {
        let probs = self.probs();
        let shape = probs.size();
        let k = *shape.last().unwrap();
        let flat = probs.reshape(&[-1, k][..]);
        let index = flat.multinomial(1, true).squeeze_dim(-1);
        let one_hot = index
            .one_hot(k)
            .to_kind(Kind::Float)
            .reshape(shape.as_slice());
        one_hot + &probs - probs.detach()
    }

    pub fn mode(&self) -> Tensor {
        let k = *self.logits.size().last().unwrap();
        self.logits
            .argmax(-1, false)
            .one_hot(k)
            .to_kind(Kind::Float)
    }

    pub fn mean(&self) -> Tensor {
        self.probs()
    }

    /// Log-probability of a one-hot (or straight-through) value.
    pub fn log_prob(&self, x: &Tensor) -> Tensor {
        let lp = (x * &self.logits).sum_dim_intlist(-1, false, Kind::Float);
        sum_event(&lp, self.independent)
    }

    pub fn entropy(&self) -> Tensor {
        let e = -(self.probs() * &self.logits).sum_dim_intlist(-1, false, Kind::Float);
        sum_event(&e, self.independent)
    }

    /// KL(self ‖ other), elementwise over batch dimensions.
    pub fn kl(&self, other: &OneHotCategorical) -> Tensor {
        let kl = (self.probs() * (&self.logits - &other.logits)).sum_dim_intlist(
            -1,
            false,
            Kind::Float,
        );
        sum_event(&kl, self.independent)
    }

    pub fn detach(&self) -> OneHotCategorical {
        OneHotCategorical {
            logits: self.logits.detach(),
            independent: self.independent,
        }
    }
}

/// Distribution object returned by networks of the learning core.
///
/// Prediction heads, the dynamics model and the actor all hand one of these
/// to their callers.
pub enum Dist {
    Normal(Normal),
    Bernoulli(Bernoulli),
    OneHot(OneHotCategorical),
}

impl Dist {
    pub fn sample(&self) -> Tensor {
        match self {
            Dist::Normal(d) => d.sample(),
            Dist::Bernoulli(d) => d.sample(),
            Dist::OneHot(d) => d.sample(),
        }
    }

    pub fn mode(&self) -> Tensor {
        match self {
            Dist::Normal(d) => d.mode(),
            Dist::Bernoulli(d) => d.mode(),
            Dist::OneHot(d) => d.mode(),
        }
    }

    pub fn mean(&self) -> Tensor {
        match self {
            Dist::Normal(d) => d.mean(),
            Dist::Bernoulli(d) => d.mean(),
            Dist::OneHot(d) => d.mean(),
        }
    }

    pub fn log_prob(&self, x: &Tensor) -> Tensor {
        match self {
            Dist::Normal(d) => d.log_prob(x),
            Dist::Bernoulli(d) => d.log_prob(x),
            Dist::OneHot(d) => d.log_prob(x),
        }
    }

    pub fn entropy(&self) -> Tensor {
        match self {
            Dist::Normal(d) => d.entropy(),
            Dist::Bernoulli(d) => d.entropy(),
            Dist::OneHot(d) => d.entropy(),
        }
    }

    /// KL(self ‖ other). Both sides must be the same family.
    pub fn kl(&self, other: &Dist) -> Tensor {
        match (self, other) {
            (Dist::Normal(p), Dist::Normal(q)) => p.kl(q),
            (Dist::OneHot(p), Dist::OneHot(q)) => p.kl(q),
            _ => panic!("KL between distributions of different families"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Normal, OneHotCategorical};
    use tch::{Device, Kind, Tensor};

    #[test]
    fn test_normal_log_prob_standard() {
        // N(0, 1) at 0: -0.5 * ln(2*pi)
        let mean = Tensor::zeros(&[2, 1], (Kind::Float, Device::Cpu));
        let std = Tensor::ones(&[2, 1], (Kind::Float, Device::Cpu));
        let d = Normal::new(mean, std, 1);
        let lp = d.log_prob(&Tensor::zeros(&[2, 1], (Kind::Float, Device::Cpu)));
        assert_eq!(lp.size(), vec![2]);
        let expected = -0.5 * super::LOG_2PI;
        assert!((lp.double_value(&[0]) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_normal_kl_identical_is_zero() {
        let mean = Tensor::from_slice(&[0.3f32, -1.2]).reshape(&[1, 2][..]);
        let std = Tensor::from_slice(&[0.5f32, 2.0]).reshape(&[1, 2][..]);
        let p = Normal::new(mean.shallow_clone(), std.shallow_clone(), 1);
        let q = Normal::new(mean, std, 1);
        let kl = p.kl(&q);
        assert!(kl.double_value(&[0]).abs() < 1e-6);
    }

    #[test]
    fn test_one_hot_uniform_entropy() {
        let logits = Tensor::zeros(&[3, 4], (Kind::Float, Device::Cpu));
        let d = OneHotCategorical::new(logits, 0);
        let ent = d.entropy();
        assert_eq!(ent.size(), vec![3]);
        assert!((ent.double_value(&[0]) - (4f64).ln()).abs() < 1e-6);
    }

    #[test]
    fn test_one_hot_sample_is_one_hot() {
        tch::manual_seed(42);
        let logits = Tensor::from_slice(&[0.1f32, 2.0, -1.0, 0.5]).reshape(&[1, 4][..]);
        let d = OneHotCategorical::new(logits, 0);
        let s = d.sample().detach();
        let sums = s.sum_dim_intlist(-1, false, Kind::Float);
        assert!((sums.double_value(&[0]) - 1.0).abs() < 1e-6);
        let max = s.max().double_value(&[]);
        assert!((max - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_unimix_keeps_support() {
        let logits = Tensor::from_slice(&[50f32, -50.0]).reshape(&[1, 2][..]);
        let d = OneHotCategorical::with_unimix(logits, 0.1, 0);
        let probs = d.probs();
        // the starved class keeps at least unimix / k mass
        assert!(probs.double_value(&[0, 1]) > 0.04);
    }
}
