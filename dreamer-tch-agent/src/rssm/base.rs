//! Recurrent state-space dynamics model.
use super::{GruCell, LatentState, RssmConfig, StochParams};
use crate::{
    dist::{Dist, Normal, OneHotCategorical},
    util::broadcast_mask,
};
use tch::{nn, nn::Module, Device, Kind, Tensor};

/// Recurrent stochastic state-space model.
///
/// Maintains a latent state with a stochastic component (Gaussian or a set of
/// categorical groups, fixed at construction) and a deterministic recurrent
/// vector. `obs_step`/`observe` filter the state with real observations and
/// also produce the prior the imagination path uses; `img_step`/
/// `imagine_with_action` roll the prior forward without observations.
///
/// The time scans are strictly sequential: each step consumes the previous
/// step's state. They parallelize over batch only.
pub struct Rssm {
    config: RssmConfig,
    device: Device,
    img_in: nn::Sequential,
    cell: GruCell,
    img_out: nn::Sequential,
    img_stat: nn::Linear,
    obs_out: nn::Sequential,
    obs_stat: nn::Linear,
}

impl Rssm {
    pub fn build(var_store: &nn::VarStore, config: RssmConfig) -> Self {
        let p = &(var_store.root() / "rssm");
        let stoch_flat = match config.discrete {
            Some(classes) => config.stoch * classes,
            None => config.stoch,
        };
        let stat_dim = match config.discrete {
            Some(classes) => config.stoch * classes,
            None => 2 * config.stoch,
        };

        let img_in = nn::seq()
            .add(nn::linear(
                p / "img_in",
                stoch_flat + config.num_actions,
                config.hidden,
                Default::default(),
            ))
            .add(nn::layer_norm(
                p / "img_in_norm",
                vec![config.hidden],
                Default::default(),
            ))
            .add_fn(|x| x.silu());
        let cell = GruCell::new(&(p / "gru"), config.hidden, config.deter);
        let img_out = nn::seq()
            .add(nn::linear(
                p / "img_out",
                config.deter,
                config.hidden,
                Default::default(),
            ))
            .add(nn::layer_norm(
                p / "img_out_norm",
                vec![config.hidden],
                Default::default(),
            ))
            .add_fn(|x| x.silu());
        let img_stat = nn::linear(p / "img_stat", config.hidden, stat_dim, Default::default());
        let obs_out = nn::seq()
            .add(nn::linear(
                p / "obs_out",
                config.deter + config.embed_dim,
                config.hidden,
                Default::default(),
            ))
            .add(nn::layer_norm(
                p / "obs_out_norm",
                vec![config.hidden],
                Default::default(),
            ))
            .add_fn(|x| x.silu());
        let obs_stat = nn::linear(p / "obs_stat", config.hidden, stat_dim, Default::default());

        Self {
            config,
            device: var_store.device(),
            img_in,
            cell,
            img_out,
            img_stat,
            obs_out,
            obs_stat,
        }
    }

    pub fn config(&self) -> &RssmConfig {
        &self.config
    }

    /// Width of the feature vector.
    pub fn feat_dim(&self) -> i64 {
        self.config.feat_dim()
    }

    /// Zeroed latent state for `batch_size` sequences.
    pub fn initial(&self, batch_size: i64) -> LatentState {
        let opts = (Kind::Float, self.device);
        let deter = Tensor::zeros(&[batch_size, self.config.deter], opts);
        match self.config.discrete {
            Some(classes) => LatentState {
                stoch: Tensor::zeros(&[batch_size, self.config.stoch, classes], opts),
                deter,
                params: StochParams::Categorical {
                    logits: Tensor::zeros(&[batch_size, self.config.stoch, classes], opts),
                },
            },
            None => LatentState {
                stoch: Tensor::zeros(&[batch_size, self.config.stoch], opts),
                deter,
                params: StochParams::Gaussian {
                    mean: Tensor::zeros(&[batch_size, self.config.stoch], opts),
                    std: Tensor::zeros(&[batch_size, self.config.stoch], opts),
                },
            },
        }
    }

    /// Feature vector consumed by prediction heads, the actor and critics:
    /// flattened stochastic sample concatenated with the deterministic
    /// vector.
    pub fn get_feat(&self, state: &LatentState) -> Tensor {
        let stoch = match self.config.discrete {
            Some(_) => state.stoch.flatten(-2, -1),
            None => state.stoch.shallow_clone(),
        };
        Tensor::cat(&[stoch, state.deter.shallow_clone()], -1)
    }

    /// Distribution object of the stochastic component.
    pub fn get_dist(&self, params: &StochParams) -> Dist {
        match params {
            StochParams::Gaussian { mean, std } => Dist::Normal(Normal::new(
                mean.shallow_clone(),
                std.shallow_clone(),
                1,
            )),
            StochParams::Categorical { logits } => Dist::OneHot(OneHotCategorical::with_unimix(
                logits.shallow_clone(),
                self.config.unimix_ratio,
                1,
            )),
        }
    }

    fn suff_stats(&self, x: &Tensor) -> StochParams {
        match self.config.discrete {
            Some(classes) => {
                let mut shape = x.size();
                shape.pop();
                shape.push(self.config.stoch);
                shape.push(classes);
                StochParams::Categorical {
                    logits: x.reshape(shape.as_slice()),
                }
            }
            None => {
                let chunks = x.chunk(2, -1);
                let mean = chunks[0].shallow_clone();
                let std = chunks[1].softplus() + self.config.min_std;
                StochParams::Gaussian { mean, std }
            }
        }
    }

    /// Prior transition: advances the recurrence from the previous state and
    /// action, then samples the stochastic component from the prior
    /// distribution. Works with arbitrary leading batch dimensions.
    pub fn img_step(&self, prev_state: &LatentState, prev_action: &Tensor) -> LatentState {
        let prev_stoch = match self.config.discrete {
            Some(_) => prev_state.stoch.flatten(-2, -1),
            None => prev_state.stoch.shallow_clone(),
        };
        let x = Tensor::cat(&[prev_stoch, prev_action.to_kind(Kind::Float)], -1);
        let x = self.img_in.forward(&x);
        let mut deter = prev_state.deter.shallow_clone();
        for _ in 0..self.config.rec_depth {
            deter = self.cell.forward(&x, &deter);
        }
        let params = self.suff_stats(&self.img_stat.forward(&self.img_out.forward(&deter)));
        let stoch = self.get_dist(&params).sample();
        LatentState {
            stoch,
            deter,
            params,
        }
    }

    /// Filtering step. Wherever `is_first` is set the previous state, the
    /// previous action and the embedding are masked before the update, so the
    /// output does not depend on the carried-over state at those positions.
    /// Returns `(posterior, prior)`.
    pub fn obs_step(
        &self,
        prev_state: &LatentState,
        prev_action: &Tensor,
        embed: &Tensor,
        is_first: &Tensor,
    ) -> (LatentState, LatentState) {
        let keep = 1.0 - is_first.to_kind(Kind::Float);
        let prev_state = prev_state.map(&|t| t * broadcast_mask(&keep, t));
        let prev_action = prev_action * broadcast_mask(&keep, prev_action);
        let embed = embed * broadcast_mask(&keep, embed);

        let prior = self.img_step(&prev_state, &prev_action);
        let x = Tensor::cat(&[prior.deter.shallow_clone(), embed], -1);
        let params = self.suff_stats(&self.obs_stat.forward(&self.obs_out.forward(&x)));
        let stoch = self.get_dist(&params).sample();
        let post = LatentState {
            stoch,
            deter: prior.deter.shallow_clone(),
            params,
        };
        (post, prior)
    }

    /// Filtering scan over a `(batch, time, ...)` segment. Returns posterior
    /// and prior sequences stacked along the time dimension.
    pub fn observe(
        &self,
        embed: &Tensor,
        action: &Tensor,
        is_first: &Tensor,
    ) -> (LatentState, LatentState) {
        let embed = embed.to(self.device);
        let action = action.to(self.device);
        let is_first = is_first.to(self.device);
        let (batch_size, time) = (embed.size()[0], embed.size()[1]);

        let mut state = self.initial(batch_size);
        let mut posts = Vec::with_capacity(time as usize);
        let mut priors = Vec::with_capacity(time as usize);
        for t in 0..time {
            let (post, prior) = self.obs_step(
                &state,
                &action.select(1, t),
                &embed.select(1, t),
                &is_first.select(1, t),
            );
            state = post.map(&|t| t.shallow_clone());
            posts.push(post);
            priors.push(prior);
        }
        (LatentState::stack(&posts, 1), LatentState::stack(&priors, 1))
    }

    /// Prior rollout under a given action sequence `(batch, time, act)`,
    /// starting from `initial_state`. Returns the prior state sequence
    /// stacked along the time dimension.
    pub fn imagine_with_action(&self, action: &Tensor, initial_state: &LatentState) -> LatentState {
        let action = action.to(self.device);
        let time = action.size()[1];

        let mut state = initial_state.map(&|t| t.shallow_clone());
        let mut priors = Vec::with_capacity(time as usize);
        for t in 0..time {
            state = self.img_step(&state, &action.select(1, t));
            priors.push(state.map(&|t| t.shallow_clone()));
        }
        LatentState::stack(&priors, 1)
    }

    /// Balanced KL loss between posterior and prior sequences.
    ///
    /// `dyn_loss` is KL(post ‖ sg(prior)), `rep_loss` is KL(sg(post) ‖
    /// prior); each is floored at `free` before scaling ("free bits"), while
    /// the returned raw KL value stays unfloored. Returns
    /// `(combined, raw, dyn_loss, rep_loss)`.
    pub fn kl_loss(
        &self,
        post: &LatentState,
        prior: &LatentState,
        free: f64,
        dyn_scale: f64,
        rep_scale: f64,
    ) -> (Tensor, Tensor, Tensor, Tensor) {
        let dyn_kl = self
            .get_dist(&post.params)
            .kl(&self.get_dist(&prior.params.detach()));
        let rep_kl = self
            .get_dist(&post.params.detach())
            .kl(&self.get_dist(&prior.params));

        let raw = dyn_kl.shallow_clone();
        let dyn_loss = dyn_kl.clamp_min(free);
        let rep_loss = rep_kl.clamp_min(free);
        let loss = dyn_scale * &dyn_loss + rep_scale * &rep_loss;
        (loss, raw, dyn_loss, rep_loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::nn::VarStore;

    fn small_config(discrete: Option<i64>) -> RssmConfig {
        let config = RssmConfig::default()
            .stoch(4)
            .deter(8)
            .hidden(8)
            .num_actions(2)
            .embed_dim(6);
        match discrete {
            Some(classes) => config.discrete(classes),
            None => config.continuous(),
        }
    }

    fn build(discrete: Option<i64>) -> (VarStore, Rssm) {
        let vs = VarStore::new(Device::Cpu);
        let rssm = Rssm::build(&vs, small_config(discrete));
        (vs, rssm)
    }

    #[test]
    fn test_initial_feat_is_zero() {
        let (_vs, rssm) = build(Some(3));
        let feat = rssm.get_feat(&rssm.initial(5));
        assert_eq!(feat.size(), vec![5, 4 * 3 + 8]);
        assert_eq!(feat.abs().sum(Kind::Float).double_value(&[]), 0.0);

        let (_vs, rssm) = build(None);
        let feat = rssm.get_feat(&rssm.initial(5));
        assert_eq!(feat.size(), vec![5, 4 + 8]);
        assert_eq!(feat.abs().sum(Kind::Float).double_value(&[]), 0.0);
    }

    #[test]
    fn test_is_first_resets_state() {
        tch::manual_seed(1);
        let (_vs, rssm) = build(Some(3));
        let action = Tensor::ones(&[2, 2], (Kind::Float, Device::Cpu));
        let embed = Tensor::ones(&[2, 6], (Kind::Float, Device::Cpu));
        let is_first = Tensor::ones(&[2], (Kind::Float, Device::Cpu));

        let state_a = rssm.initial(2).map(&|t| t + 1.0);
        let state_b = rssm.initial(2).map(&|t| t - 3.0);

        tch::manual_seed(42);
        let (post_a, prior_a) = rssm.obs_step(&state_a, &action, &embed, &is_first);
        tch::manual_seed(42);
        let (post_b, prior_b) = rssm.obs_step(&state_b, &action, &embed, &is_first);

        assert!(post_a.deter.allclose(&post_b.deter, 1e-6, 1e-6, false));
        assert!(post_a.stoch.allclose(&post_b.stoch, 1e-6, 1e-6, false));
        assert!(prior_a.stoch.allclose(&prior_b.stoch, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_observe_reproducible() {
        let (_vs, rssm) = build(None);
        let embed = Tensor::randn(&[2, 3, 6], (Kind::Float, Device::Cpu));
        let action = Tensor::randn(&[2, 3, 2], (Kind::Float, Device::Cpu));
        let is_first = Tensor::from_slice(&[1f32, 0., 0.])
            .unsqueeze(0)
            .repeat(&[2, 1]);

        tch::manual_seed(7);
        let (post1, _) = rssm.observe(&embed, &action, &is_first);
        tch::manual_seed(7);
        let (post2, _) = rssm.observe(&embed, &action, &is_first);

        assert_eq!(post1.deter.size(), vec![2, 3, 8]);
        assert!(post1.stoch.allclose(&post2.stoch, 0.0, 0.0, false));
        assert!(post1.deter.allclose(&post2.deter, 0.0, 0.0, false));
    }

    #[test]
    fn test_kl_loss_identities() {
        tch::manual_seed(3);
        let (_vs, rssm) = build(Some(3));
        let embed = Tensor::randn(&[2, 4, 6], (Kind::Float, Device::Cpu));
        let action = Tensor::randn(&[2, 4, 2], (Kind::Float, Device::Cpu));
        let is_first = Tensor::zeros(&[2, 4], (Kind::Float, Device::Cpu));
        let (post, prior) = rssm.observe(&embed, &action, &is_first);

        // free = 0 and unit scales: combined equals the unfloored sum
        let (loss, raw, dyn_loss, rep_loss) = rssm.kl_loss(&post, &prior, 0.0, 1.0, 1.0);
        assert_eq!(loss.size(), vec![2, 4]);
        let sum = &dyn_loss + &rep_loss;
        assert!(loss.allclose(&sum, 1e-6, 1e-6, false));
        assert!(raw.allclose(&dyn_loss, 1e-6, 1e-6, false));

        // large floor: every term saturates, loss stays >= 0
        let free = 1e3;
        let (loss, raw, dyn_loss, _) = rssm.kl_loss(&post, &prior, free, 1.0, 1.0);
        assert!((loss.min().double_value(&[]) - 2.0 * free).abs() < 1e-3);
        assert!(raw.max().double_value(&[]) < free);
        assert!((dyn_loss.min().double_value(&[]) - free).abs() < 1e-6);
    }

    #[test]
    fn test_imagine_with_action_shapes() {
        tch::manual_seed(5);
        let (_vs, rssm) = build(Some(3));
        let start = rssm.initial(4);
        let action = Tensor::randn(&[4, 6, 2], (Kind::Float, Device::Cpu));
        let seq = rssm.imagine_with_action(&action, &start);
        assert_eq!(seq.deter.size(), vec![4, 6, 8]);
        assert_eq!(seq.stoch.size(), vec![4, 6, 4, 3]);
    }
}
