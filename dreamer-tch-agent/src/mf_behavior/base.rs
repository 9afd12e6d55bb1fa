//! Model-free behavior over replayed trajectories.
use super::{MfBehaviorConfig, MfGradient};
use crate::{
    actor::Actor,
    batch::Batch,
    critic::Critic,
    ema::{EmaState, RewardEma},
    model::ModelBase,
    returns::{discount_weights, lambda_return},
    rssm::LatentState,
    util::{tensorstats, track},
    world_model::WorldModel,
};
use anyhow::Result;
use dreamer_core::record::{Record, RecordValue};
use std::{fs, path::Path};
use tch::{Device, Kind, Tensor};

/// Actor with twin critics trained on real replayed trajectories.
///
/// Instead of a full imagined horizon, the replayed sequence itself provides
/// the look-ahead: the batch is re-encoded through the frozen dynamics model,
/// and one extra speculative step is taken with a noise-perturbed policy
/// sample through the prior transition. Twin critics (and twin slow targets)
/// bootstrap from the elementwise minimum of their modes, which curbs value
/// overestimation.
pub struct MfBehavior {
    config: MfBehaviorConfig,
    pub actor: Actor,
    value_1: Critic,
    value_2: Critic,
    slow_value_1: Option<Critic>,
    slow_value_2: Option<Critic>,
    updates: usize,
    total_it: usize,
    reward_ema: Option<(RewardEma, EmaState)>,
}

impl MfBehavior {
    /// Constructs [MfBehavior] for features of width `feat_dim` and
    /// `num_actions`-dimensional actions.
    pub fn build(
        mut config: MfBehaviorConfig,
        feat_dim: i64,
        num_actions: i64,
        device: Device,
    ) -> Result<Self> {
        config.actor.in_dim = feat_dim;
        config.actor.num_actions = num_actions;
        config.critic.in_dim = feat_dim;

        let actor = Actor::build(config.actor.clone(), device)?;
        let value_1 = Critic::build(config.critic.clone(), device)?;
        let value_2 = Critic::build(config.critic.clone(), device)?;
        let (slow_value_1, slow_value_2) = if config.slow_target {
            (Some(value_1.clone()), Some(value_2.clone()))
        } else {
            (None, None)
        };
        let reward_ema = if config.reward_ema {
            Some((RewardEma::new(config.ema_alpha), EmaState::new(device)))
        } else {
            None
        };

        Ok(Self {
            config,
            actor,
            value_1,
            value_2,
            slow_value_1,
            slow_value_2,
            updates: 0,
            total_it: 0,
            reward_ema,
        })
    }

    /// Re-walks a replayed batch through the dynamics model and takes one
    /// speculative step.
    ///
    /// Observations are encoded detached (the dynamics model is not updated
    /// here), the real action sequence is filtered with `observe`, and a
    /// noisy policy sample advances every posterior state by one prior
    /// transition. Everything is returned time-major; replayed features and
    /// states are detached, the look-ahead features keep their gradient path
    /// into the sampled actions.
    fn data_sample(
        &self,
        wm: &WorldModel,
        batch: &Batch,
    ) -> Result<(Tensor, Tensor, LatentState, Tensor, Tensor, Tensor)> {
        let data = wm.preprocess(batch)?;
        let reward = data.require("reward")?.unsqueeze(-1);
        let discount = data.require("discount")?.shallow_clone();
        let action = data.require("action")?.shallow_clone();

        let embed = wm.encode(&data)?.detach();
        let (states, _) = wm
            .dynamics
            .observe(&embed, &action, data.require("is_first")?);
        let feat = wm.dynamics.get_feat(&states);

        let noise = (action.rand_like() * self.config.mf_noise_scale).clamp(-0.5, 0.5);
        let noise_action = self.actor.forward(&feat).sample() + noise;
        let noise_states = wm.dynamics.img_step(&states, &noise_action);
        let next_feat = wm.dynamics.get_feat(&noise_states);

        Ok((
            feat.transpose(0, 1).detach(),
            next_feat.transpose(0, 1),
            states.swap_batch_time().detach(),
            action.transpose(0, 1),
            reward.transpose(0, 1),
            discount.transpose(0, 1),
        ))
    }

    /// Lambda-return targets from the minimum of the twin critic modes on
    /// the look-ahead features. All inputs and outputs are time-major.
    fn compute_target(
        &self,
        next_feat: &Tensor,
        reward: &Tensor,
        discount: &Tensor,
    ) -> (Tensor, Tensor, Tensor) {
        let value_1 = self.value_1.forward(next_feat).mode();
        let value_2 = self.value_2.forward(next_feat).mode();
        let value = value_1.minimum(&value_2);
        let horizon = reward.size()[0] - 1;

        let target = lambda_return(
            &reward.slice(0, 1, horizon + 1, 1),
            &value.slice(0, 0, horizon, 1),
            &discount.slice(0, 1, horizon + 1, 1),
            &value.select(0, horizon),
            self.config.discount_lambda,
        );
        let weights = discount_weights(discount);
        (target, weights, value.slice(0, 0, horizon, 1))
    }

    fn compute_actor_loss(
        &mut self,
        wm: &WorldModel,
        feat: &Tensor,
        action: &Tensor,
        target: &Tensor,
        weights: &Tensor,
        base: &Tensor,
        states: &LatentState,
    ) -> (Tensor, Record) {
        let mut metrics = Record::empty();
        let horizon = target.size()[0];
        let policy = self.actor.forward(&feat.detach());

        let adv = if let Some((ema, vals)) = self.reward_ema.as_mut() {
            let (offset, scale) = ema.call(target, vals);
            let normed_target = (target - &offset) / &scale;
            let normed_base = (base - &offset) / &scale;
            metrics.merge_inplace(tensorstats(&normed_target, "mf_normed_target"));
            let (lo, hi) = vals.values();
            metrics.insert("mf_ema_005", RecordValue::Scalar(lo as f32));
            metrics.insert("mf_ema_095", RecordValue::Scalar(hi as f32));
            normed_target - normed_base
        } else {
            target - base
        };

        let actor_loss = match self.config.mf_gradient {
            MfGradient::Dynamics => -weights.slice(0, 0, horizon, 1) * adv,
            MfGradient::Reinforce => {
                let log_prob = policy
                    .log_prob(action)
                    .slice(0, 0, horizon, 1)
                    .unsqueeze(-1);
                let baseline = self
                    .value_1
                    .forward(&feat.slice(0, 0, horizon, 1))
                    .mode();
                let actor_target = log_prob * (target - baseline).detach();
                -weights.slice(0, 0, horizon, 1) * actor_target
            }
            MfGradient::Both => {
                let log_prob = policy
                    .log_prob(action)
                    .slice(0, 0, horizon, 1)
                    .unsqueeze(-1);
                let baseline = self
                    .value_1
                    .forward(&feat.slice(0, 0, horizon, 1))
                    .mode();
                let reinforce = log_prob * (target - baseline).detach();
                let mix = self.config.gradient_mix;
                metrics.insert("mf_gradient_mix", RecordValue::Scalar(mix as f32));
                let actor_target = mix * target + (1.0 - mix) * reinforce;
                -weights.slice(0, 0, horizon, 1) * actor_target
            }
            MfGradient::Td3 => {
                // deterministic policy gradient through one prior transition
                let pi = policy.sample();
                let succ = wm.dynamics.img_step(states, &pi);
                let succ_feat = wm.dynamics.get_feat(&succ);
                let value = self.value_1.forward(&succ_feat).mean();
                -value.slice(0, 0, horizon, 1)
            }
        };
        (actor_loss, metrics)
    }

    /// One training step on a raw replayed batch.
    ///
    /// The actor loss is computed every `mf_policy_freq`-th call and its
    /// optimizer stepped only on every 2nd call; both critic optimizers step
    /// every call from a single backward pass over the shared twin loss.
    ///
    /// Returns the replayed features, states, actions, discount weights and
    /// a metrics record.
    pub fn train_step(
        &mut self,
        wm: &WorldModel,
        batch: &Batch,
    ) -> Result<(Tensor, LatentState, Tensor, Tensor, Record)> {
        self.update_slow_target();
        self.total_it += 1;
        let mut record = Record::empty();

        let (feat, next_feat, states, action, reward, discount) =
            self.data_sample(wm, batch)?;
        let actor_ent = self.actor.forward(&feat).entropy();

        let (target, weights, base) = self.compute_target(&next_feat, &reward, &discount);
        let horizon = target.size()[0];

        let actor_loss = if self.total_it % self.config.mf_policy_freq == 0 {
            let (mut loss, mets) =
                self.compute_actor_loss(wm, &feat, &action, &target, &weights, &base, &states);
            if !matches!(self.config.mf_gradient, MfGradient::Td3) {
                loss = loss
                    - self.config.actor_entropy
                        * actor_ent.slice(0, 0, horizon, 1).unsqueeze(-1);
            }
            record.merge_inplace(mets);
            Some(loss.mean(Kind::Float))
        } else {
            None
        };

        let value_input = feat.slice(0, 0, horizon, 1).detach();
        let value_1 = self.value_1.forward(&value_input);
        let value_2 = self.value_2.forward(&value_input);
        let value_min = value_1.mode().minimum(&value_2.mode());
        let target_sg = target.detach();
        let mut value_loss = -value_1.log_prob(&target_sg) - value_2.log_prob(&target_sg);
        if let (Some(slow_1), Some(slow_2)) = (&self.slow_value_1, &self.slow_value_2) {
            let slow_mode_1 = slow_1.forward(&value_input).mode().detach();
            let slow_mode_2 = slow_2.forward(&value_input).mode().detach();
            value_loss = value_loss
                - value_1.log_prob(&slow_mode_1)
                - value_2.log_prob(&slow_mode_2);
        }
        let value_loss = (weights.slice(0, 0, horizon, 1) * value_loss.unsqueeze(-1))
            .mean(Kind::Float);

        record.merge_inplace(tensorstats(&value_min, "mf_value"));
        record.merge_inplace(tensorstats(&target, "mf_target"));
        record.merge_inplace(tensorstats(&reward, "mf_reward"));
        record.insert(
            "mf_actor_entropy",
            RecordValue::Scalar(actor_ent.mean(Kind::Float).double_value(&[]) as f32),
        );

        if let Some(actor_loss) = &actor_loss {
            if self.total_it % 2 == 0 {
                self.actor.backward_step(actor_loss);
                record.insert(
                    "mf_actor_loss",
                    RecordValue::Scalar(actor_loss.double_value(&[]) as f32),
                );
            }
        }

        // one backward pass feeds both critic optimizers
        self.value_1.opt_mut().zero_grad();
        self.value_2.opt_mut().zero_grad();
        value_loss.backward();
        self.value_1.opt_mut().step();
        self.value_2.opt_mut().step();
        record.insert(
            "mf_value_loss",
            RecordValue::Scalar(value_loss.double_value(&[]) as f32),
        );

        Ok((feat, states, action, weights, record))
    }

    /// Blends both slow critics towards the live critics every
    /// `slow_target_update` calls.
    fn update_slow_target(&mut self) {
        if self.slow_value_1.is_some() {
            if self.updates % self.config.slow_target_update == 0 {
                let fraction = self.config.slow_target_fraction;
                let value_1 = &self.value_1;
                if let Some(slow) = self.slow_value_1.as_mut() {
                    track(slow, value_1, fraction);
                }
                let value_2 = &self.value_2;
                if let Some(slow) = self.slow_value_2.as_mut() {
                    track(slow, value_2, fraction);
                }
            }
            self.updates += 1;
        }
    }

    pub fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        fs::create_dir_all(&path)?;
        self.actor.save(path.as_ref().join("actor.pt.tch"))?;
        self.value_1.save(path.as_ref().join("value_1.pt.tch"))?;
        self.value_2.save(path.as_ref().join("value_2.pt.tch"))?;
        if let Some(slow) = &self.slow_value_1 {
            slow.save(path.as_ref().join("value_slow_1.pt.tch"))?;
        }
        if let Some(slow) = &self.slow_value_2 {
            slow.save(path.as_ref().join("value_slow_2.pt.tch"))?;
        }
        if let Some((_, vals)) = &self.reward_ema {
            vals.save(path.as_ref().join("ema.pt.tch"))?;
        }
        Ok(())
    }

    pub fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        self.actor.load(path.as_ref().join("actor.pt.tch"))?;
        self.value_1.load(path.as_ref().join("value_1.pt.tch"))?;
        self.value_2.load(path.as_ref().join("value_2.pt.tch"))?;
        if let Some(slow) = &mut self.slow_value_1 {
            slow.load(path.as_ref().join("value_slow_1.pt.tch"))?;
        }
        if let Some(slow) = &mut self.slow_value_2 {
            slow.load(path.as_ref().join("value_slow_2.pt.tch"))?;
        }
        if let Some((_, vals)) = &mut self.reward_ema {
            vals.load(path.as_ref().join("ema.pt.tch"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world_model::tests::{small_batch, small_world_model};

    fn small_mf(wm: &WorldModel, config: MfBehaviorConfig) -> MfBehavior {
        let mut config = config;
        config.actor.units = vec![8];
        config.critic.units = vec![8];
        MfBehavior::build(config, wm.dynamics.feat_dim(), 2, Device::Cpu).unwrap()
    }

    #[test]
    fn test_data_sample_time_major() {
        tch::manual_seed(0);
        let wm = small_world_model();
        let behavior = small_mf(&wm, MfBehaviorConfig::default());
        let batch = small_batch(2, 4);
        let (feat, next_feat, states, action, reward, discount) =
            behavior.data_sample(&wm, &batch).unwrap();
        assert_eq!(feat.size(), vec![4, 2, wm.dynamics.feat_dim()]);
        assert_eq!(next_feat.size(), vec![4, 2, wm.dynamics.feat_dim()]);
        assert_eq!(states.deter.size(), vec![4, 2, 8]);
        assert_eq!(action.size(), vec![4, 2, 2]);
        assert_eq!(reward.size(), vec![4, 2, 1]);
        assert_eq!(discount.size(), vec![4, 2, 1]);
        assert!(!feat.requires_grad());
        assert!(!states.stoch.requires_grad());
    }

    #[test]
    fn test_target_uses_twin_minimum() {
        tch::manual_seed(0);
        let wm = small_world_model();
        let behavior = small_mf(&wm, MfBehaviorConfig::default().discount_lambda(0.0));
        let next_feat = Tensor::randn(
            &[4, 2, wm.dynamics.feat_dim()],
            (Kind::Float, Device::Cpu),
        );
        let reward = Tensor::zeros(&[4, 2, 1], (Kind::Float, Device::Cpu));
        let discount = Tensor::ones(&[4, 2, 1], (Kind::Float, Device::Cpu));

        let (target, _, _) = behavior.compute_target(&next_feat, &reward, &discount);

        let v1 = behavior.value_1.forward(&next_feat).mode();
        let v2 = behavior.value_2.forward(&next_feat).mode();
        let v_min = v1.minimum(&v2);
        // with zero reward, unit discount and lambda 0, the target is the
        // next-step minimum value
        assert!(target.allclose(&v_min.slice(0, 1, 4, 1), 1e-6, 1e-6, false));
    }

    #[test]
    fn test_actor_update_throttling() {
        tch::manual_seed(0);
        let wm = small_world_model();
        let config = MfBehaviorConfig::default().mf_policy_freq(1);
        let mut behavior = small_mf(&wm, config);
        let batch = small_batch(2, 4);

        // first call: loss computed but the optimizer gate (every 2nd call)
        // blocks the step
        let (_, _, _, _, record) = behavior.train_step(&wm, &batch).unwrap();
        assert!(record.get_scalar("mf_actor_loss").is_err());
        assert!(record.get_scalar("mf_value_loss").is_ok());

        // second call: both gates open
        let (_, _, _, _, record) = behavior.train_step(&wm, &batch).unwrap();
        assert!(record.get_scalar("mf_actor_loss").is_ok());
    }

    #[test]
    fn test_train_step_all_gradient_modes() {
        for mode in [
            MfGradient::Dynamics,
            MfGradient::Reinforce,
            MfGradient::Both,
            MfGradient::Td3,
        ] {
            tch::manual_seed(0);
            let wm = small_world_model();
            let config = MfBehaviorConfig::default()
                .mf_gradient(mode)
                .mf_policy_freq(2);
            let mut behavior = small_mf(&wm, config);
            let batch = small_batch(2, 4);
            behavior.train_step(&wm, &batch).unwrap();
            let (_, _, _, _, record) = behavior.train_step(&wm, &batch).unwrap();
            assert!(record.get_scalar("mf_actor_loss").is_ok());
        }
    }
}
