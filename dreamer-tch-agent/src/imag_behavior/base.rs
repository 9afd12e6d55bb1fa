//! Imagination-based actor-critic.
use super::{ImagBehaviorConfig, ImagGradient};
use crate::{
    actor::Actor,
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

/// Actor and critic trained entirely on rollouts imagined by the dynamics
/// model.
///
/// The actor, the critic and its slow target each own their parameters, so
/// the two optimizer steps of [`ImagBehavior::train_step`] act on disjoint
/// parameter groups; the critic always sees detached features, the actor's
/// gradient flows through the imagined transitions.
pub struct ImagBehavior {
    config: ImagBehaviorConfig,
    pub actor: Actor,
    value: Critic,
    slow_value: Option<Critic>,
    updates: usize,
    reward_ema: Option<(RewardEma, EmaState)>,
}

impl ImagBehavior {
    /// Constructs [ImagBehavior] for features of width `feat_dim` and
    /// `num_actions`-dimensional actions.
    pub fn build(
        mut config: ImagBehaviorConfig,
        feat_dim: i64,
        num_actions: i64,
        device: Device,
    ) -> Result<Self> {
        config.actor.in_dim = feat_dim;
        config.actor.num_actions = num_actions;
        config.critic.in_dim = feat_dim;

        let actor = Actor::build(config.actor.clone(), device)?;
        let value = Critic::build(config.critic.clone(), device)?;
        let slow_value = if config.slow_target {
            Some(value.clone())
        } else {
            None
        };
        let reward_ema = if config.reward_ema {
            Some((RewardEma::new(config.ema_alpha), EmaState::new(device)))
        } else {
            None
        };

        Ok(Self {
            config,
            actor,
            value,
            slow_value,
            updates: 0,
            reward_ema,
        })
    }

    /// Rolls the dynamics model forward under the current actor.
    ///
    /// The `(batch, time)` start states are flattened into one batch
    /// dimension, then `horizon` transitions are taken. At every visited
    /// state (including the last) the feature and a policy sample are
    /// recorded, so all three sequences have `horizon + 1` time-major
    /// entries, the start state first. Only the policy inputs are detached;
    /// gradients flow through the transitions back to the sampled actions.
    pub fn imagine(
        &self,
        wm: &WorldModel,
        start: &LatentState,
        horizon: i64,
    ) -> (Tensor, LatentState, Tensor) {
        let dynamics = &wm.dynamics;
        let mut state = start.flatten_batch_time();
        let mut feats = Vec::with_capacity(horizon as usize + 1);
        let mut states = Vec::with_capacity(horizon as usize + 1);
        let mut actions = Vec::with_capacity(horizon as usize + 1);

        for t in 0..=horizon {
            let feat = dynamics.get_feat(&state);
            let action = self.actor.forward(&feat.detach()).sample();
            feats.push(feat);
            states.push(state.map(&|t| t.shallow_clone()));
            actions.push(action.shallow_clone());
            if t < horizon {
                state = dynamics.img_step(&state, &action);
            }
        }

        (
            Tensor::stack(&feats, 0),
            LatentState::stack(&states, 0),
            Tensor::stack(&actions, 0),
        )
    }

    /// Lambda-return targets, cumulative discount weights and the value
    /// baseline for an imagined rollout. All inputs and outputs are
    /// time-major.
    fn compute_target(
        &self,
        wm: &WorldModel,
        imag_feat: &Tensor,
        reward: &Tensor,
    ) -> (Tensor, Tensor, Tensor) {
        let discount = if self.config.use_cont_head {
            self.config.discount * wm.cont_head().forward(imag_feat).mean()
        } else {
            self.config.discount * reward.ones_like()
        };
        let value = self.value.forward(imag_feat).mode();
        let horizon = reward.size()[0] - 1;

        let target = lambda_return(
            &reward.slice(0, 1, horizon + 1, 1),
            &value.slice(0, 0, horizon, 1),
            &discount.slice(0, 1, horizon + 1, 1),
            &value.select(0, horizon),
            self.config.discount_lambda,
        );
        let weights = discount_weights(&discount);
        (target, weights, value.slice(0, 0, horizon, 1))
    }

    fn compute_actor_loss(
        &mut self,
        imag_feat: &Tensor,
        imag_action: &Tensor,
        target: &Tensor,
        weights: &Tensor,
        base: &Tensor,
    ) -> (Tensor, Record) {
        let mut metrics = Record::empty();
        let horizon = target.size()[0];
        let policy = self.actor.forward(&imag_feat.detach());

        let adv = if let Some((ema, vals)) = self.reward_ema.as_mut() {
            let (offset, scale) = ema.call(target, vals);
            let normed_target = (target - &offset) / &scale;
            let normed_base = (base - &offset) / &scale;
            metrics.merge_inplace(tensorstats(&normed_target, "normed_target"));
            let (lo, hi) = vals.values();
            metrics.insert("ema_005", RecordValue::Scalar(lo as f32));
            metrics.insert("ema_095", RecordValue::Scalar(hi as f32));
            normed_target - normed_base
        } else {
            target - base
        };

        let actor_target = match self.config.imag_gradient {
            ImagGradient::Dynamics => adv,
            ImagGradient::Reinforce => {
                let log_prob = policy
                    .log_prob(imag_action)
                    .slice(0, 0, horizon, 1)
                    .unsqueeze(-1);
                let baseline = self
                    .value
                    .forward(&imag_feat.slice(0, 0, horizon, 1))
                    .mode();
                log_prob * (target - baseline).detach()
            }
            ImagGradient::Both => {
                let log_prob = policy
                    .log_prob(imag_action)
                    .slice(0, 0, horizon, 1)
                    .unsqueeze(-1);
                let baseline = self
                    .value
                    .forward(&imag_feat.slice(0, 0, horizon, 1))
                    .mode();
                let reinforce = log_prob * (target - baseline).detach();
                let mix = self.config.imag_gradient_mix;
                metrics.insert("imag_gradient_mix", RecordValue::Scalar(mix as f32));
                mix * target + (1.0 - mix) * reinforce
            }
        };

        let actor_loss = -weights.slice(0, 0, horizon, 1) * actor_target;
        (actor_loss, metrics)
    }

    /// One behavior training step on detached posterior start states.
    ///
    /// `objective` maps the imagined `(features, states, actions)` to a
    /// time-major reward sequence, typically through the world model's reward
    /// head. When `mf_reg` is configured, `mf_policy` supplies the reference
    /// policy the actor is regularized towards.
    ///
    /// Returns the imagined features, states, actions, discount weights and
    /// a metrics record.
    pub fn train_step<F>(
        &mut self,
        wm: &WorldModel,
        start: &LatentState,
        objective: F,
        mf_policy: Option<&Actor>,
    ) -> Result<(Tensor, LatentState, Tensor, Tensor, Record)>
    where
        F: Fn(&Tensor, &LatentState, &Tensor) -> Tensor,
    {
        self.update_slow_target();
        let mut record = Record::empty();

        let (imag_feat, imag_state, imag_action) =
            self.imagine(wm, start, self.config.horizon);
        let reward = objective(&imag_feat, &imag_state, &imag_action);
        let actor_ent = self.actor.forward(&imag_feat).entropy();

        let (target, weights, base) = self.compute_target(wm, &imag_feat, &reward);
        let horizon = target.size()[0];

        let (actor_loss, mets) =
            self.compute_actor_loss(&imag_feat, &imag_action, &target, &weights, &base);
        record.merge_inplace(mets);

        let mut actor_loss = actor_loss
            - self.config.actor_entropy * actor_ent.slice(0, 0, horizon, 1).unsqueeze(-1);
        if self.config.mf_reg {
            if let Some(mf_policy) = mf_policy {
                let inp = imag_feat.slice(0, 0, horizon, 1).detach();
                let kl = self.actor.forward(&inp).kl(&mf_policy.forward(&inp));
                actor_loss = actor_loss + self.config.mf_reg_scale * kl.unsqueeze(-1);
            }
        }
        let actor_loss = actor_loss.mean(Kind::Float);

        let value_input = imag_feat.slice(0, 0, horizon, 1).detach();
        let value = self.value.forward(&value_input);
        let mut value_loss = -value.log_prob(&target.detach());
        if let Some(slow) = &self.slow_value {
            let slow_mode = slow.forward(&value_input).mode().detach();
            value_loss = value_loss - value.log_prob(&slow_mode);
        }
        let value_loss = (weights.slice(0, 0, horizon, 1) * value_loss.unsqueeze(-1))
            .mean(Kind::Float);

        record.merge_inplace(tensorstats(&value.mode(), "value"));
        record.merge_inplace(tensorstats(&target, "target"));
        record.merge_inplace(tensorstats(&reward, "imag_reward"));
        record.insert(
            "actor_entropy",
            RecordValue::Scalar(actor_ent.mean(Kind::Float).double_value(&[]) as f32),
        );

        self.actor.backward_step(&actor_loss);
        self.value.backward_step(&value_loss);
        record.insert(
            "actor_loss",
            RecordValue::Scalar(actor_loss.double_value(&[]) as f32),
        );
        record.insert(
            "value_loss",
            RecordValue::Scalar(value_loss.double_value(&[]) as f32),
        );

        Ok((imag_feat, imag_state, imag_action, weights, record))
    }

    /// Blends the slow critic towards the live critic every
    /// `slow_target_update` calls.
    fn update_slow_target(&mut self) {
        if self.slow_value.is_some() {
            if self.updates % self.config.slow_target_update == 0 {
                let fraction = self.config.slow_target_fraction;
                let value = &self.value;
                if let Some(slow) = self.slow_value.as_mut() {
                    track(slow, value, fraction);
                }
            }
            self.updates += 1;
        }
    }

    pub fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        fs::create_dir_all(&path)?;
        self.actor.save(path.as_ref().join("actor.pt.tch"))?;
        self.value.save(path.as_ref().join("value.pt.tch"))?;
        if let Some(slow) = &self.slow_value {
            slow.save(path.as_ref().join("value_slow.pt.tch"))?;
        }
        if let Some((_, vals)) = &self.reward_ema {
            vals.save(path.as_ref().join("ema.pt.tch"))?;
        }
        Ok(())
    }

    pub fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        self.actor.load(path.as_ref().join("actor.pt.tch"))?;
        self.value.load(path.as_ref().join("value.pt.tch"))?;
        if let Some(slow) = &mut self.slow_value {
            slow.load(path.as_ref().join("value_slow.pt.tch"))?;
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

    fn small_behavior(wm: &WorldModel, config: ImagBehaviorConfig) -> ImagBehavior {
        let config = config.horizon(3);
        let mut config = config;
        config.actor.units = vec![8];
        config.critic.units = vec![8];
        ImagBehavior::build(config, wm.dynamics.feat_dim(), 2, Device::Cpu).unwrap()
    }

    fn start_states(wm: &mut WorldModel) -> LatentState {
        let batch = small_batch(2, 3);
        let (post, _, _) = wm.train_step(&batch).unwrap();
        post
    }

    #[test]
    fn test_imagine_sequence_lengths() {
        tch::manual_seed(0);
        let mut wm = small_world_model();
        let behavior = small_behavior(&wm, ImagBehaviorConfig::default());
        let start = start_states(&mut wm);
        let (feat, states, action) = behavior.imagine(&wm, &start, 3);
        // 2 * 3 start states flattened, horizon + 1 entries
        assert_eq!(feat.size(), vec![4, 6, wm.dynamics.feat_dim()]);
        assert_eq!(states.deter.size(), vec![4, 6, 8]);
        assert_eq!(action.size(), vec![4, 6, 2]);
    }

    #[test]
    fn test_horizon_one_matches_img_step() {
        tch::manual_seed(0);
        let mut wm = small_world_model();
        let behavior = small_behavior(&wm, ImagBehaviorConfig::default());
        let start = start_states(&mut wm);

        tch::manual_seed(11);
        let (feat, states, _) = behavior.imagine(&wm, &start, 1);

        tch::manual_seed(11);
        let flat = start.flatten_batch_time();
        let feat0 = wm.dynamics.get_feat(&flat);
        let action0 = behavior.actor.forward(&feat0.detach()).sample();
        let succ = wm.dynamics.img_step(&flat, &action0);

        assert!(states.deter.select(0, 1).allclose(&succ.deter, 0.0, 0.0, false));
        assert!(states.stoch.select(0, 1).allclose(&succ.stoch, 0.0, 0.0, false));
        assert!(feat
            .select(0, 1)
            .allclose(&wm.dynamics.get_feat(&succ), 0.0, 0.0, false));
    }

    #[test]
    fn test_train_step_dynamics_mode() {
        tch::manual_seed(0);
        let mut wm = small_world_model();
        let mut behavior = small_behavior(&wm, ImagBehaviorConfig::default());
        let start = start_states(&mut wm);

        let (_, _, _, weights, record) = behavior
            .train_step(
                &wm,
                &start,
                |feat, _, _| wm.reward_head().forward(feat).mode(),
                None,
            )
            .unwrap();
        assert_eq!(weights.size()[0], 4); // horizon + 1
        assert!(record.get_scalar("actor_loss").is_ok());
        assert!(record.get_scalar("value_loss").is_ok());
        assert!(record.get_scalar("ema_095").is_ok());

        // EMA state was written in place
        let (_, vals) = behavior.reward_ema.as_ref().unwrap();
        let (lo, hi) = vals.values();
        assert!(lo != 0.0 || hi != 0.0);
    }

    #[test]
    fn test_save_load_round_trip() {
        tch::manual_seed(0);
        let wm = small_world_model();
        let behavior = small_behavior(&wm, ImagBehaviorConfig::default());
        tch::manual_seed(1);
        let mut other = small_behavior(&wm, ImagBehaviorConfig::default());

        let dir = tempdir::TempDir::new("dreamer-imag").unwrap();
        behavior.save(dir.path()).unwrap();
        other.load(dir.path()).unwrap();

        let feat = Tensor::randn(
            &[4, wm.dynamics.feat_dim()],
            (Kind::Float, Device::Cpu),
        );
        let mode = behavior.actor.forward(&feat).mode();
        let mode_other = other.actor.forward(&feat).mode();
        assert!(mode.allclose(&mode_other, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_train_step_reinforce_and_both() {
        for mode in [ImagGradient::Reinforce, ImagGradient::Both] {
            tch::manual_seed(0);
            let mut wm = small_world_model();
            let config = ImagBehaviorConfig::default().imag_gradient(mode);
            let mut behavior = small_behavior(&wm, config);
            let start = start_states(&mut wm);
            let result = behavior.train_step(
                &wm,
                &start,
                |feat, _, _| wm.reward_head().forward(feat).mode(),
                None,
            );
            assert!(result.is_ok());
        }
    }
}
