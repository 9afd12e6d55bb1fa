//! World model training step.
use super::WorldModelConfig;
use crate::{
    batch::Batch,
    head::{Head, HeadConfig, HeadDistKind},
    mlp::{Mlp, MlpConfig},
    model::{ModelBase, SubModel},
    opt::Optimizer,
    rssm::{LatentState, Rssm},
    util::tensorstats,
};
use anyhow::Result;
use dreamer_core::record::{Record, RecordValue};
use log::{info, trace};
use std::path::Path;
use tch::{nn, Device, Kind, Tensor};

/// Encoder over the configured observation modalities.
///
/// Each modality is flattened per step and the concatenation runs through an
/// MLP; convolutional encoders can replace this behind the same embedding
/// contract.
struct Encoder {
    keys: Vec<String>,
    mlp: Mlp,
}

impl Encoder {
    fn forward(&self, data: &Batch) -> Result<Tensor> {
        let mut parts = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            parts.push(data.require(key)?.flatten(2, -1));
        }
        Ok(self.mlp.forward(&Tensor::cat(&parts, -1)))
    }
}

/// Diagnostic bundle produced by a world-model training step.
pub struct Context {
    /// Observation embeddings, `(batch, time, embed)`.
    pub embed: Tensor,

    /// Posterior features, `(batch, time, feat)`.
    pub feat: Tensor,

    /// Unfloored per-step KL, `(batch, time)`.
    pub kl: Tensor,

    /// Posterior entropy, `(batch, time)`.
    pub post_ent: Tensor,
}

/// Latent world model: encoder, recurrent dynamics and prediction heads,
/// trained jointly with one optimizer.
pub struct WorldModel {
    device: Device,
    config: WorldModelConfig,
    var_store: nn::VarStore,
    encoder: Encoder,
    pub dynamics: Rssm,
    decoder: Vec<(String, Head)>,
    reward: Head,
    cont: Head,
    extra: Vec<(String, Head)>,
    opt: Optimizer,
}

impl WorldModel {
    /// Constructs [WorldModel].
    pub fn build(config: WorldModelConfig) -> Result<Self> {
        let device = config
            .device
            .expect("No device is given for the world model")
            .into();
        let var_store = nn::VarStore::new(device);

        let encoder = Encoder {
            keys: config.obs_shapes.iter().map(|(k, _)| k.clone()).collect(),
            mlp: Mlp::build(
                &var_store,
                MlpConfig::new(
                    config.obs_dim(),
                    config.encoder_units.clone(),
                    config.embed_dim,
                ),
            ),
        };

        let rssm_config = config
            .rssm
            .clone()
            .embed_dim(config.embed_dim)
            .num_actions(config.num_actions);
        let dynamics = Rssm::build(&var_store, rssm_config);
        let feat_dim = dynamics.feat_dim();

        let decoder = config
            .obs_shapes
            .iter()
            .map(|(key, shape)| {
                let head_config = HeadConfig::new(
                    config.decoder_units.clone(),
                    HeadDistKind::Gaussian,
                    shape.clone(),
                );
                (key.clone(), Head::build(&var_store, feat_dim, head_config))
            })
            .collect();
        let reward = Head::build(&var_store, feat_dim, config.reward_head.clone());
        let cont = Head::build(&var_store, feat_dim, config.cont_head.clone());
        let extra = config
            .extra_heads
            .iter()
            .map(|(key, head_config)| {
                (
                    key.clone(),
                    Head::build(&var_store, feat_dim, head_config.clone()),
                )
            })
            .collect();

        let opt = config.opt_config.build(&var_store)?;

        Ok(Self {
            device,
            config,
            var_store,
            encoder,
            dynamics,
            decoder,
            reward,
            cont,
            extra,
            opt,
        })
    }

    pub fn config(&self) -> &WorldModelConfig {
        &self.config
    }

    /// The continuation head; behaviors use its predicted mean as the
    /// per-step discount.
    pub fn cont_head(&self) -> &Head {
        &self.cont
    }

    pub fn reward_head(&self) -> &Head {
        &self.reward
    }

    /// Embeds the observations of a preprocessed batch.
    pub fn encode(&self, data: &Batch) -> Result<Tensor> {
        self.encoder.forward(data)
    }

    /// Prepares a raw trajectory batch for training.
    ///
    /// Images are scaled to `[0, 1]`, the `discount` field is multiplied by
    /// the global discount factor and given a trailing singleton dimension,
    /// and the continuation target `cont = 1 - is_terminal` is derived. The
    /// `is_first` and `is_terminal` fields are required: `is_first` drives
    /// latent-state resets, `is_terminal` the continuation head.
    pub fn preprocess(&self, batch: &Batch) -> Result<Batch> {
        let mut out = Batch::new();
        for (key, value) in batch.iter() {
            let value = value.to_kind(Kind::Float).to(self.device);
            let value = if key == "image" { value / 255.0 } else { value };
            out.insert(key.clone(), value);
        }
        if out.contains("discount") {
            let discount = out.remove("discount")?;
            out.insert("discount", (discount * self.config.discount).unsqueeze(-1));
        }
        out.require("is_first")?;
        let cont = (1.0 - out.require("is_terminal")?).unsqueeze(-1);
        out.insert("cont", cont);
        Ok(out)
    }

    fn head_loss(pred_loss: &Tensor, batch_size: i64, time: i64) -> Tensor {
        // every per-step loss must be (batch, time) before combination
        assert_eq!(pred_loss.size(), [batch_size, time]);
        pred_loss.shallow_clone()
    }

    /// One training step on a raw trajectory batch.
    ///
    /// Returns the detached posterior sequence (the seed for behavior
    /// learners), a diagnostic [`Context`] and a metrics record.
    pub fn train_step(&mut self, batch: &Batch) -> Result<(LatentState, Context, Record)> {
        let data = self.preprocess(batch)?;
        let embed = self.encoder.forward(&data)?;
        let (batch_size, time) = (embed.size()[0], embed.size()[1]);

        let (post, prior) = self.dynamics.observe(
            &embed,
            data.require("action")?,
            data.require("is_first")?,
        );
        let (kl_loss, kl_value, dyn_loss, rep_loss) = self.dynamics.kl_loss(
            &post,
            &prior,
            self.config.kl_free,
            self.config.dyn_scale,
            self.config.rep_scale,
        );
        assert_eq!(kl_loss.size(), [batch_size, time]);

        let feat = self.dynamics.get_feat(&post);
        let mut record = Record::empty();
        let mut model_loss = kl_loss;

        let grad_heads = &self.config.grad_heads;
        let feat_for = |head: &str| -> Tensor {
            if grad_heads.iter().any(|h| h == head) {
                feat.shallow_clone()
            } else {
                feat.detach()
            }
        };

        let mut head_losses: Vec<(String, Tensor, f64)> = Vec::new();
        for (key, head) in &self.decoder {
            let pred = head.forward(&feat_for("decoder"));
            let loss = -pred.log_prob(data.require(key)?);
            head_losses.push((key.clone(), loss, head.loss_scale()));
        }
        {
            let pred = self.reward.forward(&feat_for("reward"));
            let target = data.require("reward")?.unsqueeze(-1);
            head_losses.push((
                "reward".into(),
                -pred.log_prob(&target),
                self.reward.loss_scale(),
            ));
        }
        {
            let pred = self.cont.forward(&feat_for("cont"));
            let loss = -pred.log_prob(data.require("cont")?);
            head_losses.push(("cont".into(), loss, self.cont.loss_scale()));
        }
        for (key, head) in &self.extra {
            let pred = head.forward(&feat_for(key));
            let target = data.require(key)?.unsqueeze(-1);
            head_losses.push((key.clone(), -pred.log_prob(&target), head.loss_scale()));
        }

        for (name, loss, scale) in &head_losses {
            let loss = Self::head_loss(loss, batch_size, time);
            record.insert(
                format!("{}_loss", name),
                RecordValue::Scalar(loss.mean(Kind::Float).double_value(&[]) as f32),
            );
            model_loss = model_loss + *scale * loss;
        }

        let loss_mean = model_loss.mean(Kind::Float);
        record.merge_inplace(self.opt.backward_step_record(&loss_mean, "model"));
        trace!("world model step");

        let prior_ent = self.dynamics.get_dist(&prior.params).entropy();
        let post_ent = self.dynamics.get_dist(&post.params).entropy();
        record.insert(
            "kl",
            RecordValue::Scalar(kl_value.mean(Kind::Float).double_value(&[]) as f32),
        );
        record.insert(
            "dyn_loss",
            RecordValue::Scalar(dyn_loss.mean(Kind::Float).double_value(&[]) as f32),
        );
        record.insert(
            "rep_loss",
            RecordValue::Scalar(rep_loss.mean(Kind::Float).double_value(&[]) as f32),
        );
        record.insert(
            "prior_ent",
            RecordValue::Scalar(prior_ent.mean(Kind::Float).double_value(&[]) as f32),
        );
        record.insert(
            "post_ent",
            RecordValue::Scalar(post_ent.mean(Kind::Float).double_value(&[]) as f32),
        );
        record.merge_inplace(tensorstats(&embed, "embed"));

        let context = Context {
            embed,
            feat: feat.detach(),
            kl: kl_value.detach(),
            post_ent: post_ent.detach(),
        };
        Ok((post.detach(), context, record))
    }

    /// Open-loop reconstruction diagnostic.
    ///
    /// Filters a short context prefix of up to six sequences, imagines the
    /// remaining steps from the last posterior state, and returns the truth,
    /// model and scaled error panels of the first observation modality
    /// concatenated along dimension 2.
    pub fn video_pred(&self, batch: &Batch) -> Result<Tensor> {
        let data = self.preprocess(batch)?;
        let embed = self.encoder.forward(&data)?;
        let action = data.require("action")?;
        let is_first = data.require("is_first")?;

        let n = embed.size()[0].min(6);
        let time = embed.size()[1];
        let ctx = time.min(5);

        let (states, _) = self.dynamics.observe(
            &embed.narrow(0, 0, n).narrow(1, 0, ctx),
            &action.narrow(0, 0, n).narrow(1, 0, ctx),
            &is_first.narrow(0, 0, n).narrow(1, 0, ctx),
        );
        let (key, head) = &self.decoder[0];
        let recon = head.forward(&self.dynamics.get_feat(&states)).mode();

        let init = states.map(&|t| t.select(1, ctx - 1));
        let prior = self.dynamics.imagine_with_action(
            &action.narrow(0, 0, n).narrow(1, ctx, time - ctx),
            &init,
        );
        let openl = head.forward(&self.dynamics.get_feat(&prior)).mode();

        let model = Tensor::cat(&[recon, openl], 1);
        let truth = data.require(key)?.narrow(0, 0, n);
        let error = (&model - &truth + 1.0) / 2.0;
        Ok(Tensor::cat(&[truth, model, error], 2))
    }
}

impl ModelBase for WorldModel {
    fn backward_step(&mut self, loss: &Tensor) {
        self.opt.backward_step(loss);
    }

    fn get_var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.var_store
    }

    fn get_var_store(&self) -> &nn::VarStore {
        &self.var_store
    }

    fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        self.var_store.save(&path)?;
        info!("Save world model to {:?}", path.as_ref());
        Ok(())
    }

    fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        self.var_store.load(&path)?;
        info!("Load world model from {:?}", path.as_ref());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rssm::RssmConfig;

    pub(crate) fn small_world_model() -> WorldModel {
        let rssm = RssmConfig::default()
            .stoch(4)
            .deter(8)
            .hidden(8)
            .discrete(3);
        let config = WorldModelConfig::new(vec![("obs".into(), vec![5])], 2)
            .encoder_units(vec![8])
            .embed_dim(6)
            .decoder_units(vec![8])
            .reward_head(HeadConfig::scalar(vec![8]))
            .cont_head(HeadConfig::binary(vec![8]))
            .rssm(rssm)
            .device(Device::Cpu);
        WorldModel::build(config).unwrap()
    }

    pub(crate) fn small_batch(batch_size: i64, time: i64) -> Batch {
        let opts = (Kind::Float, Device::Cpu);
        let is_first = Tensor::zeros(&[batch_size, time], opts);
        let _ = is_first.narrow(1, 0, 1).fill_(1.0);
        Batch::from_pairs(vec![
            ("obs", Tensor::randn(&[batch_size, time, 5], opts)),
            ("action", Tensor::randn(&[batch_size, time, 2], opts)),
            ("reward", Tensor::randn(&[batch_size, time], opts)),
            ("discount", Tensor::ones(&[batch_size, time], opts)),
            ("is_first", is_first),
            ("is_terminal", Tensor::zeros(&[batch_size, time], opts)),
        ])
    }

    #[test]
    fn test_preprocess_requires_flags() {
        let wm = small_world_model();
        let mut batch = small_batch(2, 3);
        assert!(wm.preprocess(&batch).is_ok());
        batch.remove("is_terminal").unwrap();
        assert!(wm.preprocess(&batch).is_err());
    }

    #[test]
    fn test_preprocess_derives_cont_and_discount() {
        let wm = small_world_model();
        let batch = small_batch(2, 3);
        let data = wm.preprocess(&batch).unwrap();
        assert_eq!(data.require("cont").unwrap().size(), vec![2, 3, 1]);
        assert_eq!(data.require("discount").unwrap().size(), vec![2, 3, 1]);
        let d = data.require("discount").unwrap().mean(Kind::Float);
        assert!((d.double_value(&[]) - wm.config().discount()).abs() < 1e-6);
    }

    #[test]
    fn test_train_step_returns_detached_posterior() {
        tch::manual_seed(0);
        let mut wm = small_world_model();
        let batch = small_batch(2, 3);
        let (post, context, record) = wm.train_step(&batch).unwrap();
        assert!(!post.stoch.requires_grad());
        assert!(!post.deter.requires_grad());
        assert_eq!(context.kl.size(), vec![2, 3]);
        assert!(record.get_scalar("model_loss").is_ok());
        assert!(record.get_scalar("kl").is_ok());
        assert!(record.get_scalar("reward_loss").is_ok());
    }

    #[test]
    fn test_video_pred_shape() {
        tch::manual_seed(0);
        let wm = small_world_model();
        let batch = small_batch(2, 8);
        let panels = wm.video_pred(&batch).unwrap();
        // truth/model/error stacked along dim 2
        assert_eq!(panels.size(), vec![2, 8, 3 * 5]);
    }

    #[test]
    fn test_save_load_round_trip() {
        tch::manual_seed(0);
        let wm = small_world_model();
        tch::manual_seed(1);
        let mut other = small_world_model();

        let batch = small_batch(2, 3);
        let data = wm.preprocess(&batch).unwrap();
        let embed = wm.encode(&data).unwrap();

        let dir = tempdir::TempDir::new("dreamer-wm").unwrap();
        let path = dir.path().join("world_model.pt.tch");
        wm.save(&path).unwrap();
        other.load(&path).unwrap();

        let embed_other = other.encode(&data).unwrap();
        assert!(embed.allclose(&embed_other, 1e-6, 1e-6, false));
    }
}
