//! Parameter fitting.
//!
//! The update rule is any [`candle_nn::Optimizer`]; [`Trainer::adam`] gives
//! the default (AdamW without weight decay, i.e. Adam). A training call samples
//! fresh dropout masks, runs one teacher-forced pass and applies exactly one
//! optimizer step. Failed calls are not retried.

use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::error::Result;
use crate::model::{Batch, Evaluation, Info, Mode, Model};

/// A [`Model`] paired with its optimizer.
pub struct Trainer<O: Optimizer> {
    model: Model,
    optimizer: O,
}

impl Trainer<AdamW> {
    /// Adam over every model parameter at the configured learning rate.
    pub fn adam(model: Model) -> Result<Self> {
        let params = ParamsAdamW { lr: model.config().learning_rate, weight_decay: 0.0, ..Default::default() };
        let optimizer = AdamW::new(model.varmap().all_vars(), params)?;
        Ok(Self::new(model, optimizer))
    }
}

impl<O: Optimizer> Trainer<O> {
    /// Pair `model` with any optimizer over its variables.
    pub fn new(model: Model, optimizer: O) -> Self {
        Self { model, optimizer }
    }

    /// One optimizer step on `batch`; returns the pre-update loss and diagnostics.
    pub fn train(&mut self, batch: &Batch) -> Result<(f32, Info)> {
        let masks = self.model.sample_masks()?;
        let fwd = self.model.forward(batch, Mode::Supervised { evaluate_accuracy: false }, Some(&masks))?;
        self.optimizer.backward_step(&fwd.loss)?;
        let loss = fwd.loss.to_scalar::<f32>()?;
        log::trace!("train step: loss={loss} {:?}", fwd.info);
        Ok((loss, fwd.info))
    }

    /// See [`Model::eval`].
    pub fn eval(&self, batch: &Batch, with_accuracy: bool) -> Result<Evaluation> {
        self.model.eval(batch, with_accuracy)
    }

    /// Takes effect from the next [`Trainer::train`] call.
    pub fn set_learning_rate(&mut self, lr: f64) {
        log::info!("learning rate {} -> {lr}", self.optimizer.learning_rate());
        self.optimizer.set_learning_rate(lr);
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// The model being trained.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Release the trained model.
    pub fn into_model(self) -> Model {
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::GraphTargets;
    use candle_core::{Device, Tensor};

    fn toy_batch(config: &ModelConfig) -> Batch {
        let dev = Device::Cpu;
        let s = 2;
        let pad = config.pad_graph_size(s);
        let mut edges = vec![0f32; s * pad * pad];
        edges[pad * pad + 1] = 1.0;
        let graph = GraphTargets {
            num_new_nodes: Tensor::new(&[[1u32, 1]], &dev).unwrap(),
            new_node_strengths: Tensor::new(&[[[1.0f32], [1.0]]], &dev).unwrap(),
            new_node_ids: Tensor::new(&[[[[1.0f32, 0.0, 0.0]], [[0.0, 1.0, 0.0]]]], &dev).unwrap(),
            edges: Tensor::from_vec(edges, (1, s, pad, pad, 1), &dev).unwrap(),
        };
        Batch::new(
            Tensor::new(&[[[1u32, 2, 3], [4, 5, 0]]], &dev).unwrap(),
            Tensor::new(&[[6u32, 7]], &dev).unwrap(),
        )
        .with_output(Tensor::new(&[[[0.0f32, 0.0, 1.0, 0.0]]], &dev).unwrap())
        .with_graph(graph)
    }

    fn config() -> ModelConfig {
        ModelConfig::default()
            .with_vocab(8, 4)
            .with_graph_spec(3, 6, 1)
            .with_repr_size(8)
            .with_new_nodes_per_iter(1)
            .with_learning_rate(0.01)
    }

    #[test]
    fn repeated_steps_reduce_loss_on_one_batch() {
        let config = config();
        let batch = toy_batch(&config);
        let model = Model::new(config, &Device::Cpu).unwrap();
        let mut trainer = Trainer::adam(model).unwrap();
        let before = trainer.eval(&batch, false).unwrap().loss;
        for _ in 0..40 {
            let (loss, info) = trainer.train(&batch).unwrap();
            assert!(loss.is_finite());
            assert!(info.contains_key("query_loss"));
        }
        let after = trainer.eval(&batch, false).unwrap().loss;
        assert!(after < before, "before={before} after={after}");
    }

    #[test]
    fn training_with_dropout_stays_finite() {
        let config = config().with_dropout_keep(0.5);
        let batch = toy_batch(&config);
        let mut trainer = Trainer::adam(Model::new(config, &Device::Cpu).unwrap()).unwrap();
        for _ in 0..3 {
            let (loss, _) = trainer.train(&batch).unwrap();
            assert!(loss.is_finite());
        }
    }

    #[test]
    fn learning_rate_can_be_changed_between_steps() {
        let model = Model::new(config(), &Device::Cpu).unwrap();
        let mut trainer = Trainer::adam(model).unwrap();
        assert!((trainer.learning_rate() - 0.01).abs() < 1e-12);
        trainer.set_learning_rate(0.001);
        assert!((trainer.learning_rate() - 0.001).abs() < 1e-12);
        assert_eq!(trainer.model().config().learning_rate, 0.01);
    }

    #[test]
    fn plain_sgd_plugs_in() {
        let config = config();
        let batch = toy_batch(&config);
        let model = Model::new(config, &Device::Cpu).unwrap();
        let sgd = candle_nn::SGD::new(model.varmap().all_vars(), 0.05).unwrap();
        let mut trainer = Trainer::new(model, sgd);
        let (loss, _) = trainer.train(&batch).unwrap();
        assert!(loss.is_finite());
    }
}
