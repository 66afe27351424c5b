//! Reinforcement learning training step for one learner replica.
//!
//! One `train_step` runs:
//!
//! ```text
//! value pretrain countdown
//!   -> forward (batch parked in scratch)
//!   -> backward -> sync_gradients -> optimizer step
//!   -> publish weights (rank 0, every publish_freq steps)
//!   -> control requests (config update, value-head reset)
//!   -> scratch release
//! ```
//!
//! Replicas of one player run the same sequence of collective operations,
//! so control requests must reach every rank before the same step.

use crate::config::{ConfigError, LearnerConfig};
use crate::core::model_store::SharedModelStore;
use crate::learner::collective::Collective;
use crate::learner::control::ControlFlags;
use crate::learner::gradient_sync::{GradientSynchronizer, SyncError};
use crate::learner::memory::{MemoryMonitor, MemoryProbe, NullProbe};
use crate::learner::snapshot::{encode_model, SnapshotError};
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use std::sync::Arc;
use thiserror::Error;

/// Model hooks the trainer needs beyond burn's module API.
pub trait LearnerModel<B: AutodiffBackend>: AutodiffModule<B> {
    /// One training batch.
    type Batch;

    /// Total loss for a batch, a single-element tensor.
    fn learner_forward(&self, batch: &Self::Batch) -> Tensor<B, 1>;

    /// Restrict the loss to the value head.
    fn set_only_update_baseline(&mut self, only: bool);

    /// Replace the value head with freshly initialized weights.
    fn reinit_value_head(self, device: &B::Device) -> Self;
}

/// Errors raised by a training step.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid learner config: {0}")]
    Config(#[from] ConfigError),
    #[error("replica sync failed: {0}")]
    Sync(#[from] SyncError),
    #[error("cannot publish weights: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Summary of one training step.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainStepInfo {
    /// Training iteration after the step
    pub train_iter: u64,
    pub loss: f32,
    /// Whether the step only trained the value head
    pub only_update_baseline: bool,
    pub published: bool,
    pub config_updated: bool,
    pub value_reset: bool,
}

type ScratchMonitor<T> = MemoryMonitor<T, Box<dyn MemoryProbe + Send>>;

/// Training loop state for one replica.
pub struct RlTrainer<B, M, O, C>
where
    B: AutodiffBackend,
    M: LearnerModel<B>,
    O: Optimizer<M, B>,
    C: Collective,
{
    config: LearnerConfig,
    sync: GradientSynchronizer<B, M, C>,
    optimizer: O,
    optimizer_factory: Box<dyn FnMut() -> O + Send>,
    control: Arc<ControlFlags>,
    memory: ScratchMonitor<M::Batch>,
    store: Option<SharedModelStore<Vec<u8>>>,
    /// `None` once pretraining is over
    remain_value_pretrain_iters: Option<u64>,
    only_update_baseline: bool,
    train_iter: u64,
    device: B::Device,
}

impl<B, M, O, C> RlTrainer<B, M, O, C>
where
    B: AutodiffBackend,
    M: LearnerModel<B>,
    O: Optimizer<M, B>,
    C: Collective,
{
    /// Create a trainer. Every replica must call this, since it
    /// broadcasts rank 0's parameters.
    pub fn new<F>(
        config: LearnerConfig,
        model: M,
        collective: C,
        optimizer_factory: F,
        device: B::Device,
    ) -> Result<Self, TrainError>
    where
        F: FnMut() -> O + Send + 'static,
    {
        config.validate()?;
        let sync = GradientSynchronizer::new(model, collective)?;
        let mut optimizer_factory: Box<dyn FnMut() -> O + Send> = Box::new(optimizer_factory);
        let optimizer = optimizer_factory();
        let remain_value_pretrain_iters = pretrain_countdown(&config);

        Ok(Self {
            config,
            sync,
            optimizer,
            optimizer_factory,
            control: Arc::new(ControlFlags::new()),
            memory: MemoryMonitor::new(Box::new(NullProbe)),
            store: None,
            remain_value_pretrain_iters,
            only_update_baseline: false,
            train_iter: 0,
            device,
        })
    }

    /// Share control flags with an operator.
    pub fn with_control(mut self, control: Arc<ControlFlags>) -> Self {
        self.control = control;
        self
    }

    /// Publish weights to `store` (rank 0 only).
    pub fn with_model_store(mut self, store: SharedModelStore<Vec<u8>>) -> Self {
        self.store = Some(store);
        self
    }

    /// Account scratch memory with `probe`.
    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe + Send>) -> Self {
        self.memory = MemoryMonitor::new(probe);
        self
    }

    /// Run one training step on `batch`.
    pub fn train_step(&mut self, batch: M::Batch) -> Result<TrainStepInfo, TrainError> {
        self.step_value_pretrain();
        let learning_rate = self.config.learning_rate;

        let loss = {
            let mut scratch = self.memory.scope();
            let batch = scratch.stash("data", batch);
            let loss = self.sync.model().learner_forward(batch);
            let loss_value = loss.clone().into_scalar().elem::<f32>();

            let grads = GradientsParams::from_grads(loss.backward(), self.sync.model());
            let grads = self.sync.sync_gradients(grads)?;
            let optimizer = &mut self.optimizer;
            self.sync
                .update_model(|model| optimizer.step(learning_rate, model, grads));
            loss_value
        };
        self.train_iter += 1;

        let published = if self.train_iter % self.config.publish_freq == 0 {
            self.publish()?
        } else {
            false
        };

        let config_updated = match self.control.take_update_config() {
            Some(config) => self.update_config(config),
            None => false,
        };
        let value_reset = if self.control.take_reset_value() {
            self.reset_value()?;
            true
        } else {
            false
        };
        self.memory.report();

        Ok(TrainStepInfo {
            train_iter: self.train_iter,
            loss,
            only_update_baseline: self.only_update_baseline,
            published,
            config_updated,
            value_reset,
        })
    }

    fn step_value_pretrain(&mut self) {
        match self.remain_value_pretrain_iters {
            Some(0) => {
                self.set_only_update_baseline(false);
                self.remain_value_pretrain_iters = None;
                if self.sync.rank() == 0 {
                    log::info!("[{}] value pretraining finished", self.config.player_id);
                }
            }
            Some(remaining) => {
                self.set_only_update_baseline(true);
                self.remain_value_pretrain_iters = Some(remaining - 1);
            }
            None => {}
        }
    }

    fn set_only_update_baseline(&mut self, only: bool) {
        self.only_update_baseline = only;
        self.sync.update_model(|mut model| {
            model.set_only_update_baseline(only);
            model
        });
    }

    /// Encode the inference weights and publish them at the current
    /// iteration. Only rank 0 publishes; returns whether the store accepted.
    pub fn publish(&self) -> Result<bool, TrainError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        if self.sync.rank() != 0 {
            return Ok(false);
        }
        let bytes = encode_model::<B::InnerBackend, _>(&self.sync.model().valid())?;
        Ok(store.publish(self.config.player_id.clone(), bytes, self.train_iter))
    }

    /// Apply a staged config. The player id never changes.
    fn update_config(&mut self, staged: LearnerConfig) -> bool {
        let config = LearnerConfig {
            player_id: self.config.player_id.clone(),
            ..staged
        };
        if let Err(err) = config.validate() {
            log::warn!(
                "[{}] rejected config update: {}",
                self.config.player_id,
                err
            );
            return false;
        }
        self.remain_value_pretrain_iters = pretrain_countdown(&config);
        self.config = config;
        log::info!(
            "[{}] config updated: learning_rate={} value_pretrain_iters={} publish_freq={}",
            self.config.player_id,
            self.config.learning_rate,
            self.config.value_pretrain_iters,
            self.config.publish_freq
        );
        true
    }

    /// Reinitialize the value head on rank 0 and bring every rank in line.
    fn reset_value(&mut self) -> Result<(), TrainError> {
        let is_root = self.sync.rank() == 0;
        if is_root {
            let device = self.device.clone();
            self.sync
                .update_model(|model| model.reinit_value_head(&device));
        }

        let multi_replica = self.sync.world_size() > 1;
        let reset = if multi_replica {
            self.sync.broadcast_flag(is_root)?
        } else {
            is_root
        };
        if reset {
            self.optimizer = (self.optimizer_factory)();
            if multi_replica {
                self.sync.broadcast_params()?;
            }
        }
        log::info!("[{}] value head reset", self.config.player_id);
        Ok(())
    }

    pub fn model(&self) -> &M {
        self.sync.model()
    }

    pub fn into_model(self) -> M {
        self.sync.into_inner()
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    pub fn control(&self) -> &Arc<ControlFlags> {
        &self.control
    }

    pub fn train_iter(&self) -> u64 {
        self.train_iter
    }

    pub fn only_update_baseline(&self) -> bool {
        self.only_update_baseline
    }

    /// Remaining value pretraining steps, `None` once finished.
    pub fn remain_value_pretrain_iters(&self) -> Option<u64> {
        self.remain_value_pretrain_iters
    }

    pub fn synchronizer(&self) -> &GradientSynchronizer<B, M, C> {
        &self.sync
    }
}

fn pretrain_countdown(config: &LearnerConfig) -> Option<u64> {
    (config.value_pretrain_iters > 0).then_some(config.value_pretrain_iters)
}
