//! Learner tests on the `Autodiff<NdArray>` backend.
//!
//! Multi-replica tests run one replica per thread over a `local_group`.

use super::*;
use crate::config::LearnerConfig;
use crate::core::model_store::model_store;
use crate::core::player::PlayerId;
use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::optim::{GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::sync::Arc;
use std::thread;

type InnerBackend = NdArray<f32>;
type TestBackend = Autodiff<InnerBackend>;

// =============================================================================
// Test model
// =============================================================================

/// Two linear heads over a 2-feature input. The loss is the mean output of
/// the value head, plus the policy head unless only the baseline trains.
#[derive(Module, Debug)]
struct TinyModel<B: Backend> {
    policy: Linear<B>,
    value: Linear<B>,
    only_update_baseline: bool,
}

impl<B: Backend> TinyModel<B> {
    fn new(device: &B::Device) -> Self {
        Self {
            policy: LinearConfig::new(2, 1).init(device),
            value: LinearConfig::new(2, 1).init(device),
            only_update_baseline: false,
        }
    }
}

impl<B: AutodiffBackend> LearnerModel<B> for TinyModel<B> {
    type Batch = Tensor<B, 2>;

    fn learner_forward(&self, batch: &Tensor<B, 2>) -> Tensor<B, 1> {
        let value_loss = self.value.forward(batch.clone()).mean();
        if self.only_update_baseline {
            value_loss
        } else {
            value_loss + self.policy.forward(batch.clone()).mean()
        }
    }

    fn set_only_update_baseline(&mut self, only: bool) {
        self.only_update_baseline = only;
    }

    fn reinit_value_head(self, device: &B::Device) -> Self {
        Self {
            value: LinearConfig::new(2, 1)
                .with_initializer(Initializer::Constant { value: 0.5 })
                .init(device),
            ..self
        }
    }
}

fn device() -> <TestBackend as Backend>::Device {
    Default::default()
}

fn values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().to_vec::<f32>().unwrap()
}

fn head_values<B: Backend>(head: &Linear<B>) -> Vec<f32> {
    let mut out = values(head.weight.val());
    if let Some(bias) = &head.bias {
        out.extend(values(bias.val()));
    }
    out
}

/// Batch `[[a, 2a]]`; the value head's weight gradient is `[a, 2a]`.
fn batch(a: f32) -> Tensor<TestBackend, 2> {
    Tensor::from_floats([[a, 2.0 * a]], &device())
}

fn trainer<C: Collective>(
    config: LearnerConfig,
    collective: C,
) -> RlTrainer<TestBackend, TinyModel<TestBackend>, impl Optimizer<TinyModel<TestBackend>, TestBackend>, C>
{
    let device = device();
    RlTrainer::new(
        config,
        TinyModel::new(&device),
        collective,
        || SgdConfig::new().init::<TestBackend, TinyModel<TestBackend>>(),
        device,
    )
    .unwrap()
}

/// Run `f` once per rank of a fresh local group, one thread each.
fn run_replicas<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(LocalCollective) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = local_group(world_size)
        .into_iter()
        .map(|collective| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(collective))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

// =============================================================================
// GRADIENT SYNC
// =============================================================================

mod sync_tests {
    use super::*;

    #[test]
    fn test_world_of_one_leaves_gradients_unchanged() {
        let model = TinyModel::<TestBackend>::new(&device());
        let mut sync = GradientSynchronizer::new(model, SoloCollective).unwrap();
        assert_eq!(sync.state(), SyncState::Broadcasted);

        let loss = sync.model().learner_forward(&batch(1.0));
        let grads = GradientsParams::from_grads(loss.backward(), sync.model());
        let weight_id = sync.model().value.weight.id.clone();
        let before = values(grads.get::<InnerBackend, 2>(weight_id.clone()).unwrap());

        let grads = sync.sync_gradients(grads).unwrap();
        let after = values(grads.get::<InnerBackend, 2>(weight_id).unwrap());

        assert_eq!(before, after);
        assert_eq!(after, vec![1.0, 2.0]);
        assert_eq!(sync.state(), SyncState::Averaged);
        assert_eq!(sync.world_size(), 1);
    }

    #[test]
    fn test_gradients_become_replica_mean() {
        let results = run_replicas(3, |collective| {
            let rank = collective.rank();
            let model = TinyModel::<TestBackend>::new(&device());
            let mut sync = GradientSynchronizer::new(model, collective).unwrap();

            let loss = sync.model().learner_forward(&batch((rank + 1) as f32));
            let grads = GradientsParams::from_grads(loss.backward(), sync.model());
            let grads = sync.sync_gradients(grads).unwrap();
            assert_eq!(sync.state(), SyncState::Averaged);

            let value = &sync.model().value;
            let weight = values(grads.get::<InnerBackend, 2>(value.weight.id.clone()).unwrap());
            let bias_id = value.bias.as_ref().unwrap().id.clone();
            let bias = values(grads.get::<InnerBackend, 1>(bias_id).unwrap());
            (weight, bias)
        });

        // Per-rank gradients are [1, 2], [2, 4], [3, 6]
        for (weight, bias) in results {
            assert_eq!(weight, vec![2.0, 4.0]);
            assert_eq!(bias, vec![1.0]);
        }
    }

    #[test]
    fn test_construction_broadcasts_rank_zero_params() {
        let results = run_replicas(3, |collective| {
            let model = TinyModel::<TestBackend>::new(&device());
            let sync = GradientSynchronizer::new(model, collective).unwrap();
            assert_eq!(sync.state(), SyncState::Broadcasted);
            let model = sync.into_inner();
            (head_values(&model.policy), head_values(&model.value))
        });

        let first = results[0].clone();
        for result in &results[1..] {
            assert_eq!(result, &first);
        }
    }

    #[test]
    fn test_parameters_without_gradient_are_skipped() {
        let results = run_replicas(2, |collective| {
            let mut model = TinyModel::<TestBackend>::new(&device());
            model.set_only_update_baseline(true);
            let mut sync = GradientSynchronizer::new(model, collective).unwrap();

            let loss = sync.model().learner_forward(&batch(1.0));
            let grads = GradientsParams::from_grads(loss.backward(), sync.model());
            let grads = sync.sync_gradients(grads).unwrap();

            let policy_id = sync.model().policy.weight.id.clone();
            let value_id = sync.model().value.weight.id.clone();
            (
                grads.get::<InnerBackend, 2>(policy_id).is_none(),
                values(grads.get::<InnerBackend, 2>(value_id).unwrap()),
            )
        });

        for (policy_missing, value_grad) in results {
            assert!(policy_missing);
            assert_eq!(value_grad, vec![1.0, 2.0]);
        }
    }

    #[test]
    fn test_broadcast_flag_follows_rank_zero() {
        let results = run_replicas(3, |collective| {
            let rank = collective.rank();
            let model = TinyModel::<TestBackend>::new(&device());
            let sync = GradientSynchronizer::new(model, collective).unwrap();
            (
                sync.broadcast_flag(rank == 0).unwrap(),
                sync.broadcast_flag(rank != 0).unwrap(),
            )
        });
        assert!(results.iter().all(|&flags| flags == (true, false)));
    }
}

// =============================================================================
// TRAINER
// =============================================================================

mod trainer_tests {
    use super::*;

    #[test]
    fn test_value_pretrain_countdown() {
        let config = LearnerConfig::new()
            .with_learning_rate(0.1)
            .with_value_pretrain_iters(2);
        let mut trainer = trainer(config, SoloCollective);
        let policy_before = head_values(&trainer.model().policy);
        let value_before = head_values(&trainer.model().value);

        for step in 1..=2 {
            let info = trainer.train_step(batch(1.0)).unwrap();
            assert_eq!(info.train_iter, step);
            assert!(info.only_update_baseline);
        }
        assert_eq!(head_values(&trainer.model().policy), policy_before);
        assert_ne!(head_values(&trainer.model().value), value_before);
        assert_eq!(trainer.remain_value_pretrain_iters(), Some(0));

        let info = trainer.train_step(batch(1.0)).unwrap();
        assert!(!info.only_update_baseline);
        assert!(!trainer.model().only_update_baseline);
        assert_eq!(trainer.remain_value_pretrain_iters(), None);
        assert_ne!(head_values(&trainer.model().policy), policy_before);
    }

    #[test]
    fn test_sgd_step_applies_gradient() {
        let mut trainer = trainer(LearnerConfig::new().with_learning_rate(0.5), SoloCollective);
        let before = values(trainer.model().value.weight.val());

        let info = trainer.train_step(batch(1.0)).unwrap();
        assert!(info.loss.is_finite());

        let after = values(trainer.model().value.weight.val());
        assert!((after[0] - (before[0] - 0.5)).abs() < 1e-5);
        assert!((after[1] - (before[1] - 1.0)).abs() < 1e-5);
    }

    #[test]
    fn test_publishes_every_publish_freq_steps() {
        let store = model_store::<Vec<u8>>();
        let config = LearnerConfig::for_player("main_player").with_publish_freq(2);
        let mut trainer = trainer(config, SoloCollective)
            .with_model_store(Arc::clone(&store))
            .with_memory_probe(Box::new(HostMemoryProbe::new()));

        assert!(!trainer.train_step(batch(1.0)).unwrap().published);
        assert!(trainer.train_step(batch(1.0)).unwrap().published);

        let player = PlayerId::new("main_player");
        assert_eq!(store.latest_train_iter(&player), Some(2));
        let snapshot = store.take(&player).unwrap();
        assert_eq!(snapshot.train_iter, 2);

        let fresh = TinyModel::<InnerBackend>::new(&device());
        let decoded = decode_model::<InnerBackend, _>(fresh, &snapshot.weights, &device()).unwrap();
        let current = trainer.model().valid();
        assert_eq!(head_values(&decoded.value), head_values(&current.value));
        assert_eq!(head_values(&decoded.policy), head_values(&current.policy));

        assert!(!trainer.train_step(batch(1.0)).unwrap().published);
    }

    #[test]
    fn test_publish_without_store_is_noop() {
        let trainer = trainer(LearnerConfig::new(), SoloCollective);
        assert!(!trainer.publish().unwrap());
    }

    #[test]
    fn test_reset_value_request() {
        let mut trainer = trainer(LearnerConfig::new(), SoloCollective);
        let policy_before = head_values(&trainer.model().policy);

        trainer.control().request_reset_value();
        let info = trainer.train_step(batch(1.0)).unwrap();

        assert!(info.value_reset);
        assert!(head_values(&trainer.model().value)
            .iter()
            .all(|&v| (v - 0.5).abs() < 1e-6));
        assert_ne!(head_values(&trainer.model().policy), policy_before);
        assert!(!trainer.train_step(batch(1.0)).unwrap().value_reset);
    }

    #[test]
    fn test_config_update_keeps_player_id() {
        let control = Arc::new(ControlFlags::new());
        let mut trainer =
            trainer(LearnerConfig::for_player("learner_a"), SoloCollective).with_control(Arc::clone(&control));

        control.request_update_config(
            LearnerConfig::for_player("someone_else")
                .with_learning_rate(0.5)
                .with_value_pretrain_iters(1),
        );
        let info = trainer.train_step(batch(1.0)).unwrap();

        assert!(info.config_updated);
        assert!(!info.only_update_baseline);
        assert_eq!(trainer.config().learning_rate, 0.5);
        assert_eq!(trainer.config().player_id, PlayerId::new("learner_a"));
        assert_eq!(trainer.remain_value_pretrain_iters(), Some(1));

        // The restarted countdown applies from the next step
        assert!(trainer.train_step(batch(1.0)).unwrap().only_update_baseline);
    }

    #[test]
    fn test_invalid_config_update_is_rejected() {
        let mut trainer = trainer(LearnerConfig::new().with_learning_rate(0.1), SoloCollective);
        trainer
            .control()
            .request_update_config(LearnerConfig::new().with_learning_rate(0.0));

        let info = trainer.train_step(batch(1.0)).unwrap();
        assert!(!info.config_updated);
        assert_eq!(trainer.config().learning_rate, 0.1);
    }

    #[test]
    fn test_invalid_initial_config() {
        let device = device();
        let result = RlTrainer::new(
            LearnerConfig::new().with_publish_freq(0),
            TinyModel::<TestBackend>::new(&device),
            SoloCollective,
            || SgdConfig::new().init::<TestBackend, TinyModel<TestBackend>>(),
            device,
        );
        assert!(matches!(result, Err(TrainError::Config(_))));
    }

    #[test]
    fn test_replicas_stay_identical() {
        let store = model_store::<Vec<u8>>();
        let shared = Arc::clone(&store);
        let results = run_replicas(2, move |collective| {
            let rank = collective.rank();
            let mut trainer = trainer(LearnerConfig::new().with_learning_rate(0.1), collective)
                .with_model_store(Arc::clone(&shared));

            let mut published = Vec::new();
            for step in 0..3 {
                if step == 2 {
                    trainer.control().request_reset_value();
                }
                let info = trainer.train_step(batch((rank + step + 1) as f32)).unwrap();
                published.push(info.published);
            }
            let model = trainer.into_model();
            (
                rank,
                published,
                head_values(&model.policy),
                head_values(&model.value),
            )
        });

        let (_, _, policy, value) = &results[0];
        for (rank, published, other_policy, other_value) in &results {
            assert_eq!(other_policy, policy);
            assert_eq!(other_value, value);
            assert_eq!(published, &vec![*rank == 0; 3]);
        }
        assert!(value.iter().all(|&v| (v - 0.5).abs() < 1e-6));
        assert_eq!(store.latest_train_iter(&PlayerId::new("main_player")), Some(3));
    }
}

// =============================================================================
// SNAPSHOT CODEC
// =============================================================================

mod snapshot_tests {
    use super::*;

    #[test]
    fn test_decode_into_fresh_model() {
        let device = device();
        let source = TinyModel::<InnerBackend>::new(&device);
        let bytes = encode_model::<InnerBackend, _>(&source).unwrap();
        assert!(!bytes.is_empty());

        let decoded = decode_model::<InnerBackend, _>(TinyModel::<InnerBackend>::new(&device), &bytes, &device).unwrap();
        assert_eq!(head_values(&decoded.policy), head_values(&source.policy));
        assert_eq!(head_values(&decoded.value), head_values(&source.value));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let device = device();
        let result = decode_model::<InnerBackend, _>(TinyModel::<InnerBackend>::new(&device), &[1, 2, 3], &device);
        assert!(matches!(result, Err(SnapshotError::Decode(_))));
    }
}
