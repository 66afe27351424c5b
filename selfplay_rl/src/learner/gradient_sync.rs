//! Gradient averaging and parameter broadcast across learner replicas.
//!
//! Each replica wraps its model in a `GradientSynchronizer` together with a
//! `Collective` handle. Construction broadcasts rank 0's parameters so every
//! replica starts identical; after each backward pass `sync_gradients`
//! replaces every gradient with its mean across replicas.
//!
//! Parameters are visited in module traversal order, which is identical for
//! replicas of the same architecture, so the i-th collective call on every
//! rank refers to the same parameter.
//!
//! ```text
//! Uninitialized ──broadcast──> Broadcasted ──sum──> GradientsSummed ──scale──> Averaged
//!                                   ^                                            │
//!                                   └────────────── next sync ───────────────────┘
//! ```

use crate::learner::collective::{Collective, CollectiveError};
use burn::module::{AutodiffModule, ModuleMapper, ModuleVisitor, Param};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use std::marker::PhantomData;
use thiserror::Error;

/// Errors raised while synchronizing replicas.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A collective operation failed; replicas are out of step.
    #[error("collective failed: {0}")]
    Collective(#[from] CollectiveError),
    /// Tensor contents could not be read back as `f32`.
    #[error("cannot read tensor data: {0}")]
    Data(String),
}

/// Where the synchronizer is in its per-step cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Parameters not yet broadcast
    Uninitialized,
    /// All replicas hold rank 0's parameters
    Broadcasted,
    /// Gradients hold the sum across replicas
    GradientsSummed,
    /// Gradients hold the mean across replicas
    Averaged,
}

fn flatten<K: Backend, const D: usize>(tensor: Tensor<K, D>) -> Result<Vec<f32>, SyncError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| SyncError::Data(format!("{err:?}")))
}

fn unflatten<K: Backend, const D: usize>(
    values: Vec<f32>,
    dims: [usize; D],
    device: &K::Device,
) -> Tensor<K, D> {
    Tensor::from_data(TensorData::new(values, dims), device)
}

enum GradientPass {
    Sum,
    Scale(f32),
}

/// Rewrites the gradient of every visited parameter. The model is only read.
struct GradientVisitor<'a, B: AutodiffBackend, C: ?Sized> {
    grads: GradientsParams,
    collective: &'a C,
    pass: GradientPass,
    touched: usize,
    error: Option<SyncError>,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend, C: Collective + ?Sized> GradientVisitor<'_, B, C> {
    fn rewrite<const D: usize>(
        &self,
        grad: Tensor<B::InnerBackend, D>,
    ) -> Result<Tensor<B::InnerBackend, D>, SyncError> {
        match self.pass {
            GradientPass::Sum => {
                let dims = grad.dims();
                let device = grad.device();
                let mut values = flatten(grad)?;
                self.collective.all_reduce_sum(&mut values)?;
                Ok(unflatten(values, dims, &device))
            }
            GradientPass::Scale(divisor) => Ok(grad.div_scalar(divisor)),
        }
    }
}

impl<B: AutodiffBackend, C: Collective + ?Sized> ModuleVisitor<B> for GradientVisitor<'_, B, C> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if self.error.is_some() {
            return;
        }
        let id = param.id.clone();
        // Only parameters that took part in the loss have a gradient
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id.clone()) else {
            return;
        };
        match self.rewrite(grad) {
            Ok(grad) => {
                self.grads.register::<B::InnerBackend, D>(id, grad);
                self.touched += 1;
            }
            Err(err) => self.error = Some(err),
        }
    }
}

/// Broadcasts every float parameter from rank 0.
struct ParamBroadcaster<'a, C: ?Sized> {
    collective: &'a C,
    count: usize,
    error: Option<SyncError>,
}

impl<B: Backend, C: Collective + ?Sized> ModuleMapper<B> for ParamBroadcaster<'_, C> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        if self.error.is_some() {
            return param;
        }
        let tensor = param.val();
        let dims = tensor.dims();
        let device = tensor.device();
        let require_grad = tensor.is_require_grad();

        let mut values = match flatten(tensor) {
            Ok(values) => values,
            Err(err) => {
                self.error = Some(err);
                return param;
            }
        };
        if let Err(err) = self.collective.broadcast(&mut values, 0) {
            self.error = Some(err.into());
            return param;
        }
        self.count += 1;

        if self.collective.rank() == 0 {
            return param;
        }
        let mut tensor = unflatten::<B, D>(values, dims, &device);
        if require_grad {
            tensor = tensor.require_grad();
        }
        Param::initialized(param.id.clone(), tensor)
    }
}

/// One learner replica plus the collective that ties it to its peers.
pub struct GradientSynchronizer<B, M, C>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    C: Collective,
{
    model: M,
    collective: C,
    state: SyncState,
    _backend: PhantomData<B>,
}

impl<B, M, C> GradientSynchronizer<B, M, C>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    C: Collective,
{
    /// Wrap a replica and broadcast rank 0's parameters to the group.
    ///
    /// Every rank must call this, since the broadcast is collective.
    pub fn new(model: M, collective: C) -> Result<Self, SyncError> {
        let mut sync = Self {
            model,
            collective,
            state: SyncState::Uninitialized,
            _backend: PhantomData,
        };
        sync.broadcast_params()?;
        Ok(sync)
    }

    /// Replace every gradient with its mean across replicas.
    ///
    /// With a single replica the gradients are returned untouched after a
    /// barrier.
    pub fn sync_gradients(&mut self, grads: GradientsParams) -> Result<GradientsParams, SyncError> {
        let world_size = self.collective.world_size();
        if world_size <= 1 {
            self.collective.barrier()?;
            self.state = SyncState::Averaged;
            return Ok(grads);
        }

        let grads = self.run_pass(grads, GradientPass::Sum)?;
        self.state = SyncState::GradientsSummed;
        let grads = self.run_pass(grads, GradientPass::Scale(world_size as f32))?;
        self.state = SyncState::Averaged;
        Ok(grads)
    }

    fn run_pass(&self, grads: GradientsParams, pass: GradientPass) -> Result<GradientsParams, SyncError> {
        let mut visitor = GradientVisitor::<B, C> {
            grads,
            collective: &self.collective,
            pass,
            touched: 0,
            error: None,
            _backend: PhantomData,
        };
        self.model.visit(&mut visitor);
        if let Some(err) = visitor.error {
            return Err(err);
        }
        log::trace!(
            "rank {}: rewrote {} gradients",
            self.collective.rank(),
            visitor.touched
        );
        Ok(visitor.grads)
    }

    /// Overwrite every float parameter with rank 0's value.
    pub fn broadcast_params(&mut self) -> Result<(), SyncError> {
        let mut broadcaster = ParamBroadcaster {
            collective: &self.collective,
            count: 0,
            error: None,
        };
        let model = self.model.clone().map(&mut broadcaster);
        if let Some(err) = broadcaster.error {
            return Err(err);
        }
        log::debug!(
            "rank {}: broadcast {} parameters from rank 0",
            self.collective.rank(),
            broadcaster.count
        );
        self.model = model;
        self.state = SyncState::Broadcasted;
        Ok(())
    }

    /// Share rank 0's value of `flag` with every rank.
    pub fn broadcast_flag(&self, flag: bool) -> Result<bool, SyncError> {
        let mut buf = [if flag { 1.0 } else { 0.0 }];
        self.collective.broadcast(&mut buf, 0)?;
        Ok(buf[0] != 0.0)
    }

    /// Current replica.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Replace the replica with `f(model)`, e.g. an optimizer step.
    pub fn update_model<F>(&mut self, f: F)
    where
        F: FnOnce(M) -> M,
    {
        self.model = f(self.model.clone());
    }

    /// Unwrap the replica.
    pub fn into_inner(self) -> M {
        self.model
    }

    /// Collective handle.
    pub fn collective(&self) -> &C {
        &self.collective
    }

    /// Rank of this replica.
    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    /// Current group size.
    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    /// Where the synchronizer is in its cycle.
    pub fn state(&self) -> SyncState {
        self.state
    }
}
