//! Weight snapshot codec for model distribution.
//!
//! Learners publish weights as burn records serialized with
//! `BinBytesRecorder` at full precision; actors decode them into their own
//! inference modules.

use burn::module::Module;
use burn::prelude::*;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use thiserror::Error;

/// Errors raised by the snapshot codec.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to encode model record: {0}")]
    Encode(String),
    #[error("failed to decode model record: {0}")]
    Decode(String),
}

/// Serialize a module's parameters.
pub fn encode_model<B: Backend, M: Module<B>>(model: &M) -> Result<Vec<u8>, SnapshotError> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    recorder
        .record(model.clone().into_record(), ())
        .map_err(|err| SnapshotError::Encode(format!("{err:?}")))
}

/// Load serialized parameters into `model`.
///
/// `model` must have the architecture the bytes were produced from.
pub fn decode_model<B: Backend, M: Module<B>>(
    model: M,
    bytes: &[u8],
    device: &B::Device,
) -> Result<M, SnapshotError> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(bytes.to_vec(), device)
        .map_err(|err| SnapshotError::Decode(format!("{err:?}")))?;
    Ok(model.load_record(record))
}
