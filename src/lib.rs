// Statistical deformation models (SDM)

#![doc = include_str!("../README.md")]

use std::error::Error;

pub mod config;
pub mod header;
pub mod linalg_backends;
pub mod local_basis;
pub mod matrix_store;
pub mod model;
pub mod status;

/// Error type returned by every fallible operation of the crate.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

pub use config::{MatrixFiles, SdmConfig};
pub use header::{FieldHeader, CHANNELS};
pub use linalg_backends::{LinAlgBackend, LinAlgBackendProvider};
pub use local_basis::{
    DiagonalTensor, LocalBasisConfig, LocalBasisSolver, LocalSolution, ModeScaling, ModelCovariance, SolverState,
    TensorProvider,
};
pub use matrix_store::{MatrixStore, StorageMode};
pub use model::DeformationModel;
pub use status::ModelStatus;

#[cfg(test)]
mod model_tests;
