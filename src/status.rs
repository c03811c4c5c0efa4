// src/status.rs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which artifacts of a deformation model are currently valid.
///
/// Derived from the model on request, so it can never drift from the state
/// it describes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    /// Data matrix `X` is loaded or allocated.
    pub data: bool,
    /// Eigenwarp matrix `U = X V` is available.
    pub eigenmodes: bool,
    /// Scatter matrix `S = X^T X` is available.
    pub scatter: bool,
    /// Eigenvector matrix `V` is available.
    pub eigenvectors: bool,
    /// Eigenvalues are available.
    pub eigenvalues: bool,
}

impl ModelStatus {
    /// All five artifacts are present.
    pub fn is_complete(&self) -> bool {
        self.data && self.eigenmodes && self.scatter && self.eigenvectors && self.eigenvalues
    }

    /// Enough to synthesize fields: the eigenwarps alone. Synthesis also
    /// needs at least two eigenwarp columns, which is checked at the call.
    pub fn can_synthesize(&self) -> bool {
        self.eigenmodes
    }

    /// Enough to reconstruct training samples: eigenwarps and eigenvectors.
    pub fn can_reconstruct(&self) -> bool {
        self.eigenmodes && self.eigenvectors
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |b: bool| if b { "yes" } else { "no" };
        write!(
            f,
            "data={} eigenmodes={} scatter={} V={} lambda={}",
            flag(self.data),
            flag(self.eigenmodes),
            flag(self.scatter),
            flag(self.eigenvectors),
            flag(self.eigenvalues)
        )
    }
}
