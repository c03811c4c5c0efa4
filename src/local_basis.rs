// src/local_basis.rs

//! Localized ridge solves over the eigenwarp basis.
//!
//! At a grid point `p` the model's displacement is a linear function of the
//! mode coefficients: the three channel rows of `U`, scaled by
//! `1 / sqrt(n - 1)`, form a `3 x k` reduced matrix `B_p`. An interactive edit
//! asks for displacement `d` at `p`; the smallest-energy coefficients that
//! achieve it are found from the ridge normal equations
//! `(B_p^T B_p + gamma I) c = B_p^T d`. The transfer operator
//! `Z_p = (B_p^T B_p + gamma I)^-1 B_p^T` maps any edit at `p` to coefficients,
//! and `B_q Z_p` tells how point `q` moves when `p` is edited.

use crate::linalg_backends::{LinAlgBackend, LinAlgBackendProvider};
use crate::model::DeformationModel;
use crate::ThreadSafeStdError;
use float_cmp::approx_eq;
use log::{debug, warn};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Eigenvalues at or below this fraction of the largest one are treated as
/// zero by [`ModeScaling::InverseEigenvalue`].
const INVERSE_EIGENVALUE_FLOOR: f64 = 1e-10;

/// Singular values below `rcond * max` are dropped by the pseudo-inverse fallback.
const PINV_RCOND: f64 = 1e-12;

/// A ridge weight at or below this fraction of the largest diagonal entry of
/// `B^T B` does not make the normal matrix safely invertible.
const NEGLIGIBLE_RIDGE: f64 = 1e-12;

/// Per-mode pre-scaling applied to the coefficients before solving.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeScaling {
    /// `s_i = 1`
    #[default]
    Identity,
    /// `s_i = lambda_i`
    Eigenvalue,
    /// `s_i = sqrt(lambda_i)`
    SqrtEigenvalue,
    /// `s_i = 1 / lambda_i`, zero for modes without energy.
    InverseEigenvalue,
}

impl ModeScaling {
    pub const ALL: [ModeScaling; 4] = [
        ModeScaling::Identity,
        ModeScaling::Eigenvalue,
        ModeScaling::SqrtEigenvalue,
        ModeScaling::InverseEigenvalue,
    ];

    /// Scale factors for the given eigenvalues.
    pub fn factors(self, eigenvalues: &[f64]) -> Array1<f64> {
        let max = eigenvalues.iter().cloned().fold(0.0, f64::max);
        let floor = max * INVERSE_EIGENVALUE_FLOOR;
        eigenvalues
            .iter()
            .map(|&l| {
                let l = l.max(0.0);
                match self {
                    ModeScaling::Identity => 1.0,
                    ModeScaling::Eigenvalue => l,
                    ModeScaling::SqrtEigenvalue => l.sqrt(),
                    ModeScaling::InverseEigenvalue => {
                        if l > floor && l > 0.0 {
                            1.0 / l
                        } else {
                            0.0
                        }
                    }
                }
            })
            .collect()
    }

    fn needs_eigenvalues(self) -> bool {
        self != ModeScaling::Identity
    }
}

/// Source of a 3x3 tensor at a normalized grid point.
pub trait TensorProvider {
    fn tensor_at(&self, point: [f64; 3]) -> Result<Array2<f64>, ThreadSafeStdError>;
}

/// The same diagonal tensor everywhere.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DiagonalTensor(pub [f64; 3]);

impl DiagonalTensor {
    pub fn identity() -> Self {
        DiagonalTensor([1.0; 3])
    }
}

impl TensorProvider for DiagonalTensor {
    fn tensor_at(&self, _point: [f64; 3]) -> Result<Array2<f64>, ThreadSafeStdError> {
        Ok(Array2::from_diag(&Array1::from(self.0.to_vec())))
    }
}

/// Sample covariance of the model's training data, as a tensor field.
pub struct ModelCovariance<'a, B = LinAlgBackendProvider<f64>> {
    model: &'a DeformationModel<B>,
}

impl<'a, B> ModelCovariance<'a, B> {
    pub fn new(model: &'a DeformationModel<B>) -> Self {
        Self { model }
    }
}

impl<'a, B: LinAlgBackend<f64>> TensorProvider for ModelCovariance<'a, B> {
    fn tensor_at(&self, point: [f64; 3]) -> Result<Array2<f64>, ThreadSafeStdError> {
        self.model.sample_covariance_at(point)
    }
}

/// Solver settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalBasisConfig {
    /// Active modes `k`. `None` uses every mode of the model; larger values are clamped.
    pub num_modes: Option<usize>,
    /// Ridge weight `gamma`.
    pub gamma: f64,
    pub scaling: ModeScaling,
}

impl Default for LocalBasisConfig {
    fn default() -> Self {
        Self {
            num_modes: None,
            gamma: 1.0,
            scaling: ModeScaling::Identity,
        }
    }
}

/// Outcome of one local solve.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalSolution {
    /// Coefficients in the scaled basis, the unknowns of the ridge system.
    pub reduced_coefficients: Array1<f64>,
    /// Global synthesis coefficients, `s_i * reduced_i`, ready for
    /// [`DeformationModel::synthesize_field`].
    pub coefficients: Array1<f64>,
    /// Displacement the coefficients produce at the solve point, `B c`.
    pub displacement: Array1<f64>,
    /// `||d - B c||`
    pub data_error: f64,
    /// `gamma * ||c||`
    pub regularization_error: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverState {
    /// No reference point yet; tensors come from the default provider.
    Unset,
    /// `Z_p` is cached for the reference point.
    ReferenceSet,
}

#[derive(Debug)]
struct Reference {
    point: [f64; 3],
    z_p: Array2<f64>,
}

/// Ridge solver over the leading `k` eigenwarps of a model.
///
/// Borrows the model immutably, so the eigenwarps cannot change underneath a
/// cached `Z_p`.
pub struct LocalBasisSolver<'m, B = LinAlgBackendProvider<f64>> {
    model: &'m DeformationModel<B>,
    num_modes: usize,
    gamma: f64,
    scaling: ModeScaling,
    /// `s_i / sqrt(n - 1)` for each active mode.
    column_scale: Array1<f64>,
    /// `s_i` for each active mode.
    mode_scale: Array1<f64>,
    reference: Option<Reference>,
    default_tensor: Option<Box<dyn TensorProvider + 'm>>,
    covariance: Option<Box<dyn TensorProvider + 'm>>,
}

impl<'m, B: LinAlgBackend<f64>> LocalBasisSolver<'m, B> {
    pub fn new(model: &'m DeformationModel<B>, config: LocalBasisConfig) -> Result<Self, ThreadSafeStdError> {
        if !model.status().eigenmodes {
            return Err("Local solves need the model's eigenmodes.".into());
        }
        let mut solver = Self {
            model,
            num_modes: 0,
            gamma: 0.0,
            scaling: config.scaling,
            column_scale: Array1::zeros(0),
            mode_scale: Array1::zeros(0),
            reference: None,
            default_tensor: None,
            covariance: None,
        };
        solver.set_gamma(config.gamma)?;
        solver.configure(config.num_modes, config.scaling)?;
        Ok(solver)
    }

    pub fn num_modes(&self) -> usize {
        self.num_modes
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn scaling(&self) -> ModeScaling {
        self.scaling
    }

    pub fn state(&self) -> SolverState {
        if self.reference.is_some() {
            SolverState::ReferenceSet
        } else {
            SolverState::Unset
        }
    }

    pub fn reference_point(&self) -> Option<[f64; 3]> {
        self.reference.as_ref().map(|r| r.point)
    }

    /// Tensor returned by [`get_tensor`](Self::get_tensor) before a reference
    /// point is set. Without one, the identity is used.
    pub fn set_default_tensor_provider(&mut self, provider: Option<Box<dyn TensorProvider + 'm>>) {
        self.default_tensor = provider;
    }

    /// Covariance `Sigma` at the reference point used to weight tensors as
    /// `Z_pq Sigma Z_pq^T`. Without one, `Z_pq Z_pq^T` is returned.
    pub fn set_covariance_provider(&mut self, provider: Option<Box<dyn TensorProvider + 'm>>) {
        self.covariance = provider;
    }

    pub fn set_gamma(&mut self, gamma: f64) -> Result<(), ThreadSafeStdError> {
        if !gamma.is_finite() || gamma < 0.0 {
            return Err(format!("Regularization weight must be finite and non-negative, got {}.", gamma).into());
        }
        self.gamma = gamma;
        self.refresh_reference()
    }

    pub fn set_scaling(&mut self, scaling: ModeScaling) -> Result<(), ThreadSafeStdError> {
        self.configure(Some(self.num_modes), scaling)
    }

    /// Changes the number of active modes, clamped to what the model offers.
    pub fn set_num_modes(&mut self, num_modes: usize) -> Result<(), ThreadSafeStdError> {
        self.configure(Some(num_modes), self.scaling)
    }

    fn configure(&mut self, num_modes: Option<usize>, scaling: ModeScaling) -> Result<(), ThreadSafeStdError> {
        let available = self.model.num_modes();
        // a single sample has no variance to model
        let k = if available < 2 {
            0
        } else {
            num_modes.unwrap_or(available).min(available)
        };
        let eigenvalues: Vec<f64> = match self.model.eigenvalues() {
            Some(l) => l.iter().take(k).cloned().collect(),
            None if scaling.needs_eigenvalues() => {
                return Err(format!("Mode scaling {:?} needs the model's eigenvalues.", scaling).into());
            }
            None => vec![1.0; k],
        };
        if eigenvalues.len() < k {
            return Err(format!("Model has {} eigenvalues for {} active modes.", eigenvalues.len(), k).into());
        }
        let mode_scale = scaling.factors(&eigenvalues);
        let norm = if available < 2 { 1.0 } else { ((available - 1) as f64).sqrt() };
        self.column_scale = mode_scale.mapv(|s| s / norm);
        self.mode_scale = mode_scale;
        self.num_modes = k;
        self.scaling = scaling;
        debug!("Local basis configured with {} of {} modes, scaling {:?}.", k, available, scaling);
        self.refresh_reference()
    }

    fn refresh_reference(&mut self) -> Result<(), ThreadSafeStdError> {
        if let Some(point) = self.reference.take().map(|r| r.point) {
            let z_p = self.compute_zp(point)?;
            self.reference = Some(Reference { point, z_p });
        }
        Ok(())
    }

    /// The `3 x k` matrix mapping scaled coefficients to displacement at `p`.
    pub fn get_reduced_matrix(&self, p: [f64; 3]) -> Result<Array2<f64>, ThreadSafeStdError> {
        let rows = self.model.header().row_indices(p);
        let u = self.model.get_eigenmode_rows(&rows)?;
        let mut b = Array2::<f64>::zeros((rows.len(), self.num_modes));
        for (mut dst, src) in b.axis_iter_mut(Axis(0)).zip(u.axis_iter(Axis(0))) {
            for ((d, &v), &s) in dst.iter_mut().zip(src.iter()).zip(self.column_scale.iter()) {
                *d = v as f64 * s;
            }
        }
        Ok(b)
    }

    fn normal_matrix(&self, b: &Array2<f64>) -> Array2<f64> {
        let mut a = b.t().dot(b);
        a.diag_mut().mapv_inplace(|v| v + self.gamma);
        a
    }

    /// Solves `(B^T B + gamma I) X = rhs`.
    ///
    /// With a negligible ridge weight `B^T B` has rank at most 3, so the
    /// minimum-norm solution from the pseudo-inverse is used directly. An LU
    /// failure or non-finite result also falls back to the pseudo-inverse, and
    /// from there to zeros.
    fn solve_normal(&self, a: &Array2<f64>, rhs: &Array2<f64>) -> Array2<f64> {
        let backend = self.model.backend();
        let diag_max = a.diag().iter().fold(0.0f64, |m, &v| m.max(v.abs()));
        if self.gamma > NEGLIGIBLE_RIDGE * diag_max {
            match backend.solve_multi(a, rhs) {
                Ok(x) if x.iter().all(|v| v.is_finite()) => return x,
                Ok(_) => warn!("Local system produced non-finite values; retrying with the pseudo-inverse."),
                Err(e) => warn!("Local system solve failed ({}); retrying with the pseudo-inverse.", e),
            }
        } else {
            debug!("Ridge weight {} is negligible; using the minimum-norm solution.", self.gamma);
        }
        match backend.pinv(a, PINV_RCOND) {
            Ok(p) => {
                let x = p.dot(rhs);
                if x.iter().all(|v| v.is_finite()) {
                    return x;
                }
                warn!("Pseudo-inverse produced non-finite values; using zero coefficients.");
            }
            Err(e) => warn!("Pseudo-inverse failed ({}); using zero coefficients.", e),
        }
        Array2::zeros(rhs.raw_dim())
    }

    fn compute_zp(&self, p: [f64; 3]) -> Result<Array2<f64>, ThreadSafeStdError> {
        let b = self.get_reduced_matrix(p)?;
        if self.num_modes == 0 {
            return Ok(Array2::zeros((0, b.nrows())));
        }
        let a = self.normal_matrix(&b);
        Ok(self.solve_normal(&a, &b.t().to_owned()))
    }

    fn is_reference(&self, p: [f64; 3]) -> bool {
        self.reference.as_ref().is_some_and(|r| {
            r.point
                .iter()
                .zip(p.iter())
                .all(|(&a, &b)| approx_eq!(f64, a, b, ulps = 2))
        })
    }

    /// `Z_p`, computed once per reference point and cached.
    pub fn get_zp(&mut self, p: [f64; 3]) -> Result<&Array2<f64>, ThreadSafeStdError> {
        if !self.is_reference(p) {
            let z_p = self.compute_zp(p)?;
            debug!("Cached transfer operator for reference point {:?}.", p);
            self.reference = Some(Reference { point: p, z_p });
        }
        match &self.reference {
            Some(r) => Ok(&r.z_p),
            None => Err("Reference point was not recorded.".into()),
        }
    }

    pub fn set_reference_point(&mut self, p: [f64; 3]) -> Result<(), ThreadSafeStdError> {
        self.get_zp(p).map(|_| ())
    }

    pub fn clear_reference_point(&mut self) {
        self.reference = None;
    }

    /// Coefficients that move point `p` by `d` with minimal ridge energy.
    ///
    /// Reuses the cached `Z_p` when `p` is the reference point. With no active
    /// modes the zero solution is returned.
    pub fn solve(&self, p: [f64; 3], d: [f64; 3]) -> Result<LocalSolution, ThreadSafeStdError> {
        let b = self.get_reduced_matrix(p)?;
        let target = Array1::from(d.to_vec());
        let reduced = if self.num_modes == 0 {
            Array1::zeros(0)
        } else if let Some(r) = self.reference.as_ref().filter(|_| self.is_reference(p)) {
            r.z_p.dot(&target)
        } else {
            let a = self.normal_matrix(&b);
            let rhs = b.t().dot(&target).insert_axis(Axis(1));
            self.solve_normal(&a, &rhs).column(0).to_owned()
        };
        let displacement = b.dot(&reduced);
        let residual = &target - &displacement;
        Ok(LocalSolution {
            coefficients: &reduced * &self.mode_scale,
            data_error: residual.dot(&residual).sqrt(),
            regularization_error: self.gamma * reduced.dot(&reduced).sqrt(),
            displacement,
            reduced_coefficients: reduced,
        })
    }

    /// `Z_pq = B_q Z_p`: displacement at `q` per unit edit at the reference point.
    pub fn get_transfer(&self, q: [f64; 3]) -> Result<Option<Array2<f64>>, ThreadSafeStdError> {
        match &self.reference {
            Some(r) => Ok(Some(self.get_reduced_matrix(q)?.dot(&r.z_p))),
            None => Ok(None),
        }
    }

    /// Sensitivity tensor at `q` for edits at the reference point.
    ///
    /// `Z_pq Z_pq^T`, or `Z_pq Sigma Z_pq^T` with a covariance provider. Before
    /// a reference point is set, or if the result would not be finite, the
    /// default tensor is returned instead.
    pub fn get_tensor(&self, q: [f64; 3]) -> Result<Array2<f64>, ThreadSafeStdError> {
        let (point, zpq) = match (&self.reference, self.get_transfer(q)?) {
            (Some(r), Some(zpq)) => (r.point, zpq),
            _ => return self.default_tensor_at(q),
        };
        let tensor = match &self.covariance {
            Some(provider) => {
                let sigma = provider.tensor_at(point)?;
                if sigma.dim() != (3, 3) {
                    return Err(format!("Covariance provider returned a {:?} tensor.", sigma.dim()).into());
                }
                zpq.dot(&sigma).dot(&zpq.t())
            }
            None => zpq.dot(&zpq.t()),
        };
        if tensor.iter().all(|v| v.is_finite()) {
            Ok(tensor)
        } else {
            warn!("Tensor at {:?} is not finite; using the default tensor.", q);
            self.default_tensor_at(q)
        }
    }

    fn default_tensor_at(&self, q: [f64; 3]) -> Result<Array2<f64>, ThreadSafeStdError> {
        let tensor = match &self.default_tensor {
            Some(provider) => provider.tensor_at(q)?,
            None => DiagonalTensor::identity().tensor_at(q)?,
        };
        if tensor.dim() != (3, 3) || tensor.iter().any(|v| !v.is_finite()) {
            warn!("Default tensor provider returned an unusable tensor; using the identity.");
            return DiagonalTensor::identity().tensor_at(q);
        }
        Ok(tensor)
    }
}

impl<'m, B> std::fmt::Debug for LocalBasisSolver<'m, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBasisSolver")
            .field("num_modes", &self.num_modes)
            .field("gamma", &self.gamma)
            .field("scaling", &self.scaling)
            .field("reference", &self.reference)
            .field("default_tensor", &self.default_tensor.is_some())
            .field("covariance", &self.covariance.is_some())
            .finish()
    }
}
