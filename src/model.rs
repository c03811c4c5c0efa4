// src/model.rs

//! Statistical deformation model over a set of warp fields.
//!
//! The data matrix `X` holds one flattened warp field per column
//! (`field_size x num_samples`). Because `field_size` is typically millions
//! while `num_samples` is tens, the model never forms the `field_size^2`
//! covariance. It accumulates the `num_samples x num_samples` scatter matrix
//! `S = X^T X` one row of `X` at a time, diagonalizes it, and maps the
//! eigenvectors back into field space as eigenwarps `U = X V`, again streaming
//! row by row. Every bulk pass therefore works the same whether `X` is in
//! memory or served from disk by [`MatrixStore`].

use crate::config::{MatrixFiles, SdmConfig};
use crate::header::FieldHeader;
use crate::linalg_backends::{LinAlgBackend, LinAlgBackendProvider};
use crate::matrix_store::MatrixStore;
use crate::status::ModelStatus;
use crate::ThreadSafeStdError;
use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

/// Eigenvalues at or below this fraction of the largest one count as zero
/// when a division by the mode's energy is needed.
const RELATIVE_EIGENVALUE_FLOOR: f64 = 1e-10;

/// A PCA-based linear model over dense 3D displacement fields.
#[derive(Debug)]
pub struct DeformationModel<B = LinAlgBackendProvider<f64>> {
    header: FieldHeader,
    sample_names: Vec<String>,
    /// X, `field_size x num_samples`.
    data: MatrixStore,
    /// U = X V, `field_size x num_samples`.
    eigenmodes: MatrixStore,
    /// S = X^T X.
    scatter: Option<Array2<f64>>,
    /// V, columns sorted by descending eigenvalue.
    eigenvectors: Option<Array2<f64>>,
    eigenvalues: Option<Array1<f64>>,
    mean: Option<Array1<f32>>,
    mean_subtracted: bool,
    spill_directory: Option<PathBuf>,
    /// Eigenwarps larger than this many bytes go straight to disk.
    eigenmode_memory_limit: Option<usize>,
    backend: B,
}

/// Small PCA artifacts persisted together in one bincode file.
#[derive(Debug, Serialize, Deserialize)]
struct PcaBundle {
    header: FieldHeader,
    sample_names: Vec<String>,
    mean: Option<Array1<f32>>,
    scatter: Option<Array2<f64>>,
    eigenvectors: Option<Array2<f64>>,
    eigenvalues: Option<Array1<f64>>,
}

impl DeformationModel<LinAlgBackendProvider<f64>> {
    /// Creates an empty model for fields on the given grid, using the
    /// feature-selected linear algebra backend.
    pub fn new(header: FieldHeader) -> Self {
        Self::with_backend(header, LinAlgBackendProvider::new())
    }

    /// Builds a model by executing the actions of a configuration record:
    /// load the data (matrix file or per-sample files), subtract the mean,
    /// then either compute the PCA or load the named PCA artifacts.
    pub fn from_config(config: &SdmConfig) -> Result<Self, ThreadSafeStdError> {
        config.validate()?;
        let mut model = Self::new(config.header.clone());
        model.spill_directory = config.spill_directory.clone();
        let num_samples = config.num_samples();

        if config.load_from_individual_files {
            model.load_from_individual_files(&config.sample_files)?;
        } else if let Some(path) = &config.matrices.data {
            model.load_data_matrix(path, num_samples, config.try_memory)?;
        }
        if !config.sample_names.is_empty() {
            model.set_sample_names(config.sample_names.clone())?;
        }

        if model.has_data() && config.subtract_mean {
            model.subtract_mean()?;
        } else if let Some(path) = &config.matrices.mean {
            model.load_mean(path)?;
        }

        if config.compute_pca {
            model.compute_pca_pipeline()?;
        } else {
            model.load_pca_artifacts(&config.matrices, num_samples, config.try_memory)?;
        }
        info!("Model built from configuration: {}", model.status());
        Ok(model)
    }
}

impl<B: LinAlgBackend<f64>> DeformationModel<B> {
    pub fn with_backend(header: FieldHeader, backend: B) -> Self {
        Self {
            header,
            sample_names: Vec::new(),
            data: MatrixStore::new(),
            eigenmodes: MatrixStore::new(),
            scatter: None,
            eigenvectors: None,
            eigenvalues: None,
            mean: None,
            mean_subtracted: false,
            spill_directory: None,
            eigenmode_memory_limit: None,
            backend,
        }
    }

    // --- Accessors ---

    pub fn header(&self) -> &FieldHeader {
        &self.header
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn field_size(&self) -> usize {
        self.header.field_size()
    }

    /// Number of training samples, taken from whichever artifact is present.
    pub fn num_samples(&self) -> usize {
        if !self.data.is_empty() {
            self.data.cols()
        } else if !self.eigenmodes.is_empty() {
            self.eigenmodes.cols()
        } else if let Some(v) = &self.eigenvectors {
            v.nrows()
        } else if let Some(l) = &self.eigenvalues {
            l.len()
        } else {
            0
        }
    }

    /// Number of eigenwarps available for synthesis.
    pub fn num_modes(&self) -> usize {
        self.eigenmodes.cols()
    }

    pub fn sample_names(&self) -> &[String] {
        &self.sample_names
    }

    pub fn set_sample_names(&mut self, names: Vec<String>) -> Result<(), ThreadSafeStdError> {
        let n = self.num_samples();
        if n != 0 && names.len() != n {
            return Err(format!("Got {} sample names for a model with {} samples.", names.len(), n).into());
        }
        self.sample_names = names;
        Ok(())
    }

    pub fn set_spill_directory<P: Into<PathBuf>>(&mut self, dir: Option<P>) {
        self.spill_directory = dir.map(Into::into);
    }

    pub(crate) fn set_eigenmode_memory_limit(&mut self, bytes: Option<usize>) {
        self.eigenmode_memory_limit = bytes;
    }

    pub fn data_matrix(&self) -> &MatrixStore {
        &self.data
    }

    pub fn eigenmode_matrix(&self) -> &MatrixStore {
        &self.eigenmodes
    }

    pub fn scatter_matrix(&self) -> Option<&Array2<f64>> {
        self.scatter.as_ref()
    }

    pub fn eigenvectors(&self) -> Option<&Array2<f64>> {
        self.eigenvectors.as_ref()
    }

    pub fn eigenvalues(&self) -> Option<&Array1<f64>> {
        self.eigenvalues.as_ref()
    }

    pub fn mean(&self) -> Option<&Array1<f32>> {
        self.mean.as_ref()
    }

    pub fn is_mean_subtracted(&self) -> bool {
        self.mean_subtracted
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    /// Snapshot of which artifacts are valid.
    pub fn status(&self) -> ModelStatus {
        ModelStatus {
            data: !self.data.is_empty(),
            eigenmodes: !self.eigenmodes.is_empty(),
            scatter: self.scatter.is_some(),
            eigenvectors: self.eigenvectors.is_some(),
            eigenvalues: self.eigenvalues.is_some(),
        }
    }

    /// Fraction of the total variance carried by each mode.
    pub fn explained_variance_ratio(&self) -> Option<Array1<f64>> {
        let lambda = self.eigenvalues.as_ref()?;
        let total: f64 = lambda.sum();
        if total <= 0.0 {
            return Some(Array1::zeros(lambda.len()));
        }
        Some(lambda.mapv(|l| l / total))
    }

    // --- Data matrix ---

    fn check_num_samples(&self, num_samples: usize) -> Result<(), ThreadSafeStdError> {
        if num_samples == 0 {
            return Err("A model needs at least one sample.".into());
        }
        if !self.sample_names.is_empty() && self.sample_names.len() != num_samples {
            return Err(format!(
                "Model has {} sample names but {} samples were requested.",
                self.sample_names.len(),
                num_samples
            )
            .into());
        }
        Ok(())
    }

    /// Allocates a zeroed in-memory data matrix for `num_samples` fields.
    pub fn allocate_data(&mut self, num_samples: usize) -> Result<(), ThreadSafeStdError> {
        self.check_num_samples(num_samples)?;
        let mut store = MatrixStore::new();
        store.allocate(self.field_size(), num_samples)?;
        self.data = store;
        self.mean_subtracted = false;
        Ok(())
    }

    /// Loads the data matrix from a raw `field_size x num_samples` file.
    pub fn load_data_matrix<P: AsRef<Path>>(
        &mut self,
        path: P,
        num_samples: usize,
        try_memory: bool,
    ) -> Result<(), ThreadSafeStdError> {
        self.check_num_samples(num_samples)?;
        let mut store = MatrixStore::new();
        store.load(self.field_size(), num_samples, path, try_memory)?;
        self.data = store;
        self.mean_subtracted = false;
        Ok(())
    }

    /// Assembles the data matrix from one raw warp-field file per sample.
    ///
    /// Every file must hold exactly `field_size` floats; a mismatch aborts
    /// before the current data matrix is replaced.
    pub fn load_from_individual_files<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<(), ThreadSafeStdError> {
        self.check_num_samples(paths.len())?;
        let field_size = self.field_size();
        let mut store = MatrixStore::new();
        store.allocate(field_size, paths.len())?;
        let mut field = vec![0.0f32; field_size];
        for (j, path) in paths.iter().enumerate() {
            read_raw_field(path.as_ref(), &mut field)?;
            store.set_col(j, &field)?;
            debug!("Read sample {} from {:?}.", j, path.as_ref());
        }
        info!("Assembled {}x{} data matrix from individual files.", field_size, paths.len());
        self.data = store;
        self.mean_subtracted = false;
        Ok(())
    }

    /// Releases the data matrix. PCA artifacts are kept.
    pub fn clear_data(&mut self) {
        self.data.clear();
        self.mean_subtracted = false;
    }

    /// Copies sample `idx` of the data matrix into `result`.
    pub fn get_warpfield(&self, idx: usize, result: &mut [f32]) -> Result<(), ThreadSafeStdError> {
        self.data.get_col(idx, result)
    }

    /// Overwrites sample `idx` of an in-memory data matrix.
    pub fn set_warpfield(&mut self, idx: usize, field: &[f32]) -> Result<(), ThreadSafeStdError> {
        self.data.set_col(idx, field)
    }

    pub fn save_data<P: AsRef<Path>>(&self, path: P) -> Result<(), ThreadSafeStdError> {
        self.data.save(path)
    }

    // --- Mean ---

    /// Per-coordinate average across samples.
    pub fn compute_mean(&mut self) -> Result<(), ThreadSafeStdError> {
        if self.data.is_empty() {
            return Err("Cannot compute the mean without a data matrix.".into());
        }
        info!("Computing mean of {} samples.", self.data.cols());
        self.mean = Some(self.data.compute_column_mean()?);
        Ok(())
    }

    /// Subtracts the per-coordinate mean of the current data from every
    /// sample in place and stores it as the model mean. Requires an in-memory
    /// data matrix.
    pub fn subtract_mean(&mut self) -> Result<(), ThreadSafeStdError> {
        if self.mean_subtracted {
            warn!("Data matrix is already mean-subtracted; skipping.");
            return Ok(());
        }
        if self.data.is_empty() {
            return Err("Cannot subtract the mean without a data matrix.".into());
        }
        if !self.data.is_in_memory() {
            return Err("Subtracting the mean requires the data matrix in memory.".into());
        }
        let mean = self.data.compute_column_mean()?;
        let offsets = mean.as_slice().ok_or("Mean vector is not contiguous.")?;
        self.data.subtract_row_offsets(offsets)?;
        self.mean = Some(mean);
        self.mean_subtracted = true;
        info!("Subtracted mean from data matrix.");
        Ok(())
    }

    pub fn save_mean<P: AsRef<Path>>(&self, path: P) -> Result<(), ThreadSafeStdError> {
        let mean = self.mean.as_ref().ok_or("No mean to save.")?;
        MatrixStore::from_vec(mean.len(), 1, mean.to_vec())?.save(path)
    }

    pub fn load_mean<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ThreadSafeStdError> {
        let values = read_matrix_f64(path.as_ref(), self.field_size(), 1)?;
        self.mean = Some(values.column(0).mapv(|v| v as f32));
        Ok(())
    }

    // --- PCA pipeline ---

    /// Accumulates `S = X^T X` one data row at a time.
    ///
    /// Memory is `O(num_samples^2)` regardless of the field size. The data
    /// need not be mean-subtracted for this step.
    pub fn compute_scatter_matrix(&mut self) -> Result<(), ThreadSafeStdError> {
        if self.data.is_empty() {
            return Err("Cannot compute the scatter matrix without a data matrix.".into());
        }
        let n = self.data.cols();
        info!("Accumulating {}x{} scatter matrix over {} rows.", n, n, self.data.rows());
        let mut scatter = Array2::<f64>::zeros((n, n));
        let mut row64 = vec![0.0f64; n];
        self.data.for_each_row(|_, row| {
            for (dst, &v) in row64.iter_mut().zip(row) {
                *dst = v as f64;
            }
            for a in 0..n {
                let xa = row64[a];
                if xa == 0.0 {
                    continue;
                }
                let mut upper = scatter.slice_mut(s![a, a..]);
                for (dst, &xb) in upper.iter_mut().zip(&row64[a..]) {
                    *dst += xa * xb;
                }
            }
            Ok(())
        })?;
        for a in 0..n {
            for b in 0..a {
                scatter[[a, b]] = scatter[[b, a]];
            }
        }
        self.scatter = Some(scatter);
        Ok(())
    }

    /// Symmetric eigendecomposition of the scatter matrix.
    ///
    /// Eigenpairs are sorted by descending eigenvalue and round-off negatives
    /// are clamped to zero. The caller is responsible for mean-subtracting the
    /// data beforehand if a covariance-based model is wanted.
    pub fn compute_pca(&mut self) -> Result<(), ThreadSafeStdError> {
        let scatter = self.scatter.as_ref().ok_or("Compute the scatter matrix before the PCA.")?;
        if scatter.iter().any(|v| !v.is_finite()) {
            return Err("Scatter matrix contains non-finite values.".into());
        }
        if !self.mean_subtracted {
            warn!("Computing PCA on data that has not been mean-subtracted.");
        }
        let eig = self.backend.eigh_upper(scatter)?;
        let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
        order.sort_by(|&a, &b| {
            eig.eigenvalues[b]
                .partial_cmp(&eig.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let eigenvalues: Array1<f64> = order.iter().map(|&i| eig.eigenvalues[i].max(0.0)).collect();
        let eigenvectors = eig.eigenvectors.select(Axis(1), &order);
        debug!("Leading eigenvalues: {:?}", eigenvalues.iter().take(5).collect::<Vec<_>>());
        self.eigenvalues = Some(eigenvalues);
        self.eigenvectors = Some(eigenvectors);
        Ok(())
    }

    /// Computes the eigenwarps `U = X V` row by row.
    ///
    /// The result is held in memory when it fits; otherwise it is streamed to
    /// the spill directory (or a temporary file) and served disk-backed.
    pub fn reconstruct_eigenmodes(&mut self) -> Result<(), ThreadSafeStdError> {
        if self.data.is_empty() {
            return Err("Cannot reconstruct eigenmodes without a data matrix.".into());
        }
        let v = self.eigenvectors.as_ref().ok_or("Compute or load eigenvectors before the eigenmodes.")?;
        if v.nrows() != self.data.cols() {
            return Err(format!(
                "Eigenvector matrix has {} rows but the data has {} samples.",
                v.nrows(),
                self.data.cols()
            )
            .into());
        }
        info!("Reconstructing {} eigenwarps of length {}.", v.ncols(), self.data.rows());
        let mut modes = MatrixStore::new();
        let bytes = self
            .data
            .rows()
            .saturating_mul(v.ncols())
            .saturating_mul(std::mem::size_of::<f32>());
        let resident: Result<(), ThreadSafeStdError> = match self.eigenmode_memory_limit {
            Some(limit) if bytes > limit => {
                Err(format!("Eigenwarps need {} bytes, over the {} byte limit.", bytes, limit).into())
            }
            _ => modes.allocate(self.data.rows(), v.ncols()),
        };
        match resident {
            Ok(()) => self.data.multiply(v, &mut modes)?,
            Err(e) => {
                warn!("{} Spilling eigenwarps to disk.", e);
                let target = self.spill_directory.as_ref().map(|d| d.join("eigenmodes.raw"));
                modes = self.data.multiply_to_disk(v, target.as_deref())?;
            }
        }
        self.eigenmodes = modes;
        Ok(())
    }

    /// Scatter, eigendecomposition and eigenwarps in one call.
    pub fn compute_pca_pipeline(&mut self) -> Result<(), ThreadSafeStdError> {
        self.compute_scatter_matrix()?;
        self.compute_pca()?;
        self.reconstruct_eigenmodes()
    }

    // --- Synthesis and reconstruction ---

    fn synthesis_weights(&self, coeffs: &[f64]) -> Result<Vec<f64>, ThreadSafeStdError> {
        if self.eigenmodes.is_empty() {
            return Err("No eigenmodes available for synthesis.".into());
        }
        let n = self.eigenmodes.cols();
        if n < 2 {
            return Err("Synthesis needs a model built from at least 2 samples.".into());
        }
        if coeffs.len() > n {
            return Err(format!("Got {} coefficients for {} modes.", coeffs.len(), n).into());
        }
        let norm = ((n - 1) as f64).sqrt();
        Ok(coeffs.iter().map(|c| c / norm).collect())
    }

    /// `result = sum_i coeffs[i] / sqrt(n - 1) * U[:, i]`, plus the mean if
    /// `consider_mean`. Missing trailing coefficients count as zero.
    pub fn synthesize_field(
        &self,
        coeffs: &[f64],
        result: &mut [f32],
        consider_mean: bool,
    ) -> Result<(), ThreadSafeStdError> {
        let weights = self.synthesis_weights(coeffs)?;
        if result.len() != self.eigenmodes.rows() {
            return Err(format!(
                "Result buffer has length {} but fields have {} values.",
                result.len(),
                self.eigenmodes.rows()
            )
            .into());
        }
        let mean = if consider_mean {
            let mean = self.mean.as_ref().ok_or("Synthesis with mean requested but no mean is available.")?;
            if mean.len() != result.len() {
                return Err(format!("Mean has length {} but fields have {} values.", mean.len(), result.len()).into());
            }
            Some(mean)
        } else {
            None
        };
        self.eigenmodes.for_each_row(|i, row| {
            let mut acc: f64 = weights.iter().zip(row).map(|(w, &u)| w * u as f64).sum();
            if let Some(m) = mean {
                acc += m[i] as f64;
            }
            result[i] = acc as f32;
            Ok(())
        })
    }

    /// Reconstructs training sample `idx` from its leading `num_modes` modes,
    /// using coefficients `sqrt(num_modes - 1) * V[idx, 0..num_modes]`.
    ///
    /// With `num_modes == num_samples` this reproduces `X[:, idx]`. At least
    /// two modes are required, since a single mode has a zero coefficient.
    pub fn reconstruct_field(&self, idx: usize, num_modes: usize, result: &mut [f32]) -> Result<(), ThreadSafeStdError> {
        let v = self.eigenvectors.as_ref().ok_or("No eigenvectors available for reconstruction.")?;
        if idx >= v.nrows() {
            return Err(format!("Sample index {} out of bounds for {} samples.", idx, v.nrows()).into());
        }
        if num_modes < 2 || num_modes > v.ncols() {
            return Err(format!("Number of modes must be in 2..={}, got {}.", v.ncols(), num_modes).into());
        }
        let scale = ((num_modes - 1) as f64).sqrt();
        let coeffs: Vec<f64> = v.slice(s![idx, ..num_modes]).iter().map(|&x| scale * x).collect();
        self.synthesize_field(&coeffs, result, false)
    }

    /// Coefficients that synthesize the projection of `field` onto the model span.
    ///
    /// Inverse of [`synthesize_field`](Self::synthesize_field) for fields in
    /// the span. Modes with negligible energy get a zero coefficient.
    pub fn project_field(&self, field: &[f32], consider_mean: bool) -> Result<Array1<f64>, ThreadSafeStdError> {
        if self.eigenmodes.is_empty() {
            return Err("No eigenmodes available for projection.".into());
        }
        let (rows, k) = self.eigenmodes.shape();
        if field.len() != rows {
            return Err(format!("Field has length {} but the model expects {}.", field.len(), rows).into());
        }
        if k < 2 {
            return Err("Projection needs a model built from at least 2 samples.".into());
        }
        let mean = if consider_mean {
            Some(self.mean.as_ref().ok_or("Projection with mean requested but no mean is available.")?)
        } else {
            None
        };
        let mut dots = Array1::<f64>::zeros(k);
        let mut energies = Array1::<f64>::zeros(k);
        self.eigenmodes.for_each_row(|i, row| {
            let f = field[i] as f64 - mean.map_or(0.0, |m| m[i] as f64);
            for ((d, e), &u) in dots.iter_mut().zip(energies.iter_mut()).zip(row) {
                let u = u as f64;
                *d += u * f;
                *e += u * u;
            }
            Ok(())
        })?;
        let floor = energies.iter().cloned().fold(0.0, f64::max) * RELATIVE_EIGENVALUE_FLOOR;
        let norm = ((k - 1) as f64).sqrt();
        Ok(Array1::from_iter(
            dots.iter()
                .zip(energies.iter())
                .map(|(&d, &e)| if e > floor && e > 0.0 { norm * d / e } else { 0.0 }),
        ))
    }

    /// Draws standard-normal coefficients for the leading `num_modes` modes
    /// and synthesizes the corresponding field.
    pub fn sample_random_field(
        &self,
        seed: u64,
        num_modes: usize,
        consider_mean: bool,
        result: &mut [f32],
    ) -> Result<Array1<f64>, ThreadSafeStdError> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).map_err(|e| format!("Failed to create normal distribution: {}", e))?;
        let coeffs: Array1<f64> = (0..num_modes).map(|_| rng.sample(normal)).collect();
        let slice = coeffs.as_slice().ok_or("Coefficient vector is not contiguous.")?;
        self.synthesize_field(slice, result, consider_mean)?;
        Ok(coeffs)
    }

    // --- Eigenwarp access ---

    /// Copies eigenwarp `i` (column `i` of `U`) into `result`.
    pub fn get_eigenmode(&self, i: usize, result: &mut [f32]) -> Result<(), ThreadSafeStdError> {
        self.eigenmodes.get_col(i, result)
    }

    /// Gathers an arbitrary set of eigenwarp-matrix rows, cheap in both storage modes.
    pub fn get_eigenmode_rows(&self, rows: &[usize]) -> Result<Array2<f32>, ThreadSafeStdError> {
        if self.eigenmodes.is_empty() {
            return Err("No eigenmodes available.".into());
        }
        self.eigenmodes.get_rows(rows)
    }

    /// 3x3 sample covariance of the displacement at normalized point `p`.
    pub fn sample_covariance_at(&self, p: [f64; 3]) -> Result<Array2<f64>, ThreadSafeStdError> {
        if self.data.is_empty() {
            return Err("Sample covariance needs the data matrix.".into());
        }
        let n = self.data.cols();
        if n < 2 {
            return Err("Sample covariance needs at least 2 samples.".into());
        }
        let rows = self.data.get_rows(&self.header.row_indices(p))?.mapv(|v| v as f64);
        let mut centered = rows;
        for mut channel in centered.axis_iter_mut(Axis(0)) {
            let m = channel.sum() / n as f64;
            channel.mapv_inplace(|v| v - m);
        }
        Ok(centered.dot(&centered.t()) / (n - 1) as f64)
    }

    // --- Persistence ---

    pub fn save_eigenmodes<P: AsRef<Path>>(&self, path: P) -> Result<(), ThreadSafeStdError> {
        self.eigenmodes.save(path)
    }

    pub fn load_eigenmodes<P: AsRef<Path>>(
        &mut self,
        path: P,
        num_samples: usize,
        try_memory: bool,
    ) -> Result<(), ThreadSafeStdError> {
        let mut store = MatrixStore::new();
        store.load(self.field_size(), num_samples, path, try_memory)?;
        self.eigenmodes = store;
        Ok(())
    }

    pub fn save_scatter<P: AsRef<Path>>(&self, path: P) -> Result<(), ThreadSafeStdError> {
        write_matrix_f64(self.scatter.as_ref().ok_or("No scatter matrix to save.")?, path.as_ref())
    }

    pub fn load_scatter<P: AsRef<Path>>(&mut self, path: P, num_samples: usize) -> Result<(), ThreadSafeStdError> {
        self.scatter = Some(read_matrix_f64(path.as_ref(), num_samples, num_samples)?);
        Ok(())
    }

    pub fn save_eigenvectors<P: AsRef<Path>>(&self, path: P) -> Result<(), ThreadSafeStdError> {
        write_matrix_f64(self.eigenvectors.as_ref().ok_or("No eigenvectors to save.")?, path.as_ref())
    }

    pub fn load_eigenvectors<P: AsRef<Path>>(&mut self, path: P, num_samples: usize) -> Result<(), ThreadSafeStdError> {
        self.eigenvectors = Some(read_matrix_f64(path.as_ref(), num_samples, num_samples)?);
        Ok(())
    }

    pub fn save_eigenvalues<P: AsRef<Path>>(&self, path: P) -> Result<(), ThreadSafeStdError> {
        let lambda = self.eigenvalues.as_ref().ok_or("No eigenvalues to save.")?;
        let column = lambda.view().insert_axis(Axis(1)).to_owned();
        write_matrix_f64(&column, path.as_ref())
    }

    pub fn load_eigenvalues<P: AsRef<Path>>(&mut self, path: P, num_samples: usize) -> Result<(), ThreadSafeStdError> {
        let column = read_matrix_f64(path.as_ref(), num_samples, 1)?;
        self.eigenvalues = Some(column.column(0).to_owned());
        Ok(())
    }

    /// Loads whichever PCA artifacts `files` names.
    pub fn load_pca_artifacts(
        &mut self,
        files: &MatrixFiles,
        num_samples: usize,
        try_memory: bool,
    ) -> Result<(), ThreadSafeStdError> {
        if let Some(path) = &files.eigenmodes {
            self.load_eigenmodes(path, num_samples, try_memory)?;
        }
        if let Some(path) = &files.scatter {
            self.load_scatter(path, num_samples)?;
        }
        if let Some(path) = &files.eigenvectors {
            self.load_eigenvectors(path, num_samples)?;
        }
        if let Some(path) = &files.eigenvalues {
            self.load_eigenvalues(path, num_samples)?;
        }
        Ok(())
    }

    /// Saves every present artifact that `files` names.
    pub fn save_artifacts(&self, files: &MatrixFiles) -> Result<(), ThreadSafeStdError> {
        let status = self.status();
        if let (Some(path), true) = (&files.data, status.data) {
            self.save_data(path)?;
        }
        if let (Some(path), true) = (&files.eigenmodes, status.eigenmodes) {
            self.save_eigenmodes(path)?;
        }
        if let (Some(path), true) = (&files.scatter, status.scatter) {
            self.save_scatter(path)?;
        }
        if let (Some(path), true) = (&files.eigenvectors, status.eigenvectors) {
            self.save_eigenvectors(path)?;
        }
        if let (Some(path), true) = (&files.eigenvalues, status.eigenvalues) {
            self.save_eigenvalues(path)?;
        }
        if let (Some(path), true) = (&files.mean, self.mean.is_some()) {
            self.save_mean(path)?;
        }
        Ok(())
    }

    /// Persists header, sample names, mean, scatter and eigenpairs in one file.
    pub fn save_pca_bundle<P: AsRef<Path>>(&self, path: P) -> Result<(), ThreadSafeStdError> {
        let path = path.as_ref();
        let bundle = PcaBundle {
            header: self.header.clone(),
            sample_names: self.sample_names.clone(),
            mean: self.mean.clone(),
            scatter: self.scatter.clone(),
            eigenvectors: self.eigenvectors.clone(),
            eigenvalues: self.eigenvalues.clone(),
        };
        let file = File::create(path).map_err(|e| format!("Failed to create file at {:?}: {}", path, e))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(&bundle, &mut writer, bincode::config::standard())
            .map_err(|e| format!("Failed to serialize PCA bundle: {}", e))?;
        Ok(())
    }

    /// Restores the artifacts written by [`save_pca_bundle`](Self::save_pca_bundle).
    ///
    /// The bundle must describe the same grid as this model. Nothing is
    /// replaced unless every dimension check passes.
    pub fn load_pca_bundle<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ThreadSafeStdError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| format!("Failed to open file at {:?}: {}", path, e))?;
        let mut reader = BufReader::new(file);
        let bundle: PcaBundle = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| format!("Failed to deserialize PCA bundle: {}", e))?;

        if bundle.header != self.header {
            return Err(format!(
                "PCA bundle grid {:?} does not match the model grid {:?}.",
                bundle.header.resolution, self.header.resolution
            )
            .into());
        }
        let n = bundle
            .eigenvalues
            .as_ref()
            .map(|l| l.len())
            .or_else(|| bundle.scatter.as_ref().map(|s| s.nrows()))
            .unwrap_or(0);
        if let Some(s) = &bundle.scatter {
            if s.dim() != (n, n) {
                return Err(format!("PCA bundle scatter matrix is {:?}, expected ({}, {}).", s.dim(), n, n).into());
            }
        }
        if let Some(v) = &bundle.eigenvectors {
            if v.nrows() != n || v.ncols() > n {
                return Err(format!("PCA bundle eigenvectors are {:?} for {} eigenvalues.", v.dim(), n).into());
            }
        }
        if let Some(m) = &bundle.mean {
            if m.len() != self.field_size() {
                return Err(format!("PCA bundle mean has length {}, expected {}.", m.len(), self.field_size()).into());
            }
        }
        if let Some(l) = &bundle.eigenvalues {
            if l.iter().any(|&v| !v.is_finite() || v < 0.0) {
                return Err("PCA bundle eigenvalues contain invalid (non-finite or negative) values.".into());
            }
        }

        self.sample_names = bundle.sample_names;
        self.mean = bundle.mean;
        self.scatter = bundle.scatter;
        self.eigenvectors = bundle.eigenvectors;
        self.eigenvalues = bundle.eigenvalues;
        Ok(())
    }
}

/// Reads one raw warp field of exactly `field.len()` floats.
fn read_raw_field(path: &Path, field: &mut [f32]) -> Result<(), ThreadSafeStdError> {
    let mut file = File::open(path).map_err(|e| format!("Failed to open warp field {:?}: {}", path, e))?;
    let expected = (field.len() * std::mem::size_of::<f32>()) as u64;
    let actual = file.metadata()?.len();
    if actual != expected {
        return Err(format!(
            "Warp field {:?} has {} bytes but {} floats ({} bytes) were expected.",
            path,
            actual,
            field.len(),
            expected
        )
        .into());
    }
    file.read_exact(bytemuck::cast_slice_mut(field))
        .map_err(|e| format!("Failed to read warp field {:?}: {}", path, e))?;
    Ok(())
}

fn write_matrix_f64(matrix: &Array2<f64>, path: &Path) -> Result<(), ThreadSafeStdError> {
    let (rows, cols) = matrix.dim();
    let values: Vec<f32> = matrix.iter().map(|&v| v as f32).collect();
    MatrixStore::from_vec(rows, cols, values)?.save(path)
}

fn read_matrix_f64(path: &Path, rows: usize, cols: usize) -> Result<Array2<f64>, ThreadSafeStdError> {
    let mut store = MatrixStore::new();
    store.load(rows, cols, path, true)?;
    let indices: Vec<usize> = (0..rows).collect();
    Ok(store.get_rows(&indices)?.mapv(|v| v as f64))
}

