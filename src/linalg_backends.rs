// src/linalg_backends.rs

use ndarray::{s, Array1, Array2, Axis};
use std::error::Error;
use std::marker::PhantomData;

/// Compile-time selected linear algebra backend.
///
/// The statistical model and the local solver never call a decomposition
/// directly; they go through this provider so the numeric ecosystem can be
/// swapped with a feature flag.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

// --- Capability traits ---

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput<F: 'static> {
    /// Eigenvalues in the backend's native order (ascending for LAPACK and faer).
    pub eigenvalues: Array1<F>,
    /// Eigenvectors as columns of the matrix.
    /// eigenvector_matrix.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<F>,
}

/// Symmetric eigendecomposition (similar to LAPACK's DSYEVD).
/// Implementers expect `matrix` to be symmetric and only read the upper triangle.
pub trait BackendEigh<F: 'static + Copy + Send + Sync> {
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, Box<dyn Error + Send + Sync>>;
}

/// Dense square solve `A X = B` for one or more right-hand sides (columns of `rhs`).
pub trait BackendSolve<F: 'static + Copy + Send + Sync> {
    fn solve_multi(&self, matrix: &Array2<F>, rhs: &Array2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>>;
}

/// Moore-Penrose pseudo-inverse. Singular values below `rcond * s_max` are treated as zero.
pub trait BackendPinv<F: 'static + Copy + Send + Sync> {
    fn pinv(&self, matrix: &Array2<F>, rcond: F) -> Result<Array2<F>, Box<dyn Error + Send + Sync>>;
}

/// Everything the deformation model and local solver need from a backend.
pub trait LinAlgBackend<F: 'static + Copy + Send + Sync>:
    BackendEigh<F> + BackendSolve<F> + BackendPinv<F>
{
}

impl<F, T> LinAlgBackend<F> for T
where
    F: 'static + Copy + Send + Sync,
    T: BackendEigh<F> + BackendSolve<F> + BackendPinv<F>,
{
}

fn backend_error(msg: String) -> Box<dyn Error + Send + Sync> {
    Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg))
}

fn check_square<F>(matrix: &Array2<F>, what: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
    if matrix.nrows() != matrix.ncols() {
        return Err(backend_error(format!(
            "{} requires a square matrix, got {}x{}",
            what,
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    Ok(())
}

/// Assembles `V * diag(1/s) * U^T` from a thin or full SVD, dropping
/// singular values at or below the cutoff.
macro_rules! pinv_from_svd {
    ($t:ty, $u:expr, $s:expr, $vt:expr, $rcond:expr) => {{
        let u: Array2<$t> = $u;
        let s: Array1<$t> = $s;
        let vt: Array2<$t> = $vt;
        let rank_dim = s.len();
        let s_max = s.iter().cloned().fold(0.0 as $t, <$t>::max);
        let cutoff = $rcond * s_max;
        let u_r = u.slice(s![.., ..rank_dim]);
        let vt_r = vt.slice(s![..rank_dim, ..]);
        let mut v_scaled = vt_r.t().to_owned();
        for (mut column, &sigma) in v_scaled.axis_iter_mut(Axis(1)).zip(s.iter()) {
            if sigma > cutoff && sigma > 0.0 {
                column.mapv_inplace(|x| x / sigma);
            } else {
                column.fill(0.0);
            }
        }
        v_scaled.dot(&u_r.t())
    }};
}

// --- NdarrayLinAlgBackend (ndarray-linalg / LAPACK) ---
use ndarray_linalg::{Eigh as NdLinalgEigh, Factorize as NdLinalgFactorize, Solve as NdLinalgSolve, SVD as NdLinalgSVD, UPLO};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
    Box::new(e)
}

macro_rules! impl_ndarray_backend {
    ($t:ty) => {
        impl BackendEigh<$t> for NdarrayLinAlgBackend {
            fn eigh_upper(&self, matrix: &Array2<$t>) -> Result<EighOutput<$t>, Box<dyn Error + Send + Sync>> {
                check_square(matrix, "Eigendecomposition")?;
                if matrix.is_empty() {
                    return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
                }
                let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
                Ok(EighOutput { eigenvalues, eigenvectors })
            }
        }

        impl BackendSolve<$t> for NdarrayLinAlgBackend {
            fn solve_multi(&self, matrix: &Array2<$t>, rhs: &Array2<$t>) -> Result<Array2<$t>, Box<dyn Error + Send + Sync>> {
                check_square(matrix, "Linear solve")?;
                if rhs.nrows() != matrix.nrows() {
                    return Err(backend_error(format!(
                        "Right-hand side has {} rows but the system is {}x{}",
                        rhs.nrows(),
                        matrix.nrows(),
                        matrix.ncols()
                    )));
                }
                let mut solution = Array2::<$t>::zeros(rhs.dim());
                if matrix.is_empty() {
                    return Ok(solution);
                }
                let lu = matrix.factorize().map_err(to_dyn_error)?;
                for (j, rhs_column) in rhs.axis_iter(Axis(1)).enumerate() {
                    let x = lu.solve(&rhs_column.to_owned()).map_err(to_dyn_error)?;
                    solution.column_mut(j).assign(&x);
                }
                Ok(solution)
            }
        }

        impl BackendPinv<$t> for NdarrayLinAlgBackend {
            fn pinv(&self, matrix: &Array2<$t>, rcond: $t) -> Result<Array2<$t>, Box<dyn Error + Send + Sync>> {
                let (nrows, ncols) = matrix.dim();
                if matrix.is_empty() {
                    return Ok(Array2::zeros((ncols, nrows)));
                }
                let (u, s, vt) = matrix.svd(true, true).map_err(to_dyn_error)?;
                let u = u.ok_or_else(|| backend_error("SVD did not return U".to_string()))?;
                let vt = vt.ok_or_else(|| backend_error("SVD did not return V^T".to_string()))?;
                Ok(pinv_from_svd!($t, u, s, vt, rcond))
            }
        }
    };
}

impl_ndarray_backend!(f64);
impl_ndarray_backend!(f32);

// --- FaerLinAlgBackend ---
#[cfg(feature = "backend_faer")]
mod faer_specific_code {
    use super::{backend_error, check_square, BackendEigh, BackendPinv, BackendSolve, EighOutput};
    use bytemuck::Pod;
    use faer::linalg::solvers::Svd as FaerSolverSvd;
    use faer::traits::num_traits::Zero;
    use faer::traits::ComplexField;
    use faer::MatRef;
    use ndarray::{s, Array1, Array2, Axis, ShapeBuilder};
    use std::error::Error;

    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    fn faer_mat_to_ndarray<F: ComplexField + Copy + Pod + Zero>(faer_mat: MatRef<'_, F>) -> Array2<F> {
        let nrows = faer_mat.nrows();
        let ncols = faer_mat.ncols();
        let mut data_vec = Vec::with_capacity(nrows * ncols);
        for j in 0..ncols {
            for i in 0..nrows {
                data_vec.push(unsafe { *faer_mat.get_unchecked(i, j) });
            }
        }
        Array2::from_shape_vec((nrows, ncols).f(), data_vec).unwrap_or_else(|_| Array2::zeros((nrows, ncols)))
    }

    fn faer_col_to_ndarray_vec<F: ComplexField + Copy + Pod + Zero>(faer_col: faer::ColRef<'_, F>) -> Array1<F> {
        (0..faer_col.nrows()).map(|i| unsafe { *faer_col.get_unchecked(i) }).collect()
    }

    /// Borrows a contiguous ndarray matrix as a faer view without copying.
    fn ndarray_as_faer<F: ComplexField + Copy>(matrix: &Array2<F>) -> Result<MatRef<'_, F>, Box<dyn Error + Send + Sync>> {
        let (nrows, ncols) = matrix.dim();
        let slice = matrix.as_slice_memory_order().ok_or_else(|| {
            backend_error(format!(
                "Input matrix ({}x{}) is non-contiguous and cannot be viewed by faer",
                nrows, ncols
            ))
        })?;
        if matrix.is_standard_layout() {
            Ok(MatRef::from_row_major_slice(slice, nrows, ncols))
        } else {
            Ok(MatRef::from_column_major_slice(slice, nrows, ncols))
        }
    }

    macro_rules! impl_faer_backend {
        ($t:ty) => {
            impl BackendEigh<$t> for FaerLinAlgBackend {
                fn eigh_upper(&self, matrix: &Array2<$t>) -> Result<EighOutput<$t>, Box<dyn Error + Send + Sync>> {
                    check_square(matrix, "Eigendecomposition")?;
                    if matrix.is_empty() {
                        return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
                    }
                    let view = ndarray_as_faer(matrix)?;
                    let eig = view.as_ref().selfadjoint_eigendecomposition(faer::Side::Upper);
                    Ok(EighOutput {
                        eigenvalues: faer_col_to_ndarray_vec(eig.s().as_ref()),
                        eigenvectors: faer_mat_to_ndarray(eig.u().as_ref()),
                    })
                }
            }

            impl BackendPinv<$t> for FaerLinAlgBackend {
                fn pinv(&self, matrix: &Array2<$t>, rcond: $t) -> Result<Array2<$t>, Box<dyn Error + Send + Sync>> {
                    let (nrows, ncols) = matrix.dim();
                    if matrix.is_empty() {
                        return Ok(Array2::zeros((ncols, nrows)));
                    }
                    let view = ndarray_as_faer(matrix)?;
                    let svd = FaerSolverSvd::new_thin(view)
                        .map_err(|e| backend_error(format!("Faer SVD computation failed: {:?}", e)))?;
                    let s_vals = faer_col_to_ndarray_vec(svd.S().diagonal().as_ref());
                    let u = faer_mat_to_ndarray(svd.U().as_ref());
                    let vt = faer_mat_to_ndarray(svd.V().as_ref()).t().to_owned();
                    Ok(pinv_from_svd!($t, u, s_vals, vt, rcond))
                }
            }

            impl BackendSolve<$t> for FaerLinAlgBackend {
                // faer's thin SVD is the one decomposition shared with the pinv path,
                // so square solves go through the pseudo-inverse.
                fn solve_multi(&self, matrix: &Array2<$t>, rhs: &Array2<$t>) -> Result<Array2<$t>, Box<dyn Error + Send + Sync>> {
                    check_square(matrix, "Linear solve")?;
                    if rhs.nrows() != matrix.nrows() {
                        return Err(backend_error(format!(
                            "Right-hand side has {} rows but the system is {}x{}",
                            rhs.nrows(),
                            matrix.nrows(),
                            matrix.ncols()
                        )));
                    }
                    let inverse = self.pinv(matrix, <$t>::EPSILON)?;
                    Ok(inverse.dot(rhs))
                }
            }
        };
    }

    impl_faer_backend!(f64);
    impl_faer_backend!(f32);
}

#[cfg(feature = "backend_faer")]
pub use faer_specific_code::FaerLinAlgBackend;

// --- LinAlgBackendProvider dispatch ---

#[cfg(feature = "backend_faer")]
impl<F> BackendEigh<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendEigh<F>,
    faer_specific_code::FaerLinAlgBackend: BackendEigh<F>,
{
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, Box<dyn Error + Send + Sync>> {
        faer_specific_code::FaerLinAlgBackend.eigh_upper(matrix)
    }
}

#[cfg(not(feature = "backend_faer"))]
impl<F> BackendEigh<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendEigh<F>,
{
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, Box<dyn Error + Send + Sync>> {
        NdarrayLinAlgBackend.eigh_upper(matrix)
    }
}

#[cfg(feature = "backend_faer")]
impl<F> BackendSolve<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendSolve<F>,
    faer_specific_code::FaerLinAlgBackend: BackendSolve<F>,
{
    fn solve_multi(&self, matrix: &Array2<F>, rhs: &Array2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>> {
        faer_specific_code::FaerLinAlgBackend.solve_multi(matrix, rhs)
    }
}

#[cfg(not(feature = "backend_faer"))]
impl<F> BackendSolve<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendSolve<F>,
{
    fn solve_multi(&self, matrix: &Array2<F>, rhs: &Array2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>> {
        NdarrayLinAlgBackend.solve_multi(matrix, rhs)
    }
}

#[cfg(feature = "backend_faer")]
impl<F> BackendPinv<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendPinv<F>,
    faer_specific_code::FaerLinAlgBackend: BackendPinv<F>,
{
    fn pinv(&self, matrix: &Array2<F>, rcond: F) -> Result<Array2<F>, Box<dyn Error + Send + Sync>> {
        faer_specific_code::FaerLinAlgBackend.pinv(matrix, rcond)
    }
}

#[cfg(not(feature = "backend_faer"))]
impl<F> BackendPinv<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendPinv<F>,
{
    fn pinv(&self, matrix: &Array2<F>, rcond: F) -> Result<Array2<F>, Box<dyn Error + Send + Sync>> {
        NdarrayLinAlgBackend.pinv(matrix, rcond)
    }
}
