use crate::header::FieldHeader;
use crate::model::DeformationModel;
use approx::assert_abs_diff_eq;
use ndarray::{array, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Builds an in-memory model whose data matrix is `x` (`field_size x n`).
fn model_from_columns(resolution: [usize; 3], x: &Array2<f32>) -> DeformationModel {
    let mut model = DeformationModel::new(FieldHeader::with_resolution(resolution));
    assert_eq!(model.field_size(), x.nrows(), "test matrix does not fit the grid");
    model.allocate_data(x.ncols()).unwrap();
    for (j, column) in x.columns().into_iter().enumerate() {
        model.set_warpfield(j, &column.to_vec()).unwrap();
    }
    model
}

fn random_columns(field_size: usize, n: usize, seed: u64) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0f32, 1.0).unwrap();
    Array2::from_shape_fn((field_size, n), |_| normal.sample(&mut rng))
}

fn small_example() -> Array2<f32> {
    array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]
}

#[cfg(test)]
mod scatter_and_pca {
    use super::*;

    #[test]
    fn streamed_scatter_matches_hand_computed() {
        let mut model = model_from_columns([1, 1, 1], &small_example());
        model.compute_scatter_matrix().unwrap();
        let s = model.scatter_matrix().unwrap();
        assert_eq!(s, &array![[35.0, 44.0], [44.0, 56.0]]);
    }

    #[test]
    fn streamed_scatter_matches_naive_product() {
        let x = random_columns(3 * 2 * 3 * 2, 5, 11);
        let mut model = model_from_columns([2, 3, 2], &x);
        model.compute_scatter_matrix().unwrap();
        let x64 = x.mapv(|v| v as f64);
        let naive = x64.t().dot(&x64);
        let s = model.scatter_matrix().unwrap();
        for (a, b) in s.iter().zip(naive.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
        }
        assert_eq!(s, &s.t().to_owned());
    }

    #[test]
    fn pca_reproduces_hand_computed_eigenpairs() {
        let mut model = model_from_columns([1, 1, 1], &small_example());
        model.compute_scatter_matrix().unwrap();
        model.compute_pca().unwrap();

        let disc = (91.0f64 * 91.0 - 4.0 * 24.0).sqrt();
        let lambda = model.eigenvalues().unwrap();
        assert_abs_diff_eq!(lambda[0], (91.0 + disc) / 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(lambda[1], (91.0 - disc) / 2.0, epsilon = 1e-9);

        let s = array![[35.0, 44.0], [44.0, 56.0]];
        let v = model.eigenvectors().unwrap();
        for i in 0..2 {
            let col = v.column(i);
            let sv = s.dot(&col);
            for k in 0..2 {
                assert_abs_diff_eq!(sv[k], lambda[i] * col[k], epsilon = 1e-9);
            }
            assert_abs_diff_eq!(col.dot(&col), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn pca_without_scatter_fails() {
        let mut model = model_from_columns([1, 1, 1], &small_example());
        assert!(model.compute_pca().is_err());
        assert!(!model.status().eigenvalues);
    }

    #[test]
    fn eigenwarp_energy_equals_eigenvalue() {
        let x = random_columns(3 * 8, 4, 5);
        let mut model = model_from_columns([2, 2, 2], &x);
        model.subtract_mean().unwrap();
        model.compute_pca_pipeline().unwrap();
        let norms = model.eigenmode_matrix().compute_column_norm().unwrap();
        let lambda = model.eigenvalues().unwrap();
        for i in 0..4 {
            assert_abs_diff_eq!(norms[i] * norms[i], lambda[i], epsilon = 1e-3 * lambda[0]);
        }
        let ratio = model.explained_variance_ratio().unwrap();
        assert_abs_diff_eq!(ratio.sum(), 1.0, epsilon = 1e-12);
        assert!(ratio[0] >= ratio[1] && ratio[1] >= ratio[2]);
    }
}

#[cfg(test)]
mod mean {
    use super::*;

    #[test]
    fn subtract_mean_leaves_zero_mean() {
        let x = random_columns(3 * 4, 6, 3);
        let mut model = model_from_columns([2, 2, 1], &x);
        model.subtract_mean().unwrap();
        assert!(model.is_mean_subtracted());
        let residual = model.data_matrix().compute_column_mean().unwrap();
        for v in residual.iter() {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-5);
        }
        let mean = model.mean().unwrap();
        let expected = x.mean_axis(ndarray::Axis(1)).unwrap();
        for (a, b) in mean.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn subtract_mean_uses_the_current_data() {
        let mut model = model_from_columns([1, 1, 1], &small_example());
        model.subtract_mean().unwrap();

        let replacement = array![[10.0f32, 30.0], [10.0, 30.0], [10.0, 30.0]];
        model.allocate_data(2).unwrap();
        for (j, column) in replacement.columns().into_iter().enumerate() {
            model.set_warpfield(j, &column.to_vec()).unwrap();
        }
        assert!(!model.is_mean_subtracted());
        model.subtract_mean().unwrap();

        let residual = model.data_matrix().compute_column_mean().unwrap();
        for v in residual.iter() {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-6);
        }
        assert_eq!(model.mean().unwrap().to_vec(), vec![20.0, 20.0, 20.0]);
        let mut field = [0.0f32; 3];
        model.get_warpfield(1, &mut field).unwrap();
        assert_eq!(field, [10.0, 10.0, 10.0]);
    }

    #[test]
    fn subtracting_twice_is_a_no_op() {
        let mut model = model_from_columns([1, 1, 1], &small_example());
        model.subtract_mean().unwrap();
        model.subtract_mean().unwrap();
        let mut field = [0.0f32; 3];
        model.get_warpfield(0, &mut field).unwrap();
        assert_eq!(field, [-0.5, -0.5, -0.5]);
    }
}

#[cfg(test)]
mod synthesis {
    use super::*;

    #[test]
    fn unit_coefficient_reproduces_first_eigenwarp() {
        let mut model = model_from_columns([1, 1, 1], &small_example());
        model.compute_pca_pipeline().unwrap();
        let mut synthesized = [0.0f32; 3];
        model.synthesize_field(&[1.0, 0.0], &mut synthesized, false).unwrap();
        let mut mode = [0.0f32; 3];
        model.get_eigenmode(0, &mut mode).unwrap();
        for k in 0..3 {
            assert_abs_diff_eq!(synthesized[k], mode[k], epsilon = 1e-6);
        }
    }

    #[test]
    fn truncated_coefficients_treat_missing_modes_as_zero() {
        let x = random_columns(3 * 4, 4, 8);
        let mut model = model_from_columns([4, 1, 1], &x);
        model.compute_pca_pipeline().unwrap();
        let mut short = vec![0.0f32; 12];
        let mut padded = vec![0.0f32; 12];
        model.synthesize_field(&[0.3, -1.2], &mut short, false).unwrap();
        model.synthesize_field(&[0.3, -1.2, 0.0, 0.0], &mut padded, false).unwrap();
        assert_eq!(short, padded);
        assert!(model.synthesize_field(&[0.0; 5], &mut short, false).is_err());
    }

    #[test]
    fn full_reconstruction_round_trips_every_sample() {
        let x = random_columns(3 * 6, 5, 21);
        let mut model = model_from_columns([3, 2, 1], &x);
        model.subtract_mean().unwrap();
        model.compute_pca_pipeline().unwrap();
        let n = model.num_samples();
        let mut original = vec![0.0f32; 18];
        let mut rebuilt = vec![0.0f32; 18];
        for idx in 0..n {
            model.get_warpfield(idx, &mut original).unwrap();
            model.reconstruct_field(idx, n, &mut rebuilt).unwrap();
            for (a, b) in rebuilt.iter().zip(original.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn reconstruction_needs_two_modes() {
        let x = random_columns(3 * 2, 3, 13);
        let mut model = model_from_columns([2, 1, 1], &x);
        model.compute_pca_pipeline().unwrap();
        let mut field = vec![0.0f32; 6];
        assert!(model.reconstruct_field(0, 1, &mut field).is_err());
        assert!(model.reconstruct_field(0, 0, &mut field).is_err());
        assert!(model.reconstruct_field(0, 4, &mut field).is_err());
        assert!(model.reconstruct_field(0, 2, &mut field).is_ok());
    }

    #[test]
    fn reconstruction_with_mean_adds_it_back() {
        let x = random_columns(3 * 2, 3, 2);
        let mut model = model_from_columns([2, 1, 1], &x);
        model.subtract_mean().unwrap();
        model.compute_pca_pipeline().unwrap();
        let v = model.eigenvectors().unwrap().clone();
        let coeffs: Vec<f64> = v.row(1).iter().map(|&c| c * 2f64.sqrt()).collect();
        let mut field = vec![0.0f32; 6];
        model.synthesize_field(&coeffs, &mut field, true).unwrap();
        for (k, value) in field.iter().enumerate() {
            assert_abs_diff_eq!(*value, x[[k, 1]], epsilon = 1e-4);
        }
    }

    #[test]
    fn projection_inverts_synthesis_on_the_span() {
        let x = random_columns(3 * 9, 4, 17);
        let mut model = model_from_columns([3, 3, 1], &x);
        model.compute_pca_pipeline().unwrap();
        let coeffs = [0.7, -0.4, 1.5, 0.2];
        let mut field = vec![0.0f32; 27];
        model.synthesize_field(&coeffs, &mut field, false).unwrap();
        let projected = model.project_field(&field, false).unwrap();
        for (a, b) in projected.iter().zip(coeffs.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
        }
    }

    #[test]
    fn random_fields_are_reproducible_per_seed() {
        let x = random_columns(3 * 2, 3, 4);
        let mut model = model_from_columns([2, 1, 1], &x);
        model.subtract_mean().unwrap();
        model.compute_pca_pipeline().unwrap();
        let mut a = vec![0.0f32; 6];
        let mut b = vec![0.0f32; 6];
        let ca = model.sample_random_field(99, 2, true, &mut a).unwrap();
        let cb = model.sample_random_field(99, 2, true, &mut b).unwrap();
        assert_eq!(ca, cb);
        assert_eq!(a, b);
        let cc = model.sample_random_field(100, 2, true, &mut b).unwrap();
        assert_ne!(ca, cc);
    }

    #[test]
    fn synthesis_needs_two_samples() {
        let x = array![[1.0f32], [2.0], [3.0]];
        let mut model = model_from_columns([1, 1, 1], &x);
        model.compute_pca_pipeline().unwrap();
        let mut field = [0.0f32; 3];
        assert!(model.synthesize_field(&[1.0], &mut field, false).is_err());
    }
}

#[cfg(test)]
mod storage {
    use super::*;
    use crate::matrix_store::StorageMode;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn disk_backed_pipeline_matches_memory() {
        let x = random_columns(3 * 8, 4, 31);
        let mut memory = model_from_columns([2, 2, 2], &x);
        memory.compute_pca_pipeline().unwrap();

        let file = NamedTempFile::new().unwrap();
        memory.save_data(file.path()).unwrap();
        let mut disk = DeformationModel::new(FieldHeader::with_resolution([2, 2, 2]));
        disk.load_data_matrix(file.path(), 4, false).unwrap();
        assert!(!disk.data_matrix().is_in_memory());
        disk.compute_pca_pipeline().unwrap();

        let (la, lb) = (memory.eigenvalues().unwrap(), disk.eigenvalues().unwrap());
        for (a, b) in la.iter().zip(lb.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
        }
        let mut fa = vec![0.0f32; 24];
        let mut fb = vec![0.0f32; 24];
        memory.reconstruct_field(2, 4, &mut fa).unwrap();
        disk.reconstruct_field(2, 4, &mut fb).unwrap();
        assert_eq!(fa, fb);
        assert!(disk.subtract_mean().is_err());
    }

    #[test]
    fn eigenwarps_over_the_memory_limit_spill_to_disk() {
        let dir = tempdir().unwrap();
        let x = random_columns(3 * 8, 4, 33);
        let mut resident = model_from_columns([2, 2, 2], &x);
        resident.compute_pca_pipeline().unwrap();

        let mut spilled = model_from_columns([2, 2, 2], &x);
        spilled.set_spill_directory(Some(dir.path()));
        spilled.set_eigenmode_memory_limit(Some(16));
        spilled.compute_pca_pipeline().unwrap();
        assert_eq!(spilled.eigenmode_matrix().mode(), StorageMode::Disk);
        let spill_file = dir.path().join("eigenmodes.raw");
        assert_eq!(spilled.eigenmode_matrix().filename(), Some(spill_file.as_path()));
        assert_eq!(std::fs::metadata(&spill_file).unwrap().len(), (24 * 4 * 4) as u64);

        let mut anonymous = model_from_columns([2, 2, 2], &x);
        anonymous.set_eigenmode_memory_limit(Some(0));
        anonymous.compute_pca_pipeline().unwrap();
        assert_eq!(anonymous.eigenmode_matrix().mode(), StorageMode::Disk);

        let mut a = vec![0.0f32; 24];
        let mut b = vec![0.0f32; 24];
        let mut c = vec![0.0f32; 24];
        resident.synthesize_field(&[0.4, -1.0, 0.3], &mut a, false).unwrap();
        spilled.synthesize_field(&[0.4, -1.0, 0.3], &mut b, false).unwrap();
        anonymous.synthesize_field(&[0.4, -1.0, 0.3], &mut c, false).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn individual_files_assemble_columns() {
        let dir = tempdir().unwrap();
        let x = small_example();
        let mut paths = Vec::new();
        for j in 0..2 {
            let path = dir.path().join(format!("s{}.raw", j));
            let column = x.column(j).to_vec();
            std::fs::File::create(&path)
                .unwrap()
                .write_all(bytemuck::cast_slice(&column))
                .unwrap();
            paths.push(path);
        }
        let mut model = DeformationModel::new(FieldHeader::default());
        model.load_from_individual_files(&paths).unwrap();
        let mut field = [0.0f32; 3];
        model.get_warpfield(1, &mut field).unwrap();
        assert_eq!(field, [2.0, 4.0, 6.0]);

        std::fs::write(&paths[1], [0u8; 8]).unwrap();
        assert!(model.load_from_individual_files(&paths).is_err());
        model.get_warpfield(1, &mut field).unwrap();
        assert_eq!(field, [2.0, 4.0, 6.0], "failed load must keep the previous data");
    }

    #[test]
    fn sample_count_must_match_names() {
        let mut model = DeformationModel::new(FieldHeader::default());
        model.set_sample_names(vec!["a".into(), "b".into()]).unwrap();
        assert!(model.allocate_data(3).is_err());
        assert!(model.allocate_data(2).is_ok());
    }

    #[test]
    fn raw_artifacts_round_trip() {
        let dir = tempdir().unwrap();
        let x = random_columns(3 * 4, 3, 6);
        let mut model = model_from_columns([2, 2, 1], &x);
        model.subtract_mean().unwrap();
        model.compute_pca_pipeline().unwrap();
        let files = crate::config::MatrixFiles {
            data: Some(dir.path().join("X.raw")),
            eigenmodes: Some(dir.path().join("U.raw")),
            scatter: Some(dir.path().join("S.raw")),
            eigenvectors: Some(dir.path().join("V.raw")),
            eigenvalues: Some(dir.path().join("lambda.raw")),
            mean: Some(dir.path().join("mean.raw")),
        };
        model.save_artifacts(&files).unwrap();

        let mut loaded = DeformationModel::new(FieldHeader::with_resolution([2, 2, 1]));
        loaded.load_pca_artifacts(&files, 3, true).unwrap();
        loaded.load_mean(files.mean.as_ref().unwrap()).unwrap();
        let status = loaded.status();
        assert!(status.eigenmodes && status.scatter && status.eigenvectors && status.eigenvalues);
        assert!(!status.data);

        let mut a = vec![0.0f32; 12];
        let mut b = vec![0.0f32; 12];
        model.synthesize_field(&[1.0, -0.5], &mut a, true).unwrap();
        loaded.synthesize_field(&[1.0, -0.5], &mut b, true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn loaded_eigenwarps_alone_synthesize() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("U.raw");
        let x = random_columns(3 * 4, 3, 8);
        let mut model = model_from_columns([2, 2, 1], &x);
        model.subtract_mean().unwrap();
        model.compute_pca_pipeline().unwrap();
        model.save_eigenmodes(&path).unwrap();

        let mut loaded = DeformationModel::new(FieldHeader::with_resolution([2, 2, 1]));
        loaded.load_eigenmodes(&path, 3, true).unwrap();
        let status = loaded.status();
        assert!(!status.eigenvalues && !status.eigenvectors);
        assert!(status.can_synthesize());

        let mut a = vec![0.0f32; 12];
        let mut b = vec![0.0f32; 12];
        model.synthesize_field(&[0.7, 0.2, -0.1], &mut a, false).unwrap();
        loaded.synthesize_field(&[0.7, 0.2, -0.1], &mut b, false).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pca_bundle_round_trips_and_checks_grid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pca.bin");
        let x = random_columns(3 * 2, 3, 12);
        let mut model = model_from_columns([2, 1, 1], &x);
        model.set_sample_names(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        model.subtract_mean().unwrap();
        model.compute_scatter_matrix().unwrap();
        model.compute_pca().unwrap();
        model.save_pca_bundle(&path).unwrap();

        let mut restored = DeformationModel::new(FieldHeader::with_resolution([2, 1, 1]));
        restored.load_pca_bundle(&path).unwrap();
        assert_eq!(restored.sample_names(), model.sample_names());
        assert_eq!(restored.eigenvalues(), model.eigenvalues());
        assert_eq!(restored.eigenvectors(), model.eigenvectors());
        assert_eq!(restored.mean(), model.mean());

        let mut other_grid = DeformationModel::new(FieldHeader::with_resolution([1, 2, 1]));
        assert!(other_grid.load_pca_bundle(&path).is_err());
        assert!(other_grid.eigenvalues().is_none());
    }
}

#[cfg(test)]
mod covariance {
    use super::*;

    #[test]
    fn sample_covariance_matches_direct_estimate() {
        let x = random_columns(3 * 4, 6, 41);
        let model = model_from_columns([4, 1, 1], &x);
        let header = model.header().clone();
        let point = header.voxel_to_normalized([2, 0, 0]);
        let cov = model.sample_covariance_at(point).unwrap();

        let rows = x.slice(ndarray::s![6..9, ..]).mapv(|v| v as f64);
        let mean = rows.mean_axis(ndarray::Axis(1)).unwrap();
        for a in 0..3 {
            for b in 0..3 {
                let expected: f64 = (0..6)
                    .map(|j| (rows[[a, j]] - mean[a]) * (rows[[b, j]] - mean[b]))
                    .sum::<f64>()
                    / 5.0;
                assert_abs_diff_eq!(cov[[a, b]], expected, epsilon = 1e-9);
            }
        }
    }
}
