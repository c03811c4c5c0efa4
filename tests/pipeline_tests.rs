// In tests/pipeline_tests.rs

use approx::assert_abs_diff_eq;
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::tempdir;
use warp_sdm::{DeformationModel, FieldHeader, MatrixFiles, MatrixStore, SdmConfig, StorageMode};

fn write_raw(path: &Path, values: &[f32]) {
    let mut file = File::create(path).unwrap();
    file.write_all(bytemuck::cast_slice(values)).unwrap();
}

fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array2::random_using((rows, cols), Uniform::new(-2.0f32, 2.0), &mut rng)
}

#[test]
fn rows_and_columns_agree_across_storage_modes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("m.raw");
    let m = random_matrix(17, 5, 1);
    write_raw(&path, m.as_slice().unwrap());

    let mut memory = MatrixStore::new();
    memory.load(17, 5, &path, true).unwrap();
    let mut disk = MatrixStore::new();
    disk.load(17, 5, &path, false).unwrap();
    assert_eq!(memory.mode(), StorageMode::Memory);
    assert_eq!(disk.mode(), StorageMode::Disk);
    assert_eq!(disk.filename(), Some(path.as_path()));

    let mut a = vec![0.0f32; 5];
    let mut b = vec![0.0f32; 5];
    for i in 0..17 {
        memory.get_row(i, &mut a).unwrap();
        disk.get_row(i, &mut b).unwrap();
        assert_eq!(a, b);
    }
    let mut a = vec![0.0f32; 17];
    let mut b = vec![0.0f32; 17];
    for j in 0..5 {
        memory.get_col(j, &mut a).unwrap();
        disk.get_col(j, &mut b).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, m.column(j).to_vec());
    }
    assert_eq!(memory.get_rows(&[16, 0, 3]).unwrap(), disk.get_rows(&[16, 0, 3]).unwrap());
    assert_eq!(memory.get_cols(&[4, 1]).unwrap(), disk.get_cols(&[4, 1]).unwrap());
}

#[test]
fn config_drives_full_pipeline_from_individual_files() {
    let dir = tempdir().unwrap();
    let header = FieldHeader::new([3, 2, 2], [1.0, 1.0, 1.0], [0.0; 3]);
    let x = random_matrix(header.field_size(), 4, 2);
    let mut sample_files: Vec<PathBuf> = Vec::new();
    for j in 0..4 {
        let name = format!("sample{}.raw", j);
        write_raw(&dir.path().join(&name), &x.column(j).to_vec());
        sample_files.push(name.into());
    }
    let config = SdmConfig {
        header: header.clone(),
        sample_names: (0..4).map(|j| format!("subject-{}", j)).collect(),
        sample_files,
        load_from_individual_files: true,
        ..SdmConfig::default()
    };
    let config_path = dir.path().join("model.json");
    config.save(&config_path).unwrap();

    let loaded = SdmConfig::load(&config_path).unwrap();
    let model = DeformationModel::from_config(&loaded).unwrap();
    assert!(model.status().is_complete());
    assert!(model.is_mean_subtracted());
    assert_eq!(model.sample_names()[3], "subject-3");

    let mut rebuilt = vec![0.0f32; header.field_size()];
    let mean = model.mean().unwrap();
    for idx in 0..4 {
        model.reconstruct_field(idx, 4, &mut rebuilt).unwrap();
        for (k, value) in rebuilt.iter().enumerate() {
            assert_abs_diff_eq!(*value + mean[k], x[[k, idx]], epsilon = 1e-4);
        }
    }
}

#[test]
fn config_loads_precomputed_artifacts() {
    let dir = tempdir().unwrap();
    let header = FieldHeader::with_resolution([2, 2, 2]);
    let x = random_matrix(header.field_size(), 3, 3);
    write_raw(&dir.path().join("X.raw"), x.as_slice().unwrap());

    let config = SdmConfig {
        header: header.clone(),
        sample_names: vec!["a".into(), "b".into(), "c".into()],
        matrices: MatrixFiles {
            data: Some("X.raw".into()),
            eigenmodes: Some("U.raw".into()),
            scatter: Some("S.raw".into()),
            eigenvectors: Some("V.raw".into()),
            eigenvalues: Some("lambda.raw".into()),
            mean: Some("mean.raw".into()),
        },
        try_memory: false,
        ..SdmConfig::default()
    };
    let config_path = dir.path().join("model.json");
    config.save(&config_path).unwrap();
    let loaded = SdmConfig::load(&config_path).unwrap();

    // First pass computes everything from X (copied into memory for the mean).
    let mut first_pass = loaded.clone();
    first_pass.try_memory = true;
    let trained = DeformationModel::from_config(&first_pass).unwrap();
    let mut artifacts = loaded.matrices.clone();
    artifacts.data = None;
    trained.save_artifacts(&artifacts).unwrap();

    let mut reuse = loaded.clone();
    reuse.compute_pca = false;
    reuse.subtract_mean = false;
    let model = DeformationModel::from_config(&reuse).unwrap();
    assert_eq!(model.data_matrix().mode(), StorageMode::Disk);
    assert_eq!(model.eigenmode_matrix().mode(), StorageMode::Disk);
    assert!(model.status().is_complete());

    let mut a = vec![0.0f32; header.field_size()];
    let mut b = vec![0.0f32; header.field_size()];
    trained.synthesize_field(&[0.5, 1.0, -1.0], &mut a, true).unwrap();
    model.synthesize_field(&[0.5, 1.0, -1.0], &mut b, true).unwrap();
    assert_eq!(a, b);
}

#[test]
fn invalid_config_is_rejected_before_loading() {
    let config = SdmConfig {
        header: FieldHeader::with_resolution([2, 0, 2]),
        sample_names: vec!["a".into()],
        matrices: MatrixFiles {
            data: Some("missing.raw".into()),
            ..MatrixFiles::default()
        },
        ..SdmConfig::default()
    };
    assert!(DeformationModel::from_config(&config).is_err());
}

#[test]
fn streamed_eigenwarps_on_disk_match_memory() {
    let dir = tempdir().unwrap();
    let header = FieldHeader::with_resolution([2, 1, 1]);
    let x = random_matrix(header.field_size(), 3, 4);
    let data_path = dir.path().join("X.raw");
    write_raw(&data_path, x.as_slice().unwrap());

    let mut model = DeformationModel::new(header);
    model.set_spill_directory(Some(dir.path()));
    model.load_data_matrix(&data_path, 3, false).unwrap();
    model.compute_pca_pipeline().unwrap();
    // Small enough to stay in memory.
    assert_eq!(model.eigenmode_matrix().mode(), StorageMode::Memory);

    let spilled = model
        .data_matrix()
        .multiply_to_disk(model.eigenvectors().unwrap(), Some(dir.path().join("U.raw").as_path()))
        .unwrap();
    assert_eq!(spilled.mode(), StorageMode::Disk);
    let mut a = vec![0.0f32; 6];
    let mut b = vec![0.0f32; 6];
    for j in 0..3 {
        model.get_eigenmode(j, &mut a).unwrap();
        spilled.get_col(j, &mut b).unwrap();
        assert_eq!(a, b);
    }
}
