// src/config.rs

//! Text configuration record describing a model on disk and what to do with it.

use crate::header::FieldHeader;
use crate::ThreadSafeStdError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Filenames of the raw matrices that make up a model. Unset entries are
/// neither loaded nor saved.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixFiles {
    /// Data matrix `X`, `field_size x num_samples`.
    pub data: Option<PathBuf>,
    /// Eigenwarp matrix `U`, `field_size x num_samples`.
    pub eigenmodes: Option<PathBuf>,
    /// Scatter matrix `S`, `num_samples x num_samples`.
    pub scatter: Option<PathBuf>,
    /// Eigenvector matrix `V`, `num_samples x num_samples`.
    pub eigenvectors: Option<PathBuf>,
    /// Eigenvalues, `num_samples x 1`.
    pub eigenvalues: Option<PathBuf>,
    /// Mean field, `field_size x 1`.
    pub mean: Option<PathBuf>,
}

impl MatrixFiles {
    fn rebase(&mut self, base: &Path) {
        for slot in [
            &mut self.data,
            &mut self.eigenmodes,
            &mut self.scatter,
            &mut self.eigenvectors,
            &mut self.eigenvalues,
            &mut self.mean,
        ] {
            if let Some(path) = slot.as_mut() {
                rebase_path(path, base);
            }
        }
    }
}

fn rebase_path(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

/// Everything needed to build a [`DeformationModel`](crate::DeformationModel) from files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdmConfig {
    /// Grid shared by all warp fields.
    pub header: FieldHeader,
    /// Display names of the samples, in column order.
    pub sample_names: Vec<String>,
    /// Per-sample raw warp-field files, used with `load_from_individual_files`.
    pub sample_files: Vec<PathBuf>,
    /// Raw matrix files.
    pub matrices: MatrixFiles,
    /// Where eigenwarps are spilled when they do not fit in memory. A
    /// temporary file is used when unset.
    pub spill_directory: Option<PathBuf>,
    /// Read matrices fully into memory when possible.
    pub try_memory: bool,
    /// Compute scatter, eigenpairs and eigenwarps after loading the data.
    pub compute_pca: bool,
    /// Subtract the per-coordinate sample mean from the data after loading.
    pub subtract_mean: bool,
    /// Assemble the data matrix from `sample_files` instead of `matrices.data`.
    pub load_from_individual_files: bool,
}

impl Default for SdmConfig {
    fn default() -> Self {
        Self {
            header: FieldHeader::default(),
            sample_names: Vec::new(),
            sample_files: Vec::new(),
            matrices: MatrixFiles::default(),
            spill_directory: None,
            try_memory: true,
            compute_pca: true,
            subtract_mean: true,
            load_from_individual_files: false,
        }
    }
}

impl SdmConfig {
    /// Number of samples: the longer of the name and file lists.
    pub fn num_samples(&self) -> usize {
        self.sample_names.len().max(self.sample_files.len())
    }

    pub fn field_size(&self) -> usize {
        self.header.field_size()
    }

    pub fn validate(&self) -> Result<(), ThreadSafeStdError> {
        self.header.validate()?;
        if self.num_samples() == 0 {
            return Err("Configuration lists no samples.".into());
        }
        if !self.sample_names.is_empty()
            && !self.sample_files.is_empty()
            && self.sample_names.len() != self.sample_files.len()
        {
            return Err(format!(
                "Configuration has {} sample names but {} sample files.",
                self.sample_names.len(),
                self.sample_files.len()
            )
            .into());
        }
        if self.load_from_individual_files {
            if self.sample_files.is_empty() {
                return Err("load_from_individual_files is set but no sample files are listed.".into());
            }
        } else if self.matrices.data.is_none() && self.matrices.eigenmodes.is_none() {
            return Err("Configuration names neither a data matrix nor an eigenmode matrix.".into());
        }
        if self.compute_pca && !self.load_from_individual_files && self.matrices.data.is_none() {
            return Err("compute_pca requires a data matrix or individual sample files.".into());
        }
        Ok(())
    }

    /// Reads a JSON configuration. Relative paths are resolved against the
    /// directory containing the configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ThreadSafeStdError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| format!("Failed to open configuration {:?}: {}", path, e))?;
        let mut config: SdmConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| format!("Failed to parse configuration {:?}: {}", path, e))?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        debug!("Loaded configuration {:?} with {} samples.", path, config.num_samples());
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ThreadSafeStdError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| format!("Failed to create configuration {:?}: {}", path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| format!("Failed to write configuration {:?}: {}", path, e))?;
        Ok(())
    }

    fn rebase(&mut self, base: &Path) {
        self.matrices.rebase(base);
        for path in self.sample_files.iter_mut() {
            rebase_path(path, base);
        }
        if let Some(dir) = self.spill_directory.as_mut() {
            rebase_path(dir, base);
        }
    }
}
