// src/matrix_store.rs

//! Row-major `f32` matrix that is either resident in memory or served from a
//! raw binary file.
//!
//! The on-disk format is the flattened matrix in row-major order, native byte
//! order, with no header. Shape is supplied out of band.
//!
//! Row access is cheap in both modes (one seek, one contiguous read). Column
//! access on a disk-backed matrix costs one seek per row. All reductions in
//! this module therefore stream row by row, so their peak memory is bounded by
//! one row plus the reduction result.
//!
//! A `MatrixStore` is not thread-safe. The disk stream lives in a `RefCell`,
//! which makes the type `!Sync`; callers serialize access per instance.

use crate::ThreadSafeStdError;
use log::{debug, info, trace, warn};
use ndarray::{Array1, Array2, ArrayView1};
use std::cell::{RefCell, RefMut};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use sysinfo::System;
use tempfile::{NamedTempFile, TempPath};

const BYTES_PER_VALUE: usize = std::mem::size_of::<f32>();

/// Where the matrix values currently live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageMode {
    /// Nothing allocated or loaded.
    Empty,
    /// Whole matrix resident in memory.
    Memory,
    /// Values read on demand from the backing file.
    Disk,
}

struct DiskBacking {
    path: PathBuf,
    stream: RefCell<Option<File>>,
    // Removes the spill file when the store is dropped.
    _temporary: Option<TempPath>,
}

enum Storage {
    Empty,
    Memory(Vec<f32>),
    Disk(DiskBacking),
}

/// An M x N matrix of `f32` in row-major order.
pub struct MatrixStore {
    rows: usize,
    cols: usize,
    filename: Option<PathBuf>,
    storage: Storage,
}

impl fmt::Debug for MatrixStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixStore")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("mode", &self.mode())
            .field("filename", &self.filename)
            .finish()
    }
}

impl Default for MatrixStore {
    fn default() -> Self {
        Self::new()
    }
}

fn checked_len(rows: usize, cols: usize) -> Result<usize, ThreadSafeStdError> {
    rows.checked_mul(cols)
        .filter(|n| n.checked_mul(BYTES_PER_VALUE).is_some())
        .ok_or_else(|| format!("Matrix shape {}x{} overflows the addressable size.", rows, cols).into())
}

/// Reserves exactly `len` zeroed floats, reporting failure instead of aborting.
fn try_alloc_zeroed(len: usize) -> Result<Vec<f32>, ThreadSafeStdError> {
    let mut buffer: Vec<f32> = Vec::new();
    buffer.try_reserve_exact(len).map_err(|e| {
        format!(
            "Failed to allocate {} floats ({} bytes): {}",
            len,
            len.saturating_mul(BYTES_PER_VALUE),
            e
        )
    })?;
    buffer.resize(len, 0.0);
    Ok(buffer)
}

/// Whether `bytes` fits in the memory the OS currently reports as available.
/// Platforms that report nothing are assumed to have room.
fn fits_in_available_memory(bytes: usize) -> bool {
    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory();
    available == 0 || (bytes as u64) < available
}

impl MatrixStore {
    /// Creates an empty store with shape 0x0.
    pub fn new() -> Self {
        Self {
            rows: 0,
            cols: 0,
            filename: None,
            storage: Storage::Empty,
        }
    }

    /// Builds an in-memory store from row-major values.
    pub fn from_vec(rows: usize, cols: usize, values: Vec<f32>) -> Result<Self, ThreadSafeStdError> {
        let len = checked_len(rows, cols)?;
        if values.len() != len {
            return Err(format!(
                "Expected {} values for a {}x{} matrix, got {}.",
                len,
                rows,
                cols,
                values.len()
            )
            .into());
        }
        Ok(Self {
            rows,
            cols,
            filename: None,
            storage: Storage::Memory(values),
        })
    }

    /// Builds an in-memory store from an ndarray matrix.
    pub fn from_array(matrix: &Array2<f32>) -> Result<Self, ThreadSafeStdError> {
        let (rows, cols) = matrix.dim();
        Self::from_vec(rows, cols, matrix.iter().cloned().collect())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// The file this matrix was loaded from, if any. Recorded in both modes.
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn mode(&self) -> StorageMode {
        match self.storage {
            Storage::Empty => StorageMode::Empty,
            Storage::Memory(_) => StorageMode::Memory,
            Storage::Disk(_) => StorageMode::Disk,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.storage, Storage::Empty)
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.storage, Storage::Memory(_))
    }

    /// Releases all storage and resets the shape to 0x0.
    pub fn clear(&mut self) {
        self.rows = 0;
        self.cols = 0;
        self.filename = None;
        self.storage = Storage::Empty;
    }

    /// Reserves a zero-filled in-memory buffer of `rows * cols` floats.
    ///
    /// On allocation failure the previous contents are kept and the error
    /// reports the requested size.
    pub fn allocate(&mut self, rows: usize, cols: usize) -> Result<(), ThreadSafeStdError> {
        let len = checked_len(rows, cols)?;
        let buffer = try_alloc_zeroed(len)?;
        debug!("Allocated {}x{} matrix ({} bytes) in memory.", rows, cols, len * BYTES_PER_VALUE);
        self.rows = rows;
        self.cols = cols;
        self.filename = None;
        self.storage = Storage::Memory(buffer);
        Ok(())
    }

    /// Opens a raw row-major `f32` file of the declared shape.
    ///
    /// With `try_memory` the whole file is read into memory; if the buffer
    /// cannot be allocated (or the OS reports too little free memory) the
    /// store falls back to disk-backed mode. A read error aborts the load and
    /// leaves the previous contents untouched. The file size must match the
    /// declared shape exactly.
    pub fn load<P: AsRef<Path>>(
        &mut self,
        rows: usize,
        cols: usize,
        path: P,
        try_memory: bool,
    ) -> Result<(), ThreadSafeStdError> {
        let path = path.as_ref();
        let len = checked_len(rows, cols)?;
        let expected_bytes = len * BYTES_PER_VALUE;

        let mut file = File::open(path).map_err(|e| format!("Failed to open matrix file {:?}: {}", path, e))?;
        let actual_bytes = file
            .metadata()
            .map_err(|e| format!("Failed to stat matrix file {:?}: {}", path, e))?
            .len();
        if actual_bytes != expected_bytes as u64 {
            return Err(format!(
                "Matrix file {:?} has {} bytes but a {}x{} float matrix needs {} bytes.",
                path, actual_bytes, rows, cols, expected_bytes
            )
            .into());
        }

        let mut storage = None;
        if try_memory {
            if !fits_in_available_memory(expected_bytes) {
                warn!(
                    "Matrix {:?} ({} bytes) exceeds available memory; serving it from disk.",
                    path, expected_bytes
                );
            } else {
                match try_alloc_zeroed(len) {
                    Ok(mut buffer) => {
                        file.read_exact(bytemuck::cast_slice_mut(&mut buffer[..]))
                            .map_err(|e| format!("Failed to read matrix file {:?}: {}", path, e))?;
                        storage = Some(Storage::Memory(buffer));
                    }
                    Err(e) => {
                        warn!("{} Falling back to disk-backed access for {:?}.", e, path);
                    }
                }
            }
        }

        let storage = match storage {
            Some(s) => s,
            None => Storage::Disk(DiskBacking {
                path: path.to_path_buf(),
                stream: RefCell::new(Some(file)),
                _temporary: None,
            }),
        };

        self.rows = rows;
        self.cols = cols;
        self.filename = Some(path.to_path_buf());
        self.storage = storage;
        info!("Loaded {}x{} matrix from {:?} ({:?}).", rows, cols, path, self.mode());
        Ok(())
    }

    /// Returns the open disk stream, reopening it by filename if it was dropped.
    ///
    /// Fails for stores that are not disk-backed.
    pub fn ensure_open(&self) -> Result<RefMut<'_, File>, ThreadSafeStdError> {
        let backing = match &self.storage {
            Storage::Disk(backing) => backing,
            _ => return Err("ensure_open called on a matrix that is not disk-backed.".into()),
        };
        let mut slot = backing
            .stream
            .try_borrow_mut()
            .map_err(|_| format!("Stream for {:?} is already in use.", backing.path))?;
        if slot.is_none() {
            debug!("Reopening matrix stream {:?}.", backing.path);
            let file = File::open(&backing.path)
                .map_err(|e| format!("Failed to reopen matrix file {:?}: {}", backing.path, e))?;
            *slot = Some(file);
        }
        RefMut::filter_map(slot, |s| s.as_mut())
            .map_err(|_| format!("Stream for {:?} could not be opened.", backing.path).into())
    }

    /// Drops the disk stream; the next disk access reopens it.
    pub fn close_stream(&self) {
        if let Storage::Disk(backing) = &self.storage {
            if let Ok(mut slot) = backing.stream.try_borrow_mut() {
                *slot = None;
            }
        }
    }

    fn check_row(&self, i: usize) -> Result<(), ThreadSafeStdError> {
        if self.is_empty() {
            return Err("Matrix is empty.".into());
        }
        if i >= self.rows {
            return Err(format!("Row index {} out of bounds for {} rows.", i, self.rows).into());
        }
        Ok(())
    }

    fn check_col(&self, j: usize) -> Result<(), ThreadSafeStdError> {
        if self.is_empty() {
            return Err("Matrix is empty.".into());
        }
        if j >= self.cols {
            return Err(format!("Column index {} out of bounds for {} columns.", j, self.cols).into());
        }
        Ok(())
    }

    fn check_buffer(len: usize, required: usize, what: &str) -> Result<(), ThreadSafeStdError> {
        if len != required {
            return Err(format!("{} buffer has length {} but {} is required.", what, len, required).into());
        }
        Ok(())
    }

    fn read_disk_row(&self, i: usize, buf: &mut [f32]) -> Result<(), ThreadSafeStdError> {
        let mut stream = self.ensure_open()?;
        let offset = (i * self.cols * BYTES_PER_VALUE) as u64;
        stream.seek(SeekFrom::Start(offset))?;
        stream
            .read_exact(bytemuck::cast_slice_mut(buf))
            .map_err(|e| format!("Failed to read row {} from disk: {}", i, e))?;
        Ok(())
    }

    /// Copies row `i` into `buf`, which must hold exactly `cols` values.
    pub fn get_row(&self, i: usize, buf: &mut [f32]) -> Result<(), ThreadSafeStdError> {
        self.check_row(i)?;
        Self::check_buffer(buf.len(), self.cols, "Row")?;
        match &self.storage {
            Storage::Memory(data) => {
                buf.copy_from_slice(&data[i * self.cols..(i + 1) * self.cols]);
                Ok(())
            }
            Storage::Disk(_) => self.read_disk_row(i, buf),
            Storage::Empty => Err("Matrix is empty.".into()),
        }
    }

    /// Gathers an arbitrary, possibly non-contiguous set of rows.
    /// Returns a `(indices.len(), cols)` matrix.
    pub fn get_rows(&self, indices: &[usize]) -> Result<Array2<f32>, ThreadSafeStdError> {
        let mut values = vec![0.0f32; indices.len() * self.cols];
        if self.cols > 0 {
            for (&i, chunk) in indices.iter().zip(values.chunks_mut(self.cols)) {
                self.get_row(i, chunk)?;
            }
        } else {
            for &i in indices {
                self.check_row(i)?;
            }
        }
        Ok(Array2::from_shape_vec((indices.len(), self.cols), values)?)
    }

    /// Copies column `j` into `buf`, which must hold exactly `rows` values.
    ///
    /// Disk-backed stores seek once per row; prefer row access for bulk work.
    pub fn get_col(&self, j: usize, buf: &mut [f32]) -> Result<(), ThreadSafeStdError> {
        self.check_col(j)?;
        Self::check_buffer(buf.len(), self.rows, "Column")?;
        match &self.storage {
            Storage::Memory(data) => {
                for (i, value) in buf.iter_mut().enumerate() {
                    *value = data[i * self.cols + j];
                }
                Ok(())
            }
            Storage::Disk(_) => {
                let mut stream = self.ensure_open()?;
                let mut bytes = [0u8; BYTES_PER_VALUE];
                for (i, value) in buf.iter_mut().enumerate() {
                    let offset = ((i * self.cols + j) * BYTES_PER_VALUE) as u64;
                    stream.seek(SeekFrom::Start(offset))?;
                    stream
                        .read_exact(&mut bytes)
                        .map_err(|e| format!("Failed to read element ({}, {}) from disk: {}", i, j, e))?;
                    *value = f32::from_ne_bytes(bytes);
                }
                Ok(())
            }
            Storage::Empty => Err("Matrix is empty.".into()),
        }
    }

    /// Gathers a set of columns into a `(rows, indices.len())` matrix.
    pub fn get_cols(&self, indices: &[usize]) -> Result<Array2<f32>, ThreadSafeStdError> {
        let mut out = Array2::<f32>::zeros((self.rows, indices.len()));
        let mut column = vec![0.0f32; self.rows];
        for (k, &j) in indices.iter().enumerate() {
            self.get_col(j, &mut column)?;
            out.column_mut(k).assign(&ArrayView1::from(&column[..]));
        }
        Ok(out)
    }

    fn memory_mut(&mut self, op: &str) -> Result<&mut Vec<f32>, ThreadSafeStdError> {
        match &mut self.storage {
            Storage::Memory(data) => Ok(data),
            Storage::Disk(backing) => Err(format!(
                "{} is not supported for disk-backed matrix {:?}; load it into memory first.",
                op, backing.path
            )
            .into()),
            Storage::Empty => Err(format!("{} on an empty matrix.", op).into()),
        }
    }

    /// Overwrites row `i`. In-memory stores only.
    pub fn set_row(&mut self, i: usize, values: &[f32]) -> Result<(), ThreadSafeStdError> {
        self.check_row(i)?;
        Self::check_buffer(values.len(), self.cols, "Row")?;
        let cols = self.cols;
        let data = self.memory_mut("set_row")?;
        data[i * cols..(i + 1) * cols].copy_from_slice(values);
        Ok(())
    }

    /// Overwrites column `j`. In-memory stores only.
    pub fn set_col(&mut self, j: usize, values: &[f32]) -> Result<(), ThreadSafeStdError> {
        self.check_col(j)?;
        Self::check_buffer(values.len(), self.rows, "Column")?;
        let cols = self.cols;
        let data = self.memory_mut("set_col")?;
        for (i, &value) in values.iter().enumerate() {
            data[i * cols + j] = value;
        }
        Ok(())
    }

    /// Writes the raw matrix to `path`. In-memory stores only.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ThreadSafeStdError> {
        let path = path.as_ref();
        let data = match &self.storage {
            Storage::Memory(data) => data,
            Storage::Disk(backing) => {
                return Err(format!(
                    "Saving is not supported for disk-backed matrix {:?}.",
                    backing.path
                )
                .into())
            }
            Storage::Empty => return Err("Cannot save an empty matrix.".into()),
        };
        let file = File::create(path).map_err(|e| format!("Failed to create file at {:?}: {}", path, e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(bytemuck::cast_slice(&data[..]))
            .and_then(|_| writer.flush())
            .map_err(|e| format!("Failed to write matrix to {:?}: {}", path, e))?;
        debug!("Saved {}x{} matrix to {:?}.", self.rows, self.cols, path);
        Ok(())
    }

    /// Visits every row in order with a single reusable buffer.
    ///
    /// Disk-backed stores read the file sequentially from the start.
    pub fn for_each_row<F>(&self, mut visit: F) -> Result<(), ThreadSafeStdError>
    where
        F: FnMut(usize, &[f32]) -> Result<(), ThreadSafeStdError>,
    {
        match &self.storage {
            Storage::Memory(data) => {
                if self.cols == 0 {
                    for i in 0..self.rows {
                        visit(i, &[])?;
                    }
                    return Ok(());
                }
                for (i, row) in data.chunks_exact(self.cols).enumerate() {
                    visit(i, row)?;
                }
                Ok(())
            }
            Storage::Disk(_) => {
                let mut row = vec![0.0f32; self.cols];
                let mut stream = self.ensure_open()?;
                stream.seek(SeekFrom::Start(0))?;
                for i in 0..self.rows {
                    stream
                        .read_exact(bytemuck::cast_slice_mut(&mut row[..]))
                        .map_err(|e| format!("Failed to stream row {} from disk: {}", i, e))?;
                    if i % 100_000 == 0 {
                        trace!("Streaming row {}/{}", i, self.rows);
                    }
                    visit(i, &row)?;
                }
                Ok(())
            }
            Storage::Empty => Err("Matrix is empty.".into()),
        }
    }

    fn for_each_row_mut<F>(&mut self, op: &str, mut visit: F) -> Result<(), ThreadSafeStdError>
    where
        F: FnMut(usize, &mut [f32]),
    {
        let cols = self.cols;
        let data = self.memory_mut(op)?;
        if cols == 0 {
            return Ok(());
        }
        for (i, row) in data.chunks_exact_mut(cols).enumerate() {
            visit(i, row);
        }
        Ok(())
    }

    /// Mean of the columns: entry `i` is the average of row `i`.
    pub fn compute_column_mean(&self) -> Result<Array1<f32>, ThreadSafeStdError> {
        if self.cols == 0 {
            return Err("Cannot average a matrix with zero columns.".into());
        }
        let mut mean = Array1::<f32>::zeros(self.rows);
        let n = self.cols as f64;
        self.for_each_row(|i, row| {
            let sum: f64 = row.iter().map(|&v| v as f64).sum();
            mean[i] = (sum / n) as f32;
            Ok(())
        })?;
        Ok(mean)
    }

    /// Euclidean norm of every column.
    pub fn compute_column_norm(&self) -> Result<Array1<f64>, ThreadSafeStdError> {
        let mut squares = Array1::<f64>::zeros(self.cols);
        self.for_each_row(|_, row| {
            for (acc, &v) in squares.iter_mut().zip(row) {
                *acc += (v as f64) * (v as f64);
            }
            Ok(())
        })?;
        Ok(squares.mapv(f64::sqrt))
    }

    fn check_rhs(&self, rhs: &Array2<f64>) -> Result<(), ThreadSafeStdError> {
        if rhs.nrows() != self.cols {
            return Err(format!(
                "Cannot multiply a {}x{} matrix by a {}x{} matrix.",
                self.rows,
                self.cols,
                rhs.nrows(),
                rhs.ncols()
            )
            .into());
        }
        Ok(())
    }

    /// Streams `row_i(out) = row_i(self) * rhs` into an in-memory `out` of
    /// shape `(rows, rhs.ncols())`.
    pub fn multiply(&self, rhs: &Array2<f64>, out: &mut MatrixStore) -> Result<(), ThreadSafeStdError> {
        self.check_rhs(rhs)?;
        if out.shape() != (self.rows, rhs.ncols()) || !out.is_in_memory() {
            return Err(format!(
                "Product target must be an in-memory {}x{} matrix, got {:?}.",
                self.rows,
                rhs.ncols(),
                out
            )
            .into());
        }
        let out_cols = rhs.ncols();
        let data = out.memory_mut("multiply")?;
        let mut row64 = Array1::<f64>::zeros(self.cols);
        self.for_each_row(|i, row| {
            for (dst, &v) in row64.iter_mut().zip(row) {
                *dst = v as f64;
            }
            let product = row64.dot(rhs);
            for (dst, &v) in data[i * out_cols..(i + 1) * out_cols].iter_mut().zip(product.iter()) {
                *dst = v as f32;
            }
            Ok(())
        })
    }

    /// Streams `self * rhs` straight to a raw file and returns it disk-backed.
    ///
    /// With `target` unset the product goes to a temporary file that is
    /// removed when the returned store is dropped.
    pub fn multiply_to_disk(
        &self,
        rhs: &Array2<f64>,
        target: Option<&Path>,
    ) -> Result<MatrixStore, ThreadSafeStdError> {
        self.check_rhs(rhs)?;
        let (file, path, temporary) = match target {
            Some(path) => {
                let file = File::create(path).map_err(|e| format!("Failed to create file at {:?}: {}", path, e))?;
                (file, path.to_path_buf(), None)
            }
            None => {
                let named = NamedTempFile::new().map_err(|e| format!("Failed to create spill file: {}", e))?;
                let (file, temp_path) = named.into_parts();
                (file, temp_path.to_path_buf(), Some(temp_path))
            }
        };
        info!("Streaming {}x{} product to {:?}.", self.rows, rhs.ncols(), path);

        let mut writer = BufWriter::new(file);
        let mut row64 = Array1::<f64>::zeros(self.cols);
        let mut out_row = vec![0.0f32; rhs.ncols()];
        self.for_each_row(|_, row| {
            for (dst, &v) in row64.iter_mut().zip(row) {
                *dst = v as f64;
            }
            let product = row64.dot(rhs);
            for (dst, &v) in out_row.iter_mut().zip(product.iter()) {
                *dst = v as f32;
            }
            writer.write_all(bytemuck::cast_slice(&out_row[..]))?;
            Ok(())
        })?;
        writer.flush()?;
        drop(writer);

        Ok(MatrixStore {
            rows: self.rows,
            cols: rhs.ncols(),
            filename: Some(path.clone()),
            storage: Storage::Disk(DiskBacking {
                path,
                stream: RefCell::new(None),
                _temporary: temporary,
            }),
        })
    }

    /// Scales row `i` by `weights[i]`. In-memory stores only.
    pub fn apply_row_weights(&mut self, weights: &[f32]) -> Result<(), ThreadSafeStdError> {
        Self::check_buffer(weights.len(), self.rows, "Row weight")?;
        self.for_each_row_mut("apply_row_weights", |i, row| {
            let w = weights[i];
            row.iter_mut().for_each(|v| *v *= w);
        })
    }

    /// Scales column `j` by `weights[j]`. In-memory stores only.
    pub fn apply_column_weights(&mut self, weights: &[f32]) -> Result<(), ThreadSafeStdError> {
        Self::check_buffer(weights.len(), self.cols, "Column weight")?;
        self.for_each_row_mut("apply_column_weights", |_, row| {
            for (v, &w) in row.iter_mut().zip(weights) {
                *v *= w;
            }
        })
    }

    /// Subtracts `offsets[i]` from every entry of row `i`. In-memory stores only.
    pub fn subtract_row_offsets(&mut self, offsets: &[f32]) -> Result<(), ThreadSafeStdError> {
        Self::check_buffer(offsets.len(), self.rows, "Row offset")?;
        self.for_each_row_mut("subtract_row_offsets", |i, row| {
            let o = offsets[i];
            row.iter_mut().for_each(|v| *v -= o);
        })
    }
}
