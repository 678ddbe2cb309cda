//! Encrypted table store
//!
//! Filesystem layout for one encrypted table: column blocks, validity
//! blocks, per-value bit-masks, and the packed/scaled mask encodings,
//! each as a length-prefixed ciphertext file, plus `metadata.json`
//! carrying the schema and parameter hash. Reads go through a memory
//! map so multi-gigabyte tables never pass through the heap whole.
//!
//! ```text
//! <table>/metadata.json
//! <table>/blocks/<column>_<block>.ct
//! <table>/validity/<column>_<block>.ct
//! <table>/bmvs/<column>_v<value>_<block>.ct
//! <table>/pbmv/<column>_<block>.ct
//! <table>/bbmv/<column>_<block>.ct
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::backend::Ciphertext;
use crate::error::{Result, StatError};
use crate::eval::CounterSnapshot;
use crate::ops::categorical::MaskSource;
use crate::ops::lbc::{PackedMaskSource, ScaledMaskSource};
use crate::schema::TableMeta;

/// Handle to one on-disk encrypted table.
pub struct TableStore {
    base: PathBuf,
    meta: TableMeta,
}

const SUBDIRS: [&str; 5] = ["blocks", "validity", "bmvs", "pbmv", "bbmv"];

impl TableStore {
    /// Creates the directory layout and writes the metadata file.
    pub fn create(base: &Path, meta: TableMeta) -> Result<Self> {
        meta.validate()?;
        for dir in SUBDIRS {
            fs::create_dir_all(base.join(dir))?;
        }
        let file = File::create(base.join("metadata.json"))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &meta)?;
        Ok(Self {
            base: base.to_path_buf(),
            meta,
        })
    }

    /// Opens an existing table, reading its metadata.
    pub fn open(base: &Path) -> Result<Self> {
        let meta_path = base.join("metadata.json");
        if !meta_path.is_file() {
            return Err(StatError::InvalidConfiguration {
                reason: format!("no table metadata at {}", meta_path.display()),
            });
        }
        let meta: TableMeta = serde_json::from_reader(File::open(meta_path)?)?;
        meta.validate()?;
        Ok(Self {
            base: base.to_path_buf(),
            meta,
        })
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn block_path(&self, column: &str, block: usize) -> PathBuf {
        self.base.join("blocks").join(format!("{column}_{block}.ct"))
    }

    fn validity_path(&self, column: &str, block: usize) -> PathBuf {
        self.base
            .join("validity")
            .join(format!("{column}_{block}.ct"))
    }

    fn bmv_path(&self, column: &str, value: u32, block: usize) -> PathBuf {
        self.base
            .join("bmvs")
            .join(format!("{column}_v{value}_{block}.ct"))
    }

    fn pbmv_path(&self, column: &str, block: usize) -> PathBuf {
        self.base.join("pbmv").join(format!("{column}_{block}.ct"))
    }

    fn bbmv_path(&self, column: &str, block: usize) -> PathBuf {
        self.base.join("bbmv").join(format!("{column}_{block}.ct"))
    }

    pub fn save_block(&self, column: &str, block: usize, ct: &Ciphertext) -> Result<()> {
        save_ciphertext(&self.block_path(column, block), ct)
    }

    pub fn load_block(&self, column: &str, block: usize) -> Result<Ciphertext> {
        load_ciphertext(&self.block_path(column, block))
            .map_err(|e| e.in_context(&format!("column {column} block {block}")))
    }

    pub fn save_validity(&self, column: &str, block: usize, ct: &Ciphertext) -> Result<()> {
        save_ciphertext(&self.validity_path(column, block), ct)
    }

    pub fn load_validity(&self, column: &str, block: usize) -> Result<Ciphertext> {
        load_ciphertext(&self.validity_path(column, block))
            .map_err(|e| e.in_context(&format!("validity of {column} block {block}")))
    }

    pub fn save_bmv(&self, column: &str, value: u32, block: usize, ct: &Ciphertext) -> Result<()> {
        save_ciphertext(&self.bmv_path(column, value, block), ct)
    }

    pub fn load_bmv(&self, column: &str, value: u32, block: usize) -> Result<Ciphertext> {
        load_ciphertext(&self.bmv_path(column, value, block))
            .map_err(|e| e.in_context(&format!("mask {column}={value} block {block}")))
    }

    pub fn save_pbmv(&self, column: &str, block: usize, ct: &Ciphertext) -> Result<()> {
        save_ciphertext(&self.pbmv_path(column, block), ct)
    }

    pub fn load_pbmv(&self, column: &str, block: usize) -> Result<Ciphertext> {
        load_ciphertext(&self.pbmv_path(column, block))
            .map_err(|e| e.in_context(&format!("packed mask {column} block {block}")))
    }

    pub fn save_bbmv(&self, column: &str, block: usize, ct: &Ciphertext) -> Result<()> {
        save_ciphertext(&self.bbmv_path(column, block), ct)
    }

    pub fn load_bbmv(&self, column: &str, block: usize) -> Result<Ciphertext> {
        load_ciphertext(&self.bbmv_path(column, block))
            .map_err(|e| e.in_context(&format!("scaled mask {column} block {block}")))
    }

    /// Loads every block of a column in order.
    pub fn load_column(&self, column: &str) -> Result<Vec<Ciphertext>> {
        (0..self.meta.block_count)
            .map(|b| self.load_block(column, b))
            .collect()
    }

    /// Loads every validity block of a column in order.
    pub fn load_column_validity(&self, column: &str) -> Result<Vec<Ciphertext>> {
        (0..self.meta.block_count)
            .map(|b| self.load_validity(column, b))
            .collect()
    }
}

impl MaskSource for TableStore {
    fn mask(&self, column: &str, value: u32, block: usize) -> Result<Ciphertext> {
        self.load_bmv(column, value, block)
    }

    fn block_count(&self) -> usize {
        self.meta.block_count
    }
}

impl PackedMaskSource for TableStore {
    fn packed_mask(&self, column: &str, block: usize) -> Result<Ciphertext> {
        self.load_pbmv(column, block)
    }

    fn block_count(&self) -> usize {
        self.meta.block_count
    }
}

impl ScaledMaskSource for TableStore {
    fn scaled_mask(&self, column: &str, block: usize) -> Result<Ciphertext> {
        self.load_bbmv(column, block)
    }

    fn block_count(&self) -> usize {
        self.meta.block_count
    }
}

/// Writes one framed ciphertext file.
pub fn save_ciphertext(path: &Path, ct: &Ciphertext) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    ct.write_framed(&mut writer)?;
    writer.flush()?;
    Ok(())
}

/// Reads one framed ciphertext file through a memory map.
pub fn load_ciphertext(path: &Path) -> Result<Ciphertext> {
    let file = File::open(path)?;
    // SAFETY: opened read-only; the map lives only for this read.
    let mmap = unsafe { Mmap::map(&file)? };
    Ciphertext::read_framed(&mut Cursor::new(&mmap[..]))
}

/// Metadata sidecar written next to every result ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSidecar {
    pub job_id: String,
    pub op: String,
    pub level_on_exit: usize,
    pub operation_counts: CounterSnapshot,
}

/// Writes `result.ct` plus its JSON sidecar into `dir`.
pub fn write_result(
    dir: &Path,
    job_id: &str,
    op: &str,
    ct: &Ciphertext,
    counts: CounterSnapshot,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let ct_path = dir.join("result.ct");
    save_ciphertext(&ct_path, ct)?;

    let sidecar = ResultSidecar {
        job_id: job_id.to_string(),
        op: op.to_string(),
        level_on_exit: ct.level(),
        operation_counts: counts,
    };
    let file = File::create(dir.join("result.json"))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &sidecar)?;
    Ok(ct_path)
}

/// Reads a result ciphertext and its sidecar back.
pub fn read_result(dir: &Path) -> Result<(Ciphertext, ResultSidecar)> {
    let ct = load_ciphertext(&dir.join("result.ct"))?;
    let sidecar: ResultSidecar = serde_json::from_reader(File::open(dir.join("result.json"))?)?;
    Ok((ct, sidecar))
}
