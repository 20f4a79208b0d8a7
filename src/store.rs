use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use directories::BaseDirs;
use tempfile::{Builder, NamedTempFile};

use crate::config::OutputConfig;
use crate::error::PipelineError;

pub const MASTER_FILE: &str = "master.parquet";
pub const ENTITIES_FILE: &str = "entities.parquet";
pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone)]
pub struct Store {
    output_root: Utf8PathBuf,
    archive_root: Utf8PathBuf,
}

impl Store {
    pub fn new(config: &OutputConfig) -> Result<Self, PipelineError> {
        let output_root = match &config.dir {
            Some(dir) => dir.clone(),
            None => {
                let cwd = std::env::current_dir()
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                Utf8PathBuf::from_path_buf(cwd.join("data"))
                    .map_err(|_| PipelineError::Filesystem("invalid output path".to_string()))?
            }
        };

        let archive_root = match &config.archive_dir {
            Some(dir) => dir.clone(),
            None => BaseDirs::new()
                .and_then(|dirs| {
                    Utf8PathBuf::from_path_buf(
                        dirs.cache_dir().join("covid-forecast").join("archive"),
                    )
                    .ok()
                })
                .ok_or_else(|| {
                    PipelineError::Filesystem("unable to resolve cache directory".to_string())
                })?,
        };

        Ok(Self {
            output_root,
            archive_root,
        })
    }

    pub fn new_with_paths(output_root: Utf8PathBuf, archive_root: Utf8PathBuf) -> Self {
        Self {
            output_root,
            archive_root,
        }
    }

    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    pub fn archive_root(&self) -> &Utf8Path {
        &self.archive_root
    }

    pub fn master_path(&self) -> Utf8PathBuf {
        self.output_root.join(MASTER_FILE)
    }

    pub fn entities_path(&self) -> Utf8PathBuf {
        self.output_root.join(ENTITIES_FILE)
    }

    pub fn report_path(&self) -> Utf8PathBuf {
        self.output_root.join(REPORT_FILE)
    }

    pub fn archive_path(&self, feed: &str, date: NaiveDate) -> Utf8PathBuf {
        self.archive_root
            .join(format!("{feed}_{}.csv.gz", date.format("%Y_%m_%d")))
    }

    /// Stages every file as a temp file beside its target, then renames them
    /// all into place. Nothing is renamed unless every file was staged.
    pub fn commit(files: Vec<(Utf8PathBuf, Vec<u8>)>) -> Result<(), PipelineError> {
        let mut staged: Vec<(NamedTempFile, Utf8PathBuf)> = Vec::with_capacity(files.len());
        for (path, content) in files {
            let parent = path
                .parent()
                .ok_or_else(|| PipelineError::Filesystem(format!("invalid output path {path}")))?;
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            let mut temp = Builder::new()
                .prefix(".covid-forecast")
                .tempfile_in(parent.as_std_path())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            temp.write_all(&content)
                .and_then(|_| temp.flush())
                .map_err(|err| PipelineError::Filesystem(format!("write {path}: {err}")))?;
            staged.push((temp, path));
        }
        for (temp, path) in staged {
            temp.persist(path.as_std_path())
                .map_err(|err| PipelineError::Filesystem(format!("rename {path}: {}", err.error)))?;
        }
        Ok(())
    }
}
