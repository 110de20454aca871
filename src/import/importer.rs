//! SQL Dump Importer

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;

use super::StatementSink;
use crate::error::{Error, Result};
use crate::splitter::StatementSplitter;

/// Bytes read from a dump file per chunk
const CHUNK_SIZE: usize = 64 * 1024;

/// Progress within the file being imported
#[derive(Debug, Clone)]
pub struct ImportProgress {
    pub total_files: usize,
    /// 1-based index of the current file
    pub file_no: usize,
    pub bytes_processed: u64,
    pub total_bytes: u64,
    pub file_path: PathBuf,
}

/// A file finished, successfully or not
#[derive(Debug)]
pub struct FileCompleted<'a> {
    pub total_files: usize,
    pub file_no: usize,
    pub file_path: &'a Path,
    pub error: Option<&'a Error>,
}

/// A file that could not be imported
#[derive(Debug)]
pub struct FailedImport {
    pub path: PathBuf,
    pub error: Error,
}

/// Outcome of an import run
#[derive(Debug, Default)]
pub struct ImportReport {
    /// Files imported completely, in import order
    pub imported: Vec<PathBuf>,
    /// Files that stopped at their first error
    pub failed: Vec<FailedImport>,
    /// Statements submitted across all files
    pub statements: usize,
}

impl ImportReport {
    /// Whether every file was imported
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

type ProgressFn = Box<dyn Fn(&ImportProgress) + Send + Sync>;
type CompletedFn = Box<dyn Fn(&FileCompleted<'_>) + Send + Sync>;

/// Imports SQL files one at a time, in order
pub struct Importer {
    sink: Arc<dyn StatementSink>,
    on_progress: Option<ProgressFn>,
    on_file_completed: Option<CompletedFn>,
    chunk_size: usize,
}

struct SqlFile {
    path: PathBuf,
    size: u64,
}

impl Importer {
    /// Create an importer writing to `sink`
    pub fn new(sink: Arc<dyn StatementSink>) -> Self {
        Self {
            sink,
            on_progress: None,
            on_file_completed: None,
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Called after every chunk read
    pub fn on_progress(mut self, f: impl Fn(&ImportProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Called when each file completes or fails
    pub fn on_file_completed(mut self, f: impl Fn(&FileCompleted<'_>) + Send + Sync + 'static) -> Self {
        self.on_file_completed = Some(Box::new(f));
        self
    }

    /// Override the read chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Import the given files and directories.
    ///
    /// Directories are searched recursively for `.sql` files. A file that
    /// fails is recorded in the report and the remaining files are still
    /// imported. A path that does not exist fails the whole run before
    /// anything is submitted.
    pub async fn import<P: AsRef<Path>>(&self, paths: &[P]) -> Result<ImportReport> {
        let files = collect_sql_files(paths).await?;
        let total_files = files.len();
        tracing::info!("Importing {} file(s)", total_files);

        let mut report = ImportReport::default();
        for (index, file) in files.iter().enumerate() {
            let file_no = index + 1;
            let outcome = self.import_file(file, file_no, total_files).await;

            let (statements, error) = match outcome {
                Ok(statements) => (statements, None),
                Err((statements, error)) => (statements, Some(error)),
            };
            report.statements += statements;

            if let Some(f) = &self.on_file_completed {
                f(&FileCompleted {
                    total_files,
                    file_no,
                    file_path: &file.path,
                    error: error.as_ref(),
                });
            }

            match error {
                None => {
                    tracing::info!("Imported {} ({} statements)", file.path.display(), statements);
                    report.imported.push(file.path.clone());
                }
                Some(error) => {
                    tracing::error!("Import of {} failed: {}", file.path.display(), error);
                    report.failed.push(FailedImport {
                        path: file.path.clone(),
                        error,
                    });
                }
            }
        }

        Ok(report)
    }

    /// Stream one file through a fresh splitter. On failure returns the
    /// statements submitted before the error alongside it.
    async fn import_file(
        &self,
        file: &SqlFile,
        file_no: usize,
        total_files: usize,
    ) -> std::result::Result<usize, (usize, Error)> {
        let mut submitted = 0;
        let result = self
            .stream_file(file, file_no, total_files, &mut submitted)
            .await;
        match result {
            Ok(()) => Ok(submitted),
            Err(e) => Err((submitted, e)),
        }
    }

    async fn stream_file(
        &self,
        file: &SqlFile,
        file_no: usize,
        total_files: usize,
        submitted: &mut usize,
    ) -> Result<()> {
        let mut reader = tokio::fs::File::open(&file.path).await?;
        let mut splitter = StatementSplitter::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut pending: Vec<u8> = Vec::new();
        let mut bytes_processed = 0u64;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            bytes_processed += n as u64;
            pending.extend_from_slice(&buf[..n]);

            let text = take_utf8(&mut pending).map_err(|offset| Error::Import {
                path: file.path.display().to_string(),
                reason: format!(
                    "invalid UTF-8 at byte {}",
                    bytes_processed - (pending.len() - offset) as u64
                ),
            })?;

            for statement in splitter.feed(&text)? {
                self.sink.submit(statement.as_str()).await?;
                *submitted += 1;
            }

            if let Some(f) = &self.on_progress {
                f(&ImportProgress {
                    total_files,
                    file_no,
                    bytes_processed,
                    total_bytes: file.size,
                    file_path: file.path.clone(),
                });
            }
        }

        if !pending.is_empty() {
            return Err(Error::Import {
                path: file.path.display().to_string(),
                reason: "truncated UTF-8 sequence at end of file".into(),
            });
        }

        if let Some(statement) = splitter.finish()? {
            self.sink.submit(statement.as_str()).await?;
            *submitted += 1;
        }
        Ok(())
    }
}

/// Decode the longest valid UTF-8 prefix of `pending`, leaving an
/// incomplete trailing sequence in place. Returns the offset of an
/// invalid sequence.
fn take_utf8(pending: &mut Vec<u8>) -> std::result::Result<String, usize> {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(e) => return Err(e.valid_up_to()),
    };
    let rest = pending.split_off(valid);
    let text = String::from_utf8(std::mem::replace(pending, rest)).map_err(|e| e.utf8_error().valid_up_to())?;
    Ok(text)
}

/// Expand inputs into the `.sql` files to import, directories recursively
/// with entries in name order. Each directory is walked once, so symlink
/// cycles terminate.
async fn collect_sql_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<SqlFile>> {
    let mut files = Vec::new();
    let mut visited = HashSet::new();

    for path in paths {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await.map_err(|e| Error::Import {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        // Depth-first walk; the stack holds entries in reverse name order
        let mut stack = vec![(path.to_path_buf(), metadata)];
        while let Some((path, metadata)) = stack.pop() {
            if metadata.is_file() {
                if is_sql_file(&path) {
                    files.push(SqlFile {
                        size: metadata.len(),
                        path,
                    });
                }
            } else if metadata.is_dir() {
                if !visited.insert(tokio::fs::canonicalize(&path).await?) {
                    tracing::debug!("Skipping already visited directory {}", path.display());
                    continue;
                }
                let mut entries = Vec::new();
                let mut dir = tokio::fs::read_dir(&path).await?;
                while let Some(entry) = dir.next_entry().await? {
                    let entry_path = entry.path();
                    let metadata = tokio::fs::metadata(&entry_path).await?;
                    entries.push((entry_path, metadata));
                }
                entries.sort_by(|a, b| b.0.cmp(&a.0));
                stack.extend(entries);
            }
        }
    }

    Ok(files)
}

fn is_sql_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
}
