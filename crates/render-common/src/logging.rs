// TaskLogger: keeps a local copy of every task's log on disk.
// Lines are prefixed with a UTC timestamp and written to paged files
// `<task_id>_<page>.log`, starting a new page every PAGE_SIZE bytes.

use crate::secret_masker::SecretMasker;
use anyhow::{Context, Result};
use chrono::Utc;
use render_sdk::StringUtil;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Maximum size of a single log page in bytes (8 MiB).
pub const PAGE_SIZE: usize = 8 * 1024 * 1024;

/// Writes one task's log lines to paged files.
pub struct TaskLogger {
    task_id: String,
    folder: PathBuf,
    secret_masker: Arc<SecretMasker>,
    page_size: usize,

    page_writer: Option<BufWriter<File>>,
    page_byte_count: usize,
    page_count: u32,

    total_lines: u64,
}

impl TaskLogger {
    /// Create a logger for `task_id` writing below `folder`. The folder is
    /// created if needed; page files are created lazily on first write.
    pub fn new(folder: &Path, task_id: &str, secret_masker: Arc<SecretMasker>) -> Result<Self> {
        fs::create_dir_all(folder)
            .with_context(|| format!("Failed to create task log folder {:?}", folder))?;

        Ok(Self {
            task_id: StringUtil::format_into_safe_filename(task_id),
            folder: folder.to_path_buf(),
            secret_masker,
            page_size: PAGE_SIZE,
            page_writer: None,
            page_byte_count: 0,
            page_count: 0,
            total_lines: 0,
        })
    }

    #[cfg(test)]
    fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    /// Path of page `page` (1-based) of this task's log.
    pub fn page_path(&self, page: u32) -> PathBuf {
        self.folder.join(format!("{}_{}.log", self.task_id, page))
    }

    /// Write one line, masked and timestamped.
    pub fn write(&mut self, message: &str) {
        if self.page_writer.is_none() {
            self.new_page();
        }

        let masked = self.secret_masker.mask_secrets(message);
        let line = format!("{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"), masked);

        if let Some(ref mut writer) = self.page_writer {
            if let Err(e) = writeln!(writer, "{}", line) {
                tracing::warn!("Failed to write task log line: {}", e);
            }
        }

        self.total_lines += 1 + masked.matches('\n').count() as u64;
        self.page_byte_count += line.len() + 1;

        if self.page_byte_count >= self.page_size {
            self.new_page();
        }
    }

    /// Flush buffered output to disk.
    pub fn flush(&mut self) {
        if let Some(ref mut writer) = self.page_writer {
            let _ = writer.flush();
        }
    }

    /// Flush and close the current page.
    pub fn end(&mut self) {
        if let Some(mut writer) = self.page_writer.take() {
            let _ = writer.flush();
        }
    }

    fn new_page(&mut self) {
        self.end();
        self.page_byte_count = 0;
        self.page_count += 1;

        let path = self.page_path(self.page_count);
        match File::create(&path) {
            Ok(file) => self.page_writer = Some(BufWriter::new(file)),
            Err(e) => tracing::error!("Failed to create task log page {:?}: {}", path, e),
        }
    }
}

impl Drop for TaskLogger {
    fn drop(&mut self) {
        self.end();
    }
}
