use anyhow::{Context, Result};
use audit_core::{ensure_dir, Record};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Output destination for collected records. Only the writer thread holds one.
pub trait RecordSink {
    fn append_record(&mut self, record: &Record) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Appends one JSON object per line. Successive blocks share the file.
pub struct JsonlRecordSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlRecordSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir(parent)?;
        }
        let writer = open_append(path)
            .with_context(|| format!("failed to open output {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for JsonlRecordSink {
    fn append_record(&mut self, record: &Record) -> Result<()> {
        append_row(&mut self.writer, record)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}
