//! ZIP64 archive construction for the Bundler.
//!
//! Archives are store-only: the payload is already-compressed scientific
//! data, and an uncompressed archive keeps member extraction a seek away on
//! tape-backed filesystems. Entry timestamps are fixed, so rebuilding a
//! bundle from the same input produces a byte-identical archive.
//!
//! The `zip` crate writes synchronously; every write hop runs on the
//! blocking pool, one file at a time, so archive construction never loads
//! more than a copy buffer into memory.

use std::fs::File;
use std::io::{self, Write};

use anyhow::Context;
use camino::Utf8Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

fn stored() -> FileOptions {
    // Default options carry a constant timestamp; only the method and the
    // ZIP64 threshold need to change.
    FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true)
}

pub struct ArchiveWriter {
    inner: Option<ZipWriter<File>>,
    entries: u64,
}

impl ArchiveWriter {
    /// Open a fresh archive at `path`. The caller removes stale instances
    /// first; an existing file here is an error.
    pub async fn create(path: &Utf8Path) -> anyhow::Result<Self> {
        let path = path.to_owned();
        let writer = tokio::task::spawn_blocking(move || {
            let file = File::options()
                .write(true)
                .create_new(true)
                .open(&path)
                .with_context(|| format!("creating archive {path}"))?;
            Ok::<_, anyhow::Error>(ZipWriter::new(file))
        })
        .await
        .context("archive create task panicked")??;
        Ok(Self {
            inner: Some(writer),
            entries: 0,
        })
    }

    /// Append one file under `entry_name`, returning the bytes written.
    pub async fn add_file(&mut self, source: &Utf8Path, entry_name: &str) -> anyhow::Result<u64> {
        let writer = self
            .inner
            .take()
            .context("archive writer already failed or finished")?;
        let source = source.to_owned();
        let entry_name = entry_name.to_string();
        let (writer, bytes) = tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            writer
                .start_file(entry_name.as_str(), stored())
                .with_context(|| format!("starting archive entry '{entry_name}'"))?;
            let mut file =
                File::open(&source).with_context(|| format!("opening {source} for bundling"))?;
            let bytes = io::copy(&mut file, &mut writer)
                .with_context(|| format!("writing {source} into the archive"))?;
            Ok::<_, anyhow::Error>((writer, bytes))
        })
        .await
        .context("archive write task panicked")??;
        self.inner = Some(writer);
        self.entries += 1;
        Ok(bytes)
    }

    /// Append raw bytes under `entry_name`; used for the manifest sidecar.
    pub async fn add_bytes(&mut self, data: Vec<u8>, entry_name: &str) -> anyhow::Result<()> {
        let writer = self
            .inner
            .take()
            .context("archive writer already failed or finished")?;
        let entry_name = entry_name.to_string();
        let writer = tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            writer
                .start_file(entry_name.as_str(), stored())
                .with_context(|| format!("starting archive entry '{entry_name}'"))?;
            writer
                .write_all(&data)
                .with_context(|| format!("writing '{entry_name}' into the archive"))?;
            Ok::<_, anyhow::Error>(writer)
        })
        .await
        .context("archive write task panicked")??;
        self.inner = Some(writer);
        self.entries += 1;
        Ok(())
    }

    /// Write the central directory and close the archive. Returns the number
    /// of entries written, the sidecar included.
    pub async fn finish(mut self) -> anyhow::Result<u64> {
        let writer = self
            .inner
            .take()
            .context("archive writer already failed or finished")?;
        tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            writer.finish().context("finishing the archive")?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("archive finish task panicked")??;
        Ok(self.entries)
    }
}
