//! Payload encoding: gzip in-process, symmetric gpg as a subprocess.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::naming::Pipeline;
use crate::error::{Error, Result};
use crate::utils::command::{self, ProcessSpec, StdinSink};

pub const ENCRYPTION_KEY_VAR: &str = "BACKUP_ENCRYPTION_KEY";

/// A file being written that is deleted on drop unless committed.
pub struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            committed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn commit(mut self) -> PathBuf {
        self.committed = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed && !self.path.as_os_str().is_empty() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Symmetric encryption applied as the payload is written.
#[derive(Debug, Clone, Copy)]
pub struct Encryption<'a> {
    pub passphrase: &'a str,
    pub timeout_secs: u64,
}

/// Where encoded bytes land: the artifact file, or `gpg` writing it.
pub enum PayloadSink {
    File(BufWriter<File>),
    // Field order matters: the child is killed before its passphrase file goes.
    Gpg(StdinSink, tempfile::NamedTempFile),
}

impl PayloadSink {
    fn open(path: &Path, encryption: Option<Encryption<'_>>) -> Result<Self> {
        match encryption {
            None => {
                let file = File::create(path).map_err(|e| {
                    Error::internal_io(e.to_string(), Some(format!("create {}", path.display())))
                })?;
                Ok(PayloadSink::File(BufWriter::new(file)))
            }
            Some(encryption) => {
                let secret = passphrase_file(encryption.passphrase)?;
                let target = path.to_string_lossy().to_string();
                let spec = gpg_spec(
                    &secret,
                    &["--symmetric", "--cipher-algo", "AES256", "--output", &target],
                    encryption.timeout_secs,
                );
                let child = command::spawn_with_stdin(&spec)?;
                Ok(PayloadSink::Gpg(child, secret))
            }
        }
    }

    fn finish(self) -> Result<()> {
        match self {
            PayloadSink::File(mut w) => w
                .flush()
                .map_err(|e| Error::internal_io(e.to_string(), Some("finish backup payload".to_string()))),
            PayloadSink::Gpg(child, _secret) => child.finish().map(|_| ()),
        }
    }
}

impl Write for PayloadSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            PayloadSink::File(w) => w.write(buf),
            PayloadSink::Gpg(child, _) => child.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            PayloadSink::File(w) => w.flush(),
            PayloadSink::Gpg(child, _) => child.flush(),
        }
    }
}

/// Sink for a plain SQL stream, gzip-wrapped when compressing. Plaintext
/// never reaches the disk when encrypting.
pub enum PayloadWriter {
    Plain(PayloadSink),
    Gzip(GzEncoder<PayloadSink>),
}

impl PayloadWriter {
    pub fn create(path: &Path, compress: bool, encryption: Option<Encryption<'_>>) -> Result<Self> {
        let sink = PayloadSink::open(path, encryption)?;
        Ok(if compress {
            PayloadWriter::Gzip(GzEncoder::new(sink, Compression::default()))
        } else {
            PayloadWriter::Plain(sink)
        })
    }

    /// Flush every layer and close the file (or wait for gpg).
    pub fn finish(self) -> Result<()> {
        let sink = match self {
            PayloadWriter::Plain(sink) => sink,
            PayloadWriter::Gzip(gz) => gz.finish().map_err(|e| {
                Error::internal_io(e.to_string(), Some("finish gzip stream".to_string()))
            })?,
        };
        sink.finish()
    }
}

impl Write for PayloadWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            PayloadWriter::Plain(w) => w.write(buf),
            PayloadWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            PayloadWriter::Plain(w) => w.flush(),
            PayloadWriter::Gzip(w) => w.flush(),
        }
    }
}

/// Passphrase handed to gpg through a private temp file, never argv or the environment.
fn passphrase_file(passphrase: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()
        .map_err(|e| Error::internal_io(e.to_string(), Some("create passphrase file".to_string())))?;
    file.write_all(passphrase.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| Error::internal_io(e.to_string(), Some("write passphrase file".to_string())))?;
    Ok(file)
}

fn gpg_spec(secret: &tempfile::NamedTempFile, args: &[&str], timeout_secs: u64) -> ProcessSpec {
    ProcessSpec::new("gpg")
        .args(["--batch", "--yes", "--quiet", "--pinentry-mode", "loopback"])
        .arg("--passphrase-file")
        .arg(secret.path().to_string_lossy().to_string())
        .args(args.iter().copied())
        .timeout_secs(timeout_secs)
}

/// Decrypt fully before anything reads the payload, so a wrong passphrase or a
/// truncated file fails before the database is touched.
pub fn decrypt_file(source: &Path, target: &Path, passphrase: &str, timeout_secs: u64) -> Result<()> {
    let secret = passphrase_file(passphrase)?;
    let target = target.to_string_lossy().to_string();
    let source = source.to_string_lossy().to_string();
    command::execute_checked(&gpg_spec(
        &secret,
        &["--decrypt", "--output", &target, &source],
        timeout_secs,
    ))?;
    Ok(())
}

/// Plain SQL reader over an artifact plus whatever scratch space decoding needed.
pub struct DecodedPayload {
    reader: Box<dyn Read>,
    _scratch: Option<tempfile::TempDir>,
}

impl Read for DecodedPayload {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Open an artifact and undo its pipeline: decrypt to scratch space, then gunzip while streaming.
pub fn open_decoded(
    path: &Path,
    pipeline: Pipeline,
    passphrase: Option<&str>,
    timeout_secs: u64,
) -> Result<DecodedPayload> {
    let mut scratch = None;
    let mut source = path.to_path_buf();

    if pipeline.encrypted {
        let passphrase = passphrase.ok_or_else(|| {
            Error::precondition(format!(
                "{} is encrypted but {} is not set",
                path.display(),
                ENCRYPTION_KEY_VAR
            ))
        })?;
        let dir = tempfile::tempdir()
            .map_err(|e| Error::internal_io(e.to_string(), Some("create scratch directory".to_string())))?;
        let decrypted = dir.path().join("payload");
        decrypt_file(path, &decrypted, passphrase, timeout_secs)?;
        source = decrypted;
        scratch = Some(dir);
    }

    let file = File::open(&source).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("open {}", source.display())))
    })?;
    let buffered = BufReader::new(file);
    let reader: Box<dyn Read> = if pipeline.compressed {
        Box::new(GzDecoder::new(buffered))
    } else {
        Box::new(buffered)
    };

    Ok(DecodedPayload {
        reader,
        _scratch: scratch,
    })
}
