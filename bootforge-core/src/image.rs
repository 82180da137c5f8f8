//! Image preparation: existence and size checks, on-the-fly decompression
//! of `.gz`, `.xz` and `.zst` images, and checksum verification.

use crate::error::{ImagingError, Result};
use crate::operation::CancelFlag;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// Digest algorithms used by distribution checksum files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("sha256"),
            Self::Sha512 => f.write_str("sha512"),
        }
    }
}

/// An expected digest, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, hex: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex: hex.into().trim().to_ascii_lowercase(),
        }
    }
}

/// An image ready to be handed to the copy tool.
///
/// If the source was compressed, this holds the temporary file with the
/// decompressed data, which is deleted on drop.
#[derive(Debug)]
pub struct PreparedImage {
    path: PathBuf,
    size_bytes: u64,
    _temp_handle: Option<TempPath>,
}

impl PreparedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn is_temporary(&self) -> bool {
        self._temp_handle.is_some()
    }
}

impl AsRef<Path> for PreparedImage {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Whether `path` has an extension this module decompresses.
pub fn is_compressed(path: &Path) -> bool {
    matches!(extension(path).as_str(), "gz" | "gzip" | "xz" | "zst" | "zstd")
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Size of a plain image file. A missing or empty file is a
/// [`ImagingError::WriteFailed`].
pub fn image_size(path: &Path) -> Result<u64> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        ImagingError::write_failed(format!("image {} is not readable: {e}", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(ImagingError::write_failed(format!(
            "image {} is not a regular file",
            path.display()
        )));
    }
    if metadata.len() == 0 {
        return Err(ImagingError::write_failed(format!(
            "image {} is empty",
            path.display()
        )));
    }
    Ok(metadata.len())
}

/// Checks the image and decompresses it to a temporary file if necessary.
/// `on_progress` receives the number of decompressed bytes so far.
pub fn prepare<F>(input_path: &Path, cancel: &CancelFlag, mut on_progress: F) -> Result<PreparedImage>
where
    F: FnMut(u64),
{
    let size = image_size(input_path)?;
    let input_file = File::open(input_path)?;

    // Create a reader based on the file extension.
    let mut reader: Box<dyn Read> = match extension(input_path).as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(BufReader::new(input_file))),
        "xz" => Box::new(XzDecoder::new(BufReader::new(input_file))),
        "zst" | "zstd" => Box::new(ZstdDecoder::new(BufReader::new(input_file))?),
        _ => {
            return Ok(PreparedImage {
                path: input_path.to_path_buf(),
                size_bytes: size,
                _temp_handle: None,
            });
        }
    };

    log::info!("Decompressing {}", input_path.display());
    let mut temp_file = NamedTempFile::new()?;
    let mut total: u64 = 0;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = vec![0u8; BUFFER_SIZE];

        loop {
            cancel.check()?;

            let n = reader.read(&mut buffer).map_err(|e| {
                ImagingError::write_failed(format!(
                    "cannot decompress {}: {e}",
                    input_path.display()
                ))
            })?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            total += n as u64;
            on_progress(total);
        }
        writer.flush()?;
    }

    if total == 0 {
        return Err(ImagingError::write_failed(format!(
            "image {} decompresses to nothing",
            input_path.display()
        )));
    }

    let temp_path = temp_file.into_temp_path();
    log::info!("Decompressed {} bytes to {}", total, temp_path.display());
    Ok(PreparedImage {
        path: temp_path.to_path_buf(),
        size_bytes: total,
        _temp_handle: Some(temp_path),
    })
}

/// Hex digest of the file at `path`.
pub fn digest_file(path: &Path, algorithm: ChecksumAlgorithm, cancel: &CancelFlag) -> Result<String> {
    let mut file = File::open(path)?;
    match algorithm {
        ChecksumAlgorithm::Sha256 => hash_reader::<Sha256>(&mut file, cancel),
        ChecksumAlgorithm::Sha512 => hash_reader::<Sha512>(&mut file, cancel),
    }
}

fn hash_reader<D: Digest>(reader: &mut dyn Read, cancel: &CancelFlag) -> Result<String> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        cancel.check()?;
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}

/// Verifies `path` against `expected`. A mismatch is a
/// [`ImagingError::WriteFailed`], since the image must not be written.
pub fn verify_checksum(path: &Path, expected: &Checksum, cancel: &CancelFlag) -> Result<()> {
    let actual = digest_file(path, expected.algorithm, cancel)?;
    if actual == expected.hex {
        log::info!("{} checksum verified", expected.algorithm);
        Ok(())
    } else {
        Err(ImagingError::write_failed(format!(
            "{} checksum mismatch for {}: expected {}, got {actual}",
            expected.algorithm,
            path.display(),
            expected.hex
        )))
    }
}
