//! Image archives: extraction into lower layers and container commits.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use keg_common::{KegError, KegPaths, KegResult};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// First existing archive for `image`: `<image>.tar`, then `<image>.tar.gz`.
#[must_use]
pub fn find_archive(paths: &KegPaths, image: &str) -> Option<PathBuf> {
    paths
        .image_archives(image)
        .into_iter()
        .find(|path| path.is_file())
}

/// Make sure the image's lower layer is extracted and return its path.
///
/// An existing layer directory is reused as is. A failed extraction
/// removes the partial layer.
///
/// # Errors
///
/// Returns an error if no archive exists or extraction fails.
pub fn ensure_lower(paths: &KegPaths, image: &str) -> KegResult<PathBuf> {
    let layer = paths.image_layer(image);
    if layer.is_dir() {
        tracing::debug!(image, layer = %layer.display(), "Reusing extracted image");
        return Ok(layer);
    }

    let archive = find_archive(paths, image).ok_or_else(|| KegError::Config {
        message: format!(
            "no archive for image {image} in {}",
            paths.images().display()
        ),
    })?;

    std::fs::create_dir_all(&layer)?;
    if let Err(e) = extract(&archive, &layer) {
        if let Err(cleanup) = std::fs::remove_dir_all(&layer) {
            tracing::warn!(layer = %layer.display(), error = %cleanup, "Failed to remove partial layer");
        }
        return Err(e);
    }

    tracing::info!(image, archive = %archive.display(), "Image extracted");
    Ok(layer)
}

/// Unpack a plain, gzip or zstd tarball into `dest`.
///
/// # Errors
///
/// Returns an error if the archive cannot be read or unpacked.
pub fn extract(archive: &Path, dest: &Path) -> KegResult<()> {
    tracing::debug!(archive = %archive.display(), dest = %dest.display(), "Extracting archive");

    let mut file = BufReader::new(File::open(archive)?);
    let (gzip, zstd) = {
        let head = file.fill_buf()?;
        (head.starts_with(&GZIP_MAGIC), head.starts_with(&ZSTD_MAGIC))
    };
    let reader: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(file))
    } else if zstd {
        Box::new(zstd::stream::read::Decoder::with_buffer(file)?)
    } else {
        Box::new(file)
    };

    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    tar.set_preserve_ownerships(rustix::process::geteuid().is_root());
    tar.set_unpack_xattrs(true);
    tar.unpack(dest)?;
    Ok(())
}

/// Pack `root` into a gzip tarball at `dest`.
///
/// # Errors
///
/// Returns an error if `root` is missing or the archive cannot be written.
pub fn commit(root: &Path, dest: &Path) -> KegResult<()> {
    if !root.is_dir() {
        return Err(KegError::Config {
            message: format!("{} is not a directory", root.display()),
        });
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", root)?;
    builder.into_inner()?.finish()?;

    tracing::info!(root = %root.display(), archive = %dest.display(), "Committed image");
    Ok(())
}
