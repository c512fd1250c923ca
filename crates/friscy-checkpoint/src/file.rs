use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::info;

use crate::error::{CheckpointError, Result};
use crate::{check_saveable, load_checkpoint, save_checkpoint, CheckpointSource, CheckpointTarget};
use crate::{LoadStats, SaveOptions, SaveStats};

/// Write a checkpoint to `path`, replacing it atomically.
///
/// The blob goes to a temporary file next to `path` that is renamed over it only once fully
/// written and synced. A refused or failed save leaves any existing file at `path` as it was.
pub fn save_checkpoint_file<S: CheckpointSource + ?Sized>(
    path: impl AsRef<Path>,
    source: &S,
    options: SaveOptions,
) -> Result<SaveStats> {
    let path = path.as_ref();
    check_saveable(source, options)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut w = BufWriter::new(NamedTempFile::new_in(dir)?);
    let stats = save_checkpoint(&mut w, source, options)?;
    w.flush()?;
    let tmp = w.into_inner().map_err(|err| err.into_error())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;

    info!(path = %path.display(), bytes = stats.total_bytes, "checkpoint written");
    Ok(stats)
}

pub fn load_checkpoint_file<T: CheckpointTarget + ?Sized>(
    path: impl AsRef<Path>,
    target: &mut T,
) -> Result<LoadStats> {
    let path = path.as_ref();
    let mut file = fs::File::open(path)?;
    let mut blob = reserve_blob(file.metadata()?.len())?;
    file.read_to_end(&mut blob)?;

    info!(path = %path.display(), bytes = blob.len(), "checkpoint read");
    load_checkpoint(&blob, target)
}

/// Allocate room for a whole blob up front, failing cleanly when the host cannot.
fn reserve_blob(file_len: u64) -> Result<Vec<u8>> {
    let len = usize::try_from(file_len)
        .map_err(|_| CheckpointError::OutOfMemory { len: usize::MAX })?;
    let mut blob = Vec::new();
    blob.try_reserve_exact(len)
        .map_err(|_| CheckpointError::OutOfMemory { len })?;
    Ok(blob)
}
