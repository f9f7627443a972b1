//! Checkpoint archives: a zip holding the segment manifest and every audio
//! payload synthesized so far.
//!
//! Layout:
//!
//! ```text
//! recover.json        manifest, segments in document order
//! audio/000000.mp3    payload of segment #0 (stored uncompressed)
//! audio/000003.mp3    ...
//! ```
//!
//! Archives are written to a sibling temp file and renamed into place, so an
//! existing checkpoint is only ever replaced by a complete one.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use indicatif::ProgressBar;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{IoContext, PipelineError};
use crate::progress::progress_bar;
use crate::segment::{Segment, SegmentId};

const MANIFEST_ENTRY: &str = "recover.json";
const MANIFEST_VERSION: u32 = 1;
const MAX_MANIFEST_BYTES: u64 = 256 * 1024 * 1024;
const PAYLOAD_PREFIX: &str = "txt2mp3-";
pub const PAYLOAD_SUFFIX: &str = ".mp3";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    segments: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    id: SegmentId,
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    audio: Option<PayloadInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PayloadInfo {
    sha256: String,
    bytes: u64,
}

/// Writes `segments` and their existing payloads to `archive_path`.
///
/// With `delete_audio_after_pack`, standalone payload files are removed once the
/// new archive is in place.
pub fn save(
    segments: &[Segment],
    archive_path: &Path,
    delete_audio_after_pack: bool,
    show_progress: bool,
) -> Result<(), PipelineError> {
    let dir = match archive_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = tempfile::Builder::new()
        .prefix(".txt2mp3-checkpoint-")
        .tempfile_in(dir)
        .io_context(|| format!("failed creating temp archive in {}", dir.display()))?;

    let progress = progress_bar(segments.len() as u64, "Packing", show_progress);
    let packed = write_archive(segments, temp.as_file_mut(), &progress)
        .io_context(|| format!("failed writing checkpoint {}", archive_path.display()))?;
    progress.finish_and_clear();
    temp.as_file()
        .sync_all()
        .io_context(|| format!("failed syncing checkpoint {}", archive_path.display()))?;
    temp.persist(archive_path)
        .map_err(|err| err.error)
        .io_context(|| format!("failed replacing checkpoint {}", archive_path.display()))?;

    if delete_audio_after_pack {
        for path in &packed {
            if let Err(err) = fs::remove_file(path) {
                warn!("could not remove packed payload {}: {err}", path.display());
            }
        }
    }

    info!(
        "checkpoint saved to {} ({} segments, {} with audio)",
        archive_path.display(),
        segments.len(),
        packed.len()
    );
    Ok(())
}

/// Returns the payload files that were packed.
fn write_archive(
    segments: &[Segment],
    file: &mut File,
    progress: &ProgressBar,
) -> io::Result<Vec<PathBuf>> {
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let mut entries = Vec::with_capacity(segments.len());
    let mut packed = Vec::new();

    for segment in segments {
        progress.inc(1);
        let audio = match segment.audio() {
            Some(path) if path.is_file() => {
                let bytes = fs::read(path)?;
                let options = entry_options(CompressionMethod::Stored);
                zip.start_file(segment.id().payload_entry(), options)?;
                zip.write_all(&bytes)?;
                packed.push(path.to_path_buf());
                Some(PayloadInfo {
                    sha256: sha256_hex(&bytes),
                    bytes: bytes.len() as u64,
                })
            }
            Some(path) => {
                warn!(
                    "payload of segment {} is missing at {}, it will be synthesized again",
                    segment.id(),
                    path.display()
                );
                None
            }
            None => None,
        };
        entries.push(ManifestEntry {
            id: segment.id(),
            text: segment.text().to_string(),
            audio,
        });
    }

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        segments: entries,
    };
    zip.start_file(MANIFEST_ENTRY, entry_options(CompressionMethod::Deflated))?;
    serde_json::to_writer(&mut zip, &manifest)?;

    zip.finish()?.flush()?;
    Ok(packed)
}

fn entry_options(method: CompressionMethod) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(method)
        .unix_permissions(0o600)
}

/// Reads a checkpoint, extracting each payload into a fresh file under
/// `scratch_dir`. Nothing is left in `scratch_dir` when loading fails.
pub fn load(
    archive_path: &Path,
    scratch_dir: &Path,
    show_progress: bool,
) -> Result<Vec<Segment>, PipelineError> {
    let file = File::open(archive_path)
        .io_context(|| format!("failed opening checkpoint {}", archive_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|err| PipelineError::corrupt(archive_path, format!("not a zip archive: {err}")))?;

    let manifest = read_manifest(&mut archive, archive_path)?;
    if manifest.version != MANIFEST_VERSION {
        return Err(PipelineError::corrupt(
            archive_path,
            format!("unsupported manifest version {}", manifest.version),
        ));
    }

    let progress = progress_bar(manifest.segments.len() as u64, "Unpacking", show_progress);
    let mut segments = Vec::with_capacity(manifest.segments.len());
    let unpacked = unpack_segments(
        &mut archive,
        archive_path,
        manifest.segments,
        scratch_dir,
        &progress,
        &mut segments,
    );
    if let Err(err) = unpacked {
        progress.abandon();
        discard_payloads(&segments);
        return Err(err);
    }
    progress.finish_and_clear();

    info!(
        "checkpoint loaded from {} ({} segments, {} with audio)",
        archive_path.display(),
        segments.len(),
        segments.iter().filter(|s| s.audio().is_some()).count()
    );
    Ok(segments)
}

/// Pushes each restored segment onto `segments` as soon as its payload is out.
fn unpack_segments(
    archive: &mut ZipArchive<File>,
    archive_path: &Path,
    entries: Vec<ManifestEntry>,
    scratch_dir: &Path,
    progress: &ProgressBar,
    segments: &mut Vec<Segment>,
) -> Result<(), PipelineError> {
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in entries {
        progress.inc(1);
        if !seen.insert(entry.id) {
            return Err(PipelineError::corrupt(
                archive_path,
                format!("duplicate segment id {}", entry.id),
            ));
        }
        let audio = match &entry.audio {
            Some(info) => Some(extract_payload(
                archive,
                archive_path,
                entry.id,
                info,
                scratch_dir,
            )?),
            None => None,
        };
        segments.push(Segment::with_audio(entry.id, entry.text, audio));
    }
    Ok(())
}

fn discard_payloads(segments: &[Segment]) {
    for path in segments.iter().filter_map(Segment::audio) {
        if let Err(err) = fs::remove_file(path) {
            warn!("could not remove extracted payload {}: {err}", path.display());
        }
    }
}

fn read_manifest(
    archive: &mut ZipArchive<File>,
    archive_path: &Path,
) -> Result<Manifest, PipelineError> {
    let entry = archive.by_name(MANIFEST_ENTRY).map_err(|_| {
        PipelineError::corrupt(archive_path, format!("missing {MANIFEST_ENTRY}"))
    })?;
    let mut raw = Vec::new();
    entry
        .take(MAX_MANIFEST_BYTES + 1)
        .read_to_end(&mut raw)
        .map_err(|err| PipelineError::corrupt(archive_path, format!("unreadable manifest: {err}")))?;
    if raw.len() as u64 > MAX_MANIFEST_BYTES {
        return Err(PipelineError::corrupt(archive_path, "manifest is too large"));
    }
    serde_json::from_slice(&raw)
        .map_err(|err| PipelineError::corrupt(archive_path, format!("malformed manifest: {err}")))
}

fn extract_payload(
    archive: &mut ZipArchive<File>,
    archive_path: &Path,
    id: SegmentId,
    info: &PayloadInfo,
    scratch_dir: &Path,
) -> Result<PathBuf, PipelineError> {
    let name = id.payload_entry();
    let mut entry = archive.by_name(&name).map_err(|_| {
        PipelineError::corrupt(archive_path, format!("payload {name} is missing"))
    })?;

    let mut bytes = Vec::new();
    (&mut entry)
        .take(info.bytes.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|err| PipelineError::corrupt(archive_path, format!("unreadable {name}: {err}")))?;
    if bytes.len() as u64 != info.bytes {
        return Err(PipelineError::corrupt(
            archive_path,
            format!("{name} holds {} bytes, manifest says {}", bytes.len(), info.bytes),
        ));
    }
    if sha256_hex(&bytes) != info.sha256 {
        return Err(PipelineError::corrupt(
            archive_path,
            format!("{name} does not match its checksum"),
        ));
    }

    write_payload(scratch_dir, &bytes)
        .io_context(|| format!("failed extracting {name} into {}", scratch_dir.display()))
}

/// Stores audio bytes in a new file under `scratch_dir` that outlives this call.
pub fn write_payload(scratch_dir: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix(PAYLOAD_PREFIX)
        .suffix(PAYLOAD_SUFFIX)
        .tempfile_in(scratch_dir)?;
    file.write_all(bytes)?;
    file.flush()?;
    let (_, path) = file.keep().map_err(|err| err.error)?;
    Ok(path)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
