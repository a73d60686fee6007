//! Zip-backed document container.
//!
//! A container holds `metadata.json` (required), `content.pdf` (optional) and
//! `format.json` (`{"formatVersion": N}`). Members are stored uncompressed and
//! written in a fixed order with a fixed timestamp, so identical inputs give
//! identical bytes.

use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Seek, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::AppError;

pub const METADATA_MEMBER: &str = "metadata.json";
pub const PAYLOAD_MEMBER: &str = "content.pdf";
pub const FORMAT_MEMBER: &str = "format.json";
pub const CURRENT_FORMAT_VERSION: u32 = 2;

const ZIP_LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE: &[u8] = b"PK\x05\x06";
const STAGING_PREFIX: &str = ".folio-staging-";
/// Upper bound on the buffer reserved from a member's declared size.
const MAX_PREALLOC: u64 = 64 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveContents {
    pub metadata: Vec<u8>,
    pub payload: Option<Vec<u8>>,
    pub format_version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FormatInfo {
    format_version: u32,
}

pub fn is_container(bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_LOCAL_HEADER) || bytes.starts_with(ZIP_EMPTY_ARCHIVE)
}

/// Builds the container next to `destination` and renames it into place.
///
/// Readers of `destination` see either the previous file or the complete new
/// one. The staging file is removed on every failure path.
pub fn write_archive(
    metadata: &[u8],
    payload: Option<&[u8]>,
    destination: &Path,
    format_version: u32,
) -> Result<(), AppError> {
    let parent = staging_dir_for(destination);
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(parent)
        .map_err(|e| {
            AppError::ArchiveWriteFailed(format!("cannot stage in {}: {e}", parent.display()))
        })?;

    write_members(staging.as_file(), metadata, payload, format_version)?;
    staging.as_file().sync_all()?;
    harden_permissions(staging.path())?;

    staging.persist(destination).map_err(|e| {
        AppError::ArchiveWriteFailed(format!(
            "cannot replace {}: {}",
            destination.display(),
            e.error
        ))
    })?;
    harden_permissions(destination)?;
    Ok(())
}

fn write_members(
    file: &File,
    metadata: &[u8],
    payload: Option<&[u8]>,
    format_version: u32,
) -> Result<(), AppError> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o600);
    let format = serde_json::to_vec(&FormatInfo { format_version })?;

    let mut zip = ZipWriter::new(file);
    zip.start_file(METADATA_MEMBER, options)?;
    zip.write_all(metadata)?;
    if let Some(payload) = payload {
        zip.start_file(PAYLOAD_MEMBER, options)?;
        zip.write_all(payload)?;
    }
    zip.start_file(FORMAT_MEMBER, options)?;
    zip.write_all(&format)?;
    zip.finish()?;
    Ok(())
}

pub fn read_archive(source: &Path) -> Result<ArchiveContents, AppError> {
    let file = File::open(source)?;
    read_contents(ZipArchive::new(BufReader::new(file))?)
}

pub fn read_archive_bytes(bytes: &[u8]) -> Result<ArchiveContents, AppError> {
    read_contents(ZipArchive::new(Cursor::new(bytes))?)
}

pub fn read_metadata_only(source: &Path) -> Result<Vec<u8>, AppError> {
    let file = File::open(source)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    read_member(&mut archive, METADATA_MEMBER)?.ok_or(AppError::MissingMetadata)
}

pub fn read_metadata_only_bytes(bytes: &[u8]) -> Result<Vec<u8>, AppError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    read_member(&mut archive, METADATA_MEMBER)?.ok_or(AppError::MissingMetadata)
}

/// Stages `bytes` next to `destination` and renames the result into place.
pub fn write_file_atomically(destination: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let mut out = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(staging_dir_for(destination))?;
    out.write_all(bytes)?;
    out.as_file().sync_all()?;
    out.persist(destination).map_err(|e| AppError::Io(e.error))?;
    Ok(())
}

/// Streams the payload member into `destination`. Returns `false` when the
/// container has no payload.
pub fn extract_payload(source: &Path, destination: &Path) -> Result<bool, AppError> {
    let file = File::open(source)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    let mut entry = match archive.by_name(PAYLOAD_MEMBER) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let mut out = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(staging_dir_for(destination))?;
    std::io::copy(&mut entry, &mut out)?;
    out.flush()?;
    out.as_file().sync_all()?;
    out.persist(destination).map_err(|e| AppError::Io(e.error))?;
    Ok(true)
}

fn read_contents<R: Read + Seek>(mut archive: ZipArchive<R>) -> Result<ArchiveContents, AppError> {
    let metadata = read_member(&mut archive, METADATA_MEMBER)?.ok_or(AppError::MissingMetadata)?;
    let payload = read_member(&mut archive, PAYLOAD_MEMBER)?;
    let format_version = match read_member(&mut archive, FORMAT_MEMBER)? {
        Some(bytes) => {
            serde_json::from_slice::<FormatInfo>(&bytes)
                .map_err(|e| AppError::InvalidFormatInfo(e.to_string()))?
                .format_version
        }
        None => CURRENT_FORMAT_VERSION,
    };

    Ok(ArchiveContents {
        metadata,
        payload,
        format_version,
    })
}

fn read_member<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>, AppError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = Vec::with_capacity(prealloc_hint(entry.size()));
    entry.read_to_end(&mut buf)?;
    Ok(Some(buf))
}

/// Member sizes come from the zip headers and are not trusted.
fn prealloc_hint(declared: u64) -> usize {
    declared.min(MAX_PREALLOC) as usize
}

fn staging_dir_for(destination: &Path) -> &Path {
    match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn harden_permissions(path: &Path) -> Result<(), AppError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn harden_permissions(path: &Path) -> Result<(), AppError> {
    fs::metadata(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PDF_MAGIC: &[u8] = b"\x25\x50\x44\x46";

    fn zip_with(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, data) in members {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_round_trip_with_payload() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("doc.yianazip");

        write_archive(b"{\"a\":1}", Some(PDF_MAGIC), &dest, CURRENT_FORMAT_VERSION).unwrap();
        let contents = read_archive(&dest).unwrap();

        assert_eq!(contents.metadata, b"{\"a\":1}");
        assert_eq!(contents.payload.as_deref(), Some(PDF_MAGIC));
        assert_eq!(contents.format_version, CURRENT_FORMAT_VERSION);
    }

    #[test]
    fn test_absent_payload_reads_back_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("doc.yianazip");

        write_archive(b"{}", None, &dest, CURRENT_FORMAT_VERSION).unwrap();
        let contents = read_archive(&dest).unwrap();

        assert_eq!(contents.payload, None);
    }

    #[test]
    fn test_empty_payload_is_not_none() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("doc.yianazip");

        write_archive(b"{}", Some(b"".as_slice()), &dest, CURRENT_FORMAT_VERSION).unwrap();
        assert_eq!(read_archive(&dest).unwrap().payload, Some(Vec::new()));
    }

    #[test]
    fn test_overwrite_replaces_previous_container() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("doc.yianazip");

        write_archive(b"{\"v\":1}", Some(PDF_MAGIC), &dest, CURRENT_FORMAT_VERSION).unwrap();
        write_archive(b"{\"v\":2}", None, &dest, CURRENT_FORMAT_VERSION).unwrap();
        let contents = read_archive(&dest).unwrap();

        assert_eq!(contents.metadata, b"{\"v\":2}");
        assert!(contents.payload.is_none());
    }

    #[test]
    fn test_write_leaves_no_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("doc.yianazip");
        write_archive(b"{}", Some(PDF_MAGIC), &dest, CURRENT_FORMAT_VERSION).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["doc.yianazip".to_string()]);
    }

    #[test]
    fn test_write_into_missing_directory_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing").join("doc.yianazip");

        let err = write_archive(b"{}", None, &dest, CURRENT_FORMAT_VERSION).unwrap_err();
        assert!(matches!(err, AppError::ArchiveWriteFailed(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn test_identical_inputs_give_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.yianazip");
        let b = dir.path().join("b.yianazip");

        write_archive(b"{\"x\":true}", Some(PDF_MAGIC), &a, CURRENT_FORMAT_VERSION).unwrap();
        write_archive(b"{\"x\":true}", Some(PDF_MAGIC), &b, CURRENT_FORMAT_VERSION).unwrap();

        assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_written_archive_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("doc.yianazip");
        write_archive(b"{}", None, &dest, CURRENT_FORMAT_VERSION).unwrap();

        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_metadata_is_an_error() {
        let bytes = zip_with(&[(PAYLOAD_MEMBER, PDF_MAGIC)]);
        assert!(matches!(
            read_archive_bytes(&bytes),
            Err(AppError::MissingMetadata)
        ));
    }

    #[test]
    fn test_missing_format_defaults_to_current() {
        let bytes = zip_with(&[(METADATA_MEMBER, b"{}".as_slice())]);
        let contents = read_archive_bytes(&bytes).unwrap();
        assert_eq!(contents.format_version, CURRENT_FORMAT_VERSION);
        assert!(contents.payload.is_none());
    }

    #[test]
    fn test_undecodable_format_info_is_rejected() {
        let bytes = zip_with(&[(METADATA_MEMBER, b"{}".as_slice()), (FORMAT_MEMBER, b"not json".as_slice())]);
        assert!(matches!(
            read_archive_bytes(&bytes),
            Err(AppError::InvalidFormatInfo(_))
        ));
    }

    #[test]
    fn test_older_format_version_is_reported() {
        let bytes = zip_with(&[
            (METADATA_MEMBER, b"{}".as_slice()),
            (FORMAT_MEMBER, b"{\"formatVersion\":1}".as_slice()),
        ]);
        assert_eq!(read_archive_bytes(&bytes).unwrap().format_version, 1);
    }

    #[test]
    fn test_read_metadata_only() {
        let bytes = zip_with(&[(METADATA_MEMBER, b"{\"m\":1}".as_slice()), (PAYLOAD_MEMBER, PDF_MAGIC)]);
        assert_eq!(read_metadata_only_bytes(&bytes).unwrap(), b"{\"m\":1}");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.yianazip");
        fs::write(&path, &bytes).unwrap();
        assert_eq!(read_metadata_only(&path).unwrap(), b"{\"m\":1}");
    }

    #[test]
    fn test_extract_payload_streams_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("doc.yianazip");
        let out = dir.path().join("content.pdf");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        write_archive(b"{}", Some(payload.as_slice()), &source, CURRENT_FORMAT_VERSION).unwrap();

        assert!(extract_payload(&source, &out).unwrap());
        assert_eq!(fs::read(&out).unwrap(), payload);
    }

    #[test]
    fn test_extract_payload_without_payload() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("doc.yianazip");
        let out = dir.path().join("content.pdf");
        write_archive(b"{}", None, &source, CURRENT_FORMAT_VERSION).unwrap();

        assert!(!extract_payload(&source, &out).unwrap());
        assert!(!out.exists());
    }

    #[test]
    fn test_declared_member_size_is_capped() {
        assert_eq!(prealloc_hint(12), 12);
        assert_eq!(prealloc_hint(u64::MAX), MAX_PREALLOC as usize);
    }

    #[test]
    fn test_atomic_write_replaces_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        write_file_atomically(&path, b"first").unwrap();
        write_file_atomically(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("out.bin")]);
        assert!(write_file_atomically(&dir.path().join("missing/out.bin"), b"x").is_err());
    }

    #[test]
    fn test_container_probe() {
        assert!(is_container(&zip_with(&[(METADATA_MEMBER, b"{}".as_slice())])));
        assert!(!is_container(b"{\"title\":\"x\"}"));
    }
}
