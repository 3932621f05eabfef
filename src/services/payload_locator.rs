use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use zip::ZipArchive;

use crate::errors::{Result, UpdaterError};

pub const PAYLOAD_BIN_PATH: &str = "payload.bin";
pub const PAYLOAD_PROPERTIES_PATH: &str = "payload_properties.txt";

// Each entry has a local header of (30 + n + m) bytes, where n is the
// length of the entry name and m the length of the extra field. The fixed
// 30 bytes are a property of the ZIP local header layout.
const FIXED_HEADER_SIZE: u64 = 30;

/// Absolute byte offset of `entry_name`'s compressed data inside the
/// container, computed by walking the entries in order. The offset lets a
/// privileged applier read the payload in place instead of extracting a
/// multi-gigabyte archive.
pub fn locate(container: &Path, entry_name: &str) -> Result<u64> {
    let file = File::open(container)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    let mut offset: u64 = 0;
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        let header_size =
            FIXED_HEADER_SIZE + entry.name_raw().len() as u64 + entry.extra_data().len() as u64;
        offset += header_size;
        if entry.name() == entry_name {
            return Ok(offset);
        }
        offset += entry.compressed_size();
    }
    tracing::error!("entry {entry_name} not found in {}", container.display());
    Err(UpdaterError::EntryNotFound(entry_name.to_string()))
}

/// A package supports the streaming install path when it carries both the
/// raw payload and its properties entry.
pub fn is_streaming_update(container: &Path) -> Result<bool> {
    let file = File::open(container)?;
    let archive = ZipArchive::new(BufReader::new(file))?;
    let mut has_payload = false;
    let mut has_properties = false;
    for name in archive.file_names() {
        match name {
            PAYLOAD_BIN_PATH => has_payload = true,
            PAYLOAD_PROPERTIES_PATH => has_properties = true,
            _ => {}
        }
    }
    Ok(has_payload && has_properties)
}

/// The key=value header lines the applier needs alongside the payload
/// offset.
pub fn read_payload_properties(container: &Path) -> Result<Vec<String>> {
    let file = File::open(container)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    let entry = archive.by_name(PAYLOAD_PROPERTIES_PATH).map_err(|_| {
        UpdaterError::EntryNotFound(PAYLOAD_PROPERTIES_PATH.to_string())
    })?;
    let mut lines = Vec::new();
    for line in BufReader::new(entry).lines() {
        let line = line?;
        if !line.is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Test helper shared with the orchestrator tests: a stored-entry container
/// written to `path`.
#[cfg(test)]
pub(crate) fn build_container(path: &Path, entries: &[(&str, &[u8])]) {
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;
    use zip::{CompressionMethod, ZipWriter};

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, contents) in entries {
        writer.start_file(*name, options).expect("start entry");
        writer.write_all(contents).expect("write entry");
    }
    let cursor = writer.finish().expect("finish archive");
    std::fs::write(path, cursor.into_inner()).expect("write container");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_container(entries: &[(&str, &[u8])]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ota-updater-zip-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("container.zip");
        build_container(&path, entries);
        path
    }

    fn header_size(name: &str) -> u64 {
        FIXED_HEADER_SIZE + name.len() as u64
    }

    #[test]
    fn offset_accumulates_preceding_headers_and_data() {
        let a = vec![1_u8; 100];
        let b = vec![2_u8; 50];
        let c = vec![3_u8; 10];
        let path = temp_container(&[("alpha", &a), ("beta", &b), ("gamma", &c)]);

        // Entries written without extra fields: the offset of `beta`'s data
        // is exactly headerSize(alpha) + len(alpha) + headerSize(beta).
        let offset = locate(&path, "beta").expect("locate");
        assert_eq!(offset, header_size("alpha") + 100 + header_size("beta"));

        // The bytes at the computed offset are the entry's stored data.
        let mut file = File::open(&path).expect("open");
        file.seek(SeekFrom::Start(offset)).expect("seek");
        let mut data = vec![0_u8; 50];
        file.read_exact(&mut data).expect("read");
        assert_eq!(data, b);
        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn missing_entry_is_reported() {
        let path = temp_container(&[("alpha", b"data")]);
        let result = locate(&path, "missing");
        assert!(matches!(result, Err(UpdaterError::EntryNotFound(name)) if name == "missing"));
        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn streaming_probe_requires_both_entries() {
        let full = temp_container(&[
            (PAYLOAD_BIN_PATH, b"raw payload".as_slice()),
            (PAYLOAD_PROPERTIES_PATH, b"FILE_HASH=abc\n".as_slice()),
        ]);
        assert!(is_streaming_update(&full).expect("probe"));
        let _ = std::fs::remove_dir_all(full.parent().expect("parent"));

        let partial = temp_container(&[(PAYLOAD_BIN_PATH, b"raw payload".as_slice())]);
        assert!(!is_streaming_update(&partial).expect("probe"));
        let _ = std::fs::remove_dir_all(partial.parent().expect("parent"));
    }

    #[test]
    fn properties_read_as_header_lines() {
        let path = temp_container(&[
            (PAYLOAD_BIN_PATH, b"raw payload".as_slice()),
            (
                PAYLOAD_PROPERTIES_PATH,
                b"FILE_HASH=abc\nFILE_SIZE=1000\n".as_slice(),
            ),
        ]);
        let lines = read_payload_properties(&path).expect("read properties");
        assert_eq!(lines, vec!["FILE_HASH=abc", "FILE_SIZE=1000"]);
        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }
}
