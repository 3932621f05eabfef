use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Pick a destination name that does not clobber an existing file by
/// appending the first free `-N` suffix before the extension.
pub fn append_sequential_number(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let (stem, extension) = match file_name.rfind('.') {
        Some(position) if position > 0 => file_name.split_at(position),
        _ => (file_name.as_str(), ""),
    };
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    for index in 1..u32::MAX {
        let candidate = parent.join(format!("{stem}-{index}{extension}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    path.to_path_buf()
}

pub fn unique_destination(path: PathBuf) -> PathBuf {
    if path.exists() {
        append_sequential_number(&path)
    } else {
        path
    }
}

/// Copy `src` to `dst` byte for byte, reporting integer-percent progress.
/// Returns `Ok(true)` when the interrupt flag stopped the copy early; the
/// caller is responsible for deleting the partial destination.
pub fn copy_with_progress(
    src: &Path,
    dst: &Path,
    interrupt: &AtomicBool,
    mut progress: impl FnMut(i32),
) -> io::Result<bool> {
    let mut reader = File::open(src)?;
    let total = reader.metadata()?.len();
    let mut writer = File::create(dst)?;
    let mut buffer = vec![0_u8; COPY_BUFFER_SIZE];
    let mut copied: u64 = 0;
    let mut last_percent = -1;
    loop {
        if interrupt.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read])?;
        copied += read as u64;
        if total > 0 {
            let percent = (copied.saturating_mul(100) / total).min(100) as i32;
            if percent != last_percent {
                last_percent = percent;
                progress(percent);
            }
        }
    }
    writer.sync_all()?;
    Ok(false)
}

/// Remove stale staging copies and any file the registry does not know
/// about from the download directory.
pub fn cleanup_download_dir(dir: &Path, uncrypt_ext: &str, known: &[PathBuf]) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_staging = path
            .file_name()
            .map(|name| name.to_string_lossy().ends_with(uncrypt_ext))
            .unwrap_or(false);
        if is_staging || !known.contains(&path) {
            tracing::debug!("deleting stale file {}", path.display());
            let _ = fs::remove_file(&path);
        }
    }
}

/// The privileged installer that picks the file up after reboot runs
/// outside this process and needs read access.
pub fn set_world_readable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_mode(0o644);
        fs::set_permissions(path, permissions)?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

pub fn readable_file_size(size: u64) -> String {
    const UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];
    if size == 0 {
        return "0 B".to_string();
    }
    let power = ((size as f64).ln() / 1024_f64.ln()).floor() as usize;
    let power = power.min(UNITS.len() - 1);
    let value = size as f64 / 1024_f64.powi(power as i32);
    if power <= 2 {
        format!("{} {}", value as u64, UNITS[power])
    } else {
        format!("{value:.2} {}", UNITS[power])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ota-updater-file-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn sequential_suffix_skips_existing_files() {
        let dir = temp_dir();
        fs::write(dir.join("ota.zip"), b"a").expect("write");
        fs::write(dir.join("ota-1.zip"), b"b").expect("write");

        let unique = unique_destination(dir.join("ota.zip"));
        assert_eq!(unique, dir.join("ota-2.zip"));

        let fresh = unique_destination(dir.join("fresh.zip"));
        assert_eq!(fresh, dir.join("fresh.zip"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn copy_reports_progress_and_honors_interrupt() {
        let dir = temp_dir();
        let src = dir.join("src.bin");
        let dst = dir.join("dst.bin");
        fs::write(&src, vec![7_u8; 4096]).expect("write src");

        let mut seen = Vec::new();
        let interrupted = copy_with_progress(&src, &dst, &AtomicBool::new(false), |p| {
            seen.push(p)
        })
        .expect("copy");
        assert!(!interrupted);
        assert_eq!(seen.last(), Some(&100));
        assert_eq!(fs::read(&dst).expect("read dst").len(), 4096);

        let interrupted = copy_with_progress(&src, &dst, &AtomicBool::new(true), |_| {})
            .expect("copy");
        assert!(interrupted);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn cleanup_removes_staging_and_unknown_files() {
        let dir = temp_dir();
        let known = dir.join("ota.zip");
        fs::write(&known, b"keep").expect("write");
        fs::write(dir.join("ota.zip.uncrypt"), b"stale").expect("write");
        fs::write(dir.join("orphan.zip"), b"stale").expect("write");

        cleanup_download_dir(&dir, ".uncrypt", &[known.clone()]);
        assert!(known.exists());
        assert!(!dir.join("ota.zip.uncrypt").exists());
        assert!(!dir.join("orphan.zip").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn readable_sizes() {
        assert_eq!(readable_file_size(0), "0 B");
        assert_eq!(readable_file_size(500), "500 B");
        assert_eq!(readable_file_size(2048), "2 kB");
        assert_eq!(readable_file_size(5 * 1024 * 1024 * 1024), "5.00 GB");
    }
}
