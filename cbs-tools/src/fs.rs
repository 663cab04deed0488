//! File system helper utilities.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{format_err, Context, Error};
use walkdir::WalkDir;

/// Size of a regular file in bytes.
pub fn file_size<P: AsRef<Path>>(path: P) -> Result<i64, Error> {
    let path = path.as_ref();
    let metadata = std::fs::metadata(path)
        .map_err(|err| format_err!("unable to stat {:?} - {}", path, err))?;
    Ok(metadata.len() as i64)
}

/// Read up to `len` bytes at `offset` from a regular file.
///
/// Returns less than `len` bytes only at the end of the file. An offset at or
/// past the end of the file yields an empty buffer.
pub fn read_chunk_at<P: AsRef<Path>>(path: P, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
    let path = path.as_ref();
    let file =
        File::open(path).map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;

    let mut buf = vec![0u8; len];
    let mut done = 0;
    while done < len {
        let count = file
            .read_at(&mut buf[done..], offset + done as u64)
            .map_err(|err| format_err!("read error on {:?} - {}", path, err))?;
        if count == 0 {
            break;
        }
        done += count;
    }
    buf.truncate(done);
    Ok(buf)
}

/// Rewrite a file in place: truncate it and write `data`.
///
/// Not crash atomic. Callers rely on a startup consistency pass instead of
/// rename games.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();
    std::fs::write(path, data).map_err(|err| format_err!("unable to write {:?} - {}", path, err))
}

/// List the names of all regular files directly inside `dir`.
///
/// Subdirectories are not descended into. Entries with non-UTF8 names are
/// skipped with a warning, matching the flat one-level layout the server
/// maintains.
pub fn scan_dir_filenames<P: AsRef<Path>>(dir: P) -> Result<Vec<String>, Error> {
    let dir = dir.as_ref();
    let mut names = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("unable to scan directory {:?}", dir))?;
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.file_name().to_str() {
            Some(name) => names.push(name.to_string()),
            None => log::warn!("skipping non-utf8 file name {:?}", entry.file_name()),
        }
    }
    Ok(names)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_read_chunk_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"0123456789").unwrap();

        assert_eq!(read_chunk_at(&path, 0, 4).unwrap(), b"0123");
        assert_eq!(read_chunk_at(&path, 6, 100).unwrap(), b"6789");
        assert_eq!(read_chunk_at(&path, 10, 4).unwrap(), b"");
        assert_eq!(file_size(&path).unwrap(), 10);
    }

    #[test]
    fn test_replace_file_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"something quite long").unwrap();

        replace_file(&path, b"short").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"short");
    }

    #[test]
    fn test_scan_dir_filenames() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("c"), b"").unwrap();

        let mut names = scan_dir_filenames(dir.path()).unwrap();
        names.sort();
        assert_eq!(names, ["a", "b"]);
    }
}
