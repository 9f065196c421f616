use std::fs;
use std::io::Read;
use std::path::Path;

use filetime::FileTime;

use crate::error::{Error, ErrorKind, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn copy_err(what: &str, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::new(
        ErrorKind::Copy,
        format!("failed to {what} {}: {e}", path.display()),
    )
}

/// Copies `src` into `dst`, recreating symlinks and keeping modification times.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    let mut files = 0u64;
    let mut dirs = Vec::new();
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| copy_err("walk", src, e))?;
        let p = entry.path();
        let rel = p
            .strip_prefix(src)
            .map_err(|e| copy_err("relativize", p, e))?;
        let out = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&out).map_err(|e| copy_err("create", &out, e))?;
            dirs.push((p.to_path_buf(), out));
        } else if ft.is_symlink() {
            copy_symlink(p, &out)?;
        } else {
            copy_file(p, &out)?;
            files += 1;
        }
    }
    // Directory mtimes change as children land; stamp them last, deepest first.
    for (from, to) in dirs.iter().rev() {
        preserve_mtime(from, to)?;
    }
    Ok(files)
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| copy_err("create", parent, e))?;
    }
    fs::copy(src, dst).map_err(|e| copy_err("copy", src, e))?;
    preserve_mtime(src, dst)
}

fn preserve_mtime(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::metadata(src).map_err(|e| copy_err("stat", src, e))?;
    let mtime = FileTime::from_last_modification_time(&meta);
    let atime = FileTime::from_last_access_time(&meta);
    filetime::set_file_times(dst, atime, mtime).map_err(|e| copy_err("set times on", dst, e))
}

#[cfg(unix)]
pub fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| copy_err("create", parent, e))?;
    }
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst).map_err(|e| copy_err("remove", dst, e))?;
    }
    let target = fs::read_link(src).map_err(|e| copy_err("read symlink", src, e))?;
    std::os::unix::fs::symlink(&target, dst).map_err(|e| copy_err("create symlink", dst, e))?;
    let meta = fs::symlink_metadata(src).map_err(|e| copy_err("stat", src, e))?;
    filetime::set_symlink_file_times(
        dst,
        FileTime::from_last_access_time(&meta),
        FileTime::from_last_modification_time(&meta),
    )
    .map_err(|e| copy_err("set times on", dst, e))
}

#[cfg(not(unix))]
pub fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    copy_file(src, dst)
}

/// Removes a file, symlink or directory tree; missing paths are fine.
pub fn remove_any(p: &Path) -> Result<bool> {
    let Ok(meta) = fs::symlink_metadata(p) else {
        return Ok(false);
    };
    let res = if meta.is_dir() {
        fs::remove_dir_all(p)
    } else {
        fs::remove_file(p)
    };
    res.map_err(|e| Error::msg(format!("failed to remove {}: {e}", p.display())))?;
    Ok(true)
}
