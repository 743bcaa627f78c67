use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error_handling::types::FileError;

/// Content transfer encoding for read/write payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Encoding {
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

/// One directory listing entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult {
    pub content: String,
    pub encoding: Encoding,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistsResult {
    pub exists: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

fn kind_of(file_type: &std::fs::FileType) -> &'static str {
    if file_type.is_dir() {
        "directory"
    } else if file_type.is_symlink() {
        "symlink"
    } else {
        "file"
    }
}

/// Sniffs binary content: any NUL byte in the probe window.
pub fn looks_binary(probe: &[u8]) -> bool {
    probe.iter().take(8192).any(|b| *b == 0)
}

pub async fn mkdir(path: &Path, recursive: bool) -> Result<(), FileError> {
    let result = if recursive {
        // Recursive creation is idempotent by contract.
        tokio::fs::create_dir_all(path).await
    } else {
        tokio::fs::create_dir(path).await
    };
    result.map_err(|e| FileError::from_io(&path.display().to_string(), &e))?;
    debug!("mkdir {} (recursive={})", path.display(), recursive);
    Ok(())
}

pub async fn write(path: &Path, content: &str, encoding: Encoding) -> Result<u64, FileError> {
    let bytes = match encoding {
        Encoding::Utf8 => content.as_bytes().to_vec(),
        Encoding::Base64 => BASE64
            .decode(content)
            .map_err(|e| FileError::Other(format!("{}: invalid base64: {}", path.display(), e)))?,
    };
    tokio::fs::write(path, &bytes)
        .await
        .map_err(|e| FileError::from_io(&path.display().to_string(), &e))?;
    debug!("wrote {} bytes to {}", bytes.len(), path.display());
    Ok(bytes.len() as u64)
}

pub async fn read(path: &Path) -> Result<ReadResult, FileError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| FileError::from_io(&path.display().to_string(), &e))?;
    let size = bytes.len() as u64;
    if looks_binary(&bytes) {
        Ok(ReadResult {
            content: BASE64.encode(&bytes),
            encoding: Encoding::Base64,
            size,
        })
    } else {
        Ok(ReadResult {
            content: String::from_utf8_lossy(&bytes).into_owned(),
            encoding: Encoding::Utf8,
            size,
        })
    }
}

pub async fn delete(path: &Path, recursive: bool) -> Result<(), FileError> {
    let display = path.display().to_string();
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|e| FileError::from_io(&display, &e))?;

    let result = if metadata.is_dir() {
        if recursive {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_dir(path).await
        }
    } else {
        tokio::fs::remove_file(path).await
    };
    result.map_err(|e| FileError::from_io(&display, &e))?;
    debug!("deleted {}", display);
    Ok(())
}

pub async fn rename(from: &Path, to: &Path) -> Result<(), FileError> {
    tokio::fs::rename(from, to)
        .await
        .map_err(|e| FileError::from_io(&from.display().to_string(), &e))?;
    debug!("renamed {} -> {}", from.display(), to.display());
    Ok(())
}

/// Moves `from` to `to`; a `to` that is an existing directory receives the
/// source under its own name. Falls back to copy+unlink across devices.
pub async fn move_path(from: &Path, to: &Path) -> Result<(), FileError> {
    let target = if tokio::fs::metadata(to).await.map(|m| m.is_dir()).unwrap_or(false) {
        match from.file_name() {
            Some(name) => to.join(name),
            None => to.to_path_buf(),
        }
    } else {
        to.to_path_buf()
    };

    match tokio::fs::rename(from, &target).await {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            tokio::fs::copy(from, &target)
                .await
                .map_err(|e| FileError::from_io(&target.display().to_string(), &e))?;
            tokio::fs::remove_file(from)
                .await
                .map_err(|e| FileError::from_io(&from.display().to_string(), &e))?;
        }
        Err(e) => return Err(FileError::from_io(&from.display().to_string(), &e)),
    }
    debug!("moved {} -> {}", from.display(), target.display());
    Ok(())
}

pub async fn list(path: &Path) -> Result<Vec<FsEntry>, FileError> {
    let display = path.display().to_string();
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| FileError::from_io(&display, &e))?;
    if !metadata.is_dir() {
        return Err(FileError::NotDirectory(display));
    }

    let mut reader = tokio::fs::read_dir(path)
        .await
        .map_err(|e| FileError::from_io(&display, &e))?;
    let mut entries = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| FileError::from_io(&display, &e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        let modified_at = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Millis, true));
        entries.push(FsEntry {
            name,
            kind: kind_of(&metadata.file_type()),
            size: metadata.len(),
            modified_at,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub async fn exists(path: &Path) -> Result<ExistsResult, FileError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(ExistsResult {
            exists: true,
            kind: Some(kind_of(&metadata.file_type())),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ExistsResult {
            exists: false,
            kind: None,
        }),
        Err(e) => Err(FileError::from_io(&path.display().to_string(), &e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("note.txt");

        write(&path, "hello world", Encoding::Utf8).await.unwrap();
        let result = read(&path).await.unwrap();
        assert_eq!(result.content, "hello world");
        assert_eq!(result.encoding, Encoding::Utf8);
        assert_eq!(result.size, 11);
    }

    #[tokio::test]
    async fn base64_write_and_binary_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob.bin");
        let raw = [0u8, 1, 2, 255, 0, 42];

        write(&path, &BASE64.encode(raw), Encoding::Base64)
            .await
            .unwrap();
        let result = read(&path).await.unwrap();
        assert_eq!(result.encoding, Encoding::Base64);
        assert_eq!(BASE64.decode(result.content).unwrap(), raw);
    }

    #[tokio::test]
    async fn recursive_mkdir_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");

        mkdir(&nested, true).await.unwrap();
        mkdir(&nested, true).await.unwrap();
        assert!(nested.is_dir());

        // Non-recursive creation of an existing directory is a conflict.
        let err = mkdir(&nested, false).await.unwrap_err();
        assert!(matches!(err, FileError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn rename_there_and_back_preserves_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");

        write(&a, "original", Encoding::Utf8).await.unwrap();
        rename(&a, &b).await.unwrap();
        rename(&b, &a).await.unwrap();
        assert_eq!(read(&a).await.unwrap().content, "original");
    }

    #[tokio::test]
    async fn move_into_directory_keeps_file_name() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        let dest_dir = dir.path().join("dest");
        std::fs::create_dir(&dest_dir).unwrap();

        write(&src, "payload", Encoding::Utf8).await.unwrap();
        move_path(&src, &dest_dir).await.unwrap();
        assert!(!src.exists());
        assert_eq!(
            read(&dest_dir.join("src.txt")).await.unwrap().content,
            "payload"
        );
    }

    #[tokio::test]
    async fn missing_file_maps_to_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = read(&dir.path().join("ghost")).await.unwrap_err();
        assert!(matches!(err, FileError::NotFound(_)));

        let err = delete(&dir.path().join("ghost"), false).await.unwrap_err();
        assert!(matches!(err, FileError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_reports_kinds_and_rejects_files() {
        let dir = tempfile::TempDir::new().unwrap();
        write(&dir.path().join("f.txt"), "x", Encoding::Utf8)
            .await
            .unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let entries = list(dir.path()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "f.txt");
        assert_eq!(entries[0].kind, "file");
        assert_eq!(entries[1].name, "sub");
        assert_eq!(entries[1].kind, "directory");

        let err = list(&dir.path().join("f.txt")).await.unwrap_err();
        assert!(matches!(err, FileError::NotDirectory(_)));
    }

    #[tokio::test]
    async fn exists_distinguishes_kind() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = exists(dir.path()).await.unwrap();
        assert!(probe.exists);
        assert_eq!(probe.kind, Some("directory"));

        let probe = exists(&dir.path().join("nope")).await.unwrap();
        assert!(!probe.exists);
        assert_eq!(probe.kind, None);
    }
}
