use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;
use serde::Serialize;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::error_handling::types::FileError;
use crate::files::operations::looks_binary;

const CHUNK_SIZE: usize = 64 * 1024;

/// Streaming file read events, in wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileStreamEvent {
    Metadata {
        #[serde(rename = "mimeType")]
        mime_type: String,
        size: u64,
        #[serde(rename = "isBinary")]
        is_binary: bool,
    },
    Chunk {
        data: String,
        encoding: &'static str,
    },
    Complete {
        #[serde(rename = "bytesRead")]
        bytes_read: u64,
    },
    Error {
        error: String,
    },
}

/// Streams a file as `metadata`, then `chunk`s, then `complete`.
///
/// Binary detection probes the head of the file; binary chunks are base64,
/// text chunks utf-8. A zero-byte file yields metadata and complete only.
/// The caller sees open errors as `Err`; read failures mid-stream arrive as
/// an `error` event because the response has already started.
pub async fn stream_file(path: &Path) -> Result<mpsc::Receiver<FileStreamEvent>, FileError> {
    let display = path.display().to_string();
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| FileError::from_io(&display, &e))?;
    if metadata.is_dir() {
        return Err(FileError::IsDirectory(display));
    }
    let size = metadata.len();

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| FileError::from_io(&display, &e))?;

    // Probe the head for binary content, then stream from the start again.
    let mut probe = vec![0u8; 8192.min(size as usize)];
    let probed = file
        .read_exact(&mut probe)
        .await
        .map(|_| ())
        .or_else(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Ok(())
            } else {
                Err(e)
            }
        })
        .map_err(|e| FileError::from_io(&display, &e));
    probed?;
    let is_binary = looks_binary(&probe);
    drop(file);

    let mime_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();

    let (tx, rx) = mpsc::channel(16);
    let _ = tx
        .send(FileStreamEvent::Metadata {
            mime_type,
            size,
            is_binary,
        })
        .await;

    let path = path.to_path_buf();
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                let _ = tx
                    .send(FileStreamEvent::Error {
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let mut bytes_read = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    bytes_read += n as u64;
                    let event = if is_binary {
                        FileStreamEvent::Chunk {
                            data: BASE64.encode(&buf[..n]),
                            encoding: "base64",
                        }
                    } else {
                        FileStreamEvent::Chunk {
                            data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                            encoding: "utf-8",
                        }
                    };
                    if tx.send(event).await.is_err() {
                        debug!("Stream consumer for {} went away", path.display());
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(FileStreamEvent::Error {
                            error: e.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }

        let _ = tx.send(FileStreamEvent::Complete { bytes_read }).await;
    });

    Ok(rx)
}
