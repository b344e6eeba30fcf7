//! Schema snapshot cache (§4.9).
//!
//! The schema is regenerated by a sibling process, never by the request
//! path: this module only cleans up stale files at startup, writes new ones
//! atomically on behalf of that sibling, and serves whichever cached file
//! matches the negotiated encoding. Absence of a file means "not ready
//! yet" — a 503, not an error.

use std::io;
use std::path::{Path, PathBuf};

use async_compression::tokio::bufread::{BrotliEncoder, DeflateEncoder, GzipEncoder};
use tokio::io::AsyncReadExt;

const SNAPSHOT_STEM: &str = "openapi-schema.json";

/// Content codings the snapshot cache can produce, in preference order for
/// when no `Accept-Encoding` header is present.
pub const SUPPORTED_ENCODINGS: &[&str] = &["gzip", "deflate", "br", "identity"];

/// File-extension suffix used for each coding's cached snapshot, e.g.
/// `tmp/openapi-schema.json.gzip`.
fn suffix_for(encoding: &str) -> &str {
    match encoding {
        "gzip" => "gzip",
        "deflate" => "deflate",
        "br" => "br",
        _ => "identity",
    }
}

fn snapshot_path(tmp_dir: &Path, encoding: &str) -> PathBuf {
    tmp_dir.join(format!("{SNAPSHOT_STEM}.{}", suffix_for(encoding)))
}

fn tmp_snapshot_path(tmp_dir: &Path, encoding: &str) -> PathBuf {
    tmp_dir.join(format!("{SNAPSHOT_STEM}.{}.tmp", suffix_for(encoding)))
}

/// Startup step 1: delete every `tmp/openapi-schema.json.*` file, including
/// `.tmp` siblings left behind by a process that crashed mid-write.
pub async fn cleanup_stale(tmp_dir: &Path) -> io::Result<()> {
    let mut entries = match tokio::fs::read_dir(tmp_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    let prefix = format!("{SNAPSHOT_STEM}.");
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&prefix) {
            tracing::info!(file = name, "removing stale schema snapshot");
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

/// Compress `spec_bytes` under every supported coding and atomically
/// publish each one (write to `.tmp`, then rename). Called from the
/// sibling "regenerate schema" process, never from a request handler.
pub async fn regenerate(tmp_dir: &Path, spec_bytes: &[u8]) -> io::Result<()> {
    tokio::fs::create_dir_all(tmp_dir).await?;
    for &encoding in SUPPORTED_ENCODINGS {
        let compressed = compress(encoding, spec_bytes).await?;
        let tmp_path = tmp_snapshot_path(tmp_dir, encoding);
        tokio::fs::write(&tmp_path, &compressed).await?;
        tokio::fs::rename(&tmp_path, snapshot_path(tmp_dir, encoding)).await?;
        tracing::info!(encoding, bytes = compressed.len(), "published schema snapshot");
    }
    Ok(())
}

async fn compress(encoding: &str, bytes: &[u8]) -> io::Result<Vec<u8>> {
    match encoding {
        "identity" => Ok(bytes.to_vec()),
        "gzip" => {
            let mut out = Vec::new();
            GzipEncoder::new(bytes).read_to_end(&mut out).await?;
            Ok(out)
        }
        "deflate" => {
            let mut out = Vec::new();
            DeflateEncoder::new(bytes).read_to_end(&mut out).await?;
            Ok(out)
        }
        "br" => {
            let mut out = Vec::new();
            BrotliEncoder::new(bytes).read_to_end(&mut out).await?;
            Ok(out)
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported encoding {other}"),
        )),
    }
}

/// Reads back whichever cached snapshot matches `encoding`. `None` means
/// "not ready yet" (the encoding's file hasn't been published by the
/// sibling process), which the caller surfaces as 503.
pub async fn read_cached(tmp_dir: &Path, encoding: &str) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(snapshot_path(tmp_dir, encoding)).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
