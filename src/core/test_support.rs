// In-process HTTP fixtures for tests. Nothing here talks to the internet.

use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::Router;
use sha2::{Digest, Sha256};

/// Serve `router` on an ephemeral localhost port; returns the base URL.
pub(crate) async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Deterministic non-trivial payload.
pub(crate) fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Parse `Range: bytes=N-`.
pub(crate) fn range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    value
        .strip_prefix("bytes=")?
        .trim_end_matches('-')
        .parse()
        .ok()
}

/// Range-aware response over a static body.
pub(crate) fn ranged_response(data: &[u8], headers: &HeaderMap) -> Response {
    match range_start(headers) {
        Some(start) if (start as usize) < data.len() => Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, data.len() - 1, data.len()),
            )
            .header(header::CONTENT_LENGTH, data.len() - start as usize)
            .body(Body::from(data[start as usize..].to_vec()))
            .unwrap(),
        Some(_) => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .body(Body::empty())
            .unwrap(),
        None => Response::builder()
            .status(StatusCode::OK)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_LENGTH, data.len())
            .body(Body::from(data.to_vec()))
            .unwrap(),
    }
}

/// Records the `Range` header (or `None`) of every request it sees.
#[derive(Clone, Default)]
pub(crate) struct RequestLog {
    entries: Arc<Mutex<Vec<Option<String>>>>,
}

impl RequestLog {
    pub fn record(&self, headers: &HeaderMap) {
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.entries.lock().unwrap().push(range);
    }

    pub fn ranges(&self) -> Vec<Option<String>> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Zip archive built in memory: `(path, contents)`; a trailing `/` marks a directory.
pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
        for (name, contents) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents).unwrap();
            }
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}
