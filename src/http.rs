//! HTTP API for blob upload, download and replication status
//!
//! - `GET /health` - Liveness and the active backend
//! - `POST /v0/blob` - Store a blob from an `application/octet-stream` body
//! - `GET /v0/blob/{id}` - Download a blob (single `Range` supported)
//! - `GET /v0/blob/{id}/status` - Replication status
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X POST -H "Content-Type: application/octet-stream" \
//!      --data-binary @video.mp4 \
//!      http://localhost:40080/v0/blob
//!
//! curl -H "Range: bytes=0-1023" \
//!      http://localhost:40080/v0/blob/ad7ef987-a932-495c-aa0c-7ffcabeda45f
//! ```

use crate::backend::Backend;
use crate::blob::{BlobId, BlobReader, BlobSource, BlobStore, ByteRange, Descriptor, Replica};
use crate::error::{Result, StorageError};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bytes read from a blob per response frame
const STREAM_CHUNK: u64 = 64 * 1024;

type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
}

#[derive(Serialize)]
struct PostBlobResponse {
    id: String,
}

#[derive(Serialize)]
struct StatusResponse {
    id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    replicas: Vec<Replica>,
}

/// HTTP server state
pub struct HttpServer {
    backend: Backend,
    max_blob_length: u64,
    shutdown: CancellationToken,
}

impl HttpServer {
    /// Create a new HTTP server. Cancelling `shutdown` stops accepting and
    /// cancels in-flight Puts.
    pub fn new(backend: Backend, max_blob_length: u64, shutdown: CancellationToken) -> Self {
        Self {
            backend,
            max_blob_length,
            shutdown,
        }
    }

    /// Bind `addr` and serve until shutdown
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, backend = %self.backend.kind(), "HTTP server listening");

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };
            let io = TokioIo::new(stream);
            let server = Arc::clone(&self);

            tokio::spawn(async move {
                let shutdown = server.shutdown.clone();
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req).await }
                });

                let conn = http1::Builder::new().serve_connection(io, service);
                tokio::pin!(conn);
                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = shutdown.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.as_mut().await
                    }
                };
                if let Err(err) = result {
                    debug!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }

        info!("HTTP server stopped");
        Ok(())
    }

    /// Route requests to handlers
    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<ResponseBody>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(method = %method, path = %path, "Incoming request");

        let result = match path.as_str() {
            "/health" if method == Method::GET => self.handle_health(),
            "/v0/blob" => match method {
                Method::OPTIONS => Ok(allow("POST, OPTIONS")),
                Method::POST => self.handle_post_blob(req).await,
                _ => Ok(not_allowed("POST, OPTIONS")),
            },
            p if p.starts_with("/v0/blob/") => {
                let suffix = p.strip_prefix("/v0/blob/").unwrap_or_default();
                match method {
                    Method::OPTIONS => Ok(allow("GET, OPTIONS")),
                    Method::GET => {
                        let range = req
                            .headers()
                            .get(header::RANGE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        self.handle_blob_subtree(range, suffix).await
                    }
                    _ => Ok(not_allowed("GET, OPTIONS")),
                }
            }
            "/" if method == Method::OPTIONS => Ok(allow("OPTIONS")),
            _ => Ok(json_error(StatusCode::NOT_FOUND, "404 Page Not found")),
        };

        Ok(result.unwrap_or_else(|e| error_response(&e)))
    }

    fn handle_health(&self) -> Result<Response<ResponseBody>> {
        let body = serde_json::json!({
            "status": "ok",
            "backend": self.backend.kind().to_string(),
        });
        Ok(json_response(StatusCode::OK, &body))
    }

    /// POST /v0/blob - Store the request body
    async fn handle_post_blob(&self, req: Request<Incoming>) -> Result<Response<ResponseBody>> {
        let is_octet_stream = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "application/octet-stream");
        if !is_octet_stream {
            return Ok(json_error(
                StatusCode::BAD_REQUEST,
                r#"Invalid content type, expected "application/octet-stream"."#,
            ));
        }

        let declared = match req.headers().get(header::CONTENT_LENGTH) {
            None => None,
            Some(value) => match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
                Some(length) => Some(length),
                None => {
                    return Ok(json_error(
                        StatusCode::BAD_REQUEST,
                        "Invalid content length, expected unsigned numerical value.",
                    ))
                }
            },
        };
        if declared.is_some_and(|length| length > self.max_blob_length) {
            return Ok(json_error(
                StatusCode::BAD_REQUEST,
                &format!(
                    "Content-Length exceeds the maximum accepted content length of {} bytes.",
                    self.max_blob_length
                ),
            ));
        }

        let exceeded = Arc::new(AtomicBool::new(false));
        let source = capped_body(req.into_body(), self.max_blob_length, Arc::clone(&exceeded));

        let cancel = self.shutdown.child_token();
        let descriptor = match self.backend.put(source, &cancel).await {
            Ok(descriptor) => descriptor,
            Err(_) if exceeded.load(Ordering::Acquire) => {
                return Ok(too_large(self.max_blob_length));
            }
            Err(StorageError::TooLarge { limit }) => return Ok(too_large(limit)),
            Err(e) => return Err(e),
        };

        if let Some(length) = declared {
            if length != descriptor.size {
                warn!(
                    id = %descriptor.id,
                    size = descriptor.size,
                    expected_size = length,
                    "Content-Length in request header did not match the data length"
                );
            }
        }
        debug!(id = %descriptor.id, size = descriptor.size, "Blob created");

        Ok(json_response(
            StatusCode::CREATED,
            &PostBlobResponse {
                id: descriptor.id.to_string(),
            },
        ))
    }

    async fn handle_blob_subtree(
        &self,
        range: Option<String>,
        suffix: &str,
    ) -> Result<Response<ResponseBody>> {
        let segments: Vec<&str> = suffix.split('/').collect();
        match segments.as_slice() {
            [id] => self.handle_get_blob(id, range).await,
            [id, "status"] => self.handle_get_status(id).await,
            _ => Ok(json_error(StatusCode::NOT_FOUND, "404 Page Not found")),
        }
    }

    /// GET /v0/blob/{id}
    async fn handle_get_blob(&self, id: &str, range: Option<String>) -> Result<Response<ResponseBody>> {
        let id: BlobId = id.parse()?;

        if let Some(passthrough) = self.backend.passthrough() {
            if let Some(upstream) = passthrough.pass_get(&id, range.as_deref()).await? {
                debug!(id = %id, status = upstream.status, "Blob served by passthrough");
                let status = StatusCode::from_u16(upstream.status).map_err(|e| {
                    StorageError::Internal(format!("invalid upstream status: {e}"))
                })?;
                let mut response = Response::new(stream_body(upstream.body));
                *response.status_mut() = status;
                let headers = response.headers_mut();
                set_blob_headers(headers, &id)?;
                if let Some(length) = upstream.content_length {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
                }
                if let Some(content_range) = upstream.content_range {
                    headers.insert(header::CONTENT_RANGE, header_value(&content_range)?);
                }
                return Ok(response);
            }
        }

        let descriptor = self.backend.describe(&id).await?;
        let size = descriptor.size;

        let selected = match range.as_deref().map(|r| ByteRange::parse(r, size)) {
            None | Some(Ok(None)) => None,
            Some(Ok(Some(r))) => Some(r),
            Some(Err(_)) => {
                let mut response = json_error(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    "Requested range not satisfiable",
                );
                response
                    .headers_mut()
                    .insert(header::CONTENT_RANGE, header_value(&format!("bytes */{size}"))?);
                return Ok(response);
            }
        };

        let mut reader = self.backend.get(&id).await?;
        let (status, offset, length) = match selected {
            Some(r) => (StatusCode::PARTIAL_CONTENT, r.start, r.byte_count()),
            None => (StatusCode::OK, 0, size),
        };
        if offset > 0 {
            reader.seek(io::SeekFrom::Start(offset)).await?;
        }

        let mut response = Response::new(reader_body(reader, length));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        set_blob_headers(headers, &id)?;
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        headers.insert(header::LAST_MODIFIED, header_value(&http_date(&descriptor))?);
        if let Some(r) = selected {
            headers.insert(header::CONTENT_RANGE, header_value(&r.content_range(size))?);
        }

        debug!(id = %id, offset, length, "Blob fetched");
        Ok(response)
    }

    /// GET /v0/blob/{id}/status
    async fn handle_get_status(&self, id: &str) -> Result<Response<ResponseBody>> {
        let blob_id: BlobId = id.parse()?;
        let descriptor = match self.backend.describe(&blob_id).await {
            Ok(descriptor) => descriptor,
            Err(e) if e.is_not_found() => return Err(e),
            Err(e) => {
                error!(id = %blob_id, error = %e, "Failed to get status for ID");
                return Err(e);
            }
        };

        Ok(json_response(
            StatusCode::OK,
            &StatusResponse {
                id: id.to_string(),
                replicas: descriptor.replicas,
            },
        ))
    }
}

/// Adapt the request body into a Put source that fails past `max` bytes
fn capped_body(body: Incoming, max: u64, exceeded: Arc<AtomicBool>) -> BlobSource {
    let mut seen = 0u64;
    let stream = body.into_data_stream().map(move |chunk| {
        let chunk = chunk.map_err(io::Error::other)?;
        seen += chunk.len() as u64;
        if seen > max {
            exceeded.store(true, Ordering::Release);
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request body exceeds the maximum blob length",
            ));
        }
        Ok(chunk)
    });
    Box::new(StreamReader::new(stream))
}

/// Stream exactly `length` bytes from the reader's current offset
fn reader_body(reader: Box<dyn BlobReader>, length: u64) -> ResponseBody {
    let frames = futures::stream::try_unfold((reader, length), |(mut reader, remaining)| async move {
        if remaining == 0 {
            reader.close().await?;
            return Ok(None);
        }
        let mut buf = vec![0u8; STREAM_CHUNK.min(remaining) as usize];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(StorageError::ShortRead {
                expected: remaining,
                actual: 0,
            });
        }
        buf.truncate(n);
        Ok(Some((Frame::data(Bytes::from(buf)), (reader, remaining - n as u64))))
    });
    StreamBody::new(frames.map_err(io::Error::other)).boxed_unsync()
}

fn stream_body(body: crate::blob::ByteStream) -> ResponseBody {
    StreamBody::new(body.map_ok(Frame::data).map_err(io::Error::other)).boxed_unsync()
}

fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never: std::convert::Infallible| -> io::Error { match never {} })
        .boxed_unsync()
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| StorageError::Internal(format!("invalid header value: {e}")))
}

fn set_blob_headers(headers: &mut hyper::HeaderMap, id: &BlobId) -> Result<()> {
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&format!(r#"attachment; filename="{id}.bin""#))?,
    );
    Ok(())
}

/// IMF-fixdate of the blob's modification time
fn http_date(descriptor: &Descriptor) -> String {
    descriptor
        .modification_time
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal error occurred");
        }
    };
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn json_error(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let body = serde_json::to_vec(&ErrorResponse { error: message })
        .unwrap_or_else(|_| br#"{"error":"internal"}"#.to_vec());
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn allow(methods: &'static str) -> Response<ResponseBody> {
    let mut response = Response::new(full(Bytes::new()));
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static(methods));
    response
}

fn not_allowed(methods: &'static str) -> Response<ResponseBody> {
    let mut response = json_error(
        StatusCode::METHOD_NOT_ALLOWED,
        r#"Method not allowed. Please see "Allow" response header for the list of allowed methods."#,
    );
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static(methods));
    response
}

fn too_large(limit: u64) -> Response<ResponseBody> {
    json_error(
        StatusCode::BAD_REQUEST,
        &format!("Blob length exceeds the maximum accepted length of {limit} bytes."),
    )
}

/// Status code for an error that escaped a handler
fn status_for(e: &StorageError) -> StatusCode {
    match e {
        StorageError::BlobNotFound(_) => StatusCode::NOT_FOUND,
        StorageError::InvalidId(_) => StatusCode::BAD_REQUEST,
        StorageError::TooLarge { .. } => StatusCode::BAD_REQUEST,
        StorageError::InsufficientSpace { .. } | StorageError::Cancelled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        StorageError::Remote { status: 416, .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        StorageError::Remote { .. } | StorageError::Http(_) => StatusCode::BAD_GATEWAY,
        StorageError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &StorageError) -> Response<ResponseBody> {
    let status = status_for(e);
    let message = match e {
        StorageError::BlobNotFound(_) => "No blob is found for the given ID".to_string(),
        StorageError::InvalidId(_) => "Invalid blob ID".to_string(),
        StorageError::InsufficientSpace { .. } => {
            "Insufficient storage space, try again later".to_string()
        }
        _ => format!("Internal error occurred: {e}"),
    };
    if status.is_server_error() {
        error!(status = status.as_u16(), error = %e, "Request error");
    }
    json_error(status, &message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&StorageError::BlobNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&StorageError::InvalidId("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&StorageError::InsufficientSpace { available: 1, minimum: 2 }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&StorageError::Remote { status: 416, message: String::new() }),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            status_for(&StorageError::Remote { status: 500, message: String::new() }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&StorageError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_http_date() {
        let descriptor = Descriptor {
            id: BlobId::generate(),
            size: 0,
            modification_time: Utc.with_ymd_and_hms(2023, 9, 4, 13, 5, 9).unwrap(),
            replicas: Vec::new(),
        };
        assert_eq!(http_date(&descriptor), "Mon, 04 Sep 2023 13:05:09 GMT");
    }

    #[test]
    fn test_status_response_omits_empty_replicas() {
        let body = serde_json::to_value(StatusResponse {
            id: "abc".into(),
            replicas: Vec::new(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "id": "abc" }));
    }
}
