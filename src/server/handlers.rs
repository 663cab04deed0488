//! Endpoint handlers: routing, upload sink, download preparation.

use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use anyhow::Error;
use http::StatusCode;
use percent_encoding::percent_decode_str;
use serde_json::json;

use crate::datastore::{check_filename, DataStore};

use super::http::{
    json_response, parse_range, status_response, HttpSink, MultipartScanner, PartSink,
    RequestInfo, ResponseBuilder,
};

/// The fixed HTML page served on `/` and `/showlist`.
const INDEX_HTML: &str = include_str!("../../www/index.html");

/// Follow-up work for a download: stream `[start, end)` of `name` into the
/// session's output buffer.
#[derive(Clone, Debug)]
pub struct Download {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

/// Per-connection request handler.
///
/// Receives the parser events of one message at a time, performs the side
/// effects (registry calls, file writes) and accumulates the serialized
/// response. The session picks the result up after each completed message.
pub struct RequestHandler {
    store: Arc<DataStore>,
    peer: String,
    upload: Option<UploadState>,
    reply: Vec<u8>,
    download: Option<Download>,
}

struct UploadState {
    scanner: MultipartScanner,
    sink: UploadSink,
    /// Framing gave up; report 400 at message end and ignore further bytes.
    broken: bool,
}

impl RequestHandler {
    pub fn new(store: Arc<DataStore>, peer: String) -> Self {
        Self {
            store,
            peer,
            upload: None,
            reply: Vec::new(),
            download: None,
        }
    }

    /// Response bytes and follow-up download of the last completed message.
    pub fn take_result(&mut self) -> (Vec<u8>, Option<Download>) {
        (std::mem::take(&mut self.reply), self.download.take())
    }

    fn route<'a>(&self, request: &'a RequestInfo) -> Route<'a> {
        match (request.method.as_str(), request.prefix.as_str()) {
            ("GET", "/") | ("GET", "/showlist") => Route::Showlist,
            ("GET", "/download") => Route::Download(&request.path),
            ("GET", "/api") => Route::Api(&request.path),
            ("DELETE", "/delete") => Route::Delete(&request.path),
            ("POST", "/upload") => Route::Upload,
            _ => Route::Unknown,
        }
    }

    fn handle_showlist(&mut self) {
        self.reply = ResponseBuilder::new(StatusCode::OK)
            .header("Content-Type", "text/html")
            .finish(INDEX_HTML.as_bytes());
    }

    fn handle_api(&mut self, path: &str) {
        if path != "/GetBackupFiles" {
            log::warn!("client {}: unknown api path {:?}", self.peer, path);
            self.reply = status_response(StatusCode::NOT_FOUND);
            return;
        }
        let files = self.store.list();
        self.reply = json_response(StatusCode::OK, &json!({ "files": files }));
    }

    fn handle_delete(&mut self, path: &str) {
        let name = match decode_name(path) {
            Some(name) => name,
            None => {
                log::warn!("client {}: delete with invalid name {:?}", self.peer, path);
                self.reply = status_response(StatusCode::NOT_FOUND);
                return;
            }
        };
        if self.store.delete(&name) {
            log::info!("client {}: deleted {}", self.peer, name);
            self.reply = json_response(StatusCode::OK, &json!({ "deleted": name }));
        } else {
            self.reply = status_response(StatusCode::NOT_FOUND);
        }
    }

    fn handle_download(&mut self, request: &RequestInfo, path: &str) {
        let name = match decode_name(path) {
            Some(name) => name,
            None => {
                log::warn!(
                    "client {}: download with invalid name {:?}",
                    self.peer,
                    path
                );
                self.reply = status_response(StatusCode::NOT_FOUND);
                return;
            }
        };
        let entry = match self.store.lookup(&name) {
            Some(entry) => entry,
            None => {
                self.reply = status_response(StatusCode::NOT_FOUND);
                return;
            }
        };

        let size = entry.info.size as u64;
        let etag = format!("{}-{}-{}", name, entry.info.time, size);

        // partial responses only for a verified range request
        let range = match (request.header("if-range"), request.header("range")) {
            (Some(if_range), Some(range)) if if_range == etag => parse_range(range).ok(),
            _ => None,
        };

        let (status, start, end) = match range {
            Some(range) => {
                let start = range.start.min(size);
                let end = range
                    .end
                    .map(|end| (end + 1).min(size))
                    .unwrap_or(size)
                    .max(start);
                (StatusCode::PARTIAL_CONTENT, start, end)
            }
            None => (StatusCode::OK, 0, size),
        };

        let mut response = ResponseBuilder::new(status)
            .header("Content-Type", "application/octet-stream")
            .header("Accept-Ranges", "bytes")
            .header("ETag", &etag)
            .header(
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", name),
            );
        if status == StatusCode::PARTIAL_CONTENT {
            response = response.header(
                "Content-Range",
                format!("bytes {}-{}/{}", start, end.saturating_sub(1), size),
            );
        }

        self.reply = response.finish_with_length(end - start);
        self.download = Some(Download { name, start, end });
    }

    fn begin_upload(&mut self, request: &RequestInfo) {
        let boundary = request.header("content-type").and_then(extract_boundary);
        match boundary {
            Some(boundary) => {
                self.upload = Some(UploadState {
                    scanner: MultipartScanner::new(&boundary),
                    sink: UploadSink::new(Arc::clone(&self.store)),
                    broken: false,
                });
            }
            None => {
                log::warn!("client {}: upload without usable boundary", self.peer);
            }
        }
    }

    fn finish_upload(&mut self) {
        let mut upload = match self.upload.take() {
            Some(upload) => upload,
            None => {
                // boundary was missing or malformed
                self.reply = status_response(StatusCode::BAD_REQUEST);
                return;
            }
        };

        if !upload.broken {
            if let Err(err) = upload.scanner.finish(&mut upload.sink) {
                log::warn!("client {}: upload failed - {}", self.peer, err);
                upload.broken = true;
            }
        }

        let UploadSink { success, fail, .. } = upload.sink;
        let status = if upload.broken && success.is_empty() && fail.is_empty() {
            StatusCode::BAD_REQUEST
        } else if fail.is_empty() && !success.is_empty() {
            StatusCode::OK
        } else if success.is_empty() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::MULTI_STATUS
        };

        log::info!(
            "client {}: upload done, {} ok / {} failed",
            self.peer,
            success.len(),
            fail.len()
        );
        self.reply = json_response(
            status,
            &json!({
                "success_count": success.len(),
                "fail_count": fail.len(),
                "total_count": success.len() + fail.len(),
                "success_files": success,
                "fail_files": fail,
            }),
        );
    }
}

enum Route<'a> {
    Showlist,
    Download(&'a str),
    Api(&'a str),
    Delete(&'a str),
    Upload,
    Unknown,
}

impl HttpSink for RequestHandler {
    fn on_message_begin(&mut self) {
        self.upload = None;
        self.reply.clear();
        self.download = None;
    }

    fn on_headers_complete(&mut self, request: &RequestInfo) -> Result<(), Error> {
        if let Route::Upload = self.route(request) {
            self.begin_upload(request);
        }
        Ok(())
    }

    fn on_body(&mut self, request: &RequestInfo, data: &[u8]) -> Result<(), Error> {
        if let Route::Upload = self.route(request) {
            if let Some(upload) = &mut self.upload {
                if !upload.broken {
                    if let Err(err) = upload.scanner.feed(data, &mut upload.sink) {
                        log::warn!("client {}: multipart scan failed - {}", self.peer, err);
                        upload.sink.abort_current();
                        upload.broken = true;
                    }
                }
            }
        }
        // bodies of all other requests are ignored
        Ok(())
    }

    fn on_message_complete(&mut self, request: &RequestInfo) -> Result<(), Error> {
        match self.route(request) {
            Route::Showlist => self.handle_showlist(),
            Route::Api(path) => self.handle_api(path),
            Route::Delete(path) => self.handle_delete(path),
            Route::Download(path) => self.handle_download(request, path),
            Route::Upload => self.finish_upload(),
            Route::Unknown => {
                log::warn!(
                    "client {}: no handler for {} {}",
                    self.peer,
                    request.method,
                    request.url
                );
                self.reply = status_response(StatusCode::NOT_FOUND);
            }
        }
        Ok(())
    }
}

/// Writes upload parts into the backup directory through the registry's
/// two-phase lifecycle.
struct UploadSink {
    store: Arc<DataStore>,
    current: Option<CurrentPart>,
    success: Vec<String>,
    fail: Vec<String>,
}

struct CurrentPart {
    name: String,
    file: File,
    written: i64,
}

impl UploadSink {
    fn new(store: Arc<DataStore>) -> Self {
        Self {
            store,
            current: None,
            success: Vec::new(),
            fail: Vec::new(),
        }
    }

    /// Drop the part in flight, if any, releasing its reservation.
    fn abort_current(&mut self) {
        if let Some(part) = self.current.take() {
            self.store.release(&part.name);
            self.fail.push(part.name);
        }
    }
}

impl PartSink for UploadSink {
    fn part_begin(&mut self, filename: &str) {
        if !self.store.reserve(filename) {
            self.fail.push(filename.to_string());
            return;
        }
        match std::fs::OpenOptions::new()
            .append(true)
            .open(self.store.file_path(filename))
        {
            Ok(file) => {
                self.current = Some(CurrentPart {
                    name: filename.to_string(),
                    file,
                    written: 0,
                });
            }
            Err(err) => {
                log::error!("unable to open upload file {} - {}", filename, err);
                self.store.release(filename);
                self.fail.push(filename.to_string());
            }
        }
    }

    fn part_data(&mut self, data: &[u8]) {
        if let Some(part) = &mut self.current {
            match part.file.write_all(data) {
                Ok(()) => part.written += data.len() as i64,
                Err(err) => {
                    log::error!("write error on upload file {} - {}", part.name, err);
                    self.abort_current();
                }
            }
        }
    }

    fn part_end(&mut self) {
        if let Some(part) = self.current.take() {
            if self.store.commit(&part.name, part.written) {
                self.success.push(part.name);
            } else {
                self.store.release(&part.name);
                self.fail.push(part.name);
            }
        }
    }

    fn part_abort(&mut self) {
        self.abort_current();
    }
}

/// Decode the `<name>` component of a download/delete URL: strip the leading
/// slash, undo percent encoding and validate the charset.
fn decode_name(path: &str) -> Option<String> {
    let raw = path.strip_prefix('/')?;
    let name = percent_decode_str(raw).decode_utf8().ok()?;
    if check_filename(&name) {
        Some(name.into_owned())
    } else {
        None
    }
}

/// Pull the boundary parameter out of a content-type value. The parameter
/// key is matched case-insensitively, the boundary itself keeps its case.
fn extract_boundary(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    if !lower.starts_with("multipart/form-data") {
        return None;
    }
    let pos = lower.find("boundary=")?;
    let raw = &content_type[pos + "boundary=".len()..];
    let raw = raw.split(';').next().unwrap_or(raw).trim();
    let raw = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')).unwrap_or(raw);
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_extract_boundary() {
        assert_eq!(
            extract_boundary("multipart/form-data; boundary=----abcDEF").as_deref(),
            Some("----abcDEF")
        );
        assert_eq!(
            extract_boundary("multipart/form-data; BOUNDARY=\"MiXeD\"; charset=utf-8").as_deref(),
            Some("MiXeD")
        );
        assert_eq!(extract_boundary("text/plain"), None);
        assert_eq!(extract_boundary("multipart/form-data"), None);
    }

    #[test]
    fn test_decode_name() {
        assert_eq!(decode_name("/hello.txt").as_deref(), Some("hello.txt"));
        assert_eq!(decode_name("/with%20space").as_deref(), Some("with space"));
        assert_eq!(decode_name("/../etc/passwd"), None);
        assert_eq!(decode_name("/%2e%2e"), None);
        assert_eq!(decode_name("/a%2Fb"), None);
        assert_eq!(decode_name("/"), None);
    }
}
