//! End-to-end tests running the real server on an ephemeral port and
//! speaking raw HTTP/1.1 over a TcpStream.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use cbs_config::Config;
use cloud_backup::datastore::DataStore;
use cloud_backup::server::Server;

struct TestServer {
    port: u16,
    _dir: TempDir,
}

fn start_server(tweak: impl FnOnce(&mut Config)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.server_port = 0;
    config.backup_file_dir = dir.path().join("backup").to_str().unwrap().to_string();
    config.data_manager_filepath = dir.path().join("backup.list").to_str().unwrap().to_string();
    config.thread_pool_threads_size = 2;
    tweak(&mut config);

    let store = DataStore::open(
        &config.backup_file_dir,
        &config.data_manager_filepath,
        config.lru_file_capacity,
        config.lru_file_content_size,
    )
    .unwrap();

    let server = Server::bind(Arc::new(config), store).unwrap();
    let port = server.local_port().unwrap();
    std::thread::spawn(move || {
        let _ = server.run();
    });

    TestServer { port, _dir: dir }
}

fn connect(server: &TestServer) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

struct Response {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Response {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Read exactly one response; the connection stays usable afterwards.
fn read_response(stream: &mut TcpStream) -> Response {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let mut lines = head.split("\r\n");

    let status_line = lines.next().unwrap();
    let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let length: usize = headers
        .get("content-length")
        .expect("response without content-length")
        .parse()
        .unwrap();
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).unwrap();

    Response {
        status,
        headers,
        body,
    }
}

fn request(server: &TestServer, raw: &[u8]) -> Response {
    let mut stream = connect(server);
    stream.write_all(raw).unwrap();
    read_response(&mut stream)
}

fn multipart_body(parts: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (filename, data) in parts {
        body.extend_from_slice(b"------XYZ\r\n");
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b"------XYZ--\r\n");
    body
}

fn upload_request(parts: &[(&str, &[u8])]) -> Vec<u8> {
    let body = multipart_body(parts);
    let mut raw = format!(
        "POST /upload HTTP/1.1\r\n\
         Content-Type: multipart/form-data; boundary=----XYZ\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    raw.extend_from_slice(&body);
    raw
}

fn get(server: &TestServer, path: &str) -> Response {
    request(
        server,
        format!("GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path).as_bytes(),
    )
}

#[test]
fn test_upload_then_list() {
    let server = start_server(|_| ());

    let response = request(&server, &upload_request(&[("hello.txt", b"HELLO")]));
    assert_eq!(response.status, 200);
    let report = response.json();
    assert_eq!(report["success_count"], 1);
    assert_eq!(report["fail_count"], 0);
    assert_eq!(report["total_count"], 1);
    assert_eq!(report["success_files"], serde_json::json!(["hello.txt"]));
    assert_eq!(report["fail_files"], serde_json::json!([]));

    let response = get(&server, "/api/GetBackupFiles");
    assert_eq!(response.status, 200);
    let listing = response.json();
    let files = listing["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["filename"], "hello.txt");
    assert_eq!(files[0]["size"], 5);
    assert!(files[0]["time"].as_i64().unwrap() > 0);
}

#[test]
fn test_download_roundtrip() {
    let server = start_server(|_| ());
    request(&server, &upload_request(&[("hello.txt", b"HELLO")]));

    let response = get(&server, "/download/hello.txt");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"HELLO");
    assert_eq!(
        response.headers.get("content-type").unwrap(),
        "application/octet-stream"
    );
    assert_eq!(response.headers.get("accept-ranges").unwrap(), "bytes");
    assert_eq!(
        response.headers.get("content-disposition").unwrap(),
        "attachment; filename=\"hello.txt\""
    );
    assert!(response.headers.get("etag").unwrap().starts_with("hello.txt-"));
}

#[test]
fn test_range_download_with_etag() {
    let server = start_server(|_| ());
    request(&server, &upload_request(&[("hello.txt", b"HELLO")]));

    let listing = get(&server, "/api/GetBackupFiles").json();
    let time = listing["files"][0]["time"].as_i64().unwrap();
    let etag = format!("hello.txt-{}-5", time);

    let response = request(
        &server,
        format!(
            "GET /download/hello.txt HTTP/1.1\r\n\
             If-Range: {}\r\n\
             Range: bytes=2-4\r\n\r\n",
            etag
        )
        .as_bytes(),
    );
    assert_eq!(response.status, 206);
    assert_eq!(response.headers.get("content-length").unwrap(), "3");
    assert_eq!(response.body, b"LLO");
    assert_eq!(response.headers.get("content-range").unwrap(), "bytes 2-4/5");

    // open ended range
    let response = request(
        &server,
        format!(
            "GET /download/hello.txt HTTP/1.1\r\nIf-Range: {}\r\nRange: bytes=1-\r\n\r\n",
            etag
        )
        .as_bytes(),
    );
    assert_eq!(response.status, 206);
    assert_eq!(response.body, b"ELLO");
}

#[test]
fn test_range_mismatch_falls_back_to_full() {
    let server = start_server(|_| ());
    request(&server, &upload_request(&[("hello.txt", b"HELLO")]));

    let response = request(
        &server,
        b"GET /download/hello.txt HTTP/1.1\r\n\
          If-Range: stale\r\n\
          Range: bytes=2-4\r\n\r\n",
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("content-length").unwrap(), "5");
    assert_eq!(response.body, b"HELLO");
}

#[test]
fn test_path_traversal_blocked() {
    let server = start_server(|_| ());
    let response = get(&server, "/download/../etc/passwd");
    assert_eq!(response.status, 404);
    let response = get(&server, "/download/%2e%2e%2fetc%2fpasswd");
    assert_eq!(response.status, 404);
}

#[test]
fn test_mixed_status_upload() {
    let server = start_server(|_| ());

    let response = request(&server, &upload_request(&[("ok.txt", b"X"), ("..", b"Y")]));
    assert_eq!(response.status, 207);
    let report = response.json();
    assert_eq!(report["success_count"], 1);
    assert_eq!(report["fail_count"], 1);
    assert_eq!(report["total_count"], 2);
    assert_eq!(report["success_files"], serde_json::json!(["ok.txt"]));
    assert_eq!(report["fail_files"], serde_json::json!([".."]));

    // the bad part must not block the good one
    let response = get(&server, "/download/ok.txt");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"X");
}

#[test]
fn test_all_failed_upload() {
    let server = start_server(|_| ());
    let response = request(&server, &upload_request(&[("..", b"Y")]));
    assert_eq!(response.status, 400);

    // upload without boundary
    let response = request(
        &server,
        b"POST /upload HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 3\r\n\r\nabc",
    );
    assert_eq!(response.status, 400);
}

#[test]
fn test_chunked_streaming_download() {
    // tiny read chunks force the streamer through many passes
    let server = start_server(|config| {
        config.max_file_read_size = 3;
        config.lru_file_content_size = 4;
    });

    let payload = b"0123456789abcdefghij";
    request(&server, &upload_request(&[("big.bin", payload)]));

    let response = get(&server, "/download/big.bin");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, payload.as_slice());

    // again, now the head is served from the prefix cache
    let response = get(&server, "/download/big.bin");
    assert_eq!(response.body, payload.as_slice());
}

#[test]
fn test_delete() {
    let server = start_server(|_| ());
    request(&server, &upload_request(&[("gone.txt", b"data")]));

    let response = request(&server, b"DELETE /delete/gone.txt HTTP/1.1\r\n\r\n");
    assert_eq!(response.status, 200);

    let response = request(&server, b"DELETE /delete/gone.txt HTTP/1.1\r\n\r\n");
    assert_eq!(response.status, 404);

    let response = get(&server, "/download/gone.txt");
    assert_eq!(response.status, 404);

    let listing = get(&server, "/api/GetBackupFiles").json();
    assert_eq!(listing["files"].as_array().unwrap().len(), 0);
}

#[test]
fn test_static_page_and_unknown_routes() {
    let server = start_server(|_| ());

    for path in ["/", "/showlist"] {
        let response = get(&server, path);
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("content-type").unwrap(), "text/html");
        assert!(!response.body.is_empty());
    }

    assert_eq!(get(&server, "/nosuchroute").status, 404);
    assert_eq!(get(&server, "/api/Bogus").status, 404);
    assert_eq!(
        request(&server, b"PUT /upload HTTP/1.1\r\n\r\n").status,
        404
    );
}

#[test]
fn test_pipelined_requests_one_connection() {
    let server = start_server(|_| ());
    request(&server, &upload_request(&[("a.txt", b"first")]));

    let mut stream = connect(&server);
    stream
        .write_all(
            b"GET /download/a.txt HTTP/1.1\r\n\r\nGET /api/GetBackupFiles HTTP/1.1\r\n\r\n",
        )
        .unwrap();

    let first = read_response(&mut stream);
    assert_eq!(first.status, 200);
    assert_eq!(first.body, b"first");

    let second = read_response(&mut stream);
    assert_eq!(second.status, 200);
    assert_eq!(second.json()["files"][0]["filename"], "a.txt");
}

#[test]
fn test_upload_split_across_writes() {
    let server = start_server(|_| ());

    let raw = upload_request(&[("split.txt", b"SPLIT CONTENT")]);
    let mut stream = connect(&server);
    for piece in raw.chunks(7) {
        stream.write_all(piece).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }
    let response = read_response(&mut stream);
    assert_eq!(response.status, 200);

    let response = get(&server, "/download/split.txt");
    assert_eq!(response.body, b"SPLIT CONTENT");
}

#[test]
fn test_snapshot_written_after_upload() {
    let server = start_server(|_| ());
    request(&server, &upload_request(&[("persist.txt", b"worth keeping")]));

    // the snapshot thread runs asynchronously, give it a moment
    let snapshot_path = server._dir.path().join("backup.list");
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(raw) = std::fs::read_to_string(&snapshot_path) {
            if raw.contains("persist.txt") {
                let rows: Value = serde_json::from_str(&raw).unwrap();
                assert_eq!(rows[0]["filename"], "persist.txt");
                assert_eq!(rows[0]["size"], 13);
                break;
            }
        }
        assert!(
            std::time::Instant::now() < deadline,
            "snapshot was not written in time"
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}
