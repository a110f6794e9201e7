//! Minimal in-process HTTP stub for provider tests

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Requests seen by a stub, as raw header + body text
pub(crate) type Recorded = Arc<Mutex<Vec<String>>>;

fn header_value<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    headers.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// Read one full request: `content-length` bodies or chunked bodies
async fn read_request(socket: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        data.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&data);
        let Some(header_end) = text.find("\r\n\r\n") else {
            continue;
        };
        let headers = &text[..header_end];
        let chunked = header_value(headers, "transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
        if chunked {
            if text.ends_with("0\r\n\r\n") {
                break;
            }
            continue;
        }
        let content_length = header_value(headers, "content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        if data.len() >= header_end + 4 + content_length {
            break;
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}

/// Serve one canned response per connection, `count` times, recording each request
pub(crate) async fn recording_stub_server(
    status: u16,
    body: &'static str,
    count: usize,
) -> (String, Recorded) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    tokio::spawn(async move {
        for _ in 0..count {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            sink.lock().push(request);
            let response = format!(
                "HTTP/1.1 {status} STUB\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (format!("http://{addr}"), recorded)
}

pub(crate) async fn stub_server(status: u16, body: &'static str, count: usize) -> String {
    recording_stub_server(status, body, count).await.0
}

/// Request line, headers and body of a recorded request
pub(crate) fn split_request(raw: &str) -> (&str, &str, &str) {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let (request_line, headers) = head.split_once("\r\n").unwrap_or((head, ""));
    (request_line, headers, body)
}

pub(crate) fn header<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    header_value(headers, name)
}
