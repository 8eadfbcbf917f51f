#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How the fake runtime answers every request it receives.
#[derive(Clone, Debug)]
pub enum Reply {
    /// 200 with the given content type, writing each line with `gap` between.
    Stream {
        content_type: &'static str,
        lines: Vec<String>,
        gap: Duration,
    },
    /// 200 `application/json` with a complete body.
    Json(String),
    /// Non-2xx status with a plain-text body.
    Status(u16, String),
    /// Reads the request and never answers.
    Hang,
}

impl Reply {
    pub fn sse(lines: &[&str]) -> Self {
        Reply::Stream {
            content_type: "text/event-stream",
            lines: lines.iter().map(|line| format!("data: {}\n\n", line)).collect(),
            gap: Duration::from_millis(20),
        }
    }

    pub fn ndjson(lines: &[&str]) -> Self {
        Reply::Stream {
            content_type: "application/x-ndjson",
            lines: lines.iter().map(|line| format!("{}\n", line)).collect(),
            gap: Duration::from_millis(20),
        }
    }
}

/// Minimal HTTP/1.1 server standing in for an inference runtime.
pub struct FakeRuntime {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
    heads: Arc<Mutex<Vec<String>>>,
}

impl FakeRuntime {
    pub async fn start(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let heads = Arc::new(Mutex::new(Vec::new()));

        let server_hits = Arc::clone(&hits);
        let server_bodies = Arc::clone(&bodies);
        let server_heads = Arc::clone(&heads);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let reply = reply.clone();
                let hits = Arc::clone(&server_hits);
                let bodies = Arc::clone(&server_bodies);
                let heads = Arc::clone(&server_heads);
                tokio::spawn(async move {
                    let _ = serve(socket, reply, hits, bodies, heads).await;
                });
            }
        });

        Self {
            addr,
            hits,
            bodies,
            heads,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/completions", self.base_url())
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }

    /// Request heads (request line plus headers), lowercased.
    pub fn heads(&self) -> Vec<String> {
        self.heads.lock().unwrap().clone()
    }
}

/// An endpoint on a port nothing listens on.
pub async fn refused_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/v1/completions", addr)
}

async fn serve(
    mut socket: TcpStream,
    reply: Reply,
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
    heads: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let (head, body) = read_request(&mut socket).await?;
    hits.fetch_add(1, Ordering::SeqCst);
    heads.lock().unwrap().push(head);
    if let Ok(value) = serde_json::from_slice::<Value>(&body) {
        bodies.lock().unwrap().push(value);
    }

    match reply {
        Reply::Stream {
            content_type,
            lines,
            gap,
        } => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
                content_type
            );
            socket.write_all(head.as_bytes()).await?;
            socket.flush().await?;
            for line in lines {
                tokio::time::sleep(gap).await;
                socket.write_all(line.as_bytes()).await?;
                socket.flush().await?;
            }
        }
        Reply::Json(body) => {
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await?;
        }
        Reply::Status(code, body) => {
            let response = format!(
                "HTTP/1.1 {} Error\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                code,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await?;
        }
        Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    }
    socket.shutdown().await
}

/// Reads headers plus a `Content-Length` body; returns the lowercased head and
/// the body.
async fn read_request(socket: &mut TcpStream) -> std::io::Result<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok((String::new(), Vec::new()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok((head, buf[header_end..].to_vec()))
}
