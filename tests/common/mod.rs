//! Minimal HTTP fixture for driving the downloader against a local socket.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A parsed incoming request, recorded for later assertions.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Start offset of a `Range: bytes=N-` header, if present.
    pub fn range_start(&self) -> Option<u64> {
        self.header("range")?
            .strip_prefix("bytes=")?
            .split('-')
            .next()?
            .parse()
            .ok()
    }
}

/// Canned response returned by the fixture's responder.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub body_delay: Option<Duration>,
    pub stall_after: Option<usize>,
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            reason: "OK",
            headers: Vec::new(),
            body: body.into(),
            body_delay: None,
            stall_after: None,
        }
    }

    pub fn partial(body: impl Into<Vec<u8>>, content_range: String) -> Self {
        Self {
            status: 206,
            reason: "Partial Content",
            headers: vec![("content-range".to_string(), content_range)],
            body: body.into(),
            body_delay: None,
            stall_after: None,
        }
    }

    pub fn status(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
            body_delay: None,
            stall_after: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Sleep before sending the body, keeping the transfer in flight.
    pub fn delay_body(mut self, delay: Duration) -> Self {
        self.body_delay = Some(delay);
        self
    }

    /// Send only the first `sent` body bytes, then hold the connection open
    /// until the client gives up.
    pub fn stall_after(mut self, sent: usize) -> Self {
        self.stall_after = Some(sent);
        self
    }
}

/// One-shot-connection HTTP server bound to an ephemeral localhost port.
pub struct HttpFixture {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl HttpFixture {
    pub async fn start(respond: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fixture socket");
        let addr = listener.local_addr().expect("fixture local addr");
        let requests: Arc<Mutex<Vec<Request>>> = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        let respond: Arc<dyn Fn(&Request) -> Reply + Send + Sync> = Arc::new(respond);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let recorded = recorded.clone();
                let respond = respond.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, recorded, respond).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.method == method)
            .count()
    }
}

async fn serve(
    mut stream: TcpStream,
    recorded: Arc<Mutex<Vec<Request>>>,
    respond: Arc<dyn Fn(&Request) -> Reply + Send + Sync>,
) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buffer.windows(4).any(|window| window == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > 64 * 1024 {
            return Ok(());
        }
    }

    let text = String::from_utf8_lossy(&buffer);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default();
    let path = target.split('?').next().unwrap_or(target).to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let request = Request {
        method: method.clone(),
        path,
        headers,
    };
    let reply = respond(&request);
    recorded.lock().unwrap().push(request);

    let mut head = format!("HTTP/1.1 {} {}\r\n", reply.status, reply.reason);
    head.push_str(&format!("content-length: {}\r\n", reply.body.len()));
    for (name, value) in &reply.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("connection: close\r\n\r\n");
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;

    if method != "HEAD" && !reply.body.is_empty() {
        if let Some(delay) = reply.body_delay {
            tokio::time::sleep(delay).await;
        }
        match reply.stall_after {
            Some(sent) => {
                let sent = sent.min(reply.body.len());
                stream.write_all(&reply.body[..sent]).await?;
                stream.flush().await?;
                // Held open until the client cancels or the test ends.
                tokio::time::sleep(Duration::from_secs(600)).await;
            }
            None => stream.write_all(&reply.body).await?,
        }
    }
    stream.flush().await?;
    Ok(())
}

/// Polls `condition` for up to ten seconds before panicking.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting until {what}");
}
