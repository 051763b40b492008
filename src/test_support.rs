//! A tiny HTTP server whose chunked response body is written line by line as
//! the test hands lines over, so a stream can be held open and observed.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const RESPONSE_HEAD: &str = "HTTP/1.1 200 OK\r\n\
    content-type: application/x-ndjson\r\n\
    transfer-encoding: chunked\r\n\r\n";

pub struct ChunkedServer {
    pub uri: String,
    connections: mpsc::UnboundedReceiver<mpsc::UnboundedSender<String>>,
}

impl ChunkedServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let (line_tx, line_rx) = mpsc::unbounded_channel();
                if conn_tx.send(line_tx).is_err() {
                    break;
                }
                tokio::spawn(serve(socket, line_rx));
            }
        });

        Self {
            uri,
            connections: conn_rx,
        }
    }

    /// Waits for the next request. Each line sent goes out as one chunk;
    /// dropping the sender ends the body.
    pub async fn next_connection(&mut self) -> mpsc::UnboundedSender<String> {
        self.connections.recv().await.unwrap()
    }
}

async fn serve(mut socket: TcpStream, mut lines: mpsc::UnboundedReceiver<String>) {
    read_request(&mut socket).await;
    if socket.write_all(RESPONSE_HEAD.as_bytes()).await.is_err() {
        return;
    }

    while let Some(line) = lines.recv().await {
        let chunk = format!("{:x}\r\n{}\r\n", line.len(), line);
        if socket.write_all(chunk.as_bytes()).await.is_err() {
            return;
        }
    }
    let _ = socket.write_all(b"0\r\n\r\n").await;
}

/// Reads the request head plus `content-length` bytes of body.
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);

        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + length {
            return;
        }
    }
}
