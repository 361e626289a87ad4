//! 测试用的本地 HTTP 上游: 按脚本分段写出原始响应

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const SSE_HEAD: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";

/// 一段输出: 等待 `delay` 后写出 `bytes`
pub struct Step {
    pub delay: Duration,
    pub bytes: Vec<u8>,
}

pub fn now(bytes: impl Into<Vec<u8>>) -> Step {
    after(Duration::ZERO, bytes)
}

pub fn after(delay: Duration, bytes: impl Into<Vec<u8>>) -> Step {
    Step {
        delay,
        bytes: bytes.into(),
    }
}

/// 带 Content-Length 的完整响应
pub fn full_response(status: &str, content_type: &str, body: &str) -> Step {
    now(format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    ))
}

/// 接受一个连接，读完请求后按脚本应答，最后关闭连接。返回请求地址。
pub async fn serve_once(script: Vec<Step>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        read_request(&mut socket).await;
        for step in script {
            tokio::time::sleep(step.delay).await;
            if socket.write_all(&step.bytes).await.is_err() {
                return;
            }
            let _ = socket.flush().await;
        }
        let _ = socket.shutdown().await;
    });
    format!("http://{}/v1/chat/completions", addr)
}

async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + body_len {
            return;
        }
    }
}
