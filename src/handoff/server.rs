//! Volume transfer endpoint
//!
//! Minimal HTTP/1.1 server accepting pushed volume snapshots:
//!
//! - `POST /v1/volumes/{name}` with the snapshot as body and its digest in
//!   the `X-Rune-Checksum` header; replies with a JSON `TransferAck`
//! - `GET /v1/health`

use super::protocol::HandoffReceiver;
use super::transport::{CHECKSUM_HEADER, VOLUMES_PATH};
use crate::driver::VolumeSnapshot;
use crate::error::{Result, RuneError};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Default port of the transfer endpoint
pub const DEFAULT_TRANSFER_PORT: u16 = 4523;

/// Transfer endpoint server
pub struct TransferServer {
    listener: TcpListener,
    receiver: Arc<HandoffReceiver>,
    max_body: Option<u64>,
}

struct Request {
    method: String,
    path: String,
    content_length: u64,
    checksum: Option<String>,
}

impl TransferServer {
    /// Bind the endpoint
    ///
    /// Pushes larger than `max_body` bytes are refused; `None` accepts any size.
    pub async fn bind(
        addr: SocketAddr,
        receiver: Arc<HandoffReceiver>,
        max_body: Option<u64>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            receiver,
            max_body,
        })
    }

    /// Address the endpoint is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves
    ///
    /// Transfers already in progress keep running on their own tasks.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Transfer endpoint listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let receiver = self.receiver.clone();
                            let max_body = self.max_body;
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, receiver, max_body).await {
                                    error!("Error handling transfer from {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => error!("Error accepting connection: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    info!("Transfer endpoint stopped");
                    return Ok(());
                }
            }
        }
    }
}

async fn read_request<R>(reader: &mut BufReader<R>) -> Result<Option<Request>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }
    debug!("Received request: {}", request_line.trim());

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Ok(None);
    }

    let mut request = Request {
        method: parts[0].to_string(),
        path: parts[1].to_string(),
        content_length: 0,
        checksum: None,
    };

    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line).await? == 0 || header_line.trim().is_empty() {
            break;
        }
        let Some((name, value)) = header_line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_lowercase().as_str() {
            "content-length" => request.content_length = value.parse().unwrap_or(0),
            CHECKSUM_HEADER => request.checksum = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(Some(request))
}

async fn handle_connection(
    stream: TcpStream,
    receiver: Arc<HandoffReceiver>,
    max_body: Option<u64>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let Some(request) = read_request(&mut reader).await? else {
        return send_error(&mut write_half, 400, "Bad Request").await;
    };

    if request.method == "GET" && request.path == "/v1/health" {
        let body = serde_json::json!({ "status": "ok" }).to_string();
        return send_response(&mut write_half, 200, "OK", &body).await;
    }

    let volume = match request.path.strip_prefix(VOLUMES_PATH) {
        Some(name) if request.method == "POST" && !name.is_empty() && !name.contains('/') => {
            name.to_string()
        }
        _ => return send_error(&mut write_half, 404, "Not Found").await,
    };

    let Some(checksum) = request.checksum else {
        return send_error(&mut write_half, 400, "Missing checksum header").await;
    };
    let mut body = (&mut reader).take(request.content_length);
    if max_body.is_some_and(|max| request.content_length > max) {
        tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        return send_error(&mut write_half, 413, "Payload Too Large").await;
    }

    let (file, archive) = receiver.spool()?.into_parts();
    let mut file = tokio::fs::File::from_std(file);
    let received = tokio::io::copy(&mut body, &mut file).await?;
    file.flush().await?;
    drop(file);
    if received < request.content_length {
        return send_error(&mut write_half, 400, "Truncated body").await;
    }

    let snapshot = VolumeSnapshot {
        volume,
        archive,
        size: received,
        checksum,
    };

    match receiver.receive(snapshot).await {
        Ok(ack) => {
            let body = serde_json::to_string(&ack)?;
            send_response(&mut write_half, 200, "OK", &body).await
        }
        Err(e) => {
            let (code, reason) = match e {
                RuneError::VolumeExists(_) => (409, "Conflict"),
                RuneError::Transfer(_) | RuneError::Configuration(_) => {
                    (422, "Unprocessable Entity")
                }
                _ => (500, "Internal Server Error"),
            };
            let body = serde_json::json!({ "message": e.to_string() }).to_string();
            send_response(&mut write_half, code, reason, &body).await
        }
    }
}

async fn send_response<W>(stream: &mut W, code: u16, reason: &str, body: &str) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        code,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

async fn send_error<W>(stream: &mut W, code: u16, message: &str) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let body = serde_json::json!({ "message": message }).to_string();
    send_response(stream, code, message, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{FilesystemVolumeDriver, VolumeDriver};
    use crate::handoff::transport::{HttpTransport, VolumeTransport};
    use crate::model::NodeId;
    use std::io::Write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_push_over_http() {
        let source_dir = tempdir().unwrap();
        let target_dir = tempdir().unwrap();
        let source = FilesystemVolumeDriver::new(source_dir.path().to_path_buf()).unwrap();
        let target = Arc::new(FilesystemVolumeDriver::new(target_dir.path().to_path_buf()).unwrap());

        let volume = source.create_from_local("db").unwrap();
        std::fs::write(volume.path.join("data"), b"hello").unwrap();

        let receiver = Arc::new(HandoffReceiver::new(NodeId::new("node2"), target.clone()));
        let server = TransferServer::bind("127.0.0.1:0".parse().unwrap(), receiver, None)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        let transport = HttpTransport::new(DEFAULT_TRANSFER_PORT);
        let destination = NodeId::new(&addr.to_string());
        let snapshot = source.export_snapshot("db").unwrap();
        let checksum = snapshot.checksum.clone();

        let ack = transport.push(&destination, snapshot).await.unwrap();
        assert_eq!(ack.volume, "db");
        assert_eq!(ack.checksum, checksum);
        assert_eq!(
            std::fs::read(target.volume_path("db").join("data")).unwrap(),
            b"hello"
        );

        let again = source.export_snapshot("db").unwrap();
        assert!(transport.push(&destination, again).await.is_err());

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_push_refused() {
        let target_dir = tempdir().unwrap();
        let target = Arc::new(FilesystemVolumeDriver::new(target_dir.path().to_path_buf()).unwrap());
        let receiver = Arc::new(HandoffReceiver::new(NodeId::new("node2"), target.clone()));
        let server = TransferServer::bind("127.0.0.1:0".parse().unwrap(), receiver, Some(4))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run_until(std::future::pending()));

        let mut file = target.spool().unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        let snapshot = VolumeSnapshot::from_archive("db", file.into_temp_path()).unwrap();
        let err = HttpTransport::new(DEFAULT_TRANSFER_PORT)
            .push(&NodeId::new(&addr.to_string()), snapshot)
            .await
            .unwrap_err();
        assert!(matches!(err, RuneError::Transfer(_)));
        assert!(target.list_volumes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_declared_length_is_not_trusted() {
        let target_dir = tempdir().unwrap();
        let target = Arc::new(FilesystemVolumeDriver::new(target_dir.path().to_path_buf()).unwrap());
        let receiver = Arc::new(HandoffReceiver::new(NodeId::new("node2"), target.clone()));
        let server = TransferServer::bind("127.0.0.1:0".parse().unwrap(), receiver, None)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run_until(std::future::pending()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "POST /v1/volumes/db HTTP/1.1\r\n{}: sha256:00\r\nContent-Length: {}\r\n\r\nabc",
            CHECKSUM_HEADER,
            1u64 << 40
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
        assert!(target.list_volumes().unwrap().is_empty());
        assert_eq!(
            std::fs::read_dir(target_dir.path().join(crate::driver::volume::SPOOL_DIR))
                .unwrap()
                .count(),
            0
        );
    }
}
