//! TCP debug server

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::protocol::{DebugCommand, DebugResponse};

/// Implemented by the application to answer debug commands
pub trait DebugHandler: Send + Sync + 'static {
    fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse;
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind debug server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Debug server handle - keep this alive to keep the server running
pub struct DebugServer {
    local_addr: Option<SocketAddr>,
    handle: tokio::task::JoinHandle<()>,
}

impl DebugServer {
    /// Start the debug server on a localhost port.
    ///
    /// Returns immediately; binding happens in the background and a failure
    /// is only logged.
    pub fn start(handler: Arc<Mutex<dyn DebugHandler>>, port: u16) -> Self {
        let handle = tokio::spawn(async move {
            let addr = format!("127.0.0.1:{}", port);
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    log::info!("Debug server listening on {}", addr);
                    accept_loop(listener, handler).await;
                }
                Err(e) => log::error!("Failed to bind debug server on {}: {}", addr, e),
            }
        });

        Self {
            local_addr: None,
            handle,
        }
    }

    /// Bind `addr` now and serve in the background
    pub async fn bind(handler: Arc<Mutex<dyn DebugHandler>>, addr: &str) -> Result<Self, ServerError> {
        let bind_error = |source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        log::info!("Debug server listening on {}", local_addr);

        Ok(Self {
            local_addr: Some(local_addr),
            handle: tokio::spawn(accept_loop(listener, handler)),
        })
    }

    /// Bound address, known once `bind` has returned
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for DebugServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<Mutex<dyn DebugHandler>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::info!("Debug client connected from {}", peer);
                let handler = handler.clone();
                tokio::spawn(async move {
                    handle_connection(stream, handler).await;
                    log::info!("Debug client disconnected: {}", peer);
                });
            }
            Err(e) => log::error!("Debug server accept error: {}", e),
        }
    }
}

/// Parse one request line and run it through the handler
pub async fn dispatch_line(handler: &Mutex<dyn DebugHandler>, line: &str) -> DebugResponse {
    match serde_json::from_str::<DebugCommand>(line) {
        Ok(cmd) => {
            log::debug!("Debug command: {:?}", cmd);
            handler.lock().await.handle_command(cmd)
        }
        Err(e) => DebugResponse::error(format!("Invalid command JSON: {}", e)),
    }
}

async fn handle_connection(stream: TcpStream, handler: Arc<Mutex<dyn DebugHandler>>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Debug server read error: {}", e);
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = dispatch_line(&handler, trimmed).await;
        let mut resp_json = serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(
                "{{\"status\":\"error\",\"message\":\"Serialize error: {}\"}}",
                e
            )
        });
        resp_json.push('\n');

        if let Err(e) = writer.write_all(resp_json.as_bytes()).await {
            log::error!("Debug server write error: {}", e);
            break;
        }
    }
}
