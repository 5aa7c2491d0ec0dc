//! JSON-RPC control socket served by the primary process.
//!
//! One request per connection, newline-terminated. The only method,
//! `get_nvme_controllers`, reports every live command-log queue as a
//! `[tail, [opc, opc, opc, opc]]` pair with the four newest opcodes first.
//! The acceptor polls every 100 ms and reads only tail snapshots, so it
//! never contends with the I/O path.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nvt_shm::ShmRegion;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cmdlog::queue_summaries;

/// Well-known socket path compatible with existing tooling.
pub const DEFAULT_SOCKET: &str = "/var/tmp/spdk.sock";

const ACCEPT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    id: Value,
}

pub(crate) struct RpcServer {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl RpcServer {
    pub(crate) fn start(path: PathBuf, cmdlog: Arc<ShmRegion>) -> std::io::Result<Self> {
        // A previous primary that died uncleanly leaves the socket file.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let handle = thread::Builder::new()
            .name("nvt-rpc".to_string())
            .spawn(move || {
                debug!("rpc server listening");
                while !stop.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if let Err(err) = serve_client(stream, &cmdlog) {
                                warn!(%err, "rpc client failed");
                            }
                        }
                        Err(err) if err.kind() == ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_INTERVAL);
                        }
                        Err(err) => {
                            warn!(%err, "rpc accept failed");
                            thread::sleep(ACCEPT_INTERVAL);
                        }
                    }
                }
            })?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
            path,
        })
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn serve_client(stream: UnixStream, cmdlog: &ShmRegion) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let response = match serde_json::from_str::<RpcRequest>(&line) {
        Ok(req) if req.method == "get_nvme_controllers" => {
            let result: Vec<Value> = queue_summaries(cmdlog)
                .into_iter()
                .map(|(tail, opcodes)| json!([tail, opcodes]))
                .collect();
            json!({ "jsonrpc": "2.0", "id": req.id, "result": result })
        }
        Ok(req) => json!({
            "jsonrpc": "2.0",
            "id": req.id,
            "error": { "code": -32601, "message": format!("method {:?} not found", req.method) },
        }),
        Err(err) => json!({
            "jsonrpc": "2.0",
            "id": Value::Null,
            "error": { "code": -32700, "message": err.to_string() },
        }),
    };

    let mut payload = serde_json::to_vec(&response)?;
    payload.push(b'\n');
    let mut stream = reader.into_inner();
    stream.write_all(&payload)
}

/// One-shot client: sends `method` and returns the decoded `result`.
/// Used by the test suite and handy for ad-hoc pokes at a running primary.
pub fn rpc_request(path: impl AsRef<Path>, method: &str) -> std::io::Result<Value> {
    let mut stream = UnixStream::connect(path)?;
    let mut payload = serde_json::to_vec(&json!({
        "jsonrpc": "2.0",
        "method": method,
        "id": 1,
    }))?;
    payload.push(b'\n');
    stream.write_all(&payload)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let value: Value = serde_json::from_str(&line)?;
    if let Some(err) = value.get("error") {
        return Err(std::io::Error::new(ErrorKind::Other, err.to_string()));
    }
    Ok(value.get("result").cloned().unwrap_or(Value::Null))
}
