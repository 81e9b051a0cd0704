//! Shared helpers for the integration tests: a server fixture on a
//! throwaway unix socket and a minimal framed client.

use common::wire::{self, Frame};
use common::{HashAlgorithm, ObjectId, Reply, Request, WireHash};
use rcached::backend::InMemoryCache;
use rcached::{CacheServer, Locator, ServerConfig, ServerHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

#[allow(dead_code)]
pub struct TestServer {
    pub dir: TempDir,
    pub socket: PathBuf,
    pub handle: ServerHandle,
    pub backend: Arc<InMemoryCache>,
    pub task: JoinHandle<anyhow::Result<()>>,
}

/// Start a server over a fresh unix socket with the given config and an
/// in-memory backend of `capacity` bytes.
#[allow(dead_code)]
pub async fn spawn_server(config: ServerConfig, capacity: u64) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("cache.sock");
    let backend = Arc::new(InMemoryCache::new(capacity));
    let locator = Locator::Unix(socket.clone());
    let server = CacheServer::bind(config, backend.clone(), &locator)
        .await
        .unwrap();
    let handle = server.handle();
    let task = tokio::spawn(server.run());
    TestServer {
        dir,
        socket,
        handle,
        backend,
        task,
    }
}

#[allow(dead_code)]
pub struct TestClient {
    pub stream: UnixStream,
    pub session_id: u64,
    pub max_object_size: u64,
}

#[allow(dead_code)]
impl TestClient {
    pub async fn connect(socket: &Path) -> Self {
        let stream = UnixStream::connect(socket).await.unwrap();
        Self {
            stream,
            session_id: 0,
            max_object_size: 0,
        }
    }

    /// Handshake and remember the session id and advertised object size.
    pub async fn handshake(&mut self) -> Reply {
        let reply = self
            .roundtrip(
                &Request::Handshake {
                    name: Some("test client".to_string()),
                },
                &[],
            )
            .await
            .msg;
        if let Reply::Handshake {
            session_id,
            max_object_size,
            ..
        } = &reply
        {
            self.session_id = *session_id;
            self.max_object_size = *max_object_size;
        }
        reply
    }

    pub async fn send(&mut self, request: &Request, attachment: &[u8]) {
        wire::send_frame(&mut self.stream, request, attachment)
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> Frame<Reply> {
        wire::recv_frame(&mut self.stream, 1 << 20).await.unwrap()
    }

    pub async fn roundtrip(&mut self, request: &Request, attachment: &[u8]) -> Frame<Reply> {
        self.send(request, attachment).await;
        self.recv().await
    }

    /// Store `data` under `id` as a conforming multi-part upload: full
    /// buffers for every part but the last.
    pub async fn store(&mut self, req_id: u64, id: &ObjectId, data: &[u8], description: &str) {
        let max = self.max_object_size as usize;
        let mut parts: Vec<&[u8]> = data.chunks(max).collect();
        if parts.is_empty() {
            parts.push(&[]);
        }
        let count = parts.len();
        for (index, part) in parts.into_iter().enumerate() {
            let part_nr = index as u64 + 1;
            let last_part = index + 1 == count;
            let reply = self
                .roundtrip(
                    &Request::Store {
                        req_id,
                        session_id: self.session_id,
                        object_id: id.to_wire(),
                        part_nr,
                        last_part,
                        expected_size: (part_nr == 1).then_some(data.len() as u64),
                        object_type: None,
                        description: (part_nr == 1).then(|| description.to_string()),
                    },
                    part,
                )
                .await
                .msg;
            assert_eq!(
                reply,
                Reply::Store {
                    req_id,
                    part_nr,
                    status: common::Status::Ok
                }
            );
        }
    }
}

#[allow(dead_code)]
pub fn object_id(byte: u8) -> ObjectId {
    ObjectId::new(HashAlgorithm::Sha1, &[byte; 20]).unwrap()
}

/// A wire hash no object id can be parsed from.
#[allow(dead_code)]
pub fn bogus_hash() -> WireHash {
    WireHash {
        algorithm: 99,
        digest: vec![0; 4],
    }
}

/// Poll `probe` until it reports true or the deadline passes.
#[allow(dead_code)]
pub async fn wait_for<F, Fut>(probe: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
