//! Accepts remote nodes and hands their connections to the dispatcher.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::guarded::Guarded;
use crate::application::node_driver::Registration;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::worker::{WorkerId, WorkerKind};
use crate::infrastructure::protocol::{Connection, PacketType};

/// How long a fresh connection may take to announce itself.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A node that completed the handshake but is not yet attached.
#[derive(Debug)]
pub struct PendingNode {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub connection: Connection,
}

/// Hands out worker ids and, when listening, collects registering nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistrar {
    next_id: Arc<AtomicU64>,
    pending: Guarded<Vec<PendingNode>>,
}

impl NodeRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> WorkerId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Reserve an id for a worker running inside the dispatcher.
    pub fn register_local(&self, kind: WorkerKind) -> WorkerId {
        let id = self.allocate_id();
        debug!(worker = id, kind = %kind, "local worker registered");
        id
    }

    /// Take every node registered since the last call.
    pub fn drain(&self) -> Vec<PendingNode> {
        std::mem::take(&mut *self.pending.acquire())
    }

    /// Complete the handshake on a connection and queue the node.
    pub async fn handshake(&self, mut connection: Connection) -> DomainResult<WorkerId> {
        let packet = tokio::time::timeout(HANDSHAKE_TIMEOUT, connection.recv())
            .await
            .map_err(|_| DomainError::Protocol("node did not register in time".into()))??;
        let kind = match packet.kind() {
            PacketType::RegisterConcrete => WorkerKind::Concrete,
            PacketType::RegisterSymbolic => WorkerKind::Symbolic,
            other => {
                return Err(DomainError::UnexpectedPacket {
                    expected: "registration".into(),
                    received: other.to_string(),
                })
            }
        };
        let id = self.allocate_id();
        connection
            .reply_json(packet.header.id, PacketType::RegisterAck, &Registration { id })
            .await?;
        info!(worker = id, kind = %kind, peer = ?connection.peer(), "node registered");
        self.pending.with(|p| {
            p.push(PendingNode {
                id,
                kind,
                connection,
            })
        });
        Ok(id)
    }

    /// Accept nodes on `addr` until `shutdown` flips to true.
    pub async fn listen(
        &self,
        addr: &str,
        chunk_size: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> DomainResult<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DomainError::resource(addr, e))?;
        let local = listener.local_addr()?;
        info!(addr = %local, "accepting worker nodes");

        let registrar = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("node listener stopped");
                            return;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let registrar = registrar.clone();
                            tokio::spawn(async move {
                                let connection = Connection::from_tcp(stream, chunk_size);
                                if let Err(e) = registrar.handshake(connection).await {
                                    warn!(%peer, error = %e, "node handshake failed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        });
        Ok((local, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::node_driver::{connect, register};

    #[test]
    fn test_ids_are_unique_across_kinds() {
        let registrar = NodeRegistrar::new();
        let a = registrar.register_local(WorkerKind::Concrete);
        let b = registrar.register_local(WorkerKind::Symbolic);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let registrar = NodeRegistrar::new();
        registrar.register_local(WorkerKind::Concrete);
        let (a, b) = tokio::io::duplex(4096);
        let mut node = Connection::new(a, 64);

        let server = {
            let registrar = registrar.clone();
            tokio::spawn(async move { registrar.handshake(Connection::new(b, 64)).await })
        };
        let id = register(&mut node, WorkerKind::Symbolic).await.unwrap();
        assert_eq!(server.await.unwrap().unwrap(), id);
        assert_eq!(id, 1);

        let pending = registrar.drain();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, WorkerKind::Symbolic);
        assert!(registrar.drain().is_empty());
    }

    #[tokio::test]
    async fn test_non_registration_rejected() {
        let registrar = NodeRegistrar::new();
        let (a, b) = tokio::io::duplex(4096);
        let mut node = Connection::new(a, 64);
        node.send_empty(PacketType::Status).await.unwrap();
        let err = registrar.handshake(Connection::new(b, 64)).await.unwrap_err();
        assert!(matches!(err, DomainError::UnexpectedPacket { .. }));
        assert!(registrar.drain().is_empty());
    }

    #[tokio::test]
    async fn test_listen_accepts_tcp_nodes() {
        let registrar = NodeRegistrar::new();
        let (tx, rx) = watch::channel(false);
        let (addr, handle) = registrar.listen("127.0.0.1:0", 1024, rx).await.unwrap();

        let mut conn = connect(&addr.to_string(), 3, 1024).await.unwrap();
        let id = register(&mut conn, WorkerKind::Concrete).await.unwrap();

        let mut nodes = Vec::new();
        for _ in 0..100 {
            nodes = registrar.drain();
            if !nodes.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, id);
        assert!(nodes[0].connection.peer().is_some());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
