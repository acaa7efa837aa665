//! Worker-side loop of a remote node: register with the dispatcher, then
//! service its requests with local executors until told to shut down.

use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::application::guarded::Guarded;
use crate::application::worker::executor::{
    ConcreteExecutor, Executor, ImageSource, Session, SymbolicExecutor,
};
use crate::application::worker::process::ProcessSlot;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::test_case::TestCase;
use crate::domain::models::trace::{TraceArtifact, TraceBundle, TraceId};
use crate::domain::models::worker::{Connection as Link, ImageInfo, WorkerId, WorkerKind, WorkerRecord};
use crate::infrastructure::protocol::{Connection, Packet, PacketType};

/// Body of a registration acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: WorkerId,
}

/// Connect to the dispatcher, retrying with exponential backoff.
pub async fn connect(master: &str, retries: u32, chunk_size: usize) -> DomainResult<Connection> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(200))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(None)
        .build();
    let attempt = AtomicU32::new(0);
    let stream = backoff::future::retry(policy, || async {
        let n = attempt.fetch_add(1, Ordering::SeqCst) + 1;
        match TcpStream::connect(master).await {
            Ok(stream) => Ok(stream),
            Err(e) if n >= retries.max(1) => Err(backoff::Error::permanent(e)),
            Err(e) => {
                warn!(master, attempt = n, error = %e, "dispatcher unreachable, retrying");
                Err(backoff::Error::transient(e))
            }
        }
    })
    .await
    .map_err(|e| DomainError::Remote(format!("cannot reach dispatcher at {master}: {e}")))?;
    Ok(Connection::from_tcp(stream, chunk_size))
}

/// Announce this node and receive its worker id.
pub async fn register(conn: &mut Connection, kind: WorkerKind) -> DomainResult<WorkerId> {
    let request = match kind {
        WorkerKind::Concrete => PacketType::RegisterConcrete,
        WorkerKind::Symbolic => PacketType::RegisterSymbolic,
    };
    let ack: Registration = conn.request(request, &[], PacketType::RegisterAck).await?.json()?;
    Ok(ack.id)
}

pub struct NodeDriver {
    id: WorkerId,
    conn: Connection,
    executor: Executor,
    processes: ProcessSlot,
    work_dir: PathBuf,
    traces: HashMap<TraceId, TraceArtifact>,
    status: Guarded<WorkerRecord>,
}

impl NodeDriver {
    pub fn new(id: WorkerId, conn: Connection, executor: Executor, work_dir: impl Into<PathBuf>) -> Self {
        let status = Guarded::new(WorkerRecord::new(id, executor.kind(), Link::Local));
        Self {
            id,
            conn,
            executor,
            processes: ProcessSlot::new(),
            work_dir: work_dir.into(),
            traces: HashMap::new(),
            status,
        }
    }

    /// Service requests until shutdown or a protocol error.
    #[instrument(skip(self), fields(worker = self.id, kind = %self.executor.kind()))]
    pub async fn run(mut self) -> DomainResult<()> {
        info!("node serving dispatcher requests");
        loop {
            let packet = match self.conn.recv().await {
                Ok(packet) => packet,
                Err(DomainError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    info!("dispatcher closed the connection");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if packet.kind() == PacketType::Shutdown {
                info!("shutdown requested");
                if let Err(e) = self.processes.kill(Duration::from_secs(5)).await {
                    warn!(error = %e, "failed to stop running process");
                }
                return Ok(());
            }

            let kind = packet.kind();
            let request = packet.header.id;
            debug!(request = %kind, id = request, "request received");
            match self.handle(packet).await {
                Ok(()) => {}
                Err(e @ (DomainError::Protocol(_) | DomainError::UnexpectedPacket { .. })) => {
                    return Err(e)
                }
                Err(e) => {
                    warn!(request = %kind, error = %e, "request failed");
                    self.status.with(|r| r.error_count += 1);
                    self.conn.reply_failure(request, &e.to_string()).await?;
                }
            }
        }
    }

    /// Serve one request. Every answer carries the request's header id.
    async fn handle(&mut self, packet: Packet) -> DomainResult<()> {
        let request = packet.header.id;
        match (packet.kind(), self.executor.clone()) {
            (PacketType::StatusRequest, _) => {
                let status = self.status.acquire().status();
                self.conn.reply_json(request, PacketType::Status, &status).await?;
            }
            (PacketType::Commence, executor) => {
                let session: Session = packet.json()?;
                match executor {
                    Executor::Concrete(exec) => exec.commence(&session).await?,
                    Executor::Symbolic(exec) => {
                        self.forget_traces().await;
                        exec.commence(&session).await?;
                    }
                }
                self.status.with(|r| r.reset_runtime(session.target));
                self.conn.reply_empty(request, PacketType::Ack).await?;
            }
            (PacketType::Reset, executor) => {
                match executor {
                    Executor::Concrete(exec) => exec.reset().await?,
                    Executor::Symbolic(exec) => exec.reset().await?,
                }
                let target = self.status.acquire().target.clone();
                self.status.with(|r| r.reset_runtime(target));
                self.conn.reply_empty(request, PacketType::Ack).await?;
            }
            (PacketType::ImageInfoRequest, Executor::Concrete(exec)) => {
                let info = exec.image_info().await?;
                self.conn.reply_json(request, PacketType::ImageInfo, &info).await?;
            }
            (PacketType::ImageUpdate, Executor::Concrete(exec)) => {
                let info: ImageInfo = packet.json()?;
                let data = self.conn.expect(PacketType::ImageData).await?.payload;
                let staging = self.work_dir.join("incoming-image");
                tokio::fs::create_dir_all(&staging).await?;
                let path = staging.join(&info.file_name);
                tokio::fs::write(&path, &data)
                    .await
                    .map_err(|e| DomainError::resource(&path, e))?;
                exec.update_image(&ImageSource { path, info }).await?;
                tokio::fs::remove_dir_all(&staging).await?;
                self.conn.reply_empty(request, PacketType::Ack).await?;
            }
            (PacketType::GuestDataRequest, Executor::Concrete(exec)) => {
                let data = exec.shared_data().await?;
                self.conn.reply_json(request, PacketType::GuestData, &data).await?;
            }
            (PacketType::ExecuteTest, Executor::Concrete(exec)) => {
                let test: TestCase = packet.json()?;
                self.status.with(|r| r.queued_tests.push_back(test.clone()));
                exec.execute(&test, &self.processes).await?;
                self.conn.reply_empty(request, PacketType::Ack).await?;
            }
            (PacketType::StoreTrace, Executor::Concrete(exec)) => {
                let test: TestCase = packet.json()?;
                let artifact = exec.store_trace(&test).await?;
                let bundle = TraceBundle::from_artifact(&artifact)?;
                self.conn.reply(request, PacketType::TraceData, &bundle.encode()).await?;
                tokio::fs::remove_dir_all(&artifact.dir).await?;
                self.status.with(|r| r.queued_tests.pop_front());
            }
            (PacketType::Translate, Executor::Symbolic(exec)) => {
                let bundle = TraceBundle::decode(&packet.payload)?;
                let artifact = bundle.unpack(&self.work_dir.join("incoming"))?;
                self.traces.insert(artifact.id.clone(), artifact.clone());
                self.status.with(|r| r.queued_traces.push_back(artifact.clone()));
                exec.translate(&artifact, &self.processes).await?;
                self.conn.reply_empty(request, PacketType::Ack).await?;
            }
            (PacketType::Solve, Executor::Symbolic(exec)) => {
                let artifact = self.lookup(&packet)?;
                exec.solve(&artifact, &self.processes).await?;
                self.conn.reply_empty(request, PacketType::Ack).await?;
            }
            (PacketType::CollectTests, Executor::Symbolic(exec)) => {
                let artifact = self.lookup(&packet)?;
                let batch = exec.collect_tests(&artifact).await?;
                self.conn.reply_json(request, PacketType::TestBatch, &batch).await?;
            }
            (PacketType::Clean, Executor::Symbolic(exec)) => {
                let artifact = self.lookup(&packet)?;
                exec.clean(&artifact).await?;
                self.drop_trace(&artifact.id).await;
                self.conn.reply_empty(request, PacketType::Ack).await?;
            }
            (kind, executor) => {
                return Err(DomainError::Protocol(format!(
                    "{kind} is not a request a {} node serves",
                    executor.kind()
                )))
            }
        }
        Ok(())
    }

    fn lookup(&self, packet: &Packet) -> DomainResult<TraceArtifact> {
        let id = packet.text();
        self.traces
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::resource(self.work_dir.join("incoming").join(&id), "unknown trace"))
    }

    async fn drop_trace(&mut self, id: &str) {
        if let Some(artifact) = self.traces.remove(id) {
            if let Err(e) = tokio::fs::remove_dir_all(&artifact.dir).await {
                debug!(trace = id, error = %e, "could not remove received trace");
            }
        }
        self.status.with(|r| r.queued_traces.retain(|t| t.id != id));
    }

    async fn forget_traces(&mut self) {
        let ids: Vec<TraceId> = self.traces.keys().cloned().collect();
        for id in ids {
            self.drop_trace(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::worker::command::{CommandConcreteExecutor, CommandSymbolicExecutor};
    use crate::application::worker::remote::RemoteWorker;
    use crate::domain::models::config::{SvmArgs, SvmConfig, VmConfig};
    use crate::domain::models::test_case::TestCaseElement;

    fn linked(executor: Executor, dir: &std::path::Path) -> (RemoteWorker, tokio::task::JoinHandle<DomainResult<()>>) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let driver = NodeDriver::new(9, Connection::new(b, 1024), executor, dir.join("node"));
        let handle = tokio::spawn(driver.run());
        (RemoteWorker::new(9, Connection::new(a, 1024), dir.join("staging")), handle)
    }

    #[tokio::test]
    async fn test_remote_concrete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let vm = VmConfig {
            executable: "cp".into(),
            args: vec!["{input}".into(), "{trace_dir}/tb-seq.bin".into()],
            ..VmConfig::default()
        };
        let local = CommandConcreteExecutor::new(9, dir.path().join("vm"), vm);
        let (remote, handle) = linked(Executor::Concrete(Arc::new(local)), dir.path());
        let remote: Arc<dyn ConcreteExecutor> = Arc::new(remote);

        let test = TestCase::new(vec![TestCaseElement::new("ab", b"cd".to_vec())]);
        remote.commence(&Session::default()).await.unwrap();
        assert_eq!(remote.image_info().await.unwrap(), None);
        remote.execute(&test, &ProcessSlot::new()).await.unwrap();
        let artifact = remote.store_trace(&test).await.unwrap();

        assert!(artifact.dir.starts_with(dir.path().join("staging")));
        assert_eq!(artifact.load_trace().unwrap().len(), 2);
        assert_eq!(
            TestCase::read_elements(&artifact.input_path()).unwrap().elements(),
            test.elements()
        );
        drop(remote);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_remote_failure_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let vm = VmConfig {
            executable: "false".into(),
            ..VmConfig::default()
        };
        let local = CommandConcreteExecutor::new(9, dir.path().join("vm"), vm);
        let (remote, handle) = linked(Executor::Concrete(Arc::new(local)), dir.path());

        ConcreteExecutor::commence(&remote, &Session::default()).await.unwrap();
        let err = remote
            .execute(&TestCase::default(), &ProcessSlot::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Remote(_)));
        ConcreteExecutor::reset(&remote).await.unwrap();

        remote.shutdown().await.unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wrong_kind_request_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let local = CommandSymbolicExecutor::new(9, dir.path().join("svm"), SvmConfig::default());
        let (remote, handle) = linked(Executor::Symbolic(Arc::new(local)), dir.path());

        assert!(remote.image_info().await.is_err());
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(DomainError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_remote_symbolic_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let trace = TraceArtifact::allocate(&dir.path().join("pool"));
        std::fs::create_dir_all(&trace.dir).unwrap();
        std::fs::write(trace.block_sequence_path(), crate::domain::models::trace::encode_blocks(&[1])).unwrap();
        let input = TestCase::new(vec![TestCaseElement::new("ab", b"cd".to_vec())]).with_issue_index(2);
        std::fs::write(trace.input_path(), input.encode_elements()).unwrap();
        std::fs::write(trace.input_record_path(), serde_json::to_vec(&input).unwrap()).unwrap();

        let svm = SvmConfig {
            translator: "touch run.bc".into(),
            executable: "sh".into(),
            args: SvmArgs {
                concolic: vec!["-c".into(), "cp concrete_inputs.bin {output}/gen1".into()],
                symbolic: vec![],
            },
        };
        let local = CommandSymbolicExecutor::new(9, dir.path().join("svm"), svm);
        let (remote, handle) = linked(Executor::Symbolic(Arc::new(local)), dir.path());
        let slot = ProcessSlot::new();

        SymbolicExecutor::commence(&remote, &Session::default()).await.unwrap();
        remote.translate(&trace, &slot).await.unwrap();
        remote.solve(&trace, &slot).await.unwrap();
        let batch = remote.collect_tests(&trace).await.unwrap();
        assert_eq!(batch.input.issue_index(), Some(2));
        assert_eq!(batch.tests.len(), 1);
        remote.clean(&trace).await.unwrap();
        assert!(!dir.path().join("node/incoming").join(&trace.id).exists());

        remote.shutdown().await.unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
