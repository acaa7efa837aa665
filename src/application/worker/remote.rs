//! Executor forwarding every operation to a registered remote node.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::application::worker::executor::{
    ConcreteExecutor, ImageSource, Session, SymbolicExecutor, TestBatch,
};
use crate::application::worker::process::ProcessSlot;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::harness::GuestData;
use crate::domain::models::test_case::TestCase;
use crate::domain::models::trace::{TraceArtifact, TraceBundle};
use crate::domain::models::worker::{ImageInfo, WorkerId};
use crate::infrastructure::protocol::{Connection, Packet, PacketType};

/// The dispatcher's end of a node connection.
///
/// Processes run on the node, so the local [`ProcessSlot`] stays empty. A
/// request dropped before its reply arrives leaves the link out of step and
/// every later request on it fails.
#[derive(Debug, Clone)]
pub struct RemoteWorker {
    id: WorkerId,
    link: Arc<Mutex<Connection>>,
    /// Where traces received from the node are unpacked.
    staging: PathBuf,
}

impl RemoteWorker {
    pub fn new(id: WorkerId, connection: Connection, staging: impl Into<PathBuf>) -> Self {
        Self {
            id,
            link: Arc::new(Mutex::new(connection)),
            staging: staging.into(),
        }
    }

    pub const fn id(&self) -> WorkerId {
        self.id
    }

    async fn call(&self, kind: PacketType, payload: &[u8]) -> DomainResult<()> {
        self.link.lock().await.call(kind, payload).await
    }

    async fn request(
        &self,
        kind: PacketType,
        payload: &[u8],
        reply: PacketType,
    ) -> DomainResult<Packet> {
        self.link.lock().await.request(kind, payload, reply).await
    }

    /// A request was abandoned or answered out of order, so no later reply
    /// on this link can be trusted. A link busy with a request counts as in
    /// step.
    pub fn is_out_of_step(&self) -> bool {
        self.link
            .try_lock()
            .is_ok_and(|link| link.is_out_of_step())
    }

    /// Ask the node to exit.
    pub async fn shutdown(&self) -> DomainResult<()> {
        self.link.lock().await.send_empty(PacketType::Shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl ConcreteExecutor for RemoteWorker {
    async fn image_info(&self) -> DomainResult<Option<ImageInfo>> {
        self.request(PacketType::ImageInfoRequest, &[], PacketType::ImageInfo)
            .await?
            .json()
    }

    async fn update_image(&self, image: &ImageSource) -> DomainResult<()> {
        let data = tokio::fs::read(&image.path)
            .await
            .map_err(|e| DomainError::resource(&image.path, e))?;
        let mut link = self.link.lock().await;
        link.begin()?;
        let request = link.send_json(PacketType::ImageUpdate, &image.info).await?;
        link.send(PacketType::ImageData, &data).await?;
        link.finish(request, PacketType::Ack).await?;
        debug!(worker = self.id, bytes = data.len(), "image transferred");
        Ok(())
    }

    async fn commence(&self, session: &Session) -> DomainResult<()> {
        self.call(PacketType::Commence, &serde_json::to_vec(session)?).await
    }

    async fn shared_data(&self) -> DomainResult<GuestData> {
        self.request(PacketType::GuestDataRequest, &[], PacketType::GuestData)
            .await?
            .json()
    }

    async fn execute(&self, test: &TestCase, _processes: &ProcessSlot) -> DomainResult<()> {
        self.call(PacketType::ExecuteTest, &serde_json::to_vec(test)?).await
    }

    async fn store_trace(&self, test: &TestCase) -> DomainResult<TraceArtifact> {
        let packet = self
            .request(PacketType::StoreTrace, &serde_json::to_vec(test)?, PacketType::TraceData)
            .await?;
        let bundle = TraceBundle::decode(&packet.payload)?;
        tokio::fs::create_dir_all(&self.staging)
            .await
            .map_err(|e| DomainError::resource(&self.staging, e))?;
        let staging = self.staging.clone();
        tokio::task::spawn_blocking(move || bundle.unpack(&staging))
            .await
            .map_err(|e| DomainError::Process(format!("trace unpack task failed: {e}")))?
    }

    async fn reset(&self) -> DomainResult<()> {
        self.call(PacketType::Reset, &[]).await
    }
}

#[async_trait]
impl SymbolicExecutor for RemoteWorker {
    async fn commence(&self, session: &Session) -> DomainResult<()> {
        self.call(PacketType::Commence, &serde_json::to_vec(session)?).await
    }

    async fn translate(&self, trace: &TraceArtifact, _processes: &ProcessSlot) -> DomainResult<()> {
        let artifact = trace.clone();
        let bundle = tokio::task::spawn_blocking(move || TraceBundle::from_artifact(&artifact))
            .await
            .map_err(|e| DomainError::Process(format!("trace bundle task failed: {e}")))??;
        self.call(PacketType::Translate, &bundle.encode()).await
    }

    async fn solve(&self, trace: &TraceArtifact, _processes: &ProcessSlot) -> DomainResult<()> {
        self.call(PacketType::Solve, trace.id.as_bytes()).await
    }

    async fn collect_tests(&self, trace: &TraceArtifact) -> DomainResult<TestBatch> {
        self.request(PacketType::CollectTests, trace.id.as_bytes(), PacketType::TestBatch)
            .await?
            .json()
    }

    async fn clean(&self, trace: &TraceArtifact) -> DomainResult<()> {
        self.call(PacketType::Clean, trace.id.as_bytes()).await
    }

    async fn reset(&self) -> DomainResult<()> {
        self.call(PacketType::Reset, &[]).await
    }
}
