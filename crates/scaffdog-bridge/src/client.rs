//! Host-side API: one session per operation.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::bridge::channel::Port;
use crate::bridge::protocol::Method;
use crate::config::BridgeConfig;
use crate::connector::{HostConnector, WorkerConnector};
use crate::engine::EngineLoader;
use crate::error::BridgeError;
use crate::messages::{
    Document, GenerateRequest, GenerateResponse, GeneratedFile, ImportRequest, ImportResponse,
    ListRequest, PromptRequest,
};
use crate::prompt::{self, PromptLibrary};
use crate::session::Session;
use crate::turn;
use crate::worker::{WorkerService, run_worker};

pub struct ScaffdogClient {
    connector: Arc<HostConnector>,
    prompts: Arc<dyn PromptLibrary>,
}

impl ScaffdogClient {
    pub fn new(connector: Arc<HostConnector>, prompts: Arc<dyn PromptLibrary>) -> Self {
        Self { connector, prompts }
    }

    pub fn prompts(&self) -> &dyn PromptLibrary {
        self.prompts.as_ref()
    }

    pub fn connector(&self) -> &HostConnector {
        &self.connector
    }

    pub async fn import(&self, specifier: Option<&str>) -> Result<ImportResponse, BridgeError> {
        let session = self.connector.connect().await?;
        let request = ImportRequest {
            specifier: specifier.map(str::to_string),
        };
        let result = turn::request(&session, &Method::IMPORT, &request).await;
        tracing::debug!(?result, "Import result");
        finish(&session, &Method::IMPORT, result).await
    }

    pub async fn list(&self, request: &ListRequest) -> Result<Vec<Document>, BridgeError> {
        let session = self.connector.connect().await?;
        let result = turn::request(&session, &Method::LIST, request).await;
        finish(&session, &Method::LIST, result).await
    }

    /// Generate files, answering prompt sub-turns with the prompt library.
    /// A dismissed prompt ends with [`BridgeError::Cancelled`].
    pub async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<Vec<GeneratedFile>, BridgeError> {
        let session = self.connector.connect().await?;
        let prompts = self.prompts.as_ref();
        let result = turn::converse(
            &session,
            &Method::GENERATE,
            request,
            move |prompt: PromptRequest| {
                tracing::debug!(title = %prompt.title, step = prompt.step, total = prompt.total, "Prompt request");
                prompt::ask(prompts, prompt)
            },
        )
        .await
        .map(|response: GenerateResponse| response.files);
        finish(&session, &Method::GENERATE, result).await
    }

    pub fn dispose(&self) {
        self.connector.dispose();
    }
}

/// Close the session whatever the outcome, then hand the outcome back.
async fn finish<T>(
    session: &Session,
    method: &Method,
    result: Result<T, BridgeError>,
) -> Result<T, BridgeError> {
    match &result {
        Err(e) if e.is_cancelled() => tracing::info!(session = %session.id(), %method, "Cancelled"),
        Err(e) => tracing::error!(session = %session.id(), %method, error = %e, "Request failed"),
        Ok(_) => {}
    }
    if let Err(e) = session.close().await {
        tracing::warn!(session = %session.id(), error = %e, "Failed to close session");
    }
    result
}

/// Both ends of an in-process worker.
pub struct WorkerHandle {
    host: Arc<HostConnector>,
    worker: Arc<WorkerConnector>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Tear both connectors down. Outstanding operations fail.
    pub fn dispose(&self) {
        self.host.dispose();
        self.worker.dispose();
    }

    /// Wait for the worker loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Worker loop panicked");
        }
    }
}

/// Run a worker on the current runtime, connected in-process.
pub fn spawn_local_worker(
    loader: Arc<dyn EngineLoader>,
    prompts: Arc<dyn PromptLibrary>,
    config: BridgeConfig,
) -> (ScaffdogClient, WorkerHandle) {
    let (host_port, worker_port) = Port::pair();

    let worker = Arc::new(WorkerConnector::new(worker_port));
    let service = Arc::new(WorkerService::new(loader));
    let task = tokio::spawn(run_worker(Arc::clone(&worker), service, config.clone()));

    let host = Arc::new(HostConnector::new(host_port, &config));
    let client = ScaffdogClient::new(Arc::clone(&host), prompts);
    (client, WorkerHandle { host, worker, task })
}
