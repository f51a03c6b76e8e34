//! Worker side - accepts sessions and serves `import`, `list`, `generate`.
//!
//! Flow:
//! 1. Keep `accept_backlog` unbound sessions in the idle pool
//! 2. Each claimed session is served on its own task: one request, one
//!    reply (with prompt sub-turns for `generate`)
//! 3. The host closes the session; the worker never does
//! 4. The loop ends when the connector is disposed or the channel closes

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::channel::Port;
use crate::bridge::protocol::{Method, WireError};
use crate::config::BridgeConfig;
use crate::connector::WorkerConnector;
use crate::engine::{Engine, EngineLoader, InputProvider, Project};
use crate::error::{BridgeError, EngineError};
use crate::messages::{
    AnswerValue, Document, GenerateRequest, GenerateResponse, ImportRequest, ImportResponse, ListRequest,
    ModuleKind, PromptRequest,
};
use crate::project::ProjectCache;
use crate::session::{Received, Session};
use crate::turn::{Answer, Prompter, Turn};
use crate::version::{EngineVersion, MIN_ENGINE_VERSION};

/// Cache key of the bundled engine.
const BUNDLED_KEY: &str = "__BUNDLE_SPECIFY__";

#[derive(Clone)]
struct CachedEngine {
    kind: ModuleKind,
    engine: Arc<dyn Engine>,
    projects: Arc<ProjectCache<Arc<dyn Project>>>,
}

impl CachedEngine {
    fn new(kind: ModuleKind, engine: Arc<dyn Engine>) -> Self {
        Self {
            kind,
            engine,
            projects: Arc::new(ProjectCache::new()),
        }
    }

    fn response(&self) -> ImportResponse {
        ImportResponse {
            kind: self.kind,
            version: self.engine.version().to_string(),
        }
    }
}

/// Request handling shared by every session task.
pub struct WorkerService {
    loader: Arc<dyn EngineLoader>,
    modules: StdMutex<HashMap<String, CachedEngine>>,
}

impl WorkerService {
    pub fn new(loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            loader,
            modules: StdMutex::new(HashMap::new()),
        }
    }

    fn modules(&self) -> MutexGuard<'_, HashMap<String, CachedEngine>> {
        match self.modules.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Module cache mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    fn cache(&self, key: &str, entry: CachedEngine) -> ImportResponse {
        let response = entry.response();
        self.modules().insert(key.to_string(), entry);
        response
    }

    fn bundled(&self) -> CachedEngine {
        CachedEngine::new(ModuleKind::Bundle, self.loader.bundled())
    }

    /// Pick the engine for `specifier`, loading and caching it on first use.
    pub async fn import(&self, specifier: Option<&str>) -> ImportResponse {
        let key = specifier.unwrap_or(BUNDLED_KEY);
        let cached = self.modules().get(key).map(CachedEngine::response);
        if let Some(mut response) = cached {
            // Repeat imports report the caller's choice, not the fallback taken.
            response.kind = if specifier.is_some() {
                ModuleKind::Local
            } else {
                ModuleKind::Bundle
            };
            return response;
        }

        if let Some(specifier) = specifier {
            match self.loader.load(specifier).await {
                Ok(engine) => match engine.version().parse::<EngineVersion>() {
                    Ok(version) if version.satisfies_minimum() => {
                        tracing::info!(%specifier, %version, "Using local engine");
                        return self.cache(specifier, CachedEngine::new(ModuleKind::Local, engine));
                    }
                    _ => {
                        tracing::warn!(
                            %specifier,
                            version = engine.version(),
                            minimum = %MIN_ENGINE_VERSION,
                            "Local engine too old, using bundled engine"
                        );
                        return self.cache(specifier, self.bundled());
                    }
                },
                Err(e) => {
                    tracing::warn!(%specifier, error = %e, "Failed to load local engine");
                    self.cache(specifier, self.bundled());
                }
            }
        }

        self.cache(BUNDLED_KEY, self.bundled())
    }

    /// Engine cached for `specifier`, or the bundled one.
    fn engine_for(&self, specifier: Option<&str>) -> CachedEngine {
        let mut modules = self.modules();
        if let Some(entry) = specifier.and_then(|s| modules.get(s)) {
            return entry.clone();
        }
        if specifier.is_some() {
            tracing::debug!(?specifier, "Engine not imported, using bundled engine");
        }
        modules
            .entry(BUNDLED_KEY.to_string())
            .or_insert_with(|| CachedEngine::new(ModuleKind::Bundle, self.loader.bundled()))
            .clone()
    }

    async fn project(
        &self,
        specifier: Option<&str>,
        root: &str,
        patterns: &str,
    ) -> Result<Arc<dyn Project>, EngineError> {
        let cached = self.engine_for(specifier);
        let engine = Arc::clone(&cached.engine);
        let project = cached
            .projects
            .resolve(Path::new(root), patterns, |candidate, cwd| {
                let engine = Arc::clone(&engine);
                async move { engine.load_project(&candidate, &cwd).await }
            })
            .await?;
        Ok(project)
    }

    pub async fn list(&self, request: &ListRequest) -> Result<Vec<Document>, EngineError> {
        let project = self
            .project(request.specifier.as_deref(), &request.root, &request.project)
            .await?;
        project.list().await
    }

    /// Serve the one request a claimed session carries.
    pub async fn serve(&self, session: Session) {
        let id = session.id();
        let (method, received) = match session.receive_any().await {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(session = %id, error = %e, "Failed to receive request");
                return;
            }
        };
        let body = match received {
            Received::Success(body) => body,
            Received::Failure(error) if error.is_desync() => {
                tracing::debug!(session = %id, "Session closed before a request arrived");
                return;
            }
            Received::Failure(error) => {
                tracing::error!(session = %id, error = %error, "Request carried an error");
                return;
            }
        };

        tracing::debug!(session = %id, %method, "Serving request");
        let result = if method == Method::IMPORT {
            self.serve_import(&session, body).await
        } else if method == Method::LIST {
            self.serve_list(&session, body).await
        } else if method == Method::GENERATE {
            self.serve_generate(&session, body).await
        } else {
            tracing::warn!(session = %id, %method, "Unknown method");
            session.send_error(
                &method,
                WireError::new("Error", format!("unknown method `{method}`")),
            )
        };

        if let Err(e) = result {
            tracing::warn!(session = %id, %method, error = %e, "Failed to reply");
        }
    }

    async fn serve_import(&self, session: &Session, body: Value) -> Result<(), BridgeError> {
        let Some(request) = parse_or_reject::<ImportRequest>(session, &Method::IMPORT, body)? else {
            return Ok(());
        };
        let response = self.import(request.specifier.as_deref()).await;
        session.send_json(&Method::IMPORT, &response)
    }

    async fn serve_list(&self, session: &Session, body: Value) -> Result<(), BridgeError> {
        let Some(request) = parse_or_reject::<ListRequest>(session, &Method::LIST, body)? else {
            return Ok(());
        };
        match self.list(&request).await {
            Ok(documents) => session.send_json(&Method::LIST, &documents),
            Err(e) => {
                let mut error = e.into_wire();
                error.message = error.summary();
                tracing::error!(session = %session.id(), error = %error.message, "List failed");
                session.send_error(&Method::LIST, error)
            }
        }
    }

    async fn serve_generate(&self, session: &Session, body: Value) -> Result<(), BridgeError> {
        let method = Method::GENERATE;
        let Some(turn) = parse_or_reject::<Turn<GenerateRequest, Value>>(session, &method, body)?
        else {
            return Ok(());
        };
        let Turn::Main(request) = turn else {
            return session.send_error(
                &method,
                WireError::new(WireError::VALIDATION, "expected a `main` turn"),
            );
        };

        let prompter = Prompter::new(session.clone(), method);
        let result = async {
            let project = self
                .project(request.specifier.as_deref(), &request.root, &request.project)
                .await?;
            let mut inputs = PromptInputs::new(prompter.clone());
            project
                .generate(&request.document, Path::new(&request.output), &mut inputs)
                .await
        }
        .await;

        match result {
            Ok(files) => {
                tracing::debug!(session = %session.id(), files = files.len(), "Generated");
                prompter.finish(&GenerateResponse { files })
            }
            Err(EngineError::Cancelled) => {
                // The host closes the session.
                tracing::info!(session = %session.id(), "Generate cancelled");
                Ok(())
            }
            Err(e) => {
                tracing::error!(session = %session.id(), error = %e, "Generate failed");
                prompter.fail(e.into_wire())
            }
        }
    }
}

/// Decode a request body, replying with a validation error on mismatch.
fn parse_or_reject<T: DeserializeOwned>(
    session: &Session,
    method: &Method,
    body: Value,
) -> Result<Option<T>, BridgeError> {
    match serde_json::from_value(body) {
        Ok(request) => Ok(Some(request)),
        Err(e) => {
            let error = BridgeError::validation(method, e);
            tracing::warn!(session = %session.id(), error = %error, "Rejecting request");
            session.send_error(method, error.to_wire())?;
            Ok(None)
        }
    }
}

/// Turns each engine input request into a prompt sub-turn.
pub struct PromptInputs {
    prompter: Prompter,
}

impl PromptInputs {
    pub fn new(prompter: Prompter) -> Self {
        Self { prompter }
    }
}

#[async_trait]
impl InputProvider for PromptInputs {
    async fn provide(&mut self, request: PromptRequest) -> Result<AnswerValue, EngineError> {
        match self.prompter.ask::<_, AnswerValue>(&request).await {
            Ok(Answer::Value(value)) => Ok(value),
            Ok(Answer::Cancel) => Err(EngineError::Cancelled),
            Err(BridgeError::Remote(error)) => Err(EngineError::failed(
                "Error",
                format!("Inputs error ({})", error.message),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

/// Accept loop. Resolves once the connector stops handing out sessions.
///
/// The backlog is queued in the idle pool when this is called, so a host
/// may connect as soon as it returns, before the loop is first polled.
pub fn run_worker(
    connector: Arc<WorkerConnector>,
    service: Arc<WorkerService>,
    config: BridgeConfig,
) -> impl Future<Output = ()> + Send + 'static {
    let backlog = config.accept_backlog.max(1);
    let mut pending: FuturesUnordered<_> = (0..backlog).map(|_| connector.wait()).collect();
    tracing::info!(backlog, "Worker accepting sessions");

    async move {
        while let Some(accepted) = pending.next().await {
            match accepted {
                Ok(session) => {
                    pending.push(connector.wait());
                    let service = Arc::clone(&service);
                    tokio::spawn(async move { service.serve(session).await });
                }
                Err(BridgeError::ChannelClosed) => break,
                Err(e) => {
                    if connector.is_closed() {
                        break;
                    }
                    tracing::error!(error = %e, "Accept failed");
                    pending.push(connector.wait());
                }
            }
        }

        tracing::info!("Worker loop exiting");
    }
}

/// Serve over this process's stdin/stdout.
pub async fn run_stdio_worker(service: Arc<WorkerService>, config: BridgeConfig) {
    let port = Port::framed(tokio::io::stdin(), tokio::io::stdout());
    let connector = Arc::new(WorkerConnector::new(port));
    run_worker(connector, service, config).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::HostConnector;
    use crate::messages::{Question, QuestionKind};
    use crate::testing::{FakeEngine, FakeLoader, FakeProject};
    use crate::turn::{converse, request};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        host: HostConnector,
        worker: Arc<WorkerConnector>,
        loader: Arc<FakeLoader>,
        task: tokio::task::JoinHandle<()>,
    }

    fn harness(loader: FakeLoader) -> Harness {
        let (host_port, worker_port) = Port::pair();
        let loader = Arc::new(loader);
        let worker = Arc::new(WorkerConnector::new(worker_port));
        let service = Arc::new(WorkerService::new(loader.clone()));
        let task = tokio::spawn(run_worker(
            Arc::clone(&worker),
            service,
            BridgeConfig::default().with_accept_backlog(2),
        ));
        Harness {
            host: HostConnector::new(host_port, &BridgeConfig::default()),
            worker,
            loader,
            task,
        }
    }

    fn project_loader(root: &str) -> FakeLoader {
        let document = Document::new("component")
            .with_question("name", Question::new(QuestionKind::Input, "Name?"));
        FakeLoader::new(FakeEngine::new("4.0.0").with_project(
            format!("{root}/.scaffdog"),
            FakeProject::new(vec![document]),
        ))
    }

    async fn import(host: &HostConnector, specifier: Option<&str>) -> ImportResponse {
        let session = host.connect().await.unwrap();
        let response = request(&session, &Method::IMPORT, &ImportRequest {
            specifier: specifier.map(str::to_string),
        })
        .await
        .unwrap();
        session.close().await.unwrap();
        response
    }

    #[tokio::test]
    async fn import_without_specifier_uses_bundle() {
        let h = harness(FakeLoader::new(FakeEngine::new("4.0.0")));
        let response = import(&h.host, None).await;
        assert_eq!(
            response,
            ImportResponse {
                kind: ModuleKind::Bundle,
                version: "4.0.0".into()
            }
        );
    }

    #[tokio::test]
    async fn import_gates_local_engines_on_version() {
        let loader = FakeLoader::new(FakeEngine::new("4.0.0"))
            .with_local("/proj/new", FakeEngine::new("3.1.0"))
            .with_local("/proj/old", FakeEngine::new("1.2.0"));
        let h = harness(loader);

        let fresh = import(&h.host, Some("/proj/new")).await;
        assert_eq!(fresh.kind, ModuleKind::Local);
        assert_eq!(fresh.version, "3.1.0");

        let old = import(&h.host, Some("/proj/old")).await;
        assert_eq!(old.kind, ModuleKind::Bundle);
        assert_eq!(old.version, "4.0.0");

        let missing = import(&h.host, Some("/proj/missing")).await;
        assert_eq!(missing.kind, ModuleKind::Bundle);
    }

    #[tokio::test]
    async fn import_is_cached_by_specifier() {
        let loader = FakeLoader::new(FakeEngine::new("4.0.0"))
            .with_local("/proj/old", FakeEngine::new("1.0.0"));
        let h = harness(loader);

        let first = import(&h.host, Some("/proj/old")).await;
        assert_eq!(first.kind, ModuleKind::Bundle);
        assert_eq!(first.version, "4.0.0");

        for _ in 0..2 {
            let response = import(&h.host, Some("/proj/old")).await;
            assert_eq!(response.kind, ModuleKind::Local);
            assert_eq!(response.version, "4.0.0");
        }
        assert_eq!(h.loader.loads(), 1);
    }

    #[tokio::test]
    async fn repeated_bundled_import_stays_bundle() {
        let h = harness(FakeLoader::new(FakeEngine::new("4.0.0")));
        for _ in 0..2 {
            assert_eq!(import(&h.host, None).await.kind, ModuleKind::Bundle);
        }
        assert_eq!(h.loader.loads(), 0);
    }

    #[tokio::test]
    async fn prerelease_local_engine_falls_back_to_bundle() {
        let loader = FakeLoader::new(FakeEngine::new("4.0.0"))
            .with_local("/proj/rc", FakeEngine::new("2.0.0-rc.1"));
        let h = harness(loader);
        let response = import(&h.host, Some("/proj/rc")).await;
        assert_eq!(response.kind, ModuleKind::Bundle);
        assert_eq!(response.version, "4.0.0");
    }

    #[tokio::test]
    async fn list_resolves_project_upwards() {
        let h = harness(project_loader("/work"));
        let session = h.host.connect().await.unwrap();
        let documents: Vec<Document> = request(
            &session,
            &Method::LIST,
            &ListRequest {
                specifier: None,
                project: ".scaffdog".into(),
                root: "/work/src/deep".into(),
            },
        )
        .await
        .unwrap();
        session.close().await.unwrap();

        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].name, "component");
    }

    #[tokio::test]
    async fn list_failure_summarizes_nested_errors() {
        let loader = FakeLoader::new(FakeEngine::new("4.0.0").with_project(
            "/work/.scaffdog",
            FakeProject::failing(
                WireError::new("Error", "2 documents failed to parse")
                    .with_errors(vec![WireError::new("E", "a.md"), WireError::new("E", "b.md")]),
            ),
        ));
        let h = harness(loader);
        let session = h.host.connect().await.unwrap();
        let err = request::<_, Vec<Document>>(
            &session,
            &Method::LIST,
            &ListRequest {
                specifier: None,
                project: ".scaffdog".into(),
                root: "/work".into(),
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "2 documents failed to parse (a.md, b.md)");
    }

    #[tokio::test]
    async fn list_without_project_fails() {
        let h = harness(FakeLoader::new(FakeEngine::new("4.0.0")));
        let session = h.host.connect().await.unwrap();
        let err = request::<_, Vec<Document>>(
            &session,
            &Method::LIST,
            &json!({ "specifier": null, "project": ".scaffdog", "root": "/nowhere" }),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().starts_with("Cannot resolve scaffdog project!"));
    }

    #[tokio::test]
    async fn malformed_request_gets_validation_error() {
        let h = harness(FakeLoader::new(FakeEngine::new("4.0.0")));
        let session = h.host.connect().await.unwrap();
        session.send(&Method::LIST, json!({ "root": 42 })).unwrap();
        let received = session.receive(&Method::LIST).await.unwrap();
        match received {
            Received::Failure(error) => assert_eq!(error.name, WireError::VALIDATION),
            other => panic!("unexpected reply: {other:?}"),
        }

        // The worker keeps serving other sessions.
        assert_eq!(import(&h.host, None).await.kind, ModuleKind::Bundle);
    }

    #[tokio::test]
    async fn generate_prompts_then_finishes() {
        let h = harness(project_loader("/work"));
        let session = h.host.connect().await.unwrap();
        let document = Document::new("component")
            .with_question("name", Question::new(QuestionKind::Input, "Name?"));
        let req = GenerateRequest {
            specifier: None,
            project: ".scaffdog".into(),
            root: "/work".into(),
            document,
            output: "/work/out".into(),
        };

        let mut prompts = Vec::new();
        let response: GenerateResponse = converse(&session, &Method::GENERATE, &req, |p: PromptRequest| {
            prompts.push((p.title, p.step, p.total));
            async { Ok(Answer::Value(AnswerValue::Text("button".into()))) }
        })
        .await
        .unwrap();
        session.close().await.unwrap();

        assert_eq!(prompts, [("Name?".to_string(), 1, 1)]);
        assert_eq!(response.files.len(), 1);
        assert!(response.files[0].content.contains("button"));
    }

    #[tokio::test]
    async fn accept_loop_rearms_after_each_claim() {
        let h = harness(FakeLoader::new(FakeEngine::new("4.0.0")));

        // As many concurrent opens as the backlog holds.
        let (a, b) = tokio::join!(h.host.connect(), h.host.connect());
        let mut sessions = vec![a.unwrap(), b.unwrap()];

        // More sessions than the backlog, all left open.
        for _ in 0..4 {
            sessions.push(h.host.connect().await.unwrap());
        }
        assert_eq!(h.host.active_sessions(), 6);

        for session in &sessions {
            session.close().await.unwrap();
        }
        assert_eq!(h.host.active_sessions(), 0);
    }

    #[tokio::test]
    async fn loop_exits_on_dispose() {
        let h = harness(FakeLoader::new(FakeEngine::new("4.0.0")));
        tokio::task::yield_now().await;
        h.worker.dispose();
        tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .unwrap()
            .unwrap();
    }
}
