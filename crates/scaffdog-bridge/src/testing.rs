//! Scripted collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::bridge::protocol::WireError;
use crate::engine::{Engine, EngineLoader, InputProvider, Inputs, Project, ask_questions};
use crate::error::EngineError;
use crate::messages::{AnswerValue, Document, GeneratedFile, PromptRequest};
use crate::prompt::{MultiValidator, PromptItem, PromptLibrary, PromptOptions, PromptResult, Validator};

/// Answers engine questions from a fixed list.
pub struct ScriptedInputs {
    answers: VecDeque<AnswerValue>,
    cancel: bool,
    pub asked: Vec<PromptRequest>,
}

impl ScriptedInputs {
    pub fn new(answers: impl IntoIterator<Item = AnswerValue>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            cancel: false,
            asked: Vec::new(),
        }
    }

    /// Dismisses the first question.
    pub fn cancelling() -> Self {
        Self {
            cancel: true,
            ..Self::new([])
        }
    }
}

#[async_trait]
impl InputProvider for ScriptedInputs {
    async fn provide(&mut self, request: PromptRequest) -> Result<AnswerValue, EngineError> {
        self.asked.push(request);
        if self.cancel {
            return Err(EngineError::Cancelled);
        }
        self.answers
            .pop_front()
            .ok_or_else(|| EngineError::failed("Error", "no scripted answer left"))
    }
}

fn truthy(value: &AnswerValue) -> bool {
    match value {
        AnswerValue::Bool(b) => *b,
        AnswerValue::Text(s) => !s.is_empty(),
        AnswerValue::Many(v) => !v.is_empty(),
    }
}

/// Renders `<output>/<document>.json` holding the collected answers.
pub struct FakeProject {
    documents: Result<Vec<Document>, WireError>,
}

impl FakeProject {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents: Ok(documents),
        }
    }

    pub fn failing(error: WireError) -> Self {
        Self {
            documents: Err(error),
        }
    }
}

#[async_trait]
impl Project for FakeProject {
    async fn list(&self) -> Result<Vec<Document>, EngineError> {
        self.documents.clone().map_err(EngineError::Failed)
    }

    async fn generate(
        &self,
        document: &Document,
        output: &Path,
        inputs: &mut dyn InputProvider,
    ) -> Result<Vec<GeneratedFile>, EngineError> {
        let evaluate = |expr: &str, answers: &Inputs| -> Result<bool, EngineError> {
            Ok(expr
                .strip_prefix("inputs.")
                .and_then(|name| answers.get(name))
                .is_some_and(truthy))
        };
        let answers = ask_questions(document, inputs, &evaluate).await?;
        let content = serde_json::to_string(&answers)
            .map_err(|e| EngineError::failed("Error", e.to_string()))?;

        let name = format!("{}.json", document.name);
        let path = output.join(&name).display().to_string();
        Ok(vec![GeneratedFile::new(path, name, content)])
    }
}

pub struct FakeEngine {
    version: String,
    projects: HashMap<PathBuf, Arc<FakeProject>>,
}

impl FakeEngine {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            projects: HashMap::new(),
        }
    }

    /// Serve `project` when exactly `path` is loaded.
    pub fn with_project(mut self, path: impl Into<PathBuf>, project: FakeProject) -> Self {
        self.projects.insert(path.into(), Arc::new(project));
        self
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn version(&self) -> &str {
        &self.version
    }

    async fn load_project(&self, path: &Path, _cwd: &Path) -> Result<Arc<dyn Project>, EngineError> {
        match self.projects.get(path) {
            Some(project) => Ok(Arc::clone(project) as Arc<dyn Project>),
            None => Err(EngineError::failed(
                "Error",
                format!("no project at {}", path.display()),
            )),
        }
    }
}

pub struct FakeLoader {
    bundled: Arc<FakeEngine>,
    locals: HashMap<String, Arc<FakeEngine>>,
    loads: AtomicUsize,
}

impl FakeLoader {
    pub fn new(bundled: FakeEngine) -> Self {
        Self {
            bundled: Arc::new(bundled),
            locals: HashMap::new(),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn with_local(mut self, specifier: impl Into<String>, engine: FakeEngine) -> Self {
        self.locals.insert(specifier.into(), Arc::new(engine));
        self
    }

    /// Number of `load` calls so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLoader for FakeLoader {
    fn bundled(&self) -> Arc<dyn Engine> {
        Arc::clone(&self.bundled) as Arc<dyn Engine>
    }

    async fn load(&self, specifier: &str) -> Result<Arc<dyn Engine>, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        match self.locals.get(specifier) {
            Some(engine) => Ok(Arc::clone(engine) as Arc<dyn Engine>),
            None => Err(EngineError::failed(
                "Error",
                format!("Cannot find module '{specifier}'"),
            )),
        }
    }
}

/// One prompt shown by [`ScriptedPrompts`].
#[derive(Debug, Clone, PartialEq)]
pub struct PromptCall {
    pub kind: &'static str,
    pub options: PromptOptions,
    pub items: Vec<String>,
}

enum Script {
    Queue(VecDeque<PromptResult<AnswerValue>>),
    ByTitle(HashMap<String, PromptResult<AnswerValue>>),
}

/// Prompt library answering from a script instead of a user.
pub struct ScriptedPrompts {
    script: Mutex<Script>,
    calls: Mutex<Vec<PromptCall>>,
}

impl ScriptedPrompts {
    /// Answers in call order.
    pub fn new(answers: impl IntoIterator<Item = PromptResult<AnswerValue>>) -> Self {
        Self::scripted(Script::Queue(answers.into_iter().collect()))
    }

    /// Answers by prompt title, any number of times.
    pub fn by_title(answers: HashMap<String, PromptResult<AnswerValue>>) -> Self {
        Self::scripted(Script::ByTitle(answers))
    }

    fn scripted(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<PromptCall> {
        self.calls.lock().unwrap().clone()
    }

    async fn next(
        &self,
        kind: &'static str,
        options: PromptOptions,
        items: Vec<PromptItem>,
    ) -> PromptResult<AnswerValue> {
        // Let other sessions interleave with this one.
        tokio::task::yield_now().await;

        let answer = match &mut *self.script.lock().unwrap() {
            Script::Queue(queue) => queue
                .pop_front()
                .unwrap_or_else(|| panic!("no scripted answer for {kind} {:?}", options.title)),
            Script::ByTitle(answers) => answers
                .get(&options.title)
                .cloned()
                .unwrap_or_else(|| panic!("no scripted answer for {:?}", options.title)),
        };
        self.calls.lock().unwrap().push(PromptCall {
            kind,
            options,
            items: items.into_iter().map(|item| item.value).collect(),
        });
        answer
    }
}

#[async_trait]
impl PromptLibrary for ScriptedPrompts {
    async fn input(&self, options: PromptOptions, _validate: &Validator) -> PromptResult<String> {
        self.next("input", options, vec![]).await.map(|value| match value {
            AnswerValue::Text(text) => text,
            other => panic!("input prompt scripted with {other:?}"),
        })
    }

    async fn confirm(&self, options: PromptOptions) -> PromptResult<bool> {
        self.next("confirm", options, vec![]).await.map(|value| match value {
            AnswerValue::Bool(b) => b,
            other => panic!("confirm prompt scripted with {other:?}"),
        })
    }

    async fn list(
        &self,
        options: PromptOptions,
        items: Vec<PromptItem>,
        _validate: &Validator,
    ) -> PromptResult<String> {
        self.next("list", options, items).await.map(|value| match value {
            AnswerValue::Text(text) => text,
            other => panic!("list prompt scripted with {other:?}"),
        })
    }

    async fn select(
        &self,
        options: PromptOptions,
        items: Vec<PromptItem>,
        _validate: &MultiValidator,
    ) -> PromptResult<Vec<String>> {
        self.next("select", options, items).await.map(|value| match value {
            AnswerValue::Many(values) => values,
            other => panic!("select prompt scripted with {other:?}"),
        })
    }
}
