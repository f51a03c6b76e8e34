//! Generation engine boundary.
//!
//! The worker drives an [`Engine`] it obtains from an [`EngineLoader`]:
//! either the bundled engine or one loaded from a local module specifier.
//! Engines render files; this crate only moves their inputs and outputs
//! across the channel.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::error::EngineError;
use crate::messages::{AnswerValue, Condition, Document, GeneratedFile, PromptRequest, Question};

/// Answers collected so far, in question order.
pub type Inputs = IndexMap<String, AnswerValue>;

/// Supplies one value per question. Called sequentially, never
/// concurrently.
#[async_trait]
pub trait InputProvider: Send {
    async fn provide(&mut self, request: PromptRequest) -> Result<AnswerValue, EngineError>;
}

/// A loaded template project.
#[async_trait]
pub trait Project: Send + Sync {
    async fn list(&self) -> Result<Vec<Document>, EngineError>;

    async fn generate(
        &self,
        document: &Document,
        output: &Path,
        inputs: &mut dyn InputProvider,
    ) -> Result<Vec<GeneratedFile>, EngineError>;
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn version(&self) -> &str;

    /// Load the project at `path`. Fails when `path` is not a project.
    async fn load_project(&self, path: &Path, cwd: &Path) -> Result<Arc<dyn Project>, EngineError>;
}

#[async_trait]
pub trait EngineLoader: Send + Sync + 'static {
    fn bundled(&self) -> Arc<dyn Engine>;

    async fn load(&self, specifier: &str) -> Result<Arc<dyn Engine>, EngineError>;
}

/// Evaluates a question's `if` expression against the answers so far.
pub type ConditionEvaluator<'a> = dyn Fn(&str, &Inputs) -> Result<bool, EngineError> + Send + Sync + 'a;

fn should_ask(question: &Question, inputs: &Inputs, evaluate: &ConditionEvaluator<'_>) -> Result<bool, EngineError> {
    match &question.condition {
        None => Ok(true),
        Some(Condition::Literal(value)) => Ok(*value),
        Some(Condition::Expression(expr)) => evaluate(expr, inputs),
    }
}

/// Walk a document's questions in order, asking `provider` for each one
/// whose condition holds. Skipped questions get their initial value.
///
/// `step` is 1-based and counts skipped questions too.
pub async fn ask_questions(
    document: &Document,
    provider: &mut dyn InputProvider,
    evaluate: &ConditionEvaluator<'_>,
) -> Result<Inputs, EngineError> {
    let total = document.questions.len();
    let mut inputs = Inputs::new();

    for (index, (name, question)) in document.questions.iter().enumerate() {
        let step = index + 1;
        let value = if should_ask(question, &inputs, evaluate)? {
            tracing::trace!(%name, step, total, "Asking question");
            provider
                .provide(PromptRequest {
                    title: question.message.clone(),
                    step,
                    total,
                    question: question.clone(),
                })
                .await?
        } else {
            tracing::trace!(%name, step, total, "Question skipped");
            question.initial_value()
        };
        inputs.insert(name.clone(), value);
    }

    Ok(inputs)
}

/// Evaluator for engines without an expression language: every
/// expression is an error.
pub fn no_expressions(expr: &str, _: &Inputs) -> Result<bool, EngineError> {
    Err(EngineError::failed(
        "Error",
        format!("cannot evaluate \"questions.*.if\" expression `{expr}`"),
    ))
}
