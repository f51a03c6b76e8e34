//! Interactive prompt boundary on the host.
//!
//! The widgets themselves live with the embedding application; this module
//! fixes the four operations the host needs and how prompt sub-turns map
//! onto them.

use async_trait::async_trait;

use crate::error::BridgeError;
use crate::messages::{AnswerValue, PromptRequest, QuestionKind};
use crate::turn::Answer;

/// Returns a message when the value is rejected.
pub type Validator = dyn Fn(&str) -> Option<String> + Send + Sync;
pub type MultiValidator = dyn Fn(&[String]) -> Option<String> + Send + Sync;

const REQUIRED: &str = "required input!";

pub fn required(value: &str) -> Option<String> {
    value.is_empty().then(|| REQUIRED.to_string())
}

pub fn required_many(values: &[String]) -> Option<String> {
    values.is_empty().then(|| REQUIRED.to_string())
}

pub fn accept_any(_: &str) -> Option<String> {
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptResult<T> {
    Value(T),
    /// The prompt was dismissed.
    Cancel,
}

impl<T> PromptResult<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PromptResult<U> {
        match self {
            Self::Value(value) => PromptResult::Value(f(value)),
            Self::Cancel => PromptResult::Cancel,
        }
    }
}

impl<T> From<PromptResult<T>> for Answer<T> {
    fn from(result: PromptResult<T>) -> Self {
        match result {
            PromptResult::Value(value) => Answer::Value(value),
            PromptResult::Cancel => Answer::Cancel,
        }
    }
}

/// Title plus optional `step`/`total` progress.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PromptOptions {
    pub title: String,
    pub step: Option<usize>,
    pub total: Option<usize>,
}

impl PromptOptions {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            step: None,
            total: None,
        }
    }

    pub fn with_progress(mut self, step: usize, total: usize) -> Self {
        self.step = Some(step);
        self.total = Some(total);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptItem {
    pub value: String,
    pub description: Option<String>,
}

impl PromptItem {
    pub fn described(value: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            description: Some(description.into()),
        }
    }
}

impl From<&str> for PromptItem {
    fn from(value: &str) -> Self {
        Self {
            value: value.to_string(),
            description: None,
        }
    }
}

impl From<String> for PromptItem {
    fn from(value: String) -> Self {
        Self {
            value,
            description: None,
        }
    }
}

#[async_trait]
pub trait PromptLibrary: Send + Sync {
    /// Free text. Implementations trim the value before validating it.
    async fn input(&self, options: PromptOptions, validate: &Validator) -> PromptResult<String>;

    async fn confirm(&self, options: PromptOptions) -> PromptResult<bool>;

    /// Single selection.
    async fn list(
        &self,
        options: PromptOptions,
        items: Vec<PromptItem>,
        validate: &Validator,
    ) -> PromptResult<String>;

    /// Multiple selection.
    async fn select(
        &self,
        options: PromptOptions,
        items: Vec<PromptItem>,
        validate: &MultiValidator,
    ) -> PromptResult<Vec<String>>;
}

/// Answer one prompt sub-turn with the matching widget.
pub async fn ask(
    prompts: &dyn PromptLibrary,
    request: PromptRequest,
) -> Result<Answer<AnswerValue>, BridgeError> {
    let options = PromptOptions::new(request.title).with_progress(request.step, request.total);
    let items = || -> Vec<PromptItem> {
        request
            .question
            .choices
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(PromptItem::from)
            .collect()
    };

    let result = match request.question.kind {
        QuestionKind::Confirm => prompts.confirm(options).await.map(AnswerValue::Bool),
        QuestionKind::Checkbox => prompts
            .select(options, items(), &required_many)
            .await
            .map(AnswerValue::Many),
        QuestionKind::List => prompts
            .list(options, items(), &required)
            .await
            .map(AnswerValue::Text),
        QuestionKind::Input => prompts.input(options, &required).await.map(AnswerValue::Text),
    };
    tracing::debug!(?result, "Prompt result");
    Ok(result.into())
}
