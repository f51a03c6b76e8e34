//! Application payloads for `import`, `list` and `generate`.
//!
//! Fields this side does not model are kept in `extra` and sent back
//! untouched, so documents round-trip through the host unchanged.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    Confirm,
    Input,
    List,
    Checkbox,
}

/// `if` on a question: a literal, or an expression for the engine to
/// evaluate against the answers so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Literal(bool),
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<AnswerValue>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Question {
    pub fn new(kind: QuestionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            choices: None,
            initial: None,
            condition: None,
            extra: Map::new(),
        }
    }

    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_initial(mut self, initial: AnswerValue) -> Self {
        self.initial = Some(initial);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Value used when the question is skipped.
    pub fn initial_value(&self) -> AnswerValue {
        if let Some(initial) = &self.initial {
            return initial.clone();
        }
        match self.kind {
            QuestionKind::Confirm => AnswerValue::Bool(false),
            QuestionKind::Checkbox => AnswerValue::Many(Vec::new()),
            QuestionKind::Input | QuestionKind::List => AnswerValue::Text(String::new()),
        }
    }
}

/// A template document. `questions` keeps the order they were declared in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    #[serde(default)]
    pub templates: Vec<Value>,
    #[serde(default)]
    pub questions: IndexMap<String, Question>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            templates: Vec::new(),
            questions: IndexMap::new(),
            extra: Map::new(),
        }
    }

    pub fn with_question(mut self, name: impl Into<String>, question: Question) -> Self {
        self.questions.insert(name.into(), question);
        self
    }

    pub fn with_template(mut self, template: Value) -> Self {
        self.templates.push(template);
        self
    }

    /// `"2 templates, 1 question"`.
    pub fn describe(&self) -> String {
        format!(
            "{}, {}",
            count("template", self.templates.len()),
            count("question", self.questions.len())
        )
    }
}

pub(crate) fn count(word: &str, n: usize) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub skip: bool,
    pub path: String,
    pub name: String,
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            skip: false,
            path: path.into(),
            name: name.into(),
            content: content.into(),
            extra: Map::new(),
        }
    }

    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRequest {
    pub specifier: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Local,
    Bundle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResponse {
    #[serde(rename = "type")]
    pub kind: ModuleKind,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    pub specifier: Option<String>,
    pub project: String,
    pub root: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub specifier: Option<String>,
    pub project: String,
    pub root: String,
    pub document: Document,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub files: Vec<GeneratedFile>,
}

/// Worker asks the host for one input value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub title: String,
    pub step: usize,
    pub total: usize,
    pub question: Question,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Bool(bool),
    Text(String),
    Many(Vec<String>),
}
