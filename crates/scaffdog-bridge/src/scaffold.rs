//! Host scaffolding flow: pick a document, generate, write the files.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::client::ScaffdogClient;
use crate::config::ScaffdogConfig;
use crate::error::{BridgeError, ScaffoldError};
use crate::messages::{GenerateRequest, GeneratedFile, ImportResponse, ListRequest, ModuleKind, count};
use crate::module::{ENGINE_PACKAGE, ModuleResolver};
use crate::prompt::{PromptItem, PromptLibrary, PromptOptions, PromptResult, accept_any};
use crate::version::{EngineVersion, MIN_ENGINE_VERSION};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaffoldReport {
    pub written: Vec<GeneratedFile>,
    pub skipped: Vec<GeneratedFile>,
}

impl ScaffoldReport {
    /// `"Generated 2 files! (1 skipped)"`.
    pub fn summary(&self) -> String {
        let skipped = if self.skipped.is_empty() {
            String::new()
        } else {
            format!(" ({} skipped)", self.skipped.len())
        };
        format!("Generated {}!{skipped}", count("file", self.written.len()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaffoldOutcome {
    Completed(ScaffoldReport),
    /// A prompt was dismissed. Nothing was written.
    Cancelled,
}

#[derive(Debug, Clone)]
struct Workspace {
    root: PathBuf,
    specifier: Option<String>,
}

pub struct Scaffolder {
    client: ScaffdogClient,
    modules: ModuleResolver,
    config: ScaffdogConfig,
    workspace: Mutex<Option<Workspace>>,
}

impl Scaffolder {
    pub fn new(client: ScaffdogClient, config: ScaffdogConfig) -> Self {
        Self {
            client,
            modules: ModuleResolver::new(),
            config,
            workspace: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &ScaffdogClient {
        &self.client
    }

    /// Find the local engine for `root` and ask the worker to import it.
    pub async fn initialize(&self, root: &Path) -> Result<ImportResponse, ScaffoldError> {
        let specifier = self
            .modules
            .find_package(root, ENGINE_PACKAGE)
            .map(|p| p.display().to_string());
        tracing::debug!(?specifier, "Found module path");

        let info = self.client.import(specifier.as_deref()).await?;
        tracing::info!(version = %info.version, "Found module version");

        let local = info.kind == ModuleKind::Local
            && info
                .version
                .parse::<EngineVersion>()
                .is_ok_and(|v| v.satisfies_minimum());
        if local {
            tracing::info!(version = %info.version, "Use local scaffdog module");
        } else {
            tracing::info!(version = %info.version, "Use bundle scaffdog module");
            tracing::warn!(
                "scaffdog requires a minimum \"v{MIN_ENGINE_VERSION}\" version. Modules bundled in extensions were used instead of local modules."
            );
        }

        *self.workspace.lock().await = Some(Workspace {
            root: root.to_path_buf(),
            specifier,
        });
        Ok(info)
    }

    /// Drop cached module paths and initialize again.
    pub async fn reset(&self) -> Result<ImportResponse, ScaffoldError> {
        self.modules.clear();
        let root = self
            .workspace
            .lock()
            .await
            .as_ref()
            .map(|w| w.root.clone())
            .ok_or(ScaffoldError::NotInitialized)?;
        let info = self.initialize(&root).await?;
        tracing::info!("scaffdog reset!");
        Ok(info)
    }

    /// Pick a document, generate it into `target`, write the files.
    pub async fn run(&self, target: &Path) -> Result<ScaffoldOutcome, ScaffoldError> {
        let workspace = self
            .workspace
            .lock()
            .await
            .clone()
            .ok_or(ScaffoldError::NotInitialized)?;
        tracing::debug!(path = %target.display(), "Select path");

        let root = workspace.root.display().to_string();
        let documents = self
            .client
            .list(&ListRequest {
                specifier: workspace.specifier.clone(),
                project: self.config.project.clone(),
                root: root.clone(),
            })
            .await?;

        let items = documents
            .iter()
            .map(|d| PromptItem::described(d.name.clone(), d.describe()))
            .collect();
        let prompts = self.client.prompts();
        let name = match prompts
            .list(PromptOptions::new("Please select a document:"), items, &accept_any)
            .await
        {
            PromptResult::Value(name) => name,
            PromptResult::Cancel => {
                tracing::info!("Scaffold cancelled");
                return Ok(ScaffoldOutcome::Cancelled);
            }
        };
        let Some(document) = documents.into_iter().find(|d| d.name == name) else {
            return Err(ScaffoldError::InvalidDocument(name));
        };
        tracing::debug!(%name, "Document selected");

        let files = match self
            .client
            .generate(&GenerateRequest {
                specifier: workspace.specifier,
                project: self.config.project.clone(),
                root,
                document,
                output: target.display().to_string(),
            })
            .await
        {
            Ok(files) => files,
            Err(BridgeError::Cancelled) => {
                tracing::info!("Scaffold cancelled");
                return Ok(ScaffoldOutcome::Cancelled);
            }
            Err(e) => return Err(e.into()),
        };

        let report = write_files(files, self.config.force, prompts).await?;
        tracing::info!("{}", report.summary());
        for file in &report.written {
            tracing::info!("- \"{}\"", file.path);
        }
        for file in &report.skipped {
            tracing::info!("- \"{}\" (skipped)", file.path);
        }
        Ok(ScaffoldOutcome::Completed(report))
    }
}

/// Write generated files. Existing files are replaced only with `force`
/// or a confirmed overwrite prompt.
pub async fn write_files(
    files: Vec<GeneratedFile>,
    force: bool,
    prompts: &dyn PromptLibrary,
) -> Result<ScaffoldReport, ScaffoldError> {
    let mut report = ScaffoldReport::default();

    for file in files {
        if file.skip {
            report.skipped.push(file);
            continue;
        }

        let target = PathBuf::from(&file.path);
        let exists = tokio::fs::try_exists(&target)
            .await
            .map_err(|source| ScaffoldError::Write {
                path: target.clone(),
                source,
            })?;
        if exists && !force {
            let title = format!(
                "The file to be generated already exists! Overwrite \"{}\"?",
                target.display()
            );
            let overwrite = prompts.confirm(PromptOptions::new(title)).await;
            if overwrite != PromptResult::Value(true) {
                report.skipped.push(file.skipped());
                continue;
            }
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ScaffoldError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&target, file.content.as_bytes())
            .await
            .map_err(|source| ScaffoldError::Write {
                path: target.clone(),
                source,
            })?;
        report.written.push(file);
    }

    Ok(report)
}
