//! Locating a locally installed engine module.
//!
//! Finds the nearest ancestor `package.json` that depends on the package,
//! then resolves its entry point from the nearest `node_modules` at or above
//! that directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use serde::Deserialize;
use serde_json::{Map, Value};

pub const ENGINE_PACKAGE: &str = "scaffdog";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    main: Option<String>,
    #[serde(default)]
    dependencies: Map<String, Value>,
    #[serde(default)]
    dev_dependencies: Map<String, Value>,
}

impl Manifest {
    fn read(path: &Path) -> Option<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                tracing::trace!(path = %path.display(), error = %e, "No manifest");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Unreadable manifest");
                None
            }
        }
    }

    fn depends_on(&self, package: &str) -> bool {
        self.dependencies.contains_key(package) || self.dev_dependencies.contains_key(package)
    }
}

/// Package resolution with an owned cache. `clear` is called on reset.
#[derive(Default)]
pub struct ModuleResolver {
    cache: StdMutex<HashMap<(PathBuf, String), PathBuf>>,
}

impl ModuleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<(PathBuf, String), PathBuf>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Module cache mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn clear(&self) {
        self.cache().clear();
    }

    /// Entry point of `package` as seen from `root`, or `None` when no
    /// ancestor depends on it or it is not installed.
    pub fn find_package(&self, root: &Path, package: &str) -> Option<PathBuf> {
        let key = (root.to_path_buf(), package.to_string());
        if let Some(hit) = self.cache().get(&key) {
            return Some(hit.clone());
        }

        let basedir = root.ancestors().find(|dir| {
            let manifest = dir.join("package.json");
            tracing::debug!(package, path = %manifest.display(), "Finding package");
            manifest.is_file() && Manifest::read(&manifest).is_some_and(|m| m.depends_on(package))
        })?;
        tracing::debug!(basedir = %basedir.display(), "Found package basedir");

        let Some(entry) = resolve_entry(basedir, package) else {
            tracing::error!(package, basedir = %basedir.display(), "Find package error");
            return None;
        };
        self.cache().insert(key, entry.clone());
        Some(entry)
    }
}

/// Search `node_modules/<package>` in `basedir` and each of its ancestors,
/// so hoisted workspace installs resolve too.
fn resolve_entry(basedir: &Path, package: &str) -> Option<PathBuf> {
    basedir.ancestors().find_map(|dir| {
        let package_dir = dir.join("node_modules").join(package);
        if !package_dir.is_dir() {
            return None;
        }
        let entry = package_entry(&package_dir);
        if entry.is_none() {
            tracing::debug!(package_dir = %package_dir.display(), "Installed package has no entry");
        }
        entry
    })
}

fn package_entry(package_dir: &Path) -> Option<PathBuf> {
    let manifest = Manifest::read(&package_dir.join("package.json")).unwrap_or_default();
    let main = manifest.main.unwrap_or_else(|| "index.js".to_string());
    let entry = package_dir.join(main);

    if entry.is_file() {
        return Some(entry);
    }
    if entry.is_dir() {
        let index = entry.join("index.js");
        return index.is_file().then_some(index);
    }
    let with_ext = entry.with_extension("js");
    with_ext.is_file().then_some(with_ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn install(root: &Path, main: Option<&str>) -> PathBuf {
        let pkg = root.join("node_modules/scaffdog");
        let manifest = match main {
            Some(main) => format!(r#"{{ "name": "scaffdog", "main": "{main}" }}"#),
            None => r#"{ "name": "scaffdog" }"#.to_string(),
        };
        write(&pkg.join("package.json"), &manifest);
        pkg
    }

    #[test]
    fn resolves_main_from_nearest_dependent_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            &tmp.path().join("package.json"),
            r#"{ "devDependencies": { "scaffdog": "^4.0.0" } }"#,
        );
        let pkg = install(tmp.path(), Some("dist/index.js"));
        write(&pkg.join("dist/index.js"), "");
        let nested = tmp.path().join("packages/app");
        write(&nested.join("package.json"), r#"{ "dependencies": { "react": "*" } }"#);

        let resolver = ModuleResolver::new();
        let found = resolver.find_package(&nested, ENGINE_PACKAGE).unwrap();
        assert_eq!(found, pkg.join("dist/index.js"));
    }

    #[test]
    fn resolves_hoisted_install_from_workspace_member() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            &tmp.path().join("package.json"),
            r#"{ "private": true, "workspaces": ["packages/*"] }"#,
        );
        let pkg = install(tmp.path(), None);
        write(&pkg.join("index.js"), "");
        let app = tmp.path().join("packages/app");
        write(
            &app.join("package.json"),
            r#"{ "devDependencies": { "scaffdog": "^4.0.0" } }"#,
        );

        let resolver = ModuleResolver::new();
        assert_eq!(
            resolver.find_package(&app.join("src"), ENGINE_PACKAGE),
            Some(pkg.join("index.js"))
        );
    }

    #[test]
    fn nearer_install_wins_over_hoisted_one() {
        let tmp = tempfile::tempdir().unwrap();
        let hoisted = install(tmp.path(), None);
        write(&hoisted.join("index.js"), "");
        let app = tmp.path().join("packages/app");
        write(
            &app.join("package.json"),
            r#"{ "dependencies": { "scaffdog": "4.0.0" } }"#,
        );
        let local = install(&app, None);
        write(&local.join("index.js"), "");

        let resolver = ModuleResolver::new();
        assert_eq!(
            resolver.find_package(&app, ENGINE_PACKAGE),
            Some(local.join("index.js"))
        );
    }

    #[test]
    fn defaults_to_index_and_adds_extension() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            &tmp.path().join("package.json"),
            r#"{ "dependencies": { "scaffdog": "4.0.0" } }"#,
        );
        let pkg = install(tmp.path(), None);
        write(&pkg.join("index.js"), "");
        let resolver = ModuleResolver::new();
        assert_eq!(
            resolver.find_package(tmp.path(), ENGINE_PACKAGE),
            Some(pkg.join("index.js"))
        );

        let other = tempfile::tempdir().unwrap();
        write(
            &other.path().join("package.json"),
            r#"{ "dependencies": { "scaffdog": "4.0.0" } }"#,
        );
        let pkg = install(other.path(), Some("lib/main"));
        write(&pkg.join("lib/main.js"), "");
        assert_eq!(
            resolver.find_package(other.path(), ENGINE_PACKAGE),
            Some(pkg.join("lib/main.js"))
        );
    }

    #[test]
    fn missing_dependency_or_install_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        write(&tmp.path().join("package.json"), "{ not json");
        let resolver = ModuleResolver::new();
        assert_eq!(resolver.find_package(tmp.path(), ENGINE_PACKAGE), None);

        write(
            &tmp.path().join("package.json"),
            r#"{ "dependencies": { "scaffdog": "4.0.0" } }"#,
        );
        assert_eq!(resolver.find_package(tmp.path(), ENGINE_PACKAGE), None);
    }

    #[test]
    fn results_are_cached_until_cleared() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            &tmp.path().join("package.json"),
            r#"{ "dependencies": { "scaffdog": "4.0.0" } }"#,
        );
        let pkg = install(tmp.path(), None);
        write(&pkg.join("index.js"), "");

        let resolver = ModuleResolver::new();
        assert!(resolver.find_package(tmp.path(), ENGINE_PACKAGE).is_some());

        fs::remove_dir_all(tmp.path().join("node_modules")).unwrap();
        assert!(resolver.find_package(tmp.path(), ENGINE_PACKAGE).is_some());

        resolver.clear();
        assert!(resolver.find_package(tmp.path(), ENGINE_PACKAGE).is_none());
    }
}
