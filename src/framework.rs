//! Framework path resolution.
//!
//! The framework is the package the launched server loads. It may be given as
//! an absolute path, as a package name installed in `node_modules`, or not at
//! all, in which case `egg.framework` from the application's `package.json`
//! is used, falling back to `egg`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DevError, DevResult};

pub const DEFAULT_FRAMEWORK: &str = "egg";

/// Turns the `--framework` flag into the value handed to the server entry.
pub trait FrameworkResolver {
    fn resolve(&self, framework: Option<&str>, base_dir: &Path) -> DevResult<String>;
}

/// Looks frameworks up in `node_modules` of the base directory and its ancestors.
#[derive(Debug, Clone, Default)]
pub struct NodeModulesResolver;

#[derive(Debug, Default, Deserialize)]
struct PackageJson {
    egg: Option<EggSection>,
}

#[derive(Debug, Default, Deserialize)]
struct EggSection {
    framework: Option<String>,
}

impl FrameworkResolver for NodeModulesResolver {
    fn resolve(&self, framework: Option<&str>, base_dir: &Path) -> DevResult<String> {
        if let Some(framework) = framework.filter(|f| !f.is_empty()) {
            let path = Path::new(framework);
            if path.is_absolute() {
                if !path.exists() {
                    return Err(DevError::FrameworkResolution(format!(
                        "{} should exist",
                        framework
                    )));
                }
                return Ok(framework.to_string());
            }
            return find_in_node_modules(framework, base_dir);
        }

        let name = read_package_framework(base_dir)?;
        let name = name.as_deref().unwrap_or(DEFAULT_FRAMEWORK);
        find_in_node_modules(name, base_dir)
    }
}

fn read_package_framework(base_dir: &Path) -> DevResult<Option<String>> {
    let path = base_dir.join("package.json");
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(DevError::FrameworkResolution(format!(
                "failed to read {}: {}",
                path.display(),
                err
            )))
        }
    };
    let pkg: PackageJson = serde_json::from_str(&raw).map_err(|err| {
        DevError::FrameworkResolution(format!("failed to parse {}: {}", path.display(), err))
    })?;
    Ok(pkg.egg.and_then(|egg| egg.framework))
}

fn find_in_node_modules(name: &str, base_dir: &Path) -> DevResult<String> {
    let candidates: Vec<PathBuf> = base_dir
        .ancestors()
        .map(|dir| dir.join("node_modules").join(name))
        .collect();
    match candidates.iter().find(|path| path.exists()) {
        Some(path) => Ok(path.to_string_lossy().into_owned()),
        None => Err(DevError::FrameworkResolution(format!(
            "{} is not found in {}",
            name,
            base_dir.join("node_modules").display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join("node_modules").join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn absolute_framework_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let framework = dir.path().to_string_lossy().into_owned();
        let resolved = NodeModulesResolver
            .resolve(Some(&framework), dir.path())
            .unwrap();
        assert_eq!(resolved, framework);

        let missing = dir.path().join("missing").to_string_lossy().into_owned();
        let err = NodeModulesResolver
            .resolve(Some(&missing), dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("should exist"));
    }

    #[test]
    fn package_name_resolves_from_ancestor_node_modules() {
        let root = tempfile::tempdir().unwrap();
        let installed = install(root.path(), "yadan");
        let app = root.path().join("apps").join("web");
        std::fs::create_dir_all(&app).unwrap();

        let resolved = NodeModulesResolver.resolve(Some("yadan"), &app).unwrap();
        assert_eq!(PathBuf::from(resolved), installed);
    }

    #[test]
    fn package_json_framework_is_used() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name":"app","egg":{"framework":"aliyun-egg"}}"#,
        )
        .unwrap();
        let installed = install(dir.path(), "aliyun-egg");
        install(dir.path(), "egg");

        let resolved = NodeModulesResolver.resolve(None, dir.path()).unwrap();
        assert_eq!(PathBuf::from(resolved), installed);
    }

    #[test]
    fn defaults_to_egg() {
        let dir = tempfile::tempdir().unwrap();
        let installed = install(dir.path(), "egg");
        let resolved = NodeModulesResolver.resolve(None, dir.path()).unwrap();
        assert_eq!(PathBuf::from(resolved), installed);
    }

    #[test]
    fn missing_framework_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = NodeModulesResolver
            .resolve(Some("no-such-framework"), dir.path())
            .unwrap_err();
        assert!(matches!(err, DevError::FrameworkResolution(_)));
        assert!(err.to_string().contains("no-such-framework is not found"));
    }
}
