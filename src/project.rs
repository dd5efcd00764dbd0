//! Resolves a script project directory into a loadable manifest and
//! entry script. Grounded on `ProjectManager.h` and the original's
//! `LuaApi_Project.cpp` manifest table shape; archive extraction itself
//! is an out-of-scope host collaborator, modeled here as a caller-
//! supplied closure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::TasError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTrigger {
    Global,
    Level,
    Manual,
}

#[derive(Debug, Clone)]
pub struct ProjectManifest {
    pub name: String,
    pub author: String,
    pub target_level: String,
    pub entry_script: String,
    pub update_rate: f32,
    pub execution_trigger: ExecutionTrigger,
}

#[derive(Debug, Clone)]
pub struct ResolvedProject {
    pub manifest: ProjectManifest,
    pub main_source: String,
    pub root_dir: Option<PathBuf>,
}

/// Executes `manifest.lua` in a throwaway sandbox (base/string/math
/// only — no io, os, or scheduler APIs) and reads back the manifest
/// table.
fn load_manifest(lua: &mlua::Lua, source: &str) -> Result<ProjectManifest, TasError> {
    let table: mlua::Table = lua
        .load(source)
        .eval()
        .map_err(|e| TasError::ScriptLoadFailure(format!("manifest.lua failed to evaluate: {e}")))?;

    let get_string = |key: &str| -> Result<String, TasError> {
        table
            .get::<String>(key)
            .map_err(|_| TasError::ScriptLoadFailure(format!("manifest missing required field '{key}'")))
    };

    let name = get_string("name")?;
    let author = get_string("author")?;
    let target_level = get_string("target_level")?;
    let entry_script = get_string("entry_script")?;
    let update_rate: f32 = table
        .get::<f64>("update_rate")
        .map_err(|_| TasError::ScriptLoadFailure("manifest missing required field 'update_rate'".to_string()))?
        as f32;
    let execution_trigger = match table.get::<String>("execution_trigger").ok().as_deref() {
        Some("global") => ExecutionTrigger::Global,
        Some("level") => ExecutionTrigger::Level,
        _ => ExecutionTrigger::Manual,
    };

    Ok(ProjectManifest {
        name,
        author,
        target_level,
        entry_script,
        update_rate,
        execution_trigger,
    })
}

fn manifest_sandbox() -> mlua::Lua {
    let lua = mlua::Lua::new();
    let globals = lua.globals();
    for key in ["io", "os", "package", "debug", "coroutine"] {
        let _ = globals.set(key, mlua::Value::Nil);
    }
    lua
}

/// Resolves and validates directory-based script projects, caching
/// extracted archive paths so repeated `prepare` calls on the same
/// archive don't re-extract.
pub struct ProjectManager {
    extracted_archives: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl Default for ProjectManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectManager {
    pub fn new() -> Self {
        ProjectManager {
            extracted_archives: Mutex::new(HashMap::new()),
        }
    }

    pub fn load_manifest_from_dir(&self, dir: &Path) -> Result<ProjectManifest, TasError> {
        let manifest_path = dir.join("manifest.lua");
        let source = std::fs::read_to_string(&manifest_path).map_err(|e| {
            TasError::ScriptLoadFailure(format!(
                "could not read {}: {e}",
                manifest_path.display()
            ))
        })?;
        let lua = manifest_sandbox();
        load_manifest(&lua, &source)
    }

    pub fn resolve_entry_script(
        &self,
        dir: &Path,
        manifest: &ProjectManifest,
    ) -> Result<PathBuf, TasError> {
        let path = dir.join(&manifest.entry_script);
        if !path.is_file() {
            return Err(TasError::ScriptLoadFailure(format!(
                "entry script {} does not exist",
                path.display()
            )));
        }
        Ok(path)
    }

    pub fn prepare_dir(&self, dir: &Path) -> Result<ResolvedProject, TasError> {
        let manifest = self.load_manifest_from_dir(dir)?;
        let entry_path = self.resolve_entry_script(dir, &manifest)?;
        let main_source = std::fs::read_to_string(&entry_path).map_err(|e| {
            TasError::ScriptLoadFailure(format!("could not read {}: {e}", entry_path.display()))
        })?;
        Ok(ResolvedProject {
            manifest,
            main_source,
            root_dir: Some(dir.to_path_buf()),
        })
    }

    /// Prepares an archive project: `extractor` is called at most once
    /// per archive path and its result cached for subsequent calls.
    pub fn prepare_archive(
        &self,
        archive_path: &Path,
        extractor: impl FnOnce(&Path) -> Result<PathBuf, TasError>,
    ) -> Result<ResolvedProject, TasError> {
        let cached = {
            let cache = self.extracted_archives.lock().unwrap_or_else(|e| e.into_inner());
            cache.get(archive_path).cloned()
        };
        let dir = match cached {
            Some(dir) => dir,
            None => {
                let dir = extractor(archive_path)?;
                self.extracted_archives
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(archive_path.to_path_buf(), dir.clone());
                dir
            }
        };
        self.prepare_dir(&dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_project(dir: &Path) {
        let mut manifest = std::fs::File::create(dir.join("manifest.lua")).unwrap();
        writeln!(
            manifest,
            "return {{ name = \"demo\", author = \"me\", target_level = \"L1\", entry_script = \"main.lua\", update_rate = 132 }}"
        )
        .unwrap();
        let mut main = std::fs::File::create(dir.join("main.lua")).unwrap();
        writeln!(main, "function main() end").unwrap();
    }

    #[test]
    fn prepares_a_valid_directory_project() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let manager = ProjectManager::new();
        let resolved = manager.prepare_dir(dir.path()).unwrap();
        assert_eq!(resolved.manifest.name, "demo");
        assert_eq!(resolved.manifest.update_rate, 132.0);
    }

    #[test]
    fn missing_manifest_field_is_a_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.lua"), "return { name = \"x\" }").unwrap();
        let manager = ProjectManager::new();
        assert!(manager.load_manifest_from_dir(dir.path()).is_err());
    }

    #[test]
    fn missing_entry_script_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("manifest.lua"),
            "return { name=\"x\", author=\"a\", target_level=\"l\", entry_script=\"missing.lua\", update_rate=132 }",
        )
        .unwrap();
        let manager = ProjectManager::new();
        let manifest = manager.load_manifest_from_dir(dir.path()).unwrap();
        assert!(manager.resolve_entry_script(dir.path(), &manifest).is_err());
    }

    #[test]
    fn archive_extraction_happens_once() {
        let extracted_to = tempfile::tempdir().unwrap();
        write_project(extracted_to.path());
        let archive_path = PathBuf::from("/fake/archive.zip");
        let manager = ProjectManager::new();
        let calls = std::cell::Cell::new(0);
        let target = extracted_to.path().to_path_buf();
        let extractor = |_: &Path| {
            calls.set(calls.get() + 1);
            Ok(target.clone())
        };
        manager.prepare_archive(&archive_path, extractor).unwrap();
        let extractor2 = |_: &Path| {
            calls.set(calls.get() + 1);
            Ok(target.clone())
        };
        manager.prepare_archive(&archive_path, extractor2).unwrap();
        assert_eq!(calls.get(), 1);
    }
}
