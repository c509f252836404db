//! The workspace manager (spec component C2).
//!
//! Owns the shared code volume. Each job gets its own subdirectory under the
//! workspace root, named after the job id — the fix spec.md §9's Design Notes
//! call for, since naming Java artifacts purely by the extracted class name
//! would otherwise let two concurrent `public class Main` submissions collide.

use coderunner_catalog::LanguageDescriptor;
use coderunner_util::JobId;
use regex::Regex;
use slog::{debug, warn, Logger};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create job directory `{path}`: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write source file `{path}`: {source}")]
    WriteSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to set permissions on `{path}`: {source}")]
    SetPermissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Every path produced while executing one job: the source file, plus whatever the sandbox
/// will additionally materialize (a Java `.class` file, a compiled C/C++ binary).
#[derive(Clone, Debug)]
pub struct ArtifactSet {
    pub job_dir: PathBuf,
    pub source_path: PathBuf,
    pub extra_paths: Vec<PathBuf>,
}

impl ArtifactSet {
    /// All paths that should exist on disk while the job is executing, source first.
    pub fn all_paths(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.source_path.as_path()).chain(self.extra_paths.iter().map(|p| p.as_path()))
    }
}

fn java_class_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"public\s+class\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

/// Extracts the public class name from Java source, per spec.md §4.2. Falls back to `Main` and
/// logs a warning if the pattern isn't found; compilation may still fail downstream, which is
/// expected — the catalog's regex is intentionally narrow (spec.md §9's note about not widening
/// the identifier-only extraction).
pub fn extract_java_class_name(code: &str, log: &Logger) -> String {
    match java_class_regex().captures(code) {
        Some(caps) => caps[1].to_string(),
        None => {
            warn!(log, "no `public class` found in Java source, falling back to Main");
            "Main".to_string()
        }
    }
}

pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Ensures the workspace root exists and is writable. Must succeed before the server starts
    /// accepting submissions (spec.md §4.2's invariant, enforced by C7 at startup).
    pub fn ensure_ready(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| WorkspaceError::CreateDir {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Materializes `code` on disk for `job_id` and returns the set of paths that will exist
    /// while the sandbox runs. Mirrors spec.md §4.2's `prepare` contract.
    pub fn prepare(
        &self,
        descriptor: &LanguageDescriptor,
        code: &str,
        job_id: JobId,
        log: &Logger,
    ) -> Result<ArtifactSet, WorkspaceError> {
        let job_dir = self.root.join(job_id.to_string());
        fs::create_dir_all(&job_dir).map_err(|source| WorkspaceError::CreateDir {
            path: job_dir.clone(),
            source,
        })?;

        let (artifact_name, extra_paths) = if descriptor.tag == "java" {
            let class_name = extract_java_class_name(code, log);
            let class_file = job_dir.join(format!("{class_name}.class"));
            (format!("{class_name}.{}", descriptor.ext), vec![class_file])
        } else if descriptor.tag == "c" || descriptor.tag == "cpp" {
            let uuid = Uuid::new_v4();
            let binary = job_dir.join(format!("{uuid}.out"));
            (format!("{uuid}.{}", descriptor.ext), vec![binary])
        } else {
            let uuid = Uuid::new_v4();
            (format!("{uuid}.{}", descriptor.ext), Vec::new())
        };

        let source_path = job_dir.join(&artifact_name);
        fs::write(&source_path, code).map_err(|source| WorkspaceError::WriteSource {
            path: source_path.clone(),
            source,
        })?;
        fs::set_permissions(&source_path, fs::Permissions::from_mode(0o644)).map_err(|source| {
            WorkspaceError::SetPermissions {
                path: source_path.clone(),
                source,
            }
        })?;

        debug!(log, "prepared artifact set"; "job_dir" => %job_dir.display(), "source" => %source_path.display());

        Ok(ArtifactSet {
            job_dir,
            source_path,
            extra_paths,
        })
    }

    /// Best-effort cleanup: unlinks every known artifact path and removes the now-empty job
    /// directory. Missing files are not errors; I/O errors are logged, never propagated, per
    /// spec.md §4.2.
    pub fn cleanup(&self, artifacts: &ArtifactSet, log: &Logger) {
        for path in artifacts.all_paths() {
            if let Err(err) = fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(log, "failed to remove artifact"; "path" => %path.display(), "error" => %err);
                }
            }
        }
        if let Err(err) = fs::remove_dir(&artifacts.job_dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(log, "failed to remove job directory"; "path" => %artifacts.job_dir.display(), "error" => %err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderunner_catalog::Catalog;
    use slog::Discard;

    fn test_logger() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    #[test]
    fn prepare_scripting_language_writes_only_source() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::ensure_ready(dir.path()).unwrap();
        let catalog = Catalog::with_defaults();
        let python = catalog.resolve("python").unwrap();
        let job_id = coderunner_util::new_job_id();

        let artifacts = workspace
            .prepare(python, "print('hi')", job_id, &test_logger())
            .unwrap();

        assert!(artifacts.source_path.exists());
        assert!(artifacts.extra_paths.is_empty());
        assert_eq!(
            fs::read_to_string(&artifacts.source_path).unwrap(),
            "print('hi')"
        );
    }

    #[test]
    fn prepare_java_uses_extracted_class_name() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::ensure_ready(dir.path()).unwrap();
        let catalog = Catalog::with_defaults();
        let java = catalog.resolve("java").unwrap();
        let job_id = coderunner_util::new_job_id();
        let code = "public class Greeter { public static void main(String[] a) {} }";

        let artifacts = workspace
            .prepare(java, code, job_id, &test_logger())
            .unwrap();

        assert_eq!(
            artifacts.source_path.file_name().unwrap(),
            "Greeter.java"
        );
        assert_eq!(artifacts.extra_paths.len(), 1);
        assert!(artifacts.extra_paths[0].ends_with("Greeter.class"));
    }

    #[test]
    fn prepare_java_falls_back_to_main_without_public_class() {
        let job_id = coderunner_util::new_job_id();
        assert_eq!(extract_java_class_name("System.out.println(1);", &test_logger()), "Main");
        let _ = job_id;
    }

    #[test]
    fn two_concurrent_java_jobs_with_same_class_name_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::ensure_ready(dir.path()).unwrap();
        let catalog = Catalog::with_defaults();
        let java = catalog.resolve("java").unwrap();
        let code = "public class Main { public static void main(String[] a) {} }";

        let a = workspace
            .prepare(java, code, coderunner_util::new_job_id(), &test_logger())
            .unwrap();
        let b = workspace
            .prepare(java, code, coderunner_util::new_job_id(), &test_logger())
            .unwrap();

        assert_ne!(a.source_path, b.source_path);
        assert_ne!(a.job_dir, b.job_dir);
    }

    #[test]
    fn cleanup_removes_source_and_job_dir() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::ensure_ready(dir.path()).unwrap();
        let catalog = Catalog::with_defaults();
        let python = catalog.resolve("python").unwrap();
        let artifacts = workspace
            .prepare(python, "print(1)", coderunner_util::new_job_id(), &test_logger())
            .unwrap();

        workspace.cleanup(&artifacts, &test_logger());

        assert!(!artifacts.source_path.exists());
        assert!(!artifacts.job_dir.exists());
    }

    #[test]
    fn cleanup_is_a_noop_on_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::ensure_ready(dir.path()).unwrap();
        let artifacts = ArtifactSet {
            job_dir: dir.path().join("missing"),
            source_path: dir.path().join("missing").join("a.py"),
            extra_paths: vec![],
        };
        workspace.cleanup(&artifacts, &test_logger());
    }
}
