//! Static script and requirement files mounted into workloads
//!
//! Files under `resources/` are embedded at build time; a directory on disk
//! can stand in for them when iterating on scripts.

use std::path::PathBuf;

use base64::{Engine as _, engine::general_purpose};
use tracing::debug;

use crate::error::{Error, Result};

mod embedded {
    include!(concat!(env!("OUT_DIR"), "/embedded_resources.rs"));
}

/// Source of named static files
pub trait ContentSource: Send + Sync {
    fn read(&self, name: &str) -> Result<Vec<u8>>;

    /// Names this source can serve, sorted
    fn names(&self) -> Vec<String>;
}

/// Files compiled into the binary from `resources/`
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedResources;

impl ContentSource for EmbeddedResources {
    fn read(&self, name: &str) -> Result<Vec<u8>> {
        let encoded = embedded::get_resource(name)
            .ok_or_else(|| Error::content(format!("no embedded resource named '{}'", name)))?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::content(format!("embedded resource '{}' is corrupt: {}", name, e)))
    }

    fn names(&self) -> Vec<String> {
        embedded::resource_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

/// Files read from a directory at run time
#[derive(Debug, Clone)]
pub struct DirectoryResources {
    root: PathBuf,
}

impl DirectoryResources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ContentSource for DirectoryResources {
    fn read(&self, name: &str) -> Result<Vec<u8>> {
        if name.contains('/') || name.contains("..") {
            return Err(Error::content(format!("invalid resource name '{}'", name)));
        }
        let path = self.root.join(name);
        debug!(path = %path.display(), "reading resource from disk");
        std::fs::read(&path)
            .map_err(|e| Error::content(format!("failed to read {}: {}", path.display(), e)))
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.root)
            .into_iter()
            .flatten()
            .flatten()
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        names
    }
}

/// Replace the first occurrence of `token`, failing when it is absent
///
/// Each script variant carries exactly one placeholder; a missing token means
/// the script and the harness disagree and the run would silently use the
/// wrong setting.
pub fn substitute_once(content: &[u8], token: &str, replacement: &str) -> Result<Vec<u8>> {
    let needle = token.as_bytes();
    let position = content
        .windows(needle.len().max(1))
        .position(|w| w == needle)
        .filter(|_| !needle.is_empty())
        .ok_or_else(|| Error::content(format!("placeholder `{}` not found", token)))?;

    let mut out = Vec::with_capacity(content.len() + replacement.len());
    out.extend_from_slice(&content[..position]);
    out.extend_from_slice(replacement.as_bytes());
    out.extend_from_slice(&content[position + needle.len()..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_resources_are_present() {
        let source = EmbeddedResources;
        let names = source.names();
        for expected in [
            "mnist.py",
            "requirements.txt",
            "requirements-rocm.txt",
            "mnist_hpo.py",
            "mnist_hpo_raytune.ipynb",
            "hpo_raytune_requirements.txt",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {}", expected);
        }
        assert!(source.read("nope.txt").is_err());
    }

    #[test]
    fn test_embedded_scripts_carry_placeholders() {
        let mnist = EmbeddedResources.read("mnist.py").unwrap();
        let replaced = substitute_once(
            &mnist,
            "accelerator=\"has to be specified\"",
            "accelerator=\"cpu\"",
        )
        .unwrap();
        let text = String::from_utf8(replaced).unwrap();
        assert!(text.contains("accelerator=\"cpu\""));
        assert!(!text.contains("has to be specified"));

        let hpo = EmbeddedResources.read("mnist_hpo.py").unwrap();
        assert!(substitute_once(&hpo, "gpu_value=\"has to be specified\"", "gpu_value=\"1\"").is_ok());
    }

    #[test]
    fn test_substitute_replaces_first_occurrence_only() {
        let out = substitute_once(b"a=X; b=X", "X", "1").unwrap();
        assert_eq!(out, b"a=1; b=X");
    }

    #[test]
    fn test_substitute_missing_token_is_error() {
        let err = substitute_once(b"nothing here", "TOKEN", "1").unwrap_err();
        assert!(matches!(err, Error::Content(_)));
        assert!(substitute_once(b"abc", "", "1").is_err());
    }

    #[test]
    fn test_directory_rejects_traversal() {
        let dir = DirectoryResources::new("/tmp");
        assert!(dir.read("../etc/passwd").is_err());
    }
}
