use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_SUFFIX: &str = ".bootstrap.js";
pub const BINARY_MODULE_SUFFIX: &str = ".module.wasm";

/// Build-time description of a bundle: which chunks exist, which binary modules they carry, and
/// how those modules' imports map onto host-interface units.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BundleManifest {
    #[serde(default = "default_chunk_suffix")]
    pub chunk_suffix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<EntryPoint>,
    /// Chunks that ship with the bootstrap and start out loaded.
    #[serde(default)]
    pub preloaded_chunks: Vec<String>,
    #[serde(default)]
    pub chunks: BTreeMap<String, ChunkManifest>,
    #[serde(default)]
    pub binary_modules: BTreeMap<String, BinaryModuleManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EntryPoint {
    pub chunk: String,
    pub unit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChunkManifest {
    #[serde(default)]
    pub binary_modules: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BinaryModuleManifest {
    /// Content hash used only to name the payload.
    pub hash: String,
    /// Import namespace as written in the binary module -> host interface it forwards to.
    #[serde(default)]
    pub imports: BTreeMap<String, ImportNamespace>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImportNamespace {
    /// Code unit whose exports implement this namespace.
    pub unit: String,
    #[serde(default)]
    pub functions: Vec<String>,
}

fn default_chunk_suffix() -> String {
    DEFAULT_CHUNK_SUFFIX.to_string()
}

impl Default for BundleManifest {
    fn default() -> Self {
        Self {
            chunk_suffix: default_chunk_suffix(),
            entry: None,
            preloaded_chunks: Vec::new(),
            chunks: BTreeMap::new(),
            binary_modules: BTreeMap::new(),
        }
    }
}

impl BundleManifest {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: BundleManifest =
            serde_json::from_slice(bytes).context("parse bundle manifest JSON")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read bundle manifest: {}", path.display()))?;
        Self::from_json(&bytes).with_context(|| format!("load bundle manifest: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        for (chunk_id, chunk) in &self.chunks {
            for module_id in &chunk.binary_modules {
                if !self.binary_modules.contains_key(module_id) {
                    anyhow::bail!(
                        "chunk {chunk_id:?} declares unknown binary module {module_id:?}"
                    );
                }
            }
        }
        for (module_id, module) in &self.binary_modules {
            if module.hash.trim().is_empty() {
                anyhow::bail!("binary module {module_id:?} has an empty hash");
            }
            for (namespace, ns) in &module.imports {
                if ns.unit.trim().is_empty() {
                    anyhow::bail!(
                        "binary module {module_id:?} import namespace {namespace:?} names no unit"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn chunk_script_src(&self, public_path: &str, chunk_id: &str) -> String {
        format!("{public_path}{chunk_id}{}", self.chunk_suffix)
    }

    pub fn binary_module_src(&self, public_path: &str, module_id: &str) -> Option<String> {
        let module = self.binary_modules.get(module_id)?;
        Some(format!("{public_path}{}{BINARY_MODULE_SUFFIX}", module.hash))
    }

    /// Binary modules a chunk carries; empty for chunks the manifest does not list.
    pub fn chunk_binary_modules(&self, chunk_id: &str) -> &[String] {
        self.chunks
            .get(chunk_id)
            .map(|chunk| chunk.binary_modules.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
      "entry": { "chunk": "0", "unit": "./index.js" },
      "preloaded_chunks": ["main"],
      "chunks": { "0": { "binary_modules": ["../pkg/app_bg.wasm"] } },
      "binary_modules": {
        "../pkg/app_bg.wasm": {
          "hash": "3462a38b6373e95e5b75",
          "imports": {
            "./app_bg.js": { "unit": "../pkg/app_bg.js", "functions": ["log", "random"] }
          }
        }
      }
    }"#;

    #[test]
    fn resource_names_follow_the_naming_rule() {
        let m = BundleManifest::from_json(SAMPLE.as_bytes()).unwrap();
        assert_eq!(m.chunk_suffix, DEFAULT_CHUNK_SUFFIX);
        assert_eq!(m.chunk_script_src("", "0"), "0.bootstrap.js");
        assert_eq!(m.chunk_script_src("/static/", "0"), "/static/0.bootstrap.js");
        assert_eq!(
            m.binary_module_src("/static/", "../pkg/app_bg.wasm").as_deref(),
            Some("/static/3462a38b6373e95e5b75.module.wasm")
        );
        assert_eq!(m.binary_module_src("", "../pkg/other.wasm"), None);
    }

    #[test]
    fn default_manifest_keeps_the_chunk_suffix() {
        let m = BundleManifest::default();
        assert_eq!(m.chunk_script_src("", "0"), "0.bootstrap.js");
        assert_eq!(m.chunk_script_src("/static/", "1"), "/static/1.bootstrap.js");
        assert_eq!(BundleManifest::from_json(b"{}").unwrap(), m);
    }

    #[test]
    fn chunk_binary_modules_defaults_to_empty() {
        let m = BundleManifest::from_json(SAMPLE.as_bytes()).unwrap();
        assert_eq!(m.chunk_binary_modules("0"), ["../pkg/app_bg.wasm".to_string()]);
        assert!(m.chunk_binary_modules("7").is_empty());
        assert_eq!(
            m.entry,
            Some(EntryPoint {
                chunk: "0".to_string(),
                unit: "./index.js".to_string()
            })
        );
    }

    #[test]
    fn unknown_binary_module_is_rejected() {
        let err = BundleManifest::from_json(
            br#"{ "chunks": { "0": { "binary_modules": ["ghost.wasm"] } } }"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("ghost.wasm"), "err={err:#}");
    }

    #[test]
    fn empty_hash_is_rejected() {
        let err = BundleManifest::from_json(
            br#"{ "binary_modules": { "a.wasm": { "hash": " " } } }"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("empty hash"), "err={err:#}");
    }
}
