//! 产物暂存工具：Agent 把生成的文档（脚本、清单等）按名称存取

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::tools::Tool;

/// 进程内产物存储，多个工具共享
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, name: &str, content: String) {
        self.inner.write().await.insert(name.to_string(), content);
    }

    pub async fn get(&self, name: &str) -> Option<String> {
        self.inner.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Deserialize)]
struct SaveArgs {
    name: String,
    content: String,
}

#[derive(Deserialize)]
struct ReadArgs {
    name: String,
}

/// save_artifact(name, content)
pub struct SaveArtifactTool {
    store: ArtifactStore,
}

impl SaveArtifactTool {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SaveArtifactTool {
    fn name(&self) -> &str {
        "save_artifact"
    }

    fn description(&self) -> &str {
        "Save a generated document under a name so other agents can read it."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Artifact name, e.g. script.md"},
                "content": {"type": "string"}
            },
            "required": ["name", "content"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: SaveArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {e}"))?;
        let size = args.content.len();
        self.store.put(&args.name, args.content).await;
        Ok(format!("Saved artifact '{}' ({} bytes)", args.name, size))
    }
}

/// read_artifact(name)
pub struct ReadArtifactTool {
    store: ArtifactStore,
}

impl ReadArtifactTool {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ReadArtifactTool {
    fn name(&self) -> &str {
        "read_artifact"
    }

    fn description(&self) -> &str {
        "Read a previously saved document by name."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"}
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ReadArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {e}"))?;
        match self.store.get(&args.name).await {
            Some(content) => Ok(content),
            None => Err(format!(
                "Artifact '{}' not found. Available: [{}]",
                args.name,
                self.store.names().await.join(", ")
            )),
        }
    }
}
