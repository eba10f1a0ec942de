//! Tag evaluation: matching the region's XPath tag definitions against node
//! hardware details.
//!
//! The XML crunching lives in a helper process that talks to the region's
//! HTTP API with the forwarded credentials. This side only launches it and
//! logs the outcome; the operation is fire-and-forget from the region's
//! point of view.

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::rpc::messages::EvaluateTagRequest;

#[derive(Debug, Error)]
#[error("tag evaluation failed: {0}")]
pub struct TagError(pub String);

#[async_trait]
pub trait TagEvaluator: Send + Sync {
    async fn evaluate(&self, request: EvaluateTagRequest) -> Result<(), TagError>;
}

pub struct HelperTagEvaluator {
    command: String,
    region_url: String,
}

impl HelperTagEvaluator {
    pub fn new(command: String, region_url: String) -> Self {
        Self {
            command,
            region_url,
        }
    }
}

#[async_trait]
impl TagEvaluator for HelperTagEvaluator {
    async fn evaluate(&self, request: EvaluateTagRequest) -> Result<(), TagError> {
        let manifest = json!({
            "region_url": self.region_url,
            "tag_name": request.tag_name,
            "tag_definition": request.tag_definition,
            "tag_nsmap": request.tag_nsmap,
            "credentials": request.credentials,
            "nodes": request.nodes,
        });
        let mut child = tokio::process::Command::new(&self.command)
            .arg("evaluate-tag")
            .stdin(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TagError(format!("cannot start helper: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(manifest.to_string().as_bytes())
                .await
                .map_err(|e| TagError(e.to_string()))?;
        }
        let status = child.wait().await.map_err(|e| TagError(e.to_string()))?;
        if !status.success() {
            return Err(TagError(format!("helper exited with {status}")));
        }
        Ok(())
    }
}
