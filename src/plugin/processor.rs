use crate::changes::MetadataChanges;
use crate::error::Result;
use crate::model::enums::{ExecutionMode, OpStatus};
use crate::model::metadata::Metadata;
use crate::registry::MetadataKey;
use async_trait::async_trait;

/// What one processor run produced for one asset.
#[derive(Debug)]
pub struct ProcessorResult {
    pub status: OpStatus,
    pub metadata: Vec<Metadata>,
    pub message: Option<String>,
}

impl ProcessorResult {
    pub fn completed(metadata: Vec<Metadata>) -> Self {
        Self {
            status: OpStatus::Completed,
            metadata,
            message: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: OpStatus::Skipped,
            metadata: Vec::new(),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OpStatus::Error,
            metadata: Vec::new(),
            message: Some(message.into()),
        }
    }
}

/// A plugin that consumes metadata keys and produces others. Processors are
/// ordered into stages by their declared dependencies and outputs, then
/// dispatched according to their execution mode.
#[async_trait]
pub trait Processor: Send + Sync {
    fn plugin_id(&self) -> &str;

    fn title(&self) -> &str {
        self.plugin_id()
    }

    /// Keys this processor reads.
    fn dependencies(&self) -> &[MetadataKey];

    /// Keys this processor may write.
    fn outputs(&self) -> &[MetadataKey];

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Async
    }

    /// Whether the processor can run at all; `Err` carries the reason and
    /// aborts pipeline construction.
    async fn is_ready(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Whether the processor needs to run for this asset. The default reruns
    /// when any dependency changed after the processor's last output.
    fn should_run(&self, changes: &MetadataChanges, actor_id: i64) -> bool {
        changes.changed_since_actor(self.dependencies(), actor_id, self.outputs())
    }

    async fn run(&self, changes: &MetadataChanges, actor_id: i64) -> Result<ProcessorResult>;
}
