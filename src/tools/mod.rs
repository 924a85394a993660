pub mod artifact;
pub mod executor;
pub mod registry;
pub mod schema;

pub use artifact::{ArtifactStore, ReadArtifactTool, SaveArtifactTool};
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry, ToolSchema};
pub use schema::{transfer_tool_schema, TransferArgs};
