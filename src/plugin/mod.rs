pub mod processor;
pub mod registry;
pub mod source;

pub use processor::{Processor, ProcessorResult};
pub use registry::{PluginRegistry, identity_key};
pub use source::{AssetScanResult, DataReader, ScanResult, SourcePlugin};
