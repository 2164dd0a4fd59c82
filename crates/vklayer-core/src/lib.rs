pub mod config;
pub mod diagnostic;
pub mod error;
pub mod handle;
pub mod registry;

pub use config::LayerConfig;
pub use diagnostic::{Diagnostic, DiagnosticCode, Layer, MessageSink, ReportFlags};
pub use error::{CoreError, ValidationError};
pub use handle::{HandleAllocator, ObjectType};
pub use registry::{ObjectRegistry, Validity};
