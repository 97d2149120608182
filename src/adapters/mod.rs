// Document adapters
// Domain-aware shapers mapping raw backend payloads to context items.
// Variants: QA (question/answer pairs), Generic (plain documents), File
// (uploaded-file chunks, a QA specialization), and Intent (domain config +
// template library owner for the intent pipeline).

pub mod file;
pub mod generic;
pub mod intent;
pub mod qa;

pub use file::FileAdapter;
pub use generic::GenericAdapter;
pub use intent::IntentAdapter;
pub use qa::QaAdapter;
