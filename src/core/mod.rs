pub mod engine;
pub mod file_state;
pub mod filter;
pub mod macros;
pub mod scanner;
pub mod transfer;

pub use engine::{RunReport, SectionReport, TransferEngine};
pub use file_state::{FileState, FileStateManager};
pub use filter::{ExtensionFilter, FilterDecision, IncludeRule};
pub use macros::PathMacros;
pub use scanner::{FileScanner, LocalFile};
pub use transfer::{TransferJournal, TransferStatus};
