pub mod scanner;
pub mod store;

pub use scanner::{Fingerprinter, Ingestor, ScanError};
pub use store::{FingerprintStore, StoreError};
