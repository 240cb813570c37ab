// Library interface for newsdigest modules
// This allows tests and the diagnostic binaries to import modules

pub mod classify;
pub mod context;
pub mod delivery;
pub mod embedding;
pub mod error;
pub mod fallback;
pub mod ingestion;
pub mod normalize;
pub mod processing;
pub mod shortener;
pub mod similarity;
pub mod storage;
