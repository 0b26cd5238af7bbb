//! 本地存储维护

pub mod temp_cleanup;

pub use temp_cleanup::{CleanupReport, TempCleaner};
