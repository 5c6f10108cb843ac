//! Bootstrap for the Google Sheets delegated API server extension
//!
//! [`prepare`] provisions trust material, builds the server and writes the
//! loopback kubeconfig. [`start`] does the same and serves in the
//! background, returning a handle for shutdown.

#![deny(missing_docs)]

pub mod error;
pub mod settings;
pub mod startup;

pub use error::StartError;
pub use settings::StartupSettings;
pub use startup::{prepare, start, PreparedStartup, START_INFORMERS_HOOK};
