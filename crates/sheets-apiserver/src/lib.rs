//! Delegated extension API server for the Google Sheets datasource
//!
//! Options are assembled into a configuration, completed with loopback
//! credentials and admission wiring, and built into a server whose private
//! API group is served by a subresource handler in front of an empty
//! delegate.

#![deny(missing_docs)]

pub mod admission;
pub mod assembly;
pub mod authn;
pub mod authz;
pub mod config;
pub mod error;
pub mod filters;
pub mod informers;
pub mod kubeconfig;
pub mod loopback;
pub mod mux;
pub mod openapi;
pub mod options;
pub mod request;
pub mod server;
pub mod subresource;

pub use admission::{informer_wiring_hook, AdmissionInitializerHook, SharedInformerHandle};
pub use assembly::build_server;
pub use authz::AuthorizationPolicy;
pub use config::{CompletedConfig, PolicySnapshot, RecommendedConfig};
pub use error::{ApiError, BootError, ConfigError, PersistError, ServeError};
pub use informers::SharedInformerFactory;
pub use kubeconfig::write_kubeconfig;
pub use loopback::LoopbackClientConfig;
pub use options::{CertKey, PolicyOverrides, RecommendedOptions, ServerOptions};
pub use server::{
    DelegationTarget, EmptyDelegate, GenericApiServer, PostStartHookContext, PostStartHookFn,
    PreparedServer, ServerHandle,
};
