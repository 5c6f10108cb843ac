//! Admission plugin initialization
//!
//! Admission plugins receive shared resources through initializers. The
//! initializers come from a hook that runs once, during config completion,
//! when the loopback client configuration is known. The default hook builds
//! the shared informer factory from that loopback client and records it in
//! a [`SharedInformerHandle`] for later consumers.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::informers::SharedInformerFactory;
use crate::loopback::LoopbackClientConfig;

/// An admission plugin that can be handed shared resources
pub trait AdmissionPlugin: Send + Sync {
    /// Plugin name
    fn name(&self) -> &str;

    /// Receive the shared informer factory; plugins that need none ignore it
    fn set_informer_factory(&self, _factory: Arc<SharedInformerFactory>) {}
}

/// Hands shared resources to admission plugins
pub trait PluginInitializer: Send + Sync {
    /// Initialize `plugin`
    fn initialize(&self, plugin: &dyn AdmissionPlugin);
}

/// Passes the shared informer factory to every plugin
pub struct InformerPluginInitializer {
    factory: Arc<SharedInformerFactory>,
}

impl InformerPluginInitializer {
    /// Initializer handing out `factory`
    pub fn new(factory: Arc<SharedInformerFactory>) -> Self {
        Self { factory }
    }
}

impl PluginInitializer for InformerPluginInitializer {
    fn initialize(&self, plugin: &dyn AdmissionPlugin) {
        debug!(plugin = plugin.name(), "initializing admission plugin with informers");
        plugin.set_informer_factory(self.factory.clone());
    }
}

/// Builds the admission plugin initializers from the loopback client config
pub type AdmissionInitializerHook = Arc<
    dyn Fn(LoopbackClientConfig) -> BoxFuture<'static, Result<PluginInitializers, ConfigError>>
        + Send
        + Sync,
>;

/// Initializers applied to every admission plugin
pub type PluginInitializers = Vec<Arc<dyn PluginInitializer>>;

/// Explicitly passed handle to the process' shared informer factory
///
/// Set once, by the admission hook; read by whoever starts or consumes
/// informers afterwards.
#[derive(Debug, Clone, Default)]
pub struct SharedInformerHandle(Arc<OnceLock<Arc<SharedInformerFactory>>>);

impl SharedInformerHandle {
    /// Empty handle
    pub fn new() -> Self {
        Self::default()
    }

    /// The factory, once the admission hook has run
    pub fn get(&self) -> Option<Arc<SharedInformerFactory>> {
        self.0.get().cloned()
    }

    /// Record `factory` unless one is already recorded; returns the recorded one
    pub fn get_or_set(&self, factory: Arc<SharedInformerFactory>) -> Arc<SharedInformerFactory> {
        self.0.get_or_init(|| factory).clone()
    }
}

/// Hook that builds a loopback client and a shared informer factory
///
/// The factory relists every `resync` and is recorded in `handle`. A failure
/// to build the client aborts config completion.
pub fn informer_wiring_hook(
    handle: SharedInformerHandle,
    resync: Duration,
) -> AdmissionInitializerHook {
    Arc::new(move |loopback: LoopbackClientConfig| {
        let handle = handle.clone();
        async move {
            if let Some(existing) = handle.get() {
                debug!("shared informer factory already constructed");
                let initializer: Arc<dyn PluginInitializer> =
                    Arc::new(InformerPluginInitializer::new(existing));
                return Ok(vec![initializer]);
            }

            let client = loopback.to_client().await?;
            let factory = handle.get_or_set(Arc::new(SharedInformerFactory::new(client, resync)));
            info!(
                host = %loopback.host,
                resync_secs = resync.as_secs(),
                "constructed shared informer factory"
            );

            let initializer: Arc<dyn PluginInitializer> =
                Arc::new(InformerPluginInitializer::new(factory));
            Ok(vec![initializer])
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::DEFAULT_LOOPBACK_TIMEOUT;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPlugin {
        received: Mutex<Option<Arc<SharedInformerFactory>>>,
    }

    impl AdmissionPlugin for RecordingPlugin {
        fn name(&self) -> &str {
            "recording"
        }

        fn set_informer_factory(&self, factory: Arc<SharedInformerFactory>) {
            *self.received.lock().unwrap() = Some(factory);
        }
    }

    fn loopback() -> LoopbackClientConfig {
        LoopbackClientConfig::new("https://127.0.0.1:6443", "abc123", DEFAULT_LOOPBACK_TIMEOUT)
    }

    /// Story: config completion wires admission to the loopback client
    ///
    /// The hook builds the factory, records it in the handle, and the
    /// initializer it returns hands the same factory to plugins.
    #[tokio::test]
    async fn hook_records_factory_and_initializes_plugins() {
        sheets_common::install_crypto_provider();
        let handle = SharedInformerHandle::new();
        let hook = informer_wiring_hook(handle.clone(), Duration::from_secs(600));

        assert!(handle.get().is_none());
        let initializers = hook(loopback()).await.unwrap();
        assert_eq!(initializers.len(), 1);

        let factory = handle.get().expect("factory should be recorded");
        assert_eq!(factory.resync(), Duration::from_secs(600));

        let plugin = RecordingPlugin::default();
        initializers[0].initialize(&plugin);
        let received = plugin.received.lock().unwrap().clone().unwrap();
        assert!(Arc::ptr_eq(&received, &factory));
    }

    #[tokio::test]
    async fn second_invocation_reuses_factory() {
        sheets_common::install_crypto_provider();
        let handle = SharedInformerHandle::new();
        let hook = informer_wiring_hook(handle.clone(), Duration::from_secs(600));

        hook(loopback()).await.unwrap();
        let first = handle.get().unwrap();
        hook(loopback()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &handle.get().unwrap()));
    }

    #[tokio::test]
    async fn malformed_loopback_aborts_completion() {
        let handle = SharedInformerHandle::new();
        let hook = informer_wiring_hook(handle.clone(), Duration::from_secs(600));

        let broken = LoopbackClientConfig::new("not a url", "abc123", DEFAULT_LOOPBACK_TIMEOUT);
        assert!(hook(broken).await.is_err());
        assert!(handle.get().is_none());
    }
}
