//! Shared informer factory
//!
//! One watch-backed cache per resource type, built from a single client and
//! shared by every admission plugin and controller in the process. Caches
//! are registered with [`SharedInformerFactory::informer_for`] and begin
//! filling once [`SharedInformerFactory::start`] is called.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::Store;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type StartFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

struct Informer {
    store: Box<dyn Any + Send + Sync>,
    // Taken when the informer is started
    start: Option<StartFn>,
}

/// Process-wide cache of watch-based informers keyed by resource type
pub struct SharedInformerFactory {
    client: Client,
    resync: Duration,
    informers: Mutex<HashMap<TypeId, Informer>>,
}

impl Debug for SharedInformerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedInformerFactory")
            .field("resync", &self.resync)
            .field("informers", &self.lock().len())
            .finish()
    }
}

impl SharedInformerFactory {
    /// Factory whose informers relist every `resync`
    pub fn new(client: Client, resync: Duration) -> Self {
        Self {
            client,
            resync,
            informers: Mutex::new(HashMap::new()),
        }
    }

    /// Relist period
    pub fn resync(&self) -> Duration {
        self.resync
    }

    /// Client the informers watch through
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TypeId, Informer>> {
        self.informers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cluster-wide cache of `K`, shared with every other caller asking for `K`
    pub fn informer_for<K>(&self) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let mut informers = self.lock();
        if let Some(store) = informers
            .get(&TypeId::of::<K>())
            .and_then(|i| i.store.downcast_ref::<Store<K>>())
        {
            return store.clone();
        }

        let writer: Writer<K> = Writer::default();
        let store = writer.as_reader();
        let api: Api<K> = Api::all(self.client.clone());
        let resync = self.resync;
        let start: StartFn =
            Box::new(move |cancel| run_informer(api, writer, resync, cancel).boxed());

        informers.insert(
            TypeId::of::<K>(),
            Informer {
                store: Box::new(store.clone()),
                start: Some(start),
            },
        );
        debug!(kind = %K::kind(&()), "registered informer");
        store
    }

    /// Number of registered informers
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no informer has been registered
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Start every registered informer that is not yet running
    ///
    /// Informers stop when `cancel` fires. Returns how many were started.
    pub fn start(&self, cancel: &CancellationToken) -> usize {
        let pending: Vec<StartFn> = self
            .lock()
            .values_mut()
            .filter_map(|i| i.start.take())
            .collect();
        let started = pending.len();
        for start in pending {
            tokio::spawn(start(cancel.child_token()));
        }
        if started > 0 {
            info!(started, resync_secs = self.resync.as_secs(), "started shared informers");
        }
        started
    }
}

/// Feed `writer` from a watch, relisting every `resync`
async fn run_informer<K>(
    api: Api<K>,
    mut writer: Writer<K>,
    resync: Duration,
    cancel: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let kind = K::kind(&()).to_string();
    loop {
        let stream = watcher(api.clone(), watcher::Config::default()).default_backoff();
        tokio::pin!(stream);
        let relist = tokio::time::sleep(resync);
        tokio::pin!(relist);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(kind = %kind, "informer stopped");
                    return;
                }
                _ = &mut relist => {
                    debug!(kind = %kind, "informer resync");
                    break;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => writer.apply_watcher_event(&event),
                    Some(Err(e)) => warn!(kind = %kind, error = %e, "informer watch error"),
                    None => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};

    fn offline_client() -> Client {
        sheets_common::install_crypto_provider();
        let config = kube::Config::new("https://127.0.0.1:1".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    #[tokio::test]
    async fn informers_are_shared_per_type() {
        let factory = SharedInformerFactory::new(offline_client(), Duration::from_secs(600));

        let _namespaces = factory.informer_for::<Namespace>();
        let _again = factory.informer_for::<Namespace>();
        assert_eq!(factory.len(), 1);

        let _configmaps = factory.informer_for::<ConfigMap>();
        assert_eq!(factory.len(), 2);
    }

    #[tokio::test]
    async fn start_runs_each_informer_once() {
        let factory = SharedInformerFactory::new(offline_client(), Duration::from_secs(600));
        let cancel = CancellationToken::new();

        assert_eq!(factory.start(&cancel), 0);
        let store = factory.informer_for::<Namespace>();
        assert_eq!(factory.start(&cancel), 1);
        assert_eq!(factory.start(&cancel), 0);

        factory.informer_for::<ConfigMap>();
        assert_eq!(factory.start(&cancel), 1);

        cancel.cancel();
        assert!(store.state().is_empty());
    }
}
