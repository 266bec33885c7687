//! Composes a runnable operator from a declarative app manifest.
//!
//! An [`App`] reads an [`AppManifest`], checks that the registered
//! reconcilers and admission hooks stay within each kind's declared
//! capabilities, and wires one informer + reconciler pair per registered
//! kind into an [`InformerController`] alongside an [`AdmissionChain`].

use std::{fmt, sync::Arc, time::Duration};

use opkit_core::admission::{Converter, Mutator, Validator};
use opkit_core::manifest::AppManifest;
use opkit_core::{GroupVersionKind, ResourceClient};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    admission::AdmissionChain,
    controller::{self, InformerController},
    informer::Informer,
    opinionated::OpinionatedReconciler,
    reconcile::Reconciler,
    runner::{RunError, Runnable},
};

/// Errors detected while assembling an [`App`].
#[derive(Debug, Error)]
pub enum Error {
    /// No client factory was configured
    #[error("no client factory configured")]
    MissingClientFactory,
    /// A registration names a kind/version pair the manifest lacks
    #[error("kind {kind}@{version} is not declared in the manifest")]
    UnknownKind {
        /// The offending kind
        kind: String,
        /// The offending version
        version: String,
    },
    /// A hook was registered that the manifest does not declare
    #[error("kind {kind} does not declare the {capability} capability")]
    CapabilityNotDeclared {
        /// The offending kind
        kind: String,
        /// Which capability was missing
        capability: &'static str,
    },
    /// The client factory refused a kind
    #[error("failed to build client for {gvk}: {source}")]
    ClientBuild {
        /// The kind a client was requested for
        gvk: GroupVersionKind,
        /// The factory's error
        #[source]
        source: opkit_core::Error,
    },
}

/// Produces clients for the kinds an app serves.
///
/// Typically backed by generated per-kind clients; tests plug in an
/// in-memory implementation.
pub trait ClientFactory: Send + Sync {
    /// A client scoped to `gvk`.
    fn client_for(&self, gvk: &GroupVersionKind) -> Result<Arc<dyn ResourceClient>, opkit_core::Error>;
}

/// One kind's runtime registration.
pub struct KindRegistration {
    version: String,
    kind: String,
    reconciler: Arc<dyn Reconciler>,
    opinionated: bool,
    validator: Option<Arc<dyn Validator>>,
    mutator: Option<Arc<dyn Mutator>>,
    converter: Option<Arc<dyn Converter>>,
}

impl KindRegistration {
    /// Register `reconciler` for `kind` at `version`, with the opinionated
    /// finalizer layer enabled.
    pub fn new(version: &str, kind: &str, reconciler: Arc<dyn Reconciler>) -> Self {
        Self {
            version: version.to_string(),
            kind: kind.to_string(),
            reconciler,
            opinionated: true,
            validator: None,
            mutator: None,
            converter: None,
        }
    }

    /// Disable the finalizer layer; the reconciler sees raw events.
    #[must_use]
    pub fn plain(mut self) -> Self {
        self.opinionated = false;
        self
    }

    /// Attach the validating admission hook.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Attach the mutating admission hook.
    #[must_use]
    pub fn with_mutator(mut self, mutator: Arc<dyn Mutator>) -> Self {
        self.mutator = Some(mutator);
        self
    }

    /// Attach the version converter.
    #[must_use]
    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = Some(converter);
        self
    }
}

/// Assembles an [`App`] from a manifest plus registrations.
pub struct AppBuilder {
    manifest: AppManifest,
    client_factory: Option<Arc<dyn ClientFactory>>,
    registrations: Vec<KindRegistration>,
    resync_interval: Option<Duration>,
    workers_per_pair: usize,
    error_handler: Option<controller::ErrorHandler>,
}

impl AppBuilder {
    fn new(manifest: AppManifest) -> Self {
        Self {
            manifest,
            client_factory: None,
            registrations: Vec::new(),
            resync_interval: None,
            workers_per_pair: 1,
            error_handler: None,
        }
    }

    /// Set the factory producing per-kind clients.
    #[must_use]
    pub fn with_client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.client_factory = Some(factory);
        self
    }

    /// Register a kind.
    #[must_use]
    pub fn register_kind(mut self, registration: KindRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// Override the informers' resync interval.
    #[must_use]
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = Some(interval);
        self
    }

    /// Workers per (informer, reconciler) pair.
    #[must_use]
    pub fn with_workers_per_pair(mut self, workers: usize) -> Self {
        self.workers_per_pair = workers;
        self
    }

    /// Install the controller's advisory error handler.
    #[must_use]
    pub fn with_error_handler(mut self, handler: controller::ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Check every registration against the manifest and wire the runtime.
    pub fn build(self) -> Result<App, Error> {
        let factory = self.client_factory.ok_or(Error::MissingClientFactory)?;
        let mut controller = InformerController::new();
        controller.set_workers_per_pair(self.workers_per_pair);
        if let Some(handler) = self.error_handler {
            controller.set_error_handler(handler);
        }
        let mut admission = AdmissionChain::new();
        let group = self.manifest.group.clone();

        for registration in self.registrations {
            let declared = self
                .manifest
                .kind(&registration.version, &registration.kind)
                .ok_or_else(|| Error::UnknownKind {
                    kind: registration.kind.clone(),
                    version: registration.version.clone(),
                })?;

            if registration.validator.is_some() && declared.admission.validation.is_empty() {
                return Err(Error::CapabilityNotDeclared {
                    kind: registration.kind,
                    capability: "validation",
                });
            }
            if registration.mutator.is_some() && declared.admission.mutation.is_empty() {
                return Err(Error::CapabilityNotDeclared {
                    kind: registration.kind,
                    capability: "mutation",
                });
            }
            if registration.converter.is_some() && !declared.conversion {
                return Err(Error::CapabilityNotDeclared {
                    kind: registration.kind,
                    capability: "conversion",
                });
            }

            let gvk = GroupVersionKind::gvk(&group, &registration.version, &registration.kind);
            let client = factory.client_for(&gvk).map_err(|source| Error::ClientBuild {
                gvk: gvk.clone(),
                source,
            })?;

            let pair_id = format!("{}.{}/{}", declared.plural, group, registration.version);
            let mut informer = Informer::new(client.clone()).named(&pair_id);
            if let Some(interval) = self.resync_interval {
                informer = informer.with_resync_interval(interval);
            }
            controller.add_informer(&pair_id, informer);

            let reconciler: Arc<dyn Reconciler> = if registration.opinionated {
                let finalizer = format!("{}/{}-finalizer", group, declared.plural);
                Arc::new(OpinionatedReconciler::new(
                    registration.reconciler,
                    client,
                    &finalizer,
                ))
            } else {
                registration.reconciler
            };
            controller.add_reconciler(&pair_id, reconciler);

            if let Some(validator) = registration.validator {
                admission.add_validator(gvk.clone(), validator);
            }
            if let Some(mutator) = registration.mutator {
                admission.add_mutator(gvk.clone(), mutator);
            }
            if let Some(converter) = registration.converter {
                admission.add_converter(&gvk.group, &gvk.kind, converter);
            }
            info!(kind = %gvk, pair = %pair_id, "registered kind");
        }

        Ok(App {
            name: self.manifest.app_name.clone(),
            controller,
            admission: Arc::new(admission),
        })
    }
}

/// A fully wired operator: controller plus admission chain.
pub struct App {
    name: String,
    controller: InformerController,
    admission: Arc<AdmissionChain>,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App").field("name", &self.name).finish()
    }
}

impl App {
    /// Start assembling an app for `manifest`.
    pub fn builder(manifest: AppManifest) -> AppBuilder {
        AppBuilder::new(manifest)
    }

    /// The admission chain, for embedding into a webhook transport.
    pub fn admission_chain(&self) -> Arc<AdmissionChain> {
        self.admission.clone()
    }

    /// Run the controller until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), controller::Error> {
        info!(app = %self.name, "starting app");
        self.controller.run(cancel).await
    }
}

#[async_trait::async_trait]
impl Runnable for App {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), RunError> {
        (*self).run(cancel).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use opkit_core::admission::{AdmissionError, AdmissionRequest};
    use opkit_core::manifest::{AdmissionCapabilities, ManifestKind, ManifestVersion, ResourceScope};
    use opkit_core::Resource;
    use opkit_test::MemoryApiServer;
    use parking_lot::Mutex;

    use super::*;
    use crate::opinionated::SimpleWatcher;

    fn manifest(with_admission: bool) -> AppManifest {
        AppManifest {
            app_name: "testapp".into(),
            group: "testapp.example.com".into(),
            preferred_version: "v1".into(),
            versions: vec![ManifestVersion {
                name: "v1".into(),
                kinds: vec![ManifestKind {
                    kind: "Widget".into(),
                    plural: "widgets".into(),
                    scope: ResourceScope::Namespaced,
                    admission: if with_admission {
                        AdmissionCapabilities {
                            validation: vec![opkit_core::admission::Operation::Create],
                            mutation: vec![],
                        }
                    } else {
                        AdmissionCapabilities::default()
                    },
                    conversion: false,
                    routes: Default::default(),
                    selectable_fields: vec![],
                    additional_printer_columns: vec![],
                    schema: serde_json::Value::Null,
                }],
            }],
        }
    }

    struct MemoryFactory(MemoryApiServer);

    impl ClientFactory for MemoryFactory {
        fn client_for(
            &self,
            gvk: &GroupVersionKind,
        ) -> Result<Arc<dyn ResourceClient>, opkit_core::Error> {
            Ok(Arc::new(self.0.client_for(&gvk.api_version(), &gvk.kind)))
        }
    }

    fn noop_reconciler() -> Arc<dyn Reconciler> {
        Arc::new(SimpleWatcher::new())
    }

    struct AllowAll;

    #[async_trait]
    impl Validator for AllowAll {
        async fn validate(&self, _: &AdmissionRequest) -> Result<(), AdmissionError> {
            Ok(())
        }
    }

    #[test]
    fn build_rejects_kinds_missing_from_the_manifest() {
        let err = App::builder(manifest(false))
            .with_client_factory(Arc::new(MemoryFactory(MemoryApiServer::new())))
            .register_kind(KindRegistration::new("v2", "Widget", noop_reconciler()))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::UnknownKind { version, .. } if version == "v2"));
    }

    #[test]
    fn build_rejects_undeclared_admission_hooks() {
        let err = App::builder(manifest(false))
            .with_client_factory(Arc::new(MemoryFactory(MemoryApiServer::new())))
            .register_kind(
                KindRegistration::new("v1", "Widget", noop_reconciler())
                    .with_validator(Arc::new(AllowAll)),
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CapabilityNotDeclared {
                capability: "validation",
                ..
            }
        ));
    }

    #[test]
    fn build_requires_a_client_factory() {
        let err = App::builder(manifest(false))
            .register_kind(KindRegistration::new("v1", "Widget", noop_reconciler()))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::MissingClientFactory));
    }

    #[tokio::test(start_paused = true)]
    async fn built_app_reconciles_and_admits() {
        let server = MemoryApiServer::new();
        let added: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = added.clone();
        let watcher = SimpleWatcher::new().on_add(move |obj: Resource| {
            let sink = sink.clone();
            async move {
                sink.lock().push(obj.name().to_string());
                Ok(())
            }
        });

        let app = App::builder(manifest(true))
            .with_client_factory(Arc::new(MemoryFactory(server.clone())))
            .with_resync_interval(Duration::ZERO)
            .register_kind(
                KindRegistration::new("v1", "Widget", Arc::new(watcher))
                    .with_validator(Arc::new(AllowAll)),
            )
            .build()
            .unwrap();

        let chain = app.admission_chain();
        assert!(chain.handles(&GroupVersionKind::gvk("testapp.example.com", "v1", "Widget")));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(app.run(cancel.clone()));

        let client = server.client_for("testapp.example.com/v1", "Widget");
        let obj = opkit_test::test_resource("testapp.example.com/v1", "Widget", Some("default"), "foo");
        client.create(&obj).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*added.lock(), vec!["foo"]);
        // the opinionated layer claimed the object before the callback ran
        let stored = server.objects().pop().unwrap();
        assert!(stored.has_finalizer("testapp.example.com/widgets-finalizer"));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
