//! Facade registry and the mode-gated root dispatcher.
//!
//! Facades are registered at startup as [`FacadeSpec`]s: a name, a version,
//! a constructor, and a table of statically typed method handlers. Each
//! handler decodes its own parameter type and encodes its own result type,
//! so resolving `(facade, version, method)` is a plain map lookup and an
//! unknown method is a map miss.
//!
//! After login a session gets a [`RootDispatcher`], which evaluates the
//! session's [`RestrictionChain`] before every lookup and then invokes the
//! handler. Plain facades are built once per `(facade, version)` and cached;
//! resource-backed facades are rebuilt from the session's
//! [`ResourceRegistry`] on every call.
//!
//! # Invariants
//!
//! - [INV-RD-001] The restriction chain is evaluated before facade lookup,
//!   so a gated call fails with the gate's error even for unknown methods.
//! - [INV-RD-002] [`RootDispatcher::find_method`] never blocks.
//! - [INV-RD-003] A resource-backed facade is only reachable through an id
//!   that is live in the session's [`ResourceRegistry`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use corral_core::Tag;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use super::error::ApiError;
use super::notifier::Notifier;
use super::resources::ResourceRegistry;
use super::restrictions::RestrictionChain;

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&FacadeContext) -> Result<Instance, ApiError> + Send + Sync>;
type MethodFn = Arc<dyn Fn(Instance, Value) -> BoxFuture<'static, Result<Value, ApiError>> + Send + Sync>;

/// Everything a facade constructor may bind to.
#[derive(Debug, Clone)]
pub struct FacadeContext {
    /// The authenticated entity.
    pub entity: Tag,
    /// Facade instance id from the request.
    pub id: String,
    /// The session's resource registry.
    pub resources: Arc<ResourceRegistry>,
    /// Push channel onto the connection's outbound stream.
    pub notifier: Notifier,
    /// Connection id, for logging.
    pub connection_id: u64,
}

/// A registered facade version.
pub struct FacadeSpec {
    name: &'static str,
    version: u32,
    resource_backed: bool,
    factory: Factory,
    methods: BTreeMap<&'static str, MethodFn>,
}

impl fmt::Debug for FacadeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FacadeSpec")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("resource_backed", &self.resource_backed)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl FacadeSpec {
    /// Starts building a facade whose instances are of type `F`.
    pub fn builder<F, C>(name: &'static str, version: u32, constructor: C) -> FacadeBuilder<F>
    where
        F: Send + Sync + 'static,
        C: Fn(&FacadeContext) -> Result<F, ApiError> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |ctx: &FacadeContext| -> Result<Instance, ApiError> {
            let instance: Instance = Arc::new(constructor(ctx)?);
            Ok(instance)
        });
        FacadeBuilder {
            spec: Self {
                name,
                version,
                resource_backed: false,
                factory,
                methods: BTreeMap::new(),
            },
            _facade: PhantomData,
        }
    }

    /// Returns the facade name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the facade version.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Returns `true` if instances are addressed by resource id.
    #[must_use]
    pub const fn is_resource_backed(&self) -> bool {
        self.resource_backed
    }

    /// Returns the method names in order.
    pub fn method_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.keys().copied()
    }
}

/// Builder for [`FacadeSpec`].
pub struct FacadeBuilder<F> {
    spec: FacadeSpec,
    _facade: PhantomData<fn() -> F>,
}

impl<F: Send + Sync + 'static> FacadeBuilder<F> {
    /// Marks the facade as resource-backed: the request id must name a live
    /// resource in the session.
    #[must_use]
    pub fn resource_backed(mut self) -> Self {
        self.spec.resource_backed = true;
        self
    }

    /// Adds a method taking parameters `P` and returning `R`.
    #[must_use]
    pub fn method<P, R, Fut, H>(mut self, name: &'static str, handler: H) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R, ApiError>> + Send + 'static,
        H: Fn(Arc<F>, P) -> Fut + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let facade_name = self.spec.name;
        let erased: MethodFn = Arc::new(
            move |instance: Instance, params: Value| -> BoxFuture<'static, Result<Value, ApiError>> {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let facade = instance.downcast::<F>().map_err(|_| {
                        ApiError::internal(format!("{facade_name}.{name}: facade type mismatch"))
                    })?;
                    let params = decode_params::<P>(params)?;
                    let result = handler(facade, params).await?;
                    serde_json::to_value(result).map_err(|e| {
                        ApiError::internal(format!("{facade_name}.{name}: encoding result: {e}"))
                    })
                })
            },
        );
        self.spec.methods.insert(name, erased);
        self
    }

    /// Finishes the facade.
    #[must_use]
    pub fn build(self) -> FacadeSpec {
        self.spec
    }
}

/// Decodes call parameters. Absent parameters decode as `()` or as an empty
/// object, whichever the target type accepts.
pub(crate) fn decode_params<P: DeserializeOwned>(params: Value) -> Result<P, ApiError> {
    let decoded = if params.is_null() {
        serde_json::from_value(Value::Null)
            .or_else(|_| serde_json::from_value(Value::Object(Map::new())))
    } else {
        serde_json::from_value(params)
    };
    decoded.map_err(|e| ApiError::bad_request(format!("invalid parameters: {e}")))
}

/// Errors from building the facade registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// The (name, version) pair is already registered.
    #[error("facade {name} version {version} registered twice")]
    Duplicate {
        /// Facade name.
        name: &'static str,
        /// Facade version.
        version: u32,
    },
}

/// A facade name with the versions a session can reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct FacadeVersions {
    /// Facade name.
    pub name: String,
    /// Reachable versions, ascending.
    pub versions: Vec<u32>,
}

/// A resolved method, ready to invoke.
#[derive(Clone)]
pub struct BoundMethod {
    facade: Arc<FacadeSpec>,
    method: &'static str,
    handler: MethodFn,
}

impl fmt::Debug for BoundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BoundMethod({}({}).{})",
            self.facade.name, self.facade.version, self.method
        )
    }
}

impl BoundMethod {
    /// Returns the facade spec the method belongs to.
    #[must_use]
    pub fn facade(&self) -> &FacadeSpec {
        &self.facade
    }

    /// Returns the method name.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        self.method
    }
}

/// Immutable table of every facade version the server exposes.
#[derive(Debug, Default)]
pub struct FacadeRegistry {
    facades: BTreeMap<&'static str, BTreeMap<u32, Arc<FacadeSpec>>>,
}

impl FacadeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a facade version.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Duplicate`] if the pair is taken.
    pub fn register(&mut self, spec: FacadeSpec) -> Result<(), RegistrationError> {
        let versions = self.facades.entry(spec.name).or_default();
        if versions.contains_key(&spec.version) {
            return Err(RegistrationError::Duplicate {
                name: spec.name,
                version: spec.version,
            });
        }
        versions.insert(spec.version, Arc::new(spec));
        Ok(())
    }

    /// Resolves `(facade, version, method)`.
    ///
    /// # Errors
    ///
    /// - [`ApiError::UnknownMethod`] for an unknown facade or method.
    /// - [`ApiError::UnsupportedVersion`] for a known facade at an
    ///   unregistered version.
    pub fn find_method(
        &self,
        facade: &str,
        version: u32,
        method: &str,
    ) -> Result<BoundMethod, ApiError> {
        let unknown = || ApiError::UnknownMethod {
            facade: facade.to_string(),
            version,
            method: method.to_string(),
        };
        let versions = self.facades.get(facade).ok_or_else(unknown)?;
        let spec = versions
            .get(&version)
            .ok_or_else(|| ApiError::UnsupportedVersion {
                facade: facade.to_string(),
                version,
            })?;
        let (name, handler) = spec.methods.get_key_value(method).ok_or_else(unknown)?;
        Ok(BoundMethod {
            facade: Arc::clone(spec),
            method: *name,
            handler: Arc::clone(handler),
        })
    }

    /// Lists facades with at least one method that passes `chain`.
    #[must_use]
    pub fn describe(&self, chain: &RestrictionChain) -> Vec<FacadeVersions> {
        self.facades
            .iter()
            .filter_map(|(name, versions)| {
                let reachable: Vec<u32> = versions
                    .values()
                    .filter(|spec| spec.method_names().any(|m| chain.allows(name, m)))
                    .map(|spec| spec.version)
                    .collect();
                (!reachable.is_empty()).then(|| FacadeVersions {
                    name: (*name).to_string(),
                    versions: reachable,
                })
            })
            .collect()
    }
}

/// The method-routing object a session uses after login.
pub struct RootDispatcher {
    registry: Arc<FacadeRegistry>,
    chain: RestrictionChain,
    entity: Tag,
    resources: Arc<ResourceRegistry>,
    notifier: Notifier,
    connection_id: u64,
    instances: Mutex<HashMap<(&'static str, u32), Instance>>,
}

impl fmt::Debug for RootDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootDispatcher")
            .field("entity", &self.entity)
            .field("mode", &self.chain.mode())
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl RootDispatcher {
    /// Creates a dispatcher for an authenticated session.
    #[must_use]
    pub fn new(
        registry: Arc<FacadeRegistry>,
        chain: RestrictionChain,
        entity: Tag,
        resources: Arc<ResourceRegistry>,
        notifier: Notifier,
        connection_id: u64,
    ) -> Self {
        Self {
            registry,
            chain,
            entity,
            resources,
            notifier,
            connection_id,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the authenticated entity.
    #[must_use]
    pub const fn entity(&self) -> &Tag {
        &self.entity
    }

    /// Returns the restriction chain fixed at login.
    #[must_use]
    pub const fn chain(&self) -> &RestrictionChain {
        &self.chain
    }

    /// Lists the facades reachable under this session's restrictions.
    #[must_use]
    pub fn facades(&self) -> Vec<FacadeVersions> {
        self.registry.describe(&self.chain)
    }

    /// Resolves a method after applying the restriction chain.
    ///
    /// # Errors
    ///
    /// The chain's error if the call is gated, otherwise the lookup errors of
    /// [`FacadeRegistry::find_method`].
    pub fn find_method(
        &self,
        facade: &str,
        version: u32,
        method: &str,
    ) -> Result<BoundMethod, ApiError> {
        self.chain.check(facade, method)?;
        self.registry.find_method(facade, version, method)
    }

    /// Resolves and invokes a method.
    ///
    /// # Errors
    ///
    /// Any resolution error, [`ApiError::UnknownId`] for a bad instance id,
    /// or the method's own error.
    pub async fn call(
        &self,
        facade: &str,
        version: u32,
        id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, ApiError> {
        let bound = self.find_method(facade, version, method)?;
        let instance = self.instance(&bound.facade, id)?;
        (bound.handler)(instance, params).await
    }

    fn instance(&self, spec: &FacadeSpec, id: &str) -> Result<Instance, ApiError> {
        let unknown_id = || ApiError::UnknownId {
            facade: spec.name.to_string(),
            id: id.to_string(),
        };

        if spec.resource_backed {
            if id.is_empty() || !self.resources.contains(id) {
                return Err(unknown_id());
            }
            // Rebuilt per call so a stopped resource is never pinned here.
            return (spec.factory)(&self.facade_context(id));
        }
        if !id.is_empty() {
            return Err(unknown_id());
        }

        let key = (spec.name, spec.version);
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(instance) = instances.get(&key) {
            return Ok(Arc::clone(instance));
        }
        let instance = (spec.factory)(&self.facade_context(id))?;
        instances.insert(key, Arc::clone(&instance));
        Ok(instance)
    }

    fn facade_context(&self, id: &str) -> FacadeContext {
        FacadeContext {
            entity: self.entity.clone(),
            id: id.to_string(),
            resources: Arc::clone(&self.resources),
            notifier: self.notifier.clone(),
            connection_id: self.connection_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use corral_core::ControllerMode;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::protocol::resources::Resource;

    struct Echo {
        constructed_for: Tag,
    }

    #[derive(Deserialize)]
    struct EchoParams {
        text: String,
    }

    fn registry() -> Arc<FacadeRegistry> {
        let mut registry = FacadeRegistry::new();
        registry
            .register(
                FacadeSpec::builder("Client", 1, |ctx: &FacadeContext| {
                    Ok(Echo {
                        constructed_for: ctx.entity.clone(),
                    })
                })
                .method("Echo", |_f: Arc<Echo>, p: EchoParams| async move {
                    Ok::<_, ApiError>(p.text)
                })
                .method("WhoAmI", |f: Arc<Echo>, (): ()| async move {
                    Ok::<_, ApiError>(f.constructed_for.to_string())
                })
                .method("FullStatus", |_f: Arc<Echo>, (): ()| async move {
                    Ok::<_, ApiError>("ok")
                })
                .build(),
            )
            .unwrap();
        registry
            .register(
                FacadeSpec::builder("StatusWatcher", 1, |_ctx: &FacadeContext| Ok(()))
                    .resource_backed()
                    .method("Next", |_f: Arc<()>, (): ()| async move { Ok::<_, ApiError>(()) })
                    .build(),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn dispatcher(mode: ControllerMode) -> RootDispatcher {
        let (notifier, _rx) = Notifier::channel();
        RootDispatcher::new(
            registry(),
            RestrictionChain::for_mode(mode),
            Tag::user("admin").unwrap(),
            Arc::new(ResourceRegistry::new()),
            notifier,
            1,
        )
    }

    #[tokio::test]
    async fn test_typed_call_round_trip() {
        let d = dispatcher(ControllerMode::Normal);
        let out = d
            .call("Client", 1, "", "Echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, json!("hi"));
        let who = d.call("Client", 1, "", "WhoAmI", Value::Null).await.unwrap();
        assert_eq!(who, json!("user-admin"));
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let d = dispatcher(ControllerMode::Normal);
        assert!(matches!(
            d.call("Client", 1, "", "Nope", Value::Null).await,
            Err(ApiError::UnknownMethod { .. })
        ));
        assert!(matches!(
            d.call("Nope", 1, "", "Echo", Value::Null).await,
            Err(ApiError::UnknownMethod { .. })
        ));
        assert!(matches!(
            d.call("Client", 9, "", "Echo", Value::Null).await,
            Err(ApiError::UnsupportedVersion { version: 9, .. })
        ));
        assert!(matches!(
            d.call("Client", 1, "", "Echo", json!({"wrong": 1})).await,
            Err(ApiError::BadRequest { .. })
        ));
        assert!(matches!(
            d.call("Client", 1, "7", "Echo", json!({"text": "x"})).await,
            Err(ApiError::UnknownId { .. })
        ));
    }

    #[tokio::test]
    async fn test_resource_backed_requires_live_id() {
        let d = dispatcher(ControllerMode::Normal);
        assert!(matches!(
            d.call("StatusWatcher", 1, "", "Next", Value::Null).await,
            Err(ApiError::UnknownId { .. })
        ));
        assert!(matches!(
            d.call("StatusWatcher", 1, "1", "Next", Value::Null).await,
            Err(ApiError::UnknownId { .. })
        ));
    }

    #[tokio::test]
    async fn test_instances_are_cached() {
        let d = dispatcher(ControllerMode::Normal);
        for _ in 0..3 {
            d.call("Client", 1, "", "WhoAmI", Value::Null).await.unwrap();
        }
        d.call("Client", 1, "", "Echo", json!({"text": "x"})).await.unwrap();
        assert_eq!(d.instances.lock().unwrap().len(), 1);
    }

    struct Handle;

    #[async_trait::async_trait]
    impl Resource for Handle {
        fn kind(&self) -> &'static str {
            "handle"
        }

        async fn stop(&self) -> Result<(), String> {
            Ok(())
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[tokio::test]
    async fn test_stopped_resources_leave_no_cached_instances() {
        let d = dispatcher(ControllerMode::Normal);
        for _ in 0..100 {
            let id = d.resources.register(Arc::new(Handle)).unwrap();
            d.call("StatusWatcher", 1, &id, "Next", Value::Null)
                .await
                .unwrap();
            d.resources.stop(&id).await.unwrap();
            assert!(matches!(
                d.call("StatusWatcher", 1, &id, "Next", Value::Null).await,
                Err(ApiError::UnknownId { .. })
            ));
        }
        assert!(d.resources.is_empty());
        assert!(d.instances.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restrictions_apply_before_lookup() {
        let d = dispatcher(ControllerMode::Upgrading);
        assert_eq!(
            d.call("Client", 1, "", "Echo", json!({"text": "x"})).await,
            Err(ApiError::UpgradeInProgress)
        );
        assert_eq!(
            d.call("Client", 1, "", "NoSuchMethod", Value::Null).await,
            Err(ApiError::UpgradeInProgress)
        );
        assert_eq!(
            d.call("Client", 1, "", "FullStatus", Value::Null).await,
            Ok(json!("ok"))
        );
    }

    #[test]
    fn test_describe_filters_by_chain() {
        let registry = registry();
        let all = registry.describe(&RestrictionChain::for_mode(ControllerMode::Normal));
        assert_eq!(all.len(), 2);

        let upgrading = registry.describe(&RestrictionChain::for_mode(ControllerMode::Upgrading));
        assert_eq!(
            upgrading,
            vec![FacadeVersions {
                name: "Client".into(),
                versions: vec![1]
            }]
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = FacadeRegistry::new();
        let spec = || FacadeSpec::builder("Pinger", 1, |_: &FacadeContext| Ok(())).build();
        registry.register(spec()).unwrap();
        assert_eq!(
            registry.register(spec()),
            Err(RegistrationError::Duplicate {
                name: "Pinger",
                version: 1
            })
        );
    }
}
