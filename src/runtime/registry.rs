//! Versioned registry for orchestrations and activities.
//!
//! Both handler kinds share `Registry<H>`. Activities always live at version
//! 1.0.0; orchestrations may register several semver versions and pick one per
//! name through a [`VersionPolicy`]. An instance keeps the version it started
//! with for its whole life.

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::codec::Json;
use crate::{ActivityContext, FailureDetail, OrchestrationContext};
use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    pub(crate) policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

// ============================================================================
// Generic Registry Implementation
// ============================================================================

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    fn policy_for(&self, name: &str) -> VersionPolicy {
        self.policy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
            .unwrap_or(VersionPolicy::Latest)
    }

    /// Resolve a handler through the name's version policy.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let policy = self.policy_for(name);
        let versions = self.inner.get(name);
        let result = match &policy {
            VersionPolicy::Latest => versions
                .and_then(|m| m.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => versions
                .and_then(|m| m.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };
        if result.is_none() {
            tracing::debug!(
                target: "durable_core::runtime::registry",
                requested_name = %name,
                requested_policy = ?policy,
                registered_names = ?self.list_names(),
                "registry lookup miss"
            );
        }
        result
    }

    pub fn resolve_handler_exact(&self, name: &str, version: &Version) -> Option<Arc<H>> {
        self.inner.get(name).and_then(|m| m.get(version)).cloned()
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

// ============================================================================
// Generic Builder Implementation
// ============================================================================

impl<H: ?Sized> RegistryBuilder<H> {
    /// Build the registry. Rejected registrations (duplicates, bad versions)
    /// are logged and skipped; use [`build_result`](Self::build_result) to fail instead.
    pub fn build(self) -> Registry<H> {
        for error in &self.errors {
            tracing::warn!(target: "durable_core::runtime::registry", %error, "registration skipped");
        }
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build the registry, or return every registration error joined with "; ".
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn insert(&mut self, name: String, version: Version, handler: Arc<H>, kind: &str) {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&version) {
            self.errors.push(format!("duplicate {kind} registration: {name}@{version}"));
            return;
        }
        entry.insert(version, handler);
    }
}

// ============================================================================
// Orchestration Builder
// ============================================================================

impl OrchestrationRegistryBuilder {
    /// Register at version 1.0.0.
    pub fn register<F, Fut, E>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
        E: Into<FailureDetail> + 'static,
    {
        self.register_versioned(name, DEFAULT_VERSION.to_string(), f)
    }

    pub fn register_versioned<F, Fut, E>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
        E: Into<FailureDetail> + 'static,
    {
        let name = name.into();
        let version = match Version::parse(version.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                self.errors
                    .push(format!("invalid version for orchestration {name}: {}: {e}", version.as_ref()));
                return self;
            }
        };
        let handler = FnOrchestration(move |ctx: OrchestrationContext, input: String| {
            let fut = f(ctx, input);
            async move { fut.await.map_err(Into::into) }
        });
        self.insert(name, version, Arc::new(handler), "orchestration");
        self
    }

    /// Register with serde-decoded input and serde-encoded output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, FailureDetail>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx: OrchestrationContext, raw: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&raw)?;
                let out = f(ctx, input).await?;
                Json::encode(&out)
            }
        })
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

// ============================================================================
// Activity Builder
// ============================================================================

impl ActivityRegistryBuilder {
    pub fn register<F, Fut, E>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
        E: Into<FailureDetail> + 'static,
    {
        let name = name.into();
        let handler = FnActivity(move |ctx: ActivityContext, input: String| {
            let fut = f(ctx, input);
            async move { fut.await.map_err(Into::into) }
        });
        self.insert(name.clone(), DEFAULT_VERSION, Arc::new(handler), "activity");
        self.policy.insert(name, VersionPolicy::Latest);
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, FailureDetail>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx: ActivityContext, raw: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&raw)?;
                let out = f(ctx, input).await?;
                Json::encode(&out)
            }
        })
    }
}
