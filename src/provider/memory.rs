//! In-memory provider with failure injection.
//!
//! Used by tests and dry runs. Failures can be injected per operation and per
//! matching attribute, objects can be mutated or removed out of band to
//! simulate drift, and every call is logged so tests can assert on ordering
//! and peak concurrency.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::ProviderAdapter;
use crate::error::{KeystoneError, ProviderError, Result};
use crate::model::Attributes;

/// Provider operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `read`
    Read,
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

/// Class of an injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retryable.
    Transient,
    /// Not retryable.
    Permanent,
}

/// A failure to inject into matching calls.
#[derive(Debug, Clone)]
pub struct FailureRule {
    operation: Operation,
    kind: FailureKind,
    matcher: Option<(String, Value)>,
    remaining: Option<u32>,
}

impl FailureRule {
    /// Every matching call fails transiently.
    #[must_use]
    pub const fn transient(operation: Operation) -> Self {
        Self {
            operation,
            kind: FailureKind::Transient,
            matcher: None,
            remaining: None,
        }
    }

    /// Every matching call fails permanently.
    #[must_use]
    pub const fn permanent(operation: Operation) -> Self {
        Self {
            operation,
            kind: FailureKind::Permanent,
            matcher: None,
            remaining: None,
        }
    }

    /// Only match objects whose `field` equals `value`.
    #[must_use]
    pub fn matching(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.matcher = Some((field.to_string(), value.into()));
        self
    }

    /// Only fail the first `n` matching calls.
    #[must_use]
    pub const fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, operation: Operation, attributes: &Attributes) -> bool {
        self.operation == operation
            && self.remaining != Some(0)
            && self
                .matcher
                .as_ref()
                .is_none_or(|(field, value)| attributes.get(field) == Some(value))
    }
}

/// One logged provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Operation performed.
    pub operation: Operation,
    /// Resource type.
    pub resource_type: String,
    /// Object id, or the desired `name` attribute for creates.
    pub target: String,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, (String, Attributes)>,
    next_id: u64,
    failures: Vec<FailureRule>,
    calls: Vec<Call>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Provider keeping objects in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    inner: Arc<Mutex<Inner>>,
    delay: Option<Duration>,
    immutable: BTreeMap<String, BTreeSet<String>>,
}

/// Decrements the in-flight counter when a call ends.
struct InFlight<'a>(&'a MemoryProvider);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.0.inner.lock() {
            inner.in_flight = inner.in_flight.saturating_sub(1);
        }
    }
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call take at least `delay`.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Declares immutable fields for a type.
    #[must_use]
    pub fn with_immutable<I, S>(mut self, resource_type: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.immutable
            .entry(resource_type.to_string())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Adds a failure rule. Rules are checked in insertion order.
    pub fn fail(&self, rule: FailureRule) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failures.push(rule);
        }
    }

    /// Removes every failure rule.
    pub fn clear_failures(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failures.clear();
        }
    }

    /// Changes an attribute of an object behind the engine's back.
    pub fn drift(&self, id: &str, field: &str, value: impl Into<Value>) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some((_, attributes)) = inner.objects.get_mut(id) {
                attributes.insert(field.to_string(), value.into());
            }
        }
    }

    /// Deletes an object behind the engine's back.
    pub fn remove(&self, id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.objects.remove(id);
        }
    }

    /// Current objects keyed by id.
    #[must_use]
    pub fn objects(&self) -> BTreeMap<String, Attributes> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .objects
                    .iter()
                    .map(|(id, (_, attrs))| (id.clone(), attrs.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids of objects whose `field` equals `value`.
    #[must_use]
    pub fn find(&self, field: &str, value: impl Into<Value>) -> Vec<String> {
        let value = value.into();
        self.objects()
            .into_iter()
            .filter(|(_, attrs)| attrs.get(field) == Some(&value))
            .map(|(id, _)| id)
            .collect()
    }

    /// Every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.inner
            .lock()
            .map(|inner| inner.calls.clone())
            .unwrap_or_default()
    }

    /// Number of calls of one operation.
    #[must_use]
    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Highest number of calls that were in flight at once.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.inner.lock().map(|inner| inner.max_in_flight).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| KeystoneError::internal("memory provider mutex poisoned"))
    }

    /// Logs the call, applies injected failures and tracks concurrency.
    async fn enter(
        &self,
        operation: Operation,
        resource_type: &str,
        target: &str,
        attributes: &Attributes,
    ) -> Result<InFlight<'_>> {
        {
            let mut inner = self.lock()?;
            inner.calls.push(Call {
                operation,
                resource_type: resource_type.to_string(),
                target: target.to_string(),
            });
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        }
        let guard = InFlight(self);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failure = {
            let mut inner = self.lock()?;
            inner
                .failures
                .iter_mut()
                .find(|rule| rule.matches(operation, attributes))
                .map(|rule| {
                    if let Some(n) = rule.remaining.as_mut() {
                        *n -= 1;
                    }
                    rule.kind
                })
        };

        match failure {
            Some(FailureKind::Transient) => {
                Err(ProviderError::transient(target, "injected transient failure").into())
            }
            Some(FailureKind::Permanent) => {
                Err(ProviderError::permanent(target, "injected permanent failure").into())
            }
            None => Ok(guard),
        }
    }

    fn stored(&self, resource_type: &str, id: &str) -> Result<Attributes> {
        self.lock()?
            .objects
            .get(id)
            .filter(|(t, _)| t == resource_type)
            .map(|(_, attrs)| attrs.clone())
            .ok_or_else(|| ProviderError::not_found(resource_type, id).into())
    }
}

#[async_trait]
impl ProviderAdapter for MemoryProvider {
    async fn read(&self, resource_type: &str, id: &str) -> Result<Attributes> {
        let current = self.stored(resource_type, id).unwrap_or_default();
        let _call = self.enter(Operation::Read, resource_type, id, &current).await?;
        self.stored(resource_type, id)
    }

    async fn create(&self, resource_type: &str, desired: &Attributes) -> Result<(String, Attributes)> {
        let label = desired
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(resource_type)
            .to_string();
        let _call = self.enter(Operation::Create, resource_type, &label, desired).await?;

        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = format!("{resource_type}-{}", inner.next_id);
        let mut attributes = desired.clone();
        attributes.insert(String::from("id"), Value::String(id.clone()));
        inner
            .objects
            .insert(id.clone(), (resource_type.to_string(), attributes.clone()));
        Ok((id, attributes))
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        changes: &Attributes,
        _desired: &Attributes,
    ) -> Result<Attributes> {
        let mut merged = self.stored(resource_type, id)?;
        for (field, value) in changes {
            if value.is_null() {
                merged.remove(field);
            } else {
                merged.insert(field.clone(), value.clone());
            }
        }
        let _call = self.enter(Operation::Update, resource_type, id, &merged).await?;

        let mut inner = self.lock()?;
        match inner.objects.get_mut(id) {
            Some((_, attributes)) => {
                attributes.clone_from(&merged);
                Ok(merged)
            }
            None => Err(ProviderError::not_found(resource_type, id).into()),
        }
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<()> {
        let current = self.stored(resource_type, id).unwrap_or_default();
        let _call = self.enter(Operation::Delete, resource_type, id, &current).await?;

        let removed = self.lock()?.objects.remove(id);
        removed
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found(resource_type, id).into())
    }

    fn immutable_fields(&self, resource_type: &str) -> BTreeSet<String> {
        self.immutable.get(resource_type).cloned().unwrap_or_default()
    }
}
