// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Provider capabilities the publication manager subscribes to.
//!
//! A [`Provider`] is a named set of attributes and events. Attributes are
//! reached through the [`ProviderAttribute`] capability (getter, optional
//! setter, value-changed observers); events through [`ProviderEvent`].

use crate::error::{MeshError, Result};
use crate::routing::validate_publication_partitions;
use crate::types::BroadcastFilterParameters;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by observer registration.
pub type ObserverId = u64;

/// Callback receiving the new value of an attribute.
pub type AttributeObserver = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback receiving every firing of an event.
pub type EventObserver = Arc<dyn Fn(&EventFiring) + Send + Sync>;

/// Asynchronous attribute getter.
pub type AttributeGetter = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Attribute capability of a provider.
#[async_trait]
pub trait ProviderAttribute: Send + Sync {
    async fn get(&self) -> Result<Value>;

    async fn set(&self, _value: Value) -> Result<()> {
        Err(MeshError::Provider("attribute is read-only".into()))
    }

    /// Whether value changes are reported to observers.
    fn is_notifiable(&self) -> bool;

    fn register_observer(&self, observer: AttributeObserver) -> ObserverId;

    fn unregister_observer(&self, id: ObserverId);
}

struct Observers<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ObserverId, T)>>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Observers<T> {
    fn register(&self, observer: T) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, observer));
        id
    }

    fn unregister(&self, id: ObserverId) {
        self.entries.lock().retain(|(observer_id, _)| *observer_id != id);
    }

    // Observers run outside the lock so they may re-enter.
    fn snapshot(&self) -> Vec<T> {
        self.entries.lock().iter().map(|(_, o)| o.clone()).collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Attribute backed by a stored value.
///
/// [`NotifyAttribute::value_changed`] stores the new value and notifies every
/// observer. A custom getter replaces reads of the stored value.
pub struct NotifyAttribute {
    value: RwLock<Value>,
    notifiable: bool,
    writable: bool,
    getter: Option<AttributeGetter>,
    observers: Observers<AttributeObserver>,
}

impl NotifyAttribute {
    pub fn new(initial: Value) -> Self {
        Self {
            value: RwLock::new(initial),
            notifiable: true,
            writable: true,
            getter: None,
            observers: Observers::default(),
        }
    }

    /// Attribute that rejects on-change subscriptions.
    pub fn not_notifiable(initial: Value) -> Self {
        Self {
            notifiable: false,
            ..Self::new(initial)
        }
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn with_getter<F>(mut self, getter: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    /// Store `value` and notify observers.
    pub fn value_changed(&self, value: Value) {
        *self.value.write() = value.clone();
        if !self.notifiable {
            return;
        }
        for observer in self.observers.snapshot() {
            observer(value.clone());
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl fmt::Debug for NotifyAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyAttribute")
            .field("value", &*self.value.read())
            .field("notifiable", &self.notifiable)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[async_trait]
impl ProviderAttribute for NotifyAttribute {
    async fn get(&self) -> Result<Value> {
        match &self.getter {
            Some(getter) => getter().await,
            None => Ok(self.value.read().clone()),
        }
    }

    async fn set(&self, value: Value) -> Result<()> {
        if !self.writable {
            return Err(MeshError::Provider("attribute is read-only".into()));
        }
        self.value_changed(value);
        Ok(())
    }

    fn is_notifiable(&self) -> bool {
        self.notifiable
    }

    fn register_observer(&self, observer: AttributeObserver) -> ObserverId {
        self.observers.register(observer)
    }

    fn unregister_observer(&self, id: ObserverId) {
        self.observers.unregister(id);
    }
}

/// Decides whether a selective broadcast reaches one subscriber.
pub trait BroadcastFilter: Send + Sync {
    fn filter(&self, output: &[Value], parameters: &BroadcastFilterParameters) -> bool;
}

impl<F> BroadcastFilter for F
where
    F: Fn(&[Value], &BroadcastFilterParameters) -> bool + Send + Sync,
{
    fn filter(&self, output: &[Value], parameters: &BroadcastFilterParameters) -> bool {
        self(output, parameters)
    }
}

/// One firing of an event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFiring {
    pub output: Vec<Value>,
    pub partitions: Vec<String>,
}

/// Event capability of a provider.
///
/// Selective events go to each broadcast subscriber separately, through the
/// event's filters. Non-selective events are published once per firing as a
/// multicast.
pub struct ProviderEvent {
    name: String,
    selective: bool,
    filter_parameter_names: Vec<String>,
    filters: Vec<Arc<dyn BroadcastFilter>>,
    observers: Observers<EventObserver>,
}

impl ProviderEvent {
    pub fn selective(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selective: true,
            filter_parameter_names: Vec::new(),
            filters: Vec::new(),
            observers: Observers::default(),
        }
    }

    pub fn non_selective(name: impl Into<String>) -> Self {
        Self {
            selective: false,
            ..Self::selective(name)
        }
    }

    /// Declare a filter parameter subscribers may set.
    pub fn with_filter_parameter(mut self, name: impl Into<String>) -> Self {
        self.filter_parameter_names.push(name.into());
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn BroadcastFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_selective(&self) -> bool {
        self.selective
    }

    pub fn filters(&self) -> &[Arc<dyn BroadcastFilter>] {
        &self.filters
    }

    /// Names declared by the event but missing from `parameters`, plus
    /// names present but not declared.
    pub fn check_filter_parameters(
        &self,
        parameters: Option<&BroadcastFilterParameters>,
    ) -> std::result::Result<(), Vec<String>> {
        let Some(parameters) = parameters else {
            return Ok(());
        };
        let mut mismatched: Vec<String> = self
            .filter_parameter_names
            .iter()
            .filter(|name| !parameters.contains_key(name.as_str()))
            .cloned()
            .collect();
        mismatched.extend(
            parameters
                .keys()
                .filter(|key| !self.filter_parameter_names.contains(key))
                .cloned(),
        );
        if mismatched.is_empty() {
            Ok(())
        } else {
            Err(mismatched)
        }
    }

    /// Fire the event. Partitions only apply to non-selective events.
    pub fn fire(&self, output: Vec<Value>, partitions: Vec<String>) -> Result<()> {
        if self.selective && !partitions.is_empty() {
            return Err(MeshError::InvalidMulticastId(format!(
                "selective event {} does not take partitions",
                self.name
            )));
        }
        validate_publication_partitions(&partitions)?;
        let firing = EventFiring { output, partitions };
        for observer in self.observers.snapshot() {
            observer(&firing);
        }
        Ok(())
    }

    pub fn register_observer(&self, observer: EventObserver) -> ObserverId {
        self.observers.register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) {
        self.observers.unregister(id);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl fmt::Debug for ProviderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEvent")
            .field("name", &self.name)
            .field("selective", &self.selective)
            .field("filter_parameters", &self.filter_parameter_names)
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Attributes and events of one provider, by name.
#[derive(Default)]
pub struct Provider {
    interface_name: String,
    attributes: BTreeMap<String, Arc<dyn ProviderAttribute>>,
    events: BTreeMap<String, Arc<ProviderEvent>>,
}

impl Provider {
    pub fn new(interface_name: impl Into<String>) -> Self {
        Self {
            interface_name: interface_name.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        attribute: Arc<dyn ProviderAttribute>,
    ) -> Self {
        self.attributes.insert(name.into(), attribute);
        self
    }

    pub fn with_event(mut self, event: Arc<ProviderEvent>) -> Self {
        self.events.insert(event.name().to_string(), event);
        self
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn attribute(&self, name: &str) -> Option<&Arc<dyn ProviderAttribute>> {
        self.attributes.get(name)
    }

    pub fn event(&self, name: &str) -> Option<&Arc<ProviderEvent>> {
        self.events.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&String, &Arc<dyn ProviderAttribute>)> {
        self.attributes.iter()
    }

    pub fn events(&self) -> impl Iterator<Item = &Arc<ProviderEvent>> {
        self.events.values()
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("interface_name", &self.interface_name)
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_attribute_notifies_observers() {
        let attribute = NotifyAttribute::new(json!(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = attribute.register_observer(Arc::new(move |v: Value| sink.lock().push(v)));

        attribute.value_changed(json!(2));
        assert_eq!(attribute.get().await.expect("get"), json!(2));

        attribute.unregister_observer(id);
        attribute.value_changed(json!(3));
        assert_eq!(*seen.lock(), vec![json!(2)]);
        assert_eq!(attribute.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_attribute_setter_and_getter() {
        let attribute = NotifyAttribute::new(json!("a")).read_only();
        assert!(attribute.set(json!("b")).await.is_err());

        let failing = NotifyAttribute::new(json!(0))
            .with_getter(|| async { Err(MeshError::Provider("sensor offline".into())) }.boxed());
        let err = failing.get().await.expect_err("getter fails");
        assert!(err.to_string().contains("sensor offline"));
    }

    #[test]
    fn test_filter_parameter_check() {
        let event = ProviderEvent::selective("weakSignal").with_filter_parameter("genre");
        assert!(event.check_filter_parameters(None).is_ok());

        let mut params = BroadcastFilterParameters::new();
        params.insert("genre".into(), "jazz".into());
        assert!(event.check_filter_parameters(Some(&params)).is_ok());

        params.insert("country".into(), "fr".into());
        let missing = event
            .check_filter_parameters(Some(&BroadcastFilterParameters::new()))
            .expect_err("genre missing");
        assert_eq!(missing, vec!["genre".to_string()]);
        let extra = event
            .check_filter_parameters(Some(&params))
            .expect_err("country undeclared");
        assert_eq!(extra, vec!["country".to_string()]);
    }

    #[test]
    fn test_fire_validates_partitions() {
        let event = ProviderEvent::non_selective("newStation");
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        event.register_observer(Arc::new(move |f: &EventFiring| sink.lock().push(f.clone())));

        event
            .fire(vec![json!("FM4")], vec!["europe".into(), "germany".into()])
            .expect("valid partitions");
        assert!(event.fire(vec![], vec!["bad-name".into()]).is_err());
        assert!(event.fire(vec![], vec!["+".into()]).is_err());
        assert!(event.fire(vec![], vec!["europe".into(), "*".into()]).is_err());
        assert_eq!(fired.lock().len(), 1);
        assert_eq!(fired.lock()[0].partitions, vec!["europe", "germany"]);

        let selective = ProviderEvent::selective("weakSignal");
        assert!(selective.fire(vec![], vec!["europe".into()]).is_err());
    }
}
