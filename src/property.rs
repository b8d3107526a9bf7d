// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Typed properties addressed by numeric ID, with change notification.
//!
//! A [`PropertyStore`] holds the runtime configuration of a stream. Every property has a fixed
//! type, and may have a validator (which can refuse a new value), a setter (which applies a value
//! together with the properties that depend on it), a computed getter (for values derived from
//! other state, like the depth tables), and observers called after each change.

use std::{collections::BTreeMap, sync::Arc};

use tracing::debug;

use crate::{Error, Result};

/// Property IDs
pub mod property_id {
    /// Output pixel format of a stream, as a [`crate::PixelFormat`] code
    pub const OUTPUT_FORMAT: u32 = 0x1080FF12;
    /// Depths at or below this are dropped
    pub const MIN_DEPTH: u32 = 0x1080FF40;
    /// Depths at or above this are dropped
    pub const MAX_DEPTH: u32 = 0x1080FF41;
    /// Largest depth the device can report
    pub const DEVICE_MAX_DEPTH: u32 = 0x1080FF43;

    /// Shift offset
    pub const CONST_SHIFT: u32 = 0x10801007;
    /// Pixel binning factor
    pub const PIXEL_SIZE_FACTOR: u32 = 0x10801008;
    /// Largest shift value the device reports
    pub const MAX_SHIFT: u32 = 0x10801009;
    /// Sub-pixel resolution of the shift values
    pub const PARAM_COEFF: u32 = 0x1080100A;
    /// Output unit multiplier
    pub const SHIFT_SCALE: u32 = 0x1080100B;
    /// Reference plane distance
    pub const ZERO_PLANE_DISTANCE: u32 = 0x1080100C;
    /// Pixel size at the reference plane
    pub const ZERO_PLANE_PIXEL_SIZE: u32 = 0x1080100D;
    /// Emitter to depth CMOS distance
    pub const EMITTER_DCMOS_DISTANCE: u32 = 0x1080100E;
    /// Shift to depth table, little endian u16 values
    pub const S2D_TABLE: u32 = 0x10801010;
    /// Depth to shift table, little endian u16 values
    pub const D2S_TABLE: u32 = 0x10801011;
}

/// Value of a property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Integer
    Int(u64),
    /// Floating point
    Real(f64),
    /// Text
    String(String),
    /// Opaque bytes
    General(Vec<u8>),
}

impl PropertyValue {
    fn same_type(&self, other: &PropertyValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Called after a property changed. `id` is the property that changed.
///
/// Returning an error stops the notification of the remaining observers, and is returned from
/// [`PropertyStore::set`].
pub trait PropertyObserver: Send + Sync {
    /// The property changed
    fn on_change(&self, store: &PropertyStore, id: u32) -> Result<()>;
}

impl<F> PropertyObserver for F
where
    F: Fn(&PropertyStore, u32) -> Result<()> + Send + Sync,
{
    fn on_change(&self, store: &PropertyStore, id: u32) -> Result<()> {
        self(store, id)
    }
}

type Validator = Box<dyn Fn(&PropertyStore, &PropertyValue) -> Result<()> + Send + Sync>;
type Setter = Arc<dyn Fn(&mut PropertyStore, PropertyValue) -> Result<()> + Send + Sync>;
type Getter = Box<dyn Fn() -> PropertyValue + Send + Sync>;

/// A property definition, before it is added to a store
pub struct Property {
    id: u32,
    name: String,
    module: String,
    value: PropertyValue,
    read_only: bool,
    validator: Option<Validator>,
    setter: Option<Setter>,
    getter: Option<Getter>,
    observers: Vec<(u64, Box<dyn PropertyObserver>)>,
}

impl Property {
    /// Property with an initial value. The type of the value is the type of the property.
    pub fn new(id: u32, name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            id,
            name: name.into(),
            module: String::new(),
            value,
            read_only: false,
            validator: None,
            setter: None,
            getter: None,
            observers: Vec::new(),
        }
    }

    /// Integer property
    pub fn int(id: u32, name: impl Into<String>, value: u64) -> Self {
        Self::new(id, name, PropertyValue::Int(value))
    }

    /// Floating point property
    pub fn real(id: u32, name: impl Into<String>, value: f64) -> Self {
        Self::new(id, name, PropertyValue::Real(value))
    }

    /// Read-only general property whose value is computed on every read
    pub fn computed(
        id: u32,
        name: impl Into<String>,
        getter: impl Fn() -> PropertyValue + Send + Sync + 'static,
    ) -> Self {
        let mut property = Self::new(id, name, getter());
        property.getter = Some(Box::new(getter));
        property.read_only = true;
        property
    }

    /// Set the owning module's name
    pub fn in_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    /// Refuse every set
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Check new values with `validator` before they are stored
    pub fn with_validator(
        mut self,
        validator: impl Fn(&PropertyStore, &PropertyValue) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Apply accepted values with `setter` instead of storing them directly. The setter stores
    /// the value with [`PropertyStore::update_value`], and raises the change events.
    pub fn with_setter(
        mut self,
        setter: impl Fn(&mut PropertyStore, PropertyValue) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.setter = Some(Arc::new(setter));
        self
    }

    fn current(&self) -> PropertyValue {
        match &self.getter {
            Some(getter) => getter(),
            None => self.value.clone(),
        }
    }
}

/// Identifies a subscription, for [`PropertyStore::unsubscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle {
    property: u32,
    id: u64,
}

/// Properties of a stream or module, by ID
#[derive(Default)]
pub struct PropertyStore {
    properties: BTreeMap<u32, Property>,
    next_observer: u64,
}

impl PropertyStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a property. Fails if the ID is taken.
    pub fn add(&mut self, property: Property) -> Result<()> {
        if self.properties.contains_key(&property.id) {
            return Err(Error::Other("Property already exists"));
        }
        debug!(
            id = format_args!("0x{:08x}", property.id),
            name = %property.name,
            module = %property.module,
            "property added"
        );
        self.properties.insert(property.id, property);
        Ok(())
    }

    /// `true` if a property with this ID exists
    pub fn contains(&self, id: u32) -> bool {
        self.properties.contains_key(&id)
    }

    /// ID, name and module of every property, in ID order
    pub fn list(&self) -> impl Iterator<Item = (u32, &str, &str)> {
        self.properties
            .values()
            .map(|p| (p.id, p.name.as_str(), p.module.as_str()))
    }

    fn property(&self, id: u32) -> Result<&Property> {
        self.properties.get(&id).ok_or(Error::PropertyNotFound(id))
    }

    /// Current value
    pub fn get(&self, id: u32) -> Result<PropertyValue> {
        Ok(self.property(id)?.current())
    }

    /// Current value of an integer property
    pub fn get_int(&self, id: u32) -> Result<u64> {
        match self.get(id)? {
            PropertyValue::Int(v) => Ok(v),
            _ => Err(Error::PropertyTypeMismatch(id)),
        }
    }

    /// Current value of a floating point property
    pub fn get_real(&self, id: u32) -> Result<f64> {
        match self.get(id)? {
            PropertyValue::Real(v) => Ok(v),
            _ => Err(Error::PropertyTypeMismatch(id)),
        }
    }

    /// Copy a general property into `out`. Returns the number of bytes copied.
    ///
    /// Fails with [`Error::OutputBufferOverflow`] if `out` is smaller than the value.
    pub fn get_general_into(&self, id: u32, out: &mut [u8]) -> Result<usize> {
        let PropertyValue::General(data) = self.get(id)? else {
            return Err(Error::PropertyTypeMismatch(id));
        };
        if out.len() < data.len() {
            return Err(Error::OutputBufferOverflow {
                needed: data.len(),
                available: out.len(),
            });
        }
        out[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Change a property.
    ///
    /// The validator may refuse the value, in which case nothing changes. Setting the current
    /// value again does nothing. Otherwise the value is stored (by the setter, if there is one)
    /// and the observers are called in subscription order, before this returns.
    pub fn set(&mut self, id: u32, value: PropertyValue) -> Result<()> {
        let property = self.property(id)?;
        if property.read_only {
            return Err(Error::PropertyReadOnly(id));
        }
        if !property.value.same_type(&value) {
            return Err(Error::PropertyTypeMismatch(id));
        }
        if property.value == value {
            return Ok(());
        }
        let setter = property.setter.clone();
        if let Some(validator) = &property.validator {
            validator(self, &value)?;
        }

        match setter {
            Some(setter) => setter(self, value),
            None => {
                self.update_value(id, value)?;
                self.notify(id)
            }
        }
    }

    /// Store a value without the validator, the setter or the observers.
    /// Returns `false` if the value was already set.
    ///
    /// For setters that change several properties at once, and call [`PropertyStore::notify`]
    /// once everything is consistent.
    pub fn update_value(&mut self, id: u32, value: PropertyValue) -> Result<bool> {
        let property = self
            .properties
            .get_mut(&id)
            .ok_or(Error::PropertyNotFound(id))?;
        if !property.value.same_type(&value) {
            return Err(Error::PropertyTypeMismatch(id));
        }
        if property.value == value {
            return Ok(false);
        }
        debug!(
            id = format_args!("0x{id:08x}"),
            name = %property.name,
            ?value,
            "property changed"
        );
        property.value = value;
        Ok(true)
    }

    /// Set an integer property
    pub fn set_int(&mut self, id: u32, value: u64) -> Result<()> {
        self.set(id, PropertyValue::Int(value))
    }

    /// Set a floating point property
    pub fn set_real(&mut self, id: u32, value: f64) -> Result<()> {
        self.set(id, PropertyValue::Real(value))
    }

    /// Call the observers of `id`, as if it changed. Used for computed properties whose
    /// source changed.
    pub fn notify(&self, id: u32) -> Result<()> {
        for (_, observer) in &self.property(id)?.observers {
            observer.on_change(self, id)?;
        }
        Ok(())
    }

    /// Call `observer` after every change of `id`
    pub fn subscribe(
        &mut self,
        id: u32,
        observer: impl PropertyObserver + 'static,
    ) -> Result<ObserverHandle> {
        let handle = ObserverHandle {
            property: id,
            id: self.next_observer,
        };
        self.properties
            .get_mut(&id)
            .ok_or(Error::PropertyNotFound(id))?
            .observers
            .push((handle.id, Box::new(observer)));
        self.next_observer += 1;
        Ok(handle)
    }

    /// Remove a subscription. Removing it twice is a no-op.
    pub fn unsubscribe(&mut self, handle: ObserverHandle) -> Result<()> {
        self.properties
            .get_mut(&handle.property)
            .ok_or(Error::PropertyNotFound(handle.property))?
            .observers
            .retain(|(id, _)| *id != handle.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    const A: u32 = 0x1080FF90;
    const B: u32 = 0x1080FF91;

    fn recorder(
        store: &mut PropertyStore,
        id: u32,
        log: &Arc<Mutex<Vec<String>>>,
        tag: &str,
    ) -> ObserverHandle {
        let log = log.clone();
        let tag = tag.to_string();
        store
            .subscribe(id, move |store: &PropertyStore, id: u32| -> Result<()> {
                log.lock()
                    .unwrap()
                    .push(format!("{tag}:{}", store.get_int(id)?));
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn observers_run_in_order() {
        let mut store = PropertyStore::new();
        store.add(Property::int(A, "A", 1).in_module("Test")).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = recorder(&mut store, A, &log, "first");
        recorder(&mut store, A, &log, "second");

        store.set_int(A, 2).unwrap();
        // Same value, no event
        store.set_int(A, 2).unwrap();
        store.unsubscribe(first).unwrap();
        store.unsubscribe(first).unwrap();
        store.set_int(A, 3).unwrap();
        assert_eq!(*log.lock().unwrap(), ["first:2", "second:2", "second:3"]);
    }

    #[test]
    fn validator_can_refuse() {
        let mut store = PropertyStore::new();
        store.add(Property::int(B, "Limit", 10)).unwrap();
        store
            .add(Property::int(A, "Value", 5).with_validator(|store, value| {
                match value {
                    PropertyValue::Int(v) if *v > store.get_int(B)? => {
                        Err(Error::PropertyRejected("value above limit"))
                    }
                    _ => Ok(()),
                }
            }))
            .unwrap();
        assert!(matches!(
            store.set_int(A, 11),
            Err(Error::PropertyRejected(_))
        ));
        assert_eq!(store.get_int(A).unwrap(), 5);
        store.set_int(A, 10).unwrap();
        assert_eq!(store.get_int(A).unwrap(), 10);
    }

    #[test]
    fn setter_changes_dependent_properties() {
        let mut store = PropertyStore::new();
        store.add(Property::int(B, "Limit", 10)).unwrap();
        store
            .add(
                Property::int(A, "Mode", 0).with_setter(|store, value| {
                    let limit = match value {
                        PropertyValue::Int(0) => 10,
                        _ => 100,
                    };
                    let limit_changed = store.update_value(B, PropertyValue::Int(limit))?;
                    store.update_value(A, value)?;
                    if limit_changed {
                        store.notify(B)?;
                    }
                    store.notify(A)
                }),
            )
            .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&mut store, B, &log, "limit");
        recorder(&mut store, A, &log, "mode");

        store.set_int(A, 1).unwrap();
        assert_eq!(store.get_int(B).unwrap(), 100);
        assert_eq!(*log.lock().unwrap(), ["limit:100", "mode:1"]);
        assert!(!store.update_value(B, PropertyValue::Int(100)).unwrap());
        assert!(matches!(
            store.update_value(B, PropertyValue::Real(1.0)),
            Err(Error::PropertyTypeMismatch(B))
        ));
    }

    #[test]
    fn observer_error_stops_the_chain() {
        let mut store = PropertyStore::new();
        store.add(Property::int(A, "A", 0)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        store
            .subscribe(A, |_: &PropertyStore, _: u32| -> Result<()> {
                Err(Error::Other("nope"))
            })
            .unwrap();
        recorder(&mut store, A, &log, "late");
        assert!(matches!(store.set_int(A, 1), Err(Error::Other("nope"))));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn type_and_access_errors() {
        let mut store = PropertyStore::new();
        store.add(Property::real(A, "A", 1.5)).unwrap();
        store.add(Property::int(B, "B", 1).read_only()).unwrap();
        assert!(store.add(Property::int(A, "again", 0)).is_err());
        assert!(matches!(store.set_int(A, 1), Err(Error::PropertyTypeMismatch(A))));
        assert!(matches!(store.get_int(A), Err(Error::PropertyTypeMismatch(A))));
        assert!(matches!(store.set_int(B, 2), Err(Error::PropertyReadOnly(B))));
        assert!(matches!(store.get(0x1234), Err(Error::PropertyNotFound(0x1234))));
        store.set_real(A, 2.5).unwrap();
        assert_eq!(store.get_real(A).unwrap(), 2.5);
        assert_eq!(
            store.list().collect::<Vec<_>>(),
            vec![(A, "A", ""), (B, "B", "")]
        );
    }

    #[test]
    fn computed_general_property() {
        let source = Arc::new(Mutex::new(vec![1u8, 2, 3]));
        let mut store = PropertyStore::new();
        let getter_source = source.clone();
        store
            .add(Property::computed(A, "Table", move || {
                PropertyValue::General(getter_source.lock().unwrap().clone())
            }))
            .unwrap();

        let mut out = [0u8; 4];
        assert_eq!(store.get_general_into(A, &mut out).unwrap(), 3);
        assert_eq!(out[..3], [1, 2, 3]);

        source.lock().unwrap().extend([4, 5]);
        assert!(matches!(
            store.get_general_into(A, &mut out),
            Err(Error::OutputBufferOverflow {
                needed: 5,
                available: 4
            })
        ));
        assert!(matches!(
            store.set(A, PropertyValue::General(vec![])),
            Err(Error::PropertyReadOnly(A))
        ));
    }
}
