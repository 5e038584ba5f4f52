//! Property abstractions.
//!
//! A property is a keyed, asynchronous value provider. Implementors write a
//! [`Property`]; callers and other properties address it through the
//! object-safe [`KvProperty`] view, usually as a [`PropertyRef`].


use std::borrow::Cow;
use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use crate::LockResource;
use crate::LockType;
use crate::ProcessCallback;
use crate::PropertyContext;
use crate::PropertyNodeBox;
use crate::PropertyState;
use crate::TrackerConfig;

/// Keys must render to a string: lock paths are built from it and an empty
/// rendering is rejected at admission.
pub trait RequestKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    fn key_string(&self) -> Cow<'_, str>;
}

impl RequestKey for String {
    fn key_string(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.as_str())
    }
}

impl RequestKey for &'static str {
    fn key_string(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

macro_rules! impl_request_key_for_int {
    ($($t:ty),*) => {
        $(
            impl RequestKey for $t {
                fn key_string(&self) -> Cow<'_, str> {
                    Cow::Owned(self.to_string())
                }
            }
        )*
    };
}

impl_request_key_for_int!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

pub trait PropertyValue: Clone + Debug + Send + Sync + 'static {}

impl<T> PropertyValue for T where T: Clone + Debug + Send + Sync + 'static {}

/// Identity of a property instance inside a server.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyId(usize);

impl PropertyId {
    /// Sender id of requests that originate from outside any property.
    pub(crate) const SERVER: PropertyId = PropertyId(0);

    pub(crate) fn of<T: ?Sized>(property: &T) -> Self {
        PropertyId(property as *const T as *const () as usize)
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: usize) -> Self {
        PropertyId(raw)
    }
}

impl fmt::Debug for PropertyId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if *self == PropertyId::SERVER {
            write!(f, "PropertyId(server)")
        } else {
            write!(f, "PropertyId({:#x})", self.0)
        }
    }
}

impl fmt::Display for PropertyId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A property implementation.
///
/// All three hooks run on the server task, never concurrently for the same
/// server. `process_requests` may hand work off to other tasks; results come
/// back through the [`ProcessCallback`].
pub trait Property: Send + Sync + Sized + 'static {
    type Key: RequestKey;
    type Value: PropertyValue;
    /// Per-server mutable state. Rebuilt from scratch when the property
    /// panics.
    type Model: Send + 'static;

    fn create_model(&self) -> Self::Model;

    /// Lock needed by an external request on `key`. Must not block.
    fn lock_resource(
        &self,
        key: &Self::Key,
        lock_type: LockType,
    ) -> LockResource;

    /// Called once per round in which new requests arrived or a response to
    /// one of this property's own requests was delivered.
    fn rearrange_requests(
        &self,
        ctx: &mut PropertyContext<'_, Self>,
    );

    /// Called when the property has outstanding incoming requests and no
    /// process invocation is active. Must eventually complete `callback`.
    fn process_requests(
        &self,
        ctx: &mut PropertyContext<'_, Self>,
        callback: ProcessCallback<Self>,
    );

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Type-erased view of a property with key `K` and value `V`.
///
/// Implemented for every [`Property`]; it cannot be implemented by hand.
pub trait KvProperty<K: RequestKey, V: PropertyValue>: Send + Sync + 'static {
    fn lock_resource(
        &self,
        key: &K,
        lock_type: LockType,
    ) -> LockResource;

    fn property_id(&self) -> PropertyId;

    fn property_name(&self) -> &str;

    #[doc(hidden)]
    fn create_node(
        self: Arc<Self>,
        config: &TrackerConfig,
    ) -> PropertyNodeBox;
}

impl<P: Property> KvProperty<P::Key, P::Value> for P {
    fn lock_resource(
        &self,
        key: &P::Key,
        lock_type: LockType,
    ) -> LockResource {
        Property::lock_resource(self, key, lock_type)
    }

    fn property_id(&self) -> PropertyId {
        PropertyId::of(self)
    }

    fn property_name(&self) -> &str {
        self.name()
    }

    fn create_node(
        self: Arc<Self>,
        config: &TrackerConfig,
    ) -> PropertyNodeBox {
        PropertyNodeBox(Box::new(PropertyState::new(self, config)))
    }
}

pub type PropertyRef<K, V> = Arc<dyn KvProperty<K, V>>;

/// Receives values published by properties such as the memory cache.
#[cfg_attr(test, automock)]
pub trait ValueObserver<K: RequestKey, V: PropertyValue>: Send + Sync {
    fn update_value(
        &self,
        key: &K,
        value: Option<V>,
    );
}
