//! Distributed objects.
//!
//! A shared type describes itself once through a [`Capabilities`] table:
//! which properties can be read or written and which methods exist, with
//! their access markers. [`SharedObject<T>`] wraps a value of such a type
//! under a name and a weak handle to the node that holds it. The node only
//! ever sees the erased [`DistributedObject`] trait.
//!
//! The routed accessors on [`SharedObject`] (`get`, `set`, `invoke`) go
//! through the node's routing matrix. The direct entry points on
//! [`DistributedObject`] (`get_direct`, `set_direct`, `invoke_direct`) act
//! on the local copy and are what message handlers call.
//!
//! Closures in a capability table need their parameter types spelled out:
//!
//! ```ignore
//! impl SharedType for Counter {
//!     const TYPE_TAG: &'static str = "demo.Counter";
//!
//!     fn capabilities() -> &'static Capabilities<Self> {
//!         static CAPS: OnceLock<Capabilities<Counter>> = OnceLock::new();
//!         CAPS.get_or_init(|| {
//!             Capabilities::new().property(
//!                 "count",
//!                 |c: &Counter| json!(c.count),
//!                 |c: &mut Counter, v: Value| {
//!                     c.count = serde_json::from_value(v)?;
//!                     Ok(())
//!                 },
//!             )
//!         })
//!     }
//! }
//! ```

use crate::node::{Node, WeakNode};
use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tether_types::{Id, ObjectWithType, TetherError, TetherResult, Value};

/// Arguments of one method call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodCall {
    pub type_arguments: Vec<String>,
    pub arguments: Vec<Value>,
}

impl MethodCall {
    pub fn new(arguments: Vec<Value>) -> Self {
        Self {
            type_arguments: Vec::new(),
            arguments,
        }
    }

    pub fn with_type_arguments(mut self, type_arguments: Vec<String>) -> Self {
        self.type_arguments = type_arguments;
        self
    }

    /// Deserialize the argument at `index`.
    pub fn arg<A: DeserializeOwned>(&self, index: usize) -> TetherResult<A> {
        let value = self
            .arguments
            .get(index)
            .ok_or_else(|| TetherError::InvalidArgument(format!("missing argument {}", index)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| TetherError::InvalidArgument(format!("argument {}: {}", index, e)))
    }
}

pub type Getter<T> = fn(&T) -> Value;
pub type Setter<T> = fn(&mut T, Value) -> TetherResult<()>;
pub type MethodFn<T> =
    fn(Arc<SharedObject<T>>, MethodCall) -> BoxFuture<'static, TetherResult<Value>>;

/// Access markers of a method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodAccess {
    /// Clients may call the method on the server's object.
    pub client_callable: bool,
    /// The method is never remoted.
    pub ignored: bool,
}

impl MethodAccess {
    /// Whether a client may have this method executed by the server.
    pub fn callable_by_client(&self) -> bool {
        self.client_callable && !self.ignored
    }
}

struct Property<T> {
    get: Getter<T>,
    set: Option<Setter<T>>,
}

/// One method entry of a capability table.
pub struct Method<T> {
    call: MethodFn<T>,
    access: MethodAccess,
}

impl<T> Method<T> {
    pub fn new(call: MethodFn<T>) -> Self {
        Self {
            call,
            access: MethodAccess::default(),
        }
    }

    /// Mark the method as callable by clients.
    pub fn client_callable(mut self) -> Self {
        self.access.client_callable = true;
        self
    }

    /// Mark the method as never remoted.
    pub fn ignored(mut self) -> Self {
        self.access.ignored = true;
        self
    }

    pub fn access(&self) -> MethodAccess {
        self.access
    }
}

/// Per-type table of properties and methods.
pub struct Capabilities<T> {
    properties: HashMap<&'static str, Property<T>>,
    methods: HashMap<&'static str, Method<T>>,
}

impl<T> Default for Capabilities<T> {
    fn default() -> Self {
        Self {
            properties: HashMap::new(),
            methods: HashMap::new(),
        }
    }
}

impl<T> Capabilities<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A readable and writable property.
    pub fn property(mut self, name: &'static str, get: Getter<T>, set: Setter<T>) -> Self {
        self.properties.insert(
            name,
            Property {
                get,
                set: Some(set),
            },
        );
        self
    }

    /// A property without a setter.
    pub fn read_only(mut self, name: &'static str, get: Getter<T>) -> Self {
        self.properties.insert(name, Property { get, set: None });
        self
    }

    pub fn method(mut self, name: &'static str, method: Method<T>) -> Self {
        self.methods.insert(name, method);
        self
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn method_access(&self, name: &str) -> Option<MethodAccess> {
        self.methods.get(name).map(Method::access)
    }
}

/// A type whose values can be shared between nodes.
///
/// Implementors build their capability table once, usually in a
/// `static OnceLock`.
pub trait SharedType: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Tag identifying the type on the wire.
    const TYPE_TAG: &'static str;

    fn capabilities() -> &'static Capabilities<Self>;
}

/// Erased view of a shared object, as held by storage and handlers.
pub trait DistributedObject: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn type_tag(&self) -> &'static str;

    /// Attach the object to the node holding it under `key`. The first
    /// attachment wins.
    fn attach(&self, node: WeakNode, key: Id);

    /// Serialized form used in FetchResult entries.
    fn snapshot(&self) -> TetherResult<Vec<u8>>;

    fn get_direct(&self, property: &str) -> TetherResult<Value>;

    fn set_direct(&self, property: &str, value: Value) -> TetherResult<()>;

    fn method_access(&self, method: &str) -> Option<MethodAccess>;

    fn invoke_direct(
        self: Arc<Self>,
        method: &str,
        call: MethodCall,
    ) -> BoxFuture<'static, TetherResult<Value>>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct Attachment {
    node: WeakNode,
    key: Id,
}

/// A named value of a [`SharedType`].
pub struct SharedObject<T> {
    name: String,
    state: RwLock<T>,
    attachment: OnceLock<Attachment>,
}

impl<T: SharedType> SharedObject<T> {
    pub fn new(name: impl Into<String>, state: T) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: RwLock::new(state),
            attachment: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage key: the key the object was attached under, or the hash of
    /// the name before that.
    pub fn id(&self) -> Id {
        match self.attachment.get() {
            Some(attachment) => attachment.key,
            None => Id::new_hash(&self.name),
        }
    }

    /// The local state.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// The local state, for writing. Changes are not propagated.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// The node holding this object.
    pub fn node(&self) -> TetherResult<Node> {
        self.attachment
            .get()
            .and_then(|a| a.node.upgrade())
            .ok_or(TetherError::NotBound)
    }

    /// Read a property through the node's routing.
    pub async fn get(&self, property: &str) -> TetherResult<Value> {
        self.node()?.get_property(self.id(), property).await
    }

    /// [`get`](Self::get), deserialized.
    pub async fn get_as<V: DeserializeOwned>(&self, property: &str) -> TetherResult<V> {
        let value = self.get(property).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Write a property through the node's routing.
    pub async fn set(&self, property: &str, value: Value) -> TetherResult<()> {
        self.node()?.set_property(self.id(), property, value).await
    }

    /// Call a method through the node's routing.
    pub async fn invoke(&self, method: &str, call: MethodCall) -> TetherResult<Value> {
        self.node()?
            .invoke(self.id(), method, call.type_arguments, call.arguments)
            .await
    }
}

impl<T: SharedType> fmt::Debug for SharedObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedObject")
            .field("name", &self.name)
            .field("type", &T::TYPE_TAG)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a, T> {
    name: &'a str,
    state: &'a T,
}

#[derive(Deserialize)]
struct Snapshot<T> {
    name: String,
    state: T,
}

impl<T: SharedType> DistributedObject for SharedObject<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_tag(&self) -> &'static str {
        T::TYPE_TAG
    }

    fn attach(&self, node: WeakNode, key: Id) {
        let _ = self.attachment.set(Attachment { node, key });
    }

    fn snapshot(&self) -> TetherResult<Vec<u8>> {
        let state = self.read();
        Ok(serde_json::to_vec(&SnapshotRef {
            name: &self.name,
            state: &*state,
        })?)
    }

    fn get_direct(&self, property: &str) -> TetherResult<Value> {
        let entry = T::capabilities()
            .properties
            .get(property)
            .ok_or_else(|| TetherError::MissingProperty(format!("{}.{}", T::TYPE_TAG, property)))?;
        Ok((entry.get)(&*self.read()))
    }

    fn set_direct(&self, property: &str, value: Value) -> TetherResult<()> {
        let entry = T::capabilities()
            .properties
            .get(property)
            .ok_or_else(|| TetherError::MissingProperty(format!("{}.{}", T::TYPE_TAG, property)))?;
        let set = entry.set.ok_or_else(|| {
            TetherError::MemberAccess(format!("{}.{} is read-only", T::TYPE_TAG, property))
        })?;
        set(&mut *self.write(), value)
    }

    fn method_access(&self, method: &str) -> Option<MethodAccess> {
        T::capabilities().method_access(method)
    }

    fn invoke_direct(
        self: Arc<Self>,
        method: &str,
        call: MethodCall,
    ) -> BoxFuture<'static, TetherResult<Value>> {
        match T::capabilities().methods.get(method) {
            Some(entry) => (entry.call)(self, call),
            None => future::ready(Err(TetherError::MissingMethod(format!(
                "{}.{}",
                T::TYPE_TAG,
                method
            ))))
            .boxed(),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

type Materialise = fn(&[u8]) -> TetherResult<Arc<dyn DistributedObject>>;

fn materialise<T: SharedType>(bytes: &[u8]) -> TetherResult<Arc<dyn DistributedObject>> {
    let snapshot: Snapshot<T> = serde_json::from_slice(bytes)?;
    Ok(SharedObject::new(snapshot.name, snapshot.state))
}

/// Type tag → constructor map used to rebuild fetched objects.
#[derive(Default)]
pub struct TypeRegistry {
    constructors: RwLock<HashMap<&'static str, Materialise>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: SharedType>(&self) {
        let mut constructors = self.constructors.write().unwrap_or_else(|e| e.into_inner());
        constructors.insert(T::TYPE_TAG, materialise::<T> as Materialise);
    }

    pub fn is_registered(&self, type_tag: &str) -> bool {
        let constructors = self.constructors.read().unwrap_or_else(|e| e.into_inner());
        constructors.contains_key(type_tag)
    }

    /// Wire form of an optional object.
    pub fn encode(
        &self,
        value: Option<&Arc<dyn DistributedObject>>,
    ) -> TetherResult<ObjectWithType> {
        match value {
            Some(object) => Ok(ObjectWithType::tagged(object.type_tag(), object.snapshot()?)),
            None => Ok(ObjectWithType::null()),
        }
    }

    /// Rebuild an object from its wire form. The null value decodes to `None`.
    pub fn decode(
        &self,
        wire: &ObjectWithType,
    ) -> TetherResult<Option<Arc<dyn DistributedObject>>> {
        let (Some(tag), Some(data)) = (wire.type_tag.as_deref(), wire.data.as_deref()) else {
            return Ok(None);
        };
        let constructor = {
            let constructors = self.constructors.read().unwrap_or_else(|e| e.into_inner());
            constructors.get(tag).copied()
        };
        let constructor = constructor.ok_or_else(|| TetherError::UnknownType(tag.to_string()))?;
        constructor(data).map(Some)
    }
}
