//! Wire protocol message types.
//!
//! Every operation travels in the same [`Message`] envelope: a correlation
//! id, an integer type tag and a sparse set of optional payload fields. The
//! envelope is serialized as JSON and framed by `tether-wire`.

use crate::contact::Contact;
use crate::error::{TetherError, TetherResult};
use crate::id::Id;
use serde::{Deserialize, Serialize};

/// Dynamically typed value used for property values, arguments and results.
pub type Value = serde_json::Value;

/// Type tag used by [`ObjectWithType`] for plain values.
pub const JSON_TYPE_TAG: &str = "json";

/// Protocol message types. The numeric values are fixed by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    Fetch = 1,
    FetchResult = 2,
    GetProperty = 6,
    GetPropertyResult = 7,
    SetProperty = 8,
    Invoke = 9,
    InvokeResult = 10,
    ConnectionPing = 11,
    ConnectionPong = 12,
    SetPropertyConfirmation = 13,
}

impl MessageType {
    /// The numeric tag carried on the wire.
    pub fn tag(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for MessageType {
    type Error = TetherError;

    fn try_from(tag: i32) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => MessageType::Fetch,
            2 => MessageType::FetchResult,
            6 => MessageType::GetProperty,
            7 => MessageType::GetPropertyResult,
            8 => MessageType::SetProperty,
            9 => MessageType::Invoke,
            10 => MessageType::InvokeResult,
            11 => MessageType::ConnectionPing,
            12 => MessageType::ConnectionPong,
            13 => MessageType::SetPropertyConfirmation,
            other => return Err(TetherError::UnknownMessageType(other)),
        })
    }
}

/// A value in wire form: a type tag plus serialized bytes.
///
/// Null is encoded as no tag and no bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectWithType {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_bytes")]
    pub data: Option<Vec<u8>>,
}

impl ObjectWithType {
    /// The null value.
    pub fn null() -> Self {
        Self::default()
    }

    /// Whether this is the null value.
    pub fn is_null(&self) -> bool {
        self.type_tag.is_none() && self.data.is_none()
    }

    /// Wrap already-serialized bytes under a type tag.
    pub fn tagged(type_tag: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            type_tag: Some(type_tag.into()),
            data: Some(data),
        }
    }

    /// Encode a plain value. JSON null becomes the wire null.
    pub fn from_value(value: &Value) -> TetherResult<Self> {
        if value.is_null() {
            return Ok(Self::null());
        }
        Ok(Self::tagged(JSON_TYPE_TAG, serde_json::to_vec(value)?))
    }

    /// Decode a plain value.
    pub fn to_value(&self) -> TetherResult<Value> {
        match (self.type_tag.as_deref(), self.data.as_deref()) {
            (None, _) | (_, None) => Ok(Value::Null),
            (Some(JSON_TYPE_TAG), Some(data)) => Ok(serde_json::from_slice(data)?),
            (Some(other), Some(_)) => Err(TetherError::UnknownType(other.to_string())),
        }
    }
}

/// Wire form of a stored entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEntry {
    pub key: Id,
    pub owner: Contact,
    pub value: ObjectWithType,
}

/// The protocol envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id. Must be present before the message is serialized.
    #[serde(default)]
    pub id: Option<Id>,
    /// Numeric [`MessageType`] tag.
    #[serde(rename = "type")]
    pub message_type: i32,
    /// Endpoint the message arrived from. Stamped on receipt, never transmitted.
    #[serde(skip)]
    pub sender: Option<Contact>,
    /// Set when the message was produced inside another connection's receive loop.
    #[serde(default)]
    pub nested: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_key: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_result: Option<Vec<SerializedEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_value: Option<ObjectWithType>,
    /// SetProperty only: the sender waits for a SetPropertyConfirmation.
    #[serde(default)]
    pub wants_confirmation: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_arguments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<ObjectWithType>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ObjectWithType>,
    /// Error raised while executing the request on the remote side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// ConnectionPing only: the port the sender accepts connections on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
}

impl Message {
    /// A fresh message of the given type with a random correlation id.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            id: Some(Id::new_random()),
            message_type: message_type.tag(),
            ..Default::default()
        }
    }

    /// A reply of the given type carrying the request's correlation id.
    pub fn reply_to(request: &Message, message_type: MessageType) -> Self {
        Self {
            id: request.id,
            message_type: message_type.tag(),
            ..Default::default()
        }
    }

    pub fn fetch(key: Id) -> Self {
        Self {
            fetch_key: Some(key),
            ..Self::new(MessageType::Fetch)
        }
    }

    /// Carry the correlation id of `request`.
    pub fn answering(mut self, request: &Message) -> Self {
        self.id = request.id;
        self
    }

    pub fn fetch_result(key: Id, entries: Vec<SerializedEntry>) -> Self {
        Self {
            fetch_key: Some(key),
            fetch_result: Some(entries),
            ..Self::new(MessageType::FetchResult)
        }
    }

    pub fn get_property(object_id: Id, property: &str) -> Self {
        Self {
            object_id: Some(object_id),
            property_name: Some(property.to_string()),
            ..Self::new(MessageType::GetProperty)
        }
    }

    pub fn set_property(
        object_id: Id,
        property: &str,
        value: ObjectWithType,
        wants_confirmation: bool,
    ) -> Self {
        Self {
            object_id: Some(object_id),
            property_name: Some(property.to_string()),
            property_value: Some(value),
            wants_confirmation,
            ..Self::new(MessageType::SetProperty)
        }
    }

    pub fn invoke(
        object_id: Id,
        method: &str,
        type_arguments: Vec<String>,
        arguments: Vec<ObjectWithType>,
    ) -> Self {
        Self {
            object_id: Some(object_id),
            method_name: Some(method.to_string()),
            type_arguments: Some(type_arguments),
            arguments: Some(arguments),
            ..Self::new(MessageType::Invoke)
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::ConnectionPing)
    }

    /// A ping advertising the port the sender listens on.
    pub fn ping_from(listen_port: u16) -> Self {
        Self {
            listen_port: Some(listen_port),
            ..Self::ping()
        }
    }

    /// The parsed type tag.
    pub fn kind(&self) -> TetherResult<MessageType> {
        MessageType::try_from(self.message_type)
    }

    /// Whether this message has the given type.
    pub fn is(&self, message_type: MessageType) -> bool {
        self.message_type == message_type.tag()
    }

    /// Whether this is a reply of `message_type` to the request with `id`.
    pub fn is_reply(&self, message_type: MessageType, id: Option<Id>) -> bool {
        self.is(message_type) && id.is_some() && self.id == id
    }

    /// The correlation id, or an error if none was set.
    pub fn require_id(&self) -> TetherResult<Id> {
        self.id.ok_or(TetherError::MissingCorrelationId)
    }
}

/// Serde helper: optional byte buffers as hex strings.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&hex::encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
