//! User lifecycle events and their JSON envelope.
//!
//! Every message on the channel is `{"type": "<name>", "data": {...}}`. Decoding reads the
//! discriminator first and only then the payload, so an unknown type never fails to decode.

pub mod bus;
pub mod consumer;
pub mod redis_streams;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const USER_CREATED: &str = "UserCreated";
pub const USER_UPDATED: &str = "UserUpdated";
pub const USER_DELETED: &str = "UserDeleted";

/// Published upstream by the identity provider when an account is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreated {
    pub user_id: Uuid,
    pub email: String,
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(default)]
    pub lastname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdated {
    pub user_id: Uuid,
    /// Avatar URL after the update.
    #[serde(rename = "file_url", default)]
    pub new_avatar_url: String,
    #[serde(rename = "old_url", default)]
    pub old_avatar_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeleted {
    pub user_id: Uuid,
    #[serde(rename = "image_url", default)]
    pub avatar_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    Created(UserCreated),
    Updated(UserUpdated),
    Deleted(UserDeleted),
    Unknown {
        event_type: String,
        data: serde_json::Value,
    },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("malformed {event_type} payload: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    event_type: &'a str,
    data: &'a T,
}

impl UserEvent {
    pub fn event_type(&self) -> &str {
        match self {
            UserEvent::Created(_) => USER_CREATED,
            UserEvent::Updated(_) => USER_UPDATED,
            UserEvent::Deleted(_) => USER_DELETED,
            UserEvent::Unknown { event_type, .. } => event_type,
        }
    }

    /// Partitioning key: all events of one user travel through one partition.
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            UserEvent::Created(e) => Some(e.user_id),
            UserEvent::Updated(e) => Some(e.user_id),
            UserEvent::Deleted(e) => Some(e.user_id),
            UserEvent::Unknown { .. } => None,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        fn wrap<T: Serialize>(event_type: &str, data: &T) -> serde_json::Result<Vec<u8>> {
            serde_json::to_vec(&Envelope { event_type, data })
        }
        match self {
            UserEvent::Created(e) => wrap(USER_CREATED, e),
            UserEvent::Updated(e) => wrap(USER_UPDATED, e),
            UserEvent::Deleted(e) => wrap(USER_DELETED, e),
            UserEvent::Unknown { event_type, data } => wrap(event_type, data),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(DecodeError::Envelope)?;
        let payload_err = |source| DecodeError::Payload {
            event_type: raw.event_type.clone(),
            source,
        };
        let event = match raw.event_type.as_str() {
            USER_CREATED => {
                UserEvent::Created(serde_json::from_value(raw.data.clone()).map_err(payload_err)?)
            }
            USER_UPDATED => {
                UserEvent::Updated(serde_json::from_value(raw.data.clone()).map_err(payload_err)?)
            }
            USER_DELETED => {
                UserEvent::Deleted(serde_json::from_value(raw.data.clone()).map_err(payload_err)?)
            }
            _ => UserEvent::Unknown {
                event_type: raw.event_type.clone(),
                data: raw.data.clone(),
            },
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_wire_shapes() {
        let id = Uuid::new_v4();
        let created = json!({
            "type": "UserCreated",
            "data": {"user_id": id, "email": "a@b.com", "firstname": "Jane", "lastname": null}
        });
        let ev = UserEvent::decode(created.to_string().as_bytes()).unwrap();
        assert_eq!(
            ev,
            UserEvent::Created(UserCreated {
                user_id: id,
                email: "a@b.com".into(),
                firstname: Some("Jane".into()),
                lastname: None,
            })
        );

        let updated = json!({
            "type": "UserUpdated",
            "data": {"user_id": id, "file_url": "new.jpg", "old_url": "old.jpg"}
        });
        match UserEvent::decode(updated.to_string().as_bytes()).unwrap() {
            UserEvent::Updated(u) => {
                assert_eq!(u.new_avatar_url, "new.jpg");
                assert_eq!(u.old_avatar_url, "old.jpg");
            }
            other => panic!("unexpected {other:?}"),
        }

        let deleted = json!({"type": "UserDeleted", "data": {"user_id": id, "image_url": "a.jpg"}});
        assert_eq!(
            UserEvent::decode(deleted.to_string().as_bytes()).unwrap().user_id(),
            Some(id)
        );
    }

    #[test]
    fn encode_uses_envelope() {
        let ev = UserEvent::Deleted(UserDeleted {
            user_id: Uuid::nil(),
            avatar_url: "x.png".into(),
        });
        let value: serde_json::Value = serde_json::from_slice(&ev.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "UserDeleted");
        assert_eq!(value["data"]["image_url"], "x.png");
        assert_eq!(UserEvent::decode(&ev.encode().unwrap()).unwrap(), ev);
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let ev = UserEvent::decode(br#"{"type":"PasswordChanged","data":{"user_id":1}}"#).unwrap();
        assert_eq!(ev.event_type(), "PasswordChanged");
        assert_eq!(ev.user_id(), None);
    }

    #[test]
    fn malformed_input_is_classified() {
        assert!(matches!(
            UserEvent::decode(b"not json"),
            Err(DecodeError::Envelope(_))
        ));
        assert!(matches!(
            UserEvent::decode(br#"{"data":{}}"#),
            Err(DecodeError::Envelope(_))
        ));
        let err = UserEvent::decode(br#"{"type":"UserDeleted","data":{"user_id":"nope"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("UserDeleted"));
    }
}
