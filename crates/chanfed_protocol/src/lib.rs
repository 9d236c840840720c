/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Object `type` as carried on the wire. Unknown strings (media types sent by
/// other implementations) round-trip through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ObjectType {
    #[default]
    Note,
    Archive,
    Tombstone,
    Preview,
    Attachment,
    Other(String),
}

impl ObjectType {
    pub fn as_str(&self) -> &str {
        match self {
            ObjectType::Note => "Note",
            ObjectType::Archive => "Archive",
            ObjectType::Tombstone => "Tombstone",
            ObjectType::Preview => "Preview",
            ObjectType::Attachment => "Attachment",
            ObjectType::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Note" => ObjectType::Note,
            "Archive" => ObjectType::Archive,
            "Tombstone" => ObjectType::Tombstone,
            "Preview" => ObjectType::Preview,
            "Attachment" => ObjectType::Attachment,
            other => ObjectType::Other(other.to_string()),
        }
    }

    /// Note or Archive: the types that show up in threads.
    pub fn is_post(&self) -> bool {
        matches!(self, ObjectType::Note | ObjectType::Archive)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ObjectType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ObjectType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ObjectType::parse(&s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityType {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Undo,
}

impl ActivityType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityType::Create => "Create",
            ActivityType::Update => "Update",
            ActivityType::Delete => "Delete",
            ActivityType::Follow => "Follow",
            ActivityType::Accept => "Accept",
            ActivityType::Reject => "Reject",
            ActivityType::Undo => "Undo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Create" => ActivityType::Create,
            "Update" => ActivityType::Update,
            "Delete" => ActivityType::Delete,
            "Follow" => ActivityType::Follow,
            "Accept" => ActivityType::Accept,
            "Reject" => ActivityType::Reject,
            "Undo" => ActivityType::Undo,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectBase {
    #[serde(
        rename = "type",
        default,
        deserialize_with = "empty_type_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub ty: Option<ObjectType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Post options such as `sage`. Never sent over the wire.
    #[serde(skip)]
    pub option: Vec<String>,
    #[serde(rename = "attributedTo", default, skip_serializing_if = "String::is_empty")]
    pub attributed_to: String,
    #[serde(rename = "tripcode", default, skip_serializing_if = "String::is_empty")]
    pub trip_code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub actor: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(rename = "inReplyTo", default, skip_serializing_if = "Vec::is_empty")]
    pub in_reply_to: Vec<ObjectBase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<Box<ObjectBase>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment: Vec<ObjectBase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies: Option<Box<CollectionBase>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub href: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(rename = "mediatype", default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sticky: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub locked: bool,
}

impl ObjectBase {
    /// An object that only carries its id, as used inside `inReplyTo`.
    pub fn reference(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// First non-empty `inReplyTo` id.
    pub fn reply_parent(&self) -> Option<&str> {
        self.in_reply_to
            .first()
            .map(|o| o.id.trim())
            .filter(|id| !id.is_empty())
    }

    pub fn has_option(&self, opt: &str) -> bool {
        self.option.iter().any(|o| o.eq_ignore_ascii_case(opt))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionBase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Box<Actor>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub ty: String,
    #[serde(rename = "totalItems", default, skip_serializing_if = "is_zero_usize")]
    pub total_items: usize,
    #[serde(rename = "totalImgs", default, skip_serializing_if = "is_zero_usize")]
    pub total_imgs: usize,
    #[serde(rename = "orderedItems", default, skip_serializing_if = "Vec::is_empty")]
    pub ordered_items: Vec<ObjectBase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ObjectBase>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(flatten)]
    pub base: CollectionBase,
}

impl Collection {
    pub fn new(base: CollectionBase) -> Self {
        Self {
            context: Some(serde_json::Value::String(AS_CONTEXT.to_string())),
            base,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicKeyPem {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    #[serde(rename = "publicKeyPem", default, skip_serializing_if = "String::is_empty")]
    pub public_key_pem: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inbox: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub outbox: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub following: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub followers: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "preferredUsername", default, skip_serializing_if = "String::is_empty")]
    pub preferred_username: String,
    #[serde(rename = "publicKey", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKeyPem>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default)]
    pub restricted: bool,
}

impl Actor {
    /// Actor document for a board hosted at `domain`, with the conventional
    /// collection URIs below its id.
    pub fn board(domain: &str, name: &str, summary: &str) -> Self {
        let id = format!("{}/{}", domain.trim_end_matches('/'), name);
        Self {
            ty: "Group".to_string(),
            inbox: format!("{id}/inbox"),
            outbox: format!("{id}/outbox"),
            following: format!("{id}/following"),
            followers: format!("{id}/followers"),
            name: name.to_string(),
            preferred_username: name.to_string(),
            summary: summary.to_string(),
            restricted: false,
            public_key: None,
            id,
        }
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.id)
    }
}

/// `actor` may be embedded or a bare id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActorRef {
    Id(String),
    Actor(Box<Actor>),
}

impl ActorRef {
    pub fn id(&self) -> &str {
        match self {
            ActorRef::Id(id) => id,
            ActorRef::Actor(a) => &a.id,
        }
    }
}

/// `object` may be embedded or a bare id (Follow targets an actor id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Id(String),
    Object(Box<ObjectBase>),
}

impl ObjectRef {
    pub fn id(&self) -> &str {
        match self {
            ObjectRef::Id(id) => id,
            ObjectRef::Object(o) => &o.id,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectBase> {
        match self {
            ObjectRef::Object(o) => Some(o),
            ObjectRef::Id(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorRef>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectRef>,
}

impl Activity {
    pub fn activity_type(&self) -> Option<ActivityType> {
        ActivityType::parse(&self.ty)
    }

    pub fn actor_id(&self) -> &str {
        self.actor.as_ref().map(ActorRef::id).unwrap_or("")
    }

    pub fn object(&self) -> Option<&ObjectBase> {
        self.object.as_ref().and_then(ObjectRef::as_object)
    }
}

fn empty_type_as_none<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ObjectType>, D::Error> {
    let s: Option<String> = Option::deserialize(d)?;
    Ok(s.filter(|s| !s.trim().is_empty()).map(|s| ObjectType::parse(&s)))
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

fn is_zero_usize(n: &usize) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_elided() {
        let obj = ObjectBase {
            ty: Some(ObjectType::Note),
            id: "https://example.com/b/ABCDEFGH".to_string(),
            content: "hello".to_string(),
            ..Default::default()
        };
        let v = serde_json::to_value(&obj).unwrap();
        let map = v.as_object().unwrap();
        assert_eq!(map.get("type").and_then(|t| t.as_str()), Some("Note"));
        assert!(!map.contains_key("name"));
        assert!(!map.contains_key("inReplyTo"));
        assert!(!map.contains_key("size"));
        assert!(!map.contains_key("sensitive"));
        assert!(!map.contains_key("preview"));
        assert!(map.values().all(|v| !v.is_null()));
    }

    #[test]
    fn unknown_type_is_kept_verbatim() {
        let obj: ObjectBase =
            serde_json::from_str(r#"{"type":"image/webp","id":"x","mediatype":"image/webp"}"#).unwrap();
        assert_eq!(obj.ty, Some(ObjectType::Other("image/webp".to_string())));
        let back = serde_json::to_value(&obj).unwrap();
        assert_eq!(back["type"], "image/webp");
    }

    #[test]
    fn activity_accepts_actor_as_id_or_object() {
        let a: Activity = serde_json::from_str(
            r#"{"type":"Delete","actor":"https://a.example/b","object":"https://a.example/b/X"}"#,
        )
        .unwrap();
        assert_eq!(a.actor_id(), "https://a.example/b");
        assert_eq!(a.object.as_ref().map(ObjectRef::id), Some("https://a.example/b/X"));
        assert_eq!(a.activity_type(), Some(ActivityType::Delete));

        let b: Activity = serde_json::from_str(
            r#"{"type":"Create","actor":{"id":"https://a.example/b","restricted":false},"object":{"type":"Note","id":"https://a.example/b/Y","inReplyTo":[{"id":"https://a.example/b/X"}]}}"#,
        )
        .unwrap();
        assert_eq!(b.actor_id(), "https://a.example/b");
        assert_eq!(b.object().and_then(ObjectBase::reply_parent), Some("https://a.example/b/X"));
    }
}
