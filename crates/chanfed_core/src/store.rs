/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::db::{ms_to_datetime, now_ms};
use anyhow::{Context, Result};
use chanfed_protocol::{ObjectBase, ObjectType};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, Rng};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Which table a row lives in. Local rows are authored here, cache rows mirror remote objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Local,
    Cache,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Local, Tier::Cache];

    pub fn table(self) -> &'static str {
        match self {
            Tier::Local => "activitystream",
            Tier::Cache => "cacheactivitystream",
        }
    }

    fn index(self) -> i64 {
        match self {
            Tier::Local => 0,
            Tier::Cache => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Note or Archive.
    Post {
        archived: bool,
        name: String,
        content: String,
        attributed_to: String,
        trip_code: String,
    },
    /// Attachment, Preview or any other media object.
    Media {
        ty: ObjectType,
        name: String,
        href: String,
        media_type: String,
        size: i64,
        attributed_to: String,
    },
    Tombstone {
        deleted: Option<DateTime<Utc>>,
        href: String,
        media_type: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub tier: Tier,
    pub id: String,
    pub actor: String,
    pub published: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
    pub attachment: Option<String>,
    pub preview: Option<String>,
    pub sensitive: bool,
    pub payload: Payload,
}

impl StoredObject {
    pub fn object_type(&self) -> ObjectType {
        match &self.payload {
            Payload::Post { archived: true, .. } => ObjectType::Archive,
            Payload::Post { archived: false, .. } => ObjectType::Note,
            Payload::Media { ty, .. } => ty.clone(),
            Payload::Tombstone { .. } => ObjectType::Tombstone,
        }
    }

    pub fn is_post(&self) -> bool {
        matches!(self.payload, Payload::Post { .. })
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.payload, Payload::Tombstone { .. })
    }

    pub fn href(&self) -> Option<&str> {
        match &self.payload {
            Payload::Media { href, .. } | Payload::Tombstone { href, .. } if !href.is_empty() => Some(href.as_str()),
            _ => None,
        }
    }

    /// Row for a wire object. A missing `published` means "now".
    pub fn from_wire(obj: &ObjectBase, tier: Tier) -> Self {
        let ty = obj.ty.clone().unwrap_or_default();
        let payload = match ty {
            ObjectType::Tombstone => Payload::Tombstone {
                deleted: obj.updated,
                href: obj.href.clone(),
                media_type: obj.media_type.clone(),
            },
            ObjectType::Note | ObjectType::Archive => Payload::Post {
                archived: ty == ObjectType::Archive,
                name: obj.name.clone(),
                content: obj.content.clone(),
                attributed_to: obj.attributed_to.clone(),
                trip_code: obj.trip_code.clone(),
            },
            ty => Payload::Media {
                ty,
                name: obj.name.clone(),
                href: obj.href.clone(),
                media_type: obj.media_type.clone(),
                size: obj.size,
                attributed_to: obj.attributed_to.clone(),
            },
        };
        let published = obj.published.unwrap_or_else(Utc::now);
        Self {
            tier,
            id: obj.id.clone(),
            actor: obj.actor.clone(),
            published,
            updated: obj.updated.or(Some(published)),
            attachment: obj.attachment.first().map(|a| a.id.clone()).filter(|id| !id.is_empty()),
            preview: obj.preview.as_ref().map(|p| p.id.clone()).filter(|id| !id.is_empty()),
            sensitive: obj.sensitive,
            payload,
        }
    }

    /// Wire shape with attachment/preview as bare references.
    pub fn to_wire(&self) -> ObjectBase {
        let mut obj = ObjectBase {
            ty: Some(self.object_type()),
            id: self.id.clone(),
            actor: self.actor.clone(),
            published: Some(self.published),
            updated: self.updated,
            attachment: self.attachment.iter().map(ObjectBase::reference).collect(),
            preview: self.preview.as_ref().map(|p| Box::new(ObjectBase::reference(p))),
            sensitive: self.sensitive,
            ..Default::default()
        };
        match &self.payload {
            Payload::Post { name, content, attributed_to, trip_code, .. } => {
                obj.name = name.clone();
                obj.content = content.clone();
                obj.attributed_to = attributed_to.clone();
                obj.trip_code = trip_code.clone();
            }
            Payload::Media { name, href, media_type, size, attributed_to, .. } => {
                obj.name = name.clone();
                obj.href = href.clone();
                obj.media_type = media_type.clone();
                obj.size = *size;
                obj.attributed_to = attributed_to.clone();
            }
            Payload::Tombstone { deleted, href, media_type } => {
                obj.href = href.clone();
                obj.media_type = media_type.clone();
                obj.updated = deleted.or(self.updated);
            }
        }
        obj
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub id: String,
    pub count: i64,
    pub reason: String,
}

pub(crate) const OBJECT_COLUMNS: &str = "id, type, name, content, attributedto, tripcode, actor, published_ms, updated_ms, deleted_ms, attachment, preview, href, mediatype, size, sensitive";

pub(crate) const POST_FILTER: &str = "type IN ('Note', 'Archive')";

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub(crate) fn tier_select(tier: Tier, filter: &str) -> String {
    format!(
        "SELECT {} AS tier, {OBJECT_COLUMNS} FROM {} WHERE {filter}",
        tier.index(),
        tier.table()
    )
}

/// Tier-transparent select: one row per id, the local copy wins.
pub(crate) fn union_select(filter: &str, tail: &str) -> String {
    format!(
        "SELECT MIN(tier) AS tier, {OBJECT_COLUMNS} FROM ({} UNION ALL {}) GROUP BY id {tail}",
        tier_select(Tier::Local, filter),
        tier_select(Tier::Cache, filter)
    )
}

pub(crate) fn map_row(row: &Row<'_>) -> rusqlite::Result<StoredObject> {
    let tier = if row.get::<_, i64>(0)? == 0 { Tier::Local } else { Tier::Cache };
    let ty = ObjectType::parse(&row.get::<_, String>(2)?);
    let name: String = row.get(3)?;
    let content: String = row.get(4)?;
    let attributed_to: String = row.get(5)?;
    let trip_code: String = row.get(6)?;
    let href: String = row.get(13)?;
    let media_type: String = row.get(14)?;
    let payload = match ty {
        ObjectType::Tombstone => Payload::Tombstone {
            deleted: row.get::<_, Option<i64>>(10)?.and_then(ms_to_datetime),
            href,
            media_type,
        },
        ObjectType::Note | ObjectType::Archive => Payload::Post {
            archived: ty == ObjectType::Archive,
            name,
            content,
            attributed_to,
            trip_code,
        },
        ty => Payload::Media {
            ty,
            name,
            href,
            media_type,
            size: row.get(15)?,
            attributed_to,
        },
    };
    Ok(StoredObject {
        tier,
        id: row.get(1)?,
        actor: row.get(7)?,
        published: ms_to_datetime(row.get(8)?).unwrap_or_default(),
        updated: row.get::<_, Option<i64>>(9)?.and_then(ms_to_datetime),
        attachment: Some(row.get::<_, String>(11)?).filter(|s| !s.is_empty()),
        preview: Some(row.get::<_, String>(12)?).filter(|s| !s.is_empty()),
        sensitive: row.get::<_, i64>(16)? != 0,
        payload,
    })
}

pub(crate) fn query_objects<P: rusqlite::Params>(conn: &Connection, sql: &str, p: P) -> Result<Vec<StoredObject>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(p, map_row)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// Object rows in both tiers, borrowed over a connection or an open transaction.
pub struct ObjectStore<'c> {
    conn: &'c Connection,
}

impl<'c> ObjectStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: &str) -> Result<Option<StoredObject>> {
        self.conn
            .query_row(&union_select("id = ?1", ""), params![id], map_row)
            .optional()
            .with_context(|| format!("get object {id}"))
    }

    pub fn get_in(&self, tier: Tier, id: &str) -> Result<Option<StoredObject>> {
        self.conn
            .query_row(&tier_select(tier, "id = ?1"), params![id], map_row)
            .optional()
            .with_context(|| format!("get {} object {id}", tier.table()))
    }

    pub fn get_local(&self, id: &str) -> Result<Option<StoredObject>> {
        self.get_in(Tier::Local, id)
    }

    pub fn get_cached(&self, id: &str) -> Result<Option<StoredObject>> {
        self.get_in(Tier::Cache, id)
    }

    /// Most recently updated post whose id starts with `prefix`.
    pub fn get_by_prefix(&self, prefix: &str) -> Result<Option<StoredObject>> {
        let sql = union_select(
            &format!("id LIKE ?1 ESCAPE '\\' AND {POST_FILTER}"),
            "ORDER BY COALESCE(updated_ms, published_ms) DESC LIMIT 1",
        );
        self.conn
            .query_row(&sql, params![like_prefix(prefix)], map_row)
            .optional()
            .with_context(|| format!("get object by prefix {prefix}"))
    }

    pub fn object_type(&self, id: &str) -> Result<Option<ObjectType>> {
        Ok(self.get(id)?.map(|o| o.object_type()))
    }

    pub fn is_local(&self, id: &str) -> Result<bool> {
        self.exists(Tier::Local, id)
    }

    pub fn is_cached(&self, id: &str) -> Result<bool> {
        self.exists(Tier::Cache, id)
    }

    fn exists(&self, tier: Tier, id: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(&format!("SELECT 1 FROM {} WHERE id = ?1", tier.table()), params![id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn insert_local(&self, obj: &StoredObject) -> Result<()> {
        self.insert_row(Tier::Local, "INSERT", obj)
            .with_context(|| format!("insert local object {}", obj.id))?;
        Ok(())
    }

    /// Write-if-absent. Returns whether a row was written.
    pub fn insert_cached(&self, obj: &StoredObject) -> Result<bool> {
        let n = self
            .insert_row(Tier::Cache, "INSERT OR IGNORE", obj)
            .with_context(|| format!("insert cached object {}", obj.id))?;
        Ok(n > 0)
    }

    fn insert_row(&self, tier: Tier, verb: &str, obj: &StoredObject) -> Result<usize> {
        let ty = obj.object_type();
        let (mut name, mut content, mut attributed_to, mut trip_code) = ("", "", "", "");
        let (mut href, mut media_type, mut size, mut deleted_ms) = ("", "", 0i64, None);
        match &obj.payload {
            Payload::Post { name: n, content: c, attributed_to: a, trip_code: t, .. } => {
                name = n.as_str();
                content = c.as_str();
                attributed_to = a.as_str();
                trip_code = t.as_str();
            }
            Payload::Media { name: n, href: h, media_type: m, size: s, attributed_to: a, .. } => {
                name = n.as_str();
                href = h.as_str();
                media_type = m.as_str();
                size = *s;
                attributed_to = a.as_str();
            }
            Payload::Tombstone { deleted, href: h, media_type: m } => {
                href = h.as_str();
                media_type = m.as_str();
                attributed_to = "deleted";
                deleted_ms = Some(deleted.map(|d| d.timestamp_millis()).unwrap_or_else(now_ms));
            }
        }
        let n = self.conn.execute(
            &format!(
                "{verb} INTO {}({OBJECT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                tier.table()
            ),
            params![
                obj.id,
                ty.as_str(),
                name,
                content,
                attributed_to,
                trip_code,
                obj.actor,
                obj.published.timestamp_millis(),
                obj.updated.map(|d| d.timestamp_millis()),
                deleted_ms,
                obj.attachment.as_deref().unwrap_or(""),
                obj.preview.as_deref().unwrap_or(""),
                href,
                media_type,
                size,
                obj.sensitive as i64,
            ],
        )?;
        Ok(n)
    }

    /// Never turns a Tombstone back into something else.
    pub fn set_type(&self, id: &str, ty: &ObjectType) -> Result<usize> {
        let mut n = 0;
        for tier in Tier::ALL {
            n += self
                .conn
                .execute(
                    &format!("UPDATE {} SET type = ?1 WHERE id = ?2 AND type != 'Tombstone'", tier.table()),
                    params![ty.as_str(), id],
                )
                .with_context(|| format!("set type of {id}"))?;
        }
        Ok(n)
    }

    pub fn set_preview_for_attachment(&self, attachment_id: &str, preview_id: &str) -> Result<usize> {
        let mut n = 0;
        for tier in Tier::ALL {
            n += self
                .conn
                .execute(
                    &format!("UPDATE {} SET preview = ?1 WHERE attachment = ?2", tier.table()),
                    params![preview_id, attachment_id],
                )
                .with_context(|| format!("set preview for attachment {attachment_id}"))?;
        }
        Ok(n)
    }

    pub fn set_sensitive(&self, id: &str, sensitive: bool) -> Result<usize> {
        let mut n = 0;
        for tier in Tier::ALL {
            n += self
                .conn
                .execute(
                    &format!("UPDATE {} SET sensitive = ?1 WHERE id = ?2", tier.table()),
                    params![sensitive as i64, id],
                )
                .with_context(|| format!("set sensitive on {id}"))?;
        }
        Ok(n)
    }

    pub fn touch_updated(&self, id: &str, at: DateTime<Utc>) -> Result<usize> {
        let mut n = 0;
        for tier in Tier::ALL {
            n += self
                .conn
                .execute(
                    &format!("UPDATE {} SET updated_ms = ?1 WHERE id = ?2", tier.table()),
                    params![at.timestamp_millis(), id],
                )
                .with_context(|| format!("touch updated on {id}"))?;
        }
        Ok(n)
    }

    /// `<actor>/<8 random chars>`, retried until no local row uses it.
    pub fn mint_id(&self, actor: &str) -> Result<String> {
        let actor = actor.trim_end_matches('/');
        loop {
            let suffix: String = (0..8)
                .map(|_| ID_CHARSET[OsRng.gen_range(0..ID_CHARSET.len())] as char)
                .collect();
            let id = format!("{actor}/{suffix}");
            if !self.is_local(&id)? {
                return Ok(id);
            }
        }
    }

    /// Attachment and preview rows linked from `id`, in whichever tier links them.
    pub fn linked_media(&self, id: &str) -> Result<Vec<StoredObject>> {
        let mut out = Vec::new();
        for tier in Tier::ALL {
            let t = tier.table();
            let filter = format!(
                "id IN (SELECT attachment FROM {t} WHERE id = ?1 UNION SELECT preview FROM {t} WHERE id = ?1)"
            );
            out.extend(query_objects(self.conn, &tier_select(tier, &filter), params![id])?);
        }
        Ok(out)
    }

    pub fn tombstone_linked_media(&self, id: &str, placeholder_href: &str, at_ms: i64) -> Result<usize> {
        let mut n = 0;
        for tier in Tier::ALL {
            let t = tier.table();
            n += self
                .conn
                .execute(
                    &format!(
                        "UPDATE {t} SET type = 'Tombstone', mediatype = 'image/png', href = ?1, name = '', content = '', attributedto = 'deleted', size = 0, deleted_ms = ?2 \
                         WHERE type != 'Tombstone' AND id IN (SELECT attachment FROM {t} WHERE id = ?3 UNION SELECT preview FROM {t} WHERE id = ?3)"
                    ),
                    params![placeholder_href, at_ms, id],
                )
                .with_context(|| format!("tombstone media of {id}"))?;
        }
        Ok(n)
    }

    pub fn tombstone_row(&self, id: &str, at_ms: i64) -> Result<usize> {
        let mut n = 0;
        for tier in Tier::ALL {
            n += self
                .conn
                .execute(
                    &format!(
                        "UPDATE {} SET type = 'Tombstone', name = '', content = '', attributedto = 'deleted', tripcode = '', deleted_ms = ?1 \
                         WHERE id = ?2 AND type != 'Tombstone'",
                        tier.table()
                    ),
                    params![at_ms, id],
                )
                .with_context(|| format!("tombstone {id}"))?;
        }
        Ok(n)
    }

    pub fn delete_linked_media(&self, id: &str) -> Result<usize> {
        let mut n = 0;
        for tier in Tier::ALL {
            let t = tier.table();
            n += self
                .conn
                .execute(
                    &format!(
                        "DELETE FROM {t} WHERE id IN (SELECT attachment FROM {t} WHERE id = ?1 UNION SELECT preview FROM {t} WHERE id = ?1)"
                    ),
                    params![id],
                )
                .with_context(|| format!("delete media of {id}"))?;
        }
        Ok(n)
    }

    pub fn delete_row(&self, id: &str) -> Result<usize> {
        let mut n = 0;
        for tier in Tier::ALL {
            n += self
                .conn
                .execute(&format!("DELETE FROM {} WHERE id = ?1", tier.table()), params![id])
                .with_context(|| format!("delete {id}"))?;
        }
        Ok(n)
    }

    pub fn report(&self, id: &str, reason: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO reported(id, count, reason) VALUES (?1, 1, ?2) \
                 ON CONFLICT(id) DO UPDATE SET count = count + 1, reason = excluded.reason",
                params![id, reason],
            )
            .with_context(|| format!("report {id}"))?;
        Ok(())
    }

    pub fn report_of(&self, id: &str) -> Result<Option<Report>> {
        self.conn
            .query_row(
                "SELECT id, count, reason FROM reported WHERE id = ?1",
                params![id],
                |r| Ok(Report { id: r.get(0)?, count: r.get(1)?, reason: r.get(2)? }),
            )
            .optional()
            .with_context(|| format!("load report {id}"))
    }

    pub fn delete_reports(&self, id: &str) -> Result<usize> {
        self.conn
            .execute("DELETE FROM reported WHERE id = ?1", params![id])
            .with_context(|| format!("delete reports of {id}"))
    }

    /// Emails of privileged accounts (type >= 1).
    pub fn notify_recipients(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT email FROM accounts WHERE type >= 1 AND email IS NOT NULL AND email != '' ORDER BY email")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}
