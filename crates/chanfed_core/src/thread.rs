/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::replies::{Flag, ReplyGraph};
use crate::store::{ObjectStore, StoredObject};
use anyhow::Result;
use chanfed_protocol::{Actor, Collection, CollectionBase, ObjectBase};
use rusqlite::Connection;

const ORDERED: &str = "OrderedCollection";

/// Builds wire collections for a thread: the post, its replies, one level of nested
/// replies, expanded attachments/previews, counts and flags.
pub struct ThreadReader<'c> {
    store: ObjectStore<'c>,
    graph: ReplyGraph<'c>,
}

impl<'c> ThreadReader<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            store: ObjectStore::new(conn),
            graph: ReplyGraph::new(conn),
        }
    }

    pub fn thread(&self, id: &str) -> Result<Option<Collection>> {
        match self.store.get(id)?.filter(StoredObject::is_post) {
            Some(obj) => Ok(Some(self.assemble(&obj, None)?)),
            None => Ok(None),
        }
    }

    /// Path lookup: the most recently updated post under `prefix`.
    pub fn thread_by_prefix(&self, prefix: &str) -> Result<Option<Collection>> {
        match self.store.get_by_prefix(prefix)? {
            Some(obj) => Ok(Some(self.assemble(&obj, None)?)),
            None => Ok(None),
        }
    }

    /// Like [`thread`](Self::thread) but only the `n` newest replies.
    pub fn thread_recent(&self, id: &str, n: usize) -> Result<Option<Collection>> {
        match self.store.get(id)?.filter(StoredObject::is_post) {
            Some(obj) => Ok(Some(self.assemble(&obj, Some(n))?)),
            None => Ok(None),
        }
    }

    /// Wire object with its attachment and preview rows inlined.
    pub fn expand(&self, obj: &StoredObject) -> Result<ObjectBase> {
        let mut wire = obj.to_wire();
        if let Some(att) = obj.attachment.as_deref() {
            wire.attachment = self.store.get(att)?.map(|a| a.to_wire()).into_iter().collect();
        }
        if let Some(preview) = obj.preview.as_deref() {
            wire.preview = self.store.get(preview)?.map(|p| Box::new(p.to_wire()));
        }
        Ok(wire)
    }

    fn assemble(&self, obj: &StoredObject, limit: Option<usize>) -> Result<Collection> {
        let mut head = self.expand(obj)?;
        head.sticky = self.graph.is_flag_set(Flag::Sticky, &obj.id)?;
        head.locked = self.graph.is_flag_set(Flag::Locked, &obj.id)?;
        if let Some(parent) = self.graph.parent_of(&obj.id)? {
            head.in_reply_to = vec![ObjectBase::reference(parent)];
        }

        let children = match limit {
            Some(n) => self.graph.children_recent(&obj.id, n)?,
            None => self.graph.children(&obj.id)?,
        };
        let mut nested = self.graph.grandchildren(&obj.id)?;
        let mut items = Vec::with_capacity(children.len());
        for child in &children {
            let mut wire = self.expand(child)?;
            wire.in_reply_to = vec![ObjectBase::reference(obj.id.clone())];
            let (total, imgs) = self.graph.reply_counts(&child.id)?;
            let mut ordered = Vec::new();
            for grand in nested.remove(&child.id).unwrap_or_default() {
                let mut w = self.expand(&grand)?;
                w.in_reply_to = vec![ObjectBase::reference(child.id.clone())];
                ordered.push(w);
            }
            if total > 0 {
                wire.replies = Some(Box::new(CollectionBase {
                    ty: ORDERED.to_string(),
                    total_items: total,
                    total_imgs: imgs,
                    ordered_items: ordered,
                    ..Default::default()
                }));
            }
            items.push(wire);
        }

        let (total, imgs) = self.graph.reply_counts(&obj.id)?;
        head.replies = Some(Box::new(CollectionBase {
            ty: ORDERED.to_string(),
            total_items: total,
            total_imgs: imgs,
            ordered_items: items,
            ..Default::default()
        }));

        Ok(Collection::new(CollectionBase {
            actor: Some(Box::new(Actor {
                id: obj.actor.clone(),
                ..Default::default()
            })),
            ty: ORDERED.to_string(),
            total_items: 1,
            ordered_items: vec![head],
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_db;
    use crate::store::tests::post;
    use crate::store::{Payload, Tier};
    use chanfed_protocol::ObjectType;

    const OP: &str = "https://b.example/g/op";

    #[test]
    fn thread_collection_nests_replies_and_media() {
        let (_dir, db) = temp_db();
        db.write(|tx| {
            let store = ObjectStore::new(tx);
            let graph = ReplyGraph::new(tx);
            store.insert_local(&post(OP, "https://b.example/g", 1_000))?;
            graph.record_edge(OP, "")?;

            let mut reply = post("https://b.example/g/r1", "https://b.example/g", 2_000);
            reply.attachment = Some("https://b.example/g/att".into());
            store.insert_local(&reply)?;
            store.insert_local(&StoredObject {
                tier: Tier::Local,
                id: "https://b.example/g/att".into(),
                actor: "https://b.example/g".into(),
                published: reply.published,
                updated: reply.updated,
                attachment: None,
                preview: None,
                sensitive: false,
                payload: Payload::Media {
                    ty: ObjectType::Attachment,
                    name: "cat.png".into(),
                    href: "https://b.example/public/cat.png".into(),
                    media_type: "image/png".into(),
                    size: 12,
                    attributed_to: "https://b.example/g/r1".into(),
                },
            })?;
            graph.record_edge("https://b.example/g/r1", OP)?;
            store.insert_local(&post("https://b.example/g/r2", "https://b.example/g", 3_000))?;
            graph.record_edge("https://b.example/g/r2", "https://b.example/g/r1")?;
            graph.toggle_flag(Flag::Sticky, "https://b.example/g", OP)?;

            let coll = ThreadReader::new(tx).thread(OP)?.unwrap();
            let head = &coll.base.ordered_items[0];
            assert!(head.sticky);
            assert!(!head.locked);
            let replies = head.replies.as_ref().unwrap();
            assert_eq!((replies.total_items, replies.total_imgs), (1, 1));
            let r1 = &replies.ordered_items[0];
            assert_eq!(r1.attachment[0].href, "https://b.example/public/cat.png");
            assert_eq!(r1.in_reply_to[0].id, OP);
            let nested = r1.replies.as_ref().unwrap();
            assert_eq!(nested.total_items, 1);
            assert_eq!(nested.ordered_items[0].id, "https://b.example/g/r2");

            assert!(ThreadReader::new(tx).thread("https://b.example/g/att")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn recent_view_and_prefix_lookup() {
        let (_dir, db) = temp_db();
        db.write(|tx| {
            let store = ObjectStore::new(tx);
            let graph = ReplyGraph::new(tx);
            store.insert_local(&post(OP, "https://b.example/g", 1_000))?;
            graph.record_edge(OP, "")?;
            for (i, ts) in [(1, 2_000), (2, 3_000), (3, 4_000)] {
                let id = format!("{OP}/r{i}");
                store.insert_local(&post(&id, "https://b.example/g", ts))?;
                graph.record_edge(&id, OP)?;
            }

            let coll = ThreadReader::new(tx).thread_recent(OP, 2)?.unwrap();
            let replies = coll.base.ordered_items[0].replies.as_ref().unwrap();
            let ids: Vec<_> = replies.ordered_items.iter().map(|o| o.id.as_str()).collect();
            assert_eq!(ids, vec!["https://b.example/g/op/r2", "https://b.example/g/op/r3"]);
            assert_eq!(replies.total_items, 3);

            let found = ThreadReader::new(tx).thread_by_prefix("https://b.example/g/op/r")?.unwrap();
            assert_eq!(found.base.ordered_items[0].id, "https://b.example/g/op/r3");
            assert_eq!(found.base.ordered_items[0].in_reply_to[0].id, OP);
            assert!(ThreadReader::new(tx).thread_by_prefix("https://b.example/zzz")?.is_none());
            Ok(())
        })
        .unwrap();
    }
}
