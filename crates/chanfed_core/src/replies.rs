/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::store::{query_objects, union_select, StoredObject, POST_FILTER};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Sticky,
    Locked,
}

impl Flag {
    fn table(self) -> &'static str {
        match self {
            Flag::Sticky => "sticky",
            Flag::Locked => "locked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagToggle {
    Set,
    Cleared,
    /// Target is not a unique thread root; nothing changed.
    NotRoot,
}

/// `(child, parent)` edges. Roots carry a single edge with an empty parent.
pub struct ReplyGraph<'c> {
    conn: &'c Connection,
}

impl<'c> ReplyGraph<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn record_edge(&self, id: &str, parent: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO replies(id, inreplyto) VALUES (?1, ?2)",
                params![id, parent],
            )
            .with_context(|| format!("record reply edge {id} -> {parent:?}"))?;
        Ok(n > 0)
    }

    pub fn parent_of(&self, id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT inreplyto FROM replies WHERE id = ?1 AND inreplyto != '' ORDER BY inreplyto LIMIT 1",
                params![id],
                |r| r.get(0),
            )
            .optional()
            .with_context(|| format!("parent of {id}"))
    }

    /// Follows parent edges upward. An id without a parent is its own root.
    pub fn root_of(&self, id: &str) -> Result<String> {
        let mut current = id.to_string();
        let mut seen = HashSet::new();
        seen.insert(current.clone());
        while let Some(parent) = self.parent_of(&current)? {
            if !seen.insert(parent.clone()) {
                break;
            }
            current = parent;
        }
        Ok(current)
    }

    pub fn is_op(&self, id: &str) -> Result<bool> {
        Ok(self.parent_of(id)?.is_none())
    }

    pub fn root_edge_count(&self, id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM replies WHERE id = ?1 AND inreplyto = ''",
                params![id],
                |r| r.get(0),
            )
            .with_context(|| format!("count root edges of {id}"))
    }

    /// Ids with an edge to `parent`, whatever their type.
    pub fn child_ids(&self, parent: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM replies WHERE inreplyto = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![parent], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Posts replying to `parent`, oldest first.
    pub fn children(&self, parent: &str) -> Result<Vec<StoredObject>> {
        let sql = union_select(
            &format!("id IN (SELECT id FROM replies WHERE inreplyto = ?1) AND {POST_FILTER}"),
            "ORDER BY published_ms ASC, id ASC",
        );
        query_objects(self.conn, &sql, params![parent]).with_context(|| format!("children of {parent}"))
    }

    /// The `n` newest replies, returned oldest first.
    pub fn children_recent(&self, parent: &str, n: usize) -> Result<Vec<StoredObject>> {
        let sql = union_select(
            &format!("id IN (SELECT id FROM replies WHERE inreplyto = ?1) AND {POST_FILTER}"),
            "ORDER BY published_ms DESC, id DESC LIMIT ?2",
        );
        let mut out = query_objects(self.conn, &sql, params![parent, n as i64])
            .with_context(|| format!("recent children of {parent}"))?;
        out.reverse();
        Ok(out)
    }

    /// Replies to the replies of `parent`, keyed by their direct parent, oldest first.
    pub fn grandchildren(&self, parent: &str) -> Result<HashMap<String, Vec<StoredObject>>> {
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT id, inreplyto FROM replies WHERE inreplyto IN (SELECT id FROM replies WHERE inreplyto = ?1)",
            )?;
            let rows = stmt.query_map(params![parent], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
            for r in rows {
                let (id, via) = r?;
                edges.entry(id).or_default().push(via);
            }
        }
        let sql = union_select(
            &format!(
                "id IN (SELECT id FROM replies WHERE inreplyto IN (SELECT id FROM replies WHERE inreplyto = ?1)) AND {POST_FILTER}"
            ),
            "ORDER BY published_ms ASC, id ASC",
        );
        let objects = query_objects(self.conn, &sql, params![parent])
            .with_context(|| format!("grandchildren of {parent}"))?;
        let mut out: HashMap<String, Vec<StoredObject>> = HashMap::new();
        for obj in objects {
            for via in edges.get(&obj.id).into_iter().flatten() {
                out.entry(via.clone()).or_default().push(obj.clone());
            }
        }
        Ok(out)
    }

    /// `(replies, replies with an attachment)` in one statement over both tiers.
    pub fn reply_counts(&self, parent: &str) -> Result<(usize, usize)> {
        let (total, imgs): (i64, i64) = self
            .conn
            .query_row(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(CASE WHEN attachment = '' THEN 0 ELSE 1 END), 0) FROM ( \
                       SELECT id, MAX(attachment) AS attachment FROM ( \
                         SELECT id, attachment FROM activitystream \
                           WHERE id IN (SELECT id FROM replies WHERE inreplyto = ?1) AND {POST_FILTER} \
                         UNION ALL \
                         SELECT id, attachment FROM cacheactivitystream \
                           WHERE id IN (SELECT id FROM replies WHERE inreplyto = ?1) AND {POST_FILTER} \
                       ) GROUP BY id \
                     )"
                ),
                params![parent],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .with_context(|| format!("count replies of {parent}"))?;
        Ok((total as usize, imgs as usize))
    }

    pub fn delete_edges_of(&self, id: &str) -> Result<usize> {
        self.conn
            .execute("DELETE FROM replies WHERE id = ?1", params![id])
            .with_context(|| format!("delete reply edges of {id}"))
    }

    pub fn delete_child_edges(&self, parent: &str) -> Result<usize> {
        self.conn
            .execute("DELETE FROM replies WHERE inreplyto = ?1 AND inreplyto != ''", params![parent])
            .with_context(|| format!("delete child edges of {parent}"))
    }

    /// Flips `flag` on `id`, only when `id` has exactly one root edge.
    pub fn toggle_flag(&self, flag: Flag, actor: &str, id: &str) -> Result<FlagToggle> {
        if self.root_edge_count(id)? != 1 {
            return Ok(FlagToggle::NotRoot);
        }
        let table = flag.table();
        if self.is_flag_set(flag, id)? {
            self.conn
                .execute(&format!("DELETE FROM {table} WHERE activity_id = ?1"), params![id])
                .with_context(|| format!("clear {table} on {id}"))?;
            Ok(FlagToggle::Cleared)
        } else {
            self.conn
                .execute(
                    &format!("INSERT INTO {table}(actor_id, activity_id) VALUES (?1, ?2)"),
                    params![actor, id],
                )
                .with_context(|| format!("set {table} on {id}"))?;
            Ok(FlagToggle::Set)
        }
    }

    pub fn is_flag_set(&self, flag: Flag, id: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE activity_id = ?1", flag.table()),
                params![id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn clear_flags(&self, id: &str) -> Result<()> {
        for flag in [Flag::Sticky, Flag::Locked] {
            self.conn
                .execute(&format!("DELETE FROM {} WHERE activity_id = ?1", flag.table()), params![id])
                .with_context(|| format!("clear flags on {id}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_db;
    use crate::store::tests::post;
    use crate::store::{ObjectStore, StoredObject, Tier};

    const OP: &str = "https://b.example/g/op";

    fn seed(tx: &Connection) -> Result<()> {
        let store = ObjectStore::new(tx);
        let graph = ReplyGraph::new(tx);
        store.insert_local(&post(OP, "https://b.example/g", 1_000))?;
        graph.record_edge(OP, "")?;
        for (i, ts) in [(1, 2_000), (2, 3_000), (3, 4_000)] {
            let id = format!("{OP}-r{i}");
            let mut p = post(&id, "https://b.example/g", ts);
            if i == 2 {
                p.attachment = Some(format!("{id}-att"));
            }
            store.insert_local(&p)?;
            graph.record_edge(&id, OP)?;
        }
        // Same reply mirrored in the cache tier must not be counted twice.
        let mut dup: StoredObject = post(&format!("{OP}-r1"), "https://b.example/g", 2_000);
        dup.tier = Tier::Cache;
        store.insert_cached(&dup)?;
        store.insert_local(&post("https://b.example/g/nested", "https://b.example/g", 5_000))?;
        graph.record_edge("https://b.example/g/nested", &format!("{OP}-r2"))?;
        Ok(())
    }

    #[test]
    fn children_and_counts_agree() {
        let (_dir, db) = temp_db();
        db.write(|tx| {
            seed(tx)?;
            let graph = ReplyGraph::new(tx);
            let kids = graph.children(OP)?;
            let ids: Vec<_> = kids.iter().map(|o| o.id.as_str()).collect();
            assert_eq!(ids, vec![format!("{OP}-r1"), format!("{OP}-r2"), format!("{OP}-r3")]);
            assert_eq!(graph.reply_counts(OP)?, (3, 1));

            let recent = graph.children_recent(OP, 2)?;
            let ids: Vec<_> = recent.iter().map(|o| o.id.clone()).collect();
            assert_eq!(ids, vec![format!("{OP}-r2"), format!("{OP}-r3")]);

            let grand = graph.grandchildren(OP)?;
            assert_eq!(grand.len(), 1);
            assert_eq!(grand[&format!("{OP}-r2")][0].id, "https://b.example/g/nested");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn root_resolution_and_op_status() {
        let (_dir, db) = temp_db();
        db.write(|tx| {
            seed(tx)?;
            let graph = ReplyGraph::new(tx);
            assert_eq!(graph.root_of("https://b.example/g/nested")?, OP);
            assert_eq!(graph.root_of(OP)?, OP);
            assert!(graph.is_op(OP)?);
            assert!(!graph.is_op("https://b.example/g/nested")?);
            assert!(graph.is_op("https://b.example/g/unknown")?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn flags_toggle_only_on_roots() {
        let (_dir, db) = temp_db();
        db.write(|tx| {
            seed(tx)?;
            let graph = ReplyGraph::new(tx);
            assert_eq!(graph.toggle_flag(Flag::Sticky, "https://b.example/g", OP)?, FlagToggle::Set);
            assert!(graph.is_flag_set(Flag::Sticky, OP)?);
            assert!(!graph.is_flag_set(Flag::Locked, OP)?);
            assert_eq!(graph.toggle_flag(Flag::Sticky, "https://b.example/g", OP)?, FlagToggle::Cleared);
            assert!(!graph.is_flag_set(Flag::Sticky, OP)?);

            let reply = format!("{OP}-r1");
            assert_eq!(graph.toggle_flag(Flag::Locked, "https://b.example/g", &reply)?, FlagToggle::NotRoot);
            assert!(!graph.is_flag_set(Flag::Locked, &reply)?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn edges_are_idempotent() {
        let (_dir, db) = temp_db();
        db.write(|tx| {
            let graph = ReplyGraph::new(tx);
            assert!(graph.record_edge("a", "b")?);
            assert!(!graph.record_edge("a", "b")?);
            assert_eq!(graph.child_ids("b")?, vec!["a".to_string()]);
            assert_eq!(graph.delete_child_edges("b")?, 1);
            assert!(graph.child_ids("b")?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
