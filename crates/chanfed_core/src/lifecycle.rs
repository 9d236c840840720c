/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Create / cache / update / tombstone / delete cascades.
//!
//! Every operation is one SQLite transaction. Backing files of attachments and
//! previews are collected while the transaction runs and removed only after it
//! commits, so a rolled back cascade never loses a file.

use crate::context::Context;
use crate::db::now_ms;
use crate::replies::{Flag, FlagToggle, ReplyGraph};
use crate::store::{ObjectStore, StoredObject, Tier};
use crate::tripcode::name_and_tripcode;
use anyhow::{anyhow, Result};
use chanfed_protocol::{ObjectBase, ObjectType};
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Rows changed across both tiers, media rows included.
    pub rows: usize,
    pub files_removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Number of posts newly mirrored, nested replies included.
    Written(usize),
    AlreadyCached,
    Blocked,
}

#[derive(Clone)]
pub struct Lifecycle {
    ctx: Context,
}

impl Lifecycle {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Persists a new local post with its attachment and preview, and links it into its thread.
    pub fn create(&self, mut obj: ObjectBase) -> Result<ObjectBase> {
        if obj.actor.trim().is_empty() {
            return Err(anyhow!("create: object has no actor"));
        }
        if obj.attachment.len() > 1 {
            return Err(anyhow!("create: at most one attachment per post, got {}", obj.attachment.len()));
        }
        let ty = obj.ty.get_or_insert(ObjectType::Note);
        if !ty.is_post() {
            return Err(anyhow!("create: {ty} is not a post type"));
        }
        if obj.trip_code.is_empty() {
            let split = name_and_tripcode(&obj.name, self.ctx.cfg.tripcode_salt.as_deref())?;
            obj.name = split.name;
            obj.trip_code = split.trip;
        }
        let now = Utc::now();
        let published = *obj.published.get_or_insert(now);
        obj.updated = Some(published);
        if obj.attachment.is_empty() || obj.preview.as_ref().is_some_and(|p| p.href.is_empty()) {
            obj.preview = None;
        }

        let obj = self.ctx.db.write(|tx| {
            let store = ObjectStore::new(tx);
            let graph = ReplyGraph::new(tx);
            obj.id = store.mint_id(&obj.actor)?;
            if let Some(att) = obj.attachment.first_mut() {
                if let Some(preview) = obj.preview.as_deref_mut() {
                    persist_media(&store, preview, ObjectType::Preview, &obj.id, &obj.actor, now)?;
                }
                persist_media(&store, att, ObjectType::Attachment, &obj.id, &obj.actor, now)?;
            }
            store.insert_local(&StoredObject::from_wire(&obj, Tier::Local))?;
            if link_into_thread(&store, &graph, &obj, published)? {
                obj.ty = Some(ObjectType::Archive);
            }
            Ok(obj)
        })?;
        info!(id = %obj.id, "post created");
        Ok(obj)
    }

    /// Mirrors a remote object, its media and any nested replies into the cache tier.
    pub fn cache(&self, obj: &ObjectBase) -> Result<CacheOutcome> {
        if self.ctx.is_blocked(&obj.content) {
            warn!(id = %obj.id, "cache write blocked by content filter");
            return Ok(CacheOutcome::Blocked);
        }
        let written = self.ctx.db.write(|tx| {
            let store = ObjectStore::new(tx);
            let graph = ReplyGraph::new(tx);
            let mut queue = VecDeque::from([obj.clone()]);
            let mut seen = HashSet::new();
            let mut written = 0usize;
            while let Some(mut o) = queue.pop_front() {
                if o.id.trim().is_empty() || !seen.insert(o.id.clone()) {
                    continue;
                }
                if self.ctx.is_blocked(&o.content) {
                    warn!(id = %o.id, "nested cache write blocked by content filter");
                    continue;
                }
                let nested = o.replies.take();
                if write_cached(&store, &o)? {
                    written += 1;
                    let published = o.published.unwrap_or_else(Utc::now);
                    link_into_thread(&store, &graph, &o, published)?;
                } else {
                    debug!(id = %o.id, "already cached");
                }
                for mut reply in nested.map(|c| c.ordered_items).unwrap_or_default() {
                    if reply.in_reply_to.is_empty() {
                        reply.in_reply_to = vec![ObjectBase::reference(o.id.clone())];
                    }
                    queue.push_back(reply);
                }
            }
            Ok(written)
        })?;
        if written == 0 {
            return Ok(CacheOutcome::AlreadyCached);
        }
        info!(id = %obj.id, written, "cached remote object");
        Ok(CacheOutcome::Written(written))
    }

    pub fn update(&self, id: &str, at: Option<DateTime<Utc>>) -> Result<usize> {
        let at = at.unwrap_or_else(Utc::now);
        self.ctx.db.write(|tx| ObjectStore::new(tx).touch_updated(id, at))
    }

    pub fn tombstone(&self, id: &str) -> Result<CascadeReport> {
        let (rows, files) = self.ctx.db.write(|tx| {
            let store = ObjectStore::new(tx);
            let mut files = Vec::new();
            let rows = self.tombstone_one(&store, id, now_ms(), &mut files)?;
            Ok((rows, files))
        })?;
        let report = CascadeReport { rows, files_removed: remove_files(&files) };
        info!(%id, rows = report.rows, files = report.files_removed, "tombstoned");
        Ok(report)
    }

    /// Tombstones `id` and everything below it, children before parents.
    pub fn tombstone_thread(&self, id: &str) -> Result<CascadeReport> {
        let (rows, files) = self.ctx.db.write(|tx| {
            let store = ObjectStore::new(tx);
            let graph = ReplyGraph::new(tx);
            let at = now_ms();
            let mut files = Vec::new();
            let mut rows = 0;
            for target in subtree(&graph, id)?.iter().rev() {
                rows += self.tombstone_one(&store, target, at, &mut files)?;
            }
            Ok((rows, files))
        })?;
        let report = CascadeReport { rows, files_removed: remove_files(&files) };
        info!(%id, rows = report.rows, files = report.files_removed, "tombstoned thread");
        Ok(report)
    }

    /// Hard delete of one object. Replies keep their edge to the removed id.
    pub fn delete(&self, id: &str) -> Result<CascadeReport> {
        let (rows, files) = self.ctx.db.write(|tx| {
            let store = ObjectStore::new(tx);
            let graph = ReplyGraph::new(tx);
            let mut files = Vec::new();
            let rows = self.delete_one(&store, &graph, id, &mut files)?;
            Ok((rows, files))
        })?;
        let report = CascadeReport { rows, files_removed: remove_files(&files) };
        info!(%id, rows = report.rows, files = report.files_removed, "deleted");
        Ok(report)
    }

    pub fn delete_thread(&self, id: &str) -> Result<CascadeReport> {
        let (rows, files) = self.ctx.db.write(|tx| {
            let store = ObjectStore::new(tx);
            let graph = ReplyGraph::new(tx);
            let mut files = Vec::new();
            let mut rows = 0;
            for target in subtree(&graph, id)?.iter().rev() {
                rows += self.delete_one(&store, &graph, target, &mut files)?;
            }
            Ok((rows, files))
        })?;
        let report = CascadeReport { rows, files_removed: remove_files(&files) };
        info!(%id, rows = report.rows, files = report.files_removed, "deleted thread");
        Ok(report)
    }

    pub fn mark_sticky(&self, actor: &str, id: &str) -> Result<FlagToggle> {
        self.toggle(Flag::Sticky, actor, id)
    }

    pub fn mark_locked(&self, actor: &str, id: &str) -> Result<FlagToggle> {
        self.toggle(Flag::Locked, actor, id)
    }

    fn toggle(&self, flag: Flag, actor: &str, id: &str) -> Result<FlagToggle> {
        let out = self.ctx.db.write(|tx| ReplyGraph::new(tx).toggle_flag(flag, actor, id))?;
        info!(%id, ?flag, ?out, "flag toggled");
        Ok(out)
    }

    /// Retypes a post and its direct replies, e.g. to archive a thread.
    pub fn set_thread_type(&self, id: &str, ty: ObjectType) -> Result<usize> {
        if !ty.is_post() {
            return Err(anyhow!("set_thread_type: {ty} is not a post type"));
        }
        self.ctx.db.write(|tx| {
            let store = ObjectStore::new(tx);
            let graph = ReplyGraph::new(tx);
            let mut n = store.set_type(id, &ty)?;
            for child in graph.children(id)? {
                n += store.set_type(&child.id, &ty)?;
            }
            Ok(n)
        })
    }

    pub fn mark_sensitive(&self, id: &str, sensitive: bool) -> Result<usize> {
        self.ctx.db.write(|tx| ObjectStore::new(tx).set_sensitive(id, sensitive))
    }

    pub fn update_preview(&self, attachment_id: &str, preview_id: &str) -> Result<usize> {
        self.ctx
            .db
            .write(|tx| ObjectStore::new(tx).set_preview_for_attachment(attachment_id, preview_id))
    }

    pub fn report(&self, id: &str, reason: &str) -> Result<()> {
        self.ctx.db.write(|tx| ObjectStore::new(tx).report(id, reason))?;
        info!(%id, "reported");
        Ok(())
    }

    fn tombstone_one(&self, store: &ObjectStore<'_>, id: &str, at_ms: i64, files: &mut Vec<PathBuf>) -> Result<usize> {
        store.delete_reports(id)?;
        self.schedule_media_files(store, id, files)?;
        let placeholder = self.ctx.cfg.placeholder_href();
        let mut rows = store.tombstone_linked_media(id, &placeholder, at_ms)?;
        rows += store.tombstone_row(id, at_ms)?;
        Ok(rows)
    }

    fn delete_one(
        &self,
        store: &ObjectStore<'_>,
        graph: &ReplyGraph<'_>,
        id: &str,
        files: &mut Vec<PathBuf>,
    ) -> Result<usize> {
        store.delete_reports(id)?;
        self.schedule_media_files(store, id, files)?;
        let mut rows = store.delete_linked_media(id)?;
        rows += store.delete_row(id)?;
        graph.delete_edges_of(id)?;
        graph.clear_flags(id)?;
        Ok(rows)
    }

    fn schedule_media_files(&self, store: &ObjectStore<'_>, id: &str, files: &mut Vec<PathBuf>) -> Result<()> {
        for media in store.linked_media(id)? {
            if let Some(path) = media.href().and_then(|h| self.local_file_for(h)) {
                files.push(path);
            }
        }
        Ok(())
    }

    /// Backing file of a media href served by this node. Remote hrefs and the
    /// placeholder image map to nothing.
    pub fn local_file_for(&self, href: &str) -> Option<PathBuf> {
        let rel = href.strip_prefix(self.ctx.domain())?.strip_prefix('/')?;
        if rel.is_empty() || rel == self.ctx.cfg.placeholder_path() {
            return None;
        }
        let rel = Path::new(rel);
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        Some(self.ctx.files_root().join(rel))
    }
}

fn persist_media(
    store: &ObjectStore<'_>,
    media: &mut ObjectBase,
    default_ty: ObjectType,
    owner: &str,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    media.id = store.mint_id(actor)?;
    if media.ty.is_none() {
        media.ty = Some(default_ty);
    }
    media.actor = actor.to_string();
    media.published = Some(now);
    media.updated = Some(now);
    media.attributed_to = owner.to_string();
    store.insert_local(&StoredObject::from_wire(media, Tier::Local))
}

/// Write-if-absent of preview, attachment, then the object. Returns whether the object row was new.
fn write_cached(store: &ObjectStore<'_>, obj: &ObjectBase) -> Result<bool> {
    if let Some(att) = obj.attachment.first().filter(|a| !a.id.is_empty()) {
        if let Some(preview) = obj.preview.as_deref().filter(|p| !p.id.is_empty() && !p.href.is_empty()) {
            store.insert_cached(&media_row(preview, ObjectType::Preview, obj))?;
        }
        store.insert_cached(&media_row(att, ObjectType::Attachment, obj))?;
    }
    store.insert_cached(&StoredObject::from_wire(obj, Tier::Cache))
}

fn media_row(media: &ObjectBase, default_ty: ObjectType, owner: &ObjectBase) -> StoredObject {
    let mut media = media.clone();
    media.ty.get_or_insert(default_ty);
    if media.actor.is_empty() {
        media.actor = owner.actor.clone();
    }
    StoredObject::from_wire(&media, Tier::Cache)
}

/// Records the reply edge (or the root edge), promotes replies into archived
/// threads and bumps the parent unless the post is saged. Returns whether the
/// object was promoted to Archive.
fn link_into_thread(
    store: &ObjectStore<'_>,
    graph: &ReplyGraph<'_>,
    obj: &ObjectBase,
    published: DateTime<Utc>,
) -> Result<bool> {
    let Some(parent) = obj.reply_parent() else {
        graph.record_edge(&obj.id, "")?;
        return Ok(false);
    };
    let root = graph.root_of(parent)?;
    let promoted = store.object_type(&root)? == Some(ObjectType::Archive);
    if promoted {
        store.set_type(&obj.id, &ObjectType::Archive)?;
    }
    graph.record_edge(&obj.id, parent)?;
    if !(obj.has_option("sage") || obj.has_option("nokosage")) {
        store.touch_updated(parent, published)?;
    }
    Ok(promoted)
}

/// Breadth-first ids of `root` and everything replying below it, root first.
fn subtree(graph: &ReplyGraph<'_>, root: &str) -> Result<Vec<String>> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([root.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for child in graph.child_ids(&id)? {
            if !seen.contains(&child) {
                queue.push_back(child);
            }
        }
        order.push(id);
    }
    Ok(order)
}

fn remove_files(files: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in files {
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "media file already gone");
            }
            Err(e) => warn!(path = %path.display(), "remove media file failed: {e:#}"),
        }
    }
    removed
}
