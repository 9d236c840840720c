/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::db::Db;
use crate::graph::SocialGraph;
use crate::replies::ReplyGraph;
use anyhow::{Context, Result};
use chanfed_protocol::ObjectBase;
use std::collections::HashSet;
use tracing::debug;

/// Cache admission for a remote object delivered to `local_actor`.
///
/// Admitted when the local actor follows the author. Otherwise only replies are
/// admitted, and only when one of the author's followers is someone the local
/// actor follows. Thread roots come in through a direct follow only.
pub async fn want_to_cache(
    db: &Db,
    graph: &dyn SocialGraph,
    obj: &ObjectBase,
    local_actor: &str,
) -> Result<bool> {
    let followers = graph
        .followers(&obj.actor)
        .await
        .with_context(|| format!("followers of {}", obj.actor))?;
    if followers.iter().any(|f| f == local_actor) {
        return Ok(true);
    }

    if obj.reply_parent().is_none() {
        debug!(id = %obj.id, "root post from an actor we do not follow");
        return Ok(false);
    }
    if is_recorded_root(db, &obj.id).await? {
        return Ok(false);
    }

    let following = graph
        .following(local_actor)
        .await
        .with_context(|| format!("following of {local_actor}"))?;
    let following: HashSet<&str> = following.iter().map(String::as_str).collect();
    Ok(followers.iter().any(|f| following.contains(f.as_str())))
}

/// Whether `id` is already stored as a thread root.
async fn is_recorded_root(db: &Db, id: &str) -> Result<bool> {
    let db = db.clone();
    let id = id.to_string();
    tokio::task::spawn_blocking(move || db.read(|c| Ok(ReplyGraph::new(c).root_edge_count(&id)? > 0)))
        .await
        .context("join root lookup")?
}

/// Followers and following of `actor_id`, deduplicated, without the actor itself.
pub async fn delivery_audience(graph: &dyn SocialGraph, actor_id: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let followers = graph.followers(actor_id).await?;
    let following = graph.following(actor_id).await?;
    for id in followers.into_iter().chain(following) {
        if id != actor_id && seen.insert(id.clone()) {
            out.push(id);
        }
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::temp_db;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;

    #[derive(Default)]
    pub(crate) struct FakeGraph {
        pub followers: HashMap<String, Vec<String>>,
        pub following: HashMap<String, Vec<String>>,
    }

    impl FakeGraph {
        pub(crate) fn follower(mut self, actor: &str, follower: &str) -> Self {
            self.followers.entry(actor.into()).or_default().push(follower.into());
            self
        }

        pub(crate) fn following(mut self, actor: &str, followed: &str) -> Self {
            self.following.entry(actor.into()).or_default().push(followed.into());
            self
        }
    }

    #[async_trait]
    impl SocialGraph for FakeGraph {
        async fn followers(&self, actor_id: &str) -> Result<Vec<String>> {
            Ok(self.followers.get(actor_id).cloned().unwrap_or_default())
        }

        async fn following(&self, actor_id: &str) -> Result<Vec<String>> {
            Ok(self.following.get(actor_id).cloned().unwrap_or_default())
        }
    }

    const LOCAL: &str = "https://b.example/g";
    const REMOTE: &str = "https://far.example/g";
    const FRIEND: &str = "https://mid.example/h";

    fn remote_post(parent: Option<&str>) -> ObjectBase {
        ObjectBase {
            id: "https://far.example/g/p1".into(),
            actor: REMOTE.into(),
            in_reply_to: parent.map(ObjectBase::reference).into_iter().collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn direct_follow_admits_everything() {
        let (_dir, db) = temp_db();
        let graph = FakeGraph::default().follower(REMOTE, LOCAL);
        assert!(want_to_cache(&db, &graph, &remote_post(None), LOCAL).await.unwrap());
        assert!(want_to_cache(&db, &graph, &remote_post(Some("https://far.example/g/op")), LOCAL)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn shared_contact_admits_replies_only() {
        let (_dir, db) = temp_db();
        let graph = FakeGraph::default().follower(REMOTE, FRIEND).following(LOCAL, FRIEND);
        assert!(!want_to_cache(&db, &graph, &remote_post(None), LOCAL).await.unwrap());
        assert!(want_to_cache(&db, &graph, &remote_post(Some("https://far.example/g/op")), LOCAL)
            .await
            .unwrap());

        let stranger = FakeGraph::default().follower(REMOTE, "https://nobody.example/x");
        assert!(!want_to_cache(&db, &stranger, &remote_post(Some("https://far.example/g/op")), LOCAL)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn empty_first_parent_is_not_a_reply() {
        let (_dir, db) = temp_db();
        let graph = FakeGraph::default().follower(REMOTE, FRIEND).following(LOCAL, FRIEND);
        let mut obj = remote_post(None);
        obj.in_reply_to = vec![ObjectBase::reference("")];
        assert!(!want_to_cache(&db, &graph, &obj, LOCAL).await.unwrap());
    }

    #[tokio::test]
    async fn audience_is_union_without_self() {
        let graph = FakeGraph::default()
            .follower(LOCAL, "https://far.example/a")
            .follower(LOCAL, LOCAL)
            .following(LOCAL, "https://far.example/a")
            .following(LOCAL, "https://far.example/b");
        let got = delivery_audience(&graph, LOCAL).await.unwrap();
        assert_eq!(got, vec!["https://far.example/a".to_string(), "https://far.example/b".to_string()]);
    }
}
