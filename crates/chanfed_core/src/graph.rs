/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::db::Db;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;
use serde_json::Value;

const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Follower / following lists of any actor, local or remote.
#[async_trait]
pub trait SocialGraph: Send + Sync {
    async fn followers(&self, actor_id: &str) -> Result<Vec<String>>;
    async fn following(&self, actor_id: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy)]
enum Relation {
    Follower,
    Following,
}

impl Relation {
    fn table(self) -> &'static str {
        match self {
            Relation::Follower => "follower",
            Relation::Following => "following",
        }
    }
}

/// The `follower` / `following` tables of actors hosted here.
#[derive(Clone)]
pub struct LocalGraph {
    db: Db,
}

impl LocalGraph {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn add_follower(&self, actor_id: &str, follower: &str) -> Result<bool> {
        self.add(Relation::Follower, actor_id, follower)
    }

    pub fn remove_follower(&self, actor_id: &str, follower: &str) -> Result<bool> {
        self.remove(Relation::Follower, actor_id, follower)
    }

    pub fn add_following(&self, actor_id: &str, following: &str) -> Result<bool> {
        self.add(Relation::Following, actor_id, following)
    }

    pub fn remove_following(&self, actor_id: &str, following: &str) -> Result<bool> {
        self.remove(Relation::Following, actor_id, following)
    }

    pub fn followers_of(&self, actor_id: &str) -> Result<Vec<String>> {
        self.list(Relation::Follower, actor_id)
    }

    pub fn following_of(&self, actor_id: &str) -> Result<Vec<String>> {
        self.list(Relation::Following, actor_id)
    }

    pub fn is_local_actor(&self, actor_id: &str) -> Result<bool> {
        let found = self.db.read(|c| {
            Ok(c.query_row("SELECT 1 FROM actor WHERE id = ?1", params![actor_id], |_| Ok(()))
                .optional()?)
        })?;
        Ok(found.is_some())
    }

    fn add(&self, rel: Relation, actor_id: &str, other: &str) -> Result<bool> {
        let t = rel.table();
        let n = self.db.write(|tx| {
            tx.execute(&format!("INSERT OR IGNORE INTO {t}(id, {t}) VALUES (?1, ?2)"), params![actor_id, other])
                .with_context(|| format!("add {t} {other} to {actor_id}"))
        })?;
        Ok(n > 0)
    }

    fn remove(&self, rel: Relation, actor_id: &str, other: &str) -> Result<bool> {
        let t = rel.table();
        let n = self.db.write(|tx| {
            tx.execute(&format!("DELETE FROM {t} WHERE id = ?1 AND {t} = ?2"), params![actor_id, other])
                .with_context(|| format!("remove {t} {other} from {actor_id}"))
        })?;
        Ok(n > 0)
    }

    fn list(&self, rel: Relation, actor_id: &str) -> Result<Vec<String>> {
        let t = rel.table();
        self.db.read(|c| {
            let mut stmt = c.prepare(&format!("SELECT {t} FROM {t} WHERE id = ?1 ORDER BY {t}"))?;
            let rows = stmt.query_map(params![actor_id], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }

    async fn blocking_list(&self, rel: Relation, actor_id: &str) -> Result<Vec<String>> {
        let this = self.clone();
        let actor_id = actor_id.to_string();
        tokio::task::spawn_blocking(move || this.list(rel, &actor_id))
            .await
            .context("join social graph query")?
    }
}

#[async_trait]
impl SocialGraph for LocalGraph {
    async fn followers(&self, actor_id: &str) -> Result<Vec<String>> {
        self.blocking_list(Relation::Follower, actor_id).await
    }

    async fn following(&self, actor_id: &str) -> Result<Vec<String>> {
        self.blocking_list(Relation::Following, actor_id).await
    }
}

/// Reads the `followers` / `following` collections linked from a remote actor document.
#[derive(Clone)]
pub struct HttpGraph {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ActorCollections {
    followers: Option<String>,
    following: Option<String>,
}

impl HttpGraph {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_json(&self, url: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .header("Accept", ACTIVITY_ACCEPT)
            .send()
            .await
            .with_context(|| format!("fetch {url}"))?
            .error_for_status()
            .with_context(|| format!("not ok: {url}"))?;
        let text = resp.text().await?;
        serde_json::from_str(&text).with_context(|| format!("parse json from {url}"))
    }

    async fn collection(&self, actor_id: &str, rel: Relation) -> Result<Vec<String>> {
        let actor: ActorCollections = serde_json::from_value(self.fetch_json(actor_id).await?)
            .with_context(|| format!("parse actor {actor_id}"))?;
        let url = match rel {
            Relation::Follower => actor.followers,
            Relation::Following => actor.following,
        }
        .ok_or_else(|| anyhow!("actor {actor_id} has no {} collection", rel.table()))?;

        let coll = self.fetch_json(&url).await?;
        let mut out = collection_ids(&coll);
        // Paged collections keep their items on the first page.
        if out.is_empty() {
            match coll.get("first") {
                Some(Value::String(page)) => out = collection_ids(&self.fetch_json(page).await?),
                Some(page @ Value::Object(_)) => out = collection_ids(page),
                _ => {}
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }
}

fn collection_ids(coll: &Value) -> Vec<String> {
    let mut out = Vec::new();
    for field in ["orderedItems", "items"] {
        let Some(Value::Array(items)) = coll.get(field) else { continue };
        for item in items {
            match item {
                Value::String(s) => out.push(s.clone()),
                Value::Object(o) => {
                    if let Some(Value::String(id)) = o.get("id") {
                        out.push(id.clone());
                    }
                }
                _ => {}
            }
        }
    }
    out
}

#[async_trait]
impl SocialGraph for HttpGraph {
    async fn followers(&self, actor_id: &str) -> Result<Vec<String>> {
        self.collection(actor_id, Relation::Follower).await
    }

    async fn following(&self, actor_id: &str) -> Result<Vec<String>> {
        self.collection(actor_id, Relation::Following).await
    }
}

/// Local tables for actors hosted here, HTTP for everyone else.
#[derive(Clone)]
pub struct FederatedGraph {
    local: LocalGraph,
    remote: HttpGraph,
}

impl FederatedGraph {
    pub fn new(local: LocalGraph, remote: HttpGraph) -> Self {
        Self { local, remote }
    }

    async fn is_local(&self, actor_id: &str) -> Result<bool> {
        let local = self.local.clone();
        let actor_id = actor_id.to_string();
        tokio::task::spawn_blocking(move || local.is_local_actor(&actor_id))
            .await
            .context("join actor lookup")?
    }
}

#[async_trait]
impl SocialGraph for FederatedGraph {
    async fn followers(&self, actor_id: &str) -> Result<Vec<String>> {
        if self.is_local(actor_id).await? {
            self.local.followers(actor_id).await
        } else {
            self.remote.followers(actor_id).await
        }
    }

    async fn following(&self, actor_id: &str) -> Result<Vec<String>> {
        if self.is_local(actor_id).await? {
            self.local.following(actor_id).await
        } else {
            self.remote.following(actor_id).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_db;

    #[tokio::test]
    async fn local_graph_round_trips_relations() {
        let (_dir, db) = temp_db();
        let graph = LocalGraph::new(db);
        assert!(graph.add_follower("https://b.example/g", "https://far.example/x").unwrap());
        assert!(!graph.add_follower("https://b.example/g", "https://far.example/x").unwrap());
        graph.add_following("https://b.example/g", "https://far.example/y").unwrap();

        assert_eq!(graph.followers("https://b.example/g").await.unwrap(), vec!["https://far.example/x"]);
        assert_eq!(graph.following("https://b.example/g").await.unwrap(), vec!["https://far.example/y"]);
        assert!(graph.remove_follower("https://b.example/g", "https://far.example/x").unwrap());
        assert!(graph.followers("https://b.example/g").await.unwrap().is_empty());
        assert!(!graph.is_local_actor("https://b.example/g").unwrap());
    }

    #[test]
    fn collection_ids_accept_strings_and_objects() {
        let coll = serde_json::json!({
            "type": "OrderedCollection",
            "orderedItems": ["https://a.example/1", {"id": "https://a.example/2"}, 3]
        });
        assert_eq!(collection_ids(&coll), vec!["https://a.example/1", "https://a.example/2"]);
    }
}
