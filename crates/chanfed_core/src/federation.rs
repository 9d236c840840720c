/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Inbound deliveries (verify, admit, apply) and outbound mutations
//! (apply, wrap, deliver).

use crate::activity::{add_recipients, build_activity};
use crate::audience::{delivery_audience, want_to_cache};
use crate::delivery::{ActivitySender, DeliveryReport};
use crate::graph::{LocalGraph, SocialGraph};
use crate::http_sig::{
    build_signing_string, parse_signature_header, verify_date, verify_digest_if_present,
    verify_signature_rsa_sha256, KeyResolver,
};
use crate::keys::KeyStore;
use crate::lifecycle::{CacheOutcome, CascadeReport, Lifecycle};
use crate::store::ObjectStore;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chanfed_protocol::{Activity, ActivityType, Actor, ObjectBase, ObjectRef};
use http::{HeaderMap, Method, Uri};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Out-of-band notice to board staff about new posts (mail, chat hook, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipients: &[String], post: &ObjectBase) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxOutcome {
    Cached(CacheOutcome),
    NotAdmitted,
    Updated(usize),
    Tombstoned(CascadeReport),
    /// Follower row added (`false` when it already existed).
    Followed(bool),
    Unfollowed(bool),
    Ignored,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub object: ObjectBase,
    pub delivery: DeliveryReport,
}

#[derive(Clone)]
pub struct Federation {
    lifecycle: Lifecycle,
    keys: KeyStore,
    graph: Arc<dyn SocialGraph>,
    sender: Arc<dyn ActivitySender>,
    resolver: KeyResolver,
    notifier: Option<Arc<dyn Notifier>>,
}

async fn blocking<T, F>(what: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .with_context(|| format!("join {what}"))?
}

impl Federation {
    pub fn new(
        lifecycle: Lifecycle,
        keys: KeyStore,
        graph: Arc<dyn SocialGraph>,
        sender: Arc<dyn ActivitySender>,
        resolver: KeyResolver,
    ) -> Self {
        Self {
            lifecycle,
            keys,
            graph,
            sender,
            resolver,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Verifies the HTTP signature of an inbound request and returns the signing actor.
    ///
    /// Keys of actors provisioned here are read from the key registry; anything
    /// else is fetched from the actor document.
    pub async fn authenticate(&self, method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Result<String> {
        verify_digest_if_present(headers, body).context("digest invalid")?;
        verify_date(headers, self.lifecycle.context().cfg.max_date_skew()).context("date invalid")?;

        let raw = headers
            .get("Signature")
            .ok_or_else(|| anyhow!("missing Signature header"))?
            .to_str()
            .context("Signature header not utf8")?;
        let sig = parse_signature_header(raw);
        sig.validate().context("bad Signature")?;

        let signing_string = build_signing_string(method, uri, headers, &sig.signed_headers())
            .context("bad signed headers")?;

        let keys = self.keys.clone();
        let key_id = sig.key_id.clone();
        let (actor_url, pem) = match blocking("key lookup", move || keys.load_public_key(&key_id)).await? {
            Some(local) => (local.owner, local.public_key_pem),
            None => {
                let remote = self
                    .resolver
                    .resolve(&sig.key_id)
                    .await
                    .with_context(|| format!("key resolve failed: {}", sig.key_id))?;
                (remote.actor_url, remote.public_key_pem)
            }
        };

        verify_signature_rsa_sha256(&pem, &signing_string, &sig.signature_bytes()?)
            .with_context(|| format!("signature invalid for {}", sig.key_id))?;
        debug!(actor = %actor_url, key = %sig.key_id, "signature verified");
        Ok(actor_url)
    }

    /// Authenticates and applies one inbox POST addressed to `local_actor`.
    pub async fn inbox(
        &self,
        local_actor: &str,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<InboxOutcome> {
        let signer = self.authenticate(method, uri, headers, body).await?;
        let activity: Activity = serde_json::from_slice(body).context("parse activity json")?;
        if activity.actor_id() != signer {
            return Err(anyhow!(
                "activity actor {} does not match signer {signer}",
                activity.actor_id()
            ));
        }
        self.receive(local_actor, activity).await
    }

    /// Applies an already authenticated activity.
    pub async fn receive(&self, local_actor: &str, activity: Activity) -> Result<InboxOutcome> {
        let sender_id = activity.actor_id().to_string();
        let Some(ty) = activity.activity_type() else {
            debug!(ty = %activity.ty, "unknown activity type");
            return Ok(InboxOutcome::Ignored);
        };
        match ty {
            ActivityType::Create => {
                let mut obj = activity
                    .object()
                    .cloned()
                    .ok_or_else(|| anyhow!("Create {} without embedded object", activity.id))?;
                if obj.actor.is_empty() {
                    obj.actor = sender_id.clone();
                }
                if obj.actor != sender_id {
                    warn!(id = %obj.id, actor = %obj.actor, sender = %sender_id, "Create for another actor's object");
                    return Ok(InboxOutcome::Ignored);
                }
                if !want_to_cache(&self.lifecycle.context().db, self.graph.as_ref(), &obj, local_actor).await? {
                    debug!(id = %obj.id, "not admitted to cache");
                    return Ok(InboxOutcome::NotAdmitted);
                }
                let lifecycle = self.lifecycle.clone();
                let outcome = blocking("cache write", move || lifecycle.cache(&obj)).await?;
                Ok(InboxOutcome::Cached(outcome))
            }
            ActivityType::Update => {
                let Some(obj) = activity.object().cloned() else {
                    return Ok(InboxOutcome::Ignored);
                };
                if !self.owns_cached(&obj.id, &sender_id).await? {
                    return Ok(InboxOutcome::Ignored);
                }
                let lifecycle = self.lifecycle.clone();
                let n = blocking("update", move || lifecycle.update(&obj.id, obj.updated)).await?;
                Ok(InboxOutcome::Updated(n))
            }
            ActivityType::Delete => {
                let Some(id) = activity.object.as_ref().map(|o| o.id().to_string()) else {
                    return Ok(InboxOutcome::Ignored);
                };
                if !self.owns_cached(&id, &sender_id).await? {
                    debug!(%id, sender = %sender_id, "Delete for an object we do not mirror from this actor");
                    return Ok(InboxOutcome::Ignored);
                }
                let lifecycle = self.lifecycle.clone();
                let report = blocking("tombstone", move || lifecycle.tombstone(&id)).await?;
                Ok(InboxOutcome::Tombstoned(report))
            }
            ActivityType::Follow => {
                if activity.object.as_ref().map(ObjectRef::id) != Some(local_actor) {
                    return Ok(InboxOutcome::Ignored);
                }
                let added = self.set_follower(local_actor, &sender_id, true).await?;
                info!(actor = %local_actor, follower = %sender_id, "follow received");
                Ok(InboxOutcome::Followed(added))
            }
            ActivityType::Undo => {
                let undoes_follow = activity
                    .object()
                    .and_then(|o| o.ty.as_ref())
                    .is_some_and(|t| t.as_str() == "Follow");
                if !undoes_follow {
                    return Ok(InboxOutcome::Ignored);
                }
                let removed = self.set_follower(local_actor, &sender_id, false).await?;
                info!(actor = %local_actor, follower = %sender_id, "follow undone");
                Ok(InboxOutcome::Unfollowed(removed))
            }
            _ => Ok(InboxOutcome::Ignored),
        }
    }

    async fn set_follower(&self, local_actor: &str, follower: &str, follow: bool) -> Result<bool> {
        if follower.trim().is_empty() {
            return Err(anyhow!("follow activity without actor"));
        }
        let graph = LocalGraph::new(self.lifecycle.context().db.clone());
        let (local_actor, follower) = (local_actor.to_string(), follower.to_string());
        blocking("follower update", move || {
            if !graph.is_local_actor(&local_actor)? {
                return Err(anyhow!("{local_actor} is not hosted here"));
            }
            if follow {
                graph.add_follower(&local_actor, &follower)
            } else {
                graph.remove_follower(&local_actor, &follower)
            }
        })
        .await
    }

    async fn owns_cached(&self, id: &str, actor: &str) -> Result<bool> {
        let db = self.lifecycle.context().db.clone();
        let id = id.to_string();
        let cached = blocking("cache lookup", move || db.read(|c| ObjectStore::new(c).get_cached(&id))).await?;
        Ok(cached.is_some_and(|o| o.actor == actor))
    }

    async fn local_actor(&self, actor_id: &str) -> Result<Option<Actor>> {
        let keys = self.keys.clone();
        let actor_id = actor_id.to_string();
        blocking("actor lookup", move || keys.actor(&actor_id)).await
    }

    async fn broadcast(&self, mut activity: Activity, actor_id: &str) -> DeliveryReport {
        match delivery_audience(self.graph.as_ref(), actor_id).await {
            Ok(audience) => add_recipients(&mut activity, audience.iter().map(String::as_str)),
            Err(e) => warn!(actor = %actor_id, "audience lookup failed: {e:#}"),
        }
        match self.sender.deliver(&activity, &activity.to).await {
            Ok(report) => report,
            Err(e) => {
                warn!(activity = %activity.id, "delivery failed: {e:#}");
                DeliveryReport {
                    delivered: 0,
                    failed: activity.to.clone(),
                }
            }
        }
    }

    /// Creates a local post, delivers it to the board's audience and notifies staff.
    pub async fn publish(&self, draft: ObjectBase) -> Result<Published> {
        let actor = self
            .local_actor(&draft.actor)
            .await?
            .ok_or_else(|| anyhow!("publish: {} is not provisioned here", draft.actor))?;

        let lifecycle = self.lifecycle.clone();
        let object = blocking("create", move || lifecycle.create(draft)).await?;

        let activity = build_activity(ActivityType::Create, &object, &actor);
        let delivery = self.broadcast(activity, &actor.id).await;

        if let Some(notifier) = &self.notifier {
            let db = self.lifecycle.context().db.clone();
            match blocking("notify lookup", move || db.read(|c| ObjectStore::new(c).notify_recipients())).await {
                Ok(recipients) if !recipients.is_empty() => {
                    if let Err(e) = notifier.notify(&recipients, &object).await {
                        warn!(id = %object.id, "notify failed: {e:#}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(id = %object.id, "notify lookup failed: {e:#}"),
            }
        }
        info!(id = %object.id, delivered = delivery.delivered, "post published");
        Ok(Published { object, delivery })
    }

    /// Broadcasts a Delete to the author's followers and following, then deletes locally.
    /// Delivery problems never block the local delete.
    pub async fn delete_all(&self, id: &str) -> Result<CascadeReport> {
        let db = self.lifecycle.context().db.clone();
        let lookup = id.to_string();
        let stored = blocking("object lookup", move || db.read(|c| ObjectStore::new(c).get(&lookup)))
            .await?
            .ok_or_else(|| anyhow!("delete_all: no object {id}"))?;

        match self.local_actor(&stored.actor).await {
            Ok(Some(actor)) => {
                let activity = build_activity(ActivityType::Delete, &stored.to_wire(), &actor);
                let report = self.broadcast(activity, &actor.id).await;
                if !report.failed.is_empty() {
                    warn!(%id, failed = report.failed.len(), "Delete not delivered everywhere");
                }
            }
            Ok(None) => debug!(%id, actor = %stored.actor, "author not hosted here; deleting without broadcast"),
            Err(e) => warn!(%id, "author lookup failed, deleting without broadcast: {e:#}"),
        }

        let lifecycle = self.lifecycle.clone();
        let id = id.to_string();
        blocking("delete", move || lifecycle.delete(&id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audience::tests::FakeGraph;
    use crate::context::test_context;
    use crate::http_sig::sign_request_rsa_sha256;
    use chanfed_protocol::{ActorRef, ObjectRef, ObjectType};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const BOARD: &str = "https://b.example/g";
    const REMOTE: &str = "https://far.example/g";

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(Activity, Vec<String>)>>,
        fail: bool,
    }

    #[async_trait]
    impl ActivitySender for RecordingSender {
        async fn deliver(&self, activity: &Activity, recipients: &[String]) -> Result<DeliveryReport> {
            self.sent.lock().unwrap().push((activity.clone(), recipients.to_vec()));
            if self.fail {
                return Err(anyhow!("network down"));
            }
            Ok(DeliveryReport {
                delivered: recipients.len(),
                failed: Vec::new(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<(Vec<String>, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, recipients: &[String], post: &ObjectBase) -> Result<()> {
            self.seen.lock().unwrap().push((recipients.to_vec(), post.id.clone()));
            Ok(())
        }
    }

    fn federation(dir: &TempDir, graph: FakeGraph, sender: Arc<RecordingSender>) -> Federation {
        let ctx = test_context(dir.path());
        let keys = KeyStore::new(&ctx).unwrap();
        keys.provision_actor(&Actor::board("https://b.example", "g", "General")).unwrap();
        Federation::new(
            Lifecycle::new(ctx),
            keys,
            Arc::new(graph),
            sender,
            KeyResolver::new(reqwest::Client::new()),
        )
    }

    fn remote_create(id: &str, parent: Option<&str>) -> Activity {
        let obj = ObjectBase {
            ty: Some(ObjectType::Note),
            id: id.into(),
            actor: REMOTE.into(),
            content: "hello".into(),
            in_reply_to: parent.map(ObjectBase::reference).into_iter().collect(),
            ..Default::default()
        };
        build_activity(ActivityType::Create, &obj, &Actor::board("https://far.example", "g", ""))
    }

    fn remote_delete(id: &str, from: &str) -> Activity {
        let mut act = remote_create(id, None);
        act.ty = "Delete".into();
        act.actor = Some(ActorRef::Id(from.into()));
        act.object = Some(ObjectRef::Id(id.into()));
        act
    }

    #[tokio::test]
    async fn publish_delivers_to_audience_and_notifies() {
        let dir = TempDir::new().unwrap();
        let sender = Arc::new(RecordingSender::default());
        let graph = FakeGraph::default()
            .follower(BOARD, "https://far.example/a")
            .following(BOARD, "https://far.example/b");
        let notifier = Arc::new(RecordingNotifier::default());
        let fed = federation(&dir, graph, sender.clone()).with_notifier(notifier.clone());
        fed.lifecycle()
            .context()
            .db
            .write(|tx| {
                tx.execute("INSERT INTO accounts(username, email, type) VALUES ('admin', 'admin@b.example', 1)", [])?;
                Ok(())
            })
            .unwrap();

        let draft = ObjectBase {
            actor: BOARD.into(),
            content: "first".into(),
            ..Default::default()
        };
        let published = fed.publish(draft).await.unwrap();
        assert!(published.object.id.starts_with("https://b.example/g/"));
        assert_eq!(published.delivery.delivered, 2);

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (activity, recipients) = &sent[0];
        assert_eq!(activity.ty, "Create");
        assert_eq!(
            recipients,
            &vec!["https://far.example/a".to_string(), "https://far.example/b".to_string()]
        );

        let seen = notifier.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(vec!["admin@b.example".to_string()], published.object.id.clone())]);
    }

    #[tokio::test]
    async fn publish_requires_a_local_actor() {
        let dir = TempDir::new().unwrap();
        let fed = federation(&dir, FakeGraph::default(), Arc::new(RecordingSender::default()));
        let draft = ObjectBase {
            actor: "https://b.example/nope".into(),
            ..Default::default()
        };
        assert!(fed.publish(draft).await.is_err());
    }

    #[tokio::test]
    async fn inbound_create_respects_admission() {
        let dir = TempDir::new().unwrap();
        let graph = FakeGraph::default().follower(REMOTE, BOARD);
        let fed = federation(&dir, graph, Arc::new(RecordingSender::default()));

        let got = fed.receive(BOARD, remote_create("https://far.example/g/op", None)).await.unwrap();
        assert_eq!(got, InboxOutcome::Cached(CacheOutcome::Written(1)));
        let again = fed.receive(BOARD, remote_create("https://far.example/g/op", None)).await.unwrap();
        assert_eq!(again, InboxOutcome::Cached(CacheOutcome::AlreadyCached));

        let dir2 = TempDir::new().unwrap();
        let stranger = federation(&dir2, FakeGraph::default(), Arc::new(RecordingSender::default()));
        let got = stranger.receive(BOARD, remote_create("https://far.example/g/op", None)).await.unwrap();
        assert_eq!(got, InboxOutcome::NotAdmitted);
    }

    #[tokio::test]
    async fn inbound_delete_only_from_owner() {
        let dir = TempDir::new().unwrap();
        let graph = FakeGraph::default().follower(REMOTE, BOARD);
        let fed = federation(&dir, graph, Arc::new(RecordingSender::default()));
        fed.receive(BOARD, remote_create("https://far.example/g/op", None)).await.unwrap();

        let other = fed
            .receive(BOARD, remote_delete("https://far.example/g/op", "https://evil.example/x"))
            .await
            .unwrap();
        assert_eq!(other, InboxOutcome::Ignored);

        let own = fed.receive(BOARD, remote_delete("https://far.example/g/op", REMOTE)).await.unwrap();
        assert!(matches!(own, InboxOutcome::Tombstoned(r) if r.rows >= 1));
        let row = fed
            .lifecycle()
            .context()
            .db
            .read(|c| ObjectStore::new(c).get_cached("https://far.example/g/op"))
            .unwrap()
            .unwrap();
        assert!(row.is_tombstone());
    }

    #[tokio::test]
    async fn follow_and_undo_maintain_local_followers() {
        let dir = TempDir::new().unwrap();
        let fed = federation(&dir, FakeGraph::default(), Arc::new(RecordingSender::default()));
        let follow: Activity = serde_json::from_value(serde_json::json!({
            "type": "Follow",
            "actor": REMOTE,
            "object": BOARD,
        }))
        .unwrap();
        assert_eq!(fed.receive(BOARD, follow.clone()).await.unwrap(), InboxOutcome::Followed(true));
        assert_eq!(fed.receive(BOARD, follow).await.unwrap(), InboxOutcome::Followed(false));

        let local = LocalGraph::new(fed.lifecycle().context().db.clone());
        assert_eq!(local.followers_of(BOARD).unwrap(), vec![REMOTE.to_string()]);

        let elsewhere: Activity = serde_json::from_value(serde_json::json!({
            "type": "Follow",
            "actor": REMOTE,
            "object": "https://b.example/other",
        }))
        .unwrap();
        assert_eq!(fed.receive(BOARD, elsewhere).await.unwrap(), InboxOutcome::Ignored);

        let undo: Activity = serde_json::from_value(serde_json::json!({
            "type": "Undo",
            "actor": REMOTE,
            "object": {"type": "Follow", "actor": REMOTE},
        }))
        .unwrap();
        assert_eq!(fed.receive(BOARD, undo).await.unwrap(), InboxOutcome::Unfollowed(true));
        assert!(local.followers_of(BOARD).unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_all_deletes_even_when_delivery_fails() {
        let dir = TempDir::new().unwrap();
        let sender = Arc::new(RecordingSender {
            fail: true,
            ..Default::default()
        });
        let graph = FakeGraph::default().follower(BOARD, "https://far.example/a");
        let fed = federation(&dir, graph, sender.clone());
        let post = fed
            .publish(ObjectBase {
                actor: BOARD.into(),
                content: "bye".into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .object;

        let report = fed.delete_all(&post.id).await.unwrap();
        assert_eq!(report.rows, 1);
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.last().map(|(a, _)| a.ty.as_str()), Some("Delete"));
        let gone = fed.lifecycle().context().db.read(|c| ObjectStore::new(c).get(&post.id)).unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn authenticates_locally_provisioned_signer() {
        let dir = TempDir::new().unwrap();
        let fed = federation(&dir, FakeGraph::default(), Arc::new(RecordingSender::default()));
        let pem = fed.keys.load_private_key_pem(BOARD).unwrap();
        let uri: Uri = "https://b.example/g/inbox".parse().unwrap();
        let body = br#"{"type":"Follow"}"#;
        let mut headers = HeaderMap::new();
        sign_request_rsa_sha256(
            &pem,
            &format!("{BOARD}#main-key"),
            &Method::POST,
            &uri,
            &mut headers,
            body,
            &["(request-target)", "host", "date", "digest"],
        )
        .unwrap();

        let signer = fed.authenticate(&Method::POST, &uri, &headers, body).await.unwrap();
        assert_eq!(signer, BOARD);
        assert!(fed
            .authenticate(&Method::POST, &uri, &headers, br#"{"type":"Undo"}"#)
            .await
            .is_err());
    }
}
