/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::http_sig::sign_request_rsa_sha256;
use crate::keys::KeyStore;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chanfed_protocol::{Activity, AS_PUBLIC};
use http::{HeaderMap, HeaderValue, Method, Uri};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{info, warn};

const ACTIVITY_JSON: &str = "application/activity+json";
/// Headers covered by the signature on every outbound POST.
pub const SIGNED_HEADERS: &[&str] = &["(request-target)", "host", "date", "digest", "content-type"];
const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Recipients whose inbox could not be resolved or refused the POST.
    pub failed: Vec<String>,
}

/// Outbound transport for activities.
#[async_trait]
pub trait ActivitySender: Send + Sync {
    async fn deliver(&self, activity: &Activity, recipients: &[String]) -> Result<DeliveryReport>;
}

/// One signed POST per distinct inbox, signed with the sending actor's key.
#[derive(Clone)]
pub struct HttpDelivery {
    client: reqwest::Client,
    keys: KeyStore,
}

#[derive(Debug, Deserialize)]
struct ActorDoc {
    inbox: Option<String>,
    endpoints: Option<ActorEndpoints>,
}

#[derive(Debug, Deserialize)]
struct ActorEndpoints {
    #[serde(rename = "sharedInbox")]
    shared_inbox: Option<String>,
}

impl HttpDelivery {
    pub fn new(client: reqwest::Client, keys: KeyStore) -> Self {
        Self { client, keys }
    }

    /// Shared inbox when advertised, the actor inbox otherwise.
    pub async fn resolve_inbox(&self, actor_url: &str) -> Result<String> {
        let resp = self
            .client
            .get(actor_url)
            .header(ACCEPT, ACTIVITY_ACCEPT)
            .send()
            .await
            .with_context(|| format!("fetch actor: {actor_url}"))?
            .error_for_status()
            .with_context(|| format!("actor not ok: {actor_url}"))?;

        let text = resp.text().await?;
        let actor: ActorDoc =
            serde_json::from_str(&text).with_context(|| format!("parse actor json from {actor_url}"))?;
        if let Some(shared) = actor.endpoints.and_then(|e| e.shared_inbox) {
            return Ok(shared);
        }
        actor.inbox.ok_or_else(|| anyhow!("actor missing inbox"))
    }

    /// POSTs `body` to `inbox_url`, signed as `key_id` over [`SIGNED_HEADERS`].
    /// Any non-2xx answer is an error carrying the status and response text.
    pub async fn deliver_json(&self, private_key_pem: &str, key_id: &str, inbox_url: &str, body: &[u8]) -> Result<()> {
        let uri: Uri = inbox_url.parse().context("parse inbox url")?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACTIVITY_JSON));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON));
        sign_request_rsa_sha256(private_key_pem, key_id, &Method::POST, &uri, &mut headers, body, SIGNED_HEADERS)?;

        let resp = self
            .client
            .post(inbox_url)
            .headers(headers)
            .body(body.to_vec())
            .send()
            .await
            .with_context(|| format!("post to {inbox_url}"))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("inbox {inbox_url} refused activity: {status} {text}"));
        }
        Ok(())
    }
}

#[async_trait]
impl ActivitySender for HttpDelivery {
    async fn deliver(&self, activity: &Activity, recipients: &[String]) -> Result<DeliveryReport> {
        let actor_id = activity.actor_id().to_string();
        if actor_id.is_empty() {
            return Err(anyhow!("activity has no actor"));
        }
        let keys = self.keys.clone();
        let owner = actor_id.clone();
        let private_key_pem = tokio::task::spawn_blocking(move || keys.load_private_key_pem(&owner))
            .await
            .context("join key load")??;
        let key_id = format!("{actor_id}#main-key");
        let body = serde_json::to_vec(activity).context("encode activity")?;

        let mut report = DeliveryReport::default();
        let mut inboxes = HashSet::new();
        for recipient in recipients {
            if recipient == AS_PUBLIC || *recipient == actor_id {
                continue;
            }
            let inbox = match self.resolve_inbox(recipient).await {
                Ok(inbox) => inbox,
                Err(e) => {
                    warn!(%recipient, "resolve inbox failed: {e:#}");
                    report.failed.push(recipient.clone());
                    continue;
                }
            };
            if !inboxes.insert(inbox.clone()) {
                continue;
            }
            match self.deliver_json(&private_key_pem, &key_id, &inbox, &body).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(%recipient, %inbox, "delivery failed: {e:#}");
                    report.failed.push(recipient.clone());
                }
            }
        }
        info!(
            activity = %activity.ty,
            delivered = report.delivered,
            failed = report.failed.len(),
            "activity delivered"
        );
        Ok(report)
    }
}
