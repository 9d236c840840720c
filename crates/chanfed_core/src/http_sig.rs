/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{HeaderMap, Method, Uri};
use httpdate::parse_http_date;
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs1v15::{SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};
use tokio::sync::RwLock;

const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Fields of a `Signature:` header. Parsing never fails; call [`validate`](Self::validate)
/// before trusting the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureHeader {
    pub key_id: String,
    pub headers: Vec<String>,
    pub signature: String,
    pub algorithm: String,
}

/// `keyId="...",headers="(request-target) host date",signature="...",algorithm="..."`.
/// Quotes are dropped, each comma separated part is split at its first `=`,
/// unknown keys are ignored and missing ones stay empty.
pub fn parse_signature_header(value: &str) -> SignatureHeader {
    let unquoted = value.replace('"', "");
    let mut out = SignatureHeader::default();
    for part in unquoted.split(',') {
        let Some((k, v)) = part.split_once('=') else { continue };
        let v = v.trim();
        match k.trim() {
            "keyId" => out.key_id = v.to_string(),
            "headers" => out.headers = v.split_whitespace().map(|s| s.to_ascii_lowercase()).collect(),
            "signature" => out.signature = v.to_string(),
            "algorithm" => out.algorithm = v.to_string(),
            _ => {}
        }
    }
    out
}

impl SignatureHeader {
    pub fn validate(&self) -> Result<()> {
        if self.key_id.is_empty() {
            return Err(anyhow!("Signature missing keyId"));
        }
        if self.signature.is_empty() {
            return Err(anyhow!("Signature missing signature"));
        }
        let alg = self.algorithm.to_ascii_lowercase();
        if !(alg.is_empty() || alg == "rsa-sha256" || alg == "hs2019") {
            return Err(anyhow!("unsupported signature algorithm: {}", self.algorithm));
        }
        Ok(())
    }

    /// Signed header list, `date` when the header named none.
    pub fn signed_headers(&self) -> Vec<String> {
        if self.headers.is_empty() {
            vec!["date".to_string()]
        } else {
            self.headers.clone()
        }
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>> {
        B64.decode(self.signature.as_bytes()).context("decode signature")
    }

    /// Actor id the key belongs to (keyId without its fragment).
    pub fn key_owner(&self) -> &str {
        self.key_id.split_once('#').map(|(a, _)| a).unwrap_or(&self.key_id)
    }
}

/// Remote key lookup for inbound signatures. Keys are cached per actor URL for
/// `ttl`; a keyId whose fragment differs from the cached key forces a refetch.
#[derive(Clone)]
pub struct KeyResolver {
    client: reqwest::Client,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<String, (Instant, ResolvedKey)>>>,
}

#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub actor_url: String,
    pub key_id: String,
    pub public_key_pem: String,
}

impl KeyResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            ttl: Duration::from_secs(300),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fetches the actor named by `key_id` and returns its published key.
    pub async fn resolve(&self, key_id: &str) -> Result<ResolvedKey> {
        let (actor_url, wanted_key_id) = match key_id.split_once('#') {
            Some((actor, _frag)) => (actor.to_string(), Some(key_id.to_string())),
            None => (key_id.to_string(), None),
        };

        if let Some(hit) = self.cached(&actor_url).await {
            if wanted_key_id.as_deref().map_or(true, |k| k == hit.key_id) {
                return Ok(hit);
            }
        }

        let resp = self
            .client
            .get(&actor_url)
            .header("Accept", ACTIVITY_ACCEPT)
            .send()
            .await
            .with_context(|| format!("fetch actor: {actor_url}"))?
            .error_for_status()
            .with_context(|| format!("actor not ok: {actor_url}"))?;

        let text = resp.text().await?;
        let actor: ActorDoc =
            serde_json::from_str(&text).with_context(|| format!("parse actor json from {actor_url}"))?;
        let pk = actor.public_key.ok_or_else(|| anyhow!("actor missing publicKey"))?;
        if let Some(wanted) = wanted_key_id.as_deref() {
            if wanted != pk.id {
                return Err(anyhow!("actor {actor_url} publishes {}, not {wanted}", pk.id));
            }
        }

        let key = ResolvedKey {
            actor_url,
            key_id: pk.id,
            public_key_pem: pk.public_key_pem,
        };
        self.cache
            .write()
            .await
            .insert(key.actor_url.clone(), (Instant::now() + self.ttl, key.clone()));
        Ok(key)
    }

    /// Live entry for `actor_url`; expired entries are dropped on the way.
    async fn cached(&self, actor_url: &str) -> Option<ResolvedKey> {
        {
            let cache = self.cache.read().await;
            match cache.get(actor_url) {
                Some((expires_at, key)) if *expires_at > Instant::now() => return Some(key.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.cache.write().await.remove(actor_url);
        None
    }
}

/// Draft-cavage signing string: one `name: value` line per signed header, in the
/// order the signer listed them. `(request-target)` is the lowercased method plus
/// path and query; every other name must be present in `headers`.
pub fn build_signing_string(method: &Method, uri: &Uri, headers: &HeaderMap, signed_headers: &[String]) -> Result<String> {
    let mut lines = Vec::with_capacity(signed_headers.len());
    for name in signed_headers {
        if name == "(request-target)" {
            let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or_else(|| uri.path());
            lines.push(format!("(request-target): {} {target}", method.as_str().to_ascii_lowercase()));
            continue;
        }
        let header_name = http::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("bad signed header name: {name}"))?;
        let value = headers
            .get(&header_name)
            .ok_or_else(|| anyhow!("missing signed header: {name}"))?
            .to_str()
            .with_context(|| format!("invalid header value for {name}"))?;
        lines.push(format!("{name}: {}", value.trim()));
    }
    Ok(lines.join("\n"))
}

/// Checks `Digest: SHA-256=<base64>` against `body`. A request without the header
/// passes here; whether it must carry one is decided by the signed header list.
pub fn verify_digest_if_present(headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let Some(digest) = headers.get("Digest") else {
        return Ok(());
    };
    let digest = digest.to_str().context("Digest header not utf8")?;
    let (alg, value) = digest.split_once('=').ok_or_else(|| anyhow!("invalid Digest header"))?;
    if !alg.trim().eq_ignore_ascii_case("SHA-256") {
        return Err(anyhow!("unsupported digest alg: {alg}"));
    }
    let expected = B64.decode(value.trim().as_bytes()).context("decode digest")?;
    if expected.as_slice() != Sha256::digest(body).as_slice() {
        return Err(anyhow!("digest mismatch"));
    }
    Ok(())
}

/// Rejects a missing or unparsable `Date`, or one further than `max_skew` from now
/// in either direction.
pub fn verify_date(headers: &HeaderMap, max_skew: Duration) -> Result<()> {
    let date = headers
        .get("Date")
        .ok_or_else(|| anyhow!("missing Date header"))?
        .to_str()
        .context("Date header not utf8")?;
    let ts = parse_http_date(date).context("parse Date header")?;
    let now = SystemTime::now();
    let skew = now
        .duration_since(ts)
        .or_else(|_| ts.duration_since(now))
        .unwrap_or_default();
    if skew > max_skew {
        return Err(anyhow!("Date skew too large: {}s", skew.as_secs()));
    }
    Ok(())
}

/// SPKI (`PUBLIC KEY`) or PKCS#1 (`RSA PUBLIC KEY`) PEM.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .context("parse public key pem")
}

/// PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`) PEM.
pub fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .context("parse private key pem")
}

pub fn verify_signature_rsa_sha256(public_key_pem: &str, signing_string: &str, signature: &[u8]) -> Result<()> {
    let public_key = parse_public_key_pem(public_key_pem)?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = rsa::pkcs1v15::Signature::try_from(signature).context("invalid rsa signature bytes")?;
    verifying_key
        .verify(signing_string.as_bytes(), &sig)
        .context("signature verify failed")?;
    Ok(())
}

/// Signs an outbound request as `key_id` (a board's `<actor>#main-key`). Date, Host
/// and, for a non-empty body or a signed `digest`, Digest are filled in when the
/// caller has not set them; then the `Signature` header is added.
pub fn sign_request_rsa_sha256(
    private_key_pem: &str,
    key_id: &str,
    method: &Method,
    uri: &Uri,
    headers: &mut HeaderMap,
    body: &[u8],
    signed_headers: &[&str],
) -> Result<()> {
    let names: Vec<String> = signed_headers.iter().map(|s| s.to_ascii_lowercase()).collect();

    if !headers.contains_key("Date") {
        let date = httpdate::fmt_http_date(SystemTime::now());
        headers.insert("Date", date.parse().context("set Date")?);
    }
    if (!body.is_empty() || names.iter().any(|h| h == "digest")) && !headers.contains_key("Digest") {
        let digest = format!("SHA-256={}", B64.encode(Sha256::digest(body)));
        headers.insert("Digest", digest.parse().context("set Digest")?);
    }
    if !headers.contains_key("Host") {
        if let Some(auth) = uri.authority() {
            headers.insert("Host", auth.as_str().parse().context("set Host")?);
        }
    }

    let signing_string = build_signing_string(method, uri, headers, &names)?;
    let signing_key = SigningKey::<Sha256>::new(parse_private_key_pem(private_key_pem)?);
    let signature = signing_key.sign_with_rng(&mut rand::rngs::OsRng, signing_string.as_bytes());

    let value = format!(
        "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        names.join(" "),
        B64.encode(signature.to_bytes())
    );
    headers.insert("Signature", value.parse().context("set Signature")?);
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ActorDoc {
    #[serde(rename = "publicKey")]
    public_key: Option<ActorPublicKey>,
}

#[derive(Debug, Deserialize)]
struct ActorPublicKey {
    id: String,
    #[serde(rename = "publicKeyPem")]
    public_key_pem: String,
}
