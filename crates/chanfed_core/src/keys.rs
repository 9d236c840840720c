/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::context::Context;
use crate::db::Db;
use crate::http_sig::parse_private_key_pem;
use anyhow::{anyhow, Context as _, Result};
use chanfed_protocol::{Actor, PublicKeyPem};
use rand::rngs::OsRng;
use rsa::{
    pkcs1::EncodeRsaPrivateKey,
    pkcs8::{EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// Registry row: which public key file belongs to which actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyRecord {
    pub id: String,
    pub owner: String,
    pub file: PathBuf,
}

/// Per-actor RSA keys on disk plus the `publickeypem` and `actor` tables.
#[derive(Clone)]
pub struct KeyStore {
    db: Db,
    dir: PathBuf,
    bits: usize,
}

/// `(private PKCS#1 PEM, public SPKI PEM)`.
pub fn generate_keypair(bits: usize) -> Result<(String, String)> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, bits).context("generate rsa key")?;
    let private_pem = private_key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .context("encode private key")?
        .to_string();
    let public_pem = public_pem_for(&private_key)?;
    Ok((private_pem, public_pem))
}

fn public_pem_for(private_key: &RsaPrivateKey) -> Result<String> {
    RsaPublicKey::from(private_key)
        .to_public_key_pem(LineEnding::LF)
        .context("encode public key")
}

fn private_path_for(public: &Path) -> PathBuf {
    let name = public.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    public.with_file_name(name.replace("public.pem", "private.pem"))
}

/// Creates `path` with `pem`, refusing to replace an existing file.
fn write_new(path: &Path, pem: &str, private: bool) -> Result<()> {
    use std::io::Write as _;
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        opts.mode(if private { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = private;
    let mut f = opts.open(path).with_context(|| format!("create {}", path.display()))?;
    f.write_all(pem.as_bytes())
        .with_context(|| format!("write {}", path.display()))
}

fn discard(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), "remove key file after failed provision: {e:#}");
        }
    }
}

fn valid_actor_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl KeyStore {
    pub fn new(ctx: &Context) -> Result<Self> {
        Ok(Self {
            db: ctx.db.clone(),
            dir: ctx.cfg.key_dir()?,
            bits: ctx.cfg.key_bits(),
        })
    }

    pub fn key_dir(&self) -> &Path {
        &self.dir
    }

    /// Stores the actor, generates its keypair and registers `<actor>#main-key`.
    /// An actor gets exactly one key: a second call, or a different actor reusing the
    /// name, fails before anything is generated. Existing key files are never replaced.
    pub fn provision_actor(&self, actor: &Actor) -> Result<PublicKeyRecord> {
        if !valid_actor_name(&actor.name) {
            return Err(anyhow!("invalid actor name: {:?}", actor.name));
        }
        if self.record_for_owner(&actor.id)?.is_some() {
            return Err(anyhow!("already storing public key for actor {}", actor.id));
        }

        if let Some(existing) = self.db.read(|c| query_actor(c, "name", &actor.name))? {
            if existing.id != actor.id {
                return Err(anyhow!("actor name {:?} already belongs to {}", actor.name, existing.id));
            }
        }

        fs::create_dir_all(&self.dir).with_context(|| format!("create key dir: {}", self.dir.display()))?;
        let (private_pem, public_pem) = generate_keypair(self.bits)?;
        let public_path = self.dir.join(format!("{}-public.pem", actor.name));
        let private_path = self.dir.join(format!("{}-private.pem", actor.name));
        write_new(&private_path, &private_pem, true)?;
        if let Err(e) = write_new(&public_path, &public_pem, false) {
            discard(&[private_path.as_path()]);
            return Err(e);
        }

        let record = PublicKeyRecord {
            id: actor.key_id(),
            owner: actor.id.clone(),
            file: public_path,
        };
        let stored = self.db.write(|tx| {
            insert_actor(tx, actor, &record.id)?;
            tx.execute(
                "INSERT INTO publickeypem(id, owner, file) VALUES (?1, ?2, ?3)",
                params![record.id, record.owner, record.file.to_string_lossy()],
            )
            .with_context(|| format!("register key {}", record.id))?;
            Ok(())
        });
        if let Err(e) = stored {
            discard(&[private_path.as_path(), record.file.as_path()]);
            return Err(e);
        }
        info!(actor = %actor.id, key = %record.id, "provisioned actor keypair");
        Ok(record)
    }

    pub fn record(&self, key_id: &str) -> Result<Option<PublicKeyRecord>> {
        self.db.read(|c| query_record(c, "id", key_id))
    }

    pub fn record_for_owner(&self, owner: &str) -> Result<Option<PublicKeyRecord>> {
        self.db.read(|c| query_record(c, "owner", owner))
    }

    /// Registered key with its PEM text, `None` when the key id is not ours.
    pub fn load_public_key(&self, key_id: &str) -> Result<Option<PublicKeyPem>> {
        let Some(record) = self.record(key_id)? else {
            return Ok(None);
        };
        let pem = fs::read_to_string(&record.file)
            .with_context(|| format!("read public key {}", record.file.display()))?;
        Ok(Some(PublicKeyPem {
            id: record.id,
            owner: record.owner,
            public_key_pem: pem,
        }))
    }

    pub fn load_private_key_pem(&self, actor_id: &str) -> Result<String> {
        let record = self
            .record_for_owner(actor_id)?
            .ok_or_else(|| anyhow!("no key registered for actor {actor_id}"))?;
        let path = private_path_for(&record.file);
        fs::read_to_string(&path).with_context(|| format!("read private key {}", path.display()))
    }

    /// Rewrites the public PEM of `key_id` from the private key stored next to it.
    pub fn recover_public_key(&self, key_id: &str) -> Result<PathBuf> {
        let record = self
            .record(key_id)?
            .ok_or_else(|| anyhow!("no key registered as {key_id}"))?;
        let private_path = private_path_for(&record.file);
        if !private_path.exists() {
            warn!(
                key = %key_id,
                path = %private_path.display(),
                "private key missing; the board cannot sign until the key file is restored"
            );
            return Err(anyhow!("private key missing: {}", private_path.display()));
        }
        let private_pem = fs::read_to_string(&private_path)
            .with_context(|| format!("read private key {}", private_path.display()))?;
        let private_key = parse_private_key_pem(&private_pem)?;
        let public_pem = public_pem_for(&private_key)?;
        fs::write(&record.file, public_pem).with_context(|| format!("write {}", record.file.display()))?;
        info!(key = %key_id, path = %record.file.display(), "recovered public key");
        Ok(record.file)
    }

    /// Local actor document, with its public key attached when registered.
    pub fn actor(&self, id: &str) -> Result<Option<Actor>> {
        let Some(mut actor) = self.db.read(|c| query_actor(c, "id", id))? else {
            return Ok(None);
        };
        actor.public_key = self.load_public_key(&actor.key_id())?;
        Ok(Some(actor))
    }

    pub fn actor_by_name(&self, name: &str) -> Result<Option<Actor>> {
        match self.db.read(|c| query_actor(c, "name", name))? {
            Some(actor) => self.actor(&actor.id),
            None => Ok(None),
        }
    }
}

fn query_record(conn: &Connection, column: &str, value: &str) -> Result<Option<PublicKeyRecord>> {
    conn.query_row(
        &format!("SELECT id, owner, file FROM publickeypem WHERE {column} = ?1"),
        params![value],
        |r| {
            Ok(PublicKeyRecord {
                id: r.get(0)?,
                owner: r.get(1)?,
                file: PathBuf::from(r.get::<_, String>(2)?),
            })
        },
    )
    .optional()
    .with_context(|| format!("load key record by {column}"))
}

fn query_actor(conn: &Connection, column: &str, value: &str) -> Result<Option<Actor>> {
    conn.query_row(
        &format!(
            "SELECT id, type, name, preferredusername, summary, inbox, outbox, following, followers, restricted \
             FROM actor WHERE {column} = ?1"
        ),
        params![value],
        |r| {
            Ok(Actor {
                id: r.get(0)?,
                ty: r.get(1)?,
                name: r.get(2)?,
                preferred_username: r.get(3)?,
                summary: r.get(4)?,
                inbox: r.get(5)?,
                outbox: r.get(6)?,
                following: r.get(7)?,
                followers: r.get(8)?,
                restricted: r.get::<_, i64>(9)? != 0,
                public_key: None,
            })
        },
    )
    .optional()
    .with_context(|| format!("load actor by {column}"))
}

fn insert_actor(conn: &Connection, actor: &Actor, key_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO actor(id, type, name, preferredusername, summary, inbox, outbox, following, followers, publickeypem, restricted) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
         ON CONFLICT(id) DO UPDATE SET publickeypem = excluded.publickeypem",
        params![
            actor.id,
            if actor.ty.is_empty() { "Group" } else { actor.ty.as_str() },
            actor.name,
            actor.preferred_username,
            actor.summary,
            actor.inbox,
            actor.outbox,
            actor.following,
            actor.followers,
            key_id,
            actor.restricted as i64,
        ],
    )
    .with_context(|| format!("store actor {}", actor.id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::http_sig::parse_public_key_pem;

    #[test]
    fn provision_registers_main_key_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let keys = KeyStore::new(&test_context(dir.path())).unwrap();
        let actor = Actor::board("https://b.example", "g", "General");

        let record = keys.provision_actor(&actor).unwrap();
        assert_eq!(record.id, "https://b.example/g#main-key");
        assert_eq!(record.file, keys.key_dir().join("g-public.pem"));
        assert!(keys.key_dir().join("g-private.pem").exists());

        let pem = keys.load_public_key(&record.id).unwrap().unwrap();
        assert_eq!(pem.owner, actor.id);
        parse_public_key_pem(&pem.public_key_pem).unwrap();
        parse_private_key_pem(&keys.load_private_key_pem(&actor.id).unwrap()).unwrap();

        let err = keys.provision_actor(&actor).unwrap_err();
        assert!(err.to_string().contains("already storing public key"));

        let stored = keys.actor_by_name("g").unwrap().unwrap();
        assert_eq!(stored.id, actor.id);
        assert_eq!(stored.public_key.unwrap().id, record.id);
        assert!(keys.load_public_key("https://far.example/x#main-key").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().unwrap();
        let keys = KeyStore::new(&test_context(dir.path())).unwrap();
        keys.provision_actor(&Actor::board("https://b.example", "p", "")).unwrap();
        let mode = fs::metadata(keys.key_dir().join("p-private.pem")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn recover_rebuilds_public_key_from_private() {
        let dir = tempfile::TempDir::new().unwrap();
        let keys = KeyStore::new(&test_context(dir.path())).unwrap();
        let actor = Actor::board("https://b.example", "r", "");
        let record = keys.provision_actor(&actor).unwrap();
        let original = fs::read_to_string(&record.file).unwrap();

        fs::remove_file(&record.file).unwrap();
        let path = keys.recover_public_key(&record.id).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), original);

        fs::remove_file(keys.key_dir().join("r-private.pem")).unwrap();
        assert!(keys.recover_public_key(&record.id).is_err());
    }

    #[test]
    fn same_name_under_other_domain_keeps_existing_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let keys = KeyStore::new(&test_context(dir.path())).unwrap();
        let first = Actor::board("https://b.example", "g", "General");
        keys.provision_actor(&first).unwrap();
        let private = fs::read_to_string(keys.key_dir().join("g-private.pem")).unwrap();
        let public = fs::read_to_string(keys.key_dir().join("g-public.pem")).unwrap();

        let err = keys
            .provision_actor(&Actor::board("https://other.example", "g", "Other"))
            .unwrap_err();
        assert!(err.to_string().contains("already belongs to"));
        assert_eq!(fs::read_to_string(keys.key_dir().join("g-private.pem")).unwrap(), private);
        assert_eq!(fs::read_to_string(keys.key_dir().join("g-public.pem")).unwrap(), public);
        assert_eq!(keys.load_private_key_pem(&first.id).unwrap(), private);
        assert!(keys.record_for_owner("https://other.example/g").unwrap().is_none());
    }

    #[test]
    fn stray_key_file_is_not_replaced() {
        let dir = tempfile::TempDir::new().unwrap();
        let keys = KeyStore::new(&test_context(dir.path())).unwrap();
        fs::create_dir_all(keys.key_dir()).unwrap();
        fs::write(keys.key_dir().join("s-private.pem"), "kept").unwrap();

        assert!(keys.provision_actor(&Actor::board("https://b.example", "s", "")).is_err());
        assert_eq!(fs::read_to_string(keys.key_dir().join("s-private.pem")).unwrap(), "kept");
        assert!(!keys.key_dir().join("s-public.pem").exists());
        assert!(keys.actor_by_name("s").unwrap().is_none());
    }

    #[test]
    fn rejects_path_like_names() {
        let dir = tempfile::TempDir::new().unwrap();
        let keys = KeyStore::new(&test_context(dir.path())).unwrap();
        let actor = Actor::board("https://b.example", "../etc", "");
        assert!(keys.provision_actor(&actor).is_err());
    }
}
