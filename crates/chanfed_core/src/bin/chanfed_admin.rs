/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context as _};
use chanfed_core::config::BoardConfig;
use chanfed_core::context::Context;
use chanfed_core::delivery::HttpDelivery;
use chanfed_core::federation::Federation;
use chanfed_core::graph::{FederatedGraph, HttpGraph, LocalGraph};
use chanfed_core::http_sig::KeyResolver;
use chanfed_core::keys::KeyStore;
use chanfed_core::lifecycle::Lifecycle;
use chanfed_core::tripcode::name_and_tripcode;
use chanfed_protocol::Actor;
use std::env;
use std::sync::Arc;

const USAGE: &str = "usage: chanfed_admin <config.json> <command> [args]

commands:
  provision <name> [summary]
  recover-key <name>
  tripcode <input>
  sticky <actor-id> <id>
  lock <actor-id> <id>
  tombstone <id>
  tombstone-thread <id>
  delete <id>
  delete-all <id>";

fn arg(args: &[String], i: usize) -> anyhow::Result<&str> {
    args.get(i)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("{USAGE}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse::<tracing_subscriber::filter::Directive>()?))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let cfg_path = arg(&args, 0)?;
    let command = arg(&args, 1)?;
    let cfg = BoardConfig::load(cfg_path).with_context(|| format!("load config {cfg_path}"))?;

    if command == "tripcode" {
        let nt = name_and_tripcode(arg(&args, 2)?, cfg.tripcode_salt.as_deref())?;
        println!("name={}", nt.name);
        println!("trip={}", nt.trip);
        return Ok(());
    }

    let ctx = Context::open(cfg)?;
    let lifecycle = Lifecycle::new(ctx.clone());

    match command {
        "provision" => {
            let name = arg(&args, 2)?;
            let summary = args.get(3).map(String::as_str).unwrap_or_default();
            let actor = Actor::board(ctx.domain(), name, summary);
            let record = KeyStore::new(&ctx)?.provision_actor(&actor)?;
            println!("actor={}", actor.id);
            println!("key_id={}", record.id);
            println!("public_key={}", record.file.display());
        }
        "recover-key" => {
            let name = arg(&args, 2)?;
            let keys = KeyStore::new(&ctx)?;
            let actor = keys
                .actor_by_name(name)?
                .ok_or_else(|| anyhow!("no local actor named {name}"))?;
            let path = keys.recover_public_key(&actor.key_id())?;
            println!("public_key={}", path.display());
        }
        "sticky" => println!("{:?}", lifecycle.mark_sticky(arg(&args, 2)?, arg(&args, 3)?)?),
        "lock" => println!("{:?}", lifecycle.mark_locked(arg(&args, 2)?, arg(&args, 3)?)?),
        "tombstone" => println!("{:?}", lifecycle.tombstone(arg(&args, 2)?)?),
        "tombstone-thread" => println!("{:?}", lifecycle.tombstone_thread(arg(&args, 2)?)?),
        "delete" => println!("{:?}", lifecycle.delete(arg(&args, 2)?)?),
        "delete-all" => {
            let client = reqwest::Client::builder()
                .timeout(ctx.cfg.http_timeout())
                .build()
                .context("build http client")?;
            let keys = KeyStore::new(&ctx)?;
            let graph = FederatedGraph::new(LocalGraph::new(ctx.db.clone()), HttpGraph::new(client.clone()));
            let fed = Federation::new(
                lifecycle,
                keys.clone(),
                Arc::new(graph),
                Arc::new(HttpDelivery::new(client.clone(), keys)),
                KeyResolver::new(client),
            );
            println!("{:?}", fed.delete_all(arg(&args, 2)?).await?);
        }
        other => return Err(anyhow!("unknown command {other:?}\n{USAGE}")),
    }
    Ok(())
}
