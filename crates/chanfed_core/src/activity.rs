/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use chanfed_protocol::{Activity, ActivityType, Actor, ActorRef, ObjectBase, ObjectRef, AS_CONTEXT};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashSet;

pub fn new_activity_id(base_actor: &str) -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    let suffix: String = b.iter().map(|v| format!("{v:02x}")).collect();
    format!("{}/activities/{suffix}", base_actor.trim_end_matches('/'))
}

/// Wraps `obj` into a `verb` activity from `actor`. `to`/`cc` are copied from the
/// object, deduplicated, and never list the actor or the object's author.
pub fn build_activity(verb: ActivityType, obj: &ObjectBase, actor: &Actor) -> Activity {
    let excluded = [actor.id.as_str(), obj.actor.as_str()];
    Activity {
        context: Some(serde_json::Value::String(AS_CONTEXT.to_string())),
        ty: verb.as_str().to_string(),
        id: new_activity_id(&actor.id),
        actor: Some(ActorRef::Actor(Box::new(actor.clone()))),
        name: String::new(),
        summary: String::new(),
        to: audience(obj.to.iter().map(String::as_str), &excluded),
        cc: audience(obj.cc.iter().map(String::as_str), &excluded),
        published: obj.published,
        object: Some(ObjectRef::Object(Box::new(obj.clone()))),
    }
}

/// Appends `recipients` to `to`, keeping the audience deduplicated and self-excluded.
pub fn add_recipients<'a>(activity: &mut Activity, recipients: impl IntoIterator<Item = &'a str>) {
    let actor = activity.actor_id().to_string();
    let mut to = std::mem::take(&mut activity.to);
    to.extend(recipients.into_iter().map(str::to_string));
    activity.to = audience(to.iter().map(String::as_str), &[actor.as_str()]);
    let to_set: HashSet<&str> = activity.to.iter().map(String::as_str).collect();
    activity.cc.retain(|c| !to_set.contains(c.as_str()));
}

fn audience<'a>(items: impl Iterator<Item = &'a str>, excluded: &[&str]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let item = item.trim();
        if item.is_empty() || excluded.contains(&item) || !seen.insert(item) {
            continue;
        }
        out.push(item.to_string());
    }
    out
}
