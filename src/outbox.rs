//! Outbox handling: id assignment, local side effects, delivery fan-out
//!
//! An authenticated local actor POSTs an activity; the handler assigns ids
//! where missing, persists it, applies the side effects for which the local
//! actor is the subject (so a Follow shows up in the following set before
//! the Accept arrives), expands addressing into target inboxes and enqueues
//! one delivery per target.

use crate::{
    config::FederationConfig,
    custom_collections::{parse_collection_uri, CollectionKind},
    delivery::{expand_targets, Dispatcher},
    error::Error,
    protocol::{
        activity::{Activity, ActivityKind, IdOrObject},
        object::{ApObject, ObjectKind},
    },
    storage::{ActorRecord, Stores},
};
use chrono::Utc;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, warn};
#[cfg(test)]
use url::Url;

/// Applies locally submitted activities and fans out delivery
#[derive(Clone)]
pub struct OutboxHandler {
    config: FederationConfig,
    stores: Stores,
    dispatcher: Dispatcher,
    counter: Arc<AtomicU64>,
}

impl OutboxHandler {
    /// A handler over the given repositories
    pub fn new(config: FederationConfig, stores: Stores) -> Self {
        let dispatcher = Dispatcher::new(config.clone(), stores.clone());
        OutboxHandler {
            config,
            stores,
            dispatcher,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Accept an activity from the authenticated local actor `username`.
    ///
    /// Returns the activity as persisted, with server-assigned ids.
    pub async fn submit(&self, username: &str, mut activity: Activity) -> Result<Activity, Error> {
        let sender = self
            .stores
            .actors
            .get_by_username(username)
            .await?
            .ok_or(Error::NotFound)?;
        if activity.actor != sender.uri {
            return Err(Error::ActorMismatch);
        }

        self.assign_ids(username, &mut activity);
        if activity.published.is_none() {
            activity.published = Some(Utc::now());
        }

        let fresh = self
            .stores
            .activities
            .add_outbox(username, &activity)
            .await?;
        if !fresh {
            debug!("duplicate outbox submission {:?}", activity.id);
            return Ok(activity);
        }

        self.apply_local_effects(&sender, &activity).await?;

        let targets = expand_targets(&self.config, &self.stores, &activity, &sender).await?;
        self.dispatcher
            .dispatch(&activity, &sender.uri, username, targets)
            .await?;
        Ok(activity)
    }

    /// Synthesize ids for the activity and an id-less wrapped object, in the
    /// actor's namespace
    fn assign_ids(&self, username: &str, activity: &mut Activity) {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let seconds = Utc::now().timestamp();

        if activity.id.is_none() {
            activity.id = self
                .config
                .base_url()
                .join(&format!(
                    "activities/{}-{}-{}",
                    activity.kind.as_str().to_lowercase(),
                    seconds,
                    counter
                ))
                .ok();
        }

        if let Some(IdOrObject::Object(value)) = &mut activity.object {
            if let Some(map) = value.as_object_mut() {
                if !map.contains_key("id") {
                    if let Ok(object_id) = self.config.base_url().join(&format!(
                        "users/{}/objects/{}-{}",
                        username, seconds, counter
                    )) {
                        map.insert("id".to_string(), Value::String(object_id.into()));
                    }
                }
            }
        }
    }

    /// Side effects for which the submitting actor is the subject
    async fn apply_local_effects(
        &self,
        sender: &ActorRecord,
        activity: &Activity,
    ) -> Result<(), Error> {
        let username = &sender.preferred_username;
        match &activity.kind {
            ActivityKind::Create => self.effect_create(activity).await,
            ActivityKind::Follow => {
                if let Some(target) = activity.object_id() {
                    // recorded immediately so the UI reflects the follow
                    // before the Accept arrives
                    self.stores.follows.add_following(username, &target).await?;
                }
                Ok(())
            }
            ActivityKind::Accept => {
                // accepting a pending follow request
                let Some(follow) = self.inner_activity(activity).await? else {
                    return Ok(());
                };
                if follow.kind != ActivityKind::Follow {
                    return Ok(());
                }
                if let Some(id) = &follow.id {
                    self.stores.follows.take_pending_follow(username, id).await?;
                }
                self.stores
                    .follows
                    .add_follower(username, &follow.actor)
                    .await?;
                Ok(())
            }
            ActivityKind::Reject => {
                let Some(follow) = self.inner_activity(activity).await? else {
                    return Ok(());
                };
                if let Some(id) = &follow.id {
                    self.stores.follows.take_pending_follow(username, id).await?;
                }
                Ok(())
            }
            ActivityKind::Undo => self.effect_undo(sender, activity).await,
            ActivityKind::Like => {
                if let Some(object) = activity.object_id() {
                    self.stores
                        .activities
                        .add_actor_liked(&sender.uri, &object)
                        .await?;
                    self.stores
                        .activities
                        .add_like(&object, &sender.uri, activity.require_id()?)
                        .await?;
                }
                Ok(())
            }
            ActivityKind::Announce => {
                if let Some(object) = activity.object_id() {
                    self.stores
                        .activities
                        .add_actor_shared(&sender.uri, &object)
                        .await?;
                    self.stores
                        .activities
                        .add_share(&object, &sender.uri, activity.require_id()?)
                        .await?;
                }
                Ok(())
            }
            ActivityKind::Delete => {
                let Some(object_uri) = activity.object_id() else {
                    return Ok(());
                };
                if let Some(existing) = self.stores.activities.object(&object_uri).await? {
                    if existing.attributed_to.as_ref() == Some(&sender.uri) {
                        let mut tombstone = existing.clone();
                        tombstone.kind = ObjectKind::Tombstone;
                        tombstone.content = None;
                        tombstone.attachment.clear();
                        tombstone.extra.insert(
                            "deleted".to_string(),
                            Value::String(Utc::now().to_rfc3339()),
                        );
                        self.stores.activities.save_object(tombstone).await?;
                    }
                }
                Ok(())
            }
            ActivityKind::Update => {
                let Some(value) = activity.embedded_object() else {
                    return Ok(());
                };
                let object: ApObject = serde_json::from_value(value.clone())?;
                if object.attributed_to.as_ref() == Some(&sender.uri) {
                    self.stores.activities.save_object(object).await?;
                }
                Ok(())
            }
            ActivityKind::Add => self.effect_collection(sender, activity, true).await,
            ActivityKind::Remove => self.effect_collection(sender, activity, false).await,
            ActivityKind::Block => {
                if let Some(blocked) = activity.object_id() {
                    self.stores.follows.add_block(&sender.uri, &blocked).await?;
                }
                Ok(())
            }
            ActivityKind::TentativeAccept | ActivityKind::Other(_) => Ok(()),
        }
    }

    async fn effect_create(&self, activity: &Activity) -> Result<(), Error> {
        let Some(value) = activity.embedded_object() else {
            return Ok(());
        };
        let object: ApObject = serde_json::from_value(value.clone())?;
        if let Some(parent) = object.in_reply_to.clone() {
            self.stores
                .activities
                .add_reply(&parent, activity.require_id()?)
                .await?;
        }
        self.stores.activities.save_object(object).await?;
        Ok(())
    }

    async fn effect_undo(&self, sender: &ActorRecord, activity: &Activity) -> Result<(), Error> {
        let Some(inner) = self.inner_activity(activity).await? else {
            return Ok(());
        };
        if inner.actor != sender.uri {
            warn!("outbox Undo of an activity by someone else, dropping effects");
            return Ok(());
        }
        let username = &sender.preferred_username;
        match inner.kind {
            ActivityKind::Follow => {
                if let Some(target) = inner.object_id() {
                    self.stores.follows.remove_following(username, &target).await?;
                }
            }
            ActivityKind::Like => {
                if let Some(object) = inner.object_id() {
                    self.stores
                        .activities
                        .remove_actor_liked(&sender.uri, &object)
                        .await?;
                    self.stores
                        .activities
                        .remove_like(&object, &sender.uri)
                        .await?;
                }
            }
            ActivityKind::Announce => {
                if let Some(object) = inner.object_id() {
                    self.stores
                        .activities
                        .remove_actor_shared(&sender.uri, &object)
                        .await?;
                    self.stores
                        .activities
                        .remove_share(&object, &sender.uri)
                        .await?;
                }
            }
            ActivityKind::Block => {
                if let Some(blocked) = inner.object_id() {
                    self.stores.follows.remove_block(&sender.uri, &blocked).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn effect_collection(
        &self,
        sender: &ActorRecord,
        activity: &Activity,
        add: bool,
    ) -> Result<(), Error> {
        let Some(target) = &activity.target else {
            return Ok(());
        };
        let Some((username, slug)) = parse_collection_uri(&self.config, target) else {
            return Ok(());
        };
        if username != sender.preferred_username {
            return Err(Error::CollectionPrivate);
        }
        let definition = self
            .stores
            .collections
            .definition(&username, &slug)
            .await?
            .ok_or(Error::NotFound)?;
        if definition.kind == CollectionKind::Query {
            return Err(Error::QueryCollectionReadOnly);
        }
        let Some(object) = activity.object_id() else {
            return Ok(());
        };
        if add {
            self.stores
                .collections
                .add_item(&username, &slug, &object)
                .await?;
        } else {
            self.stores
                .collections
                .remove_item(&username, &slug, &object)
                .await?;
        }
        Ok(())
    }

    async fn inner_activity(&self, activity: &Activity) -> Result<Option<Activity>, Error> {
        if let Some(inner) = activity.embedded_activity() {
            return Ok(Some(inner));
        }
        match activity.object_id() {
            Some(id) => self.stores.activities.activity(&id).await,
            None => Ok(None),
        }
    }
}
