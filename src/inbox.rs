//! Per-activity-type inbox state machine
//!
//! [InboxHandler::receive] is called after transport-level verification has
//! bound the activity to its `actor` field. It appends the activity to the
//! recipient's inbox (deduplicated by activity id, so a second receipt is a
//! no-op), then dispatches on the type tag. Unknown types are stored without
//! side effects. Handlers return results instead of panicking or unwinding,
//! so the shared inbox can fan out to many recipients independently.

use crate::{
    builder::ActivityFactory,
    config::FederationConfig,
    custom_collections::{parse_collection_uri, CollectionKind},
    delivery::Dispatcher,
    error::Error,
    keys::resolve_actor,
    protocol::{
        activity::{Activity, ActivityKind},
        actor::ApActor,
        object::{ApObject, ObjectKind},
    },
    storage::{ActorRecord, Stores},
};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

/// Applies received activities to local state
#[derive(Clone)]
pub struct InboxHandler {
    config: FederationConfig,
    stores: Stores,
    dispatcher: Dispatcher,
}

impl InboxHandler {
    /// A handler over the given repositories
    pub fn new(config: FederationConfig, stores: Stores) -> Self {
        let dispatcher = Dispatcher::new(config.clone(), stores.clone());
        InboxHandler {
            config,
            stores,
            dispatcher,
        }
    }

    /// Receive a verified activity addressed to the local actor `username`.
    ///
    /// The caller guarantees that the HTTP signature was valid and belongs
    /// to `activity.actor`.
    pub async fn receive(&self, username: &str, activity: Activity) -> Result<(), Error> {
        let recipient = self
            .stores
            .actors
            .get_by_username(username)
            .await?
            .ok_or(Error::NotFound)?;
        activity.require_id()?;

        if self
            .stores
            .follows
            .is_blocked(&recipient.uri, &activity.actor)
            .await?
        {
            debug!(
                "dropping activity from {} blocked by {}",
                activity.actor, username
            );
            return Ok(());
        }

        let fresh = self.stores.activities.add_inbox(username, &activity).await?;
        if !fresh {
            debug!("duplicate activity {:?}, ignoring", activity.id);
            return Ok(());
        }

        match activity.kind {
            ActivityKind::Create => self.receive_create(&activity).await,
            ActivityKind::Follow => self.receive_follow(&recipient, &activity).await,
            ActivityKind::Accept => self.receive_accept(&recipient, &activity).await,
            ActivityKind::Reject => self.receive_reject(&recipient, &activity).await,
            ActivityKind::Undo => self.receive_undo(&recipient, &activity).await,
            ActivityKind::Like => self.receive_like(&activity).await,
            ActivityKind::Announce => self.receive_announce(&activity).await,
            ActivityKind::Delete => self.receive_delete(&activity).await,
            ActivityKind::Update => self.receive_update(&activity).await,
            ActivityKind::Add => self.receive_add(&recipient, &activity, true).await,
            ActivityKind::Remove => self.receive_add(&recipient, &activity, false).await,
            ActivityKind::Block => self.receive_block(&activity).await,
            ActivityKind::TentativeAccept | ActivityKind::Other(_) => Ok(()),
        }
    }

    async fn receive_create(&self, activity: &Activity) -> Result<(), Error> {
        let Some(value) = activity.embedded_object() else {
            debug!("Create without embedded object, nothing to persist");
            return Ok(());
        };
        let mut object: ApObject = serde_json::from_value(value.clone())?;
        if object.id.is_none() {
            return Err(Error::other(anyhow::anyhow!("created object has no id")));
        }

        self.rewrite_local_attachments(&mut object);

        if let Some(parent) = object.in_reply_to.clone() {
            self.stores
                .activities
                .add_reply(&parent, activity.require_id()?)
                .await?;
        }
        self.stores.activities.save_object(object).await?;
        Ok(())
    }

    /// Attachment URLs which point into local blob storage are rewritten to
    /// their canonical form so stored objects never leak internal addresses.
    fn rewrite_local_attachments(&self, object: &mut ApObject) {
        for attachment in &mut object.attachment {
            if let Some((username, blob_id)) = self.stores.blobs.parse_url(&attachment.url) {
                if let Ok(canonical) = self.stores.blobs.url(&username, &blob_id) {
                    attachment.url = canonical;
                }
            }
        }
    }

    async fn receive_follow(
        &self,
        recipient: &ActorRecord,
        activity: &Activity,
    ) -> Result<(), Error> {
        if activity.object_id().as_ref() != Some(&recipient.uri) {
            warn!(
                "Follow delivered to {} but targets {:?}",
                recipient.preferred_username,
                activity.object_id()
            );
            return Ok(());
        }

        let username = &recipient.preferred_username;
        if recipient.manually_approves_followers {
            self.stores
                .follows
                .add_pending_follow(username, activity.clone())
                .await?;
            debug!("stored pending follow for {}", username);
            return Ok(());
        }

        self.stores
            .follows
            .add_follower(username, &activity.actor)
            .await?;

        // answer with an Accept, which also lands in our outbox
        let factory = ActivityFactory::new(self.config.base_url().clone(), username)?;
        let accept = factory.accept(activity);
        self.stores.activities.add_outbox(username, &accept).await?;

        let follower = resolve_actor(&self.config, &self.stores.actors, &activity.actor).await?;
        self.dispatcher
            .dispatch(&accept, &recipient.uri, username, vec![follower.inbox])
            .await?;
        Ok(())
    }

    async fn receive_accept(
        &self,
        recipient: &ActorRecord,
        activity: &Activity,
    ) -> Result<(), Error> {
        let Some(follow) = self.inner_activity(activity).await? else {
            debug!("Accept without resolvable object, ignoring");
            return Ok(());
        };
        if follow.kind != ActivityKind::Follow {
            return Ok(());
        }
        // only the actor we asked to follow may accept
        if follow.object_id().as_ref() != Some(&activity.actor) {
            warn!("Accept from {} for a follow of someone else", activity.actor);
            return Ok(());
        }
        if follow.actor != recipient.uri {
            return Ok(());
        }
        self.stores
            .follows
            .add_following(&recipient.preferred_username, &activity.actor)
            .await?;
        Ok(())
    }

    async fn receive_reject(
        &self,
        recipient: &ActorRecord,
        activity: &Activity,
    ) -> Result<(), Error> {
        let Some(follow) = self.inner_activity(activity).await? else {
            return Ok(());
        };
        if follow.kind != ActivityKind::Follow || follow.actor != recipient.uri {
            return Ok(());
        }
        // drop the optimistic edge recorded at submission; not surfaced to
        // the user
        self.stores
            .follows
            .remove_following(&recipient.preferred_username, &activity.actor)
            .await?;
        Ok(())
    }

    async fn receive_undo(
        &self,
        recipient: &ActorRecord,
        activity: &Activity,
    ) -> Result<(), Error> {
        let Some(inner) = self.inner_activity(activity).await? else {
            debug!("Undo without resolvable object, ignoring");
            return Ok(());
        };
        if inner.actor != activity.actor {
            warn!(
                "Undo by {} of an activity by {}, dropping",
                activity.actor, inner.actor
            );
            return Ok(());
        }

        match inner.kind {
            ActivityKind::Follow => {
                let username = &recipient.preferred_username;
                self.stores
                    .follows
                    .remove_follower(username, &activity.actor)
                    .await?;
                self.stores
                    .follows
                    .remove_following(username, &activity.actor)
                    .await?;
            }
            ActivityKind::Like => {
                if let Some(object) = inner.object_id() {
                    self.stores
                        .activities
                        .remove_like(&object, &activity.actor)
                        .await?;
                    self.stores
                        .activities
                        .remove_actor_liked(&activity.actor, &object)
                        .await?;
                }
            }
            ActivityKind::Announce => {
                if let Some(object) = inner.object_id() {
                    self.stores
                        .activities
                        .remove_share(&object, &activity.actor)
                        .await?;
                    self.stores
                        .activities
                        .remove_actor_shared(&activity.actor, &object)
                        .await?;
                }
            }
            ActivityKind::Block => {
                if let Some(blocked) = inner.object_id() {
                    self.stores
                        .follows
                        .remove_block(&activity.actor, &blocked)
                        .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn receive_like(&self, activity: &Activity) -> Result<(), Error> {
        let Some(object) = activity.object_id() else {
            return Ok(());
        };
        self.stores
            .activities
            .add_like(&object, &activity.actor, activity.require_id()?)
            .await?;
        self.stores
            .activities
            .add_actor_liked(&activity.actor, &object)
            .await?;
        Ok(())
    }

    async fn receive_announce(&self, activity: &Activity) -> Result<(), Error> {
        let Some(object) = activity.object_id() else {
            return Ok(());
        };
        self.stores
            .activities
            .add_share(&object, &activity.actor, activity.require_id()?)
            .await?;
        self.stores
            .activities
            .add_actor_shared(&activity.actor, &object)
            .await?;
        Ok(())
    }

    async fn receive_delete(&self, activity: &Activity) -> Result<(), Error> {
        let Some(object_uri) = activity.object_id() else {
            return Ok(());
        };
        match self.stores.activities.object(&object_uri).await? {
            Some(existing) => {
                if existing.attributed_to.as_ref() != Some(&activity.actor) {
                    warn!(
                        "Delete of {} by non-owner {}, dropping",
                        object_uri, activity.actor
                    );
                    return Ok(());
                }
                self.stores
                    .activities
                    .save_object(tombstone_of(&object_uri, Some(&existing)))
                    .await?;
            }
            // Deletes of objects we never stored still leave a tombstone, so
            // later fetches answer consistently.
            None => {
                self.stores
                    .activities
                    .save_object(tombstone_of(&object_uri, None))
                    .await?;
            }
        }
        Ok(())
    }

    async fn receive_update(&self, activity: &Activity) -> Result<(), Error> {
        let Some(value) = activity.embedded_object() else {
            return Ok(());
        };

        // actor documents update the actor record, anything else the object
        // store; both require the sender to own the target
        if is_actor_document(value) {
            let document: ApActor = serde_json::from_value(value.clone())?;
            if document.id != activity.actor {
                warn!("Update of actor {} by {}", document.id, activity.actor);
                return Ok(());
            }
            if let Some(mut existing) = self.stores.actors.get_by_uri(&document.id).await? {
                if existing.local {
                    // local actors are only mutated through the admin
                    // back-channel
                    return Ok(());
                }
                let replacement = crate::storage::ActorRecord::from_document(document);
                existing.display_name = replacement.display_name;
                existing.summary = replacement.summary;
                existing.public_key = replacement.public_key;
                existing.manually_approves_followers = replacement.manually_approves_followers;
                existing.extensions = replacement.extensions;
                self.stores.actors.save(existing).await?;
            }
            return Ok(());
        }

        let object: ApObject = serde_json::from_value(value.clone())?;
        let Some(object_id) = object.id.clone() else {
            return Ok(());
        };
        if let Some(existing) = self.stores.activities.object(&object_id).await? {
            if existing.attributed_to.as_ref() != Some(&activity.actor) {
                warn!(
                    "Update of {} by non-owner {}, dropping",
                    object_id, activity.actor
                );
                return Ok(());
            }
        }
        if object.attributed_to.as_ref() == Some(&activity.actor) {
            self.stores.activities.save_object(object).await?;
        }
        Ok(())
    }

    async fn receive_add(
        &self,
        recipient: &ActorRecord,
        activity: &Activity,
        add: bool,
    ) -> Result<(), Error> {
        let Some(target) = &activity.target else {
            return Ok(());
        };
        let Some((username, slug)) = parse_collection_uri(&self.config, target) else {
            debug!("Add/Remove target {} is not a local collection", target);
            return Ok(());
        };
        if username != recipient.preferred_username {
            return Ok(());
        }
        // only the collection owner may curate it
        if activity.actor != recipient.uri {
            warn!(
                "Add/Remove on {}'s collection by {}, dropping",
                username, activity.actor
            );
            return Ok(());
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

    async fn receive_block(&self, activity: &Activity) -> Result<(), Error> {
        let Some(blocked) = activity.object_id() else {
            return Ok(());
        };
        self.stores
            .follows
            .add_block(&activity.actor, &blocked)
            .await?;
        Ok(())
    }

    /// Resolve the `object` of an Undo/Accept/Reject to the original
    /// activity, from the embedded document or the local activity store.
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

fn is_actor_document(value: &Value) -> bool {
    matches!(
        value.get("type").and_then(Value::as_str),
        Some("Person" | "Application" | "Service" | "Group" | "Organization")
    )
}

fn tombstone_of(object_uri: &Url, existing: Option<&ApObject>) -> ApObject {
    let mut extra = serde_json::Map::new();
    if let Some(existing) = existing {
        extra.insert(
            "formerType".to_string(),
            Value::String(existing.kind.as_str().to_string()),
        );
    }
    extra.insert(
        "deleted".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    ApObject {
        id: Some(object_uri.clone()),
        kind: ObjectKind::Tombstone,
        attributed_to: existing.and_then(|o| o.attributed_to.clone()),
        content: None,
        media_type: None,
        name: None,
        summary: None,
        url: None,
        attachment: vec![],
        tag: vec![],
        in_reply_to: None,
        published: existing.and_then(|o| o.published),
        to: vec![],
        cc: vec![],
        extra,
    }
}
