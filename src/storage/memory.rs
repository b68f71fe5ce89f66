//! In-memory repositories for tests and demos
//!
//! Every store keeps its data behind a `std::sync::Mutex` held only for the
//! duration of the map access, never across await points. The delivery
//! store's claim is done under a single lock acquisition, which provides the
//! atomic Pending to Processing transition the worker relies on.

use crate::{
    custom_collections::CollectionDefinition,
    error::Error,
    protocol::{activity::Activity, object::ApObject},
    storage::{
        ActivityStore, ActorRecord, ActorStore, Blob, BlobStore, CollectionStore, DeliveryItem,
        DeliveryStatus, DeliveryStore, FollowStore,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};
use url::Url;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("lock poisoned")
}

fn page<T: Clone>(entries: &[T], limit: u64, offset: u64) -> Vec<T> {
    entries
        .iter()
        .rev()
        .skip(offset as usize)
        .take(limit as usize)
        .cloned()
        .collect()
}

/// Actor storage backed by a vector
#[derive(Default)]
pub struct InMemoryActorStore {
    actors: Mutex<Vec<ActorRecord>>,
}

#[async_trait]
impl ActorStore for InMemoryActorStore {
    async fn get_by_username(&self, username: &str) -> Result<Option<ActorRecord>, Error> {
        let actors = lock(&self.actors);
        Ok(actors
            .iter()
            .find(|a| a.local && a.preferred_username == username)
            .cloned())
    }

    async fn get_by_uri(&self, uri: &Url) -> Result<Option<ActorRecord>, Error> {
        let actors = lock(&self.actors);
        Ok(actors.iter().find(|a| &a.uri == uri).cloned())
    }

    async fn save(&self, actor: ActorRecord) -> Result<(), Error> {
        let mut actors = lock(&self.actors);
        match actors.iter_mut().find(|a| a.uri == actor.uri) {
            Some(existing) => *existing = actor,
            None => actors.push(actor),
        }
        Ok(())
    }

    async fn delete(&self, username: &str) -> Result<(), Error> {
        let mut actors = lock(&self.actors);
        actors.retain(|a| !(a.local && a.preferred_username == username));
        Ok(())
    }

    async fn count_local(&self) -> Result<u64, Error> {
        let actors = lock(&self.actors);
        Ok(actors.iter().filter(|a| a.local).count() as u64)
    }
}

/// Activity and object storage backed by hash maps
#[derive(Default)]
pub struct InMemoryActivityStore {
    inboxes: Mutex<HashMap<String, Vec<Activity>>>,
    outboxes: Mutex<HashMap<String, Vec<Activity>>>,
    activities: Mutex<HashMap<String, Activity>>,
    objects: Mutex<Vec<ApObject>>,
    replies: Mutex<HashMap<String, Vec<Url>>>,
    likes: Mutex<HashMap<String, Vec<(Url, Url)>>>,
    shares: Mutex<HashMap<String, Vec<(Url, Url)>>>,
    actor_liked: Mutex<HashMap<String, Vec<Url>>>,
    actor_shared: Mutex<HashMap<String, Vec<Url>>>,
}

impl InMemoryActivityStore {
    fn append(
        boxes: &Mutex<HashMap<String, Vec<Activity>>>,
        index: &Mutex<HashMap<String, Activity>>,
        username: &str,
        activity: &Activity,
    ) -> Result<bool, Error> {
        let id = activity.require_id()?.to_string();
        let mut boxes = lock(boxes);
        let entries = boxes.entry(username.to_string()).or_default();
        if entries
            .iter()
            .any(|a| a.id.as_ref().map(Url::as_str) == Some(id.as_str()))
        {
            return Ok(false);
        }
        entries.push(activity.clone());
        lock(index).insert(id, activity.clone());
        Ok(true)
    }

    fn add_edge(
        edges: &Mutex<HashMap<String, Vec<(Url, Url)>>>,
        object: &Url,
        actor: &Url,
        activity: &Url,
    ) -> bool {
        let mut edges = lock(edges);
        let entries = edges.entry(object.to_string()).or_default();
        if entries.iter().any(|(a, _)| a == actor) {
            return false;
        }
        entries.push((actor.clone(), activity.clone()));
        true
    }

    fn remove_edge(
        edges: &Mutex<HashMap<String, Vec<(Url, Url)>>>,
        object: &Url,
        actor: &Url,
    ) -> bool {
        let mut edges = lock(edges);
        let Some(entries) = edges.get_mut(object.as_str()) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(a, _)| a != actor);
        entries.len() < before
    }

    fn edge_activities(
        edges: &Mutex<HashMap<String, Vec<(Url, Url)>>>,
        object: &Url,
        limit: u64,
        offset: u64,
    ) -> Vec<Url> {
        let edges = lock(edges);
        let entries: Vec<Url> = edges
            .get(object.as_str())
            .map(|e| e.iter().map(|(_, activity)| activity.clone()).collect())
            .unwrap_or_default();
        page(&entries, limit, offset)
    }

    fn edge_count(edges: &Mutex<HashMap<String, Vec<(Url, Url)>>>, object: &Url) -> u64 {
        lock(edges)
            .get(object.as_str())
            .map(|e| e.len() as u64)
            .unwrap_or(0)
    }

    fn add_membership(
        memberships: &Mutex<HashMap<String, Vec<Url>>>,
        actor: &Url,
        object: &Url,
    ) -> bool {
        let mut memberships = lock(memberships);
        let entries = memberships.entry(actor.to_string()).or_default();
        if entries.contains(object) {
            return false;
        }
        entries.push(object.clone());
        true
    }

    fn remove_membership(
        memberships: &Mutex<HashMap<String, Vec<Url>>>,
        actor: &Url,
        object: &Url,
    ) -> bool {
        let mut memberships = lock(memberships);
        let Some(entries) = memberships.get_mut(actor.as_str()) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|o| o != object);
        entries.len() < before
    }
}

#[async_trait]
impl ActivityStore for InMemoryActivityStore {
    async fn add_inbox(&self, username: &str, activity: &Activity) -> Result<bool, Error> {
        Self::append(&self.inboxes, &self.activities, username, activity)
    }

    async fn add_outbox(&self, username: &str, activity: &Activity) -> Result<bool, Error> {
        Self::append(&self.outboxes, &self.activities, username, activity)
    }

    async fn inbox(&self, username: &str, limit: u64, offset: u64) -> Result<Vec<Activity>, Error> {
        let inboxes = lock(&self.inboxes);
        Ok(page(
            inboxes.get(username).map(Vec::as_slice).unwrap_or(&[]),
            limit,
            offset,
        ))
    }

    async fn outbox(
        &self,
        username: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Activity>, Error> {
        let outboxes = lock(&self.outboxes);
        Ok(page(
            outboxes.get(username).map(Vec::as_slice).unwrap_or(&[]),
            limit,
            offset,
        ))
    }

    async fn inbox_count(&self, username: &str) -> Result<u64, Error> {
        Ok(lock(&self.inboxes)
            .get(username)
            .map(|v| v.len() as u64)
            .unwrap_or(0))
    }

    async fn outbox_count(&self, username: &str) -> Result<u64, Error> {
        Ok(lock(&self.outboxes)
            .get(username)
            .map(|v| v.len() as u64)
            .unwrap_or(0))
    }

    async fn activity(&self, id: &Url) -> Result<Option<Activity>, Error> {
        Ok(lock(&self.activities).get(id.as_str()).cloned())
    }

    async fn save_object(&self, object: ApObject) -> Result<(), Error> {
        let mut objects = lock(&self.objects);
        match objects.iter_mut().find(|o| o.id == object.id) {
            Some(existing) => *existing = object,
            None => objects.push(object),
        }
        Ok(())
    }

    async fn object(&self, id: &Url) -> Result<Option<ApObject>, Error> {
        let objects = lock(&self.objects);
        Ok(objects
            .iter()
            .find(|o| o.id.as_ref() == Some(id))
            .cloned())
    }

    async fn objects_by_actor(&self, actor: &Url) -> Result<Vec<ApObject>, Error> {
        let objects = lock(&self.objects);
        let mut owned: Vec<ApObject> = objects
            .iter()
            .filter(|o| o.attributed_to.as_ref() == Some(actor))
            .cloned()
            .collect();
        owned.reverse();
        Ok(owned)
    }

    async fn add_reply(&self, object: &Url, reply: &Url) -> Result<bool, Error> {
        let mut replies = lock(&self.replies);
        let entries = replies.entry(object.to_string()).or_default();
        if entries.contains(reply) {
            return Ok(false);
        }
        entries.push(reply.clone());
        Ok(true)
    }

    async fn replies(&self, object: &Url, limit: u64, offset: u64) -> Result<Vec<Url>, Error> {
        let replies = lock(&self.replies);
        Ok(page(
            replies.get(object.as_str()).map(Vec::as_slice).unwrap_or(&[]),
            limit,
            offset,
        ))
    }

    async fn replies_count(&self, object: &Url) -> Result<u64, Error> {
        Ok(lock(&self.replies)
            .get(object.as_str())
            .map(|v| v.len() as u64)
            .unwrap_or(0))
    }

    async fn add_like(&self, object: &Url, actor: &Url, activity: &Url) -> Result<bool, Error> {
        Ok(Self::add_edge(&self.likes, object, actor, activity))
    }

    async fn remove_like(&self, object: &Url, actor: &Url) -> Result<bool, Error> {
        Ok(Self::remove_edge(&self.likes, object, actor))
    }

    async fn likes(&self, object: &Url, limit: u64, offset: u64) -> Result<Vec<Url>, Error> {
        Ok(Self::edge_activities(&self.likes, object, limit, offset))
    }

    async fn likes_count(&self, object: &Url) -> Result<u64, Error> {
        Ok(Self::edge_count(&self.likes, object))
    }

    async fn add_share(&self, object: &Url, actor: &Url, activity: &Url) -> Result<bool, Error> {
        Ok(Self::add_edge(&self.shares, object, actor, activity))
    }

    async fn remove_share(&self, object: &Url, actor: &Url) -> Result<bool, Error> {
        Ok(Self::remove_edge(&self.shares, object, actor))
    }

    async fn shares(&self, object: &Url, limit: u64, offset: u64) -> Result<Vec<Url>, Error> {
        Ok(Self::edge_activities(&self.shares, object, limit, offset))
    }

    async fn shares_count(&self, object: &Url) -> Result<u64, Error> {
        Ok(Self::edge_count(&self.shares, object))
    }

    async fn add_actor_liked(&self, actor: &Url, object: &Url) -> Result<bool, Error> {
        Ok(Self::add_membership(&self.actor_liked, actor, object))
    }

    async fn remove_actor_liked(&self, actor: &Url, object: &Url) -> Result<bool, Error> {
        Ok(Self::remove_membership(&self.actor_liked, actor, object))
    }

    async fn actor_liked(&self, actor: &Url, limit: u64, offset: u64) -> Result<Vec<Url>, Error> {
        let liked = lock(&self.actor_liked);
        Ok(page(
            liked.get(actor.as_str()).map(Vec::as_slice).unwrap_or(&[]),
            limit,
            offset,
        ))
    }

    async fn actor_liked_count(&self, actor: &Url) -> Result<u64, Error> {
        Ok(lock(&self.actor_liked)
            .get(actor.as_str())
            .map(|v| v.len() as u64)
            .unwrap_or(0))
    }

    async fn add_actor_shared(&self, actor: &Url, object: &Url) -> Result<bool, Error> {
        Ok(Self::add_membership(&self.actor_shared, actor, object))
    }

    async fn remove_actor_shared(&self, actor: &Url, object: &Url) -> Result<bool, Error> {
        Ok(Self::remove_membership(&self.actor_shared, actor, object))
    }

    async fn actor_shared(&self, actor: &Url, limit: u64, offset: u64) -> Result<Vec<Url>, Error> {
        let shared = lock(&self.actor_shared);
        Ok(page(
            shared.get(actor.as_str()).map(Vec::as_slice).unwrap_or(&[]),
            limit,
            offset,
        ))
    }

    async fn actor_shared_count(&self, actor: &Url) -> Result<u64, Error> {
        Ok(lock(&self.actor_shared)
            .get(actor.as_str())
            .map(|v| v.len() as u64)
            .unwrap_or(0))
    }
}

/// Follow, pending-follow and block storage
#[derive(Default)]
pub struct InMemoryFollowStore {
    followers: Mutex<HashMap<String, Vec<Url>>>,
    following: Mutex<HashMap<String, Vec<Url>>>,
    pending: Mutex<HashMap<String, Vec<Activity>>>,
    blocks: Mutex<Vec<(Url, Url)>>,
}

impl InMemoryFollowStore {
    fn add(edges: &Mutex<HashMap<String, Vec<Url>>>, username: &str, remote: &Url) -> bool {
        let mut edges = lock(edges);
        let entries = edges.entry(username.to_string()).or_default();
        if entries.contains(remote) {
            return false;
        }
        entries.push(remote.clone());
        true
    }

    fn remove(edges: &Mutex<HashMap<String, Vec<Url>>>, username: &str, remote: &Url) -> bool {
        let mut edges = lock(edges);
        let Some(entries) = edges.get_mut(username) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|u| u != remote);
        entries.len() < before
    }

    fn all(edges: &Mutex<HashMap<String, Vec<Url>>>, username: &str) -> Vec<Url> {
        lock(edges).get(username).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl FollowStore for InMemoryFollowStore {
    async fn add_follower(&self, username: &str, remote: &Url) -> Result<bool, Error> {
        Ok(Self::add(&self.followers, username, remote))
    }

    async fn remove_follower(&self, username: &str, remote: &Url) -> Result<bool, Error> {
        Ok(Self::remove(&self.followers, username, remote))
    }

    async fn followers(&self, username: &str) -> Result<Vec<Url>, Error> {
        Ok(Self::all(&self.followers, username))
    }

    async fn follower_count(&self, username: &str) -> Result<u64, Error> {
        Ok(Self::all(&self.followers, username).len() as u64)
    }

    async fn is_follower(&self, username: &str, remote: &Url) -> Result<bool, Error> {
        Ok(Self::all(&self.followers, username).contains(remote))
    }

    async fn add_following(&self, username: &str, remote: &Url) -> Result<bool, Error> {
        Ok(Self::add(&self.following, username, remote))
    }

    async fn remove_following(&self, username: &str, remote: &Url) -> Result<bool, Error> {
        Ok(Self::remove(&self.following, username, remote))
    }

    async fn following(&self, username: &str) -> Result<Vec<Url>, Error> {
        Ok(Self::all(&self.following, username))
    }

    async fn following_count(&self, username: &str) -> Result<u64, Error> {
        Ok(Self::all(&self.following, username).len() as u64)
    }

    async fn is_following(&self, username: &str, remote: &Url) -> Result<bool, Error> {
        Ok(Self::all(&self.following, username).contains(remote))
    }

    async fn add_pending_follow(&self, username: &str, follow: Activity) -> Result<(), Error> {
        let mut pending = lock(&self.pending);
        let entries = pending.entry(username.to_string()).or_default();
        let id = follow.id.clone();
        if !entries.iter().any(|a| a.id == id) {
            entries.push(follow);
        }
        Ok(())
    }

    async fn take_pending_follow(
        &self,
        username: &str,
        follow_id: &Url,
    ) -> Result<Option<Activity>, Error> {
        let mut pending = lock(&self.pending);
        let Some(entries) = pending.get_mut(username) else {
            return Ok(None);
        };
        let position = entries
            .iter()
            .position(|a| a.id.as_ref() == Some(follow_id));
        Ok(position.map(|i| entries.remove(i)))
    }

    async fn pending_follows(&self, username: &str) -> Result<Vec<Activity>, Error> {
        Ok(lock(&self.pending).get(username).cloned().unwrap_or_default())
    }

    async fn add_block(&self, blocker: &Url, blocked: &Url) -> Result<bool, Error> {
        let mut blocks = lock(&self.blocks);
        if blocks.iter().any(|(a, b)| a == blocker && b == blocked) {
            return Ok(false);
        }
        blocks.push((blocker.clone(), blocked.clone()));
        Ok(true)
    }

    async fn remove_block(&self, blocker: &Url, blocked: &Url) -> Result<bool, Error> {
        let mut blocks = lock(&self.blocks);
        let before = blocks.len();
        blocks.retain(|(a, b)| !(a == blocker && b == blocked));
        Ok(blocks.len() < before)
    }

    async fn is_blocked(&self, blocker: &Url, blocked: &Url) -> Result<bool, Error> {
        let blocks = lock(&self.blocks);
        Ok(blocks.iter().any(|(a, b)| a == blocker && b == blocked))
    }
}

/// Delivery queue backed by a vector. The claim happens under one lock
/// acquisition, so concurrent workers never receive the same item.
#[derive(Default)]
pub struct InMemoryDeliveryStore {
    items: Mutex<Vec<DeliveryItem>>,
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn enqueue(&self, item: DeliveryItem) -> Result<(), Error> {
        lock(&self.items).push(item);
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch: usize,
    ) -> Result<Vec<DeliveryItem>, Error> {
        let mut items = lock(&self.items);
        let mut due: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                matches!(item.status, DeliveryStatus::Pending | DeliveryStatus::Failed)
                    && item.next_attempt_at <= now
            })
            .map(|(index, _)| index)
            .collect();
        due.sort_by_key(|&index| (items[index].next_attempt_at, items[index].created_at));
        due.truncate(batch);

        let mut claimed = Vec::with_capacity(due.len());
        for index in due {
            items[index].status = DeliveryStatus::Processing;
            claimed.push(items[index].clone());
        }
        Ok(claimed)
    }

    async fn update(&self, item: DeliveryItem) -> Result<(), Error> {
        let mut items = lock(&self.items);
        match items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => {
                *existing = item;
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryItem>, Error> {
        Ok(lock(&self.items).iter().find(|i| i.id == id).cloned())
    }

    async fn items_for_activity(&self, activity_id: &Url) -> Result<Vec<DeliveryItem>, Error> {
        Ok(lock(&self.items)
            .iter()
            .filter(|i| &i.activity_id == activity_id)
            .cloned()
            .collect())
    }

    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let mut items = lock(&self.items);
        let before = items.len();
        items.retain(|item| {
            let terminal = matches!(item.status, DeliveryStatus::Delivered | DeliveryStatus::Dead);
            let old = item
                .completed_at
                .map(|completed| completed < cutoff)
                .unwrap_or(false);
            !(terminal && old)
        });
        Ok((before - items.len()) as u64)
    }
}

/// Custom collection storage
#[derive(Default)]
pub struct InMemoryCollectionStore {
    definitions: Mutex<HashMap<String, Vec<CollectionDefinition>>>,
    members: Mutex<HashMap<(String, String), Vec<Url>>>,
}

#[async_trait]
impl CollectionStore for InMemoryCollectionStore {
    async fn save_definition(
        &self,
        username: &str,
        definition: CollectionDefinition,
    ) -> Result<(), Error> {
        let mut definitions = lock(&self.definitions);
        let entries = definitions.entry(username.to_string()).or_default();
        match entries.iter_mut().find(|d| d.slug == definition.slug) {
            Some(existing) => *existing = definition,
            None => entries.push(definition),
        }
        Ok(())
    }

    async fn definition(
        &self,
        username: &str,
        slug: &str,
    ) -> Result<Option<CollectionDefinition>, Error> {
        Ok(lock(&self.definitions)
            .get(username)
            .and_then(|entries| entries.iter().find(|d| d.slug == slug))
            .cloned())
    }

    async fn definitions(&self, username: &str) -> Result<Vec<CollectionDefinition>, Error> {
        Ok(lock(&self.definitions)
            .get(username)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_definition(&self, username: &str, slug: &str) -> Result<(), Error> {
        if let Some(entries) = lock(&self.definitions).get_mut(username) {
            entries.retain(|d| d.slug != slug);
        }
        lock(&self.members).remove(&(username.to_string(), slug.to_string()));
        Ok(())
    }

    async fn add_item(&self, username: &str, slug: &str, object: &Url) -> Result<bool, Error> {
        let mut members = lock(&self.members);
        let entries = members
            .entry((username.to_string(), slug.to_string()))
            .or_default();
        if entries.contains(object) {
            return Ok(false);
        }
        entries.push(object.clone());
        Ok(true)
    }

    async fn remove_item(&self, username: &str, slug: &str, object: &Url) -> Result<bool, Error> {
        let mut members = lock(&self.members);
        let Some(entries) = members.get_mut(&(username.to_string(), slug.to_string())) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|o| o != object);
        Ok(entries.len() < before)
    }

    async fn items(&self, username: &str, slug: &str) -> Result<Vec<Url>, Error> {
        Ok(lock(&self.members)
            .get(&(username.to_string(), slug.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn contains(&self, username: &str, slug: &str, object: &Url) -> Result<bool, Error> {
        Ok(lock(&self.members)
            .get(&(username.to_string(), slug.to_string()))
            .map(|entries| entries.contains(object))
            .unwrap_or(false))
    }
}

/// Blob storage backed by a hash map
pub struct InMemoryBlobStore {
    base_url: Url,
    blobs: Mutex<HashMap<(String, String), Blob>>,
}

impl InMemoryBlobStore {
    /// A blob store whose canonical URLs live under `base_url`
    pub fn new(base_url: Url) -> Self {
        InMemoryBlobStore {
            base_url,
            blobs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn store(
        &self,
        username: &str,
        id: &str,
        media_type: &str,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        lock(&self.blobs).insert(
            (username.to_string(), id.to_string()),
            Blob {
                media_type: media_type.to_string(),
                data,
            },
        );
        Ok(())
    }

    async fn get(&self, username: &str, id: &str) -> Result<Option<Blob>, Error> {
        Ok(lock(&self.blobs)
            .get(&(username.to_string(), id.to_string()))
            .cloned())
    }

    async fn exists(&self, username: &str, id: &str) -> Result<bool, Error> {
        Ok(lock(&self.blobs).contains_key(&(username.to_string(), id.to_string())))
    }

    async fn delete(&self, username: &str, id: &str) -> Result<bool, Error> {
        Ok(lock(&self.blobs)
            .remove(&(username.to_string(), id.to_string()))
            .is_some())
    }

    fn url(&self, username: &str, id: &str) -> Result<Url, Error> {
        Ok(self
            .base_url
            .join(&format!("users/{}/media/{}", username, id))?)
    }

    fn parse_url(&self, url: &Url) -> Option<(String, String)> {
        if url.host_str() != self.base_url.host_str() || url.port() != self.base_url.port() {
            return None;
        }
        let segments: Vec<&str> = url.path_segments()?.collect();
        match segments.as_slice() {
            ["users", username, "media", id] => Some((username.to_string(), id.to_string())),
            _ => None,
        }
    }
}
