//! Repository-backed delivery queue and background worker
//!
//! The outbox (and the inbox, for reply activities like Accept) enqueues one
//! [DeliveryItem] per target inbox through [Dispatcher]. A [DeliveryWorker]
//! polls the queue, claims due items, signs and POSTs each one, and either
//! marks it delivered or reschedules it along a fixed backoff ladder until
//! the retry budget is exhausted.

use crate::{
    config::FederationConfig,
    error::Error,
    protocol::{activity::Activity, context::WithContext},
    signatures::sign_request,
    storage::{DeliveryItem, DeliveryStatus, Stores},
    FEDERATION_CONTENT_TYPE,
};
use chrono::{Duration, Utc};
use futures::future::join_all;
use http::Method;
use itertools::Itertools;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Minutes of delay before retry 1, 2, ... The last value sticks for any
/// further attempts.
pub const BACKOFF_SCHEDULE_MINUTES: [i64; 6] = [1, 5, 15, 60, 240, 720];

/// Delay before the next attempt after `attempt_count` failed attempts
pub(crate) fn backoff_delay(attempt_count: u32) -> Duration {
    let index = (attempt_count.saturating_sub(1) as usize).min(BACKOFF_SCHEDULE_MINUTES.len() - 1);
    Duration::minutes(BACKOFF_SCHEDULE_MINUTES[index])
}

/// Translates an activity plus a set of target inboxes into queue items
#[derive(Clone)]
pub struct Dispatcher {
    config: FederationConfig,
    stores: Stores,
}

impl Dispatcher {
    /// A dispatcher writing to the given delivery repository
    pub fn new(config: FederationConfig, stores: Stores) -> Self {
        Dispatcher { config, stores }
    }

    /// Enqueue one delivery per distinct target inbox. Invalid target URLs
    /// are skipped with a debug log; everything else becomes a Pending item
    /// due immediately.
    pub async fn dispatch(
        &self,
        activity: &Activity,
        sender_uri: &Url,
        sender_username: &str,
        inboxes: Vec<Url>,
    ) -> Result<usize, Error> {
        let activity_id = activity.require_id()?.clone();
        // blind-copy recipients must not appear on the wire
        let mut wire = activity.clone();
        wire.bcc.clear();
        let body = serialize_with_context(&wire)?;
        let now = Utc::now();

        let mut enqueued = 0;
        for inbox in inboxes.into_iter().unique() {
            if let Err(error) = self.config.verify_url_valid(&inbox).await {
                debug!("inbox url invalid, skipping: {inbox}: {error}");
                continue;
            }
            self.stores
                .delivery
                .enqueue(DeliveryItem {
                    id: Uuid::new_v4(),
                    activity: body.clone(),
                    activity_id: activity_id.clone(),
                    inbox,
                    actor_uri: sender_uri.clone(),
                    username: sender_username.to_string(),
                    attempt_count: 0,
                    max_retries: self.config.max_retries,
                    created_at: now,
                    next_attempt_at: now,
                    last_attempt_at: None,
                    completed_at: None,
                    status: DeliveryStatus::Pending,
                    last_error: None,
                })
                .await?;
            enqueued += 1;
        }
        debug!("enqueued {} deliveries for {}", enqueued, activity_id);
        Ok(enqueued)
    }
}

/// Serialize an activity for the wire, adding the default JSON-LD context
/// unless the document already carries one.
pub(crate) fn serialize_with_context(activity: &Activity) -> Result<String, Error> {
    if activity.extra.contains_key("@context") {
        Ok(serde_json::to_string(activity)?)
    } else {
        Ok(serde_json::to_string(&WithContext::new_default(activity))?)
    }
}

enum AttemptOutcome {
    /// 2xx from the target
    Delivered,
    /// 404 or 410: the inbox is gone, no point retrying
    Terminal(String),
    /// Transport error or retryable status
    Retry(String),
}

/// Background loop delivering queued items
pub struct DeliveryWorker {
    config: FederationConfig,
    stores: Stores,
    cancel: CancellationToken,
}

impl DeliveryWorker {
    /// A worker over the given queue. Multiple workers may run; the
    /// repository's claim guards against double-sending.
    pub fn new(config: FederationConfig, stores: Stores) -> Self {
        DeliveryWorker {
            config,
            stores,
            cancel: CancellationToken::new(),
        }
    }

    /// Token which stops the worker loop when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the worker on a background task until cancelled
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// The worker loop: claim due items every poll interval, purge old
    /// terminal items once an hour.
    pub async fn run(&self) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cleanup = tokio::time::interval(std::time::Duration::from_secs(3600));
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("delivery worker stopping");
                    return;
                }
                _ = poll.tick() => {
                    if let Err(error) = self.run_once().await {
                        warn!("delivery cycle failed: {}", error);
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(error) = self.cleanup().await {
                        warn!("delivery cleanup failed: {}", error);
                    }
                }
            }
        }
    }

    /// One worker cycle: claim due items and attempt each. Returns how many
    /// items were attempted.
    pub async fn run_once(&self) -> Result<usize, Error> {
        let due = self
            .stores
            .delivery
            .claim_due(Utc::now(), self.config.batch_size)
            .await?;
        let count = due.len();
        join_all(due.into_iter().map(|item| self.attempt(item))).await;
        Ok(count)
    }

    /// Remove Delivered and Dead items older than the configured max age
    pub async fn cleanup(&self) -> Result<u64, Error> {
        let max_age =
            Duration::from_std(self.config.queue_max_age).unwrap_or_else(|_| Duration::days(7));
        let removed = self
            .stores
            .delivery
            .purge_completed_before(Utc::now() - max_age)
            .await?;
        if removed > 0 {
            debug!("purged {} completed deliveries", removed);
        }
        Ok(removed)
    }

    async fn attempt(&self, mut item: DeliveryItem) {
        let outcome = self.send(&item).await;
        let now = Utc::now();
        item.last_attempt_at = Some(now);

        match outcome {
            AttemptOutcome::Delivered => {
                debug!("delivered {} to {}", item.activity_id, item.inbox);
                item.attempt_count += 1;
                item.status = DeliveryStatus::Delivered;
                item.completed_at = Some(now);
                item.last_error = None;
            }
            AttemptOutcome::Terminal(error) => {
                warn!("giving up on {} to {}: {}", item.activity_id, item.inbox, error);
                item.attempt_count = (item.attempt_count + 1).max(item.max_retries);
                item.status = DeliveryStatus::Dead;
                item.completed_at = Some(now);
                item.last_error = Some(error);
            }
            AttemptOutcome::Retry(error) => {
                item.attempt_count += 1;
                item.last_error = Some(error);
                if item.attempt_count >= item.max_retries {
                    warn!(
                        "retries exhausted for {} to {}",
                        item.activity_id, item.inbox
                    );
                    item.status = DeliveryStatus::Dead;
                    item.completed_at = Some(now);
                } else {
                    item.status = DeliveryStatus::Failed;
                    item.next_attempt_at = now + backoff_delay(item.attempt_count);
                    debug!(
                        "attempt {} for {} to {} failed, next at {}",
                        item.attempt_count, item.activity_id, item.inbox, item.next_attempt_at
                    );
                }
            }
        }

        if let Err(error) = self.stores.delivery.update(item).await {
            warn!("failed to persist delivery state: {}", error);
        }
    }

    async fn send(&self, item: &DeliveryItem) -> AttemptOutcome {
        let sender = match self.stores.actors.get_by_username(&item.username).await {
            Ok(Some(sender)) => sender,
            Ok(None) => return AttemptOutcome::Terminal("sending actor no longer exists".into()),
            Err(error) => return AttemptOutcome::Retry(error.to_string()),
        };
        let Some(private_key_pem) = sender.private_key_pem.as_deref() else {
            return AttemptOutcome::Terminal("sending actor has no private key".into());
        };

        let signed = match sign_request(
            &Method::POST,
            &item.inbox,
            Some(item.activity.as_bytes()),
            Some(FEDERATION_CONTENT_TYPE),
            None,
            &sender.key_id(),
            private_key_pem,
        ) {
            Ok(signed) => signed,
            Err(error) => return AttemptOutcome::Terminal(format!("signing failed: {error}")),
        };

        let request = self
            .config
            .client
            .post(item.inbox.as_str())
            .timeout(self.config.request_timeout)
            .header("content-type", FEDERATION_CONTENT_TYPE)
            .header("user-agent", &self.config.user_agent)
            .header("host", signed.host)
            .header("date", signed.date)
            .header("digest", signed.digest.unwrap_or_default())
            .header("signature", signed.signature)
            .body(item.activity.clone());

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    AttemptOutcome::Delivered
                } else if status == http::StatusCode::NOT_FOUND
                    || status == http::StatusCode::GONE
                {
                    AttemptOutcome::Terminal(format!("target inbox answered {status}"))
                } else {
                    AttemptOutcome::Retry(format!("target inbox answered {status}"))
                }
            }
            Err(error) => AttemptOutcome::Retry(error.to_string()),
        }
    }
}

/// Expand delivery targets for a locally submitted activity.
///
/// Addressing lists are merged, the Public sentinel is dropped, the sender's
/// own followers collection is substituted by the follower set, and every
/// remaining actor is resolved to an inbox. When two or more resolved actors
/// share a `sharedInbox` endpoint, one delivery to that endpoint replaces
/// the individual ones.
pub async fn expand_targets(
    config: &FederationConfig,
    stores: &Stores,
    activity: &Activity,
    sender: &crate::storage::ActorRecord,
) -> Result<Vec<Url>, Error> {
    let public = crate::kinds::public();
    let own_followers = sender.followers.clone();

    let mut recipient_actors: Vec<Url> = Vec::new();
    for uri in activity.addressed() {
        if *uri == public {
            continue;
        }
        if Some(uri) == own_followers.as_ref() {
            for follower in stores.follows.followers(&sender.preferred_username).await? {
                recipient_actors.push(follower);
            }
            continue;
        }
        recipient_actors.push(uri.clone());
    }

    let mut resolved: Vec<(Url, Option<Url>)> = Vec::new();
    for actor_uri in recipient_actors.into_iter().unique() {
        match crate::keys::resolve_actor(config, &stores.actors, &actor_uri).await {
            Ok(actor) => resolved.push((actor.inbox.clone(), actor.shared_inbox.clone())),
            Err(error) => {
                warn!("cannot resolve recipient {}: {}", actor_uri, error);
            }
        }
    }

    // Prefer a shared inbox over per-actor inboxes when it saves requests.
    let mut shared_counts: std::collections::HashMap<Url, usize> = std::collections::HashMap::new();
    for (_, shared) in &resolved {
        if let Some(shared) = shared {
            *shared_counts.entry(shared.clone()).or_default() += 1;
        }
    }

    let mut targets = Vec::new();
    for (inbox, shared) in resolved {
        match shared {
            Some(shared) if shared_counts.get(&shared).copied().unwrap_or(0) >= 2 => {
                targets.push(shared);
            }
            _ => targets.push(inbox),
        }
    }

    Ok(targets.into_iter().unique().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::ActivityFactory,
        protocol::actor::ActorKind,
        storage::ActorRecord,
    };

    #[tokio::test]
    async fn gone_target_kills_the_item() {
        use axum::{routing::post, Router};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target =
            Url::parse(&format!("http://{}/inbox", listener.local_addr().unwrap())).unwrap();
        let app = Router::new().route(
            "/inbox",
            post(|| async { http::StatusCode::GONE }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let config = FederationConfig::builder()
            .base_url(Url::parse("https://a.test").unwrap())
            .debug(true)
            .build()
            .unwrap();
        let stores = Stores::in_memory(config.base_url().clone());
        let alice = ActorRecord::new_local(&config, "alice", ActorKind::Person).unwrap();
        stores.actors.save(alice.clone()).await.unwrap();

        let factory = ActivityFactory::new(config.base_url().clone(), "alice").unwrap();
        let like = factory.like(&Url::parse("https://elsewhere.test/objects/1").unwrap());
        Dispatcher::new(config.clone(), stores.clone())
            .dispatch(&like, &alice.uri, "alice", vec![target])
            .await
            .unwrap();

        let worker = DeliveryWorker::new(config, stores.clone());
        assert_eq!(worker.run_once().await.unwrap(), 1);

        let item = stores
            .delivery
            .items_for_activity(like.id.as_ref().unwrap())
            .await
            .unwrap()[0]
            .clone();
        assert_eq!(item.status, DeliveryStatus::Dead);
        assert!(item.attempt_count >= item.max_retries);
        assert!(item.completed_at.is_some());
        assert!(item.last_error.is_some());
    }

    #[test]
    fn backoff_ladder_matches_schedule() {
        assert_eq!(backoff_delay(1), Duration::minutes(1));
        assert_eq!(backoff_delay(2), Duration::minutes(5));
        assert_eq!(backoff_delay(3), Duration::minutes(15));
        assert_eq!(backoff_delay(4), Duration::minutes(60));
        assert_eq!(backoff_delay(5), Duration::minutes(240));
        assert_eq!(backoff_delay(6), Duration::minutes(720));
        // the last value sticks
        assert_eq!(backoff_delay(7), Duration::minutes(720));
        assert_eq!(backoff_delay(100), Duration::minutes(720));
    }

    #[test]
    fn context_is_added_once() {
        use crate::protocol::activity::{Activity, ActivityKind};
        use serde_json::Map;

        let mut activity = Activity {
            id: Some(Url::parse("https://example.com/a/1").unwrap()),
            kind: ActivityKind::Like,
            actor: Url::parse("https://example.com/users/alice").unwrap(),
            object: None,
            target: None,
            to: vec![],
            cc: vec![],
            bcc: vec![],
            audience: vec![],
            published: None,
            extra: Map::new(),
        };
        let body = serialize_with_context(&activity).unwrap();
        assert_eq!(body.matches("@context").count(), 1);

        activity.extra.insert(
            "@context".to_string(),
            serde_json::Value::String("https://www.w3.org/ns/activitystreams".to_string()),
        );
        let body = serialize_with_context(&activity).unwrap();
        assert_eq!(body.matches("@context").count(), 1);
    }
}
