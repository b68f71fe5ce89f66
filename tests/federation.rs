//! End-to-end federation between two in-process instances.
//!
//! Each instance runs a real axum listener on an ephemeral localhost port
//! plus its own delivery worker, so activities travel over actual signed
//! HTTP requests: outbox -> delivery queue -> remote inbox -> state machine.

use rookery::{
    builder::ActivityFactory,
    client::{ApClient, Credentials},
    config::FederationConfig,
    delivery::DeliveryWorker,
    http::{build_router, AppState},
    protocol::actor::ActorKind,
    signatures::sign_request,
    storage::{ActorRecord, DeliveryStatus, Stores},
    FEDERATION_CONTENT_TYPE,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

struct Instance {
    config: FederationConfig,
    stores: Stores,
    base_url: Url,
    worker_cancel: CancellationToken,
}

impl Instance {
    async fn spawn() -> Instance {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        let base_url = Url::parse(&format!("http://{addr}")).expect("base url");

        let config = FederationConfig::builder()
            .base_url(base_url.clone())
            .debug(true)
            .poll_interval(Duration::from_millis(50))
            .build()
            .expect("config");
        let stores = Stores::in_memory(base_url.clone());
        let state = AppState::new(config.clone(), stores.clone());
        let router = build_router(state);
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });

        let worker = DeliveryWorker::new(config.clone(), stores.clone());
        let worker_cancel = worker.cancellation_token();
        worker.spawn();

        Instance {
            config,
            stores,
            base_url,
            worker_cancel,
        }
    }

    async fn create_user(&self, name: &str) -> ActorRecord {
        let actor = ActorRecord::new_local(&self.config, name, ActorKind::Person).expect("actor");
        self.stores.actors.save(actor.clone()).await.expect("save");
        actor
    }

    fn client_for(&self, actor: &ActorRecord) -> ApClient {
        ApClient::new(Credentials::Key {
            actor: actor.uri.clone(),
            key_id: actor.key_id(),
            private_key_pem: actor.private_key_pem.clone().expect("local key"),
        })
        .with_debug(true)
        .with_timeout(Duration::from_secs(5))
    }

    fn factory(&self, name: &str) -> ActivityFactory {
        ActivityFactory::new(self.base_url.clone(), name).expect("factory")
    }

    fn handle(&self, name: &str) -> String {
        format!("{}@{}", name, self.config.domain())
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.worker_cancel.cancel();
    }
}

async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn follow_is_accepted_across_instances() {
    let a = Instance::spawn().await;
    let b = Instance::spawn().await;
    let alice = a.create_user("alice").await;
    b.create_user("bob").await;

    let client = a.client_for(&alice);
    let cancel = CancellationToken::new();

    // webfinger round-trip: handle -> actor document
    let bob_doc = client
        .resolve_by_alias(&b.handle("bob"), &cancel)
        .await
        .expect("resolve")
        .expect("bob exists");
    assert_eq!(bob_doc.preferred_username, "bob");

    let follow = a.factory("alice").follow(&bob_doc.id);
    client
        .post_to_outbox(&follow, &cancel)
        .await
        .expect("post follow");

    wait_for("bob's inbox to contain the follow", || async {
        b.stores.activities.inbox_count("bob").await.unwrap() >= 1
    })
    .await;
    wait_for("bob's followers to contain alice", || async {
        b.stores.follows.is_follower("bob", &alice.uri).await.unwrap()
    })
    .await;
    wait_for("alice's following to contain bob", || async {
        a.stores.follows.is_following("alice", &bob_doc.id).await.unwrap()
    })
    .await;
    wait_for("the accept to reach alice's inbox", || async {
        a.stores
            .activities
            .inbox("alice", 10, 0)
            .await
            .unwrap()
            .iter()
            .any(|activity| {
                activity.kind == rookery::protocol::activity::ActivityKind::Accept
            })
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn undo_follow_removes_both_halves() {
    let a = Instance::spawn().await;
    let b = Instance::spawn().await;
    let alice = a.create_user("alice").await;
    b.create_user("bob").await;

    let client = a.client_for(&alice);
    let cancel = CancellationToken::new();
    let bob_doc = client
        .resolve_by_alias(&b.handle("bob"), &cancel)
        .await
        .expect("resolve")
        .expect("bob exists");

    let follow = a.factory("alice").follow(&bob_doc.id);
    client.post_to_outbox(&follow, &cancel).await.expect("follow");
    wait_for("the follow to be established", || async {
        b.stores.follows.is_follower("bob", &alice.uri).await.unwrap()
    })
    .await;

    let undo = a.factory("alice").undo(&follow);
    client.post_to_outbox(&undo, &cancel).await.expect("undo");

    wait_for("the undo to reach bob", || async {
        !b.stores.follows.is_follower("bob", &alice.uri).await.unwrap()
    })
    .await;
    assert!(!a.stores.follows.is_following("alice", &bob_doc.id).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_signature_is_rejected() {
    let a = Instance::spawn().await;
    let b = Instance::spawn().await;
    let alice = a.create_user("alice").await;
    // mallory lives on instance A as well, with her own key
    let mallory = a.create_user("mallory").await;
    b.create_user("bob").await;

    let create = a
        .factory("alice")
        .note()
        .content("forged")
        .to(Url::parse(&format!("{}users/bob", b.base_url)).unwrap())
        .into_create();
    let body = serde_json::to_vec(&create).unwrap();

    // claim alice's key id but sign with mallory's private key
    let inbox = Url::parse(&format!("{}inbox", b.base_url)).unwrap();
    let signed = sign_request(
        &http::Method::POST,
        &inbox,
        Some(&body),
        Some(FEDERATION_CONTENT_TYPE),
        None,
        &alice.key_id(),
        mallory.private_key_pem.as_deref().unwrap(),
    )
    .unwrap();

    let response = reqwest::Client::new()
        .post(inbox.as_str())
        .header("content-type", FEDERATION_CONTENT_TYPE)
        .header("host", signed.host)
        .header("date", signed.date)
        .header("digest", signed.digest.unwrap())
        .header("signature", signed.signature)
        .body(body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(b.stores.activities.inbox_count("bob").await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_inbox_fans_out_once_per_recipient() {
    let a = Instance::spawn().await;
    let b = Instance::spawn().await;
    let dan = a.create_user("dan").await;
    for name in ["alice", "bob", "charlie"] {
        b.create_user(name).await;
    }

    let client = a.client_for(&dan);
    let cancel = CancellationToken::new();

    let mut create = a.factory("dan").note().content("hi everyone").into_create();
    create.to = ["alice", "bob", "charlie"]
        .iter()
        .map(|name| Url::parse(&format!("{}users/{name}", b.base_url)).unwrap())
        .collect();

    let shared = Url::parse(&format!("{}inbox", b.base_url)).unwrap();
    let response = client.post(&shared, &create, &cancel).await.expect("post");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    for name in ["alice", "bob", "charlie"] {
        wait_for("the create to arrive", || async {
            b.stores.activities.inbox_count(name).await.unwrap() == 1
        })
        .await;
    }
    // a second POST of the same activity changes nothing
    let response = client.post(&shared, &create, &cancel).await.expect("post");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    for name in ["alice", "bob", "charlie"] {
        assert_eq!(b.stores.activities.inbox_count(name).await.unwrap(), 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn delivery_retries_until_the_target_recovers() {
    use axum::{extract::State, routing::post, Router};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    // a target inbox which answers 500 three times, then 202
    let hits = Arc::new(AtomicUsize::new(0));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = Url::parse(&format!("http://{}/inbox", listener.local_addr().unwrap())).unwrap();
    let app = Router::new()
        .route(
            "/inbox",
            post(|State(hits): State<Arc<AtomicUsize>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) < 3 {
                    http::StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    http::StatusCode::ACCEPTED
                }
            }),
        )
        .with_state(hits.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let a = Instance::spawn().await;
    a.worker_cancel.cancel(); // drive the worker by hand
    let alice = a.create_user("alice").await;

    let like = a
        .factory("alice")
        .like(&Url::parse("https://elsewhere.test/objects/1").unwrap());
    let dispatcher =
        rookery::delivery::Dispatcher::new(a.config.clone(), a.stores.clone());
    dispatcher
        .dispatch(&like, &alice.uri, "alice", vec![target])
        .await
        .expect("enqueue");

    let worker = DeliveryWorker::new(a.config.clone(), a.stores.clone());
    let activity_id = like.id.clone().unwrap();
    let expected_delays = [1, 5, 15];

    for (attempt, minutes) in expected_delays.iter().enumerate() {
        assert_eq!(worker.run_once().await.unwrap(), 1);
        let item = a.stores.delivery.items_for_activity(&activity_id).await.unwrap()[0].clone();
        assert_eq!(item.status, DeliveryStatus::Failed);
        assert_eq!(item.attempt_count as usize, attempt + 1);
        assert!(item.last_error.is_some());
        let delay = item.next_attempt_at - item.last_attempt_at.unwrap();
        assert_eq!(delay.num_minutes(), *minutes);

        // rewind the clock so the item is due again
        let mut due = item.clone();
        due.next_attempt_at = chrono::Utc::now();
        a.stores.delivery.update(due).await.unwrap();
    }

    assert_eq!(worker.run_once().await.unwrap(), 1);
    let item = a.stores.delivery.items_for_activity(&activity_id).await.unwrap()[0].clone();
    assert_eq!(item.status, DeliveryStatus::Delivered);
    assert_eq!(item.attempt_count, 4);
    assert_eq!(item.last_error, None);
    assert!(item.completed_at.is_some());
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_collection_item_is_dereferenceable() {
    use rookery::custom_collections::{
        CollectionDefinition, CollectionKind, CollectionSort, CollectionVisibility,
    };

    let a = Instance::spawn().await;
    let alice = a.create_user("alice").await;
    a.stores
        .collections
        .save_definition(
            "alice",
            CollectionDefinition {
                slug: "favorites".to_string(),
                name: "Favorites".to_string(),
                description: None,
                kind: CollectionKind::Manual,
                visibility: CollectionVisibility::Public,
                sort: CollectionSort::Manual,
                max_items: None,
                filter: None,
                created_at: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();

    let client = a.client_for(&alice);
    let cancel = CancellationToken::new();

    let create = a.factory("alice").note().content("a keeper").into_create();
    client.post_to_outbox(&create, &cancel).await.expect("create");
    let note_id = create.object_id().unwrap();

    let target = Url::parse(&format!("{}users/alice/collections/favorites", a.base_url)).unwrap();
    let add = a.factory("alice").add(&note_id, &target);
    client.post_to_outbox(&add, &cancel).await.expect("add");

    wait_for("the note to join the collection", || async {
        a.stores
            .collections
            .contains("alice", "favorites", &note_id)
            .await
            .unwrap()
    })
    .await;

    // the collection page serves the note's URI
    let page: serde_json::Value = reqwest::Client::new()
        .get(format!("{target}?page=1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let items = page["orderedItems"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_str().unwrap(), note_id.as_str());

    // and the note itself dereferences
    let note: serde_json::Value = reqwest::Client::new()
        .get(note_id.as_str())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(note["content"].as_str().unwrap(), "a keeper");
}

#[tokio::test(flavor = "multi_thread")]
async fn collection_walker_yields_all_pages_in_order() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = Url::parse(&format!("http://{addr}")).unwrap();

    // small pages so the outbox spans several of them
    let config = FederationConfig::builder()
        .base_url(base_url.clone())
        .debug(true)
        .page_size(2)
        .build()
        .unwrap();
    let stores = Stores::in_memory(base_url.clone());
    let state = AppState::new(config.clone(), stores.clone());
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.expect("serve");
    });

    let alice = ActorRecord::new_local(&config, "alice", ActorKind::Person).unwrap();
    stores.actors.save(alice.clone()).await.unwrap();
    let factory = ActivityFactory::new(base_url.clone(), "alice").unwrap();
    let outbox = rookery::outbox::OutboxHandler::new(config.clone(), stores.clone());
    for i in 0..5 {
        let create = factory.note().content(format!("note {i}")).into_create();
        outbox.submit("alice", create).await.unwrap();
    }

    let client = ApClient::new(Credentials::Anonymous).with_debug(true);
    let cancel = CancellationToken::new();
    let outbox_uri = Url::parse(&format!("{base_url}users/alice/outbox")).unwrap();

    let walker = client.get_collection(outbox_uri.clone(), None, cancel.clone());
    let items: Vec<serde_json::Value> = walker.collect_typed().await.unwrap();
    assert_eq!(items.len(), 5);
    // newest first, across page boundaries
    let contents: Vec<String> = items
        .iter()
        .map(|item| item["object"]["content"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(contents, ["note 4", "note 3", "note 2", "note 1", "note 0"]);

    // the limit caps the walk
    let limited = client.get_collection(outbox_uri, Some(3), cancel);
    let items: Vec<serde_json::Value> = limited.collect_typed().await.unwrap();
    assert_eq!(items.len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn outbox_creates_one_delivery_per_resolved_inbox() {
    let a = Instance::spawn().await;
    a.worker_cancel.cancel(); // inspect the queue before anything is sent
    let b = Instance::spawn().await;
    let alice = a.create_user("alice").await;
    let bob = b.create_user("bob").await;
    let charlie = b.create_user("charlie").await;

    a.stores.follows.add_follower("alice", &bob.uri).await.unwrap();
    a.stores.follows.add_follower("alice", &charlie.uri).await.unwrap();
    // make both known on A as remote records so no fetch is needed
    for remote in [&bob, &charlie] {
        let mut cached = remote.clone();
        cached.local = false;
        cached.private_key_pem = None;
        a.stores.actors.save(cached).await.unwrap();
    }

    let client = a.client_for(&alice);
    let cancel = CancellationToken::new();
    let create = a
        .factory("alice")
        .note()
        .content("to my followers")
        .to_public()
        .to_followers()
        .into_create();
    client.post_to_outbox(&create, &cancel).await.expect("post");

    let items = a
        .stores
        .delivery
        .items_for_activity(create.id.as_ref().unwrap())
        .await
        .unwrap();
    // bob and charlie share b's shared inbox, so exactly one item
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].inbox.as_str(), format!("{}inbox", b.base_url));
}
