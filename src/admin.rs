//! Admin back-channel driven by activities addressed to the system actor
//!
//! Create, Update and Delete activities delivered to the system actor's
//! inbox manage local actor accounts. They are honored when the activity is
//! signed by the system actor itself or accompanied by the admin bearer
//! token; both pathways converge on [admin_authorized]. Anything else is
//! silently ignored while the HTTP response stays 2xx, so the endpoint does
//! not become an oracle for probing.

use crate::{
    config::FederationConfig,
    error::Error,
    protocol::{activity::{Activity, ActivityKind}, actor::ApActor},
    storage::{ActorRecord, Stores},
};
use tracing::{debug, info, warn};
use url::Url;

/// The converged authorization check for admin verbs: a signature by the
/// system actor, or the admin bearer token.
pub fn admin_authorized(
    config: &FederationConfig,
    signer: Option<&Url>,
    bearer: Option<&str>,
) -> bool {
    if config.admin_token_matches(bearer) {
        return true;
    }
    match (signer, config.system_actor_uri()) {
        (Some(signer), Ok(system)) => *signer == system,
        _ => false,
    }
}

/// Applies admin verbs delivered to the system actor's inbox
#[derive(Clone)]
pub struct AdminHandler {
    config: FederationConfig,
    stores: Stores,
}

impl AdminHandler {
    /// A handler over the given repositories
    pub fn new(config: FederationConfig, stores: Stores) -> Self {
        AdminHandler { config, stores }
    }

    /// Handle an activity addressed to the system actor. `authorized` is the
    /// result of [admin_authorized] for this request; unauthorized verbs are
    /// dropped without an error so the caller still answers 2xx.
    pub async fn handle(&self, activity: &Activity, authorized: bool) -> Result<(), Error> {
        if !authorized {
            debug!(
                "ignoring admin verb {} from unauthorized {}",
                activity.kind, activity.actor
            );
            return Ok(());
        }

        match activity.kind {
            ActivityKind::Create => self.create_actor(activity).await,
            ActivityKind::Update => self.update_actor(activity).await,
            ActivityKind::Delete => self.delete_actor(activity).await,
            _ => {
                debug!("admin inbox ignores {} activities", activity.kind);
                Ok(())
            }
        }
    }

    async fn create_actor(&self, activity: &Activity) -> Result<(), Error> {
        let Some(value) = activity.embedded_object() else {
            return Ok(());
        };
        let document: ApActor = serde_json::from_value(value.clone())?;
        let username = document.preferred_username.clone();
        if self
            .stores
            .actors
            .get_by_username(&username)
            .await?
            .is_some()
        {
            debug!("actor {} already exists, ignoring create", username);
            return Ok(());
        }

        let mut record = ActorRecord::new_local(&self.config, &username, document.kind.clone())?;
        apply_profile(&mut record, &document);
        // an explicitly provided keypair wins over the generated one
        if let Some(private_key) = document.private_key_pem {
            record.private_key_pem = Some(private_key);
        }
        if let Some(public_key) = document.public_key {
            record.public_key = Some(public_key);
        }

        info!("admin created actor {}", username);
        self.stores.actors.save(record).await?;
        Ok(())
    }

    async fn update_actor(&self, activity: &Activity) -> Result<(), Error> {
        let Some(value) = activity.embedded_object() else {
            return Ok(());
        };
        let document: ApActor = serde_json::from_value(value.clone())?;
        let username = document.preferred_username.clone();
        let Some(mut record) = self.stores.actors.get_by_username(&username).await? else {
            warn!("admin update for unknown actor {}", username);
            return Err(Error::NotFound);
        };

        apply_profile(&mut record, &document);
        info!("admin updated actor {}", username);
        self.stores.actors.save(record).await?;
        Ok(())
    }

    async fn delete_actor(&self, activity: &Activity) -> Result<(), Error> {
        let Some(target) = activity.object_id() else {
            return Ok(());
        };
        let Some(username) = self.config.local_username_of(&target) else {
            return Ok(());
        };
        if username == self.config.system_actor_name {
            warn!("refusing to delete the system actor");
            return Ok(());
        }

        info!("admin deleted actor {}", username);
        self.stores.actors.delete(&username).await?;
        Ok(())
    }
}

fn apply_profile(record: &mut ActorRecord, document: &ApActor) {
    record.display_name = document.name.clone();
    record.summary = document.summary.clone();
    if let Some(manual) = document.manually_approves_followers {
        record.manually_approves_followers = manual;
    }
    record.extensions = document.extra.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{builder::ActivityFactory, protocol::actor::ActorKind};
    use serde_json::json;

    async fn setup() -> (AdminHandler, ActivityFactory) {
        let config = FederationConfig::builder()
            .base_url(Url::parse("https://a.test").unwrap())
            .admin_token("s3cret")
            .build()
            .unwrap();
        let stores = Stores::in_memory(config.base_url().clone());
        let system = ActorRecord::new_local(&config, "system", ActorKind::Service).unwrap();
        stores.actors.save(system).await.unwrap();
        let factory = ActivityFactory::new(config.base_url().clone(), "system").unwrap();
        (AdminHandler::new(config, stores), factory)
    }

    fn person_document(username: &str) -> serde_json::Value {
        json!({
            "id": format!("https://a.test/users/{username}"),
            "type": "Person",
            "preferredUsername": username,
            "name": "New User",
            "inbox": format!("https://a.test/users/{username}/inbox")
        })
    }

    fn create_activity(factory: &ActivityFactory, username: &str) -> Activity {
        let mut create = factory.follow(factory.actor());
        create.kind = ActivityKind::Create;
        create.object = Some(crate::protocol::activity::IdOrObject::Object(Box::new(
            person_document(username),
        )));
        create
    }

    #[tokio::test]
    async fn authorized_create_provisions_actor() {
        let (handler, factory) = setup().await;
        let create = create_activity(&factory, "newbie");
        handler.handle(&create, true).await.unwrap();

        let actor = handler
            .stores
            .actors
            .get_by_username("newbie")
            .await
            .unwrap()
            .unwrap();
        assert!(actor.local);
        assert!(actor.private_key_pem.is_some());
        assert_eq!(actor.display_name.as_deref(), Some("New User"));
    }

    #[tokio::test]
    async fn unauthorized_verbs_are_silently_ignored() {
        let (handler, factory) = setup().await;
        let create = create_activity(&factory, "intruder");
        handler.handle(&create, false).await.unwrap();
        assert!(handler
            .stores
            .actors
            .get_by_username("intruder")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn system_actor_is_never_deleted() {
        let (handler, factory) = setup().await;
        let delete = factory.delete(&Url::parse("https://a.test/users/system").unwrap());
        handler.handle(&delete, true).await.unwrap();
        assert!(handler
            .stores
            .actors
            .get_by_username("system")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn delete_removes_other_actors() {
        let (handler, factory) = setup().await;
        handler
            .handle(&create_activity(&factory, "mortal"), true)
            .await
            .unwrap();
        let delete = factory.delete(&Url::parse("https://a.test/users/mortal").unwrap());
        handler.handle(&delete, true).await.unwrap();
        assert!(handler
            .stores
            .actors
            .get_by_username("mortal")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn authorization_pathways_converge() {
        let config = FederationConfig::builder()
            .base_url(Url::parse("https://a.test").unwrap())
            .admin_token("s3cret")
            .build()
            .unwrap();
        let system = Url::parse("https://a.test/users/system").unwrap();
        let other = Url::parse("https://b.test/users/someone").unwrap();

        assert!(admin_authorized(&config, Some(&system), None));
        assert!(admin_authorized(&config, None, Some("s3cret")));
        assert!(admin_authorized(&config, Some(&other), Some("s3cret")));
        assert!(!admin_authorized(&config, Some(&other), None));
        assert!(!admin_authorized(&config, None, Some("wrong")));
        assert!(!admin_authorized(&config, None, None));
    }
}
