//! Routes one shared-inbox activity to every local recipient
//!
//! A single POST to `/inbox` can address many actors on this host. After one
//! signature verification, the router derives the local recipients from the
//! addressing lists and dispatches the activity through the inbox handler
//! once per recipient. A failure for one recipient never aborts delivery to
//! the others; the HTTP layer answers 202 regardless.

use crate::{
    config::FederationConfig, error::Error, inbox::InboxHandler, protocol::activity::Activity,
    storage::Stores,
};
use itertools::Itertools;
use tracing::{debug, warn};

/// Per-recipient outcome of a shared-inbox dispatch
pub type RecipientResult = (String, Result<(), Error>);

/// Fans a shared-inbox activity out to local recipients
#[derive(Clone)]
pub struct SharedInboxRouter {
    config: FederationConfig,
    stores: Stores,
    inbox: InboxHandler,
}

impl SharedInboxRouter {
    /// A router dispatching through the given inbox handler
    pub fn new(config: FederationConfig, stores: Stores, inbox: InboxHandler) -> Self {
        SharedInboxRouter {
            config,
            stores,
            inbox,
        }
    }

    /// Dispatch a verified activity to every addressed local recipient,
    /// returning the per-recipient outcomes.
    pub async fn route(&self, activity: Activity) -> Result<Vec<RecipientResult>, Error> {
        let recipients = self.local_recipients(&activity).await?;
        if recipients.is_empty() {
            debug!(
                "shared inbox activity {:?} addresses no local recipient",
                activity.id
            );
        }

        let mut results = Vec::with_capacity(recipients.len());
        for username in recipients {
            let result = self.inbox.receive(&username, activity.clone()).await;
            if let Err(error) = &result {
                warn!("shared inbox dispatch to {} failed: {}", username, error);
            }
            results.push((username, result));
        }
        Ok(results)
    }

    /// Usernames of existing local actors among `to`, `cc` and `bcc`
    async fn local_recipients(&self, activity: &Activity) -> Result<Vec<String>, Error> {
        let mut recipients = Vec::new();
        for uri in activity.recipients().unique() {
            let Some(username) = self.config.local_username_of(uri) else {
                continue;
            };
            if recipients.contains(&username) {
                continue;
            }
            if self.stores.actors.get_by_username(&username).await?.is_some() {
                recipients.push(username);
            }
        }
        Ok(recipients)
    }
}
