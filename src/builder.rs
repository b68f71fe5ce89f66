//! Constructs well-formed activities bound to an actor identity
//!
//! An [ActivityFactory] mints activities with stable ids under the actor's
//! namespace and a `published` timestamp. Notes are built fluently through
//! [NoteBuilder], which also keeps mention recipients and mention tags in
//! sync.

use crate::{
    error::Error,
    kinds::public,
    protocol::{
        activity::{Activity, ActivityKind, IdOrObject},
        object::{ApObject, Attachment, ObjectKind, Tag, TagKind},
    },
};
use chrono::Utc;
use serde_json::Map;
use url::Url;
use uuid::Uuid;

/// Builds activities performed by one actor
#[derive(Clone, Debug)]
pub struct ActivityFactory {
    base_url: Url,
    username: String,
    actor: Url,
    followers: Url,
}

impl ActivityFactory {
    /// A factory for the local actor `username` hosted under `base_url`
    pub fn new(base_url: Url, username: &str) -> Result<Self, Error> {
        let actor = base_url.join(&format!("users/{}", username))?;
        let followers = Url::parse(&format!("{}/followers", actor))?;
        Ok(ActivityFactory {
            base_url,
            username: username.to_string(),
            actor,
            followers,
        })
    }

    /// The actor this factory builds for
    pub fn actor(&self) -> &Url {
        &self.actor
    }

    /// The actor's followers collection
    pub fn followers(&self) -> &Url {
        &self.followers
    }

    fn activity(&self, kind: ActivityKind, object: Option<IdOrObject>) -> Activity {
        Activity {
            id: Some(self.activity_id(&kind)),
            kind,
            actor: self.actor.clone(),
            object,
            target: None,
            to: vec![],
            cc: vec![],
            bcc: vec![],
            audience: vec![],
            published: Some(Utc::now()),
            extra: Map::new(),
        }
    }

    fn activity_id(&self, kind: &ActivityKind) -> Url {
        self.base_url
            .join(&format!(
                "activities/{}-{}",
                kind.as_str().to_lowercase(),
                Uuid::new_v4()
            ))
            .expect("base url accepts path segments")
    }

    fn object_id(&self) -> Url {
        self.base_url
            .join(&format!("users/{}/objects/{}", self.username, Uuid::new_v4()))
            .expect("base url accepts path segments")
    }

    /// A Follow of the given actor, addressed to them
    pub fn follow(&self, object: &Url) -> Activity {
        let mut follow = self.activity(ActivityKind::Follow, Some(object.clone().into()));
        follow.to = vec![object.clone()];
        follow
    }

    /// An Accept of an earlier activity, addressed to its actor
    pub fn accept(&self, inner: &Activity) -> Activity {
        self.response(ActivityKind::Accept, inner)
    }

    /// A TentativeAccept of an earlier activity
    pub fn tentative_accept(&self, inner: &Activity) -> Activity {
        self.response(ActivityKind::TentativeAccept, inner)
    }

    /// A Reject of an earlier activity, addressed to its actor
    pub fn reject(&self, inner: &Activity) -> Activity {
        self.response(ActivityKind::Reject, inner)
    }

    fn response(&self, kind: ActivityKind, inner: &Activity) -> Activity {
        let embedded = serde_json::to_value(inner)
            .map(|value| IdOrObject::Object(Box::new(value)))
            .unwrap_or_else(|_| {
                IdOrObject::Id(inner.id.clone().unwrap_or_else(|| self.actor.clone()))
            });
        let mut response = self.activity(kind, Some(embedded));
        response.to = vec![inner.actor.clone()];
        response
    }

    /// An Undo of an earlier activity by this actor, with the original
    /// embedded and the original recipients readdressed
    pub fn undo(&self, inner: &Activity) -> Activity {
        let embedded = serde_json::to_value(inner)
            .map(|value| IdOrObject::Object(Box::new(value)))
            .unwrap_or_else(|_| {
                IdOrObject::Id(inner.id.clone().unwrap_or_else(|| self.actor.clone()))
            });
        let mut undo = self.activity(ActivityKind::Undo, Some(embedded));
        undo.to = inner.to.clone();
        undo.cc = inner.cc.clone();
        undo
    }

    /// A Like of the given object
    pub fn like(&self, object: &Url) -> Activity {
        self.activity(ActivityKind::Like, Some(object.clone().into()))
    }

    /// An Announce of the given object, addressed to the Public sentinel and
    /// the actor's followers
    pub fn announce(&self, object: &Url) -> Activity {
        let mut announce = self.activity(ActivityKind::Announce, Some(object.clone().into()));
        announce.to = vec![public()];
        announce.cc = vec![self.followers.clone()];
        announce
    }

    /// A Delete of the given object
    pub fn delete(&self, object: &Url) -> Activity {
        self.activity(ActivityKind::Delete, Some(object.clone().into()))
    }

    /// An Update carrying the replacement object
    pub fn update(&self, object: &ApObject) -> Activity {
        let embedded = serde_json::to_value(object)
            .map(|value| IdOrObject::Object(Box::new(value)))
            .ok();
        self.activity(ActivityKind::Update, embedded)
    }

    /// An Add of an object into a collection
    pub fn add(&self, object: &Url, target: &Url) -> Activity {
        let mut add = self.activity(ActivityKind::Add, Some(object.clone().into()));
        add.target = Some(target.clone());
        add
    }

    /// A Remove of an object from a collection
    pub fn remove(&self, object: &Url, target: &Url) -> Activity {
        let mut remove = self.activity(ActivityKind::Remove, Some(object.clone().into()));
        remove.target = Some(target.clone());
        remove
    }

    /// A Block of the given actor. Blocks are not delivered to the blocked
    /// actor; they only drive local filtering.
    pub fn block(&self, actor: &Url) -> Activity {
        self.activity(ActivityKind::Block, Some(actor.clone().into()))
    }

    /// A Create wrapping the given object, with the object's addressing
    /// copied onto the activity
    pub fn create(&self, mut object: ApObject) -> Activity {
        if object.id.is_none() {
            object.id = Some(self.object_id());
        }
        if object.attributed_to.is_none() {
            object.attributed_to = Some(self.actor.clone());
        }
        let to = object.to.clone();
        let cc = object.cc.clone();
        let embedded = serde_json::to_value(&object)
            .map(|value| IdOrObject::Object(Box::new(value)))
            .unwrap_or_else(|_| IdOrObject::Id(self.actor.clone()));
        let mut create = self.activity(ActivityKind::Create, Some(embedded));
        create.to = to;
        create.cc = cc;
        create
    }

    /// Start building a Note
    pub fn note(&self) -> NoteBuilder {
        NoteBuilder {
            factory: self.clone(),
            content: None,
            summary: None,
            to: vec![],
            cc: vec![],
            tag: vec![],
            in_reply_to: None,
            attachment: vec![],
        }
    }
}

/// Fluent construction of Note objects
#[derive(Clone, Debug)]
pub struct NoteBuilder {
    factory: ActivityFactory,
    content: Option<String>,
    summary: Option<String>,
    to: Vec<Url>,
    cc: Vec<Url>,
    tag: Vec<Tag>,
    in_reply_to: Option<Url>,
    attachment: Vec<Attachment>,
}

impl NoteBuilder {
    /// Note content, typically HTML
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Summary shown as a content warning
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Add a primary recipient
    pub fn to(mut self, recipient: Url) -> Self {
        self.to.push(recipient);
        self
    }

    /// Add a carbon-copy recipient
    pub fn cc(mut self, recipient: Url) -> Self {
        self.cc.push(recipient);
        self
    }

    /// Address the Public sentinel
    pub fn to_public(mut self) -> Self {
        self.to.push(public());
        self
    }

    /// Address the author's followers collection
    pub fn to_followers(mut self) -> Self {
        self.cc.push(self.factory.followers.clone());
        self
    }

    /// Mention an actor: adds them as a recipient and attaches a Mention tag
    pub fn mention(mut self, actor: Url, handle: impl Into<String>) -> Self {
        self.tag.push(Tag {
            kind: TagKind::Mention,
            href: Some(actor.clone()),
            name: Some(handle.into()),
        });
        self.to.push(actor);
        self
    }

    /// Attach a hashtag
    pub fn hashtag(mut self, name: impl Into<String>) -> Self {
        self.tag.push(Tag {
            kind: TagKind::Hashtag,
            href: None,
            name: Some(name.into()),
        });
        self
    }

    /// Mark the note as a reply to another object
    pub fn in_reply_to(mut self, object: Url) -> Self {
        self.in_reply_to = Some(object);
        self
    }

    /// Attach a media document
    pub fn attach(mut self, kind: ObjectKind, url: Url, media_type: impl Into<String>) -> Self {
        self.attachment.push(Attachment {
            kind,
            url,
            media_type: Some(media_type.into()),
            name: None,
        });
        self
    }

    /// The Note alone, for embedding
    pub fn into_note(self) -> ApObject {
        ApObject {
            id: Some(self.factory.object_id()),
            kind: ObjectKind::Note,
            attributed_to: Some(self.factory.actor.clone()),
            content: self.content,
            media_type: None,
            name: None,
            summary: self.summary,
            url: None,
            attachment: self.attachment,
            tag: self.tag,
            in_reply_to: self.in_reply_to,
            published: Some(Utc::now()),
            to: self.to,
            cc: self.cc,
            extra: Map::new(),
        }
    }

    /// A Create activity wrapping the Note
    pub fn into_create(self) -> Activity {
        let factory = self.factory.clone();
        factory.create(self.into_note())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> ActivityFactory {
        ActivityFactory::new(Url::parse("https://example.com").unwrap(), "alice").unwrap()
    }

    #[test]
    fn follow_is_addressed_to_object() {
        let bob = Url::parse("https://other.com/users/bob").unwrap();
        let follow = factory().follow(&bob);
        assert_eq!(follow.kind, ActivityKind::Follow);
        assert_eq!(follow.to, vec![bob.clone()]);
        assert_eq!(follow.object_id().unwrap(), bob);
        assert!(follow.id.as_ref().unwrap().as_str().contains("/activities/follow-"));
        assert!(follow.published.is_some());
    }

    #[test]
    fn announce_addresses_public() {
        let object = Url::parse("https://other.com/objects/1").unwrap();
        let announce = factory().announce(&object);
        assert!(announce.to.contains(&public()));
        assert_eq!(
            announce.cc,
            vec![Url::parse("https://example.com/users/alice/followers").unwrap()]
        );
    }

    #[test]
    fn undo_embeds_the_original() {
        let bob = Url::parse("https://other.com/users/bob").unwrap();
        let follow = factory().follow(&bob);
        let undo = factory().undo(&follow);
        assert_eq!(undo.kind, ActivityKind::Undo);
        let inner = undo.embedded_activity().unwrap();
        assert_eq!(inner.id, follow.id);
        assert_eq!(inner.kind, ActivityKind::Follow);
        assert_eq!(undo.to, follow.to);
    }

    #[test]
    fn accept_targets_the_follower() {
        let factory = factory();
        let mut follow = factory.follow(factory.actor());
        follow.actor = Url::parse("https://other.com/users/bob").unwrap();
        let accept = factory.accept(&follow);
        assert_eq!(accept.to, vec![follow.actor.clone()]);
        assert_eq!(
            accept.embedded_activity().unwrap().id,
            follow.id
        );
    }

    #[test]
    fn note_builder_wires_mentions_and_replies() {
        let bob = Url::parse("https://other.com/users/bob").unwrap();
        let parent = Url::parse("https://other.com/objects/7").unwrap();
        let create = factory()
            .note()
            .content("<p>hi @bob</p>")
            .to_public()
            .to_followers()
            .mention(bob.clone(), "@bob@other.com")
            .in_reply_to(parent.clone())
            .attach(
                ObjectKind::Image,
                Url::parse("https://example.com/users/alice/media/1").unwrap(),
                "image/png",
            )
            .into_create();

        assert_eq!(create.kind, ActivityKind::Create);
        assert!(create.to.contains(&bob));
        assert!(create.to.contains(&public()));

        let note: ApObject =
            serde_json::from_value(create.embedded_object().unwrap().clone()).unwrap();
        assert_eq!(note.in_reply_to, Some(parent));
        assert!(note.has_attachment());
        assert_eq!(note.tag.len(), 1);
        assert_eq!(note.attributed_to.unwrap().as_str(), "https://example.com/users/alice");
        assert!(note
            .id
            .unwrap()
            .as_str()
            .starts_with("https://example.com/users/alice/objects/"));
        // addressing is mirrored onto the wrapping activity
        assert_eq!(create.to, note.to);
    }
}
