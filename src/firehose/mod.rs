/// Jetstream firehose ingestion
///
/// Jetstream serves the network's commit stream as JSON frames. Only post
/// commits are turned into events; identity and account frames are skipped.

pub mod producer;

pub use producer::FirehoseProducer;

use crate::event::{Event, Operation};
use serde::Deserialize;

/// Top-level Jetstream frame
#[derive(Debug, Clone, Deserialize)]
pub struct JetstreamMessage {
    pub did: String,
    pub time_us: i64,
    pub kind: String,
    #[serde(default)]
    pub commit: Option<JetstreamCommit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JetstreamCommit {
    pub operation: String,
    pub collection: String,
    pub rkey: String,
    #[serde(default)]
    pub record: Option<PostRecord>,
}

/// The parts of an `app.bsky.feed.post` record the pipeline uses
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub langs: Vec<String>,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyRef {
    pub parent: StrongRef,
    pub root: StrongRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrongRef {
    pub uri: String,
}

/// Turn a commit for `collection` into an event; anything else is None
pub fn normalize(message: &JetstreamMessage, collection: &str) -> Option<Event> {
    if message.kind != "commit" {
        return None;
    }
    let commit = message.commit.as_ref()?;
    if commit.collection != collection {
        return None;
    }
    let operation = Operation::parse(&commit.operation).ok()?;

    let event = Event::new(
        message.did.clone(),
        collection,
        commit.rkey.clone(),
        operation,
        "",
        message.time_us.to_string(),
    );

    match (operation, commit.record.as_ref()) {
        (Operation::Delete, _) | (_, None) => Some(event),
        (_, Some(record)) => {
            let mut event = Event {
                text: record.text.clone(),
                ..event
            }
            .with_langs(record.langs.iter().cloned());
            if let Some(reply) = &record.reply {
                event = event.with_reply(reply.parent.uri.clone(), reply.root.uri.clone());
            }
            Some(event)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::POST_COLLECTION;

    const CREATE: &str = r#"{
        "did": "did:plc:eygmaihciaxprqvxpfvl6flk",
        "time_us": 1725911162329308,
        "kind": "commit",
        "commit": {
            "rev": "3l3qo2vutsw2b",
            "operation": "create",
            "collection": "app.bsky.feed.post",
            "rkey": "3l3qo2vuowo2b",
            "record": {
                "$type": "app.bsky.feed.post",
                "createdAt": "2024-09-09T19:46:02.102Z",
                "langs": ["en"],
                "reply": {
                    "parent": {"cid": "bafyparent", "uri": "at://did:plc:a/app.bsky.feed.post/p"},
                    "root": {"cid": "bafyroot", "uri": "at://did:plc:a/app.bsky.feed.post/r"}
                },
                "text": "hello firehose"
            },
            "cid": "bafyreidwaivazkwu67xztlmuobx35hs2lnfh3kolmgfmucldvhd3sgzcqi"
        }
    }"#;

    fn parse(raw: &str) -> JetstreamMessage {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_create_commit_normalizes() {
        let event = normalize(&parse(CREATE), POST_COLLECTION).unwrap();
        assert_eq!(
            event.uri,
            "at://did:plc:eygmaihciaxprqvxpfvl6flk/app.bsky.feed.post/3l3qo2vuowo2b"
        );
        assert_eq!(event.text, "hello firehose");
        assert_eq!(event.langs, vec!["en"]);
        assert_eq!(event.time_us, "1725911162329308");
        assert_eq!(event.parent_uri.as_deref(), Some("at://did:plc:a/app.bsky.feed.post/p"));
        assert_eq!(event.root_uri.as_deref(), Some("at://did:plc:a/app.bsky.feed.post/r"));
    }

    #[test]
    fn test_delete_has_empty_text() {
        let raw = r#"{"did":"did:plc:x","time_us":2,"kind":"commit",
            "commit":{"rev":"r","operation":"delete","collection":"app.bsky.feed.post","rkey":"k"}}"#;
        let event = normalize(&parse(raw), POST_COLLECTION).unwrap();
        assert_eq!(event.operation, Operation::Delete);
        assert!(event.text.is_empty());
    }

    #[test]
    fn test_other_frames_are_skipped() {
        let identity = r#"{"did":"did:plc:x","time_us":3,"kind":"identity",
            "identity":{"did":"did:plc:x","handle":"x.bsky.social","seq":1,"time":"2024-09-09T19:46:02Z"}}"#;
        assert!(normalize(&parse(identity), POST_COLLECTION).is_none());

        let like = r#"{"did":"did:plc:x","time_us":4,"kind":"commit",
            "commit":{"rev":"r","operation":"create","collection":"app.bsky.feed.like","rkey":"k",
            "record":{"subject":{"uri":"at://x","cid":"c"}}}}"#;
        assert!(normalize(&parse(like), POST_COLLECTION).is_none());
    }
}
