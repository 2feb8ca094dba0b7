/// Event model flowing through the pipeline
///
/// One `Event` maps to exactly one stream entry. The field names in `fields`
/// are the wire contract shared by every stream the pipeline reads or writes.
use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Collection used when a uri has to be derived from did + rkey
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Stream entry field names
pub mod fields {
    pub const DID: &str = "did";
    pub const TIME_US: &str = "timeUs";
    pub const TEXT: &str = "text";
    pub const LANGS: &str = "langs";
    pub const OPERATION: &str = "operation";
    pub const RKEY: &str = "rkey";
    pub const PARENT_URI: &str = "parentUri";
    pub const ROOT_URI: &str = "rootUri";
    pub const URI: &str = "uri";
    pub const SIMILARITY_SCORE: &str = "similarityScore";
}

const LANG_SEPARATOR: char = '|';

/// Record operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(PipelineError::Decode(format!("unknown operation '{}'", other))),
        }
    }
}

/// Canonical pipeline event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub did: String,
    pub rkey: String,
    pub text: String,
    pub time_us: String,
    pub operation: Operation,
    pub uri: String,
    pub parent_uri: Option<String>,
    pub root_uri: Option<String>,
    pub langs: Vec<String>,
    pub similarity_score: Option<f64>,
    /// Filled by the topic extraction stage, not part of the stream schema
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Build the `at://` uri for a record
pub fn record_uri(did: &str, collection: &str, rkey: &str) -> String {
    format!("at://{}/{}/{}", did, collection, rkey)
}

impl Event {
    /// Create an event with its uri derived from did, collection and rkey
    pub fn new(
        did: impl Into<String>,
        collection: &str,
        rkey: impl Into<String>,
        operation: Operation,
        text: impl Into<String>,
        time_us: impl Into<String>,
    ) -> Self {
        let did = did.into();
        let rkey = rkey.into();
        let uri = record_uri(&did, collection, &rkey);
        Self {
            did,
            rkey,
            text: text.into(),
            time_us: time_us.into(),
            operation,
            uri,
            parent_uri: None,
            root_uri: None,
            langs: Vec::new(),
            similarity_score: None,
            topics: Vec::new(),
        }
    }

    pub fn with_langs<I, S>(mut self, langs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.langs = langs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reply(mut self, parent_uri: impl Into<String>, root_uri: impl Into<String>) -> Self {
        self.parent_uri = Some(parent_uri.into());
        self.root_uri = Some(root_uri.into());
        self
    }

    /// Serialize to the stream entry field list
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (fields::DID, self.did.clone()),
            (fields::TIME_US, self.time_us.clone()),
            (fields::TEXT, self.text.clone()),
            (fields::LANGS, self.langs.join(&LANG_SEPARATOR.to_string())),
            (fields::OPERATION, self.operation.as_str().to_string()),
            (fields::RKEY, self.rkey.clone()),
            (fields::PARENT_URI, self.parent_uri.clone().unwrap_or_default()),
            (fields::ROOT_URI, self.root_uri.clone().unwrap_or_default()),
            (fields::URI, self.uri.clone()),
            (
                fields::SIMILARITY_SCORE,
                self.similarity_score.map(|s| s.to_string()).unwrap_or_default(),
            ),
        ]
    }

    /// Decode from a stream entry field map
    ///
    /// A missing uri is derived from did + rkey with the post collection; an
    /// entry with neither is rejected since it has no dedup key.
    pub fn from_fields(map: &HashMap<String, String>) -> PipelineResult<Self> {
        let get = |name: &str| map.get(name).cloned().unwrap_or_default();
        let optional = |name: &str| map.get(name).filter(|v| !v.is_empty()).cloned();

        let did = get(fields::DID);
        let rkey = get(fields::RKEY);
        let mut uri = get(fields::URI);
        if uri.is_empty() {
            if did.is_empty() || rkey.is_empty() {
                return Err(PipelineError::Decode(
                    "entry has no uri and no did/rkey to derive one".to_string(),
                ));
            }
            uri = record_uri(&did, POST_COLLECTION, &rkey);
        }

        let operation = Operation::parse(&get(fields::OPERATION))?;

        let langs = map
            .get(fields::LANGS)
            .map(|raw| {
                raw.split(LANG_SEPARATOR)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let similarity_score = match optional(fields::SIMILARITY_SCORE) {
            Some(raw) => Some(raw.parse::<f64>().map_err(|_| {
                PipelineError::Decode(format!("invalid similarity score '{}'", raw))
            })?),
            None => None,
        };

        Ok(Self {
            did,
            rkey,
            text: get(fields::TEXT),
            time_us: get(fields::TIME_US),
            operation,
            uri,
            parent_uri: optional(fields::PARENT_URI),
            root_uri: optional(fields::ROOT_URI),
            langs,
            similarity_score,
            topics: Vec::new(),
        })
    }

    /// Timestamp in microseconds, if `time_us` parses
    pub fn time_micros(&self) -> Option<i64> {
        self.time_us.parse().ok()
    }
}

/// Opaque append-log record
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, fields: HashMap<String, String>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}
