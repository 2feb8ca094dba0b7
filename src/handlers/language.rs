use crate::{
    error::PipelineResult,
    event::Event,
    pipeline::{Decision, Handler},
};
use async_trait::async_trait;

/// Keeps events declared in one of the allowed languages
///
/// Tags are compared case-insensitively on their primary subtag, so `en-GB`
/// passes an `en` allow-list. An empty allow-list lets everything through.
pub struct LanguageHandler {
    allowed: Vec<String>,
}

fn primary_subtag(tag: &str) -> String {
    tag.split(['-', '_'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

impl LanguageHandler {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = allowed
            .into_iter()
            .map(|tag| primary_subtag(tag.as_ref()))
            .filter(|tag| !tag.is_empty())
            .collect();
        Self { allowed }
    }
}

#[async_trait]
impl Handler for LanguageHandler {
    fn name(&self) -> &'static str {
        "language"
    }

    async fn apply(&self, event: &mut Event) -> PipelineResult<Decision> {
        if self.allowed.is_empty() {
            return Ok(Decision::ok());
        }
        if event.langs.is_empty() {
            return Ok(Decision::stop("no declared language"));
        }
        if event
            .langs
            .iter()
            .any(|lang| self.allowed.contains(&primary_subtag(lang)))
        {
            return Ok(Decision::ok());
        }
        Ok(Decision::stop(format!(
            "language {} not allowed",
            event.langs.join(",")
        )))
    }
}
