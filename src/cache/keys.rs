//! Key naming convention for cached aggregates.
//!
//! Keys are built from templates with `{param}` placeholders so writers and
//! the invalidation rules agree on the exact key for a given subject.

use std::collections::BTreeMap;

use super::error::CacheError;

pub const PARAM_SUBJECT: &str = "subject";
pub const PARAM_RECORD: &str = "record";
pub const PARAM_LIST: &str = "list";
pub const PARAM_LOCALITY: &str = "locality";

/// Parameters substituted into a [`KeyTemplate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyParams(BTreeMap<String, String>);

impl KeyParams {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subject(subject_id: impl Into<String>) -> Self {
    Self::new().with(PARAM_SUBJECT, subject_id)
  }

  pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.0.insert(name.into(), value.into());
    self
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(name).map(String::as_str)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

/// A key with `{param}` placeholders, e.g. `recent:{subject}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyTemplate(pub &'static str);

impl KeyTemplate {
  /// Substitute every placeholder, failing on the first missing parameter.
  pub fn render(&self, params: &KeyParams) -> Result<String, CacheError> {
    let mut out = String::with_capacity(self.0.len() + 16);
    let mut rest = self.0;

    while let Some(start) = rest.find('{') {
      out.push_str(&rest[..start]);
      let after = &rest[start + 1..];
      let Some(end) = after.find('}') else {
        // Unterminated brace is literal text
        out.push_str(&rest[start..]);
        return Ok(out);
      };
      let name = &after[..end];
      let value = params
        .get(name)
        .ok_or_else(|| CacheError::MissingKeyParam {
          template: self.0,
          param: name.to_string(),
        })?;
      out.push_str(value);
      rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
  }

  /// Render a template that takes a single parameter.
  pub fn fill(&self, name: &str, value: &str) -> String {
    self.0.replace(&format!("{{{}}}", name), value)
  }

  pub fn for_subject(&self, subject_id: &str) -> String {
    self.fill(PARAM_SUBJECT, subject_id)
  }
}

pub const PROFILE: KeyTemplate = KeyTemplate("profile:{subject}");
pub const SUBSCRIPTION: KeyTemplate = KeyTemplate("subscription:{subject}");
pub const BUDGET: KeyTemplate = KeyTemplate("budget:{subject}");
pub const RECENT_RECEIPTS: KeyTemplate = KeyTemplate("recent:{subject}");
pub const RECEIPT: KeyTemplate = KeyTemplate("receipt:{record}");
pub const RECEIPT_STATS: KeyTemplate = KeyTemplate("stats:{subject}");
pub const HOME_DATA: KeyTemplate = KeyTemplate("home:{subject}");
pub const SHOPPING_LISTS: KeyTemplate = KeyTemplate("lists:{subject}");
pub const SHOPPING_LIST: KeyTemplate = KeyTemplate("list:{list}");
pub const LOCALITY_PRICES: KeyTemplate = KeyTemplate("locality:{locality}");
