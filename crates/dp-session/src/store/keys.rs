//! Cache key layout for one session.
//!
//! Every key is `{scope}:{user}:{dataset}:{purpose}`. Components are escaped
//! (`%` → `%25`, `:` → `%3A`) so ids containing a colon cannot collide with
//! another user's or dataset's keys.

/// Key builder bound to one (scope, user, dataset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    scope: String,
    user_id: String,
    dataset_id: String,
    prefix: String,
}

impl SessionKeys {
    pub fn new(scope: &str, user_id: &str, dataset_id: &str) -> Self {
        let prefix = format!(
            "{}:{}:{}",
            escape(scope),
            escape(user_id),
            escape(dataset_id)
        );
        Self {
            scope: scope.to_string(),
            user_id: user_id.to_string(),
            dataset_id: dataset_id.to_string(),
            prefix,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    /// `{scope}:{user}:{dataset}:`, the prefix shared by every key of the
    /// session.
    pub fn session_prefix(&self) -> String {
        format!("{}:", self.prefix)
    }

    pub fn current(&self) -> String {
        self.key("current")
    }

    pub fn original(&self) -> String {
        self.key("original")
    }

    pub fn meta(&self) -> String {
        self.key("meta")
    }

    pub fn lock(&self) -> String {
        self.key("lock")
    }

    /// Pre-operation snapshot of step `step`.
    pub fn history(&self, step: u64) -> String {
        format!("{}:history:{step}", self.prefix)
    }

    pub fn history_meta(&self, step: u64) -> String {
        format!("{}:history:{step}:meta", self.prefix)
    }

    /// Post-operation snapshot of step `step`.
    pub fn redo(&self, step: u64) -> String {
        format!("{}:redo:{step}", self.prefix)
    }

    /// The three keys one ledger entry occupies.
    pub fn entry_keys(&self, step: u64) -> [String; 3] {
        [self.history(step), self.history_meta(step), self.redo(step)]
    }

    /// Prefix for scanning every session in `scope`.
    pub fn scope_prefix(scope: &str) -> String {
        format!("{}:", escape(scope))
    }

    /// Recover `(user, dataset)` from a descriptor key of `scope`, or `None`
    /// for any other key.
    pub fn parse_meta_key(scope: &str, key: &str) -> Option<(String, String)> {
        let rest = key.strip_prefix(&Self::scope_prefix(scope))?;
        let mut parts = rest.split(':');
        let user = parts.next()?;
        let dataset = parts.next()?;
        match (parts.next(), parts.next()) {
            (Some("meta"), None) => Some((unescape(user)?, unescape(dataset)?)),
            _ => None,
        }
    }

    fn key(&self, purpose: &str) -> String {
        format!("{}:{purpose}", self.prefix)
    }
}

fn escape(component: &str) -> String {
    component.replace('%', "%25").replace(':', "%3A")
}

fn unescape(component: &str) -> Option<String> {
    let mut out = String::with_capacity(component.len());
    let mut rest = component;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let code = rest.get(idx + 1..idx + 3)?;
        out.push(match code {
            "25" => '%',
            "3A" => ':',
            _ => return None,
        });
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_schema() {
        let keys = SessionKeys::new("dp", "alice", "sales");
        assert_eq!(keys.current(), "dp:alice:sales:current");
        assert_eq!(keys.original(), "dp:alice:sales:original");
        assert_eq!(keys.meta(), "dp:alice:sales:meta");
        assert_eq!(keys.history(3), "dp:alice:sales:history:3");
        assert_eq!(keys.history_meta(3), "dp:alice:sales:history:3:meta");
        assert_eq!(keys.redo(3), "dp:alice:sales:redo:3");
        assert_eq!(keys.session_prefix(), "dp:alice:sales:");
    }

    #[test]
    fn colons_in_ids_do_not_collide() {
        let a = SessionKeys::new("dp", "alice:x", "y");
        let b = SessionKeys::new("dp", "alice", "x:y");
        assert_ne!(a.current(), b.current());
        assert!(!a.current().starts_with(&b.session_prefix()));
    }

    #[test]
    fn parses_descriptor_keys_only() {
        let keys = SessionKeys::new("dp", "bob:1", "50%");
        assert_eq!(
            SessionKeys::parse_meta_key("dp", &keys.meta()),
            Some(("bob:1".to_string(), "50%".to_string()))
        );
        assert_eq!(SessionKeys::parse_meta_key("dp", &keys.history_meta(0)), None);
        assert_eq!(SessionKeys::parse_meta_key("dp", &keys.current()), None);
        assert_eq!(SessionKeys::parse_meta_key("other", &keys.meta()), None);
    }
}
