//! Mountpoint CLI argument set (component A). A set of `(key, value)` pairs
//! where `value` may be empty, normalized to a canonical `--key[=value]`
//! serialization.

use std::collections::BTreeMap;

use tracing::warn;

/// Flags that are never handed to Mountpoint: unsupported switches the
/// driver strips unconditionally at parse time (spec §6).
const UNSUPPORTED_AT_PARSE: &[&str] = &["foreground", "f", "help", "h", "version", "v"];

/// Flags that are stripped later, via [`ArgumentSet::apply_policy`], each
/// with a reason surfaced in the warning log (spec §4.A, §6).
const POLICY_STRIPPED: &[(&str, &str)] = &[
    ("endpoint-url", "per-volume endpoint overrides are rejected; set AWS_ENDPOINT_URL at the driver level"),
    ("cache-xz", "vendor-specific cache flag is not supported by this driver"),
    ("incremental-upload", "vendor-specific upload flag is not supported by this driver"),
    ("storage-class", "storage-class overrides are not supported by this driver"),
    ("profile", "profile overrides are not supported by this driver"),
];

/// A normalized, deduplicated set of Mountpoint CLI arguments.
///
/// Invariant: no duplicate keys; [`ArgumentSet::sorted_list`] is stable
/// across equal inputs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArgumentSet {
    values: BTreeMap<String, String>,
}

impl ArgumentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a flat list of tokens in any of the accepted forms: `key`,
    /// `--key`, `key=v`, `--key=v`, or two-token `key v` / `--key v`.
    /// Unsupported switches are dropped silently (they're not flags this
    /// driver's callers would reasonably pass).
    pub fn parse<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = ArgumentSet::new();
        let tokens: Vec<String> = tokens.into_iter().map(|s| s.as_ref().trim().to_string()).filter(|s| !s.is_empty()).collect();

        let mut i = 0;
        while i < tokens.len() {
            let tok = strip_dashes(&tokens[i]);
            if let Some((key, value)) = tok.split_once('=') {
                set.insert_if_supported(key.trim(), value.trim());
                i += 1;
                continue;
            }
            // Two-token form: `key value`, unless the next token looks like
            // another flag (starts with `-`) or there is no next token.
            if i + 1 < tokens.len() && !tokens[i + 1].starts_with('-') {
                set.insert_if_supported(&tok, tokens[i + 1].trim());
                i += 2;
            } else {
                set.insert_if_supported(&tok, "");
                i += 1;
            }
        }
        set
    }

    fn insert_if_supported(&mut self, key: &str, value: &str) {
        if key.is_empty() || UNSUPPORTED_AT_PARSE.contains(&key) {
            return;
        }
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(strip_dashes(key).as_str())
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(strip_dashes(key).as_str()).map(String::as_str)
    }

    /// Sets `key`, overwriting any existing value (last wins).
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(strip_dashes(key).to_string(), value.into());
    }

    /// Sets `key` only if absent (first wins).
    pub fn set_if_absent(&mut self, key: &str, value: impl Into<String>) {
        self.values.entry(strip_dashes(key).to_string()).or_insert_with(|| value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(strip_dashes(key).as_str())
    }

    /// Strips flags the driver forbids, logging a warning naming the reason
    /// for each removal (spec §4.A).
    pub fn apply_policy(&mut self) {
        for (key, reason) in POLICY_STRIPPED {
            if self.remove(key).is_some() {
                warn!(flag = %key, reason, "stripped disallowed Mountpoint argument");
            }
        }
    }

    /// Moves `--aws-max-attempts` into the given environment set as
    /// `AWS_MAX_ATTEMPTS`, removing it from the argument set (spec §4.A).
    pub fn move_max_attempts_to_env(&mut self, env: &mut crate::env::EnvironmentSet) {
        if let Some(value) = self.remove("aws-max-attempts") {
            env.set("AWS_MAX_ATTEMPTS", value);
        }
    }

    /// Deterministic, sorted `--key` / `--key=value` serialization.
    pub fn sorted_list(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    format!("--{k}")
                } else {
                    format!("--{k}={v}")
                }
            })
            .collect()
    }
}

fn strip_dashes(key: &str) -> String {
    key.trim_start_matches('-').to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_accepts_all_documented_forms() {
        let set = ArgumentSet::parse(["--region=us-west-2", "debug", "--allow-other"]);
        assert_eq!(set.value("region"), Some("us-west-2"));
        assert!(set.has("debug"));
        assert!(set.has("allow-other"));
        assert_eq!(set.value("debug"), Some(""));
    }

    #[test]
    fn parse_two_token_form() {
        let set = ArgumentSet::parse(["--region", "us-west-2"]);
        assert_eq!(set.value("region"), Some("us-west-2"));
    }

    #[test]
    fn parse_strips_unsupported_switches() {
        let set = ArgumentSet::parse(["--foreground", "--help", "-v", "--region=us-east-1"]);
        assert!(!set.has("foreground"));
        assert!(!set.has("help"));
        assert!(!set.has("v"));
        assert_eq!(set.value("region"), Some("us-east-1"));
    }

    #[test]
    fn duplicate_keys_dedupe_last_wins_on_set() {
        let mut set = ArgumentSet::parse(["--region=us-west-2"]);
        set.set("region", "eu-west-1");
        assert_eq!(set.value("region"), Some("eu-west-1"));
    }

    #[test]
    fn set_if_absent_keeps_first() {
        let mut set = ArgumentSet::parse(["--region=us-west-2"]);
        set.set_if_absent("region", "eu-west-1");
        assert_eq!(set.value("region"), Some("us-west-2"));
    }

    #[test]
    fn sorted_list_is_stable_and_deterministic() {
        let mut a = ArgumentSet::new();
        a.set("zeta", "1");
        a.set("alpha", "2");
        a.set("flag", "");
        assert_eq!(a.sorted_list(), vec!["--alpha=2", "--flag", "--zeta=1"]);
    }

    #[test]
    fn parse_is_idempotent_under_reparse() {
        let first = ArgumentSet::parse(["--region=us-west-2", "--debug"]);
        let serialized = first.sorted_list();
        let second = ArgumentSet::parse(serialized.clone());
        assert_eq!(second.sorted_list(), serialized);
    }

    #[test]
    fn apply_policy_strips_forbidden_flags_with_warning() {
        let mut set = ArgumentSet::parse(["--endpoint-url=http://evil", "--profile=x", "--region=us-west-2"]);
        set.apply_policy();
        assert!(!set.has("endpoint-url"));
        assert!(!set.has("profile"));
        assert!(set.has("region"));
    }

    #[test]
    fn move_max_attempts_to_env_relocates_value() {
        let mut args = ArgumentSet::parse(["--aws-max-attempts=5", "--region=us-west-2"]);
        let mut env = crate::env::EnvironmentSet::new();
        args.move_max_attempts_to_env(&mut env);
        assert!(!args.has("aws-max-attempts"));
        assert_eq!(env.get("AWS_MAX_ATTEMPTS"), Some("5"));
    }
}
