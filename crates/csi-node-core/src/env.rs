//! Environment variable set (component B). A mapping from variable name to
//! value, sorted on output, with an allowlist-based `Default` constructor.

use std::collections::BTreeMap;

/// Variables [`EnvironmentSet::default_from_process`] will copy from the
/// process environment, and only these (spec §4.B).
const PROCESS_ALLOWLIST: &[&str] = &[
    "AWS_REGION",
    "AWS_DEFAULT_REGION",
    "AWS_STS_REGIONAL_ENDPOINTS",
    "AWS_ENDPOINT_URL",
];

/// A set of environment variables to hand to a Mountpoint process.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvironmentSet {
    values: BTreeMap<String, String>,
}

impl EnvironmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the fixed AWS region/STS-endpoint allowlist from the process
    /// environment, skipping any variable that is absent or empty.
    pub fn default_from_process() -> Self {
        let mut set = EnvironmentSet::new();
        for key in PROCESS_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    set.set(*key, value);
                }
            }
        }
        set
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn delete(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Right-biased merge: `other`'s values win on key collision.
    pub fn merge(&mut self, other: &EnvironmentSet) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }

    /// Sorted `"KEY=VALUE"` listing, handed to the helper pod over the mount
    /// options envelope or used to build a supervised service's environment.
    pub fn sorted_list(&self) -> Vec<String> {
        self.values.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_from_process_only_copies_allowlisted_nonempty_vars() {
        std::env::set_var("AWS_REGION", "us-west-2");
        std::env::set_var("AWS_DEFAULT_REGION", "");
        std::env::set_var("SOME_OTHER_VAR", "leak-me-not");
        let set = EnvironmentSet::default_from_process();
        assert_eq!(set.get("AWS_REGION"), Some("us-west-2"));
        assert_eq!(set.get("AWS_DEFAULT_REGION"), None);
        assert_eq!(set.get("SOME_OTHER_VAR"), None);
        std::env::remove_var("AWS_REGION");
        std::env::remove_var("AWS_DEFAULT_REGION");
        std::env::remove_var("SOME_OTHER_VAR");
    }

    #[test]
    fn merge_is_right_biased() {
        let mut a = EnvironmentSet::new();
        a.set("AWS_REGION", "us-west-2");
        let mut b = EnvironmentSet::new();
        b.set("AWS_REGION", "eu-west-1");
        a.merge(&b);
        assert_eq!(a.get("AWS_REGION"), Some("eu-west-1"));
    }

    #[test]
    fn sorted_list_is_lexicographic() {
        let mut set = EnvironmentSet::new();
        set.set("ZETA", "1");
        set.set("ALPHA", "2");
        assert_eq!(set.sorted_list(), vec!["ALPHA=2", "ZETA=1"]);
    }
}
