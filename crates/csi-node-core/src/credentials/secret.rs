//! `secret`-sourced credentials (spec §4.D): a static access key pair
//! handed down in the volume context's secret map, validated before use.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::env::EnvironmentSet;
use crate::error::{MountError, Result};

static KEY_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z0-9]{1,16}$").expect("valid regex"));
static ACCESS_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9/+=]{1,40}$").expect("valid regex"));

pub fn provide(secret: &BTreeMap<String, String>) -> Result<EnvironmentSet> {
    let key_id = secret
        .get("key_id")
        .ok_or_else(|| MountError::invalid_input("credentials.provide", "secret authentication source requires a key_id"))?;
    let access_key = secret
        .get("access_key")
        .ok_or_else(|| MountError::invalid_input("credentials.provide", "secret authentication source requires an access_key"))?;

    if !KEY_ID_RE.is_match(key_id) {
        return Err(MountError::invalid_input("credentials.provide", "key_id does not match ^[A-Z0-9]{1,16}$"));
    }
    if !ACCESS_KEY_RE.is_match(access_key) {
        return Err(MountError::invalid_input("credentials.provide", "access_key does not match ^[A-Za-z0-9/+=]{1,40}$"));
    }

    let mut env = EnvironmentSet::new();
    env.set("AWS_ACCESS_KEY_ID", key_id.clone());
    env.set("AWS_SECRET_ACCESS_KEY", access_key.clone());
    Ok(env)
}

#[cfg(test)]
mod test {
    use super::*;

    fn secret(key_id: &str, access_key: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("key_id".to_string(), key_id.to_string()), ("access_key".to_string(), access_key.to_string())])
    }

    #[test]
    fn valid_pair_emits_env() {
        let env = provide(&secret("AKIAEXAMPLE12345", "abcDEF123+/=")).unwrap();
        assert_eq!(env.get("AWS_ACCESS_KEY_ID"), Some("AKIAEXAMPLE12345"));
        assert_eq!(env.get("AWS_SECRET_ACCESS_KEY"), Some("abcDEF123+/="));
    }

    #[test]
    fn rejects_malformed_key_id() {
        let err = provide(&secret("not-valid!", "abcDEF123")).unwrap_err();
        assert!(err.message.contains("key_id"));
    }

    #[test]
    fn rejects_malformed_access_key() {
        let err = provide(&secret("AKIAEXAMPLE", "has a space")).unwrap_err();
        assert!(err.message.contains("access_key"));
    }

    #[test]
    fn rejects_missing_keys() {
        let err = provide(&BTreeMap::new()).unwrap_err();
        assert!(err.message.contains("key_id"));
    }
}
