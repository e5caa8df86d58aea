//! Exercises the argument/environment policy pipeline end to end, the way
//! the Pod Mounter assembles them ahead of a mount, without touching the
//! filesystem or the kernel.

use csi_node_core::args::ArgumentSet;
use csi_node_core::env::EnvironmentSet;

#[test]
fn policy_then_max_attempts_relocation_produces_expected_argv_and_env() {
    let mut args = ArgumentSet::parse([
        "--region=us-west-2",
        "--read-only",
        "--aws-max-attempts=7",
        "--endpoint-url=http://169.254.169.254",
        "--allow-other",
    ]);
    let mut env = EnvironmentSet::new();

    args.apply_policy();
    assert!(!args.has("endpoint-url"), "driver-rejected flags must not reach Mountpoint");

    args.move_max_attempts_to_env(&mut env);
    assert_eq!(env.get("AWS_MAX_ATTEMPTS"), Some("7"));
    assert!(!args.has("aws-max-attempts"));

    args.remove("read-only");

    let argv = args.sorted_list();
    assert!(argv.contains(&"--allow-other".to_string()));
    assert!(argv.contains(&"--region=us-west-2".to_string()));
    assert!(!argv.iter().any(|a| a.starts_with("--read-only")));
}

#[test]
fn reparsing_a_serialized_argument_set_is_idempotent() {
    let first = ArgumentSet::parse(["--cache=/tmp/cache", "--debug", "--region=eu-west-1"]);
    let serialized = first.sorted_list();
    let second = ArgumentSet::parse(serialized.clone());
    assert_eq!(second.sorted_list(), serialized);
}

#[test]
fn environment_merge_prefers_credential_broker_values() {
    let mut base = EnvironmentSet::new();
    base.set("AWS_REGION", "us-east-1");
    let mut credential_env = EnvironmentSet::new();
    credential_env.set("AWS_REGION", "us-west-2");
    credential_env.set("AWS_ROLE_ARN", "arn:aws:iam::123456789012:role/example");

    base.merge(&credential_env);
    assert_eq!(base.get("AWS_REGION"), Some("us-west-2"));
    assert_eq!(base.get("AWS_ROLE_ARN"), Some("arn:aws:iam::123456789012:role/example"));
}
