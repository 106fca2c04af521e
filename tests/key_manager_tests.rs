// tests/key_manager_tests.rs

mod common;

use common::MockClock;
use llm_rotator::key_manager::fingerprint;
use llm_rotator::{ErrorKind, KeyManager, RotatorConfig, SelectError, TokenUsage};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

fn pool(provider: &str, keys: &[&str]) -> HashMap<String, Vec<String>> {
    HashMap::from([(
        provider.to_string(),
        keys.iter().map(|k| k.to_string()).collect(),
    )])
}

fn manager_with(
    keys: &[&str],
    config: RotatorConfig,
) -> (Arc<KeyManager>, Arc<MockClock>) {
    let clock = Arc::new(MockClock::new());
    let manager = KeyManager::new(
        &pool("openai", keys),
        config,
        Arc::clone(&clock) as Arc<dyn llm_rotator::Clock>,
    )
        .expect("pool is valid");
    (Arc::new(manager), clock)
}

fn none() -> HashSet<String> {
    HashSet::new()
}

#[tokio::test]
async fn empty_pool_is_a_configuration_error() {
    let clock = Arc::new(MockClock::new());
    let result = KeyManager::new(
        &pool("openai", &["", "  "]),
        RotatorConfig::default(),
        clock,
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn busy_key_is_passed_over_for_an_idle_one() {
    let (manager, clock) = manager_with(&["k1", "k2"], RotatorConfig::default());
    let deadline = clock.current() + chrono::Duration::seconds(10);

    let first = manager
        .select_key("openai", "gpt-x", deadline, &none())
        .await
        .unwrap();
    assert_eq!(first.fingerprint(), fingerprint("k1"));

    // Same model again: k1's mutex is held, k2 takes it immediately.
    let second = manager
        .select_key("openai", "gpt-x", deadline, &none())
        .await
        .unwrap();
    assert_eq!(second.fingerprint(), fingerprint("k2"));
}

#[tokio::test]
async fn same_pair_wait_times_out_at_the_deadline() {
    let (manager, clock) = manager_with(&["k1"], RotatorConfig::default());
    let deadline = clock.current() + chrono::Duration::seconds(10);

    let held = manager
        .select_key("openai", "gpt-x", deadline, &none())
        .await
        .unwrap();

    let short_deadline = clock.current() + chrono::Duration::seconds(1);
    let err = manager
        .select_key("openai", "gpt-x", short_deadline, &none())
        .await
        .unwrap_err();
    assert_eq!(err, SelectError::DeadlineExceeded);

    drop(held);
    let lease = manager
        .select_key(
            "openai",
            "gpt-x",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await;
    assert!(lease.is_ok());
}

#[tokio::test]
async fn distinct_models_share_a_key_up_to_the_gate() {
    let config = RotatorConfig {
        max_concurrent_models_per_key: 2,
        ..Default::default()
    };
    let (manager, clock) = manager_with(&["k1"], config);
    let deadline = clock.current() + chrono::Duration::seconds(10);

    let a = manager
        .select_key("openai", "model-a", deadline, &none())
        .await
        .unwrap();
    let _b = manager
        .select_key("openai", "model-b", deadline, &none())
        .await
        .unwrap();

    // The gate is full: a third model cannot board this key.
    let err = manager
        .select_key(
            "openai",
            "model-c",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, SelectError::DeadlineExceeded);

    drop(a);
    let c = manager
        .select_key(
            "openai",
            "model-c",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await;
    assert!(c.is_ok());
}

#[tokio::test]
async fn double_release_is_a_noop() {
    let (manager, clock) = manager_with(&["k1"], RotatorConfig::default());
    let deadline = clock.current() + chrono::Duration::seconds(10);

    let mut lease = manager
        .select_key("openai", "gpt-x", deadline, &none())
        .await
        .unwrap();
    lease.release();
    lease.release();
    drop(lease);

    // Pool state is intact: the same pair is immediately acquirable.
    let again = manager
        .select_key("openai", "gpt-x", deadline, &none())
        .await;
    assert!(again.is_ok());
}

#[tokio::test]
async fn excluded_keys_are_never_considered() {
    let (manager, clock) = manager_with(&["k1", "k2"], RotatorConfig::default());
    let deadline = clock.current() + chrono::Duration::seconds(10);

    let exclude = HashSet::from([fingerprint("k1")]);
    let lease = manager
        .select_key("openai", "gpt-x", deadline, &exclude)
        .await
        .unwrap();
    assert_eq!(lease.fingerprint(), fingerprint("k2"));
    drop(lease);

    let all = HashSet::from([fingerprint("k1"), fingerprint("k2")]);
    let before = clock.current();
    let err = manager
        .select_key("openai", "gpt-x", deadline, &all)
        .await
        .unwrap_err();
    assert_eq!(err, SelectError::Exhausted);
    // Exhaustion is detected immediately, without burning the deadline.
    assert_eq!(clock.current(), before);
}

#[tokio::test]
async fn unknown_provider_is_exhausted_immediately() {
    let (manager, clock) = manager_with(&["k1"], RotatorConfig::default());
    let deadline = clock.current() + chrono::Duration::seconds(10);
    let err = manager
        .select_key("anthropic", "claude", deadline, &none())
        .await
        .unwrap_err();
    assert_eq!(err, SelectError::Exhausted);
}

#[tokio::test]
async fn rate_limit_cooldown_escalates_with_strikes() {
    let (manager, clock) = manager_with(&["k1"], RotatorConfig::default());
    let key = manager.any_key_for("openai").unwrap();

    // First strike: 30s * 2^1 = 60s.
    manager.record_failure(&key, "gpt-x", ErrorKind::RateLimit);
    clock.advance(Duration::from_secs(59));
    let err = manager
        .select_key(
            "openai",
            "gpt-x",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, SelectError::DeadlineExceeded);

    // The wait above carried us to the expiry boundary.
    let lease = manager
        .select_key(
            "openai",
            "gpt-x",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .unwrap();
    drop(lease);

    // Second strike: 30s * 2^2 = 120s.
    manager.record_failure(&key, "gpt-x", ErrorKind::RateLimit);
    clock.advance(Duration::from_secs(119));
    assert!(manager
        .select_key(
            "openai",
            "gpt-x",
            clock.current() + chrono::Duration::milliseconds(100),
            &none(),
        )
        .await
        .is_err());
    clock.advance(Duration::from_secs(1));
    assert!(manager
        .select_key(
            "openai",
            "gpt-x",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .is_ok());
}

#[tokio::test]
async fn cooldown_scopes_to_the_failing_model_only() {
    let (manager, clock) = manager_with(&["k1"], RotatorConfig::default());
    let key = manager.any_key_for("openai").unwrap();

    manager.record_failure(&key, "gpt-x", ErrorKind::RateLimit);

    // A different model on the same key is unaffected.
    let lease = manager
        .select_key(
            "openai",
            "gpt-y",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await;
    assert!(lease.is_ok());
}

#[tokio::test]
async fn authentication_failures_strike_twice() {
    let (manager, clock) = manager_with(&["k1"], RotatorConfig::default());
    let key = manager.any_key_for("openai").unwrap();

    // Two strikes at once: 30s * 2^2 = 120s.
    manager.record_failure(&key, "gpt-x", ErrorKind::Authentication);
    clock.advance(Duration::from_secs(119));
    assert!(manager
        .select_key(
            "openai",
            "gpt-x",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .is_err());
    clock.advance(Duration::from_secs(2));
    assert!(manager
        .select_key(
            "openai",
            "gpt-x",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .is_ok());
}

#[tokio::test]
async fn quota_exhaustion_sidelines_the_pair_until_midnight() {
    let (manager, clock) = manager_with(&["k1"], RotatorConfig::default());
    let key = manager.any_key_for("openai").unwrap();

    // MockClock starts at 08:00; local midnight is 16h away.
    manager.record_failure(&key, "gpt-x", ErrorKind::QuotaExhausted);
    clock.advance(Duration::from_secs(15 * 3600));
    assert!(manager
        .select_key(
            "openai",
            "gpt-x",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .is_err());

    clock.advance(Duration::from_secs(3600 + 1));
    assert!(manager
        .select_key(
            "openai",
            "gpt-x",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .is_ok());
}

#[tokio::test]
async fn distinct_model_failures_trigger_a_key_lockout() {
    let (manager, clock) = manager_with(&["k1"], RotatorConfig::default());
    let key = manager.any_key_for("openai").unwrap();

    manager.record_failure(&key, "model-a", ErrorKind::Authentication);
    manager.record_failure(&key, "model-b", ErrorKind::Authentication);
    manager.record_failure(&key, "model-c", ErrorKind::Authentication);

    // The lockout covers models that never failed themselves.
    assert!(manager
        .select_key(
            "openai",
            "model-d",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .is_err());

    // After the 15-minute window the key serves again, and the failure
    // set was cleared: a single new failure does not re-lock it.
    clock.advance(Duration::from_secs(900));
    let lease = manager
        .select_key(
            "openai",
            "model-d",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .unwrap();
    drop(lease);

    manager.record_failure(&key, "model-e", ErrorKind::Authentication);
    assert!(manager
        .select_key(
            "openai",
            "model-f",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .is_ok());
}

#[tokio::test]
async fn transient_failures_leave_key_state_untouched() {
    let (manager, clock) = manager_with(&["k1"], RotatorConfig::default());
    let key = manager.any_key_for("openai").unwrap();

    manager.record_failure(&key, "gpt-x", ErrorKind::TransientServer);
    manager.record_failure(&key, "gpt-x", ErrorKind::BadRequest);
    manager.record_failure(&key, "gpt-x", ErrorKind::ContextLength);

    assert!(manager
        .select_key(
            "openai",
            "gpt-x",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .is_ok());
}

#[tokio::test]
async fn daily_reset_archives_usage_and_clears_penalties() {
    let (manager, clock) = manager_with(&["k1"], RotatorConfig::default());
    let key = manager.any_key_for("openai").unwrap();

    manager.record_success(
        &key,
        "gpt-x",
        TokenUsage {
            prompt_tokens: 5,
            completion_tokens: 7,
        },
    );
    manager.record_success(
        &key,
        "gpt-x",
        TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 1,
        },
    );
    manager.record_failure(&key, "gpt-x", ErrorKind::QuotaExhausted);

    let before = manager.snapshot();
    let entry = &before.keys[&fingerprint("k1")];
    assert_eq!(entry.usage_today.calls, 2);
    assert_eq!(entry.usage_today.prompt_tokens, 6);
    assert_eq!(entry.usage_total.calls, 0);

    clock.advance(Duration::from_secs(24 * 3600));
    manager.daily_reset_if_needed();

    let after = manager.snapshot();
    let entry = &after.keys[&fingerprint("k1")];
    assert_eq!(entry.usage_today.calls, 0);
    assert_eq!(entry.usage_total.calls, 2);
    assert_eq!(entry.usage_total.completion_tokens, 8);
    assert!(after.last_reset_date > before.last_reset_date);

    // The quota cooldown did not survive the rollover.
    assert!(manager
        .select_key(
            "openai",
            "gpt-x",
            clock.current() + chrono::Duration::seconds(1),
            &none(),
        )
        .await
        .is_ok());
}

#[tokio::test]
async fn daily_reset_is_idempotent() {
    let (manager, clock) = manager_with(&["k1"], RotatorConfig::default());
    let key = manager.any_key_for("openai").unwrap();
    manager.record_success(
        &key,
        "gpt-x",
        TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 1,
        },
    );

    clock.advance(Duration::from_secs(24 * 3600));
    manager.daily_reset_if_needed();
    manager.daily_reset_if_needed();

    let snapshot = manager.snapshot();
    let entry = &snapshot.keys[&fingerprint("k1")];
    assert_eq!(entry.usage_total.calls, 1);
    assert_eq!(entry.usage_today.calls, 0);
}

#[tokio::test]
async fn snapshot_restore_round_trips() {
    let (manager, _clock) = manager_with(&["k1", "k2"], RotatorConfig::default());
    let key = manager.any_key_for("openai").unwrap();
    manager.record_success(
        &key,
        "gpt-x",
        TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 4,
        },
    );

    let saved = manager.snapshot();

    let (fresh, _clock) = manager_with(&["k1", "k2"], RotatorConfig::default());
    fresh.restore(&saved);
    assert_eq!(fresh.snapshot(), saved);
}
