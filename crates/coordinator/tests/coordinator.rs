//! Coordinator behaviour against the in-memory registry and broker.

use std::collections::BTreeSet;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use herald_broker::BrokerBinding;
use herald_broker_memory::{MemoryBroker, Message};
use herald_coordinator::{
    BROADCAST_ROUTING_KEY, Direction, Error, ErrorKind, SubscriptionCoordinator,
    SubscriptionCoordinatorOptions, SubscriptionManagement, SubscriptionOutcome,
};
use herald_registry::Registry;
use herald_registry_memory::MemoryRegistry;

const EXCHANGE: &str = "notifications";

struct Harness {
    broker: MemoryBroker,
    coordinator: SubscriptionCoordinator<MemoryRegistry, MemoryBroker>,
    registry: MemoryRegistry,
}

fn harness_with_timeout(step_timeout: Duration) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let broker = MemoryBroker::new(EXCHANGE);
    let registry = MemoryRegistry::new();
    let coordinator = SubscriptionCoordinator::new(SubscriptionCoordinatorOptions {
        broker: broker.clone(),
        registry: registry.clone(),
        step_timeout,
    });

    Harness {
        broker,
        coordinator,
        registry,
    }
}

fn harness() -> Harness {
    harness_with_timeout(Duration::from_secs(1))
}

fn topics(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(ToString::to_string).collect()
}

fn binding(queue_name: &str, routing_key: &str) -> BrokerBinding {
    BrokerBinding {
        exchange: EXCHANGE.to_string(),
        queue_name: queue_name.to_string(),
        routing_key: routing_key.to_string(),
    }
}

#[tokio::test]
async fn test_weather_scenario() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness();

    assert_eq!(
        coordinator.subscribe("u1", "weather").await.unwrap(),
        SubscriptionOutcome::Added
    );
    assert_eq!(registry.topics("u1").await.unwrap(), topics(&["weather"]));
    assert_eq!(
        broker.queue_bindings("queue_u1"),
        topics(&[BROADCAST_ROUTING_KEY, "weather"])
    );

    assert_eq!(
        coordinator.subscribe("u1", "weather").await.unwrap(),
        SubscriptionOutcome::AlreadyPresent
    );
    assert_eq!(registry.topics("u1").await.unwrap(), topics(&["weather"]));

    assert_eq!(
        coordinator.unsubscribe("u1", "weather").await.unwrap(),
        SubscriptionOutcome::Removed
    );
    let record = registry.record("u1").await.unwrap().unwrap();
    assert!(record.topics.is_empty());
    assert!(broker.queue_bindings("queue_u1").is_empty());

    assert_eq!(
        coordinator.unsubscribe("u1", "sports").await.unwrap(),
        SubscriptionOutcome::NotPresent
    );
}

#[tokio::test]
async fn test_repeated_subscribe_leaves_single_entry_and_binding() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness();

    coordinator.subscribe("u1", "weather").await.unwrap();
    coordinator.subscribe("u1", "weather").await.unwrap();

    assert_eq!(registry.topics("u1").await.unwrap().len(), 1);
    assert_eq!(
        broker
            .bindings()
            .into_iter()
            .filter(|b| b.routing_key == "weather")
            .collect::<Vec<_>>(),
        vec![binding("queue_u1", "weather")]
    );
}

#[tokio::test]
async fn test_subscribe_then_unsubscribe_restores_empty_state() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness();

    let before = broker.bindings();

    coordinator.subscribe("u1", "weather").await.unwrap();
    coordinator.unsubscribe("u1", "weather").await.unwrap();

    assert!(registry.topics("u1").await.unwrap().is_empty());
    assert_eq!(broker.bindings(), before);
    assert!(broker.bindings().is_empty());
}

#[tokio::test]
async fn test_broadcast_binding_kept_while_topics_remain() {
    let Harness {
        broker, coordinator, ..
    } = harness();

    coordinator.subscribe("u1", "weather").await.unwrap();
    coordinator.subscribe("u1", "sports").await.unwrap();
    coordinator.unsubscribe("u1", "weather").await.unwrap();

    assert_eq!(
        broker.queue_bindings("queue_u1"),
        topics(&[BROADCAST_ROUTING_KEY, "sports"])
    );
}

#[tokio::test]
async fn test_unsubscribe_unknown_user_leaves_broker_untouched() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness();

    assert_eq!(
        coordinator.unsubscribe("ghost", "sports").await.unwrap(),
        SubscriptionOutcome::NotPresent
    );

    assert!(!broker.has_queue("queue_ghost"));
    assert_eq!(registry.record("ghost").await.unwrap(), None);
}

#[tokio::test]
async fn test_broker_failure_rolls_back_registry() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness();

    broker.fail_management(true);

    let result = coordinator.subscribe("u1", "weather").await;
    assert_matches!(
        result,
        Err(Error::BrokerBindingFailed { direction: Direction::Add, ref binding, .. })
            if *binding == binding_for("u1", "weather")
    );
    assert_eq!(registry.record("u1").await.unwrap(), None);
    assert!(broker.bindings().is_empty());

    // Both sides reverted, so a plain retry succeeds once the broker is back.
    broker.fail_management(false);
    assert_eq!(
        coordinator.subscribe("u1", "weather").await.unwrap(),
        SubscriptionOutcome::Added
    );
}

fn binding_for(user_id: &str, topic: &str) -> BrokerBinding {
    binding(&format!("queue_{user_id}"), topic)
}

#[tokio::test]
async fn test_broker_failure_during_unsubscribe_keeps_subscription() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness();

    coordinator.subscribe("u1", "weather").await.unwrap();
    broker.fail_management(true);

    assert_matches!(
        coordinator.unsubscribe("u1", "weather").await,
        Err(Error::BrokerBindingFailed {
            direction: Direction::Remove,
            ..
        })
    );

    assert_eq!(registry.topics("u1").await.unwrap(), topics(&["weather"]));
    assert!(broker.queue_bindings("queue_u1").contains("weather"));
}

#[tokio::test]
async fn test_commit_failure_after_bind_is_partial_failure() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness();

    registry.fail_commits(true);

    let error = coordinator.subscribe("u1", "weather").await.unwrap_err();
    assert_matches!(
        error,
        Error::PartialFailure {
            direction: Direction::Add,
            ref user_id,
            ref topic,
            ..
        } if user_id == "u1" && topic == "weather"
    );
    assert_eq!(error.kind(), ErrorKind::PartialFailure);
    assert_ne!(error.kind(), ErrorKind::BrokerBindingFailed);
    assert!(error.is_retryable());

    // The inconsistency window: broker bound, registry empty.
    assert!(broker.queue_bindings("queue_u1").contains("weather"));
    assert_eq!(registry.record("u1").await.unwrap(), None);

    // Retrying converges.
    registry.fail_commits(false);
    assert_eq!(
        coordinator.subscribe("u1", "weather").await.unwrap(),
        SubscriptionOutcome::Added
    );
    assert_eq!(registry.topics("u1").await.unwrap(), topics(&["weather"]));
    assert!(broker.queue_bindings("queue_u1").contains("weather"));
}

#[tokio::test]
async fn test_unsubscribe_retry_after_partial_failure_converges() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness();

    coordinator.subscribe("u1", "weather").await.unwrap();

    registry.fail_commits(true);
    assert_matches!(
        coordinator.unsubscribe("u1", "weather").await,
        Err(Error::PartialFailure {
            direction: Direction::Remove,
            ..
        })
    );
    assert!(broker.queue_bindings("queue_u1").is_empty());
    assert_eq!(registry.topics("u1").await.unwrap(), topics(&["weather"]));

    registry.fail_commits(false);
    assert_eq!(
        coordinator.unsubscribe("u1", "weather").await.unwrap(),
        SubscriptionOutcome::Removed
    );
    assert!(registry.topics("u1").await.unwrap().is_empty());
    assert!(broker.bindings().is_empty());
}

#[tokio::test]
async fn test_stray_binding_removed_even_when_registry_has_no_topic() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness();

    // Leave a broker-only binding behind.
    registry.fail_commits(true);
    let _ = coordinator.subscribe("u1", "weather").await;
    registry.fail_commits(false);

    assert_eq!(
        coordinator.unsubscribe("u1", "weather").await.unwrap(),
        SubscriptionOutcome::NotPresent
    );
    assert!(broker.bindings().is_empty());
}

#[tokio::test]
async fn test_concurrent_duplicate_subscribes() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness();

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.subscribe("u1", "weather").await })
    };
    let second = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.subscribe("u1", "weather").await })
    };

    let mut outcomes = vec![
        first.await.unwrap().unwrap(),
        second.await.unwrap().unwrap(),
    ];
    outcomes.sort_by_key(|outcome| outcome.as_str());

    assert_eq!(
        outcomes,
        vec![
            SubscriptionOutcome::Added,
            SubscriptionOutcome::AlreadyPresent
        ]
    );
    assert_eq!(registry.topics("u1").await.unwrap(), topics(&["weather"]));
    assert_eq!(
        broker.queue_bindings("queue_u1"),
        topics(&[BROADCAST_ROUTING_KEY, "weather"])
    );
}

#[tokio::test]
async fn test_concurrent_different_users_are_independent() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let user_id = format!("user{i}");
                coordinator.subscribe(&user_id, "weather").await
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), SubscriptionOutcome::Added);
    }

    for i in 0..16 {
        let user_id = format!("user{i}");
        assert_eq!(registry.topics(&user_id).await.unwrap(), topics(&["weather"]));
        assert!(
            broker
                .queue_bindings(&format!("queue_{user_id}"))
                .contains("weather")
        );
    }
}

#[tokio::test]
async fn test_slow_broker_times_out_and_aborts() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness_with_timeout(Duration::from_millis(50));

    broker.set_management_delay(Duration::from_millis(500));

    let error = coordinator.subscribe("u1", "weather").await.unwrap_err();
    assert_matches!(error, Error::BrokerBindingFailed { ref reason, .. } if reason.contains("timed out"));
    assert_eq!(registry.record("u1").await.unwrap(), None);

    // The aborted transaction released the record.
    broker.set_management_delay(Duration::ZERO);
    assert_eq!(
        coordinator.subscribe("u1", "weather").await.unwrap(),
        SubscriptionOutcome::Added
    );
}

#[tokio::test]
async fn test_slow_commit_is_partial_failure() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness_with_timeout(Duration::from_millis(50));

    registry.set_commit_delay(Duration::from_millis(500));

    assert_matches!(
        coordinator.subscribe("u1", "weather").await,
        Err(Error::PartialFailure { ref reason, .. }) if reason.contains("timed out")
    );
    assert!(broker.queue_bindings("queue_u1").contains("weather"));
}

#[tokio::test]
async fn test_registry_unavailable_touches_nothing() {
    let Harness {
        broker,
        coordinator,
        registry,
    } = harness();

    registry.fail_begin(true);

    let error = coordinator.subscribe("u1", "weather").await.unwrap_err();
    assert_matches!(error, Error::RegistryUnavailable(_));
    assert!(error.is_retryable());
    assert!(!broker.has_queue("queue_u1"));
}

#[tokio::test]
async fn test_invalid_arguments_rejected_before_io() {
    let Harness {
        broker, coordinator, ..
    } = harness();

    for (user_id, topic) in [("", "weather"), ("u1", ""), ("u1", "news.#"), ("u 1", "weather")] {
        let error = coordinator.subscribe(user_id, topic).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidArgument);
        assert!(!error.is_retryable());
    }

    assert_matches!(
        coordinator.unsubscribe("", "weather").await,
        Err(Error::InvalidArgument(_))
    );
    assert!(broker.bindings().is_empty());
}

#[tokio::test]
async fn test_subscriptions_query() {
    let Harness {
        coordinator,
        registry,
        ..
    } = harness();

    assert!(coordinator.subscriptions("nobody").await.unwrap().is_empty());

    coordinator.subscribe("u1", "weather").await.unwrap();
    coordinator.subscribe("u1", "sports").await.unwrap();
    assert_eq!(
        coordinator.subscriptions("u1").await.unwrap(),
        topics(&["sports", "weather"])
    );

    registry.fail_reads(true);
    assert_matches!(
        coordinator.subscriptions("u1").await,
        Err(Error::RegistryUnavailable(_))
    );
}

#[tokio::test]
async fn test_publish_reaches_only_subscribers() {
    let Harness {
        broker, coordinator, ..
    } = harness();

    coordinator.subscribe("u1", "weather").await.unwrap();
    coordinator.subscribe("u2", "sports").await.unwrap();

    coordinator
        .publish("weather", Bytes::from_static(b"rain later"))
        .await
        .unwrap();

    assert_eq!(
        broker.messages("queue_u1"),
        vec![Message {
            routing_key: "weather".to_string(),
            payload: Bytes::from_static(b"rain later"),
        }]
    );
    assert!(broker.messages("queue_u2").is_empty());
}

#[tokio::test]
async fn test_broadcast_reaches_only_users_with_topics() {
    let Harness {
        broker, coordinator, ..
    } = harness();

    coordinator.subscribe("u1", "weather").await.unwrap();
    coordinator.subscribe("u2", "sports").await.unwrap();
    coordinator.subscribe("u3", "news").await.unwrap();
    coordinator.unsubscribe("u3", "news").await.unwrap();

    coordinator
        .broadcast(Bytes::from_static(b"maintenance"))
        .await
        .unwrap();

    assert!(broker.messages("queue_u3").is_empty());
    for queue_name in ["queue_u1", "queue_u2"] {
        assert_eq!(
            broker.messages(queue_name),
            vec![Message {
                routing_key: BROADCAST_ROUTING_KEY.to_string(),
                payload: Bytes::from_static(b"maintenance"),
            }]
        );
    }
}

#[tokio::test]
async fn test_publish_failures() {
    let Harness {
        broker, coordinator, ..
    } = harness();

    assert_matches!(
        coordinator.publish("news.#", Bytes::new()).await,
        Err(Error::InvalidArgument(_))
    );

    broker.fail_publishes(true);
    let error = coordinator.broadcast(Bytes::new()).await.unwrap_err();
    assert_matches!(
        error,
        Error::PublishFailed { ref routing_key, .. } if routing_key == BROADCAST_ROUTING_KEY
    );
    assert_eq!(error.kind(), ErrorKind::PublishFailed);
}
