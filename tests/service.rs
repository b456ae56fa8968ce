mod common;
use common::*;

use chrono::Local;
use fs5000::{Fs5000Service, LinkState, Sample, ServiceConfig, Subscription};
use std::time::Duration;
use tokio::time::timeout;

const PATIENCE: Duration = Duration::from_secs(5);

fn config() -> ServiceConfig {
    ServiceConfig {
        retry_delay: Duration::from_millis(20),
        ..ServiceConfig::default()
    }
}

async fn next_cps(subscription: &mut Subscription) -> u64 {
    let sample = timeout(PATIENCE, subscription.recv())
        .await
        .expect("sample within patience")
        .expect("subscription open");
    sample.value("CPS").expect("CPS field") as u64
}

#[tokio::test]
async fn every_subscriber_sees_every_sample_in_order() {
    let mock = streaming_mock().with_sample_limit(10);
    let service = Fs5000Service::spawn(meter(&mock), config());
    let mut subscriptions: Vec<Subscription> = (0..3).map(|_| service.subscribe()).collect();
    assert_eq!(service.status().subscribers, 3);

    for subscription in &mut subscriptions {
        for expected in 1..=10 {
            assert_eq!(next_cps(subscription).await, expected);
        }
    }

    assert_eq!(service.latest().unwrap().value("CPS"), Some(10.0));
    assert_eq!(service.broadcaster().published(), 10);
    let status = service.status();
    assert_eq!(status.samples, 10);
    assert!(status.is_ready());
    assert_eq!(status.link, LinkState::Streaming);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn a_leaving_subscriber_does_not_disturb_the_rest() {
    let mock = streaming_mock().with_sample_limit(10);
    let service = Fs5000Service::spawn(meter(&mock), config());
    let mut stays = service.subscribe();
    let mut leaves = service.subscribe();

    for expected in 1..=3 {
        assert_eq!(next_cps(&mut leaves).await, expected);
    }
    leaves.close();

    for expected in 1..=10 {
        assert_eq!(next_cps(&mut stays).await, expected);
    }

    // The closed subscriber is pruned no later than the next delivery.
    let extra = Sample::from_text("DR:0.10uSv/h;CPS:99", Local::now());
    assert_eq!(service.broadcaster().publish(extra), 1);
    assert_eq!(service.status().subscribers, 1);
    assert_eq!(next_cps(&mut stays).await, 99);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn unsubscribe_removes_the_entry() {
    let mock = streaming_mock();
    let service = Fs5000Service::spawn(meter(&mock), config());
    let subscription = service.subscribe();
    let id = subscription.id();
    assert!(service.unsubscribe(id));
    assert!(!service.unsubscribe(id));
    assert_eq!(service.status().subscribers, 0);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn relay_recovers_from_a_corrupted_sample() {
    let mock = streaming_mock().with_corrupt_sample_after(3);
    let service = Fs5000Service::spawn(meter(&mock), config());
    let mut subscription = service.subscribe();

    let received = [
        next_cps(&mut subscription).await,
        next_cps(&mut subscription).await,
        next_cps(&mut subscription).await,
        next_cps(&mut subscription).await,
    ];
    // Sample 4 was lost to the checksum error; the relay restarted and went on.
    assert_eq!(received, [1, 2, 3, 5]);

    let status = service.status();
    assert!(status.recoveries >= 1);
    assert!(status.last_error.unwrap().to_lowercase().contains("checksum"));

    // Both the failed and the restarted cycle began with a start request.
    let starts = mock
        .written_payloads()
        .iter()
        .filter(|p| p.as_ref() == [0x0E, 0x01])
        .count();
    assert!(starts >= 2);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn silent_meter_keeps_recovering_without_a_sample() {
    let mock = MockTransport::new().silent();
    let service = Fs5000Service::spawn(meter(&mock), config());
    let mut changes = service.status_changes();

    timeout(PATIENCE, changes.wait_for(|s| s.link == LinkState::Recovering))
        .await
        .expect("service reports recovery")
        .unwrap();
    assert!(service.latest().is_none());
    assert!(!service.status().is_ready());
    assert!(service.status().last_error.is_some());

    let meter = service.shutdown().await.unwrap();
    assert_eq!(meter.state(), SessionState::Idle);
}

#[tokio::test]
async fn shutdown_hands_back_an_idle_session() {
    let mock = streaming_mock();
    let service = Fs5000Service::spawn(meter(&mock), config());
    let mut subscription = service.subscribe();
    next_cps(&mut subscription).await;

    let mut changes = service.status_changes();
    let mut meter = service.shutdown().await.unwrap();
    assert_eq!(meter.state(), SessionState::Idle);
    assert!(!mock.is_streaming());
    assert_eq!(changes.borrow_and_update().link, LinkState::Stopped);

    // The session is usable again and subscribers see the end of the stream
    // once the samples already queued for them are drained.
    meter.get_version().await.unwrap();
    timeout(PATIENCE, async { while subscription.recv().await.is_some() {} })
        .await
        .expect("subscription ends");
}

#[tokio::test]
async fn dropping_the_service_stops_continuous_read() {
    let mock = streaming_mock();
    let service = Fs5000Service::spawn(meter(&mock), config());
    let mut subscription = service.subscribe();
    next_cps(&mut subscription).await;
    assert!(mock.is_streaming());

    drop(subscription);
    drop(service);

    timeout(PATIENCE, async {
        while mock.is_streaming() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("meter leaves continuous read");
    let written = mock.written_payloads();
    assert_eq!(written.last().unwrap().as_ref(), &[0x0E, 0x00]);
}

#[tokio::test]
async fn watched_status_tracks_subscribers() {
    let mock = streaming_mock().with_sample_limit(1);
    let service = Fs5000Service::spawn(meter(&mock), config());
    let changes = service.status_changes();

    let first = service.subscribe();
    let _second = service.subscribe();
    assert_eq!(changes.borrow().subscribers, 2);

    assert!(service.unsubscribe(first.id()));
    assert_eq!(changes.borrow().subscribers, 1);
    assert_eq!(service.status().subscribers, 1);

    service.shutdown().await.unwrap();
}
