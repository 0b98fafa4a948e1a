//! Ring-group hunting against the mock server: parallel winner plus
//! loser cleanup, sequential advance, balanced counter bookkeeping.

use esl_mock::MockFreeswitch;
use std::sync::Arc;
use std::time::Duration;
use switchboard::{InMemoryBalancer, Inbound, LoadBalancerBackend, RingGroup, RingMode};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn connected_client(server: &MockFreeswitch) -> Inbound {
    Inbound::connect(&server.host(), server.port(), "ClueCon", TIMEOUT)
        .await
        .unwrap()
}

fn destinations() -> Vec<String> {
    vec![
        "user/1001".to_owned(),
        "user/1002".to_owned(),
        "user/1003".to_owned(),
    ]
}

/// Pull the origination UUIDs out of the wire trace, in dial order.
async fn originated_uuids(server: &MockFreeswitch, expected: usize) -> Vec<String> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let uuids: Vec<String> = server
                .commands()
                .iter()
                .filter_map(|c| {
                    c.strip_prefix("api originate {origination_uuid=")
                        .and_then(|rest| rest.split(',').next())
                        .map(str::to_owned)
                })
                .collect();
            if uuids.len() >= expected {
                return uuids;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all originates must hit the wire")
}

fn answer_events(uuid: &str) -> [String; 2] {
    [
        format!(
            "Event-Name: CHANNEL_STATE\nUnique-ID: {uuid}\nChannel-State: CS_EXECUTE\n\
             Channel-State-Number: 4\nChannel-Call-State: ACTIVE\n"
        ),
        format!("Event-Name: CHANNEL_ANSWER\nUnique-ID: {uuid}\n"),
    ]
}

/// S4: three parallel legs, the second one answers; the other two are
/// killed with NORMAL_CLEARING.
#[tokio::test]
async fn parallel_ring_second_leg_wins() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = Arc::new(connected_client(&server).await);

    let ring = {
        let client = client.clone();
        tokio::spawn(async move {
            RingGroup::ring::<InMemoryBalancer>(
                client.connection(),
                &destinations(),
                RingMode::Parallel,
                Duration::from_secs(2),
                None,
            )
            .await
        })
    };

    let uuids = originated_uuids(&server, 3).await;
    // Give the ring loop a beat to arm its waits before answering.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for body in answer_events(&uuids[1]) {
        server.send_event(&body);
    }

    let winner = ring
        .await
        .unwrap()
        .unwrap()
        .expect("second leg must win the race");
    assert_eq!(winner.uuid(), Some(uuids[1].as_str()));

    // Losers get uuid_kill, best effort.
    for loser in [&uuids[0], &uuids[2]] {
        server
            .wait_for_command(
                &format!("api uuid_kill {loser} NORMAL_CLEARING"),
                Duration::from_secs(2),
            )
            .await
            .unwrap_or_else(|| panic!("loser {loser} must be hung up"));
    }
    assert!(
        !server
            .commands()
            .iter()
            .any(|c| c == &format!("api uuid_kill {} NORMAL_CLEARING", uuids[1]))
    );
}

/// Nobody answers: ring returns None and every leg is cleaned up.
#[tokio::test]
async fn parallel_ring_timeout_cleans_all_legs() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let outcome = RingGroup::ring::<InMemoryBalancer>(
        client.connection(),
        &destinations(),
        RingMode::Parallel,
        Duration::from_millis(300),
        None,
    )
    .await
    .unwrap();
    assert!(outcome.is_none());

    let uuids = originated_uuids(&server, 3).await;
    for uuid in &uuids {
        server
            .wait_for_command(
                &format!("api uuid_kill {uuid} NORMAL_CLEARING"),
                Duration::from_secs(2),
            )
            .await
            .expect("every leg must be hung up on timeout");
    }
}

/// Sequential mode advances to the next destination when one times out.
#[tokio::test]
async fn sequential_ring_advances_on_timeout() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = Arc::new(connected_client(&server).await);

    let ring = {
        let client = client.clone();
        tokio::spawn(async move {
            RingGroup::ring::<InMemoryBalancer>(
                client.connection(),
                &destinations()[..2],
                RingMode::Sequential,
                Duration::from_millis(500),
                None,
            )
            .await
        })
    };

    // First leg: let it time out. Second leg: answer it.
    let first = originated_uuids(&server, 1).await.remove(0);
    server
        .wait_for_command(
            &format!("api uuid_kill {first} NORMAL_CLEARING"),
            Duration::from_secs(2),
        )
        .await
        .expect("first leg must be abandoned");

    let uuids = originated_uuids(&server, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    for body in answer_events(&uuids[1]) {
        server.send_event(&body);
    }

    let winner = ring.await.unwrap().unwrap().expect("second leg answers");
    assert_eq!(winner.uuid(), Some(uuids[1].as_str()));
}

/// Balanced mode increments while dialing and decrements on resolution;
/// an answered call leaves the counters where they started.
#[tokio::test]
async fn balanced_ring_keeps_counters_balanced() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = Arc::new(connected_client(&server).await);
    let balancer = Arc::new(InMemoryBalancer::new());

    // Pre-load the first destination so the hunt starts at the second.
    balancer.increment("user/1001").await.unwrap();

    let ring = {
        let client = client.clone();
        let balancer = balancer.clone();
        tokio::spawn(async move {
            RingGroup::ring(
                client.connection(),
                &destinations(),
                RingMode::Balanced(balancer.as_ref()),
                Duration::from_secs(2),
                None,
            )
            .await
        })
    };

    let first_dialed = originated_uuids(&server, 1).await.remove(0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    for body in answer_events(&first_dialed) {
        server.send_event(&body);
    }

    let winner = ring.await.unwrap().unwrap().expect("least-loaded answers");
    assert_eq!(winner.uuid(), Some(first_dialed.as_str()));

    // The dial attempt's counter was released; only the pre-load remains.
    assert_eq!(balancer.get_count("user/1001").await.unwrap(), 1);
    assert_eq!(balancer.get_count("user/1002").await.unwrap(), 0);
    assert_eq!(balancer.get_count("user/1003").await.unwrap(), 0);
}
