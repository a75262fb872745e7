//! Concurrent publishers and subscribers over the public dispatcher API.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use keel::dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherMode, Fragment, Offer, PollAction, Subscription,
};

fn config(mode: DispatcherMode) -> DispatcherConfig {
    DispatcherConfig {
        name: "integration".to_string(),
        partition_size: 4096,
        partition_count: 3,
        log_window_length: Some(1024),
        mode,
        conductor_interval_ms: 1,
        ..Default::default()
    }
}

async fn publish(dispatcher: &Dispatcher, payload: &[u8]) -> i64 {
    loop {
        match dispatcher.offer(payload, 0).unwrap() {
            Offer::Published(position) => return position,
            Offer::PartitionFilled => continue,
            Offer::Backpressure => {
                dispatcher.update_publisher_limit();
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Read `count` frames, yielding while the log has nothing new.
async fn read(mut subscription: Subscription, count: usize) -> (Subscription, Vec<(i64, Vec<u8>)>) {
    let mut frames = Vec::with_capacity(count);
    while frames.len() < count {
        let read = subscription.poll(
            &mut |f: &Fragment<'_>| {
                frames.push((f.position, f.payload.to_vec()));
                PollAction::Consume
            },
            16,
        );
        if read == 0 {
            tokio::task::yield_now().await;
        }
    }
    (subscription, frames)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pub_sub_subscribers_see_the_same_log() {
    let dispatcher = Arc::new(Dispatcher::start(config(DispatcherMode::PubSub)).unwrap());
    let first = dispatcher.open_subscription("first");
    let second = dispatcher.open_subscription("second");

    const PUBLISHERS: usize = 4;
    const PER_PUBLISHER: usize = 100;
    let total = PUBLISHERS * PER_PUBLISHER;

    let readers = [
        tokio::spawn(read(first, total)),
        tokio::spawn(read(second, total)),
    ];

    let mut publishers = Vec::new();
    for p in 0..PUBLISHERS {
        let dispatcher = Arc::clone(&dispatcher);
        publishers.push(tokio::spawn(async move {
            for i in 0..PER_PUBLISHER {
                publish(&dispatcher, format!("p{p}-{i:04}").as_bytes()).await;
            }
        }));
    }
    for publisher in publishers {
        publisher.await.unwrap();
    }

    let [first, second] = readers;
    let (first, first_frames) = tokio::time::timeout(Duration::from_secs(10), first)
        .await
        .unwrap()
        .unwrap();
    let (second, second_frames) = tokio::time::timeout(Duration::from_secs(10), second)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first_frames.len(), total);
    assert_eq!(first_frames, second_frames);
    assert!(first_frames.windows(2).all(|w| w[0].0 < w[1].0));

    // each publisher's frames keep their own order
    for p in 0..PUBLISHERS {
        let prefix = format!("p{p}-");
        let own: Vec<_> = first_frames
            .iter()
            .filter(|(_, payload)| payload.starts_with(prefix.as_bytes()))
            .map(|(_, payload)| payload.clone())
            .collect();
        let expected: Vec<_> = (0..PER_PUBLISHER)
            .map(|i| format!("p{p}-{i:04}").into_bytes())
            .collect();
        assert_eq!(own, expected);
    }

    dispatcher.close_subscription(first).await.unwrap();
    dispatcher.close_subscription(second).await.unwrap();
    dispatcher.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_second_stage_never_overtakes_first() {
    let dispatcher = Arc::new(Dispatcher::start(config(DispatcherMode::Pipeline)).unwrap());
    let mut stage_one = dispatcher.open_subscription("stage-one");
    let mut stage_two = dispatcher.open_subscription("stage-two");

    for i in 0..10u32 {
        publish(&dispatcher, &i.to_be_bytes()).await;
    }

    // nothing processed by the first stage yet
    let mut seen = 0;
    stage_two.poll(
        &mut |_: &Fragment<'_>| {
            seen += 1;
            PollAction::Consume
        },
        usize::MAX,
    );
    assert_eq!(seen, 0);

    stage_one.poll(&mut |_: &Fragment<'_>| PollAction::Consume, 4);
    let (stage_two, frames) = read(stage_two, 4).await;
    assert_eq!(frames.len(), 4);
    assert!(stage_two.position() <= stage_one.position());

    // last stage closes first
    dispatcher.close_subscription(stage_two).await.unwrap();
    dispatcher.close_subscription(stage_one).await.unwrap();
    dispatcher.close().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_positions_increase_and_payloads_survive(
        payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..200), 1..60)
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (positions, frames) = runtime.block_on(async {
            let dispatcher = Dispatcher::start(config(DispatcherMode::PubSub)).unwrap();
            let mut subscription = dispatcher.open_subscription("reader");

            let mut positions = Vec::new();
            let mut frames = Vec::new();
            for payload in &payloads {
                loop {
                    match dispatcher.offer(payload, 0).unwrap() {
                        Offer::Published(position) => {
                            positions.push(position);
                            break;
                        }
                        Offer::PartitionFilled => continue,
                        Offer::Backpressure => {
                            subscription.poll(
                                &mut |f: &Fragment<'_>| {
                                    frames.push(f.payload.to_vec());
                                    PollAction::Consume
                                },
                                usize::MAX,
                            );
                            dispatcher.update_publisher_limit();
                        }
                    }
                }
            }
            subscription.poll(
                &mut |f: &Fragment<'_>| {
                    frames.push(f.payload.to_vec());
                    PollAction::Consume
                },
                usize::MAX,
            );
            dispatcher.close().await;
            (positions, frames)
        });

        prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(frames, payloads);
    }
}
