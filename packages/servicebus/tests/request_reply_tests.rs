//! Request/reply correlation between two buses sharing a broker.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use servicebus::{handler_fn, Bus, BusError, ConsumeContext, CorrelationId, InMemoryBroker, ERROR_QUEUE};

/// A server that answers every Ping with `copies` Pongs.
fn pong_server(broker: &InMemoryBroker, copies: usize, delay: Duration) -> Bus {
    Bus::builder()
        .with_config(fast_config("server"))
        .with_transport(broker.clone())
        .with_handler::<Ping, _>(Arc::new(handler_fn(move |ping: Ping, ctx: ConsumeContext| async move {
            tokio::time::sleep(delay).await;
            let pong = Pong {
                correlation_id: ping.correlation_id,
                sequence: ping.sequence,
            };
            for _ in 0..copies {
                ctx.reply(&pong).await?;
            }
            Ok(())
        })))
        .build()
        .unwrap()
}

fn client(broker: &InMemoryBroker) -> Bus {
    Bus::builder()
        .with_config(fast_config("client").with_queue_mapping::<Ping>("server"))
        .with_transport(broker.clone())
        .build()
        .unwrap()
}

#[tokio::test]
async fn send_request_returns_the_reply() {
    let broker = broker();
    let server = pong_server(&broker, 1, Duration::ZERO);
    let client = client(&broker);
    start_all(&[&server, &client]).await;

    let request = ping(42);
    let pong: Pong = client.send_request(&request).await.unwrap();

    assert_eq!(pong.sequence, 42);
    assert_eq!(pong.correlation_id, request.correlation_id);
    assert_eq!(client.pending_requests(), 0);

    shutdown_all(&[&server, &client]).await;
}

#[tokio::test]
async fn request_carries_reply_headers() {
    let broker = broker();
    let server = pong_server(&broker, 1, Duration::ZERO);
    let client = client(&broker);
    start_all(&[&server, &client]).await;

    let _: Pong = client.send_request(&ping(1)).await.unwrap();

    let sent = broker.published_to("", "server");
    assert_eq!(sent.len(), 1);
    let source = sent[0].headers.source_address().expect("SourceAddress set");
    assert_eq!(sent[0].headers.reply_address().as_deref(), Some("client"));

    let replies = broker.published_to("", "client");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].headers.source_address(), Some(source));
    assert_eq!(replies[0].headers.message_type().as_deref(), Some("Tests.Pong"));

    shutdown_all(&[&server, &client]).await;
}

#[tokio::test]
async fn duplicate_replies_complete_once() {
    let broker = broker();
    let server = pong_server(&broker, 8, Duration::ZERO);
    let client = client(&broker);
    start_all(&[&server, &client]).await;

    let completions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completions);
    client
        .send_request_with_callback::<Ping, Pong, _>(&ping(5), move |pong| {
            assert_eq!(pong.sequence, 5);
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    wait_until(|| broker.published_to("", "client").len() == 8).await;
    wait_until(|| completions.load(Ordering::SeqCst) == 1).await;
    settle().await;

    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(client.pending_requests(), 0);
    // Unmatched duplicates are benign, not failures.
    assert_eq!(broker.queue_depth(ERROR_QUEUE), 0);
    assert!(broker.published_to("", "client.Retries").is_empty());

    shutdown_all(&[&server, &client]).await;
}

#[tokio::test]
async fn concurrent_requests_get_their_own_replies() {
    let broker = broker();
    let server = pong_server(&broker, 1, Duration::from_millis(5));
    let client = client(&broker);
    start_all(&[&server, &client]).await;

    let requests = (0..20u32).map(|sequence| {
        let client = client.clone();
        tokio::spawn(async move {
            let pong: Pong = client.send_request(&ping(sequence)).await?;
            Ok::<_, BusError>((sequence, pong.sequence))
        })
    });

    for handle in futures::future::join_all(requests).await {
        let (sent, received) = handle.unwrap().unwrap();
        assert_eq!(sent, received);
    }
    assert_eq!(client.pending_requests(), 0);

    shutdown_all(&[&server, &client]).await;
}

#[tokio::test]
async fn late_reply_after_timeout_is_ignored() {
    let broker = broker();
    let server = pong_server(&broker, 1, Duration::from_millis(200));
    let client = client(&broker);
    start_all(&[&server, &client]).await;

    let err = client
        .send_request_timeout::<Ping, Pong>(&ping(9), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::RequestTimeout { .. }));
    assert_eq!(client.pending_requests(), 0);

    wait_until(|| broker.published_to("", "client").len() == 1).await;
    settle().await;
    assert_eq!(broker.queue_depth(ERROR_QUEUE), 0);
    assert!(broker.published_to("", "client.Retries").is_empty());

    shutdown_all(&[&server, &client]).await;
}

#[tokio::test]
async fn explicit_endpoint_needs_no_mapping() {
    let broker = broker();
    let server = pong_server(&broker, 1, Duration::ZERO);
    let client = Bus::builder()
        .with_config(fast_config("client"))
        .with_transport(broker.clone())
        .build()
        .unwrap();
    start_all(&[&server, &client]).await;

    let pong: Pong = client.send_request_to("server", &ping(3)).await.unwrap();
    assert_eq!(pong.sequence, 3);

    shutdown_all(&[&server, &client]).await;
}

#[tokio::test]
async fn stopping_cancels_requests_awaited_by_handlers() {
    let broker = broker();
    let server = pong_server(&broker, 1, Duration::from_millis(200));

    // Each Tick asks the server for a Pong before finishing.
    let outcome: Arc<Mutex<Option<Result<Pong, BusError>>>> = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&outcome);
    let client = Bus::builder()
        .with_config(
            fast_config("client")
                .with_queue_mapping::<Ping>("server")
                .with_queue_mapping::<Tick>("client"),
        )
        .with_transport(broker.clone())
        .with_handler::<Tick, _>(Arc::new(handler_fn(move |tick: Tick, ctx: ConsumeContext| {
            let seen = Arc::clone(&seen);
            async move {
                let reply = ctx.bus().send_request::<Ping, Pong>(&ping(tick.step)).await;
                let failed = reply.is_err();
                *seen.lock().unwrap() = Some(reply);
                if failed {
                    anyhow::bail!("no pong");
                }
                Ok(())
            }
        })))
        .build()
        .unwrap();
    start_all(&[&server, &client]).await;

    client
        .send(&Tick {
            correlation_id: CorrelationId::new(),
            step: 1,
        })
        .await
        .unwrap();
    wait_until(|| client.pending_requests() == 1).await;

    tokio::time::timeout(Duration::from_secs(3), client.stop_consuming())
        .await
        .expect("stop_consuming should not wait on an unanswerable request");

    assert_eq!(client.pending_requests(), 0);
    assert!(!client.is_consuming().await);
    let outcome = outcome.lock().unwrap().take().expect("handler finished");
    assert!(matches!(outcome, Err(BusError::RequestCancelled { .. })));

    // The cancelled Tick went back for another attempt rather than vanishing.
    assert_eq!(broker.published_to("", "client.Retries").len(), 1);

    shutdown_all(&[&server, &client]).await;
}

#[tokio::test]
async fn requests_work_again_after_restart() {
    let broker = broker();
    let server = pong_server(&broker, 1, Duration::ZERO);
    let client = client(&broker);
    start_all(&[&server, &client]).await;

    client.stop_consuming().await;
    start_all(&[&client]).await;

    let pong: Pong = client.send_request(&ping(11)).await.unwrap();
    assert_eq!(pong.sequence, 11);

    shutdown_all(&[&server, &client]).await;
}
