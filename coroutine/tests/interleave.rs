//! Deterministic two-party interleaving, driven inside an apartment.
//!
//! Coroutine A yields three values and coroutine B two, each awaiting the other's
//! next value before proceeding. The rendezvous data dependencies force a strict
//! total order on the trace, even on a multi-threaded pool.

use std::sync::{Arc, Mutex};

use apartment::{Apartment, PooledApartment};
use coroutine_proxy::{CoroutineConsumer, CoroutineProxy};
use futures_util::stream::{self, Stream};

type Trace = Arc<Mutex<Vec<String>>>;

fn record(trace: &Trace, line: impl Into<String>) {
    trace.lock().unwrap().push(line.into());
}

enum StepA {
    Subscribe,
    AwaitReply {
        round: usize,
        consumer: CoroutineConsumer<String>,
    },
    Finished,
}

/// Coroutine A: yields first, then alternates receive/yield until its third value.
fn coroutine_a(
    peer: Arc<CoroutineProxy<String>>,
    trace: Trace,
) -> impl Stream<Item = Result<String, anyhow::Error>> {
    stream::try_unfold(StepA::Subscribe, move |step| {
        let peer = Arc::clone(&peer);
        let trace = Arc::clone(&trace);
        async move {
            match step {
                StepA::Subscribe => {
                    let consumer = peer.subscribe().await?;
                    record(&trace, "A about to yield: 1");
                    Ok(Some((
                        "1 from A".to_string(),
                        StepA::AwaitReply { round: 2, consumer },
                    )))
                }
                StepA::AwaitReply { round, mut consumer } => {
                    let Some(reply) = consumer.next().await? else {
                        return Ok(None);
                    };
                    record(&trace, format!("A received: {reply}"));
                    record(&trace, format!("A about to yield: {round}"));
                    let next = if round < 3 {
                        StepA::AwaitReply {
                            round: round + 1,
                            consumer,
                        }
                    } else {
                        StepA::Finished
                    };
                    Ok(Some((format!("{round} from A"), next)))
                }
                StepA::Finished => Ok(None),
            }
        }
    })
}

enum StepB {
    Subscribe,
    Receive {
        round: usize,
        consumer: CoroutineConsumer<String>,
    },
}

/// Coroutine B: receives first, replies twice, then drains A's final value.
fn coroutine_b(
    peer: Arc<CoroutineProxy<String>>,
    trace: Trace,
) -> impl Stream<Item = Result<String, anyhow::Error>> {
    stream::try_unfold(StepB::Subscribe, move |step| {
        let peer = Arc::clone(&peer);
        let trace = Arc::clone(&trace);
        async move {
            match step {
                StepB::Subscribe => {
                    let consumer = peer.subscribe().await?;
                    receive_then_yield(1, consumer, &trace).await
                }
                StepB::Receive { round, consumer } => {
                    receive_then_yield(round, consumer, &trace).await
                }
            }
        }
    })
}

async fn receive_then_yield(
    round: usize,
    mut consumer: CoroutineConsumer<String>,
    trace: &Trace,
) -> Result<Option<(String, StepB)>, anyhow::Error> {
    let Some(received) = consumer.next().await? else {
        return Ok(None);
    };
    record(trace, format!("B received: {received}"));
    if round > 2 {
        // A's third value has no reply; the sequence ends here.
        return Ok(None);
    }
    record(trace, format!("B about to yield: {round}"));
    Ok(Some((
        format!("{round} from B"),
        StepB::Receive {
            round: round + 1,
            consumer,
        },
    )))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_coroutines_interleave_deterministically() {
    let apartment = PooledApartment::try_current().unwrap();
    let proxy_a = Arc::new(CoroutineProxy::new());
    let proxy_b = Arc::new(CoroutineProxy::new());
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));

    // A is driven into proxy_a while consuming proxy_b, and vice versa.
    let drive_a = {
        let proxy_a = Arc::clone(&proxy_a);
        let proxy_b = Arc::clone(&proxy_b);
        let trace = Arc::clone(&trace);
        apartment.run(move |_| async move {
            proxy_a.drive(coroutine_a(proxy_b, trace)).await?;
            Ok(())
        })
    };
    let drive_b = {
        let proxy_a = Arc::clone(&proxy_a);
        let proxy_b = Arc::clone(&proxy_b);
        let trace = Arc::clone(&trace);
        apartment.run(move |_| async move {
            proxy_b.drive(coroutine_b(proxy_a, trace)).await?;
            Ok(())
        })
    };

    let (first, second) = futures_util::join!(drive_a, drive_b);
    first.unwrap();
    second.unwrap();
    apartment.shutdown().await.unwrap();

    let recorded = trace.lock().unwrap().clone();
    let expected: Vec<String> = [
        "A about to yield: 1",
        "B received: 1 from A",
        "B about to yield: 1",
        "A received: 1 from B",
        "A about to yield: 2",
        "B received: 2 from A",
        "B about to yield: 2",
        "A received: 2 from B",
        "A about to yield: 3",
        "B received: 3 from A",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    assert_eq!(recorded, expected);
}

#[tokio::test]
async fn test_drive_fault_is_an_apartment_fault() {
    let apartment = PooledApartment::try_current().unwrap();
    let proxy = Arc::new(CoroutineProxy::new());

    let driver = {
        let proxy = Arc::clone(&proxy);
        apartment.run(move |_| async move {
            let source = stream::iter(vec![
                Ok("fine".to_string()),
                Err(anyhow::anyhow!("producer broke")),
            ]);
            proxy.drive(source).await?;
            Ok(())
        })
    };

    let mut consumer = proxy.subscribe().await.unwrap();
    assert_eq!(consumer.next().await.unwrap(), Some("fine".to_string()));
    assert!(consumer.next().await.is_err());

    // The drive fault is an ordinary operation fault for the apartment.
    assert!(driver.await.is_err());
    apartment.complete();
    let aggregate = apartment.completion().await.unwrap_err();
    assert_eq!(aggregate.faults().len(), 1);

    apartment.clear_faults();
    apartment.shutdown().await.unwrap();
}
