use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use partgrid::{
    error::{Error, Result},
    partitioning::{mock::MockPartitioningScheme, Key},
    query::{Filter, JsonPath},
    service::{config::Config, PartitionedService},
    transaction::{EntryProcessor, Transaction},
};
use rand::seq::SliceRandom;
use tokio::sync::Notify;

async fn service() -> PartitionedService {
    PartitionedService::from_config("tests/conf/test_service.json".into())
        .await
        .expect("Unable to construct service from config")
}

fn order_line(order: &'static str, line: &'static str) -> Key {
    Key::associated(line, Key::simple(order))
}

/// Sets every given key (anchor included) to `value`, then optionally fails
struct SetAll {
    keys: Vec<Key>,
    value: &'static str,
    fail: bool,
}

#[async_trait]
impl EntryProcessor for SetAll {
    type Output = ();

    async fn process(&self, tx: &mut Transaction) -> Result<()> {
        let anchor = tx.anchor();
        tx.set_value(anchor, Bytes::from(self.value))?;

        let handles = tx
            .enlist_all(
                self.keys
                    .iter()
                    .map(|key| ("lines".to_string(), key.clone()))
                    .collect(),
            )
            .await?;
        for handle in handles {
            tx.set_value(handle, Bytes::from(self.value))?;
        }

        if self.fail {
            return Err(Error::Generic {
                reason: "application failure".to_string(),
            });
        }
        Ok(())
    }
}

/// A failing unit of work leaves no trace, a successful one is applied as a whole
#[tokio::test]
async fn test_unit_of_work_is_atomic() {
    let service = service().await;
    let keys = vec![order_line("order-1", "k2"), order_line("order-1", "k3")];

    let err = service
        .invoke(
            "lines",
            Key::simple("order-1"),
            &SetAll {
                keys: keys.clone(),
                value: "v1",
                fail: true,
            },
        )
        .await
        .err()
        .unwrap();
    assert!(err.is_transaction_aborted());
    assert!(err.is_retryable());
    assert_eq!(service.size("lines").unwrap(), 0);

    service
        .invoke(
            "lines",
            Key::simple("order-1"),
            &SetAll {
                keys: keys.clone(),
                value: "v2",
                fail: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(service.size("lines").unwrap(), 3);
    for key in keys.iter().chain(std::iter::once(&Key::simple("order-1"))) {
        assert_eq!(service.get("lines", key).unwrap(), Some(Bytes::from("v2")));
    }
}

/// Enlisting a key owned by another partition fails and nothing is applied, even if the processor
/// swallows the error
#[tokio::test]
async fn test_cross_partition_enlist_is_rejected() {
    let service = service().await;
    let anchor = Key::simple("order-1");
    let anchor_partition = service.partition_of(&anchor).unwrap();
    let elsewhere = (0..)
        .map(|i| Key::simple(format!("other-{}", i)))
        .find(|key| service.partition_of(key).unwrap() != anchor_partition)
        .unwrap();

    let err = service
        .invoke(
            "lines",
            anchor.clone(),
            &SetAll {
                keys: vec![order_line("order-1", "k2"), elsewhere.clone()],
                value: "v",
                fail: false,
            },
        )
        .await
        .err()
        .unwrap();
    assert!(err.is_cross_partition_enlist());
    assert!(!err.is_retryable());
    assert_eq!(service.size("lines").unwrap(), 0);

    struct Swallow {
        elsewhere: Key,
    }

    #[async_trait]
    impl EntryProcessor for Swallow {
        type Output = ();

        async fn process(&self, tx: &mut Transaction) -> Result<()> {
            tx.set_value(tx.anchor(), Bytes::from("v"))?;
            let _ = tx.enlist("lines", self.elsewhere.clone()).await;
            Ok(())
        }
    }

    let err = service
        .invoke("lines", anchor.clone(), &Swallow { elsewhere })
        .await
        .err()
        .unwrap();
    assert!(err.is_cross_partition_enlist());
    assert_eq!(service.get("lines", &anchor).unwrap(), None);
}

/// A key associated with an associated key is rejected
#[tokio::test]
async fn test_multi_level_association_is_rejected() {
    let service = service().await;
    let nested = Key::associated("c", Key::associated("b", Key::simple("a")));

    let err = service
        .put("lines", nested, Bytes::from("v"))
        .await
        .err()
        .unwrap();
    assert!(err.is_invalid_association());
}

fn counter(value: Option<Bytes>) -> u64 {
    value
        .map(|v| String::from_utf8(v.to_vec()).unwrap().parse().unwrap())
        .unwrap_or(0)
}

struct Increment {
    keys: Vec<&'static str>,
}

#[async_trait]
impl EntryProcessor for Increment {
    type Output = ();

    async fn process(&self, tx: &mut Transaction) -> Result<()> {
        let handles = tx
            .enlist_all(
                self.keys
                    .iter()
                    .map(|key| ("counters".to_string(), Key::simple(*key)))
                    .collect(),
            )
            .await?;
        tokio::task::yield_now().await;

        for handle in handles {
            let current = counter(tx.value(handle)?);
            tx.set_value(handle, Bytes::from((current + 1).to_string()))?;
        }
        Ok(())
    }
}

/// Concurrent units of work enlisting the same keys in opposite orders never deadlock
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_no_deadlock_with_opposite_enlist_orders() {
    const ITERATIONS: usize = 1000;
    let mut config = Config::new("counters");
    config.lock_timeout_ms = Some(10_000);
    // every key in partition 0
    let service = Arc::new(
        PartitionedService::with_scheme(config, Arc::new(MockPartitioningScheme::new(4))).unwrap(),
    );

    let mut handles = Vec::with_capacity(ITERATIONS);
    for i in 0..ITERATIONS {
        let service = service.clone();
        let mut keys = vec!["k-a", "k-b"];
        keys.shuffle(&mut rand::thread_rng());
        handles.push(tokio::spawn(async move {
            service
                .invoke(
                    "counters",
                    Key::simple(format!("a-{:04}", i)),
                    &Increment { keys },
                )
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for key in ["k-a", "k-b"] {
        assert_eq!(
            counter(service.get("counters", &Key::simple(key)).unwrap()),
            ITERATIONS as u64
        );
    }
}

/// Increments the anchor, then enlists and increments `others` one at a time
struct IncrementEach {
    others: Vec<&'static str>,
}

#[async_trait]
impl EntryProcessor for IncrementEach {
    type Output = ();

    async fn process(&self, tx: &mut Transaction) -> Result<()> {
        let mut handles = vec![tx.anchor()];
        for key in self.others.iter() {
            handles.push(tx.enlist("counters", Key::simple(*key)).await?);
            tokio::task::yield_now().await;
        }

        for handle in handles {
            let current = counter(tx.value(handle)?);
            tx.set_value(handle, Bytes::from((current + 1).to_string()))?;
        }
        Ok(())
    }
}

/// Anchors interleave with the enlisted keys, so keys are often discovered below a held lock
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_no_deadlock_with_interleaved_anchors() {
    const ITERATIONS: usize = 1000;
    let mut config = Config::new("counters");
    config.lock_timeout_ms = Some(10_000);
    let service = Arc::new(
        PartitionedService::with_scheme(config, Arc::new(MockPartitioningScheme::new(4))).unwrap(),
    );

    let mut handles = Vec::with_capacity(ITERATIONS);
    for i in 0..ITERATIONS {
        let service = service.clone();
        let (anchor, mut others) = match i % 3 {
            0 => ("k-a", vec!["k-b"]),
            1 => ("k-b", vec!["k-a"]),
            _ => ("k-m", vec!["k-a", "k-b"]),
        };
        others.shuffle(&mut rand::thread_rng());
        handles.push(tokio::spawn(async move {
            service
                .invoke("counters", Key::simple(anchor), &IncrementEach { others })
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let expected = [
        ("k-a", ITERATIONS as u64),
        ("k-b", ITERATIONS as u64),
        ("k-m", (ITERATIONS / 3) as u64),
    ];
    for (key, count) in expected {
        assert_eq!(
            counter(service.get("counters", &Key::simple(key)).unwrap()),
            count
        );
    }
}

struct Hold {
    acquired: Arc<Notify>,
    duration: Duration,
}

#[async_trait]
impl EntryProcessor for Hold {
    type Output = ();

    async fn process(&self, _tx: &mut Transaction) -> Result<()> {
        self.acquired.notify_one();
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

/// Waiting on a busy key is bounded by the configured lock timeout
#[tokio::test]
async fn test_lock_timeout() {
    let mut config = Config::new("timeouts");
    config.lock_timeout_ms = Some(50);
    let service = Arc::new(PartitionedService::new(config).unwrap());

    let acquired = Arc::new(Notify::new());
    let holder = {
        let service = service.clone();
        let acquired = acquired.clone();
        tokio::spawn(async move {
            service
                .invoke(
                    "m",
                    Key::simple("busy"),
                    &Hold {
                        acquired,
                        duration: Duration::from_millis(500),
                    },
                )
                .await
        })
    };
    acquired.notified().await;

    let err = service
        .put("m", Key::simple("busy"), Bytes::from("v"))
        .await
        .err()
        .unwrap();
    assert!(err.is_lock_timeout());
    assert!(err.is_retryable());

    holder.await.unwrap().unwrap();
    service
        .put("m", Key::simple("busy"), Bytes::from("v"))
        .await
        .unwrap();
}

struct CountPartition;

#[async_trait]
impl EntryProcessor for CountPartition {
    type Output = usize;

    async fn process(&self, tx: &mut Transaction) -> Result<usize> {
        Ok(tx.query("people", &Filter::Always)?.len())
    }
}

/// Broadcasting reaches every partition exactly once
#[tokio::test]
async fn test_broadcast_to_every_partition() {
    let service = service().await;
    for i in 0..300 {
        service
            .put("people", Key::simple(format!("p-{}", i)), Bytes::from("{}"))
            .await
            .unwrap();
    }

    let results = service
        .invoke_all_partitions("people", &CountPartition)
        .await
        .unwrap();
    assert_eq!(results.len(), 257);

    let total: usize = results.into_iter().map(|r| r.unwrap()).sum();
    assert_eq!(total, 300);
}

/// Closes every open order of a customer. Orders are associated with their customer so they all live
/// in the customer's partition.
struct CloseOrders;

#[async_trait]
impl EntryProcessor for CloseOrders {
    type Output = usize;

    async fn process(&self, tx: &mut Transaction) -> Result<usize> {
        let customer = match tx.key(tx.anchor())? {
            Key::Simple(customer) => String::from_utf8_lossy(customer).to_string(),
            other => {
                return Err(Error::Generic {
                    reason: format!("unexpected anchor {}", other),
                })
            }
        };

        let filter = Filter::And(vec![
            Filter::equals(Arc::new(JsonPath::new("customer")), customer.as_str()),
            Filter::equals(Arc::new(JsonPath::new("status")), "open"),
        ]);
        let keys = tx.query("orders", &filter)?;
        let handles = tx
            .enlist_all(
                keys.into_iter()
                    .map(|key| ("orders".to_string(), key))
                    .collect(),
            )
            .await?;

        for handle in handles.iter() {
            let value = format!(r#"{{"customer":"{}","status":"closed"}}"#, customer);
            tx.set_value(*handle, Bytes::from(value))?;
        }
        Ok(handles.len())
    }
}

/// Query the anchor's partition from inside a unit of work and enlist what it found
#[tokio::test]
async fn test_query_then_enlist() {
    let service = service().await;
    service
        .add_index("orders", Arc::new(JsonPath::new("status")), false)
        .unwrap();

    for customer in ["alice", "bob"] {
        for i in 0..5 {
            let status = if i % 2 == 0 { "open" } else { "closed" };
            service
                .put(
                    "orders",
                    Key::associated(format!("{}-order-{}", customer, i), Key::simple(customer)),
                    Bytes::from(format!(
                        r#"{{"customer":"{}","status":"{}"}}"#,
                        customer, status
                    )),
                )
                .await
                .unwrap();
        }
    }

    let closed = service
        .invoke("customers", Key::simple("alice"), &CloseOrders)
        .await
        .unwrap();
    assert_eq!(closed, 3);

    let open = Filter::equals(Arc::new(JsonPath::new("status")), "open");
    let still_open = service.query("orders", &open).unwrap();
    assert_eq!(still_open.len(), 3);
    assert!(still_open
        .iter()
        .all(|(key, _)| key.associated_key() == Some(&Key::simple("bob"))));
}

/// Indexed and scanned queries over the whole service return the same entries
#[tokio::test]
async fn test_index_scan_equivalence() {
    let service = service().await;
    for i in 0..200 {
        service
            .put(
                "people",
                Key::simple(format!("p-{}", i)),
                Bytes::from(format!(
                    r#"{{"age":{},"tags":["t{}","t{}"]}}"#,
                    i % 90,
                    i % 3,
                    i % 7
                )),
            )
            .await
            .unwrap();
    }

    let age = Arc::new(JsonPath::new("age"));
    let tags = Arc::new(JsonPath::new("tags"));
    let filters = vec![
        Filter::between(age.clone(), 18, 40),
        Filter::Or(vec![
            Filter::contains(tags.clone(), "t1"),
            Filter::less(age.clone(), 5),
        ]),
        Filter::And(vec![
            Filter::greater(age.clone(), 60),
            Filter::not(Filter::contains(tags.clone(), "t2")),
        ]),
    ];

    let scanned: Vec<_> = filters
        .iter()
        .map(|filter| service.query("people", filter).unwrap())
        .collect();

    service.add_index("people", age, true).unwrap();
    service.add_index("people", tags, false).unwrap();

    for (filter, scanned) in filters.iter().zip(scanned) {
        assert!(!scanned.is_empty());
        assert_eq!(service.query("people", filter).unwrap(), scanned);
    }
}
