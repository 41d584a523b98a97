mod common;

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use vlanpool::error::CniError;
use vlanpool::ipam::IpamAllocator;
use vlanpool::store::{KvStore, MemoryStore};

use common::{allocation_keys, net_conf, register};

const SEG_A: &str = "172.17.11.0";
const SEG_B: &str = "172.17.12.0";

fn candidates(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

fn allocator(store: &MemoryStore) -> IpamAllocator {
    let conf = net_conf(&[SEG_A]);
    IpamAllocator::new(Arc::new(store.clone()), &conf.ipam)
}

/// Occupy every usable address of a segment with a permanent key.
async fn fill(store: &MemoryStore, segment: &str) {
    let base: Ipv4Addr = segment.parse().unwrap();
    let base = u32::from(base);
    for offset in 11..250 {
        let addr = Ipv4Addr::from(base + offset);
        store
            .put(&format!("/ipam/{}/{}", segment, addr), "static", None)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_first_allocation() {
    let store = MemoryStore::new();
    let conf = net_conf(&[SEG_A]);
    register(&store, &conf, SEG_A, 100).await;
    let ipam = allocator(&store);

    let allocation = ipam.allocate(&candidates(&[SEG_A])).await.unwrap();
    let result = allocation.result().clone();

    assert_eq!(result.address, Ipv4Addr::new(172, 17, 11, 11));
    assert_eq!(result.gateway, Ipv4Addr::new(172, 17, 11, 254));
    assert_eq!(result.netmask, Ipv4Addr::new(255, 255, 255, 0));
    assert_eq!(result.vlan, 100);
    assert_eq!(result.segment, SEG_A);
    assert_eq!(result.cidr(), "172.17.11.11/24");
    assert!(allocation.is_held());
    assert_eq!(
        store.lease_of("/ipam/172.17.11.0/172.17.11.11"),
        Some(allocation.lease())
    );

    allocation.release().await.unwrap();
    assert!(allocation_keys(&store).is_empty());
    assert_eq!(store.lease_count(), 0);
}

#[tokio::test]
async fn test_smallest_free_address_is_reused() {
    let store = MemoryStore::new();
    let conf = net_conf(&[SEG_A]);
    register(&store, &conf, SEG_A, 100).await;
    let ipam = allocator(&store);
    let list = candidates(&[SEG_A]);

    let first = ipam.allocate(&list).await.unwrap();
    let second = ipam.allocate(&list).await.unwrap();
    assert_eq!(second.result().address, Ipv4Addr::new(172, 17, 11, 12));

    first.release().await.unwrap();
    let third = ipam.allocate(&list).await.unwrap();
    assert_eq!(third.result().address, Ipv4Addr::new(172, 17, 11, 11));

    second.release().await.unwrap();
    third.release().await.unwrap();
}

#[tokio::test]
async fn test_full_segment_falls_through() {
    let store = MemoryStore::new();
    let conf = net_conf(&[SEG_A]);
    register(&store, &conf, SEG_A, 100).await;
    register(&store, &conf, SEG_B, 200).await;
    fill(&store, SEG_A).await;
    let ipam = allocator(&store);

    let plan = ipam.plan(&candidates(&[SEG_A, SEG_B])).await.unwrap();
    assert_eq!(plan.segment, SEG_B);
    assert_eq!(plan.vlan, 200);

    let allocation = ipam.allocate(&candidates(&[SEG_A, SEG_B])).await.unwrap();
    assert_eq!(allocation.result().address, Ipv4Addr::new(172, 17, 12, 11));
    assert_eq!(allocation.result().vlan, 200);
    allocation.release().await.unwrap();

    let err = ipam.allocate(&candidates(&[SEG_A])).await.unwrap_err();
    assert!(matches!(err, CniError::PoolExhausted(_)));
    let err = ipam.plan(&candidates(&[SEG_A])).await.unwrap_err();
    assert!(matches!(err, CniError::PoolExhausted(_)));
}

#[tokio::test]
async fn test_candidate_errors() {
    let store = MemoryStore::new();
    let conf = net_conf(&[SEG_A]);
    register(&store, &conf, SEG_A, 100).await;
    let ipam = allocator(&store);

    let err = ipam.allocate(&[]).await.unwrap_err();
    assert!(matches!(err, CniError::Config(_)));

    let err = ipam.allocate(&candidates(&["10.9.9.0"])).await.unwrap_err();
    assert!(matches!(err, CniError::Resolver(_)));

    let err = ipam.allocate(&candidates(&["172.17.11.5"])).await.unwrap_err();
    assert!(matches!(err, CniError::Resolver(_)));

    let err = ipam.allocate(&candidates(&["not-a-segment"])).await.unwrap_err();
    assert!(matches!(err, CniError::Resolver(_)));

    assert!(allocation_keys(&store).is_empty());
}

#[tokio::test]
async fn test_unavailable_store_is_reported() {
    let store = MemoryStore::new();
    let conf = net_conf(&[SEG_A]);
    register(&store, &conf, SEG_A, 100).await;
    let ipam = allocator(&store);

    store.set_unavailable(true);
    let err = ipam.allocate(&candidates(&[SEG_A])).await.unwrap_err();
    assert!(matches!(err, CniError::StoreUnavailable(_)));
    assert_eq!(err.code(), 11);

    store.set_unavailable(false);
    let allocation = ipam.allocate(&candidates(&[SEG_A])).await.unwrap();
    allocation.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocators_get_distinct_addresses() {
    let store = MemoryStore::new();
    let conf = net_conf(&[SEG_A]);
    register(&store, &conf, SEG_A, 100).await;

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let ipam = allocator(&store);
            tokio::spawn(async move { ipam.allocate(&candidates(&[SEG_A])).await })
        })
        .collect();

    let mut allocations = Vec::new();
    for task in tasks {
        allocations.push(task.await.unwrap().unwrap());
    }

    let addresses: BTreeSet<Ipv4Addr> =
        allocations.iter().map(|a| a.result().address).collect();
    assert_eq!(addresses.len(), 16);
    assert_eq!(addresses.first(), Some(&Ipv4Addr::new(172, 17, 11, 11)));
    assert_eq!(addresses.last(), Some(&Ipv4Addr::new(172, 17, 11, 26)));
    assert_eq!(allocation_keys(&store).len(), 16);

    for allocation in allocations {
        allocation.release().await.unwrap();
    }
    assert!(allocation_keys(&store).is_empty());
}

#[tokio::test]
async fn test_commit_find_and_release() {
    let store = MemoryStore::new();
    let conf = net_conf(&[SEG_A]);
    register(&store, &conf, SEG_A, 100).await;
    let ipam = allocator(&store);

    let allocation = ipam.allocate(&candidates(&[SEG_A])).await.unwrap();
    let record = ipam.commit(allocation, "c1", "net1").await.unwrap();

    assert_eq!(record.address, Ipv4Addr::new(172, 17, 11, 11));
    assert_eq!(record.container_id, "c1");
    assert_eq!(record.cidr(), "172.17.11.11/24");
    // Only the hold lease survives the commit.
    assert_eq!(store.lease_count(), 1);
    assert_eq!(
        store.lease_of("/ipam/172.17.11.0/172.17.11.11"),
        Some(record.lease_id())
    );
    assert_eq!(store.lease_of("/ipam-owners/c1/net1"), Some(record.lease_id()));

    let found = ipam.find_record("c1", "net1").await.unwrap();
    assert_eq!(found, Some(record.clone()));
    ipam.verify_record(&record).await.unwrap();
    assert_eq!(ipam.find_record("c1", "net2").await.unwrap(), None);

    assert!(ipam.release("c1", "net1").await.unwrap());
    assert!(allocation_keys(&store).is_empty());
    assert!(!ipam.release("c1", "net1").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_commit_leaves_nothing_on_a_hold_lease() {
    let store = MemoryStore::new();
    let mut conf = net_conf(&[SEG_A]);
    conf.ipam.retry_backoff_ms = 1000;
    register(&store, &conf, SEG_A, 100).await;
    let ipam = IpamAllocator::new(Arc::new(store.clone()), &conf.ipam);

    let allocation = ipam.allocate(&candidates(&[SEG_A])).await.unwrap();
    store.refuse_writes_under(Some("/ipam-owners/"));

    // The caller gives up (or dies) shortly after the owner write fails.
    let outcome =
        tokio::time::timeout(Duration::from_millis(50), ipam.commit(allocation, "c1", "net1"))
            .await;
    assert!(matches!(outcome, Ok(Err(CniError::StoreUnavailable(_)))));
    store.refuse_writes_under(None);

    // No hold lease outlives the lock TTL without its owner record.
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(allocation_keys(&store).is_empty());
    assert_eq!(store.lease_count(), 0);
    assert_eq!(ipam.find_record("c1", "net1").await.unwrap(), None);

    let again = ipam.allocate(&candidates(&[SEG_A])).await.unwrap();
    assert_eq!(again.result().address, Ipv4Addr::new(172, 17, 11, 11));
    again.release().await.unwrap();
}

#[tokio::test]
async fn test_verify_fails_once_lease_expires() {
    let store = MemoryStore::new();
    let conf = net_conf(&[SEG_A]);
    register(&store, &conf, SEG_A, 100).await;
    let ipam = allocator(&store);

    let allocation = ipam.allocate(&candidates(&[SEG_A])).await.unwrap();
    let record = ipam.commit(allocation, "c1", "net1").await.unwrap();

    store.expire_lease(record.lease_id());
    let err = ipam.verify_record(&record).await.unwrap_err();
    assert!(matches!(err, CniError::Validation(_)));
}

#[tokio::test]
async fn test_segment_registration() {
    let store = MemoryStore::new();
    let ipam = allocator(&store);

    ipam.register_segment(SEG_A, 100).await.unwrap();
    ipam.register_segment(SEG_B, 200).await.unwrap();
    assert!(matches!(
        ipam.register_segment("172.17.13.0", 0).await,
        Err(CniError::Config(_))
    ));
    assert!(matches!(
        ipam.register_segment("172.17.13.0", 4095).await,
        Err(CniError::Config(_))
    ));

    let allocation = ipam.allocate(&candidates(&[SEG_A])).await.unwrap();
    let record = ipam.commit(allocation, "c1", "net1").await.unwrap();

    let segments = ipam.list_segments().await.unwrap();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].segment, SEG_A);
    assert_eq!(segments[0].vlan, Some(100));
    assert_eq!(segments[0].used, 1);
    assert_eq!(segments[0].capacity, 239);
    assert_eq!(segments[1].used, 0);

    assert!(matches!(ipam.remove_segment(SEG_A).await, Err(CniError::Config(_))));
    ipam.release_record(&record).await.unwrap();
    ipam.remove_segment(SEG_A).await.unwrap();
    assert!(matches!(ipam.remove_segment(SEG_A).await, Err(CniError::Resolver(_))));

    let err = ipam.allocate(&candidates(&[SEG_A])).await.unwrap_err();
    assert!(matches!(err, CniError::Resolver(_)));
}
