//! Paged listing scenarios: budget-driven pagination, cursor lifecycle,
//! continuation errors.

use common::{ObjectId, Reply, Request, Status};
use rcached::ServerConfig;
use std::collections::HashSet;
use test_common::*;

mod test_common;

/// Drive one full listing, page by page, returning every record's id and
/// the number of reply frames it took.
async fn collect_listing(client: &mut TestClient) -> (Vec<ObjectId>, usize) {
    let mut listing_id = 0;
    let mut ids = Vec::new();
    let mut pages = 0;
    loop {
        let reply = client
            .roundtrip(
                &Request::List {
                    req_id: 100 + pages as u64,
                    listing_id,
                    object_type: common::ObjectType::Regular,
                },
                &[],
            )
            .await
            .msg;
        match reply {
            Reply::List {
                status,
                listing_id: reply_listing_id,
                is_last_part,
                records,
                ..
            } => {
                assert_eq!(status, Status::Ok);
                assert_ne!(reply_listing_id, 0);
                if listing_id != 0 {
                    assert_eq!(reply_listing_id, listing_id);
                }
                listing_id = reply_listing_id;
                pages += 1;
                for record in records {
                    ids.push(ObjectId::from_wire(&record.hash).unwrap());
                }
                if is_last_part {
                    return (ids, pages);
                }
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}

#[tokio::test]
async fn listing_pages_until_exhaustion() {
    let config = ServerConfig {
        listing_budget: 2048,
        ..Default::default()
    };
    let server = spawn_server(config, 1 << 20).await;
    let mut client = TestClient::connect(&server.socket).await;
    client.handshake().await;

    let description = "x".repeat(256);
    let mut stored = HashSet::new();
    for byte in 0..20u8 {
        let id = object_id(byte);
        client.store(byte as u64, &id, &[byte; 8], &description).await;
        stored.insert(id);
    }

    let (ids, pages) = collect_listing(&mut client).await;
    assert!(pages > 1, "a 2 KiB budget must split 20 records over pages");
    assert_eq!(ids.len(), stored.len(), "no duplicates and nothing missing");
    assert_eq!(ids.into_iter().collect::<HashSet<_>>(), stored);
    assert_eq!(server.backend.open_listings().await, 0);
}

#[tokio::test]
async fn empty_listing_is_terminal_in_one_frame() {
    let server = spawn_server(ServerConfig::default(), 1 << 20).await;
    let mut client = TestClient::connect(&server.socket).await;
    client.handshake().await;

    let reply = client
        .roundtrip(
            &Request::List {
                req_id: 1,
                listing_id: 0,
                object_type: common::ObjectType::Catalog,
            },
            &[],
        )
        .await
        .msg;
    match reply {
        Reply::List {
            status,
            is_last_part,
            records,
            ..
        } => {
            assert_eq!(status, Status::Ok);
            assert!(is_last_part);
            assert!(records.is_empty());
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    assert_eq!(server.backend.open_listings().await, 0);
}

#[tokio::test]
async fn unknown_continuation_is_malformed() {
    let server = spawn_server(ServerConfig::default(), 1 << 20).await;
    let mut client = TestClient::connect(&server.socket).await;
    client.handshake().await;

    let reply = client
        .roundtrip(
            &Request::List {
                req_id: 1,
                listing_id: 4242,
                object_type: common::ObjectType::Regular,
            },
            &[],
        )
        .await
        .msg;
    match reply {
        Reply::List {
            status,
            is_last_part,
            records,
            ..
        } => {
            assert_eq!(status, Status::Malformed);
            assert!(!is_last_part);
            assert!(records.is_empty());
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn listings_allocate_fresh_nonzero_ids() {
    let server = spawn_server(ServerConfig::default(), 1 << 20).await;
    let mut client = TestClient::connect(&server.socket).await;
    client.handshake().await;

    let mut seen = HashSet::new();
    for req_id in 0..3 {
        let reply = client
            .roundtrip(
                &Request::List {
                    req_id,
                    listing_id: 0,
                    object_type: common::ObjectType::Regular,
                },
                &[],
            )
            .await
            .msg;
        match reply {
            Reply::List {
                listing_id,
                is_last_part,
                ..
            } => {
                assert_ne!(listing_id, 0);
                assert!(is_last_part);
                assert!(seen.insert(listing_id), "listing id reused");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
