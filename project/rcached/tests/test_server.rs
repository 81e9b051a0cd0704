//! Event-loop level scenarios: detach broadcast, quit, disconnect
//! reclamation, termination and the TCP endpoint.

use common::wire;
use common::{Reply, Request, Status};
use rcached::backend::InMemoryCache;
use rcached::{CacheServer, Locator, ServerConfig};
use std::sync::Arc;
use test_common::*;

mod test_common;

#[tokio::test]
async fn detach_reaches_every_client_without_closing() {
    let server = spawn_server(ServerConfig::default(), 1 << 20).await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = TestClient::connect(&server.socket).await;
        client.handshake().await;
        clients.push(client);
    }

    server.handle.ask_to_detach();

    for client in &mut clients {
        let frame = client.recv().await;
        assert_eq!(frame.msg, Reply::Detach);
    }

    // Connections stay open and keep serving requests.
    for (req_id, client) in clients.iter_mut().enumerate() {
        let reply = client
            .roundtrip(
                &Request::Info {
                    req_id: req_id as u64,
                },
                &[],
            )
            .await
            .msg;
        match reply {
            Reply::Info { status, .. } => assert_eq!(status, Status::Ok),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}

#[tokio::test]
async fn quit_closes_only_that_connection() {
    let server = spawn_server(ServerConfig::default(), 1 << 20).await;
    let mut quitter = TestClient::connect(&server.socket).await;
    let mut stayer = TestClient::connect(&server.socket).await;
    quitter.handshake().await;
    stayer.handshake().await;

    quitter.send(&Request::Quit, &[]).await;
    let eof = wire::recv_frame::<_, Reply>(&mut quitter.stream, 1 << 20).await;
    assert!(eof.is_err(), "quit must close the connection");

    let reply = stayer.roundtrip(&Request::Info { req_id: 1 }, &[]).await.msg;
    match reply {
        Reply::Info { status, .. } => assert_eq!(status, Status::Ok),
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_message_drops_the_connection() {
    let server = spawn_server(ServerConfig::default(), 1 << 20).await;
    let mut client = TestClient::connect(&server.socket).await;
    client.handshake().await;

    // A bare integer is no valid request message.
    wire::send_frame(&mut client.stream, &0xdead_beefu64, &[])
        .await
        .unwrap();
    let eof = wire::recv_frame::<_, Reply>(&mut client.stream, 1 << 20).await;
    assert!(eof.is_err());
}

#[tokio::test]
async fn disconnect_reclaims_transactions_and_listings() {
    let config = ServerConfig {
        max_object_size: 64,
        listing_budget: 64,
        ..Default::default()
    };
    let server = spawn_server(config, 1 << 20).await;

    {
        let mut seeder = TestClient::connect(&server.socket).await;
        seeder.handshake().await;
        for byte in 0..4u8 {
            seeder
                .store(byte as u64, &object_id(byte), &[byte; 8], "some description")
                .await;
        }
    }

    let mut client = TestClient::connect(&server.socket).await;
    client.handshake().await;

    // Leave a store transaction open...
    let reply = client
        .roundtrip(
            &Request::Store {
                req_id: 50,
                session_id: client.session_id,
                object_id: object_id(9).to_wire(),
                part_nr: 1,
                last_part: false,
                expected_size: None,
                object_type: None,
                description: None,
            },
            &vec![0u8; 64],
        )
        .await
        .msg;
    assert_eq!(
        reply,
        Reply::Store {
            req_id: 50,
            part_nr: 1,
            status: Status::Ok
        }
    );

    // ...and a listing cursor that is not exhausted yet.
    let reply = client
        .roundtrip(
            &Request::List {
                req_id: 51,
                listing_id: 0,
                object_type: common::ObjectType::Regular,
            },
            &[],
        )
        .await
        .msg;
    match reply {
        Reply::List { is_last_part, .. } => assert!(!is_last_part),
        other => panic!("unexpected reply: {other:?}"),
    }

    assert_eq!(server.backend.open_transactions().await, 1);
    assert_eq!(server.backend.open_listings().await, 1);

    drop(client);

    let backend = server.backend.clone();
    wait_for(|| {
        let backend = backend.clone();
        async move {
            backend.open_transactions().await == 0 && backend.open_listings().await == 0
        }
    })
    .await;
}

#[tokio::test]
async fn terminate_unlinks_socket_and_exits() {
    let server = spawn_server(ServerConfig::default(), 1 << 20).await;
    let mut client = TestClient::connect(&server.socket).await;
    client.handshake().await;

    server.handle.terminate();
    server.task.await.unwrap().unwrap();
    assert!(!server.socket.exists(), "socket file must be unlinked");
}

#[tokio::test]
async fn tcp_endpoint_serves_handshakes() {
    let locator = Locator::Tcp("127.0.0.1".to_string(), 0);
    let backend = Arc::new(InMemoryCache::new(1 << 20));
    let server = CacheServer::bind(ServerConfig::default(), backend, &locator)
        .await
        .unwrap();
    let addr = server.local_addr().expect("tcp endpoint has an address");
    tokio::spawn(server.run());

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    wire::send_frame(&mut stream, &Request::Handshake { name: None }, &[])
        .await
        .unwrap();
    let frame = wire::recv_frame::<_, Reply>(&mut stream, 1 << 20).await.unwrap();
    match frame.msg {
        Reply::Handshake {
            status, session_id, ..
        } => {
            assert_eq!(status, Status::Ok);
            assert_eq!(session_id, 1);
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}
