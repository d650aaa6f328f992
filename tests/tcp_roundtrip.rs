//! Two coordinators talking over a real TCP connection

use std::time::Duration;

use flatlink::network::{connect, NetworkConfig, Server};
use flatlink::protocol::{decode_vec3, encode_array, Frame};
use flatlink::transport::{CallOptions, Coordinator, EchoHandler, TransportConfig, TransportError};

fn transport() -> TransportConfig {
    TransportConfig::default().without_liveness()
}

async fn start_pair() -> (Server, Coordinator, tokio::task::JoinHandle<String>) {
    let server_side = Coordinator::new(transport());
    server_side.register_handler("ping", EchoHandler);
    server_side.register_fn("get_pose", |_args| async {
        let mut pose = Frame::new();
        pose.insert("position", encode_array([1.5, -2.0, 0.25]))?;
        Ok::<_, anyhow::Error>(pose)
    });

    let mut server = Server::new(
        NetworkConfig::new(0).with_bind_address("127.0.0.1"),
        server_side,
    );
    let addr = server.start().await.unwrap();

    let client_side = Coordinator::new(transport());
    let pump = connect(addr, &client_side, &NetworkConfig::default())
        .await
        .unwrap();

    (server, client_side, pump)
}

#[tokio::test]
async fn test_call_over_tcp() {
    let (mut server, client, pump) = start_pair().await;

    let args = Frame::from_pairs([("text", "hello world"), ("note", "50% & more\n")]).unwrap();
    let result = client
        .call("ping", args.clone(), CallOptions::from_millis(2000, 2000))
        .await
        .unwrap();
    assert_eq!(result, args);

    let pose = client
        .call("get_pose", Frame::new(), CallOptions::from_millis(2000, 2000))
        .await
        .unwrap();
    let position = decode_vec3(pose.get("position").unwrap()).unwrap();
    assert_eq!(position, [1.5, -2.0, 0.25]);

    client.close();
    pump.await.unwrap();
    server.stop().await.unwrap();
    server.coordinator().close();
}

#[tokio::test]
async fn test_concurrent_calls_over_tcp() {
    let (mut server, client, pump) = start_pair().await;

    let calls: Vec<_> = (0..20)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let value = format!("n{i}");
                let args = Frame::from_pairs([("text", value.as_str())]).unwrap();
                let result = client
                    .call("ping", args, CallOptions::from_millis(2000, 2000))
                    .await
                    .unwrap();
                assert_eq!(result.get("text"), Some(value.as_str()));
            })
        })
        .collect();

    for call in calls {
        call.await.unwrap();
    }
    assert!(client.pending_ids().is_empty());

    client.close();
    pump.await.unwrap();
    server.stop().await.unwrap();
    server.coordinator().close();
}

#[tokio::test]
async fn test_server_calls_client() {
    let (mut server, client, pump) = start_pair().await;
    client.register_fn("arm_grab", |_args| async {
        Err::<Frame, _>(anyhow::anyhow!("no free hand"))
    });

    let server_side = server.coordinator().clone();
    server_side
        .wait_for_connection(Duration::from_secs(2))
        .await
        .unwrap();

    let err = server_side
        .call("arm_grab", Frame::new(), CallOptions::from_millis(2000, 2000))
        .await
        .unwrap_err();
    match err {
        TransportError::PeerReported { message, .. } => assert_eq!(message, "no free hand"),
        other => panic!("unexpected error: {other:?}"),
    }

    let err = server_side
        .call("unknown", Frame::new(), CallOptions::from_millis(2000, 2000))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("method not implemented"), "{err}");

    client.close();
    pump.await.unwrap();
    server.stop().await.unwrap();
    server_side.close();
}

#[tokio::test]
async fn test_server_close_disconnects_client() {
    let (mut server, client, pump) = start_pair().await;
    client
        .call("ping", Frame::new(), CallOptions::from_millis(2000, 2000))
        .await
        .unwrap();

    server.coordinator().close();
    let reason = pump.await.unwrap();
    assert!(reason.contains("server closed"), "{reason}");
    assert_eq!(client.connection_count(), 0);

    let err = client
        .call("ping", Frame::new(), CallOptions::from_millis(200, 100))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NoPeerConnected), "{err:?}");

    server.stop().await.unwrap();
    client.close();
}
