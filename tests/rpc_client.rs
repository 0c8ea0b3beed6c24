//! Integration tests for the RPC client against an in-process
//! WebSocket server. These drive the real client code paths: sequence
//! allocation, response matching, timeouts, broadcast dispatch and the
//! camera subscription flow.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use prost::Message as ProstMessage;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use gamelink::rpc::camera::{buttons, CameraEvent};
use gamelink::rpc::proto::{
    AppBroadcast, AppCameraInfo, AppCameraRays, AppEmpty, AppMessage, AppRequest, AppResponse,
    AppTime,
};
use gamelink::rpc::{RpcClient, RpcConfig, RpcError};

type Responder = Arc<dyn Fn(&AppRequest) -> Vec<AppMessage> + Send + Sync>;

/// Spawn a WebSocket server that feeds every decoded request through
/// `responder` and writes back whatever frames it returns.
async fn start_server(responder: Responder) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let responder = Arc::clone(&responder);
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut write, mut read) = ws.split();
                while let Some(Ok(message)) = read.next().await {
                    if let Message::Binary(data) = message {
                        let request = AppRequest::decode(data.as_slice()).unwrap();
                        for reply in responder(&request) {
                            if write
                                .send(Message::Binary(reply.encode_to_vec()))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

fn config(addr: SocketAddr) -> RpcConfig {
    RpcConfig {
        server: "127.0.0.1".to_string(),
        port: addr.port(),
        player_id: 76561198000000000,
        player_token: 123456789,
        use_proxy: false,
    }
}

fn ok_response(seq: Option<u32>) -> AppMessage {
    AppMessage {
        response: Some(AppResponse {
            seq,
            success: Some(AppEmpty {}),
            ..Default::default()
        }),
        broadcast: None,
    }
}

fn echo_responder(seen: Arc<Mutex<Vec<AppRequest>>>) -> Responder {
    Arc::new(move |request| {
        seen.lock().unwrap().push(request.clone());
        vec![ok_response(request.seq)]
    })
}

#[tokio::test]
async fn test_sequences_start_at_one_and_increase() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let addr = start_server(echo_responder(Arc::clone(&seen))).await;
    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();

    for _ in 0..3 {
        client
            .send_request_async(AppRequest::default(), Duration::from_secs(2))
            .await
            .unwrap();
    }

    let seqs: Vec<Option<u32>> = seen.lock().unwrap().iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![Some(1), Some(2), Some(3)]);
}

#[tokio::test]
async fn test_concurrent_sequences_are_unique() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let addr = start_server(echo_responder(Arc::clone(&seen))).await;
    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();
    let client = Arc::new(client);

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            client
                .send_request_async(AppRequest::default(), Duration::from_secs(2))
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut seqs: Vec<u32> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.seq.unwrap())
        .collect();
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_requests_are_stamped_with_player_credentials() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let addr = start_server(echo_responder(Arc::clone(&seen))).await;
    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();

    client
        .send_request_async(AppRequest::default(), Duration::from_secs(2))
        .await
        .unwrap();

    let request = seen.lock().unwrap()[0].clone();
    assert_eq!(request.player_id, Some(76561198000000000));
    assert_eq!(request.player_token, Some(123456789));
}

#[tokio::test]
async fn test_response_matches_request_by_sequence() {
    let responder: Responder = Arc::new(|request| {
        // Answer get_time with a time payload, everything else plainly.
        if request.get_time.is_some() {
            vec![AppMessage {
                response: Some(AppResponse {
                    seq: request.seq,
                    time: Some(AppTime {
                        time: Some(12.5),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                broadcast: None,
            }]
        } else {
            vec![ok_response(request.seq)]
        }
    });
    let addr = start_server(responder).await;
    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();

    let time = client.get_time().await.unwrap();
    assert_eq!(time.time, Some(12.5));
}

#[tokio::test]
async fn test_timeout_removes_pending_and_fires_on_deadline() {
    // A server that never answers.
    let responder: Responder = Arc::new(|_| Vec::new());
    let addr = start_server(responder).await;
    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();

    let deadline = Duration::from_millis(300);
    let started = Instant::now();
    let err = client
        .send_request_async(AppRequest::default(), deadline)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RpcError::TimedOut));
    assert!(elapsed >= deadline, "fired early: {elapsed:?}");
    assert!(elapsed < deadline + Duration::from_millis(500), "fired late: {elapsed:?}");
}

#[tokio::test]
async fn test_pending_survives_disconnect_until_deadline() {
    // A server that reads one frame and then drops the connection.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (_write, mut read) = ws.split();
                let _ = read.next().await;
            });
        }
    });

    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();

    // The disconnect must not fail the call early; it completes with a
    // timeout at the caller's deadline.
    let deadline = Duration::from_millis(400);
    let started = Instant::now();
    let err = client
        .send_request_async(AppRequest::default(), deadline)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RpcError::TimedOut));
    assert!(elapsed >= deadline, "failed early: {elapsed:?}");
    assert!(elapsed < deadline + Duration::from_millis(500), "failed late: {elapsed:?}");
}

#[tokio::test]
async fn test_send_after_close_is_not_connected() {
    let responder: Responder = Arc::new(|request| vec![ok_response(request.seq)]);
    let addr = start_server(responder).await;
    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();

    client.close();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client
        .send_request_async(AppRequest::default(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NotConnected));
}

#[tokio::test]
async fn test_duplicate_response_reaches_handlers_only() {
    // The server answers every request twice with the same sequence.
    let responder: Responder =
        Arc::new(|request| vec![ok_response(request.seq), ok_response(request.seq)]);
    let addr = start_server(responder).await;
    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();

    let seen = Arc::new(Mutex::new(0u32));
    let handler_seen = Arc::clone(&seen);
    client.add_message_handler(move |message| {
        if message.response.is_some() {
            *handler_seen.lock().unwrap() += 1;
        }
        false
    });

    // The pending entry is single-shot: the call resolves exactly once.
    client
        .send_request_async(AppRequest::default(), Duration::from_secs(2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(*seen.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_handlers_run_in_registration_order_until_stop() {
    let responder: Responder = Arc::new(|request| vec![ok_response(request.seq)]);
    let addr = start_server(responder).await;
    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&order);
    client.add_message_handler(move |_| {
        first.lock().unwrap().push("first");
        true // stop propagation
    });
    let second = Arc::clone(&order);
    client.add_message_handler(move |_| {
        second.lock().unwrap().push("second");
        false
    });

    client
        .send_request_async(AppRequest::default(), Duration::from_secs(2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*order.lock().unwrap(), vec!["first"]);
}

/// Camera responder: subscribe returns geometry; `get_time` makes the
/// server push `n` ray broadcasts, modelling broadcasts that follow a
/// poke from the client.
fn camera_responder(requests: Arc<Mutex<Vec<AppRequest>>>, rays_per_poke: usize) -> Responder {
    Arc::new(move |request| {
        requests.lock().unwrap().push(request.clone());

        if request.camera_subscribe.is_some() {
            return vec![AppMessage {
                response: Some(AppResponse {
                    seq: request.seq,
                    camera_subscribe_info: Some(AppCameraInfo {
                        width: Some(16),
                        height: Some(16),
                        control_flags: Some(32),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                broadcast: None,
            }];
        }

        if request.get_time.is_some() {
            let mut replies = vec![ok_response(request.seq)];
            for i in 0..rays_per_poke {
                replies.push(AppMessage {
                    response: None,
                    broadcast: Some(AppBroadcast {
                        camera_rays: Some(AppCameraRays {
                            sample_offset: Some(i as u32),
                            ray_data: Some(vec![1, 2, 3, 255]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                });
            }
            return replies;
        }

        vec![ok_response(request.seq)]
    })
}

async fn next_camera_event(
    events: &mut tokio::sync::mpsc::Receiver<CameraEvent>,
) -> CameraEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("camera event timed out")
        .expect("camera event channel closed")
}

#[tokio::test]
async fn test_camera_subscribe_and_render_on_tenth_frame() {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let addr = start_server(camera_responder(Arc::clone(&requests), 9)).await;
    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();

    let (camera, mut camera_events) = client.camera("GATE_CAM");
    let info = camera.subscribe().await.unwrap();
    assert_eq!(info.width, Some(16));
    assert!(camera.is_auto_turret());

    assert!(matches!(next_camera_event(&mut camera_events).await, CameraEvent::Subscribing));
    assert!(matches!(next_camera_event(&mut camera_events).await, CameraEvent::Subscribed(_)));

    // Nine ray broadcasts: no render yet.
    client.get_time().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(camera_events.try_recv().is_err(), "render before threshold");

    // The tenth broadcast produces exactly one render of the advertised
    // size, and the buffer starts over.
    client.get_time().await.unwrap();

    match next_camera_event(&mut camera_events).await {
        CameraEvent::Render(image) => assert_eq!(image.dimensions(), (16, 16)),
        other => panic!("expected render, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(camera_events.try_recv().is_err(), "only one render expected");
}

#[tokio::test]
async fn test_camera_unsubscribe_clears_capture() {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let addr = start_server(camera_responder(Arc::clone(&requests), 20)).await;
    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();

    let (camera, mut camera_events) = client.camera("GATE_CAM");
    camera.subscribe().await.unwrap();
    assert!(matches!(next_camera_event(&mut camera_events).await, CameraEvent::Subscribing));
    assert!(matches!(next_camera_event(&mut camera_events).await, CameraEvent::Subscribed(_)));

    camera.unsubscribe().await.unwrap();
    assert!(matches!(next_camera_event(&mut camera_events).await, CameraEvent::Unsubscribing));
    assert!(matches!(next_camera_event(&mut camera_events).await, CameraEvent::Unsubscribed));

    let unsubscribes = requests
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.camera_unsubscribe.is_some())
        .count();
    assert_eq!(unsubscribes, 1);

    // Ray broadcasts after unsubscribe are not captured.
    client.get_time().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(camera_events.try_recv().is_err());
}

#[tokio::test]
async fn test_camera_shoot_is_press_then_release() {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let addr = start_server(camera_responder(Arc::clone(&requests), 0)).await;
    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();

    let (camera, _camera_events) = client.camera("TURRET");
    camera.subscribe().await.unwrap();
    camera.shoot().await.unwrap();

    let inputs: Vec<i32> = requests
        .lock()
        .unwrap()
        .iter()
        .filter_map(|r| r.camera_input.as_ref())
        .map(|input| input.buttons.unwrap())
        .collect();
    assert_eq!(inputs, vec![buttons::FIRE_PRIMARY, buttons::NONE]);
}

#[tokio::test]
async fn test_camera_move_requires_subscription() {
    let responder: Responder = Arc::new(|request| vec![ok_response(request.seq)]);
    let addr = start_server(responder).await;
    let (client, _events) = RpcClient::connect(config(addr)).await.unwrap();

    let (camera, _camera_events) = client.camera("CAM");
    assert!(camera.move_(buttons::FORWARD, 0.0, 0.0).await.is_err());
}

#[tokio::test]
async fn test_connect_refused_is_transport_error() {
    // Nothing is listening on this port.
    let config = RpcConfig {
        server: "127.0.0.1".to_string(),
        port: 1,
        player_id: 1,
        player_token: 1,
        use_proxy: false,
    };
    let err = RpcClient::connect(config).await.err().unwrap();
    assert!(matches!(err, RpcError::Transport(_)));
}
