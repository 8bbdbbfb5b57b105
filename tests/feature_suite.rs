use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use framewire::codec::{self, Phase};
use framewire::e2e_common::{
    echo_encrypted_once, echo_plaintext_once, recv_from_client, run_responder, send_heartbeat,
    send_to_client,
};
use framewire::{
    ClientError, ClientId, ClientOptions, Message, PairSocket, ProtocolFailure, WireClient,
};

const WAIT: Duration = Duration::from_secs(5);

fn plaintext_options() -> ClientOptions {
    ClientOptions::new("tcp://127.0.0.1:5999")
}

fn secured_options() -> ClientOptions {
    plaintext_options()
        .with_credentials("alice", "s3cret")
        .with_heartbeat_ms(1_000)
}

fn message_channel(client: &WireClient) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.events().on_message_received(move |message| {
        let _ = tx.send(message.clone());
    });
    rx
}

fn invalid_channel(client: &WireClient) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.events().on_invalid_message(move |message| {
        let _ = tx.send(message.clone());
    });
    rx
}

fn established_channel(client: &WireClient) -> mpsc::UnboundedReceiver<ClientId> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.events().on_protocol_established(move |client_id| {
        let _ = tx.send(*client_id);
    });
    rx
}

fn failed_channel(client: &WireClient) -> mpsc::UnboundedReceiver<ProtocolFailure> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.events().on_protocol_failed(move |failure| {
        let _ = tx.send(failure.clone());
    });
    rx
}

#[tokio::test]
async fn plaintext_round_trip_preserves_frames_and_identity() {
    let (client_end, mut peer) = PairSocket::pair();
    let client = WireClient::with_socket(client_end, plaintext_options());
    let mut messages = message_channel(&client);

    assert!(client.can_send());
    client
        .send(vec![vec![0x41], vec![0x42, 0x43]])
        .await
        .unwrap();
    echo_plaintext_once(&mut peer).await.unwrap();

    let message = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(message.frames, vec![vec![0x41], vec![0x42, 0x43]]);
    assert_eq!(message.client_id, client.client_id());
    assert!(messages.try_recv().is_err());
}

#[tokio::test]
async fn plaintext_sends_are_delivered_in_order() {
    let (client_end, mut peer) = PairSocket::pair();
    let client = WireClient::with_socket(client_end, plaintext_options());
    let mut messages = message_channel(&client);

    for index in 0u8..5 {
        client.send(vec![vec![index]]).await.unwrap();
    }
    for _ in 0..5 {
        echo_plaintext_once(&mut peer).await.unwrap();
    }
    for index in 0u8..5 {
        let message = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
        assert_eq!(message.frames, vec![vec![index]]);
    }
}

#[tokio::test(start_paused = true)]
async fn secured_handshake_establishes_and_round_trips() {
    let (client_end, mut server_end) = PairSocket::pair();
    let client = WireClient::with_socket(client_end, secured_options());
    let mut established = established_channel(&client);
    let mut messages = message_channel(&client);

    assert!(!client.can_send());
    let responder = tokio::spawn(async move {
        let cipher = run_responder(&mut server_end, "alice", "s3cret")
            .await
            .expect("handshake completes");
        (server_end, cipher)
    });

    assert!(
        client
            .secure_connection(true, Duration::from_millis(500))
            .await
    );
    assert!(client.can_send());
    assert!(client.is_host_alive());

    let fired = timeout(WAIT, established.recv()).await.unwrap().unwrap();
    assert_eq!(fired, client.client_id());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(established.try_recv().is_err(), "established fired once");

    // encrypted echo: delivered frames equal decrypt(encrypt(original))
    let (mut server_end, cipher) = responder.await.unwrap();
    client.send(vec![b"ping".to_vec()]).await.unwrap();
    echo_encrypted_once(&mut server_end, &cipher).await.unwrap();
    let message = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(message.frames, vec![b"ping".to_vec()]);
    assert_eq!(message.client_id, client.client_id());
}

#[tokio::test(start_paused = true)]
async fn second_secure_connection_is_a_no_op_once_established() {
    let (client_end, mut server_end) = PairSocket::pair();
    let client = WireClient::with_socket(client_end, secured_options());

    let responder = tokio::spawn(async move {
        run_responder(&mut server_end, "alice", "s3cret")
            .await
            .expect("handshake completes");
        server_end
    });
    assert!(
        client
            .secure_connection(true, Duration::from_millis(500))
            .await
    );
    let _server_end = responder.await.unwrap();
    assert!(
        client
            .secure_connection(true, Duration::from_millis(500))
            .await
    );
    assert!(client.can_send());
}

#[tokio::test(start_paused = true)]
async fn server_rejection_fires_protocol_failed_and_keeps_sends_gated() {
    let (client_end, mut server_end) = PairSocket::pair();
    let client = WireClient::with_socket(client_end, secured_options());
    let mut failures = failed_channel(&client);

    let peer = tokio::spawn(async move {
        let hello = recv_from_client(&mut server_end).await.unwrap();
        assert_eq!(hello, vec![codec::header(codec::CLIENT_HELLO)]);
        send_to_client(
            &mut server_end,
            vec![codec::header(Phase::Step0.byte()), vec![7u8; 32]],
        )
        .await
        .unwrap();
        let exchange = recv_from_client(&mut server_end).await.unwrap();
        assert_eq!(exchange.len(), 3);
        send_to_client(
            &mut server_end,
            vec![codec::header(Phase::Fail1.byte()), b"denied".to_vec()],
        )
        .await
        .unwrap();
        server_end
    });

    assert!(
        !client
            .secure_connection(true, Duration::from_millis(500))
            .await
    );
    let failure = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.client_id, client.client_id());
    assert!(!client.can_send());
    assert!(matches!(
        client.send(vec![vec![0x00]]).await,
        Err(ClientError::NotReady)
    ));
    let _server_end = peer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn secure_connection_can_retry_after_a_failed_exchange() {
    let (client_end, mut server_end) = PairSocket::pair();
    let client = WireClient::with_socket(client_end, secured_options());
    let mut failures = failed_channel(&client);
    let mut established = established_channel(&client);

    // first attempt: the server refuses the exchange step
    let reject = tokio::spawn(async move {
        let hello = recv_from_client(&mut server_end).await.unwrap();
        assert_eq!(hello, vec![codec::header(codec::CLIENT_HELLO)]);
        send_to_client(
            &mut server_end,
            vec![codec::header(Phase::Step0.byte()), vec![7u8; 32]],
        )
        .await
        .unwrap();
        let exchange = recv_from_client(&mut server_end).await.unwrap();
        assert_eq!(exchange.len(), 3);
        send_to_client(
            &mut server_end,
            vec![codec::header(Phase::Fail1.byte()), b"denied".to_vec()],
        )
        .await
        .unwrap();
        server_end
    });
    assert!(
        !client
            .secure_connection(true, Duration::from_millis(500))
            .await
    );
    timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert!(!client.can_send());
    let mut server_end = reject.await.unwrap();

    // second attempt over the same socket runs a fresh session to completion
    let responder = tokio::spawn(async move {
        run_responder(&mut server_end, "alice", "s3cret")
            .await
            .expect("retry handshake completes");
        server_end
    });
    assert!(
        client
            .secure_connection(true, Duration::from_millis(500))
            .await
    );
    assert!(client.can_send());
    let fired = timeout(WAIT, established.recv()).await.unwrap().unwrap();
    assert_eq!(fired, client.client_id());
    let _server_end = responder.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn host_silence_latches_dead_and_gates_sends() {
    let (client_end, mut server_end) = PairSocket::pair();
    let client = WireClient::with_socket(client_end, secured_options());

    let responder = tokio::spawn(async move {
        let cipher = run_responder(&mut server_end, "alice", "s3cret")
            .await
            .expect("handshake completes");
        (server_end, cipher)
    });
    assert!(
        client
            .secure_connection(true, Duration::from_millis(500))
            .await
    );
    let (mut server_end, _cipher) = responder.await.unwrap();
    assert!(client.is_host_alive());

    // the peer goes silent: drain the client's heartbeats, answer nothing
    let drain = tokio::spawn(async move {
        loop {
            if recv_from_client(&mut server_end).await.is_err() {
                break;
            }
        }
    });

    for _ in 0..40 {
        if !client.is_host_alive() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(!client.is_host_alive());
    assert!(!client.can_send());
    assert!(matches!(
        client.send(vec![vec![0x00]]).await,
        Err(ClientError::NotReady)
    ));

    client.dispose();
    drain.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_the_host_alive() {
    let (client_end, mut server_end) = PairSocket::pair();
    let client = WireClient::with_socket(client_end, secured_options());

    let responder = tokio::spawn(async move {
        let cipher = run_responder(&mut server_end, "alice", "s3cret")
            .await
            .expect("handshake completes");
        (server_end, cipher)
    });
    assert!(
        client
            .secure_connection(true, Duration::from_millis(500))
            .await
    );
    let (mut server_end, _cipher) = responder.await.unwrap();

    // a heartbeating peer survives well past the silence threshold
    let beat = tokio::spawn(async move {
        loop {
            tokio::select! {
                received = recv_from_client(&mut server_end) => {
                    if received.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(900)) => {
                    if send_heartbeat(&mut server_end).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(client.is_host_alive());
    assert!(client.can_send());

    client.dispose();
    beat.await.unwrap();
}

#[tokio::test]
async fn sends_before_securing_are_not_ready() {
    let (client_end, _server_end) = PairSocket::pair();
    let client = WireClient::with_socket(client_end, secured_options());
    assert!(!client.can_send());
    assert!(matches!(
        client.send(vec![vec![0x00]]).await,
        Err(ClientError::NotReady)
    ));
}

#[tokio::test(start_paused = true)]
async fn malformed_reply_during_handshake_is_invalid_not_fatal() {
    let (client_end, mut server_end) = PairSocket::pair();
    let client = WireClient::with_socket(client_end, secured_options());
    let mut invalid = invalid_channel(&client);
    let mut failures = failed_channel(&client);

    assert!(!client.secure_connection(false, Duration::ZERO).await);

    let hello = timeout(WAIT, recv_from_client(&mut server_end))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hello, vec![codec::header(codec::CLIENT_HELLO)]);
    // five wire frames whose head carries an unknown phase byte
    send_to_client(
        &mut server_end,
        vec![
            vec![codec::SOH, codec::ACK, 0xff, codec::BEL],
            vec![0xde],
            vec![0xad],
            vec![0xbe],
        ],
    )
    .await
    .unwrap();

    let message = timeout(WAIT, invalid.recv()).await.unwrap().unwrap();
    assert_eq!(message.client_id, client.client_id());
    assert_eq!(message.frames.len(), 4);
    assert!(failures.try_recv().is_err(), "handshake still pending");
    assert!(!client.can_send());
}

#[tokio::test(start_paused = true)]
async fn undecryptable_frames_after_establishment_are_invalid() {
    let (client_end, mut server_end) = PairSocket::pair();
    let client = WireClient::with_socket(client_end, secured_options());
    let mut invalid = invalid_channel(&client);
    let mut messages = message_channel(&client);

    let responder = tokio::spawn(async move {
        let cipher = run_responder(&mut server_end, "alice", "s3cret")
            .await
            .expect("handshake completes");
        (server_end, cipher)
    });
    assert!(
        client
            .secure_connection(true, Duration::from_millis(500))
            .await
    );
    let (mut server_end, _cipher) = responder.await.unwrap();

    send_to_client(&mut server_end, vec![vec![0x99; 64]]).await.unwrap();
    let message = timeout(WAIT, invalid.recv()).await.unwrap().unwrap();
    assert_eq!(message.frames, vec![vec![0x99; 64]]);
    assert!(messages.try_recv().is_err(), "nothing was delivered");
}
