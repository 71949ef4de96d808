mod common;

use common::{join_room, ot_op, TestServer};

#[tokio::test]
async fn single_client_insert_is_acked() {
    common::logging();
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.send(join_room("doc-1", "c-A", "u-1")).await;
    let ack = client.recv_json().await.unwrap();
    assert_eq!(ack["type"], "JOIN_ROOM_ACK");
    assert_eq!(ack["content"], "");
    assert_eq!(ack["version"], 0);

    client.send(ot_op("doc-1", "c-A", "op-1", 0, 0, "hello")).await;
    let ack = client.recv_json().await.unwrap();
    assert_eq!(ack["type"], "ACK");
    assert_eq!(ack["operationId"], "op-1");
    assert_eq!(ack["version"], 1);
}

#[tokio::test]
async fn second_client_sees_join_and_broadcast() {
    common::logging();
    let server = TestServer::start().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    a.send(join_room("doc-2", "c-A", "u-1")).await;
    let _ = a.recv_json().await.unwrap();

    b.send(join_room("doc-2", "c-B", "u-2")).await;
    let join_ack_b = b.recv_json().await.unwrap();
    assert_eq!(join_ack_b["type"], "JOIN_ROOM_ACK");

    let participant_joined = a.recv_json().await.unwrap();
    assert_eq!(participant_joined["type"], "PARTICIPANT_JOINED");
    assert_eq!(participant_joined["clientId"], "c-B");

    a.send(ot_op("doc-2", "c-A", "op-1", 0, 0, "hi")).await;
    let _ack = a.recv_json().await.unwrap();

    let broadcast = b.recv_json().await.unwrap();
    assert_eq!(broadcast["type"], "OT_OP_BROADCAST");
    assert_eq!(broadcast["operation"]["payload"], "hi");
    assert_eq!(broadcast["senderClientId"], "c-A");
}

#[tokio::test]
async fn concurrent_inserts_are_transformed_and_both_clients_converge() {
    common::logging();
    let server = TestServer::start().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    a.send(join_room("doc-3", "c-A", "u-1")).await;
    let _ = a.recv_json().await.unwrap();
    b.send(join_room("doc-3", "c-B", "u-2")).await;
    let _ = b.recv_json().await.unwrap();
    let _ = a.recv_json().await.unwrap(); // PARTICIPANT_JOINED for c-B

    // Both submit against version 0 concurrently.
    a.send(ot_op("doc-3", "c-A", "op-a", 0, 0, "X")).await;
    b.send(ot_op("doc-3", "c-B", "op-b", 0, 0, "Y")).await;

    let ack_a = a.recv_json().await.unwrap();
    assert_eq!(ack_a["type"], "ACK");
    let broadcast_to_b = b.recv_json().await.unwrap();
    assert_eq!(broadcast_to_b["type"], "OT_OP_BROADCAST");

    let ack_b = b.recv_json().await.unwrap();
    assert_eq!(ack_b["type"], "ACK");
    let broadcast_to_a = a.recv_json().await.unwrap();
    assert_eq!(broadcast_to_a["type"], "OT_OP_BROADCAST");

    // c-A's clientId is lexicographically lower, so it keeps position 0 and
    // c-B's insert is shifted to 1 — both converge on "XY".
    assert_eq!(broadcast_to_b["operation"]["position"], 0);
    assert_eq!(broadcast_to_a["operation"]["position"], 1);
}

#[tokio::test]
async fn malformed_frame_is_rejected_without_closing_the_socket() {
    common::logging();
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.send(serde_json::json!({"type": "NOT_A_REAL_TYPE"})).await;
    let err = client.recv_json().await.unwrap();
    assert_eq!(err["type"], "ERROR");
    assert_eq!(err["reason"], "validation_failed");

    // The socket is still open: a valid join now succeeds.
    client.send(join_room("doc-4", "c-A", "u-1")).await;
    let ack = client.recv_json().await.unwrap();
    assert_eq!(ack["type"], "JOIN_ROOM_ACK");
}

#[tokio::test]
async fn stale_version_outside_history_window_is_rejected() {
    common::logging();
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.send(join_room("doc-5", "c-A", "u-1")).await;
    let _ = client.recv_json().await.unwrap();

    client
        .send(ot_op("doc-5", "c-A", "op-ahead", 999, 0, "x"))
        .await;
    let err = client.recv_json().await.unwrap();
    assert_eq!(err["type"], "ERROR");
    assert_eq!(err["reason"], "op_rejected_version_ahead");
    assert_eq!(err["operationId"], "op-ahead");
}

#[tokio::test]
async fn reconnect_under_the_same_client_id_preempts_the_old_session() {
    common::logging();
    let server = TestServer::start().await;
    let mut a1 = server.connect().await;
    a1.send(join_room("doc-6", "c-A", "u-1")).await;
    let _ = a1.recv_json().await.unwrap();

    let mut a2 = server.connect().await;
    a2.send(join_room("doc-6", "c-A", "u-1")).await;

    let err = a1.recv_json().await.unwrap();
    assert_eq!(err["type"], "ERROR");
    assert_eq!(err["reason"], "preempted");

    let ack2 = a2.recv_json().await.unwrap();
    assert_eq!(ack2["type"], "JOIN_ROOM_ACK");
}

#[tokio::test]
async fn late_joiner_sees_prior_history_in_join_ack() {
    common::logging();
    let server = TestServer::start().await;
    let mut a = server.connect().await;

    a.send(join_room("doc-8", "c-A", "u-1")).await;
    let _ = a.recv_json().await.unwrap();

    a.send(ot_op("doc-8", "c-A", "o1", 0, 0, "a")).await;
    let _ = a.recv_json().await.unwrap();
    a.send(ot_op("doc-8", "c-A", "o2", 1, 1, "b")).await;
    let _ = a.recv_json().await.unwrap();
    a.send(ot_op("doc-8", "c-A", "o3", 2, 2, "c")).await;
    let _ = a.recv_json().await.unwrap();

    let mut b = server.connect().await;
    b.send(join_room("doc-8", "c-B", "u-2")).await;
    let ack = b.recv_json().await.unwrap();
    assert_eq!(ack["type"], "JOIN_ROOM_ACK");
    assert_eq!(ack["content"], "abc");
    assert_eq!(ack["version"], 3);
    let participants = ack["participants"].as_array().unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0]["clientId"], "c-A");
}

#[tokio::test]
async fn sync_state_returns_only_ops_since_the_requested_version() {
    common::logging();
    let server = TestServer::start().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    a.send(join_room("doc-9", "c-A", "u-1")).await;
    let _ = a.recv_json().await.unwrap();
    for (i, payload) in ["a", "b", "c"].into_iter().enumerate() {
        a.send(ot_op("doc-9", "c-A", &format!("o{i}"), i as u64, i as u64, payload))
            .await;
        let _ = a.recv_json().await.unwrap();
    }

    b.send(join_room("doc-9", "c-B", "u-2")).await;
    let join_ack = b.recv_json().await.unwrap();
    assert_eq!(join_ack["version"], 3);
    let _participant_joined = a.recv_json().await.unwrap();

    for (i, payload) in ["d", "e"].into_iter().enumerate() {
        a.send(ot_op(
            "doc-9",
            "c-A",
            &format!("o{}", i + 3),
            (i + 3) as u64,
            (i + 3) as u64,
            payload,
        ))
        .await;
        let _ = a.recv_json().await.unwrap();
        let _ = b.recv_json().await.unwrap(); // OT_OP_BROADCAST for each
    }

    b.send(serde_json::json!({
        "type": "SYNC_STATE",
        "roomId": "doc-9",
        "clientId": "c-B",
        "fromVersion": 3,
    }))
    .await;

    let first = b.recv_json().await.unwrap();
    assert_eq!(first["type"], "OT_OP_BROADCAST");
    assert_eq!(first["version"], 4);
    assert_eq!(first["operation"]["payload"], "d");

    let second = b.recv_json().await.unwrap();
    assert_eq!(second["type"], "OT_OP_BROADCAST");
    assert_eq!(second["version"], 5);
    assert_eq!(second["operation"]["payload"], "e");
}

#[tokio::test]
async fn stats_endpoint_reports_active_rooms() {
    common::logging();
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    client.send(join_room("doc-7", "c-A", "u-1")).await;
    let _ = client.recv_json().await.unwrap();

    assert_eq!(server.state.active_rooms(), 1);
}
