//! Call signaling integration tests.
//!
//! Drives complete call flows between two real WebSocket clients: ringing,
//! answer, offer/answer/ICE relay, media toggles, hang-up and disconnects.

// Test code is allowed to use expect/unwrap for assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use gateway_test_utils::{
    TestGatewayServer, TestIdentity, WsTestClient, SAMPLE_CANDIDATE, SAMPLE_OFFER,
};
use serde_json::{json, Value};
use std::time::Duration;

const QUIET: Duration = Duration::from_millis(200);

async fn pair(server: &TestGatewayServer) -> Result<(WsTestClient, WsTestClient)> {
    let caller = WsTestClient::connect(server, &TestIdentity::provider("u1")).await?;
    let callee = WsTestClient::connect(server, &TestIdentity::patient("u2")).await?;
    Ok((caller, callee))
}

async fn initiate(caller: &mut WsTestClient, target: &str, call_type: &str) -> Result<String> {
    let ack = caller
        .request(
            "call:initiate",
            json!({ "targetUserId": target, "callType": call_type, "callerName": "Dr. Ada" }),
        )
        .await?;
    assert_eq!(ack["success"], true, "initiate failed: {ack}");
    Ok(ack["callId"].as_str().unwrap().to_string())
}

async fn connected_call(
    caller: &mut WsTestClient,
    callee: &mut WsTestClient,
) -> Result<String> {
    let call_id = initiate(caller, "u2", "video").await?;
    callee.expect_event("call:incoming").await?;
    let ack = callee
        .request("call:accept", json!({ "callId": call_id, "callerId": "u1" }))
        .await?;
    assert_eq!(ack["success"], true, "accept failed: {ack}");
    caller.expect_event("call:accepted").await?;
    Ok(call_id)
}

#[tokio::test]
async fn test_complete_call_flow() -> Result<()> {
    let server = TestGatewayServer::spawn().await?;
    let (mut caller, mut callee) = pair(&server).await?;

    let call_id = initiate(&mut caller, "u2", "video").await?;

    let incoming = callee.expect_event("call:incoming").await?;
    assert_eq!(incoming.data["callId"], call_id.as_str());
    assert_eq!(incoming.data["callerId"], "u1");
    assert_eq!(incoming.data["callerName"], "Dr. Ada");
    assert_eq!(incoming.data["callType"], "video");

    let ack = callee
        .request("call:accept", json!({ "callId": call_id, "callerId": "u1" }))
        .await?;
    assert_eq!(ack["success"], true);
    assert_eq!(ack["callId"], call_id.as_str());

    let accepted = caller.expect_event("call:accepted").await?;
    assert_eq!(accepted.data["acceptedBy"], "u2");

    let ack = caller
        .request(
            "call:end",
            json!({ "callId": call_id }),
        )
        .await?;
    assert_eq!(ack["success"], true);

    let ended = callee.expect_event("call:ended").await?;
    assert_eq!(ended.data["endedBy"], "u1");
    caller.expect_event("call:ended").await?;
    assert_eq!(server.gateway().stats().await.calls, 0);

    let ack = callee
        .request("call:accept", json!({ "callId": call_id, "callerId": "u1" }))
        .await?;
    assert_eq!(ack["error"], "InvalidStateTransition");

    Ok(())
}

#[tokio::test]
async fn test_relay_is_byte_identical() -> Result<()> {
    let server = TestGatewayServer::spawn().await?;
    let (mut caller, mut callee) = pair(&server).await?;
    let call_id = connected_call(&mut caller, &mut callee).await?;

    let data = format!(r#"{{"callId":"{call_id}","targetUserId":"u2","offer":{SAMPLE_OFFER}}}"#);
    let ack = caller.request_raw("webrtc:offer", &data).await?;
    assert_eq!(ack["success"], true);

    let offer = callee.expect_event("webrtc:offer").await?;
    assert_eq!(offer.data["fromUserId"], "u1");
    assert!(
        offer.raw.contains(SAMPLE_OFFER),
        "offer altered in transit: {}",
        offer.raw
    );

    let answer = r#"{"type":"answer","sdp":"v=0\r\n"}"#;
    let data = format!(r#"{{"callId":"{call_id}","targetUserId":"u1","answer":{answer}}}"#);
    let ack = callee.request_raw("webrtc:answer", &data).await?;
    assert_eq!(ack["success"], true);
    let relayed = caller.expect_event("webrtc:answer").await?;
    assert!(relayed.raw.contains(answer));

    let data =
        format!(r#"{{"callId":"{call_id}","targetUserId":"u2","candidate":{SAMPLE_CANDIDATE}}}"#);
    let ack = caller.request_raw("webrtc:ice-candidate", &data).await?;
    assert_eq!(ack["success"], true);
    let candidate = callee.expect_event("webrtc:ice-candidate").await?;
    assert!(candidate.raw.contains(SAMPLE_CANDIDATE));

    Ok(())
}

#[tokio::test]
async fn test_relay_to_outsider_is_refused() -> Result<()> {
    let server = TestGatewayServer::spawn().await?;
    let (mut caller, mut callee) = pair(&server).await?;
    let mut outsider = WsTestClient::connect(&server, &TestIdentity::patient("u3")).await?;
    let call_id = connected_call(&mut caller, &mut callee).await?;

    let ack = caller
        .request(
            "webrtc:offer",
            json!({ "callId": call_id, "targetUserId": "u3", "offer": { "type": "offer", "sdp": "" } }),
        )
        .await?;
    assert_eq!(ack["error"], "NotAParticipant");
    outsider.expect_no_event("webrtc:offer", QUIET).await?;

    let ack = outsider
        .request(
            "webrtc:offer",
            json!({ "callId": call_id, "targetUserId": "u2", "offer": { "type": "offer", "sdp": "" } }),
        )
        .await?;
    assert_eq!(ack["error"], "NotAParticipant");
    callee.expect_no_event("webrtc:offer", QUIET).await?;

    Ok(())
}

#[tokio::test]
async fn test_toggle_media_excludes_sender() -> Result<()> {
    let server = TestGatewayServer::spawn().await?;
    let (mut caller, mut callee) = pair(&server).await?;
    let call_id = connected_call(&mut caller, &mut callee).await?;

    let ack = callee
        .request(
            "call:toggle-media",
            json!({ "callId": call_id, "mediaType": "video", "enabled": false }),
        )
        .await?;
    assert_eq!(ack["success"], true);

    let toggled = caller.expect_event("call:media-toggled").await?;
    assert_eq!(toggled.data["userId"], "u2");
    assert_eq!(toggled.data["mediaType"], "video");
    assert_eq!(toggled.data["enabled"], false);
    callee.expect_no_event("call:media-toggled", QUIET).await?;

    Ok(())
}

#[tokio::test]
async fn test_reject_uses_default_reason() -> Result<()> {
    let server = TestGatewayServer::spawn().await?;
    let (mut caller, mut callee) = pair(&server).await?;
    let call_id = initiate(&mut caller, "u2", "audio").await?;
    callee.expect_event("call:incoming").await?;

    let ack = callee
        .request("call:reject", json!({ "callId": call_id, "callerId": "u1" }))
        .await?;
    assert_eq!(ack["success"], true);

    let rejected = caller.expect_event("call:rejected").await?;
    assert_eq!(rejected.data["rejectedBy"], "u2");
    assert_eq!(rejected.data["reason"], "User declined the call");

    // The caller is free again.
    initiate(&mut caller, "u2", "audio").await?;
    Ok(())
}

#[tokio::test]
async fn test_callee_disconnect_while_ringing_ends_call() -> Result<()> {
    let server = TestGatewayServer::spawn().await?;
    let (mut caller, mut callee) = pair(&server).await?;
    initiate(&mut caller, "u2", "video").await?;
    callee.expect_event("call:incoming").await?;

    callee.close().await?;

    let ended = caller.expect_event("call:ended").await?;
    assert_eq!(ended.data["endedBy"], "u2");
    assert!(!caller.buffered_events().contains(&"call:accepted".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_caller_disconnect_while_ringing_ends_call() -> Result<()> {
    let server = TestGatewayServer::spawn().await?;
    let (mut caller, mut callee) = pair(&server).await?;
    let call_id = initiate(&mut caller, "u2", "video").await?;
    callee.expect_event("call:incoming").await?;

    caller.close().await?;

    let ended = callee.expect_event("call:ended").await?;
    assert_eq!(ended.data["callId"], call_id.as_str());
    assert_eq!(ended.data["endedBy"], "u1");

    let ack = callee
        .request("call:accept", json!({ "callId": call_id, "callerId": "u1" }))
        .await?;
    assert_eq!(ack["error"], "InvalidStateTransition");
    Ok(())
}

#[tokio::test]
async fn test_participant_disconnect_ends_connected_call() -> Result<()> {
    let server = TestGatewayServer::spawn().await?;
    let (mut caller, mut callee) = pair(&server).await?;
    connected_call(&mut caller, &mut callee).await?;

    caller.close().await?;

    let ended = callee.expect_event("call:ended").await?;
    assert_eq!(ended.data["endedBy"], "u1");
    Ok(())
}

#[tokio::test]
async fn test_busy_caller_cannot_initiate() -> Result<()> {
    let server = TestGatewayServer::spawn().await?;
    let (mut caller, _callee) = pair(&server).await?;
    let _other = WsTestClient::connect(&server, &TestIdentity::patient("u3")).await?;

    initiate(&mut caller, "u2", "video").await?;
    let ack = caller
        .request(
            "call:initiate",
            json!({ "targetUserId": "u3", "callType": "video" }),
        )
        .await?;

    assert_eq!(ack["error"], "AlreadyInCall");
    Ok(())
}

#[tokio::test]
async fn test_concurrent_incoming_calls_ring_independently() -> Result<()> {
    let server = TestGatewayServer::spawn().await?;
    let mut first = WsTestClient::connect(&server, &TestIdentity::provider("u1")).await?;
    let mut second = WsTestClient::connect(&server, &TestIdentity::provider("u3")).await?;
    let mut callee = WsTestClient::connect(&server, &TestIdentity::patient("u2")).await?;

    let first_call = initiate(&mut first, "u2", "video").await?;
    let second_call = initiate(&mut second, "u2", "audio").await?;
    callee.expect_event("call:incoming").await?;
    callee.expect_event("call:incoming").await?;

    let ack = callee
        .request("call:accept", json!({ "callId": first_call }))
        .await?;
    assert_eq!(ack["success"], true);
    second.expect_no_event("call:rejected", QUIET).await?;

    let ack = callee
        .request("call:accept", json!({ "callId": second_call }))
        .await?;
    assert_eq!(ack["error"], "AlreadyInCall");

    Ok(())
}

#[tokio::test]
async fn test_unknown_call_id() -> Result<()> {
    let server = TestGatewayServer::spawn().await?;
    let (mut caller, _callee) = pair(&server).await?;

    let ack: Value = caller
        .request(
            "call:end",
            json!({ "callId": "7f0c3a52-5d1e-4e8e-9a55-2f6f0f1c9b11" }),
        )
        .await?;
    assert_eq!(ack["error"], "CallNotFound");

    let ack = caller
        .request("call:end", json!({ "callId": "not-a-uuid" }))
        .await?;
    assert_eq!(ack["error"], "InvalidMessage");
    Ok(())
}
