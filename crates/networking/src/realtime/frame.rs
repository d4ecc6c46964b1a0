//! Phoenix channel frames as spoken by the hosted realtime broker

use super::{ChannelEvent, RowChange};
use claimsync_core::{ChannelStatus, ClaimRow, FlashOffer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

/// One websocket text frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
}

impl Frame {
    /// Join a topic with a `postgres_changes` subscription
    pub fn join(topic: &str, table: &str, filter: &str, access_token: &str, msg_ref: u64) -> Self {
        Frame {
            topic: topic.to_string(),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [{
                        "event": "*",
                        "schema": "public",
                        "table": table,
                        "filter": filter,
                    }],
                },
                "access_token": access_token,
            }),
            msg_ref: Some(msg_ref.to_string()),
        }
    }

    pub fn leave(topic: &str, msg_ref: u64) -> Self {
        Frame {
            topic: topic.to_string(),
            event: "phx_leave".to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref.to_string()),
        }
    }

    pub fn heartbeat(msg_ref: u64) -> Self {
        Frame {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref.to_string()),
        }
    }
}

/// What the socket loop should do with an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    /// Forward to the channel consumer
    Event(ChannelEvent),
    /// Forward, then stop the socket
    Terminal(ChannelStatus),
    Ignore,
}

/// Interpret an inbound frame for the channel joined as `topic` with `join_ref`
pub(crate) fn decode(text: &str, topic: &str, join_ref: &str, offer_rows: bool) -> Inbound {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Dropping undecodable realtime frame: {}", e);
            return Inbound::Ignore;
        }
    };

    if frame.topic != topic {
        return Inbound::Ignore;
    }

    match frame.event.as_str() {
        "phx_reply" if frame.msg_ref.as_deref() == Some(join_ref) => {
            match frame.payload.get("status").and_then(Value::as_str) {
                Some("ok") => Inbound::Event(ChannelEvent::Status(ChannelStatus::Subscribed)),
                _ => Inbound::Terminal(ChannelStatus::ChannelError),
            }
        }
        "phx_error" => Inbound::Terminal(ChannelStatus::ChannelError),
        "phx_close" => Inbound::Terminal(ChannelStatus::Closed),
        "system" => match frame.payload.get("status").and_then(Value::as_str) {
            Some("error") => Inbound::Terminal(ChannelStatus::ChannelError),
            _ => Inbound::Ignore,
        },
        "postgres_changes" => decode_change(&frame.payload, offer_rows),
        _ => Inbound::Ignore,
    }
}

fn decode_change(payload: &Value, offer_rows: bool) -> Inbound {
    let data = match payload.get("data") {
        Some(data) => data,
        None => return Inbound::Ignore,
    };

    // Deletes carry no new row
    match data.get("type").and_then(Value::as_str) {
        Some("UPDATE") | Some("INSERT") => {}
        _ => return Inbound::Ignore,
    }

    let record = match data.get("record") {
        Some(record) => record.clone(),
        None => return Inbound::Ignore,
    };

    let change = if offer_rows {
        serde_json::from_value::<FlashOffer>(record).map(RowChange::Offer)
    } else {
        serde_json::from_value::<ClaimRow>(record).map(RowChange::Claim)
    };

    match change {
        Ok(change) => Inbound::Event(ChannelEvent::Change(change)),
        Err(e) => {
            warn!("Dropping malformed change record: {}", e);
            Inbound::Ignore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claimsync_core::ClaimStatus;

    const TOPIC: &str = "realtime:claim:c1";

    #[test]
    fn test_join_frame_shape() {
        let frame = Frame::join(TOPIC, "flash_offer_claims", "id=eq.c1", "jwt", 1);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "phx_join");
        assert_eq!(json["ref"], "1");
        assert_eq!(json["payload"]["access_token"], "jwt");
        assert_eq!(
            json["payload"]["config"]["postgres_changes"][0]["filter"],
            "id=eq.c1"
        );
    }

    #[test]
    fn test_join_reply_maps_to_status() {
        let ok = r#"{"topic":"realtime:claim:c1","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1"}"#;
        assert_eq!(
            decode(ok, TOPIC, "1", false),
            Inbound::Event(ChannelEvent::Status(ChannelStatus::Subscribed))
        );

        let err = r#"{"topic":"realtime:claim:c1","event":"phx_reply","payload":{"status":"error","response":{"reason":"denied"}},"ref":"1"}"#;
        assert_eq!(
            decode(err, TOPIC, "1", false),
            Inbound::Terminal(ChannelStatus::ChannelError)
        );

        // Heartbeat replies are not join replies
        let hb = r#"{"topic":"realtime:claim:c1","event":"phx_reply","payload":{"status":"ok"},"ref":"7"}"#;
        assert_eq!(decode(hb, TOPIC, "1", false), Inbound::Ignore);
    }

    #[test]
    fn test_update_decodes_claim_row() {
        let text = r#"{"topic":"realtime:claim:c1","event":"postgres_changes","ref":null,"payload":{"data":{"type":"UPDATE","table":"flash_offer_claims","record":{"id":"c1","user_id":"u1","offer_id":"o1","status":"redeemed","created_at":"2026-01-01T10:00:00Z","updated_at":"2026-01-01T10:05:00Z"}}}}"#;
        match decode(text, TOPIC, "1", false) {
            Inbound::Event(ChannelEvent::Change(RowChange::Claim(row))) => {
                assert_eq!(row.status, ClaimStatus::Redeemed);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_record_with_malformed_id_is_dropped() {
        let text = r#"{"topic":"realtime:claim:c1","event":"postgres_changes","ref":null,"payload":{"data":{"type":"UPDATE","table":"flash_offer_claims","record":{"id":"c1,c2","user_id":"u1","offer_id":"o1","status":"redeemed","created_at":"2026-01-01T10:00:00Z","updated_at":"2026-01-01T10:05:00Z"}}}}"#;
        assert_eq!(decode(text, TOPIC, "1", false), Inbound::Ignore);
    }

    #[test]
    fn test_ignores_other_topics_and_deletes() {
        let other = r#"{"topic":"realtime:claim:c2","event":"phx_close","payload":{}}"#;
        assert_eq!(decode(other, TOPIC, "1", false), Inbound::Ignore);

        let delete = r#"{"topic":"realtime:claim:c1","event":"postgres_changes","payload":{"data":{"type":"DELETE","old_record":{"id":"c1"}}}}"#;
        assert_eq!(decode(delete, TOPIC, "1", false), Inbound::Ignore);

        assert_eq!(decode("not json", TOPIC, "1", false), Inbound::Ignore);
    }

    #[test]
    fn test_close_and_error_are_terminal() {
        let close = r#"{"topic":"realtime:claim:c1","event":"phx_close","payload":{}}"#;
        assert_eq!(decode(close, TOPIC, "1", false), Inbound::Terminal(ChannelStatus::Closed));

        let err = r#"{"topic":"realtime:claim:c1","event":"phx_error","payload":{}}"#;
        assert_eq!(
            decode(err, TOPIC, "1", false),
            Inbound::Terminal(ChannelStatus::ChannelError)
        );
    }
}
