use axum::extract::ws::{Message, WebSocket};
use tandem_common::protocol::ws::WsMessage;

pub fn decode_message(raw: &str) -> Result<WsMessage, serde_json::Error> {
    serde_json::from_str::<WsMessage>(raw)
}

pub fn encode_message(message: &WsMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), axum::Error> {
    let encoded = encode_message(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(encoded.into())).await
}

/// Metric label for an inbound frame.
pub fn frame_kind(message: &WsMessage) -> &'static str {
    match message {
        WsMessage::Join { .. } => "join",
        WsMessage::SyncFull { .. } => "sync_full",
        WsMessage::Reject { .. } => "reject",
        WsMessage::Update { .. } => "update",
        WsMessage::PresenceUpdate { .. } => "presence_update",
        WsMessage::PresenceLeft { .. } => "presence_left",
        WsMessage::Error { .. } => "error",
        WsMessage::Leave => "leave",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind_matches_wire_tag() {
        let samples = [
            WsMessage::Leave,
            WsMessage::Update { update_b64: "AA==".into(), origin: None },
            WsMessage::PresenceUpdate { connection_id: None, fields: serde_json::json!({}) },
        ];

        for sample in samples {
            let encoded: serde_json::Value =
                serde_json::from_str(&encode_message(&sample).unwrap()).unwrap();
            assert_eq!(encoded["type"], frame_kind(&sample));
        }
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        assert!(decode_message(r#"{"type":"subscribe","doc_id":"tab.x"}"#).is_err());
        assert!(decode_message("not json").is_err());
    }
}
