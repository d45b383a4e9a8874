//! Request id normalization for serializers without 64-bit integers.
//!
//! JSON consumers commonly decode numbers as doubles, which silently round
//! anything above 2^53. When the active serializer reports
//! `supports_big_int() == false`, ids are rewritten to their decimal string
//! form immediately before encoding. [`WireId::parse`] accepts both forms.
//!
//! [`WireId::parse`]: crate::message::WireId::parse

use crate::message::{FromClient, FromServer};

/// Messages whose request ids can be stringified in place.
pub trait StringifyIds {
    fn stringify_ids(&mut self);
}

impl StringifyIds for FromClient {
    fn stringify_ids(&mut self) {
        match self {
            FromClient::Request { id, .. } => id.stringify(),
            FromClient::Interrupt { request_id } | FromClient::Ack { request_id } => {
                request_id.stringify()
            }
            FromClient::Eof => {}
        }
    }
}

impl StringifyIds for FromServer {
    fn stringify_ids(&mut self) {
        match self {
            FromServer::Chunk { request_id, .. } | FromServer::Exit { request_id, .. } => {
                request_id.stringify()
            }
            FromServer::Defect { .. } => {}
        }
    }
}

/// Applies the transform unless the serializer carries 64-bit integers.
pub fn normalize<M: StringifyIds>(message: &mut M, supports_big_int: bool) {
    if !supports_big_int {
        message.stringify_ids();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RequestId, WireId};
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_request_id_is_stringified() {
        let mut msg = FromClient::request(RequestId::new(9007199254740993), "Echo", json!("x"));
        normalize(&mut msg, false);
        assert_eq!(
            msg.request_id(),
            Some(&WireId::Str("9007199254740993".to_string()))
        );
    }

    #[test]
    fn test_big_int_serializer_keeps_numbers() {
        let mut msg = FromServer::success(RequestId::new(42), json!(null));
        normalize(&mut msg, true);
        assert_eq!(msg.request_id(), Some(&WireId::Int(42)));
    }

    #[test]
    fn test_transform_is_idempotent() {
        let mut msg = FromServer::chunk(RequestId::new(3), vec![json!(1)]);
        msg.stringify_ids();
        msg.stringify_ids();
        assert_eq!(msg.request_id(), Some(&WireId::Str("3".to_string())));
    }

    #[test]
    fn test_eof_and_defect_untouched() {
        let mut eof = FromClient::Eof;
        normalize(&mut eof, false);
        assert_eq!(eof, FromClient::Eof);

        let mut defect = FromServer::defect("x");
        normalize(&mut defect, false);
        assert_eq!(defect, FromServer::defect("x"));
    }

    #[test]
    fn test_precision_survives_json_text() {
        // A double-based decoder would round this to ...992.
        let mut msg = FromServer::success(RequestId::new(9007199254740993), json!("x"));
        normalize(&mut msg, false);
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains(r#""requestId":"9007199254740993""#));

        let parsed: FromServer = serde_json::from_str(&text).unwrap();
        let id = parsed.request_id().unwrap().parse().unwrap();
        assert_eq!(id, RequestId::new(9007199254740993));
    }

    proptest! {
        #[test]
        fn prop_stringified_ids_parse_back(raw in any::<u64>()) {
            let mut msg = FromClient::interrupt(RequestId::new(raw));
            msg.stringify_ids();

            let text = serde_json::to_string(&msg).unwrap();
            let parsed: FromClient = serde_json::from_str(&text).unwrap();
            let id = parsed.request_id().unwrap();
            prop_assert!(id.is_string());
            prop_assert_eq!(id.parse().unwrap(), RequestId::new(raw));
        }
    }
}
