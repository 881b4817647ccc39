// src/transport/protocol.rs
//
// Text framing for the backend channel. Every frame starts with an
// engine-level type tag; application frames carry a sub-tag, a namespace and
// a JSON array of [event, payload].
//
//   0  open (server -> client, session info)
//   1  close
//   2  ping            -> reply with 3
//   3  pong
//   4  message:
//      40<ns>,          open namespace
//      41<ns>           close namespace
//      42<ns>,[ev,data] event (optional ack id digits before the array)
//      43<ns>,...       ack

use serde_json::Value;

pub const NAMESPACE: &str = "/analytics-edge";

pub const PONG_FRAME: &str = "3";

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Session-info payload, raw JSON text
    Open(String),
    Close,
    Ping,
    Pong,
    Message(MessageFrame),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageFrame {
    NamespaceOpen { namespace: String },
    NamespaceClose { namespace: String },
    Event {
        namespace: String,
        event: String,
        payload: Value,
    },
    Ack { namespace: String },
}

/// Encode an application event frame: `42<ns>,["event",payload]`
pub fn encode_event(namespace: &str, event: &str, payload: &Value) -> String {
    let array = Value::Array(vec![Value::String(event.to_string()), payload.clone()]);
    format!("42{},{}", namespace, array)
}

/// The namespace-open frame emitted right after transport open
pub fn namespace_open(namespace: &str) -> String {
    format!("40{},", namespace)
}

/// Parse one inbound frame. None means malformed: callers log and drop, the
/// connection stays up.
pub fn parse(frame: &str) -> Option<Packet> {
    let mut chars = frame.chars();
    let tag = chars.next()?;
    let rest = &frame[tag.len_utf8()..];

    match tag {
        '0' => Some(Packet::Open(rest.to_string())),
        '1' => Some(Packet::Close),
        '2' => Some(Packet::Ping),
        '3' => Some(Packet::Pong),
        '4' => parse_message(rest).map(Packet::Message),
        _ => None,
    }
}

fn parse_message(body: &str) -> Option<MessageFrame> {
    let sub = body.chars().next()?;
    let rest = &body[sub.len_utf8()..];
    let (namespace, remainder) = split_namespace(rest);

    match sub {
        '0' => Some(MessageFrame::NamespaceOpen { namespace }),
        '1' => Some(MessageFrame::NamespaceClose { namespace }),
        '2' => {
            // Skip an optional numeric ack id between namespace and array
            let json = remainder.trim_start_matches(|c: char| c.is_ascii_digit());
            let value: Value = serde_json::from_str(json).ok()?;
            let array = value.as_array()?;
            let event = array.first()?.as_str()?.to_string();
            let payload = array.get(1).cloned().unwrap_or(Value::Null);
            Some(MessageFrame::Event {
                namespace,
                event,
                payload,
            })
        }
        '3' => Some(MessageFrame::Ack { namespace }),
        _ => None,
    }
}

/// Split `/ns,rest` or `/ns` off the front; absent namespace means the
/// default `/`.
fn split_namespace(body: &str) -> (String, &str) {
    if !body.starts_with('/') {
        return ("/".to_string(), body);
    }
    match body.find(',') {
        Some(comma) => (body[..comma].to_string(), &body[comma + 1..]),
        None => (body.to_string(), ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_event_frame() {
        let frame = encode_event(NAMESPACE, "edge:heartbeat", &json!({"deviceId": "dev-1"}));
        assert_eq!(
            frame,
            r#"42/analytics-edge,["edge:heartbeat",{"deviceId":"dev-1"}]"#
        );
    }

    #[test]
    fn test_namespace_open_frame() {
        assert_eq!(namespace_open(NAMESPACE), "40/analytics-edge,");
    }

    #[test]
    fn test_parse_engine_tags() {
        assert_eq!(
            parse("0{\"sid\":\"abc\"}"),
            Some(Packet::Open("{\"sid\":\"abc\"}".to_string()))
        );
        assert_eq!(parse("1"), Some(Packet::Close));
        assert_eq!(parse("2"), Some(Packet::Ping));
        assert_eq!(parse("3"), Some(Packet::Pong));
        assert_eq!(parse(""), None);
        assert_eq!(parse("9"), None);
    }

    #[test]
    fn test_parse_event_with_namespace() {
        let frame = r#"42/analytics-edge,["edge:config",{"data":{"fps":10}}]"#;
        let parsed = parse(frame).unwrap();
        match parsed {
            Packet::Message(MessageFrame::Event {
                namespace,
                event,
                payload,
            }) => {
                assert_eq!(namespace, NAMESPACE);
                assert_eq!(event, "edge:config");
                assert_eq!(payload["data"]["fps"], 10);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_parse_event_default_namespace_and_ack_id() {
        let frame = r#"4217["edge:command",{"data":{"command":"STOP"}}]"#;
        match parse(frame).unwrap() {
            Packet::Message(MessageFrame::Event {
                namespace, event, ..
            }) => {
                assert_eq!(namespace, "/");
                assert_eq!(event, "edge:command");
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_parse_namespace_open_ack() {
        match parse("40/analytics-edge,{\"sid\":\"xyz\"}").unwrap() {
            Packet::Message(MessageFrame::NamespaceOpen { namespace }) => {
                assert_eq!(namespace, NAMESPACE);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_event_is_dropped() {
        assert_eq!(parse("42/analytics-edge,not json"), None);
        assert_eq!(parse("42/analytics-edge,{\"no\":\"array\"}"), None);
        assert_eq!(parse("42/analytics-edge,[42]"), None);
        assert_eq!(parse("4"), None);
    }

    #[test]
    fn test_round_trip_event() {
        let payload = json!({"cameraId": "cam-7", "detections": []});
        let frame = encode_event(NAMESPACE, "edge:occupancy", &payload);
        match parse(&frame).unwrap() {
            Packet::Message(MessageFrame::Event { event, payload: p, .. }) => {
                assert_eq!(event, "edge:occupancy");
                assert_eq!(p, payload);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }
}
