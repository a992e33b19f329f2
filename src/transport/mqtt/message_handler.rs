//! Pure routing of rumqttc events
//!
//! Translates raw event-loop output into the small set of decisions the
//! session pump acts on.

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::Event;
use std::fmt::Debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to the appropriate session action
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match &connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                    code => EventRoute::ConnectionRejected(format!("{code:?}")),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    failures: Self::count_subscription_failures(&suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Count rejected filters in a SubAck.
    ///
    /// Granted codes render as `Success(..)` or `QoS..`; everything else is a
    /// broker refusal.
    pub fn count_subscription_failures<C: Debug>(return_codes: &[C]) -> usize {
        return_codes
            .iter()
            .map(|code| format!("{code:?}"))
            .filter(|code| !(code.starts_with("Success") || code.starts_with("QoS")))
            .count()
    }

    /// Payload as text for listeners; invalid UTF-8 is replaced, not rejected
    pub fn payload_text(payload: &[u8]) -> String {
        String::from_utf8_lossy(payload).into_owned()
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Broker accepted the session
    ConnectionAcknowledged,
    /// Broker answered the connect with a refusal code
    ConnectionRejected(String),
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// Broker closed the session
    Disconnected(String),
    /// Subscription acknowledgement with the number of refused filters
    SubscriptionAcknowledged { packet_id: u16, failures: usize },
    /// Infrastructure event (PingResp, PubAck, ...)
    InfrastructureEvent(String),
    /// Outgoing event (handled by rumqttc)
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, Disconnect, DisconnectReasonCode, Publish};
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_route_connack() {
        let accepted = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&accepted),
            EventRoute::ConnectionAcknowledged
        ));

        let refused = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
            properties: None,
        }));
        match MessageHandler::route_mqtt_event(&refused) {
            EventRoute::ConnectionRejected(code) => assert_eq!(code, "NotAuthorized"),
            other => panic!("Expected ConnectionRejected, got {other:?}"),
        }
    }

    #[test]
    fn test_route_disconnect() {
        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected(_)
        ));
    }

    #[test]
    fn test_route_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("yan/control/show_notification"),
            pkid: 1,
            payload: Bytes::from(r#"{"title":"hi"}"#),
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&publish) {
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                assert_eq!(topic, "yan/control/show_notification");
                assert_eq!(&payload[..], br#"{"title":"hi"}"#);
                assert!(retain);
            }
            other => panic!("Expected MessageReceived, got {other:?}"),
        }
    }

    #[test]
    fn test_count_subscription_failures() {
        #[derive(Debug)]
        #[allow(dead_code)]
        enum Code {
            Success(u8),
            NotAuthorized,
            TopicFilterInvalid,
        }

        let codes = [Code::Success(1), Code::NotAuthorized, Code::TopicFilterInvalid];
        assert_eq!(MessageHandler::count_subscription_failures(&codes), 2);
        assert_eq!(MessageHandler::count_subscription_failures::<Code>(&[]), 0);
    }

    #[test]
    fn test_payload_text_is_lossy() {
        assert_eq!(MessageHandler::payload_text(b"online"), "online");
        assert_eq!(MessageHandler::payload_text(&[0x66, 0xff]), "f\u{fffd}");
    }
}
