use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::transport::{Channel, DeliveryMode, PeerId, PeerTransport, TransportError};

/// Handshake traffic goes through this channel, disjoint from the user data channels.
pub const CONTROL_CHANNEL: Channel = 100;

/// control messages are always sent reliably
pub const CONTROL_DELIVERY_MODE: DeliveryMode = DeliveryMode::Reliable;

/// The session layer's own protocol: a single byte per packet on [CONTROL_CHANNEL].
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ControlMessage {
    /// client -> server: request to establish a logical connection
    Connect = 0,
    /// server -> client: the connection is established
    AcceptConnect = 1,
    /// either direction: the connection is (or will not be) established. A server sends this
    ///  in response to CONNECT if it is at capacity.
    Disconnect = 2,
}

impl ControlMessage {
    pub fn ser(&self) -> [u8; 1] {
        [(*self).into()]
    }

    /// Control packets with a length other than one byte are not ours - they may be corrupt, or
    ///  they may come from some unrelated software sharing the transport.
    pub fn try_deser(buf: &[u8]) -> anyhow::Result<ControlMessage> {
        match buf {
            [b] => Ok(ControlMessage::try_from(*b)?),
            _ => bail!("control message must have exactly one byte, packet has {}", buf.len()),
        }
    }

    pub async fn send_to(&self, transport: &dyn PeerTransport, peer: PeerId) -> Result<(), TransportError> {
        transport.send_packet(peer, &self.ser(), CONTROL_CHANNEL, CONTROL_DELIVERY_MODE).await
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::transport::in_memory::InMemoryNetwork;

    use super::*;

    #[rstest]
    #[case::connect(b"\0", Some(ControlMessage::Connect))]
    #[case::accept(b"\x01", Some(ControlMessage::AcceptConnect))]
    #[case::disconnect(b"\x02", Some(ControlMessage::Disconnect))]
    #[case::unknown_value(b"\x03", None)]
    #[case::high_value(b"\xff", None)]
    #[case::empty(b"", None)]
    #[case::too_long(b"\x01\x01", None)]
    fn test_try_deser(#[case] buf: &[u8], #[case] expected: Option<ControlMessage>) {
        match ControlMessage::try_deser(buf) {
            Ok(actual) => assert_eq!(Some(actual), expected),
            Err(e) => {
                println!("{}", e);
                assert!(expected.is_none());
            }
        }
    }

    #[rstest]
    #[case(ControlMessage::Connect, [0])]
    #[case(ControlMessage::AcceptConnect, [1])]
    #[case(ControlMessage::Disconnect, [2])]
    fn test_ser(#[case] msg: ControlMessage, #[case] expected: [u8; 1]) {
        assert_eq!(msg.ser(), expected);
    }

    #[tokio::test]
    async fn test_send_to_uses_reliable_control_channel() {
        let network = InMemoryNetwork::new();
        let a = network.endpoint(PeerId(1)).await;
        let _b = network.endpoint(PeerId(2)).await;

        ControlMessage::AcceptConnect.send_to(&a, PeerId(2)).await.unwrap();

        let sent = network.sent_packets(PeerId(1)).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, PeerId(2));
        assert_eq!(sent[0].channel, CONTROL_CHANNEL);
        assert_eq!(sent[0].mode, DeliveryMode::Reliable);
        assert_eq!(sent[0].data.as_ref(), &[1u8]);
        assert_eq!(network.num_pending_packets(PeerId(2), CONTROL_CHANNEL).await, 1);
    }
}
