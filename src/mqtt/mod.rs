//! MQTT 3.1.1 wire protocol: packet types, codec, and stream framing.

pub mod codec;
pub mod framer;
pub mod packet;

pub use codec::{
    decode_packet, decode_varint, encode_connack, encode_length, encode_pingresp,
    encode_puback, encode_publish, encode_suback, CodecError,
};
pub use framer::Framer;
pub use packet::{
    ConnackPacket, ConnectPacket, ConnectReturnCode, Packet, PublishPacket, QoS, SubackPacket,
    SubscribePacket, SubscriptionRequest, Will, SUBACK_FAILURE,
};
