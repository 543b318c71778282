//! Tunnel data payload decoding

use omm_tunnel_proto::{ContainerType, StreamId, SubMsg, TunnelCodec, TunnelMessage, TunnelPayload};

use crate::error::SessionResult;

/// Decode the body of an inbound tunnel data message
///
/// `Msg` containers carry an encoded sub-message; every other container
/// type is handed to the application untouched.
pub fn decode_payload(container_type: ContainerType, data: Vec<u8>) -> SessionResult<TunnelPayload> {
    match container_type {
        ContainerType::Msg => Ok(TunnelCodec::decode_sub_msg(&data)?.into()),
        _ => Ok(TunnelPayload::Opaque {
            container_type,
            data,
        }),
    }
}

/// Wrap a sub-message in a tunnel data message
pub fn encode_sub_msg(stream_id: StreamId, msg: &SubMsg) -> SessionResult<TunnelMessage> {
    Ok(TunnelMessage::Data {
        stream_id,
        container_type: ContainerType::Msg,
        data: TunnelCodec::encode_sub_msg(msg)?,
    })
}
