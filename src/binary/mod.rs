pub mod attrs;
pub mod error;
pub mod jid;
pub mod node;
pub mod token;

mod decoder;
mod encoder;

use error::{BinaryError, Result};
use node::Node;
use std::borrow::Cow;
use std::io::Read;

/// Serializes a node to wire bytes, with the leading flag byte.
pub fn marshal(node: &Node) -> Result<Vec<u8>> {
    let mut enc = encoder::Encoder::new();
    enc.write_node(node)?;
    Ok(enc.into_inner())
}

/// Parses a node from wire bytes. The input must not include the flag byte;
/// use [`unpack`] first on a raw frame.
pub fn unmarshal(data: &[u8]) -> Result<Node> {
    let mut dec = decoder::Decoder::new(data);
    dec.read_node()
}

/// Strips the flag byte from a decrypted frame, inflating the payload when
/// the compressed bit is set.
pub fn unpack(data: &[u8]) -> Result<Cow<'_, [u8]>> {
    let (&flag, payload) = data
        .split_first()
        .ok_or(BinaryError::InvalidNode("empty frame"))?;
    if flag & 0x02 != 0 {
        let mut inflated = Vec::with_capacity(payload.len() * 2);
        flate2::read::ZlibDecoder::new(payload)
            .read_to_end(&mut inflated)
            .map_err(|e| BinaryError::Decompress(e.to_string()))?;
        Ok(Cow::Owned(inflated))
    } else {
        Ok(Cow::Borrowed(payload))
    }
}

/// Full round-trip decode of a decrypted frame: unpack, then unmarshal.
pub fn unmarshal_frame(frame: &[u8]) -> Result<Node> {
    let payload = unpack(frame)?;
    unmarshal(payload.as_ref())
}

#[cfg(test)]
mod tests {
    use super::node::{Node, NodeBuilder};
    use super::*;

    fn round_trip(node: &Node) -> Node {
        let bytes = marshal(node).expect("marshal");
        unmarshal_frame(&bytes).expect("unmarshal")
    }

    #[test]
    fn round_trip_simple_node() {
        let node = NodeBuilder::new("message")
            .attr("to", "1234567890@s.whatsapp.net")
            .attr("id", "3EB0AABBCCDD")
            .attr("type", "text")
            .build();
        assert_eq!(round_trip(&node), node);
    }

    #[test]
    fn round_trip_nested_children_and_bytes() {
        let node = NodeBuilder::new("iq")
            .attr("type", "set")
            .attr("xmlns", "encrypt")
            .attr("to", "s.whatsapp.net")
            .children([
                NodeBuilder::new("registration")
                    .bytes(vec![0, 0, 48, 57])
                    .build(),
                NodeBuilder::new("list")
                    .children([
                        NodeBuilder::new("key").bytes(vec![7u8; 32]).build(),
                        NodeBuilder::new("key").bytes(vec![9u8; 32]).build(),
                    ])
                    .build(),
            ])
            .build();
        assert_eq!(round_trip(&node), node);
    }

    #[test]
    fn round_trip_untokenized_strings() {
        let node = NodeBuilder::new("custom-tag-not-in-dictionary")
            .attr("weird-attr", "Some Free Text!")
            .string_content("inline string content")
            .build();
        assert_eq!(round_trip(&node), node);
    }

    #[test]
    fn round_trip_numeric_jid_with_plus_prefix() {
        let node = NodeBuilder::new("presence")
            .attr("from", "+40712345678@s.whatsapp.net")
            .build();
        assert_eq!(round_trip(&node), node);
    }

    #[test]
    fn round_trip_device_jid() {
        let node = NodeBuilder::new("receipt")
            .attr("to", "1234567890:23@s.whatsapp.net")
            .attr("participant", "998877:2@lid")
            .build();
        assert_eq!(round_trip(&node), node);
    }

    #[test]
    fn round_trip_large_child_list() {
        let children: Vec<Node> = (0..300)
            .map(|i| NodeBuilder::new("item").attr("index", i.to_string()).build())
            .collect();
        let node = NodeBuilder::new("list").children(children).build();
        assert_eq!(round_trip(&node), node);
    }

    #[test]
    fn unknown_token_is_a_single_error() {
        // 234 is inside the dictionary range but beyond the table.
        let bytes = [token::LIST_8, 1, 234u8];
        match unmarshal(&bytes) {
            Err(BinaryError::UnknownToken(234)) => {}
            other => panic!("expected unknown-token error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_input_is_eof() {
        let node = NodeBuilder::new("message").attr("id", "ABCDEF").build();
        let bytes = marshal(&node).unwrap();
        let truncated = &bytes[1..bytes.len() - 2];
        assert!(unmarshal(truncated).is_err());
    }

    #[test]
    fn empty_content_marker_means_no_content() {
        let node = NodeBuilder::new("ping").build();
        let decoded = round_trip(&node);
        assert!(decoded.content.is_none());
        assert!(decoded.attrs.is_empty());
    }
}
