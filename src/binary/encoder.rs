use crate::binary::error::{BinaryError, Result};
use crate::binary::jid::HIDDEN_USER_SERVER;
use crate::binary::node::{Attrs, Node, NodeContent};
use crate::binary::token;

struct ParsedJid<'a> {
    user: &'a str,
    server: &'a str,
    domain_type: u8,
    device: Option<u16>,
}

fn parse_jid(input: &str) -> Option<ParsedJid<'_>> {
    let sep = input.find('@')?;
    let server = &input[sep + 1..];
    let user_combined = &input[..sep];
    if server.is_empty() {
        return None;
    }

    let (user_agent, device) = match user_combined.split_once(':') {
        Some((ua, d)) => (ua, d.parse::<u16>().ok()),
        None => (user_combined, None),
    };
    let (user, agent) = match user_agent.split_once('_') {
        Some((u, a)) => (u, a.parse::<u8>().ok()?),
        None => (user_agent, 0),
    };

    let domain_type = if server == HIDDEN_USER_SERVER { 1 } else { agent };

    Some(ParsedJid {
        user,
        server,
        domain_type,
        device,
    })
}

pub(crate) struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    pub(crate) fn new() -> Self {
        // Leading flag byte: zero means uncompressed payload follows.
        Self { out: vec![0] }
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.out
    }

    fn write_u8(&mut self, val: u8) {
        self.out.push(val);
    }

    fn write_u16_be(&mut self, val: u16) {
        self.out.extend_from_slice(&val.to_be_bytes());
    }

    fn write_u20_be(&mut self, val: u32) {
        self.out.push(((val >> 16) & 0x0F) as u8);
        self.out.push(((val >> 8) & 0xFF) as u8);
        self.out.push((val & 0xFF) as u8);
    }

    fn write_u32_be(&mut self, val: u32) {
        self.out.extend_from_slice(&val.to_be_bytes());
    }

    fn write_bytes_with_len(&mut self, bytes: &[u8]) {
        let len = bytes.len();
        if len < 256 {
            self.write_u8(token::BINARY_8);
            self.write_u8(len as u8);
        } else if len < (1 << 20) {
            self.write_u8(token::BINARY_20);
            self.write_u20_be(len as u32);
        } else {
            self.write_u8(token::BINARY_32);
            self.write_u32_be(len as u32);
        }
        self.out.extend_from_slice(bytes);
    }

    fn write_string(&mut self, s: &str) -> Result<()> {
        if let Some(tok) = token::index_of_single_token(s) {
            self.write_u8(tok);
        } else if let Some((dict, tok)) = token::index_of_double_byte_token(s) {
            self.write_u8(token::DICTIONARY_0 + dict);
            self.write_u8(tok);
        } else if validate_nibble(s) {
            self.write_packed(s, token::NIBBLE_8)?;
        } else if validate_hex(s) {
            self.write_packed(s, token::HEX_8)?;
        } else if let Some(jid) = parse_jid(s) {
            self.write_jid(&jid)?;
        } else {
            self.write_bytes_with_len(s.as_bytes());
        }
        Ok(())
    }

    fn write_jid(&mut self, jid: &ParsedJid<'_>) -> Result<()> {
        if let Some(device) = jid.device.filter(|d| *d > 0) {
            self.write_u8(token::AD_JID);
            self.write_u8(jid.domain_type);
            self.write_u8(device as u8);
            self.write_string(jid.user)?;
        } else {
            self.write_u8(token::JID_PAIR);
            if jid.user.is_empty() {
                self.write_u8(token::LIST_EMPTY);
            } else {
                self.write_string(jid.user)?;
            }
            self.write_string(jid.server)?;
        }
        Ok(())
    }

    fn write_packed(&mut self, value: &str, data_type: u8) -> Result<()> {
        if value.len() > token::PACKED_MAX as usize {
            return Err(BinaryError::PackedTooLong(value.len()));
        }
        self.write_u8(data_type);

        let mut rounded = value.len().div_ceil(2) as u8;
        if value.len() % 2 != 0 {
            rounded |= 0x80;
        }
        self.write_u8(rounded);

        let packer: fn(char) -> Result<u8> = if data_type == token::NIBBLE_8 {
            pack_nibble
        } else {
            pack_hex
        };

        let mut chars = value.chars();
        while let Some(first) = chars.next() {
            let second = chars.next().unwrap_or('\x00');
            self.write_u8((packer(first)? << 4) | packer(second)?);
        }
        Ok(())
    }

    fn write_list_start(&mut self, len: usize) {
        if len == 0 {
            self.write_u8(token::LIST_EMPTY);
        } else if len < 256 {
            self.write_u8(token::LIST_8);
            self.write_u8(len as u8);
        } else {
            self.write_u8(token::LIST_16);
            self.write_u16_be(len as u16);
        }
    }

    fn write_attributes(&mut self, attrs: &Attrs) -> Result<()> {
        for (key, value) in attrs {
            self.write_string(key)?;
            self.write_string(value)?;
        }
        Ok(())
    }

    fn write_content(&mut self, content: &NodeContent) -> Result<()> {
        match content {
            NodeContent::String(s) => self.write_string(s)?,
            NodeContent::Bytes(bytes) => self.write_bytes_with_len(bytes),
            NodeContent::Nodes(nodes) => {
                self.write_list_start(nodes.len());
                for node in nodes {
                    self.write_node(node)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn write_node(&mut self, node: &Node) -> Result<()> {
        let content_len = usize::from(node.content.is_some());
        let list_len = 1 + node.attrs.len() * 2 + content_len;

        self.write_list_start(list_len);
        self.write_string(&node.tag)?;
        self.write_attributes(&node.attrs)?;
        if let Some(content) = &node.content {
            self.write_content(content)?;
        }
        Ok(())
    }
}

fn validate_nibble(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= token::PACKED_MAX as usize
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || c == '-' || c == '.' || c == '+')
}

fn pack_nibble(value: char) -> Result<u8> {
    match value {
        '-' => Ok(10),
        '.' => Ok(11),
        '+' => Ok(12),
        '\x00' => Ok(15),
        c if c.is_ascii_digit() => Ok(c as u8 - b'0'),
        c => Err(BinaryError::InvalidPackedByte(c as u8)),
    }
}

fn validate_hex(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= token::PACKED_MAX as usize
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
}

fn pack_hex(value: char) -> Result<u8> {
    match value {
        c if c.is_ascii_digit() => Ok(c as u8 - b'0'),
        c if ('A'..='F').contains(&c) => Ok(10 + (c as u8 - b'A')),
        '\x00' => Ok(15),
        c => Err(BinaryError::InvalidPackedByte(c as u8)),
    }
}
