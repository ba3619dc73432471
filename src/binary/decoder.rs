use crate::binary::error::{BinaryError, Result};
use crate::binary::jid::{Jid, DEFAULT_USER_SERVER, HIDDEN_USER_SERVER};
use crate::binary::node::{Attrs, Node, NodeContent};
use crate::binary::token;

pub(crate) struct Decoder<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn bytes_left(&self) -> usize {
        self.data.len() - self.position
    }

    fn check_eos(&self, len: usize) -> Result<()> {
        if self.bytes_left() >= len {
            Ok(())
        } else {
            Err(BinaryError::Eof)
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.check_eos(1)?;
        let value = self.data[self.position];
        self.position += 1;
        Ok(value)
    }

    fn read_u16_be(&mut self) -> Result<u16> {
        self.check_eos(2)?;
        let value = u16::from_be_bytes([self.data[self.position], self.data[self.position + 1]]);
        self.position += 2;
        Ok(value)
    }

    fn read_u20_be(&mut self) -> Result<u32> {
        self.check_eos(3)?;
        let b = &self.data[self.position..self.position + 3];
        self.position += 3;
        Ok(((b[0] as u32 & 0x0F) << 16) | ((b[1] as u32) << 8) | (b[2] as u32))
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        self.check_eos(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[self.position..self.position + 4]);
        self.position += 4;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.check_eos(len)?;
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn read_string(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_bytes(len)?;
        Ok(std::str::from_utf8(bytes)?.to_string())
    }

    fn read_list_size(&mut self, tag: u8) -> Result<usize> {
        match tag {
            token::LIST_EMPTY => Ok(0),
            token::LIST_8 => self.read_u8().map(|v| v as usize),
            token::LIST_16 => self.read_u16_be().map(|v| v as usize),
            _ => Err(BinaryError::UnknownToken(tag)),
        }
    }

    fn read_jid_pair(&mut self) -> Result<Jid> {
        let user = self.read_value()?.unwrap_or_default();
        let server = self.read_value()?.unwrap_or_default();
        Ok(Jid::new(&user, &server))
    }

    fn read_ad_jid(&mut self) -> Result<Jid> {
        let domain = self.read_u8()?;
        let device = self.read_u8()? as u16;
        let user = self
            .read_value()?
            .ok_or(BinaryError::InvalidNode("ad jid without user"))?;

        // Domain byte 1 marks a lid user; any other value is a plain agent
        // on the default server.
        let (server, agent) = match domain {
            1 => (HIDDEN_USER_SERVER, 0),
            agent => (DEFAULT_USER_SERVER, agent),
        };

        Ok(Jid {
            user,
            server: server.to_string(),
            agent,
            device,
        })
    }

    fn read_value(&mut self) -> Result<Option<String>> {
        let tag = self.read_u8()?;
        match tag {
            token::LIST_EMPTY => Ok(None),
            token::BINARY_8 => {
                let size = self.read_u8()? as usize;
                self.read_string(size).map(Some)
            }
            token::BINARY_20 => {
                let size = self.read_u20_be()? as usize;
                self.read_string(size).map(Some)
            }
            token::BINARY_32 => {
                let size = self.read_u32_be()? as usize;
                self.read_string(size).map(Some)
            }
            token::JID_PAIR => self.read_jid_pair().map(|j| Some(j.to_string())),
            token::AD_JID => self.read_ad_jid().map(|j| Some(j.to_string())),
            token::NIBBLE_8 | token::HEX_8 => self.read_packed(tag).map(Some),
            tag @ token::DICTIONARY_0..=token::DICTIONARY_3 => {
                let index = self.read_u8()?;
                token::get_double_token(tag - token::DICTIONARY_0, index)
                    .map(|s| Some(s.to_string()))
                    .ok_or(BinaryError::UnknownToken(index))
            }
            _ => token::get_single_token(tag)
                .map(|s| Some(s.to_string()))
                .ok_or(BinaryError::UnknownToken(tag)),
        }
    }

    fn read_packed(&mut self, tag: u8) -> Result<String> {
        let len_byte = self.read_u8()?;
        let is_half_byte = (len_byte & 0x80) != 0;
        let len = (len_byte & 0x7F) as usize;

        let packed = self.read_bytes(len)?;
        let mut result = String::with_capacity(len * 2);
        for &byte in packed {
            result.push(Self::unpack_nibble(tag, (byte & 0xF0) >> 4)?);
            result.push(Self::unpack_nibble(tag, byte & 0x0F)?);
        }
        if is_half_byte {
            result.pop();
        }
        Ok(result)
    }

    fn unpack_nibble(tag: u8, value: u8) -> Result<char> {
        match tag {
            token::NIBBLE_8 => match value {
                0..=9 => Ok((b'0' + value) as char),
                10 => Ok('-'),
                11 => Ok('.'),
                12 => Ok('+'),
                15 => Ok('\x00'),
                _ => Err(BinaryError::InvalidPackedByte(value)),
            },
            token::HEX_8 => match value {
                0..=9 => Ok((b'0' + value) as char),
                10..=15 => Ok((b'A' + value - 10) as char),
                _ => Err(BinaryError::InvalidPackedByte(value)),
            },
            _ => Err(BinaryError::InvalidPackedByte(tag)),
        }
    }

    fn read_attributes(&mut self, count: usize) -> Result<Attrs> {
        let mut attrs = Attrs::with_capacity(count);
        for _ in 0..count {
            let key = self.read_value()?.ok_or(BinaryError::NonStringKey)?;
            let value = self.read_value()?.unwrap_or_default();
            attrs.insert(key, value);
        }
        Ok(attrs)
    }

    fn read_content(&mut self) -> Result<Option<NodeContent>> {
        let tag = self.read_u8()?;
        match tag {
            token::LIST_EMPTY => Ok(None),
            token::BINARY_8 => {
                let len = self.read_u8()? as usize;
                Ok(Some(NodeContent::Bytes(self.read_bytes(len)?.to_vec())))
            }
            token::BINARY_20 => {
                let len = self.read_u20_be()? as usize;
                Ok(Some(NodeContent::Bytes(self.read_bytes(len)?.to_vec())))
            }
            token::BINARY_32 => {
                let len = self.read_u32_be()? as usize;
                Ok(Some(NodeContent::Bytes(self.read_bytes(len)?.to_vec())))
            }
            _ => {
                let size = self.read_list_size(tag)?;
                let mut nodes = Vec::with_capacity(size);
                for _ in 0..size {
                    nodes.push(self.read_node()?);
                }
                Ok(Some(NodeContent::Nodes(nodes)))
            }
        }
    }

    pub(crate) fn read_node(&mut self) -> Result<Node> {
        let marker = self.read_u8()?;
        let list_size = self.read_list_size(marker)?;
        if list_size == 0 {
            return Err(BinaryError::InvalidNode("empty node list"));
        }

        let tag = self
            .read_value()?
            .ok_or(BinaryError::InvalidNode("node without tag"))?;

        let attr_count = (list_size - 1) / 2;
        let has_content = list_size % 2 == 0;

        let attrs = self.read_attributes(attr_count)?;
        let content = if has_content {
            self.read_content()?
        } else {
            None
        };

        Ok(Node { tag, attrs, content })
    }
}
