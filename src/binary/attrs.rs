use crate::binary::error::{BinaryError, Result};
use crate::binary::jid::Jid;
use crate::binary::node::{Attrs, Node};

/// Typed attribute access with error accumulation: callers pull what they
/// need and check `finish()`/`ok()` once, instead of handling each lookup.
pub struct AttrParser<'a> {
    attrs: &'a Attrs,
    pub errors: Vec<BinaryError>,
}

impl<'a> AttrParser<'a> {
    pub fn new(node: &'a Node) -> Self {
        Self {
            attrs: &node.attrs,
            errors: Vec::new(),
        }
    }

    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn finish(&self) -> Result<()> {
        match self.errors.first() {
            None => Ok(()),
            Some(first) => Err(first.clone()),
        }
    }

    fn get_raw(&mut self, key: &str, require: bool) -> Option<&'a str> {
        let val = self.attrs.get(key).map(|s| s.as_str());
        if require && val.is_none() {
            self.errors.push(BinaryError::MissingAttr(key.to_string()));
        }
        val
    }

    pub fn optional_string(&mut self, key: &str) -> Option<&'a str> {
        self.get_raw(key, false)
    }

    /// Required string; records an error and returns empty on absence.
    pub fn string(&mut self, key: &str) -> String {
        self.get_raw(key, true).unwrap_or_default().to_string()
    }

    pub fn optional_jid(&mut self, key: &str) -> Option<Jid> {
        let raw = self.get_raw(key, false)?;
        match raw.parse() {
            Ok(jid) => Some(jid),
            Err(e) => {
                self.errors
                    .push(BinaryError::AttrParse(format!("invalid jid '{raw}': {e}")));
                None
            }
        }
    }

    pub fn jid(&mut self, key: &str) -> Jid {
        self.get_raw(key, true);
        self.optional_jid(key).unwrap_or_default()
    }

    pub fn optional_u64(&mut self, key: &str) -> Option<u64> {
        let raw = self.get_raw(key, false)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(BinaryError::AttrParse(format!(
                    "invalid number '{raw}' for '{key}': {e}"
                )));
                None
            }
        }
    }

    pub fn optional_bool(&mut self, key: &str) -> bool {
        matches!(self.get_raw(key, false), Some("true") | Some("1"))
    }

    pub fn unix_time(&mut self, key: &str) -> i64 {
        self.get_raw(key, false)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use crate::binary::node::NodeBuilder;

    #[test]
    fn typed_access_accumulates_errors() {
        let node = NodeBuilder::new("receipt")
            .attr("id", "ABC")
            .attr("t", "1700000000")
            .attr("from", "123@s.whatsapp.net")
            .build();
        let mut parser = node.attrs();
        assert_eq!(parser.string("id"), "ABC");
        assert_eq!(parser.unix_time("t"), 1_700_000_000);
        assert_eq!(parser.jid("from").user, "123");
        assert!(parser.finish().is_ok());

        let mut parser = node.attrs();
        parser.string("missing");
        assert!(parser.finish().is_err());
    }

    #[test]
    fn invalid_jid_is_an_error_not_a_panic() {
        let node = NodeBuilder::new("message").attr("from", "not_a_number_x:y@").build();
        let mut parser = node.attrs();
        assert!(parser.optional_jid("from").is_none());
        assert!(!parser.ok());
    }
}
