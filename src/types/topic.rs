use crate::encoding::wire::{self, Reader};
use crate::errinput;
use crate::error::Result;

/// The maximum length of a topic name, in bytes.
pub const MAX_TOPIC_LEN: usize = 127;

/// A validated topic name: 1..=127 bytes of UTF-8, not starting with '.'.
/// Names starting with '.' are reserved; the empty name is the synthetic
/// topic that carries config-change mutations, and encodes with length 0.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TopicName(String);

impl TopicName {
    /// Creates a validated topic name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_TOPIC_LEN {
            return errinput!("topic name must be 1 to {MAX_TOPIC_LEN} bytes");
        }
        if name.starts_with('.') {
            return errinput!("topic names starting with '.' are reserved");
        }
        Ok(Self(name))
    }

    /// The synthetic topic used by mutations that don't post to a real topic.
    pub fn synthetic() -> Self {
        Self(String::new())
    }

    pub fn is_synthetic(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        wire::put_bytes8(buf, self.0.as_bytes());
    }

    pub fn decode_from(reader: &mut Reader) -> Result<Self> {
        let bytes = reader.bytes8()?;
        if bytes.is_empty() {
            return Ok(Self::synthetic());
        }
        Self::new(String::from_utf8(bytes.to_vec())?)
    }
}

impl std::fmt::Display for TopicName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(TopicName::new("t").is_ok());
        assert!(TopicName::new("a".repeat(MAX_TOPIC_LEN)).is_ok());
        assert!(TopicName::new("").is_err());
        assert!(TopicName::new("a".repeat(MAX_TOPIC_LEN + 1)).is_err());
        assert!(TopicName::new(".reserved").is_err());
        assert!(TopicName::new("not.reserved").is_ok());
    }

    #[test]
    fn codec() -> Result<()> {
        for name in [TopicName::new("events/shard-1")?, TopicName::synthetic()] {
            let mut buf = Vec::new();
            name.encode_into(&mut buf);
            let mut reader = Reader::new(&buf);
            assert_eq!(TopicName::decode_from(&mut reader)?, name);
            reader.done()?;
        }
        Ok(())
    }
}
