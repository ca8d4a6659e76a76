use bytes::Bytes;
use std::cmp::min;
use std::fmt::{Debug, Display, Formatter};

/// Opaque address of a peer on the underlying session. The streaming layer never interprets
///  the bytes, it only compares them and passes them back to the session for sending.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Destination(Bytes);

impl Destination {
    /// Longest destination that fits the u16 length prefix of the FROM option
    pub const MAX_LEN: usize = u16::MAX as usize;
    /// number of leading bytes shown by `Display`
    const DISPLAY_LEN: usize = 6;

    pub fn new(raw: impl Into<Bytes>) -> Destination {
        Destination(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..min(Self::DISPLAY_LEN, self.0.len())]))?;
        if self.0.len() > Self::DISPLAY_LEN {
            write!(f, "..")?;
        }
        Ok(())
    }
}

impl Debug for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DEST[{}]", self)
    }
}
