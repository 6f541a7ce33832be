use crate::{Inbound, ProtocolError, RawFrame};

/// Reassembles inbound text that may arrive split over several chunks.
///
/// A chunk that ends in the middle of a JSON document is kept and retried once
/// more text arrives. Anything else that fails to parse empties the buffer.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: String,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, chunk: &str) -> Result<Option<Inbound>, ProtocolError> {
        self.pending.push_str(chunk);
        match serde_json::from_str::<RawFrame>(&self.pending) {
            Ok(raw) => {
                self.pending.clear();
                Inbound::classify(raw).map(Some)
            }
            Err(e) if e.is_eof() => Ok(None),
            Err(e) => {
                self.pending.clear();
                Err(ProtocolError::Json(e))
            }
        }
    }
}
