//! Streaming helpers for P-DATA exchange.
//!
//! [`PDataWriter`] splits an arbitrarily long data set payload
//! into P-DATA-TF PDUs no larger than the peer's maximum length.
//! [`PDataReader`] performs the reverse:
//! it keeps pulling P-DATA-TF PDUs from the association
//! and yields the data set fragments in arrival order
//! until the final fragment is seen,
//! so that large data sets can be consumed in chunks
//! without ever being materialized whole.

use crate::pdu::{PDataValue, PDataValueType, Pdu, MAXIMUM_PDU_SIZE};

use super::{AsyncAssociation, Result};

/// The bytes taken from each PDU by the encapsulation:
/// the PDV item length (4), the context ID (1)
/// and the message control header (1).
const PDV_OVERHEAD: u32 = 6;

/// Determine the fragment payload capacity
/// for a peer maximum PDU length.
fn max_data_length(peer_max_pdu_length: u32) -> usize {
    // an "unlimited" peer still gets bounded fragments
    let pdu_length = match peer_max_pdu_length {
        0 | u32::MAX => MAXIMUM_PDU_SIZE,
        n => n,
    };
    pdu_length.saturating_sub(PDV_OVERHEAD).max(1) as usize
}

/// A P-Data value writer.
///
/// Bytes written are buffered
/// and sent as P-DATA-TF PDUs of the maximum permitted size;
/// [`finish`](Self::finish) flushes the remainder
/// marked as the last fragment.
///
/// Use an association's
/// [`send_pdata`](crate::association::AsyncAssociation::send_pdata)
/// to create one.
#[must_use]
pub struct PDataWriter<'a, A> {
    association: &'a mut A,
    buffer: Vec<u8>,
    presentation_context_id: u8,
    value_type: PDataValueType,
    max_data_length: usize,
    finished: bool,
}

impl<'a, A> PDataWriter<'a, A>
where
    A: AsyncAssociation,
{
    pub(crate) fn new(
        association: &'a mut A,
        presentation_context_id: u8,
        peer_max_pdu_length: u32,
    ) -> Self {
        let max_data_length = max_data_length(peer_max_pdu_length);
        PDataWriter {
            association,
            presentation_context_id,
            value_type: PDataValueType::Data,
            max_data_length,
            buffer: Vec::with_capacity(max_data_length.min(1 << 20)),
            finished: false,
        }
    }

    /// Choose the kind of fragments to produce.
    /// The default is data set fragments.
    pub fn value_type(mut self, value_type: PDataValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Append bytes to the payload,
    /// sending out full-size fragments as they accumulate.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(buf);
        self.dispatch_excess_data().await
    }

    /// Send the remaining bytes as the final fragment.
    ///
    /// Must be called exactly once after all payload bytes were written;
    /// the final fragment is sent even if empty,
    /// as it carries the last-fragment marker.
    pub async fn finish(mut self) -> Result<()> {
        self.dispatch_excess_data().await?;
        let data = std::mem::take(&mut self.buffer);
        self.send_fragment(data, true).await?;
        self.finished = true;
        Ok(())
    }

    async fn dispatch_excess_data(&mut self) -> Result<()> {
        while self.buffer.len() > self.max_data_length {
            let remainder = self.buffer.split_off(self.max_data_length);
            let chunk = std::mem::replace(&mut self.buffer, remainder);
            self.send_fragment(chunk, false).await?;
        }
        Ok(())
    }

    async fn send_fragment(&mut self, data: Vec<u8>, is_last: bool) -> Result<()> {
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: self.presentation_context_id,
                value_type: self.value_type,
                is_last,
                data,
            }],
        };
        self.association.send(&pdu).await
    }
}

impl<A> Drop for PDataWriter<'_, A> {
    fn drop(&mut self) {
        if !self.finished && !self.buffer.is_empty() {
            // a sync drop cannot flush an async stream
            tracing::warn!(
                "P-Data writer dropped with {} unsent bytes (missing call to `finish`?)",
                self.buffer.len()
            );
        }
    }
}

/// A P-Data value reader for one message half.
///
/// Yields the payloads of incoming fragments of the given kind
/// until the last fragment is consumed.
#[must_use]
pub struct PDataReader<'a, A> {
    association: &'a mut A,
    presentation_context_id: u8,
    value_type: PDataValueType,
    /// fragments already received but not yet handed out
    pending: std::collections::VecDeque<PDataValue>,
    seen_last: bool,
}

impl<'a, A> PDataReader<'a, A>
where
    A: AsyncAssociation,
{
    pub(crate) fn new(
        association: &'a mut A,
        presentation_context_id: u8,
        value_type: PDataValueType,
    ) -> Self {
        PDataReader {
            association,
            presentation_context_id,
            value_type,
            pending: Default::default(),
            seen_last: false,
        }
    }

    /// Obtain the next fragment payload,
    /// or `None` once the last fragment has been delivered.
    ///
    /// Fragments for other presentation contexts may be interleaved
    /// on the wire; those are an error at this point,
    /// since a message's fragment stream must be contiguous
    /// within its context.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(pdv) = self.pending.pop_front() {
                if pdv.presentation_context_id != self.presentation_context_id
                    || pdv.value_type != self.value_type
                {
                    return super::UnexpectedPduSnafu {
                        pdu: Box::new(Pdu::PData { data: vec![pdv] }),
                    }
                    .fail();
                }
                self.seen_last = pdv.is_last;
                return Ok(Some(pdv.data));
            }
            if self.seen_last {
                return Ok(None);
            }

            match self.association.receive().await? {
                Pdu::PData { data } => self.pending.extend(data),
                pdu => {
                    return super::UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
                }
            }
        }
    }

    /// Read all remaining fragments into one buffer.
    pub async fn read_to_end(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        while let Some(chunk) = self.next_chunk().await? {
            buffer.extend_from_slice(chunk.as_slice());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_capacity_accounts_for_headers() {
        assert_eq!(max_data_length(16_384), 16_384 - 6);
        // unlimited peers still get bounded fragments
        assert_eq!(max_data_length(0), (MAXIMUM_PDU_SIZE - 6) as usize);
        assert_eq!(max_data_length(u32::MAX), (MAXIMUM_PDU_SIZE - 6) as usize);
    }

    /// a full PDU (header + PDV) never exceeds the peer maximum
    #[test]
    fn fragment_fits_peer_maximum() {
        for max in [4096_u32, 16_384, 131_072] {
            let payload = max_data_length(max) as u32;
            assert!(payload + PDV_OVERHEAD <= max);
        }
    }
}
