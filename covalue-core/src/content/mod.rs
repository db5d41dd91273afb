/*
    content - Deterministic views over a value's transactions

    Each value kind has a resolver that turns the valid, decrypted
    transactions (in canonical replay order) into a readable structure:
    - Map           RegisterMap (last writer wins per key)
    - List          CausalSequence
    - Stream        SessionStream
    - BinaryStream  BinaryStream over a single session stream

    Resolvers are pure: the same transaction set always yields the same
    view, whatever order it arrived in.
*/

pub mod binary_stream;
pub mod causal_sequence;
pub mod errors;
pub mod register_map;
pub mod session_stream;

pub use binary_stream::{BinaryChunks, BinaryItem, BinaryStream, BinaryStreamInfo};
pub use causal_sequence::{CausalSequence, ListAnchor, ListChange, ListEdge, ListItem};
pub use errors::{ContentError, ContentResult};
pub use register_map::{MapChange, MapEdit, RegisterMap};
pub use session_stream::{SessionStream, StreamItem};

use crate::core_value::{DecryptedTransaction, ValueKind};

/// Materialized content of a value, dispatched on its kind
#[derive(Debug, Clone)]
pub enum ContentView {
    Map(RegisterMap),
    List(CausalSequence),
    Stream(SessionStream),
    BinaryStream(BinaryStream),
}

impl ContentView {
    /// Build the view for `kind` from transactions in canonical order
    pub fn build(kind: ValueKind, txs: &[DecryptedTransaction]) -> Self {
        match kind {
            ValueKind::Map => ContentView::Map(RegisterMap::from_transactions(txs)),
            ValueKind::List => ContentView::List(CausalSequence::from_transactions(txs)),
            ValueKind::Stream => ContentView::Stream(SessionStream::from_transactions(txs)),
            ValueKind::BinaryStream => {
                ContentView::BinaryStream(BinaryStream::new(SessionStream::from_transactions(txs)))
            }
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            ContentView::Map(_) => ValueKind::Map,
            ContentView::List(_) => ValueKind::List,
            ContentView::Stream(_) => ValueKind::Stream,
            ContentView::BinaryStream(_) => ValueKind::BinaryStream,
        }
    }

    pub fn into_map(self) -> ContentResult<RegisterMap> {
        match self {
            ContentView::Map(map) => Ok(map),
            other => Err(wrong_kind(ValueKind::Map, other.kind())),
        }
    }

    pub fn into_list(self) -> ContentResult<CausalSequence> {
        match self {
            ContentView::List(list) => Ok(list),
            other => Err(wrong_kind(ValueKind::List, other.kind())),
        }
    }

    pub fn into_stream(self) -> ContentResult<SessionStream> {
        match self {
            ContentView::Stream(stream) => Ok(stream),
            ContentView::BinaryStream(binary) => Ok(binary.stream().clone()),
            other => Err(wrong_kind(ValueKind::Stream, other.kind())),
        }
    }

    pub fn into_binary_stream(self) -> ContentResult<BinaryStream> {
        match self {
            ContentView::BinaryStream(binary) => Ok(binary),
            other => Err(wrong_kind(ValueKind::BinaryStream, other.kind())),
        }
    }
}

pub(crate) fn wrong_kind(expected: ValueKind, actual: ValueKind) -> ContentError {
    ContentError::WrongKind {
        expected: format!("{:?}", expected),
        actual: format!("{:?}", actual),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_dispatches_on_kind() {
        assert_eq!(ContentView::build(ValueKind::Map, &[]).kind(), ValueKind::Map);
        assert_eq!(ContentView::build(ValueKind::List, &[]).kind(), ValueKind::List);
        assert_eq!(
            ContentView::build(ValueKind::BinaryStream, &[]).kind(),
            ValueKind::BinaryStream
        );
    }

    #[test]
    fn test_wrong_kind_conversion() {
        let view = ContentView::build(ValueKind::List, &[]);
        assert!(matches!(view.into_map(), Err(ContentError::WrongKind { .. })));

        let binary = ContentView::build(ValueKind::BinaryStream, &[]);
        assert!(binary.into_stream().is_ok());
    }
}
