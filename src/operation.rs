//! Completion routing: operation kinds, `user_data` packing, and result
//! decoding.
//!
//! Every submitted operation carries a 64-bit routing word:
//! kind in the top byte, registry slot generation in the next 24 bits, and
//! slot index in the low 32 bits. A completion is routed back to its owner
//! only if both the slot and generation still match, so completions for
//! retired components degrade to no-ops instead of touching reused slots.

use crate::error::Error;
use crate::registry::Key;

use std::io;

/// Low 24 bits of the generation participate in the routing word.
pub(crate) const GENERATION_MASK: u32 = 0x00ff_ffff;

/// What a completed queue entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum OpKind {
    Accept = 1,
    Connect = 2,
    Read = 3,
    Write = 4,
    Posted = 5,
    Wake = 6,
    Cancel = 7,
}

impl OpKind {
    pub(crate) const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(OpKind::Accept),
            2 => Some(OpKind::Connect),
            3 => Some(OpKind::Read),
            4 => Some(OpKind::Write),
            5 => Some(OpKind::Posted),
            6 => Some(OpKind::Wake),
            7 => Some(OpKind::Cancel),
            _ => None,
        }
    }
}

/// Packs an operation kind and registry key into a `user_data` word.
pub(crate) const fn encode(kind: OpKind, key: Key) -> u64 {
    ((kind as u64) << 56)
        | (((key.generation & GENERATION_MASK) as u64) << 32)
        | key.index as u64
}

/// Routing word for operations that have no registry owner (wake, cancel).
pub(crate) const fn encode_bare(kind: OpKind) -> u64 {
    (kind as u64) << 56
}

/// Splits a `user_data` word back into its kind and key.
pub(crate) const fn decode(user_data: u64) -> (Option<OpKind>, Key) {
    let kind = OpKind::from_u8((user_data >> 56) as u8);
    let key = Key {
        index: user_data as u32,
        generation: ((user_data >> 32) as u32) & GENERATION_MASK,
    };

    (kind, key)
}

/// Maps a raw completion result to the operation outcome.
///
/// io_uring reports failure as a negated errno; cancellation gets its own
/// variant so handlers can close quietly.
pub(crate) fn decode_result(result: i32) -> Result<u32, Error> {
    if result >= 0 {
        return Ok(result as u32);
    }

    let errno = -result;
    if errno == libc::ECANCELED {
        return Err(Error::Cancelled);
    }

    Err(Error::Io(io::Error::from_raw_os_error(errno)))
}

#[cfg(test)]
mod tests {
    use super::{OpKind, decode, decode_result, encode, encode_bare};
    use crate::error::Error;
    use crate::registry::Key;

    #[test]
    fn routing_word_round_trips() {
        let key = Key {
            index: 0xdead_beef,
            generation: 0x00ab_cdef,
        };
        let (kind, decoded) = decode(encode(OpKind::Read, key));

        assert_eq!(kind, Some(OpKind::Read));
        assert_eq!(decoded, key);
    }

    #[test]
    fn generation_is_truncated_to_24_bits() {
        let key = Key {
            index: 1,
            generation: 0xff00_0007,
        };
        let (_, decoded) = decode(encode(OpKind::Write, key));

        assert_eq!(decoded.generation, 0x0000_0007);
    }

    #[test]
    fn bare_words_carry_no_key() {
        let (kind, key) = decode(encode_bare(OpKind::Wake));

        assert_eq!(kind, Some(OpKind::Wake));
        assert_eq!(key.index, 0);
        assert_eq!(key.generation, 0);
    }

    #[test]
    fn unknown_kind_decodes_to_none() {
        let (kind, _) = decode(0xee_u64 << 56);
        assert_eq!(kind, None);
    }

    #[test]
    fn results_map_to_outcomes() {
        assert!(matches!(decode_result(0), Ok(0)));
        assert!(matches!(decode_result(4096), Ok(4096)));
        assert!(matches!(
            decode_result(-libc::ECANCELED),
            Err(Error::Cancelled)
        ));

        match decode_result(-libc::ECONNRESET) {
            Err(Error::Io(err)) => {
                assert_eq!(err.raw_os_error(), Some(libc::ECONNRESET));
            }
            other => panic!("expected io error, got {other:?}"),
        }
    }
}
