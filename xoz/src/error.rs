//! Crate-wide error type. Variants map to what the failure *signals*, not
//! to the layer that raised it; the message carries the specifics (block
//! numbers, valid ranges, byte counts) so callers and tests can pinpoint
//! the offending operation.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid block number {blk_nr}, it is more than 26 bits. Error when creating a new extent of block count {blk_cnt} (is suballoc: {is_suballoc})")]
    InvalidBlockNr {
        blk_nr: u32,
        blk_cnt: u16,
        is_suballoc: u8,
    },

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    ExtentOutOfBounds(String),

    #[error("The {target} overlaps with the {reference} (reference extent): ({position})")]
    ExtentOverlap {
        target: String,
        reference: String,
        position: &'static str,
    },

    #[error("The block 0x00 cannot be {operation}")]
    NullBlockAccess { operation: &'static str },

    #[error("{0}")]
    NotEnoughRoom(String),

    #[error("{0}")]
    Overflow(String),

    #[error("{0}")]
    InconsistentState(String),

    #[error("{0}")]
    AlreadyInitialized(String),

    #[error("{0}")]
    IncompatibleFeature(String),

    #[error("{0}")]
    InconsistentFile(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn not_enough_room_rd(requested: u32, available: u32, position: u32) -> Error {
        Error::NotEnoughRoom(format!(
            "Requested {requested} bytes but only {available} bytes are available. \
             Read exact-byte-count operation at position {position} failed; \
             detected before the read."
        ))
    }

    pub(crate) fn not_enough_room_wr(requested: u32, available: u32, position: u32) -> Error {
        Error::NotEnoughRoom(format!(
            "Requested {requested} bytes but only {available} bytes are available. \
             Write exact-byte-count operation at position {position} failed; \
             detected before the write."
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_io_messages() {
        let err = Error::not_enough_room_rd(65, 64, 0);
        assert_eq!(
            err.to_string(),
            "Requested 65 bytes but only 64 bytes are available. \
             Read exact-byte-count operation at position 0 failed; \
             detected before the read."
        );

        let err = Error::not_enough_room_wr(8, 0, 6);
        assert!(err.to_string().starts_with("Requested 8 bytes but only 0 bytes"));
        assert!(err.to_string().contains("at position 6"));
    }

    #[test]
    fn test_null_block_message() {
        let err = Error::NullBlockAccess { operation: "read" };
        assert_eq!(err.to_string(), "The block 0x00 cannot be read");
    }
}
