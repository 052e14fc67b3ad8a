use crate::tools::error::{FluteError, Result};

/// Symbol alignment parameter used by the Raptor scheme
pub const RAPTOR_SYMBOL_ALIGNMENT: u32 = 4;

///
/// FEC scheme carried in the LCT codepoint.
/// From the IANA registry for FEC schemes (RFC 5052)
///
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FecScheme {
    /// Compact No-Code, source symbols are the encoding symbols
    CompactNoCode = 0,
    /// Raptor systematic fountain code (RFC 5053)
    Raptor = 1,
}

impl TryFrom<u8> for FecScheme {
    type Error = ();

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            x if x == FecScheme::CompactNoCode as u8 => Ok(FecScheme::CompactNoCode),
            x if x == FecScheme::Raptor as u8 => Ok(FecScheme::Raptor),
            _ => Err(()),
        }
    }
}

///
/// FEC Object Transmission Information
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FecOti {
    /// FEC scheme of the object
    pub encoding_id: FecScheme,
    /// Size of the object during transfer, in octets
    pub transfer_length: u64,
    /// Size of an encoding symbol, in octets
    pub encoding_symbol_length: u32,
    /// Maximum number of source symbols per source block
    pub max_source_block_length: u32,
}

impl FecOti {
    pub fn new(
        encoding_id: FecScheme,
        transfer_length: u64,
        encoding_symbol_length: u32,
        max_source_block_length: u32,
    ) -> Result<Self> {
        if encoding_symbol_length == 0 {
            return Err(FluteError::Config(
                "encoding symbol length must not be 0".to_owned(),
            ));
        }

        if encoding_id == FecScheme::Raptor
            && encoding_symbol_length % RAPTOR_SYMBOL_ALIGNMENT != 0
        {
            return Err(FluteError::Config(format!(
                "Raptor symbol length {} is not a multiple of Al={}",
                encoding_symbol_length, RAPTOR_SYMBOL_ALIGNMENT
            )));
        }

        Ok(Self {
            encoding_id,
            transfer_length,
            encoding_symbol_length,
            max_source_block_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_scheme_from_codepoint() {
        assert_eq!(FecScheme::try_from(0), Ok(FecScheme::CompactNoCode));
        assert_eq!(FecScheme::try_from(1), Ok(FecScheme::Raptor));
        assert!(FecScheme::try_from(2).is_err());
        assert!(FecScheme::try_from(129).is_err());
    }

    #[test]
    pub fn test_raptor_alignment() {
        assert!(FecOti::new(FecScheme::Raptor, 100, 1430, 64).is_err());
        assert!(FecOti::new(FecScheme::Raptor, 100, 1428, 64).is_ok());
        assert!(FecOti::new(FecScheme::CompactNoCode, 100, 1430, 64).is_ok());
    }
}
