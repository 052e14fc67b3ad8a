use super::lct::Cenc;
use super::oti::FecOti;
use crate::tools::error::{FluteError, Result};

///
/// One encoding symbol extracted from an ALC payload, borrowing the
/// datagram it came from.
///
/// For both supported schemes the payload layout is
/// `[SBN:16][ESI:16] || symbol_1 || symbol_2 || ...` where every symbol of a
/// packet belongs to the same source block and carries consecutive ids.
///
#[derive(Debug, Clone, Copy)]
pub struct EncodingSymbol<'a> {
    pub sbn: u16,
    pub esi: u16,
    pub data: &'a [u8],
}

/// Split an ALC payload into its encoding symbols.
///
/// The number of symbols is `ceil((len - 4) / T)`, the last one may be
/// shorter than `T`.
pub fn from_payload<'a>(
    payload: &'a [u8],
    fec_oti: &FecOti,
    cenc: Cenc,
) -> Result<Vec<EncodingSymbol<'a>>> {
    if cenc != Cenc::Null {
        return Err(FluteError::Decode(
            "only unencoded content is supported".to_owned(),
        ));
    }

    if payload.len() < 4 {
        return Err(FluteError::MalformedPacket(
            "ALC payload is too short to carry SBN and ESI".to_owned(),
        ));
    }

    let sbn = u16::from_be_bytes([payload[0], payload[1]]);
    let esi = u16::from_be_bytes([payload[2], payload[3]]);
    let data = &payload[4..];

    let symbol_length = fec_oti.encoding_symbol_length as usize;
    let nof_symbols = num_integer::div_ceil(data.len(), symbol_length);

    let mut symbols = Vec::with_capacity(nof_symbols);
    for i in 0..nof_symbols {
        let start = i * symbol_length;
        let end = std::cmp::min(start + symbol_length, data.len());
        symbols.push(EncodingSymbol {
            sbn,
            esi: esi.wrapping_add(i as u16),
            data: &data[start..end],
        });
    }

    Ok(symbols)
}

/// Pack symbols of a single source block into an ALC payload.
///
/// The caller guarantees the symbols share their SBN and carry consecutive
/// ESIs, only the first pair is written to the wire.
pub fn to_payload(symbols: &[EncodingSymbol]) -> Vec<u8> {
    debug_assert!(!symbols.is_empty());
    debug_assert!(symbols.windows(2).all(|w| {
        w[0].sbn == w[1].sbn && w[0].esi.wrapping_add(1) == w[1].esi
    }));

    let len = 4 + symbols.iter().map(|s| s.data.len()).sum::<usize>();
    let mut payload = Vec::with_capacity(len);
    payload.extend(symbols[0].sbn.to_be_bytes());
    payload.extend(symbols[0].esi.to_be_bytes());
    for symbol in symbols {
        payload.extend(symbol.data);
    }
    payload
}
