use super::lct;
use super::oti::{FecOti, FecScheme};
use crate::tools::error::{FluteError, Result};

///
/// Parsed ALC/LCT packet. `data` borrows the received datagram, the
/// encoding-symbol payload starts at `payload_offset`.
///
#[derive(Debug)]
pub struct AlcPkt<'a> {
    pub lct: lct::LctHeader,
    /// FEC scheme selected by the LCT codepoint
    pub fec_scheme: FecScheme,
    /// OTI carried inband by an EXT_FTI extension (Compact No-Code only)
    pub fec_oti: Option<FecOti>,
    /// Content encoding from EXT_CENC, `Null` when absent
    pub cenc: lct::Cenc,
    /// FDT instance id from EXT_FDT, present on TOI=0 packets
    pub fdt_instance_id: Option<u32>,
    pub data: &'a [u8],
    pub payload_offset: usize,
}

///
/// Serialize one ALC packet.
///
/// A packet carrying the FDT (TOI=0) always includes EXT_FDT and EXT_FTI so
/// a receiver can bootstrap from it alone. Data packets carry neither, their
/// OTI travels in the FDT.
///
pub fn new_alc_pkt(
    tsi: u64,
    toi: u64,
    fec_oti: &FecOti,
    fdt_instance_id: Option<u32>,
    payload: &[u8],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + payload.len());
    lct::push_lct_header(&mut data, tsi, toi, fec_oti.encoding_id as u8, false);

    if toi == lct::TOI_FDT {
        debug_assert!(fdt_instance_id.is_some());
        debug_assert!(fec_oti.encoding_id == FecScheme::CompactNoCode);
        push_ext_fdt(&mut data, 1, fdt_instance_id.unwrap_or_default());
        push_ext_fti(&mut data, fec_oti);
    }

    data.extend(payload);
    data
}

pub fn parse_alc_pkt(data: &[u8]) -> Result<AlcPkt> {
    let lct_header = lct::parse_lct_header(data)?;

    let fec_scheme: FecScheme = lct_header.cp.try_into().map_err(|_| {
        FluteError::MalformedPacket(format!("codepoint {} is not supported", lct_header.cp))
    })?;

    let fti = lct::get_ext(data, &lct_header, lct::Ext::Fti)?;
    let fec_oti = match (fec_scheme, fti) {
        (_, None) => None,
        (FecScheme::CompactNoCode, Some(ext)) => Some(parse_ext_fti(ext)?),
        (FecScheme::Raptor, Some(_)) => {
            return Err(FluteError::MalformedPacket(
                "Raptor OTI is carried in the FDT, not in EXT_FTI".to_owned(),
            ))
        }
    };

    let cenc = match lct::get_ext(data, &lct_header, lct::Ext::Cenc)? {
        Some(ext) => parse_ext_cenc(ext)?,
        None => lct::Cenc::Null,
    };

    let mut fdt_instance_id = None;
    if lct_header.toi == lct::TOI_FDT {
        if let Some(ext) = lct::get_ext(data, &lct_header, lct::Ext::Fdt)? {
            fdt_instance_id = Some(parse_ext_fdt(ext)?);
        }
    }

    let payload_offset = lct_header.len;
    Ok(AlcPkt {
        lct: lct_header,
        fec_scheme,
        fec_oti,
        cenc,
        fdt_instance_id,
        data,
        payload_offset,
    })
}

fn push_ext_fdt(data: &mut Vec<u8>, version: u8, fdt_instance_id: u32) {
    /*
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |   HET = 192   |   V   |          FDT Instance ID              |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    */
    let ext = (lct::Ext::Fdt as u32) << 24 | (version as u32) << 20 | (fdt_instance_id & 0xFFFFF);
    data.extend(ext.to_be_bytes());
    lct::inc_hdr_len(data, 1);
}

fn parse_ext_fdt(ext: &[u8]) -> Result<u32> {
    if ext.len() != 4 {
        return Err(FluteError::MalformedPacket(
            "wrong size of the FDT extension".to_owned(),
        ));
    }

    let mut fdt_bytes: [u8; 4] = [0; 4];
    fdt_bytes.copy_from_slice(ext);
    let fdt_bytes = u32::from_be_bytes(fdt_bytes);

    let version = (fdt_bytes >> 20) & 0xF;
    if version > 2 {
        return Err(FluteError::MalformedPacket(format!(
            "FLUTE version {} is not supported",
            version
        )));
    }

    Ok(fdt_bytes & 0xFFFFF)
}

fn push_ext_fti(data: &mut Vec<u8>, fec_oti: &FecOti) {
    /*
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |   HET = 64    |   HEL = 4     |                               |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               +
    |                      Transfer Length                          |
    +                               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                               |           Reserved            |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |    Encoding Symbol Length     | Max. Source Block Length (MSB)|
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    | Max. Source Block Length (LSB)|
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    */
    let ext_header: u16 = (lct::Ext::Fti as u16) << 8 | 4u16;
    // 48-bit transfer length followed by 16 reserved bits
    let transfer_header: u64 = (fec_oti.transfer_length & 0xFFFF_FFFF_FFFF) << 16;
    let esl: u16 = fec_oti.encoding_symbol_length as u16;
    let sbl_msb: u16 = ((fec_oti.max_source_block_length >> 16) & 0xFFFF) as u16;
    let sbl_lsb: u16 = (fec_oti.max_source_block_length & 0xFFFF) as u16;

    data.extend(ext_header.to_be_bytes());
    data.extend(transfer_header.to_be_bytes());
    data.extend(esl.to_be_bytes());
    data.extend(sbl_msb.to_be_bytes());
    data.extend(sbl_lsb.to_be_bytes());
    lct::inc_hdr_len(data, 4);
}

fn parse_ext_fti(ext: &[u8]) -> Result<FecOti> {
    if ext.len() != 16 {
        return Err(FluteError::MalformedPacket(
            "wrong size of the FTI extension for Compact No-Code".to_owned(),
        ));
    }

    let mut transfer_length: [u8; 8] = [0; 8];
    transfer_length.copy_from_slice(&ext[2..10]);
    let transfer_length = u64::from_be_bytes(transfer_length) >> 16;

    let mut encoding_symbol_length: [u8; 2] = [0; 2];
    encoding_symbol_length.copy_from_slice(&ext[10..12]);
    let encoding_symbol_length = u16::from_be_bytes(encoding_symbol_length);

    let mut max_source_block_length: [u8; 4] = [0; 4];
    max_source_block_length.copy_from_slice(&ext[12..16]);
    let max_source_block_length = u32::from_be_bytes(max_source_block_length);

    FecOti::new(
        FecScheme::CompactNoCode,
        transfer_length,
        encoding_symbol_length as u32,
        max_source_block_length,
    )
}

fn parse_ext_cenc(ext: &[u8]) -> Result<lct::Cenc> {
    if ext.len() != 4 {
        return Err(FluteError::MalformedPacket(
            "wrong size of the CENC extension".to_owned(),
        ));
    }
    ext[1]
        .try_into()
        .map_err(|_| FluteError::MalformedPacket(format!("content encoding {} unknown", ext[1])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oti() -> FecOti {
        FecOti::new(FecScheme::CompactNoCode, 11, 1428, 64).unwrap()
    }

    #[test]
    pub fn test_alc_data_pkt_roundtrip() {
        crate::tests::init();
        let payload = [0u8, 1, 0, 0, b'h', b'i'];
        let data = new_alc_pkt(0x1234, 42, &oti(), None, &payload);
        let pkt = parse_alc_pkt(&data).unwrap();
        assert_eq!(pkt.lct.tsi, 0x1234);
        assert_eq!(pkt.lct.toi, 42);
        assert_eq!(pkt.fec_scheme, FecScheme::CompactNoCode);
        assert!(pkt.fec_oti.is_none());
        assert!(pkt.fdt_instance_id.is_none());
        assert_eq!(&pkt.data[pkt.payload_offset..], &payload);
    }

    #[test]
    pub fn test_alc_fdt_pkt_carries_extensions() {
        crate::tests::init();
        let payload = [0u8, 0, 0, 0, b'<'];
        let data = new_alc_pkt(1, lct::TOI_FDT, &oti(), Some(7), &payload);
        let pkt = parse_alc_pkt(&data).unwrap();
        assert_eq!(pkt.fdt_instance_id, Some(7));
        let fti = pkt.fec_oti.unwrap();
        assert_eq!(fti.transfer_length, 11);
        assert_eq!(fti.encoding_symbol_length, 1428);
        assert_eq!(fti.max_source_block_length, 64);
        assert_eq!(&pkt.data[pkt.payload_offset..], &payload);
    }

    #[test]
    pub fn test_alc_reject_unknown_codepoint() {
        crate::tests::init();
        let mut data = new_alc_pkt(1, 42, &oti(), None, &[0, 0, 0, 0]);
        data[3] = 5;
        assert!(parse_alc_pkt(&data).is_err());
    }

    #[test]
    pub fn test_alc_reject_raptor_fti() {
        crate::tests::init();
        // An FDT packet rewritten with the Raptor codepoint must not parse
        let mut data = new_alc_pkt(1, lct::TOI_FDT, &oti(), Some(1), &[0, 0, 0, 0]);
        data[3] = FecScheme::Raptor as u8;
        assert!(parse_alc_pkt(&data).is_err());
    }

    #[test]
    pub fn test_alc_fdt_instance_id_20_bits() {
        crate::tests::init();
        let data = new_alc_pkt(1, lct::TOI_FDT, &oti(), Some(0xFFFFF), &[0, 0, 0, 0]);
        let pkt = parse_alc_pkt(&data).unwrap();
        assert_eq!(pkt.fdt_instance_id, Some(0xFFFFF));
    }
}
