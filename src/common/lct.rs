use crate::tools::error::{FluteError, Result};

/// Content Encoding of a transferred object
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cenc {
    /// Do not encode content before transmission
    Null = 0,
    /// Encode content with ZLIB
    Zlib = 1,
    /// Encode content with Deflate
    Deflate = 2,
    /// Encode content with Gzip
    Gzip = 3,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ext {
    Nop = 0,
    Auth = 1,
    Time = 2,
    Fti = 64,
    Fdt = 192,
    Cenc = 193,
}

/// TOI reserved for the File Delivery Table
pub const TOI_FDT: u64 = 0;

/// Largest TOI that can be emitted, the LCT header carries at most 48 bits
pub const TOI_MAX: u64 = 0xFFFF_FFFF_FFFF;

/// Largest TSI that can be emitted
pub const TSI_MAX: u64 = 0xFFFF_FFFF_FFFF;

impl TryFrom<u8> for Cenc {
    type Error = ();

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            x if x == Cenc::Null as u8 => Ok(Cenc::Null),
            x if x == Cenc::Zlib as u8 => Ok(Cenc::Zlib),
            x if x == Cenc::Deflate as u8 => Ok(Cenc::Deflate),
            x if x == Cenc::Gzip as u8 => Ok(Cenc::Gzip),
            _ => Err(()),
        }
    }
}

impl Cenc {
    /// Convert Cenc to its string representation
    pub fn to_str(self) -> &'static str {
        match self {
            Cenc::Null => "null",
            Cenc::Zlib => "zlib",
            Cenc::Deflate => "deflate",
            Cenc::Gzip => "gzip",
        }
    }
}

///
/// Decoded LCT base header
///
/// ```text
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |   V   | C |PSI|S| O |H|Res|A|B|   HDR_LEN     | Codepoint (CP)|
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  | Congestion Control Information (CCI, length = 32*(C+1) bits)  |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |  Transport Session Identifier (TSI, length = 32*S+16*H bits)  |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |   Transport Object Identifier (TOI, length = 32*O+16*H bits)  |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |                Header Extensions (if applicable)              |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
/// See <https://www.rfc-editor.org/rfc/rfc5651#section-5.1>
///
#[derive(Clone, Debug)]
pub struct LctHeader {
    /// Total length of the LCT header, in octets
    pub len: usize,
    pub tsi: u64,
    pub toi: u64,
    /// Codepoint, maps to the FEC scheme of the payload
    pub cp: u8,
    pub close_object: bool,
    pub close_session: bool,
    /// Offset of the first header extension
    pub header_ext_offset: usize,
}

///
/// Push an LCT base header.
///
/// Emission always uses `V=1`, `C=0` (a zeroed 32-bit CCI), `PSI=0` and
/// `H=1`. TSI and TOI are written as a half-word when the value fits in
/// 16 bits, as a half-word plus one full word (48 bits) otherwise.
///
pub fn push_lct_header(data: &mut Vec<u8>, tsi: u64, toi: u64, codepoint: u8, close_object: bool) {
    debug_assert!(tsi <= TSI_MAX);
    debug_assert!(toi <= TOI_MAX);

    let s: u32 = (tsi > 0xFFFF) as u32;
    let o: u32 = (toi > 0xFFFF) as u32;
    let h: u32 = 1;
    let b: u32 = close_object as u32;
    let v: u32 = 1;

    // base header + CCI + TSI/TOI words
    let hdr_len: u32 = 3 + s + o;

    let header: u32 = codepoint as u32
        | (hdr_len << 8)
        | (b << 16)
        | (h << 20)
        | (o << 21)
        | (s << 23)
        | (v << 28);
    data.extend(header.to_be_bytes());

    // CCI = 0
    data.extend(0u32.to_be_bytes());

    let tsi_net = tsi.to_be_bytes();
    data.extend(&tsi_net[tsi_net.len() - ((s << 2) + (h << 1)) as usize..]);

    let toi_net = toi.to_be_bytes();
    data.extend(&toi_net[toi_net.len() - ((o << 2) + (h << 1)) as usize..]);
}

/// Account `val` extra 32-bit words of header extensions in HDR_LEN
pub fn inc_hdr_len(data: &mut Vec<u8>, val: u8) {
    data[2] += val;
}

pub fn parse_lct_header(data: &[u8]) -> Result<LctHeader> {
    if data.len() < 4 {
        return Err(FluteError::MalformedPacket(
            "packet shorter than the LCT base header".to_owned(),
        ));
    }

    let flags1 = data[0];
    let flags2 = data[1];
    let len = (data[2] as usize) << 2;
    let cp = data[3];

    if len < 4 || len > data.len() {
        return Err(FluteError::MalformedPacket(format!(
            "LCT header length is {} whereas the packet length is {}",
            len,
            data.len()
        )));
    }

    let version = flags1 >> 4;
    if version != 1 {
        return Err(FluteError::MalformedPacket(format!(
            "LCT version {} is not supported",
            version
        )));
    }

    let c = (flags1 >> 2) & 0x3;
    let s = (flags2 >> 7) & 0x1;
    let o = (flags2 >> 5) & 0x3;
    let h = (flags2 >> 4) & 0x1;
    let a = (flags2 >> 1) & 0x1;
    let b = flags2 & 0x1;

    let cci_len = ((c as usize) + 1) << 2;
    let tsi_len = ((s as usize) << 2) + ((h as usize) << 1);
    let toi_len = ((o as usize) << 2) + ((h as usize) << 1);

    if tsi_len == 0 {
        return Err(FluteError::MalformedPacket("TSI field not present".to_owned()));
    }

    if toi_len == 0 {
        return Err(FluteError::MalformedPacket("TOI field not present".to_owned()));
    }

    if toi_len > 6 {
        return Err(FluteError::MalformedPacket(
            "TOI fields over 48 bits in length are not supported".to_owned(),
        ));
    }

    let cci_to = 4 + cci_len;
    let tsi_to = cci_to + tsi_len;
    let toi_to = tsi_to + toi_len;
    if toi_to > len {
        return Err(FluteError::MalformedPacket(format!(
            "TOI ends at offset {} whereas the LCT header length is {}",
            toi_to, len
        )));
    }

    // Only CCI = 0 is in use, accept wider fields as long as they are zero
    if data[4..cci_to].iter().any(|&byte| byte != 0) {
        return Err(FluteError::MalformedPacket(
            "non-zero congestion control information".to_owned(),
        ));
    }

    let mut tsi: [u8; 8] = [0; 8];
    let mut toi: [u8; 8] = [0; 8];
    tsi[8 - tsi_len..].copy_from_slice(&data[cci_to..tsi_to]);
    toi[8 - toi_len..].copy_from_slice(&data[tsi_to..toi_to]);

    Ok(LctHeader {
        len,
        tsi: u64::from_be_bytes(tsi),
        toi: u64::from_be_bytes(toi),
        cp,
        close_object: b != 0,
        close_session: a != 0,
        header_ext_offset: toi_to,
    })
}

///
/// Find a header extension inside the LCT header.
///
/// `HET < 128` is a variable length extension, its second byte carries the
/// length in 32-bit words including HET and HEL. `HET >= 128` is a fixed
/// 32-bit record.
///
pub fn get_ext<'a>(data: &'a [u8], lct: &LctHeader, ext: Ext) -> Result<Option<&'a [u8]>> {
    let mut exts = &data[lct.header_ext_offset..lct.len];
    while exts.len() >= 4 {
        let het = exts[0];
        let hel = match het {
            het if het >= 128 => 4usize,
            _ => (exts[1] as usize) << 2,
        };

        if hel == 0 || hel > exts.len() {
            return Err(FluteError::MalformedPacket(format!(
                "extension HET={} claims {} octets, {} left in header",
                het,
                hel,
                exts.len()
            )));
        }

        if het == ext as u8 {
            return Ok(Some(&exts[..hel]));
        }
        exts = &exts[hel..];
    }

    Ok(None)
}
