use crate::common::oti::{FecOti, FecScheme};
use crate::tools::error::{FluteError, Result};
use serde::{Deserialize, Serialize};

const MBMS2007_XMLNS: &str = "urn:3GPP:metadata:2007:MBMS:FLUTE:FDT";

/// FDT instance ids are carried in the low 20 bits of EXT_FDT
const FDT_INSTANCE_ID_MASK: u32 = 0xFFFFF;

///
/// Serde model of one `FDT-Instance` document
///
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct FdtInstance {
    #[serde(rename = "@Expires")]
    pub expires: String,
    #[serde(
        rename = "@FEC-OTI-FEC-Encoding-ID",
        skip_serializing_if = "Option::is_none"
    )]
    pub fec_oti_fec_encoding_id: Option<u8>,
    #[serde(
        rename = "@FEC-OTI-Maximum-Source-Block-Length",
        skip_serializing_if = "Option::is_none"
    )]
    pub fec_oti_maximum_source_block_length: Option<u32>,
    #[serde(
        rename = "@FEC-OTI-Encoding-Symbol-Length",
        skip_serializing_if = "Option::is_none"
    )]
    pub fec_oti_encoding_symbol_length: Option<u32>,
    #[serde(rename = "@xmlns:mbms2007", skip_serializing_if = "Option::is_none")]
    pub xmlns_mbms2007: Option<String>,
    #[serde(rename = "File", default)]
    pub files: Vec<FdtFile>,
}

///
/// Serde model of one `File` row of an FDT instance
///
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct FdtFile {
    #[serde(rename = "@TOI")]
    pub toi: u64,
    #[serde(rename = "@Content-Location")]
    pub content_location: String,
    #[serde(rename = "@Content-Length", skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(rename = "@Transfer-Length", skip_serializing_if = "Option::is_none")]
    pub transfer_length: Option<u64>,
    #[serde(rename = "@Content-MD5", skip_serializing_if = "Option::is_none")]
    pub content_md5: Option<String>,
    #[serde(rename = "@Content-Type", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(
        rename = "@FEC-OTI-FEC-Encoding-ID",
        skip_serializing_if = "Option::is_none"
    )]
    pub fec_oti_fec_encoding_id: Option<u8>,
    #[serde(
        rename = "@FEC-OTI-Maximum-Source-Block-Length",
        skip_serializing_if = "Option::is_none"
    )]
    pub fec_oti_maximum_source_block_length: Option<u32>,
    #[serde(
        rename = "@FEC-OTI-Encoding-Symbol-Length",
        skip_serializing_if = "Option::is_none"
    )]
    pub fec_oti_encoding_symbol_length: Option<u32>,
    #[serde(
        rename = "@FEC-OTI-Number-Of-Source-Blocks",
        skip_serializing_if = "Option::is_none"
    )]
    pub fec_oti_number_of_source_blocks: Option<u32>,
    #[serde(
        rename = "@FEC-OTI-Number-Of-Sub-Blocks",
        skip_serializing_if = "Option::is_none"
    )]
    pub fec_oti_number_of_sub_blocks: Option<u32>,
    #[serde(
        rename = "@FEC-OTI-Symbol-Alignment-Parameter",
        skip_serializing_if = "Option::is_none"
    )]
    pub fec_oti_symbol_alignment_parameter: Option<u32>,
    #[serde(
        rename = "mbms2007:Cache-Control",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_control: Option<CacheControl>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct CacheControl {
    #[serde(rename = "mbms2007:Expires")]
    pub expires: CacheControlExpires,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct CacheControlExpires {
    #[serde(rename = "$text")]
    pub value: String,
}

///
/// Resolved metadata of one file in transit
///
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub toi: u64,
    pub content_location: String,
    pub content_length: u64,
    /// Base64 of the 16-byte MD5 digest, empty when integrity is not checked
    pub content_md5: String,
    pub content_type: String,
    /// Expiry stamp from `mbms2007:Cache-Control`, epoch seconds
    pub expires: u64,
    pub fec_oti: FecOti,
}

impl FileEntry {
    /// Wire row for this entry, without scheme specific attributes
    pub fn to_fdt_file(&self) -> FdtFile {
        FdtFile {
            toi: self.toi,
            content_location: self.content_location.clone(),
            content_length: Some(self.content_length),
            transfer_length: Some(self.fec_oti.transfer_length),
            content_md5: Some(self.content_md5.clone()),
            content_type: Some(self.content_type.clone()),
            fec_oti_fec_encoding_id: None,
            fec_oti_maximum_source_block_length: None,
            fec_oti_encoding_symbol_length: None,
            fec_oti_number_of_source_blocks: None,
            fec_oti_number_of_sub_blocks: None,
            fec_oti_symbol_alignment_parameter: None,
            cache_control: Some(CacheControl {
                expires: CacheControlExpires {
                    value: self.expires.to_string(),
                },
            }),
        }
    }
}

///
/// The File Delivery Table of one session.
///
/// Every mutation of the file list bumps the instance id so receivers can
/// tell FDT generations apart.
///
#[derive(Debug, Clone)]
pub struct FileDeliveryTable {
    instance_id: u32,
    expires: u64,
    default_fec_encoding_id: Option<u8>,
    default_max_source_block_length: Option<u32>,
    default_encoding_symbol_length: Option<u32>,
    files: Vec<FdtFile>,
}

impl FileDeliveryTable {
    pub fn new(instance_id: u32, fec_oti: &FecOti) -> Self {
        FileDeliveryTable {
            instance_id: instance_id & FDT_INSTANCE_ID_MASK,
            expires: 0,
            default_fec_encoding_id: Some(fec_oti.encoding_id as u8),
            default_max_source_block_length: Some(fec_oti.max_source_block_length),
            default_encoding_symbol_length: Some(fec_oti.encoding_symbol_length),
            files: Vec::new(),
        }
    }

    /// Re-build a table from a received FDT instance document
    pub fn parse(instance_id: u32, buffer: &[u8]) -> Result<Self> {
        let content = std::str::from_utf8(buffer)
            .map_err(|_| FluteError::Decode("FDT is not valid UTF-8".to_owned()))?;
        let instance: FdtInstance = quick_xml::de::from_str(content)
            .map_err(|e| FluteError::Decode(format!("fail to parse FDT: {}", e)))?;

        let expires = instance
            .expires
            .parse::<u64>()
            .map_err(|_| FluteError::Decode("invalid Expires attribute".to_owned()))?;

        Ok(FileDeliveryTable {
            instance_id: instance_id & FDT_INSTANCE_ID_MASK,
            expires,
            default_fec_encoding_id: instance.fec_oti_fec_encoding_id,
            default_max_source_block_length: instance.fec_oti_maximum_source_block_length,
            default_encoding_symbol_length: instance.fec_oti_encoding_symbol_length,
            files: instance.files,
        })
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn set_expires(&mut self, expires: u64) {
        self.expires = expires;
    }

    pub fn expires(&self) -> u64 {
        self.expires
    }

    /// Append a row and bump the instance id
    pub fn add(&mut self, file: FdtFile) {
        self.files.push(file);
        self.bump();
    }

    /// Erase every row with this TOI and bump the instance id
    pub fn remove(&mut self, toi: u64) {
        self.files.retain(|f| f.toi != toi);
        self.bump();
    }

    fn bump(&mut self) {
        self.instance_id = (self.instance_id + 1) & FDT_INSTANCE_ID_MASK;
    }

    pub fn files(&self) -> &[FdtFile] {
        &self.files
    }

    /// Resolve every row into a [`FileEntry`], inheriting absent per-file
    /// OTI attributes from the instance defaults
    pub fn file_entries(&self) -> Result<Vec<FileEntry>> {
        self.files.iter().map(|f| self.resolve_entry(f)).collect()
    }

    pub fn resolve_entry(&self, file: &FdtFile) -> Result<FileEntry> {
        let encoding_id = file
            .fec_oti_fec_encoding_id
            .or(self.default_fec_encoding_id)
            .unwrap_or(FecScheme::CompactNoCode as u8);
        let encoding_id: FecScheme = encoding_id.try_into().map_err(|_| {
            FluteError::Config(format!("FEC encoding id {} is not supported", encoding_id))
        })?;

        let encoding_symbol_length = file
            .fec_oti_encoding_symbol_length
            .or(self.default_encoding_symbol_length)
            .ok_or_else(|| {
                FluteError::Config("missing FEC-OTI-Encoding-Symbol-Length attribute".to_owned())
            })?;

        let max_source_block_length = file
            .fec_oti_maximum_source_block_length
            .or(self.default_max_source_block_length)
            .ok_or_else(|| {
                FluteError::Config(
                    "missing FEC-OTI-Maximum-Source-Block-Length attribute".to_owned(),
                )
            })?;

        let content_length = file.content_length.unwrap_or_default();
        let transfer_length = file.transfer_length.unwrap_or(content_length);

        let expires = file
            .cache_control
            .as_ref()
            .and_then(|cc| cc.expires.value.parse::<u64>().ok())
            .unwrap_or_default();

        Ok(FileEntry {
            toi: file.toi,
            content_location: file.content_location.clone(),
            content_length,
            content_md5: file.content_md5.clone().unwrap_or_default(),
            content_type: file.content_type.clone().unwrap_or_default(),
            expires,
            fec_oti: FecOti::new(
                encoding_id,
                transfer_length,
                encoding_symbol_length,
                max_source_block_length,
            )?,
        })
    }

    /// Serialize the table as an UTF-8 XML document
    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let instance = FdtInstance {
            expires: self.expires.to_string(),
            fec_oti_fec_encoding_id: self.default_fec_encoding_id,
            fec_oti_maximum_source_block_length: self.default_max_source_block_length,
            fec_oti_encoding_symbol_length: self.default_encoding_symbol_length,
            xmlns_mbms2007: Some(MBMS2007_XMLNS.to_owned()),
            files: self.files.clone(),
        };

        let mut content = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let ser = quick_xml::se::Serializer::with_root(&mut content, Some("FDT-Instance"))
            .map_err(|e| FluteError::Decode(e.to_string()))?;
        instance
            .serialize(ser)
            .map_err(|e| FluteError::Decode(e.to_string()))?;

        Ok(content.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oti() -> FecOti {
        FecOti::new(FecScheme::CompactNoCode, 0, 1428, 64).unwrap()
    }

    fn entry(toi: u64, location: &str) -> FileEntry {
        FileEntry {
            toi,
            content_location: location.to_owned(),
            content_length: 11,
            content_md5: "q0dPVnS1eHmwCC+mFYhrnQ==".to_owned(),
            content_type: "text/plain".to_owned(),
            expires: 1_700_000_000,
            fec_oti: FecOti::new(FecScheme::CompactNoCode, 11, 1428, 64).unwrap(),
        }
    }

    #[test]
    pub fn test_fdt_xml_roundtrip() {
        crate::tests::init();
        let mut fdt = FileDeliveryTable::new(1, &oti());
        fdt.set_expires(1_700_000_042);
        fdt.add(entry(2, "file:///hello.txt").to_fdt_file());

        let xml = fdt.to_xml().unwrap();
        let content = String::from_utf8(xml.clone()).unwrap();
        log::info!("content={}", content);
        assert!(content.starts_with("<?xml"));
        assert!(content.contains("urn:3GPP:metadata:2007:MBMS:FLUTE:FDT"));

        let parsed = FileDeliveryTable::parse(fdt.instance_id(), &xml).unwrap();
        assert_eq!(parsed.expires(), 1_700_000_042);
        let entries = parsed.file_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], entry(2, "file:///hello.txt"));

        // parse of serialize is a fixed point
        let again = parsed.to_xml().unwrap();
        assert_eq!(xml, again);
    }

    #[test]
    pub fn test_fdt_instance_id_bumps() {
        crate::tests::init();
        let mut fdt = FileDeliveryTable::new(1, &oti());
        assert_eq!(fdt.instance_id(), 1);
        fdt.add(entry(2, "file:///a").to_fdt_file());
        assert_eq!(fdt.instance_id(), 2);
        fdt.add(entry(3, "file:///b").to_fdt_file());
        assert_eq!(fdt.instance_id(), 3);
        fdt.remove(2);
        assert_eq!(fdt.instance_id(), 4);
        assert_eq!(fdt.files().len(), 1);
    }

    #[test]
    pub fn test_fdt_oti_inheritance() {
        crate::tests::init();
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <FDT-Instance Expires="123" FEC-OTI-FEC-Encoding-ID="0"
                FEC-OTI-Maximum-Source-Block-Length="64"
                FEC-OTI-Encoding-Symbol-Length="1428"
                xmlns:mbms2007="urn:3GPP:metadata:2007:MBMS:FLUTE:FDT">
                <File TOI="5" Content-Location="f" Content-Length="100"/>
            </FDT-Instance>"#;
        let fdt = FileDeliveryTable::parse(9, xml.as_bytes()).unwrap();
        let entries = fdt.file_entries().unwrap();
        assert_eq!(entries[0].fec_oti.encoding_symbol_length, 1428);
        assert_eq!(entries[0].fec_oti.max_source_block_length, 64);
        // Transfer-Length defaults to Content-Length
        assert_eq!(entries[0].fec_oti.transfer_length, 100);
        assert_eq!(entries[0].content_md5, "");
    }

    #[test]
    pub fn test_fdt_missing_required_attributes() {
        crate::tests::init();
        let no_toi = r#"<FDT-Instance Expires="1"><File Content-Location="f"/></FDT-Instance>"#;
        assert!(FileDeliveryTable::parse(1, no_toi.as_bytes()).is_err());

        let no_location = r#"<FDT-Instance Expires="1"><File TOI="2"/></FDT-Instance>"#;
        assert!(FileDeliveryTable::parse(1, no_location.as_bytes()).is_err());

        let no_oti = r#"<FDT-Instance Expires="1"><File TOI="2" Content-Location="f"/></FDT-Instance>"#;
        let fdt = FileDeliveryTable::parse(1, no_oti.as_bytes()).unwrap();
        assert!(fdt.file_entries().is_err());
    }
}
