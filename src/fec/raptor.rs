use super::FecTransformer;
use crate::common::oti::RAPTOR_SYMBOL_ALIGNMENT;
use crate::common::partition::Partitioning;
use crate::fdt::FdtFile;
use crate::object::{SourceBlock, Symbol, SymbolData};
use crate::tools::error::{FluteError, Result};
use std::collections::BTreeMap;

/// Transmission overhead, protects against roughly 15% packet loss
const SURPLUS_SYMBOL_RATIO: f64 = 1.15;

/// Target sub-block size W, large enough to keep N = 1 with ethernet MTUs
const SUB_BLOCK_TARGET: u64 = 16 * 1024 * 1024;

/// A Raptor source block holds at most 8192 symbols
const MAX_SYMBOLS_PER_BLOCK: u64 = 8192;

/// At most G = 10 symbols are packed into one packet
const MAX_SYMBOLS_PER_PACKET: u64 = 10;

struct BlockDecoder {
    decoder: raptor_code::SourceBlockDecoder,
    nof_source_symbols: u32,
    data: Option<Vec<u8>>,
}

impl std::fmt::Debug for BlockDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDecoder")
            .field("nof_source_symbols", &self.nof_source_symbols)
            .field("decoded", &self.data.is_some())
            .finish()
    }
}

///
/// Raptor FEC scheme (RFC 5053).
///
/// Partitioning follows RFC 5053 §4.2: G symbols per packet, symbol size T
/// aligned to Al=4, Z source blocks of K symbols with a short trailing
/// block. The sender emits `ceil(K * 1.15)` fountain symbols per block, at
/// least one of them a repair symbol. OTI parameters travel as FDT
/// attributes, never in EXT_FTI.
///
#[derive(Debug)]
pub struct RaptorFec {
    is_encoder: bool,
    /// F, object size in octets
    transfer_length: u64,
    /// Al, symbol alignment
    symbol_alignment: u32,
    /// T, symbol size in octets
    symbol_size: u32,
    /// Z, number of source blocks
    nof_source_blocks: u32,
    /// N, number of sub-blocks per source block
    nof_sub_blocks: u32,
    /// K, symbols per source block
    symbols_per_block: u32,
    /// Kt, total number of source symbols
    total_symbols: u64,
    decoders: BTreeMap<u16, BlockDecoder>,
}

impl RaptorFec {
    /// Derive the transmission parameters for an object of
    /// `transfer_length` octets and a `max_payload` octets packet budget
    pub fn for_sender(transfer_length: u64, max_payload: u32) -> Result<Self> {
        if transfer_length == 0 {
            return Err(FluteError::Config(
                "Raptor cannot encode an empty object".to_owned(),
            ));
        }

        let al = RAPTOR_SYMBOL_ALIGNMENT;
        let p = max_payload as u64;

        let mut g = std::cmp::min(
            std::cmp::min(
                num_integer::div_ceil(p * 1024, transfer_length),
                p / al as u64,
            ),
            MAX_SYMBOLS_PER_PACKET,
        );
        if g == 0 {
            g = 1;
        }

        let symbol_size = (max_payload / (al * g as u32)) * al;
        if symbol_size == 0 {
            return Err(FluteError::Config(format!(
                "payload budget {} is too small for Al={}",
                max_payload, al
            )));
        }

        let total_symbols = num_integer::div_ceil(transfer_length, symbol_size as u64);
        if total_symbols < 4 {
            return Err(FluteError::Config(
                "object is too small, Raptor needs at least 4 symbols".to_owned(),
            ));
        }

        let nof_source_blocks = num_integer::div_ceil(total_symbols, MAX_SYMBOLS_PER_BLOCK) as u32;
        let symbols_per_block = std::cmp::min(total_symbols, MAX_SYMBOLS_PER_BLOCK) as u32;

        let nof_sub_blocks = std::cmp::min(
            num_integer::div_ceil(
                num_integer::div_ceil(total_symbols, nof_source_blocks as u64)
                    * symbol_size as u64,
                SUB_BLOCK_TARGET,
            ),
            (symbol_size / al) as u64,
        ) as u32;

        Ok(RaptorFec {
            is_encoder: true,
            transfer_length,
            symbol_alignment: al,
            symbol_size,
            nof_source_blocks,
            nof_sub_blocks,
            symbols_per_block,
            total_symbols,
            decoders: BTreeMap::new(),
        })
    }

    /// Recover the transmission parameters from an FDT row
    pub fn parse_fdt_info(file: &FdtFile) -> Result<Self> {
        let transfer_length = file
            .transfer_length
            .ok_or_else(|| FluteError::Config("Transfer-Length attribute is missing".to_owned()))?;
        let nof_source_blocks = file.fec_oti_number_of_source_blocks.ok_or_else(|| {
            FluteError::Config("FEC-OTI-Number-Of-Source-Blocks attribute is missing".to_owned())
        })?;
        let nof_sub_blocks = file.fec_oti_number_of_sub_blocks.ok_or_else(|| {
            FluteError::Config("FEC-OTI-Number-Of-Sub-Blocks attribute is missing".to_owned())
        })?;
        let symbol_size = file.fec_oti_encoding_symbol_length.ok_or_else(|| {
            FluteError::Config("FEC-OTI-Encoding-Symbol-Length attribute is missing".to_owned())
        })?;
        let symbol_alignment = file.fec_oti_symbol_alignment_parameter.ok_or_else(|| {
            FluteError::Config(
                "FEC-OTI-Symbol-Alignment-Parameter attribute is missing".to_owned(),
            )
        })?;

        if symbol_alignment == 0 || symbol_size % symbol_alignment != 0 {
            return Err(FluteError::Config(format!(
                "symbol size {} is not a multiple of Al={}",
                symbol_size, symbol_alignment
            )));
        }

        if nof_source_blocks == 0 || transfer_length == 0 {
            return Err(FluteError::Config(
                "invalid Raptor parameters in the FDT".to_owned(),
            ));
        }

        let total_symbols = num_integer::div_ceil(transfer_length, symbol_size as u64);
        let symbols_per_block = std::cmp::min(total_symbols, MAX_SYMBOLS_PER_BLOCK) as u32;

        Ok(RaptorFec {
            is_encoder: false,
            transfer_length,
            symbol_alignment,
            symbol_size,
            nof_source_blocks,
            nof_sub_blocks,
            symbols_per_block,
            total_symbols,
            decoders: BTreeMap::new(),
        })
    }

    /// T, the derived symbol size
    pub fn symbol_size(&self) -> u32 {
        self.symbol_size
    }

    /// K, symbols per source block
    pub fn symbols_per_block(&self) -> u32 {
        self.symbols_per_block
    }

    /// Number of source symbols of block `sbn`, the trailing block is short
    fn nof_block_symbols(&self, sbn: u16) -> u32 {
        let z = self.nof_source_blocks as u64;
        let k = self.symbols_per_block as u64;
        match (sbn as u64) < z - 1 {
            true => self.symbols_per_block,
            false => (self.total_symbols - k * (z - 1)) as u32,
        }
    }

    /// Size of block `sbn` in octets, without padding
    fn block_size(&self, sbn: u16) -> usize {
        let z = self.nof_source_blocks as u64;
        let k = self.symbols_per_block as u64;
        let t = self.symbol_size as u64;
        match (sbn as u64) < z - 1 {
            true => (k * t) as usize,
            false => (self.transfer_length - k * t * (z - 1)) as usize,
        }
    }

    /// Number of encoding symbols transmitted for block `sbn`, always at
    /// least one repair symbol on top of the source symbols
    fn target_k(&self, sbn: u16) -> u32 {
        let k = self.nof_block_symbols(sbn);
        let target = (k as f64 * SURPLUS_SYMBOL_RATIO).ceil() as u32;
        std::cmp::max(target, k + 1)
    }

    fn create_encoder_blocks(&self, buffer: &[u8]) -> BTreeMap<u16, SourceBlock> {
        let mut blocks = BTreeMap::new();
        let t = self.symbol_size as usize;

        for sbn in 0..self.nof_source_blocks as u16 {
            let nof_symbols = self.nof_block_symbols(sbn) as usize;
            let size = self.block_size(sbn);
            let offset = sbn as usize * self.symbols_per_block as usize * t;

            // encode over a zero-padded block so every symbol is exactly T
            let mut padded = vec![0u8; nof_symbols * t];
            padded[..size].copy_from_slice(&buffer[offset..offset + size]);
            let mut encoder = raptor_code::SourceBlockEncoder::new(&padded, nof_symbols);

            let target = self.target_k(sbn);
            let mut symbols = BTreeMap::new();
            for esi in 0..target {
                let mut data = encoder.fountain(esi);
                data.resize(t, 0);
                symbols.insert(
                    esi as u16,
                    Symbol {
                        data: SymbolData::Owned(data),
                        length: t,
                        complete: false,
                        queued: false,
                    },
                );
            }

            blocks.insert(
                sbn,
                SourceBlock {
                    id: sbn,
                    complete: false,
                    nof_symbols: target as usize,
                    symbols,
                },
            );
        }
        blocks
    }

    fn create_decoder_blocks(&self) -> BTreeMap<u16, SourceBlock> {
        (0..self.nof_source_blocks as u16)
            .map(|sbn| {
                (
                    sbn,
                    SourceBlock {
                        id: sbn,
                        complete: false,
                        nof_symbols: self.target_k(sbn) as usize,
                        symbols: BTreeMap::new(),
                    },
                )
            })
            .collect()
    }
}

impl FecTransformer for RaptorFec {
    fn calculate_partitioning(&self) -> Partitioning {
        let z = self.nof_source_blocks as u64;
        Partitioning {
            nof_source_symbols: self.total_symbols,
            nof_source_blocks: z,
            large_block_length: self.symbols_per_block as u64,
            small_block_length: self.nof_block_symbols((z - 1) as u16) as u64,
            nof_large_blocks: z - 1,
        }
    }

    fn create_blocks(&mut self, buffer: &[u8]) -> Result<BTreeMap<u16, SourceBlock>> {
        if self.nof_sub_blocks != 1 {
            return Err(FluteError::Config(format!(
                "only 1 sub-block per source block is supported, N={}",
                self.nof_sub_blocks
            )));
        }

        match self.is_encoder {
            true => Ok(self.create_encoder_blocks(buffer)),
            false => Ok(self.create_decoder_blocks()),
        }
    }

    fn process_symbol(&mut self, sbn: u16, esi: u16, data: &[u8]) -> Result<()> {
        if data.len() != self.symbol_size as usize {
            return Err(FluteError::Decode(format!(
                "symbol length {} does not match T={}",
                data.len(),
                self.symbol_size
            )));
        }

        let nof_source_symbols = self.nof_block_symbols(sbn);
        let block = self.decoders.entry(sbn).or_insert_with(|| BlockDecoder {
            decoder: raptor_code::SourceBlockDecoder::new(nof_source_symbols as usize),
            nof_source_symbols,
            data: None,
        });

        if block.data.is_some() {
            log::debug!("skip symbol {} for finished block {}", esi, sbn);
            return Ok(());
        }

        block.decoder.push_encoding_symbol(data, esi as u32);
        Ok(())
    }

    fn check_block_completion(&mut self, block: &SourceBlock) -> bool {
        if self.is_encoder {
            return block.symbols.values().all(|symbol| symbol.complete);
        }

        let t = self.symbol_size as usize;
        match self.decoders.get_mut(&block.id) {
            Some(decoder) => {
                if decoder.data.is_none() && decoder.decoder.fully_specified() {
                    let padded_size = decoder.nof_source_symbols as usize * t;
                    decoder.data = decoder.decoder.decode(padded_size);
                }
                decoder.data.is_some()
            }
            None => false,
        }
    }

    fn allocate_buffer(&self, min_length: usize) -> Vec<u8> {
        let size = self.nof_source_blocks as usize
            * self.target_k(0) as usize
            * self.symbol_size as usize;
        debug_assert!(min_length <= size);
        vec![0; std::cmp::max(size, min_length)]
    }

    fn extract_file(&mut self, buffer: &mut [u8]) -> Result<()> {
        if self.is_encoder {
            return Ok(());
        }

        let k = self.symbols_per_block as usize;
        let t = self.symbol_size as usize;
        for (sbn, decoder) in &self.decoders {
            let data = match decoder.data.as_ref() {
                Some(data) => data,
                None => continue,
            };
            let offset = *sbn as usize * k * t;
            let size = self.block_size(*sbn);
            buffer[offset..offset + size].copy_from_slice(&data[..size]);
        }
        Ok(())
    }

    fn add_fdt_info(&self, file: &mut FdtFile) {
        file.fec_oti_fec_encoding_id = Some(crate::common::oti::FecScheme::Raptor as u8);
        file.fec_oti_encoding_symbol_length = Some(self.symbol_size);
        file.fec_oti_symbol_alignment_parameter = Some(self.symbol_alignment);
        file.fec_oti_number_of_source_blocks = Some(self.nof_source_blocks);
        file.fec_oti_number_of_sub_blocks = Some(self.nof_sub_blocks);
    }

    fn reset(&mut self) {
        self.decoders.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdt::{CacheControl, CacheControlExpires};

    fn fdt_row(transfer_length: u64) -> FdtFile {
        FdtFile {
            toi: 2,
            content_location: "file:///raptor.bin".to_owned(),
            content_length: Some(transfer_length),
            transfer_length: Some(transfer_length),
            content_md5: None,
            content_type: None,
            fec_oti_fec_encoding_id: None,
            fec_oti_maximum_source_block_length: None,
            fec_oti_encoding_symbol_length: None,
            fec_oti_number_of_source_blocks: None,
            fec_oti_number_of_sub_blocks: None,
            fec_oti_symbol_alignment_parameter: None,
            cache_control: Some(CacheControl {
                expires: CacheControlExpires {
                    value: "0".to_owned(),
                },
            }),
        }
    }

    #[test]
    pub fn test_raptor_partitioning() {
        crate::tests::init();
        let fec = RaptorFec::for_sender(600, 1428).unwrap();
        assert_eq!(fec.symbol_size % RAPTOR_SYMBOL_ALIGNMENT, 0);
        let p = fec.calculate_partitioning();
        assert_eq!(p.nof_source_blocks, 1);
        assert_eq!(
            p.nof_source_symbols,
            num_integer::div_ceil(600, fec.symbol_size as u64)
        );
        assert!(fec.target_k(0) > fec.nof_block_symbols(0));
    }

    #[test]
    pub fn test_raptor_reject_small_object() {
        crate::tests::init();
        // fewer than 4 symbols
        assert!(RaptorFec::for_sender(100, 1428).is_err());
        assert!(RaptorFec::for_sender(0, 1428).is_err());
    }

    #[test]
    pub fn test_raptor_minimum_object() {
        crate::tests::init();
        let fec = RaptorFec::for_sender(4 * 140, 1428).unwrap();
        assert_eq!(fec.total_symbols, 4);
    }

    #[test]
    pub fn test_raptor_encode_decode_roundtrip() {
        crate::tests::init();
        let mut content = Vec::new();
        for i in 0..600u32 {
            content.push((i % 251) as u8);
        }

        let mut encoder = RaptorFec::for_sender(content.len() as u64, 1428).unwrap();
        let blocks = encoder.create_blocks(&content).unwrap();
        assert_eq!(blocks.len(), 1);

        let mut row = fdt_row(content.len() as u64);
        encoder.add_fdt_info(&mut row);
        assert_eq!(row.fec_oti_fec_encoding_id, Some(1));

        let mut decoder = RaptorFec::parse_fdt_info(&row).unwrap();
        let mut rx_blocks = decoder.create_blocks(&[]).unwrap();

        for (sbn, block) in &blocks {
            for (esi, symbol) in &block.symbols {
                let data = match &symbol.data {
                    SymbolData::Owned(data) => data,
                    _ => panic!("sender symbols own their buffers"),
                };
                decoder.process_symbol(*sbn, *esi, data).unwrap();
            }
        }

        let block = rx_blocks.get_mut(&0).unwrap();
        assert!(decoder.check_block_completion(block));

        let mut buffer = decoder.allocate_buffer(content.len());
        decoder.extract_file(&mut buffer).unwrap();
        assert_eq!(&buffer[..content.len()], &content[..]);
    }

    #[test]
    pub fn test_raptor_fdt_info_required() {
        crate::tests::init();
        let row = fdt_row(600);
        // scheme specific attributes absent
        assert!(RaptorFec::parse_fdt_info(&row).is_err());
    }
}
