use crate::common::oti::FecOti;
use crate::common::partition::{self, Partitioning};
use crate::common::symbol::{self, EncodingSymbol};
use crate::fdt::{FdtFile, FileEntry};
use crate::fec::{self, FecTransformer};
use crate::tools::error::{FluteError, Result};
use base64::Engine;
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Backing storage of one encoding symbol
#[derive(Debug)]
pub enum SymbolData {
    /// Window into the object buffer at this byte offset
    View { offset: usize },
    /// Encoder produced symbol owned by its source block
    Owned(Vec<u8>),
    /// Symbol bytes are held by the FEC decoder until extraction
    Detached,
}

///
/// One encoding symbol slot.
///
/// `complete` means the symbol bytes are present and decoded, `queued` means
/// the symbol was handed to the pacer and awaits its send confirmation.
///
#[derive(Debug)]
pub struct Symbol {
    pub data: SymbolData,
    pub length: usize,
    pub complete: bool,
    pub queued: bool,
}

#[derive(Debug)]
pub struct SourceBlock {
    pub id: u16,
    pub complete: bool,
    /// Number of symbol slots of this block
    pub nof_symbols: usize,
    pub symbols: BTreeMap<u16, Symbol>,
}

///
/// One file in transit, on either side of the session.
///
/// The object owns a contiguous payload buffer. With Compact No-Code every
/// symbol is a window into that buffer; a FEC transformer owns its encoded
/// symbols instead and realizes the buffer on completion. While the object
/// is incomplete the buffer is written only by the reassembly path, once
/// complete it is read-only.
///
#[derive(Debug)]
pub struct FileObject {
    meta: FileEntry,
    buffer: Vec<u8>,
    partitioning: Partitioning,
    blocks: BTreeMap<u16, SourceBlock>,
    transformer: Option<Box<dyn FecTransformer>>,
    complete: bool,
    received_at: SystemTime,
    access_count: u32,
    fdt_instance_id: Option<u32>,
}

impl FileObject {
    ///
    /// Receiver side construction from an FDT entry.
    ///
    /// `row` is the FDT row the entry was resolved from, it carries the
    /// scheme specific attributes a FEC transformer needs. A zero length
    /// object has no source blocks and is complete from the start.
    ///
    pub fn from_entry(entry: FileEntry, row: Option<&FdtFile>) -> Result<Self> {
        log::debug!(
            "create object toi={} location={}",
            entry.toi,
            entry.content_location
        );
        let mut transformer = fec::new_decoder(entry.fec_oti.encoding_id, row)?;
        Self::new(entry, None, &mut transformer).map(|mut obj| {
            obj.transformer = transformer.take();
            obj
        })
    }

    ///
    /// Sender side construction from a payload buffer.
    ///
    /// Computes the MD5 digest of the content, derives the scheme specific
    /// transmission parameters and splits the buffer into source blocks of
    /// encoding symbols.
    ///
    pub fn from_buffer(
        toi: u64,
        fec_oti: &FecOti,
        content_location: &str,
        content_type: &str,
        expires: u64,
        data: Vec<u8>,
    ) -> Result<Self> {
        let mut fec_oti = *fec_oti;
        fec_oti.transfer_length = data.len() as u64;

        let (fec_oti, mut transformer) = fec::new_encoder(&fec_oti)?;

        let content_md5 =
            base64::engine::general_purpose::STANDARD.encode(md5::compute(&data).0);

        let entry = FileEntry {
            toi,
            content_location: content_location.to_owned(),
            content_length: data.len() as u64,
            content_md5,
            content_type: content_type.to_owned(),
            expires,
            fec_oti,
        };

        Self::new(entry, Some(data), &mut transformer).map(|mut obj| {
            obj.transformer = transformer.take();
            obj
        })
    }

    fn new(
        entry: FileEntry,
        content: Option<Vec<u8>>,
        transformer: &mut Option<Box<dyn FecTransformer>>,
    ) -> Result<Self> {
        let transfer_length = entry.fec_oti.transfer_length as usize;

        let buffer = match (content, transformer.as_ref()) {
            (Some(data), _) => data,
            (None, Some(fec)) => fec.allocate_buffer(transfer_length),
            (None, None) => vec![0; transfer_length],
        };

        let partitioning = match transformer.as_ref() {
            Some(fec) => fec.calculate_partitioning(),
            None => partition::block_partitioning(
                entry.fec_oti.max_source_block_length as u64,
                entry.fec_oti.transfer_length,
                entry.fec_oti.encoding_symbol_length as u64,
            ),
        };

        let blocks = match transformer.as_mut() {
            Some(fec) => fec.create_blocks(&buffer)?,
            None => Self::create_view_blocks(&partitioning, &entry.fec_oti),
        };

        let complete = blocks.is_empty();
        Ok(FileObject {
            meta: entry,
            buffer,
            partitioning,
            blocks,
            transformer: None,
            complete,
            received_at: SystemTime::now(),
            access_count: 0,
            fdt_instance_id: None,
        })
    }

    /// Default symbol layout, every symbol is a window into the buffer and
    /// only the very last one of the object may be short
    fn create_view_blocks(
        partitioning: &Partitioning,
        fec_oti: &FecOti,
    ) -> BTreeMap<u16, SourceBlock> {
        let symbol_length = fec_oti.encoding_symbol_length as usize;
        let mut blocks = BTreeMap::new();
        let mut offset = 0usize;
        let mut remaining = fec_oti.transfer_length as usize;
        let mut sbn: u16 = 0;

        while remaining > 0 {
            let block_length = partitioning.block_length(sbn as u64) as usize;
            let mut symbols = BTreeMap::new();
            for esi in 0..block_length {
                let length = std::cmp::min(remaining, symbol_length);
                symbols.insert(
                    esi as u16,
                    Symbol {
                        data: SymbolData::View { offset },
                        length,
                        complete: false,
                        queued: false,
                    },
                );
                offset += length;
                remaining -= length;
                if remaining == 0 {
                    break;
                }
            }
            blocks.insert(
                sbn,
                SourceBlock {
                    id: sbn,
                    complete: false,
                    nof_symbols: symbols.len(),
                    symbols,
                },
            );
            sbn += 1;
        }
        blocks
    }

    pub fn meta(&self) -> &FileEntry {
        &self.meta
    }

    /// Delivered content, the transfer-length prefix of the buffer
    pub fn content(&self) -> &[u8] {
        &self.buffer[..self.meta.fec_oti.transfer_length as usize]
    }

    pub fn complete(&self) -> bool {
        self.complete
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    pub fn access_count(&self) -> u32 {
        self.access_count
    }

    /// Record one external access to this object
    pub fn touch(&mut self) {
        self.access_count += 1;
    }

    pub fn fdt_instance_id(&self) -> Option<u32> {
        self.fdt_instance_id
    }

    pub fn set_fdt_instance_id(&mut self, id: u32) {
        self.fdt_instance_id = Some(id);
    }

    pub fn partitioning(&self) -> &Partitioning {
        &self.partitioning
    }

    /// FDT row for this object, including scheme specific attributes
    pub fn to_fdt_file(&self) -> FdtFile {
        let mut row = self.meta.to_fdt_file();
        if let Some(fec) = self.transformer.as_ref() {
            fec.add_fdt_info(&mut row);
        }
        row
    }

    ///
    /// Apply one received encoding symbol.
    ///
    /// Duplicates are dropped and idempotent. A symbol outside the object
    /// partitioning is an error, the caller drops the packet and keeps the
    /// session alive.
    ///
    pub fn put_symbol(&mut self, symbol: &EncodingSymbol) -> Result<()> {
        if self.complete {
            log::debug!(
                "drop symbol sbn={} esi={}, object toi={} is already complete",
                symbol.sbn,
                symbol.esi,
                self.meta.toi
            );
            return Ok(());
        }

        let block = self.blocks.get_mut(&symbol.sbn).ok_or_else(|| {
            FluteError::Decode(format!(
                "SBN {} is outside the {} blocks of TOI {}",
                symbol.sbn,
                self.partitioning.nof_source_blocks,
                self.meta.toi
            ))
        })?;

        if block.complete {
            log::debug!("drop symbol {}, block {} is complete", symbol.esi, block.id);
            return Ok(());
        }

        if symbol.esi as usize >= block.nof_symbols {
            return Err(FluteError::Decode(format!(
                "ESI {} is outside the {} symbols of block {}",
                symbol.esi, block.nof_symbols, block.id
            )));
        }

        match self.transformer.as_mut() {
            None => {
                let slot = block.symbols.get_mut(&symbol.esi).ok_or_else(|| {
                    FluteError::Decode(format!("no slot for ESI {}", symbol.esi))
                })?;
                if slot.complete {
                    return Ok(());
                }
                if symbol.data.len() != slot.length {
                    return Err(FluteError::Decode(format!(
                        "symbol length {} does not match the expected {}",
                        symbol.data.len(),
                        slot.length
                    )));
                }
                let offset = match slot.data {
                    SymbolData::View { offset } => offset,
                    _ => return Err(FluteError::Decode("symbol slot has no window".to_owned())),
                };
                self.buffer[offset..offset + slot.length].copy_from_slice(symbol.data);
                slot.complete = true;
            }
            Some(fec) => {
                if block
                    .symbols
                    .get(&symbol.esi)
                    .map(|slot| slot.complete)
                    .unwrap_or(false)
                {
                    return Ok(());
                }
                fec.process_symbol(symbol.sbn, symbol.esi, symbol.data)?;
                block.symbols.insert(
                    symbol.esi,
                    Symbol {
                        data: SymbolData::Detached,
                        length: symbol.data.len(),
                        complete: true,
                        queued: false,
                    },
                );
            }
        }

        block.complete = match self.transformer.as_mut() {
            Some(fec) => fec.check_block_completion(block),
            None => block.symbols.values().all(|slot| slot.complete),
        };

        if block.complete {
            log::debug!("block {} of toi {} is complete", symbol.sbn, self.meta.toi);
            self.check_file_completion()?;
        }

        Ok(())
    }

    ///
    /// Pull the next batch of symbols to transmit, at most
    /// `max_size / T` of them. The batch comes from a single source block
    /// and carries consecutive symbol ids so it can travel in one ALC
    /// packet. Pulled symbols are flagged `queued` until
    /// [`FileObject::mark_completed`] confirms or reverts them.
    ///
    pub fn get_next_symbols(&mut self, max_size: usize) -> Vec<(u16, u16)> {
        let symbol_length = self.meta.fec_oti.encoding_symbol_length as usize;
        let max_symbols = max_size / symbol_length;
        let mut batch: Vec<(u16, u16)> = Vec::new();

        for block in self.blocks.values_mut() {
            if block.complete {
                continue;
            }
            for (esi, slot) in block.symbols.iter_mut() {
                if batch.len() >= max_symbols {
                    break;
                }
                if slot.complete || slot.queued {
                    match batch.is_empty() {
                        true => continue,
                        false => break,
                    }
                }
                slot.queued = true;
                batch.push((block.id, *esi));
            }
            if !batch.is_empty() {
                break;
            }
        }
        batch
    }

    /// Serialize a pulled batch into an ALC payload
    pub fn encode_payload(&self, batch: &[(u16, u16)]) -> Vec<u8> {
        let symbols: Vec<EncodingSymbol> = batch
            .iter()
            .filter_map(|(sbn, esi)| {
                let slot = self.blocks.get(sbn)?.symbols.get(esi)?;
                let data = match &slot.data {
                    SymbolData::View { offset } => &self.buffer[*offset..*offset + slot.length],
                    SymbolData::Owned(data) => &data[..],
                    SymbolData::Detached => return None,
                };
                Some(EncodingSymbol {
                    sbn: *sbn,
                    esi: *esi,
                    data,
                })
            })
            .collect();
        symbol::to_payload(&symbols)
    }

    ///
    /// Confirm a transmitted batch. On failure the symbols are un-queued and
    /// a later pacer round picks them up again.
    ///
    pub fn mark_completed(&mut self, batch: &[(u16, u16)], success: bool) -> Result<()> {
        for (sbn, esi) in batch {
            if let Some(block) = self.blocks.get_mut(sbn) {
                if let Some(slot) = block.symbols.get_mut(esi) {
                    slot.queued = false;
                    slot.complete = success;
                }
                block.complete = match self.transformer.as_mut() {
                    Some(fec) => fec.check_block_completion(block),
                    None => block.symbols.values().all(|slot| slot.complete),
                };
            }
        }
        self.check_file_completion()
    }

    ///
    /// A file is complete when all its blocks are. If a transformer is
    /// present the decoded source symbols are realized into the buffer
    /// first. A digest mismatch resets every completion flag and reception
    /// starts over.
    ///
    fn check_file_completion(&mut self) -> Result<()> {
        self.complete = self.blocks.values().all(|block| block.complete);
        if !self.complete {
            return Ok(());
        }

        if let Some(fec) = self.transformer.as_mut() {
            fec.extract_file(&mut self.buffer)?;
        }

        if !self.meta.content_md5.is_empty() {
            let transfer_length = self.meta.fec_oti.transfer_length as usize;
            let digest = base64::engine::general_purpose::STANDARD
                .encode(md5::compute(&self.buffer[..transfer_length]).0);

            if digest != self.meta.content_md5 {
                log::error!(
                    "MD5 mismatch for TOI {}, discarding and receiving again",
                    self.meta.toi
                );
                let lazy_slots = self.transformer.is_some();
                for block in self.blocks.values_mut() {
                    block.complete = false;
                    match lazy_slots {
                        true => block.symbols.clear(),
                        false => block
                            .symbols
                            .values_mut()
                            .for_each(|slot| slot.complete = false),
                    }
                }
                if let Some(fec) = self.transformer.as_mut() {
                    fec.reset();
                }
                self.complete = false;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::oti::FecScheme;
    use crate::common::symbol::EncodingSymbol;

    fn oti() -> FecOti {
        FecOti::new(FecScheme::CompactNoCode, 0, 16, 4).unwrap()
    }

    fn sender_object(content: &[u8]) -> FileObject {
        FileObject::from_buffer(2, &oti(), "file:///obj", "text/plain", 0, content.to_vec())
            .unwrap()
    }

    fn receiver_object(sender: &FileObject) -> FileObject {
        FileObject::from_entry(sender.meta().clone(), None).unwrap()
    }

    fn transfer(tx: &mut FileObject, rx: &mut FileObject) {
        loop {
            let batch = tx.get_next_symbols(16);
            if batch.is_empty() {
                break;
            }
            let payload = tx.encode_payload(&batch);
            let symbols =
                symbol::from_payload(&payload, &tx.meta().fec_oti, crate::common::lct::Cenc::Null)
                    .unwrap();
            for s in &symbols {
                rx.put_symbol(s).unwrap();
            }
            tx.mark_completed(&batch, true).unwrap();
        }
    }

    #[test]
    pub fn test_object_roundtrip() {
        crate::tests::init();
        // 4 symbols of 16 bytes per block, 2 and a half blocks
        let content: Vec<u8> = (0..255u8).chain(0..255u8).take(16 * 9 + 5).collect();
        let mut tx = sender_object(&content);
        let mut rx = receiver_object(&tx);

        transfer(&mut tx, &mut rx);

        assert!(tx.complete());
        assert!(rx.complete());
        assert_eq!(rx.content(), &content[..]);
    }

    #[test]
    pub fn test_object_duplicate_symbols_idempotent() {
        crate::tests::init();
        let content = vec![0x42u8; 40];
        let mut tx = sender_object(&content);
        let mut rx = receiver_object(&tx);

        let batch = tx.get_next_symbols(16);
        let payload = tx.encode_payload(&batch);
        let symbols =
            symbol::from_payload(&payload, &tx.meta().fec_oti, crate::common::lct::Cenc::Null)
                .unwrap();
        for _ in 0..1000 {
            rx.put_symbol(&symbols[0]).unwrap();
        }
        assert!(!rx.complete());
    }

    #[test]
    pub fn test_object_rejects_out_of_range() {
        crate::tests::init();
        let content = vec![1u8; 32];
        let tx = sender_object(&content);
        let mut rx = receiver_object(&tx);

        let bad_sbn = EncodingSymbol { sbn: 9, esi: 0, data: &content[0..16] };
        assert!(rx.put_symbol(&bad_sbn).is_err());

        let bad_esi = EncodingSymbol { sbn: 0, esi: 9, data: &content[0..16] };
        assert!(rx.put_symbol(&bad_esi).is_err());
        assert!(!rx.complete());
    }

    #[test]
    pub fn test_object_empty_is_complete() {
        crate::tests::init();
        let tx = sender_object(&[]);
        assert!(tx.complete());
        let rx = receiver_object(&tx);
        assert!(rx.complete());
    }

    #[test]
    pub fn test_object_send_failure_requeues() {
        crate::tests::init();
        let content = vec![7u8; 32];
        let mut tx = sender_object(&content);

        let batch = tx.get_next_symbols(16);
        assert_eq!(batch.len(), 1);
        // the symbol is in flight, not eligible again
        assert!(tx.get_next_symbols(16).is_empty() || tx.get_next_symbols(16) != batch);

        tx.mark_completed(&batch, false).unwrap();
        let again = tx.get_next_symbols(16);
        assert_eq!(again, batch);
    }
}
