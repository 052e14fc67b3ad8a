use crate::common::oti::FecOti;
use crate::common::oti::FecScheme;
use crate::common::partition::Partitioning;
use crate::fdt::FdtFile;
use crate::object::SourceBlock;
use crate::tools::error::Result;
use std::collections::BTreeMap;

pub mod raptor;

///
/// Capability set of a FEC scheme.
///
/// Compact No-Code has no transformer, the default RFC 5052 partitioning and
/// the identity symbol mapping apply. A scheme with a transformer overrides
/// partitioning, block creation, symbol processing and completion detection.
///
pub trait FecTransformer: std::fmt::Debug + Send {
    /// Partitioning of the object into source blocks
    fn calculate_partitioning(&self) -> Partitioning;

    /// Build the source block map.
    ///
    /// On the sender `buffer` holds the object and the blocks own their
    /// encoding symbols. On the receiver the blocks only carry symbol slots,
    /// received symbols are routed to [`FecTransformer::process_symbol`].
    fn create_blocks(&mut self, buffer: &[u8]) -> Result<BTreeMap<u16, SourceBlock>>;

    /// Feed one received encoding symbol to the decoder
    fn process_symbol(&mut self, sbn: u16, esi: u16, data: &[u8]) -> Result<()>;

    /// Completion state of one source block
    fn check_block_completion(&mut self, block: &SourceBlock) -> bool;

    /// Allocate the reception buffer, it may be larger than the object
    fn allocate_buffer(&self, min_length: usize) -> Vec<u8>;

    /// Realize the decoded source symbols into `buffer` once every block is
    /// complete
    fn extract_file(&mut self, buffer: &mut [u8]) -> Result<()>;

    /// Add the scheme specific attributes to an FDT row
    fn add_fdt_info(&self, file: &mut FdtFile);

    /// Forget decoding progress, the object is received again
    fn reset(&mut self) {}
}

/// Instantiate the sender side transformer for a scheme, `None` for
/// Compact No-Code.
///
/// For Raptor the session OTI only carries the payload budget, the scheme
/// derives the actual symbol size and block length. The returned OTI
/// reflects what goes on the wire.
pub fn new_encoder(fec_oti: &FecOti) -> Result<(FecOti, Option<Box<dyn FecTransformer>>)> {
    match fec_oti.encoding_id {
        FecScheme::CompactNoCode => Ok((*fec_oti, None)),
        FecScheme::Raptor => {
            let fec = raptor::RaptorFec::for_sender(
                fec_oti.transfer_length,
                fec_oti.encoding_symbol_length,
            )?;
            let mut fec_oti = *fec_oti;
            fec_oti.encoding_symbol_length = fec.symbol_size();
            fec_oti.max_source_block_length = fec.symbols_per_block();
            Ok((fec_oti, Some(Box::new(fec))))
        }
    }
}

/// Instantiate the receiver side transformer from an FDT row, `None` for
/// Compact No-Code
pub fn new_decoder(
    scheme: FecScheme,
    file: Option<&FdtFile>,
) -> Result<Option<Box<dyn FecTransformer>>> {
    match scheme {
        FecScheme::CompactNoCode => Ok(None),
        FecScheme::Raptor => {
            let file = file.ok_or_else(|| {
                crate::tools::error::FluteError::Config(
                    "Raptor parameters are only carried in the FDT".to_owned(),
                )
            })?;
            Ok(Some(Box::new(raptor::RaptorFec::parse_fdt_info(file)?)))
        }
    }
}
