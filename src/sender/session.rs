use crate::common::oti::{FecOti, FecScheme};
use crate::common::{alc, lct};
use crate::fdt::FileDeliveryTable;
use crate::object::FileObject;
use crate::tools::error::{FluteError, Result};
use std::collections::BTreeMap;

/// One ALC packet ready for transmission together with the bookkeeping
/// needed to confirm it
#[derive(Debug)]
pub struct PacketBatch {
    pub toi: u64,
    pub symbols: Vec<(u16, u16)>,
    pub data: Vec<u8>,
}

///
/// Sans-I/O state of one sending FLUTE session.
///
/// Objects are admitted with [`SenderSession::send`], the pacer drains them
/// with [`SenderSession::next_packet`] and confirms transmissions with
/// [`SenderSession::mark_sent`]. The FDT travels as the TOI=0 object and is
/// re-stamped by [`SenderSession::refresh_fdt`] on every mutation and
/// carousel tick.
///
#[derive(Debug)]
pub struct SenderSession {
    tsi: u64,
    max_payload: u32,
    fec_oti: FecOti,
    /// The FDT itself always travels with Compact No-Code
    fdt_fec_oti: FecOti,
    fdt: FileDeliveryTable,
    files: BTreeMap<u64, FileObject>,
    next_toi: u64,
    fdt_repeat_interval_secs: u64,
}

impl SenderSession {
    ///
    /// `max_payload` is the octet budget left for `SBN/ESI + symbols` after
    /// the IP, UDP and worst-case ALC headers are deducted from the MTU.
    ///
    pub fn new(
        tsi: u64,
        max_payload: u32,
        fec_scheme: FecScheme,
        fdt_repeat_interval_secs: u64,
    ) -> Result<Self> {
        if tsi > lct::TSI_MAX {
            return Err(FluteError::Config(format!(
                "TSI {} does not fit in 48 bits",
                tsi
            )));
        }

        let mut data_payload = max_payload;
        if fec_scheme == FecScheme::Raptor {
            // symbol budget must align to Al
            data_payload -= data_payload % crate::common::oti::RAPTOR_SYMBOL_ALIGNMENT;
        }

        let fec_oti = FecOti::new(fec_scheme, 0, data_payload, 64)?;
        let fdt_fec_oti = FecOti::new(FecScheme::CompactNoCode, 0, max_payload, 64)?;

        Ok(SenderSession {
            tsi,
            max_payload,
            fec_oti,
            fdt_fec_oti,
            fdt: FileDeliveryTable::new(1, &fec_oti),
            files: BTreeMap::new(),
            next_toi: 1,
            fdt_repeat_interval_secs,
        })
    }

    pub fn tsi(&self) -> u64 {
        self.tsi
    }

    /// Number of objects in transfer, the FDT included
    pub fn nb_objects(&self) -> usize {
        self.files.len()
    }

    pub fn fdt_instance_id(&self) -> u32 {
        self.fdt.instance_id()
    }

    ///
    /// Admit one object for delivery and announce it in the FDT.
    ///
    /// Returns the TOI assigned to the object. A collision with an object
    /// still in transfer is a failure.
    ///
    pub fn send(
        &mut self,
        content_location: &url::Url,
        content_type: &str,
        expires: u64,
        data: Vec<u8>,
        now: u64,
    ) -> Result<u64> {
        let toi = self.next_toi;
        if self.files.contains_key(&toi) {
            return Err(FluteError::Resource(format!(
                "TOI {} is still in transfer",
                toi
            )));
        }

        let object = FileObject::from_buffer(
            toi,
            &self.fec_oti,
            content_location.as_str(),
            content_type,
            expires,
            data,
        )?;

        self.next_toi = (self.next_toi + 1) & lct::TOI_MAX;
        if self.next_toi == lct::TOI_FDT {
            self.next_toi = 1;
        }

        self.fdt.add(object.to_fdt_file());
        self.files.insert(toi, object);
        self.refresh_fdt(now)?;
        Ok(toi)
    }

    ///
    /// Re-stamp the TOI=0 object with the current FDT document, its expiry
    /// is two carousel periods ahead
    ///
    pub fn refresh_fdt(&mut self, now: u64) -> Result<()> {
        let expires = now + 2 * self.fdt_repeat_interval_secs;
        self.fdt.set_expires(expires);
        let xml = self.fdt.to_xml()?;

        let mut fdt_object =
            FileObject::from_buffer(lct::TOI_FDT, &self.fdt_fec_oti, "", "", expires, xml)?;
        fdt_object.set_fdt_instance_id(self.fdt.instance_id());
        self.files.insert(lct::TOI_FDT, fdt_object);
        Ok(())
    }

    ///
    /// Build the next ALC packet: the first incomplete object in TOI order
    /// with transmittable symbols wins, the FDT at TOI 0 first of all
    ///
    pub fn next_packet(&mut self) -> Option<PacketBatch> {
        let max_payload = self.max_payload as usize;
        for (toi, object) in self.files.iter_mut() {
            if object.complete() {
                continue;
            }
            let symbols = object.get_next_symbols(max_payload);
            if symbols.is_empty() {
                continue;
            }

            for (sbn, esi) in &symbols {
                log::debug!("sending TOI {} SBN {} ESI {}", toi, sbn, esi);
            }

            let payload = object.encode_payload(&symbols);
            let data = alc::new_alc_pkt(
                self.tsi,
                *toi,
                &object.meta().fec_oti,
                object.fdt_instance_id(),
                &payload,
            );
            return Some(PacketBatch {
                toi: *toi,
                symbols,
                data,
            });
        }
        None
    }

    ///
    /// Confirm one transmitted batch. Failed sends un-queue the symbols for
    /// a later round. Returns the TOIs whose transfer completed, they are
    /// gone from the map and the FDT when this returns.
    ///
    pub fn mark_sent(
        &mut self,
        toi: u64,
        symbols: &[(u16, u16)],
        success: bool,
        now: u64,
    ) -> Result<Vec<u64>> {
        let object = match self.files.get_mut(&toi) {
            Some(object) => object,
            None => return Ok(Vec::new()),
        };
        object.mark_completed(symbols, success)?;
        if !object.complete() {
            return Ok(Vec::new());
        }

        if toi == lct::TOI_FDT {
            // a full FDT pass announced every entry, reap objects that have
            // no symbols of their own
            return self.reap_empty_objects(now);
        }

        log::debug!("transfer done for TOI {}", toi);
        self.files.remove(&toi);
        self.fdt.remove(toi);
        self.refresh_fdt(now)?;
        Ok(vec![toi])
    }

    /// Zero-length objects are complete from the start, they are done once
    /// an FDT carrying their entry went out
    fn reap_empty_objects(&mut self, now: u64) -> Result<Vec<u64>> {
        let completed: Vec<u64> = self
            .files
            .iter()
            .filter(|(toi, object)| **toi != lct::TOI_FDT && object.complete())
            .map(|(toi, _)| *toi)
            .collect();

        for toi in &completed {
            self.files.remove(toi);
            self.fdt.remove(*toi);
        }
        if !completed.is_empty() {
            self.refresh_fdt(now)?;
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SenderSession {
        SenderSession::new(1, 1428, FecScheme::CompactNoCode, 5).unwrap()
    }

    #[test]
    pub fn test_session_tois_start_at_one() {
        crate::tests::init();
        let mut session = session();
        let url = url::Url::parse("file:///a").unwrap();
        let toi = session
            .send(&url, "text/plain", 0, vec![0xAA; 100], 1000)
            .unwrap();
        assert_eq!(toi, 1);
        let toi = session
            .send(&url, "text/plain", 0, vec![0xBB; 100], 1000)
            .unwrap();
        assert_eq!(toi, 2);
        // FDT + 2 objects
        assert_eq!(session.nb_objects(), 3);
    }

    #[test]
    pub fn test_session_fdt_packet_first() {
        crate::tests::init();
        let mut session = session();
        let url = url::Url::parse("file:///a").unwrap();
        session
            .send(&url, "text/plain", 0, vec![0xAA; 10], 1000)
            .unwrap();

        let batch = session.next_packet().unwrap();
        assert_eq!(batch.toi, lct::TOI_FDT);
        let pkt = crate::common::alc::parse_alc_pkt(&batch.data).unwrap();
        assert!(pkt.fdt_instance_id.is_some());
        assert!(pkt.fec_oti.is_some());
    }

    #[test]
    pub fn test_session_completion_removes_from_fdt() {
        crate::tests::init();
        let mut session = session();
        let url = url::Url::parse("file:///a").unwrap();
        let toi = session
            .send(&url, "text/plain", 0, vec![0xAA; 10], 1000)
            .unwrap();
        let instance_before = session.fdt_instance_id();

        // drain FDT and object packets
        let mut completed = Vec::new();
        while let Some(batch) = session.next_packet() {
            completed.extend(
                session
                    .mark_sent(batch.toi, &batch.symbols, true, 1000)
                    .unwrap(),
            );
            if completed.contains(&toi) {
                break;
            }
        }
        assert!(completed.contains(&toi));
        // removal bumped the FDT instance
        assert!(session.fdt_instance_id() > instance_before);
    }

    #[test]
    pub fn test_session_rejects_wide_tsi() {
        crate::tests::init();
        assert!(SenderSession::new(1 << 50, 1428, FecScheme::CompactNoCode, 5).is_err());
    }
}
