use crate::common::{alc, lct, symbol};
use crate::fdt::{FileDeliveryTable, FileEntry};
use crate::object::FileObject;
use crate::tools::error::{FluteError, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Shared handle to an object under reception or delivered
pub type SharedObject = Arc<Mutex<FileObject>>;

/// Objects with this content location survive age based expiry
const BOOTSTRAP_LOCATION: &str = "bootstrap.multipart";

///
/// Sans-I/O state of one receiving FLUTE session.
///
/// Datagrams are pushed with [`ReceiverSession::push`]. A TOI=0 packet for
/// an unknown FDT instance opens a placeholder sized from its EXT_FTI; a
/// completed FDT opens reception for every announced file; completed files
/// are handed back for delivery.
///
#[derive(Debug)]
pub struct ReceiverSession {
    tsi: u64,
    fdt: Option<FileDeliveryTable>,
    files: BTreeMap<u64, SharedObject>,
}

impl ReceiverSession {
    pub fn new(tsi: u64) -> Self {
        ReceiverSession {
            tsi,
            fdt: None,
            files: BTreeMap::new(),
        }
    }

    pub fn tsi(&self) -> u64 {
        self.tsi
    }

    /// Instance id of the last fully received FDT
    pub fn fdt_instance_id(&self) -> Option<u32> {
        self.fdt.as_ref().map(|fdt| fdt.instance_id())
    }

    pub fn nb_objects(&self) -> usize {
        self.files.len()
    }

    ///
    /// Process one received datagram.
    ///
    /// With `deliver` set, completed objects are removed from the map and
    /// returned; otherwise they stay, observable through
    /// [`ReceiverSession::file_list`].
    ///
    pub fn push(&mut self, data: &[u8], deliver: bool) -> Result<Vec<SharedObject>> {
        let pkt = alc::parse_alc_pkt(data)?;

        if pkt.lct.tsi != self.tsi {
            return Err(FluteError::SessionMismatch(format!(
                "packet for unknown TSI {}",
                pkt.lct.tsi
            )));
        }

        let toi = pkt.lct.toi;
        if toi == lct::TOI_FDT {
            self.open_fdt_placeholder(&pkt);
        }

        let object = match self.files.get(&toi) {
            Some(object) => object.clone(),
            None => {
                return Err(FluteError::SessionMismatch(format!(
                    "packet for unknown TOI {}",
                    toi
                )))
            }
        };

        {
            let mut object = object.lock().unwrap();
            if object.complete() {
                log::debug!("drop packet for already completed TOI {}", toi);
                return Ok(Vec::new());
            }

            let symbols = symbol::from_payload(
                &pkt.data[pkt.payload_offset..],
                &object.meta().fec_oti,
                pkt.cenc,
            )?;
            for encoding_symbol in &symbols {
                log::debug!(
                    "received TOI {} SBN {} ESI {}",
                    toi,
                    encoding_symbol.sbn,
                    encoding_symbol.esi
                );
                object.put_symbol(encoding_symbol)?;
            }

            if !object.complete() {
                return Ok(Vec::new());
            }
        }

        self.on_object_complete(toi, deliver)
    }

    /// A TOI=0 packet for an absent or newer FDT instance opens a
    /// placeholder object sized from the packet's EXT_FTI
    fn open_fdt_placeholder(&mut self, pkt: &alc::AlcPkt) {
        let instance_known = match (self.fdt.as_ref(), pkt.fdt_instance_id) {
            (Some(fdt), Some(id)) => fdt.instance_id() == id,
            _ => false,
        };
        if instance_known || self.files.contains_key(&lct::TOI_FDT) {
            return;
        }

        let fec_oti = match pkt.fec_oti {
            Some(fec_oti) => fec_oti,
            None => {
                log::warn!("TOI 0 packet without EXT_FTI, cannot bootstrap the FDT");
                return;
            }
        };

        let entry = FileEntry {
            toi: lct::TOI_FDT,
            content_location: String::new(),
            content_length: fec_oti.transfer_length,
            content_md5: String::new(),
            content_type: String::new(),
            expires: 0,
            fec_oti,
        };

        match FileObject::from_entry(entry, None) {
            Ok(mut object) => {
                if let Some(id) = pkt.fdt_instance_id {
                    object.set_fdt_instance_id(id);
                }
                self.files
                    .insert(lct::TOI_FDT, Arc::new(Mutex::new(object)));
            }
            Err(error) => log::warn!("fail to open FDT reception: {}", error),
        }
    }

    fn on_object_complete(&mut self, toi: u64, deliver: bool) -> Result<Vec<SharedObject>> {
        let object = match self.files.get(&toi) {
            Some(object) => object.clone(),
            None => return Ok(Vec::new()),
        };

        // evict any older object claiming the same location
        let location = object.lock().unwrap().meta().content_location.clone();
        self.files.retain(|other_toi, other| {
            *other_toi == toi || other.lock().unwrap().meta().content_location != location
        });

        log::debug!("file with TOI {} completed", toi);

        if toi == lct::TOI_FDT {
            self.files.remove(&lct::TOI_FDT);
            return self.attach_fdt(&object, deliver);
        }

        match deliver {
            true => {
                self.files.remove(&toi);
                Ok(vec![object])
            }
            false => Ok(Vec::new()),
        }
    }

    /// Parse a completed TOI=0 object and open reception for every file it
    /// announces. Zero length files complete right away.
    fn attach_fdt(&mut self, object: &SharedObject, deliver: bool) -> Result<Vec<SharedObject>> {
        let fdt = {
            let object = object.lock().unwrap();
            let instance_id = object.fdt_instance_id().unwrap_or_default();
            FileDeliveryTable::parse(instance_id, object.content())?
        };

        let mut delivered = Vec::new();
        for row in fdt.files() {
            let entry = match fdt.resolve_entry(row) {
                Ok(entry) => entry,
                Err(error) => {
                    log::warn!("skipping FDT entry: {}", error);
                    continue;
                }
            };
            if entry.toi == lct::TOI_FDT || self.files.contains_key(&entry.toi) {
                continue;
            }

            log::debug!(
                "starting reception for file with TOI {}: {} ({})",
                entry.toi,
                entry.content_location,
                entry.content_type
            );
            let toi = entry.toi;
            match FileObject::from_entry(entry, Some(row)) {
                Ok(new_object) => {
                    let shared = Arc::new(Mutex::new(new_object));
                    let complete = shared.lock().unwrap().complete();
                    match complete && deliver {
                        true => delivered.push(shared),
                        false => {
                            self.files.insert(toi, shared);
                        }
                    }
                }
                Err(error) => log::warn!("fail to open reception for TOI {}: {}", toi, error),
            }
        }

        self.fdt = Some(fdt);
        Ok(delivered)
    }

    /// Shared handles to every object of the session, in TOI order
    pub fn file_list(&mut self) -> Vec<SharedObject> {
        self.files
            .values()
            .map(|object| {
                object.lock().unwrap().touch();
                object.clone()
            })
            .collect()
    }

    /// Drop objects older than `max_age`, the bootstrap carousel excepted
    pub fn remove_expired_files(&mut self, max_age: Duration, now: SystemTime) {
        self.files.retain(|_, object| {
            let object = object.lock().unwrap();
            let age = now
                .duration_since(object.received_at())
                .unwrap_or_default();
            object.meta().content_location == BOOTSTRAP_LOCATION || age <= max_age
        });
    }

    /// Drop every object with this content location
    pub fn remove_file_with_content_location(&mut self, location: &str) {
        self.files
            .retain(|_, object| object.lock().unwrap().meta().content_location != location);
    }
}
