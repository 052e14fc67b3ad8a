mod tests {
    use base64::Engine;
    use flutecast::common::oti::{FecOti, FecScheme};
    use flutecast::common::{lct, symbol};
    use flutecast::object::FileObject;
    use flutecast::receiver::{ReceiverSession, SharedObject};
    use flutecast::sender::SenderSession;
    use rand::RngCore;

    pub fn init() {
        std::env::set_var("RUST_LOG", "debug");
        env_logger::builder().is_test(true).try_init().ok();
    }

    fn create_file_buffer(size: usize) -> (Vec<u8>, url::Url) {
        let content_location = url::Url::parse("file:///hello").unwrap();
        let mut buffer = vec![0u8; size];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(buffer.as_mut());
        (buffer, content_location)
    }

    fn content_md5(content: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(md5::compute(content).0)
    }

    /// Pump the sender into the receiver until the sender runs dry,
    /// collecting delivered objects
    fn run(
        sender: &mut SenderSession,
        receiver: &mut ReceiverSession,
        deliver: bool,
    ) -> Vec<SharedObject> {
        let mut completed = Vec::new();
        while let Some(pkt) = sender.next_packet() {
            match receiver.push(&pkt.data, deliver) {
                Ok(objects) => completed.extend(objects),
                Err(error) => log::debug!("receiver dropped a packet: {}", error),
            }
            sender.mark_sent(pkt.toi, &pkt.symbols, true, 1000).unwrap();
        }
        completed
    }

    fn sender_session(fec_scheme: FecScheme) -> SenderSession {
        SenderSession::new(1, 1428, fec_scheme, 5).unwrap()
    }

    #[test]
    pub fn test_single_small_file() {
        init();
        let mut sender = sender_session(FecScheme::CompactNoCode);
        let mut receiver = ReceiverSession::new(1);

        let content = b"hello world".to_vec();
        let url = url::Url::parse("file:///hello.txt").unwrap();
        let toi = sender
            .send(&url, "text/plain", 0, content.clone(), 1000)
            .unwrap();
        assert_eq!(toi, 1);

        let completed = run(&mut sender, &mut receiver, true);
        assert_eq!(completed.len(), 1);

        let object = completed[0].lock().unwrap();
        assert!(object.complete());
        assert_eq!(object.content(), &content[..]);
        assert_eq!(object.meta().content_location, url.as_str());
        assert_eq!(object.meta().content_md5, content_md5(&content));
        assert_eq!(object.meta().fec_oti.transfer_length, 11);
    }

    #[test]
    pub fn test_two_block_file_reverse_order() {
        init();
        // Kmax=2 -> 3 symbols split into a block of 2 and a block of 1
        let oti = FecOti::new(FecScheme::CompactNoCode, 0, 1428, 2).unwrap();
        let (content, _) = create_file_buffer(2 * 1428 + 7);

        let mut tx =
            FileObject::from_buffer(2, &oti, "file:///rev", "application/octet-stream", 0, content.clone())
                .unwrap();
        let mut rx = FileObject::from_entry(tx.meta().clone(), None).unwrap();

        let mut payloads = Vec::new();
        loop {
            let batch = tx.get_next_symbols(1428);
            if batch.is_empty() {
                break;
            }
            payloads.push(tx.encode_payload(&batch));
            tx.mark_completed(&batch, true).unwrap();
        }
        assert_eq!(payloads.len(), 3);

        // feed block 1 first, then block 0
        payloads.sort_by_key(|payload| std::cmp::Reverse(payload[1]));
        let mut completions = 0;
        for payload in &payloads {
            let symbols = symbol::from_payload(payload, &tx.meta().fec_oti, lct::Cenc::Null).unwrap();
            for encoding_symbol in &symbols {
                let was_complete = rx.complete();
                rx.put_symbol(encoding_symbol).unwrap();
                if rx.complete() && !was_complete {
                    completions += 1;
                }
            }
        }

        assert_eq!(completions, 1);
        assert_eq!(rx.content(), &content[..]);
    }

    #[test]
    pub fn test_duplicate_storm() {
        init();
        let mut sender = sender_session(FecScheme::CompactNoCode);
        let mut receiver = ReceiverSession::new(1);

        let content = b"hello world".to_vec();
        let url = url::Url::parse("file:///dup").unwrap();
        sender
            .send(&url, "text/plain", 0, content.clone(), 1000)
            .unwrap();

        // FDT first, then the single data packet
        let fdt_pkt = sender.next_packet().unwrap();
        assert_eq!(fdt_pkt.toi, lct::TOI_FDT);
        receiver.push(&fdt_pkt.data, true).unwrap();

        let data_pkt = sender.next_packet().unwrap();
        assert_ne!(data_pkt.toi, lct::TOI_FDT);

        let mut completions = 0;
        for _ in 0..1000 {
            if let Ok(objects) = receiver.push(&data_pkt.data, true) {
                completions += objects.len();
            }
        }
        assert_eq!(completions, 1);
    }

    #[test]
    pub fn test_md5_mismatch_recovery() {
        init();
        let oti = FecOti::new(FecScheme::CompactNoCode, 0, 64, 8).unwrap();
        let (content, _) = create_file_buffer(64 * 5 + 3);

        let mut tx =
            FileObject::from_buffer(2, &oti, "file:///sum", "application/octet-stream", 0, content.clone())
                .unwrap();
        let mut rx = FileObject::from_entry(tx.meta().clone(), None).unwrap();

        let mut payloads = Vec::new();
        loop {
            let batch = tx.get_next_symbols(64);
            if batch.is_empty() {
                break;
            }
            payloads.push(tx.encode_payload(&batch));
            tx.mark_completed(&batch, true).unwrap();
        }

        // flip one byte of the first symbol before it reaches the object
        let mut corrupted = payloads.clone();
        corrupted[0][4] ^= 0xFF;
        for payload in &corrupted {
            let symbols = symbol::from_payload(payload, &rx.meta().fec_oti, lct::Cenc::Null).unwrap();
            for encoding_symbol in &symbols {
                rx.put_symbol(encoding_symbol).unwrap();
            }
        }
        // full reception with a digest mismatch resets the flags
        assert!(!rx.complete());

        // a correct resend completes the object
        for payload in &payloads {
            let symbols = symbol::from_payload(payload, &rx.meta().fec_oti, lct::Cenc::Null).unwrap();
            for encoding_symbol in &symbols {
                rx.put_symbol(encoding_symbol).unwrap();
            }
        }
        assert!(rx.complete());
        assert_eq!(rx.content(), &content[..]);
    }

    #[test]
    pub fn test_fdt_handover() {
        init();
        let mut sender = sender_session(FecScheme::CompactNoCode);
        let mut receiver = ReceiverSession::new(1);

        let (content1, _) = create_file_buffer(3000);
        let (content2, _) = create_file_buffer(2000);
        let url1 = url::Url::parse("file:///first").unwrap();
        let url2 = url::Url::parse("file:///second").unwrap();

        sender.send(&url1, "text/plain", 0, content1, 1000).unwrap();
        // no callback mode: completed objects stay in the receiver
        run(&mut sender, &mut receiver, false);
        let instance1 = receiver.fdt_instance_id().unwrap();
        assert_eq!(receiver.file_list().len(), 1);

        sender.send(&url2, "text/plain", 0, content2, 1001).unwrap();
        run(&mut sender, &mut receiver, false);
        let instance2 = receiver.fdt_instance_id().unwrap();
        assert!(instance2 > instance1);

        let files = receiver.file_list();
        assert_eq!(files.len(), 2);
        assert!(files
            .iter()
            .all(|object| object.lock().unwrap().complete()));

        receiver.remove_file_with_content_location(url1.as_str());
        let files = receiver.file_list();
        assert_eq!(files.len(), 1);
        assert_eq!(
            files[0].lock().unwrap().meta().content_location,
            url2.as_str()
        );
    }

    #[test]
    pub fn test_expiry_keeps_bootstrap() {
        init();
        let mut receiver = ReceiverSession::new(1);

        // hand-crafted FDT announcing the bootstrap carousel entry and a
        // regular file, both empty so they complete on FDT reception
        let oti = FecOti::new(FecScheme::CompactNoCode, 0, 1428, 64).unwrap();
        let mut fdt = flutecast::fdt::FileDeliveryTable::new(1, &oti);
        fdt.set_expires(2_000_000_000);
        for (toi, location) in [(2u64, "bootstrap.multipart"), (3u64, "file:///old")] {
            fdt.add(
                flutecast::fdt::FileEntry {
                    toi,
                    content_location: location.to_owned(),
                    content_length: 0,
                    content_md5: String::new(),
                    content_type: "text/plain".to_owned(),
                    expires: 0,
                    fec_oti: oti,
                }
                .to_fdt_file(),
            );
        }

        let xml = fdt.to_xml().unwrap();
        let fdt_oti = FecOti::new(FecScheme::CompactNoCode, xml.len() as u64, 1428, 64).unwrap();
        let payload = symbol::to_payload(&[symbol::EncodingSymbol {
            sbn: 0,
            esi: 0,
            data: &xml,
        }]);
        let pkt =
            flutecast::common::alc::new_alc_pkt(1, lct::TOI_FDT, &fdt_oti, Some(fdt.instance_id()), &payload);
        receiver.push(&pkt, false).unwrap();
        assert_eq!(receiver.file_list().len(), 2);

        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(100);
        receiver.remove_expired_files(std::time::Duration::from_secs(10), later);

        // only the bootstrap entry survives age based expiry
        let files = receiver.file_list();
        assert_eq!(files.len(), 1);
        assert_eq!(
            files[0].lock().unwrap().meta().content_location,
            "bootstrap.multipart"
        );
    }

    #[test]
    pub fn test_tsi_mismatch_is_dropped() {
        init();
        let mut sender = sender_session(FecScheme::CompactNoCode);
        let mut receiver = ReceiverSession::new(2);

        let url = url::Url::parse("file:///tsi").unwrap();
        sender
            .send(&url, "text/plain", 0, b"data".to_vec(), 1000)
            .unwrap();

        let pkt = sender.next_packet().unwrap();
        assert!(receiver.push(&pkt.data, true).is_err());
        assert_eq!(receiver.file_list().len(), 0);
    }

    #[test]
    pub fn test_raptor_delivery() {
        init();
        let mut sender = sender_session(FecScheme::Raptor);
        let mut receiver = ReceiverSession::new(1);

        let (content, url) = create_file_buffer(10 * 1024);
        sender
            .send(&url, "application/octet-stream", 0, content.clone(), 1000)
            .unwrap();

        let completed = run(&mut sender, &mut receiver, true);
        assert_eq!(completed.len(), 1);
        let object = completed[0].lock().unwrap();
        assert_eq!(object.content(), &content[..]);
        assert_eq!(object.meta().fec_oti.encoding_id, FecScheme::Raptor);
    }

    #[test]
    pub fn test_raptor_rejects_tiny_file() {
        init();
        let mut sender = sender_session(FecScheme::Raptor);
        let url = url::Url::parse("file:///tiny").unwrap();
        // fewer than 4 symbols worth of data
        assert!(sender.send(&url, "text/plain", 0, vec![1, 2, 3], 1000).is_err());
    }

    #[test]
    pub fn test_empty_file_delivery() {
        init();
        let mut sender = sender_session(FecScheme::CompactNoCode);
        let mut receiver = ReceiverSession::new(1);

        let url = url::Url::parse("file:///empty").unwrap();
        sender.send(&url, "text/plain", 0, Vec::new(), 1000).unwrap();

        let completed = run(&mut sender, &mut receiver, true);
        assert_eq!(completed.len(), 1);
        let object = completed[0].lock().unwrap();
        assert!(object.complete());
        assert_eq!(object.content().len(), 0);
    }

    mod engine {
        use flutecast::receiver::Receiver;
        use flutecast::sender::{Config, Transmitter};
        use std::net::IpAddr;

        const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

        #[tokio::test(flavor = "current_thread")]
        async fn test_engine_loopback_delivery() {
            super::init();
            let handle = tokio::runtime::Handle::current();

            let receiver = Receiver::new(
                LOCALHOST,
                LOCALHOST,
                0,
                1,
                Default::default(),
                &handle,
            )
            .unwrap();
            let port = receiver.local_addr().unwrap().port();

            let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
            receiver.register_completion_callback(move |object| {
                done_tx.send(object).ok();
            });

            let transmitter =
                Transmitter::new(LOCALHOST, port, 1, Config::default(), &handle).unwrap();
            let (content, url) = super::create_file_buffer(100_000);
            transmitter
                .send(&url, "application/octet-stream", 0, content.clone())
                .unwrap();

            let object = tokio::time::timeout(std::time::Duration::from_secs(30), done_rx.recv())
                .await
                .expect("delivery timed out")
                .expect("delivery channel closed");

            let object = object.lock().unwrap();
            assert!(object.complete());
            assert_eq!(object.content(), &content[..]);
            assert_eq!(object.meta().content_location, url.as_str());

            receiver.stop();
        }

        #[tokio::test(flavor = "current_thread", start_paused = true)]
        async fn test_engine_rate_limited_pacing() {
            super::init();
            let handle = tokio::runtime::Handle::current();

            let config = Config {
                rate_limit_kbps: 1000,
                ..Default::default()
            };
            // UDP discard sink, nobody listens
            let transmitter = Transmitter::new(LOCALHOST, 9, 1, config, &handle).unwrap();

            let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
            transmitter.register_completion_callback(move |toi| {
                done_tx.send(toi).ok();
            });

            let (content, url) = super::create_file_buffer(1024 * 1024);
            let start = tokio::time::Instant::now();
            let toi = transmitter
                .send(&url, "application/octet-stream", 0, content)
                .unwrap();

            let completed =
                tokio::time::timeout(std::time::Duration::from_secs(60), done_rx.recv())
                    .await
                    .expect("transmission timed out")
                    .expect("completion channel closed");
            assert_eq!(completed, toi);

            // 1 MiB + headers at 1000 kbps is a hair above 8.4 seconds
            let elapsed = start.elapsed();
            log::info!("transmission took {:?}", elapsed);
            assert!(elapsed > std::time::Duration::from_secs_f64(7.6));
            assert!(elapsed < std::time::Duration::from_secs_f64(9.4));
        }
    }
}
