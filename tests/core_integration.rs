//! End-to-end exercises across components, mirroring a single command's
//! "acquire lock -> read/modify metadata -> commit -> flush cache" flow
//! (spec §2 "Data flow for a typical mutation"), using mock engines and
//! transports in place of a real block device / lock daemon.

use lvmcore::cache::engine::mock::MockIoEngine;
use lvmcore::cache::{Cache, GetFlags};
use lvmcore::lock::client::MockTransport;
use lvmcore::lock::{LockClient, LockMode, LockRequest, ResultFlags};
use lvmcore::metadata::mda::{vg_commit_all, vg_read_all, InMemoryMda, MetadataArea};
use lvmcore::metadata::pv::PhysicalVolume;
use lvmcore::metadata::segment::SegmentType;
use lvmcore::metadata::vg::{LvCreateParams, VolumeGroup};
use lvmcore::metadata::vg_read;
use lvmcore::reservation::engine::{classify_pv, AccessMode, PvObservation, PvStatus, ReservationType};
use lvmcore::uuid::Uuid;

fn serialize(vg: &VolumeGroup) -> String {
    format!("seqno={}\nname={}\n", vg.seqno, vg.name)
}

#[test]
fn create_lv_flow_locks_writes_metadata_and_flushes_cache() {
    // D: acquire the VG lock.
    let mut transport = MockTransport::new();
    transport.push_reply(0, ResultFlags::empty());
    let mut lock_client = LockClient::new(transport, 3);
    let lock_req = LockRequest::new("lock_vg", "myvg", LockMode::Ex);
    lock_client.request(&lock_req).expect("vg lock granted");

    // C: build the VG and carve an LV out of it.
    let mut vg = VolumeGroup::new("myvg", 4096);
    let pv = PhysicalVolume::create(Uuid::generate(), 2_000_000, 4096);
    vg.extend(pv).unwrap();
    let free = vg.free_count();
    vg.lv_create_single(LvCreateParams {
        name: "data".to_string(),
        extents: free / 4,
        seg_type: SegmentType::Linear,
        stripe_size: None,
    })
    .unwrap();
    vg.check_invariants().unwrap();

    // C: commit to two metadata areas.
    let mut mdas: Vec<Box<dyn MetadataArea>> = vec![Box::new(InMemoryMda::new()), Box::new(InMemoryMda::new())];
    vg_commit_all(&mut vg, &mut mdas, serialize).unwrap();
    assert_eq!(vg.seqno, 1);

    let read_back = vg_read_all(&mdas).unwrap();
    assert!(!read_back.inconsistent);
    assert_eq!(read_back.metadata.unwrap().seqno, 1);

    // B: the metadata write is backed by block-cache I/O.
    let mut cache = Cache::create(8, 16, Box::new(MockIoEngine::new())).unwrap();
    let di = cache.set_fd(3);
    let block = cache.get(di, 0, GetFlags::DIRTY).unwrap();
    cache.block_data_mut(block)[0] = 0xAB;
    cache.put(block).unwrap();
    cache.flush().unwrap();
    assert_eq!(cache.nr_dirty(), 0);
    assert_eq!(cache.stats().write_hits + cache.stats().write_misses, 1);
}

#[test]
fn inconsistent_mdas_are_detected_and_repaired_on_read() {
    let mut a = InMemoryMda::new();
    a.vg_write(lvmcore::metadata::mda::StagedMetadata { seqno: 1, body: "a".into() }).unwrap();
    a.vg_commit().unwrap();
    let mut b = InMemoryMda::new();
    b.vg_write(lvmcore::metadata::mda::StagedMetadata { seqno: 2, body: "b".into() }).unwrap();
    b.vg_commit().unwrap();

    let mut vg = VolumeGroup::new("myvg", 4096);
    vg.seqno = 1;
    let mut mdas: Vec<Box<dyn MetadataArea>> = vec![Box::new(a), Box::new(b)];
    let result = vg_read(&mut vg, &mut mdas, true, serialize).unwrap();
    assert!(result.inconsistent);
    assert_eq!(vg.seqno, 2);

    let reread = vg_read_all(&mdas).unwrap();
    assert!(!reread.inconsistent);
}

#[test]
fn lock_client_retries_then_grants_on_contention() {
    use lvmcore::lock::client::{RequestOutcome, E_AGAIN};

    let mut transport = MockTransport::new();
    transport.push_reply(E_AGAIN, ResultFlags::empty());
    transport.push_reply(E_AGAIN, ResultFlags::empty());
    transport.push_reply(0, ResultFlags::empty());
    let mut client = LockClient::new(transport, 5);
    let req = LockRequest::new("lock_vg", "myvg", LockMode::Pw);
    assert_eq!(client.request(&req).unwrap(), RequestOutcome::Granted);
}

#[test]
fn reservation_classification_identifies_local_and_foreign_holders() {
    let our_key = 0x1000000800042;
    let observation_local = PvObservation {
        device: "/dev/sda".to_string(),
        registered_keys: std::collections::BTreeSet::from([our_key]),
        reservation_type: ReservationType::We,
        reservation_holder: Some(our_key),
    };
    assert_eq!(classify_pv(&observation_local, our_key), PvStatus::WeLocal);

    let observation_foreign = PvObservation {
        device: "/dev/sdb".to_string(),
        registered_keys: std::collections::BTreeSet::from([our_key, 7]),
        reservation_type: ReservationType::We,
        reservation_holder: Some(7),
    };
    assert_eq!(classify_pv(&observation_foreign, our_key), PvStatus::WeOther);

    assert_eq!(AccessMode::Ex.expected_reservation_type(), ReservationType::We);
    assert_eq!(AccessMode::Sh.expected_reservation_type(), ReservationType::Wear);
}
