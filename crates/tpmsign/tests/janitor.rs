// SPDX-License-Identifier: MIT OR Apache-2.0

mod common;

use common::{fast_policy, handle_files, transient_count};
use tpmsign::rc;
use tpmsign::sim::Simulator;
use tpmsign::{
    flush_stale_handles, Connector, Error, FlushScope, HandleKind, Provisioner, SignatureScheme, TpmCc, TpmError,
};

#[test]
fn transient_scope_leaves_sessions_alone() {
    let sim = Simulator::new(1);
    let stale: Vec<u32> = (0..3).map(|_| sim.inject_stale_transient().unwrap()).collect();
    sim.inject_saved_session();
    sim.inject_saved_session();

    let mut tpm = sim.connect().unwrap();
    let report = flush_stale_handles(&mut tpm, FlushScope::Transient).unwrap();
    tpm.close().unwrap();

    assert_eq!(report.count(), 3);
    assert_eq!(report.flushed, stale);
    assert_eq!(transient_count(&sim), 0);
    assert_eq!(sim.handles(HandleKind::SavedSession).len(), 2);
}

#[test]
fn flushing_nothing_is_a_no_op() {
    let sim = Simulator::new(2);
    let mut tpm = sim.connect().unwrap();

    for scope in [FlushScope::All, FlushScope::Loaded, FlushScope::Saved, FlushScope::Transient] {
        assert_eq!(flush_stale_handles(&mut tpm, scope).unwrap().count(), 0);
    }
    tpm.close().unwrap();
}

#[test]
fn all_scope_spares_persistent_objects() {
    let sim = Simulator::new(3);
    sim.inject_loaded_session();
    sim.inject_saved_session();
    let transient = sim.inject_stale_transient().unwrap();
    let persistent = sim.persist(transient).unwrap();

    let mut tpm = sim.connect().unwrap();
    let report = flush_stale_handles(&mut tpm, FlushScope::All).unwrap();
    assert_eq!(report.count(), 3);

    // Running again finds nothing left to do
    assert_eq!(flush_stale_handles(&mut tpm, FlushScope::All).unwrap().count(), 0);
    tpm.close().unwrap();

    assert!(sim.handles(HandleKind::LoadedSession).is_empty());
    assert!(sim.handles(HandleKind::SavedSession).is_empty());
    assert_eq!(sim.handles(HandleKind::Persistent), vec![persistent]);
}

#[test]
fn sessions_are_flushed_whichever_range_they_are_reported_in() {
    let sim = Simulator::new(7);
    let hmac = sim.inject_loaded_session();
    let policy = sim.inject_policy_session();
    let saved = sim.inject_saved_session();
    assert_eq!(HandleKind::of(policy), Some(HandleKind::SavedSession));
    assert_eq!(HandleKind::of(saved), Some(HandleKind::LoadedSession));

    let mut tpm = sim.connect().unwrap();
    let loaded = flush_stale_handles(&mut tpm, FlushScope::Loaded).unwrap();
    assert_eq!(loaded.flushed, vec![hmac, policy]);
    let saved_report = flush_stale_handles(&mut tpm, FlushScope::Saved).unwrap();
    assert_eq!(saved_report.flushed, vec![saved]);
    tpm.close().unwrap();

    assert!(sim.handles(HandleKind::LoadedSession).is_empty());
    assert!(sim.handles(HandleKind::SavedSession).is_empty());
}

#[test]
fn loaded_policy_sessions_page_past_the_first_reply() {
    let sim = Simulator::new(8);
    for _ in 0..20 {
        sim.inject_policy_session();
    }

    let mut tpm = sim.connect().unwrap();
    let report = flush_stale_handles(&mut tpm, FlushScope::All).unwrap();
    tpm.close().unwrap();

    assert_eq!(report.count(), 20);
    assert!(report.flushed.iter().all(|&h| h >> 24 == 0x03));
    assert!(sim.handles(HandleKind::LoadedSession).is_empty());
}

#[test]
fn flush_failure_names_the_handle() {
    let sim = Simulator::new(9);
    let first = sim.inject_stale_transient().unwrap();
    let second = sim.inject_stale_transient().unwrap();
    sim.fail_command(TpmCc::FlushContext, 2, rc::parameter(rc::HANDLE, 1));

    let mut tpm = sim.connect().unwrap();
    match flush_stale_handles(&mut tpm, FlushScope::Transient) {
        Err(Error::Flush {
            handle,
            source: TpmError::Response { command, code },
        }) => {
            assert_eq!(handle, second);
            assert_eq!(command, TpmCc::FlushContext);
            assert!(code.is(rc::HANDLE));
        }
        other => panic!("expected a flush error, got {:?}", other),
    }
    tpm.close().unwrap();

    assert!(!sim.handles(HandleKind::Transient).contains(&first));
    assert_eq!(sim.handles(HandleKind::Transient), vec![second]);
}

#[test]
fn enumeration_follows_more_data() {
    let sim = Simulator::new(4);
    for _ in 0..40 {
        sim.inject_saved_session();
    }

    let mut tpm = sim.connect().unwrap();
    let report = flush_stale_handles(&mut tpm, FlushScope::Saved).unwrap();
    tpm.close().unwrap();

    assert_eq!(report.count(), 40);
    assert!(sim.handles(HandleKind::SavedSession).is_empty());
}

#[test]
fn stalled_enumeration_is_a_timeout() {
    let sim = Simulator::new(5);
    sim.inject_stale_transient().unwrap();

    let mut tpm = sim.connect().unwrap();
    sim.stall_next_command();
    let err = flush_stale_handles(&mut tpm, FlushScope::Transient).unwrap_err();
    assert!(matches!(err, Error::Timeout { step: "handle enumeration" }));
    drop(tpm);

    assert_eq!(transient_count(&sim), 1);
}

#[test]
fn janitor_makes_room_for_provisioning() {
    let sim = Simulator::new(6);
    let dir = tempfile::tempdir().unwrap();
    let files = handle_files(dir.path());
    let policy = fast_policy(SignatureScheme::RsaSsa);
    for _ in 0..3 {
        sim.inject_stale_transient().unwrap();
    }
    assert!(Provisioner::new(&sim, &policy).provision(&files).is_err());

    let mut tpm = sim.connect().unwrap();
    flush_stale_handles(&mut tpm, FlushScope::All).unwrap();
    tpm.close().unwrap();

    Provisioner::new(&sim, &policy).provision(&files).unwrap();
    assert!(files.key.exists());
    assert_eq!(transient_count(&sim), 0);
}
