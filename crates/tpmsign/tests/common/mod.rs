// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(dead_code)]

use std::path::Path;

use tpmsign::sim::Simulator;
use tpmsign::{HandleFiles, HandleKind, KeyPolicy, ProvisionedKey, Provisioner, SignatureScheme};
use tpmsign_verify::Padding;

/// 1024-bit keys keep simulator key generation quick
pub fn fast_policy(scheme: SignatureScheme) -> KeyPolicy {
    KeyPolicy {
        primary_key_bits: 1024,
        signing_key_bits: 1024,
        scheme,
        ..KeyPolicy::default()
    }
}

pub fn handle_files(dir: &Path) -> HandleFiles {
    HandleFiles::new(dir.join("primary.bin"), dir.join("key.bin"))
}

pub fn provision(sim: &Simulator, dir: &Path, policy: &KeyPolicy) -> (HandleFiles, ProvisionedKey) {
    let files = handle_files(dir);
    let key = Provisioner::new(sim, policy).provision(&files).unwrap();
    (files, key)
}

pub fn padding(scheme: SignatureScheme) -> Padding {
    match scheme {
        SignatureScheme::RsaSsa => Padding::Pkcs1v15,
        SignatureScheme::RsaPss => Padding::Pss,
    }
}

pub fn transient_count(sim: &Simulator) -> usize {
    sim.handles(HandleKind::Transient).len()
}
