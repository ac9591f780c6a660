// Copyright (c) 2023 Shift Crypto AG

//! Gap-limited address chain
//!
//! Derives a receive or change chain from an account-level extended public
//! key. The sequence is append-only and strictly sequential from index 0;
//! after every sync exactly `gap_limit` unused addresses sit at the tail,
//! so scanning software knows where derived-but-unobserved addresses end.

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::secp256k1::{self, Secp256k1};
use bitcoin::{CompressedPublicKey, Network, NetworkKind, Script};
use log::debug;

use crate::{Address, Error, ScriptType};

/// One BIP32 chain (external receive or internal change) of an account.
#[derive(Debug)]
pub struct AddressChain {
    chain_xpub: Xpub,
    network: Network,
    script_type: ScriptType,
    /// Absolute path of the account key, prefixed onto every address path.
    key_path_prefix: String,
    chain_index: u32,
    gap_limit: usize,
    addresses: Vec<Address>,
    secp: Secp256k1<secp256k1::VerifyOnly>,
}

impl AddressChain {
    /// Derive the chain key `account_xpub/chain_index` and start an empty
    /// chain. Fails if the key belongs to the wrong network; private keys
    /// cannot reach this layer, [`Xpub`] carries none.
    pub fn new(
        account_xpub: &Xpub,
        network: Network,
        script_type: ScriptType,
        key_path_prefix: &str,
        chain_index: u32,
        gap_limit: usize,
    ) -> Result<Self, Error> {
        if account_xpub.network != NetworkKind::from(network) {
            return Err(Error::XpubNetworkMismatch);
        }
        let secp = Secp256k1::verification_only();
        let chain_xpub =
            account_xpub.ckd_pub(&secp, ChildNumber::from_normal_idx(chain_index)?)?;
        Ok(Self {
            chain_xpub,
            network,
            script_type,
            key_path_prefix: key_path_prefix.trim_end_matches('/').to_owned(),
            chain_index,
            gap_limit,
            addresses: Vec::new(),
            secp,
        })
    }

    fn derive(&self, index: u32) -> Result<Address, Error> {
        let child = self
            .chain_xpub
            .ckd_pub(&self.secp, ChildNumber::from_normal_idx(index)?)?;
        let public_key = CompressedPublicKey(child.public_key);
        let key_path = format!("{}/{}/{}", self.key_path_prefix, self.chain_index, index);
        Ok(Address::new(
            public_key,
            self.network,
            self.script_type,
            key_path,
        ))
    }

    /// Number of unused addresses at the tail.
    fn unused_tail_count(&self) -> usize {
        self.addresses
            .iter()
            .rev()
            .take_while(|address| !address.is_used())
            .count()
    }

    /// Append addresses until exactly `gap_limit` unused ones trail the
    /// chain, returning only the newly created ones. Idempotent once the
    /// invariant holds.
    pub fn ensure_addresses(&mut self) -> Result<&[Address], Error> {
        let first_new = self.addresses.len();
        while self.unused_tail_count() < self.gap_limit {
            let index = self.addresses.len() as u32;
            let address = self.derive(index)?;
            debug!(
                "chain {}: derived address {} at {}",
                self.chain_index,
                address,
                address.key_path()
            );
            self.addresses.push(address);
        }
        Ok(&self.addresses[first_new..])
    }

    /// The lowest-index unused address.
    ///
    /// Requires the tail invariant to hold; a violation means the caller
    /// skipped [`Self::ensure_addresses`] after marking addresses used, and
    /// silently returning an address here could hand out a reused or
    /// unscanned one.
    pub fn get_unused(&self) -> Result<&Address, Error> {
        let unused_tail = self.unused_tail_count();
        if unused_tail != self.gap_limit {
            return Err(Error::GapLimitViolation {
                expected: self.gap_limit,
                actual: unused_tail,
            });
        }
        // The tail invariant guarantees at least one unused address.
        self.addresses
            .iter()
            .find(|address| !address.is_used())
            .ok_or(Error::GapLimitViolation {
                expected: self.gap_limit,
                actual: 0,
            })
    }

    /// Whether `script` pays to an address of this chain.
    pub fn contains(&self, script: &Script) -> bool {
        self.lookup(script).is_some()
    }

    /// The derived address locked by `script`, if any.
    pub fn lookup(&self, script: &Script) -> Option<&Address> {
        self.addresses
            .iter()
            .find(|address| address.script_pubkey() == *script)
    }

    /// Mark the address locked by `script` as used. Returns whether a
    /// matching address existed; the tail invariant must be re-established
    /// with [`Self::ensure_addresses`] afterwards.
    pub fn mark_used(&mut self, script: &Script) -> bool {
        match self
            .addresses
            .iter_mut()
            .find(|address| address.script_pubkey() == *script)
        {
            Some(address) => {
                address.mark_used();
                true
            }
            None => false,
        }
    }

    /// All derived addresses, lowest index first.
    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }
}
