// Copyright (c) 2023 Shift Crypto AG

//! Watch-only addresses
//!
//! An [`Address`] wraps one child public key together with everything needed
//! to both receive to it and later spend from it: the rendered address, the
//! script used for sighash computation, and the unlocking script / witness
//! layout for its script type. Addresses are created by the chain manager
//! in strictly increasing index order and are immutable apart from the
//! used flag.

use std::fmt;

use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::Hash;
use bitcoin::{CompressedPublicKey, EcdsaSighashType, Network, ScriptBuf, Witness};

/// Supported output script kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum ScriptType {
    /// Legacy pay-to-pubkey-hash.
    P2pkh,
    /// Native segwit v0 pay-to-witness-pubkey-hash.
    P2wpkh,
    /// Segwit v0 wrapped in P2SH for compatibility with old senders.
    P2shP2wpkh,
}

impl ScriptType {
    /// Whether inputs of this type sign with the BIP143 witness sighash.
    pub fn is_segwit(self) -> bool {
        !matches!(self, ScriptType::P2pkh)
    }
}

/// One derived address of an address chain.
#[derive(Clone, Debug)]
pub struct Address {
    public_key: CompressedPublicKey,
    address: bitcoin::Address,
    script_type: ScriptType,
    /// Absolute derivation path, as sent to the device when signing.
    key_path: String,
    used: bool,
}

impl Address {
    pub fn new(
        public_key: CompressedPublicKey,
        network: Network,
        script_type: ScriptType,
        key_path: String,
    ) -> Self {
        let address = match script_type {
            ScriptType::P2pkh => bitcoin::Address::p2pkh(public_key.pubkey_hash(), network),
            ScriptType::P2wpkh => bitcoin::Address::p2wpkh(&public_key, network),
            ScriptType::P2shP2wpkh => bitcoin::Address::p2shwpkh(&public_key, network),
        };
        Self {
            public_key,
            address,
            script_type,
            key_path,
            used: false,
        }
    }

    pub fn public_key(&self) -> &CompressedPublicKey {
        &self.public_key
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    /// Absolute derivation path of the underlying key.
    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    /// Whether this address was observed in chain history.
    pub fn is_used(&self) -> bool {
        self.used
    }

    pub fn mark_used(&mut self) {
        self.used = true;
    }

    /// The locking script of outputs paying to this address.
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    /// Whether spending from this address signs with the witness sighash.
    pub fn is_segwit(&self) -> bool {
        self.script_type.is_segwit()
    }

    /// The script hashed when signing an input that spends this address.
    ///
    /// For wrapped segwit this is the redeem script, not the P2SH locking
    /// script; the witness sighash derives its script code from it.
    pub fn sighash_script(&self) -> ScriptBuf {
        match self.script_type {
            ScriptType::P2pkh | ScriptType::P2wpkh => self.script_pubkey(),
            ScriptType::P2shP2wpkh => ScriptBuf::new_p2wpkh(&self.public_key.wpubkey_hash()),
        }
    }

    /// The signature script of an assembled input spending this address,
    /// minus any signature material: empty for native segwit, the redeem
    /// script push for wrapped segwit, none (signature-dependent) for
    /// legacy.
    pub fn static_script_sig(&self) -> Option<ScriptBuf> {
        match self.script_type {
            ScriptType::P2pkh => None,
            ScriptType::P2wpkh => Some(ScriptBuf::new()),
            ScriptType::P2shP2wpkh => Some(
                Builder::new()
                    .push_slice(self.redeem_script_bytes())
                    .into_script(),
            ),
        }
    }

    /// The redeem script push occupying the signature script of a wrapped
    /// segwit input (version byte, hash length, 20-byte key hash).
    fn redeem_script_bytes(&self) -> [u8; 22] {
        let mut redeem = [0u8; 22];
        redeem[1] = 0x14;
        redeem[2..].copy_from_slice(&self.public_key.wpubkey_hash().to_byte_array());
        redeem
    }

    /// Build the unlocking data for an input spending this address from a
    /// raw signature: the signature script and witness stack, either of
    /// which may be empty depending on the script type.
    pub fn input_data(
        &self,
        signature: &bitcoin::secp256k1::ecdsa::Signature,
    ) -> (ScriptBuf, Witness) {
        let signature = bitcoin::ecdsa::Signature {
            signature: *signature,
            sighash_type: EcdsaSighashType::All,
        };
        match self.script_type {
            ScriptType::P2pkh => {
                let script_sig = Builder::new()
                    .push_slice(signature.serialize())
                    .push_slice(self.public_key.to_bytes())
                    .into_script();
                (script_sig, Witness::new())
            }
            ScriptType::P2wpkh => {
                let witness = Witness::p2wpkh(&signature, &self.public_key.0);
                (ScriptBuf::new(), witness)
            }
            ScriptType::P2shP2wpkh => {
                let script_sig = Builder::new()
                    .push_slice(self.redeem_script_bytes())
                    .into_script();
                let witness = Witness::p2wpkh(&signature, &self.public_key.0);
                (script_sig, witness)
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.address.fmt(f)
    }
}
