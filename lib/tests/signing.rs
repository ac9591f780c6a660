use std::collections::HashMap;
use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{ecdsa::Signature, All, Message, Secp256k1};
use bitcoin::{
    absolute, transaction, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};

use bitbox_host::{
    sign_transaction, verify_transaction, AddressChain, Error, PreviousOutput, ScriptType,
    SigningKeystore,
};

mod helpers;

const ACCOUNT_PATH: &str = "m/44'/0'/0'";

/// Software stand-in for the device: derives keys from a master private key
/// and signs each hash at its requested path.
struct SoftKeystore {
    master: Xpriv,
    secp: Secp256k1<All>,
}

impl SoftKeystore {
    fn new() -> Self {
        Self {
            master: Xpriv::new_master(Network::Bitcoin, &[7u8; 64]).unwrap(),
            secp: Secp256k1::new(),
        }
    }

    fn account_xpub(&self) -> Xpub {
        let path = DerivationPath::from_str(ACCOUNT_PATH).unwrap();
        let account = self.master.derive_priv(&self.secp, &path).unwrap();
        Xpub::from_priv(&self.secp, &account)
    }
}

impl SigningKeystore for SoftKeystore {
    fn sign(&self, hashes: &[[u8; 32]], keypaths: &[String]) -> Result<Vec<Signature>, Error> {
        hashes
            .iter()
            .zip(keypaths)
            .map(|(hash, keypath)| {
                let path = DerivationPath::from_str(keypath)?;
                let key = self.master.derive_priv(&self.secp, &path)?;
                Ok(self
                    .secp
                    .sign_ecdsa(&Message::from_digest(*hash), &key.private_key))
            })
            .collect()
    }
}

fn chain(keystore: &SoftKeystore, script_type: ScriptType, chain_index: u32) -> AddressChain {
    let mut chain = AddressChain::new(
        &keystore.account_xpub(),
        Network::Bitcoin,
        script_type,
        ACCOUNT_PATH,
        chain_index,
        3,
    )
    .unwrap();
    chain.ensure_addresses().unwrap();
    chain
}

fn outpoint(txid_byte: u8) -> OutPoint {
    OutPoint {
        txid: Txid::from_str(&hex::encode([txid_byte; 32])).unwrap(),
        vout: 0,
    }
}

fn txin(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

/// One legacy and one native-segwit input, one change output; previous
/// outputs keyed by their outpoints.
fn test_transaction(
    keystore: &SoftKeystore,
) -> (Transaction, HashMap<OutPoint, PreviousOutput>) {
    let legacy = chain(keystore, ScriptType::P2pkh, 0);
    let segwit = chain(keystore, ScriptType::P2wpkh, 1);

    let mut previous_outputs = HashMap::new();
    previous_outputs.insert(
        outpoint(1),
        PreviousOutput {
            value: Amount::from_sat(100_000),
            script_pubkey: legacy.addresses()[0].script_pubkey(),
            address: legacy.addresses()[0].clone(),
        },
    );
    previous_outputs.insert(
        outpoint(2),
        PreviousOutput {
            value: Amount::from_sat(50_000),
            script_pubkey: segwit.addresses()[0].script_pubkey(),
            address: segwit.addresses()[0].clone(),
        },
    );

    let tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![txin(outpoint(1)), txin(outpoint(2))],
        output: vec![TxOut {
            value: Amount::from_sat(140_000),
            script_pubkey: segwit.addresses()[1].script_pubkey(),
        }],
    };
    (tx, previous_outputs)
}

#[test]
fn signs_and_validates_mixed_inputs() {
    helpers::init_logging();
    let keystore = SoftKeystore::new();
    let (mut tx, previous_outputs) = test_transaction(&keystore);

    sign_transaction(&keystore, &mut tx, &previous_outputs).unwrap();

    // Legacy input carries a signature script, no witness.
    assert!(!tx.input[0].script_sig.is_empty());
    assert!(tx.input[0].witness.is_empty());
    // Segwit input carries a witness, empty signature script.
    assert!(tx.input[1].script_sig.is_empty());
    assert_eq!(tx.input[1].witness.len(), 2);

    // Validation is a pure function of the assembled transaction.
    verify_transaction(&tx, &previous_outputs).unwrap();
    verify_transaction(&tx, &previous_outputs).unwrap();
}

#[test]
fn wrapped_segwit_input_carries_the_redeem_script() {
    let keystore = SoftKeystore::new();
    let wrapped = chain(&keystore, ScriptType::P2shP2wpkh, 0);

    let mut previous_outputs = HashMap::new();
    previous_outputs.insert(
        outpoint(9),
        PreviousOutput {
            value: Amount::from_sat(75_000),
            script_pubkey: wrapped.addresses()[0].script_pubkey(),
            address: wrapped.addresses()[0].clone(),
        },
    );
    let mut tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![txin(outpoint(9))],
        output: vec![TxOut {
            value: Amount::from_sat(74_000),
            script_pubkey: wrapped.addresses()[1].script_pubkey(),
        }],
    };

    sign_transaction(&keystore, &mut tx, &previous_outputs).unwrap();
    assert!(!tx.input[0].script_sig.is_empty());
    assert_eq!(tx.input[0].witness.len(), 2);
}

#[test]
fn tampering_after_assembly_fails_validation() {
    let keystore = SoftKeystore::new();
    let (mut tx, previous_outputs) = test_transaction(&keystore);
    sign_transaction(&keystore, &mut tx, &previous_outputs).unwrap();

    tx.output[0].value = Amount::from_sat(140_001);
    let err = verify_transaction(&tx, &previous_outputs).unwrap_err();
    assert!(matches!(err, Error::ScriptVerification { .. }));
}

#[test]
fn missing_previous_output_aborts_before_signing() {
    let keystore = SoftKeystore::new();
    let (mut tx, mut previous_outputs) = test_transaction(&keystore);
    previous_outputs.remove(&outpoint(2));

    let err = sign_transaction(&keystore, &mut tx, &previous_outputs).unwrap_err();
    assert!(matches!(err, Error::MissingPreviousOutput(_)));
    // Nothing was assembled.
    assert!(tx.input.iter().all(|input| input.script_sig.is_empty()));
}

#[test]
fn non_canonical_ordering_is_rejected() {
    let keystore = SoftKeystore::new();
    let (mut tx, previous_outputs) = test_transaction(&keystore);
    tx.input.swap(0, 1);

    let err = sign_transaction(&keystore, &mut tx, &previous_outputs).unwrap_err();
    assert!(matches!(err, Error::NotCanonicallyOrdered));
}
