// Copyright (c) 2023 Shift Crypto AG

//! Transaction signing pipeline
//!
//! Signs every input of an assembled-but-unsigned transaction in a single
//! pass: compute sighashes, delegate the full batch to a signing backend,
//! build the unlocking scripts and witnesses, then re-verify the finished
//! transaction. No partial commit: either all inputs end up signed and
//! validated or the call fails with the transaction contents unspecified.

use std::collections::HashMap;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::Signature, Message, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::{Amount, EcdsaSighashType, OutPoint, ScriptBuf, Transaction, TxIn, TxOut};
use log::{debug, info};

use crate::{Address, Error};

/// A backend able to sign a batch of 32-byte hashes with the keys at the
/// given derivation paths, preserving order.
pub trait SigningKeystore {
    fn sign(&self, hashes: &[[u8; 32]], keypaths: &[String]) -> Result<Vec<Signature>, Error>;
}

/// The output an input spends, with the address owning it. The caller
/// supplies one entry per input.
#[derive(Clone, Debug)]
pub struct PreviousOutput {
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
    pub address: Address,
}

/// Sign all inputs of `transaction` in place.
///
/// Inputs and outputs must already be in canonical order; this verifies but
/// never reorders, since reordering after sighash computation would
/// invalidate the signatures. The final verification failing means a
/// signing or assembly bug, not bad input, and is surfaced as
/// [`Error::ScriptVerification`].
pub fn sign_transaction(
    keystore: &impl SigningKeystore,
    transaction: &mut Transaction,
    previous_outputs: &HashMap<OutPoint, PreviousOutput>,
) -> Result<(), Error> {
    info!("signing transaction with {} inputs", transaction.input.len());

    let (hashes, keypaths) = compute_sighashes(transaction, previous_outputs)?;

    let signatures = keystore.sign(&hashes, &keypaths)?;
    if signatures.len() != transaction.input.len() {
        return Err(Error::SignatureCount {
            expected: transaction.input.len(),
            actual: signatures.len(),
        });
    }

    for (input, signature) in transaction.input.iter_mut().zip(&signatures) {
        // compute_sighashes already proved the entry exists.
        let previous = previous_outputs
            .get(&input.previous_output)
            .ok_or(Error::MissingPreviousOutput(input.previous_output))?;
        let (script_sig, witness) = previous.address.input_data(signature);
        input.script_sig = script_sig;
        input.witness = witness;
    }

    verify_transaction(transaction, previous_outputs)
}

/// Compute one sighash per input, always with the "sign all" hash type.
/// Segwit inputs use the BIP143 witness digest, legacy inputs the classic
/// whole-subscript digest; both share one per-transaction hash cache.
fn compute_sighashes(
    transaction: &Transaction,
    previous_outputs: &HashMap<OutPoint, PreviousOutput>,
) -> Result<(Vec<[u8; 32]>, Vec<String>), Error> {
    let mut hashes = Vec::with_capacity(transaction.input.len());
    let mut keypaths = Vec::with_capacity(transaction.input.len());
    let mut cache = SighashCache::new(transaction);

    for (index, input) in transaction.input.iter().enumerate() {
        let previous = previous_outputs
            .get(&input.previous_output)
            .ok_or(Error::MissingPreviousOutput(input.previous_output))?;
        let hash = input_sighash(&mut cache, index, previous)?;
        debug!(
            "input {}: sighash {} for key {}",
            index,
            hex::encode(hash),
            previous.address.key_path()
        );
        hashes.push(hash);
        keypaths.push(previous.address.key_path().to_owned());
    }
    Ok((hashes, keypaths))
}

fn input_sighash(
    cache: &mut SighashCache<&Transaction>,
    index: usize,
    previous: &PreviousOutput,
) -> Result<[u8; 32], Error> {
    let script = previous.address.sighash_script();
    if previous.address.is_segwit() {
        let hash = cache
            .p2wpkh_signature_hash(index, &script, previous.value, EcdsaSighashType::All)
            .map_err(|e| Error::Sighash {
                input: index,
                reason: e.to_string(),
            })?;
        Ok(hash.to_byte_array())
    } else {
        let hash = cache
            .legacy_signature_hash(index, &script, EcdsaSighashType::All.to_u32())
            .map_err(|e| Error::Sighash {
                input: index,
                reason: e.to_string(),
            })?;
        Ok(hash.to_byte_array())
    }
}

/// Re-verify a fully assembled transaction: canonical ordering, previous
/// output scripts matching the owning addresses, and every input's
/// signature checking out against a freshly computed sighash.
///
/// Pure in the transaction and previous outputs; verifying twice yields the
/// same verdict.
pub fn verify_transaction(
    transaction: &Transaction,
    previous_outputs: &HashMap<OutPoint, PreviousOutput>,
) -> Result<(), Error> {
    if !inputs_canonically_ordered(&transaction.input)
        || !outputs_canonically_ordered(&transaction.output)
    {
        return Err(Error::NotCanonicallyOrdered);
    }

    let secp = Secp256k1::verification_only();
    let mut cache = SighashCache::new(transaction);
    for (index, input) in transaction.input.iter().enumerate() {
        let previous = previous_outputs
            .get(&input.previous_output)
            .ok_or(Error::MissingPreviousOutput(input.previous_output))?;
        let fail = |reason: String| Error::ScriptVerification {
            input: index,
            reason,
        };

        if previous.script_pubkey != previous.address.script_pubkey() {
            return Err(fail("locking script does not pay to the owning address".into()));
        }

        let signature = extract_signature(input, previous).map_err(fail)?;
        let hash = input_sighash(&mut cache, index, previous)?;
        secp.verify_ecdsa(
            &Message::from_digest(hash),
            &signature.signature,
            &previous.address.public_key().0,
        )
        .map_err(|e| fail(e.to_string()))?;
    }
    Ok(())
}

/// Pull the DER signature out of an input's unlocking data, checking that
/// the surrounding structure matches what the owning address expects.
fn extract_signature(
    input: &TxIn,
    previous: &PreviousOutput,
) -> Result<bitcoin::ecdsa::Signature, String> {
    if previous.address.is_segwit() {
        match previous.address.static_script_sig() {
            Some(expected) if input.script_sig == expected => {}
            _ => return Err("unexpected signature script for segwit input".into()),
        }
        let sig_bytes = input.witness.nth(0).ok_or("empty witness stack")?;
        let pubkey_bytes = input.witness.nth(1).ok_or("witness missing public key")?;
        if pubkey_bytes != previous.address.public_key().to_bytes() {
            return Err("witness public key does not match the owning address".into());
        }
        bitcoin::ecdsa::Signature::from_slice(sig_bytes).map_err(|e| e.to_string())
    } else {
        if !input.witness.is_empty() {
            return Err("unexpected witness on legacy input".into());
        }
        let mut pushes = input.script_sig.instructions();
        let sig_bytes = match pushes.next() {
            Some(Ok(bitcoin::script::Instruction::PushBytes(bytes))) => bytes,
            Some(Ok(_)) => return Err("signature script does not start with a push".into()),
            _ => return Err("malformed signature script".into()),
        };
        let pubkey_bytes = match pushes.next() {
            Some(Ok(bitcoin::script::Instruction::PushBytes(bytes))) => bytes,
            Some(Ok(_)) => return Err("signature script missing public key push".into()),
            _ => return Err("malformed signature script".into()),
        };
        if pubkey_bytes.as_bytes() != previous.address.public_key().to_bytes() {
            return Err("public key does not match the owning address".into());
        }
        bitcoin::ecdsa::Signature::from_slice(sig_bytes.as_bytes()).map_err(|e| e.to_string())
    }
}

/// BIP69 input ordering: previous txid in display (reversed) byte order,
/// then output index.
fn inputs_canonically_ordered(inputs: &[TxIn]) -> bool {
    inputs.windows(2).all(|pair| {
        input_sort_key(&pair[0]) <= input_sort_key(&pair[1])
    })
}

fn input_sort_key(input: &TxIn) -> ([u8; 32], u32) {
    let mut txid = input.previous_output.txid.to_byte_array();
    txid.reverse();
    (txid, input.previous_output.vout)
}

/// BIP69 output ordering: value ascending, then locking script bytes.
fn outputs_canonically_ordered(outputs: &[TxOut]) -> bool {
    outputs.windows(2).all(|pair| {
        (pair[0].value, pair[0].script_pubkey.as_bytes())
            <= (pair[1].value, pair[1].script_pubkey.as_bytes())
    })
}
