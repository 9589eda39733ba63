// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various utilities for building the scripts and signatures channel transactions are made of.
//!
//! All channel transactions are legacy (pre-segwit): the contract output is a bare 2-of-2
//! CHECKMULTISIG, balance outputs on the funding and first fallback are P2PKH, and repriced
//! commitments encumber both balance outputs with a `OP_HASH160 <payment hash> OP_EQUALVERIFY
//! <owner key> OP_CHECKSIG` hash-lock. Signatures are DER-encoded with a SIGHASH_ALL suffix and
//! carried in scriptSigs.

use bitcoin::opcodes;
use bitcoin::script::{Builder, Instruction, PushBytesBuf, Script, ScriptBuf};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::EcdsaSighashType;

use crate::chain::keysinterface::NodeSigner;
use crate::ln::channelmanager::PaymentHash;

use core::ops::Deref;

/// Builds the 2-of-2 contract output script funding a channel. The initiator's key is always
/// pushed first; scriptSigs satisfying this script must order their signatures the same way.
pub fn make_funding_redeemscript(initiator: &PublicKey, responder: &PublicKey) -> ScriptBuf {
	Builder::new()
		.push_opcode(opcodes::all::OP_PUSHNUM_2)
		.push_slice(initiator.serialize())
		.push_slice(responder.serialize())
		.push_opcode(opcodes::all::OP_PUSHNUM_2)
		.push_opcode(opcodes::all::OP_CHECKMULTISIG)
		.into_script()
}

/// Builds the hash-lock script encumbering one balance output of a repriced commitment: the
/// output's owner may spend it only by revealing the payment preimage.
pub fn make_hashlock_script(payment_hash: &PaymentHash, owner: &PublicKey) -> ScriptBuf {
	Builder::new()
		.push_opcode(opcodes::all::OP_HASH160)
		.push_slice(payment_hash.0)
		.push_opcode(opcodes::all::OP_EQUALVERIFY)
		.push_slice(owner.serialize())
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.into_script()
}

/// Builds the P2PKH script paying the given identity key, used for balance and redeem outputs.
pub fn get_p2pkh_script(key: &PublicKey) -> ScriptBuf {
	ScriptBuf::new_p2pkh(&bitcoin::PublicKey::new(*key).pubkey_hash())
}

/// DER-encodes a signature and appends the SIGHASH_ALL byte, the form scripts expect.
pub fn encode_signature(sig: &Signature) -> Vec<u8> {
	let mut sig_ser = sig.serialize_der().to_vec();
	sig_ser.push(EcdsaSighashType::All as u8);
	sig_ser
}

/// Signs the given legacy input with the node identity key and returns the encoded signature.
pub fn sign_input<S: Deref>(
	signer: &S, tx: &bitcoin::Transaction, input_index: usize, script_code: &Script,
) -> Result<Vec<u8>, ()>
where
	S::Target: NodeSigner,
{
	let sig = signer.sign_channel_input(tx, input_index, script_code)?;
	Ok(encode_signature(&sig))
}

fn push_bytes(data: Vec<u8>) -> Result<PushBytesBuf, ()> {
	PushBytesBuf::try_from(data).map_err(|_| ())
}

/// Builds a scriptSig carrying a single signature, the half-signed form of a fallback or
/// commitment input awaiting the counterparty's signature.
pub fn single_sig_script(sig: Vec<u8>) -> Result<ScriptBuf, ()> {
	Ok(Builder::new().push_slice(push_bytes(sig)?).into_script())
}

/// Builds the full scriptSig satisfying the 2-of-2 contract script, with the CHECKMULTISIG
/// dummy and the signatures in initiator-first order.
pub fn multisig_script_sig(initiator_sig: Vec<u8>, responder_sig: Vec<u8>) -> Result<ScriptBuf, ()> {
	Ok(Builder::new()
		.push_opcode(opcodes::OP_0)
		.push_slice(push_bytes(initiator_sig)?)
		.push_slice(push_bytes(responder_sig)?)
		.into_script())
}

/// Builds the scriptSig of a redeem transaction claiming one of our balance outputs: the
/// signature followed by the hash-lock preimage, or by our public key for P2PKH outputs on a
/// never-repriced fallback.
pub fn redeem_script_sig(sig: Vec<u8>, claim: Option<&[u8; 20]>, key: &PublicKey) -> Result<ScriptBuf, ()> {
	let builder = Builder::new().push_slice(push_bytes(sig)?);
	Ok(match claim {
		Some(preimage) => builder.push_slice(*preimage),
		None => builder.push_slice(key.serialize()),
	}
	.into_script())
}

/// Extracts the first data push of a scriptSig, i.e. the counterparty's partial signature on a
/// half-signed transaction.
pub fn extract_first_push(script: &Script) -> Result<Vec<u8>, ()> {
	match script.instructions().next() {
		Some(Ok(Instruction::PushBytes(push))) if !push.is_empty() => Ok(push.as_bytes().to_vec()),
		_ => Err(()),
	}
}
