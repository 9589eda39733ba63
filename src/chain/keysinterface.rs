// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! keysinterface provides keys into txchain and defines the signing operations channels require
//! of the client. A node has a single identity key: it names the node to its peers, appears in
//! every contract output the node co-signs, and receives the node's side of every balance and
//! redeem output.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::script::Script;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{self, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Transaction;
use bitcoin::EcdsaSighashType;

use std::sync::atomic::{AtomicU64, Ordering};

/// A trait that describes a source of entropy, used to generate payment secrets.
pub trait EntropySource: Sync + Send {
	/// Gets a unique, cryptographically-secure random 32-byte value. This method must return a
	/// different value each time it is called.
	fn get_secure_random_bytes(&self) -> [u8; 32];
}

/// A trait that can sign channel transactions with the node's identity key.
///
/// All channel transactions here are legacy (pre-segwit); `script_code` is the scriptPubKey of
/// the output being spent.
pub trait NodeSigner: Sync + Send {
	/// Gets the node's identity public key.
	fn get_node_id(&self) -> PublicKey;

	/// Produces an ECDSA signature over the legacy SIGHASH_ALL digest of the given input.
	///
	/// An `Err` aborts the channel operation in progress without mutating channel state.
	fn sign_channel_input(
		&self, tx: &Transaction, input_index: usize, script_code: &Script,
	) -> Result<Signature, ()>;
}

/// A simple implementation of [`EntropySource`] and [`NodeSigner`] that holds the identity key
/// in memory and derives its entropy deterministically from a seed and a counter.
pub struct KeysManager {
	node_secret: SecretKey,
	node_id: PublicKey,
	entropy_seed: [u8; 32],
	entropy_counter: AtomicU64,
	secp_ctx: Secp256k1<secp256k1::All>,
}

impl KeysManager {
	/// Constructs a `KeysManager` from a 32-byte seed. The seed must be unique per node and, if
	/// the node's channels are to survive a restart, must be re-supplied unchanged.
	pub fn new(seed: &[u8; 32]) -> KeysManager {
		let secp_ctx = Secp256k1::new();
		let mut engine = Sha256::engine();
		engine.input(b"txchain node secret");
		engine.input(seed);
		let node_secret = SecretKey::from_slice(&Sha256::from_engine(engine).to_byte_array())
			.expect("32 bytes of sha256 output is a valid secret key");
		let node_id = PublicKey::from_secret_key(&secp_ctx, &node_secret);
		KeysManager {
			node_secret,
			node_id,
			entropy_seed: *seed,
			entropy_counter: AtomicU64::new(0),
			secp_ctx,
		}
	}
}

impl EntropySource for KeysManager {
	fn get_secure_random_bytes(&self) -> [u8; 32] {
		let counter = self.entropy_counter.fetch_add(1, Ordering::AcqRel);
		let mut engine = Sha256::engine();
		engine.input(b"txchain entropy");
		engine.input(&self.entropy_seed);
		engine.input(&counter.to_be_bytes());
		Sha256::from_engine(engine).to_byte_array()
	}
}

impl NodeSigner for KeysManager {
	fn get_node_id(&self) -> PublicKey {
		self.node_id
	}

	fn sign_channel_input(
		&self, tx: &Transaction, input_index: usize, script_code: &Script,
	) -> Result<Signature, ()> {
		let sighash = SighashCache::new(tx)
			.legacy_signature_hash(input_index, script_code, EcdsaSighashType::All.to_u32())
			.map_err(|_| ())?;
		let msg = Message::from_digest(sighash.to_byte_array());
		Ok(self.secp_ctx.sign_ecdsa(&msg, &self.node_secret))
	}
}
