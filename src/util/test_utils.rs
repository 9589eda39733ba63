// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::{Amount, OutPoint, Transaction, TxOut, Txid};

use crate::chain::chaininterface;
use crate::chain::chaininterface::Utxo;
use crate::chain::keysinterface::{KeysManager, NodeSigner};
use crate::ln::chan_utils;
use crate::util::logger::{Logger, Record};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

pub struct TestLogger {
	id: String,
	pub lines: Mutex<Vec<String>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		Self::with_id("".to_owned())
	}
	pub fn with_id(id: String) -> TestLogger {
		TestLogger { id, lines: Mutex::new(Vec::new()) }
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		let line = format!("{} {}", record.level, record.args);
		self.lines.lock().unwrap().push(line);
		println!(
			"{:<5} {} [{} : {}] {}",
			record.level, self.id, record.module_path, record.line, record.args
		);
	}
}

pub struct TestBroadcaster {
	pub txn_broadcasted: Mutex<Vec<Transaction>>,
}

impl TestBroadcaster {
	pub fn new() -> TestBroadcaster {
		TestBroadcaster { txn_broadcasted: Mutex::new(Vec::new()) }
	}

	/// Drains every transaction broadcast since the last call.
	pub fn take_broadcasts(&self) -> Vec<Transaction> {
		self.txn_broadcasted.lock().unwrap().split_off(0)
	}
}

impl chaininterface::BroadcasterInterface for TestBroadcaster {
	fn broadcast_transactions(&self, txs: &[&Transaction]) {
		let mut broadcasted = self.txn_broadcasted.lock().unwrap();
		broadcasted.extend(txs.iter().map(|tx| (*tx).clone()));
	}
}

/// A shared in-memory view of the best chain. Tests confirm transactions by hand and bump the
/// height, and every node of a scenario holds the same instance.
pub struct TestChainSource {
	best_height: AtomicU32,
	/// Height at which each confirmed transaction entered the chain.
	confirmed: Mutex<HashMap<Txid, u32>>,
}

impl TestChainSource {
	pub fn new(height: u32) -> TestChainSource {
		TestChainSource { best_height: AtomicU32::new(height), confirmed: Mutex::new(HashMap::new()) }
	}

	/// Marks a transaction as included in the current best block.
	pub fn confirm_transaction(&self, txid: Txid) {
		let height = self.best_height.load(Ordering::Acquire);
		self.confirmed.lock().unwrap().entry(txid).or_insert(height);
	}

	/// Extends the best chain by one empty block, returning the new height.
	pub fn advance_block(&self) -> u32 {
		self.best_height.fetch_add(1, Ordering::AcqRel) + 1
	}
}

impl chaininterface::ChainSource for TestChainSource {
	fn best_height(&self) -> u32 {
		self.best_height.load(Ordering::Acquire)
	}

	fn confirmation_depth(&self, txid: &Txid) -> Option<u32> {
		let confirmed = self.confirmed.lock().unwrap();
		let height = confirmed.get(txid)?;
		Some(self.best_height.load(Ordering::Acquire) - height + 1)
	}
}

/// An in-memory wallet holding P2PKH outputs under a single key, plus a registry of every
/// channel transaction it has been told about.
pub struct TestWallet {
	keys: KeysManager,
	available: Mutex<Vec<Utxo>>,
	/// Every output we control, kept even once reserved so we can sign spends of it.
	owned: Mutex<HashMap<OutPoint, TxOut>>,
	registered: Mutex<HashMap<Txid, Transaction>>,
	fake_txid_counter: AtomicU64,
}

impl TestWallet {
	pub fn new(seed: &[u8; 32]) -> TestWallet {
		TestWallet {
			keys: KeysManager::new(seed),
			available: Mutex::new(Vec::new()),
			owned: Mutex::new(HashMap::new()),
			registered: Mutex::new(HashMap::new()),
			fake_txid_counter: AtomicU64::new(0),
		}
	}

	/// Credits the wallet with a spendable output of the given value, as if it had received a
	/// confirmed payment.
	pub fn give_utxo(&self, value_sat: u64) -> Utxo {
		let counter = self.fake_txid_counter.fetch_add(1, Ordering::AcqRel);
		let mut engine = Sha256::engine();
		engine.input(b"txchain test utxo");
		engine.input(&self.keys.get_node_id().serialize());
		engine.input(&counter.to_be_bytes());
		let txid = Txid::from_byte_array(Sha256::from_engine(engine).to_byte_array());
		let utxo = Utxo {
			outpoint: OutPoint { txid, vout: 0 },
			output: TxOut {
				value: Amount::from_sat(value_sat),
				script_pubkey: chan_utils::get_p2pkh_script(&self.keys.get_node_id()),
			},
		};
		self.available.lock().unwrap().push(utxo.clone());
		self.owned.lock().unwrap().insert(utxo.outpoint, utxo.output.clone());
		utxo
	}
}

impl chaininterface::WalletSource for TestWallet {
	fn select_utxos(&self, target_value: Amount) -> Result<Vec<Utxo>, ()> {
		let mut available = self.available.lock().unwrap();
		let mut selected = Vec::new();
		let mut total = Amount::ZERO;
		while total < target_value {
			match available.pop() {
				Some(utxo) => {
					total += utxo.output.value;
					selected.push(utxo);
				},
				None => {
					// Not enough funds; put everything back.
					available.append(&mut selected);
					return Err(());
				},
			}
		}
		Ok(selected)
	}

	fn sign_owned_inputs(&self, mut tx: Transaction) -> Result<Transaction, ()> {
		let owned = self.owned.lock().unwrap();
		for index in 0..tx.input.len() {
			let spent = match owned.get(&tx.input[index].previous_output) {
				Some(output) => output.clone(),
				None => continue,
			};
			let sig = self.keys.sign_channel_input(&tx, index, &spent.script_pubkey)?;
			let sig_push =
				PushBytesBuf::try_from(chan_utils::encode_signature(&sig)).map_err(|_| ())?;
			tx.input[index].script_sig = Builder::new()
				.push_slice(sig_push)
				.push_slice(self.keys.get_node_id().serialize())
				.into_script();
		}
		Ok(tx)
	}

	fn register_tx(&self, tx: &Transaction) {
		self.registered.lock().unwrap().insert(tx.compute_txid(), tx.clone());
	}

	fn find_output_spender(&self, outpoint: &OutPoint) -> Option<Transaction> {
		let registered = self.registered.lock().unwrap();
		registered
			.values()
			.find(|tx| tx.input.iter().any(|input| input.previous_output == *outpoint))
			.cloned()
	}
}
