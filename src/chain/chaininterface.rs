// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Traits and utility impls which allow other parts of txchain to interact with the blockchain
//! and the client's wallet.
//!
//! Includes traits for broadcasting transactions, querying chain height and confirmation depth,
//! receiving notifications of new best blocks, and the wallet operations a channel needs: UTXO
//! selection for funding, signing of wallet-owned inputs, and tracking of channel transactions.

use bitcoin::transaction::{OutPoint, Transaction, TxOut};
use bitcoin::{Amount, Txid};

/// An interface to send a transaction to the Bitcoin network.
pub trait BroadcasterInterface: Sync + Send {
	/// Sends a list of transactions out to (hopefully) be mined.
	///
	/// Implementations should be robust against duplicates: closing a channel may rebroadcast a
	/// fallback transaction the counterparty already put on chain.
	fn broadcast_transactions(&self, txs: &[&Transaction]);
}

/// A view of the best chain, used to drive channel lifecycle decisions.
pub trait ChainSource: Sync + Send {
	/// Returns the height of the best known block.
	fn best_height(&self) -> u32;

	/// Returns the number of confirmations the given transaction has, if it is known to be in
	/// the best chain at all. A transaction in the best block has depth 1.
	fn confirmation_depth(&self, txid: &Txid) -> Option<u32>;
}

/// An unspent wallet output offered as a funding input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
	/// The unique identifier of the output.
	pub outpoint: OutPoint,
	/// The output itself, carrying the value and the script the wallet can satisfy.
	pub output: TxOut,
}

/// The wallet half of the ledger adapter.
///
/// Channels never hold keys to wallet-level outputs; everything spending or tracking them goes
/// through this trait. Failures are opaque `Err(())`s, which the channel layer surfaces as
/// ledger errors aborting the operation in progress.
pub trait WalletSource: Sync + Send {
	/// Selects confirmed outputs with a total value of at least `target_value`.
	///
	/// Outputs returned here may be referenced by a funding transaction that is broadcast later,
	/// so implementations must not hand the same output to two concurrent selections.
	fn select_utxos(&self, target_value: Amount) -> Result<Vec<Utxo>, ()>;

	/// Signs every input of `tx` which spends an output this wallet owns, leaving other inputs
	/// untouched.
	fn sign_owned_inputs(&self, tx: Transaction) -> Result<Transaction, ()>;

	/// Adds a transaction to the wallet's view, as unconfirmed, so its outputs and spends are
	/// tracked.
	fn register_tx(&self, tx: &Transaction);

	/// Returns the tracked transaction which spends the given outpoint, if any. Used to discover
	/// that the counterparty broadcast a newer fallback than the one we hold.
	fn find_output_spender(&self, outpoint: &OutPoint) -> Option<Transaction>;
}

/// The `Listen` trait is used to notify txchain of a new best block.
///
/// Clients must deliver every new best block exactly once, in order; channel state only advances
/// lazily in response to these notifications (there are no internal timers).
pub trait Listen {
	/// Notifies that the best chain tip moved to the given height.
	fn best_block_updated(&self, height: u32);
}
