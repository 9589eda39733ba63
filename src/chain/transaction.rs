// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Types describing on-chain transactions.

use bitcoin::hashes::Hash;
use bitcoin::transaction::OutPoint as BitcoinOutPoint;
use bitcoin::Txid;

/// A reference to a transaction output.
///
/// Differs from bitcoin::transaction::OutPoint as the index is a u16 instead of u32: the contract
/// output of a funding transaction is always at a small, fixed index.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct OutPoint {
	/// The referenced transaction's txid.
	pub txid: Txid,
	/// The index of the referenced output in its transaction's vout.
	pub index: u16,
}

impl OutPoint {
	/// Creates a new `OutPoint` from the txid and the index of the output.
	pub fn new(txid: Txid, index: u16) -> OutPoint {
		OutPoint { txid, index }
	}

	/// Converts this OutPoint into the OutPoint field as used by rust-bitcoin.
	pub fn into_bitcoin_outpoint(self) -> BitcoinOutPoint {
		BitcoinOutPoint { txid: self.txid, vout: self.index as u32 }
	}

	/// Derives the channel id this funding outpoint identifies. A channel is identified by its
	/// funding transaction id; the contract output is always output 0.
	pub fn to_channel_id(&self) -> [u8; 32] {
		self.txid.to_byte_array()
	}
}

impl core::fmt::Display for OutPoint {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		write!(f, "{}:{}", self.txid, self.index)
	}
}
