// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Messages exchanged between peers and the handler trait a peer exposes to its counterparties.
//!
//! Transport is out of scope: a [`PeerMessageHandler`] is invoked directly by the counterparty's
//! node, and a real deployment would put a serialization and network layer between the two. The
//! messages carry full transactions rather than detached signatures, matching what would go over
//! the wire.

use bitcoin::secp256k1::PublicKey;
use bitcoin::Transaction;

use crate::chain::chaininterface::Utxo;
use crate::ln::channelmanager::{PaymentHash, PaymentPreimage};
use crate::util::config::ChannelTerms;

use std::sync::Arc;

/// The first round of the funding handshake: the initiator proposes terms and offers the wallet
/// inputs covering its own contribution. The responder replies with the funding transaction,
/// signed on its own inputs only.
#[derive(Clone, Debug)]
pub struct FundingProposal {
	/// The channel terms from the initiator's perspective.
	pub terms: ChannelTerms,
	/// Wallet outputs the initiator will spend into the funding transaction.
	pub inputs: Vec<Utxo>,
}

/// The second round of the funding handshake: the initiator finished signing the funding
/// transaction and half-signed its fallback. The responder replies with the countersigned
/// fallback and opens its side of the channel.
#[derive(Clone, Debug)]
pub struct FundingCreated {
	/// The fully-signed funding transaction.
	pub funding_tx: Transaction,
	/// The initiator's refund, signed by the initiator only.
	pub fallback_tx: Transaction,
	/// The channel terms from the initiator's perspective.
	pub terms: ChannelTerms,
}

/// A payment update offered to a counterparty, optionally asking it to forward the payment on.
#[derive(Clone, Debug)]
pub struct PaymentForward {
	/// The node which should forward the payment if it is not the final recipient.
	pub intermediary: PublicKey,
	/// The final recipient of the payment.
	pub recipient: PublicKey,
	/// The hash whose preimage settles the payment.
	pub payment_hash: PaymentHash,
	/// The amount moved towards the receiving side, in satoshis.
	pub amount_sat: u64,
	/// The repriced commitment, half-signed by the payer.
	pub pending_tx: Transaction,
}

/// A cooperative close offered to a counterparty: the latest commitment with its lock-time
/// removed, half-signed by the proposer.
#[derive(Clone, Debug)]
pub struct ClosingProposal {
	/// The channel being closed.
	pub channel_id: [u8; 32],
	/// The closing transaction, half-signed by the proposer.
	pub closing_tx: Transaction,
}

/// An error returned to a remote peer from one of the [`PeerMessageHandler`] methods.
#[derive(Clone, Debug)]
pub struct HandleError {
	/// A human-readable description of the failure.
	pub err: String,
}

/// A handler for messages from a channel counterparty.
///
/// Every method is invoked by a remote node, so implementations must not trust their arguments
/// and must not assume any call ordering beyond what the channel state machine enforces. An
/// implementation must never call back into the sender while holding its own channel locks.
pub trait PeerMessageHandler: Send + Sync {
	/// Handles an introduction from a new peer, returning our node id so the sender can address
	/// us. Must be idempotent: peers may re-introduce themselves on reconnection.
	fn handle_hello(
		&self, their_node_id: PublicKey, handler: Arc<dyn PeerMessageHandler>,
	) -> PublicKey;

	/// Handles a funding proposal, returning the funding transaction signed on our inputs only.
	fn handle_propose_funding(
		&self, their_node_id: PublicKey, msg: FundingProposal,
	) -> Result<Transaction, HandleError>;

	/// Handles the signed funding package, opening the channel on the responder's side and
	/// returning the countersigned fallback.
	fn handle_funding_created(
		&self, their_node_id: PublicKey, msg: FundingCreated,
	) -> Result<Transaction, HandleError>;

	/// Handles an incoming payment update. Returns the countersigned commitment, or `None` if the
	/// update is a duplicate which was already accepted.
	fn handle_payment_forward(
		&self, their_node_id: PublicKey, msg: PaymentForward,
	) -> Result<Option<Transaction>, HandleError>;

	/// Handles a revealed payment preimage, settling the pending update it corresponds to.
	fn handle_commit(
		&self, their_node_id: PublicKey, payment_hash: PaymentHash, preimage: PaymentPreimage,
	) -> Result<(), HandleError>;

	/// Handles a cooperative close proposal, broadcasting the completed closing transaction and
	/// returning it fully signed.
	fn handle_propose_close(
		&self, their_node_id: PublicKey, msg: ClosingProposal,
	) -> Result<Transaction, HandleError>;
}
