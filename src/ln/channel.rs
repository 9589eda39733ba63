// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The per-channel state machine.
//!
//! A [`Channel`] tracks one funded contract output and the ladder of repriced commitments spending
//! it. Repricing moves balance between the two parties by replacing the current commitment with
//! one whose absolute lock-time is lower, so the newest agreed split always reaches the chain
//! first. The channel never talks to the counterparty itself; [`ChannelManager`] drives it and
//! performs all peer exchanges with no channel lock held.
//!
//! [`ChannelManager`]: crate::ln::channelmanager::ChannelManager

use bitcoin::absolute::LockTime;
use bitcoin::hashes::hash160::Hash as Hash160;
use bitcoin::hashes::Hash;
use bitcoin::opcodes;
use bitcoin::script::{Script, ScriptBuf};
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{Amount, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::chain::chaininterface::{BroadcasterInterface, ChainSource, Utxo, WalletSource};
use crate::chain::keysinterface::NodeSigner;
use crate::chain::transaction::OutPoint;
use crate::ln::chan_utils;
use crate::ln::channelmanager::{PaymentHash, PaymentPreimage};
use crate::util::config::ChannelTerms;
use crate::util::logger::Logger;

use core::ops::Deref;
use std::collections::HashMap;

/// The stage of a channel's lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
	/// The funding handshake completed but the funding transaction has not been broadcast yet.
	New,
	/// The funding transaction is in flight and has not yet reached commitment depth.
	Setup,
	/// The channel is open and the current commitment is fully signed by both parties.
	Established,
	/// A repriced commitment has been exchanged but its payment hash is not yet committed.
	PendingCommit,
	/// The current commitment's lock-time has passed; the channel must settle on chain.
	ExpiredWaiting,
	/// A closing transaction and our claim of its local output have been broadcast.
	Closing,
	/// The closing transaction reached commitment depth. Terminal.
	Closed,
}

/// An error arising while driving a channel.
#[derive(Clone, Debug)]
pub enum ChannelError {
	/// The operation cannot be performed right now but nothing is wrong with the channel; state
	/// was not modified. Duplicate forwards land here.
	Ignore(String),
	/// The counterparty sent something violating the agreed terms. The offending operation was
	/// aborted without modifying channel state.
	Protocol(String),
	/// The wallet, signer or chain view failed. The operation was aborted without modifying
	/// channel state.
	Ledger(String),
}

impl ChannelError {
	pub(crate) fn message(&self) -> &str {
		match self {
			ChannelError::Ignore(e) => e,
			ChannelError::Protocol(e) => e,
			ChannelError::Ledger(e) => e,
		}
	}
}

/// Returns the payment hash a hash-lock script commits to, or `None` if the script is not a
/// hash-lock (e.g. the P2PKH outputs of a never-repriced fallback).
fn hashlock_payment_hash(script: &Script) -> Option<[u8; 20]> {
	let bytes = script.as_bytes();
	if bytes.len() < 23
		|| bytes[0] != opcodes::all::OP_HASH160.to_u8()
		|| bytes[1] != 20
		|| bytes[22] != opcodes::all::OP_EQUALVERIFY.to_u8()
	{
		return None;
	}
	let mut hash = [0; 20];
	hash.copy_from_slice(&bytes[2..22]);
	Some(hash)
}

/// Checks that two transactions agree on everything signatures commit to: with SIGHASH_ALL on a
/// single-input transaction that is everything except the scriptSig itself.
fn same_commitment(a: &Transaction, b: &Transaction) -> bool {
	a.version == b.version
		&& a.lock_time == b.lock_time
		&& a.input.len() == 1
		&& b.input.len() == 1
		&& a.input[0].previous_output == b.input[0].previous_output
		&& a.input[0].sequence == b.input[0].sequence
		&& a.output == b.output
}

/// Checks that `full` is `half_signed` with the counterparty's signature added: same commitment
/// essence, a well-formed 2-of-2 scriptSig, and our original signature still in our slot.
pub(crate) fn verify_countersigned(
	half_signed: &Transaction, full: &Transaction, local_is_initiator: bool,
) -> Result<(), ChannelError> {
	if !same_commitment(half_signed, full) {
		return Err(ChannelError::Protocol(
			"counterparty returned a transaction that does not match the one we signed".to_owned(),
		));
	}
	let our_sig = chan_utils::extract_first_push(&half_signed.input[0].script_sig)
		.map_err(|_| ChannelError::Ledger("our half-signed transaction is malformed".to_owned()))?;
	let mut pushes = Vec::with_capacity(3);
	for instruction in full.input[0].script_sig.instructions() {
		match instruction {
			Ok(bitcoin::script::Instruction::PushBytes(push)) => pushes.push(push.as_bytes().to_vec()),
			_ => {
				return Err(ChannelError::Protocol(
					"counterparty scriptSig contains non-push opcodes".to_owned(),
				))
			},
		}
	}
	if pushes.len() != 3 || !pushes[0].is_empty() {
		return Err(ChannelError::Protocol(
			"counterparty scriptSig is not a 2-of-2 satisfaction".to_owned(),
		));
	}
	let our_slot = if local_is_initiator { 1 } else { 2 };
	if pushes[our_slot] != our_sig {
		return Err(ChannelError::Protocol(
			"counterparty replaced our signature in the combined scriptSig".to_owned(),
		));
	}
	Ok(())
}

/// One payment channel between us and a single counterparty.
pub(crate) struct Channel {
	channel_id: [u8; 32],
	state: ChannelState,
	/// True if we funded the larger, time-locked side of the contract and our balance sits in
	/// commitment output 0.
	is_initiator: bool,
	terms: ChannelTerms,
	local_node_id: PublicKey,
	counterparty_node_id: PublicKey,
	funding_outpoint: OutPoint,
	/// The newest fully-signed commitment the counterparty gave us. Starts out as the fallback
	/// and is replaced every time an update we received commits. Also holds the closing
	/// transaction once the channel heads to the chain.
	refund_tx: Transaction,
	/// The newest commitment we gave the counterparty. Starts out as the fallback and is replaced
	/// every time an update we sent commits.
	last_sent_tx: Transaction,
	/// Whether the most recent committed update was sent by us. Repricing continues from
	/// `last_sent_tx` when set and from `refund_tx` otherwise, bumping the input sequence on a
	/// direction change.
	sent_last: bool,
	pending_tx: Option<Transaction>,
	pending_request: Option<PaymentHash>,
	/// Preimages of every hash-lock we have committed, needed to claim our output once a repriced
	/// commitment reaches the chain.
	committed_preimages: HashMap<PaymentHash, PaymentPreimage>,
	redeem_tx: Option<Transaction>,
}

impl Channel {
	/// Builds the funding transaction from both parties' wallet inputs. Called by the responder
	/// with terms in its own frame; the responder's inputs come first.
	///
	/// Output 0 is the contract, output 1 the initiator's pass-through change, output 2 ours.
	pub(crate) fn build_funding_transaction(
		terms: &ChannelTerms, initiator_key: &PublicKey, responder_key: &PublicKey,
		initiator_inputs: &[Utxo], responder_inputs: &[Utxo], height: u32,
	) -> Result<Transaction, ChannelError> {
		let contract_value = terms
			.contribution_sat
			.checked_add(terms.counterparty_contribution_sat)
			.and_then(|v| v.checked_sub(terms.initial_fee_sat))
			.ok_or_else(|| ChannelError::Protocol("contract value overflows".to_owned()))?;
		let initiator_total: u64 = initiator_inputs.iter().map(|u| u.output.value.to_sat()).sum();
		let initiator_change = initiator_total
			.checked_sub(terms.counterparty_contribution_sat)
			.ok_or_else(|| {
				ChannelError::Protocol(
					"counterparty inputs do not cover their contribution".to_owned(),
				)
			})?;
		let responder_total: u64 = responder_inputs.iter().map(|u| u.output.value.to_sat()).sum();
		let responder_change = responder_total.checked_sub(terms.contribution_sat).ok_or_else(|| {
			ChannelError::Ledger("selected inputs do not cover our contribution".to_owned())
		})?;
		let input = responder_inputs
			.iter()
			.chain(initiator_inputs.iter())
			.map(|utxo| TxIn {
				previous_output: utxo.outpoint,
				script_sig: ScriptBuf::new(),
				sequence: Sequence(1),
				witness: Witness::default(),
			})
			.collect();
		Ok(Transaction {
			version: Version::ONE,
			lock_time: LockTime::from_consensus(height.saturating_sub(1)),
			input,
			output: vec![
				TxOut {
					value: Amount::from_sat(contract_value),
					script_pubkey: chan_utils::make_funding_redeemscript(
						initiator_key,
						responder_key,
					),
				},
				TxOut {
					value: Amount::from_sat(initiator_change),
					script_pubkey: chan_utils::get_p2pkh_script(initiator_key),
				},
				TxOut {
					value: Amount::from_sat(responder_change),
					script_pubkey: chan_utils::get_p2pkh_script(responder_key),
				},
			],
		})
	}

	/// Builds the initiator's fallback, the first rung of the commitment ladder: it refunds the
	/// initiator's contribution after `max_lifetime` blocks and passes the responder's
	/// contribution straight back to the responder's funding change script. Terms are in the
	/// initiator's frame.
	pub(crate) fn build_fallback_transaction(
		funding_tx: &Transaction, terms: &ChannelTerms, initiator_key: &PublicKey, height: u32,
	) -> Result<Transaction, ChannelError> {
		if funding_tx.output.len() < 3 {
			return Err(ChannelError::Protocol(
				"funding transaction is missing its change outputs".to_owned(),
			));
		}
		let refund_value = terms
			.contribution_sat
			.checked_sub(2 * terms.initial_fee_sat)
			.ok_or_else(|| {
				ChannelError::Protocol("contribution cannot cover the pre-paid fees".to_owned())
			})?;
		Ok(Transaction {
			version: Version::ONE,
			lock_time: LockTime::from_consensus(height + terms.max_lifetime - 1),
			input: vec![TxIn {
				previous_output: OutPoint::new(funding_tx.compute_txid(), 0)
					.into_bitcoin_outpoint(),
				script_sig: ScriptBuf::new(),
				sequence: Sequence(1),
				witness: Witness::default(),
			}],
			output: vec![
				TxOut {
					value: Amount::from_sat(refund_value),
					script_pubkey: chan_utils::get_p2pkh_script(initiator_key),
				},
				TxOut {
					value: Amount::from_sat(terms.counterparty_contribution_sat),
					script_pubkey: funding_tx.output[2].script_pubkey.clone(),
				},
			],
		})
	}

	/// Creates the initiator's side of a channel whose funding handshake completed. The funding
	/// transaction must be fully signed and the fallback countersigned by the responder; the
	/// channel stays [`ChannelState::New`] until the funding transaction is broadcast.
	pub(crate) fn new_outbound(
		local_node_id: PublicKey, counterparty_node_id: PublicKey, terms: ChannelTerms,
		funding_tx: &Transaction, fallback_tx: Transaction,
	) -> Channel {
		let funding_outpoint = OutPoint::new(funding_tx.compute_txid(), 0);
		Channel {
			channel_id: funding_outpoint.to_channel_id(),
			state: ChannelState::New,
			is_initiator: true,
			terms,
			local_node_id,
			counterparty_node_id,
			funding_outpoint,
			refund_tx: fallback_tx.clone(),
			last_sent_tx: fallback_tx,
			sent_last: false,
			pending_tx: None,
			pending_request: None,
			committed_preimages: HashMap::new(),
			redeem_tx: None,
		}
	}

	/// Creates the responder's side of a channel from the initiator's signed funding package,
	/// validating both transactions against the agreed terms and countersigning the fallback.
	/// Terms are in our (the responder's) frame. Returns the channel and the countersigned
	/// fallback to hand back to the initiator.
	pub(crate) fn new_inbound<S: Deref, L: Deref>(
		signer: &S, logger: &L, counterparty_node_id: PublicKey, terms: ChannelTerms,
		funding_tx: &Transaction, fallback_tx: Transaction, height: u32,
	) -> Result<(Channel, Transaction), ChannelError>
	where
		S::Target: NodeSigner,
		L::Target: Logger,
	{
		let local_node_id = signer.get_node_id();
		if funding_tx.output.len() < 3 {
			return Err(ChannelError::Protocol(
				"funding transaction is missing its change outputs".to_owned(),
			));
		}
		let redeemscript =
			chan_utils::make_funding_redeemscript(&counterparty_node_id, &local_node_id);
		if funding_tx.output[0].script_pubkey != redeemscript {
			return Err(ChannelError::Protocol(
				"funding contract output is not our 2-of-2".to_owned(),
			));
		}
		let contract_value = terms
			.contribution_sat
			.checked_add(terms.counterparty_contribution_sat)
			.and_then(|v| v.checked_sub(terms.initial_fee_sat))
			.ok_or_else(|| ChannelError::Protocol("contract value overflows".to_owned()))?;
		if funding_tx.output[0].value.to_sat() != contract_value {
			return Err(ChannelError::Protocol(format!(
				"funding contract output holds {} sat, expected {}",
				funding_tx.output[0].value.to_sat(),
				contract_value
			)));
		}
		let funding_outpoint = OutPoint::new(funding_tx.compute_txid(), 0);
		if fallback_tx.input.len() != 1
			|| fallback_tx.input[0].previous_output != funding_outpoint.into_bitcoin_outpoint()
			|| fallback_tx.input[0].sequence != Sequence(1)
		{
			return Err(ChannelError::Protocol(
				"fallback does not spend the contract output".to_owned(),
			));
		}
		let lock = fallback_tx.lock_time.to_consensus_u32();
		if lock <= height || lock > height + terms.max_lifetime {
			return Err(ChannelError::Protocol(format!(
				"fallback lock-time of {} is outside the agreed lifetime at height {}",
				lock, height
			)));
		}
		if fallback_tx.output.len() != 2 {
			return Err(ChannelError::Protocol("fallback must have two outputs".to_owned()));
		}
		// In our frame the initiator's contribution is the counterparty's.
		let refund_value = terms
			.counterparty_contribution_sat
			.checked_sub(2 * terms.initial_fee_sat)
			.ok_or_else(|| {
				ChannelError::Protocol("contribution cannot cover the pre-paid fees".to_owned())
			})?;
		if fallback_tx.output[0].value.to_sat() != refund_value
			|| fallback_tx.output[0].script_pubkey
				!= chan_utils::get_p2pkh_script(&counterparty_node_id)
		{
			return Err(ChannelError::Protocol(
				"fallback does not refund the initiator the agreed amount".to_owned(),
			));
		}
		if fallback_tx.output[1].value.to_sat() != terms.contribution_sat
			|| fallback_tx.output[1].script_pubkey != funding_tx.output[2].script_pubkey
		{
			return Err(ChannelError::Protocol(
				"fallback does not return our contribution to our change script".to_owned(),
			));
		}
		let their_sig = chan_utils::extract_first_push(&fallback_tx.input[0].script_sig)
			.map_err(|_| {
				ChannelError::Protocol("fallback is missing the initiator's signature".to_owned())
			})?;
		let our_sig = chan_utils::sign_input(signer, &fallback_tx, 0, &redeemscript)
			.map_err(|_| ChannelError::Ledger("failed to sign the fallback".to_owned()))?;
		let mut signed_fallback = fallback_tx;
		signed_fallback.input[0].script_sig = chan_utils::multisig_script_sig(their_sig, our_sig)
			.map_err(|_| ChannelError::Ledger("signature does not fit in a script push".to_owned()))?;
		log_info!(
			logger,
			"Accepted channel {} from counterparty {}",
			log_bytes!(funding_outpoint.to_channel_id()),
			log_pubkey!(counterparty_node_id)
		);
		let channel = Channel {
			channel_id: funding_outpoint.to_channel_id(),
			state: ChannelState::Setup,
			is_initiator: false,
			terms,
			local_node_id,
			counterparty_node_id,
			funding_outpoint,
			refund_tx: signed_fallback.clone(),
			last_sent_tx: signed_fallback.clone(),
			sent_last: false,
			pending_tx: None,
			pending_request: None,
			committed_preimages: HashMap::new(),
			redeem_tx: None,
		};
		Ok((channel, signed_fallback))
	}

	/// Marks the funding transaction as broadcast, moving the initiator out of
	/// [`ChannelState::New`].
	pub(crate) fn funding_broadcast(&mut self) {
		debug_assert_eq!(self.state, ChannelState::New);
		self.state = ChannelState::Setup;
	}

	fn initiator_key(&self) -> PublicKey {
		if self.is_initiator { self.local_node_id } else { self.counterparty_node_id }
	}

	fn responder_key(&self) -> PublicKey {
		if self.is_initiator { self.counterparty_node_id } else { self.local_node_id }
	}

	fn funding_redeemscript(&self) -> ScriptBuf {
		chan_utils::make_funding_redeemscript(&self.initiator_key(), &self.responder_key())
	}

	fn local_output_index(&self) -> usize {
		if self.is_initiator { 0 } else { 1 }
	}

	/// The newest fully-signed commitment, i.e. the one with the lower lock-time. This is the
	/// split the chain will enforce, so balances and closing both read from it.
	fn current_commitment(&self) -> &Transaction {
		if self.refund_tx.lock_time.to_consensus_u32()
			<= self.last_sent_tx.lock_time.to_consensus_u32()
		{
			&self.refund_tx
		} else {
			&self.last_sent_tx
		}
	}

	/// The commitment the next repricing continues from.
	fn repricing_base(&self) -> &Transaction {
		if self.sent_last { &self.last_sent_tx } else { &self.refund_tx }
	}

	/// Whether we can move `amount_sat` to the counterparty right now: the channel must be quiet
	/// and our side of the newest commitment must strictly cover the amount, the repricing fee
	/// and our agreed balance floor.
	pub(crate) fn can_pay(&self, amount_sat: u64) -> bool {
		if self.state != ChannelState::Established || self.pending_request.is_some() {
			return false;
		}
		let local = self.current_commitment().output[self.local_output_index()].value.to_sat();
		match self.terms.min_deposit_sat.checked_add(self.terms.fee_step_sat) {
			Some(floor) => match floor.checked_add(amount_sat) {
				Some(required) => local > required,
				None => false,
			},
			None => false,
		}
	}

	/// Builds and half-signs the repriced commitment moving `amount_sat` to the counterparty,
	/// locked to `payment_hash`. The channel enters [`ChannelState::PendingCommit`]; the caller
	/// exchanges the returned transaction and feeds the countersigned copy back through
	/// [`Channel::apply_update_ack`].
	pub(crate) fn send_payment<S: Deref, L: Deref>(
		&mut self, signer: &S, logger: &L, payment_hash: PaymentHash, amount_sat: u64,
	) -> Result<Transaction, ChannelError>
	where
		S::Target: NodeSigner,
		L::Target: Logger,
	{
		if !self.can_pay(amount_sat) {
			return Err(ChannelError::Ignore(format!(
				"cannot pay {} sat on channel {}",
				amount_sat,
				DisplayableChannelId(&self.channel_id)
			)));
		}
		let base = self.repricing_base();
		let lock = base
			.lock_time
			.to_consensus_u32()
			.checked_sub(self.terms.locktime_step)
			.ok_or_else(|| {
				ChannelError::Ignore("commitment ladder is exhausted".to_owned())
			})?;
		let sequence = if self.sent_last {
			base.input[0].sequence
		} else {
			Sequence(base.input[0].sequence.0 + 1)
		};
		let (mut out0, mut out1) =
			(base.output[0].value.to_sat(), base.output[1].value.to_sat());
		// Output 0 belongs to the initiator. Move the amount towards the counterparty, then
		// apply the repricing fee: output 0 pays it except when the initiator reverses the
		// payment direction, output 1 pays it only when the responder does.
		if self.is_initiator {
			out0 = out0.checked_sub(amount_sat).ok_or_else(|| {
				ChannelError::Ignore("balance cannot cover the payment".to_owned())
			})?;
			out1 += amount_sat;
		} else {
			out0 += amount_sat;
			out1 = out1.checked_sub(amount_sat).ok_or_else(|| {
				ChannelError::Ignore("balance cannot cover the payment".to_owned())
			})?;
		}
		if !(self.is_initiator && !self.sent_last) {
			out0 = out0.checked_sub(self.terms.fee_step_sat).ok_or_else(|| {
				ChannelError::Ignore("balance cannot cover the repricing fee".to_owned())
			})?;
		}
		if !self.is_initiator && !self.sent_last {
			out1 = out1.checked_sub(self.terms.fee_step_sat).ok_or_else(|| {
				ChannelError::Ignore("balance cannot cover the repricing fee".to_owned())
			})?;
		}
		let mut tx = Transaction {
			version: Version::ONE,
			lock_time: LockTime::from_consensus(lock),
			input: vec![TxIn {
				previous_output: self.funding_outpoint.into_bitcoin_outpoint(),
				script_sig: ScriptBuf::new(),
				sequence,
				witness: Witness::default(),
			}],
			output: vec![
				TxOut {
					value: Amount::from_sat(out0),
					script_pubkey: chan_utils::make_hashlock_script(
						&payment_hash,
						&self.initiator_key(),
					),
				},
				TxOut {
					value: Amount::from_sat(out1),
					script_pubkey: chan_utils::make_hashlock_script(
						&payment_hash,
						&self.responder_key(),
					),
				},
			],
		};
		let sig = chan_utils::sign_input(signer, &tx, 0, &self.funding_redeemscript())
			.map_err(|_| ChannelError::Ledger("failed to sign the commitment".to_owned()))?;
		tx.input[0].script_sig = chan_utils::single_sig_script(sig)
			.map_err(|_| ChannelError::Ledger("signature does not fit in a script push".to_owned()))?;
		log_info!(
			logger,
			"Offering payment {} of {} sat on channel {}, new lock-time {}",
			log_bytes!(payment_hash.0),
			amount_sat,
			log_bytes!(self.channel_id),
			lock
		);
		self.pending_tx = Some(tx.clone());
		self.pending_request = Some(payment_hash);
		self.sent_last = true;
		self.state = ChannelState::PendingCommit;
		Ok(tx)
	}

	/// Validates and countersigns a repriced commitment the counterparty offered us, returning
	/// the fully-signed copy to hand back. The channel enters [`ChannelState::PendingCommit`]
	/// until the payment's preimage arrives.
	pub(crate) fn accept_payment<S: Deref, L: Deref>(
		&mut self, signer: &S, logger: &L, payment_hash: PaymentHash, amount_sat: u64,
		their_tx: &Transaction,
	) -> Result<Transaction, ChannelError>
	where
		S::Target: NodeSigner,
		L::Target: Logger,
	{
		if self.state == ChannelState::PendingCommit
			&& self.pending_request == Some(payment_hash)
			&& !self.sent_last
		{
			return Err(ChannelError::Ignore(format!(
				"already accepted payment {}",
				DisplayableChannelId(&payment_hash.0)
			)));
		}
		if self.state != ChannelState::Established {
			return Err(ChannelError::Protocol(format!(
				"channel {} is not in a state to accept updates",
				DisplayableChannelId(&self.channel_id)
			)));
		}
		if their_tx.input.len() != 1
			|| their_tx.input[0].previous_output != self.funding_outpoint.into_bitcoin_outpoint()
		{
			return Err(ChannelError::Protocol(
				"update does not spend the contract output".to_owned(),
			));
		}
		if their_tx.output.len() != 2 {
			return Err(ChannelError::Protocol("update must have two outputs".to_owned()));
		}
		let base = self.repricing_base();
		let expected_lock = base
			.lock_time
			.to_consensus_u32()
			.checked_sub(self.terms.locktime_step)
			.ok_or_else(|| {
				ChannelError::Protocol("commitment ladder is exhausted".to_owned())
			})?;
		if their_tx.lock_time.to_consensus_u32() != expected_lock {
			return Err(ChannelError::Protocol(format!(
				"update lock-time of {} is not one step below {}",
				their_tx.lock_time.to_consensus_u32(),
				base.lock_time.to_consensus_u32()
			)));
		}
		// The sequence tells us whether the payer continued its own run of updates or reversed
		// direction; it only stays put if the previous update was also theirs.
		let payer_sent_last = if their_tx.input[0].sequence == base.input[0].sequence {
			if self.sent_last {
				return Err(ChannelError::Protocol(
					"update sequence did not advance on a direction change".to_owned(),
				));
			}
			true
		} else if their_tx.input[0].sequence == Sequence(base.input[0].sequence.0 + 1) {
			false
		} else {
			return Err(ChannelError::Protocol("update sequence is out of order".to_owned()));
		};
		let payer_is_initiator = !self.is_initiator;
		let (mut exp0, mut exp1) =
			(base.output[0].value.to_sat(), base.output[1].value.to_sat());
		if payer_is_initiator {
			exp0 = exp0.checked_sub(amount_sat).ok_or_else(|| {
				ChannelError::Protocol("payer balance cannot cover the payment".to_owned())
			})?;
			exp1 = exp1.checked_add(amount_sat).ok_or_else(|| {
				ChannelError::Protocol("payment amount overflows".to_owned())
			})?;
		} else {
			exp0 = exp0.checked_add(amount_sat).ok_or_else(|| {
				ChannelError::Protocol("payment amount overflows".to_owned())
			})?;
			exp1 = exp1.checked_sub(amount_sat).ok_or_else(|| {
				ChannelError::Protocol("payer balance cannot cover the payment".to_owned())
			})?;
		}
		if !(payer_is_initiator && !payer_sent_last) {
			exp0 = exp0.checked_sub(self.terms.fee_step_sat).ok_or_else(|| {
				ChannelError::Protocol("payer balance cannot cover the repricing fee".to_owned())
			})?;
		}
		if !payer_is_initiator && !payer_sent_last {
			exp1 = exp1.checked_sub(self.terms.fee_step_sat).ok_or_else(|| {
				ChannelError::Protocol("payer balance cannot cover the repricing fee".to_owned())
			})?;
		}
		if their_tx.output[0].value.to_sat() != exp0 || their_tx.output[1].value.to_sat() != exp1 {
			return Err(ChannelError::Protocol(format!(
				"update splits the balance {}/{}, expected {}/{}",
				their_tx.output[0].value.to_sat(),
				their_tx.output[1].value.to_sat(),
				exp0,
				exp1
			)));
		}
		if their_tx.output[0].script_pubkey
			!= chan_utils::make_hashlock_script(&payment_hash, &self.initiator_key())
			|| their_tx.output[1].script_pubkey
				!= chan_utils::make_hashlock_script(&payment_hash, &self.responder_key())
		{
			return Err(ChannelError::Protocol(
				"update outputs are not locked to the payment hash".to_owned(),
			));
		}
		let their_sig = chan_utils::extract_first_push(&their_tx.input[0].script_sig)
			.map_err(|_| {
				ChannelError::Protocol("update is missing the payer's signature".to_owned())
			})?;
		let our_sig = chan_utils::sign_input(signer, their_tx, 0, &self.funding_redeemscript())
			.map_err(|_| ChannelError::Ledger("failed to sign the commitment".to_owned()))?;
		let (initiator_sig, responder_sig) =
			if payer_is_initiator { (their_sig, our_sig) } else { (our_sig, their_sig) };
		let mut full = their_tx.clone();
		full.input[0].script_sig = chan_utils::multisig_script_sig(initiator_sig, responder_sig)
			.map_err(|_| ChannelError::Ledger("signature does not fit in a script push".to_owned()))?;
		log_info!(
			logger,
			"Accepted payment {} of {} sat on channel {}",
			log_bytes!(payment_hash.0),
			amount_sat,
			log_bytes!(self.channel_id)
		);
		self.pending_tx = Some(full.clone());
		self.pending_request = Some(payment_hash);
		self.sent_last = false;
		self.state = ChannelState::PendingCommit;
		Ok(full)
	}

	/// Swaps our half-signed pending update for the countersigned copy the counterparty returned.
	/// Tolerates the update having already committed in the meantime (the counterparty may learn
	/// the preimage and settle before acknowledging).
	pub(crate) fn apply_update_ack(&mut self, countersigned: &Transaction) -> Result<(), ChannelError> {
		if let Some(pending) = &self.pending_tx {
			if self.sent_last && same_commitment(pending, countersigned) {
				verify_countersigned(pending, countersigned, self.is_initiator)?;
				self.pending_tx = Some(countersigned.clone());
				return Ok(());
			}
		}
		if self.state == ChannelState::Established
			&& self.sent_last
			&& same_commitment(&self.last_sent_tx, countersigned)
		{
			verify_countersigned(&self.last_sent_tx, countersigned, self.is_initiator)?;
			self.last_sent_tx = countersigned.clone();
			return Ok(());
		}
		Err(ChannelError::Protocol(
			"counterparty acknowledged an update we never offered".to_owned(),
		))
	}

	/// Settles the pending update whose hash matches `payment_hash`, promoting it into the
	/// commitment ladder. Returns false if the hash does not match the pending update (including
	/// when there is none), which callers treat as an idempotent no-op.
	pub(crate) fn commit<L: Deref>(
		&mut self, logger: &L, payment_hash: PaymentHash, preimage: PaymentPreimage,
	) -> Result<bool, ChannelError>
	where
		L::Target: Logger,
	{
		if self.pending_request != Some(payment_hash) {
			return Ok(false);
		}
		if Hash160::hash(&preimage.0).to_byte_array() != payment_hash.0 {
			return Err(ChannelError::Protocol(format!(
				"preimage does not hash to {}",
				DisplayableChannelId(&payment_hash.0)
			)));
		}
		let tx = self.pending_tx.take().ok_or_else(|| {
			ChannelError::Protocol("pending payment has no transaction".to_owned())
		})?;
		if self.sent_last {
			self.last_sent_tx = tx;
		} else {
			self.refund_tx = tx;
		}
		self.pending_request = None;
		self.committed_preimages.insert(payment_hash, preimage);
		self.state = ChannelState::Established;
		log_info!(
			logger,
			"Committed payment {} on channel {}",
			log_bytes!(payment_hash.0),
			log_bytes!(self.channel_id)
		);
		Ok(true)
	}

	/// Advances the channel in response to a new chain tip at `height`.
	pub(crate) fn poll_state<W: Deref, B: Deref, C: Deref, S: Deref, L: Deref>(
		&mut self, wallet: &W, broadcaster: &B, chain: &C, signer: &S, logger: &L, height: u32,
	) -> Result<(), ChannelError>
	where
		W::Target: WalletSource,
		B::Target: BroadcasterInterface,
		C::Target: ChainSource,
		S::Target: NodeSigner,
		L::Target: Logger,
	{
		match self.state {
			ChannelState::Setup => {
				let depth = chain.confirmation_depth(&self.funding_outpoint.txid).unwrap_or(0);
				if depth >= self.terms.commit_depth {
					log_info!(
						logger,
						"Channel {} established with funding depth {}",
						log_bytes!(self.channel_id),
						depth
					);
					self.state = ChannelState::Established;
				}
			},
			ChannelState::Established => {
				if height > self.last_sent_tx.lock_time.to_consensus_u32() {
					log_warn!(
						logger,
						"Channel {} commitment lock-time passed at height {}, settling on chain",
						log_bytes!(self.channel_id),
						height
					);
					self.state = ChannelState::ExpiredWaiting;
					self.process_expiry(wallet, broadcaster, chain, signer, logger, height)?;
				}
			},
			ChannelState::ExpiredWaiting => {
				self.process_expiry(wallet, broadcaster, chain, signer, logger, height)?;
			},
			ChannelState::Closing => {
				let redeem_depth = self
					.redeem_tx
					.as_ref()
					.and_then(|tx| chain.confirmation_depth(&tx.compute_txid()))
					.unwrap_or(0);
				let close_depth =
					chain.confirmation_depth(&self.refund_tx.compute_txid()).unwrap_or(0);
				if redeem_depth >= self.terms.commit_depth
					|| close_depth >= self.terms.commit_depth
				{
					log_info!(logger, "Channel {} closed", log_bytes!(self.channel_id));
					self.state = ChannelState::Closed;
				}
			},
			// A pending update has no expiry of its own; the channel sits still until its
			// preimage arrives.
			ChannelState::New | ChannelState::PendingCommit | ChannelState::Closed => {},
		}
		Ok(())
	}

	fn process_expiry<W: Deref, B: Deref, C: Deref, S: Deref, L: Deref>(
		&mut self, wallet: &W, broadcaster: &B, chain: &C, signer: &S, logger: &L, height: u32,
	) -> Result<(), ChannelError>
	where
		W::Target: WalletSource,
		B::Target: BroadcasterInterface,
		C::Target: ChainSource,
		S::Target: NodeSigner,
		L::Target: Logger,
	{
		if height > self.last_sent_tx.lock_time.to_consensus_u32()
			&& chain.confirmation_depth(&self.refund_tx.compute_txid()).is_none()
		{
			// The counterparty may hold a commitment newer than our refund and close with it
			// while we wait; whatever spends the contract output is the effective close.
			if let Some(spender) =
				wallet.find_output_spender(&self.funding_outpoint.into_bitcoin_outpoint())
			{
				if spender.compute_txid() != self.refund_tx.compute_txid() {
					log_warn!(
						logger,
						"Channel {} contract output spent by {}, adopting it as the close",
						log_bytes!(self.channel_id),
						spender.compute_txid()
					);
					self.refund_tx = spender;
				}
			}
		}
		if height > self.refund_tx.lock_time.to_consensus_u32() {
			let refund = self.refund_tx.clone();
			let redeem = self.build_redeem_transaction(signer, &refund)?;
			broadcaster.broadcast_transactions(&[&refund, &redeem]);
			wallet.register_tx(&refund);
			wallet.register_tx(&redeem);
			log_info!(
				logger,
				"Channel {} expired, broadcast close {} and claim {}",
				log_bytes!(self.channel_id),
				refund.compute_txid(),
				redeem.compute_txid()
			);
			self.redeem_tx = Some(redeem);
			self.state = ChannelState::Closing;
		}
		Ok(())
	}

	/// Builds the transaction claiming our output of `source` (a commitment or closing
	/// transaction) back into a plain output of ours, revealing the committed preimage if the
	/// output is hash-locked.
	fn build_redeem_transaction<S: Deref>(
		&self, signer: &S, source: &Transaction,
	) -> Result<Transaction, ChannelError>
	where
		S::Target: NodeSigner,
	{
		let index = self.local_output_index();
		let spent = source.output.get(index).ok_or_else(|| {
			ChannelError::Protocol("closing transaction is missing our output".to_owned())
		})?;
		let value = spent.value.to_sat().checked_sub(self.terms.initial_fee_sat).ok_or_else(
			|| ChannelError::Protocol("our output cannot cover the claim fee".to_owned()),
		)?;
		let mut tx = Transaction {
			version: Version::ONE,
			lock_time: LockTime::ZERO,
			input: vec![TxIn {
				previous_output: bitcoin::OutPoint {
					txid: source.compute_txid(),
					vout: index as u32,
				},
				script_sig: ScriptBuf::new(),
				sequence: Sequence::MAX,
				witness: Witness::default(),
			}],
			output: vec![TxOut {
				value: Amount::from_sat(value),
				script_pubkey: chan_utils::get_p2pkh_script(&self.local_node_id),
			}],
		};
		let sig = chan_utils::sign_input(signer, &tx, 0, &spent.script_pubkey)
			.map_err(|_| ChannelError::Ledger("failed to sign the claim".to_owned()))?;
		let preimage = if spent.script_pubkey.is_p2pkh() {
			None
		} else {
			let hash = hashlock_payment_hash(&spent.script_pubkey).ok_or_else(|| {
				ChannelError::Protocol("our output carries an unknown script".to_owned())
			})?;
			Some(self.committed_preimages.get(&PaymentHash(hash)).ok_or_else(|| {
				ChannelError::Ledger(
					"no preimage stored for the committed hash-lock".to_owned(),
				)
			})?)
		};
		tx.input[0].script_sig =
			chan_utils::redeem_script_sig(sig, preimage.map(|p| &p.0), &self.local_node_id)
				.map_err(|_| {
					ChannelError::Ledger("signature does not fit in a script push".to_owned())
				})?;
		Ok(tx)
	}

	/// Builds and half-signs a cooperative closing transaction: the newest commitment with its
	/// lock-time replaced by an already-passed one so it confirms immediately. Does not modify
	/// channel state; the caller exchanges the result and applies it through
	/// [`Channel::finish_cooperative_close`].
	pub(crate) fn start_cooperative_close<S: Deref>(
		&self, signer: &S, height: u32,
	) -> Result<Transaction, ChannelError>
	where
		S::Target: NodeSigner,
	{
		if self.state != ChannelState::Established || self.pending_request.is_some() {
			return Err(ChannelError::Ignore(format!(
				"channel {} is not quiet enough to close cooperatively",
				DisplayableChannelId(&self.channel_id)
			)));
		}
		let mut tx = self.current_commitment().clone();
		tx.lock_time = LockTime::from_consensus(height.saturating_sub(1));
		tx.input[0].sequence = Sequence::ENABLE_LOCKTIME_NO_RBF;
		let sig = chan_utils::sign_input(signer, &tx, 0, &self.funding_redeemscript())
			.map_err(|_| ChannelError::Ledger("failed to sign the close".to_owned()))?;
		tx.input[0].script_sig = chan_utils::single_sig_script(sig)
			.map_err(|_| ChannelError::Ledger("signature does not fit in a script push".to_owned()))?;
		Ok(tx)
	}

	/// Applies the counterparty's countersigned cooperative close, broadcasting it together with
	/// the claim of our output. `our_half` is the transaction [`Channel::start_cooperative_close`]
	/// produced.
	pub(crate) fn finish_cooperative_close<S: Deref, W: Deref, B: Deref, L: Deref>(
		&mut self, signer: &S, wallet: &W, broadcaster: &B, logger: &L, our_half: &Transaction,
		their_full: Transaction,
	) -> Result<(), ChannelError>
	where
		S::Target: NodeSigner,
		W::Target: WalletSource,
		B::Target: BroadcasterInterface,
		L::Target: Logger,
	{
		if self.state != ChannelState::Established || self.pending_request.is_some() {
			return Err(ChannelError::Ignore(
				"channel changed while the close was in flight".to_owned(),
			));
		}
		verify_countersigned(our_half, &their_full, self.is_initiator)?;
		let redeem = self.build_redeem_transaction(signer, &their_full)?;
		broadcaster.broadcast_transactions(&[&their_full, &redeem]);
		wallet.register_tx(&their_full);
		wallet.register_tx(&redeem);
		log_info!(
			logger,
			"Cooperatively closing channel {} with {}",
			log_bytes!(self.channel_id),
			their_full.compute_txid()
		);
		self.refund_tx = their_full;
		self.redeem_tx = Some(redeem);
		self.state = ChannelState::Closing;
		Ok(())
	}

	/// Validates and countersigns a cooperative close the counterparty proposed, broadcasting it
	/// together with the claim of our output and returning the fully-signed transaction.
	pub(crate) fn counter_sign_close<S: Deref, W: Deref, B: Deref, L: Deref>(
		&mut self, signer: &S, wallet: &W, broadcaster: &B, logger: &L, their_half: &Transaction,
		height: u32,
	) -> Result<Transaction, ChannelError>
	where
		S::Target: NodeSigner,
		W::Target: WalletSource,
		B::Target: BroadcasterInterface,
		L::Target: Logger,
	{
		if self.state != ChannelState::Established || self.pending_request.is_some() {
			return Err(ChannelError::Protocol(format!(
				"channel {} is not in a state to close cooperatively",
				DisplayableChannelId(&self.channel_id)
			)));
		}
		if their_half.input.len() != 1
			|| their_half.input[0].previous_output != self.funding_outpoint.into_bitcoin_outpoint()
		{
			return Err(ChannelError::Protocol(
				"close does not spend the contract output".to_owned(),
			));
		}
		if their_half.input[0].sequence != Sequence::ENABLE_LOCKTIME_NO_RBF {
			return Err(ChannelError::Protocol(
				"close did not disable the relative lock".to_owned(),
			));
		}
		if their_half.lock_time.to_consensus_u32() > height {
			return Err(ChannelError::Protocol(format!(
				"close lock-time of {} is not final at height {}",
				their_half.lock_time.to_consensus_u32(),
				height
			)));
		}
		if their_half.output != self.current_commitment().output {
			return Err(ChannelError::Protocol(
				"close does not pay out the newest commitment's balances".to_owned(),
			));
		}
		let their_sig = chan_utils::extract_first_push(&their_half.input[0].script_sig)
			.map_err(|_| {
				ChannelError::Protocol("close is missing the proposer's signature".to_owned())
			})?;
		let our_sig = chan_utils::sign_input(signer, their_half, 0, &self.funding_redeemscript())
			.map_err(|_| ChannelError::Ledger("failed to sign the close".to_owned()))?;
		let (initiator_sig, responder_sig) =
			if self.is_initiator { (our_sig, their_sig) } else { (their_sig, our_sig) };
		let mut full = their_half.clone();
		full.input[0].script_sig = chan_utils::multisig_script_sig(initiator_sig, responder_sig)
			.map_err(|_| ChannelError::Ledger("signature does not fit in a script push".to_owned()))?;
		let redeem = self.build_redeem_transaction(signer, &full)?;
		broadcaster.broadcast_transactions(&[&full, &redeem]);
		wallet.register_tx(&full);
		wallet.register_tx(&redeem);
		log_info!(
			logger,
			"Cooperatively closing channel {} with {}",
			log_bytes!(self.channel_id),
			full.compute_txid()
		);
		self.refund_tx = full.clone();
		self.redeem_tx = Some(redeem);
		self.state = ChannelState::Closing;
		Ok(full)
	}

	pub(crate) fn channel_id(&self) -> [u8; 32] {
		self.channel_id
	}

	pub(crate) fn state(&self) -> ChannelState {
		self.state
	}

	pub(crate) fn is_initiator(&self) -> bool {
		self.is_initiator
	}

	pub(crate) fn counterparty_node_id(&self) -> PublicKey {
		self.counterparty_node_id
	}

	/// Our side of the newest fully-signed commitment, in satoshis.
	pub(crate) fn local_balance_sat(&self) -> u64 {
		self.current_commitment().output[self.local_output_index()].value.to_sat()
	}

	/// The counterparty's side of the newest fully-signed commitment, in satoshis.
	pub(crate) fn remote_balance_sat(&self) -> u64 {
		self.current_commitment().output[1 - self.local_output_index()].value.to_sat()
	}
}

/// Renders ids and hashes in log and error strings without pulling in a hex dependency.
struct DisplayableChannelId<'a>(&'a [u8]);
impl<'a> core::fmt::Display for DisplayableChannelId<'a> {
	fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
		for b in self.0 {
			write!(f, "{:02x}", b)?;
		}
		Ok(())
	}
}
