// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The top-level node object, tying the per-counterparty channel groups together into a payment
//! router.
//!
//! [`ChannelManager`] owns every channel of a node, keyed by counterparty. It opens and closes
//! channels, issues and settles payment hashes, and forwards payments across a single
//! intermediary: a payer hands the intermediary a repriced commitment, the intermediary reprices
//! its own channel towards the recipient, and the recipient's revealed preimage settles both hops
//! on the way back.

use bitcoin::hashes::hash160::Hash as Hash160;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, Transaction};

use crate::chain::chaininterface::{BroadcasterInterface, ChainSource, Listen, WalletSource};
use crate::chain::keysinterface::{EntropySource, NodeSigner};
use crate::ln::chan_utils;
use crate::ln::channel::{self, Channel, ChannelError, ChannelState};
use crate::ln::msgs::{
	ClosingProposal, FundingCreated, FundingProposal, HandleError, PaymentForward,
	PeerMessageHandler,
};
use crate::util::config::ChannelTerms;
use crate::util::errors::APIError;
use crate::util::logger::Logger;

use core::ops::Deref;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// The hash which locks a payment: HASH160 of the payment's preimage.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PaymentHash(pub [u8; 20]);

/// The secret whose revelation settles a payment.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PaymentPreimage(pub [u8; 20]);

/// All the channels shared with one counterparty, protected by a single lock. The lock is never
/// held while calling into the counterparty.
struct PeerState {
	channels: HashMap<[u8; 32], Channel>,
	/// Maps each in-flight payment hash to the channel carrying its pending update.
	channels_by_payment: HashMap<PaymentHash, [u8; 32]>,
}

struct PeerHolder {
	handler: Arc<dyn PeerMessageHandler>,
	state: Mutex<PeerState>,
}

/// Basic information about a channel, as returned by [`ChannelManager::list_channels`].
#[derive(Clone, Debug)]
pub struct ChannelDetails {
	/// The channel's id, i.e. its funding transaction id.
	pub channel_id: [u8; 32],
	/// The identity key of the node on the other side.
	pub counterparty_node_id: PublicKey,
	/// Where the channel is in its lifecycle.
	pub state: ChannelState,
	/// True if we proposed the channel and hold the time-locked refund.
	pub is_initiator: bool,
	/// Our side of the newest fully-signed commitment, in satoshis.
	pub local_balance_sat: u64,
	/// The counterparty's side of the newest fully-signed commitment, in satoshis.
	pub remote_balance_sat: u64,
}

/// Manager which keeps track of a number of channels, grouped by counterparty, and routes
/// payments between them.
///
/// The manager does no networking of its own; peers are connected by handing it their
/// [`PeerMessageHandler`]s, and new best blocks are delivered through the [`Listen`] interface.
pub struct ChannelManager<W: Deref, B: Deref, C: Deref, K: Deref, L: Deref>
where
	W::Target: WalletSource,
	B::Target: BroadcasterInterface,
	C::Target: ChainSource,
	K::Target: EntropySource + NodeSigner,
	L::Target: Logger,
{
	wallet: W,
	broadcaster: B,
	chain_source: C,
	keys: K,
	logger: L,
	per_peer_state: RwLock<HashMap<PublicKey, PeerHolder>>,
	/// Every preimage we know, learned by issuing it or by a counterparty revealing it.
	payment_preimages: Mutex<HashMap<PaymentHash, PaymentPreimage>>,
	/// In-flight payments we accepted, mapped to the payer. At most one hop per hash.
	inbound_payments: Mutex<HashMap<PaymentHash, PublicKey>>,
	/// In-flight payments we offered, mapped to the peer we offered them to.
	outbound_payments: Mutex<HashMap<PaymentHash, PublicKey>>,
	/// Serializes wallet input selection across concurrent channel opens. Never held across a
	/// counterparty call.
	funding_lock: Mutex<()>,
}

impl<W: Deref, B: Deref, C: Deref, K: Deref, L: Deref> ChannelManager<W, B, C, K, L>
where
	W::Target: WalletSource,
	B::Target: BroadcasterInterface,
	C::Target: ChainSource,
	K::Target: EntropySource + NodeSigner,
	L::Target: Logger,
{
	/// Constructs a new `ChannelManager` with no channels and no peers.
	pub fn new(wallet: W, broadcaster: B, chain_source: C, keys: K, logger: L) -> Self {
		ChannelManager {
			wallet,
			broadcaster,
			chain_source,
			keys,
			logger,
			per_peer_state: RwLock::new(HashMap::new()),
			payment_preimages: Mutex::new(HashMap::new()),
			inbound_payments: Mutex::new(HashMap::new()),
			outbound_payments: Mutex::new(HashMap::new()),
			funding_lock: Mutex::new(()),
		}
	}

	/// Gets the node's identity public key, which names it to its peers.
	pub fn get_our_node_id(&self) -> PublicKey {
		self.keys.get_node_id()
	}

	fn register_peer(&self, their_node_id: PublicKey, handler: Arc<dyn PeerMessageHandler>) {
		let mut peers = self.per_peer_state.write().unwrap_or_else(|e| e.into_inner());
		match peers.entry(their_node_id) {
			Entry::Occupied(mut holder) => {
				// Reconnection: keep the channels, refresh the handler.
				holder.get_mut().handler = handler;
			},
			Entry::Vacant(entry) => {
				entry.insert(PeerHolder {
					handler,
					state: Mutex::new(PeerState {
						channels: HashMap::new(),
						channels_by_payment: HashMap::new(),
					}),
				});
			},
		}
	}

	fn peer_handler(
		&self, their_node_id: &PublicKey,
	) -> Result<Arc<dyn PeerMessageHandler>, APIError> {
		let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
		peers.get(their_node_id).map(|holder| Arc::clone(&holder.handler)).ok_or_else(|| {
			APIError::PeerUnavailable { err: "No such peer connected".to_owned() }
		})
	}

	/// Opens a channel to `their_node_id` on the given terms, funding our contribution from the
	/// wallet. Blocks on the funding handshake with the peer; on success the funding transaction
	/// has been broadcast and the channel id (its txid) is returned.
	///
	/// The channel is unusable until the funding transaction reaches
	/// [`ChannelTerms::commit_depth`] confirmations.
	pub fn open_channel(
		&self, their_node_id: PublicKey, terms: ChannelTerms,
	) -> Result<[u8; 32], APIError> {
		terms.sanity_check().map_err(|err| APIError::APIMisuseError { err })?;
		let handler = self.peer_handler(&their_node_id)?;
		let our_node_id = self.get_our_node_id();
		let inputs = {
			let _guard = self.funding_lock.lock().unwrap_or_else(|e| e.into_inner());
			self.wallet.select_utxos(Amount::from_sat(terms.contribution_sat)).map_err(|_| {
				APIError::ChannelUnavailable {
					err: "Wallet cannot fund our contribution".to_owned(),
				}
			})?
		};
		let our_total: u64 = inputs.iter().map(|utxo| utxo.output.value.to_sat()).sum();
		let proposal = FundingProposal { terms, inputs: inputs.clone() };
		let funding_partial = handler
			.handle_propose_funding(our_node_id, proposal)
			.map_err(|e| APIError::ChannelUnavailable { err: e.err })?;

		// The counterparty built the funding transaction; make sure it spends what we offered
		// and pays the contract and our change before we sign anything.
		for utxo in &inputs {
			if !funding_partial
				.input
				.iter()
				.any(|input| input.previous_output == utxo.outpoint)
			{
				return Err(APIError::ChannelUnavailable {
					err: "Counterparty dropped one of our funding inputs".to_owned(),
				});
			}
		}
		let contract_value = terms
			.contribution_sat
			.checked_add(terms.counterparty_contribution_sat)
			.and_then(|v| v.checked_sub(terms.initial_fee_sat))
			.ok_or_else(|| APIError::APIMisuseError {
				err: "Contract value overflows".to_owned(),
			})?;
		if funding_partial.output.len() < 3
			|| funding_partial.output[0].script_pubkey
				!= chan_utils::make_funding_redeemscript(&our_node_id, &their_node_id)
			|| funding_partial.output[0].value.to_sat() != contract_value
			|| funding_partial.output[1].script_pubkey
				!= chan_utils::get_p2pkh_script(&our_node_id)
			|| funding_partial.output[1].value.to_sat() != our_total - terms.contribution_sat
		{
			return Err(APIError::ChannelUnavailable {
				err: "Counterparty built an invalid funding transaction".to_owned(),
			});
		}
		let funding_tx = self.wallet.sign_owned_inputs(funding_partial).map_err(|_| {
			APIError::ChannelUnavailable { err: "Wallet failed to sign funding inputs".to_owned() }
		})?;

		let height = self.chain_source.best_height();
		let fallback =
			Channel::build_fallback_transaction(&funding_tx, &terms, &our_node_id, height)
				.map_err(|e| APIError::ChannelUnavailable { err: e.message().to_owned() })?;
		let redeemscript = chan_utils::make_funding_redeemscript(&our_node_id, &their_node_id);
		let sig = chan_utils::sign_input(&self.keys, &fallback, 0, &redeemscript)
			.map_err(|_| APIError::ChannelUnavailable { err: "Signer failed".to_owned() })?;
		let mut half_signed = fallback;
		half_signed.input[0].script_sig = chan_utils::single_sig_script(sig)
			.map_err(|_| APIError::ChannelUnavailable { err: "Signer failed".to_owned() })?;

		let signed_fallback = handler
			.handle_funding_created(
				our_node_id,
				FundingCreated {
					funding_tx: funding_tx.clone(),
					fallback_tx: half_signed.clone(),
					terms,
				},
			)
			.map_err(|e| APIError::ChannelUnavailable { err: e.err })?;
		channel::verify_countersigned(&half_signed, &signed_fallback, true)
			.map_err(|e| APIError::ChannelUnavailable { err: e.message().to_owned() })?;

		let mut chan = Channel::new_outbound(
			our_node_id,
			their_node_id,
			terms,
			&funding_tx,
			signed_fallback,
		);
		let channel_id = chan.channel_id();
		self.broadcaster.broadcast_transactions(&[&funding_tx]);
		self.wallet.register_tx(&funding_tx);
		chan.funding_broadcast();
		log_info!(
			self.logger,
			"Opened channel {} to peer {} with funding tx {}",
			log_bytes!(channel_id),
			log_pubkey!(their_node_id),
			funding_tx.compute_txid()
		);

		let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
		let holder = peers.get(&their_node_id).ok_or_else(|| APIError::PeerUnavailable {
			err: "Peer disconnected during funding".to_owned(),
		})?;
		holder
			.state
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.channels
			.insert(channel_id, chan);
		Ok(channel_id)
	}

	/// Creates a fresh payment preimage, stores it, and returns its hash for a payer to lock a
	/// payment to. The payment settles automatically once it reaches us.
	pub fn issue_payment_hash(&self) -> PaymentHash {
		let random = self.keys.get_secure_random_bytes();
		let mut preimage = PaymentPreimage([0; 20]);
		preimage.0.copy_from_slice(&random[..20]);
		let hash = PaymentHash(Hash160::hash(&preimage.0).to_byte_array());
		self.payment_preimages
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(hash, preimage);
		hash
	}

	/// Sends a payment of `amount_sat` locked to `payment_hash` towards `recipient`, handing it
	/// to our direct peer `intermediary` (the recipient itself for a direct payment). The payment
	/// stays pending until the recipient reveals the preimage.
	pub fn send_payment(
		&self, intermediary: PublicKey, recipient: PublicKey, payment_hash: PaymentHash,
		amount_sat: u64,
	) -> Result<(), APIError> {
		{
			let mut outbound =
				self.outbound_payments.lock().unwrap_or_else(|e| e.into_inner());
			if outbound.contains_key(&payment_hash) {
				return Err(APIError::APIMisuseError {
					err: "A payment with this hash is already in flight".to_owned(),
				});
			}
			outbound.insert(payment_hash, intermediary);
		}
		let res = self.send_payment_internal(intermediary, recipient, payment_hash, amount_sat);
		if res.is_err() {
			self.outbound_payments
				.lock()
				.unwrap_or_else(|e| e.into_inner())
				.remove(&payment_hash);
		}
		res
	}

	fn send_payment_internal(
		&self, intermediary: PublicKey, recipient: PublicKey, payment_hash: PaymentHash,
		amount_sat: u64,
	) -> Result<(), APIError> {
		let handler = self.peer_handler(&intermediary)?;
		let our_node_id = self.get_our_node_id();
		let offered = {
			let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
			let holder = peers.get(&intermediary).ok_or_else(|| {
				APIError::PeerUnavailable { err: "No such peer connected".to_owned() }
			})?;
			let mut state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
			let (channel_id, offered) = {
				let chan = state
					.channels
					.values_mut()
					.find(|chan| chan.can_pay(amount_sat))
					.ok_or_else(|| APIError::ChannelUnavailable {
						err: "No channel with the peer can cover the payment".to_owned(),
					})?;
				let offered = chan
					.send_payment(&self.keys, &self.logger, payment_hash, amount_sat)
					.map_err(|e| APIError::ChannelUnavailable {
						err: e.message().to_owned(),
					})?;
				(chan.channel_id(), offered)
			};
			state.channels_by_payment.insert(payment_hash, channel_id);
			offered
		};

		// Lock dropped: the peer may call back into us (e.g. an immediate commit) while we wait.
		let ack = handler
			.handle_payment_forward(
				our_node_id,
				PaymentForward {
					intermediary,
					recipient,
					payment_hash,
					amount_sat,
					pending_tx: offered,
				},
			)
			.map_err(|e| APIError::ChannelUnavailable { err: e.err })?;

		if let Some(countersigned) = ack {
			let channel_id = commitment_channel_id(&countersigned).ok_or_else(|| {
				APIError::ChannelUnavailable {
					err: "Counterparty acknowledged with a malformed transaction".to_owned(),
				}
			})?;
			let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
			if let Some(holder) = peers.get(&intermediary) {
				let mut state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
				if let Some(chan) = state.channels.get_mut(&channel_id) {
					if let Err(e) = chan.apply_update_ack(&countersigned) {
						log_error!(
							self.logger,
							"Failed to apply countersigned update for payment {}: {}",
							log_bytes!(payment_hash.0),
							e.message()
						);
						return Err(APIError::ChannelUnavailable {
							err: e.message().to_owned(),
						});
					}
				}
			}
		}
		Ok(())
	}

	/// Settles every pending payment locked to the hash of `preimage`: our own channels commit,
	/// and the preimage is revealed to each peer with a matching in-flight payment. Harmless if
	/// nothing is pending on the hash.
	pub fn claim_funds(&self, preimage: PaymentPreimage) {
		let payment_hash = PaymentHash(Hash160::hash(&preimage.0).to_byte_array());
		self.claim_payment(payment_hash, preimage);
	}

	/// Commits the pending update for `payment_hash` on the inbound and outbound hop (if any)
	/// and propagates the preimage to the affected peers, exactly once per hop. Safe to call
	/// re-entrantly from a peer's callback; an already-settled hop is skipped.
	fn claim_payment(&self, payment_hash: PaymentHash, preimage: PaymentPreimage) {
		self.payment_preimages
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.entry(payment_hash)
			.or_insert(preimage);
		let inbound = self
			.inbound_payments
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.remove(&payment_hash);
		let outbound = self
			.outbound_payments
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.remove(&payment_hash);
		for peer in inbound.into_iter().chain(outbound) {
			self.commit_with_peer(&peer, payment_hash, preimage);
		}
	}

	/// Commits the pending update for `payment_hash` on our channel with `peer`, then reveals
	/// the preimage to them. No locks are held during the reveal.
	fn commit_with_peer(
		&self, peer: &PublicKey, payment_hash: PaymentHash, preimage: PaymentPreimage,
	) {
		let handler = {
			let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
			let holder = match peers.get(peer) {
				Some(holder) => holder,
				None => return,
			};
			let mut state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
			if let Some(channel_id) = state.channels_by_payment.remove(&payment_hash) {
				if let Some(chan) = state.channels.get_mut(&channel_id) {
					match chan.commit(&self.logger, payment_hash, preimage) {
						Ok(_) => {},
						Err(e) => {
							log_error!(
								self.logger,
								"Failed to commit payment {} on channel {}: {}",
								log_bytes!(payment_hash.0),
								log_bytes!(channel_id),
								e.message()
							);
							return;
						},
					}
				}
			}
			Arc::clone(&holder.handler)
		};
		if let Err(e) = handler.handle_commit(self.get_our_node_id(), payment_hash, preimage) {
			log_error!(
				self.logger,
				"Peer {} rejected the preimage for payment {}: {}",
				log_pubkey!(*peer),
				log_bytes!(payment_hash.0),
				e.err
			);
		}
	}

	/// Cooperatively closes every open channel with the given peer, splitting each contract
	/// output according to its newest commitment. Channels with a pending payment are left
	/// alone.
	pub fn close_channels_with_peer(&self, their_node_id: PublicKey) -> Result<(), APIError> {
		let handler = self.peer_handler(&their_node_id)?;
		let our_node_id = self.get_our_node_id();
		let height = self.chain_source.best_height();
		let proposals = {
			let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
			let holder = peers.get(&their_node_id).ok_or_else(|| {
				APIError::PeerUnavailable { err: "No such peer connected".to_owned() }
			})?;
			let state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
			let mut proposals = Vec::new();
			for chan in state.channels.values() {
				match chan.start_cooperative_close(&self.keys, height) {
					Ok(tx) => proposals.push((chan.channel_id(), tx)),
					Err(e) => {
						log_debug!(
							self.logger,
							"Not closing channel {}: {}",
							log_bytes!(chan.channel_id()),
							e.message()
						);
					},
				}
			}
			proposals
		};

		let mut first_err = None;
		for (channel_id, our_half) in proposals {
			let res = handler
				.handle_propose_close(
					our_node_id,
					ClosingProposal { channel_id, closing_tx: our_half.clone() },
				)
				.map_err(|e| APIError::ChannelUnavailable { err: e.err })
				.and_then(|their_full| {
					let peers =
						self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
					let holder = peers.get(&their_node_id).ok_or_else(|| {
						APIError::PeerUnavailable {
							err: "Peer disconnected during close".to_owned(),
						}
					})?;
					let mut state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
					let chan = state.channels.get_mut(&channel_id).ok_or_else(|| {
						APIError::ChannelUnavailable { err: "Channel disappeared".to_owned() }
					})?;
					chan.finish_cooperative_close(
						&self.keys,
						&self.wallet,
						&self.broadcaster,
						&self.logger,
						&our_half,
						their_full,
					)
					.map_err(|e| APIError::ChannelUnavailable { err: e.message().to_owned() })
				});
			if let Err(e) = res {
				log_error!(
					self.logger,
					"Failed to cooperatively close channel {}: {:?}",
					log_bytes!(channel_id),
					e
				);
				if first_err.is_none() {
					first_err = Some(e);
				}
			}
		}
		match first_err {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	/// Whether any channel with the peer is not yet fully closed.
	pub fn has_open_channels(&self, their_node_id: &PublicKey) -> bool {
		let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
		peers.get(their_node_id).map_or(false, |holder| {
			holder
				.state
				.lock()
				.unwrap_or_else(|e| e.into_inner())
				.channels
				.values()
				.any(|chan| chan.state() != ChannelState::Closed)
		})
	}

	/// Whether some channel with the peer can carry a payment of `amount_sat` right now.
	pub fn peer_can_pay(&self, their_node_id: &PublicKey, amount_sat: u64) -> bool {
		let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
		peers.get(their_node_id).map_or(false, |holder| {
			holder
				.state
				.lock()
				.unwrap_or_else(|e| e.into_inner())
				.channels
				.values()
				.any(|chan| chan.can_pay(amount_sat))
		})
	}

	/// Gets a snapshot of every channel of the node, across all peers, in no particular order.
	pub fn list_channels(&self) -> Vec<ChannelDetails> {
		let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
		let mut res = Vec::new();
		for holder in peers.values() {
			let state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
			for chan in state.channels.values() {
				res.push(ChannelDetails {
					channel_id: chan.channel_id(),
					counterparty_node_id: chan.counterparty_node_id(),
					state: chan.state(),
					is_initiator: chan.is_initiator(),
					local_balance_sat: chan.local_balance_sat(),
					remote_balance_sat: chan.remote_balance_sat(),
				});
			}
		}
		res
	}
}

impl<W: Deref, B: Deref, C: Deref, K: Deref, L: Deref> ChannelManager<W, B, C, K, L>
where
	W: Send + Sync + 'static,
	B: Send + Sync + 'static,
	C: Send + Sync + 'static,
	K: Send + Sync + 'static,
	L: Send + Sync + 'static,
	W::Target: WalletSource,
	B::Target: BroadcasterInterface,
	C::Target: ChainSource,
	K::Target: EntropySource + NodeSigner,
	L::Target: Logger,
{
	/// Introduces ourselves to a peer, registering each other's handlers both ways. Returns the
	/// peer's node id. Idempotent; reconnecting refreshes the handlers and keeps the channels.
	pub fn connect_peer(self: Arc<Self>, remote: Arc<dyn PeerMessageHandler>) -> PublicKey {
		let their_node_id = remote.handle_hello(
			self.get_our_node_id(),
			Arc::clone(&self) as Arc<dyn PeerMessageHandler>,
		);
		self.register_peer(their_node_id, remote);
		their_node_id
	}
}

/// The channel a commitment belongs to is the funding transaction it spends.
fn commitment_channel_id(tx: &Transaction) -> Option<[u8; 32]> {
	tx.input.first().map(|input| input.previous_output.txid.to_byte_array())
}

impl<W: Deref, B: Deref, C: Deref, K: Deref, L: Deref> PeerMessageHandler
	for ChannelManager<W, B, C, K, L>
where
	W: Send + Sync + 'static,
	B: Send + Sync + 'static,
	C: Send + Sync + 'static,
	K: Send + Sync + 'static,
	L: Send + Sync + 'static,
	W::Target: WalletSource,
	B::Target: BroadcasterInterface,
	C::Target: ChainSource,
	K::Target: EntropySource + NodeSigner,
	L::Target: Logger,
{
	fn handle_hello(
		&self, their_node_id: PublicKey, handler: Arc<dyn PeerMessageHandler>,
	) -> PublicKey {
		log_debug!(self.logger, "Peer {} connected", log_pubkey!(their_node_id));
		self.register_peer(their_node_id, handler);
		self.get_our_node_id()
	}

	fn handle_propose_funding(
		&self, their_node_id: PublicKey, msg: FundingProposal,
	) -> Result<Transaction, HandleError> {
		// The proposal's terms are in the initiator's frame.
		let terms = msg.terms.from_counterparty();
		terms.sanity_check().map_err(|err| HandleError { err })?;
		let our_inputs = {
			let _guard = self.funding_lock.lock().unwrap_or_else(|e| e.into_inner());
			self.wallet.select_utxos(Amount::from_sat(terms.contribution_sat)).map_err(|_| {
				HandleError { err: "Wallet cannot fund our contribution".to_owned() }
			})?
		};
		let height = self.chain_source.best_height();
		let funding = Channel::build_funding_transaction(
			&terms,
			&their_node_id,
			&self.get_our_node_id(),
			&msg.inputs,
			&our_inputs,
			height,
		)
		.map_err(|e| {
			log_error!(
				self.logger,
				"Rejecting funding proposal from {}: {}",
				log_pubkey!(their_node_id),
				e.message()
			);
			HandleError { err: e.message().to_owned() }
		})?;
		self.wallet
			.sign_owned_inputs(funding)
			.map_err(|_| HandleError { err: "Wallet failed to sign funding inputs".to_owned() })
	}

	fn handle_funding_created(
		&self, their_node_id: PublicKey, msg: FundingCreated,
	) -> Result<Transaction, HandleError> {
		let terms = msg.terms.from_counterparty();
		terms.sanity_check().map_err(|err| HandleError { err })?;
		let height = self.chain_source.best_height();
		let (chan, signed_fallback) = Channel::new_inbound(
			&self.keys,
			&self.logger,
			their_node_id,
			terms,
			&msg.funding_tx,
			msg.fallback_tx,
			height,
		)
		.map_err(|e| {
			log_error!(
				self.logger,
				"Rejecting funding from {}: {}",
				log_pubkey!(their_node_id),
				e.message()
			);
			HandleError { err: e.message().to_owned() }
		})?;
		self.wallet.register_tx(&msg.funding_tx);
		let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
		let holder = peers
			.get(&their_node_id)
			.ok_or_else(|| HandleError { err: "Unknown peer".to_owned() })?;
		holder
			.state
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.channels
			.insert(chan.channel_id(), chan);
		Ok(signed_fallback)
	}

	fn handle_payment_forward(
		&self, their_node_id: PublicKey, msg: PaymentForward,
	) -> Result<Option<Transaction>, HandleError> {
		let our_node_id = self.get_our_node_id();
		{
			// A hash we have already carried, in either direction, is a duplicate or a routing
			// loop; drop it without reporting.
			let mut inbound = self.inbound_payments.lock().unwrap_or_else(|e| e.into_inner());
			if inbound.contains_key(&msg.payment_hash)
				|| self
					.outbound_payments
					.lock()
					.unwrap_or_else(|e| e.into_inner())
					.contains_key(&msg.payment_hash)
			{
				log_debug!(
					self.logger,
					"Dropping duplicate payment forward {}",
					log_bytes!(msg.payment_hash.0)
				);
				return Ok(None);
			}
			inbound.insert(msg.payment_hash, their_node_id);
		}

		let channel_id = match commitment_channel_id(&msg.pending_tx) {
			Some(channel_id) => channel_id,
			None => {
				self.inbound_payments
					.lock()
					.unwrap_or_else(|e| e.into_inner())
					.remove(&msg.payment_hash);
				return Err(HandleError { err: "Update has no inputs".to_owned() });
			},
		};
		let countersigned = {
			let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
			let accepted = peers
				.get(&their_node_id)
				.ok_or_else(|| ChannelError::Protocol("unknown peer".to_owned()))
				.and_then(|holder| {
					let mut state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
					let tx = state
						.channels
						.get_mut(&channel_id)
						.ok_or_else(|| ChannelError::Protocol("unknown channel".to_owned()))?
						.accept_payment(
							&self.keys,
							&self.logger,
							msg.payment_hash,
							msg.amount_sat,
							&msg.pending_tx,
						)?;
					state.channels_by_payment.insert(msg.payment_hash, channel_id);
					Ok(tx)
				});
			match accepted {
				Ok(tx) => tx,
				Err(ChannelError::Ignore(err)) => {
					log_debug!(self.logger, "Dropping payment forward: {}", err);
					return Ok(None);
				},
				Err(e) => {
					log_error!(
						self.logger,
						"Rejecting payment forward {} from {}: {}",
						log_bytes!(msg.payment_hash.0),
						log_pubkey!(their_node_id),
						e.message()
					);
					self.inbound_payments
						.lock()
						.unwrap_or_else(|e| e.into_inner())
						.remove(&msg.payment_hash);
					return Err(HandleError { err: e.message().to_owned() });
				},
			}
		};

		// If the payer named us as the intermediary, reprice our own channel towards the
		// recipient before replying. An onward failure leaves the inbound hop pending; it is
		// logged rather than unwound.
		if msg.intermediary == our_node_id && msg.recipient != our_node_id {
			if let Err(e) = self.send_payment(
				msg.recipient,
				msg.recipient,
				msg.payment_hash,
				msg.amount_sat,
			) {
				log_error!(
					self.logger,
					"Failed to forward payment {} to {}: {:?}",
					log_bytes!(msg.payment_hash.0),
					log_pubkey!(msg.recipient),
					e
				);
			}
		}

		// If we already hold the preimage (we issued the hash), settle immediately. The payer
		// learns the preimage before this call even returns.
		let preimage = self
			.payment_preimages
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.get(&msg.payment_hash)
			.copied();
		if let Some(preimage) = preimage {
			self.claim_payment(msg.payment_hash, preimage);
		}
		Ok(Some(countersigned))
	}

	fn handle_commit(
		&self, _their_node_id: PublicKey, payment_hash: PaymentHash, preimage: PaymentPreimage,
	) -> Result<(), HandleError> {
		if Hash160::hash(&preimage.0).to_byte_array() != payment_hash.0 {
			return Err(HandleError { err: "Preimage does not match the hash".to_owned() });
		}
		self.claim_payment(payment_hash, preimage);
		Ok(())
	}

	fn handle_propose_close(
		&self, their_node_id: PublicKey, msg: ClosingProposal,
	) -> Result<Transaction, HandleError> {
		let height = self.chain_source.best_height();
		let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
		let holder = peers
			.get(&their_node_id)
			.ok_or_else(|| HandleError { err: "Unknown peer".to_owned() })?;
		let mut state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
		let chan = state
			.channels
			.get_mut(&msg.channel_id)
			.ok_or_else(|| HandleError { err: "Unknown channel".to_owned() })?;
		chan.counter_sign_close(
			&self.keys,
			&self.wallet,
			&self.broadcaster,
			&self.logger,
			&msg.closing_tx,
			height,
		)
		.map_err(|e| {
			log_error!(
				self.logger,
				"Rejecting cooperative close of channel {}: {}",
				log_bytes!(msg.channel_id),
				e.message()
			);
			HandleError { err: e.message().to_owned() }
		})
	}
}

impl<W: Deref, B: Deref, C: Deref, K: Deref, L: Deref> Listen for ChannelManager<W, B, C, K, L>
where
	W::Target: WalletSource,
	B::Target: BroadcasterInterface,
	C::Target: ChainSource,
	K::Target: EntropySource + NodeSigner,
	L::Target: Logger,
{
	fn best_block_updated(&self, height: u32) {
		log_trace!(self.logger, "New best block at height {}", height);
		let peers = self.per_peer_state.read().unwrap_or_else(|e| e.into_inner());
		for holder in peers.values() {
			let mut state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
			for chan in state.channels.values_mut() {
				if let Err(e) = chan.poll_state(
					&self.wallet,
					&self.broadcaster,
					&self.chain_source,
					&self.keys,
					&self.logger,
					height,
				) {
					log_error!(
						self.logger,
						"Failed to advance channel {} at height {}: {}",
						log_bytes!(chan.channel_id()),
						height,
						e.message()
					);
				}
			}
			// Fully closed channels leave the group.
			state.channels.retain(|channel_id, chan| {
				if chan.state() == ChannelState::Closed {
					log_info!(self.logger, "Forgetting closed channel {}", log_bytes!(*channel_id));
					false
				} else {
					true
				}
			});
		}
	}
}
