//! Chief-side connection bookkeeping: unranked (preinit) sockets and the
//! promoted `peers[size]` table they graduate into.
//!
//! The original kept these as two intrusive lists; a `HashMap` keyed by the
//! transport token plus a flat `peers` index gives the same O(1) lookups
//! without hand-rolled links.

use std::collections::HashMap;

use mio::Token;
use rendezvous_wire::Decoder;

pub(crate) struct Connection {
    pub(crate) rank: Option<u32>,
    pub(crate) decoder: Decoder,
}

pub(crate) enum PromoteError {
    RankOutOfRange,
    DuplicateRank,
}

pub(crate) struct ChiefRegistry {
    connections: HashMap<Token, Connection>,
    peers: Vec<Option<Token>>,
    npeers: usize,
}

impl ChiefRegistry {
    pub(crate) fn new(size: u32) -> Self {
        Self { connections: HashMap::new(), peers: vec![None; size as usize], npeers: 0 }
    }

    pub(crate) fn size(&self) -> u32 {
        self.peers.len() as u32
    }

    pub(crate) fn insert_preinit(&mut self, token: Token) {
        self.connections.insert(token, Connection { rank: None, decoder: Decoder::new() });
    }

    pub(crate) fn decoder_mut(&mut self, token: Token) -> Option<&mut Decoder> {
        self.connections.get_mut(&token).map(|c| &mut c.decoder)
    }

    pub(crate) fn rank_of(&self, token: Token) -> Option<u32> {
        self.connections.get(&token).and_then(|c| c.rank)
    }

    pub(crate) fn promote(&mut self, token: Token, rank: u32) -> Result<(), PromoteError> {
        if rank >= self.peers.len() as u32 {
            return Err(PromoteError::RankOutOfRange);
        }
        if self.peers[rank as usize].is_some() {
            return Err(PromoteError::DuplicateRank);
        }
        let conn = self.connections.get_mut(&token).expect("promoting a token we never saw");
        conn.rank = Some(rank);
        self.peers[rank as usize] = Some(token);
        self.npeers += 1;
        Ok(())
    }

    pub(crate) fn remove(&mut self, token: Token) {
        if let Some(conn) = self.connections.remove(&token) {
            if let Some(rank) = conn.rank {
                self.peers[rank as usize] = None;
                self.npeers -= 1;
            }
        }
    }

    /// Every non-chief rank has connected and completed its INIT handshake.
    pub(crate) fn ready(&self) -> bool {
        self.npeers as u32 + 1 == self.peers.len() as u32
    }

    pub(crate) fn all_peer_tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.peers.iter().filter_map(|t| *t)
    }
}
