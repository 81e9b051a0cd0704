//! One live client connection and its server-side bookkeeping.

use crate::endpoint::CacheStream;
use common::wire::{self, Frame, WireError};
use common::{ListingId, Reply, Request, SessionId};
use std::collections::HashSet;
use std::io;
use tracing::{debug, warn};

/// A connected client. Besides the stream itself this records what the
/// connection owns on the server: the sessions handshaken over it and the
/// listing cursors it opened, so teardown can reclaim both.
pub(crate) struct ClientConnection {
    stream: CacheStream,
    peer: String,
    sessions: Vec<SessionId>,
    listings: HashSet<ListingId>,
}

impl ClientConnection {
    pub fn new(stream: CacheStream, peer: String) -> Self {
        Self {
            stream,
            peer,
            sessions: Vec::new(),
            listings: HashSet::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    pub async fn recv_request(&mut self, max_attachment: usize) -> Result<Frame<Request>, WireError> {
        wire::recv_frame(&mut self.stream, max_attachment).await
    }

    /// Send a reply, ignoring failures: a broken connection surfaces on the
    /// next receive and tears the connection down there.
    pub async fn send_reply(&mut self, reply: &Reply, attachment: &[u8]) {
        if let Err(err) = wire::send_frame(&mut self.stream, reply, attachment).await {
            warn!("failed to send reply to {}: {err}", self.peer);
        }
    }

    /// One-shot non-blocking send of a pre-encoded frame; failures and
    /// short writes are ignored.
    pub fn try_send(&self, buf: &[u8]) {
        match self.stream.try_write(buf) {
            Ok(written) if written < buf.len() => {
                debug!("short one-shot write to {}", self.peer);
            }
            Ok(_) => {}
            Err(err) => debug!("failed one-shot send to {}: {err}", self.peer),
        }
    }

    pub fn note_session(&mut self, session_id: SessionId) {
        self.sessions.push(session_id);
    }

    pub fn sessions(&self) -> &[SessionId] {
        &self.sessions
    }

    pub fn track_listing(&mut self, listing_id: ListingId) {
        self.listings.insert(listing_id);
    }

    pub fn untrack_listing(&mut self, listing_id: ListingId) {
        self.listings.remove(&listing_id);
    }

    pub fn take_listings(&mut self) -> HashSet<ListingId> {
        std::mem::take(&mut self.listings)
    }
}
