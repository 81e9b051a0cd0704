//! Request dispatch: one received frame in, one reply frame out.
//!
//! Also home to the listing pagination loop and the multi-part store
//! engine, which both live on the dispatch path.

use super::conn::ClientConnection;
use super::txn::UniqueRequest;
use super::ServerState;
use crate::backend::CacheError;
use bytes::Bytes;
use common::{
    Capabilities, ListRecord, ObjectId, ObjectInfo, ObjectType, Reply, Request, RequestId,
    SessionId, Status, WireHash, PROTOCOL_VERSION,
};
use tracing::{debug, warn};

/// Default per-reply byte budget of the listing engine.
pub(crate) const DEFAULT_LISTING_BUDGET: usize = 64 * 1024;

/// Handle one request on a ready connection. Returns `false` when the
/// connection must be closed: receive failure, an undecodable message, or
/// an explicit `Quit`.
pub(crate) async fn handle_request(state: &mut ServerState, conn: &mut ClientConnection) -> bool {
    let frame = match conn.recv_request(state.max_object_size).await {
        Ok(frame) => frame,
        Err(err) => {
            warn!("failed to receive request from {}: {err}", conn.peer());
            return false;
        }
    };

    match frame.msg {
        Request::Handshake { name } => handle_handshake(state, conn, name).await,
        Request::Quit => return false,
        Request::Refcount {
            req_id,
            object_id,
            change_by,
        } => handle_refcount(state, conn, req_id, object_id, change_by).await,
        Request::ObjectInfo { req_id, object_id } => {
            handle_object_info(state, conn, req_id, object_id).await
        }
        Request::Read {
            req_id,
            object_id,
            offset,
            size,
        } => handle_read(state, conn, req_id, object_id, offset, size).await,
        Request::Store {
            req_id,
            session_id,
            object_id,
            part_nr,
            last_part,
            expected_size,
            object_type,
            description,
        } => {
            handle_store(
                state,
                conn,
                StorePart {
                    req_id,
                    session_id,
                    object_id,
                    part_nr,
                    last_part,
                    expected_size,
                    object_type,
                    description,
                },
                frame.attachment,
            )
            .await
        }
        Request::StoreAbort { req_id, session_id } => {
            handle_store_abort(state, conn, req_id, session_id).await
        }
        Request::Info { req_id } => handle_info(state, conn, req_id).await,
        Request::Shrink { req_id, shrink_to } => {
            handle_shrink(state, conn, req_id, shrink_to).await
        }
        Request::List {
            req_id,
            listing_id,
            object_type,
        } => handle_list(state, conn, req_id, listing_id, object_type).await,
    }

    true
}

async fn handle_handshake(state: &mut ServerState, conn: &mut ClientConnection, name: Option<String>) {
    let session_id = state.ids.next_session_id();
    conn.note_session(session_id);
    if let Some(client) = name {
        debug!("client {client} connected from {} as session {session_id}", conn.peer());
    }
    let reply = Reply::Handshake {
        status: Status::Ok,
        name: state.name.clone(),
        protocol_version: PROTOCOL_VERSION,
        max_object_size: state.max_object_size as u64,
        session_id,
        capabilities: state.capabilities,
    };
    conn.send_reply(&reply, &[]).await;
}

async fn handle_refcount(
    state: &mut ServerState,
    conn: &mut ClientConnection,
    req_id: RequestId,
    object_id: WireHash,
    change_by: i64,
) {
    let status = if !state.capabilities.contains(Capabilities::REFCOUNT) {
        Status::NotSupported
    } else {
        match ObjectId::from_wire(&object_id) {
            None => Status::Malformed,
            Some(id) => match state.backend.change_refcount(&id, change_by).await {
                Ok(()) => Status::Ok,
                Err(err) => err.status(),
            },
        }
    };
    conn.send_reply(&Reply::Refcount { req_id, status }, &[]).await;
}

async fn handle_object_info(
    state: &mut ServerState,
    conn: &mut ClientConnection,
    req_id: RequestId,
    object_id: WireHash,
) {
    let (status, object_type, size) = match ObjectId::from_wire(&object_id) {
        None => (Status::Malformed, None, None),
        Some(id) => match state.backend.object_info(&id).await {
            Ok(info) => (Status::Ok, Some(info.object_type), Some(info.size)),
            Err(err) => (err.status(), None, None),
        },
    };
    conn.send_reply(
        &Reply::ObjectInfo {
            req_id,
            status,
            object_type,
            size,
        },
        &[],
    )
    .await;
}

async fn handle_read(
    state: &mut ServerState,
    conn: &mut ClientConnection,
    req_id: RequestId,
    object_id: WireHash,
    offset: u64,
    size: u64,
) {
    let id = match ObjectId::from_wire(&object_id) {
        Some(id) if size <= state.max_object_size as u64 => id,
        _ => {
            conn.send_reply(
                &Reply::Read {
                    req_id,
                    status: Status::Malformed,
                },
                &[],
            )
            .await;
            return;
        }
    };
    match state.backend.pread(&id, offset, size).await {
        Ok(bytes) => {
            conn.send_reply(
                &Reply::Read {
                    req_id,
                    status: Status::Ok,
                },
                &bytes,
            )
            .await
        }
        Err(err) => {
            conn.send_reply(
                &Reply::Read {
                    req_id,
                    status: err.status(),
                },
                &[],
            )
            .await
        }
    }
}

async fn handle_info(state: &mut ServerState, conn: &mut ClientConnection, req_id: RequestId) {
    let (status, info) = if !state.capabilities.contains(Capabilities::INFO) {
        (Status::NotSupported, Default::default())
    } else {
        match state.backend.info().await {
            Ok(info) => (Status::Ok, info),
            Err(err) => (err.status(), Default::default()),
        }
    };
    conn.send_reply(
        &Reply::Info {
            req_id,
            status,
            size_bytes: info.size_bytes,
            used_bytes: info.used_bytes,
            pinned_bytes: info.pinned_bytes,
            no_shrink: info.no_shrink,
        },
        &[],
    )
    .await;
}

async fn handle_shrink(
    state: &mut ServerState,
    conn: &mut ClientConnection,
    req_id: RequestId,
    shrink_to: u64,
) {
    let (status, used_bytes) = if !state.capabilities.contains(Capabilities::SHRINK) {
        (Status::NotSupported, 0)
    } else {
        match state.backend.shrink(shrink_to).await {
            Ok(outcome) if outcome.complete => (Status::Ok, outcome.used_bytes),
            Ok(outcome) => (Status::Partial, outcome.used_bytes),
            Err(err) => (err.status(), 0),
        }
    };
    conn.send_reply(
        &Reply::Shrink {
            req_id,
            status,
            used_bytes,
        },
        &[],
    )
    .await;
}

async fn handle_list(
    state: &mut ServerState,
    conn: &mut ClientConnection,
    req_id: RequestId,
    listing_id: u64,
    object_type: ObjectType,
) {
    if !state.capabilities.contains(Capabilities::LIST) {
        conn.send_reply(
            &Reply::List {
                req_id,
                status: Status::NotSupported,
                listing_id,
                is_last_part: true,
                records: Vec::new(),
            },
            &[],
        )
        .await;
        return;
    }

    let mut listing_id = listing_id;
    if listing_id == 0 {
        let fresh = state.ids.next_listing_id();
        if let Err(err) = state.backend.listing_begin(fresh, object_type).await {
            conn.send_reply(
                &Reply::List {
                    req_id,
                    status: err.status(),
                    listing_id: 0,
                    is_last_part: true,
                    records: Vec::new(),
                },
                &[],
            )
            .await;
            return;
        }
        conn.track_listing(fresh);
        listing_id = fresh;
    }

    let mut records = Vec::new();
    let mut total_size = 0usize;
    let mut status = Status::Ok;
    let mut is_last_part = false;
    loop {
        match state.backend.listing_next(listing_id).await {
            Ok(item) => {
                // Approximation of the reply size.
                total_size += std::mem::size_of::<ListRecord>() + item.description.len();
                records.push(ListRecord {
                    hash: item.id.to_wire(),
                    pinned: item.pinned,
                    description: item.description,
                });
                if total_size > state.listing_budget {
                    break;
                }
            }
            Err(CacheError::OutOfBounds) => {
                if let Err(err) = state.backend.listing_end(listing_id).await {
                    warn!("failed to close exhausted listing {listing_id}: {err}");
                }
                conn.untrack_listing(listing_id);
                is_last_part = true;
                break;
            }
            Err(err) => {
                status = err.status();
                break;
            }
        }
    }
    conn.send_reply(
        &Reply::List {
            req_id,
            status,
            listing_id,
            is_last_part,
            records,
        },
        &[],
    )
    .await;
}

struct StorePart {
    req_id: RequestId,
    session_id: SessionId,
    object_id: WireHash,
    part_nr: u64,
    last_part: bool,
    expected_size: Option<u64>,
    object_type: Option<ObjectType>,
    description: Option<String>,
}

async fn handle_store(
    state: &mut ServerState,
    conn: &mut ClientConnection,
    part: StorePart,
    attachment: Bytes,
) {
    let StorePart {
        req_id,
        session_id,
        object_id,
        part_nr,
        last_part,
        expected_size,
        object_type,
        description,
    } = part;

    let send = |status: Status| Reply::Store {
        req_id,
        part_nr,
        status,
    };

    let id = match ObjectId::from_wire(&object_id) {
        Some(id) => id,
        None => {
            conn.send_reply(&send(Status::Malformed), &[]).await;
            return;
        }
    };
    // Every part except the last must fill the whole attachment buffer.
    if attachment.len() > state.max_object_size
        || (attachment.len() < state.max_object_size && !last_part)
    {
        conn.send_reply(&send(Status::Malformed), &[]).await;
        return;
    }

    let uniq_req = UniqueRequest { session_id, req_id };
    let txn_id;
    if part_nr == 1 {
        if state.txns.contains(&uniq_req) {
            warn!("invalid attempt to restart running transaction (session {session_id}, request {req_id})");
            conn.send_reply(&send(Status::Malformed), &[]).await;
            return;
        }
        txn_id = state.ids.next_txn_id();
        let mut info = ObjectInfo::new(id);
        if let Some(size) = expected_size {
            info.size = size;
        }
        if let Some(kind) = object_type {
            info.object_type = kind;
        }
        if let Some(text) = description {
            info.description = text;
        }
        if let Err(err) = state.backend.start_txn(&id, txn_id, info).await {
            conn.send_reply(&send(err.status()), &[]).await;
            return;
        }
        state.txns.insert(uniq_req, txn_id);
    } else {
        txn_id = match state.txns.get(&uniq_req) {
            Some(txn_id) => txn_id,
            None => {
                warn!("transaction not found (session {session_id}, request {req_id})");
                conn.send_reply(&send(Status::Malformed), &[]).await;
                return;
            }
        };
    }

    if !attachment.is_empty() {
        if let Err(err) = state.backend.write_txn(txn_id, &attachment).await {
            // Keep the table entry: the client may still abort to release
            // backend resources.
            conn.send_reply(&send(err.status()), &[]).await;
            return;
        }
    }

    let mut status = Status::Ok;
    if last_part {
        status = match state.backend.commit_txn(txn_id).await {
            Ok(()) => Status::Ok,
            Err(err) => err.status(),
        };
        state.txns.remove(&uniq_req);
    }
    conn.send_reply(&send(status), &[]).await;
}

async fn handle_store_abort(
    state: &mut ServerState,
    conn: &mut ClientConnection,
    req_id: RequestId,
    session_id: SessionId,
) {
    let uniq_req = UniqueRequest { session_id, req_id };
    let status = match state.txns.get(&uniq_req) {
        None => Status::Malformed,
        Some(txn_id) => {
            let status = match state.backend.abort_txn(txn_id).await {
                Ok(()) => Status::Ok,
                Err(err) => err.status(),
            };
            state.txns.remove(&uniq_req);
            status
        }
    };
    conn.send_reply(
        &Reply::Store {
            req_id,
            part_nr: 0,
            status,
        },
        &[],
    )
    .await;
}
