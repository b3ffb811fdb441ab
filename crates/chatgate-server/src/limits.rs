use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chatgate_contracts::TOO_MANY_REQUESTS_MESSAGE;
use tracing::warn;

use crate::error::ApiError;

/// Peer key used when the connection address is unknown (e.g. in-process calls).
pub const UNKNOWN_PEER: &str = "unknown-peer";

/// Counts in-flight requests per peer and refuses the ones over the cap.
pub struct ClientLimiter {
    max_in_flight: usize,
    active: Mutex<HashMap<String, usize>>,
}

impl ClientLimiter {
    pub fn new(max_in_flight: usize) -> Arc<Self> {
        Arc::new(Self {
            max_in_flight: max_in_flight.max(1),
            active: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_acquire(self: &Arc<Self>, peer: &str) -> Option<InFlight> {
        let mut active = self.lock();
        let count = active.entry(peer.to_string()).or_insert(0);
        if *count >= self.max_in_flight {
            return None;
        }
        *count += 1;
        Some(InFlight {
            limiter: Arc::clone(self),
            peer: peer.to_string(),
        })
    }

    pub fn in_flight(&self, peer: &str) -> usize {
        self.lock().get(peer).copied().unwrap_or(0)
    }

    fn finish(&self, peer: &str) {
        let mut active = self.lock();
        if let Some(count) = active.get_mut(peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(peer);
            }
        }
    }
}

/// One admitted request. Dropping it frees the slot.
pub struct InFlight {
    limiter: Arc<ClientLimiter>,
    peer: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.limiter.finish(&self.peer);
    }
}

pub async fn limit_per_client(
    State(limiter): State<Arc<ClientLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_PEER.to_string());

    let Some(_slot) = limiter.try_acquire(&peer) else {
        warn!(peer = %peer, "too many concurrent requests");
        return ApiError::TooManyRequests(TOO_MANY_REQUESTS_MESSAGE.to_string()).into_response();
    };
    next.run(request).await
}
