//! The per-peer timer state machine.
//!
//! Five deadline slots drive the liveness FSM: handshake retransmission,
//! passive keepalive, stale-session rekey, key-material expiry, and the
//! optional persistent keepalive. Event hooks (called from the send and
//! receive paths) arm and disarm slots; a per-peer task sleeps until the
//! earliest deadline and fires whatever has come due.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};

use crate::peer::Peer;
use crate::protocol::{
    KEEPALIVE_TIMEOUT, MAX_JITTER, REJECT_AFTER_TIME, REKEY_AFTER_TIME, REKEY_TIMEOUT,
};
use crate::transport::TransportInner;

/// Random extra delay stirred into handshake retransmission.
pub(crate) fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    RetransmitHandshake,
    SendKeepalive,
    NewHandshake,
    ZeroKeyMaterial,
    PersistentKeepalive,
}

#[derive(Default)]
struct Slot {
    deadline: Mutex<Option<Instant>>,
}

impl Slot {
    fn arm(&self, deadline: Instant) {
        *self.deadline.lock() = Some(deadline);
    }

    fn arm_if_unarmed(&self, deadline: Instant) {
        let mut slot = self.deadline.lock();
        if slot.is_none() {
            *slot = Some(deadline);
        }
    }

    fn disarm(&self) {
        *self.deadline.lock() = None;
    }

    fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    fn take_if_due(&self, now: Instant) -> bool {
        let mut slot = self.deadline.lock();
        match *slot {
            Some(deadline) if deadline <= now => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

/// Timer state embedded in each peer.
pub(crate) struct Timers {
    pub notify: Notify,
    retransmit_handshake: Slot,
    send_keepalive: Slot,
    new_handshake: Slot,
    zero_key_material: Slot,
    persistent_keepalive: Slot,
    pub persistent_keepalive_interval: Mutex<Option<Duration>>,
    pub handshake_attempts: AtomicU32,
    need_another_keepalive: AtomicBool,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
            retransmit_handshake: Slot::default(),
            send_keepalive: Slot::default(),
            new_handshake: Slot::default(),
            zero_key_material: Slot::default(),
            persistent_keepalive: Slot::default(),
            persistent_keepalive_interval: Mutex::new(None),
            handshake_attempts: AtomicU32::new(0),
            need_another_keepalive: AtomicBool::new(false),
        }
    }

    fn wake(&self) {
        self.notify.notify_one();
    }

    // --- event hooks -----------------------------------------------------

    /// A handshake initiation left the socket.
    pub fn handshake_initiated(&self) {
        self.retransmit_handshake
            .arm(Instant::now() + REKEY_TIMEOUT + jitter());
        self.wake();
    }

    /// A handshake completed; retransmission stops and the attempt counter
    /// resets.
    pub fn handshake_complete(&self) {
        self.retransmit_handshake.disarm();
        self.handshake_attempts.store(0, Ordering::Relaxed);
        self.wake();
    }

    /// A session was derived (either role): schedule key-material expiry.
    pub fn session_derived(&self) {
        self.zero_key_material
            .arm(Instant::now() + REJECT_AFTER_TIME * 3);
        self.wake();
    }

    /// A data-bearing transport message was sent.
    pub fn data_sent(&self) {
        self.new_handshake
            .arm_if_unarmed(Instant::now() + REKEY_AFTER_TIME + REKEY_TIMEOUT);
        self.wake();
    }

    /// A data-bearing transport message was received and decrypted: owe the
    /// peer a passive keepalive unless real traffic answers first.
    pub fn data_received(&self) {
        let mut deadline = self.send_keepalive.deadline.lock();
        if deadline.is_none() {
            *deadline = Some(Instant::now() + KEEPALIVE_TIMEOUT);
            drop(deadline);
            self.wake();
        } else {
            self.need_another_keepalive.store(true, Ordering::Relaxed);
        }
    }

    /// Any authenticated transport message was sent (data or keepalive);
    /// the pending passive keepalive is satisfied.
    pub fn any_authenticated_packet_sent(&self) {
        self.send_keepalive.disarm();
        self.wake();
    }

    /// Any authenticated inbound arrived: push the stale-session rekey out.
    pub fn any_authenticated_packet_received(&self) {
        self.new_handshake
            .arm(Instant::now() + REKEY_AFTER_TIME + REKEY_TIMEOUT);
        self.wake();
    }

    /// Any authenticated message moved in either direction.
    pub fn any_authenticated_packet_traversal(&self) {
        if let Some(interval) = *self.persistent_keepalive_interval.lock() {
            self.persistent_keepalive.arm(Instant::now() + interval);
            self.wake();
        }
    }

    /// Take (and clear) the deferred-keepalive marker.
    pub fn take_need_another_keepalive(&self) -> bool {
        self.need_another_keepalive.swap(false, Ordering::Relaxed)
    }

    /// Disarm everything; used at peer stop and handshake give-up.
    pub fn stop_all(&self) {
        self.retransmit_handshake.disarm();
        self.send_keepalive.disarm();
        self.new_handshake.disarm();
        self.zero_key_material.disarm();
        self.persistent_keepalive.disarm();
        self.handshake_attempts.store(0, Ordering::Relaxed);
        self.need_another_keepalive.store(false, Ordering::Relaxed);
        self.wake();
    }

    // --- scheduling ------------------------------------------------------

    fn earliest_deadline(&self) -> Option<Instant> {
        [
            self.retransmit_handshake.deadline(),
            self.send_keepalive.deadline(),
            self.new_handshake.deadline(),
            self.zero_key_material.deadline(),
            self.persistent_keepalive.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn take_due(&self, now: Instant) -> Vec<TimerKind> {
        let mut due = Vec::new();
        if self.retransmit_handshake.take_if_due(now) {
            due.push(TimerKind::RetransmitHandshake);
        }
        if self.send_keepalive.take_if_due(now) {
            due.push(TimerKind::SendKeepalive);
        }
        if self.new_handshake.take_if_due(now) {
            due.push(TimerKind::NewHandshake);
        }
        if self.zero_key_material.take_if_due(now) {
            due.push(TimerKind::ZeroKeyMaterial);
        }
        if self.persistent_keepalive.take_if_due(now) {
            due.push(TimerKind::PersistentKeepalive);
        }
        due
    }
}

/// The per-peer timer task. Exits when the peer stops running or the
/// transport shuts down.
pub(crate) async fn run(
    inner: Arc<TransportInner>,
    peer: Arc<Peer>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if !peer.is_running() {
            break;
        }
        // With nothing armed, park for a while; a wake recomputes.
        let next = peer
            .timers
            .earliest_deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = stop.changed() => break,
            _ = peer.timers.notify.notified() => continue,
            _ = sleep_until(next) => {}
        }

        for kind in peer.timers.take_due(Instant::now()) {
            match kind {
                TimerKind::RetransmitHandshake => {
                    inner.fire_retransmit_handshake(&peer).await;
                }
                TimerKind::SendKeepalive => inner.fire_send_keepalive(&peer).await,
                TimerKind::NewHandshake => inner.fire_new_handshake(&peer).await,
                TimerKind::ZeroKeyMaterial => inner.fire_zero_key_material(&peer),
                TimerKind::PersistentKeepalive => inner.fire_persistent_keepalive(&peer).await,
            }
        }
    }
}
