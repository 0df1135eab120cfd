//! Operation Gate (C8, §4.8) — suspend/resume lifecycle with per-class
//! drain semantics. Grounded on `guard-service::engine`'s watch-driven
//! state machine, generalised from one shutdown flag to four independently
//! quiescing operation classes plus the database.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Active,
    Suspending,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    RcvNetwork,
    SndNetwork,
    MsgDelivery,
    NtfNetwork,
}

const CLASSES: [OpClass; 4] =
    [OpClass::RcvNetwork, OpClass::SndNetwork, OpClass::MsgDelivery, OpClass::NtfNetwork];

struct ClassGate {
    leases: AtomicI64,
    suspended: std::sync::atomic::AtomicBool,
    quiescent: Notify,
}

impl ClassGate {
    fn new() -> Self {
        Self {
            leases: AtomicI64::new(0),
            suspended: std::sync::atomic::AtomicBool::new(false),
            quiescent: Notify::new(),
        }
    }
}

/// An in-flight operation's counted lease. Dropping it releases the lease
/// and, if the count reaches zero, wakes anyone awaiting quiescence.
pub struct Lease {
    gate: Arc<ClassGate>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let remaining = self.gate.leases.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.gate.quiescent.notify_waiters();
        }
    }
}

/// C8: tracks `{Active, Suspending, Suspended}` plus one [`ClassGate`] per
/// operation class. `beginAgentOperation`/an operation's `Lease` is how C5
/// through C7 bracket any network or delivery work so suspension can drain
/// cleanly instead of severing in-flight I/O.
pub struct OperationGate {
    state: Mutex<GateState>,
    classes: [Arc<ClassGate>; 4],
}

impl Default for OperationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Active),
            classes: [
                Arc::new(ClassGate::new()),
                Arc::new(ClassGate::new()),
                Arc::new(ClassGate::new()),
                Arc::new(ClassGate::new()),
            ],
        }
    }

    fn gate_for(&self, class: OpClass) -> &Arc<ClassGate> {
        let idx = CLASSES.iter().position(|c| *c == class).expect("exhaustive OpClass");
        &self.classes[idx]
    }

    pub fn state(&self) -> GateState {
        *self.state.lock()
    }

    /// Begins an operation of the given class. Returns `None` if the class
    /// is currently suspended (§5: "commands issued while Suspended fail
    /// fast"); callers should surface `CMD PROHIBITED` in that case.
    pub fn begin(&self, class: OpClass) -> Option<Lease> {
        let gate = self.gate_for(class);
        if gate.suspended.load(Ordering::SeqCst) {
            return None;
        }
        gate.leases.fetch_add(1, Ordering::SeqCst);
        Some(Lease { gate: gate.clone() })
    }

    fn is_quiescent(&self, class: OpClass) -> bool {
        self.gate_for(class).leases.load(Ordering::SeqCst) == 0
    }

    /// `suspendAgent(maxDelay)` (§4.8): moves to `Suspending`, blocks new
    /// `SndNetwork`/`MsgDelivery` leases immediately, waits up to
    /// `max_delay` for those two classes to drain, then forces `Suspended`
    /// regardless of outcome.
    pub async fn suspend_agent(&self, max_delay: Duration) {
        *self.state.lock() = GateState::Suspending;
        self.gate_for(OpClass::SndNetwork).suspended.store(true, Ordering::SeqCst);
        self.gate_for(OpClass::MsgDelivery).suspended.store(true, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + max_delay;
        for class in [OpClass::SndNetwork, OpClass::MsgDelivery] {
            while !self.is_quiescent(class) {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    warn!(?class, "suspendAgent: max_delay elapsed before quiescence");
                    break;
                }
                let notified = self.gate_for(class).quiescent.notified();
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(remaining) => { break; }
                }
            }
        }

        for class in CLASSES {
            self.gate_for(class).suspended.store(true, Ordering::SeqCst);
        }
        *self.state.lock() = GateState::Suspended;
        info!("agent suspended");
    }

    /// `activateAgent` (§4.8): clears `opSuspended` on each class in
    /// reverse order — `NtfNetwork` and `MsgDelivery` before the network
    /// classes that feed them, so a resumed receive doesn't race a sink
    /// that isn't accepting work yet.
    pub fn activate_agent(&self) {
        for class in CLASSES.iter().rev() {
            self.gate_for(*class).suspended.store(false, Ordering::SeqCst);
        }
        *self.state.lock() = GateState::Active;
        info!("agent activated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn suspend_waits_for_quiescence_then_forces_suspended() {
        let gate = Arc::new(OperationGate::new());
        let lease = gate.begin(OpClass::SndNetwork).unwrap();

        let gate2 = gate.clone();
        let handle = tokio::spawn(async move {
            gate2.suspend_agent(Duration::from_secs(5)).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.state(), GateState::Suspending);
        drop(lease);

        handle.await.unwrap();
        assert_eq!(gate.state(), GateState::Suspended);
    }

    #[tokio::test]
    async fn suspend_times_out_if_lease_never_released() {
        let gate = Arc::new(OperationGate::new());
        let _lease = gate.begin(OpClass::MsgDelivery).unwrap();
        gate.suspend_agent(Duration::from_millis(30)).await;
        assert_eq!(gate.state(), GateState::Suspended);
    }

    #[test]
    fn begin_fails_fast_once_class_suspended() {
        let gate = OperationGate::new();
        gate.gate_for(OpClass::RcvNetwork).suspended.store(true, Ordering::SeqCst);
        assert!(gate.begin(OpClass::RcvNetwork).is_none());
    }

    #[test]
    fn activate_clears_all_classes() {
        let gate = OperationGate::new();
        for class in CLASSES {
            gate.gate_for(class).suspended.store(true, Ordering::SeqCst);
        }
        gate.activate_agent();
        assert_eq!(gate.state(), GateState::Active);
        for class in CLASSES {
            assert!(gate.begin(class).is_some());
        }
    }
}
