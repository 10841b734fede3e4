// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::io;

use vmm_sys_util::eventfd::EventFd;

/// Two-phase ready/go rendezvous between one parent and one participant.
///
/// Built on a pair of eventfds, so it crosses `fork` without leaving any
/// named object behind in the system. The parent never releases a
/// participant into its timed phase before it has seen that participant's
/// ready signal, and a participant blocks in `wait_go` until the whole
/// cohort has been collected.
pub struct Rendezvous {
    ready: EventFd,
    go: EventFd,
}

impl Rendezvous {
    pub fn new() -> io::Result<Self> {
        Ok(Rendezvous {
            ready: EventFd::new(0)?,
            go: EventFd::new(0)?,
        })
    }

    /// Participant side: signal the parent that this participant reached the
    /// rendezvous point.
    pub fn arrive(&self) -> io::Result<()> {
        self.ready.write(1)
    }

    /// Participant side: block until the parent releases the cohort.
    pub fn wait_go(&self) -> io::Result<()> {
        self.go.read().map(|_| ())
    }

    /// Parent side: block until the participant has arrived.
    pub fn wait_ready(&self) -> io::Result<()> {
        self.ready.read().map(|_| ())
    }

    /// Parent side: release the participant.
    pub fn release(&self) -> io::Result<()> {
        self.go.write(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ready_go_handshake() {
        let rendezvous = Arc::new(Rendezvous::new().unwrap());
        let released = Arc::new(AtomicBool::new(false));

        let participant = {
            let rendezvous = Arc::clone(&rendezvous);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                rendezvous.arrive().unwrap();
                rendezvous.wait_go().unwrap();
                released.store(true, Ordering::SeqCst);
            })
        };

        rendezvous.wait_ready().unwrap();
        assert!(!released.load(Ordering::SeqCst));

        rendezvous.release().unwrap();
        participant.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_two_phase_reuse() {
        let rendezvous = Arc::new(Rendezvous::new().unwrap());

        let participant = {
            let rendezvous = Arc::clone(&rendezvous);
            thread::spawn(move || {
                for _ in 0..2 {
                    rendezvous.arrive().unwrap();
                    rendezvous.wait_go().unwrap();
                }
            })
        };

        for _ in 0..2 {
            rendezvous.wait_ready().unwrap();
            rendezvous.release().unwrap();
        }
        participant.join().unwrap();
    }
}
