// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! This module provides a way to
//!   * spawn tasks in "termination context"
//!   * terminate that context
//!   * wait for "termination" in normal context
//!
//! Termination context means that task is run `select`-ed on termination condition, and when
//! that condition is signaled, select returns and the task is dropped.
//! In case you want to do some cleanup, you can wait on the termination condition and then
//! cancel/cleanup whatever you want.

use hiveminer_logging::macros::*;

use core::future::Future;
use tokio::sync::watch;

/// Sender of `Halt` condition
#[derive(Clone)]
pub struct Sender {
    inner: watch::Sender<bool>,
}

impl Sender {
    /// Broadcast `Halt` condition
    pub fn stop(&self) {
        // an error means every receiver is gone which is a valid halt state
        let _ = self.inner.send(true);
    }
}

/// Receiver of `Halt` condition
#[derive(Clone)]
pub struct Receiver {
    inner: watch::Receiver<bool>,
}

impl Receiver {
    /// Wait for `Halt` to be broadcasted
    pub async fn wait_for_halt(&mut self) {
        loop {
            if *self.inner.borrow() {
                return;
            }
            if self.inner.changed().await.is_err() {
                warn!("Owner dropped HaltSender, no one to stop us now! Shutting down task.");
                return;
            }
        }
    }

    /// Spawn a new task that is dropped when `Halt` is received
    pub fn spawn<F>(&self, f: F)
    where
        F: Future<Output = ()> + 'static + Send,
    {
        let mut receiver = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = f => {}
                _ = receiver.wait_for_halt() => {}
            }
        });
    }
}

pub fn make_pair() -> (Sender, Receiver) {
    let (tx, rx) = watch::channel(false);
    (Sender { inner: tx }, Receiver { inner: rx })
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_halt_stops_spawned_task() {
        let (sender, receiver) = make_pair();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        receiver.spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            flag.store(true, Ordering::SeqCst);
        });

        sender.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_wait_for_halt_observes_earlier_stop() {
        let (sender, mut receiver) = make_pair();
        sender.stop();
        // must not hang even though the stop happened before the wait
        receiver.wait_for_halt().await;
    }
}
