// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// Listens for the global exit signal of an acceptor or connector.
///
/// The signal is a single `()` sent on a broadcast channel. Dropping every sender
/// counts as a signal too, so a dropped acceptor never leaves orphaned loops behind.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Non-blocking check used before every accept and every read.
    pub fn poll_shutdown(&mut self) -> bool {
        if self.is_shutdown {
            return true;
        }
        match self.notify.try_recv() {
            Err(TryRecvError::Empty) => false,
            // a value, a lag or a closed channel all mean the exit signal fired
            _ => {
                self.is_shutdown = true;
                true
            }
        }
    }

    /// A fresh receiver on the same channel, for a loop spawned after this one.
    /// It sees signals sent from now on, or the channel closing.
    pub fn resubscribe(&self) -> broadcast::Receiver<()> {
        self.notify.resubscribe()
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_before_and_after_signal() {
        let (notify, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(notify.subscribe());
        assert!(!shutdown.poll_shutdown());

        notify.send(()).unwrap();
        assert!(shutdown.poll_shutdown());
        assert!(shutdown.is_shutdown());
        // stays set once observed
        assert!(shutdown.poll_shutdown());
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_signal() {
        let (notify, _) = broadcast::channel::<()>(1);
        let mut shutdown = Shutdown::new(notify.subscribe());
        drop(notify);
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_resubscribed_receiver_follows_channel() {
        let (notify, _) = broadcast::channel::<()>(1);
        let shutdown = Shutdown::new(notify.subscribe());
        let mut child = Shutdown::new(shutdown.resubscribe());
        assert!(!child.poll_shutdown());

        notify.send(()).unwrap();
        assert!(child.poll_shutdown());

        let mut late = Shutdown::new(shutdown.resubscribe());
        assert!(!late.poll_shutdown());
        drop(notify);
        assert!(late.poll_shutdown());
    }
}
