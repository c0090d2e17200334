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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::Waker;
use tracing::{debug, warn};

/// Cooperative shutdown flag shared between the server loop and whoever
/// wants it to stop. The loop consults it between passes; the waker breaks a
/// readiness wait that would otherwise sleep until its timeout.
#[derive(Debug, Clone)]
pub struct Shutdown {
    is_shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Shutdown {
    pub fn new(waker: Arc<Waker>) -> Shutdown {
        Shutdown {
            is_shutdown: Arc::new(AtomicBool::new(false)),
            waker,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutdown requested");
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake poller for shutdown: {}", e);
        }
    }
}
