//! Presence announcer.
//!
//! Sends one presence message as soon as it starts, then one more after each
//! randomly jittered wait. Jitter keeps a room full of instances that were
//! powered on together from announcing in lockstep. Cancelling the task ends
//! the wait immediately and sends exactly one departure message.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use pn_core::wire::{encode_departure, encode_presence};
use pn_core::{MessageKind, SelfDescriptor};

use crate::broadcast::BroadcastTransport;

/// A running announcement session for one identity.
pub struct Announcer {
    descriptor: SelfDescriptor,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Announcer {
    pub fn spawn(
        runtime: &Handle,
        transport: Arc<BroadcastTransport>,
        descriptor: SelfDescriptor,
        interval: (Duration, Duration),
    ) -> Self {
        let token = CancellationToken::new();
        let task = runtime.spawn(announce_loop(
            transport,
            descriptor.clone(),
            interval,
            token.clone(),
        ));
        Self {
            descriptor,
            token,
            task,
        }
    }

    pub fn descriptor(&self) -> &SelfDescriptor {
        &self.descriptor
    }

    /// Stop announcing and wait until the departure message is out.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "announcer task ended abnormally");
        }
    }

    /// Signal the task without waiting. It still sends its departure if the
    /// runtime keeps running.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

async fn announce_loop(
    transport: Arc<BroadcastTransport>,
    me: SelfDescriptor,
    (min, max): (Duration, Duration),
    token: CancellationToken,
) {
    tracing::info!(
        id = %me.id,
        service = %me.service,
        ip = %me.ip,
        port = me.ctrl_port,
        "announcer starting"
    );

    loop {
        announce(&transport, &me, MessageKind::Presence).await;

        let wait = jitter(min, max);
        tracing::trace!(wait_ms = wait.as_millis() as u64, "next announcement scheduled");

        tokio::select! {
            _ = token.cancelled() => break,
            _ = time::sleep(wait) => {}
        }
    }

    announce(&transport, &me, MessageKind::Departure).await;
    tracing::info!(id = %me.id, "announcer stopped, departure sent");
}

async fn announce(transport: &BroadcastTransport, me: &SelfDescriptor, kind: MessageKind) {
    let encoded = match kind {
        MessageKind::Presence => encode_presence(me),
        MessageKind::Departure => encode_departure(me),
    };
    match encoded {
        Ok(bytes) => {
            let delivered = transport.send(&bytes).await;
            tracing::trace!(cmd = kind.as_str(), delivered, "announcement sent");
        }
        Err(e) => tracing::warn!(error = %e, cmd = kind.as_str(), "announcement not encodable, skipped"),
    }
}

/// Uniform draw from `[min, max]`.
fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}
