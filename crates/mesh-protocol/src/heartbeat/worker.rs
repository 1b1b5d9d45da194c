//! Heartbeat worker task: the only owner of the [`HeartbeatTable`].
//!
//! Everything that touches the table arrives as a [`HeartbeatCommand`] on
//! one unbounded channel; the timer is a local `Interval` that exists only
//! while at least one peer is tracked.

use std::sync::Arc;
use std::time::Duration;

use mesh_transport::{message_writer, ConnectionControl, MessageService, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::table::{HeartbeatEffect, HeartbeatTable};
use super::HeartbeatCounters;

pub(crate) enum HeartbeatCommand {
    Connected(PeerId),
    Disconnected(PeerId),
    Message(PeerId),
    Query {
        peer: PeerId,
        reply: oneshot::Sender<Option<u32>>,
    },
    Shutdown,
}

pub(crate) struct HeartbeatWorker {
    pub me: PeerId,
    pub table: HeartbeatTable,
    pub service: Arc<dyn MessageService>,
    pub control: Arc<dyn ConnectionControl>,
    pub period: Duration,
    pub counters: Arc<HeartbeatCounters>,
}

impl HeartbeatWorker {
    /// Process commands and ticks until shutdown or until every sender is gone.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<HeartbeatCommand>) {
        let mut timer: Option<Interval> = None;
        tracing::info!(
            me = %self.me,
            period_ms = self.period.as_millis() as u64,
            "heartbeat worker started"
        );

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        None | Some(HeartbeatCommand::Shutdown) => break,
                        Some(command) => self.handle(command, &mut timer),
                    }
                }
                _ = next_tick(&mut timer) => {
                    let effects = self.table.tick();
                    self.execute(effects);
                }
            }
        }

        self.counters.tracked_peers.set(0);
        tracing::info!(me = %self.me, "heartbeat worker stopped");
    }

    fn handle(&mut self, command: HeartbeatCommand, timer: &mut Option<Interval>) {
        match command {
            HeartbeatCommand::Connected(peer) => {
                if peer == self.me {
                    return;
                }
                if self.table.on_connect(peer) {
                    let mut interval =
                        tokio::time::interval_at(Instant::now() + self.period, self.period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    *timer = Some(interval);
                    tracing::debug!(me = %self.me, "heartbeat timer started");
                }
                tracing::debug!(me = %self.me, %peer, "tracking peer");
            }
            HeartbeatCommand::Disconnected(peer) => {
                if self.table.on_disconnect(&peer) && timer.take().is_some() {
                    tracing::debug!(me = %self.me, "heartbeat timer stopped");
                }
            }
            HeartbeatCommand::Message(peer) => {
                if self.table.on_message(&peer) {
                    self.counters.resets.inc();
                }
            }
            HeartbeatCommand::Query { peer, reply } => {
                let _ = reply.send(self.table.missed(&peer));
            }
            HeartbeatCommand::Shutdown => {}
        }
        self.counters.tracked_peers.set(self.table.len() as u64);
    }

    // Runs after tick() has released the table, so a forced disconnect that
    // publishes synchronously only queues a command for later.
    fn execute(&self, effects: Vec<HeartbeatEffect>) {
        for effect in effects {
            match effect {
                HeartbeatEffect::SendKeepalive(peer) => {
                    tracing::trace!(me = %self.me, %peer, "sending keepalive");
                    self.counters.keepalives_sent.inc();
                    self.service.send_message(peer, message_writer(|_| {}));
                }
                HeartbeatEffect::ForceDisconnect(peer) => {
                    tracing::info!(
                        me = %self.me,
                        %peer,
                        max_keepalives = self.table.max_keepalives(),
                        "peer silent, forcing disconnect"
                    );
                    self.counters.forced_disconnects.inc();
                    self.control.kill_connection(peer);
                }
            }
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
