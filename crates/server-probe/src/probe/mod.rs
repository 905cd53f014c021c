// Copyright 2025 Chris Custine
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

//! Datagram probing.
//!
//! The scheduler owns one UDP socket per address family. Receiver tasks
//! timestamp every datagram on arrival and forward it over a channel; the
//! owner loop then asks the scheduler to match it against outstanding probes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::EngineError;
use crate::protocol::{PingCodec, PingReply, PingRequest, Protocol, REPLY_LEN};
use crate::registry::RecordId;

const RECV_BUFFER: usize = 512;

/// A datagram read from one of the probe sockets.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub payload: Vec<u8>,
    /// Scheduler clock at arrival, in microseconds.
    pub received_at_us: u64,
}

/// A reply matched to the probe that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedReply {
    pub record: RecordId,
    pub address: SocketAddr,
    pub rtt_us: u64,
    pub reply: PingReply,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    record: RecordId,
    address: SocketAddr,
    sent_at_us: u64,
}

/// Sends probes and correlates replies by token.
pub struct ProbeScheduler {
    socket_v4: Arc<UdpSocket>,
    socket_v6: Option<Arc<UdpSocket>>,
    codec: PingCodec,
    outstanding: HashMap<u64, Outstanding>,
    reply_window_us: u64,
    epoch: Instant,
    rng: StdRng,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for ProbeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeScheduler")
            .field("outstanding", &self.outstanding.len())
            .field("reply_window_us", &self.reply_window_us)
            .finish_non_exhaustive()
    }
}

impl ProbeScheduler {
    /// Bind the probe sockets and start their receiver tasks.
    ///
    /// Failing to bind IPv4 is fatal. Failing to bind IPv6 only disables
    /// probing of IPv6 addresses.
    pub async fn bind(
        bind_v4: SocketAddr,
        bind_v6: Option<SocketAddr>,
        reply_window: Duration,
        buffer_size: usize,
    ) -> Result<(Self, mpsc::Receiver<Datagram>), EngineError> {
        let socket_v4 = UdpSocket::bind(bind_v4)
            .await
            .map(Arc::new)
            .map_err(|source| EngineError::Bind {
                addr: bind_v4,
                source,
            })?;

        let socket_v6 = match bind_v6 {
            Some(addr) => match UdpSocket::bind(addr).await {
                Ok(socket) => Some(Arc::new(socket)),
                Err(e) => {
                    warn!("IPv6 probing disabled, cannot bind {}: {}", addr, e);
                    None
                }
            },
            None => None,
        };

        let (datagram_tx, datagram_rx) = mpsc::channel(buffer_size.max(1));
        let cancel_token = CancellationToken::new();
        let epoch = Instant::now();

        spawn_receiver(
            Arc::clone(&socket_v4),
            datagram_tx.clone(),
            epoch,
            cancel_token.clone(),
        );
        if let Some(socket) = &socket_v6 {
            spawn_receiver(Arc::clone(socket), datagram_tx, epoch, cancel_token.clone());
        }

        let scheduler = Self {
            socket_v4,
            socket_v6,
            codec: PingCodec::new(),
            outstanding: HashMap::new(),
            reply_window_us: u64::try_from(reply_window.as_micros()).unwrap_or(u64::MAX),
            epoch,
            rng: StdRng::from_entropy(),
            cancel_token,
        };
        Ok((scheduler, datagram_rx))
    }

    /// Local address of the IPv4 socket.
    pub fn local_addr_v4(&self) -> std::io::Result<SocketAddr> {
        self.socket_v4.local_addr()
    }

    /// Microseconds since the scheduler started.
    #[must_use]
    pub fn now_us(&self) -> u64 {
        micros_since(self.epoch)
    }

    /// Send one probe to every address of every target.
    ///
    /// Returns one entry per probe handed to a socket, for the caller to
    /// count against the record.
    pub fn send_round(&mut self, targets: &[(RecordId, Vec<SocketAddr>)]) -> Vec<RecordId> {
        let mut sent = Vec::new();

        for (record, addresses) in targets {
            for address in addresses {
                let Some(socket) = self.socket_for(*address) else {
                    trace!("No socket for {}, skipping probe of {}", address, record);
                    continue;
                };

                let request = PingRequest {
                    token: self.rng.gen(),
                    timestamp_us: self.now_us(),
                };
                let bytes = self.codec.encode_request(&request);

                if let Err(e) = socket.try_send_to(&bytes, *address) {
                    warn!("Failed to send probe to {}: {}", address, e);
                } else {
                    debug!("Probe {:016x} sent to {} for {}", request.token, address, record);
                }

                self.outstanding.insert(
                    request.token,
                    Outstanding {
                        record: *record,
                        address: *address,
                        sent_at_us: request.timestamp_us,
                    },
                );
                sent.push(*record);
            }
        }

        sent
    }

    /// Match a datagram against the outstanding probes. Anything that is not
    /// a reply to a live probe is dropped.
    pub fn match_reply(&mut self, datagram: &Datagram) -> Option<MatchedReply> {
        let reply = match self.codec.parse(&datagram.payload) {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                trace!("Ignoring probe request from {}", datagram.from);
                return None;
            }
            Err(e) => {
                trace!("Dropping datagram from {}: {}", datagram.from, e);
                return None;
            }
        };

        let Some(outstanding) = self.outstanding.get(&reply.token).copied() else {
            trace!("Dropping reply from {} with unknown token", datagram.from);
            return None;
        };
        if outstanding.sent_at_us != reply.timestamp_us {
            trace!("Dropping reply from {} with altered timestamp", datagram.from);
            return None;
        }
        if canonical(datagram.from) != canonical(outstanding.address) {
            trace!(
                "Dropping reply from {} for a probe sent to {}",
                datagram.from,
                outstanding.address
            );
            return None;
        }
        self.outstanding.remove(&reply.token);

        let rtt_us = datagram.received_at_us.saturating_sub(reply.timestamp_us);
        if rtt_us > self.reply_window_us {
            trace!("Dropping late reply from {} ({} us)", datagram.from, rtt_us);
            return None;
        }

        debug!(
            "Reply from {} for {} in {} us",
            datagram.from, outstanding.record, rtt_us
        );
        Some(MatchedReply {
            record: outstanding.record,
            address: outstanding.address,
            rtt_us,
            reply,
        })
    }

    /// Discard every outstanding probe for `record`.
    pub fn forget(&mut self, record: RecordId) {
        self.outstanding.retain(|_, o| o.record != record);
    }

    /// Discard probes older than the reply window. Returns how many went.
    pub fn expire(&mut self) -> usize {
        let now = self.now_us();
        let window = self.reply_window_us;
        let before = self.outstanding.len();
        self.outstanding
            .retain(|_, o| now.saturating_sub(o.sent_at_us) <= window);
        before - self.outstanding.len()
    }

    /// Probes awaiting a reply.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Stop the receiver tasks and forget every probe.
    pub fn shutdown(&mut self) {
        self.cancel_token.cancel();
        self.outstanding.clear();
    }

    fn socket_for(&self, address: SocketAddr) -> Option<Arc<UdpSocket>> {
        match address {
            SocketAddr::V4(_) => Some(Arc::clone(&self.socket_v4)),
            SocketAddr::V6(_) => self.socket_v6.as_ref().map(Arc::clone),
        }
    }
}

impl Drop for ProbeScheduler {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn micros_since(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
}

fn spawn_receiver(
    socket: Arc<UdpSocket>,
    datagram_tx: mpsc::Sender<Datagram>,
    epoch: Instant,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; RECV_BUFFER];

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => return,

                result = socket.recv_from(&mut buf) => match result {
                    Ok((size, from)) => {
                        if size > REPLY_LEN {
                            trace!("Dropping oversized datagram ({} bytes) from {}", size, from);
                            continue;
                        }

                        let datagram = Datagram {
                            from,
                            payload: buf[..size].to_vec(),
                            received_at_us: micros_since(epoch),
                        };
                        match datagram_tx.try_send(datagram) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                trace!("Datagram queue full, dropping reply from {}", from);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                    Err(e) => {
                        debug!("Probe socket receive error: {}", e);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
            }
        }
    });
}

/// `address` with an IPv4-mapped IPv6 address folded back to IPv4.
fn canonical(address: SocketAddr) -> SocketAddr {
    SocketAddr::new(address.ip().to_canonical(), address.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(5);

    async fn scheduler() -> (ProbeScheduler, mpsc::Receiver<Datagram>) {
        ProbeScheduler::bind("127.0.0.1:0".parse().unwrap(), None, WINDOW, 64)
            .await
            .unwrap()
    }

    /// Answer one probe on `responder` with the given population.
    async fn answer_one(responder: &UdpSocket, users: u32) {
        let mut buf = [0u8; 64];
        let (size, from) = responder.recv_from(&mut buf).await.unwrap();
        let codec = PingCodec::new();
        let request = codec.decode_request(&buf[..size]).unwrap();
        let reply = codec.encode_reply(&PingReply::answering(request, users, 50, 72_000));
        responder.send_to(&reply, from).await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_is_matched_once() {
        let (mut scheduler, mut datagrams) = scheduler().await;
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let record = RecordId::new(0, 0);

        let sent = scheduler.send_round(&[(record, vec![responder.local_addr().unwrap()])]);
        assert_eq!(sent, vec![record]);
        assert_eq!(scheduler.outstanding(), 1);

        answer_one(&responder, 4).await;
        let datagram = datagrams.recv().await.unwrap();

        let matched = scheduler.match_reply(&datagram).unwrap();
        assert_eq!(matched.record, record);
        assert_eq!(matched.reply.users, 4);
        assert_eq!(scheduler.outstanding(), 0);

        assert_eq!(scheduler.match_reply(&datagram), None);
    }

    #[tokio::test]
    async fn test_reply_from_other_address_is_dropped() {
        let (mut scheduler, mut datagrams) = scheduler().await;
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let record = RecordId::new(0, 0);

        scheduler.send_round(&[(record, vec![responder.local_addr().unwrap()])]);
        answer_one(&responder, 2).await;
        let genuine = datagrams.recv().await.unwrap();

        let spoofed = Datagram {
            from: "127.0.0.1:9".parse().unwrap(),
            ..genuine.clone()
        };
        assert_eq!(scheduler.match_reply(&spoofed), None);
        assert_eq!(scheduler.outstanding(), 1);

        let matched = scheduler.match_reply(&genuine).unwrap();
        assert_eq!(matched.record, record);
    }

    #[test]
    fn test_canonical_folds_mapped_addresses() {
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:64738".parse().unwrap();
        assert_eq!(canonical(mapped), "192.0.2.1:64738".parse().unwrap());
    }

    #[tokio::test]
    async fn test_forgotten_record_is_unmatched() {
        let (mut scheduler, mut datagrams) = scheduler().await;
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let record = RecordId::new(2, 1);

        scheduler.send_round(&[(record, vec![responder.local_addr().unwrap()])]);
        scheduler.forget(record);
        assert_eq!(scheduler.outstanding(), 0);

        answer_one(&responder, 1).await;
        let datagram = datagrams.recv().await.unwrap();
        assert_eq!(scheduler.match_reply(&datagram), None);
    }

    #[tokio::test]
    async fn test_garbage_and_requests_are_dropped() {
        let (mut scheduler, _datagrams) = scheduler().await;
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let garbage = Datagram {
            from,
            payload: b"hello".to_vec(),
            received_at_us: 0,
        };
        assert_eq!(scheduler.match_reply(&garbage), None);

        let request = PingCodec::new().encode_request(&PingRequest {
            token: 1,
            timestamp_us: 0,
        });
        let echoed = Datagram {
            from,
            payload: request.to_vec(),
            received_at_us: 0,
        };
        assert_eq!(scheduler.match_reply(&echoed), None);
    }

    #[tokio::test]
    async fn test_ipv6_target_without_socket_is_skipped() {
        let (mut scheduler, _datagrams) = scheduler().await;
        let target: SocketAddr = "[::1]:64738".parse().unwrap();

        let sent = scheduler.send_round(&[(RecordId::new(0, 0), vec![target])]);
        assert!(sent.is_empty());
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_drops_stale_probes() {
        let (mut scheduler, _datagrams) = scheduler().await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let record = RecordId::new(0, 0);

        scheduler.send_round(&[(record, vec![silent.local_addr().unwrap()])]);
        assert_eq!(scheduler.expire(), 0);

        tokio::time::advance(WINDOW + Duration::from_millis(1)).await;
        assert_eq!(scheduler.expire(), 1);
        assert_eq!(scheduler.outstanding(), 0);
    }
}
