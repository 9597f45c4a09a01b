//! Minimal TCP terminator for the direct path
//!
//! The client's TCP connection is terminated here and its byte stream is
//! relayed over a real `TcpStream` to the destination.
//!
//! ```text
//!  client ── SYN ──────────▶ relay ── connect() ──▶ remote
//!  client ◀─ SYN-ACK ─────── relay
//!  client ── data ─────────▶ relay ── write ──────▶ remote
//!  client ◀─ ACK ─────────── relay
//!  client ◀─ data (≤ MSS) ── relay ◀─ read ─────── remote
//! ```
//!
//! In-order data only: anything out of sequence is answered with a
//! duplicate ACK so the client retransmits. There is no retransmission on
//! our side and no window management.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::common::FlowKey;
use crate::packet::{PacketBuilder, ParsedPacket, TcpFlags};
use crate::session::SessionId;

use super::Delivery;

const WINDOW: u16 = 65535;

pub(super) struct TcpRelay {
    session: SessionId,
    flow: FlowKey,
    mss: usize,
    connect_timeout: Duration,
    deliveries: mpsc::Sender<Delivery>,
    isn: u32,
    /// Next sequence number we send
    our_seq: u32,
    /// Next sequence number expected from the client
    client_next: u32,
    client_fin: bool,
    remote_fin: bool,
}

impl TcpRelay {
    pub(super) fn new(
        session: SessionId,
        flow: FlowKey,
        mss: usize,
        connect_timeout: Duration,
        deliveries: mpsc::Sender<Delivery>,
    ) -> Self {
        let isn = rand::random::<u32>();
        Self {
            session,
            flow,
            mss: mss.max(1),
            connect_timeout,
            deliveries,
            isn,
            our_seq: isn,
            client_next: 0,
            client_fin: false,
            remote_fin: false,
        }
    }

    pub(super) async fn run(
        mut self,
        mut rx: mpsc::Receiver<ParsedPacket>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let first = match rx.recv().await {
            Some(packet) => packet,
            None => return,
        };
        let Some(syn) = first.tcp() else { return };

        if !syn.flags.is_syn() {
            // Connection we know nothing about
            if !syn.flags.is_rst() {
                let ack = syn.seq.wrapping_add(first.payload().len() as u32);
                self.emit_raw(syn.ack, ack, TcpFlags(TcpFlags::RST | TcpFlags::ACK), &[])
                    .await;
            }
            return;
        }
        self.client_next = syn.seq.wrapping_add(1);

        let connect = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.flow.dst));
        let stream = tokio::select! {
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("[Direct] #{} connect {} failed: {}", self.session, self.flow.dst, e);
                    self.reset().await;
                    return;
                }
                Err(_) => {
                    debug!("[Direct] #{} connect {} timed out", self.session, self.flow.dst);
                    self.reset().await;
                    return;
                }
            },
            _ = shutdown.recv() => return,
        };
        let _ = stream.set_nodelay(true);

        self.our_seq = self.isn.wrapping_add(1);
        if !self.syn_ack().await {
            return;
        }
        trace!("[Direct] #{} established {}", self.session, self.flow);

        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; self.mss * 4];

        loop {
            tokio::select! {
                segment = rx.recv() => {
                    let Some(segment) = segment else { return };
                    let Some(tcp) = segment.tcp() else { continue };

                    if tcp.flags.is_rst() {
                        return;
                    }
                    if tcp.flags.is_syn() {
                        // Our SYN-ACK was lost
                        if !self.syn_ack().await {
                            return;
                        }
                        continue;
                    }

                    let payload = segment.payload();
                    let in_order = tcp.seq == self.client_next;
                    if !payload.is_empty() {
                        if in_order && !self.client_fin {
                            if let Err(e) = writer.write_all(&payload).await {
                                debug!("[Direct] #{} write failed: {}", self.session, e);
                                self.reset().await;
                                return;
                            }
                            self.client_next = self.client_next.wrapping_add(payload.len() as u32);
                        }
                        if !self.ack().await {
                            return;
                        }
                    }

                    if tcp.flags.is_fin()
                        && !self.client_fin
                        && tcp.seq.wrapping_add(payload.len() as u32) == self.client_next
                    {
                        self.client_fin = true;
                        self.client_next = self.client_next.wrapping_add(1);
                        if !self.ack().await {
                            return;
                        }
                        let _ = writer.shutdown().await;
                    }

                    if self.client_fin && self.remote_fin && tcp.flags.contains(TcpFlags::ACK)
                        && tcp.ack == self.our_seq
                    {
                        trace!("[Direct] #{} closed cleanly", self.session);
                        return;
                    }
                }
                read = reader.read(&mut buf), if !self.remote_fin => {
                    match read {
                        Ok(0) => {
                            self.remote_fin = true;
                            let flags = TcpFlags(TcpFlags::FIN | TcpFlags::ACK);
                            if !self.emit_raw(self.our_seq, self.client_next, flags, &[]).await {
                                return;
                            }
                            self.our_seq = self.our_seq.wrapping_add(1);
                        }
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            for chunk in data.chunks(self.mss) {
                                let flags = TcpFlags(TcpFlags::ACK | TcpFlags::PSH);
                                if !self.emit_raw(self.our_seq, self.client_next, flags, chunk).await {
                                    return;
                                }
                                self.our_seq = self.our_seq.wrapping_add(chunk.len() as u32);
                            }
                        }
                        Err(e) => {
                            debug!("[Direct] #{} read failed: {}", self.session, e);
                            self.reset().await;
                            return;
                        }
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    async fn syn_ack(&self) -> bool {
        let flags = TcpFlags(TcpFlags::SYN | TcpFlags::ACK);
        self.emit_raw(self.isn, self.client_next, flags, &[]).await
    }

    async fn ack(&self) -> bool {
        self.emit_raw(self.our_seq, self.client_next, TcpFlags(TcpFlags::ACK), &[])
            .await
    }

    async fn reset(&self) {
        let flags = TcpFlags(TcpFlags::RST | TcpFlags::ACK);
        self.emit_raw(self.our_seq, self.client_next, flags, &[]).await;
    }

    /// Send a segment toward the client. Returns false once the router is
    /// gone.
    async fn emit_raw(&self, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> bool {
        let packet = match PacketBuilder::tcp(
            self.flow.dst,
            self.flow.src,
            seq,
            ack,
            flags,
            WINDOW,
            payload,
        ) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("[Direct] #{} cannot build segment: {}", self.session, e);
                return true;
            }
        };
        self.deliveries
            .send(Delivery::Packet {
                session: self.session,
                packet,
            })
            .await
            .is_ok()
    }
}
