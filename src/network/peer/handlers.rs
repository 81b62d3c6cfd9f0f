//! The tasks that drive an established session

use super::handshake::{Reader, Writer};
use super::{OutMsg, Peer, PeerError, SessionState, StallControl, MAX_INV_TRICKLE_SIZE};
use crate::network::message::{
    cmd, InvVect, Message, MessageError, MsgInv, MsgPing, MsgPong, RejectCode,
};
use crate::network::server::{CodecError, MessageCodec};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};

pub(super) async fn wait_quit(quit: &mut watch::Receiver<SessionState>) {
    let _ = quit
        .wait_for(|state| *state == SessionState::Disconnected)
        .await;
}

/// Pass a message to the writer; `false` once the session is over. A
/// dropped message drops its completion sender, which releases any waiter.
async fn handoff(
    send_tx: &mpsc::Sender<OutMsg>,
    out: OutMsg,
    quit: &mut watch::Receiver<SessionState>,
) -> bool {
    tokio::select! {
        sent = send_tx.send(out) => sent.is_ok(),
        _ = wait_quit(quit) => false,
    }
}

/// Responses a request obliges the remote to send
fn expected_responses(command: &str) -> &'static [&'static str] {
    match command {
        cmd::GETBLOCKS => &[cmd::INV],
        cmd::GETDATA => &[cmd::BLOCK, cmd::TX, cmd::NOTFOUND],
        cmd::GETHEADERS => &[cmd::HEADERS],
        cmd::MEMPOOL => &[cmd::INV],
        _ => &[],
    }
}

impl Peer {
    /// Negotiate, then run the four session tasks until disconnect
    pub(super) async fn run(self, stream: TcpStream) {
        let magic = self.inner.config.magic;
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, MessageCodec::new(magic));
        let mut writer = FramedWrite::new(write, MessageCodec::new(magic));
        let mut quit = self.quit_signal();
        let negotiate_timeout = self.inner.config.negotiate_timeout;

        let negotiated = tokio::select! {
            result = timeout(negotiate_timeout, self.negotiate(&mut reader, &mut writer)) => {
                result.unwrap_or(Err(PeerError::NegotiationTimeout))
            }
            _ = wait_quit(&mut quit) => Err(PeerError::Disconnected),
        };
        if let Err(e) = negotiated {
            log::debug!("Can't negotiate protocol with {}: {}", self, e);
            self.disconnect();
            self.finish();
            return;
        }

        let channels = self.inner.channels.lock().take();
        let channels = match channels {
            Some(channels) if self.transition(SessionState::Established) => channels,
            _ => {
                self.disconnect();
                self.finish();
                return;
            }
        };
        log::debug!(
            "Connected to {} with protocol version {}",
            self,
            self.protocol_version()
        );

        let (send_tx, send_rx) = mpsc::channel(1);
        let tasks = vec![
            tokio::spawn(self.clone().in_handler(reader)),
            tokio::spawn(self.clone().out_handler(writer, send_rx)),
            tokio::spawn(
                self.clone()
                    .queue_handler(channels.output_rx, channels.inv_rx, send_tx),
            ),
            tokio::spawn(self.clone().stall_handler(channels.stall_rx)),
        ];
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Session task for {} failed: {}", self, e);
            }
        }
        self.disconnect();
        self.finish();
    }

    // ========================================================================
    // Input
    // ========================================================================

    async fn in_handler(self, mut reader: Reader) {
        let idle_timeout = self.inner.config.idle_timeout;
        let mut quit = self.quit_signal();

        loop {
            let next = tokio::select! {
                _ = wait_quit(&mut quit) => break,
                next = timeout(idle_timeout, reader.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    log::warn!(
                        "Peer {} no answer for {:?} -- disconnecting",
                        self,
                        idle_timeout
                    );
                    break;
                }
                Ok(None) => {
                    log::debug!("Peer {} closed the connection", self);
                    break;
                }
                Ok(Some(Err(e))) => {
                    if self.connected() && !e.is_disconnect() {
                        log::debug!("Can't read message from {}: {}", self, e);
                        if !matches!(e, CodecError::IoError(_)) {
                            self.push_reject_msg("", RejectCode::Malformed, &e.to_string(), None, true)
                                .await;
                        }
                    }
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            self.record_read(&frame);
            let msg = match frame.to_message() {
                Ok(msg) => msg,
                Err(MessageError::UnknownCommand(command)) => {
                    log::debug!("Received unhandled message of type {} from {}", command, self);
                    continue;
                }
                Err(e) => {
                    log::debug!("Can't decode {} from {}: {}", frame.command, self, e);
                    self.push_reject_msg(
                        &frame.command,
                        RejectCode::Malformed,
                        &e.to_string(),
                        None,
                        true,
                    )
                    .await;
                    break;
                }
            };
            log::trace!("Received {} from {}", msg.summary(), self);

            let _ = self.inner.stall_tx.send(StallControl::Received(msg.command()));
            let _ = self.inner.stall_tx.send(StallControl::HandlerStart);
            let keep_going = self.dispatch(msg).await;
            let _ = self.inner.stall_tx.send(StallControl::HandlerDone);
            if !keep_going {
                break;
            }
        }

        self.disconnect();
        log::trace!("Peer input handler done for {}", self);
    }

    /// Hand a message to its listener; `false` ends the session
    async fn dispatch(&self, msg: Message) -> bool {
        let listener = Arc::clone(&self.inner.listener);
        match msg {
            Message::Version(_) => {
                self.push_reject_msg(
                    cmd::VERSION,
                    RejectCode::Duplicate,
                    "duplicate version message",
                    None,
                    true,
                )
                .await;
                return false;
            }
            Message::VerAck => {
                log::info!("Already received 'verack' from peer {} -- disconnecting", self);
                return false;
            }
            Message::Ping(ping) => {
                self.queue_message(Message::Pong(MsgPong { nonce: ping.nonce }));
            }
            Message::Pong(pong) => self.handle_pong(pong.nonce),
            Message::SendHeaders => self.set_wants_headers(),
            Message::Reject(reject) => listener.on_reject(self, &reject),
            Message::GetAddr => listener.on_get_addr(self),
            Message::Addr(addr) => listener.on_addr(self, &addr),
            Message::Inv(inv) => listener.on_inv(self, &inv),
            Message::GetData(get_data) => listener.on_get_data(self, &get_data),
            Message::NotFound(not_found) => listener.on_not_found(self, &not_found),
            Message::Block(block) => listener.on_block(self, &block),
            Message::Tx(tx) => listener.on_tx(self, &tx),
            Message::MemPool => listener.on_mem_pool(self),
            Message::FeeFilter(filter) => listener.on_fee_filter(self, &filter),
            Message::GetBlocks(get_blocks) => listener.on_get_blocks(self, &get_blocks),
            Message::GetHeaders(get_headers) => listener.on_get_headers(self, &get_headers),
            Message::Headers(headers) => listener.on_headers(self, &headers),
            Message::GraphState(gs) => listener.on_graph_state(self, &gs),
            Message::SyncDag(sync_dag) => listener.on_sync_dag(self, &sync_dag),
            Message::SyncPoint(sync_point) => listener.on_sync_point(self, &sync_point),
            Message::SyncResult(sync_result) => listener.on_sync_result(self, &sync_result),
        }
        true
    }

    fn handle_pong(&self, nonce: u64) {
        let mut flags = self.inner.flags.lock();
        if flags.last_ping_nonce != Some(nonce) {
            return;
        }
        if let Some(sent) = flags.last_ping_time {
            flags.last_ping_micros = sent.elapsed().as_micros() as i64;
        }
        flags.last_ping_nonce = None;
    }

    // ========================================================================
    // Output
    // ========================================================================

    async fn out_handler(self, mut writer: Writer, mut send_rx: mpsc::Receiver<OutMsg>) {
        let ping_interval = self.inner.config.ping_interval;
        let mut ping_ticker = interval_at(Instant::now() + ping_interval, ping_interval);
        let mut quit = self.quit_signal();
        let mut write_quit = self.quit_signal();

        loop {
            tokio::select! {
                _ = wait_quit(&mut quit) => break,
                out = send_rx.recv() => {
                    let Some(out) = out else { break };
                    let written = self
                        .write_or_quit(&mut writer, out.msg, &mut write_quit)
                        .await;
                    if let Some(done) = out.done {
                        let _ = done.send(());
                    }
                    if !written {
                        break;
                    }
                }
                _ = ping_ticker.tick() => {
                    let ping = Message::Ping(MsgPing { nonce: rand::random() });
                    if !self.write_or_quit(&mut writer, ping, &mut write_quit).await {
                        break;
                    }
                }
            }
        }

        self.disconnect();
        send_rx.close();
        while let Ok(out) = send_rx.try_recv() {
            if let Some(done) = out.done {
                let _ = done.send(());
            }
        }
        log::trace!("Peer output handler done for {}", self);
    }

    /// A write to a remote that stopped reading must not outlive the session
    async fn write_or_quit(
        &self,
        writer: &mut Writer,
        msg: Message,
        quit: &mut watch::Receiver<SessionState>,
    ) -> bool {
        tokio::select! {
            written = self.write_out(writer, msg) => written,
            _ = wait_quit(quit) => false,
        }
    }

    /// Write one message; `false` means the connection is unusable
    async fn write_out(&self, writer: &mut Writer, msg: Message) -> bool {
        let command = msg.command();
        if let Message::Ping(ping) = &msg {
            let mut flags = self.inner.flags.lock();
            flags.last_ping_nonce = Some(ping.nonce);
            flags.last_ping_time = Some(std::time::Instant::now());
        }

        match self.write_message(writer, msg).await {
            Ok(()) => {
                let _ = self.inner.stall_tx.send(StallControl::Sent(command));
                true
            }
            Err(PeerError::Message(e)) => {
                log::error!("Can't encode {} for {}: {}", command, self, e);
                true
            }
            Err(e) => {
                if self.connected() {
                    log::debug!("Failed to send {} to {}: {}", command, self, e);
                }
                false
            }
        }
    }

    // ========================================================================
    // Queue
    // ========================================================================

    async fn queue_handler(
        self,
        mut output_rx: mpsc::Receiver<OutMsg>,
        mut inv_rx: mpsc::Receiver<InvVect>,
        send_tx: mpsc::Sender<OutMsg>,
    ) {
        let trickle_interval = self.inner.config.trickle_interval;
        let mut trickle = interval_at(Instant::now() + trickle_interval, trickle_interval);
        let mut pending_invs: Vec<InvVect> = Vec::new();
        let mut quit = self.quit_signal();
        let mut handoff_quit = self.quit_signal();

        loop {
            tokio::select! {
                biased;
                _ = wait_quit(&mut quit) => break,
                out = output_rx.recv() => {
                    let Some(out) = out else { break };
                    if !handoff(&send_tx, out, &mut handoff_quit).await {
                        break;
                    }
                }
                inv = inv_rx.recv() => {
                    let Some(inv) = inv else { break };
                    pending_invs.push(inv);
                }
                _ = trickle.tick() => {
                    if !self.send_trickled(&mut pending_invs, &send_tx, &mut handoff_quit).await {
                        break;
                    }
                }
            }
        }

        output_rx.close();
        while let Ok(out) = output_rx.try_recv() {
            if let Some(done) = out.done {
                let _ = done.send(());
            }
        }
        log::trace!("Peer queue handler done for {}", self);
    }

    /// Flush pending inventory the peer does not know yet
    async fn send_trickled(
        &self,
        pending_invs: &mut Vec<InvVect>,
        send_tx: &mpsc::Sender<OutMsg>,
        quit: &mut watch::Receiver<SessionState>,
    ) -> bool {
        let mut batch = Vec::new();
        for inv in pending_invs.drain(..) {
            if self.is_known_inventory(&inv) {
                continue;
            }
            self.add_known_inventory(inv);
            batch.push(inv);
            if batch.len() == MAX_INV_TRICKLE_SIZE {
                let msg = Message::Inv(MsgInv::new(std::mem::take(&mut batch)));
                if !handoff(send_tx, OutMsg { msg, done: None }, quit).await {
                    return false;
                }
            }
        }
        if batch.is_empty() {
            return true;
        }
        let msg = Message::Inv(MsgInv::new(batch));
        handoff(send_tx, OutMsg { msg, done: None }, quit).await
    }

    // ========================================================================
    // Stall detection
    // ========================================================================

    async fn stall_handler(self, mut stall_rx: mpsc::UnboundedReceiver<StallControl>) {
        let tick = self.inner.config.stall_tick_interval;
        let response_timeout = self.inner.config.stall_response_timeout;
        let mut ticker = interval_at(Instant::now() + tick, tick);
        let mut pending: HashMap<&'static str, Instant> = HashMap::new();
        let mut handler_started: Option<Instant> = None;
        let mut quit = self.quit_signal();

        loop {
            tokio::select! {
                _ = wait_quit(&mut quit) => break,
                control = stall_rx.recv() => match control {
                    None => break,
                    Some(StallControl::Sent(command)) => {
                        let deadline = Instant::now() + response_timeout;
                        for expected in expected_responses(command) {
                            pending.insert(*expected, deadline);
                        }
                    }
                    Some(StallControl::Received(command)) => {
                        if matches!(command, cmd::BLOCK | cmd::TX | cmd::NOTFOUND) {
                            pending.remove(cmd::BLOCK);
                            pending.remove(cmd::TX);
                            pending.remove(cmd::NOTFOUND);
                        } else {
                            pending.remove(command);
                        }
                    }
                    Some(StallControl::HandlerStart) => handler_started = Some(Instant::now()),
                    Some(StallControl::HandlerDone) => {
                        // Time spent in our own handlers does not count against the peer
                        if let Some(started) = handler_started.take() {
                            let spent = started.elapsed();
                            for deadline in pending.values_mut() {
                                *deadline += spent;
                            }
                        }
                    }
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let grace = handler_started
                        .map(|started| now - started)
                        .unwrap_or_default();
                    let stalled = pending
                        .iter()
                        .find(|(_, deadline)| now > **deadline + grace)
                        .map(|(command, _)| *command);
                    if let Some(command) = stalled {
                        log::debug!(
                            "Peer {} appears to be stalled or misbehaving, {} timeout -- disconnecting",
                            self,
                            command
                        );
                        break;
                    }
                }
            }
        }

        self.disconnect();
        log::trace!("Peer stall handler done for {}", self);
    }
}
