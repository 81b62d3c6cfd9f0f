//! `version` / `verack` negotiation

use super::{Peer, PeerError};
use crate::network::message::{
    cmd, GraphState, Message, MsgReject, MsgVersion, NetAddress, RejectCode, ServiceFlags,
};
use crate::network::params::INITIAL_PROTOCOL_VERSION;
use crate::network::server::{Frame, MessageCodec};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

pub(super) type Reader = FramedRead<OwnedReadHalf, MessageCodec>;
pub(super) type Writer = FramedWrite<OwnedWriteHalf, MessageCodec>;

impl Peer {
    /// Outbound peers speak first; inbound peers wait for the remote
    /// `version`. Both then exchange `verack`.
    pub(super) async fn negotiate(
        &self,
        reader: &mut Reader,
        writer: &mut Writer,
    ) -> Result<(), PeerError> {
        if self.inbound() {
            self.read_remote_version(reader, writer).await?;
            self.write_local_version(writer).await?;
        } else {
            self.write_local_version(writer).await?;
            self.read_remote_version(reader, writer).await?;
        }
        self.write_message(writer, Message::VerAck).await?;
        self.read_remote_verack(reader).await
    }

    async fn read_remote_version(
        &self,
        reader: &mut Reader,
        writer: &mut Writer,
    ) -> Result<(), PeerError> {
        let version = match self.read_message(reader).await? {
            Message::Version(version) => version,
            other => {
                let reject = MsgReject::new(
                    other.command(),
                    RejectCode::Malformed,
                    "a version message must precede all others",
                );
                let _ = self.write_message(writer, Message::Reject(reject)).await;
                return Err(PeerError::VersionFirst(other.command().to_string()));
            }
        };

        if self.inner.registry.is_own_nonce(version.nonce) {
            log::debug!("Disconnecting peer connected to self {}", self);
            return Err(PeerError::SelfConnection);
        }

        if version.protocol_version < INITIAL_PROTOCOL_VERSION {
            let reason = format!(
                "protocol version must be {} or greater",
                INITIAL_PROTOCOL_VERSION
            );
            let reject = MsgReject::new(cmd::VERSION, RejectCode::Obsolete, reason);
            let _ = self.write_message(writer, Message::Reject(reject)).await;
            return Err(PeerError::ObsoleteVersion(version.protocol_version));
        }

        self.apply_remote_version(&version);

        if let Some(reject) = self.inner.listener.on_version(self, &version) {
            let reason = reject.reason.clone();
            let _ = self.write_message(writer, Message::Reject(reject)).await;
            return Err(PeerError::Rejected(reason));
        }
        Ok(())
    }

    fn apply_remote_version(&self, version: &MsgVersion) {
        let mut flags = self.inner.flags.lock();
        flags.version_known = true;
        flags.advertised_proto_ver = version.protocol_version;
        flags.protocol_version = version
            .protocol_version
            .min(self.inner.config.protocol_version);
        flags.services = version.services;
        flags.user_agent = version.user_agent.clone();
        flags.time_offset = version.timestamp - Utc::now().timestamp();
        flags.disable_relay_tx = version.disable_relay_tx;
        flags.last_gs = version.last_gs.clone();

        match flags.na.as_mut() {
            Some(na) => na.services = version.services,
            None => {
                flags.na = Some(NetAddress::from_socket_addr(
                    self.inner.addr,
                    version.services,
                ))
            }
        }
        log::debug!(
            "Negotiated protocol version {} with {} ({})",
            flags.protocol_version,
            self,
            flags.user_agent
        );
    }

    async fn write_local_version(&self, writer: &mut Writer) -> Result<(), PeerError> {
        let config = &self.inner.config;
        let addr_you = self
            .na()
            .unwrap_or_else(|| NetAddress::from_socket_addr(self.inner.addr, ServiceFlags::empty()));
        let addr_me = NetAddress {
            services: config.services,
            ..NetAddress::unspecified()
        };
        let last_gs = match &config.graph_state {
            Some(graph_state) => graph_state(),
            None => GraphState::default(),
        };

        let version = MsgVersion {
            protocol_version: config.protocol_version,
            services: config.services,
            timestamp: Utc::now().timestamp(),
            addr_you,
            addr_me,
            nonce: self.inner.registry.new_nonce(),
            user_agent: config.user_agent.clone(),
            last_gs,
            disable_relay_tx: config.disable_relay_tx,
        };
        self.write_message(writer, Message::Version(version)).await
    }

    async fn read_remote_verack(&self, reader: &mut Reader) -> Result<(), PeerError> {
        match self.read_message(reader).await? {
            Message::VerAck => {
                self.inner.flags.lock().verack_received = true;
                self.inner.listener.on_verack(self);
                Ok(())
            }
            other => Err(PeerError::ExpectedVerAck(other.command().to_string())),
        }
    }

    async fn read_message(&self, reader: &mut Reader) -> Result<Message, PeerError> {
        let frame = match reader.next().await {
            Some(frame) => frame?,
            None => return Err(PeerError::Disconnected),
        };
        self.record_read(&frame);
        Ok(frame.to_message()?)
    }

    pub(super) fn record_read(&self, frame: &Frame) {
        let len = frame.wire_len();
        self.inner
            .bytes_received
            .fetch_add(len as u64, Ordering::Relaxed);
        self.inner
            .last_recv
            .store(Utc::now().timestamp(), Ordering::Relaxed);
        self.inner.listener.on_read(self, len, &frame.command);
    }

    pub(super) async fn write_message(
        &self,
        writer: &mut Writer,
        msg: Message,
    ) -> Result<(), PeerError> {
        let frame = Frame::from_message(&msg)?;
        let len = frame.wire_len();
        writer.send(frame).await?;

        self.inner.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        self.inner
            .last_send
            .store(Utc::now().timestamp(), Ordering::Relaxed);
        self.inner.listener.on_write(self, len, msg.command());
        log::trace!("Sent {} to {}", msg.summary(), self);
        Ok(())
    }
}
