//! The per-peer protocol engine.
//!
//! A [`Connection`] is sans-IO. Datagrams go in through
//! [`Connection::handle_datagram`], come out of [`Connection::poll_datagram`],
//! and time moves through [`Connection::handle_timeout`]. Which side of the
//! handshake it plays is fixed by [`Connection::connect`] or
//! [`Connection::accept`]; the handshake logic lives in `client.rs` and
//! `server.rs`, everything after it in this file.

mod client;
mod server;
mod state;

pub use state::State;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use arrayvec::ArrayVec;
use zeroize::Zeroizing;

use crate::buffer::Buf;
use crate::config::Psk;
use crate::containers::RingBuffer;
use crate::cookie::Cookie;
use crate::crypto::{CipherSuite, KeyExchange, KeySchedule, NamedGroup, Secret};
use crate::handler::{ConnectionHandler, DisconnectReason, HandshakeInfo};
use crate::handshake::{Absorbed, Message, RecvQueue, SendQueue, Transcript};
use crate::keys::{Keys, APPLICATION_EPOCH};
use crate::message::{
    decode, parse_ack, write_ack, Alert, AlertDescription, FragmentHeader, KeyUpdate,
    MessageType, NewSessionTicket, FRAGMENT_HEADER_LEN, MAX_ACK_ENTRIES,
};
use crate::record::{
    max_content, ContentType, HeaderKind, RecordHeader, RecordNumber, PLAINTEXT_HEADER_LEN,
};
use crate::rng::SeededRng;
use crate::timer::ExponentialBackoff;
use crate::{Config, Error, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timeout {
    Disabled,
    /// Armed relative to the next `handle_timeout`.
    Unarmed,
    Armed(Instant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verification {
    NotStarted,
    /// The handler deferred its verdict. Delivery is stalled.
    Pending,
    Done,
}

/// State that only lives while the handshake is in progress.
struct HandshakeContext {
    transcript: Transcript,
    send: SendQueue,
    recv: RecvQueue,
    random: [u8; 32],
    suite: Option<CipherSuite>,
    group: NamedGroup,
    key_exchange: Option<KeyExchange>,
    schedule: Option<KeySchedule>,
    client_secret: Option<Secret>,
    server_secret: Option<Secret>,
    psk_key: Option<Zeroizing<Vec<u8>>>,
    psk_accepted: bool,
    /// Cookie from a HelloRetryRequest, echoed in ClientHello2.
    cookie: Option<Cookie>,
    alpn: Option<Vec<u8>>,
    peer_chain: Vec<Vec<u8>>,
    verification: Verification,
}

impl HandshakeContext {
    fn new(config: &Config) -> Box<Self> {
        Box::new(HandshakeContext {
            transcript: Transcript::new(),
            send: SendQueue::new(),
            recv: RecvQueue::new(config.max_reassembly_depth()),
            random: [0; 32],
            suite: None,
            group: NamedGroup::SUPPORTED[0],
            key_exchange: None,
            schedule: None,
            client_secret: None,
            server_secret: None,
            psk_key: None,
            psk_accepted: false,
            cookie: None,
            alpn: None,
            peer_chain: Vec::new(),
            verification: Verification::NotStarted,
        })
    }

    fn suite(&self) -> CipherSuite {
        self.suite.expect("suite negotiated")
    }

    fn schedule(&mut self) -> &mut KeySchedule {
        self.schedule.as_mut().expect("key schedule started")
    }
}

/// A KeyUpdate or NewSessionTicket waiting for its ACK.
///
/// Post-handshake messages are never fragmented and are retransmitted on
/// the same timer as handshake flights.
#[derive(Debug)]
struct PostMessage {
    msg_type: MessageType,
    msg_seq: u16,
    body: Buf,
    /// Record of the latest transmission.
    record: Option<RecordNumber>,
    /// Waiting to be (re)transmitted.
    due: bool,
}

impl PostMessage {
    fn new(msg_type: MessageType, msg_seq: u16, body: Buf) -> Self {
        PostMessage {
            msg_type,
            msg_seq,
            body,
            record: None,
            due: true,
        }
    }
}

/// One DTLS 1.3 association with a peer.
pub struct Connection {
    config: Arc<Config>,
    handler: Box<dyn ConnectionHandler>,
    rng: SeededRng,
    state: State,
    peer: Option<SocketAddr>,
    keys: Keys,
    handshake: Option<Box<HandshakeContext>>,

    /// Sequence number of the next handshake message we send.
    next_send_seq: u32,
    /// Next post-handshake message we accept.
    next_recv_seq: u32,

    pending_acks: RingBuffer<RecordNumber>,
    alert: Option<Alert>,
    key_update: Option<PostMessage>,
    ticket: Option<PostMessage>,
    session_ticket: Option<Vec<u8>>,
    /// We asked the peer to update and it has not switched yet.
    requested_peer_update: bool,
    /// The application has data to write.
    writable: bool,

    backoff: ExponentialBackoff,
    retransmit_timeout: Timeout,
    handshake_timeout: Timeout,
    last_now: Option<Instant>,

    /// Record content is assembled here before protection.
    scratch: Buf,
}

impl Connection {
    /// A closed connection. Servers need a certificate or a PSK resolver.
    pub fn new(config: Arc<Config>, handler: Box<dyn ConnectionHandler>) -> Result<Self, Error> {
        if config.role() == Role::Server
            && config.identity().is_none()
            && !matches!(config.psk(), Some(Psk::Server { .. }))
        {
            return Err(Error::ConfigError(
                "server needs a certificate or a PSK resolver".into(),
            ));
        }

        let mut rng = SeededRng::new(config.rng_seed());
        let backoff = ExponentialBackoff::new(
            config.flight_start_rto(),
            config.flight_retries(),
            &mut rng,
        );

        Ok(Connection {
            keys: Keys::from_config(&config),
            scratch: Buf::with_capacity(config.mtu()),
            config,
            handler,
            rng,
            state: State::Closed,
            peer: None,
            handshake: None,
            next_send_seq: 0,
            next_recv_seq: 0,
            pending_acks: RingBuffer::new(MAX_ACK_ENTRIES),
            alert: None,
            key_update: None,
            ticket: None,
            session_ticket: None,
            requested_peer_update: false,
            writable: false,
            backoff,
            retransmit_timeout: Timeout::Disabled,
            handshake_timeout: Timeout::Disabled,
            last_now: None,
        })
    }

    /// Return a closed connection to its initial state with a new handler,
    /// keeping allocations.
    pub fn reset(&mut self, handler: Box<dyn ConnectionHandler>) {
        assert!(!self.state.is_active(), "reset of an active connection");
        self.handler = handler;
        self.clear();
        self.keys = Keys::from_config(&self.config);
        self.peer = None;
        self.next_send_seq = 0;
        self.next_recv_seq = 0;
        self.session_ticket = None;
        self.requested_peer_update = false;
        self.last_now = None;
        self.state = State::Closed;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn is_established(&self) -> bool {
        self.state == State::PostHandshake
    }

    /// Epoch our records currently go out in.
    pub fn send_epoch(&self) -> u16 {
        self.keys.send_epoch()
    }

    /// Epoch the peer is currently believed to send in.
    pub fn recv_epoch(&self) -> u16 {
        self.keys.recv_epoch()
    }

    /// Opaque ticket from the server's NewSessionTicket, if any arrived.
    pub fn session_ticket(&self) -> Option<&[u8]> {
        self.session_ticket.as_deref()
    }

    fn now(&self) -> Instant {
        self.last_now.expect("entry points set the time")
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            trace!("{:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn begin(&mut self, peer: SocketAddr, now: Instant) -> Result<(), Error> {
        if self.state != State::Closed {
            return Err(Error::ConfigError("connection already in use".into()));
        }
        self.clear();
        self.last_now = Some(now);
        self.peer = Some(peer);
        self.handshake = Some(HandshakeContext::new(&self.config));
        self.handshake_timeout = Timeout::Unarmed;
        self.handler.on_connect(peer);
        Ok(())
    }

    fn clear(&mut self) {
        self.handshake = None;
        self.pending_acks.clear();
        self.alert = None;
        self.key_update = None;
        self.ticket = None;
        self.writable = false;
        self.retransmit_timeout = Timeout::Disabled;
        self.handshake_timeout = Timeout::Disabled;
    }

    fn next_message_seq(&mut self) -> Result<u16, Error> {
        let seq = u16::try_from(self.next_send_seq).map_err(|_| Error::MessageSeqOverflow)?;
        self.next_send_seq += 1;
        Ok(seq)
    }

    // ---- application facing operations --------------------------------

    /// The application has data. [`ConnectionHandler::on_write_record`]
    /// will be called once the handshake is done.
    pub fn signal_writable(&mut self) {
        self.writable = true;
    }

    /// Start a KeyUpdate. `request_peer` asks the peer to update as well.
    ///
    /// A KeyUpdate already in flight makes this a no-op.
    pub fn initiate_key_update(&mut self, request_peer: bool) -> Result<(), Error> {
        if self.state != State::PostHandshake {
            return Err(Error::UnexpectedMessage(format!(
                "KeyUpdate in {}",
                self.state.name()
            )));
        }
        if self.key_update.is_some() {
            debug!("KeyUpdate already in flight");
            return Ok(());
        }
        let result = self.start_key_update(request_peer);
        self.settle(result)
    }

    /// Orderly close: close_notify goes out with the next datagram.
    pub fn shutdown(&mut self) {
        if !self.state.is_active() {
            return;
        }
        info!("Closing connection to {:?}", self.peer);
        self.begin_close(Some(Alert::close_notify()), DisconnectReason::Closed);
    }

    /// Verdict on a certificate the handler deferred.
    pub fn complete_certificate_verification(&mut self, accept: bool, now: Instant) -> Result<(), Error> {
        self.last_now = Some(now);
        let pending = self
            .handshake
            .as_ref()
            .map(|c| c.verification == Verification::Pending)
            .unwrap_or(false);
        if !pending {
            return Ok(());
        }
        let result = if accept {
            if let Some(ctx) = self.handshake.as_mut() {
                ctx.verification = Verification::Done;
            }
            self.deliver_handshake()
        } else {
            Err(Error::BadCertificate("rejected by application".into()))
        };
        self.settle(result)
    }

    // ---- timers ---------------------------------------------------------

    /// When [`Connection::handle_timeout`] wants to be called next.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let at = |t: Timeout| match t {
            Timeout::Disabled => None,
            Timeout::Unarmed => self.last_now,
            Timeout::Armed(at) => Some(at),
        };
        match (at(self.handshake_timeout), at(self.retransmit_timeout)) {
            (Some(h), Some(r)) => Some(h.min(r)),
            (h, r) => h.or(r),
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        self.last_now = Some(now);
        if !self.state.is_active() {
            return Ok(());
        }
        let result = self.check_timers(now).and_then(|_| self.maintain());
        self.settle(result)
    }

    fn check_timers(&mut self, now: Instant) -> Result<(), Error> {
        if self.handshake_timeout == Timeout::Unarmed {
            debug!(
                "Handshake timeout in: {:.03}s",
                self.config.handshake_timeout().as_secs_f32()
            );
            self.handshake_timeout = Timeout::Armed(now + self.config.handshake_timeout());
        }
        if self.retransmit_timeout == Timeout::Unarmed {
            trace!(
                "Retransmit timeout in: {:.03}s",
                self.backoff.rto().as_secs_f32()
            );
            self.retransmit_timeout = Timeout::Armed(now + self.backoff.rto());
        }

        if let Timeout::Armed(deadline) = self.handshake_timeout {
            if now >= deadline {
                return Err(Error::Timeout("handshake"));
            }
        }

        let Timeout::Armed(at) = self.retransmit_timeout else {
            return Ok(());
        };
        if now < at {
            return Ok(());
        }
        if !self.has_outstanding() {
            self.retransmit_timeout = Timeout::Disabled;
            return Ok(());
        }
        if !self.backoff.can_retry() {
            return Err(Error::Timeout("retransmission"));
        }
        self.backoff.attempt(&mut self.rng);
        debug!(
            "Re-arm retransmit timeout in {:.03}s",
            self.backoff.rto().as_secs_f32()
        );
        self.retransmit_timeout = Timeout::Armed(now + self.backoff.rto());
        self.retransmit("timeout");
        Ok(())
    }

    /// Restart the retransmission backoff for something new to deliver.
    fn arm_retransmit(&mut self) {
        self.backoff.reset(&mut self.rng);
        self.retransmit_timeout = Timeout::Unarmed;
    }

    fn disarm_if_idle(&mut self) {
        if !self.has_outstanding() {
            self.retransmit_timeout = Timeout::Disabled;
        }
    }

    /// Something we sent is waiting for an acknowledgement.
    fn has_outstanding(&self) -> bool {
        let flight = self
            .handshake
            .as_ref()
            .map(|c| c.send.has_flight() && !c.send.is_acked())
            .unwrap_or(false);
        flight || self.key_update.is_some() || self.ticket.is_some()
    }

    fn retransmit(&mut self, reason: &str) {
        if let Some(ctx) = self.handshake.as_mut() {
            if ctx.send.has_flight() && !ctx.send.is_acked() {
                debug!("Resending flight {} due to {}", ctx.send.flight(), reason);
                ctx.send.rewind();
            }
        }
        for post in [&mut self.key_update, &mut self.ticket].into_iter().flatten() {
            debug!("Resending {:?} due to {}", post.msg_type, reason);
            post.due = true;
        }
    }

    // ---- errors and closing ----------------------------------------------

    /// Warnings drop what caused them. Fatal errors close the connection.
    fn settle(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if !e.is_fatal() => {
                trace!("Dropped: {}", e);
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn fail(&mut self, e: &Error) {
        if !self.state.is_active() {
            return;
        }
        let reason = match e {
            Error::Timeout(what) => {
                info!("Connection to {:?} timed out: {}", self.peer, what);
                DisconnectReason::Timeout
            }
            _ => {
                warn!("Connection to {:?} failed: {}", self.peer, e);
                DisconnectReason::Error(e.to_string())
            }
        };
        self.begin_close(e.alert().map(Alert::fatal), reason);
    }

    fn begin_close(&mut self, alert: Option<Alert>, reason: DisconnectReason) {
        self.clear();
        self.handler.on_disconnect(&reason);
        match alert {
            Some(alert) => {
                self.alert = Some(alert);
                self.set_state(State::Shutdown);
            }
            None => self.set_state(State::Closed),
        }
    }

    // ---- incoming ---------------------------------------------------------

    /// Process one datagram. It is decrypted in place.
    ///
    /// Malformed, unauthentic or replayed records are dropped silently.
    /// A fatal error closes the connection and is returned.
    pub fn handle_datagram(&mut self, datagram: &mut [u8], now: Instant) -> Result<(), Error> {
        self.last_now = Some(now);
        let mut offset = 0;
        while offset < datagram.len() && self.state.is_active() {
            let header = match RecordHeader::parse(&datagram[offset..], offset) {
                Ok((rest, header)) => {
                    offset = datagram.len() - rest.len();
                    header
                }
                Err(e) => {
                    trace!(
                        "Drop {} bytes of datagram: {:?}",
                        datagram.len() - offset,
                        e
                    );
                    break;
                }
            };
            let result = self.handle_record(datagram, &header);
            self.settle(result)?;
        }
        if self.state.is_active() {
            let result = self.maintain();
            self.settle(result)?;
        }
        Ok(())
    }

    fn handle_record(&mut self, datagram: &mut [u8], header: &RecordHeader) -> Result<(), Error> {
        match header.kind {
            HeaderKind::Plaintext {
                content_type,
                epoch,
                seq,
            } => {
                if epoch != 0 {
                    return Err(Error::RecordDropped("plaintext record in encrypted epoch"));
                }
                let number = self.keys.accept_plaintext(seq)?;
                let body = &datagram[header.body.clone()];
                match content_type {
                    ContentType::Handshake => self.handle_handshake(number, body),
                    // Unauthenticated alerts only count before there are keys.
                    ContentType::Alert if self.keys.recv_epoch() == 0 => {
                        self.handle_alert(body)
                    }
                    _ => Err(Error::RecordDropped("unexpected plaintext record")),
                }
            }
            HeaderKind::Ciphertext { .. } => {
                let opened = self.keys.open(datagram, header)?;
                if opened.promoted {
                    self.on_epoch_promoted(opened.number.epoch());
                }
                let body = &datagram[opened.content];
                match opened.content_type {
                    ContentType::Handshake => self.handle_handshake(opened.number, body),
                    ContentType::Ack => self.handle_ack(body),
                    ContentType::Alert => self.handle_alert(body),
                    ContentType::ApplicationData => self.handle_application(opened.number, body),
                    _ => Err(Error::UnexpectedMessage(format!(
                        "record of type {:?}",
                        opened.content_type
                    ))),
                }
            }
        }
    }

    fn on_epoch_promoted(&mut self, epoch: u16) {
        if epoch < APPLICATION_EPOCH {
            return;
        }
        self.requested_peer_update = false;
        // Traffic in the application epoch acknowledges the client's
        // Finished implicitly.
        if self.state == State::PostHandshake && self.handshake.is_some() {
            self.confirm_handshake();
        }
    }

    fn handle_alert(&mut self, body: &[u8]) -> Result<(), Error> {
        let alert = decode(body, Alert::parse, "Alert")?;
        if alert.description == AlertDescription::CloseNotify {
            info!("Peer {:?} closed the connection", self.peer);
            self.begin_close(None, DisconnectReason::PeerClosed);
        } else if alert.is_fatal() {
            warn!("Peer {:?} sent alert {:?}", self.peer, alert.description);
            self.begin_close(None, DisconnectReason::PeerAlert(alert.description));
        } else {
            debug!("Ignoring alert {:?}", alert.description);
        }
        Ok(())
    }

    fn handle_application(&mut self, number: RecordNumber, body: &[u8]) -> Result<(), Error> {
        if self.state != State::PostHandshake || number.epoch() < APPLICATION_EPOCH {
            return Err(Error::RecordDropped("application data before handshake"));
        }
        self.handler.on_read_record(body)
    }

    fn handle_ack(&mut self, body: &[u8]) -> Result<(), Error> {
        let records = decode(body, parse_ack, "ACK")?;
        for record in records {
            if let Some(ctx) = self.handshake.as_mut() {
                ctx.send.ack(record);
            }
            if self.key_update.as_ref().and_then(|k| k.record) == Some(record) {
                self.key_update = None;
                let epoch = self.keys.roll_send_epoch()?;
                debug!("KeyUpdate acked, sending in epoch {}", epoch);
            }
            if self.ticket.as_ref().and_then(|t| t.record) == Some(record) {
                trace!("NewSessionTicket acked");
                self.ticket = None;
            }
        }

        let flight_done = self
            .handshake
            .as_ref()
            .map(|c| c.send.has_flight() && c.send.is_acked())
            .unwrap_or(false);
        if flight_done && self.state == State::PostHandshake {
            self.confirm_handshake();
        }
        self.disarm_if_idle();
        Ok(())
    }

    fn handle_handshake(&mut self, number: RecordNumber, mut body: &[u8]) -> Result<(), Error> {
        while !body.is_empty() {
            let (rest, (header, data)) = match FragmentHeader::parse(body) {
                Ok(v) => v,
                Err(e) if number.epoch() == 0 => {
                    trace!("Malformed plaintext handshake record: {:?}", e);
                    return Err(Error::RecordDropped("malformed handshake fragment"));
                }
                Err(e) => return Err(Error::DecodeError(format!("handshake fragment: {:?}", e))),
            };
            body = rest;

            if header.msg_type.is_post_handshake() {
                self.handle_post_handshake(number, &header, data)?;
                continue;
            }
            if number.epoch() == 0
                && !matches!(
                    header.msg_type,
                    MessageType::ClientHello | MessageType::ServerHello
                )
            {
                return Err(Error::RecordDropped("encrypted message type in plaintext"));
            }

            let Some(ctx) = self.handshake.as_mut() else {
                // The peer repeats its last flight. Our ACK was lost.
                if number.epoch() > 0 {
                    self.queue_ack(number);
                }
                continue;
            };

            match ctx.recv.absorb(&header, data) {
                Ok(Absorbed::Ack) => {
                    if number.epoch() > 0 {
                        self.queue_ack(number);
                    }
                }
                Ok(Absorbed::Pending) => {}
                Ok(Absorbed::Delivered) => {
                    // The peer did not see our reply to it.
                    if number.epoch() > 0 {
                        self.queue_ack(number);
                    }
                    self.retransmit("peer retransmission");
                }
                Err(e) => trace!("Fragment dropped: {}", e),
            }
        }
        self.deliver_handshake()
    }

    /// Feed complete messages to the state machine in order.
    fn deliver_handshake(&mut self) -> Result<(), Error> {
        loop {
            let Some(ctx) = self.handshake.as_mut() else {
                return Ok(());
            };
            if ctx.verification == Verification::Pending {
                return Ok(());
            }
            let Some(message) = ctx.recv.pop() else {
                return Ok(());
            };
            trace!(
                "Deliver {:?} seq {} in {}",
                message.msg_type,
                message.msg_seq,
                self.state.name()
            );
            let result = self.handle_message(&message);
            if let Some(ctx) = self.handshake.as_mut() {
                ctx.recv.recycle(message.body);
            }
            result?;
        }
    }

    fn handle_message(&mut self, message: &Message) -> Result<(), Error> {
        let body = &message.body[..];
        match (self.state, message.msg_type) {
            (s, MessageType::ServerHello) if s.awaits_first_reply() => {
                self.client_on_server_hello(body)
            }
            (State::ClientExpectServerHello, MessageType::ServerHello) => {
                self.client_on_server_hello(body)
            }
            (State::ClientExpectEncryptedExtensions, MessageType::EncryptedExtensions) => {
                self.client_on_encrypted_extensions(body)
            }
            (State::ClientExpectCertificate, MessageType::Certificate) => {
                self.client_on_certificate(body)
            }
            (State::ClientExpectCertificateVerify, MessageType::CertificateVerify) => {
                self.client_on_certificate_verify(body)
            }
            (State::ClientExpectFinished, MessageType::Finished) => self.client_on_finished(body),
            (State::ServerExpectFinished, MessageType::Finished) => self.server_on_finished(body),
            (state, msg_type) => Err(Error::UnexpectedMessage(format!(
                "{:?} in {}",
                msg_type,
                state.name()
            ))),
        }
    }

    fn handle_post_handshake(
        &mut self,
        number: RecordNumber,
        header: &FragmentHeader,
        data: &[u8],
    ) -> Result<(), Error> {
        if self.state != State::PostHandshake {
            return Err(Error::UnexpectedMessage(format!(
                "{:?} during handshake",
                header.msg_type
            )));
        }
        if number.epoch() < APPLICATION_EPOCH {
            return Err(Error::RecordDropped("post-handshake message outside application epoch"));
        }
        if !header.is_complete() {
            return Err(Error::RecordDropped("fragmented post-handshake message"));
        }

        let seq = header.message_seq as u32;
        if seq < self.next_recv_seq {
            self.queue_ack(number);
            return Ok(());
        }
        if seq > self.next_recv_seq {
            return Err(Error::RecordDropped("post-handshake message out of order"));
        }

        match header.msg_type {
            MessageType::KeyUpdate => {
                let update = decode(data, KeyUpdate::parse, "KeyUpdate")?;
                self.keys.stage_recv_next()?;
                debug!(
                    "Peer KeyUpdate in epoch {} (requested: {})",
                    number.epoch(),
                    update.update_requested
                );
                if update.update_requested && self.key_update.is_none() {
                    self.start_key_update(false)?;
                }
            }
            MessageType::NewSessionTicket => {
                if self.config.role() == Role::Server {
                    return Err(Error::UnexpectedMessage("NewSessionTicket from client".into()));
                }
                let ticket = decode(data, NewSessionTicket::parse, "NewSessionTicket")?;
                debug!(
                    "Session ticket of {} bytes, lifetime {}s",
                    ticket.ticket.len(),
                    ticket.lifetime
                );
                self.session_ticket = Some(ticket.ticket.to_vec());
            }
            _ => unreachable!("is_post_handshake"),
        }
        self.next_recv_seq += 1;
        self.queue_ack(number);
        Ok(())
    }

    fn queue_ack(&mut self, number: RecordNumber) {
        if self.pending_acks.iter().any(|n| *n == number) {
            return;
        }
        // The oldest entry gives way.
        self.pending_acks.push_overwrite(number);
    }

    // ---- handshake completion and key updates -----------------------------

    fn handshake_complete(&mut self) {
        let ctx = self.handshake.as_ref().expect("handshake context");
        let info = HandshakeInfo {
            role: self.config.role(),
            peer: self.peer.expect("peer set on connect"),
            cipher_suite: ctx.suite(),
            alpn: ctx.alpn.clone(),
            peer_certificate: ctx.peer_chain.first().cloned(),
            psk: ctx.psk_accepted,
        };
        self.next_recv_seq = ctx.recv.next_seq();
        self.handshake_timeout = Timeout::Disabled;
        self.set_state(State::PostHandshake);
        info!(
            "Connection to {} established with {}",
            info.peer, info.cipher_suite
        );
        self.handler.on_handshake_complete(&info);
    }

    /// Our last flight is acknowledged. Handshake state can go.
    fn confirm_handshake(&mut self) {
        debug!("Handshake confirmed");
        self.handshake = None;
        match self.config.role() {
            Role::Client => self.keys.drop_handshake_keys(),
            Role::Server => self.keys.drop_send_handshake_keys(),
        }
        self.disarm_if_idle();
    }

    fn start_key_update(&mut self, request_peer: bool) -> Result<(), Error> {
        if self.keys.send_epoch() == u16::MAX {
            return Err(Error::EpochOverflow);
        }
        let msg_seq = self.next_message_seq()?;
        let mut body = Buf::new();
        KeyUpdate {
            update_requested: request_peer,
        }
        .write(&mut body);
        debug!(
            "Send KeyUpdate in epoch {} (request peer: {})",
            self.keys.send_epoch(),
            request_peer
        );
        self.key_update = Some(PostMessage::new(MessageType::KeyUpdate, msg_seq, body));
        if request_peer {
            self.requested_peer_update = true;
        }
        self.arm_retransmit();
        Ok(())
    }

    fn queue_session_ticket(&mut self) -> Result<(), Error> {
        let msg_seq = self.next_message_seq()?;
        let mut ticket = [0u8; 32];
        crate::rng::fill_secure(&mut ticket);
        let mut body = Buf::new();
        NewSessionTicket {
            lifetime: 86_400,
            age_add: self.rng.random(),
            nonce: &[0],
            ticket: &ticket,
        }
        .write(&mut body);
        self.ticket = Some(PostMessage::new(MessageType::NewSessionTicket, msg_seq, body));
        self.arm_retransmit();
        Ok(())
    }

    /// Start a KeyUpdate when either direction nears its AEAD limit.
    fn maintain(&mut self) -> Result<(), Error> {
        if self.state != State::PostHandshake || self.key_update.is_some() {
            return Ok(());
        }
        let request_peer = self.keys.recv_needs_update()
            && !self.requested_peer_update
            && !self.keys.recv_update_pending();
        if self.keys.send_needs_update() || request_peer {
            debug!("AEAD usage at soft limit");
            self.start_key_update(request_peer)?;
        }
        Ok(())
    }

    // ---- outgoing -----------------------------------------------------------

    /// Fill `out` with the next datagram. Returns false when there is
    /// nothing to send.
    ///
    /// Order of records: alert, ACK, handshake fragments, post-handshake
    /// messages, application data.
    pub fn poll_datagram(&mut self, out: &mut Buf) -> bool {
        out.clear();
        if self.state == State::Closed {
            return false;
        }
        if let Err(e) = self.fill_datagram(out) {
            self.fail(&e);
            if let Err(e) = self.write_alert(out) {
                debug!("Failed to write alert: {}", e);
            }
        }
        !out.is_empty()
    }

    fn fill_datagram(&mut self, out: &mut Buf) -> Result<(), Error> {
        self.write_alert(out)?;
        if !self.state.is_active() {
            return Ok(());
        }
        self.maintain()?;
        self.write_acks(out)?;
        self.write_handshake(out)?;
        if self.state == State::ClientSentHello1 {
            let sent = self.handshake.as_ref().map(|c| !c.send.has_pending());
            if sent == Some(true) {
                self.set_state(State::ClientExpectHrr);
            }
        }
        self.write_post_handshake(out)?;
        self.write_application(out)
    }

    fn write_alert(&mut self, out: &mut Buf) -> Result<(), Error> {
        let Some(alert) = self.alert.take() else {
            return Ok(());
        };
        if self.state == State::Shutdown {
            self.set_state(State::Closed);
        }
        let epoch = self.keys.send_epoch();
        if content_space(self.config.mtu(), out.len(), epoch, self.keys.padding()) < 2 {
            out.clear();
        }
        self.scratch.clear();
        alert.write(&mut self.scratch);
        debug!("Send alert {:?} in epoch {}", alert.description, epoch);
        if epoch == 0 {
            self.keys
                .write_plaintext(out, ContentType::Alert, &self.scratch)?;
        } else {
            self.keys
                .seal(out, epoch, ContentType::Alert, &self.scratch)?;
        }
        Ok(())
    }

    fn write_acks(&mut self, out: &mut Buf) -> Result<(), Error> {
        if self.pending_acks.is_empty() {
            return Ok(());
        }
        let epoch = self.keys.send_epoch();
        if epoch == 0 {
            self.pending_acks.clear();
            return Ok(());
        }
        let space = content_space(self.config.mtu(), out.len(), epoch, self.keys.padding());
        let count = (space.saturating_sub(2) / 16).min(self.pending_acks.len());
        if count == 0 {
            return Ok(());
        }
        let records: ArrayVec<RecordNumber, MAX_ACK_ENTRIES> =
            self.pending_acks.iter().take(count).copied().collect();
        self.scratch.clear();
        write_ack(&mut self.scratch, &records);
        self.keys
            .seal(out, epoch, ContentType::Ack, &self.scratch)?;
        trace!("Send ACK for {} records in epoch {}", count, epoch);
        for _ in 0..count {
            self.pending_acks.pop();
        }
        Ok(())
    }

    fn write_handshake(&mut self, out: &mut Buf) -> Result<(), Error> {
        let mtu = self.config.mtu();
        let padding = self.keys.padding();
        let Some(ctx) = self.handshake.as_mut() else {
            return Ok(());
        };
        while let Some(epoch) = ctx.send.pending_epoch() {
            let space = content_space(mtu, out.len(), epoch, padding)
                .saturating_sub(FRAGMENT_HEADER_LEN);
            let Some(fragment) = ctx.send.next_fragment(space) else {
                break;
            };
            debug_assert_eq!(fragment.epoch, epoch);

            self.scratch.clear();
            FragmentHeader {
                msg_type: fragment.msg_type,
                length: fragment.length as u32,
                message_seq: fragment.msg_seq,
                fragment_offset: fragment.range.start as u32,
                fragment_length: fragment.range.len() as u32,
            }
            .write(&mut self.scratch);
            self.scratch
                .extend_from_slice(&ctx.send.body(fragment.index)[fragment.range.clone()]);

            let record = if fragment.epoch == 0 {
                self.keys
                    .write_plaintext(out, ContentType::Handshake, &self.scratch)?
            } else {
                self.keys
                    .seal(out, fragment.epoch, ContentType::Handshake, &self.scratch)?
            };
            trace!(
                "Send {:?} seq {} bytes {:?} in {:?}",
                fragment.msg_type,
                fragment.msg_seq,
                fragment.range,
                record
            );
            ctx.send.record_sent(&fragment, record);
        }
        Ok(())
    }

    fn write_post_handshake(&mut self, out: &mut Buf) -> Result<(), Error> {
        let mtu = self.config.mtu();
        for slot in [&mut self.key_update, &mut self.ticket] {
            let Some(post) = slot.as_mut().filter(|p| p.due) else {
                continue;
            };
            let epoch = self.keys.send_epoch();
            let needed = FRAGMENT_HEADER_LEN + post.body.len();
            if content_space(mtu, out.len(), epoch, self.keys.padding()) < needed {
                return Ok(());
            }
            self.scratch.clear();
            FragmentHeader {
                msg_type: post.msg_type,
                length: post.body.len() as u32,
                message_seq: post.msg_seq,
                fragment_offset: 0,
                fragment_length: post.body.len() as u32,
            }
            .write(&mut self.scratch);
            self.scratch.extend_from_slice(&post.body);
            let record = self
                .keys
                .seal(out, epoch, ContentType::Handshake, &self.scratch)?;
            trace!("Send {:?} in {:?}", post.msg_type, record);
            post.record = Some(record);
            post.due = false;
        }
        Ok(())
    }

    fn write_application(&mut self, out: &mut Buf) -> Result<(), Error> {
        if self.state != State::PostHandshake {
            return Ok(());
        }
        let mtu = self.config.mtu();
        while self.writable {
            let epoch = self.keys.send_epoch();
            let space = content_space(mtu, out.len(), epoch, self.keys.padding());
            if space == 0 {
                break;
            }
            self.scratch.resize(space, 0);
            let write = self.handler.on_write_record(&mut self.scratch[..space]);
            assert!(write.size <= space, "handler wrote past the record");
            self.writable = write.has_more;
            if write.size == 0 {
                break;
            }
            self.keys.seal(
                out,
                epoch,
                ContentType::ApplicationData,
                &self.scratch[..write.size],
            )?;
            if write.should_send {
                break;
            }
        }
        Ok(())
    }
}

/// Content bytes that fit into what is left of the datagram.
fn content_space(mtu: usize, used: usize, epoch: u16, padding: usize) -> usize {
    let left = mtu.saturating_sub(used);
    if epoch == 0 {
        left.saturating_sub(PLAINTEXT_HEADER_LEN)
    } else {
        max_content(left, padding)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.config.role())
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("keys", &self.keys)
            .finish()
    }
}
