use std::time::Instant;

use arrayvec::ArrayVec;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::{Connection, State};
use crate::acceptor::{write_hello_retry, Accepted};
use crate::buffer::Buf;
use crate::config::Psk;
use crate::crypto::{finished_mac, HashAlgorithm, KeyExchange, KeySchedule};
use crate::handshake::Transcript;
use crate::keys::HANDSHAKE_EPOCH;
use crate::message::{
    decode, Certificate, CertificateVerify, ClientHello, EncryptedExtensions, MessageType,
    ServerHello, DTLS1_3,
};
use crate::rng::fill_secure;
use crate::{Error, Role};

// Flight 2 is the stateless HelloRetryRequest.
const FLIGHT_SERVER_HELLO: u8 = 4;

impl Connection {
    /// Take over a ClientHello the [`Acceptor`](crate::Acceptor) let
    /// through. The server's flight goes out with the next
    /// [`Connection::poll_datagram`].
    pub fn accept(&mut self, accepted: Accepted, now: Instant) -> Result<(), Error> {
        if self.config.role() != Role::Server {
            return Err(Error::ConfigError("accept on a client config".into()));
        }
        self.begin(accepted.peer, now)?;
        info!("Accepted connection from {}", accepted.peer);
        self.set_state(State::ServerExpectClientHello2);

        let result = self.server_on_client_hello(&accepted);
        self.settle(result)
    }

    fn server_on_client_hello(&mut self, accepted: &Accepted) -> Result<(), Error> {
        let body = &accepted.client_hello[..];
        let hello = decode(body, ClientHello::parse, "ClientHello")?;
        if !hello.supports_dtls13 {
            return Err(Error::ProtocolVersion);
        }

        let suite = accepted.suite;
        let group = accepted.group;
        if !hello.cipher_suites.contains(&suite) {
            return Err(Error::IllegalParameter(
                "cipher suite missing from ClientHello2".into(),
            ));
        }
        let cookie = hello.cookie.ok_or(Error::MissingExtension("cookie"))?;
        let share = hello
            .key_shares
            .iter()
            .find(|(g, _)| *g == group)
            .map(|(_, key)| *key)
            .ok_or_else(|| {
                Error::IllegalParameter(format!("no key share for {:?}", group))
            })?;

        // Records and messages continue after what the retry consumed.
        self.keys.set_plaintext_seq(accepted.record_seq);
        let mut msg_seq = accepted.message_seq as u32;

        let config = self.config.clone();
        let ctx = self.handshake.as_mut().expect("handshake context");
        ctx.suite = Some(suite);
        ctx.group = group;
        ctx.recv.skip_to(msg_seq + 1);

        ctx.transcript = Transcript::from_message_hash(suite, &accepted.cookie.transcript_hash);
        let mut retry = Buf::new();
        let requested = accepted.cookie.key_share_requested.then_some(group);
        write_hello_retry(&mut retry, hello.session_id, suite, requested, cookie);
        ctx.transcript.add_message(MessageType::ServerHello, &retry);

        let psk_key = match (config.psk(), &hello.psk) {
            (Some(Psk::Server { resolver }), Some(offered))
                if hello.psk_dhe_ke && suite.hash_algorithm() == HashAlgorithm::Sha256 =>
            {
                match (resolver.as_ref())(offered.identity) {
                    Some(key) => {
                        let binder_key = KeySchedule::new(suite, Some(key.as_slice()))?.binder_key()?;
                        let partial = ctx.transcript.hash_with_partial(
                            suite,
                            MessageType::ClientHello,
                            body.len(),
                            &body[..offered.binders_offset],
                        );
                        let expected =
                            finished_mac(suite.hash_algorithm(), &binder_key, &partial)?;
                        if !bool::from(offered.binder.ct_eq(&expected)) {
                            return Err(Error::SecurityError("PSK binder mismatch".into()));
                        }
                        Some(Zeroizing::new(key))
                    }
                    None => {
                        debug!(
                            "Unknown PSK identity {:?}",
                            String::from_utf8_lossy(offered.identity)
                        );
                        None
                    }
                }
            }
            _ => None,
        };
        let identity = config.identity();
        if psk_key.is_none() && identity.is_none() {
            return Err(Error::HandshakeFailure(
                "no usable PSK and no certificate".into(),
            ));
        }
        ctx.psk_accepted = psk_key.is_some();

        if !config.alpn_protocols().is_empty() && !hello.alpn.is_empty() {
            let selected = config
                .alpn_protocols()
                .iter()
                .find(|p| hello.alpn.contains(&p.as_slice()))
                .ok_or(Error::NoApplicationProtocol)?;
            ctx.alpn = Some(selected.clone());
        }

        ctx.transcript.add_message(MessageType::ClientHello, body);

        let key_exchange = KeyExchange::new(group)?;
        let public = Buf::from_slice(key_exchange.public_key());
        let shared = key_exchange.complete(share)?;

        fill_secure(&mut ctx.random);
        let mut server_hello = ctx.send.buffer();
        let mut sh = ServerHello::new(ctx.random, hello.session_id, suite.as_u16());
        sh.selected_version = Some(DTLS1_3);
        sh.key_share = Some((group, &public[..]));
        sh.selected_psk = ctx.psk_accepted.then_some(0);
        sh.write(&mut server_hello);
        ctx.transcript
            .add_message(MessageType::ServerHello, &server_hello);

        let mut schedule = KeySchedule::new(suite, psk_key.as_deref().map(|k| k.as_slice()))?;
        let (client, server) = schedule.handshake_secrets(&shared, &ctx.transcript.hash())?;
        self.keys.install_send_handshake(suite, &server)?;
        self.keys.install_recv_handshake(suite, &client)?;
        debug!(
            "ClientHello2 from {:?}: {} {:?} psk: {}",
            self.peer, suite, group, ctx.psk_accepted
        );

        let mut next_seq = || {
            let seq = u16::try_from(msg_seq).map_err(|_| Error::MessageSeqOverflow);
            msg_seq += 1;
            seq
        };

        ctx.send.begin_flight(FLIGHT_SERVER_HELLO);
        ctx.send
            .push(MessageType::ServerHello, next_seq()?, 0, server_hello);

        let mut extensions = ctx.send.buffer();
        EncryptedExtensions {
            alpn: ctx.alpn.as_deref(),
        }
        .write(&mut extensions);
        ctx.transcript
            .add_message(MessageType::EncryptedExtensions, &extensions);
        ctx.send.push(
            MessageType::EncryptedExtensions,
            next_seq()?,
            HANDSHAKE_EPOCH,
            extensions,
        );

        if !ctx.psk_accepted {
            let identity = identity.expect("checked above");

            let mut certificate = ctx.send.buffer();
            let mut chain = ArrayVec::new();
            chain.push(identity.certificate.certificate.as_slice());
            Certificate {
                context: &[],
                chain,
            }
            .write(&mut certificate);
            ctx.transcript
                .add_message(MessageType::Certificate, &certificate);
            ctx.send.push(
                MessageType::Certificate,
                next_seq()?,
                HANDSHAKE_EPOCH,
                certificate,
            );

            let mut content = Buf::new();
            CertificateVerify::signed_content(true, &ctx.transcript.hash(), &mut content);
            let mut signature = Buf::new();
            identity.signing_key.sign(&content, &mut signature);
            let mut verify = ctx.send.buffer();
            CertificateVerify {
                scheme: identity.signing_key.scheme(),
                signature: &signature,
            }
            .write(&mut verify);
            ctx.transcript
                .add_message(MessageType::CertificateVerify, &verify);
            ctx.send.push(
                MessageType::CertificateVerify,
                next_seq()?,
                HANDSHAKE_EPOCH,
                verify,
            );
        }

        let verify_data = finished_mac(suite.hash_algorithm(), &server, &ctx.transcript.hash())?;
        let mut finished = ctx.send.buffer();
        finished.extend_from_slice(&verify_data);
        ctx.transcript.add_message(MessageType::Finished, &finished);
        ctx.send
            .push(MessageType::Finished, next_seq()?, HANDSHAKE_EPOCH, finished);
        ctx.send.rewind();

        let (client_app, server_app) = schedule.application_secrets(&ctx.transcript.hash())?;
        ctx.client_secret = Some(client);
        ctx.server_secret = Some(server);
        ctx.psk_key = psk_key;

        self.keys.install_send_application(server_app)?;
        self.keys.stage_recv_application(client_app)?;
        self.next_send_seq = msg_seq;
        self.arm_retransmit();
        self.set_state(State::ServerExpectFinished);
        Ok(())
    }

    pub(super) fn server_on_finished(&mut self, body: &[u8]) -> Result<(), Error> {
        let ctx = self.handshake.as_mut().expect("handshake context");
        let hash = ctx.suite().hash_algorithm();
        let client_secret = ctx.client_secret.as_ref().expect("handshake secrets");
        let expected = finished_mac(hash, client_secret, &ctx.transcript.hash())?;
        if !bool::from(body.ct_eq(&expected)) {
            return Err(Error::SecurityError("client Finished mismatch".into()));
        }
        trace!("Client Finished verified");
        ctx.transcript.add_message(MessageType::Finished, body);

        // The client's Finished acknowledges our flight.
        ctx.send.clear();
        self.handshake_complete();
        self.confirm_handshake();

        if self.config.session_tickets() {
            self.queue_session_ticket()?;
        }
        Ok(())
    }
}
