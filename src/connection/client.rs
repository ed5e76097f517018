use std::net::SocketAddr;
use std::time::Instant;

use arrayvec::ArrayVec;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::{Connection, State, Verification};
use crate::buffer::Buf;
use crate::config::Psk;
use crate::cookie::Cookie;
use crate::crypto::{
    finished_mac, verify_signature, CipherSuite, HashAlgorithm, KeyExchange, KeySchedule,
    NamedGroup, ECDSA_SECP256R1_SHA256,
};
use crate::handler::CertificateVerdict;
use crate::keys::HANDSHAKE_EPOCH;
use crate::message::{
    decode, Certificate, CertificateVerify, ClientHello, EncryptedExtensions, MessageType,
    OfferedPsk, ServerHello, MAX_CHAIN_LEN, DTLS1_3,
};
use crate::rng::fill_secure;
use crate::{Error, Role};

// Flight numbers as in RFC 9147 §5.6.
const FLIGHT_CLIENT_HELLO1: u8 = 1;
const FLIGHT_CLIENT_HELLO2: u8 = 3;
const FLIGHT_CLIENT_FINISHED: u8 = 5;

impl Connection {
    /// Start a handshake with `peer`. ClientHello goes out with the next
    /// [`Connection::poll_datagram`].
    pub fn connect(&mut self, peer: SocketAddr, now: Instant) -> Result<(), Error> {
        if self.config.role() != Role::Client {
            return Err(Error::ConfigError("connect on a server config".into()));
        }
        self.begin(peer, now)?;
        info!("Connecting to {}", peer);

        let ctx = self.handshake.as_mut().expect("context after begin");
        fill_secure(&mut ctx.random);
        self.set_state(State::ClientSentHello1);

        let result = self.send_client_hello(FLIGHT_CLIENT_HELLO1);
        self.settle(result)
    }

    /// PSK hash is SHA-256, the RFC 8446 default for external PSKs. The
    /// binder is derived with the first configured suite using it.
    fn psk_suite(&self) -> Option<CipherSuite> {
        self.config
            .cipher_suites()
            .iter()
            .copied()
            .find(|s| s.hash_algorithm() == HashAlgorithm::Sha256)
    }

    fn send_client_hello(&mut self, flight: u8) -> Result<(), Error> {
        let psk_suite = self.psk_suite();
        let msg_seq = self.next_message_seq()?;
        let config = self.config.clone();
        let ctx = self.handshake.as_mut().expect("handshake context");

        let key_exchange = KeyExchange::new(ctx.group)?;
        let cookie: Option<Cookie> = ctx.cookie.clone();
        let mut body = ctx.send.buffer();

        let mut hello = ClientHello::new(ctx.random);
        hello.cipher_suites = config.cipher_suites().iter().copied().take(3).collect();
        hello.groups = NamedGroup::SUPPORTED.iter().copied().collect();
        hello.signature_schemes.push(ECDSA_SECP256R1_SHA256);
        hello
            .key_shares
            .push((key_exchange.group(), key_exchange.public_key()));
        hello.cookie = cookie.as_deref();
        hello.alpn = config
            .alpn_protocols()
            .iter()
            .take(16)
            .map(|p| p.as_slice())
            .collect();

        // Incompatible with a negotiated SHA-384 suite after a retry, in
        // which case the PSK is left out of ClientHello2.
        let compatible = |s: CipherSuite| {
            ctx.suite
                .map(|n| n.hash_algorithm() == s.hash_algorithm())
                .unwrap_or(true)
        };
        let zero_binder = [0u8; 32];
        let offer = match (config.psk(), psk_suite) {
            (Some(Psk::Client { identity, key }), Some(suite)) if compatible(suite) => {
                hello.psk_dhe_ke = true;
                hello.psk = Some(OfferedPsk {
                    identity,
                    obfuscated_ticket_age: 0,
                    binder: &zero_binder,
                    binders_offset: 0,
                });
                Some((suite, key.as_slice()))
            }
            _ => None,
        };

        let binders_at = hello.write(&mut body);
        drop(hello);

        if let (Some((suite, key)), Some(at)) = (offer, binders_at) {
            let binder_key = KeySchedule::new(suite, Some(key))?.binder_key()?;
            let partial = ctx.transcript.hash_with_partial(
                suite,
                MessageType::ClientHello,
                body.len(),
                &body[..at],
            );
            let binder = finished_mac(suite.hash_algorithm(), &binder_key, &partial)?;
            // binders<2> binder<1>
            body[at + 3..at + 3 + binder.len()].copy_from_slice(&binder);
            ctx.psk_key = Some(Zeroizing::new(key.to_vec()));
        } else {
            ctx.psk_key = None;
        }

        ctx.transcript.add_message(MessageType::ClientHello, &body);
        ctx.key_exchange = Some(key_exchange);

        ctx.send.begin_flight(flight);
        ctx.send.push(MessageType::ClientHello, msg_seq, 0, body);
        ctx.send.rewind();
        self.arm_retransmit();
        Ok(())
    }

    pub(super) fn client_on_server_hello(&mut self, body: &[u8]) -> Result<(), Error> {
        let hello = decode(body, ServerHello::parse, "ServerHello")?;

        let suite = CipherSuite::from_u16(hello.cipher_suite)
            .filter(|s| self.config.cipher_suites().contains(s))
            .ok_or_else(|| {
                Error::IllegalParameter(format!(
                    "Server selected cipher suite {:#06x} we did not offer",
                    hello.cipher_suite
                ))
            })?;
        if hello.selected_version != Some(DTLS1_3) {
            return Err(Error::ProtocolVersion);
        }
        if !hello.session_id_echo.is_empty() {
            return Err(Error::IllegalParameter("session id echo mismatch".into()));
        }

        if hello.is_retry() {
            return self.client_on_hello_retry(&hello, body, suite);
        }

        let ctx = self.handshake.as_mut().expect("handshake context");
        if ctx.suite.map(|s| s != suite).unwrap_or(false) {
            return Err(Error::IllegalParameter(
                "cipher suite differs from HelloRetryRequest".into(),
            ));
        }
        let (group, share) = hello
            .key_share
            .ok_or(Error::MissingExtension("key_share"))?;
        if group != ctx.group {
            return Err(Error::IllegalParameter(
                "key share for a group we did not offer".into(),
            ));
        }

        ctx.psk_accepted = match hello.selected_psk {
            None => false,
            Some(0) if ctx.psk_key.is_some() => true,
            Some(i) => {
                return Err(Error::IllegalParameter(format!(
                    "Server selected PSK {} we did not offer",
                    i
                )))
            }
        };
        if ctx.psk_accepted && suite.hash_algorithm() != HashAlgorithm::Sha256 {
            return Err(Error::IllegalParameter("PSK with a SHA-384 suite".into()));
        }

        ctx.suite = Some(suite);
        ctx.transcript.set_suite(suite);
        ctx.transcript.add_message(MessageType::ServerHello, body);

        let key_exchange = ctx.key_exchange.take().expect("key share sent");
        let shared = key_exchange.complete(share)?;
        let psk = if ctx.psk_accepted {
            ctx.psk_key.as_deref().map(|k| k.as_slice())
        } else {
            None
        };
        let mut schedule = KeySchedule::new(suite, psk)?;
        let (client, server) = schedule.handshake_secrets(&shared, &ctx.transcript.hash())?;
        ctx.schedule = Some(schedule);

        self.keys.install_recv_handshake(suite, &server)?;
        self.keys.install_send_handshake(suite, &client)?;

        debug!(
            "ServerHello: {} {:?} psk: {}",
            suite, group, ctx.psk_accepted
        );
        ctx.client_secret = Some(client);
        ctx.server_secret = Some(server);

        // The ServerHello acknowledges the ClientHello.
        ctx.send.clear();
        self.disarm_if_idle();
        self.set_state(State::ClientExpectEncryptedExtensions);
        Ok(())
    }

    fn client_on_hello_retry(
        &mut self,
        hello: &ServerHello<'_>,
        body: &[u8],
        suite: CipherSuite,
    ) -> Result<(), Error> {
        if !self.state.awaits_first_reply() {
            return Err(Error::UnexpectedMessage("second HelloRetryRequest".into()));
        }
        debug!("Received HelloRetryRequest");

        let ctx = self.handshake.as_mut().expect("handshake context");
        if hello.cookie.is_none() && hello.selected_group.is_none() {
            return Err(Error::IllegalParameter(
                "HelloRetryRequest would not change the ClientHello".into(),
            ));
        }
        if let Some(group) = hello.selected_group {
            if !group.is_supported() || group == ctx.group {
                return Err(Error::IllegalParameter(format!(
                    "HelloRetryRequest selected group {:?}",
                    group
                )));
            }
            ctx.group = group;
        }
        ctx.cookie = match hello.cookie {
            Some(c) => Some(
                Cookie::try_from(c)
                    .map_err(|_| Error::HandshakeFailure("cookie too long".into()))?,
            ),
            None => None,
        };

        ctx.suite = Some(suite);
        ctx.transcript.replace_with_message_hash(suite);
        ctx.transcript.add_message(MessageType::ServerHello, body);

        self.send_client_hello(FLIGHT_CLIENT_HELLO2)?;
        self.set_state(State::ClientExpectServerHello);
        Ok(())
    }

    pub(super) fn client_on_encrypted_extensions(&mut self, body: &[u8]) -> Result<(), Error> {
        let extensions = decode(body, EncryptedExtensions::parse, "EncryptedExtensions")?;
        let config = self.config.clone();
        let ctx = self.handshake.as_mut().expect("handshake context");

        if let Some(protocol) = extensions.alpn {
            if !config.alpn_protocols().iter().any(|p| p == protocol) {
                return Err(Error::IllegalParameter(
                    "server selected an ALPN protocol we did not offer".into(),
                ));
            }
            ctx.alpn = Some(protocol.to_vec());
        }
        ctx.transcript
            .add_message(MessageType::EncryptedExtensions, body);

        let next = if ctx.psk_accepted {
            State::ClientExpectFinished
        } else {
            State::ClientExpectCertificate
        };
        self.set_state(next);
        Ok(())
    }

    pub(super) fn client_on_certificate(&mut self, body: &[u8]) -> Result<(), Error> {
        let certificate = decode(body, Certificate::parse, "Certificate")?;
        if !certificate.context.is_empty() {
            return Err(Error::IllegalParameter(
                "non-empty certificate request context".into(),
            ));
        }
        if certificate.chain.is_empty() {
            return Err(Error::BadCertificate("empty certificate chain".into()));
        }
        let ctx = self.handshake.as_mut().expect("handshake context");
        for (i, der) in certificate.chain.iter().enumerate() {
            trace!("Certificate #{} size: {} bytes", i + 1, der.len());
        }
        ctx.peer_chain = certificate.chain.iter().map(|c| c.to_vec()).collect();
        ctx.transcript.add_message(MessageType::Certificate, body);
        self.set_state(State::ClientExpectCertificateVerify);
        Ok(())
    }

    pub(super) fn client_on_certificate_verify(&mut self, body: &[u8]) -> Result<(), Error> {
        let verify = decode(body, CertificateVerify::parse, "CertificateVerify")?;
        let ctx = self.handshake.as_mut().expect("handshake context");

        let mut content = Buf::new();
        CertificateVerify::signed_content(true, &ctx.transcript.hash(), &mut content);
        let leaf = ctx.peer_chain.first().expect("chain checked non-empty");
        verify_signature(leaf, verify.scheme, &content, verify.signature)?;
        trace!("Server CertificateVerify verified: {:#06x}", verify.scheme);
        ctx.transcript
            .add_message(MessageType::CertificateVerify, body);

        let verdict = {
            let chain: ArrayVec<&[u8], MAX_CHAIN_LEN> =
                ctx.peer_chain.iter().map(|c| c.as_slice()).collect();
            self.handler.verify_peer_certificate(&chain)
        };
        ctx.verification = match verdict {
            CertificateVerdict::Accept => Verification::Done,
            CertificateVerdict::Reject => {
                return Err(Error::BadCertificate("rejected by application".into()))
            }
            CertificateVerdict::Defer => {
                debug!("Certificate verification deferred");
                Verification::Pending
            }
        };
        self.set_state(State::ClientExpectFinished);
        Ok(())
    }

    pub(super) fn client_on_finished(&mut self, body: &[u8]) -> Result<(), Error> {
        let ctx = self.handshake.as_mut().expect("handshake context");
        let hash = ctx.suite().hash_algorithm();

        let server_secret = ctx.server_secret.as_ref().expect("handshake secrets");
        let expected = finished_mac(hash, server_secret, &ctx.transcript.hash())?;
        if !bool::from(body.ct_eq(&expected)) {
            return Err(Error::SecurityError("server Finished mismatch".into()));
        }
        trace!("Server Finished verified");
        ctx.transcript.add_message(MessageType::Finished, body);

        let msg_seq = self.next_message_seq()?;
        let ctx = self.handshake.as_mut().expect("handshake context");

        let transcript_hash = ctx.transcript.hash();
        let (client_app, server_app) = ctx.schedule().application_secrets(&transcript_hash)?;

        let client_secret = ctx.client_secret.as_ref().expect("handshake secrets");
        let verify_data = finished_mac(hash, client_secret, &ctx.transcript.hash())?;
        ctx.transcript.add_message(MessageType::Finished, &verify_data);

        let mut finished = ctx.send.buffer();
        finished.extend_from_slice(&verify_data);
        ctx.send.begin_flight(FLIGHT_CLIENT_FINISHED);
        ctx.send
            .push(MessageType::Finished, msg_seq, HANDSHAKE_EPOCH, finished);
        ctx.send.rewind();
        ctx.schedule = None;

        self.keys.stage_recv_application(server_app)?;
        self.keys.install_send_application(client_app)?;
        self.arm_retransmit();

        debug!("Handshake complete; ready for application data");
        self.handshake_complete();
        Ok(())
    }
}
