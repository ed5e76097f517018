//! Per-connection epoch and key state.
//!
//! Send side: a plaintext counter for epoch 0, the handshake keys (epoch 2)
//! and the application keys (epoch 3 and up). Handshake messages keep
//! going out in the epoch they were first sent in, so both key sets can be
//! live at the same time.
//!
//! Receive side: up to three epochs. `current` is what the peer is
//! believed to send with. `next` is staged (or derived on demand) and only
//! becomes current once a record decrypts with it. `previous` keeps
//! accepting stragglers until the following promotion.

use std::ops::Range;

use crate::crypto::{next_traffic_secret, CipherSuite, Secret, SymmetricKeys};
use crate::record::{self, ContentType, HeaderKind, RecordHeader, RecordNumber, MAX_SEQ};
use crate::buffer::Buf;
use crate::window::ReplayWindow;
use crate::{Config, Error};

pub(crate) const HANDSHAKE_EPOCH: u16 = 2;
pub(crate) const APPLICATION_EPOCH: u16 = 3;

struct SendEpoch {
    epoch: u16,
    keys: SymmetricKeys,
    /// Traffic secret, kept for application epochs to derive the next one.
    secret: Option<Secret>,
    seq: u64,
    usage: u64,
}

struct RecvEpoch {
    epoch: u16,
    keys: SymmetricKeys,
    secret: Option<Secret>,
    window: ReplayWindow,
    usage: u64,
}

/// A record that decrypted and passed the replay check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Opened {
    pub number: RecordNumber,
    pub content_type: ContentType,
    /// Content within the datagram buffer.
    pub content: Range<usize>,
    /// Whether this record moved the receive epoch forward.
    pub promoted: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Previous,
    Current,
    Next,
}

pub(crate) struct Keys {
    suite: Option<CipherSuite>,
    padding: usize,
    mask_sequence: bool,
    limit_override: Option<u64>,
    soft_fraction: f64,

    plaintext_seq: u64,
    plaintext_window: ReplayWindow,

    send_handshake: Option<SendEpoch>,
    send_application: Option<SendEpoch>,

    previous: Option<RecvEpoch>,
    current: Option<RecvEpoch>,
    next: Option<RecvEpoch>,
}

impl Keys {
    pub fn new(
        padding: usize,
        mask_sequence: bool,
        limit_override: Option<u64>,
        soft_fraction: f64,
    ) -> Self {
        Keys {
            suite: None,
            padding,
            mask_sequence,
            limit_override,
            soft_fraction,
            plaintext_seq: 0,
            plaintext_window: ReplayWindow::new(),
            send_handshake: None,
            send_application: None,
            previous: None,
            current: None,
            next: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Keys::new(
            config.record_padding(),
            config.sequence_number_encryption(),
            config.aead_limit_override(),
            config.key_update_threshold(),
        )
    }

    pub fn suite(&self) -> Option<CipherSuite> {
        self.suite
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    fn limit(&self) -> u64 {
        let suite = self.suite.expect("suite set before keys are installed");
        self.limit_override
            .unwrap_or_else(|| suite.protection_limit())
    }

    fn soft_limit(&self) -> u64 {
        (self.limit() as f64 * self.soft_fraction) as u64
    }

    /// Epoch new non-handshake records go out in.
    pub fn send_epoch(&self) -> u16 {
        if let Some(s) = &self.send_application {
            s.epoch
        } else if self.send_handshake.is_some() {
            HANDSHAKE_EPOCH
        } else {
            0
        }
    }

    /// Epoch the peer is currently believed to send with.
    pub fn recv_epoch(&self) -> u16 {
        self.current.as_ref().map(|c| c.epoch).unwrap_or(0)
    }

    pub fn has_send_epoch(&self, epoch: u16) -> bool {
        epoch == 0
            || (epoch == HANDSHAKE_EPOCH && self.send_handshake.is_some())
            || self.send_application.as_ref().map(|s| s.epoch) == Some(epoch)
    }

    // ---- installation -------------------------------------------------

    pub fn install_send_handshake(
        &mut self,
        suite: CipherSuite,
        secret: &Secret,
    ) -> Result<(), Error> {
        self.suite = Some(suite);
        let keys = suite.reset_symmetric_keys(None, secret)?;
        self.send_handshake = Some(SendEpoch {
            epoch: HANDSHAKE_EPOCH,
            keys,
            secret: None,
            seq: 0,
            usage: 0,
        });
        debug!("Send epoch {} installed", HANDSHAKE_EPOCH);
        Ok(())
    }

    pub fn install_recv_handshake(
        &mut self,
        suite: CipherSuite,
        secret: &Secret,
    ) -> Result<(), Error> {
        self.suite = Some(suite);
        let keys = suite.reset_symmetric_keys(None, secret)?;
        self.current = Some(RecvEpoch {
            epoch: HANDSHAKE_EPOCH,
            keys,
            secret: None,
            window: ReplayWindow::new(),
            usage: 0,
        });
        debug!("Recv epoch {} installed", HANDSHAKE_EPOCH);
        Ok(())
    }

    pub fn install_send_application(&mut self, secret: Secret) -> Result<(), Error> {
        let suite = self.suite.expect("handshake keys before application keys");
        let keys = suite.reset_symmetric_keys(None, &secret)?;
        self.send_application = Some(SendEpoch {
            epoch: APPLICATION_EPOCH,
            keys,
            secret: Some(secret),
            seq: 0,
            usage: 0,
        });
        debug!("Send epoch {} installed", APPLICATION_EPOCH);
        Ok(())
    }

    /// Stage the first application epoch. It becomes current on the first
    /// record that decrypts with it.
    pub fn stage_recv_application(&mut self, secret: Secret) -> Result<(), Error> {
        let suite = self.suite.expect("handshake keys before application keys");
        let keys = suite.reset_symmetric_keys(None, &secret)?;
        self.next = Some(RecvEpoch {
            epoch: APPLICATION_EPOCH,
            keys,
            secret: Some(secret),
            window: ReplayWindow::new(),
            usage: 0,
        });
        debug!("Recv epoch {} staged", APPLICATION_EPOCH);
        Ok(())
    }

    /// Derive the receive keys for current+1 unless already there.
    ///
    /// Only application epochs have a successor.
    pub fn stage_recv_next(&mut self) -> Result<(), Error> {
        if self.next.is_some() {
            return Ok(());
        }
        let Some(current) = &self.current else {
            return Ok(());
        };
        let Some(secret) = &current.secret else {
            return Ok(());
        };
        let suite = current.keys.suite();
        let epoch = current
            .epoch
            .checked_add(1)
            .ok_or(Error::EpochOverflow)?;

        let secret = next_traffic_secret(suite.hash_algorithm(), secret)?;
        let keys = suite.reset_symmetric_keys(None, &secret)?;
        self.next = Some(RecvEpoch {
            epoch,
            keys,
            secret: Some(secret),
            window: ReplayWindow::new(),
            usage: 0,
        });
        debug!("Recv epoch {} staged", epoch);
        Ok(())
    }

    /// Move the send side to the next application epoch.
    ///
    /// Called once the peer acknowledged our KeyUpdate.
    pub fn roll_send_epoch(&mut self) -> Result<u16, Error> {
        let send = self
            .send_application
            .take()
            .expect("KeyUpdate without application keys");
        let SendEpoch {
            epoch, keys, secret, ..
        } = send;
        let epoch = epoch.checked_add(1).ok_or(Error::EpochOverflow)?;
        let suite = keys.suite();
        let old_secret = secret.expect("application epoch keeps its secret");
        let secret = next_traffic_secret(suite.hash_algorithm(), &old_secret)?;
        let keys = suite.reset_symmetric_keys(Some(keys), &secret)?;

        self.send_application = Some(SendEpoch {
            epoch,
            keys,
            secret: Some(secret),
            seq: 0,
            usage: 0,
        });
        debug!("Send epoch rolled to {}", epoch);
        Ok(epoch)
    }

    /// Handshake keys are no longer needed once the handshake is confirmed.
    pub fn drop_handshake_keys(&mut self) {
        self.send_handshake = None;
        if self.previous.as_ref().map(|p| p.epoch) == Some(HANDSHAKE_EPOCH) {
            self.previous = None;
        }
    }

    /// The server stops sending in epoch 2 once the client Finished is in,
    /// but keeps the receive side to re-ack a retransmitted Finished.
    pub fn drop_send_handshake_keys(&mut self) {
        self.send_handshake = None;
    }

    // ---- sending ------------------------------------------------------

    /// Sequence numbers for plaintext records start here.
    pub fn set_plaintext_seq(&mut self, seq: u64) {
        self.plaintext_seq = self.plaintext_seq.max(seq);
    }

    /// Append a plaintext (epoch 0) record.
    pub fn write_plaintext(
        &mut self,
        out: &mut Buf,
        content_type: ContentType,
        fragment: &[u8],
    ) -> Result<RecordNumber, Error> {
        let seq = self.plaintext_seq;
        if seq > MAX_SEQ {
            return Err(Error::SequenceOverflow);
        }
        self.plaintext_seq += 1;
        record::write_plaintext(out, content_type, seq, fragment);
        Ok(RecordNumber::new(0, seq))
    }

    /// Append a protected record in `epoch`.
    pub fn seal(
        &mut self,
        out: &mut Buf,
        epoch: u16,
        content_type: ContentType,
        content: &[u8],
    ) -> Result<RecordNumber, Error> {
        let limit = self.limit();
        let padding = self.padding;
        let mask = self.mask_sequence;

        let send = if epoch == HANDSHAKE_EPOCH {
            self.send_handshake.as_mut()
        } else {
            self.send_application.as_mut().filter(|a| a.epoch == epoch)
        };
        let Some(send) = send else {
            panic!("no send keys for epoch {}", epoch);
        };

        if send.seq > MAX_SEQ {
            return Err(Error::SequenceOverflow);
        }
        if send.usage >= limit {
            return Err(Error::AeadLimitReached);
        }

        let seq = send.seq;
        record::seal(out, &send.keys, epoch, seq, content_type, content, padding, mask)?;
        send.seq += 1;
        send.usage += 1;

        Ok(RecordNumber::new(epoch, seq))
    }

    /// Whether our own sending is past the soft AEAD limit.
    pub fn send_needs_update(&self) -> bool {
        self.send_application
            .as_ref()
            .map(|s| s.usage >= self.soft_limit())
            .unwrap_or(false)
    }

    /// Whether the peer's current epoch is past the soft AEAD limit.
    pub fn recv_needs_update(&self) -> bool {
        match &self.current {
            Some(c) if c.epoch >= APPLICATION_EPOCH => c.usage >= self.soft_limit(),
            _ => false,
        }
    }

    /// Keys for the peer's next epoch are derived, so it announced a
    /// KeyUpdate.
    pub fn recv_update_pending(&self) -> bool {
        self.current
            .as_ref()
            .map(|c| c.epoch >= APPLICATION_EPOCH && self.next.is_some())
            .unwrap_or(false)
    }

    // ---- receiving ----------------------------------------------------

    /// Replay check for a plaintext record. Marks it as seen.
    pub fn accept_plaintext(&mut self, seq: u64) -> Result<RecordNumber, Error> {
        if !self.plaintext_window.check(seq) {
            return Err(Error::Replay(seq));
        }
        self.plaintext_window.mark(seq);
        Ok(RecordNumber::new(0, seq))
    }

    fn slot_for(&mut self, epoch_bits: u8) -> Result<Option<Slot>, Error> {
        let matches = |e: &Option<RecvEpoch>| {
            e.as_ref()
                .map(|e| (e.epoch & 0b11) as u8 == epoch_bits)
                .unwrap_or(false)
        };
        if matches(&self.current) {
            return Ok(Some(Slot::Current));
        }
        if self.next.is_none() {
            let derivable = self
                .current
                .as_ref()
                .map(|c| c.secret.is_some() && (c.epoch.wrapping_add(1) & 0b11) as u8 == epoch_bits)
                .unwrap_or(false);
            if derivable {
                self.stage_recv_next()?;
            }
        }
        if matches(&self.next) {
            return Ok(Some(Slot::Next));
        }
        if matches(&self.previous) {
            return Ok(Some(Slot::Previous));
        }
        Ok(None)
    }

    /// Unmask, replay check and decrypt a protected record in place.
    pub fn open(&mut self, datagram: &mut [u8], rec: &RecordHeader) -> Result<Opened, Error> {
        let HeaderKind::Ciphertext {
            epoch_bits,
            seq_bits,
        } = rec.kind
        else {
            panic!("open called on a plaintext record");
        };

        let Some(slot) = self.slot_for(epoch_bits)? else {
            return Err(Error::UnknownEpoch(epoch_bits));
        };
        let limit = self.limit();
        let mask = self.mask_sequence;

        let recv = match slot {
            Slot::Previous => self.previous.as_mut(),
            Slot::Current => self.current.as_mut(),
            Slot::Next => self.next.as_mut(),
        }
        .expect("slot exists");

        let wire =
            record::unmask_sequence(datagram, &rec.header, &rec.body, seq_bits, &recv.keys, mask)?;
        let seq = RecordNumber::reconstruct(recv.window.expected_next(), wire, seq_bits);

        if !recv.window.check(seq) {
            return Err(Error::Replay(seq));
        }

        if recv.usage >= limit {
            return Err(Error::AeadLimitReached);
        }
        recv.usage += 1;

        let (content_type, content) = record::open(datagram, &rec.header, &rec.body, seq, &recv.keys)?;
        recv.window.mark(seq);
        let number = RecordNumber::new(recv.epoch, seq);

        let promoted = slot == Slot::Next;
        if promoted {
            self.previous = self.current.take();
            self.current = self.next.take();
            debug!("Recv epoch promoted to {}", number.epoch());
        }

        Ok(Opened {
            number,
            content_type,
            content,
            promoted,
        })
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let epoch = |e: &Option<RecvEpoch>| e.as_ref().map(|e| e.epoch);
        f.debug_struct("Keys")
            .field("suite", &self.suite)
            .field("send_epoch", &self.send_epoch())
            .field("recv_previous", &epoch(&self.previous))
            .field("recv_current", &epoch(&self.current))
            .field("recv_next", &epoch(&self.next))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITE: CipherSuite = CipherSuite::Aes128GcmSha256;

    fn secret(fill: u8) -> Secret {
        Secret::from_slice(&[fill; 32])
    }

    /// A sender/receiver pair sharing handshake and application secrets.
    fn pair(limit: Option<u64>) -> (Keys, Keys) {
        let mut a = Keys::new(0, true, limit, 0.75);
        let mut b = Keys::new(0, true, limit, 0.75);
        a.install_send_handshake(SUITE, &secret(1)).unwrap();
        b.install_recv_handshake(SUITE, &secret(1)).unwrap();
        a.install_send_application(secret(2)).unwrap();
        b.stage_recv_application(secret(2)).unwrap();
        (a, b)
    }

    fn send(a: &mut Keys, epoch: u16, data: &[u8]) -> Vec<u8> {
        let mut out = Buf::new();
        a.seal(&mut out, epoch, ContentType::ApplicationData, data).unwrap();
        out.into_vec()
    }

    fn recv(b: &mut Keys, mut datagram: Vec<u8>) -> Result<(Opened, Vec<u8>), Error> {
        let (_, rec) = RecordHeader::parse(&datagram, 0).unwrap();
        let opened = b.open(&mut datagram, &rec)?;
        let content = datagram[opened.content.clone()].to_vec();
        Ok((opened, content))
    }

    #[test]
    fn handshake_then_application_epoch() {
        let (mut a, mut b) = pair(None);
        let (o, data) = recv(&mut b, send(&mut a, 2, b"hs")).unwrap();
        assert_eq!(o.number, RecordNumber::new(2, 0));
        assert_eq!(data, b"hs");
        assert_eq!(b.recv_epoch(), 2);

        let (o, data) = recv(&mut b, send(&mut a, 3, b"app")).unwrap();
        assert!(o.promoted);
        assert_eq!(data, b"app");
        assert_eq!(b.recv_epoch(), 3);

        // late epoch 2 record still accepted through the previous slot
        let (o, _) = recv(&mut b, send(&mut a, 2, b"late")).unwrap();
        assert_eq!(o.number, RecordNumber::new(2, 1));
    }

    #[test]
    fn replay_rejected_after_success_only() {
        let (mut a, mut b) = pair(None);
        let rec = send(&mut a, 2, b"x");
        recv(&mut b, rec.clone()).unwrap();
        assert!(matches!(recv(&mut b, rec), Err(Error::Replay(0))));
    }

    #[test]
    fn forged_record_does_not_poison_window() {
        let (mut a, mut b) = pair(None);
        let good = send(&mut a, 2, b"x");
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        assert!(matches!(recv(&mut b, bad), Err(Error::BadRecordMac)));
        recv(&mut b, good).unwrap();
    }

    #[test]
    fn key_update_rolls_both_sides() {
        let (mut a, mut b) = pair(None);
        recv(&mut b, send(&mut a, 3, b"one")).unwrap();

        // Record under the old epoch sent before the roll, delivered after.
        let old = send(&mut a, 3, b"old");
        assert_eq!(a.roll_send_epoch().unwrap(), 4);
        let new = send(&mut a, 4, b"new");

        // Next epoch derived on demand.
        let (o, data) = recv(&mut b, new).unwrap();
        assert!(o.promoted);
        assert_eq!(o.number, RecordNumber::new(4, 0));
        assert_eq!(data, b"new");

        let (o, data) = recv(&mut b, old).unwrap();
        assert_eq!(o.number.epoch(), 3);
        assert_eq!(data, b"old");
    }

    #[test]
    fn staged_next_without_traffic() {
        let (mut a, mut b) = pair(None);
        recv(&mut b, send(&mut a, 3, b"one")).unwrap();
        b.stage_recv_next().unwrap();
        a.roll_send_epoch().unwrap();
        assert_eq!(b.recv_epoch(), 3);
        let (o, _) = recv(&mut b, send(&mut a, 4, b"two")).unwrap();
        assert!(o.promoted);
        assert_eq!(b.recv_epoch(), 4);
    }

    #[test]
    fn unknown_epoch_dropped() {
        let (mut a, mut b) = pair(None);
        a.roll_send_epoch().unwrap();
        a.roll_send_epoch().unwrap();
        // epoch 5 while receiver is at 2 with 3 staged
        assert!(matches!(
            recv(&mut b, send(&mut a, 5, b"x")),
            Err(Error::UnknownEpoch(1))
        ));
    }

    #[test]
    fn usage_limits() {
        let (mut a, mut b) = pair(Some(4));
        for _ in 0..2 {
            recv(&mut b, send(&mut a, 3, b"x")).unwrap();
        }
        assert!(!a.send_needs_update());
        recv(&mut b, send(&mut a, 3, b"x")).unwrap();
        // 3 of 4 is the 0.75 soft limit
        assert!(a.send_needs_update());
        assert!(b.recv_needs_update());

        recv(&mut b, send(&mut a, 3, b"x")).unwrap();
        let mut out = Buf::new();
        assert!(matches!(
            a.seal(&mut out, 3, ContentType::ApplicationData, b"x"),
            Err(Error::AeadLimitReached)
        ));
    }

    #[test]
    fn failed_opens_count_towards_limit() {
        let (mut a, mut b) = pair(Some(2));
        let rec = send(&mut a, 2, b"x");
        for _ in 0..2 {
            let mut bad = rec.clone();
            let last = bad.len() - 1;
            bad[last] ^= 1;
            assert!(matches!(recv(&mut b, bad), Err(Error::BadRecordMac)));
        }
        assert!(matches!(recv(&mut b, rec), Err(Error::AeadLimitReached)));
    }

    #[test]
    fn plaintext_replay() {
        let mut k = Keys::new(0, true, None, 0.75);
        k.accept_plaintext(3).unwrap();
        assert!(matches!(k.accept_plaintext(3), Err(Error::Replay(3))));

        let mut out = Buf::new();
        k.set_plaintext_seq(10);
        let rn = k
            .write_plaintext(&mut out, ContentType::Handshake, b"hello")
            .unwrap();
        assert_eq!(rn, RecordNumber::new(0, 10));
    }
}
