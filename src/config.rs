use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::certificate::DtlsCertificate;
use crate::crypto::{CipherSuite, SigningKey};
use crate::Error;

/// Which end of the handshake a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Looks up the key for a PSK identity offered by a client.
pub type PskResolver = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// External pre-shared key (psk_dhe_ke).
#[derive(Clone)]
pub enum Psk {
    /// The single identity a client offers.
    Client { identity: Vec<u8>, key: Vec<u8> },
    /// Server side identity lookup.
    Server { resolver: PskResolver },
}

impl Psk {
    pub fn client(identity: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Psk::Client {
            identity: identity.into(),
            key: key.into(),
        }
    }

    pub fn server<F>(resolver: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        Psk::Server {
            resolver: Arc::new(resolver),
        }
    }
}

impl fmt::Debug for Psk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Psk::Client { identity, .. } => f
                .debug_struct("Psk::Client")
                .field("identity", &String::from_utf8_lossy(identity))
                .finish(),
            Psk::Server { .. } => f.write_str("Psk::Server"),
        }
    }
}

/// Certificate material with its parsed signing key.
#[derive(Clone)]
pub(crate) struct Identity {
    pub certificate: DtlsCertificate,
    pub signing_key: Arc<SigningKey>,
}

/// DTLS configuration
#[derive(Clone)]
pub struct Config {
    role: Role,
    mtu: usize,
    cipher_suites: Vec<CipherSuite>,
    alpn_protocols: Vec<Vec<u8>>,
    psk: Option<Psk>,
    cookie_lifetime: Duration,
    identity: Option<Identity>,
    rng_seed: Option<u64>,
    max_connections: usize,
    max_pending_retries: usize,
    max_reassembly_depth: usize,
    flight_start_rto: Duration,
    flight_retries: usize,
    handshake_timeout: Duration,
    key_update_threshold: f64,
    aead_limit: Option<u64>,
    record_padding: usize,
    sequence_number_encryption: bool,
    session_tickets: bool,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            role: Role::Server,
            mtu: 1150,
            cipher_suites: CipherSuite::ALL.to_vec(),
            alpn_protocols: Vec::new(),
            psk: None,
            cookie_lifetime: Duration::from_secs(60),
            certificate: None,
            rng_seed: None,
            max_connections: 1024,
            max_pending_retries: 64,
            max_reassembly_depth: 8,
            flight_start_rto: Duration::from_secs(1),
            flight_retries: 4,
            handshake_timeout: Duration::from_secs(40),
            key_update_threshold: 0.75,
            aead_limit: None,
            record_padding: 0,
            sequence_number_encryption: true,
            session_tickets: true,
        }
    }

    #[inline(always)]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Max transmission unit.
    ///
    /// The largest size UDP packets we will produce.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Enabled cipher suites in preference order.
    #[inline(always)]
    pub fn cipher_suites(&self) -> &[CipherSuite] {
        &self.cipher_suites
    }

    /// ALPN protocols in preference order. Empty disables ALPN.
    #[inline(always)]
    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    #[inline(always)]
    pub fn psk(&self) -> Option<&Psk> {
        self.psk.as_ref()
    }

    /// How long a stateless retry cookie stays valid.
    #[inline(always)]
    pub fn cookie_lifetime(&self) -> Duration {
        self.cookie_lifetime
    }

    #[inline(always)]
    pub fn certificate(&self) -> Option<&DtlsCertificate> {
        self.identity.as_ref().map(|i| &i.certificate)
    }

    #[inline(always)]
    pub(crate) fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Seed for non-cryptographic randomness (retransmit jitter).
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }

    /// Size of the connection slab of a [`Transport`][crate::Transport].
    #[inline(always)]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Number of stateless retry datagrams that can be queued at once.
    #[inline(always)]
    pub fn max_pending_retries(&self) -> usize {
        self.max_pending_retries
    }

    /// Handshake messages buffered ahead of the next expected one.
    #[inline(always)]
    pub fn max_reassembly_depth(&self) -> usize {
        self.max_reassembly_depth
    }

    /// Time of first retry.
    ///
    /// Every flight restarts with this value.
    /// Doubled for every retry with a ±0.25s jitter.
    #[inline(always)]
    pub fn flight_start_rto(&self) -> Duration {
        self.flight_start_rto
    }

    /// Max number of retries per flight.
    #[inline(always)]
    pub fn flight_retries(&self) -> usize {
        self.flight_retries
    }

    /// Timeout for the entire handshake, regardless of flights.
    #[inline(always)]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Fraction of the AEAD limit at which a KeyUpdate starts.
    #[inline(always)]
    pub fn key_update_threshold(&self) -> f64 {
        self.key_update_threshold
    }

    /// AEAD operations allowed per epoch for `suite`.
    pub fn aead_limit(&self, suite: CipherSuite) -> u64 {
        self.aead_limit
            .unwrap_or_else(|| suite.protection_limit())
    }

    pub(crate) fn aead_limit_override(&self) -> Option<u64> {
        self.aead_limit
    }

    /// Inner plaintext is zero padded to a multiple of this. 0 disables.
    #[inline(always)]
    pub fn record_padding(&self) -> usize {
        self.record_padding
    }

    #[inline(always)]
    pub fn sequence_number_encryption(&self) -> bool {
        self.sequence_number_encryption
    }

    /// Whether a server issues a NewSessionTicket after the handshake.
    #[inline(always)]
    pub fn session_tickets(&self) -> bool {
        self.session_tickets
    }
}

/// Builder for DTLS configuration.
pub struct ConfigBuilder {
    role: Role,
    mtu: usize,
    cipher_suites: Vec<CipherSuite>,
    alpn_protocols: Vec<Vec<u8>>,
    psk: Option<Psk>,
    cookie_lifetime: Duration,
    certificate: Option<DtlsCertificate>,
    rng_seed: Option<u64>,
    max_connections: usize,
    max_pending_retries: usize,
    max_reassembly_depth: usize,
    flight_start_rto: Duration,
    flight_retries: usize,
    handshake_timeout: Duration,
    key_update_threshold: f64,
    aead_limit: Option<u64>,
    record_padding: usize,
    sequence_number_encryption: bool,
    session_tickets: bool,
}

impl ConfigBuilder {
    /// Defaults to [`Role::Server`].
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Set the max transmission unit (MTU).
    ///
    /// Defaults to 1150.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the enabled cipher suites, in preference order.
    ///
    /// Defaults to all three supported suites.
    pub fn cipher_suites(mut self, suites: &[CipherSuite]) -> Self {
        self.cipher_suites = suites.to_vec();
        self
    }

    /// Set ALPN protocols in preference order.
    pub fn alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn psk(mut self, psk: Psk) -> Self {
        self.psk = Some(psk);
        self
    }

    /// Defaults to 60 seconds.
    pub fn cookie_lifetime(mut self, lifetime: Duration) -> Self {
        self.cookie_lifetime = lifetime;
        self
    }

    /// Certificate a server authenticates with.
    pub fn certificate(mut self, certificate: DtlsCertificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Defaults to 1024.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Defaults to 64.
    pub fn max_pending_retries(mut self, max: usize) -> Self {
        self.max_pending_retries = max;
        self
    }

    /// Defaults to 8.
    pub fn max_reassembly_depth(mut self, depth: usize) -> Self {
        self.max_reassembly_depth = depth;
        self
    }

    /// Set the time of first retry.
    ///
    /// Defaults to 1 second.
    pub fn flight_start_rto(mut self, rto: Duration) -> Self {
        self.flight_start_rto = rto;
        self
    }

    /// Set the max number of retries per flight.
    ///
    /// Defaults to 4.
    pub fn flight_retries(mut self, retries: usize) -> Self {
        self.flight_retries = retries;
        self
    }

    /// Set the timeout for the entire handshake, regardless of flights.
    ///
    /// Defaults to 40 seconds.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Defaults to 0.75.
    pub fn key_update_threshold(mut self, fraction: f64) -> Self {
        self.key_update_threshold = fraction;
        self
    }

    /// Override the per-suite AEAD protection limit.
    pub fn aead_limit(mut self, limit: u64) -> Self {
        self.aead_limit = Some(limit);
        self
    }

    /// Defaults to 0 (no padding).
    pub fn record_padding(mut self, alignment: usize) -> Self {
        self.record_padding = alignment;
        self
    }

    /// Defaults to true.
    pub fn sequence_number_encryption(mut self, enabled: bool) -> Self {
        self.sequence_number_encryption = enabled;
        self
    }

    /// Defaults to true.
    pub fn session_tickets(mut self, enabled: bool) -> Self {
        self.session_tickets = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::ConfigError` if a value is out of range or the
    /// certificate private key can't be parsed.
    pub fn build(self) -> Result<Config, Error> {
        let invalid = |msg: &str| Err(Error::ConfigError(msg.to_string()));

        if self.mtu < 256 || self.mtu > 65_507 {
            return invalid("mtu must be within 256..=65507");
        }
        if self.cipher_suites.is_empty() {
            return invalid("at least one cipher suite is required");
        }
        for (i, s) in self.cipher_suites.iter().enumerate() {
            if self.cipher_suites[..i].contains(s) {
                return invalid("duplicate cipher suite");
            }
        }
        if self
            .alpn_protocols
            .iter()
            .any(|p| p.is_empty() || p.len() > 255)
        {
            return invalid("alpn protocol names must be 1..=255 bytes");
        }
        if !(self.key_update_threshold > 0.0 && self.key_update_threshold <= 1.0) {
            return invalid("key_update_threshold must be within (0, 1]");
        }
        if self.aead_limit == Some(0) {
            return invalid("aead_limit must be positive");
        }
        if self.max_reassembly_depth == 0 || self.max_reassembly_depth > 64 {
            return invalid("max_reassembly_depth must be within 1..=64");
        }
        if self.max_connections == 0 {
            return invalid("max_connections must be positive");
        }
        if self.record_padding > 256 {
            return invalid("record_padding must be at most 256");
        }
        match (&self.psk, self.role) {
            (Some(Psk::Client { .. }), Role::Server) => {
                return invalid("server needs a Psk::Server resolver")
            }
            (Some(Psk::Server { .. }), Role::Client) => {
                return invalid("client needs a Psk::Client identity")
            }
            (Some(Psk::Client { identity, key }), _) if identity.is_empty() || key.is_empty() => {
                return invalid("psk identity and key must not be empty")
            }
            _ => {}
        }

        let identity = match self.certificate {
            Some(certificate) => {
                let signing_key = SigningKey::from_pkcs8_der(&certificate.private_key)?;
                Some(Identity {
                    certificate,
                    signing_key: Arc::new(signing_key),
                })
            }
            None => None,
        };

        Ok(Config {
            role: self.role,
            mtu: self.mtu,
            cipher_suites: self.cipher_suites,
            alpn_protocols: self.alpn_protocols,
            psk: self.psk,
            cookie_lifetime: self.cookie_lifetime,
            identity,
            rng_seed: self.rng_seed,
            max_connections: self.max_connections,
            max_pending_retries: self.max_pending_retries,
            max_reassembly_depth: self.max_reassembly_depth,
            flight_start_rto: self.flight_start_rto,
            flight_retries: self.flight_retries,
            handshake_timeout: self.handshake_timeout,
            key_update_threshold: self.key_update_threshold,
            aead_limit: self.aead_limit,
            record_padding: self.record_padding,
            sequence_number_encryption: self.sequence_number_encryption,
            session_tickets: self.session_tickets,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder()
            .build()
            .expect("Default config should always validate")
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("role", &self.role)
            .field("mtu", &self.mtu)
            .field("cipher_suites", &self.cipher_suites)
            .field("alpn_protocols", &self.alpn_protocols.len())
            .field("psk", &self.psk)
            .field("certificate", &self.identity.is_some())
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}
