use std::time::Duration;

use tracing::warn;

use crate::assembler::{DEFAULT_MAX_SEGMENT_BYTES, MIN_SEGMENT_BYTES};
use crate::error::{RtcError, RtcResult};
use crate::peer::{ChannelParams, IceServer, PeerConfig};

pub const DEFAULT_PROCEDURE_OFFER: &str = "rtc.signal.offer";
pub const DEFAULT_TOPIC_ANSWERER_ON_CANDIDATE: &str = "rtc.signal.answerer.on_candidate";
pub const DEFAULT_TOPIC_OFFERER_ON_CANDIDATE: &str = "rtc.signal.offerer.on_candidate";

pub const DEFAULT_TRICKLE_WINDOW: Duration = Duration::from_millis(100);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_PARTIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const ANSWERER_CANDIDATE_POOL: u8 = 10;

const ENV_TRICKLE_WINDOW_MS: &str = "RTC_SIGNAL_TRICKLE_WINDOW_MS";
const ENV_READY_TIMEOUT_MS: &str = "RTC_SIGNAL_READY_TIMEOUT_MS";
const ENV_SESSION_TTL_MS: &str = "RTC_SIGNAL_SESSION_TTL_MS";
const ENV_MAX_SEGMENT_BYTES: &str = "RTC_SIGNAL_MAX_SEGMENT_BYTES";
const ENV_STUN_URLS: &str = "RTC_SIGNAL_STUN_URLS";
const ENV_DISABLE_STUN: &str = "RTC_SIGNAL_DISABLE_STUN";

/// STUN servers from the environment, falling back to a public default.
pub fn default_ice_servers() -> Vec<IceServer> {
    if env_flag(ENV_DISABLE_STUN) {
        return Vec::new();
    }
    match std::env::var(ENV_STUN_URLS) {
        Ok(value) if !value.trim().is_empty() => value
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(IceServer::stun)
            .collect(),
        _ => vec![IceServer::stun(DEFAULT_STUN_URL)],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferConfig {
    pub ice_servers: Vec<IceServer>,
    pub channel: ChannelParams,
    pub topic_answerer_on_candidate: String,
}

impl OfferConfig {
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            ice_servers: self.ice_servers.clone(),
            candidate_pool_size: 0,
        }
    }
}

impl Default for OfferConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            channel: ChannelParams::default(),
            topic_answerer_on_candidate: DEFAULT_TOPIC_ANSWERER_ON_CANDIDATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerConfig {
    pub ice_servers: Vec<IceServer>,
}

impl AnswerConfig {
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            ice_servers: self.ice_servers.clone(),
            candidate_pool_size: ANSWERER_CANDIDATE_POOL,
        }
    }
}

/// Answering side: where offers and candidates arrive on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub procedure_handle_offer: String,
    pub topic_handle_remote_candidates: String,
    pub topic_publish_local_candidate: String,
    pub ice_servers: Vec<IceServer>,
    pub trickle_window: Duration,
    pub ready_timeout: Duration,
    pub session_ttl: Duration,
    pub max_segment_size: usize,
    pub partial_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            procedure_handle_offer: DEFAULT_PROCEDURE_OFFER.to_string(),
            topic_handle_remote_candidates: DEFAULT_TOPIC_ANSWERER_ON_CANDIDATE.to_string(),
            topic_publish_local_candidate: DEFAULT_TOPIC_OFFERER_ON_CANDIDATE.to_string(),
            ice_servers: Vec::new(),
            trickle_window: DEFAULT_TRICKLE_WINDOW,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            session_ttl: DEFAULT_SESSION_TTL,
            max_segment_size: DEFAULT_MAX_SEGMENT_BYTES,
            partial_timeout: DEFAULT_PARTIAL_TIMEOUT,
        }
    }
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ice_servers: default_ice_servers(),
            trickle_window: parse_millis_env(ENV_TRICKLE_WINDOW_MS, defaults.trickle_window, 0),
            ready_timeout: parse_millis_env(ENV_READY_TIMEOUT_MS, defaults.ready_timeout, 1),
            session_ttl: parse_millis_env(ENV_SESSION_TTL_MS, defaults.session_ttl, 1),
            max_segment_size: parse_usize_env(
                ENV_MAX_SEGMENT_BYTES,
                defaults.max_segment_size,
                MIN_SEGMENT_BYTES,
            ),
            ..defaults
        }
    }

    pub fn validate(&self) -> RtcResult<()> {
        require_name("procedure_handle_offer", &self.procedure_handle_offer)?;
        require_name(
            "topic_handle_remote_candidates",
            &self.topic_handle_remote_candidates,
        )?;
        require_name(
            "topic_publish_local_candidate",
            &self.topic_publish_local_candidate,
        )?;
        require_nonzero("ready_timeout", self.ready_timeout)?;
        require_nonzero("session_ttl", self.session_ttl)?;
        require_segment(self.max_segment_size)
    }

    pub fn answer_config(&self) -> AnswerConfig {
        AnswerConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }
}

/// Offering side: where to send the offer and which candidate topics to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub procedure_offer: String,
    pub topic_answerer_on_candidate: String,
    pub topic_offerer_on_candidate: String,
    pub ice_servers: Vec<IceServer>,
    pub channel: ChannelParams,
    pub ready_timeout: Duration,
    pub max_segment_size: usize,
    pub partial_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            procedure_offer: DEFAULT_PROCEDURE_OFFER.to_string(),
            topic_answerer_on_candidate: DEFAULT_TOPIC_ANSWERER_ON_CANDIDATE.to_string(),
            topic_offerer_on_candidate: DEFAULT_TOPIC_OFFERER_ON_CANDIDATE.to_string(),
            ice_servers: Vec::new(),
            channel: ChannelParams::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            max_segment_size: DEFAULT_MAX_SEGMENT_BYTES,
            partial_timeout: DEFAULT_PARTIAL_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ice_servers: default_ice_servers(),
            ready_timeout: parse_millis_env(ENV_READY_TIMEOUT_MS, defaults.ready_timeout, 1),
            max_segment_size: parse_usize_env(
                ENV_MAX_SEGMENT_BYTES,
                defaults.max_segment_size,
                MIN_SEGMENT_BYTES,
            ),
            ..defaults
        }
    }

    pub fn validate(&self) -> RtcResult<()> {
        require_name("procedure_offer", &self.procedure_offer)?;
        require_name(
            "topic_answerer_on_candidate",
            &self.topic_answerer_on_candidate,
        )?;
        require_name(
            "topic_offerer_on_candidate",
            &self.topic_offerer_on_candidate,
        )?;
        require_name("channel label", &self.channel.label)?;
        require_nonzero("ready_timeout", self.ready_timeout)?;
        require_segment(self.max_segment_size)
    }

    pub fn offer_config(&self) -> OfferConfig {
        OfferConfig {
            ice_servers: self.ice_servers.clone(),
            channel: self.channel.clone(),
            topic_answerer_on_candidate: self.topic_answerer_on_candidate.clone(),
        }
    }
}

fn require_name(field: &str, value: &str) -> RtcResult<()> {
    if value.trim().is_empty() {
        return Err(RtcError::Config(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_nonzero(field: &str, value: Duration) -> RtcResult<()> {
    if value.is_zero() {
        return Err(RtcError::Config(format!("{field} must be greater than zero")));
    }
    Ok(())
}

fn require_segment(value: usize) -> RtcResult<()> {
    if value < MIN_SEGMENT_BYTES {
        return Err(RtcError::Config(format!(
            "max_segment_size must be at least {MIN_SEGMENT_BYTES} bytes, got {value}"
        )));
    }
    Ok(())
}

fn env_flag(var: &str) -> bool {
    match std::env::var(var) {
        Ok(value) => !matches!(value.trim(), "" | "0" | "false" | "no"),
        Err(_) => false,
    }
}

fn parse_millis_env(var: &str, default: Duration, min_ms: u64) -> Duration {
    let fallback = default.as_millis().try_into().unwrap_or(u64::MAX);
    Duration::from_millis(parse_env(var, fallback, min_ms))
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    parse_env(var, default, min)
}

fn parse_env<T>(var: &str, default: T, min: T) -> T
where
    T: std::str::FromStr + PartialOrd + Copy + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<T>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "webrtc::config",
                    var,
                    %parsed,
                    %min,
                    %default,
                    "config value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "webrtc::config",
                    var,
                    error = %err,
                    %default,
                    "failed to parse config from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
