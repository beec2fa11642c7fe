//! URL-style peer addresses
//!
//! `rist://[@]host:port?key=value&...` builds a [`PeerConfig`]. A leading
//! `@` makes the peer listen on the address instead of connecting to it.
//! Every unknown key, unparsable value and inverted min/max pair counts as
//! one invalid parameter; any invalid parameter fails the whole parse.
//!
//! `udp://` and `rtp://` addresses describe plain outputs/inputs used next
//! to a RIST flow and parse into [`UdpConfig`].

use crate::config::{
    AddressFamily, CongestionMode, ConfigError, PeerConfig, TimingMode, RIST_MAX_STRING_LONG,
};
use thiserror::Error;

/// URL parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error("Unsupported scheme in {0:?}")]
    UnsupportedScheme(String),

    #[error("Missing or invalid host:port in {0:?}")]
    InvalidAddress(String),

    #[error("Address exceeds {} bytes", RIST_MAX_STRING_LONG)]
    TooLong,

    #[error("{count} invalid parameter(s): {}", .names.join(", "))]
    InvalidParameters { count: usize, names: Vec<String> },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl UrlError {
    /// Number of invalid parameters (1 for address-level failures)
    pub fn invalid_count(&self) -> usize {
        match self {
            UrlError::InvalidParameters { count, .. } => *count,
            _ => 1,
        }
    }
}

/// A plain UDP/RTP endpoint with its framing options
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UdpConfig {
    pub address: String,
    pub listen: bool,
    /// `rtp://` adds an RTP header on output
    pub rtp: bool,
    pub miface: String,
    /// Virtual destination port to select on the RIST side, 0 for all
    pub stream_id: u16,
    pub rtp_timestamp: bool,
    pub rtp_sequence: bool,
    pub rtp_ptype: u8,
}

struct Split<'a> {
    listen: bool,
    address: &'a str,
    query: Option<&'a str>,
}

fn split_url<'a>(url: &'a str, schemes: &[&str]) -> Result<(&'a str, Split<'a>), UrlError> {
    if url.len() >= RIST_MAX_STRING_LONG {
        return Err(UrlError::TooLong);
    }

    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| UrlError::UnsupportedScheme(url.to_string()))?;
    if !schemes.contains(&scheme) {
        return Err(UrlError::UnsupportedScheme(url.to_string()));
    }

    let (listen, rest) = match rest.strip_prefix('@') {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    let (address, query) = match rest.split_once('?') {
        Some((address, query)) => (address, Some(query)),
        None => (rest, None),
    };

    if address.is_empty() || address.parse::<std::net::SocketAddr>().is_err() {
        // Hostnames are accepted as long as a numeric port follows
        let valid = address
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid {
            return Err(UrlError::InvalidAddress(url.to_string()));
        }
    }

    Ok((
        scheme,
        Split {
            listen,
            address,
            query,
        },
    ))
}

fn query_pairs(query: Option<&str>) -> impl Iterator<Item = (String, String)> + '_ {
    query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
}

/// Parse a `rist://` address into a peer configuration
pub fn parse_address(url: &str) -> Result<PeerConfig, UrlError> {
    let (_, split) = split_url(url, &["rist"])?;

    let mut config = PeerConfig::new(split.address);
    config.initiate_conn = !split.listen;
    if split.address.starts_with('[') {
        config.address_family = AddressFamily::Inet6;
    }

    let mut invalid: Vec<String> = Vec::new();
    for (key, value) in query_pairs(split.query) {
        if apply_param(&mut config, &key, &value).is_none() {
            invalid.push(key);
        }
    }

    for (min_key, min, max_key, max) in [
        (
            "buffer-min",
            config.recovery_length_min,
            "buffer-max",
            config.recovery_length_max,
        ),
        (
            "rtt-min",
            config.recovery_rtt_min,
            "rtt-max",
            config.recovery_rtt_max,
        ),
        (
            "min-retries",
            config.min_retries,
            "max-retries",
            config.max_retries,
        ),
    ] {
        if min > max {
            invalid.push(format!("{min_key}/{max_key}"));
        }
    }

    if !invalid.is_empty() {
        return Err(UrlError::InvalidParameters {
            count: invalid.len(),
            names: invalid,
        });
    }

    config.validate()?;
    Ok(config)
}

/// Apply one query parameter; `None` when the key or value is invalid
fn apply_param(config: &mut PeerConfig, key: &str, value: &str) -> Option<()> {
    match key {
        "buffer" => {
            let ms = value.parse().ok()?;
            config.recovery_length_min = ms;
            config.recovery_length_max = ms;
        }
        "buffer-min" => config.recovery_length_min = value.parse().ok()?,
        "buffer-max" => config.recovery_length_max = value.parse().ok()?,
        "secret" => config.secret = value.to_string(),
        "aes-type" => {
            config.key_size = match value.parse::<u32>().ok()? {
                size @ (128 | 256) => size,
                _ => return None,
            }
        }
        "key-rotation" => config.key_rotation = value.parse().ok()?,
        "bandwidth" => config.recovery_maxbitrate = value.parse().ok()?,
        "return-bandwidth" => config.recovery_maxbitrate_return = value.parse().ok()?,
        "reorder-buffer" => config.recovery_reorder_buffer = value.parse().ok()?,
        "rtt" => {
            let ms = value.parse().ok()?;
            config.recovery_rtt_min = ms;
            config.recovery_rtt_max = ms;
        }
        "rtt-min" => config.recovery_rtt_min = value.parse().ok()?,
        "rtt-max" => config.recovery_rtt_max = value.parse().ok()?,
        "compression" => config.compression = parse_bool(value)?,
        "cname" => config.cname = value.to_string(),
        "virt-src-port" => config.virt_src_port = value.parse().ok()?,
        "virt-dst-port" => config.virt_dst_port = value.parse().ok()?,
        "weight" => config.weight = value.parse().ok()?,
        "miface" => config.miface = value.to_string(),
        "session-timeout" => config.session_timeout = value.parse().ok()?,
        "keepalive-interval" => config.keepalive_interval = value.parse().ok()?,
        "congestion-control" => {
            config.congestion_control = match value {
                "0" | "off" => CongestionMode::Off,
                "1" | "normal" => CongestionMode::Normal,
                "2" | "aggressive" => CongestionMode::Aggressive,
                _ => return None,
            }
        }
        "min-retries" => config.min_retries = value.parse().ok()?,
        "max-retries" => config.max_retries = value.parse().ok()?,
        "timing-mode" => {
            config.timing_mode = match value {
                "0" | "source" => TimingMode::Source,
                "1" | "arrival" => TimingMode::Arrival,
                "2" | "rtc" => TimingMode::Rtc,
                _ => return None,
            }
        }
        "username" => config.srp_username = value.to_string(),
        "password" => config.srp_password = value.to_string(),
        _ => return None,
    }
    Some(())
}

/// Parse a `udp://` or `rtp://` address
pub fn parse_udp_address(url: &str) -> Result<UdpConfig, UrlError> {
    let (scheme, split) = split_url(url, &["udp", "rtp"])?;

    let mut config = UdpConfig {
        address: split.address.to_string(),
        listen: split.listen,
        rtp: scheme == "rtp",
        ..Default::default()
    };

    let mut invalid: Vec<String> = Vec::new();
    for (key, value) in query_pairs(split.query) {
        let applied = match key.as_str() {
            "miface" => {
                config.miface = value;
                Some(())
            }
            "stream-id" => value.parse().ok().map(|v| config.stream_id = v),
            "rtp-timestamp" => parse_bool(&value).map(|v| config.rtp_timestamp = v),
            "rtp-sequence" => parse_bool(&value).map(|v| config.rtp_sequence = v),
            "rtp-ptype" => value.parse().ok().map(|v| config.rtp_ptype = v),
            _ => None,
        };
        if applied.is_none() {
            invalid.push(key);
        }
    }

    if !invalid.is_empty() {
        return Err(UrlError::InvalidParameters {
            count: invalid.len(),
            names: invalid,
        });
    }
    Ok(config)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn percent_decode(input: &str) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'%' => {
                let mut lookahead = bytes.clone();
                let hi = lookahead.next().and_then(hex_val);
                let lo = lookahead.next().and_then(hex_val);
                if let (Some(h), Some(l)) = (hi, lo) {
                    out.push((h << 4) | l);
                    bytes = lookahead;
                } else {
                    out.push(b'%');
                }
            }
            _ => out.push(b),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryMode;

    #[test]
    fn test_plain_address() {
        let config = parse_address("rist://127.0.0.1:5000").unwrap();
        assert_eq!(config.address, "127.0.0.1:5000");
        assert!(config.initiate_conn);
        assert_eq!(config.recovery_mode, RecoveryMode::Time);
        assert_eq!(config.recovery_length_max, 1000);
    }

    #[test]
    fn test_listen_and_params() {
        let config = parse_address(
            "rist://@0.0.0.0:6000?buffer=500&cname=cam%201&weight=3&rtt-min=10&rtt-max=80\
             &congestion-control=aggressive&timing-mode=arrival&virt-dst-port=2000",
        )
        .unwrap();

        assert!(!config.initiate_conn);
        assert_eq!(config.recovery_length_min, 500);
        assert_eq!(config.recovery_length_max, 500);
        assert_eq!(config.cname, "cam 1");
        assert_eq!(config.weight, 3);
        assert_eq!((config.recovery_rtt_min, config.recovery_rtt_max), (10, 80));
        assert_eq!(config.congestion_control, CongestionMode::Aggressive);
        assert_eq!(config.timing_mode, TimingMode::Arrival);
        assert_eq!(config.virt_dst_port, 2000);
    }

    #[test]
    fn test_ipv6_and_hostname() {
        let config = parse_address("rist://[::1]:5000").unwrap();
        assert_eq!(config.address_family, AddressFamily::Inet6);
        assert!(parse_address("rist://relay.example.net:5000").is_ok());
    }

    #[test]
    fn test_invalid_parameters_counted() {
        let err = parse_address("rist://127.0.0.1:5000?bogus=1&weight=abc&buffer=100").unwrap_err();
        assert_eq!(
            err,
            UrlError::InvalidParameters {
                count: 2,
                names: vec!["bogus".into(), "weight".into()],
            }
        );
        assert_eq!(err.invalid_count(), 2);
    }

    #[test]
    fn test_inverted_pair() {
        let err = parse_address("rist://127.0.0.1:5000?buffer-min=900&buffer-max=100").unwrap_err();
        assert_eq!(err.invalid_count(), 1);
    }

    #[test]
    fn test_aes_type() {
        let config = parse_address("rist://127.0.0.1:5000?secret=abc&aes-type=256").unwrap();
        assert_eq!(config.effective_key_size(), Some(256));
        assert!(parse_address("rist://127.0.0.1:5000?aes-type=192").is_err());
    }

    #[test]
    fn test_credentials() {
        let err = parse_address("rist://127.0.0.1:5000?username=bob").unwrap_err();
        assert_eq!(err, UrlError::Config(ConfigError::NullCredentials));
    }

    #[test]
    fn test_bad_scheme_and_address() {
        assert!(matches!(
            parse_address("srt://127.0.0.1:5000"),
            Err(UrlError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            parse_address("rist://nohost"),
            Err(UrlError::InvalidAddress(_))
        ));
        let long = format!("rist://127.0.0.1:5000?cname={}", "x".repeat(300));
        assert_eq!(parse_address(&long), Err(UrlError::TooLong));
    }

    #[test]
    fn test_udp_address() {
        let config =
            parse_udp_address("rtp://@239.0.0.1:1234?miface=eth0&stream-id=2000&rtp-ptype=33")
                .unwrap();
        assert!(config.rtp);
        assert!(config.listen);
        assert_eq!(config.miface, "eth0");
        assert_eq!(config.stream_id, 2000);
        assert_eq!(config.rtp_ptype, 33);

        assert_eq!(
            parse_udp_address("udp://127.0.0.1:1234?stream-id=x")
                .unwrap_err()
                .invalid_count(),
            1
        );
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz1"), "%zz1");
        assert_eq!(percent_decode("caf%C3%A9"), "café");
    }
}
