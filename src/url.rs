//! URL validation for the transport's three schemes (spec §4.5, §6):
//! `tls+tcp`, `tls+tcp4`, `tls+tcp6`, shaped `scheme://host:port[/]`.
//! Grammar itself is delegated to the `url` crate (spec §1 Non-goal); this
//! module only layers the transport's own shape checks on top.

use crate::addr::AddressFamily;
use crate::error::{Error, Result};

/// A validated endpoint URL: scheme-implied address family plus host/port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrl {
    pub family: AddressFamily,
    pub host: String,
    pub port: u16,
    raw: String,
}

impl EndpointUrl {
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Parses and validates `raw` for use as a dialer endpoint: host and port
/// are both required (spec §4.5 "Dialer requires a non-empty hostname and
/// non-zero port").
pub fn parse_dialer(raw: &str) -> Result<EndpointUrl> {
    let parsed = parse_common(raw)?;
    if parsed.host.is_empty() {
        return Err(Error::AddressInvalid(format!("{raw}: missing host")));
    }
    if parsed.port == 0 {
        return Err(Error::AddressInvalid(format!("{raw}: missing or zero port")));
    }
    Ok(parsed)
}

/// Parses and validates `raw` for use as a listener endpoint. An absent
/// host is permitted (binds to the wildcard address for the scheme's
/// family); port `0` is also permitted and binds an OS-assigned ephemeral
/// port, unlike the dialer case.
pub fn parse_listener(raw: &str) -> Result<EndpointUrl> {
    parse_common(raw)
}

fn parse_common(raw: &str) -> Result<EndpointUrl> {
    let url = url::Url::parse(raw).map_err(|e| Error::AddressInvalid(format!("{raw}: {e}")))?;

    let family = match url.scheme() {
        "tls+tcp" => AddressFamily::Unspecified,
        "tls+tcp4" => AddressFamily::Inet,
        "tls+tcp6" => AddressFamily::Inet6,
        other => {
            return Err(Error::AddressInvalid(format!("{raw}: unknown scheme {other}")))
        }
    };

    match url.path() {
        "" | "/" => {}
        other => {
            return Err(Error::AddressInvalid(format!(
                "{raw}: unexpected path {other}"
            )))
        }
    }
    if url.fragment().is_some() {
        return Err(Error::AddressInvalid(format!("{raw}: fragment not allowed")));
    }
    if url.query().is_some() {
        return Err(Error::AddressInvalid(format!("{raw}: query not allowed")));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(Error::AddressInvalid(format!("{raw}: userinfo not allowed")));
    }

    let host = url.host_str().unwrap_or("").to_string();
    let port = url.port().unwrap_or(0);

    Ok(EndpointUrl {
        family,
        host,
        port,
        raw: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialer_requires_host_and_port() {
        let u = parse_dialer("tls+tcp://example.com:4433").unwrap();
        assert_eq!(u.host, "example.com");
        assert_eq!(u.port, 4433);
        assert_eq!(u.family, AddressFamily::Unspecified);
    }

    #[test]
    fn unknown_scheme_is_address_invalid() {
        assert!(matches!(
            parse_dialer("tcp://example.com:80"),
            Err(Error::AddressInvalid(_))
        ));
    }

    #[test]
    fn fragment_is_rejected() {
        assert!(matches!(
            parse_dialer("tls+tcp://example.com:80/#frag"),
            Err(Error::AddressInvalid(_))
        ));
    }

    #[test]
    fn dialer_without_port_is_rejected() {
        assert!(matches!(
            parse_dialer("tls+tcp://example.com"),
            Err(Error::AddressInvalid(_))
        ));
    }

    #[test]
    fn listener_family_from_scheme() {
        let u = parse_listener("tls+tcp6://[::1]:9000").unwrap();
        assert_eq!(u.family, AddressFamily::Inet6);
    }
}
