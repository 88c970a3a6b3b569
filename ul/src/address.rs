//! Addressing of application entities in DICOM networks.
//!
//! A peer is reached through a socket address,
//! but tools and configuration files usually carry
//! the application entity title of the target node alongside it.
//! [`AeAddr`] bundles the two under the textual syntax
//! `{ae_title}@{ip}:{port}`,
//! where both the AE title and the port may be omitted:
//! a bare `{ip}` falls back to the registered DICOM port.
//!
//! AE titles are checked against the wire rules on ingest
//! (1 to 16 characters of the basic G0 set, not all blank),
//! so that an address which parses
//! is also an address which can be negotiated.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use snafu::{ensure, Backtrace, OptionExt, Snafu};

/// The TCP port registered for the DICOM upper layer,
/// assumed when an address does not name one.
pub const DICOM_DEFAULT_PORT: u16 = 104;

/// Whether the given text can stand as an application entity title
/// on the wire: 1 to 16 characters of the ISO 646 basic G0 set
/// excluding backslash, with at least one non-blank character.
pub fn is_valid_ae_title(candidate: &str) -> bool {
    (1..=16).contains(&candidate.len())
        && candidate
            .bytes()
            .all(|b| (0x20..=0x7E).contains(&b) && b != b'\\')
        && candidate.bytes().any(|b| b != b' ')
}

/// An error interpreting an application entity address.
#[derive(Debug, Snafu)]
pub enum ParseAeAddrError {
    #[snafu(display("`{}` cannot stand as an AE title on the wire", title))]
    InvalidAeTitle { title: String, backtrace: Backtrace },

    #[snafu(display("`{}` is not a usable host address", host))]
    InvalidHost { host: String, backtrace: Backtrace },

    /// address contains more than one `@` separator
    ExtraSeparator { backtrace: Backtrace },
}

/// The address of a target application entity:
/// a socket address plus, optionally, the AE title
/// the node answers to.
///
/// # Example
///
/// ```
/// # use netdicom_ul::address::{AeAddr, DICOM_DEFAULT_PORT};
/// # use std::net::SocketAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let target: AeAddr = "ARCHIVE@10.0.0.4:11112".parse()?;
/// assert_eq!(target.ae_title(), Some("ARCHIVE"));
/// assert_eq!(target.port(), 11112);
///
/// // the AE title and the port are both optional
/// let target: AeAddr = "10.0.0.4".parse()?;
/// assert_eq!(target.ae_title(), None);
/// assert_eq!(target.port(), DICOM_DEFAULT_PORT);
///
/// // titles which could never be negotiated are refused
/// assert!("NAME-IS-WAY-TOO-LONG@10.0.0.4".parse::<AeAddr>().is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AeAddr {
    ae_title: Option<String>,
    socket_addr: SocketAddr,
}

impl AeAddr {
    /// Address a node by its socket address alone.
    pub fn new(socket_addr: SocketAddr) -> Self {
        AeAddr {
            ae_title: None,
            socket_addr,
        }
    }

    /// Address a node by socket address and AE title,
    /// checking the title against the wire rules.
    pub fn titled(
        ae_title: impl Into<String>,
        socket_addr: SocketAddr,
    ) -> Result<Self, ParseAeAddrError> {
        let ae_title = ae_title.into();
        ensure!(
            is_valid_ae_title(&ae_title),
            InvalidAeTitleSnafu { title: ae_title }
        );
        Ok(AeAddr {
            ae_title: Some(ae_title),
            socket_addr,
        })
    }

    /// The AE title portion, when one was given.
    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    /// The socket address portion.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// The TCP port of the target.
    pub fn port(&self) -> u16 {
        self.socket_addr.port()
    }

    /// The AE title, or the given fallback when none was given.
    pub fn ae_title_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.ae_title.as_deref().unwrap_or(fallback)
    }
}

impl From<SocketAddr> for AeAddr {
    fn from(socket_addr: SocketAddr) -> Self {
        AeAddr::new(socket_addr)
    }
}

impl FromStr for AeAddr {
    type Err = ParseAeAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pieces = s.splitn(3, '@');
        let first = pieces.next().unwrap_or_default();
        let second = pieces.next();
        ensure!(pieces.next().is_none(), ExtraSeparatorSnafu);

        let (ae_title, host) = match second {
            Some(host) => (Some(first), host),
            None => (None, first),
        };

        if let Some(title) = ae_title {
            ensure!(
                is_valid_ae_title(title),
                InvalidAeTitleSnafu { title }
            );
        }

        // a full socket address, or a bare IP on the registered port
        let socket_addr = host
            .parse::<SocketAddr>()
            .ok()
            .or_else(|| {
                host.parse::<IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, DICOM_DEFAULT_PORT))
            })
            .context(InvalidHostSnafu { host })?;

        Ok(AeAddr {
            ae_title: ae_title.map(str::to_owned),
            socket_addr,
        })
    }
}

impl ToSocketAddrs for AeAddr {
    type Iter = std::option::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        Ok(Some(self.socket_addr).into_iter())
    }
}

impl std::fmt::Display for AeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.ae_title {
            Some(title) => write!(f, "{}@{}", title, self.socket_addr),
            None => self.socket_addr.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn titled_addresses_parse() {
        let addr: AeAddr = "ARCHIVE@10.0.0.4:11112".parse().unwrap();
        assert_eq!(addr.ae_title(), Some("ARCHIVE"));
        assert_eq!(addr.socket_addr(), SocketAddr::from(([10, 0, 0, 4], 11112)));
        assert_eq!(addr.to_string(), "ARCHIVE@10.0.0.4:11112");
    }

    #[test]
    fn port_defaults_to_the_registered_one() {
        let addr: AeAddr = "ARCHIVE@10.0.0.4".parse().unwrap();
        assert_eq!(addr.port(), DICOM_DEFAULT_PORT);

        let addr: AeAddr = "::1".parse().unwrap();
        assert_eq!(addr.port(), DICOM_DEFAULT_PORT);
        assert_eq!(addr.ae_title(), None);
    }

    #[test]
    fn wire_rules_apply_to_the_title() {
        assert_matches!(
            "THIS-TITLE-IS-TOO-LONG@10.0.0.4:104".parse::<AeAddr>(),
            Err(ParseAeAddrError::InvalidAeTitle { .. })
        );
        assert_matches!(
            "BAD\\TITLE@10.0.0.4:104".parse::<AeAddr>(),
            Err(ParseAeAddrError::InvalidAeTitle { .. })
        );
        assert_matches!(
            "@10.0.0.4:104".parse::<AeAddr>(),
            Err(ParseAeAddrError::InvalidAeTitle { .. })
        );
        assert_matches!(
            AeAddr::titled("                ", "10.0.0.4:104".parse().unwrap()),
            Err(ParseAeAddrError::InvalidAeTitle { .. })
        );
    }

    #[test]
    fn hosts_must_be_addresses() {
        assert_matches!(
            "ARCHIVE@nowhere:104".parse::<AeAddr>(),
            Err(ParseAeAddrError::InvalidHost { .. })
        );
        assert_matches!(
            "A@B@10.0.0.4:104".parse::<AeAddr>(),
            Err(ParseAeAddrError::ExtraSeparator { .. })
        );
    }

    #[test]
    fn fallback_title_applies_only_when_absent() {
        let addr: AeAddr = "10.0.0.4:104".parse().unwrap();
        assert_eq!(addr.ae_title_or("ANY-SCP"), "ANY-SCP");
        let addr: AeAddr = "ARCHIVE@10.0.0.4:104".parse().unwrap();
        assert_eq!(addr.ae_title_or("ANY-SCP"), "ARCHIVE");
    }
}
