//! Capture configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::frame::DltFrame;
use itf_common::{Error, Result};

/// Default DLT daemon port
pub const DEFAULT_PORT: u16 = 3490;

/// Default external receiver
pub const DEFAULT_RECEIVER: &str = "dlt-receive";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            other => Err(Error::InvalidConfig(format!("unknown DLT transport '{}'", other))),
        }
    }
}

/// Who reads the transport
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Receiver {
    /// The capture opens the socket itself
    #[default]
    Socket,
    /// An external receiver writing storage-header DLT to stdout
    Process {
        #[serde(default = "default_receiver")]
        binary: PathBuf,
        /// Arguments; derived from the transport settings when absent
        #[serde(default)]
        args: Option<Vec<String>>,
    },
}

fn default_receiver() -> PathBuf {
    PathBuf::from(DEFAULT_RECEIVER)
}

/// Settings for one capture session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub transport: Transport,
    /// Local address to bind (UDP) or the interface to join groups on
    pub bind_address: IpAddr,
    pub port: u16,
    pub multicast_groups: Vec<Ipv4Addr>,
    /// TCP peer, or the host handed to an external receiver
    pub target_address: Option<IpAddr>,
    /// `APID[:CTID],...` with `*` as wildcard
    pub filter: Option<String>,
    pub receiver: Receiver,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Udp,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            multicast_groups: Vec::new(),
            target_address: None,
            filter: None,
            receiver: Receiver::Socket,
        }
    }
}

impl CaptureConfig {
    /// UDP capture bound to `bind_address:port`
    pub fn udp(bind_address: IpAddr, port: u16) -> Self {
        Self {
            bind_address,
            port,
            ..Default::default()
        }
    }

    /// TCP capture connecting to a DLT daemon
    pub fn tcp(target: SocketAddr) -> Self {
        Self {
            transport: Transport::Tcp,
            port: target.port(),
            target_address: Some(target.ip()),
            ..Default::default()
        }
    }

    pub fn with_multicast(mut self, group: Ipv4Addr) -> Self {
        self.multicast_groups.push(group);
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_receiver(mut self, receiver: Receiver) -> Self {
        self.receiver = receiver;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(group) = self.multicast_groups.iter().find(|g| !g.is_multicast()) {
            return Err(Error::InvalidConfig(format!(
                "{} is not a multicast address",
                group
            )));
        }
        if self.transport == Transport::Tcp {
            if self.target_address.is_none() {
                return Err(Error::InvalidConfig(
                    "TCP capture requires a target address".into(),
                ));
            }
            if !self.multicast_groups.is_empty() {
                return Err(Error::InvalidConfig(
                    "multicast groups only apply to UDP capture".into(),
                ));
            }
        }
        if self.port == 0 && (self.transport == Transport::Tcp || self.is_process()) {
            return Err(Error::InvalidConfig("DLT port must not be 0".into()));
        }
        if let Some(filter) = &self.filter {
            filter.parse::<CaptureFilter>()?;
        }
        Ok(())
    }

    pub fn is_process(&self) -> bool {
        matches!(self.receiver, Receiver::Process { .. })
    }

    /// Arguments for an external `dlt-receive` style receiver
    pub fn process_args(&self) -> Vec<String> {
        if let Receiver::Process { args: Some(args), .. } = &self.receiver {
            return args.clone();
        }

        let mut args = vec!["-o".to_string(), "/dev/stdout".to_string()];
        match self.transport {
            Transport::Tcp => {
                args.extend(["-p".to_string(), self.port.to_string()]);
                let host = self.target_address.unwrap_or(self.bind_address);
                args.push(host.to_string());
            }
            Transport::Udp => {
                args.push("-u".to_string());
                if !self.bind_address.is_unspecified() {
                    args.extend(["-i".to_string(), self.bind_address.to_string()]);
                }
                args.extend(["-p".to_string(), self.port.to_string()]);
                let host = match self.multicast_groups.first() {
                    Some(group) => IpAddr::V4(*group),
                    None => self.target_address.unwrap_or(self.bind_address),
                };
                args.push(host.to_string());
            }
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterRule {
    apid: Option<String>,
    ctid: Option<String>,
}

/// Application/context allow-list applied before frames are recorded
///
/// Parsed from `APID[:CTID],...`; `*` or an omitted context matches any.
/// Frames without an extended header never pass a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFilter {
    rules: Vec<FilterRule>,
}

impl CaptureFilter {
    pub fn allows(&self, frame: &DltFrame) -> bool {
        if frame.extended_header().is_none() {
            return false;
        }
        self.rules.iter().any(|rule| {
            rule.apid.as_deref().map_or(true, |a| a == frame.apid())
                && rule.ctid.as_deref().map_or(true, |c| c == frame.ctid())
        })
    }
}

impl FromStr for CaptureFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        fn part(p: &str) -> Result<Option<String>> {
            match p.trim() {
                "*" => Ok(None),
                "" => Err(Error::InvalidConfig("empty ID in DLT filter".into())),
                id if id.len() > 4 => Err(Error::InvalidConfig(format!(
                    "DLT ID '{}' is longer than 4 characters",
                    id
                ))),
                id => Ok(Some(id.to_string())),
            }
        }

        let rules = s
            .split(',')
            .filter(|r| !r.trim().is_empty())
            .map(|rule| {
                let (apid, ctid) = match rule.split_once(':') {
                    Some((apid, ctid)) => (part(apid)?, part(ctid)?),
                    None => (part(rule)?, None),
                };
                Ok(FilterRule { apid, ctid })
            })
            .collect::<Result<Vec<_>>>()?;

        if rules.is_empty() {
            return Err(Error::InvalidConfig(format!("empty DLT filter '{}'", s)));
        }
        Ok(Self { rules })
    }
}

/// DLT section of the run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DltConfig {
    /// Address of the ECU emitting DLT
    pub target_ip: IpAddr,
    /// Local address receiving DLT
    pub host_ip: IpAddr,
    #[serde(default)]
    pub multicast_ips: Vec<Ipv4Addr>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub receiver: Option<Receiver>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl DltConfig {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            transport: self.transport,
            bind_address: self.host_ip,
            port: self.port,
            multicast_groups: self.multicast_ips.clone(),
            target_address: Some(self.target_ip),
            filter: self.filter.clone(),
            receiver: self.receiver.clone().unwrap_or_default(),
        }
    }
}

impl From<&DltConfig> for CaptureConfig {
    fn from(config: &DltConfig) -> Self {
        config.capture_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FrameBuilder;
    use crate::codec::{encode, DltCodec};
    use crate::frame::LogLevel;
    use bytes::BytesMut;
    use test_case::test_case;
    use tokio_util::codec::Decoder;

    fn frame(apid: &str, ctid: &str) -> DltFrame {
        let builder = FrameBuilder::log(apid, ctid, LogLevel::Info).text("x");
        let mut buf = BytesMut::from(&encode(&builder).unwrap()[..]);
        DltCodec::new().decode(&mut buf).unwrap().unwrap()
    }

    #[test_case("APP1", "APP1", "ANY", true ; "apid only")]
    #[test_case("APP1", "APP2", "ANY", false ; "other apid")]
    #[test_case("APP1:CTX1", "APP1", "CTX1", true ; "apid and ctid")]
    #[test_case("APP1:CTX1", "APP1", "CTX2", false ; "other ctid")]
    #[test_case("*:CTX1", "ZZZ", "CTX1", true ; "wildcard apid")]
    #[test_case("APP1:*", "APP1", "ZZZ", true ; "wildcard ctid")]
    #[test_case("APP1, APP2:CTX2", "APP2", "CTX2", true ; "second rule")]
    fn test_filter(filter: &str, apid: &str, ctid: &str, allowed: bool) {
        let filter: CaptureFilter = filter.parse().unwrap();
        assert_eq!(filter.allows(&frame(apid, ctid)), allowed);
    }

    #[test_case("" ; "empty")]
    #[test_case("APP1:" ; "empty ctid")]
    #[test_case("TOOLONG" ; "long id")]
    fn test_invalid_filter(filter: &str) {
        assert!(filter.parse::<CaptureFilter>().is_err());
    }

    #[test]
    fn test_validate() {
        let tcp = CaptureConfig {
            transport: Transport::Tcp,
            ..Default::default()
        };
        assert!(tcp.validate().is_err());

        let bad_group = CaptureConfig::default().with_multicast(Ipv4Addr::new(10, 0, 0, 1));
        assert!(bad_group.validate().is_err());

        let good = CaptureConfig::default()
            .with_multicast(Ipv4Addr::new(239, 255, 42, 99))
            .with_filter("APP1:CTX1");
        assert!(good.validate().is_ok());
    }

    #[test]
    fn test_dlt_config_from_toml() {
        let config: DltConfig = toml::from_str(
            r#"
            target_ip = "192.168.1.10"
            host_ip = "192.168.1.1"
            multicast_ips = ["239.255.42.99"]
            "#,
        )
        .unwrap();
        let capture = config.capture_config();

        assert_eq!(capture.port, DEFAULT_PORT);
        assert_eq!(capture.transport, Transport::Udp);
        assert_eq!(capture.bind_address.to_string(), "192.168.1.1");
        assert_eq!(capture.multicast_groups.len(), 1);
        assert_eq!(capture.receiver, Receiver::Socket);
    }

    #[test]
    fn test_process_args() {
        let config = CaptureConfig::udp("192.168.1.1".parse().unwrap(), 3490)
            .with_multicast(Ipv4Addr::new(239, 255, 42, 99))
            .with_receiver(Receiver::Process {
                binary: default_receiver(),
                args: None,
            });
        assert_eq!(
            config.process_args(),
            vec!["-o", "/dev/stdout", "-u", "-i", "192.168.1.1", "-p", "3490", "239.255.42.99"]
        );

        let config = CaptureConfig::tcp("10.0.0.2:3490".parse().unwrap()).with_receiver(
            Receiver::Process {
                binary: default_receiver(),
                args: Some(vec!["custom".into()]),
            },
        );
        assert_eq!(config.process_args(), vec!["custom"]);
    }
}
