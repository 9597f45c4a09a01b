//! Compiled routing rules
//!
//! Rules are compiled once from configuration. Patterns are parsed up front
//! so evaluation never allocates and never fails.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use regex::Regex;

use crate::common::IpProtocol;
use crate::config::RuleConfig;
use crate::error::{Error, Result};

use super::{Action, Destination};

/// Rule type - determines how the rule is evaluated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuleType {
    /// Match based on specified fields (domain, ip, port, network)
    #[default]
    Field,
    /// Match private/LAN IPs (10.x, 172.16.x, 192.168.x, etc.)
    PrivateIp,
    /// Match all traffic (catch-all rule)
    All,
}

impl RuleType {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "field" | "" => Ok(RuleType::Field),
            "privateip" | "private_ip" | "private-ip" | "private" => Ok(RuleType::PrivateIp),
            "all" | "any" | "*" => Ok(RuleType::All),
            other => Err(Error::RouteValidation(format!("unknown rule type: {}", other))),
        }
    }
}

/// A single domain pattern
#[derive(Debug, Clone)]
pub enum DomainMatcher {
    /// `domain:` - the domain itself or any subdomain
    Suffix(String),
    /// `full:` - exact match
    Full(String),
    /// `keyword:` - substring
    Keyword(String),
    /// `regexp:` - regular expression
    Regex(Regex),
    /// Plain pattern (substring)
    Plain(String),
}

impl DomainMatcher {
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(Error::RouteValidation("empty domain pattern".into()));
        }
        let matcher = if let Some(target) = pattern.strip_prefix("domain:") {
            DomainMatcher::Suffix(target.to_lowercase())
        } else if let Some(target) = pattern.strip_prefix("full:") {
            DomainMatcher::Full(target.to_lowercase())
        } else if let Some(keyword) = pattern.strip_prefix("keyword:") {
            DomainMatcher::Keyword(keyword.to_lowercase())
        } else if let Some(re) = pattern.strip_prefix("regexp:") {
            DomainMatcher::Regex(
                Regex::new(re)
                    .map_err(|e| Error::RouteValidation(format!("bad regexp {}: {}", re, e)))?,
            )
        } else {
            DomainMatcher::Plain(pattern.to_lowercase())
        };
        Ok(matcher)
    }

    /// `domain` must already be lowercase
    pub fn matches(&self, domain: &str) -> bool {
        match self {
            DomainMatcher::Suffix(target) => {
                domain == target
                    || (domain.len() > target.len()
                        && domain.ends_with(target.as_str())
                        && domain.as_bytes()[domain.len() - target.len() - 1] == b'.')
            }
            DomainMatcher::Full(target) => domain == target,
            DomainMatcher::Keyword(k) | DomainMatcher::Plain(k) => domain.contains(k.as_str()),
            DomainMatcher::Regex(re) => re.is_match(domain),
        }
    }
}

/// Parse a port pattern (e.g., "80", "80,443", "1000-2000")
pub fn parse_ports(pattern: &str) -> Result<Vec<(u16, u16)>> {
    let mut ranges = Vec::new();
    for part in pattern.split(',') {
        let part = part.trim();
        let bad = || Error::RouteValidation(format!("bad port pattern: {}", pattern));
        let range = match part.split_once('-') {
            Some((start, end)) => {
                let start = start.trim().parse::<u16>().map_err(|_| bad())?;
                let end = end.trim().parse::<u16>().map_err(|_| bad())?;
                if start > end {
                    return Err(bad());
                }
                (start, end)
            }
            None => {
                let p = part.parse::<u16>().map_err(|_| bad())?;
                (p, p)
            }
        };
        ranges.push(range);
    }
    Ok(ranges)
}

fn parse_networks(pattern: &str) -> Result<Vec<IpProtocol>> {
    pattern
        .split(',')
        .map(|n| match n.trim().to_lowercase().as_str() {
            "tcp" => Ok(IpProtocol::Tcp),
            "udp" => Ok(IpProtocol::Udp),
            other => Err(Error::RouteValidation(format!("unknown network: {}", other))),
        })
        .collect()
}

fn parse_ip(pattern: &str) -> Result<IpNet> {
    let pattern = pattern.trim();
    if pattern.contains('/') {
        pattern
            .parse::<IpNet>()
            .map_err(|_| Error::RouteValidation(format!("bad CIDR: {}", pattern)))
    } else {
        pattern
            .parse::<IpAddr>()
            .map(IpNet::from)
            .map_err(|_| Error::RouteValidation(format!("bad IP: {}", pattern)))
    }
}

/// Check if IP is private/LAN address
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()           // 10.x, 172.16-31.x, 192.168.x
                || ipv4.is_loopback()   // 127.x
                || ipv4.is_link_local() // 169.254.x
                || ipv4.is_broadcast()  // 255.255.255.255
                || ipv4.octets()[0] == 0 // 0.x (current network)
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                // fe80::/10
                || (ipv6.segments()[0] & 0xffc0) == 0xfe80
                // fc00::/7
                || (ipv6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// A compiled routing rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub rule_type: RuleType,
    /// Name used in logs and metrics
    pub tag: Arc<str>,
    pub ip: Vec<IpNet>,
    pub domain: Vec<DomainMatcher>,
    pub ports: Vec<(u16, u16)>,
    pub network: Vec<IpProtocol>,
    pub action: Action,
}

impl Rule {
    /// Compile a rule. `endpoint_for` resolves the endpoint of a proxy action
    /// and fails when it is unknown.
    pub fn compile<F>(index: usize, config: &RuleConfig, endpoint_for: F) -> Result<Self>
    where
        F: Fn(Option<&str>) -> Result<Arc<str>>,
    {
        let rule_type = RuleType::parse(&config.rule_type)?;
        let ip = config
            .ip
            .iter()
            .map(|p| parse_ip(p))
            .collect::<Result<Vec<_>>>()?;
        let domain = config
            .domain
            .iter()
            .map(|p| DomainMatcher::parse(p))
            .collect::<Result<Vec<_>>>()?;
        let ports = match &config.port {
            Some(p) => parse_ports(p)?,
            None => vec![],
        };
        let network = match &config.network {
            Some(n) => parse_networks(n)?,
            None => vec![],
        };

        if rule_type == RuleType::Field
            && ip.is_empty()
            && domain.is_empty()
            && ports.is_empty()
            && network.is_empty()
        {
            return Err(Error::RouteValidation(format!(
                "rule {} has no matcher; use type \"all\" for a catch-all",
                index
            )));
        }

        let action = Action::parse(&config.action, config.endpoint.as_deref(), endpoint_for)?;
        let tag: Arc<str> = match &config.tag {
            Some(tag) => Arc::from(tag.as_str()),
            None => Arc::from(format!("rule-{}", index)),
        };

        Ok(Self {
            rule_type,
            tag,
            ip,
            domain,
            ports,
            network,
            action,
        })
    }

    /// Check if the rule matches the destination.
    ///
    /// Matcher kinds are ANDed. Within a field rule, the IP list and the
    /// domain list are alternatives: either may match.
    pub fn matches(&self, dest: &Destination) -> bool {
        if !self.network.is_empty() && !self.network.contains(&dest.protocol) {
            return false;
        }

        if !self.ports.is_empty() {
            let port = dest.addr.port();
            if !self.ports.iter().any(|&(lo, hi)| port >= lo && port <= hi) {
                return false;
            }
        }

        match self.rule_type {
            RuleType::All => return true,
            RuleType::PrivateIp => return is_private_ip(dest.addr.ip()),
            RuleType::Field => {}
        }

        if self.ip.is_empty() && self.domain.is_empty() {
            return true;
        }

        let ip = dest.addr.ip();
        if self.ip.iter().any(|net| net.contains(&ip)) {
            return true;
        }

        match &dest.domain {
            Some(domain) if !self.domain.is_empty() => {
                let domain = domain.to_lowercase();
                self.domain.iter().any(|m| m.matches(&domain))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: Option<&str>) -> Result<Arc<str>> {
        match name {
            Some("hk") | None => Ok(Arc::from("hk")),
            Some(other) => Err(Error::RouteValidation(format!("unknown endpoint {}", other))),
        }
    }

    fn rule(json: &str) -> Result<Rule> {
        let config: RuleConfig = serde_json::from_str(json).unwrap();
        Rule::compile(0, &config, endpoint)
    }

    fn dest(addr: &str, domain: Option<&str>) -> Destination {
        Destination {
            protocol: IpProtocol::Tcp,
            addr: addr.parse().unwrap(),
            domain: domain.map(str::to_string),
        }
    }

    #[test]
    fn test_domain_matchers() {
        let suffix = DomainMatcher::parse("domain:google.com").unwrap();
        assert!(suffix.matches("google.com"));
        assert!(suffix.matches("www.google.com"));
        assert!(!suffix.matches("notgoogle.com"));

        let full = DomainMatcher::parse("full:google.com").unwrap();
        assert!(full.matches("google.com"));
        assert!(!full.matches("www.google.com"));

        let keyword = DomainMatcher::parse("keyword:ads").unwrap();
        assert!(keyword.matches("cdn.ads.example"));

        let re = DomainMatcher::parse(r"regexp:^api\d+\.").unwrap();
        assert!(re.matches("api2.example.com"));
        assert!(!re.matches("www.api2.example.com"));

        assert!(DomainMatcher::parse("regexp:(").is_err());
    }

    #[test]
    fn test_port_patterns() {
        assert_eq!(parse_ports("80").unwrap(), vec![(80, 80)]);
        assert_eq!(
            parse_ports("80, 443,1000-2000").unwrap(),
            vec![(80, 80), (443, 443), (1000, 2000)]
        );
        assert!(parse_ports("2000-1000").is_err());
        assert!(parse_ports("http").is_err());
        assert!(parse_ports("70000").is_err());
    }

    #[test]
    fn test_field_rule_ip_or_domain() {
        let r = rule(r#"{"ip": ["1.1.1.0/24"], "domain": ["domain:example.com"], "action": "proxy"}"#)
            .unwrap();
        assert!(r.matches(&dest("1.1.1.1:443", None)));
        assert!(r.matches(&dest("9.9.9.9:443", Some("www.Example.com"))));
        assert!(!r.matches(&dest("9.9.9.9:443", None)));
        assert_eq!(r.action, Action::Proxy(Arc::from("hk")));
    }

    #[test]
    fn test_port_and_network_are_anded() {
        let r = rule(r#"{"ip": ["8.8.8.8"], "port": "53", "network": "udp", "action": "direct"}"#)
            .unwrap();
        let mut d = dest("8.8.8.8:53", None);
        assert!(!r.matches(&d));
        d.protocol = IpProtocol::Udp;
        assert!(r.matches(&d));
        d.addr = "8.8.8.8:443".parse().unwrap();
        assert!(!r.matches(&d));
    }

    #[test]
    fn test_private_rule() {
        let r = rule(r#"{"type": "private", "action": "direct"}"#).unwrap();
        assert!(r.matches(&dest("192.168.1.1:80", None)));
        assert!(r.matches(&dest("[fd00::1]:80", None)));
        assert!(!r.matches(&dest("93.184.216.34:80", None)));
    }

    #[test]
    fn test_invalid_rules() {
        assert!(rule(r#"{"ip": ["10.0.0.0/33"], "action": "direct"}"#).is_err());
        assert!(rule(r#"{"action": "direct"}"#).is_err());
        assert!(rule(r#"{"type": "all", "action": "teleport"}"#).is_err());
        assert!(rule(r#"{"type": "all", "action": "proxy", "endpoint": "nowhere"}"#).is_err());
        assert!(rule(r#"{"type": "all", "action": "block"}"#).is_ok());
    }
}
